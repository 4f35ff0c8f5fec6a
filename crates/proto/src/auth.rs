//! User authentication (RFC 4252).
//!
//! Client side: the `auth_*` methods on [`Transport`] drive the request
//! and response exchange over an event queue the dispatch loop feeds.
//! Password authentication falls back to keyboard-interactive when the
//! server only offers that, answering a single password-style prompt;
//! anything fancier fails closed rather than guessing.
//!
//! Server side: [`ServerAuth`] parses USERAUTH_REQUEST traffic, verifies
//! public key signatures and maps the [`ServerPolicy`] verdict onto wire
//! replies. One keyboard-interactive round of one prompt is supported.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use skiff_platform::{SkiffError, SkiffResult};

use crate::hostkey::{self, HostKey};
use crate::message::Message;
use crate::msg::MessageType;
use crate::server::{AuthDecision, ServerPolicy};
use crate::transport::Transport;

const CONNECTION_SERVICE: &str = "ssh-connection";
const USERAUTH_SERVICE: &str = "ssh-userauth";

/// Events the dispatch loop forwards to an in-flight client auth
/// routine.
#[derive(Debug)]
pub(crate) enum AuthEvent {
    /// SERVICE_ACCEPT for ssh-userauth.
    ServiceAccepted,
    /// A banner to show the user.
    Banner(String),
    /// USERAUTH_FAILURE with the methods that may continue.
    Failure {
        /// Methods that can continue.
        methods: Vec<String>,
        /// Whether the attempt partially succeeded.
        partial: bool,
    },
    /// USERAUTH_SUCCESS.
    Success,
    /// A method-specific type-60 body: PK_OK for publickey,
    /// INFO_REQUEST for keyboard-interactive.
    MethodSpecific(Vec<u8>),
}

/// One keyboard-interactive prompt as received by a client.
#[derive(Debug, Clone)]
pub struct Prompt {
    /// The prompt text.
    pub text: String,
    /// Whether the response may be echoed.
    pub echo: bool,
}

struct InfoRequest {
    title: String,
    instructions: String,
    prompts: Vec<Prompt>,
}

fn parse_info_request(body: Vec<u8>) -> SkiffResult<InfoRequest> {
    let mut m = Message::from_bytes(body);
    let title = m.get_str()?;
    let instructions = m.get_str()?;
    let _lang = m.get_str()?;
    let count = m.get_u32()?;
    if count > 64 {
        return Err(SkiffError::Protocol(format!(
            "Unreasonable keyboard-interactive prompt count {}",
            count
        )));
    }
    let mut prompts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        prompts.push(Prompt {
            text: m.get_str()?,
            echo: m.get_boolean()?,
        });
    }
    Ok(InfoRequest {
        title,
        instructions,
        prompts,
    })
}

impl Transport {
    /// Requests the userauth service and returns the event queue for
    /// one authentication attempt.
    async fn begin_auth(&self) -> SkiffResult<mpsc::UnboundedReceiver<AuthEvent>> {
        let mut rx = self.send_auth_events();
        let mut m = Message::new();
        m.add_str(USERAUTH_SERVICE);
        self.send_user_message(MessageType::ServiceRequest as u8, &m)
            .await?;
        loop {
            match rx.recv().await {
                Some(AuthEvent::ServiceAccepted) => return Ok(rx),
                Some(AuthEvent::Banner(text)) => {
                    debug!(banner = %text, "authentication banner");
                    continue;
                }
                Some(other) => {
                    return Err(SkiffError::Protocol(format!(
                        "Unexpected {:?} before SERVICE_ACCEPT",
                        other
                    )))
                }
                None => return Err(self.closed_error()),
            }
        }
    }

    async fn send_userauth_request(
        &self,
        username: &str,
        method: &str,
        fill: impl FnOnce(&mut Message),
    ) -> SkiffResult<()> {
        let mut m = Message::new();
        m.add_str(username);
        m.add_str(CONNECTION_SERVICE);
        m.add_str(method);
        fill(&mut m);
        self.send_user_message(MessageType::UserauthRequest as u8, &m)
            .await
    }

    /// Attempts "none" authentication. Failing is the common case; the
    /// error carries the methods the server will accept.
    pub async fn auth_none(&self, username: &str) -> SkiffResult<()> {
        let mut rx = self.begin_auth().await?;
        self.send_userauth_request(username, "none", |_| {}).await?;
        match self.wait_verdict(&mut rx).await? {
            Verdict::Success => {
                self.mark_authenticated(username);
                Ok(())
            }
            Verdict::Failure { methods, partial } => Err(SkiffError::AuthenticationFailed {
                partial,
                allowed: methods,
            }),
            Verdict::MethodSpecific(_) => Err(SkiffError::Protocol(
                "Unexpected method-specific reply to none auth".to_string(),
            )),
        }
    }

    /// Authenticates with a password. Falls back to a single-prompt
    /// keyboard-interactive round if the server only offers that.
    pub async fn auth_password(&self, username: &str, password: &str) -> SkiffResult<()> {
        let mut rx = self.begin_auth().await?;
        self.send_userauth_request(username, "password", |m| {
            m.add_boolean(false);
            m.add_str(password);
        })
        .await?;
        match self.wait_verdict(&mut rx).await? {
            Verdict::Success => {
                self.mark_authenticated(username);
                Ok(())
            }
            Verdict::Failure { methods, partial } => {
                if !partial && methods.iter().any(|m| m == "keyboard-interactive") {
                    debug!("password refused, trying keyboard-interactive fallback");
                    self.interactive_password_fallback(username, password, &mut rx)
                        .await
                } else {
                    Err(SkiffError::AuthenticationFailed {
                        partial,
                        allowed: methods,
                    })
                }
            }
            Verdict::MethodSpecific(_) => Err(SkiffError::Protocol(
                "Unexpected method-specific reply to password auth".to_string(),
            )),
        }
    }

    /// One keyboard-interactive round answering a lone password prompt.
    /// More than one prompt, or a repeated prompt, fails closed.
    async fn interactive_password_fallback(
        &self,
        username: &str,
        password: &str,
        rx: &mut mpsc::UnboundedReceiver<AuthEvent>,
    ) -> SkiffResult<()> {
        self.send_userauth_request(username, "keyboard-interactive", |m| {
            m.add_str(""); // language
            m.add_str(""); // submethods
        })
        .await?;

        let mut answered = false;
        loop {
            match self.wait_verdict(rx).await? {
                Verdict::Success => {
                    self.mark_authenticated(username);
                    return Ok(());
                }
                Verdict::Failure { methods, partial } => {
                    return Err(SkiffError::AuthenticationFailed {
                        partial,
                        allowed: methods,
                    })
                }
                Verdict::MethodSpecific(body) => {
                    let request = parse_info_request(body)?;
                    // A zero-prompt round is a bare status message;
                    // acknowledge and keep waiting.
                    if request.prompts.is_empty() {
                        let mut reply = Message::new();
                        reply.add_u32(0);
                        self.send_user_message(
                            MessageType::UserauthInfoResponse as u8,
                            &reply,
                        )
                        .await?;
                        continue;
                    }
                    if request.prompts.len() > 1 || answered {
                        // Not a plain password dialog; refuse to guess.
                        return Err(SkiffError::AuthenticationFailed {
                            partial: false,
                            allowed: vec!["keyboard-interactive".to_string()],
                        });
                    }
                    answered = true;
                    let mut reply = Message::new();
                    reply.add_u32(1);
                    reply.add_str(password);
                    self.send_user_message(MessageType::UserauthInfoResponse as u8, &reply)
                        .await?;
                }
            }
        }
    }

    /// Authenticates with a private key, signing over the session id
    /// and the request body.
    pub async fn auth_publickey(
        &self,
        username: &str,
        key: Arc<dyn HostKey>,
    ) -> SkiffResult<()> {
        let session_id = self
            .session_id()
            .ok_or_else(|| SkiffError::Protocol("No session id yet".to_string()))?;
        let mut rx = self.begin_auth().await?;

        let blob = key.public_blob();
        let mut body = Message::new();
        body.add_str(username);
        body.add_str(CONNECTION_SERVICE);
        body.add_str("publickey");
        body.add_boolean(true);
        body.add_str(key.name());
        body.add_string(&blob);

        let mut signed = Message::new();
        signed.add_string(&session_id);
        signed.add_byte(MessageType::UserauthRequest as u8);
        signed.add_bytes(body.as_bytes());
        let signature = key.sign(signed.as_bytes())?;

        body.add_string(&signature);
        self.send_user_message(MessageType::UserauthRequest as u8, &body)
            .await?;

        match self.wait_verdict(&mut rx).await? {
            Verdict::Success => {
                self.mark_authenticated(username);
                Ok(())
            }
            Verdict::Failure { methods, partial } => Err(SkiffError::AuthenticationFailed {
                partial,
                allowed: methods,
            }),
            Verdict::MethodSpecific(_) => Err(SkiffError::Protocol(
                "Unexpected PK_OK for a signed publickey request".to_string(),
            )),
        }
    }

    /// Authenticates with keyboard-interactive, delegating prompt
    /// rounds to `handler` (title, instructions, prompts -> responses).
    pub async fn auth_interactive<F>(&self, username: &str, mut handler: F) -> SkiffResult<()>
    where
        F: FnMut(&str, &str, &[Prompt]) -> Vec<String> + Send,
    {
        let mut rx = self.begin_auth().await?;
        self.send_userauth_request(username, "keyboard-interactive", |m| {
            m.add_str("");
            m.add_str("");
        })
        .await?;

        loop {
            match self.wait_verdict(&mut rx).await? {
                Verdict::Success => {
                    self.mark_authenticated(username);
                    return Ok(());
                }
                Verdict::Failure { methods, partial } => {
                    return Err(SkiffError::AuthenticationFailed {
                        partial,
                        allowed: methods,
                    })
                }
                Verdict::MethodSpecific(body) => {
                    let request = parse_info_request(body)?;
                    let responses =
                        handler(&request.title, &request.instructions, &request.prompts);
                    if responses.len() != request.prompts.len() {
                        return Err(SkiffError::Protocol(format!(
                            "Handler returned {} responses for {} prompts",
                            responses.len(),
                            request.prompts.len()
                        )));
                    }
                    let mut reply = Message::new();
                    reply.add_u32(responses.len() as u32);
                    for response in &responses {
                        reply.add_str(response);
                    }
                    self.send_user_message(MessageType::UserauthInfoResponse as u8, &reply)
                        .await?;
                }
            }
        }
    }

    async fn wait_verdict(
        &self,
        rx: &mut mpsc::UnboundedReceiver<AuthEvent>,
    ) -> SkiffResult<Verdict> {
        loop {
            match rx.recv().await {
                Some(AuthEvent::Success) => return Ok(Verdict::Success),
                Some(AuthEvent::Failure { methods, partial }) => {
                    return Ok(Verdict::Failure { methods, partial })
                }
                Some(AuthEvent::MethodSpecific(body)) => {
                    return Ok(Verdict::MethodSpecific(body))
                }
                Some(AuthEvent::Banner(text)) => {
                    debug!(banner = %text, "authentication banner");
                    continue;
                }
                Some(AuthEvent::ServiceAccepted) => continue,
                None => return Err(self.closed_error()),
            }
        }
    }
}

enum Verdict {
    Success,
    Failure { methods: Vec<String>, partial: bool },
    MethodSpecific(Vec<u8>),
}

/// What the server-side handler wants sent, and whether authentication
/// just completed.
pub(crate) enum ServerAuthOutcome {
    /// Replies only.
    Replies(Vec<(u8, Message)>),
    /// The session is now authenticated.
    Authenticated {
        /// Who authenticated.
        username: String,
        /// Replies to send (USERAUTH_SUCCESS).
        replies: Vec<(u8, Message)>,
    },
}

/// Server-side authentication state machine.
pub(crate) struct ServerAuth {
    interactive_user: Option<String>,
}

impl ServerAuth {
    pub(crate) fn new() -> Self {
        Self {
            interactive_user: None,
        }
    }

    fn verdict(
        policy: &Arc<dyn ServerPolicy>,
        username: String,
        decision: AuthDecision,
    ) -> ServerAuthOutcome {
        match decision {
            AuthDecision::Accept => ServerAuthOutcome::Authenticated {
                username,
                replies: vec![(MessageType::UserauthSuccess as u8, Message::new())],
            },
            AuthDecision::Partial { methods } => {
                let mut m = Message::new();
                m.add_list(&methods);
                m.add_boolean(true);
                ServerAuthOutcome::Replies(vec![(MessageType::UserauthFailure as u8, m)])
            }
            AuthDecision::Reject => {
                let mut m = Message::new();
                m.add_list(&policy.allowed_auth_methods(&username));
                m.add_boolean(false);
                ServerAuthOutcome::Replies(vec![(MessageType::UserauthFailure as u8, m)])
            }
        }
    }

    /// Handles one USERAUTH_REQUEST.
    pub(crate) fn handle_request(
        &mut self,
        policy: &Arc<dyn ServerPolicy>,
        session_id: &[u8],
        mut m: Message,
    ) -> SkiffResult<ServerAuthOutcome> {
        let username = m.get_str()?;
        let service = m.get_str()?;
        if service != CONNECTION_SERVICE {
            return Err(SkiffError::Protocol(format!(
                "Authentication for unknown service '{}'",
                service
            )));
        }
        let method = m.get_str()?;
        debug!(user = %username, method = %method, "authentication attempt");

        match method.as_str() {
            "none" => {
                let d = policy.check_auth_none(&username);
                Ok(Self::verdict(policy, username, d))
            }
            "password" => {
                let change_request = m.get_boolean()?;
                let password = m.get_str()?;
                if change_request {
                    // Password changes are not supported; treat as a
                    // failed attempt.
                    return Ok(Self::verdict(policy, username, AuthDecision::Reject));
                }
                let d = policy.check_auth_password(&username, &password);
                Ok(Self::verdict(policy, username, d))
            }
            "publickey" => {
                let signed = m.get_boolean()?;
                let algorithm = m.get_str()?;
                let blob = m.get_string()?;
                if !signed {
                    // A query: would this key be acceptable at all?
                    return Ok(
                        match policy.check_auth_publickey(&username, &algorithm, &blob) {
                            AuthDecision::Reject => {
                                Self::verdict(policy, username, AuthDecision::Reject)
                            }
                            _ => {
                                let mut ok = Message::new();
                                ok.add_str(&algorithm);
                                ok.add_string(&blob);
                                ServerAuthOutcome::Replies(vec![(
                                    MessageType::UserauthPkOk as u8,
                                    ok,
                                )])
                            }
                        },
                    );
                }
                let signature = m.get_string()?;
                let mut signed_data = Message::new();
                signed_data.add_string(session_id);
                signed_data.add_byte(MessageType::UserauthRequest as u8);
                signed_data.add_str(&username);
                signed_data.add_str(CONNECTION_SERVICE);
                signed_data.add_str("publickey");
                signed_data.add_boolean(true);
                signed_data.add_str(&algorithm);
                signed_data.add_string(&blob);

                if hostkey::verify(&algorithm, &blob, &signature, signed_data.as_bytes()).is_err() {
                    debug!(user = %username, "publickey signature invalid");
                    return Ok(Self::verdict(policy, username, AuthDecision::Reject));
                }
                let d = policy.check_auth_publickey(&username, &algorithm, &blob);
                Ok(Self::verdict(policy, username, d))
            }
            "keyboard-interactive" => {
                let _lang = m.get_str()?;
                let submethods = m.get_str()?;
                match policy.interactive_prompt(&username, &submethods) {
                    None => Ok(Self::verdict(policy, username, AuthDecision::Reject)),
                    Some(prompt) => {
                        self.interactive_user = Some(username);
                        let mut request = Message::new();
                        request.add_str(&prompt.title);
                        request.add_str(&prompt.instructions);
                        request.add_str("");
                        request.add_u32(1);
                        request.add_str(&prompt.prompt);
                        request.add_boolean(prompt.echo);
                        Ok(ServerAuthOutcome::Replies(vec![(
                            MessageType::UserauthPkOk as u8,
                            request,
                        )]))
                    }
                }
            }
            other => {
                debug!(method = %other, "unsupported authentication method");
                Ok(Self::verdict(policy, username, AuthDecision::Reject))
            }
        }
    }

    /// Handles USERAUTH_INFO_RESPONSE for an open interactive round.
    pub(crate) fn handle_info_response(
        &mut self,
        policy: &Arc<dyn ServerPolicy>,
        mut m: Message,
    ) -> SkiffResult<ServerAuthOutcome> {
        let username = self.interactive_user.take().ok_or_else(|| {
            SkiffError::Protocol("INFO_RESPONSE without an interactive exchange".to_string())
        })?;
        let count = m.get_u32()?;
        if count > 64 {
            return Err(SkiffError::Protocol(format!(
                "Unreasonable response count {}",
                count
            )));
        }
        let mut responses = Vec::with_capacity(count as usize);
        for _ in 0..count {
            responses.push(m.get_str()?);
        }
        let d = policy.check_auth_interactive(&username, &responses);
        Ok(Self::verdict(policy, username, d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostkey::Ed25519HostKey;
    use crate::server::InteractivePrompt;

    struct TestPolicy;

    impl ServerPolicy for TestPolicy {
        fn allowed_auth_methods(&self, _username: &str) -> Vec<String> {
            vec!["password".to_string(), "publickey".to_string()]
        }

        fn check_auth_password(&self, username: &str, password: &str) -> AuthDecision {
            if username == "alice" && password == "sesame" {
                AuthDecision::Accept
            } else if username == "bob" && password == "first-factor" {
                AuthDecision::Partial {
                    methods: vec!["publickey".to_string()],
                }
            } else {
                AuthDecision::Reject
            }
        }

        fn check_auth_publickey(
            &self,
            username: &str,
            algorithm: &str,
            _blob: &[u8],
        ) -> AuthDecision {
            if username == "alice" && algorithm == "ssh-ed25519" {
                AuthDecision::Accept
            } else {
                AuthDecision::Reject
            }
        }

        fn interactive_prompt(
            &self,
            username: &str,
            _submethods: &str,
        ) -> Option<InteractivePrompt> {
            if username == "alice" {
                Some(InteractivePrompt {
                    title: "Login".to_string(),
                    instructions: String::new(),
                    prompt: "Password: ".to_string(),
                    echo: false,
                })
            } else {
                None
            }
        }

        fn check_auth_interactive(&self, username: &str, responses: &[String]) -> AuthDecision {
            if username == "alice" && responses == ["sesame".to_string()] {
                AuthDecision::Accept
            } else {
                AuthDecision::Reject
            }
        }
    }

    fn policy() -> Arc<dyn ServerPolicy> {
        Arc::new(TestPolicy)
    }

    fn password_request(user: &str, password: &str) -> Message {
        let mut m = Message::new();
        m.add_str(user);
        m.add_str(CONNECTION_SERVICE);
        m.add_str("password");
        m.add_boolean(false);
        m.add_str(password);
        Message::from_bytes(m.into_bytes())
    }

    #[test]
    fn test_password_accept() {
        let mut auth = ServerAuth::new();
        let outcome = auth
            .handle_request(&policy(), &[0u8; 32], password_request("alice", "sesame"))
            .unwrap();
        match outcome {
            ServerAuthOutcome::Authenticated { username, replies } => {
                assert_eq!(username, "alice");
                assert_eq!(replies[0].0, MessageType::UserauthSuccess as u8);
            }
            _ => panic!("expected success"),
        }
    }

    #[test]
    fn test_password_reject_lists_methods() {
        let mut auth = ServerAuth::new();
        let outcome = auth
            .handle_request(&policy(), &[0u8; 32], password_request("alice", "wrong"))
            .unwrap();
        match outcome {
            ServerAuthOutcome::Replies(mut replies) => {
                let (t, m) = replies.remove(0);
                assert_eq!(t, MessageType::UserauthFailure as u8);
                let mut r = Message::from_bytes(m.into_bytes());
                assert_eq!(r.get_list().unwrap(), vec!["password", "publickey"]);
                assert!(!r.get_boolean().unwrap());
            }
            _ => panic!("expected failure"),
        }
    }

    #[test]
    fn test_password_partial_success() {
        let mut auth = ServerAuth::new();
        let outcome = auth
            .handle_request(
                &policy(),
                &[0u8; 32],
                password_request("bob", "first-factor"),
            )
            .unwrap();
        match outcome {
            ServerAuthOutcome::Replies(mut replies) => {
                let (_, m) = replies.remove(0);
                let mut r = Message::from_bytes(m.into_bytes());
                assert_eq!(r.get_list().unwrap(), vec!["publickey"]);
                assert!(r.get_boolean().unwrap());
            }
            _ => panic!("expected partial failure"),
        }
    }

    #[test]
    fn test_publickey_query_gets_pk_ok() {
        let key = Ed25519HostKey::generate().unwrap();
        let mut m = Message::new();
        m.add_str("alice");
        m.add_str(CONNECTION_SERVICE);
        m.add_str("publickey");
        m.add_boolean(false);
        m.add_str("ssh-ed25519");
        m.add_string(&key.public_blob());

        let mut auth = ServerAuth::new();
        let outcome = auth
            .handle_request(&policy(), &[0u8; 32], Message::from_bytes(m.into_bytes()))
            .unwrap();
        match outcome {
            ServerAuthOutcome::Replies(replies) => {
                assert_eq!(replies[0].0, MessageType::UserauthPkOk as u8);
            }
            _ => panic!("expected PK_OK"),
        }
    }

    #[test]
    fn test_publickey_signed_round_trip() {
        let key = Ed25519HostKey::generate().unwrap();
        let session_id = vec![9u8; 32];
        let blob = key.public_blob();

        let mut body = Message::new();
        body.add_str("alice");
        body.add_str(CONNECTION_SERVICE);
        body.add_str("publickey");
        body.add_boolean(true);
        body.add_str("ssh-ed25519");
        body.add_string(&blob);

        let mut signed = Message::new();
        signed.add_string(&session_id);
        signed.add_byte(MessageType::UserauthRequest as u8);
        signed.add_bytes(body.as_bytes());
        let signature = key.sign(signed.as_bytes()).unwrap();
        body.add_string(&signature);

        let mut auth = ServerAuth::new();
        let outcome = auth
            .handle_request(&policy(), &session_id, Message::from_bytes(body.into_bytes()))
            .unwrap();
        assert!(matches!(
            outcome,
            ServerAuthOutcome::Authenticated { .. }
        ));
    }

    #[test]
    fn test_publickey_bad_signature_rejected() {
        let key = Ed25519HostKey::generate().unwrap();
        let mut body = Message::new();
        body.add_str("alice");
        body.add_str(CONNECTION_SERVICE);
        body.add_str("publickey");
        body.add_boolean(true);
        body.add_str("ssh-ed25519");
        body.add_string(&key.public_blob());
        // Signature over the wrong bytes.
        let signature = key.sign(b"not the request").unwrap();
        body.add_string(&signature);

        let mut auth = ServerAuth::new();
        let outcome = auth
            .handle_request(&policy(), &[9u8; 32], Message::from_bytes(body.into_bytes()))
            .unwrap();
        assert!(matches!(outcome, ServerAuthOutcome::Replies(_)));
    }

    #[test]
    fn test_interactive_round() {
        let mut m = Message::new();
        m.add_str("alice");
        m.add_str(CONNECTION_SERVICE);
        m.add_str("keyboard-interactive");
        m.add_str("");
        m.add_str("");

        let mut auth = ServerAuth::new();
        let outcome = auth
            .handle_request(&policy(), &[0u8; 32], Message::from_bytes(m.into_bytes()))
            .unwrap();
        match outcome {
            ServerAuthOutcome::Replies(replies) => {
                assert_eq!(replies[0].0, MessageType::UserauthPkOk as u8);
            }
            _ => panic!("expected INFO_REQUEST"),
        }

        let mut response = Message::new();
        response.add_u32(1);
        response.add_str("sesame");
        let outcome = auth
            .handle_info_response(&policy(), Message::from_bytes(response.into_bytes()))
            .unwrap();
        assert!(matches!(
            outcome,
            ServerAuthOutcome::Authenticated { .. }
        ));
    }

    #[test]
    fn test_info_response_without_request() {
        let mut auth = ServerAuth::new();
        let mut m = Message::new();
        m.add_u32(0);
        let r = auth.handle_info_response(&policy(), Message::from_bytes(m.into_bytes()));
        assert!(matches!(r, Err(SkiffError::Protocol(_))));
    }

    #[test]
    fn test_unknown_method_rejected() {
        let mut m = Message::new();
        m.add_str("alice");
        m.add_str(CONNECTION_SERVICE);
        m.add_str("hostbased");

        let mut auth = ServerAuth::new();
        let outcome = auth
            .handle_request(&policy(), &[0u8; 32], Message::from_bytes(m.into_bytes()))
            .unwrap();
        assert!(matches!(outcome, ServerAuthOutcome::Replies(_)));
    }

    #[test]
    fn test_wrong_service_is_fatal() {
        let mut m = Message::new();
        m.add_str("alice");
        m.add_str("ssh-not-a-service");
        m.add_str("none");

        let mut auth = ServerAuth::new();
        let r = auth.handle_request(&policy(), &[0u8; 32], Message::from_bytes(m.into_bytes()));
        assert!(matches!(r, Err(SkiffError::Protocol(_))));
    }

    #[test]
    fn test_parse_info_request() {
        let mut m = Message::new();
        m.add_str("Title");
        m.add_str("Read carefully");
        m.add_str("");
        m.add_u32(2);
        m.add_str("User: ");
        m.add_boolean(true);
        m.add_str("Password: ");
        m.add_boolean(false);

        let parsed = parse_info_request(m.into_bytes()).unwrap();
        assert_eq!(parsed.title, "Title");
        assert_eq!(parsed.instructions, "Read carefully");
        assert_eq!(parsed.prompts.len(), 2);
        assert!(parsed.prompts[0].echo);
        assert!(!parsed.prompts[1].echo);
    }
}
