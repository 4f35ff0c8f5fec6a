//! Server-side policy hooks.
//!
//! A [`ServerPolicy`] is the application's say over what a server-mode
//! transport permits: which authentication attempts succeed, which
//! channels may open, which global requests are honored. The dispatch
//! loop calls these synchronously while holding no locks; implementations
//! should answer from local state.
//!
//! Every default is a refusal, so a policy only opens what it names.

use crate::message::Message;
use crate::msg::open_failure;

/// Verdict on one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// The attempt succeeds and the session becomes authenticated.
    Accept,
    /// The attempt was valid but more methods are required.
    Partial {
        /// Methods that may continue.
        methods: Vec<String>,
    },
    /// The attempt fails.
    Reject,
}

/// Verdict on a channel open request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenDecision {
    /// Open the channel.
    Accept,
    /// Refuse with a reason code and text.
    Reject {
        /// An RFC 4254 reason code.
        code: u32,
        /// Human-readable refusal text.
        text: String,
    },
}

/// One keyboard-interactive prompt.
#[derive(Debug, Clone)]
pub struct InteractivePrompt {
    /// Dialog title.
    pub title: String,
    /// Instructions shown before the prompt.
    pub instructions: String,
    /// The prompt text.
    pub prompt: String,
    /// Whether the answer may be echoed.
    pub echo: bool,
}

/// Application policy for a server-mode transport.
pub trait ServerPolicy: Send + Sync {
    /// Methods advertised in USERAUTH_FAILURE for this user.
    fn allowed_auth_methods(&self, _username: &str) -> Vec<String> {
        vec!["password".to_string(), "publickey".to_string()]
    }

    /// Verdict on a "none" authentication attempt.
    fn check_auth_none(&self, _username: &str) -> AuthDecision {
        AuthDecision::Reject
    }

    /// Verdict on a password attempt.
    fn check_auth_password(&self, _username: &str, _password: &str) -> AuthDecision {
        AuthDecision::Reject
    }

    /// Verdict on a public key attempt. Called only after the signature
    /// (when present) has been verified; a signature-less query that
    /// returns anything but [`AuthDecision::Reject`] earns a PK_OK.
    fn check_auth_publickey(&self, _username: &str, _algorithm: &str, _blob: &[u8]) -> AuthDecision {
        AuthDecision::Reject
    }

    /// Opens a keyboard-interactive exchange, or `None` to refuse the
    /// method. One round of one prompt is supported.
    fn interactive_prompt(&self, _username: &str, _submethods: &str) -> Option<InteractivePrompt> {
        None
    }

    /// Verdict on the responses to [`ServerPolicy::interactive_prompt`].
    fn check_auth_interactive(&self, _username: &str, _responses: &[String]) -> AuthDecision {
        AuthDecision::Reject
    }

    /// Verdict on a channel open. `params` holds the type-specific
    /// fields after the standard window and packet sizes.
    fn check_channel_open(&self, kind: &str, _params: &mut Message) -> OpenDecision {
        if kind == "session" {
            OpenDecision::Accept
        } else {
            OpenDecision::Reject {
                code: open_failure::UNKNOWN_CHANNEL_TYPE,
                text: format!("Channel type '{}' not supported", kind),
            }
        }
    }

    /// Whether a channel request (exec, shell, pty-req, ...) succeeds.
    fn check_channel_request(&self, kind: &str, _data: &mut Message) -> bool {
        matches!(kind, "shell" | "exec" | "pty-req" | "env")
    }

    /// Handles a global request. `Some(extra)` replies REQUEST_SUCCESS
    /// with `extra` appended; `None` replies REQUEST_FAILURE.
    fn check_global_request(&self, _kind: &str, _data: &mut Message) -> Option<Message> {
        None
    }
}

/// The policy used when none is supplied: refuse everything.
pub struct DenyAllPolicy;

impl ServerPolicy for DenyAllPolicy {
    fn allowed_auth_methods(&self, _username: &str) -> Vec<String> {
        Vec::new()
    }

    fn check_channel_open(&self, _kind: &str, _params: &mut Message) -> OpenDecision {
        OpenDecision::Reject {
            code: open_failure::ADMINISTRATIVELY_PROHIBITED,
            text: "Channels are not permitted".to_string(),
        }
    }

    fn check_channel_request(&self, _kind: &str, _data: &mut Message) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Defaults;
    impl ServerPolicy for Defaults {}

    #[test]
    fn test_defaults_refuse_auth() {
        let p = Defaults;
        assert_eq!(p.check_auth_none("u"), AuthDecision::Reject);
        assert_eq!(p.check_auth_password("u", "pw"), AuthDecision::Reject);
        assert_eq!(
            p.check_auth_publickey("u", "ssh-ed25519", b"blob"),
            AuthDecision::Reject
        );
        assert!(p.interactive_prompt("u", "").is_none());
    }

    #[test]
    fn test_default_channel_policy() {
        let p = Defaults;
        assert_eq!(
            p.check_channel_open("session", &mut Message::new()),
            OpenDecision::Accept
        );
        match p.check_channel_open("direct-tcpip", &mut Message::new()) {
            OpenDecision::Reject { code, .. } => {
                assert_eq!(code, open_failure::UNKNOWN_CHANNEL_TYPE)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_deny_all() {
        let p = DenyAllPolicy;
        assert!(p.allowed_auth_methods("u").is_empty());
        assert!(!p.check_channel_request("shell", &mut Message::new()));
        assert!(matches!(
            p.check_channel_open("session", &mut Message::new()),
            OpenDecision::Reject { .. }
        ));
    }
}
