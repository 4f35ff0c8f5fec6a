//! End-to-end client/server tests over an in-memory stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use skiff_platform::SkiffError;
use skiff_proto::channel::ChannelEvent;
use skiff_proto::hostkey::Ed25519HostKey;
use skiff_proto::message::Message;
use skiff_proto::msg::open_failure;
use skiff_proto::server::{AuthDecision, InteractivePrompt, ServerPolicy};
use skiff_proto::transport::{Transport, TransportConfig};
use skiff_proto::TransportRegistry;

struct TestPolicy;

impl ServerPolicy for TestPolicy {
    fn allowed_auth_methods(&self, username: &str) -> Vec<String> {
        if username == "carol" {
            vec![
                "publickey".to_string(),
                "keyboard-interactive".to_string(),
            ]
        } else {
            vec!["password".to_string(), "publickey".to_string()]
        }
    }

    fn check_auth_password(&self, username: &str, password: &str) -> AuthDecision {
        if username == "alice" && password == "sesame" {
            AuthDecision::Accept
        } else {
            AuthDecision::Reject
        }
    }

    fn check_auth_publickey(&self, username: &str, algorithm: &str, _blob: &[u8]) -> AuthDecision {
        if username == "alice" && algorithm == "ssh-ed25519" {
            AuthDecision::Accept
        } else {
            AuthDecision::Reject
        }
    }

    fn interactive_prompt(&self, username: &str, _submethods: &str) -> Option<InteractivePrompt> {
        if username == "carol" {
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
        if username == "carol" && responses == ["sesame".to_string()] {
            AuthDecision::Accept
        } else {
            AuthDecision::Reject
        }
    }

    fn check_global_request(&self, kind: &str, data: &mut Message) -> Option<Message> {
        if kind == "echo@test.skiff" {
            let payload = data.get_string().unwrap_or_default();
            let mut reply = Message::new();
            reply.add_string(&payload);
            Some(reply)
        } else {
            None
        }
    }
}

async fn connected_pair(
    client_config: TransportConfig,
    server_config: TransportConfig,
) -> (Transport, Transport) {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    let host_key = Arc::new(Ed25519HostKey::generate().expect("host key"));
    let policy: Arc<dyn ServerPolicy> = Arc::new(TestPolicy);

    let server = Transport::start_server(server_stream, server_config, host_key, policy);
    let client = Transport::start_client(client_stream, client_config);
    let (client, server) = tokio::join!(client, server);
    (client.expect("client handshake"), server.expect("server handshake"))
}

async fn default_pair() -> (Transport, Transport) {
    connected_pair(TransportConfig::default(), TransportConfig::default()).await
}

/// Accepts channels on the server and echoes their data back.
fn spawn_echo_server(server: Transport) {
    tokio::spawn(async move {
        while let Some(mut channel) = server.accept().await {
            tokio::spawn(async move {
                loop {
                    let data = match channel.read().await {
                        Ok(d) if d.is_empty() => break,
                        Ok(d) => d,
                        Err(_) => break,
                    };
                    if channel.write_all(&data).await.is_err() {
                        break;
                    }
                }
                let _ = channel.close().await;
            });
        }
    });
}

#[tokio::test]
async fn handshake_establishes_session() {
    let (client, server) = default_pair().await;
    assert!(client.is_active());
    assert!(server.is_active());
    assert!(!client.is_authenticated());

    // Both sides agree on the session identifier.
    assert_eq!(client.session_id(), server.session_id());
    assert!(client.session_id().is_some());
}

#[tokio::test]
async fn handshake_with_group14_kex() {
    let config = TransportConfig {
        preferred_kex: Some(vec!["diffie-hellman-group14-sha256".to_string()]),
        ..TransportConfig::default()
    };
    let (client, _server) = connected_pair(config.clone(), config).await;
    assert!(client.is_active());
}

#[tokio::test]
async fn password_auth_succeeds() {
    let (client, server) = default_pair().await;
    client.auth_password("alice", "sesame").await.unwrap();
    assert!(client.is_authenticated());
    assert!(server.is_authenticated());
    assert_eq!(server.authenticated_user().as_deref(), Some("alice"));
}

#[tokio::test]
async fn password_auth_failure_lists_methods() {
    let (client, _server) = default_pair().await;
    let err = client.auth_password("alice", "wrong").await.unwrap_err();
    match err {
        SkiffError::AuthenticationFailed { partial, allowed } => {
            assert!(!partial);
            assert!(allowed.contains(&"password".to_string()));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(!client.is_authenticated());
    // The transport survives a failed attempt.
    assert!(client.is_active());
    client.auth_password("alice", "sesame").await.unwrap();
}

#[tokio::test]
async fn password_falls_back_to_interactive() {
    // The server refuses plain password for carol but accepts the same
    // secret through a single keyboard-interactive prompt.
    let (client, server) = default_pair().await;
    client.auth_password("carol", "sesame").await.unwrap();
    assert!(server.is_authenticated());
    assert_eq!(server.authenticated_user().as_deref(), Some("carol"));
}

#[tokio::test]
async fn publickey_auth_succeeds() {
    let (client, server) = default_pair().await;
    let key = Arc::new(Ed25519HostKey::generate().unwrap());
    client.auth_publickey("alice", key).await.unwrap();
    assert!(server.is_authenticated());
}

#[tokio::test]
async fn auth_none_reports_allowed_methods() {
    let (client, _server) = default_pair().await;
    let err = client.auth_none("alice").await.unwrap_err();
    match err {
        SkiffError::AuthenticationFailed { allowed, .. } => {
            assert_eq!(allowed, vec!["password", "publickey"]);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn channel_echo_round_trip() {
    let (client, server) = default_pair().await;
    client.auth_password("alice", "sesame").await.unwrap();
    spawn_echo_server(server);

    let mut channel = client.open_session().await.unwrap();
    channel.write_all(b"over the wire and back").await.unwrap();
    let mut received = Vec::new();
    while received.len() < 22 {
        let chunk = channel.read().await.unwrap();
        assert!(!chunk.is_empty(), "channel closed early");
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, b"over the wire and back");
    channel.close().await.unwrap();
}

#[tokio::test]
async fn channel_bulk_transfer_flows_through_windows() {
    let (client, server) = default_pair().await;
    client.auth_password("alice", "sesame").await.unwrap();
    spawn_echo_server(server);

    // Enough data to force several window replenishments at the
    // default sizes would take minutes through an echo; a few hundred
    // KiB still crosses packet-size chunking many times.
    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let mut channel = client.open_session().await.unwrap();

    // The dispatch loop replenishes windows as data arrives, so the
    // echo flows even while this side is still writing.
    let expected = payload.clone();
    channel.write_all(&payload).await.unwrap();

    let mut received = Vec::with_capacity(expected.len());
    while received.len() < expected.len() {
        let chunk = channel.read().await.unwrap();
        assert!(!chunk.is_empty(), "channel closed early");
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, expected);
}

#[tokio::test]
async fn exec_request_reaches_server_channel() {
    let (client, server) = default_pair().await;
    client.auth_password("alice", "sesame").await.unwrap();

    let server_side = tokio::spawn(async move {
        let mut channel = server.accept().await.expect("incoming channel");
        loop {
            match channel.next_event().await {
                Some(ChannelEvent::Request { kind, data, .. }) if kind == "exec" => {
                    let mut m = Message::from_bytes(data);
                    return m.get_str().unwrap();
                }
                Some(_) => continue,
                None => panic!("channel gone before request"),
            }
        }
    });

    let mut channel = client.open_session().await.unwrap();
    channel.exec("uname -a").await.unwrap();
    let command = server_side.await.unwrap();
    assert_eq!(command, "uname -a");
}

#[tokio::test]
async fn eof_propagates() {
    let (client, server) = default_pair().await;
    client.auth_password("alice", "sesame").await.unwrap();

    let server_side = tokio::spawn(async move {
        let mut channel = server.accept().await.unwrap();
        // An empty read means EOF.
        channel.read().await.unwrap()
    });

    let mut channel = client.open_session().await.unwrap();
    channel.send_eof().await.unwrap();
    assert!(server_side.await.unwrap().is_empty());
}

#[tokio::test]
async fn pre_auth_channel_open_is_refused() {
    let (client, _server) = default_pair().await;
    let err = client.open_session().await.unwrap_err();
    match err {
        SkiffError::ChannelOpenRefused { code, .. } => {
            assert_eq!(code, open_failure::ADMINISTRATIVELY_PROHIBITED);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn unknown_channel_type_is_refused() {
    let (client, _server) = default_pair().await;
    client.auth_password("alice", "sesame").await.unwrap();
    let err = client
        .open_channel("direct-tcpip", None)
        .await
        .unwrap_err();
    match err {
        SkiffError::ChannelOpenRefused { code, .. } => {
            assert_eq!(code, open_failure::UNKNOWN_CHANNEL_TYPE);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn global_request_echo_and_refusal() {
    let (client, _server) = default_pair().await;
    client.auth_password("alice", "sesame").await.unwrap();

    let mut data = Message::new();
    data.add_string(b"ping");
    let reply = client
        .global_request("echo@test.skiff", Some(data), true)
        .await
        .unwrap();
    let mut reply = reply.expect("request accepted");
    assert_eq!(reply.get_string().unwrap(), b"ping");

    let denied = client
        .global_request("tcpip-forward", None, true)
        .await
        .unwrap();
    assert!(denied.is_none());
}

#[tokio::test]
async fn global_request_denied_before_auth() {
    let (client, _server) = default_pair().await;
    let denied = client
        .global_request("echo@test.skiff", None, true)
        .await
        .unwrap();
    assert!(denied.is_none());
}

#[tokio::test]
async fn rekey_keeps_session_id_and_traffic() {
    let (client, server) = default_pair().await;
    client.auth_password("alice", "sesame").await.unwrap();
    spawn_echo_server(server);

    let sid = client.session_id().unwrap();
    let mut channel = client.open_session().await.unwrap();
    channel.write_all(b"before").await.unwrap();
    assert_eq!(channel.read().await.unwrap(), b"before");

    for _ in 0..3 {
        client.renegotiate_keys().await.unwrap();
    }
    assert_eq!(client.session_id().unwrap(), sid);

    channel.write_all(b"after").await.unwrap();
    assert_eq!(channel.read().await.unwrap(), b"after");
}

#[tokio::test]
async fn compression_negotiated_end_to_end() {
    let config = TransportConfig {
        preferred_compression: vec!["zlib".to_string()],
        ..TransportConfig::default()
    };
    let (client, server) = connected_pair(config.clone(), config).await;
    client.auth_password("alice", "sesame").await.unwrap();
    spawn_echo_server(server);

    let mut channel = client.open_session().await.unwrap();
    let payload = vec![0x42u8; 20_000];
    channel.write_all(&payload).await.unwrap();
    let mut received = Vec::new();
    while received.len() < payload.len() {
        let chunk = channel.read().await.unwrap();
        assert!(!chunk.is_empty());
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, payload);
}

#[tokio::test]
async fn peer_close_releases_blocked_waiters() {
    let (client, server) = default_pair().await;
    client.auth_password("alice", "sesame").await.unwrap();
    spawn_echo_server(server.clone());

    let mut idle_channel = client.open_session().await.unwrap();

    // Three tasks blocked on different waits.
    let read_task = tokio::spawn(async move { idle_channel.read().await });
    let accept_client = client.clone();
    let accept_task = tokio::spawn(async move { accept_client.accept().await });
    let rekey_client = client.clone();
    let rekey_task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        rekey_client.renegotiate_keys().await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    server.close().await;

    let deadline = Duration::from_secs(5);
    let read_result = timeout(deadline, read_task).await.unwrap().unwrap();
    assert!(read_result.map(|d| d.is_empty()).unwrap_or(true));
    let accepted = timeout(deadline, accept_task).await.unwrap().unwrap();
    assert!(accepted.is_none());
    let rekeyed = timeout(deadline, rekey_task).await.unwrap().unwrap();
    // Either the rekey squeaked through before the close or it failed
    // with a closed-transport error; it must not hang.
    if let Err(e) = rekeyed {
        assert!(matches!(e, SkiffError::TransportClosed(_)));
    }

    assert!(!client.is_active());
    assert!(client.get_exception().is_some());
}

#[tokio::test]
async fn close_is_idempotent() {
    let (client, _server) = default_pair().await;
    client.close().await;
    client.close().await;
    assert!(!client.is_active());
    let err = client.open_session().await.unwrap_err();
    assert!(matches!(err, SkiffError::TransportClosed(_)));
}

#[tokio::test]
async fn registry_closes_all_transports() {
    let registry = TransportRegistry::new();
    let config = TransportConfig {
        registry: Some(registry.clone()),
        ..TransportConfig::default()
    };
    let (client, server) = connected_pair(config.clone(), config).await;
    assert_eq!(registry.live_count(), 2);

    registry.close_all();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!client.is_active());
    assert!(!server.is_active());
}

#[tokio::test]
async fn write_gate_reopens_after_handshake_and_rekey() {
    // Auth and channel traffic must go through promptly once the
    // initial exchange (and any later rekey) finishes; a stuck
    // clear-to-send flag shows up here as a timeout.
    let deadline = Duration::from_secs(5);
    let (client, server) = default_pair().await;
    timeout(deadline, client.auth_password("alice", "sesame"))
        .await
        .expect("clear-to-send flag never reopened after the handshake")
        .unwrap();
    spawn_echo_server(server);

    let mut channel = timeout(deadline, client.open_session())
        .await
        .expect("channel open blocked on the write gate")
        .unwrap();
    client.renegotiate_keys().await.unwrap();
    timeout(deadline, channel.write_all(b"post-rekey"))
        .await
        .expect("clear-to-send flag never reopened after the rekey")
        .unwrap();
    assert_eq!(channel.read().await.unwrap(), b"post-rekey");
}

#[tokio::test]
async fn rekey_during_bulk_transfer() {
    // Data the peer put on the wire before seeing our KEXINIT must
    // still be accepted; a rekey racing a busy channel used to kill
    // the transport.
    let (client, server) = default_pair().await;
    client.auth_password("alice", "sesame").await.unwrap();
    spawn_echo_server(server);

    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 239) as u8).collect();
    let mut channel = client.open_session().await.unwrap();

    let rekey_client = client.clone();
    let rekey = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1)).await;
        rekey_client.renegotiate_keys().await
    });

    channel.write_all(&payload).await.unwrap();
    let mut received = Vec::with_capacity(payload.len());
    while received.len() < payload.len() {
        let chunk = channel.read().await.unwrap();
        assert!(!chunk.is_empty(), "session died mid-transfer");
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, payload);

    rekey.await.unwrap().unwrap();
    assert!(client.is_active());
}

#[tokio::test]
async fn keepalive_replies_do_not_steal_global_replies() {
    // Keepalive probes and caller requests share the reply stream;
    // every echo must come back with its own payload even with probes
    // interleaved between the requests.
    let (client, _server) = default_pair().await;
    client.auth_password("alice", "sesame").await.unwrap();
    client.set_keepalive(Some(Duration::from_millis(1)));

    for i in 0..50u32 {
        let ping = format!("ping-{}", i).into_bytes();
        let mut data = Message::new();
        data.add_string(&ping);
        let reply = client
            .global_request("echo@test.skiff", Some(data), true)
            .await
            .unwrap();
        let mut reply = reply.expect("request accepted");
        assert_eq!(reply.get_string().unwrap(), ping);
    }
}

#[tokio::test]
async fn keepalive_probes_do_not_disturb_the_session() {
    let (client, server) = default_pair().await;
    client.auth_password("alice", "sesame").await.unwrap();
    spawn_echo_server(server);

    client.set_keepalive(Some(Duration::from_millis(20)));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(client.is_active());

    let mut channel = client.open_session().await.unwrap();
    channel.write_all(b"still here").await.unwrap();
    assert_eq!(channel.read().await.unwrap(), b"still here");
}
