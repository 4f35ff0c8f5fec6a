//! The transport: session orchestration over one connection.
//!
//! A [`Transport`] is a cheap clone over shared state. One spawned
//! dispatch task owns the read half and drives everything inbound:
//! decoding, key exchange, authentication bookkeeping, channel events.
//! Callers write through an async mutex over the write half, gated so
//! user traffic never slips into an ongoing key exchange.
//!
//! Lifecycle: banner exchange, KEXINIT, key exchange, NEWKEYS, then
//! (clients) authentication and channels. Rekeying replays the KEXINIT
//! cycle over the live connection; the session id from the first
//! exchange never changes.
//!
//! # Example
//!
//! ```no_run
//! use skiff_proto::transport::{Transport, TransportConfig};
//!
//! # async fn run() -> skiff_platform::SkiffResult<()> {
//! let socket = tokio::net::TcpStream::connect("127.0.0.1:22").await?;
//! let transport = Transport::start_client(socket, TransportConfig::default()).await?;
//! transport.auth_password("user", "secret").await?;
//! let mut session = transport.open_session().await?;
//! session.exec("uptime").await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Mutex as TokioMutex, MutexGuard};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use skiff_platform::{SkiffError, SkiffResult};

use crate::auth::{AuthEvent, ServerAuth, ServerAuthOutcome};
use crate::channel::{
    clamp_packet, clamp_window, Channel, ChannelEntry, ChannelEvent, ChannelHandle, ChannelTable,
    DEFAULT_MAX_PACKET_SIZE, DEFAULT_WINDOW_SIZE,
};
use crate::cipher::{make_compressor, make_decompressor, CipherSpec, MacAlgorithm, MacKey};
use crate::hostkey::HostKey;
use crate::kex::{derive_key, HashAlgorithm, KexContext, KexEngine, KexInit, KexOutcome, KexProgress};
use crate::kexdh::{KexParams, KexRegistry};
use crate::message::Message;
use crate::msg::{disconnect, open_failure, MessageType};
use crate::negotiate::{negotiate, NegotiatedAlgorithms};
use crate::packet::{PacketReader, PacketWriter, ReadOutcome};
use crate::registry::TransportRegistry;
use crate::server::{OpenDecision, ServerPolicy};
use crate::version::Version;

/// How long to wait for the peer's identification banner.
pub const DEFAULT_BANNER_TIMEOUT: Duration = Duration::from_secs(15);

/// How long to wait for a channel open confirmation.
pub const DEFAULT_CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(3600);

/// Request type used for liveness probes.
const KEEPALIVE_REQUEST: &str = "keepalive@skiff.dev";

/// Callback deciding whether to trust a server host key. Receives the
/// negotiated algorithm name and the public key wire blob.
pub type HostKeyVerifier = Arc<dyn Fn(&str, &[u8]) -> bool + Send + Sync>;

/// Tunables for one transport.
#[derive(Clone)]
pub struct TransportConfig {
    /// The local identification banner.
    pub version: Version,
    /// Key exchange method constructors.
    pub kex_registry: KexRegistry,
    /// Kex preference override; defaults to the registry's order.
    pub preferred_kex: Option<Vec<String>>,
    /// Host key type preferences.
    pub preferred_host_keys: Vec<String>,
    /// Cipher preferences, used for both directions.
    pub preferred_ciphers: Vec<String>,
    /// MAC preferences, used for both directions.
    pub preferred_macs: Vec<String>,
    /// Compression preferences, used for both directions.
    pub preferred_compression: Vec<String>,
    /// Initial window advertised on new channels.
    pub window_size: u32,
    /// Maximum packet size advertised on new channels.
    pub max_packet_size: u32,
    /// Banner exchange deadline.
    pub banner_timeout: Duration,
    /// Channel open confirmation deadline.
    pub channel_open_timeout: Duration,
    /// Client-side host key trust decision; `None` trusts any key that
    /// carries a valid signature.
    pub host_key_verifier: Option<HostKeyVerifier>,
    /// Optional process-wide registry to enroll in.
    pub registry: Option<TransportRegistry>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            version: Version::default_skiff(),
            kex_registry: KexRegistry::builtin(),
            preferred_kex: None,
            preferred_host_keys: vec!["ssh-ed25519".to_string()],
            preferred_ciphers: vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()],
            preferred_macs: vec!["hmac-sha2-256".to_string(), "hmac-sha2-512".to_string()],
            preferred_compression: vec!["none".to_string()],
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            banner_timeout: DEFAULT_BANNER_TIMEOUT,
            channel_open_timeout: DEFAULT_CHANNEL_OPEN_TIMEOUT,
            host_key_verifier: None,
            registry: None,
        }
    }
}

/// Commands callers send into the dispatch loop.
pub(crate) enum LoopCommand {
    /// Begin a key renegotiation; the sender is resolved when NEWKEYS
    /// completes (or the transport dies).
    StartRekey(oneshot::Sender<SkiffResult<()>>),
    /// Change the keepalive interval.
    SetKeepalive(Option<Duration>),
    /// Orderly stop.
    Stop,
}

/// A queued reply slot for one outstanding GLOBAL_REQUEST, in wire
/// order. `None` marks a keepalive probe whose reply is discarded.
type GlobalReplySlot = Option<oneshot::Sender<SkiffResult<Option<Message>>>>;

/// State behind the std mutex. Never held across an await.
pub(crate) struct Shared {
    channels: ChannelTable,
    open_waiters: HashMap<u32, oneshot::Sender<SkiffResult<()>>>,
    global_replies: VecDeque<GlobalReplySlot>,
    auth_events: Option<mpsc::UnboundedSender<AuthEvent>>,
    session_id: Option<Vec<u8>>,
    cause: Option<Arc<SkiffError>>,
    authenticated: bool,
    authenticated_user: Option<String>,
    server_banner: Option<String>,
}

pub(crate) struct TransportInner {
    shared: StdMutex<Shared>,
    writer: TokioMutex<PacketWriter>,
    active_tx: watch::Sender<bool>,
    clear_tx: watch::Sender<bool>,
    commands: mpsc::UnboundedSender<LoopCommand>,
    accept_rx: TokioMutex<mpsc::UnboundedReceiver<Channel>>,
    config: TransportConfig,
    is_server: bool,
}

impl TransportInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().expect("transport state lock poisoned")
    }

    /// Records the first cause, fails every waiter and flips the active
    /// flag. Synchronous and idempotent; later causes are ignored.
    pub(crate) fn shutdown(&self, cause: SkiffError) {
        let mut shared = self.lock();
        if shared.cause.is_none() {
            info!(%cause, "transport shutting down");
            shared.cause = Some(Arc::new(cause));
        }
        let text = shared
            .cause
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_default();
        for (_, tx) in shared.open_waiters.drain() {
            let _ = tx.send(Err(SkiffError::TransportClosed(text.clone())));
        }
        for slot in shared.global_replies.drain(..) {
            if let Some(tx) = slot {
                let _ = tx.send(Err(SkiffError::TransportClosed(text.clone())));
            }
        }
        // Dropping the auth sender ends any in-flight auth routine.
        shared.auth_events = None;
        for handle in shared.channels.handles() {
            if let Some(entry) = shared.channels.get_mut(handle) {
                let _ = entry.events.send(ChannelEvent::Closed);
                entry.window_notify.notify_waiters();
            }
        }
        drop(shared);
        // send_replace stores the value even with no live receivers;
        // plain send would drop it and leave late subscribers stale.
        self.clear_tx.send_replace(false);
        self.active_tx.send_replace(false);
    }

    /// Shutdown path used by [`TransportRegistry::close_all`].
    pub(crate) fn shutdown_by_application(&self) {
        self.shutdown(SkiffError::TransportClosed(
            "Transport closed by application".to_string(),
        ));
        let _ = self.commands.send(LoopCommand::Stop);
    }
}

/// A handle to one SSH session. Clones share the session.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    /// Connects the client side over an established stream: banner
    /// exchange, key exchange, NEWKEYS. Returns once the session keys
    /// are live; authenticate next.
    pub async fn start_client<S>(stream: S, config: TransportConfig) -> SkiffResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        Self::start(stream, config, false, None, None).await
    }

    /// Accepts the server side over an established stream. The policy
    /// decides authentication and channel admission; the host key signs
    /// the exchange.
    pub async fn start_server<S>(
        stream: S,
        config: TransportConfig,
        host_key: Arc<dyn HostKey>,
        policy: Arc<dyn ServerPolicy>,
    ) -> SkiffResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        Self::start(stream, config, true, Some(host_key), Some(policy)).await
    }

    async fn start<S>(
        stream: S,
        config: TransportConfig,
        is_server: bool,
        host_key: Option<Arc<dyn HostKey>>,
        policy: Option<Arc<dyn ServerPolicy>>,
    ) -> SkiffResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = PacketReader::new(Box::new(read_half));
        let mut writer = PacketWriter::new(Box::new(write_half));

        let local_version = config.version.to_string();
        writer.write_banner(&config.version.to_wire_format()).await?;
        let line = timeout(config.banner_timeout, reader.read_banner_line())
            .await
            .map_err(|_| SkiffError::Timeout("banner exchange"))??;
        let remote = Version::parse(&line)?;
        info!(peer = %remote, server = is_server, "peer identified");

        let (active_tx, _) = watch::channel(true);
        let (clear_tx, _) = watch::channel(false);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(TransportInner {
            shared: StdMutex::new(Shared {
                channels: ChannelTable::new(),
                open_waiters: HashMap::new(),
                global_replies: VecDeque::new(),
                auth_events: None,
                session_id: None,
                cause: None,
                authenticated: false,
                authenticated_user: None,
                server_banner: None,
            }),
            writer: TokioMutex::new(writer),
            active_tx,
            clear_tx,
            commands: command_tx,
            accept_rx: TokioMutex::new(accept_rx),
            config,
            is_server,
        });
        if let Some(registry) = &inner.config.registry {
            registry.register(Arc::downgrade(&inner));
        }

        let (handshake_tx, handshake_rx) = oneshot::channel();
        let dispatch = DispatchLoop {
            inner: inner.clone(),
            reader,
            commands: command_rx,
            policy,
            host_key,
            accepts: accept_tx,
            kex: KexState::new(Some(handshake_tx)),
            server_auth: ServerAuth::new(),
            deferred_adjusts: Vec::new(),
            local_version,
            remote_version: line,
            keepalive: None,
        };
        tokio::spawn(dispatch.run());

        let transport = Self { inner };
        handshake_rx
            .await
            .map_err(|_| transport.closed_error())??;
        Ok(transport)
    }

    pub(crate) fn closed_error(&self) -> SkiffError {
        let shared = self.inner.lock();
        match &shared.cause {
            Some(cause) => SkiffError::TransportClosed(cause.to_string()),
            None => SkiffError::TransportClosed("Transport is not active".to_string()),
        }
    }

    /// Whether the connection is still live.
    pub fn is_active(&self) -> bool {
        *self.inner.active_tx.borrow()
    }

    /// Whether authentication has completed.
    pub fn is_authenticated(&self) -> bool {
        self.inner.lock().authenticated
    }

    /// The username that authenticated, once any has.
    pub fn authenticated_user(&self) -> Option<String> {
        self.inner.lock().authenticated_user.clone()
    }

    /// The session identifier: the exchange hash of the first key
    /// exchange. Stable across rekeys.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.inner.lock().session_id.clone()
    }

    /// The terminal failure, if the transport has one.
    pub fn get_exception(&self) -> Option<Arc<SkiffError>> {
        self.inner.lock().cause.clone()
    }

    /// The authentication banner the server sent, if any.
    pub fn auth_banner(&self) -> Option<String> {
        self.inner.lock().server_banner.clone()
    }

    /// Whether this is the server side.
    pub fn is_server(&self) -> bool {
        self.inner.is_server
    }

    /// Forces a key renegotiation and waits for it to finish.
    pub async fn renegotiate_keys(&self) -> SkiffResult<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .commands
            .send(LoopCommand::StartRekey(tx))
            .map_err(|_| self.closed_error())?;
        rx.await.map_err(|_| self.closed_error())?
    }

    /// Turns periodic keepalive probes on (or off with `None`).
    pub fn set_keepalive(&self, interval: Option<Duration>) {
        let _ = self.inner.commands.send(LoopCommand::SetKeepalive(interval));
    }

    /// Opens a "session" channel.
    pub async fn open_session(&self) -> SkiffResult<Channel> {
        self.open_channel("session", None).await
    }

    /// Opens a channel of the given type, with optional type-specific
    /// fields appended after the standard ones.
    pub async fn open_channel(&self, kind: &str, extra: Option<Message>) -> SkiffResult<Channel> {
        if !self.is_active() {
            return Err(self.closed_error());
        }
        let window = clamp_window(self.inner.config.window_size);
        let max_packet = clamp_packet(self.inner.config.max_packet_size);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (confirm_tx, confirm_rx) = oneshot::channel();
        let handle = {
            let mut shared = self.inner.lock();
            let entry = ChannelEntry::new(kind.to_string(), 0, window, max_packet, 0, 0, event_tx);
            let handle = shared.channels.alloc(entry);
            shared.open_waiters.insert(handle.index, confirm_tx);
            handle
        };

        let mut m = Message::new();
        m.add_str(kind);
        m.add_u32(handle.index);
        m.add_u32(window);
        m.add_u32(max_packet);
        if let Some(extra) = extra {
            m.add_bytes(extra.as_bytes());
        }
        if let Err(e) = self
            .send_user_message(MessageType::ChannelOpen as u8, &m)
            .await
        {
            self.forget_channel(handle);
            return Err(e);
        }

        match timeout(self.inner.config.channel_open_timeout, confirm_rx).await {
            Err(_) => {
                self.forget_channel(handle);
                Err(SkiffError::Timeout("channel open"))
            }
            Ok(Err(_)) => Err(self.closed_error()),
            Ok(Ok(Err(e))) => {
                self.forget_channel(handle);
                Err(e)
            }
            Ok(Ok(Ok(()))) => Ok(Channel::new(self.clone(), handle, event_rx)),
        }
    }

    fn forget_channel(&self, handle: ChannelHandle) {
        let mut shared = self.inner.lock();
        shared.open_waiters.remove(&handle.index);
        shared.channels.remove(handle);
    }

    /// Waits for the next channel the peer opens. `None` once the
    /// transport is closed.
    pub async fn accept(&self) -> Option<Channel> {
        self.inner.accept_rx.lock().await.recv().await
    }

    /// Sends a global request. With `want_reply`, resolves to the
    /// peer's response payload on success or `None` on refusal.
    pub async fn global_request(
        &self,
        kind: &str,
        data: Option<Message>,
        want_reply: bool,
    ) -> SkiffResult<Option<Message>> {
        let mut m = Message::new();
        m.add_str(kind);
        m.add_boolean(want_reply);
        if let Some(data) = data {
            m.add_bytes(data.as_bytes());
        }
        if !want_reply {
            self.send_user_message(MessageType::GlobalRequest as u8, &m)
                .await?;
            return Ok(None);
        }

        // The peer answers requests in the order it received them, so
        // the reply slot is queued while the writer lock is held and
        // cannot reorder against other requests or keepalive probes.
        let (tx, rx) = oneshot::channel();
        {
            let mut writer = self.lock_writer_clear().await?;
            self.inner.lock().global_replies.push_back(Some(tx));
            if let Err(e) = writer
                .send_message(MessageType::GlobalRequest as u8, &m)
                .await
            {
                self.inner.lock().global_replies.pop_back();
                return Err(e);
            }
        }
        rx.await.map_err(|_| self.closed_error())?
    }

    /// Disconnects cleanly. Idempotent; outstanding waiters resolve
    /// with a closed-transport error.
    pub async fn close(&self) {
        if !self.is_active() {
            return;
        }
        let mut m = Message::new();
        m.add_u32(disconnect::BY_APPLICATION);
        m.add_str("closed by application");
        m.add_str("");
        let _ = self
            .control_send(MessageType::Disconnect as u8, &m)
            .await;
        self.inner.shutdown(SkiffError::TransportClosed(
            "Transport closed by application".to_string(),
        ));
        let _ = self.inner.commands.send(LoopCommand::Stop);
    }

    // --- crate-internal plumbing ---

    pub(crate) fn send_auth_events(&self) -> mpsc::UnboundedReceiver<AuthEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().auth_events = Some(tx);
        rx
    }

    pub(crate) fn mark_authenticated(&self, username: &str) {
        let mut shared = self.inner.lock();
        shared.authenticated = true;
        shared.authenticated_user = Some(username.to_string());
    }

    /// Writes bypassing the clear-to-send gate; used for messages that
    /// are legal during key exchange.
    pub(crate) async fn control_send(&self, msg_type: u8, msg: &Message) -> SkiffResult<()> {
        if !self.is_active() {
            return Err(self.closed_error());
        }
        self.inner.writer.lock().await.send_message(msg_type, msg).await
    }

    /// Blocks until user traffic may go out again (no key exchange in
    /// progress), or fails once the transport dies.
    async fn wait_clear_to_send(&self) -> SkiffResult<()> {
        let mut active = self.inner.active_tx.subscribe();
        let mut clear = self.inner.clear_tx.subscribe();
        loop {
            if !*active.borrow() {
                return Err(self.closed_error());
            }
            if *clear.borrow() {
                return Ok(());
            }
            tokio::select! {
                r = clear.changed() => if r.is_err() { return Err(self.closed_error()); },
                r = active.changed() => if r.is_err() { return Err(self.closed_error()); },
            }
        }
    }

    /// Acquires the writer with the clear-to-send gate re-verified
    /// under the lock, so user traffic can never follow our own
    /// KEXINIT onto the wire.
    async fn lock_writer_clear(&self) -> SkiffResult<MutexGuard<'_, PacketWriter>> {
        loop {
            self.wait_clear_to_send().await?;
            let writer = self.inner.writer.lock().await;
            if *self.inner.clear_tx.borrow() {
                return Ok(writer);
            }
        }
    }

    /// Writes user traffic, waiting out any key exchange in progress.
    pub(crate) async fn send_user_message(&self, msg_type: u8, msg: &Message) -> SkiffResult<()> {
        self.lock_writer_clear().await?.send_message(msg_type, msg).await
    }

    /// Writes all of `data` on a channel, honoring the peer's window
    /// and packet limits.
    pub(crate) async fn channel_write_all(
        &self,
        handle: ChannelHandle,
        data: &[u8],
    ) -> SkiffResult<()> {
        let mut offset = 0;
        let mut active = self.inner.active_tx.subscribe();
        while offset < data.len() {
            if !*active.borrow() {
                return Err(self.closed_error());
            }
            let notify = {
                let shared = self.inner.lock();
                let entry = shared
                    .channels
                    .get(handle)
                    .ok_or_else(|| SkiffError::Protocol("Channel is closed".to_string()))?;
                entry.window_notify.clone()
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let chunk = {
                let mut shared = self.inner.lock();
                let entry = shared
                    .channels
                    .get_mut(handle)
                    .ok_or_else(|| SkiffError::Protocol("Channel is closed".to_string()))?;
                if entry.eof_sent || entry.close_sent {
                    return Err(SkiffError::Protocol(
                        "Channel is closed for writing".to_string(),
                    ));
                }
                if entry.remote_window == 0 {
                    None
                } else {
                    let n = (data.len() - offset)
                        .min(entry.remote_window as usize)
                        .min(entry.remote_max_packet.max(1) as usize);
                    entry.remote_window -= n as u64;
                    Some((entry.remote_id, n))
                }
            };

            match chunk {
                Some((remote_id, n)) => {
                    let mut m = Message::new();
                    m.add_u32(remote_id);
                    m.add_string(&data[offset..offset + n]);
                    self.send_user_message(MessageType::ChannelData as u8, &m)
                        .await?;
                    offset += n;
                }
                None => {
                    tokio::select! {
                        _ = notified => {}
                        r = active.changed() => if r.is_err() { return Err(self.closed_error()); },
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn channel_eof(&self, handle: ChannelHandle) -> SkiffResult<()> {
        let remote_id = {
            let mut shared = self.inner.lock();
            let entry = shared
                .channels
                .get_mut(handle)
                .ok_or_else(|| SkiffError::Protocol("Channel is closed".to_string()))?;
            if entry.eof_sent || entry.close_sent {
                return Ok(());
            }
            entry.eof_sent = true;
            entry.remote_id
        };
        let mut m = Message::new();
        m.add_u32(remote_id);
        self.send_user_message(MessageType::ChannelEof as u8, &m).await
    }

    pub(crate) async fn channel_close(&self, handle: ChannelHandle) -> SkiffResult<()> {
        let action = {
            let mut shared = self.inner.lock();
            match shared.channels.get_mut(handle) {
                None => None,
                Some(entry) if entry.close_sent => {
                    if entry.close_received {
                        shared.channels.remove(handle);
                    }
                    None
                }
                Some(entry) => {
                    entry.close_sent = true;
                    let remote_id = entry.remote_id;
                    if entry.close_received {
                        shared.channels.remove(handle);
                    }
                    Some(remote_id)
                }
            }
        };
        if let Some(remote_id) = action {
            let mut m = Message::new();
            m.add_u32(remote_id);
            self.send_user_message(MessageType::ChannelClose as u8, &m)
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn channel_request(
        &self,
        handle: ChannelHandle,
        kind: &str,
        body: Message,
        want_reply: bool,
    ) -> SkiffResult<bool> {
        let (remote_id, receiver) = {
            let mut shared = self.inner.lock();
            let entry = shared
                .channels
                .get_mut(handle)
                .ok_or_else(|| SkiffError::Protocol("Channel is closed".to_string()))?;
            let receiver = if want_reply {
                let (tx, rx) = oneshot::channel();
                entry.pending_replies.push_back(tx);
                Some(rx)
            } else {
                None
            };
            (entry.remote_id, receiver)
        };

        let mut m = Message::new();
        m.add_u32(remote_id);
        m.add_str(kind);
        m.add_boolean(want_reply);
        m.add_bytes(body.as_bytes());
        self.send_user_message(MessageType::ChannelRequest as u8, &m)
            .await?;

        match receiver {
            None => Ok(true),
            Some(rx) => rx.await.map_err(|_| self.closed_error()),
        }
    }
}

/// Per-exchange state inside the dispatch loop.
struct KexState {
    in_kex: bool,
    local: Option<KexInit>,
    remote: Option<KexInit>,
    engine: Option<Box<dyn KexEngine>>,
    ctx: Option<KexContext>,
    negotiated: Option<NegotiatedAlgorithms>,
    hash: HashAlgorithm,
    outcome: Option<KexOutcome>,
    pending_sid: Option<Vec<u8>>,
    waiters: Vec<oneshot::Sender<SkiffResult<()>>>,
}

impl KexState {
    fn new(first_waiter: Option<oneshot::Sender<SkiffResult<()>>>) -> Self {
        Self {
            in_kex: false,
            local: None,
            remote: None,
            engine: None,
            ctx: None,
            negotiated: None,
            hash: HashAlgorithm::Sha256,
            outcome: None,
            pending_sid: None,
            waiters: first_waiter.into_iter().collect(),
        }
    }
}

struct DispatchLoop {
    inner: Arc<TransportInner>,
    reader: PacketReader,
    commands: mpsc::UnboundedReceiver<LoopCommand>,
    policy: Option<Arc<dyn ServerPolicy>>,
    host_key: Option<Arc<dyn HostKey>>,
    accepts: mpsc::UnboundedSender<Channel>,
    kex: KexState,
    server_auth: ServerAuth,
    deferred_adjusts: Vec<(u32, u32)>,
    local_version: String,
    remote_version: String,
    keepalive: Option<Duration>,
}

impl DispatchLoop {
    async fn run(mut self) {
        let result = self.main().await;
        if let Err(e) = result {
            // Fail any kex waiters before the generic shutdown.
            for tx in self.kex.waiters.drain(..) {
                let _ = tx.send(Err(SkiffError::TransportClosed(e.to_string())));
            }
            self.inner.shutdown(e);
        } else {
            self.inner.shutdown_by_application();
        }
        self.inner.writer.lock().await.shutdown().await;
        debug!("dispatch loop exited");
    }

    async fn main(&mut self) -> SkiffResult<()> {
        self.initiate_kex(None).await?;
        let mut keepalive_deadline: Option<Instant> = None;

        loop {
            let sleeper = async {
                match keepalive_deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                outcome = self.reader.read_message() => match outcome? {
                    ReadOutcome::NeedRekey => self.initiate_kex(None).await?,
                    ReadOutcome::Msg(t, m) => self.handle_message(t, m).await?,
                },
                cmd = self.commands.recv() => match cmd {
                    None | Some(LoopCommand::Stop) => return Ok(()),
                    Some(LoopCommand::StartRekey(tx)) => self.initiate_kex(Some(tx)).await?,
                    Some(LoopCommand::SetKeepalive(interval)) => {
                        self.keepalive = interval;
                        keepalive_deadline = interval.map(|d| Instant::now() + d);
                    }
                },
                _ = sleeper => {
                    self.send_keepalive().await?;
                    keepalive_deadline = self.keepalive.map(|d| Instant::now() + d);
                }
            }
            // Rekey by outbound volume too.
            if !self.kex.in_kex && self.inner.writer.lock().await.needs_rekey() {
                self.initiate_kex(None).await?;
            }
        }
    }

    async fn send_keepalive(&mut self) -> SkiffResult<()> {
        if self.kex.in_kex {
            return Ok(());
        }
        let mut m = Message::new();
        m.add_str(KEEPALIVE_REQUEST);
        m.add_boolean(true);
        // The probe takes a waiterless reply slot, queued under the
        // writer lock like any other request. Any reply at all proves
        // the peer is alive; the payload is discarded.
        let mut writer = self.inner.writer.lock().await;
        self.inner.lock().global_replies.push_back(None);
        writer.send_message(MessageType::GlobalRequest as u8, &m).await
    }

    async fn send(&self, msg_type: u8, msg: &Message) -> SkiffResult<()> {
        self.inner.writer.lock().await.send_message(msg_type, msg).await
    }

    // --- key exchange ---

    fn build_kexinit(&self) -> KexInit {
        let config = &self.inner.config;
        let kex_names = config
            .preferred_kex
            .clone()
            .unwrap_or_else(|| config.kex_registry.names());
        // A server can only offer host key types it can actually sign
        // with.
        let host_keys = match &self.host_key {
            Some(key) => config
                .preferred_host_keys
                .iter()
                .filter(|n| n.as_str() == key.name())
                .cloned()
                .collect(),
            None => config.preferred_host_keys.clone(),
        };
        let mut ki = KexInit::with_lists(kex_names, host_keys);
        ki.ciphers_c2s = config.preferred_ciphers.clone();
        ki.ciphers_s2c = config.preferred_ciphers.clone();
        ki.macs_c2s = config.preferred_macs.clone();
        ki.macs_s2c = config.preferred_macs.clone();
        ki.compression_c2s = config.preferred_compression.clone();
        ki.compression_s2c = config.preferred_compression.clone();
        ki
    }

    async fn initiate_kex(
        &mut self,
        waiter: Option<oneshot::Sender<SkiffResult<()>>>,
    ) -> SkiffResult<()> {
        if let Some(tx) = waiter {
            self.kex.waiters.push(tx);
        }
        if self.kex.in_kex {
            return Ok(());
        }
        self.kex.in_kex = true;
        self.inner.clear_tx.send_replace(false);

        let mut ki = self.build_kexinit();
        let body = ki.to_message();
        self.kex.local = Some(ki);
        self.send(MessageType::KexInit as u8, &body).await?;
        debug!("sent KEXINIT");

        if self.kex.remote.is_some() {
            self.proceed_negotiation().await?;
        }
        Ok(())
    }

    async fn handle_kexinit(&mut self, mut m: Message, raw: Vec<u8>) -> SkiffResult<()> {
        let ki = KexInit::from_message(&mut m, raw)?;
        if !self.kex.in_kex {
            // Peer-initiated rekey: our KEXINIT goes out before we act
            // on theirs.
            self.kex.remote = Some(ki);
            self.initiate_kex(None).await?;
            return Ok(());
        }
        self.kex.remote = Some(ki);
        self.proceed_negotiation().await
    }

    async fn proceed_negotiation(&mut self) -> SkiffResult<()> {
        let (local, remote) = match (&self.kex.local, &self.kex.remote) {
            (Some(l), Some(r)) => (l, r),
            _ => return Ok(()),
        };
        let negotiated = negotiate(local, remote, self.inner.is_server)?;
        let params = KexParams {
            host_key: self.host_key.clone(),
            host_key_alg: negotiated.host_key.clone(),
        };
        let mut engine = self
            .inner
            .config
            .kex_registry
            .build(&negotiated.kex, &params)?;
        let ctx = KexContext {
            local_version: self.local_version.clone(),
            remote_version: self.remote_version.clone(),
            local_kexinit: local.raw_payload.clone(),
            remote_kexinit: remote.raw_payload.clone(),
            is_server: self.inner.is_server,
        };
        self.kex.hash = engine.hash_algorithm();

        let opening = engine.start(&ctx)?;
        for (t, m) in &opening {
            self.send(*t, m).await?;
        }
        self.kex.engine = Some(engine);
        self.kex.ctx = Some(ctx);
        self.kex.negotiated = Some(negotiated);
        Ok(())
    }

    async fn handle_kex_message(&mut self, msg_type: u8, mut m: Message) -> SkiffResult<()> {
        let ctx = self
            .kex
            .ctx
            .clone()
            .ok_or_else(|| SkiffError::Protocol("Key exchange message before KEXINIT".to_string()))?;
        let engine = self
            .kex
            .engine
            .as_mut()
            .ok_or_else(|| SkiffError::Protocol("No key exchange in progress".to_string()))?;

        match engine.handle(msg_type, &mut m, &ctx)? {
            KexProgress::Pending(msgs) => {
                for (t, m) in &msgs {
                    self.send(*t, m).await?;
                }
                Ok(())
            }
            KexProgress::Done(msgs, outcome) => {
                for (t, m) in &msgs {
                    self.send(*t, m).await?;
                }
                if !self.inner.is_server {
                    if let Some(verify) = &self.inner.config.host_key_verifier {
                        let alg = self
                            .kex
                            .negotiated
                            .as_ref()
                            .map(|n| n.host_key.clone())
                            .unwrap_or_default();
                        if !verify(&alg, &outcome.host_key_blob) {
                            return Err(SkiffError::Security(
                                "Server host key rejected".to_string(),
                            ));
                        }
                    }
                }

                self.send(MessageType::NewKeys as u8, &Message::new()).await?;
                let sid = self
                    .inner
                    .lock()
                    .session_id
                    .clone()
                    .unwrap_or_else(|| outcome.h.clone());
                self.activate_outbound(&outcome, &sid).await?;
                self.kex.pending_sid = Some(sid);
                self.kex.outcome = Some(outcome);
                Ok(())
            }
        }
    }

    async fn activate_outbound(&mut self, outcome: &KexOutcome, sid: &[u8]) -> SkiffResult<()> {
        let negotiated = self
            .kex
            .negotiated
            .as_ref()
            .ok_or_else(|| SkiffError::Protocol("No negotiated algorithms".to_string()))?;
        let is_server = self.inner.is_server;
        let hash = self.kex.hash;

        let spec = CipherSpec::from_name(negotiated.cipher_out(is_server)).ok_or(
            SkiffError::Config("Negotiated cipher has no implementation".to_string()),
        )?;
        let (iv_id, key_id, mac_id) = if is_server {
            (b'B', b'D', b'F')
        } else {
            (b'A', b'C', b'E')
        };
        let iv = derive_key(hash, &outcome.k, &outcome.h, sid, iv_id, spec.iv_size);
        let key = derive_key(hash, &outcome.k, &outcome.h, sid, key_id, spec.key_size);
        let cipher = spec.instantiate(&key, &iv)?;

        let mac_alg = MacAlgorithm::from_name(negotiated.mac_out(is_server)).ok_or(
            SkiffError::Config("Negotiated MAC has no implementation".to_string()),
        )?;
        let mac_key = derive_key(hash, &outcome.k, &outcome.h, sid, mac_id, mac_alg.key_size());
        let mac = MacKey::new(mac_alg, &mac_key)?;
        let compressor = make_compressor(negotiated.compression_out(is_server))?;

        self.inner
            .writer
            .lock()
            .await
            .set_outbound_keys(cipher, spec.block_size, mac, compressor);
        Ok(())
    }

    fn activate_inbound(&mut self, outcome: &KexOutcome, sid: &[u8]) -> SkiffResult<()> {
        let negotiated = self
            .kex
            .negotiated
            .as_ref()
            .ok_or_else(|| SkiffError::Protocol("No negotiated algorithms".to_string()))?;
        let is_server = self.inner.is_server;
        let hash = self.kex.hash;

        let spec = CipherSpec::from_name(negotiated.cipher_in(is_server)).ok_or(
            SkiffError::Config("Negotiated cipher has no implementation".to_string()),
        )?;
        let (iv_id, key_id, mac_id) = if is_server {
            (b'A', b'C', b'E')
        } else {
            (b'B', b'D', b'F')
        };
        let iv = derive_key(hash, &outcome.k, &outcome.h, sid, iv_id, spec.iv_size);
        let key = derive_key(hash, &outcome.k, &outcome.h, sid, key_id, spec.key_size);
        let cipher = spec.instantiate(&key, &iv)?;

        let mac_alg = MacAlgorithm::from_name(negotiated.mac_in(is_server)).ok_or(
            SkiffError::Config("Negotiated MAC has no implementation".to_string()),
        )?;
        let mac_key = derive_key(hash, &outcome.k, &outcome.h, sid, mac_id, mac_alg.key_size());
        let mac = MacKey::new(mac_alg, &mac_key)?;
        let decompressor = make_decompressor(negotiated.compression_in(is_server))?;

        self.reader
            .set_inbound_keys(cipher, spec.block_size, mac, decompressor);
        Ok(())
    }

    async fn handle_newkeys(&mut self) -> SkiffResult<()> {
        let outcome = self.kex.outcome.take().ok_or_else(|| {
            SkiffError::Protocol("NEWKEYS before key exchange completed".to_string())
        })?;
        let sid = self
            .kex
            .pending_sid
            .take()
            .unwrap_or_else(|| outcome.h.clone());
        self.activate_inbound(&outcome, &sid)?;

        {
            let mut shared = self.inner.lock();
            if shared.session_id.is_none() {
                shared.session_id = Some(sid);
            }
        }

        self.kex.in_kex = false;
        self.kex.local = None;
        self.kex.remote = None;
        self.kex.engine = None;
        self.kex.ctx = None;
        self.inner.clear_tx.send_replace(true);
        for tx in self.kex.waiters.drain(..) {
            let _ = tx.send(Ok(()));
        }
        info!("key exchange complete");

        // Window grants postponed during the exchange go out now.
        let adjusts = std::mem::take(&mut self.deferred_adjusts);
        for (remote_id, amount) in adjusts {
            let mut m = Message::new();
            m.add_u32(remote_id);
            m.add_u32(amount);
            self.send(MessageType::ChannelWindowAdjust as u8, &m).await?;
        }
        Ok(())
    }

    // --- dispatch ---

    async fn handle_message(&mut self, msg_type: u8, m: Message) -> SkiffResult<()> {
        // The peer may legitimately have user traffic in flight until
        // its own KEXINIT reaches us; the wire is restricted to
        // exchange messages only after that point.
        if self.kex.in_kex && self.kex.remote.is_some() && !Self::allowed_during_kex(msg_type) {
            return Err(SkiffError::Protocol(format!(
                "Packet type {} received during key exchange",
                msg_type
            )));
        }

        let known = MessageType::from_u8(msg_type);
        match known {
            Some(MessageType::Disconnect) => {
                let mut m = m;
                let code = m.get_u32().unwrap_or(0);
                let text = m.get_str().unwrap_or_default();
                Err(SkiffError::TransportClosed(format!(
                    "Disconnected by peer (code {}): {}",
                    code, text
                )))
            }
            Some(MessageType::Ignore) => Ok(()),
            Some(MessageType::Debug) => {
                let mut m = m;
                let _always_display = m.get_boolean().unwrap_or(false);
                let text = m.get_str().unwrap_or_default();
                debug!(peer_debug = %text, "SSH_MSG_DEBUG");
                Ok(())
            }
            Some(MessageType::Unimplemented) => {
                let mut m = m;
                let seq = m.get_u32().unwrap_or(0);
                warn!(seq, "peer reported unimplemented packet");
                Ok(())
            }
            Some(MessageType::KexInit) => {
                let mut raw = Vec::with_capacity(m.as_bytes().len() + 1);
                raw.push(MessageType::KexInit as u8);
                raw.extend_from_slice(m.as_bytes());
                self.handle_kexinit(m, raw).await
            }
            Some(MessageType::NewKeys) => self.handle_newkeys().await,
            _ if (30..=49).contains(&msg_type) => self.handle_kex_message(msg_type, m).await,

            Some(MessageType::ServiceRequest) => self.handle_service_request(m).await,
            Some(MessageType::ServiceAccept) => {
                self.push_auth_event(AuthEvent::ServiceAccepted);
                Ok(())
            }
            Some(MessageType::UserauthRequest) => self.handle_userauth_request(m).await,
            Some(MessageType::UserauthInfoResponse) => self.handle_userauth_info_response(m).await,
            Some(MessageType::UserauthBanner) => {
                let mut m = m;
                let text = m.get_str().unwrap_or_default();
                self.inner.lock().server_banner = Some(text.clone());
                self.push_auth_event(AuthEvent::Banner(text));
                Ok(())
            }
            Some(MessageType::UserauthFailure) => {
                let mut m = m;
                let methods = m.get_list()?;
                let partial = m.get_boolean()?;
                self.push_auth_event(AuthEvent::Failure { methods, partial });
                Ok(())
            }
            Some(MessageType::UserauthSuccess) => {
                self.inner.lock().authenticated = true;
                self.push_auth_event(AuthEvent::Success);
                Ok(())
            }
            Some(MessageType::UserauthPkOk) => {
                // Method-specific 60: PK_OK or INFO_REQUEST, depending
                // on the method the auth routine has in flight.
                self.push_auth_event(AuthEvent::MethodSpecific(m.into_bytes()));
                Ok(())
            }

            Some(MessageType::GlobalRequest) => self.handle_global_request(m).await,
            Some(MessageType::RequestSuccess) => {
                match self.inner.lock().global_replies.pop_front() {
                    Some(Some(tx)) => {
                        let _ = tx.send(Ok(Some(m)));
                    }
                    Some(None) => debug!("keepalive acknowledged"),
                    None => warn!("REQUEST_SUCCESS with no request outstanding"),
                }
                Ok(())
            }
            Some(MessageType::RequestFailure) => {
                match self.inner.lock().global_replies.pop_front() {
                    Some(Some(tx)) => {
                        let _ = tx.send(Ok(None));
                    }
                    Some(None) => debug!("keepalive acknowledged"),
                    None => warn!("REQUEST_FAILURE with no request outstanding"),
                }
                Ok(())
            }

            Some(MessageType::ChannelOpen) => self.handle_channel_open(m).await,
            Some(MessageType::ChannelOpenConfirmation) => self.handle_open_confirmation(m),
            Some(MessageType::ChannelOpenFailure) => self.handle_open_failure(m),
            Some(MessageType::ChannelWindowAdjust) => self.handle_window_adjust(m),
            Some(MessageType::ChannelData) => self.handle_channel_data(m, None).await,
            Some(MessageType::ChannelExtendedData) => {
                let mut m = m;
                let recipient = m.get_u32()?;
                let code = m.get_u32()?;
                let mut rest = Message::new();
                rest.add_u32(recipient);
                rest.add_bytes(m.peek_rest());
                self.handle_channel_data(rest, Some(code)).await
            }
            Some(MessageType::ChannelEof) => self.handle_channel_eof(m),
            Some(MessageType::ChannelClose) => self.handle_channel_close(m).await,
            Some(MessageType::ChannelRequest) => self.handle_channel_request(m).await,
            Some(MessageType::ChannelSuccess) => self.handle_channel_reply(m, true),
            Some(MessageType::ChannelFailure) => self.handle_channel_reply(m, false),

            _ => {
                // Never answer UNIMPLEMENTED with UNIMPLEMENTED; type 3
                // is handled above, so anything here is safe to bounce.
                warn!(msg_type, "unhandled packet type");
                let mut reply = Message::new();
                reply.add_u32(self.reader.last_seq());
                self.send(MessageType::Unimplemented as u8, &reply).await
            }
        }
    }

    fn allowed_during_kex(msg_type: u8) -> bool {
        matches!(msg_type, 1..=4 | 20 | 21 | 30..=49)
    }

    fn push_auth_event(&self, event: AuthEvent) {
        let shared = self.inner.lock();
        if let Some(tx) = &shared.auth_events {
            let _ = tx.send(event);
        }
    }

    fn transport(&self) -> Transport {
        Transport {
            inner: self.inner.clone(),
        }
    }

    // --- auth (server side) ---

    async fn handle_service_request(&mut self, mut m: Message) -> SkiffResult<()> {
        let service = m.get_str()?;
        if !self.inner.is_server {
            return Err(SkiffError::Protocol(
                "SERVICE_REQUEST received by client".to_string(),
            ));
        }
        if service != "ssh-userauth" {
            return Err(SkiffError::Protocol(format!(
                "Unsupported service '{}'",
                service
            )));
        }
        let mut reply = Message::new();
        reply.add_str(&service);
        self.send(MessageType::ServiceAccept as u8, &reply).await
    }

    async fn handle_userauth_request(&mut self, m: Message) -> SkiffResult<()> {
        let policy = match &self.policy {
            Some(p) => p.clone(),
            None => {
                return Err(SkiffError::Protocol(
                    "USERAUTH_REQUEST received by client".to_string(),
                ))
            }
        };
        if self.inner.lock().authenticated {
            // Already authenticated; silently ignored.
            return Ok(());
        }
        let session_id = self.inner.lock().session_id.clone().unwrap_or_default();
        let outcome = self.server_auth.handle_request(&policy, &session_id, m)?;
        self.apply_auth_outcome(outcome).await
    }

    async fn handle_userauth_info_response(&mut self, m: Message) -> SkiffResult<()> {
        let policy = match &self.policy {
            Some(p) => p.clone(),
            None => {
                return Err(SkiffError::Protocol(
                    "USERAUTH_INFO_RESPONSE received by client".to_string(),
                ))
            }
        };
        let outcome = self.server_auth.handle_info_response(&policy, m)?;
        self.apply_auth_outcome(outcome).await
    }

    async fn apply_auth_outcome(&mut self, outcome: ServerAuthOutcome) -> SkiffResult<()> {
        match outcome {
            ServerAuthOutcome::Replies(msgs) => {
                for (t, m) in &msgs {
                    self.send(*t, m).await?;
                }
                Ok(())
            }
            ServerAuthOutcome::Authenticated { username, replies } => {
                {
                    let mut shared = self.inner.lock();
                    shared.authenticated = true;
                    shared.authenticated_user = Some(username.clone());
                }
                info!(user = %username, "authentication succeeded");
                for (t, m) in &replies {
                    self.send(*t, m).await?;
                }
                Ok(())
            }
        }
    }

    // --- global requests ---

    async fn handle_global_request(&mut self, mut m: Message) -> SkiffResult<()> {
        let kind = m.get_str()?;
        let want_reply = m.get_boolean()?;
        debug!(kind = %kind, want_reply, "global request");

        let response = match &self.policy {
            Some(policy) if self.inner.lock().authenticated => {
                policy.check_global_request(&kind, &mut m)
            }
            // Clients and unauthenticated peers get a refusal.
            _ => None,
        };
        if !want_reply {
            return Ok(());
        }
        match response {
            Some(extra) => {
                self.send(MessageType::RequestSuccess as u8, &extra).await
            }
            None => self.send(MessageType::RequestFailure as u8, &Message::new()).await,
        }
    }

    // --- channels ---

    async fn handle_channel_open(&mut self, mut m: Message) -> SkiffResult<()> {
        let kind = m.get_str()?;
        let sender_id = m.get_u32()?;
        let remote_window = m.get_u32()?;
        let remote_max_packet = m.get_u32()?;

        let refusal = if self.inner.is_server && !self.inner.lock().authenticated {
            Some((
                open_failure::ADMINISTRATIVELY_PROHIBITED,
                "Authentication required".to_string(),
            ))
        } else {
            match &self.policy {
                Some(policy) => match policy.check_channel_open(&kind, &mut m) {
                    OpenDecision::Accept => None,
                    OpenDecision::Reject { code, text } => Some((code, text)),
                },
                // Clients accept peer-opened channels; the application
                // decides what to do with them via accept().
                None => None,
            }
        };

        if let Some((code, text)) = refusal {
            debug!(kind = %kind, code, "refusing channel open");
            let mut reply = Message::new();
            reply.add_u32(sender_id);
            reply.add_u32(code);
            reply.add_str(&text);
            reply.add_str("");
            return self
                .send(MessageType::ChannelOpenFailure as u8, &reply)
                .await;
        }

        let window = clamp_window(self.inner.config.window_size);
        let max_packet = clamp_packet(self.inner.config.max_packet_size);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = {
            let mut shared = self.inner.lock();
            let entry = ChannelEntry::new(
                kind.clone(),
                sender_id,
                window,
                max_packet,
                remote_window,
                remote_max_packet,
                event_tx,
            );
            shared.channels.alloc(entry)
        };

        let mut reply = Message::new();
        reply.add_u32(sender_id);
        reply.add_u32(handle.index);
        reply.add_u32(window);
        reply.add_u32(max_packet);
        self.send(MessageType::ChannelOpenConfirmation as u8, &reply)
            .await?;
        info!(kind = %kind, id = handle.index, "channel opened by peer");

        let channel = Channel::new(self.transport(), handle, event_rx);
        let _ = self.accepts.send(channel);
        Ok(())
    }

    fn handle_open_confirmation(&mut self, mut m: Message) -> SkiffResult<()> {
        let recipient = m.get_u32()?;
        let sender = m.get_u32()?;
        let window = m.get_u32()?;
        let max_packet = m.get_u32()?;

        let mut shared = self.inner.lock();
        let waiter = shared.open_waiters.remove(&recipient);
        match shared.channels.get_by_id_mut(recipient) {
            Some((_, entry)) if waiter.is_some() => {
                entry.remote_id = sender;
                entry.remote_window = u64::from(window);
                entry.remote_max_packet = max_packet;
                if let Some(tx) = waiter {
                    let _ = tx.send(Ok(()));
                }
            }
            // Stale or unknown id: drop it on the floor.
            _ => warn!(recipient, "confirmation for unknown channel"),
        }
        Ok(())
    }

    fn handle_open_failure(&mut self, mut m: Message) -> SkiffResult<()> {
        let recipient = m.get_u32()?;
        let code = m.get_u32()?;
        let text = m.get_str().unwrap_or_default();

        let mut shared = self.inner.lock();
        let waiter = shared.open_waiters.remove(&recipient);
        let stale = shared.channels.get_by_id_mut(recipient).map(|(h, _)| h);
        if let Some(handle) = stale {
            shared.channels.remove(handle);
        }
        match waiter {
            Some(tx) => {
                let _ = tx.send(Err(SkiffError::ChannelOpenRefused { code, text }));
            }
            None => warn!(recipient, "open failure for unknown channel"),
        }
        Ok(())
    }

    fn handle_window_adjust(&mut self, mut m: Message) -> SkiffResult<()> {
        let recipient = m.get_u32()?;
        let amount = m.get_u32()?;
        let mut shared = self.inner.lock();
        if let Some((_, entry)) = shared.channels.get_by_id_mut(recipient) {
            entry.remote_window = entry.remote_window.saturating_add(u64::from(amount));
            entry.window_notify.notify_waiters();
        } else {
            warn!(recipient, "window adjust for unknown channel");
        }
        Ok(())
    }

    async fn handle_channel_data(&mut self, mut m: Message, extended: Option<u32>) -> SkiffResult<()> {
        let recipient = m.get_u32()?;
        let data = m.get_string()?;

        let adjust = {
            let mut shared = self.inner.lock();
            let (_, entry) = match shared.channels.get_by_id_mut(recipient) {
                Some(found) => found,
                None => {
                    warn!(recipient, "data for unknown channel");
                    return Ok(());
                }
            };
            if (data.len() as u64) > entry.local_window {
                return Err(SkiffError::Protocol(format!(
                    "Peer overflowed channel {} window by {} bytes",
                    recipient,
                    data.len() as u64 - entry.local_window
                )));
            }
            entry.local_window -= data.len() as u64;

            let event = match extended {
                Some(code) => ChannelEvent::ExtendedData {
                    code,
                    data: data.clone(),
                },
                None => ChannelEvent::Data(data.clone()),
            };
            let _ = entry.events.send(event);

            // Replenish once we have consumed half the advertised
            // window.
            let threshold = u64::from(entry.initial_local_window) / 2;
            if entry.local_window < threshold {
                let amount = u64::from(entry.initial_local_window) - entry.local_window;
                entry.local_window += amount;
                Some((entry.remote_id, amount as u32))
            } else {
                None
            }
        };

        if let Some((remote_id, amount)) = adjust {
            if self.kex.in_kex {
                // Window grants are user traffic; hold them until the
                // exchange finishes.
                self.deferred_adjusts.push((remote_id, amount));
            } else {
                let mut reply = Message::new();
                reply.add_u32(remote_id);
                reply.add_u32(amount);
                self.send(MessageType::ChannelWindowAdjust as u8, &reply)
                    .await?;
            }
        }
        Ok(())
    }

    fn handle_channel_eof(&mut self, mut m: Message) -> SkiffResult<()> {
        let recipient = m.get_u32()?;
        let mut shared = self.inner.lock();
        if let Some((_, entry)) = shared.channels.get_by_id_mut(recipient) {
            entry.eof_received = true;
            let _ = entry.events.send(ChannelEvent::Eof);
        } else {
            warn!(recipient, "EOF for unknown channel");
        }
        Ok(())
    }

    async fn handle_channel_close(&mut self, mut m: Message) -> SkiffResult<()> {
        let recipient = m.get_u32()?;
        let reply_to = {
            let mut shared = self.inner.lock();
            let found = match shared.channels.get_by_id_mut(recipient) {
                None => {
                    warn!(recipient, "close for unknown channel");
                    None
                }
                Some((handle, entry)) => {
                    entry.close_received = true;
                    let _ = entry.events.send(ChannelEvent::Closed);
                    entry.window_notify.notify_waiters();
                    let reply = if entry.close_sent {
                        None
                    } else {
                        entry.close_sent = true;
                        Some(entry.remote_id)
                    };
                    Some((handle, reply))
                }
            };
            match found {
                Some((handle, reply)) => {
                    shared.channels.remove(handle);
                    reply
                }
                None => None,
            }
        };
        if let Some(remote_id) = reply_to {
            let mut reply = Message::new();
            reply.add_u32(remote_id);
            self.send(MessageType::ChannelClose as u8, &reply).await?;
        }
        Ok(())
    }

    async fn handle_channel_request(&mut self, mut m: Message) -> SkiffResult<()> {
        let recipient = m.get_u32()?;
        let kind = m.get_str()?;
        let want_reply = m.get_boolean()?;
        let mut body = Message::from_bytes(m.peek_rest().to_vec());

        let remote_id = {
            let mut shared = self.inner.lock();
            match shared.channels.get_by_id_mut(recipient) {
                None => {
                    warn!(recipient, kind = %kind, "request for unknown channel");
                    return Ok(());
                }
                Some((_, entry)) => {
                    let _ = entry.events.send(ChannelEvent::Request {
                        kind: kind.clone(),
                        want_reply,
                        data: body.as_bytes().to_vec(),
                    });
                    entry.remote_id
                }
            }
        };

        if want_reply {
            let ok = match &self.policy {
                Some(policy) => policy.check_channel_request(&kind, &mut body),
                // Clients do not honor peer-initiated channel requests.
                None => false,
            };
            let mut reply = Message::new();
            reply.add_u32(remote_id);
            let t = if ok {
                MessageType::ChannelSuccess
            } else {
                MessageType::ChannelFailure
            };
            self.send(t as u8, &reply).await?;
        }
        Ok(())
    }

    fn handle_channel_reply(&mut self, mut m: Message, success: bool) -> SkiffResult<()> {
        let recipient = m.get_u32()?;
        let mut shared = self.inner.lock();
        if let Some((_, entry)) = shared.channels.get_by_id_mut(recipient) {
            match entry.pending_replies.pop_front() {
                Some(tx) => {
                    let _ = tx.send(success);
                }
                None => warn!(recipient, "unsolicited channel request reply"),
            }
        }
        Ok(())
    }
}
