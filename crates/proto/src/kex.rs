//! Key exchange plumbing: KEXINIT codec, the exchange-method trait and
//! key derivation.
//!
//! Concrete exchange math lives in [`crate::kexdh`]; this module owns the
//! pieces every method shares. The transport drives an engine as a small
//! state machine: [`KexEngine::start`] may emit opening messages, then
//! every kex-range packet is fed to [`KexEngine::handle`] until it
//! reports [`KexProgress::Done`] with the shared secret and exchange
//! hash.

use num_bigint::BigInt;
use rand::RngCore;
use sha2::{Digest, Sha256};
use skiff_platform::SkiffResult;

use crate::message::Message;

/// Hash function bound to a key exchange method.
///
/// Both supported methods use SHA-256; the indirection keeps derivation
/// honest about which hash it must use instead of assuming one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-256.
    Sha256,
}

impl HashAlgorithm {
    /// Digest size in bytes.
    pub fn output_size(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
        }
    }

    /// Hashes one buffer.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

/// Parsed SSH_MSG_KEXINIT body.
///
/// `raw_payload` preserves the exact wire payload (type byte included)
/// because both sides' KEXINIT payloads are hashed verbatim into the
/// exchange hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// 16 random bytes.
    pub cookie: [u8; 16],
    /// Key exchange method preferences.
    pub kex_algorithms: Vec<String>,
    /// Server host key type preferences.
    pub server_host_key_algorithms: Vec<String>,
    /// Client-to-server cipher preferences.
    pub ciphers_c2s: Vec<String>,
    /// Server-to-client cipher preferences.
    pub ciphers_s2c: Vec<String>,
    /// Client-to-server MAC preferences.
    pub macs_c2s: Vec<String>,
    /// Server-to-client MAC preferences.
    pub macs_s2c: Vec<String>,
    /// Client-to-server compression preferences.
    pub compression_c2s: Vec<String>,
    /// Server-to-client compression preferences.
    pub compression_s2c: Vec<String>,
    /// Client-to-server languages (always empty here).
    pub languages_c2s: Vec<String>,
    /// Server-to-client languages (always empty here).
    pub languages_s2c: Vec<String>,
    /// Whether a guessed kex packet follows.
    pub first_kex_packet_follows: bool,
    /// The exact wire payload, for the exchange hash.
    pub raw_payload: Vec<u8>,
}

impl KexInit {
    /// Builds a KEXINIT with a fresh random cookie and the given kex and
    /// host key lists; directional lists start empty.
    pub fn with_lists(kex: Vec<String>, host_keys: Vec<String>) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);
        Self {
            cookie,
            kex_algorithms: kex,
            server_host_key_algorithms: host_keys,
            ciphers_c2s: Vec::new(),
            ciphers_s2c: Vec::new(),
            macs_c2s: Vec::new(),
            macs_s2c: Vec::new(),
            compression_c2s: Vec::new(),
            compression_s2c: Vec::new(),
            languages_c2s: Vec::new(),
            languages_s2c: Vec::new(),
            first_kex_packet_follows: false,
            raw_payload: Vec::new(),
        }
    }

    /// Encodes the body (without the type byte) and records the full
    /// payload in `raw_payload`.
    pub fn to_message(&mut self) -> Message {
        let mut m = Message::new();
        m.add_bytes(&self.cookie);
        m.add_list(&self.kex_algorithms);
        m.add_list(&self.server_host_key_algorithms);
        m.add_list(&self.ciphers_c2s);
        m.add_list(&self.ciphers_s2c);
        m.add_list(&self.macs_c2s);
        m.add_list(&self.macs_s2c);
        m.add_list(&self.compression_c2s);
        m.add_list(&self.compression_s2c);
        m.add_list(&self.languages_c2s);
        m.add_list(&self.languages_s2c);
        m.add_boolean(self.first_kex_packet_follows);
        m.add_u32(0); // reserved

        let mut payload = Vec::with_capacity(m.as_bytes().len() + 1);
        payload.push(crate::msg::MessageType::KexInit as u8);
        payload.extend_from_slice(m.as_bytes());
        self.raw_payload = payload;
        m
    }

    /// Parses a received KEXINIT body. `raw_payload` must be the full
    /// payload as read off the wire, type byte included.
    pub fn from_message(msg: &mut Message, raw_payload: Vec<u8>) -> SkiffResult<Self> {
        let cookie_bytes = msg.get_bytes(16)?;
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&cookie_bytes);

        let kexinit = Self {
            cookie,
            kex_algorithms: msg.get_list()?,
            server_host_key_algorithms: msg.get_list()?,
            ciphers_c2s: msg.get_list()?,
            ciphers_s2c: msg.get_list()?,
            macs_c2s: msg.get_list()?,
            macs_s2c: msg.get_list()?,
            compression_c2s: msg.get_list()?,
            compression_s2c: msg.get_list()?,
            languages_c2s: msg.get_list()?,
            languages_s2c: msg.get_list()?,
            first_kex_packet_follows: msg.get_boolean()?,
            raw_payload,
        };
        msg.get_u32()?; // reserved
        Ok(kexinit)
    }
}

/// Everything an exchange method needs beyond its own messages.
#[derive(Debug, Clone)]
pub struct KexContext {
    /// Our banner line, without line terminators.
    pub local_version: String,
    /// The peer's banner line.
    pub remote_version: String,
    /// Our KEXINIT payload, type byte included.
    pub local_kexinit: Vec<u8>,
    /// The peer's KEXINIT payload.
    pub remote_kexinit: Vec<u8>,
    /// Whether we are the server side.
    pub is_server: bool,
}

impl KexContext {
    /// Hashes the exchange hash inputs common to both methods:
    /// `H = HASH(V_C || V_S || I_C || I_S || K_S || e || f || K)`.
    pub fn exchange_hash(
        &self,
        hash: HashAlgorithm,
        host_key_blob: &[u8],
        e_public: &[u8],
        f_public: &[u8],
        k: &BigInt,
        mpint_publics: bool,
    ) -> Vec<u8> {
        let (client_version, server_version, client_kexinit, server_kexinit) = if self.is_server {
            (
                &self.remote_version,
                &self.local_version,
                &self.remote_kexinit,
                &self.local_kexinit,
            )
        } else {
            (
                &self.local_version,
                &self.remote_version,
                &self.local_kexinit,
                &self.remote_kexinit,
            )
        };

        let mut m = Message::new();
        m.add_str(client_version);
        m.add_str(server_version);
        m.add_string(client_kexinit);
        m.add_string(server_kexinit);
        m.add_string(host_key_blob);
        if mpint_publics {
            // Classic DH hashes e and f as mpints.
            m.add_mpint(&BigInt::from_signed_bytes_be(&prepend_sign(e_public)));
            m.add_mpint(&BigInt::from_signed_bytes_be(&prepend_sign(f_public)));
        } else {
            // ECDH hashes the raw point strings.
            m.add_string(e_public);
            m.add_string(f_public);
        }
        m.add_mpint(k);
        hash.digest(m.as_bytes())
    }
}

fn prepend_sign(bytes: &[u8]) -> Vec<u8> {
    // Public values are unsigned on the wire; force a positive BigInt.
    let mut v = Vec::with_capacity(bytes.len() + 1);
    v.push(0);
    v.extend_from_slice(bytes);
    v
}

/// Result of a completed key exchange.
pub struct KexOutcome {
    /// The shared secret K.
    pub k: BigInt,
    /// The exchange hash H.
    pub h: Vec<u8>,
    /// The server's host key blob, for trust decisions.
    pub host_key_blob: Vec<u8>,
}

impl std::fmt::Debug for KexOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexOutcome")
            .field("k", &"<redacted>")
            .field("h_len", &self.h.len())
            .field("host_key_blob_len", &self.host_key_blob.len())
            .finish()
    }
}

/// A step of the exchange state machine.
pub enum KexProgress {
    /// Messages to send; the exchange continues.
    Pending(Vec<(u8, Message)>),
    /// The exchange finished; messages (if any) must still be sent.
    Done(Vec<(u8, Message)>, KexOutcome),
}

/// One key exchange method.
///
/// Engines are single-use: the transport constructs a fresh one per
/// exchange from the negotiated name.
pub trait KexEngine: Send + Sync {
    /// The hash the method binds. Key derivation must use this, never a
    /// fallback.
    fn hash_algorithm(&self) -> HashAlgorithm;

    /// Supplies host key material before the exchange starts. Called by
    /// the registry; engines stash the params for later.
    fn set_params(&mut self, params: crate::kexdh::KexParams);

    /// Opens the exchange. Clients typically emit their init message;
    /// servers typically wait.
    fn start(&mut self, ctx: &KexContext) -> SkiffResult<Vec<(u8, Message)>>;

    /// Feeds one kex-range message (types 30-49) to the engine.
    fn handle(
        &mut self,
        msg_type: u8,
        msg: &mut Message,
        ctx: &KexContext,
    ) -> SkiffResult<KexProgress>;
}

/// Derives `length` bytes of key material for one key id.
///
/// `initial = HASH(K || H || id || session_id)`, extended as needed by
/// `HASH(K || H || output_so_far)` (RFC 4253 Section 7.2). K is encoded
/// as an mpint. Ids: 'A' IV c2s, 'B' IV s2c, 'C' key c2s, 'D' key s2c,
/// 'E' MAC c2s, 'F' MAC s2c.
pub fn derive_key(
    hash: HashAlgorithm,
    k: &BigInt,
    h: &[u8],
    session_id: &[u8],
    id: u8,
    length: usize,
) -> Vec<u8> {
    let mut k_encoded = Message::new();
    k_encoded.add_mpint(k);

    let mut m = Vec::new();
    m.extend_from_slice(k_encoded.as_bytes());
    m.extend_from_slice(h);
    m.push(id);
    m.extend_from_slice(session_id);
    let mut out = hash.digest(&m);

    while out.len() < length {
        let mut m = Vec::new();
        m.extend_from_slice(k_encoded.as_bytes());
        m.extend_from_slice(h);
        m.extend_from_slice(&out);
        out.extend(hash.digest(&m));
    }
    out.truncate(length);
    out
}
