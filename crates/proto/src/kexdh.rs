//! Concrete key exchange methods and the engine registry.
//!
//! Two methods ship by default:
//!
//! - `curve25519-sha256` (and its `@libssh.org` alias): X25519 ECDH via
//!   ring, raw point strings in the exchange hash
//! - `diffie-hellman-group14-sha256`: classic modp group 14, mpint
//!   public values in the exchange hash
//!
//! Both sides drive an engine through [`KexEngine::start`] and
//! [`KexEngine::handle`]; the transport never sees the method's math.
//! Custom methods can be registered on a [`KexRegistry`] before the
//! transport starts.

use std::collections::HashMap;
use std::sync::Arc;

use num_bigint::{BigInt, RandBigInt, Sign};
use once_cell::sync::Lazy;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use skiff_platform::{SkiffError, SkiffResult};
use tracing::debug;

use crate::hostkey::{self, HostKey};
use crate::kex::{HashAlgorithm, KexContext, KexEngine, KexOutcome, KexProgress};
use crate::message::Message;
use crate::msg::MessageType;

/// RFC 3526 group 14: a 2048-bit MODP prime, generator 2.
static GROUP14_P: Lazy<BigInt> = Lazy::new(|| {
    let hex = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
               29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
               EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
               E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
               EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
               C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
               83655D23DCA3AD961C62F356208552BB9ED529077096966D\
               670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
               E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
               DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
               15728E5A8AACAA68FFFFFFFFFFFFFFFF";
    let bytes = hex::decode(hex).expect("group 14 prime is valid hex");
    BigInt::from_bytes_be(Sign::Plus, &bytes)
});

static GROUP14_G: Lazy<BigInt> = Lazy::new(|| BigInt::from(2));

/// Inputs an engine needs beyond the transport context.
#[derive(Clone)]
pub struct KexParams {
    /// The server's host key; `None` on the client.
    pub host_key: Option<Arc<dyn HostKey>>,
    /// The negotiated host key algorithm name, for signature checks.
    pub host_key_alg: String,
}

type EngineBuilder = Arc<dyn Fn(&KexParams) -> Box<dyn KexEngine> + Send + Sync>;

/// Maps negotiated method names to engine constructors.
///
/// The transport consults this at every exchange, so methods added or
/// replaced here take effect without touching dispatch code.
#[derive(Clone)]
pub struct KexRegistry {
    builders: HashMap<String, EngineBuilder>,
    order: Vec<String>,
}

impl KexRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// The built-in methods, strongest first.
    pub fn builtin() -> Self {
        let mut r = Self::new();
        r.register("curve25519-sha256", |_| Box::new(Curve25519Kex::new()));
        r.register("curve25519-sha256@libssh.org", |_| {
            Box::new(Curve25519Kex::new())
        });
        r.register("diffie-hellman-group14-sha256", |_| {
            Box::new(DhGroup14Kex::new())
        });
        r
    }

    /// Registers (or replaces) a method.
    pub fn register(
        &mut self,
        name: &str,
        builder: impl Fn(&KexParams) -> Box<dyn KexEngine> + Send + Sync + 'static,
    ) {
        if !self.builders.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.builders.insert(name.to_string(), Arc::new(builder));
    }

    /// Method names in registration order, for the KEXINIT offer.
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Builds an engine for a negotiated name.
    pub fn build(&self, name: &str, params: &KexParams) -> SkiffResult<Box<dyn KexEngine>> {
        let builder = self.builders.get(name).ok_or_else(|| {
            SkiffError::Protocol(format!("Negotiated unknown kex method '{}'", name))
        })?;
        let mut engine = builder(params);
        engine.set_params(params.clone());
        Ok(engine)
    }
}

impl Default for KexRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// X25519 ECDH with SHA-256 (RFC 8731).
pub struct Curve25519Kex {
    params: Option<KexParams>,
    private: Option<EphemeralPrivateKey>,
    local_public: Vec<u8>,
}

impl Curve25519Kex {
    /// Creates a fresh single-use engine.
    pub fn new() -> Self {
        Self {
            params: None,
            private: None,
            local_public: Vec::new(),
        }
    }

    fn generate_keypair(&mut self) -> SkiffResult<()> {
        let rng = SystemRandom::new();
        let private = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| SkiffError::Security("X25519 key generation failed".to_string()))?;
        self.local_public = private
            .compute_public_key()
            .map_err(|_| SkiffError::Security("X25519 public key computation failed".to_string()))?
            .as_ref()
            .to_vec();
        self.private = Some(private);
        Ok(())
    }

    fn agree(&mut self, peer_public: &[u8]) -> SkiffResult<BigInt> {
        let private = self
            .private
            .take()
            .ok_or_else(|| SkiffError::Protocol("Key exchange message out of order".to_string()))?;
        let peer = UnparsedPublicKey::new(&X25519, peer_public);
        let secret = agree_ephemeral(private, &peer, |s| s.to_vec())
            .map_err(|_| SkiffError::Security("X25519 agreement failed".to_string()))?;
        // The shared secret is an unsigned big-endian integer.
        Ok(BigInt::from_bytes_be(Sign::Plus, &secret))
    }

    fn params(&self) -> SkiffResult<&KexParams> {
        self.params
            .as_ref()
            .ok_or_else(|| SkiffError::Protocol("Key exchange engine not initialized".to_string()))
    }
}

impl Default for Curve25519Kex {
    fn default() -> Self {
        Self::new()
    }
}

impl KexEngine for Curve25519Kex {
    fn hash_algorithm(&self) -> HashAlgorithm {
        HashAlgorithm::Sha256
    }

    fn set_params(&mut self, params: KexParams) {
        self.params = Some(params);
    }

    fn start(&mut self, ctx: &KexContext) -> SkiffResult<Vec<(u8, Message)>> {
        self.generate_keypair()?;
        if ctx.is_server {
            // The server waits for the client's init.
            return Ok(Vec::new());
        }
        let mut m = Message::new();
        m.add_string(&self.local_public);
        Ok(vec![(MessageType::KexdhInit as u8, m)])
    }

    fn handle(
        &mut self,
        msg_type: u8,
        msg: &mut Message,
        ctx: &KexContext,
    ) -> SkiffResult<KexProgress> {
        match (msg_type, ctx.is_server) {
            (t, true) if t == MessageType::KexdhInit as u8 => {
                let client_public = msg.get_string()?;
                let k = self.agree(&client_public)?;

                let host_key = self
                    .params()?
                    .host_key
                    .clone()
                    .ok_or_else(|| SkiffError::Config("Server has no host key".to_string()))?;
                let blob = host_key.public_blob();
                let h = ctx.exchange_hash(
                    self.hash_algorithm(),
                    &blob,
                    &client_public,
                    &self.local_public,
                    &k,
                    false,
                );
                let signature = host_key.sign(&h)?;

                let mut reply = Message::new();
                reply.add_string(&blob);
                reply.add_string(&self.local_public);
                reply.add_string(&signature);
                debug!("curve25519 exchange complete (server)");
                Ok(KexProgress::Done(
                    vec![(MessageType::KexdhReply as u8, reply)],
                    KexOutcome {
                        k,
                        h,
                        host_key_blob: blob,
                    },
                ))
            }
            (t, false) if t == MessageType::KexdhReply as u8 => {
                let blob = msg.get_string()?;
                let server_public = msg.get_string()?;
                let signature = msg.get_string()?;

                let k = self.agree(&server_public)?;
                let h = ctx.exchange_hash(
                    self.hash_algorithm(),
                    &blob,
                    &self.local_public,
                    &server_public,
                    &k,
                    false,
                );
                hostkey::verify(&self.params()?.host_key_alg, &blob, &signature, &h)?;
                debug!("curve25519 exchange complete (client)");
                Ok(KexProgress::Done(
                    Vec::new(),
                    KexOutcome {
                        k,
                        h,
                        host_key_blob: blob,
                    },
                ))
            }
            _ => Err(SkiffError::Protocol(format!(
                "Unexpected message type {} during curve25519 exchange",
                msg_type
            ))),
        }
    }
}

/// Classic group 14 Diffie-Hellman with SHA-256 (RFC 8268).
pub struct DhGroup14Kex {
    params: Option<KexParams>,
    exponent: Option<BigInt>,
    local_public: Option<BigInt>,
}

impl DhGroup14Kex {
    /// Creates a fresh single-use engine.
    pub fn new() -> Self {
        Self {
            params: None,
            exponent: None,
            local_public: None,
        }
    }

    fn generate_keypair(&mut self) {
        // Exponent in [2, (p-1)/2), per the usual safe-prime argument.
        let q: BigInt = (&*GROUP14_P - 1) / 2;
        let x = rand::thread_rng().gen_bigint_range(&BigInt::from(2), &q);
        self.local_public = Some(GROUP14_G.modpow(&x, &GROUP14_P));
        self.exponent = Some(x);
    }

    fn check_public(value: &BigInt) -> SkiffResult<()> {
        let upper: BigInt = &*GROUP14_P - 1;
        if value <= &BigInt::from(1) || value >= &upper {
            return Err(SkiffError::Security(
                "DH public value out of range".to_string(),
            ));
        }
        Ok(())
    }

    fn params(&self) -> SkiffResult<&KexParams> {
        self.params
            .as_ref()
            .ok_or_else(|| SkiffError::Protocol("Key exchange engine not initialized".to_string()))
    }

    fn local_public_bytes(&self) -> Vec<u8> {
        self.local_public
            .as_ref()
            .map(|e| e.to_bytes_be().1)
            .unwrap_or_default()
    }
}

impl Default for DhGroup14Kex {
    fn default() -> Self {
        Self::new()
    }
}

impl KexEngine for DhGroup14Kex {
    fn hash_algorithm(&self) -> HashAlgorithm {
        HashAlgorithm::Sha256
    }

    fn set_params(&mut self, params: KexParams) {
        self.params = Some(params);
    }

    fn start(&mut self, ctx: &KexContext) -> SkiffResult<Vec<(u8, Message)>> {
        self.generate_keypair();
        if ctx.is_server {
            return Ok(Vec::new());
        }
        let mut m = Message::new();
        m.add_mpint(self.local_public.as_ref().ok_or_else(|| {
            SkiffError::Protocol("Key exchange engine not initialized".to_string())
        })?);
        Ok(vec![(MessageType::KexdhInit as u8, m)])
    }

    fn handle(
        &mut self,
        msg_type: u8,
        msg: &mut Message,
        ctx: &KexContext,
    ) -> SkiffResult<KexProgress> {
        let exponent = self
            .exponent
            .clone()
            .ok_or_else(|| SkiffError::Protocol("Key exchange message out of order".to_string()))?;

        match (msg_type, ctx.is_server) {
            (t, true) if t == MessageType::KexdhInit as u8 => {
                let e = msg.get_mpint()?;
                Self::check_public(&e)?;
                let k = e.modpow(&exponent, &GROUP14_P);
                let f_bytes = self.local_public_bytes();

                let host_key = self
                    .params()?
                    .host_key
                    .clone()
                    .ok_or_else(|| SkiffError::Config("Server has no host key".to_string()))?;
                let blob = host_key.public_blob();
                let h = ctx.exchange_hash(
                    self.hash_algorithm(),
                    &blob,
                    &e.to_bytes_be().1,
                    &f_bytes,
                    &k,
                    true,
                );
                let signature = host_key.sign(&h)?;

                let mut reply = Message::new();
                reply.add_string(&blob);
                reply.add_mpint(self.local_public.as_ref().ok_or_else(|| {
                    SkiffError::Protocol("Key exchange engine not initialized".to_string())
                })?);
                reply.add_string(&signature);
                debug!("group14 exchange complete (server)");
                Ok(KexProgress::Done(
                    vec![(MessageType::KexdhReply as u8, reply)],
                    KexOutcome {
                        k,
                        h,
                        host_key_blob: blob,
                    },
                ))
            }
            (t, false) if t == MessageType::KexdhReply as u8 => {
                let blob = msg.get_string()?;
                let f = msg.get_mpint()?;
                let signature = msg.get_string()?;
                Self::check_public(&f)?;

                let k = f.modpow(&exponent, &GROUP14_P);
                let h = ctx.exchange_hash(
                    self.hash_algorithm(),
                    &blob,
                    &self.local_public_bytes(),
                    &f.to_bytes_be().1,
                    &k,
                    true,
                );
                hostkey::verify(&self.params()?.host_key_alg, &blob, &signature, &h)?;
                debug!("group14 exchange complete (client)");
                Ok(KexProgress::Done(
                    Vec::new(),
                    KexOutcome {
                        k,
                        h,
                        host_key_blob: blob,
                    },
                ))
            }
            _ => Err(SkiffError::Protocol(format!(
                "Unexpected message type {} during group14 exchange",
                msg_type
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostkey::Ed25519HostKey;

    fn contexts() -> (KexContext, KexContext) {
        let client = KexContext {
            local_version: "SSH-2.0-Client".to_string(),
            remote_version: "SSH-2.0-Server".to_string(),
            local_kexinit: vec![20, 1, 1],
            remote_kexinit: vec![20, 2, 2],
            is_server: false,
        };
        let server = KexContext {
            local_version: "SSH-2.0-Server".to_string(),
            remote_version: "SSH-2.0-Client".to_string(),
            local_kexinit: vec![20, 2, 2],
            remote_kexinit: vec![20, 1, 1],
            is_server: true,
        };
        (client, server)
    }

    fn run_exchange(name: &str) -> (KexOutcome, KexOutcome) {
        let registry = KexRegistry::builtin();
        let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
        let client_params = KexParams {
            host_key: None,
            host_key_alg: "ssh-ed25519".to_string(),
        };
        let server_params = KexParams {
            host_key: Some(host_key),
            host_key_alg: "ssh-ed25519".to_string(),
        };
        let mut client = registry.build(name, &client_params).unwrap();
        let mut server = registry.build(name, &server_params).unwrap();
        let (client_ctx, server_ctx) = contexts();

        let mut to_server = client.start(&client_ctx).unwrap();
        assert!(server.start(&server_ctx).unwrap().is_empty());
        assert_eq!(to_server.len(), 1);
        let (t, mut init) = to_server.remove(0);

        let (mut to_client, server_outcome) = match server.handle(t, &mut init, &server_ctx) {
            Ok(KexProgress::Done(msgs, outcome)) => (msgs, outcome),
            other => panic!("server did not finish: {:?}", other.map(|_| ())),
        };
        assert_eq!(to_client.len(), 1);
        let (t, mut reply) = to_client.remove(0);

        let client_outcome = match client.handle(t, &mut reply, &client_ctx) {
            Ok(KexProgress::Done(msgs, outcome)) => {
                assert!(msgs.is_empty());
                outcome
            }
            other => panic!("client did not finish: {:?}", other.map(|_| ())),
        };
        (client_outcome, server_outcome)
    }

    #[test]
    fn test_curve25519_exchange_agrees() {
        let (c, s) = run_exchange("curve25519-sha256");
        assert_eq!(c.k, s.k);
        assert_eq!(c.h, s.h);
        assert_eq!(c.host_key_blob, s.host_key_blob);
        assert_eq!(c.h.len(), 32);
    }

    #[test]
    fn test_group14_exchange_agrees() {
        let (c, s) = run_exchange("diffie-hellman-group14-sha256");
        assert_eq!(c.k, s.k);
        assert_eq!(c.h, s.h);
    }

    #[test]
    fn test_client_rejects_forged_signature() {
        let registry = KexRegistry::builtin();
        let real_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
        let client_params = KexParams {
            host_key: None,
            host_key_alg: "ssh-ed25519".to_string(),
        };
        let server_params = KexParams {
            host_key: Some(real_key.clone()),
            host_key_alg: "ssh-ed25519".to_string(),
        };
        let mut client = registry
            .build("curve25519-sha256", &client_params)
            .unwrap();
        let mut server = registry
            .build("curve25519-sha256", &server_params)
            .unwrap();
        let (client_ctx, server_ctx) = contexts();

        let mut to_server = client.start(&client_ctx).unwrap();
        server.start(&server_ctx).unwrap();
        let (t, mut init) = to_server.remove(0);
        let mut to_client = match server.handle(t, &mut init, &server_ctx).unwrap() {
            KexProgress::Done(msgs, _) => msgs,
            _ => unreachable!(),
        };
        let (t, reply) = to_client.remove(0);

        // Re-sign the reply with a different key's signature bytes.
        let mut r = Message::from_bytes(reply.as_bytes().to_vec());
        let blob = r.get_string().unwrap();
        let server_public = r.get_string().unwrap();
        let _sig = r.get_string().unwrap();
        let imposter = Ed25519HostKey::generate().unwrap();
        let forged = imposter.sign(b"whatever").unwrap();
        let mut tampered = Message::new();
        tampered.add_string(&blob);
        tampered.add_string(&server_public);
        tampered.add_string(&forged);

        let r = client.handle(t, &mut tampered, &client_ctx);
        assert!(matches!(r, Err(SkiffError::Security(_))));
    }

    #[test]
    fn test_group14_rejects_degenerate_public() {
        let registry = KexRegistry::builtin();
        let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
        let params = KexParams {
            host_key: Some(host_key),
            host_key_alg: "ssh-ed25519".to_string(),
        };
        let mut server = registry
            .build("diffie-hellman-group14-sha256", &params)
            .unwrap();
        let (_, server_ctx) = contexts();
        server.start(&server_ctx).unwrap();

        for bad in [BigInt::from(0), BigInt::from(1), GROUP14_P.clone()] {
            let mut m = Message::new();
            m.add_mpint(&bad);
            let mut reader = Message::from_bytes(m.as_bytes().to_vec());
            let r = server.handle(MessageType::KexdhInit as u8, &mut reader, &server_ctx);
            assert!(matches!(r, Err(SkiffError::Security(_))), "accepted {}", bad);
        }
    }

    #[test]
    fn test_registry_unknown_name() {
        let registry = KexRegistry::builtin();
        let params = KexParams {
            host_key: None,
            host_key_alg: "ssh-ed25519".to_string(),
        };
        assert!(registry.build("kex-strange@nowhere", &params).is_err());
    }

    #[test]
    fn test_registry_custom_method() {
        let mut registry = KexRegistry::builtin();
        registry.register("curve25519-sha256@custom", |_| {
            Box::new(Curve25519Kex::new())
        });
        assert!(registry
            .names()
            .contains(&"curve25519-sha256@custom".to_string()));
        let params = KexParams {
            host_key: None,
            host_key_alg: "ssh-ed25519".to_string(),
        };
        assert!(registry.build("curve25519-sha256@custom", &params).is_ok());
    }
}
