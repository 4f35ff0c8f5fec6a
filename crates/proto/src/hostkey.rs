//! Server host keys and signature verification.
//!
//! The engine treats host keys as an opaque capability: something that
//! can name its algorithm, produce its public wire blob and sign the
//! exchange hash. Clients never hold a [`HostKey`]; they verify received
//! blobs with [`verify`] and make the trust decision through
//! [`crate::transport::TransportConfig`].

use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, KeyPair};
use skiff_platform::{SkiffError, SkiffResult};

use crate::message::Message;

/// A private host key the server can sign with.
pub trait HostKey: Send + Sync {
    /// The SSH algorithm name ("ssh-ed25519").
    fn name(&self) -> &'static str;

    /// The public key wire blob: `string name || key-specific fields`.
    fn public_blob(&self) -> Vec<u8>;

    /// Signs `data`, returning the SSH signature blob
    /// (`string name || string signature`).
    fn sign(&self, data: &[u8]) -> SkiffResult<Vec<u8>>;
}

/// An Ed25519 host key.
pub struct Ed25519HostKey {
    keypair: Ed25519KeyPair,
}

impl Ed25519HostKey {
    /// Generates a fresh key.
    pub fn generate() -> SkiffResult<Self> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| SkiffError::Security("Ed25519 key generation failed".to_string()))?;
        Self::from_pkcs8(pkcs8.as_ref())
    }

    /// Loads a key from PKCS#8 DER bytes.
    pub fn from_pkcs8(der: &[u8]) -> SkiffResult<Self> {
        let keypair = Ed25519KeyPair::from_pkcs8(der)
            .map_err(|_| SkiffError::Security("Invalid Ed25519 PKCS#8 key".to_string()))?;
        Ok(Self { keypair })
    }
}

impl HostKey for Ed25519HostKey {
    fn name(&self) -> &'static str {
        "ssh-ed25519"
    }

    fn public_blob(&self) -> Vec<u8> {
        let mut m = Message::new();
        m.add_str("ssh-ed25519");
        m.add_string(self.keypair.public_key().as_ref());
        m.into_bytes()
    }

    fn sign(&self, data: &[u8]) -> SkiffResult<Vec<u8>> {
        let sig = self.keypair.sign(data);
        let mut m = Message::new();
        m.add_str("ssh-ed25519");
        m.add_string(sig.as_ref());
        Ok(m.into_bytes())
    }
}

/// Verifies a signature blob against a public key blob.
///
/// Both blobs are in SSH wire form. `expected_alg` is the negotiated host
/// key algorithm; a blob naming anything else is rejected before any
/// crypto runs.
pub fn verify(
    expected_alg: &str,
    public_blob: &[u8],
    signature_blob: &[u8],
    data: &[u8],
) -> SkiffResult<()> {
    let mut key_msg = Message::from_bytes(public_blob.to_vec());
    let key_alg = key_msg.get_str()?;
    if key_alg != expected_alg {
        return Err(SkiffError::Security(format!(
            "Host key algorithm mismatch: negotiated {}, got {}",
            expected_alg, key_alg
        )));
    }

    let mut sig_msg = Message::from_bytes(signature_blob.to_vec());
    let sig_alg = sig_msg.get_str()?;
    if sig_alg != key_alg {
        return Err(SkiffError::Security(format!(
            "Signature algorithm {} does not match host key {}",
            sig_alg, key_alg
        )));
    }

    match key_alg.as_str() {
        "ssh-ed25519" => {
            let public = key_msg.get_string()?;
            let sig = sig_msg.get_string()?;
            let key = signature::UnparsedPublicKey::new(&signature::ED25519, &public);
            key.verify(data, &sig).map_err(|_| {
                SkiffError::Security("Host key signature verification failed".to_string())
            })
        }
        other => Err(SkiffError::Security(format!(
            "Unsupported host key algorithm '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = Ed25519HostKey::generate().unwrap();
        assert_eq!(key.name(), "ssh-ed25519");

        let data = b"exchange hash bytes";
        let sig = key.sign(data).unwrap();
        verify("ssh-ed25519", &key.public_blob(), &sig, data).unwrap();
    }

    #[test]
    fn test_verify_rejects_tampered_data() {
        let key = Ed25519HostKey::generate().unwrap();
        let sig = key.sign(b"original").unwrap();
        let r = verify("ssh-ed25519", &key.public_blob(), &sig, b"tampered");
        assert!(matches!(r, Err(SkiffError::Security(_))));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let signer = Ed25519HostKey::generate().unwrap();
        let other = Ed25519HostKey::generate().unwrap();
        let sig = signer.sign(b"data").unwrap();
        let r = verify("ssh-ed25519", &other.public_blob(), &sig, b"data");
        assert!(matches!(r, Err(SkiffError::Security(_))));
    }

    #[test]
    fn test_verify_rejects_algorithm_mismatch() {
        let key = Ed25519HostKey::generate().unwrap();
        let sig = key.sign(b"data").unwrap();
        let r = verify("ssh-rsa", &key.public_blob(), &sig, b"data");
        assert!(matches!(r, Err(SkiffError::Security(_))));
    }

    #[test]
    fn test_public_blob_shape() {
        let key = Ed25519HostKey::generate().unwrap();
        let mut m = Message::from_bytes(key.public_blob());
        assert_eq!(m.get_str().unwrap(), "ssh-ed25519");
        assert_eq!(m.get_string().unwrap().len(), 32);
        assert_eq!(m.remaining(), 0);
    }
}
