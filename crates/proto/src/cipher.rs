//! Packet cryptography: ciphers, MACs and compressors.
//!
//! The packetizer does not know any algorithm math; it looks a negotiated
//! name up here and gets back sizes plus a boxed primitive. Adding an
//! algorithm means adding a name to these tables.
//!
//! Supported today:
//! - ciphers: `aes128-ctr`, `aes256-ctr` (plus the implicit `none` stage
//!   before the first NEWKEYS)
//! - MACs: `hmac-sha2-256`, `hmac-sha2-512`
//! - compression: `none`, `zlib`

use aes::{Aes128, Aes256};
use cipher::{KeyIvInit, StreamCipher};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use skiff_platform::{SkiffError, SkiffResult};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Static parameters of a packet cipher, keyed by negotiated name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSpec {
    /// The SSH algorithm name.
    pub name: &'static str,
    /// Key length in bytes.
    pub key_size: usize,
    /// Cipher block size in bytes (drives packet padding alignment).
    pub block_size: usize,
    /// IV length in bytes.
    pub iv_size: usize,
}

impl CipherSpec {
    /// Looks a cipher up by its negotiated name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aes128-ctr" => Some(Self {
                name: "aes128-ctr",
                key_size: 16,
                block_size: 16,
                iv_size: 16,
            }),
            "aes256-ctr" => Some(Self {
                name: "aes256-ctr",
                key_size: 32,
                block_size: 16,
                iv_size: 16,
            }),
            _ => None,
        }
    }

    /// Instantiates the cipher with derived key material.
    ///
    /// # Errors
    ///
    /// [`SkiffError::Security`] when key or IV material is too short.
    pub fn instantiate(&self, key: &[u8], iv: &[u8]) -> SkiffResult<Box<dyn PacketCipher>> {
        if key.len() < self.key_size || iv.len() < self.iv_size {
            return Err(SkiffError::Security(format!(
                "Insufficient key material for {}: need {}+{} bytes, got {}+{}",
                self.name,
                self.key_size,
                self.iv_size,
                key.len(),
                iv.len()
            )));
        }
        let cipher: Box<dyn PacketCipher> = match self.name {
            "aes128-ctr" => Box::new(CtrCipher {
                inner: Aes128Ctr::new_from_slices(&key[..16], &iv[..16])
                    .map_err(|_| SkiffError::Security("Bad AES-128-CTR key/IV".to_string()))?,
            }),
            "aes256-ctr" => Box::new(CtrCipher {
                inner: Aes256Ctr::new_from_slices(&key[..32], &iv[..16])
                    .map_err(|_| SkiffError::Security("Bad AES-256-CTR key/IV".to_string()))?,
            }),
            other => {
                return Err(SkiffError::Config(format!(
                    "Cipher '{}' has a spec but no implementation",
                    other
                )))
            }
        };
        Ok(cipher)
    }
}

/// One direction's packet cipher state.
///
/// Implementations are stateful stream transformations; the packetizer
/// feeds whole packets (length field included) through them in wire
/// order.
pub trait PacketCipher: Send + Sync {
    /// Encrypts in place.
    fn encrypt(&mut self, data: &mut [u8]);
    /// Decrypts in place.
    fn decrypt(&mut self, data: &mut [u8]);
}

struct CtrCipher<C: StreamCipher + Send + Sync> {
    inner: C,
}

impl<C: StreamCipher + Send + Sync> PacketCipher for CtrCipher<C> {
    fn encrypt(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }

    fn decrypt(&mut self, data: &mut [u8]) {
        // CTR is symmetric.
        self.inner.apply_keystream(data);
    }
}

/// MAC algorithm for non-AEAD ciphers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA-256.
    HmacSha256,
    /// HMAC-SHA-512.
    HmacSha512,
}

impl MacAlgorithm {
    /// The SSH algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Key length in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }

    /// Tag length in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }

    /// Looks a MAC up by its negotiated name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            _ => None,
        }
    }
}

/// Keyed MAC state for one direction.
///
/// The tag covers `uint32 sequence_number || plaintext packet`; the
/// packetizer owns the sequence number and passes it explicitly, since
/// packets sent before MAC activation still consume sequence numbers.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a MAC key from derived key material.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> SkiffResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(SkiffError::Security(format!(
                "Insufficient MAC key material: need {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }
        Ok(Self {
            algorithm,
            key: key_material[..algorithm.key_size()].to_vec(),
        })
    }

    /// Computes the tag over `seq || packet`.
    pub fn compute(&self, seq: u32, packet: &[u8]) -> Vec<u8> {
        match self.algorithm {
            MacAlgorithm::HmacSha256 => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(&self.key).expect("HMAC accepts any key size");
                mac.update(&seq.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha512 => {
                let mut mac =
                    Hmac::<Sha512>::new_from_slice(&self.key).expect("HMAC accepts any key size");
                mac.update(&seq.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Verifies a received tag in constant time.
    pub fn verify(&self, seq: u32, packet: &[u8], received: &[u8]) -> SkiffResult<()> {
        let computed = self.compute(seq, packet);
        if computed.len() == received.len() && bool::from(computed.ct_eq(received)) {
            Ok(())
        } else {
            Err(SkiffError::Security("MAC verification failed".to_string()))
        }
    }

    /// The algorithm behind this key.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Outbound compression state for one direction.
pub trait Compressor: Send + Sync {
    /// Compresses one packet payload, flushing so the peer can decode it
    /// without waiting for more input.
    fn compress(&mut self, data: &[u8]) -> SkiffResult<Vec<u8>>;
}

/// Inbound decompression state for one direction.
pub trait Decompressor: Send + Sync {
    /// Decompresses one packet payload.
    fn decompress(&mut self, data: &[u8]) -> SkiffResult<Vec<u8>>;
}

/// Whether a negotiated compression name is known.
pub fn compression_known(name: &str) -> bool {
    matches!(name, "none" | "zlib")
}

/// Builds the outbound compressor for a negotiated name, or `None` for
/// `"none"`.
pub fn make_compressor(name: &str) -> SkiffResult<Option<Box<dyn Compressor>>> {
    match name {
        "none" => Ok(None),
        "zlib" => Ok(Some(Box::new(ZlibCompressor {
            z: Compress::new(Compression::default(), true),
        }))),
        other => Err(SkiffError::Config(format!(
            "Unknown compression algorithm '{}'",
            other
        ))),
    }
}

/// Builds the inbound decompressor for a negotiated name, or `None` for
/// `"none"`.
pub fn make_decompressor(name: &str) -> SkiffResult<Option<Box<dyn Decompressor>>> {
    match name {
        "none" => Ok(None),
        "zlib" => Ok(Some(Box::new(ZlibDecompressor {
            z: Decompress::new(true),
        }))),
        other => Err(SkiffError::Config(format!(
            "Unknown compression algorithm '{}'",
            other
        ))),
    }
}

/// zlib packet compressor: one continuous stream across the session,
/// sync-flushed at every packet boundary (RFC 4253 Section 6.2).
struct ZlibCompressor {
    z: Compress,
}

impl Compressor for ZlibCompressor {
    fn compress(&mut self, data: &[u8]) -> SkiffResult<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        let mut consumed = 0usize;
        loop {
            out.reserve(4096);
            let before = self.z.total_in();
            self.z
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| SkiffError::Protocol(format!("zlib compress failed: {}", e)))?;
            consumed += (self.z.total_in() - before) as usize;
            // Done once all input is in and the flush left spare room.
            if consumed >= data.len() && out.len() < out.capacity() {
                return Ok(out);
            }
        }
    }
}

/// zlib packet decompressor, the continuous-stream counterpart.
struct ZlibDecompressor {
    z: Decompress,
}

impl Decompressor for ZlibDecompressor {
    fn decompress(&mut self, data: &[u8]) -> SkiffResult<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() * 2 + 64);
        let mut consumed = 0usize;
        loop {
            out.reserve(4096);
            let before = self.z.total_in();
            let status = self
                .z
                .decompress_vec(&data[consumed..], &mut out, FlushDecompress::None)
                .map_err(|e| SkiffError::Protocol(format!("zlib decompress failed: {}", e)))?;
            consumed += (self.z.total_in() - before) as usize;
            if status == Status::StreamEnd {
                return Err(SkiffError::Protocol(
                    "Peer terminated the zlib compression stream mid-session".to_string(),
                ));
            }
            if consumed >= data.len() && out.len() < out.capacity() {
                return Ok(out);
            }
        }
    }
}
