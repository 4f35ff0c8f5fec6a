//! SSH wire-primitive codec (RFC 4251 Section 5).
//!
//! A [`Message`] is a flat byte buffer with a read cursor. Writers append
//! typed fields; readers consume them in order. Every getter validates the
//! remaining length before touching the buffer, so a truncated or
//! malicious message surfaces as a [`SkiffError::Protocol`] instead of a
//! panic or an out-of-bounds read.
//!
//! Supported primitives: byte, boolean, uint32, uint64, string (length
//! prefixed bytes), mpint (two's-complement big-endian big integer, zero
//! encoded as the empty string) and name-list (comma-joined UTF-8 names).
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::message::Message;
//!
//! let mut m = Message::new();
//! m.add_u32(42);
//! m.add_string(b"session");
//!
//! let mut parsed = Message::from_bytes(m.as_bytes().to_vec());
//! assert_eq!(parsed.get_u32().unwrap(), 42);
//! assert_eq!(parsed.get_string().unwrap(), b"session");
//! ```

use bytes::{BufMut, BytesMut};
use num_bigint::{BigInt, Sign};
use skiff_platform::{SkiffError, SkiffResult};

/// A message buffer with a read cursor.
///
/// The same type serves both encode and decode paths: outbound messages
/// are built field by field, inbound payloads are wrapped with
/// [`Message::from_bytes`] and drained with the `get_*` methods.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    buf: BytesMut,
    cursor: usize,
}

impl Message {
    /// Creates an empty message.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            cursor: 0,
        }
    }

    /// Wraps received payload bytes for reading. The cursor starts at 0.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            buf: BytesMut::from(&data[..]),
            cursor: 0,
        }
    }

    /// Returns the full underlying buffer (ignores the cursor).
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the message, returning the underlying buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    /// Bytes remaining after the cursor.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    fn take(&mut self, n: usize, what: &str) -> SkiffResult<&[u8]> {
        if self.remaining() < n {
            return Err(SkiffError::Protocol(format!(
                "Message truncated reading {}: need {} bytes, have {}",
                what,
                n,
                self.remaining()
            )));
        }
        let start = self.cursor;
        self.cursor += n;
        Ok(&self.buf[start..start + n])
    }

    // --- writers ---

    /// Appends a single byte.
    pub fn add_byte(&mut self, b: u8) -> &mut Self {
        self.buf.put_u8(b);
        self
    }

    /// Appends raw bytes with no length prefix.
    pub fn add_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self
    }

    /// Appends a boolean (one byte, 0 or 1).
    pub fn add_boolean(&mut self, v: bool) -> &mut Self {
        self.buf.put_u8(u8::from(v));
        self
    }

    /// Appends a big-endian uint32.
    pub fn add_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    /// Appends a big-endian uint64.
    pub fn add_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64(v);
        self
    }

    /// Appends a length-prefixed byte string.
    pub fn add_string(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_u32(data.len() as u32);
        self.buf.put_slice(data);
        self
    }

    /// Appends a UTF-8 string as a length-prefixed byte string.
    pub fn add_str(&mut self, s: &str) -> &mut Self {
        self.add_string(s.as_bytes())
    }

    /// Appends a multi-precision integer.
    ///
    /// Two's-complement big-endian with a length prefix; zero is the empty
    /// string (RFC 4251 Section 5).
    pub fn add_mpint(&mut self, v: &BigInt) -> &mut Self {
        if v.sign() == Sign::NoSign {
            self.buf.put_u32(0);
            return self;
        }
        let bytes = v.to_signed_bytes_be();
        self.add_string(&bytes)
    }

    /// Appends a name-list: comma-joined names in one length-prefixed
    /// string.
    pub fn add_list(&mut self, names: &[String]) -> &mut Self {
        self.add_string(names.join(",").as_bytes())
    }

    // --- readers ---

    /// Reads a single byte.
    pub fn get_byte(&mut self) -> SkiffResult<u8> {
        Ok(self.take(1, "byte")?[0])
    }

    /// Reads `n` raw bytes.
    pub fn get_bytes(&mut self, n: usize) -> SkiffResult<Vec<u8>> {
        Ok(self.take(n, "bytes")?.to_vec())
    }

    /// Reads a boolean. Any non-zero byte is true.
    pub fn get_boolean(&mut self) -> SkiffResult<bool> {
        Ok(self.take(1, "boolean")?[0] != 0)
    }

    /// Reads a big-endian uint32.
    pub fn get_u32(&mut self) -> SkiffResult<u32> {
        let b = self.take(4, "uint32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian uint64.
    pub fn get_u64(&mut self) -> SkiffResult<u64> {
        let b = self.take(8, "uint64")?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Reads a length-prefixed byte string.
    ///
    /// Fails if the declared length overruns the remaining buffer.
    pub fn get_string(&mut self) -> SkiffResult<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len, "string body")?.to_vec())
    }

    /// Reads a length-prefixed string and validates it as UTF-8.
    pub fn get_str(&mut self) -> SkiffResult<String> {
        let bytes = self.get_string()?;
        String::from_utf8(bytes)
            .map_err(|_| SkiffError::Protocol("String field contains invalid UTF-8".to_string()))
    }

    /// Reads a multi-precision integer.
    pub fn get_mpint(&mut self) -> SkiffResult<BigInt> {
        let bytes = self.get_string()?;
        if bytes.is_empty() {
            return Ok(BigInt::from(0));
        }
        Ok(BigInt::from_signed_bytes_be(&bytes))
    }

    /// Reads a name-list into a vector of names.
    ///
    /// The empty list is the empty string; no empty names are produced.
    pub fn get_list(&mut self) -> SkiffResult<Vec<String>> {
        let s = self.get_str()?;
        if s.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(s.split(',').map(String::from).collect())
        }
    }

    /// Returns whatever follows the cursor without consuming it.
    pub fn peek_rest(&self) -> &[u8] {
        &self.buf[self.cursor..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_scalars() {
        let mut m = Message::new();
        m.add_byte(0x5a);
        m.add_boolean(true);
        m.add_boolean(false);
        m.add_u32(0xdead_beef);
        m.add_u64(0x0123_4567_89ab_cdef);

        let mut r = Message::from_bytes(m.into_bytes());
        assert_eq!(r.get_byte().unwrap(), 0x5a);
        assert!(r.get_boolean().unwrap());
        assert!(!r.get_boolean().unwrap());
        assert_eq!(r.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.get_u64().unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_round_trip_strings() {
        let mut m = Message::new();
        m.add_string(b"");
        m.add_string(b"ssh-userauth");
        m.add_str("direct-tcpip");

        let mut r = Message::from_bytes(m.into_bytes());
        assert_eq!(r.get_string().unwrap(), b"");
        assert_eq!(r.get_str().unwrap(), "ssh-userauth");
        assert_eq!(r.get_string().unwrap(), b"direct-tcpip");
    }

    #[test]
    fn test_round_trip_mpint() {
        let values = [
            BigInt::from(0),
            BigInt::from(1),
            BigInt::from(-1),
            BigInt::from(0x80u32),
            BigInt::from(-0x80i32),
            BigInt::parse_bytes(b"123456789012345678901234567890", 10).unwrap(),
            -BigInt::parse_bytes(b"123456789012345678901234567890", 10).unwrap(),
        ];
        for v in &values {
            let mut m = Message::new();
            m.add_mpint(v);
            let mut r = Message::from_bytes(m.into_bytes());
            assert_eq!(&r.get_mpint().unwrap(), v, "mpint round trip for {}", v);
        }
    }

    #[test]
    fn test_mpint_zero_is_empty_string() {
        let mut m = Message::new();
        m.add_mpint(&BigInt::from(0));
        assert_eq!(m.as_bytes(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_mpint_high_bit_padding() {
        // 0x80 must carry a leading zero byte to stay positive.
        let mut m = Message::new();
        m.add_mpint(&BigInt::from(0x80u32));
        assert_eq!(m.as_bytes(), &[0, 0, 0, 2, 0x00, 0x80]);
    }

    #[test]
    fn test_round_trip_list() {
        let names = vec![
            "aes128-ctr".to_string(),
            "aes256-ctr".to_string(),
            "none".to_string(),
        ];
        let mut m = Message::new();
        m.add_list(&names);
        let mut r = Message::from_bytes(m.into_bytes());
        assert_eq!(r.get_list().unwrap(), names);
    }

    #[test]
    fn test_empty_list() {
        let mut m = Message::new();
        m.add_list(&[]);
        let mut r = Message::from_bytes(m.into_bytes());
        assert!(r.get_list().unwrap().is_empty());
    }

    #[test]
    fn test_truncated_u32() {
        let mut r = Message::from_bytes(vec![0, 0, 1]);
        assert!(matches!(r.get_u32(), Err(SkiffError::Protocol(_))));
    }

    #[test]
    fn test_string_length_overrun() {
        // Declares 100 bytes but supplies 2.
        let mut r = Message::from_bytes(vec![0, 0, 0, 100, 0x41, 0x42]);
        assert!(matches!(r.get_string(), Err(SkiffError::Protocol(_))));
        // The failed read must not have consumed the body bytes.
        assert_eq!(r.remaining(), 2);
    }

    #[test]
    fn test_exhausted_buffer() {
        let mut r = Message::from_bytes(vec![]);
        assert!(r.get_byte().is_err());
        assert!(r.get_boolean().is_err());
        assert!(r.get_string().is_err());
        assert!(r.get_mpint().is_err());
        assert!(r.get_list().is_err());
    }

    #[test]
    fn test_invalid_utf8_list() {
        let mut m = Message::new();
        m.add_string(&[0xff, 0xfe]);
        let mut r = Message::from_bytes(m.into_bytes());
        assert!(matches!(r.get_list(), Err(SkiffError::Protocol(_))));
    }
}
