//! Binary packet protocol framing (RFC 4253 Section 6).
//!
//! [`PacketReader`] and [`PacketWriter`] each own one half of the stream
//! plus that direction's cipher, MAC, compression and sequence state. The
//! split lets the dispatch loop read while callers write.
//!
//! Wire layout of one packet:
//!
//! ```text
//! uint32    packet_length          (excludes itself and the MAC)
//! byte      padding_length         (at least 4)
//! byte[n]   payload                (possibly compressed)
//! byte[m]   random padding
//! byte[k]   MAC over seq || plaintext packet
//! ```
//!
//! The total length before the MAC is a multiple of max(block size, 8).
//! With a classic cipher the whole packet, length field included, is
//! encrypted. Sequence numbers start at zero, increment per packet in each
//! direction independently, wrap modulo 2^32 and are never reset, not even
//! by rekeying.

use bytes::{BufMut, BytesMut};
use rand::RngCore;
use skiff_platform::{SkiffError, SkiffResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::cipher::{Compressor, Decompressor, MacKey, PacketCipher};
use crate::message::Message;
use crate::version::MAX_BANNER_LENGTH;

/// Hard upper bound on a single packet's declared length.
pub const MAX_PACKET_LENGTH: u32 = 35_000;

/// Rekey after this many bytes in one direction.
pub const REKEY_BYTES: u64 = 512 * 1024 * 1024;

/// Rekey after this many packets in one direction.
pub const REKEY_PACKETS: u64 = 1 << 29;

/// Minimum packet alignment when no cipher is active.
const MIN_BLOCK_SIZE: usize = 8;

/// Lines tolerated before the peer's identification banner.
const MAX_PRE_BANNER_LINES: usize = 50;

/// What a single read produced.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A decoded message: type byte plus the rest of the payload.
    Msg(u8, Message),
    /// This direction crossed a rekey threshold. Reported once per
    /// keying period; the caller should initiate key exchange and call
    /// read again.
    NeedRekey,
}

/// Shared per-direction transform state.
struct DirectionState {
    cipher: Option<Box<dyn PacketCipher>>,
    mac: Option<MacKey>,
    block_size: usize,
    seq: u32,
    bytes_since_rekey: u64,
    packets_since_rekey: u64,
}

impl DirectionState {
    fn new() -> Self {
        Self {
            cipher: None,
            mac: None,
            block_size: MIN_BLOCK_SIZE,
            seq: 0,
            bytes_since_rekey: 0,
            packets_since_rekey: 0,
        }
    }

    fn account(&mut self, wire_len: usize) {
        self.seq = self.seq.wrapping_add(1);
        self.bytes_since_rekey += wire_len as u64;
        self.packets_since_rekey += 1;
    }

    fn over_threshold(&self) -> bool {
        self.bytes_since_rekey >= REKEY_BYTES || self.packets_since_rekey >= REKEY_PACKETS
    }

    fn rekeyed(&mut self) {
        self.bytes_since_rekey = 0;
        self.packets_since_rekey = 0;
    }
}

/// A packet whose first block has been read and decrypted while the
/// remainder is still in flight. Kept in the reader so a cancelled
/// `read_message` call resumes where it left off.
struct PendingPacket {
    head: Vec<u8>,
    total: usize,
}

/// The inbound half of the packetizer.
pub struct PacketReader {
    stream: Box<dyn AsyncRead + Send + Sync + Unpin>,
    state: DirectionState,
    decompressor: Option<Box<dyn Decompressor>>,
    rekey_reported: bool,
    last_seq: u32,
    buf: BytesMut,
    pending: Option<PendingPacket>,
}

impl PacketReader {
    /// Wraps the read half of a stream. No cipher is active until the
    /// first NEWKEYS.
    pub fn new(stream: Box<dyn AsyncRead + Send + Sync + Unpin>) -> Self {
        Self {
            stream,
            state: DirectionState::new(),
            decompressor: None,
            rekey_reported: false,
            last_seq: 0,
            buf: BytesMut::with_capacity(4096),
            pending: None,
        }
    }

    /// Activates newly derived inbound keys. Resets the rekey counters
    /// but never the sequence number.
    pub fn set_inbound_keys(
        &mut self,
        cipher: Box<dyn PacketCipher>,
        block_size: usize,
        mac: MacKey,
        decompressor: Option<Box<dyn Decompressor>>,
    ) {
        self.state.cipher = Some(cipher);
        self.state.block_size = block_size.max(MIN_BLOCK_SIZE);
        self.state.mac = Some(mac);
        self.decompressor = decompressor;
        self.state.rekeyed();
        self.rekey_reported = false;
        debug!(block_size, "inbound keys activated");
    }

    /// Sequence number of the most recently read packet. Used for
    /// UNIMPLEMENTED replies.
    pub fn last_seq(&self) -> u32 {
        self.last_seq
    }

    /// Reads the peer's identification banner, skipping any preamble
    /// lines a server may print before it.
    pub async fn read_banner_line(&mut self) -> SkiffResult<String> {
        for _ in 0..MAX_PRE_BANNER_LINES {
            let line = self.read_line().await?;
            if line.starts_with("SSH-") {
                return Ok(line);
            }
            trace!(line = %line, "skipping pre-banner line");
        }
        Err(SkiffError::Protocol(
            "No SSH identification banner received".to_string(),
        ))
    }

    async fn read_line(&mut self) -> SkiffResult<String> {
        let mut line = Vec::with_capacity(64);
        loop {
            let byte = self.stream.read_u8().await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    SkiffError::Protocol("Connection closed during banner exchange".to_string())
                } else {
                    SkiffError::Io(e)
                }
            })?;
            if byte == b'\n' {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return String::from_utf8(line).map_err(|_| {
                    SkiffError::Protocol("Banner line is not valid UTF-8".to_string())
                });
            }
            if line.len() >= MAX_BANNER_LENGTH * 4 {
                return Err(SkiffError::Protocol("Banner line too long".to_string()));
            }
            line.push(byte);
        }
    }

    /// Fills the raw buffer to at least `n` bytes. Cancel safe: data
    /// already buffered stays buffered.
    async fn fill(&mut self, n: usize) -> SkiffResult<()> {
        while self.buf.len() < n {
            let read = self.stream.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(SkiffError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-packet",
                )));
            }
        }
        Ok(())
    }

    /// Reads and decodes one packet, or reports a pending rekey.
    ///
    /// Cancel safe: the dispatch loop polls this inside a `select!`, so
    /// partially read frames are parked in the reader and the next call
    /// resumes them.
    ///
    /// # Errors
    ///
    /// [`SkiffError::Protocol`] on malformed framing, [`SkiffError::Security`]
    /// on MAC failure, [`SkiffError::Io`] when the stream dies.
    pub async fn read_message(&mut self) -> SkiffResult<ReadOutcome> {
        if self.state.over_threshold() && !self.rekey_reported {
            self.rekey_reported = true;
            debug!(
                bytes = self.state.bytes_since_rekey,
                packets = self.state.packets_since_rekey,
                "inbound rekey threshold crossed"
            );
            return Ok(ReadOutcome::NeedRekey);
        }

        let block = self.state.block_size;
        if self.pending.is_none() {
            self.fill(block).await?;
            let mut head = self.buf.split_to(block).to_vec();
            if let Some(cipher) = &mut self.state.cipher {
                cipher.decrypt(&mut head);
            }
            let packet_length = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
            if packet_length < 5 || packet_length > MAX_PACKET_LENGTH {
                return Err(SkiffError::Protocol(format!(
                    "Invalid packet length {}",
                    packet_length
                )));
            }
            let total = packet_length as usize + 4;
            if total % block != 0 {
                return Err(SkiffError::Protocol(format!(
                    "Packet length {} not aligned to cipher block size {}",
                    packet_length, block
                )));
            }
            self.pending = Some(PendingPacket { head, total });
        }

        let total = match &self.pending {
            Some(p) => p.total,
            None => return Err(SkiffError::Protocol("Packet reader desynchronized".to_string())),
        };
        let mac_len = self
            .state
            .mac
            .as_ref()
            .map(|m| m.algorithm().mac_size())
            .unwrap_or(0);
        self.fill(total - block + mac_len).await?;

        let mut packet = match self.pending.take() {
            Some(p) => p.head,
            None => return Err(SkiffError::Protocol("Packet reader desynchronized".to_string())),
        };
        let packet_length = total as u32 - 4;
        packet.extend_from_slice(&self.buf.split_to(total - block));
        if let Some(cipher) = &mut self.state.cipher {
            cipher.decrypt(&mut packet[block..]);
        }

        let tag = self.buf.split_to(mac_len);
        if let Some(mac) = &self.state.mac {
            mac.verify(self.state.seq, &packet, &tag)?;
        }

        let padding_length = packet[4] as usize;
        if padding_length < 4 || padding_length + 1 > packet_length as usize {
            return Err(SkiffError::Protocol(format!(
                "Invalid padding length {}",
                padding_length
            )));
        }
        let payload_end = total - padding_length;
        let payload = &packet[5..payload_end];

        let payload = match &mut self.decompressor {
            Some(d) => d.decompress(payload)?,
            None => payload.to_vec(),
        };
        if payload.is_empty() {
            return Err(SkiffError::Protocol("Empty packet payload".to_string()));
        }

        self.last_seq = self.state.seq;
        self.state.account(total + mac_len);

        let msg_type = payload[0];
        trace!(msg_type, seq = self.last_seq, len = payload.len(), "packet in");
        Ok(ReadOutcome::Msg(
            msg_type,
            Message::from_bytes(payload[1..].to_vec()),
        ))
    }
}

/// The outbound half of the packetizer.
pub struct PacketWriter {
    stream: Box<dyn AsyncWrite + Send + Sync + Unpin>,
    state: DirectionState,
    compressor: Option<Box<dyn Compressor>>,
}

impl PacketWriter {
    /// Wraps the write half of a stream.
    pub fn new(stream: Box<dyn AsyncWrite + Send + Sync + Unpin>) -> Self {
        Self {
            stream,
            state: DirectionState::new(),
            compressor: None,
        }
    }

    /// Activates newly derived outbound keys.
    pub fn set_outbound_keys(
        &mut self,
        cipher: Box<dyn PacketCipher>,
        block_size: usize,
        mac: MacKey,
        compressor: Option<Box<dyn Compressor>>,
    ) {
        self.state.cipher = Some(cipher);
        self.state.block_size = block_size.max(MIN_BLOCK_SIZE);
        self.state.mac = Some(mac);
        self.compressor = compressor;
        self.state.rekeyed();
        debug!(block_size, "outbound keys activated");
    }

    /// Whether this direction has crossed a rekey threshold.
    pub fn needs_rekey(&self) -> bool {
        self.state.over_threshold()
    }

    /// Writes the local identification banner.
    pub async fn write_banner(&mut self, banner: &[u8]) -> SkiffResult<()> {
        self.stream.write_all(banner).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Frames, MACs, encrypts and writes one message.
    pub async fn send_message(&mut self, msg_type: u8, msg: &Message) -> SkiffResult<()> {
        let mut payload = Vec::with_capacity(msg.as_bytes().len() + 1);
        payload.push(msg_type);
        payload.extend_from_slice(msg.as_bytes());
        let payload = match &mut self.compressor {
            Some(c) => c.compress(&payload)?,
            None => payload,
        };

        let block = self.state.block_size;
        let mut padding_length = block - ((payload.len() + 5) % block);
        if padding_length < 4 {
            padding_length += block;
        }
        let mut padding = vec![0u8; padding_length];
        rand::thread_rng().fill_bytes(&mut padding);

        let packet_length = (payload.len() + padding_length + 1) as u32;
        let mut packet = BytesMut::with_capacity(packet_length as usize + 4);
        packet.put_u32(packet_length);
        packet.put_u8(padding_length as u8);
        packet.put_slice(&payload);
        packet.put_slice(&padding);
        let mut packet = packet.to_vec();

        let tag = self
            .state
            .mac
            .as_ref()
            .map(|mac| mac.compute(self.state.seq, &packet));

        if let Some(cipher) = &mut self.state.cipher {
            cipher.encrypt(&mut packet);
        }

        trace!(msg_type, seq = self.state.seq, len = packet.len(), "packet out");
        self.stream.write_all(&packet).await?;
        if let Some(tag) = &tag {
            self.stream.write_all(tag).await?;
        }
        self.stream.flush().await?;

        let mac_len = tag.as_ref().map(Vec::len).unwrap_or(0);
        self.state.account(packet.len() + mac_len);
        Ok(())
    }

    /// Shuts the write half down, signalling EOF to the peer.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
