//! Multiplexed channels and the channel table.
//!
//! Channel state lives in a slot arena owned by the transport; the wire
//! channel id is the slot index. Each slot carries a generation counter
//! that bumps on teardown, so a stale [`ChannelHandle`] held across a
//! close can never touch a recycled slot. Indices are reused smallest
//! first, matching what most servers expect.
//!
//! The caller-facing [`Channel`] is a thin wrapper: reads drain an event
//! queue fed by the dispatch loop, writes go through the transport where
//! window accounting happens.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Notify};
use skiff_platform::{SkiffError, SkiffResult};

use crate::message::Message;
use crate::transport::Transport;

/// Smallest window a peer may shrink us to.
pub const MIN_WINDOW_SIZE: u32 = 32 * 1024;

/// Default initial window advertised for new channels.
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Smallest accepted maximum packet size.
pub const MIN_PACKET_SIZE: u32 = 4 * 1024;

/// Default (and largest advertised) maximum packet size.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 32 * 1024;

/// Clamps a configured window size into the accepted range.
pub fn clamp_window(size: u32) -> u32 {
    size.max(MIN_WINDOW_SIZE)
}

/// Clamps a configured maximum packet size into the accepted range.
pub fn clamp_packet(size: u32) -> u32 {
    size.clamp(MIN_PACKET_SIZE, DEFAULT_MAX_PACKET_SIZE)
}

/// A stable reference to a channel slot.
///
/// Valid only for the generation it was issued with; after the slot is
/// torn down and reused, old handles fail lookups instead of aliasing
/// the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    /// Slot index, doubling as the local wire channel id.
    pub index: u32,
    /// Slot generation at issue time.
    pub generation: u32,
}

/// Events the dispatch loop delivers to a channel's owner.
#[derive(Debug)]
pub enum ChannelEvent {
    /// Ordinary payload data.
    Data(Vec<u8>),
    /// Extended data, usually stderr (code 1).
    ExtendedData {
        /// The extended data type code.
        code: u32,
        /// The payload.
        data: Vec<u8>,
    },
    /// The peer will send no more data.
    Eof,
    /// The channel is gone.
    Closed,
    /// A channel request arrived (exec, shell, pty-req, ...). Any
    /// required reply has already been sent by the dispatch loop.
    Request {
        /// The request type.
        kind: String,
        /// Whether the peer asked for a reply.
        want_reply: bool,
        /// The request-specific payload.
        data: Vec<u8>,
    },
}

/// Per-channel protocol state, owned by the transport.
pub struct ChannelEntry {
    /// Channel type ("session", "direct-tcpip", ...).
    pub kind: String,
    /// The peer's id for this channel.
    pub remote_id: u32,
    /// Credit we have granted the peer.
    pub local_window: u64,
    /// The window we advertised at open, for replenish decisions.
    pub initial_local_window: u32,
    /// Largest packet we accept.
    pub local_max_packet: u32,
    /// Credit the peer has granted us.
    pub remote_window: u64,
    /// Largest packet the peer accepts.
    pub remote_max_packet: u32,
    /// Peer sent EOF.
    pub eof_received: bool,
    /// We sent EOF.
    pub eof_sent: bool,
    /// We sent CLOSE.
    pub close_sent: bool,
    /// Peer sent CLOSE.
    pub close_received: bool,
    /// Delivery queue to the channel's owner.
    pub events: mpsc::UnboundedSender<ChannelEvent>,
    /// Woken when `remote_window` grows or the channel dies.
    pub window_notify: Arc<Notify>,
    /// Reply waiters for in-flight channel requests, in send order.
    pub pending_replies: VecDeque<oneshot::Sender<bool>>,
}

impl ChannelEntry {
    /// A fresh entry with our side's advertised limits.
    pub fn new(
        kind: String,
        remote_id: u32,
        local_window: u32,
        local_max_packet: u32,
        remote_window: u32,
        remote_max_packet: u32,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            kind,
            remote_id,
            local_window: u64::from(local_window),
            initial_local_window: local_window,
            local_max_packet,
            remote_window: u64::from(remote_window),
            remote_max_packet,
            eof_received: false,
            eof_sent: false,
            close_sent: false,
            close_received: false,
            events,
            window_notify: Arc::new(Notify::new()),
            pending_replies: VecDeque::new(),
        }
    }

    /// Whether both sides have agreed the channel is finished.
    pub fn fully_closed(&self) -> bool {
        self.close_sent && self.close_received
    }
}

struct Slot {
    generation: u32,
    entry: Option<ChannelEntry>,
}

/// The slot arena holding all live channels of one transport.
#[derive(Default)]
pub struct ChannelTable {
    slots: Vec<Slot>,
}

impl ChannelTable {
    /// An empty table.
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Inserts an entry into the smallest free slot and returns its
    /// handle. The handle's index is the local wire channel id.
    pub fn alloc(&mut self, entry: ChannelEntry) -> ChannelHandle {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.entry.is_none() {
                slot.entry = Some(entry);
                return ChannelHandle {
                    index: i as u32,
                    generation: slot.generation,
                };
            }
        }
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        ChannelHandle {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    fn slot(&self, handle: ChannelHandle) -> Option<&Slot> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
    }

    /// Looks a live entry up by handle; stale generations miss.
    pub fn get(&self, handle: ChannelHandle) -> Option<&ChannelEntry> {
        self.slot(handle).and_then(|s| s.entry.as_ref())
    }

    /// Mutable lookup by handle.
    pub fn get_mut(&mut self, handle: ChannelHandle) -> Option<&mut ChannelEntry> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.entry.as_mut())
    }

    /// Looks a live entry up by wire id, as the dispatch loop does for
    /// incoming packets. Returns the current handle too.
    pub fn get_by_id_mut(&mut self, id: u32) -> Option<(ChannelHandle, &mut ChannelEntry)> {
        let slot = self.slots.get_mut(id as usize)?;
        let generation = slot.generation;
        slot.entry.as_mut().map(|e| {
            (
                ChannelHandle {
                    index: id,
                    generation,
                },
                e,
            )
        })
    }

    /// Unlinks a channel, bumping the slot generation so every existing
    /// handle to it goes stale.
    pub fn remove(&mut self, handle: ChannelHandle) -> Option<ChannelEntry> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(entry)
    }

    /// Handles of every live channel.
    pub fn handles(&self) -> Vec<ChannelHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.entry.is_some())
            .map(|(i, s)| ChannelHandle {
                index: i as u32,
                generation: s.generation,
            })
            .collect()
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    /// Whether no channels are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A caller-owned channel.
///
/// Reading drains the event queue fed by the dispatch loop; writing and
/// control operations go back through the transport.
pub struct Channel {
    transport: Transport,
    handle: ChannelHandle,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    pending: Vec<u8>,
    eof_seen: bool,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("index", &self.handle.index)
            .field("generation", &self.handle.generation)
            .field("eof_seen", &self.eof_seen)
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub(crate) fn new(
        transport: Transport,
        handle: ChannelHandle,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        Self {
            transport,
            handle,
            events,
            pending: Vec::new(),
            eof_seen: false,
        }
    }

    /// This channel's handle.
    pub fn handle(&self) -> ChannelHandle {
        self.handle
    }

    /// Reads the next chunk of ordinary data. Returns an empty vector
    /// once the peer has sent EOF or closed the channel.
    pub async fn read(&mut self) -> SkiffResult<Vec<u8>> {
        if !self.pending.is_empty() {
            return Ok(std::mem::take(&mut self.pending));
        }
        if self.eof_seen {
            return Ok(Vec::new());
        }
        loop {
            match self.events.recv().await {
                Some(ChannelEvent::Data(data)) => return Ok(data),
                Some(ChannelEvent::ExtendedData { .. }) => continue,
                Some(ChannelEvent::Request { .. }) => continue,
                Some(ChannelEvent::Eof) | Some(ChannelEvent::Closed) | None => {
                    self.eof_seen = true;
                    return Ok(Vec::new());
                }
            }
        }
    }

    /// Returns the next raw event, including extended data and incoming
    /// requests. `None` once the queue is closed.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Writes all of `data`, chunking to the peer's window and packet
    /// limits and waiting for window credit as needed.
    pub async fn write_all(&mut self, data: &[u8]) -> SkiffResult<()> {
        self.transport.channel_write_all(self.handle, data).await
    }

    /// Signals that we will send no more data.
    pub async fn send_eof(&mut self) -> SkiffResult<()> {
        self.transport.channel_eof(self.handle).await
    }

    /// Sends a channel request and, if `want_reply`, waits for the
    /// peer's verdict. Without a reply the result is `true`.
    pub async fn request(
        &mut self,
        kind: &str,
        body: Message,
        want_reply: bool,
    ) -> SkiffResult<bool> {
        self.transport
            .channel_request(self.handle, kind, body, want_reply)
            .await
    }

    /// Asks for command execution on a session channel.
    pub async fn exec(&mut self, command: &str) -> SkiffResult<()> {
        let mut body = Message::new();
        body.add_str(command);
        if self.request("exec", body, true).await? {
            Ok(())
        } else {
            Err(SkiffError::Protocol(
                "Peer refused exec request".to_string(),
            ))
        }
    }

    /// Asks for an interactive shell on a session channel.
    pub async fn shell(&mut self) -> SkiffResult<()> {
        if self.request("shell", Message::new(), true).await? {
            Ok(())
        } else {
            Err(SkiffError::Protocol(
                "Peer refused shell request".to_string(),
            ))
        }
    }

    /// Closes the channel. Idempotent.
    pub async fn close(&mut self) -> SkiffResult<()> {
        self.transport.channel_close(self.handle).await
    }
}
