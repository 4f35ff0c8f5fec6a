//! SSH protocol message numbers (RFC 4253 Section 12 and friends).
//!
//! Every binary packet payload starts with a one-byte message type. The
//! ranges matter for dispatch: 1-19 transport housekeeping, 20-29
//! algorithm negotiation, 30-49 key-exchange-method specific, 50-79 user
//! authentication, 80-127 connection protocol.

/// SSH message types with their wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Terminates the connection.
    Disconnect = 1,
    /// Must be ignored; usable for padding or keep-alive.
    Ignore = 2,
    /// Response to an unknown message type.
    Unimplemented = 3,
    /// Debugging information.
    Debug = 4,
    /// Request a service ("ssh-userauth").
    ServiceRequest = 5,
    /// Service request accepted.
    ServiceAccept = 6,

    /// Algorithm negotiation.
    KexInit = 20,
    /// Switch to the newly derived keys.
    NewKeys = 21,

    /// DH/ECDH key exchange init (shared number across kex methods).
    KexdhInit = 30,
    /// DH/ECDH key exchange reply.
    KexdhReply = 31,

    /// User authentication request.
    UserauthRequest = 50,
    /// Authentication failure (carries the allowed-methods list).
    UserauthFailure = 51,
    /// Authentication success.
    UserauthSuccess = 52,
    /// Authentication banner text.
    UserauthBanner = 53,
    /// Method-specific: PK_OK for publickey, INFO_REQUEST for
    /// keyboard-interactive. Disambiguated by the method in flight.
    UserauthPkOk = 60,
    /// keyboard-interactive INFO_RESPONSE.
    UserauthInfoResponse = 61,

    /// Connection-wide request (port forwards, keep-alives).
    GlobalRequest = 80,
    /// Global request succeeded.
    RequestSuccess = 81,
    /// Global request denied.
    RequestFailure = 82,
    /// Open a new channel.
    ChannelOpen = 90,
    /// Channel open confirmed.
    ChannelOpenConfirmation = 91,
    /// Channel open refused.
    ChannelOpenFailure = 92,
    /// Flow-control credit grant.
    ChannelWindowAdjust = 93,
    /// Channel payload data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// No more data in this direction.
    ChannelEof = 96,
    /// Tear the channel down.
    ChannelClose = 97,
    /// Per-channel request (exec, shell, pty-req, ...).
    ChannelRequest = 98,
    /// Channel request succeeded.
    ChannelSuccess = 99,
    /// Channel request failed.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a wire byte to a message type, if recognized.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            60 => Some(MessageType::UserauthPkOk),
            61 => Some(MessageType::UserauthInfoResponse),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// Returns the RFC message name.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::UserauthInfoResponse => "SSH_MSG_USERAUTH_INFO_RESPONSE",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Channel-open failure reason codes (RFC 4254 Section 5.1).
pub mod open_failure {
    /// The request is administratively prohibited (also used for the
    /// pre-authentication gate).
    pub const ADMINISTRATIVELY_PROHIBITED: u32 = 1;
    /// Connect failed (direct-tcpip target unreachable).
    pub const CONNECT_FAILED: u32 = 2;
    /// The channel type is not recognized.
    pub const UNKNOWN_CHANNEL_TYPE: u32 = 3;
    /// Resource shortage on the receiving side.
    pub const RESOURCE_SHORTAGE: u32 = 4;
}

/// Disconnect reason codes (RFC 4253 Section 11.1), the subset the engine
/// emits.
pub mod disconnect {
    /// A protocol-level error forced the disconnect.
    pub const PROTOCOL_ERROR: u32 = 2;
    /// Key exchange failed.
    pub const KEY_EXCHANGE_FAILED: u32 = 3;
    /// Orderly application-requested shutdown.
    pub const BY_APPLICATION: u32 = 11;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u8_round_trip() {
        for byte in 0u8..=255 {
            if let Some(t) = MessageType::from_u8(byte) {
                assert_eq!(t as u8, byte);
            }
        }
    }

    #[test]
    fn test_known_values() {
        assert_eq!(MessageType::KexInit as u8, 20);
        assert_eq!(MessageType::UserauthInfoResponse as u8, 61);
        assert_eq!(MessageType::ChannelFailure as u8, 100);
        assert_eq!(MessageType::from_u8(254), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(MessageType::NewKeys.to_string(), "SSH_MSG_NEWKEYS(21)");
    }
}
