//! Error types for Skiff.
//!
//! Every failure surfaced by the engine is one of the variants below. The
//! split matters operationally: some variants are fatal to the whole
//! transport, others only fail the specific call that raised them.
//!
//! | Variant                  | Scope of damage                        |
//! |--------------------------|----------------------------------------|
//! | `Io`                     | fatal to the transport                 |
//! | `Protocol`               | fatal to the transport                 |
//! | `Security`               | fatal to the transport                 |
//! | `NoCompatibleAlgorithm`  | fatal, session never becomes active    |
//! | `AuthenticationFailed`   | the auth attempt only                  |
//! | `ChannelOpenRefused`     | the open call only                     |
//! | `Timeout`                | the blocking call only                 |
//! | `TransportClosed`        | any call made after/during shutdown    |
//! | `Config`                 | construction-time misconfiguration     |

use std::fmt;

/// Unified error type for all Skiff operations.
#[derive(Debug)]
pub enum SkiffError {
    /// I/O error on the underlying stream.
    Io(std::io::Error),

    /// Malformed frame, unexpected message, banner mismatch. Always fatal.
    Protocol(String),

    /// MAC verification failure, bad key material, signature mismatch.
    /// Always fatal.
    Security(String),

    /// Algorithm negotiation found an empty intersection for the named
    /// category (kex / host-key / cipher / mac / compression).
    NoCompatibleAlgorithm {
        /// The negotiation category that failed.
        category: &'static str,
    },

    /// An authentication attempt was rejected. The transport stays up and
    /// further attempts are allowed.
    AuthenticationFailed {
        /// True when the server signalled partial success (the method
        /// succeeded but more methods are required).
        partial: bool,
        /// Methods the server will still accept.
        allowed: Vec<String>,
    },

    /// The peer refused a channel open, with its numeric reason code and
    /// human-readable text.
    ChannelOpenRefused {
        /// RFC 4254 open-failure reason code.
        code: u32,
        /// Peer-supplied description.
        text: String,
    },

    /// A blocking operation ran out of time. The transport stays active.
    Timeout(&'static str),

    /// The transport is (or became) inactive. Carries the rendered first
    /// recorded failure cause, or a generic message if none was stored.
    TransportClosed(String),

    /// Invalid construction parameters (bad preference lists, a KEX
    /// algorithm without a declared hash, missing host key, ...).
    Config(String),
}

impl SkiffError {
    /// Whether this error must tear down the transport.
    ///
    /// Only the dispatch loop acts on this; timeouts and per-call
    /// refusals never change transport state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SkiffError::Io(_)
                | SkiffError::Protocol(_)
                | SkiffError::Security(_)
                | SkiffError::NoCompatibleAlgorithm { .. }
        )
    }
}

impl fmt::Display for SkiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkiffError::Io(e) => write!(f, "IO error: {}", e),
            SkiffError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SkiffError::Security(msg) => write!(f, "Security error: {}", msg),
            SkiffError::NoCompatibleAlgorithm { category } => {
                write!(f, "No compatible {} algorithm", category)
            }
            SkiffError::AuthenticationFailed { partial, allowed } => {
                if *partial {
                    write!(
                        f,
                        "Authentication partially succeeded (continue with: {})",
                        allowed.join(",")
                    )
                } else {
                    write!(f, "Authentication failed (allowed: {})", allowed.join(","))
                }
            }
            SkiffError::ChannelOpenRefused { code, text } => {
                write!(f, "Channel open refused (code {}): {}", code, text)
            }
            SkiffError::Timeout(op) => write!(f, "Timed out waiting for {}", op),
            SkiffError::TransportClosed(cause) => {
                write!(f, "Transport closed: {}", cause)
            }
            SkiffError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for SkiffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SkiffError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SkiffError {
    fn from(err: std::io::Error) -> Self {
        SkiffError::Io(err)
    }
}

/// Result type for Skiff operations.
pub type SkiffResult<T> = Result<T, SkiffError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SkiffError::NoCompatibleAlgorithm { category: "cipher" };
        assert_eq!(err.to_string(), "No compatible cipher algorithm");

        let err = SkiffError::ChannelOpenRefused {
            code: 1,
            text: "administratively prohibited".to_string(),
        };
        assert!(err.to_string().contains("code 1"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: SkiffError = io_err.into();
        assert!(matches!(err, SkiffError::Io(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_fatality_split() {
        assert!(SkiffError::Protocol("bad frame".into()).is_fatal());
        assert!(SkiffError::Security("mac mismatch".into()).is_fatal());
        assert!(!SkiffError::Timeout("channel open").is_fatal());
        assert!(!SkiffError::AuthenticationFailed {
            partial: false,
            allowed: vec!["password".into()],
        }
        .is_fatal());
        assert!(!SkiffError::TransportClosed("session closed".into()).is_fatal());
    }
}
