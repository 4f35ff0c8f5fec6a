//! # Skiff Proto
//!
//! An SSH2 transport and session-multiplexing engine: binary packet
//! framing, algorithm negotiation, key exchange with rekeying, user
//! authentication and flow-controlled channels, client and server side.
//!
//! The entry point is [`transport::Transport`]: hand it an established
//! stream and a [`transport::TransportConfig`], then authenticate and
//! open channels. One spawned task per transport handles all inbound
//! traffic; handles are cheap clones and safe to share across tasks.
//!
//! # Example
//!
//! ```no_run
//! use skiff_proto::transport::{Transport, TransportConfig};
//!
//! # async fn run() -> skiff_platform::SkiffResult<()> {
//! let socket = tokio::net::TcpStream::connect("example.net:22").await?;
//! let transport = Transport::start_client(socket, TransportConfig::default()).await?;
//! transport.auth_password("deploy", "hunter2").await?;
//!
//! let mut session = transport.open_session().await?;
//! session.exec("hostname").await?;
//! let output = session.read().await?;
//! println!("{}", String::from_utf8_lossy(&output));
//! transport.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod channel;
pub mod cipher;
pub mod hostkey;
pub mod kex;
pub mod kexdh;
pub mod message;
pub mod msg;
pub mod negotiate;
pub mod packet;
pub mod registry;
pub mod server;
pub mod transport;
pub mod version;

pub use auth::Prompt;
pub use channel::{Channel, ChannelEvent, ChannelHandle};
pub use hostkey::{Ed25519HostKey, HostKey};
pub use message::Message;
pub use registry::TransportRegistry;
pub use server::{AuthDecision, OpenDecision, ServerPolicy};
pub use skiff_platform::{SkiffError, SkiffResult};
pub use transport::{Transport, TransportConfig};
