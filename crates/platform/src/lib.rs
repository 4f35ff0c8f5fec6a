//! # Skiff Platform
//!
//! Shared foundation for the Skiff SSH engine: the unified error type and
//! result alias used by every other crate in the workspace.
//!
//! # Examples
//!
//! ```
//! use skiff_platform::{SkiffError, SkiffResult};
//!
//! fn negotiate() -> SkiffResult<&'static str> {
//!     Ok("curve25519-sha256")
//! }
//!
//! # fn main() -> SkiffResult<()> {
//! let kex = negotiate()?;
//! assert_eq!(kex, "curve25519-sha256");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{SkiffError, SkiffResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
