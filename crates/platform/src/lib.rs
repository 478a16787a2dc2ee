//! # Vigil Platform
//!
//! Primitive collaborator contracts for the Vigil IKEv2 negotiation core.
//!
//! This crate provides:
//! - Unified error type for primitive collaborators (`PlatformError`, `PlatformResult`)
//! - Diffie-Hellman contracts (`DiffieHellman`, `DhFactory`)
//! - Packet transport contract (`Transport`, `Packet`)
//!
//! The negotiation core never talks to sockets or big-number arithmetic
//! directly. Everything below the protocol state machine is reached through
//! the traits defined here.
//!
//! # Examples
//!
//! ```
//! use vigil_platform::{Packet, PlatformResult, Transport};
//!
//! struct Discard;
//!
//! impl Transport for Discard {
//!     fn send(&self, _packet: &Packet) -> PlatformResult<()> {
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> PlatformResult<()> {
//! let packet = Packet::new(
//!     "192.0.2.1:500".parse().unwrap(),
//!     "192.0.2.2:500".parse().unwrap(),
//!     vec![0u8; 28],
//! );
//! Discard.send(&packet)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod traits;

pub use error::{PlatformError, PlatformResult};
pub use traits::{DhFactory, DiffieHellman, Packet, Transport};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
