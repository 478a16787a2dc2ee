//! IPsec key exchange: the IKEv2 negotiation core
//!
//! This module negotiates IKE_SAs and the child SAs beneath them. Wire
//! encoding, Diffie-Hellman arithmetic, datagram I/O and kernel installation
//! are collaborators passed in through [`ikev2::Services`].
//!
//! # Architecture
//!
//! ```text
//!  Transport ──decoded Message──► Dispatcher ──checkout──► IkeSaManager
//!                                     │
//!                                     ▼
//!                                   IkeSa ──► state handlers (handshake)
//!                                     │   └─► TaskManager ──► tasks
//!                                     ▼
//!                      MessageCodec / Transport / ChildSaFactory
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use vigil_proto::ipsec::bus::Bus;
//! use vigil_proto::ipsec::config::{ConnectionConfig, PolicyConfig};
//! use vigil_proto::ipsec::ikev2::{Dispatcher, IkeSaManager, Services};
//! # fn services() -> Services { unimplemented!() }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = Arc::new(IkeSaManager::new(Arc::new(services())));
//! let dispatcher = Dispatcher::new(manager);
//! let bus = Bus::new();
//!
//! let connection = ConnectionConfig::builder()
//!     .with_name("site-b")
//!     .with_my_host("10.0.0.1:500".parse()?)
//!     .with_other_host("10.0.0.2:500".parse()?)
//!     .build()?;
//! # let policy: PolicyConfig = unimplemented!();
//!
//! let id = dispatcher.initiate(&bus, Arc::new(connection), Arc::new(policy))?;
//! println!("IKE_SA {} started", id);
//! # Ok(())
//! # }
//! ```
//!
//! # Failure isolation
//!
//! Every error carries a [`Disposition`]. Ignorable problems are logged,
//! local failures drop the message, fatal errors delete the one IKE_SA they
//! occurred on and are reported on the audit channel
//! ([`logging::AUDIT_TARGET`]).
//!
//! # References
//!
//! - [RFC 7296](https://datatracker.ietf.org/doc/html/rfc7296) - IKEv2 Protocol

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod bus;
pub mod child_sa;
pub mod config;
pub mod crypto;
pub mod error;
pub mod ikev2;
pub mod logging;
pub mod metrics;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Disposition, Error, Result};
