//! Protocol implementations for the Vigil key-exchange daemon.
//!
//! This crate provides the negotiation core of an IKEv2 daemon:
//!
//! - **IKE_SA state machine** - per-state handlers for IKE_SA_INIT and IKE_AUTH
//! - **Tasks** - resumable units of protocol work (rekey, reauth, delete, ...)
//! - **Task manager** - request/response matching and retransmission per IKE_SA
//! - **IKE_SA manager** - checkout/checkin registry with per-SA exclusivity
//!
//! # Features
//!
//! - `ipsec` (default) - IKEv2 negotiation core
//! - `serde` - serialization of configuration and selector types
//!
//! # Example
//!
//! ```rust
//! use vigil_proto::ipsec::ikev2::proposal::{
//!     select_proposal, DhTransformId, EncrTransformId, PrfTransformId, Proposal, ProtocolId,
//!     Transform,
//! };
//!
//! let local = vec![Proposal::new(1, ProtocolId::Ike)
//!     .add_transform(Transform::encr_with_key(EncrTransformId::AesGcm16, 128))
//!     .add_transform(Transform::prf(PrfTransformId::HmacSha256))
//!     .add_transform(Transform::dh(DhTransformId::Group14))];
//!
//! let selected = select_proposal(&local, &local).unwrap();
//! assert_eq!(selected.protocol_id, ProtocolId::Ike);
//! ```
//!
//! # Security
//!
//! - No unsafe code
//! - Key material is zeroized on drop (`zeroize`)
//! - Constant-time AUTH comparison (`subtle`)
//! - Proposals are deep-cloned per IKE_SA and never shared across threads
//!
//! # References
//!
//! - [RFC 7296](https://datatracker.ietf.org/doc/html/rfc7296) - Internet Key Exchange Protocol Version 2

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ipsec")]
pub mod ipsec;
