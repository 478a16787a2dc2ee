//! IKE_SA cryptographic glue
//!
//! PRF and key derivation bound to a selected proposal. Diffie-Hellman is a
//! collaborator (see `vigil_platform::DiffieHellman`).

pub mod prf;

pub use prf::*;
