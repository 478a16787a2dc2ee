//! Primitive collaborator contracts
//!
//! The IKEv2 core treats Diffie-Hellman arithmetic and datagram delivery as
//! black boxes. Implementations live outside the core (kernel sockets, a
//! crypto backend) or in tests as deterministic fakes.

use crate::PlatformResult;
use std::net::SocketAddr;
use zeroize::Zeroizing;

/// Ephemeral Diffie-Hellman exchange object
///
/// One instance belongs to exactly one IKE_SA handshake. It is moved between
/// state handlers and dropped once the shared secret has been consumed.
pub trait DiffieHellman: Send {
    /// Group number (IANA transform ID for transform type 4)
    fn group(&self) -> u16;

    /// Local public value, as sent in the KE payload
    fn my_public_value(&self) -> Vec<u8>;

    /// Set the peer's public value
    ///
    /// # Errors
    ///
    /// Returns an error if the value is malformed for this group
    fn set_other_public_value(&mut self, value: &[u8]) -> PlatformResult<()>;

    /// Compute the shared secret g^ir
    ///
    /// # Errors
    ///
    /// Returns an error if the peer's public value has not been set
    fn shared_secret(&self) -> PlatformResult<Zeroizing<Vec<u8>>>;
}

/// Creates Diffie-Hellman objects for a requested group
pub trait DhFactory: Send + Sync {
    /// Create a fresh exchange object with a new private value
    ///
    /// # Errors
    ///
    /// Returns an error if the group is not supported
    fn create(&self, group: u16) -> PlatformResult<Box<dyn DiffieHellman>>;
}

/// Encoded datagram plus addressing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Local address the packet leaves from (or arrived on)
    pub source: SocketAddr,
    /// Remote address
    pub destination: SocketAddr,
    /// Encoded IKE message
    pub data: Vec<u8>,
}

impl Packet {
    /// Create a new packet
    pub fn new(source: SocketAddr, destination: SocketAddr, data: Vec<u8>) -> Self {
        Self {
            source,
            destination,
            data,
        }
    }
}

/// Outbound datagram transport
///
/// Sending is synchronous: the caller learns immediately whether the packet
/// was handed off.
pub trait Transport: Send + Sync {
    /// Send a packet
    ///
    /// # Errors
    ///
    /// Returns an error if the packet could not be handed to the network
    fn send(&self, packet: &Packet) -> PlatformResult<()>;
}
