//! IKEv2 typed payload model
//!
//! Payloads as the negotiation core sees them once a codec has decoded a
//! message (RFC 7296 Section 3.2). Byte layout is the codec's business with
//! two exceptions:
//!
//! - ID payload bodies, which feed the AUTH computation
//! - Traffic selector payload bodies, which are encoded here so that a
//!   policy's selectors survive a build/parse cycle unchanged

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use rand::RngCore;

use super::constants::{is_error_notify, NotifyType, PayloadType};
use super::proposal::{Proposal, ProtocolId};
use crate::ipsec::{Error, Result};

/// Typed payload carried by a [`Message`](super::message::Message)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Security Association
    Sa(SaPayload),
    /// Key Exchange
    Ke(KePayload),
    /// Nonce
    Nonce(NoncePayload),
    /// Notify
    Notify(NotifyPayload),
    /// Identification - Initiator
    IdI(IdPayload),
    /// Identification - Responder
    IdR(IdPayload),
    /// Authentication
    Auth(AuthPayload),
    /// Traffic Selector - Initiator
    TsI(TsPayload),
    /// Traffic Selector - Responder
    TsR(TsPayload),
    /// Delete
    Delete(DeletePayload),
    /// Anything the core does not interpret (vendor ID, CERTREQ, CP, ...)
    Unknown {
        /// Raw payload type number
        payload_type: u8,
        /// Payload body
        data: Vec<u8>,
    },
}

impl Payload {
    /// Raw payload type number
    pub fn type_number(&self) -> u8 {
        match self {
            Payload::Sa(_) => PayloadType::SA.to_u8(),
            Payload::Ke(_) => PayloadType::KE.to_u8(),
            Payload::Nonce(_) => PayloadType::Nonce.to_u8(),
            Payload::Notify(_) => PayloadType::N.to_u8(),
            Payload::IdI(_) => PayloadType::IDi.to_u8(),
            Payload::IdR(_) => PayloadType::IDr.to_u8(),
            Payload::Auth(_) => PayloadType::AUTH.to_u8(),
            Payload::TsI(_) => PayloadType::TSi.to_u8(),
            Payload::TsR(_) => PayloadType::TSr.to_u8(),
            Payload::Delete(_) => PayloadType::D.to_u8(),
            Payload::Unknown { payload_type, .. } => *payload_type,
        }
    }
}

/// Security Association Payload (RFC 7296 Section 3.3)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaPayload {
    /// List of proposals
    pub proposals: Vec<Proposal>,
}

impl SaPayload {
    /// Create new SA payload
    pub fn new(proposals: Vec<Proposal>) -> Self {
        SaPayload { proposals }
    }

    /// Get proposals
    pub fn proposals(&self) -> &[Proposal] {
        &self.proposals
    }
}

/// Key Exchange Payload (RFC 7296 Section 3.4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KePayload {
    /// Diffie-Hellman group number
    pub dh_group: u16,

    /// Key exchange data (public value)
    pub key_data: Vec<u8>,
}

impl KePayload {
    /// Create new KE payload
    pub fn new(dh_group: u16, key_data: Vec<u8>) -> Self {
        KePayload { dh_group, key_data }
    }
}

/// Nonce Payload (RFC 7296 Section 3.9)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoncePayload {
    /// Nonce data
    pub nonce: Vec<u8>,
}

impl NoncePayload {
    /// Minimum nonce size (16 bytes)
    pub const MIN_SIZE: usize = 16;

    /// Maximum nonce size (256 bytes)
    pub const MAX_SIZE: usize = 256;

    /// Nonce size used for locally generated nonces
    pub const DEFAULT_SIZE: usize = 32;

    /// Create new nonce payload
    pub fn new(nonce: Vec<u8>) -> Result<Self> {
        if nonce.len() < Self::MIN_SIZE {
            return Err(Error::InvalidPayload(format!(
                "Nonce too short: {} bytes (minimum {})",
                nonce.len(),
                Self::MIN_SIZE
            )));
        }

        if nonce.len() > Self::MAX_SIZE {
            return Err(Error::InvalidPayload(format!(
                "Nonce too long: {} bytes (maximum {})",
                nonce.len(),
                Self::MAX_SIZE
            )));
        }

        Ok(NoncePayload { nonce })
    }

    /// Generate a fresh random nonce
    pub fn generate() -> Self {
        let mut nonce = vec![0u8; Self::DEFAULT_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        NoncePayload { nonce }
    }
}

/// Notify Payload (RFC 7296 Section 3.10)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload {
    /// Protocol the notify refers to (0 or 1 = IKE)
    pub protocol_id: u8,

    /// Raw notify message type
    pub notify_type: u16,

    /// SPI of the SA the notify refers to (may be empty)
    pub spi: Vec<u8>,

    /// Notification data
    pub data: Vec<u8>,
}

impl NotifyPayload {
    /// Create an IKE-level notify without SPI
    pub fn new(notify_type: NotifyType, data: Vec<u8>) -> Self {
        NotifyPayload {
            protocol_id: 0,
            notify_type: notify_type.to_u16(),
            spi: Vec::new(),
            data,
        }
    }

    /// INVALID_KE_PAYLOAD naming the group the responder wants
    pub fn invalid_ke(group: u16) -> Self {
        NotifyPayload::new(NotifyType::InvalidKePayload, group.to_be_bytes().to_vec())
    }

    /// REKEY_SA pointing at the child SA being replaced
    pub fn rekey_sa(protocol: ProtocolId, spi: u32) -> Self {
        NotifyPayload {
            protocol_id: protocol.to_u8(),
            notify_type: NotifyType::RekeySa.to_u16(),
            spi: spi.to_be_bytes().to_vec(),
            data: Vec::new(),
        }
    }

    /// Known notify type, if any
    pub fn known_type(&self) -> Option<NotifyType> {
        NotifyType::from_u16(self.notify_type)
    }

    /// Whether the notify is addressed to the IKE_SA itself
    pub fn is_for_ike(&self) -> bool {
        self.protocol_id == 0 || self.protocol_id == ProtocolId::Ike.to_u8()
    }

    /// Whether this is an error notify
    pub fn is_error(&self) -> bool {
        is_error_notify(self.notify_type)
    }

    /// DH group carried by an INVALID_KE_PAYLOAD notify (network order)
    pub fn requested_group(&self) -> Result<u16> {
        match self.data.as_slice() {
            [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
            _ => Err(Error::BufferTooShort {
                required: 2,
                available: self.data.len(),
            }),
        }
    }
}

/// Identification type (RFC 7296 Section 3.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum IdType {
    /// IPv4 address
    Ipv4Addr = 1,
    /// Fully-qualified domain name
    Fqdn = 2,
    /// RFC 822 email address
    Rfc822Addr = 3,
    /// IPv6 address
    Ipv6Addr = 5,
    /// ASN.1 DER encoded distinguished name
    DerAsn1Dn = 9,
    /// Key ID
    KeyId = 11,
}

impl IdType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(IdType::Ipv4Addr),
            2 => Some(IdType::Fqdn),
            3 => Some(IdType::Rfc822Addr),
            5 => Some(IdType::Ipv6Addr),
            9 => Some(IdType::DerAsn1Dn),
            11 => Some(IdType::KeyId),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// A configured peer identity
///
/// Identities live in the configuration and are shared by `Arc`; ID payloads
/// point at them instead of copying.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Identification {
    /// ID type
    pub id_type: IdType,

    /// Identification data
    pub data: Vec<u8>,
}

impl Identification {
    /// Create new identity
    pub fn new(id_type: IdType, data: Vec<u8>) -> Self {
        Identification { id_type, data }
    }

    /// Identity from FQDN
    pub fn fqdn(fqdn: &str) -> Self {
        Identification::new(IdType::Fqdn, fqdn.as_bytes().to_vec())
    }

    /// Identity from email address
    pub fn email(email: &str) -> Self {
        Identification::new(IdType::Rfc822Addr, email.as_bytes().to_vec())
    }

    /// Identity from an IP address
    pub fn address(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Identification::new(IdType::Ipv4Addr, v4.octets().to_vec()),
            IpAddr::V6(v6) => Identification::new(IdType::Ipv6Addr, v6.octets().to_vec()),
        }
    }

    /// Identity from a key ID
    pub fn key_id(key_id: &[u8]) -> Self {
        Identification::new(IdType::KeyId, key_id.to_vec())
    }

    /// ID payload body: type, three reserved bytes, data
    ///
    /// These are the octets hashed into the AUTH computation.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.data.len());
        bytes.push(self.id_type.to_u8());
        bytes.extend_from_slice(&[0u8; 3]);
        bytes.extend_from_slice(&self.data);
        bytes
    }

    /// Parse an ID payload body
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }

        let id_type = IdType::from_u8(data[0])
            .ok_or_else(|| Error::InvalidPayload(format!("Unknown ID type: {}", data[0])))?;

        Ok(Identification::new(id_type, data[4..].to_vec()))
    }
}

impl fmt::Display for Identification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id_type {
            IdType::Fqdn | IdType::Rfc822Addr => {
                write!(f, "{}", String::from_utf8_lossy(&self.data))
            }
            IdType::Ipv4Addr => match <[u8; 4]>::try_from(self.data.as_slice()) {
                Ok(octets) => write!(f, "{}", Ipv4Addr::from(octets)),
                Err(_) => write!(f, "{}", hex::encode(&self.data)),
            },
            IdType::Ipv6Addr => match <[u8; 16]>::try_from(self.data.as_slice()) {
                Ok(octets) => write!(f, "{}", Ipv6Addr::from(octets)),
                Err(_) => write!(f, "{}", hex::encode(&self.data)),
            },
            IdType::DerAsn1Dn | IdType::KeyId => write!(f, "{}", hex::encode(&self.data)),
        }
    }
}

/// Identification Payload (RFC 7296 Section 3.5)
///
/// Used for IDi and IDr. Borrows the configured identity through `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPayload {
    /// Identity carried by the payload
    pub identity: Arc<Identification>,
}

impl IdPayload {
    /// Create new ID payload
    pub fn new(identity: Arc<Identification>) -> Self {
        IdPayload { identity }
    }

    /// Payload body as hashed into AUTH
    pub fn to_payload_data(&self) -> Vec<u8> {
        self.identity.encode()
    }
}

/// Authentication Method (RFC 7296 Section 3.8)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum AuthMethod {
    /// RSA Digital Signature
    RsaSig = 1,
    /// Shared Key Message Integrity Code
    SharedKeyMic = 2,
    /// ECDSA with SHA-256 on P-256 curve
    EcdsaSha256P256 = 9,
}

impl AuthMethod {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(AuthMethod::RsaSig),
            2 => Some(AuthMethod::SharedKeyMic),
            9 => Some(AuthMethod::EcdsaSha256P256),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Authentication Payload (RFC 7296 Section 3.8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPayload {
    /// Authentication method
    pub auth_method: AuthMethod,

    /// Authentication data
    pub auth_data: Vec<u8>,
}

impl AuthPayload {
    /// Create new AUTH payload
    pub fn new(auth_method: AuthMethod, auth_data: Vec<u8>) -> Self {
        AuthPayload {
            auth_method,
            auth_data,
        }
    }
}

/// Traffic selector type (RFC 7296 Section 3.13.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum TsType {
    /// TS_IPV4_ADDR_RANGE
    Ipv4AddrRange = 7,
    /// TS_IPV6_ADDR_RANGE
    Ipv6AddrRange = 8,
}

impl TsType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            7 => Some(TsType::Ipv4AddrRange),
            8 => Some(TsType::Ipv6AddrRange),
            _ => None,
        }
    }

    fn addr_len(self) -> usize {
        match self {
            TsType::Ipv4AddrRange => 4,
            TsType::Ipv6AddrRange => 16,
        }
    }
}

/// A single traffic selector: address range, port range and IP protocol
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrafficSelector {
    /// IP protocol (0 = any)
    pub ip_protocol: u8,
    /// First port of the range
    pub start_port: u16,
    /// Last port of the range
    pub end_port: u16,
    /// First address of the range
    pub start_addr: IpAddr,
    /// Last address of the range
    pub end_addr: IpAddr,
    /// Whether the range tracks the host address of the SA
    ///
    /// A dynamic selector is narrowed to the actual local address by
    /// `Policy::update_my_ts`. Not encoded on the wire.
    #[cfg_attr(feature = "serde", serde(default))]
    pub dynamic: bool,
}

impl TrafficSelector {
    /// Selector covering a single host, all protocols and ports
    pub fn host(addr: IpAddr) -> Self {
        TrafficSelector {
            ip_protocol: 0,
            start_port: 0,
            end_port: u16::MAX,
            start_addr: addr,
            end_addr: addr,
            dynamic: false,
        }
    }

    /// Selector covering a whole subnet
    pub fn subnet(network: IpAddr, prefix_len: u8) -> Result<Self> {
        let (start, end) = match network {
            IpAddr::V4(v4) => {
                if prefix_len > 32 {
                    return Err(Error::InvalidParameter(format!(
                        "IPv4 prefix length {} out of range",
                        prefix_len
                    )));
                }
                let host_bits = 32 - u32::from(prefix_len);
                let mask = u32::MAX.checked_shl(host_bits).unwrap_or(0);
                let base = u32::from(v4) & mask;
                (
                    IpAddr::V4(Ipv4Addr::from(base)),
                    IpAddr::V4(Ipv4Addr::from(base | !mask)),
                )
            }
            IpAddr::V6(v6) => {
                if prefix_len > 128 {
                    return Err(Error::InvalidParameter(format!(
                        "IPv6 prefix length {} out of range",
                        prefix_len
                    )));
                }
                let host_bits = 128 - u32::from(prefix_len);
                let mask = u128::MAX.checked_shl(host_bits).unwrap_or(0);
                let base = u128::from(v6) & mask;
                (
                    IpAddr::V6(Ipv6Addr::from(base)),
                    IpAddr::V6(Ipv6Addr::from(base | !mask)),
                )
            }
        };

        Ok(TrafficSelector {
            start_addr: start,
            end_addr: end,
            ..TrafficSelector::host(network)
        })
    }

    /// Selector that follows the SA's own address
    pub fn dynamic(family_hint: IpAddr) -> Self {
        TrafficSelector {
            dynamic: true,
            ..TrafficSelector::host(family_hint)
        }
    }

    /// Restrict to one IP protocol and port range
    pub fn with_ports(mut self, ip_protocol: u8, start_port: u16, end_port: u16) -> Self {
        self.ip_protocol = ip_protocol;
        self.start_port = start_port;
        self.end_port = end_port;
        self
    }

    /// Selector type derived from the address family
    pub fn ts_type(&self) -> TsType {
        match self.start_addr {
            IpAddr::V4(_) => TsType::Ipv4AddrRange,
            IpAddr::V6(_) => TsType::Ipv6AddrRange,
        }
    }

    /// Whether `addr` falls into the address range
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.start_addr, self.end_addr, addr) {
            (IpAddr::V4(s), IpAddr::V4(e), IpAddr::V4(a)) => {
                (u32::from(s)..=u32::from(e)).contains(&u32::from(a))
            }
            (IpAddr::V6(s), IpAddr::V6(e), IpAddr::V6(a)) => {
                (u128::from(s)..=u128::from(e)).contains(&u128::from(a))
            }
            _ => false,
        }
    }

    /// Narrow a dynamic selector to `addr`; static selectors are untouched
    pub fn set_address(&mut self, addr: IpAddr) {
        if self.dynamic {
            self.start_addr = addr;
            self.end_addr = addr;
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        let ts_type = self.ts_type();
        let (start, end) = match (self.start_addr, self.end_addr) {
            (IpAddr::V4(s), IpAddr::V4(e)) => (s.octets().to_vec(), e.octets().to_vec()),
            (IpAddr::V6(s), IpAddr::V6(e)) => (s.octets().to_vec(), e.octets().to_vec()),
            _ => {
                return Err(Error::InvalidParameter(
                    "Traffic selector mixes address families".into(),
                ))
            }
        };
        let length = (8 + 2 * ts_type.addr_len()) as u16;

        out.push(ts_type as u8);
        out.push(self.ip_protocol);
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(&self.start_port.to_be_bytes());
        out.extend_from_slice(&self.end_port.to_be_bytes());
        out.extend_from_slice(&start);
        out.extend_from_slice(&end);
        Ok(())
    }

    fn decode_from(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 8 {
            return Err(Error::BufferTooShort {
                required: 8,
                available: data.len(),
            });
        }

        let ts_type = TsType::from_u8(data[0])
            .ok_or_else(|| Error::InvalidPayload(format!("Unknown TS type: {}", data[0])))?;
        let length = usize::from(u16::from_be_bytes([data[2], data[3]]));
        let addr_len = ts_type.addr_len();

        if length != 8 + 2 * addr_len {
            return Err(Error::InvalidPayload(format!(
                "Traffic selector length {} does not match type {:?}",
                length, ts_type
            )));
        }
        if data.len() < length {
            return Err(Error::BufferTooShort {
                required: length,
                available: data.len(),
            });
        }

        let start_port = u16::from_be_bytes([data[4], data[5]]);
        let end_port = u16::from_be_bytes([data[6], data[7]]);
        let start = &data[8..8 + addr_len];
        let end = &data[8 + addr_len..length];

        let to_addr = |bytes: &[u8]| -> Result<IpAddr> {
            match ts_type {
                TsType::Ipv4AddrRange => <[u8; 4]>::try_from(bytes)
                    .map(|o| IpAddr::V4(Ipv4Addr::from(o)))
                    .map_err(|_| Error::InvalidPayload("Bad IPv4 selector".into())),
                TsType::Ipv6AddrRange => <[u8; 16]>::try_from(bytes)
                    .map(|o| IpAddr::V6(Ipv6Addr::from(o)))
                    .map_err(|_| Error::InvalidPayload("Bad IPv6 selector".into())),
            }
        };

        let selector = TrafficSelector {
            ip_protocol: data[1],
            start_port,
            end_port,
            start_addr: to_addr(start)?,
            end_addr: to_addr(end)?,
            dynamic: false,
        };
        Ok((selector, length))
    }
}

impl fmt::Display for TrafficSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start_addr == self.end_addr {
            write!(f, "{}", self.start_addr)?;
        } else {
            write!(f, "{}..{}", self.start_addr, self.end_addr)?;
        }
        if self.ip_protocol != 0 || self.start_port != 0 || self.end_port != u16::MAX {
            write!(
                f,
                "[{}/{}-{}]",
                self.ip_protocol, self.start_port, self.end_port
            )?;
        }
        Ok(())
    }
}

/// Traffic Selector Payload (RFC 7296 Section 3.13)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Number of TSs |                 RESERVED                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ~                       <Traffic Selectors>                     ~
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsPayload {
    /// Selectors, in configured order
    pub selectors: Vec<TrafficSelector>,
}

impl TsPayload {
    /// Create new TS payload
    pub fn new(selectors: Vec<TrafficSelector>) -> Self {
        TsPayload { selectors }
    }

    /// Serialize payload body (without generic header)
    pub fn to_payload_data(&self) -> Result<Vec<u8>> {
        let count = u8::try_from(self.selectors.len()).map_err(|_| {
            Error::InvalidParameter(format!(
                "Too many traffic selectors: {}",
                self.selectors.len()
            ))
        })?;

        let mut data = Vec::with_capacity(4 + self.selectors.len() * 40);
        data.push(count);
        data.extend_from_slice(&[0u8; 3]);
        for selector in &self.selectors {
            selector.encode_into(&mut data)?;
        }
        Ok(data)
    }

    /// Parse payload body (without generic header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }

        let count = usize::from(data[0]);
        let mut offset = 4;
        let mut selectors = Vec::with_capacity(count);

        for _ in 0..count {
            let (selector, used) = TrafficSelector::decode_from(&data[offset..])?;
            selectors.push(selector);
            offset += used;
        }

        if offset != data.len() {
            return Err(Error::InvalidPayload(format!(
                "{} trailing bytes after traffic selectors",
                data.len() - offset
            )));
        }

        Ok(TsPayload { selectors })
    }
}

/// Delete Payload (RFC 7296 Section 3.11)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    /// Protocol of the SAs being deleted
    pub protocol_id: ProtocolId,

    /// SPIs being deleted; empty for an IKE_SA delete
    pub spis: Vec<u32>,
}

impl DeletePayload {
    /// Delete the IKE_SA the message is sent under
    pub fn ike() -> Self {
        DeletePayload {
            protocol_id: ProtocolId::Ike,
            spis: Vec::new(),
        }
    }

    /// Delete child SAs by their inbound SPI
    pub fn child(protocol_id: ProtocolId, spis: Vec<u32>) -> Self {
        DeletePayload { protocol_id, spis }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_selectors() -> Vec<TrafficSelector> {
        vec![
            TrafficSelector::subnet("10.1.0.0".parse().unwrap(), 16).unwrap(),
            TrafficSelector::host("192.168.1.5".parse().unwrap()).with_ports(6, 443, 443),
            TrafficSelector::subnet("2001:db8::".parse().unwrap(), 64).unwrap(),
        ]
    }

    #[test]
    fn test_nonce_payload_bounds() {
        assert!(NoncePayload::new(vec![1u8; 32]).is_ok());
        assert!(NoncePayload::new(vec![1u8; 10]).is_err());
        assert!(NoncePayload::new(vec![1u8; 300]).is_err());
    }

    #[test]
    fn test_generated_nonces_differ() {
        let a = NoncePayload::generate();
        let b = NoncePayload::generate();
        assert_eq!(a.nonce.len(), NoncePayload::DEFAULT_SIZE);
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_ke_notify_group() {
        let notify = NotifyPayload::invalid_ke(19);
        assert_eq!(notify.known_type(), Some(NotifyType::InvalidKePayload));
        assert_eq!(notify.data, vec![0, 19]);
        assert_eq!(notify.requested_group().unwrap(), 19);
        assert!(notify.is_for_ike());
        assert!(notify.is_error());

        let short = NotifyPayload::new(NotifyType::InvalidKePayload, vec![1]);
        assert!(matches!(
            short.requested_group(),
            Err(Error::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_notify_protocol_addressing() {
        let notify = NotifyPayload::rekey_sa(ProtocolId::Esp, 0xc0ffee01);
        assert!(!notify.is_for_ike());
        assert!(!notify.is_error());
        assert_eq!(notify.spi, vec![0xc0, 0xff, 0xee, 0x01]);
    }

    #[test]
    fn test_identification_encode_decode() {
        let id = Identification::fqdn("vpn.example.com");
        let encoded = id.encode();
        assert_eq!(encoded[0], IdType::Fqdn.to_u8());
        assert_eq!(&encoded[1..4], &[0, 0, 0]);
        assert_eq!(Identification::decode(&encoded).unwrap(), id);
        assert_eq!(id.to_string(), "vpn.example.com");
    }

    #[test]
    fn test_identification_display_address() {
        let id = Identification::address("10.0.0.1".parse().unwrap());
        assert_eq!(id.id_type, IdType::Ipv4Addr);
        assert_eq!(id.to_string(), "10.0.0.1");

        let id = Identification::key_id(&[0xde, 0xad]);
        assert_eq!(id.to_string(), "dead");
    }

    #[test]
    fn test_id_payload_shares_identity() {
        let identity = Arc::new(Identification::email("user@example.com"));
        let payload = IdPayload::new(Arc::clone(&identity));
        assert!(Arc::ptr_eq(&payload.identity, &identity));
        assert_eq!(payload.to_payload_data(), identity.encode());
    }

    #[test]
    fn test_subnet_selector_range() {
        let ts = TrafficSelector::subnet("10.1.2.3".parse().unwrap(), 16).unwrap();
        assert_eq!(ts.start_addr, "10.1.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(ts.end_addr, "10.1.255.255".parse::<IpAddr>().unwrap());
        assert!(ts.contains("10.1.77.1".parse().unwrap()));
        assert!(!ts.contains("10.2.0.1".parse().unwrap()));
        assert!(!ts.contains("::1".parse().unwrap()));

        let all = TrafficSelector::subnet("0.0.0.0".parse().unwrap(), 0).unwrap();
        assert_eq!(all.end_addr, "255.255.255.255".parse::<IpAddr>().unwrap());

        assert!(TrafficSelector::subnet("10.0.0.0".parse().unwrap(), 33).is_err());
    }

    #[test]
    fn test_dynamic_selector_follows_address() {
        let mut ts = TrafficSelector::dynamic("0.0.0.0".parse().unwrap());
        ts.set_address("172.16.0.9".parse().unwrap());
        assert_eq!(ts.start_addr, "172.16.0.9".parse::<IpAddr>().unwrap());

        let mut fixed = TrafficSelector::host("10.0.0.1".parse().unwrap());
        fixed.set_address("172.16.0.9".parse().unwrap());
        assert_eq!(fixed.start_addr, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_ts_payload_layout() {
        let payload = TsPayload::new(vec![TrafficSelector::host("10.0.0.1".parse().unwrap())]);
        let data = payload.to_payload_data().unwrap();

        assert_eq!(data.len(), 4 + 16);
        assert_eq!(data[0], 1);
        assert_eq!(data[4], TsType::Ipv4AddrRange as u8);
        assert_eq!(&data[6..8], &16u16.to_be_bytes());
        assert_eq!(&data[10..12], &u16::MAX.to_be_bytes());
    }

    #[test]
    fn test_ts_payload_build_then_parse() {
        let selectors = create_test_selectors();
        let data = TsPayload::new(selectors.clone()).to_payload_data().unwrap();
        let parsed = TsPayload::from_payload_data(&data).unwrap();
        assert_eq!(parsed.selectors, selectors);
    }

    #[test]
    fn test_ts_payload_rejects_garbage() {
        assert!(TsPayload::from_payload_data(&[1, 0, 0]).is_err());
        assert!(TsPayload::from_payload_data(&[1, 0, 0, 0, 7, 0, 0, 16]).is_err());

        let mut data = TsPayload::new(create_test_selectors())
            .to_payload_data()
            .unwrap();
        data.push(0);
        assert!(matches!(
            TsPayload::from_payload_data(&data),
            Err(Error::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_payload_type_numbers() {
        let ke = Payload::Ke(KePayload::new(14, vec![0; 256]));
        assert_eq!(ke.type_number(), 34);
        let unknown = Payload::Unknown {
            payload_type: 43,
            data: vec![],
        };
        assert_eq!(unknown.type_number(), 43);
        let del = Payload::Delete(DeletePayload::ike());
        assert_eq!(del.type_number(), 42);
    }
}
