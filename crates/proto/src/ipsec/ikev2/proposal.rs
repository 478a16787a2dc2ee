//! IKEv2 Proposal and Transform structures
//!
//! Implements SA proposal negotiation as defined in RFC 7296 Section 2.7 and 3.3.
//!
//! # Structure
//!
//! ```text
//! SA Payload
//!   └── Proposal(s)
//!         └── Transform(s)
//! ```
//!
//! # Ownership
//!
//! Selection always returns a fresh [`Proposal`] value. A selected proposal
//! belongs to exactly one IKE_SA (or child SA) and SPIs are written into that
//! copy only, never into the configured lists.

use crate::ipsec::{Error, Result};

/// Transform Type (RFC 7296 Section 3.3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransformType {
    /// Encryption Algorithm (ENCR)
    Encr = 1,
    /// Pseudo-random Function (PRF)
    Prf = 2,
    /// Integrity Algorithm (INTEG)
    Integ = 3,
    /// Diffie-Hellman Group (D-H)
    Dh = 4,
    /// Extended Sequence Numbers (ESN)
    Esn = 5,
}

impl TransformType {
    /// All transform types, in the order they are compared during selection
    pub const ALL: [TransformType; 5] = [
        TransformType::Encr,
        TransformType::Prf,
        TransformType::Integ,
        TransformType::Dh,
        TransformType::Esn,
    ];

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(TransformType::Encr),
            2 => Some(TransformType::Prf),
            3 => Some(TransformType::Integ),
            4 => Some(TransformType::Dh),
            5 => Some(TransformType::Esn),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Transform ID for Encryption (ENCR) algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EncrTransformId {
    /// AES-CBC (key length given by attribute, default 128)
    AesCbc = 12,
    /// AES-GCM with 16-byte ICV (key length given by attribute)
    AesGcm16 = 20,
    /// ChaCha20-Poly1305
    ChaCha20Poly1305 = 28,
}

impl EncrTransformId {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            12 => Some(EncrTransformId::AesCbc),
            20 => Some(EncrTransformId::AesGcm16),
            28 => Some(EncrTransformId::ChaCha20Poly1305),
            _ => None,
        }
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Check if this is an AEAD cipher
    pub fn is_aead(self) -> bool {
        matches!(
            self,
            EncrTransformId::AesGcm16 | EncrTransformId::ChaCha20Poly1305
        )
    }

    /// Keying material length in bytes for a given key length in bits
    ///
    /// AEAD ciphers carry a 4-byte salt after the key (RFC 5282, RFC 7634).
    pub fn keymat_len(self, key_bits: Option<u16>) -> usize {
        match self {
            EncrTransformId::AesCbc => usize::from(key_bits.unwrap_or(128)) / 8,
            EncrTransformId::AesGcm16 => usize::from(key_bits.unwrap_or(128)) / 8 + 4,
            EncrTransformId::ChaCha20Poly1305 => 32 + 4,
        }
    }
}

/// Transform ID for PRF algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PrfTransformId {
    /// HMAC-SHA2-256
    HmacSha256 = 5,
    /// HMAC-SHA2-384
    HmacSha384 = 6,
    /// HMAC-SHA2-512
    HmacSha512 = 7,
}

impl PrfTransformId {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            5 => Some(PrfTransformId::HmacSha256),
            6 => Some(PrfTransformId::HmacSha384),
            7 => Some(PrfTransformId::HmacSha512),
            _ => None,
        }
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Transform ID for Integrity algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum IntegTransformId {
    /// HMAC-SHA2-256-128 (128-bit ICV)
    HmacSha256_128 = 12,
    /// HMAC-SHA2-384-192 (192-bit ICV)
    HmacSha384_192 = 13,
    /// HMAC-SHA2-512-256 (256-bit ICV)
    HmacSha512_256 = 14,
}

impl IntegTransformId {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            12 => Some(IntegTransformId::HmacSha256_128),
            13 => Some(IntegTransformId::HmacSha384_192),
            14 => Some(IntegTransformId::HmacSha512_256),
            _ => None,
        }
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Integrity key length in bytes
    pub fn key_len(self) -> usize {
        match self {
            IntegTransformId::HmacSha256_128 => 32,
            IntegTransformId::HmacSha384_192 => 48,
            IntegTransformId::HmacSha512_256 => 64,
        }
    }
}

/// Transform ID for Diffie-Hellman groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DhTransformId {
    /// 1024-bit MODP Group
    Group2 = 2,
    /// 2048-bit MODP Group
    Group14 = 14,
    /// 3072-bit MODP Group
    Group15 = 15,
    /// 256-bit random ECP group
    Group19 = 19,
    /// Curve25519
    Group31 = 31,
}

impl DhTransformId {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            2 => Some(DhTransformId::Group2),
            14 => Some(DhTransformId::Group14),
            15 => Some(DhTransformId::Group15),
            19 => Some(DhTransformId::Group19),
            31 => Some(DhTransformId::Group31),
            _ => None,
        }
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// IKE Transform
///
/// Represents a single cryptographic algorithm choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    /// Transform type
    pub transform_type: TransformType,

    /// Transform ID
    pub transform_id: u16,

    /// Key length attribute in bits, if present
    pub key_length: Option<u16>,
}

impl Transform {
    /// Create new transform
    pub fn new(transform_type: TransformType, transform_id: u16) -> Self {
        Transform {
            transform_type,
            transform_id,
            key_length: None,
        }
    }

    /// Create encryption transform
    pub fn encr(id: EncrTransformId) -> Self {
        Transform::new(TransformType::Encr, id.to_u16())
    }

    /// Create encryption transform with key length attribute
    pub fn encr_with_key(id: EncrTransformId, key_bits: u16) -> Self {
        Transform::encr(id).with_key_length(key_bits)
    }

    /// Create PRF transform
    pub fn prf(id: PrfTransformId) -> Self {
        Transform::new(TransformType::Prf, id.to_u16())
    }

    /// Create integrity transform
    pub fn integ(id: IntegTransformId) -> Self {
        Transform::new(TransformType::Integ, id.to_u16())
    }

    /// Create DH group transform
    pub fn dh(id: DhTransformId) -> Self {
        Transform::new(TransformType::Dh, id.to_u16())
    }

    /// Create ESN transform (0 = no ESN, 1 = ESN)
    pub fn esn(enabled: bool) -> Self {
        Transform::new(TransformType::Esn, u16::from(enabled))
    }

    /// Set key length attribute
    pub fn with_key_length(mut self, key_bits: u16) -> Self {
        self.key_length = Some(key_bits);
        self
    }

    /// Check if this transform is compatible with another
    ///
    /// Type, ID and key length must all agree.
    pub fn is_compatible_with(&self, other: &Transform) -> bool {
        self.transform_type == other.transform_type
            && self.transform_id == other.transform_id
            && self.key_length == other.key_length
    }
}

/// Protocol ID for proposals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolId {
    /// IKE SA
    Ike = 1,
    /// AH (Authentication Header)
    Ah = 2,
    /// ESP (Encapsulating Security Payload)
    Esp = 3,
}

impl ProtocolId {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ProtocolId::Ike),
            2 => Some(ProtocolId::Ah),
            3 => Some(ProtocolId::Esp),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// IKE Proposal
///
/// Represents a single proposal containing one or more transforms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Proposal number (1-based)
    pub proposal_num: u8,

    /// Protocol ID (IKE, ESP, AH)
    pub protocol_id: ProtocolId,

    /// SPI - empty in IKE_SA_INIT, 8 bytes for IKE rekeying, 4 bytes for ESP/AH
    pub spi: Vec<u8>,

    /// List of transforms
    pub transforms: Vec<Transform>,
}

impl Proposal {
    /// Create new proposal
    pub fn new(proposal_num: u8, protocol_id: ProtocolId) -> Self {
        Proposal {
            proposal_num,
            protocol_id,
            spi: Vec::new(),
            transforms: Vec::new(),
        }
    }

    /// Add transform to proposal
    pub fn add_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Set SPI
    pub fn with_spi(mut self, spi: Vec<u8>) -> Self {
        self.spi = spi;
        self
    }

    /// Get first transform of a type
    pub fn get_transform(&self, transform_type: TransformType) -> Option<&Transform> {
        self.transforms
            .iter()
            .find(|t| t.transform_type == transform_type)
    }

    /// Iterate over all transforms of a type
    pub fn transforms_of(&self, transform_type: TransformType) -> impl Iterator<Item = &Transform> {
        self.transforms
            .iter()
            .filter(move |t| t.transform_type == transform_type)
    }

    /// Diffie-Hellman group of this proposal, if any
    pub fn dh_group(&self) -> Option<u16> {
        self.get_transform(TransformType::Dh).map(|t| t.transform_id)
    }

    /// Whether this proposal offers the given DH group
    pub fn has_dh_group(&self, group: u16) -> bool {
        self.transforms_of(TransformType::Dh)
            .any(|t| t.transform_id == group)
    }

    /// SPI interpreted as a child SA SPI (4 bytes, network order)
    pub fn child_spi(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.spi.as_slice().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// SPI interpreted as an IKE SPI (8 bytes, network order)
    pub fn ike_spi(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.spi.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// Select a proposal from `self` (local) and `other` (peer)
    ///
    /// For every transform type, the first local algorithm the peer also
    /// offers is picked. A type present on only one side, or with no common
    /// algorithm, makes the pair incompatible.
    ///
    /// The result carries the peer's proposal number and SPI and exactly one
    /// transform per negotiated type.
    pub fn select(&self, other: &Proposal) -> Option<Proposal> {
        if self.protocol_id != other.protocol_id {
            return None;
        }

        let mut selected = Proposal::new(other.proposal_num, other.protocol_id)
            .with_spi(other.spi.clone());

        for transform_type in TransformType::ALL {
            let mut ours = self.transforms_of(transform_type).peekable();
            let mut theirs = other.transforms_of(transform_type).peekable();

            match (ours.peek().is_some(), theirs.peek().is_some()) {
                (false, false) => continue,
                (true, true) => {}
                _ => return None,
            }

            let chosen = ours.find(|mine| {
                other
                    .transforms_of(transform_type)
                    .any(|peer| mine.is_compatible_with(peer))
            })?;
            selected.transforms.push(chosen.clone());
        }

        Some(selected)
    }
}

/// Select the first local proposal matching any peer proposal
///
/// Local order wins: each configured proposal is tried in turn against every
/// offered one. The returned proposal is an independent copy.
///
/// # Arguments
///
/// * `configured` - Locally configured acceptable proposals, in preference order
/// * `offered` - Proposals offered (or, in a response, chosen) by the peer
///
/// # Errors
///
/// Returns [`Error::NoProposalChosen`] if no pair is compatible.
pub fn select_proposal(configured: &[Proposal], offered: &[Proposal]) -> Result<Proposal> {
    configured
        .iter()
        .find_map(|mine| offered.iter().find_map(|peer| mine.select(peer)))
        .ok_or(Error::NoProposalChosen)
}

/// Validate the proposal list of a response and re-check it against policy
///
/// A responder must narrow the offer down to exactly one proposal.
///
/// # Errors
///
/// - [`Error::ProposalCount`] if the response does not contain exactly one proposal
/// - [`Error::NoProposalChosen`] if the chosen proposal was never offered
pub fn select_response_proposal(configured: &[Proposal], response: &[Proposal]) -> Result<Proposal> {
    if response.len() != 1 {
        return Err(Error::ProposalCount(response.len()));
    }
    select_proposal(configured, response)
}
