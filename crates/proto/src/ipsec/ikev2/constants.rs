//! IKEv2 protocol constants from RFC 7296

use std::fmt;

/// IKE major version handled by this core
pub const IKE_MAJOR_VERSION: u8 = 2;

/// Notify types below this value are error types (RFC 7296 Section 3.10.1)
///
/// Anything at or above it is a status notification.
pub const NOTIFY_STATUS_THRESHOLD: u16 = 16384;

/// Exchange Types (RFC 7296 Section 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExchangeType {
    /// IKE_SA_INIT exchange (34)
    IkeSaInit = 34,
    /// IKE_AUTH exchange (35)
    IkeAuth = 35,
    /// CREATE_CHILD_SA exchange (36)
    CreateChildSa = 36,
    /// INFORMATIONAL exchange (37)
    Informational = 37,
}

impl ExchangeType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            34 => Some(ExchangeType::IkeSaInit),
            35 => Some(ExchangeType::IkeAuth),
            36 => Some(ExchangeType::CreateChildSa),
            37 => Some(ExchangeType::Informational),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeType::IkeSaInit => "IKE_SA_INIT",
            ExchangeType::IkeAuth => "IKE_AUTH",
            ExchangeType::CreateChildSa => "CREATE_CHILD_SA",
            ExchangeType::Informational => "INFORMATIONAL",
        };
        f.write_str(name)
    }
}

/// IKE message flags (RFC 7296 Section 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IkeFlags(u8);

impl IkeFlags {
    /// Response flag (bit 5)
    pub const RESPONSE: u8 = 0x20;
    /// Initiator flag (bit 3), set by the original initiator of the IKE_SA
    pub const INITIATOR: u8 = 0x08;

    /// Create new flags
    pub fn new(value: u8) -> Self {
        IkeFlags(value & (Self::RESPONSE | Self::INITIATOR))
    }

    /// Flags for a request sent by the original initiator or responder
    pub fn request(original_initiator: bool) -> Self {
        if original_initiator {
            IkeFlags(Self::INITIATOR)
        } else {
            IkeFlags(0)
        }
    }

    /// Flags for a response sent by the original initiator or responder
    pub fn response(original_initiator: bool) -> Self {
        let mut flags = Self::RESPONSE;
        if original_initiator {
            flags |= Self::INITIATOR;
        }
        IkeFlags(flags)
    }

    /// Check if this is a response
    pub fn is_response(self) -> bool {
        (self.0 & Self::RESPONSE) != 0
    }

    /// Check if the sender is the original initiator
    pub fn is_initiator(self) -> bool {
        (self.0 & Self::INITIATOR) != 0
    }

    /// Get raw value
    pub fn value(self) -> u8 {
        self.0
    }
}

/// Payload Types (RFC 7296 Section 3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    /// Security Association (33)
    SA = 33,
    /// Key Exchange (34)
    KE = 34,
    /// Identification - Initiator (35)
    IDi = 35,
    /// Identification - Responder (36)
    IDr = 36,
    /// Certificate (37)
    CERT = 37,
    /// Certificate Request (38)
    CERTREQ = 38,
    /// Authentication (39)
    AUTH = 39,
    /// Nonce (40)
    Nonce = 40,
    /// Notify (41)
    N = 41,
    /// Delete (42)
    D = 42,
    /// Vendor ID (43)
    V = 43,
    /// Traffic Selector - Initiator (44)
    TSi = 44,
    /// Traffic Selector - Responder (45)
    TSr = 45,
    /// Configuration (47)
    CP = 47,
}

impl PayloadType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            33 => Some(PayloadType::SA),
            34 => Some(PayloadType::KE),
            35 => Some(PayloadType::IDi),
            36 => Some(PayloadType::IDr),
            37 => Some(PayloadType::CERT),
            38 => Some(PayloadType::CERTREQ),
            39 => Some(PayloadType::AUTH),
            40 => Some(PayloadType::Nonce),
            41 => Some(PayloadType::N),
            42 => Some(PayloadType::D),
            43 => Some(PayloadType::V),
            44 => Some(PayloadType::TSi),
            45 => Some(PayloadType::TSr),
            47 => Some(PayloadType::CP),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Notify message types used by the negotiation core (RFC 7296 Section 3.10.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum NotifyType {
    /// UNSUPPORTED_CRITICAL_PAYLOAD (1)
    UnsupportedCriticalPayload = 1,
    /// INVALID_IKE_SPI (4)
    InvalidIkeSpi = 4,
    /// INVALID_MAJOR_VERSION (5)
    InvalidMajorVersion = 5,
    /// INVALID_SYNTAX (7)
    InvalidSyntax = 7,
    /// INVALID_MESSAGE_ID (9)
    InvalidMessageId = 9,
    /// INVALID_SPI (11)
    InvalidSpi = 11,
    /// NO_PROPOSAL_CHOSEN (14)
    NoProposalChosen = 14,
    /// INVALID_KE_PAYLOAD (17)
    InvalidKePayload = 17,
    /// AUTHENTICATION_FAILED (24)
    AuthenticationFailed = 24,
    /// SINGLE_PAIR_REQUIRED (34)
    SinglePairRequired = 34,
    /// NO_ADDITIONAL_SAS (35)
    NoAdditionalSas = 35,
    /// INTERNAL_ADDRESS_FAILURE (36)
    InternalAddressFailure = 36,
    /// FAILED_CP_REQUIRED (37)
    FailedCpRequired = 37,
    /// TS_UNACCEPTABLE (38)
    TsUnacceptable = 38,
    /// INVALID_SELECTORS (39)
    InvalidSelectors = 39,
    /// TEMPORARY_FAILURE (43)
    TemporaryFailure = 43,
    /// CHILD_SA_NOT_FOUND (44)
    ChildSaNotFound = 44,
    /// INITIAL_CONTACT (16384)
    InitialContact = 16384,
    /// REKEY_SA (16393)
    RekeySa = 16393,
}

impl NotifyType {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(NotifyType::UnsupportedCriticalPayload),
            4 => Some(NotifyType::InvalidIkeSpi),
            5 => Some(NotifyType::InvalidMajorVersion),
            7 => Some(NotifyType::InvalidSyntax),
            9 => Some(NotifyType::InvalidMessageId),
            11 => Some(NotifyType::InvalidSpi),
            14 => Some(NotifyType::NoProposalChosen),
            17 => Some(NotifyType::InvalidKePayload),
            24 => Some(NotifyType::AuthenticationFailed),
            34 => Some(NotifyType::SinglePairRequired),
            35 => Some(NotifyType::NoAdditionalSas),
            36 => Some(NotifyType::InternalAddressFailure),
            37 => Some(NotifyType::FailedCpRequired),
            38 => Some(NotifyType::TsUnacceptable),
            39 => Some(NotifyType::InvalidSelectors),
            43 => Some(NotifyType::TemporaryFailure),
            44 => Some(NotifyType::ChildSaNotFound),
            16384 => Some(NotifyType::InitialContact),
            16393 => Some(NotifyType::RekeySa),
            _ => None,
        }
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Whether a raw notify type is an error type
pub fn is_error_notify(notify_type: u16) -> bool {
    notify_type < NOTIFY_STATUS_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_type_conversion() {
        assert_eq!(ExchangeType::from_u8(34), Some(ExchangeType::IkeSaInit));
        assert_eq!(ExchangeType::from_u8(37), Some(ExchangeType::Informational));
        assert_eq!(ExchangeType::from_u8(99), None);
        assert_eq!(ExchangeType::CreateChildSa.to_u8(), 36);
        assert_eq!(ExchangeType::IkeAuth.to_string(), "IKE_AUTH");
    }

    #[test]
    fn test_ike_flags() {
        let flags = IkeFlags::request(true);
        assert!(flags.is_initiator());
        assert!(!flags.is_response());

        let flags = IkeFlags::response(false);
        assert!(!flags.is_initiator());
        assert!(flags.is_response());

        // Version bit and reserved bits are masked off
        assert_eq!(IkeFlags::new(0xff).value(), 0x28);
    }

    #[test]
    fn test_notify_type_conversion() {
        assert_eq!(NotifyType::from_u16(17), Some(NotifyType::InvalidKePayload));
        assert_eq!(NotifyType::RekeySa.to_u16(), 16393);
        assert_eq!(NotifyType::from_u16(12345), None);
    }

    #[test]
    fn test_error_notify_threshold() {
        assert!(is_error_notify(14));
        assert!(is_error_notify(16383));
        assert!(!is_error_notify(16384));
        assert!(!is_error_notify(40000));
    }
}
