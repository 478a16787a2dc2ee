//! IKEv2 messages as exchanged with the codec and transport
//!
//! A [`Message`] is the decoded form of one IKE datagram (RFC 7296 Section 3.1):
//! header fields, addressing and an ordered list of typed payloads. Turning it
//! into bytes and back, including SK payload encryption, is the job of a
//! [`MessageCodec`] supplied from outside the core.

use std::fmt;
use std::net::SocketAddr;

use rand::RngCore;

use super::constants::{ExchangeType, IkeFlags, NotifyType};
use super::payload::{
    AuthPayload, DeletePayload, IdPayload, KePayload, NoncePayload, NotifyPayload, Payload,
    SaPayload, TsPayload,
};
use crate::ipsec::crypto::KeyMaterial;
use crate::ipsec::Result;

/// IKE_SA identifier: the SPI pair plus our role
///
/// The responder SPI is zero until the responder has picked one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IkeSaId {
    /// SPI chosen by the original initiator
    pub initiator_spi: u64,

    /// SPI chosen by the original responder (0 while unknown)
    pub responder_spi: u64,

    /// Whether we are the original initiator
    pub is_initiator: bool,
}

impl IkeSaId {
    /// Create identifier from both SPIs
    pub fn new(initiator_spi: u64, responder_spi: u64, is_initiator: bool) -> Self {
        IkeSaId {
            initiator_spi,
            responder_spi,
            is_initiator,
        }
    }

    /// Random non-zero SPI
    pub fn generate_spi() -> u64 {
        let mut rng = rand::thread_rng();
        loop {
            let spi = rng.next_u64();
            if spi != 0 {
                return spi;
            }
        }
    }

    /// Fresh identifier for an SA we initiate
    pub fn new_initiator() -> Self {
        IkeSaId::new(Self::generate_spi(), 0, true)
    }

    /// Fresh identifier for an SA a peer initiated
    pub fn new_responder(initiator_spi: u64) -> Self {
        IkeSaId::new(initiator_spi, Self::generate_spi(), false)
    }

    /// SPI we chose
    pub fn local_spi(&self) -> u64 {
        if self.is_initiator {
            self.initiator_spi
        } else {
            self.responder_spi
        }
    }

    /// SPI the peer chose (0 if not yet known)
    pub fn remote_spi(&self) -> u64 {
        if self.is_initiator {
            self.responder_spi
        } else {
            self.initiator_spi
        }
    }

    /// Same SA seen from the other side of the wire
    pub fn flipped(&self) -> Self {
        IkeSaId {
            is_initiator: !self.is_initiator,
            ..*self
        }
    }
}

impl fmt::Display for IkeSaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{}_{:016x}{}",
            self.initiator_spi,
            if self.is_initiator { "*" } else { "" },
            self.responder_spi,
            if self.is_initiator { "" } else { "*" },
        )
    }
}

/// A decoded IKE message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// SPI pair from the header; `is_initiator` mirrors the INITIATOR flag
    pub ike_sa_id: IkeSaId,

    /// Exchange type
    pub exchange_type: ExchangeType,

    /// Header flags
    pub flags: IkeFlags,

    /// Message ID
    pub message_id: u32,

    /// Sender address
    pub source: SocketAddr,

    /// Receiver address
    pub destination: SocketAddr,

    /// Payloads, in message order
    pub payloads: Vec<Payload>,

    /// Raw datagram as received or generated
    pub packet_data: Vec<u8>,
}

impl Message {
    /// Create an empty message
    pub fn new(
        ike_sa_id: IkeSaId,
        exchange_type: ExchangeType,
        flags: IkeFlags,
        message_id: u32,
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Self {
        Message {
            ike_sa_id,
            exchange_type,
            flags,
            message_id,
            source,
            destination,
            payloads: Vec::new(),
            packet_data: Vec::new(),
        }
    }

    /// Create a request sent from `source` to `destination`
    pub fn request(
        ike_sa_id: IkeSaId,
        exchange_type: ExchangeType,
        message_id: u32,
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Self {
        Message::new(
            ike_sa_id,
            exchange_type,
            IkeFlags::request(ike_sa_id.is_initiator),
            message_id,
            source,
            destination,
        )
    }

    /// Create an empty response to `request` on behalf of `ike_sa_id`
    pub fn response_to(request: &Message, ike_sa_id: IkeSaId) -> Self {
        Message::new(
            ike_sa_id,
            request.exchange_type,
            IkeFlags::response(ike_sa_id.is_initiator),
            request.message_id,
            request.destination,
            request.source,
        )
    }

    /// Whether this is a request
    pub fn is_request(&self) -> bool {
        !self.flags.is_response()
    }

    /// Append a payload
    pub fn add_payload(&mut self, payload: Payload) {
        self.payloads.push(payload);
    }

    /// Builder-style [`add_payload`](Self::add_payload)
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payloads.push(payload);
        self
    }

    /// Whether the message carries no payloads (e.g. a liveness check)
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// All notify payloads
    pub fn notifies(&self) -> impl Iterator<Item = &NotifyPayload> {
        self.payloads.iter().filter_map(|p| match p {
            Payload::Notify(n) => Some(n),
            _ => None,
        })
    }

    /// First notify of a given type
    pub fn get_notify(&self, notify_type: NotifyType) -> Option<&NotifyPayload> {
        let raw = notify_type.to_u16();
        self.notifies().find(|n| n.notify_type == raw)
    }

    /// First SA payload
    pub fn sa(&self) -> Option<&SaPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Sa(sa) => Some(sa),
            _ => None,
        })
    }

    /// First KE payload
    pub fn ke(&self) -> Option<&KePayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Ke(ke) => Some(ke),
            _ => None,
        })
    }

    /// First Nonce payload
    pub fn nonce(&self) -> Option<&NoncePayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Nonce(n) => Some(n),
            _ => None,
        })
    }

    /// First IDi payload
    pub fn id_i(&self) -> Option<&IdPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::IdI(id) => Some(id),
            _ => None,
        })
    }

    /// First IDr payload
    pub fn id_r(&self) -> Option<&IdPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::IdR(id) => Some(id),
            _ => None,
        })
    }

    /// First AUTH payload
    pub fn auth(&self) -> Option<&AuthPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::Auth(a) => Some(a),
            _ => None,
        })
    }

    /// First TSi payload
    pub fn ts_i(&self) -> Option<&TsPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::TsI(ts) => Some(ts),
            _ => None,
        })
    }

    /// First TSr payload
    pub fn ts_r(&self) -> Option<&TsPayload> {
        self.payloads.iter().find_map(|p| match p {
            Payload::TsR(ts) => Some(ts),
            _ => None,
        })
    }

    /// All Delete payloads
    pub fn deletes(&self) -> impl Iterator<Item = &DeletePayload> {
        self.payloads.iter().filter_map(|p| match p {
            Payload::Delete(d) => Some(d),
            _ => None,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} [",
            self.exchange_type,
            if self.is_request() { "request" } else { "response" },
            self.message_id
        )?;
        for (i, payload) in self.payloads.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            let name = match payload {
                Payload::Sa(_) => "SA".to_string(),
                Payload::Ke(_) => "KE".to_string(),
                Payload::Nonce(_) => "No".to_string(),
                Payload::Notify(n) => format!("N({})", n.notify_type),
                Payload::IdI(_) => "IDi".to_string(),
                Payload::IdR(_) => "IDr".to_string(),
                Payload::Auth(_) => "AUTH".to_string(),
                Payload::TsI(_) => "TSi".to_string(),
                Payload::TsR(_) => "TSr".to_string(),
                Payload::Delete(_) => "D".to_string(),
                Payload::Unknown { payload_type, .. } => format!("U({})", payload_type),
            };
            f.write_str(&name)?;
        }
        f.write_str("]")
    }
}

/// Wire codec for whole messages
///
/// Implementations own the header layout, payload encoding and SK payload
/// protection. `keys` is `None` for unprotected IKE_SA_INIT messages.
pub trait MessageCodec: Send + Sync {
    /// Encode (and protect) a message, returning the datagram bytes
    ///
    /// # Errors
    ///
    /// Returns an error if a payload cannot be encoded
    fn generate(&self, message: &Message, keys: Option<&KeyMaterial>) -> Result<Vec<u8>>;

    /// Verify, decrypt and decode the message body in place
    ///
    /// # Errors
    ///
    /// Returns an error if the body is malformed or fails integrity checks
    fn parse_body(&self, message: &mut Message, keys: Option<&KeyMaterial>) -> Result<()>;
}
