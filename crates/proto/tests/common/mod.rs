//! Two-peer harness for IKEv2 integration tests
//!
//! Both peers share one codec that hands the generated [`Message`] across
//! instead of encoding it, so tests see exactly what the other side built.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use vigil_platform::{DhFactory, DiffieHellman, Packet, PlatformError, PlatformResult, Transport};
use vigil_proto::ipsec::bus::Bus;
use vigil_proto::ipsec::child_sa::MemoryChildSaFactory;
use vigil_proto::ipsec::config::{
    default_ike_proposals, ConnectionConfig, PolicyConfig, RetransmitConfig, StaticConfigStore,
};
use vigil_proto::ipsec::crypto::KeyMaterial;
use vigil_proto::ipsec::ikev2::proposal::Proposal;
use vigil_proto::ipsec::ikev2::{
    Dispatcher, IkeSa, IkeSaId, IkeSaManager, Identification, Message, MessageCodec,
    PskAuthenticator, Services, StateOutcome, TrafficSelector,
};
use vigil_proto::ipsec::Result;
use zeroize::Zeroizing;

pub const INITIATOR_ADDR: &str = "192.0.2.1:500";
pub const RESPONDER_ADDR: &str = "192.0.2.2:500";
pub const PSK: &str = "integration-secret";

/// Codec that passes messages by reference to their datagram
#[derive(Default)]
pub struct SharedCodec {
    counter: AtomicU64,
    generated: Mutex<HashMap<Vec<u8>, Message>>,
}

impl SharedCodec {
    /// Message a datagram was generated from
    pub fn decode(&self, packet: &Packet) -> Option<Message> {
        self.generated.lock().get(&packet.data).cloned()
    }
}

impl MessageCodec for SharedCodec {
    fn generate(&self, message: &Message, _keys: Option<&KeyMaterial>) -> Result<Vec<u8>> {
        let mut data = self.counter.fetch_add(1, Ordering::Relaxed).to_be_bytes().to_vec();
        data.extend_from_slice(message.to_string().as_bytes());
        let mut stored = message.clone();
        stored.packet_data = data.clone();
        self.generated.lock().insert(data.clone(), stored);
        Ok(data)
    }

    fn parse_body(&self, _message: &mut Message, _keys: Option<&KeyMaterial>) -> Result<()> {
        Ok(())
    }
}

/// Transport that queues packets for the test to deliver
#[derive(Default)]
pub struct QueueTransport {
    queue: Mutex<Vec<Packet>>,
    sent: AtomicU64,
    pub down: AtomicBool,
}

impl QueueTransport {
    pub fn take(&self) -> Vec<Packet> {
        std::mem::take(&mut *self.queue.lock())
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Transport for QueueTransport {
    fn send(&self, packet: &Packet) -> PlatformResult<()> {
        if self.down.load(Ordering::Relaxed) {
            return Err(PlatformError::Transport("link down".into()));
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push(packet.clone());
        Ok(())
    }
}

/// Both sides hash the two public values in sorted order
pub struct HashDh {
    group: u16,
    public: Vec<u8>,
    other: Option<Vec<u8>>,
}

impl DiffieHellman for HashDh {
    fn group(&self) -> u16 {
        self.group
    }

    fn my_public_value(&self) -> Vec<u8> {
        self.public.clone()
    }

    fn set_other_public_value(&mut self, value: &[u8]) -> PlatformResult<()> {
        if value.is_empty() {
            return Err(PlatformError::Crypto("empty public value".into()));
        }
        self.other = Some(value.to_vec());
        Ok(())
    }

    fn shared_secret(&self) -> PlatformResult<Zeroizing<Vec<u8>>> {
        let other = self
            .other
            .as_ref()
            .ok_or_else(|| PlatformError::Crypto("peer public value missing".into()))?;
        let (low, high) = if self.public <= *other {
            (&self.public, other)
        } else {
            (other, &self.public)
        };
        let mut hasher = Sha256::new();
        hasher.update(low);
        hasher.update(high);
        Ok(Zeroizing::new(hasher.finalize().to_vec()))
    }
}

pub struct HashDhFactory;

impl DhFactory for HashDhFactory {
    fn create(&self, group: u16) -> PlatformResult<Box<dyn DiffieHellman>> {
        let mut public = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut public);
        Ok(Box::new(HashDh {
            group,
            public,
            other: None,
        }))
    }
}

/// One side of a negotiation
pub struct Peer {
    pub dispatcher: Dispatcher,
    pub transport: Arc<QueueTransport>,
    pub children: Arc<MemoryChildSaFactory>,
    pub bus: Bus,
    pub connection: Arc<ConnectionConfig>,
    pub policy: Arc<PolicyConfig>,
}

impl Peer {
    pub fn manager(&self) -> &Arc<IkeSaManager> {
        self.dispatcher.manager()
    }

    /// ID of the only SA this peer has
    pub fn only_sa(&self) -> IkeSaId {
        let ids = self.manager().ids();
        assert_eq!(ids.len(), 1, "expected exactly one IKE_SA, got {:?}", ids);
        ids[0]
    }

    /// Run `f` on a checked-out SA
    pub fn with_sa<T>(&self, id: &IkeSaId, f: impl FnOnce(&mut IkeSa) -> T) -> T {
        let mut sa = self.manager().checkout(id).expect("SA exists");
        let result = f(&mut sa);
        self.manager().checkin(sa);
        result
    }

    /// Start an IKE_SA with this peer's own config
    pub fn initiate(&self) -> IkeSaId {
        self.dispatcher
            .initiate(&self.bus, self.connection.clone(), self.policy.clone())
            .expect("initiate")
    }
}

/// Initiator and responder sharing one codec
pub struct Pair {
    pub codec: Arc<SharedCodec>,
    pub initiator: Peer,
    pub responder: Peer,
}

pub struct PairBuilder {
    initiator_proposals: Vec<Proposal>,
    responder_proposals: Vec<Proposal>,
    retransmit: RetransmitConfig,
}

impl Default for PairBuilder {
    fn default() -> Self {
        PairBuilder {
            initiator_proposals: default_ike_proposals(),
            responder_proposals: default_ike_proposals(),
            retransmit: RetransmitConfig::default(),
        }
    }
}

impl PairBuilder {
    pub fn initiator_proposals(mut self, proposals: Vec<Proposal>) -> Self {
        self.initiator_proposals = proposals;
        self
    }

    pub fn responder_proposals(mut self, proposals: Vec<Proposal>) -> Self {
        self.responder_proposals = proposals;
        self
    }

    pub fn retransmit(mut self, retransmit: RetransmitConfig) -> Self {
        self.retransmit = retransmit;
        self
    }

    pub fn build(self) -> Pair {
        let codec = Arc::new(SharedCodec::default());
        let initiator = create_peer(
            &codec,
            "moon",
            INITIATOR_ADDR,
            RESPONDER_ADDR,
            ("moon.example.org", "sun.example.org"),
            ("10.1.0.0", "10.2.0.0"),
            self.initiator_proposals,
            self.retransmit,
        );
        let responder = create_peer(
            &codec,
            "sun",
            RESPONDER_ADDR,
            INITIATOR_ADDR,
            ("sun.example.org", "moon.example.org"),
            ("10.2.0.0", "10.1.0.0"),
            self.responder_proposals,
            self.retransmit,
        );
        Pair {
            codec,
            initiator,
            responder,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn create_peer(
    codec: &Arc<SharedCodec>,
    name: &str,
    me: &str,
    other: &str,
    ids: (&str, &str),
    nets: (&str, &str),
    proposals: Vec<Proposal>,
    retransmit: RetransmitConfig,
) -> Peer {
    let connection = Arc::new(
        ConnectionConfig::builder()
            .with_name(name)
            .with_my_host(me.parse().unwrap())
            .with_other_host(other.parse().unwrap())
            .with_proposals(proposals)
            .with_retransmit(retransmit)
            .build()
            .unwrap(),
    );
    let policy = Arc::new(
        PolicyConfig::builder()
            .with_name(format!("{}-net", name))
            .with_my_id(Identification::fqdn(ids.0))
            .with_other_id(Identification::fqdn(ids.1))
            .with_my_ts(TrafficSelector::subnet(nets.0.parse().unwrap(), 16).unwrap())
            .with_other_ts(TrafficSelector::subnet(nets.1.parse().unwrap(), 16).unwrap())
            .build()
            .unwrap(),
    );
    let store = StaticConfigStore::new()
        .with_connection(connection.clone())
        .with_policy(name, policy.clone());

    let transport = Arc::new(QueueTransport::default());
    let children = Arc::new(MemoryChildSaFactory::new());
    let services = Services::new(
        Arc::new(store),
        codec.clone(),
        transport.clone(),
        Arc::new(PskAuthenticator::new(PSK)),
        children.clone(),
        Arc::new(HashDhFactory),
    );

    Peer {
        dispatcher: Dispatcher::new(Arc::new(IkeSaManager::new(Arc::new(services)))),
        transport,
        children,
        bus: Bus::new(),
        connection,
        policy,
    }
}

impl Pair {
    pub fn new() -> Self {
        PairBuilder::default().build()
    }

    pub fn builder() -> PairBuilder {
        PairBuilder::default()
    }

    /// Decode everything `from` sent so far
    pub fn take_messages(&self, from: &Peer) -> Vec<Message> {
        from.transport
            .take()
            .iter()
            .map(|packet| self.codec.decode(packet).expect("packet from shared codec"))
            .collect()
    }

    /// Dispatch the given messages to `to`
    pub fn deliver_messages(&self, to: &Peer, messages: Vec<Message>) -> Vec<StateOutcome> {
        messages
            .into_iter()
            .map(|message| to.dispatcher.dispatch(&to.bus, message))
            .collect()
    }

    /// Move every pending packet of `from` to `to`
    pub fn deliver(&self, from: &Peer, to: &Peer) -> Vec<StateOutcome> {
        let messages = self.take_messages(from);
        self.deliver_messages(to, messages)
    }

    /// Shuttle packets both ways until nothing is left
    pub fn settle(&self) {
        for _ in 0..32 {
            if self.initiator.transport.pending() == 0 && self.responder.transport.pending() == 0 {
                return;
            }
            self.deliver(&self.initiator, &self.responder);
            self.deliver(&self.responder, &self.initiator);
        }
        panic!("peers kept exchanging messages");
    }

    /// Run a full IKE_SA_INIT and IKE_AUTH; returns (initiator, responder) IDs
    pub fn establish(&self) -> (IkeSaId, IkeSaId) {
        let id = self.initiator.initiate();
        self.settle();
        (id, self.responder.only_sa())
    }
}
