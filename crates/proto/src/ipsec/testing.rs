//! In-memory collaborators for unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use vigil_platform::{DhFactory, DiffieHellman, Packet, PlatformError, PlatformResult, Transport};
use zeroize::Zeroizing;

use super::child_sa::MemoryChildSaFactory;
use super::config::StaticConfigStore;
use super::crypto::KeyMaterial;
use super::ikev2::auth::PskAuthenticator;
use super::ikev2::ike_sa::Services;
use super::ikev2::message::{Message, MessageCodec};
use super::Result;

/// Codec that remembers every generated message under its datagram
#[derive(Default)]
pub(crate) struct TransparentCodec {
    counter: AtomicU64,
    generated: Mutex<HashMap<Vec<u8>, Message>>,
}

impl TransparentCodec {
    pub(crate) fn decode(&self, packet: &Packet) -> Option<Message> {
        self.generated.lock().get(&packet.data).cloned()
    }
}

impl MessageCodec for TransparentCodec {
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

/// Transport that keeps every packet
#[derive(Default)]
pub(crate) struct RecordingTransport {
    pub(crate) sent: Mutex<Vec<Packet>>,
    pub(crate) fail: AtomicBool,
}

impl Transport for RecordingTransport {
    fn send(&self, packet: &Packet) -> PlatformResult<()> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(PlatformError::Transport("link down".into()));
        }
        self.sent.lock().push(packet.clone());
        Ok(())
    }
}

/// Symmetric stand-in for Diffie-Hellman: both sides hash the two public values
pub(crate) struct TestDh {
    group: u16,
    public: Vec<u8>,
    other: Option<Vec<u8>>,
}

impl DiffieHellman for TestDh {
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

/// Creates [`TestDh`] for a fixed set of groups
pub(crate) struct TestDhFactory {
    pub(crate) groups: Vec<u16>,
}

impl DhFactory for TestDhFactory {
    fn create(&self, group: u16) -> PlatformResult<Box<dyn DiffieHellman>> {
        if !self.groups.contains(&group) {
            return Err(PlatformError::Crypto(format!("DH group {} unsupported", group)));
        }
        let mut public = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut public);
        Ok(Box::new(TestDh {
            group,
            public,
            other: None,
        }))
    }
}

/// Services around an empty config store
pub(crate) fn create_test_services() -> Arc<Services> {
    create_test_services_with(StaticConfigStore::new())
}

/// Services around `config`
pub(crate) fn create_test_services_with(config: StaticConfigStore) -> Arc<Services> {
    Arc::new(Services::new(
        Arc::new(config),
        Arc::new(TransparentCodec::default()),
        Arc::new(RecordingTransport::default()),
        Arc::new(PskAuthenticator::new("test-secret")),
        Arc::new(MemoryChildSaFactory::new()),
        Arc::new(TestDhFactory {
            groups: vec![14, 19, 20],
        }),
    ))
}
