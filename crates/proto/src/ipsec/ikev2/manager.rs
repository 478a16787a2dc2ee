//! IKE_SA manager: registry with exclusive checkout
//!
//! Every IKE_SA lives in the manager while nobody works on it. A worker
//! checks an SA out, owns it exclusively for one dispatch cycle and checks it
//! back in. A second checkout of the same SA blocks until then.
//!
//! ```text
//!            checkout_new / checkout
//!   registry ----------------------> worker
//!      ^                               |
//!      +------ checkin ----------------+
//!              checkin_and_destroy (entry removed, waiters get None)
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::constants::{ExchangeType, IKE_MAJOR_VERSION};
use super::ike_sa::{IkeSa, Services};
use super::message::{IkeSaId, Message};
use crate::ipsec::logging;
use crate::ipsec::metrics::IkeMetrics;

struct Entry {
    id: IkeSaId,
    other_host: Option<SocketAddr>,
    /// `None` while checked out
    sa: Option<Box<IkeSa>>,
}

/// Registry of all IKE_SAs, keyed by our own SPI
pub struct IkeSaManager {
    entries: Mutex<HashMap<u64, Entry>>,
    available: Condvar,
    services: Arc<Services>,
}

impl IkeSaManager {
    /// Create an empty manager; every SA it creates shares `services`
    pub fn new(services: Arc<Services>) -> Self {
        IkeSaManager {
            entries: Mutex::new(HashMap::new()),
            available: Condvar::new(),
            services,
        }
    }

    /// Collaborators shared by all SAs
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Counters of all SAs
    pub fn metrics(&self) -> &IkeMetrics {
        &self.services.metrics
    }

    /// Check out the SA with our SPI `local_spi`, waiting while another
    /// worker holds it
    fn checkout_spi(&self, local_spi: u64) -> Option<Box<IkeSa>> {
        let mut entries = self.entries.lock();
        loop {
            let entry = entries.get_mut(&local_spi)?;
            if let Some(sa) = entry.sa.take() {
                return Some(sa);
            }
            self.available.wait(&mut entries);
        }
    }

    /// Check out an existing SA
    ///
    /// Blocks while another worker holds it. Returns `None` if the SA does
    /// not exist or was destroyed while waiting.
    pub fn checkout(&self, id: &IkeSaId) -> Option<Box<IkeSa>> {
        self.checkout_spi(id.local_spi())
    }

    /// Create a new SA with a fresh local SPI, already checked out
    pub fn checkout_new(&self, version: u8, initiator: bool) -> Box<IkeSa> {
        let id = {
            let mut entries = self.entries.lock();
            let id = if initiator {
                Self::fresh_id(&entries, IkeSaId::new_initiator)
            } else {
                Self::fresh_id(&entries, || IkeSaId::new_responder(0))
            };
            Self::register(&mut entries, id, None);
            id
        };
        self.create_sa(id, version)
    }

    /// Check out the SA an inbound message belongs to
    ///
    /// A new IKE_SA_INIT request creates a responder SA; the flag in the
    /// result tells whether that happened. Retransmitted IKE_SA_INIT requests
    /// find the SA created by the first copy.
    pub fn checkout_by_message(&self, message: &Message) -> Option<(Box<IkeSa>, bool)> {
        let header = message.ike_sa_id;
        // the INITIATOR flag names the sender's role
        let we_respond = header.is_initiator;

        if we_respond && header.responder_spi == 0 {
            if message.exchange_type != ExchangeType::IkeSaInit || !message.is_request() {
                debug!(ike_sa = %header, "Message without responder SPI ignored");
                return None;
            }
            // lookup and insert under one lock so duplicates find the first copy
            let mut entries = self.entries.lock();
            if let Some(local_spi) =
                Self::find_half_open(&entries, header.initiator_spi, message.source)
            {
                drop(entries);
                return self.checkout_spi(local_spi).map(|sa| (sa, false));
            }
            let id = Self::fresh_id(&entries, || IkeSaId::new_responder(header.initiator_spi));
            Self::register(&mut entries, id, Some(message.source));
            drop(entries);
            let mut sa = self.create_sa(id, IKE_MAJOR_VERSION);
            sa.set_other_host(message.source);
            return Some((sa, true));
        }

        let (local_spi, remote_spi) = if we_respond {
            (header.responder_spi, header.initiator_spi)
        } else {
            (header.initiator_spi, header.responder_spi)
        };
        let sa = self.checkout_spi(local_spi)?;
        let known = sa.id().remote_spi();
        if known != 0 && known != remote_spi {
            debug!(ike_sa = %sa.id(), remote_spi = %format!("{:016x}", remote_spi), "SPI mismatch");
            self.checkin(sa);
            return None;
        }
        Some((sa, false))
    }

    fn fresh_id(entries: &HashMap<u64, Entry>, generate: impl Fn() -> IkeSaId) -> IkeSaId {
        loop {
            let id = generate();
            if !entries.contains_key(&id.local_spi()) {
                return id;
            }
        }
    }

    /// Add a checked-out entry for `id`
    fn register(entries: &mut HashMap<u64, Entry>, id: IkeSaId, other_host: Option<SocketAddr>) {
        entries.insert(
            id.local_spi(),
            Entry {
                id,
                other_host,
                sa: None,
            },
        );
    }

    fn create_sa(&self, id: IkeSaId, version: u8) -> Box<IkeSa> {
        self.services.metrics.record_ike_sa_created();
        logging::log_ike_sa_created(id.initiator_spi, id.responder_spi, id.is_initiator);
        Box::new(IkeSa::new(id, version, Arc::clone(&self.services)))
    }

    fn find_half_open(
        entries: &HashMap<u64, Entry>,
        initiator_spi: u64,
        source: SocketAddr,
    ) -> Option<u64> {
        entries
            .iter()
            .find(|(_, e)| {
                !e.id.is_initiator
                    && e.id.initiator_spi == initiator_spi
                    && e.other_host == Some(source)
            })
            .map(|(spi, _)| *spi)
    }

    /// Return a checked-out SA to the registry
    pub fn checkin(&self, sa: Box<IkeSa>) {
        let id = sa.id();
        let other_host = sa.other_host();
        let mut entries = self.entries.lock();
        let entry = entries.entry(id.local_spi()).or_insert(Entry {
            id,
            other_host: None,
            sa: None,
        });
        entry.id = id;
        entry.other_host = Some(other_host);
        entry.sa = Some(sa);
        drop(entries);
        self.available.notify_all();
    }

    /// Tear a checked-out SA down and drop it from the registry
    pub fn checkin_and_destroy(&self, mut sa: Box<IkeSa>) {
        let id = sa.id();
        sa.destroy(self);
        self.entries.lock().remove(&id.local_spi());
        self.available.notify_all();

        self.services.metrics.record_ike_sa_deleted();
        logging::log_ike_sa_destroyed(id.initiator_spi, id.responder_spi);
    }

    /// Number of SAs, checked out or not
    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether an SA with our SPI from `id` exists
    pub fn contains(&self, id: &IkeSaId) -> bool {
        self.entries.lock().contains_key(&id.local_spi())
    }

    /// IDs of all registered SAs
    pub fn ids(&self) -> Vec<IkeSaId> {
        self.entries.lock().values().map(|e| e.id).collect()
    }

    /// Destroy every SA that is checked in
    pub fn flush(&self) {
        let spis: Vec<u64> = self.entries.lock().keys().copied().collect();
        for spi in spis {
            let sa = self
                .entries
                .lock()
                .get_mut(&spi)
                .and_then(|entry| entry.sa.take());
            if let Some(sa) = sa {
                self.checkin_and_destroy(sa);
            }
        }
    }
}
