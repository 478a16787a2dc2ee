//! Metrics for IKEv2 negotiation
//!
//! Counters for IKE_SA and child SA lifecycle, handshake retries and message
//! traffic. All counters are atomic; a [`IkeMetrics`] value is cheap to clone
//! and every clone updates the same counters.
//!
//! # Example
//!
//! ```
//! use vigil_proto::ipsec::metrics::IkeMetrics;
//!
//! let metrics = IkeMetrics::new();
//! metrics.record_ike_sa_created();
//! metrics.record_ike_sa_established();
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.ike_sa_active, 1);
//! assert_eq!(snapshot.ike_sa_established, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// IKE metrics for monitoring
#[derive(Debug, Clone)]
pub struct IkeMetrics {
    /// IKE SAs created (initiator or responder)
    pub ike_sa_created: Arc<AtomicU64>,

    /// IKE SAs that reached ESTABLISHED
    pub ike_sa_established: Arc<AtomicU64>,

    /// IKE SAs destroyed
    pub ike_sa_deleted: Arc<AtomicU64>,

    /// Currently registered IKE SAs
    pub ike_sa_active: Arc<AtomicU64>,

    /// Child SAs installed
    pub child_sa_created: Arc<AtomicU64>,

    /// Child SAs deleted
    pub child_sa_deleted: Arc<AtomicU64>,

    /// IKE_SA_INIT retries after INVALID_KE_PAYLOAD
    pub dh_group_retries: Arc<AtomicU64>,

    /// IKE SAs rekeyed
    pub ike_sa_rekeyed: Arc<AtomicU64>,

    /// IKE SAs reauthenticated
    pub ike_sa_reauthenticated: Arc<AtomicU64>,

    /// Messages handed to the transport
    pub messages_sent: Arc<AtomicU64>,

    /// Messages received
    pub messages_received: Arc<AtomicU64>,

    /// Requests retransmitted
    pub retransmits: Arc<AtomicU64>,

    /// Proposal negotiation failures
    pub proposal_negotiation_failed: Arc<AtomicU64>,

    /// Authentication failures
    pub authentication_failed: Arc<AtomicU64>,
}

impl IkeMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self {
            ike_sa_created: Arc::new(AtomicU64::new(0)),
            ike_sa_established: Arc::new(AtomicU64::new(0)),
            ike_sa_deleted: Arc::new(AtomicU64::new(0)),
            ike_sa_active: Arc::new(AtomicU64::new(0)),
            child_sa_created: Arc::new(AtomicU64::new(0)),
            child_sa_deleted: Arc::new(AtomicU64::new(0)),
            dh_group_retries: Arc::new(AtomicU64::new(0)),
            ike_sa_rekeyed: Arc::new(AtomicU64::new(0)),
            ike_sa_reauthenticated: Arc::new(AtomicU64::new(0)),
            messages_sent: Arc::new(AtomicU64::new(0)),
            messages_received: Arc::new(AtomicU64::new(0)),
            retransmits: Arc::new(AtomicU64::new(0)),
            proposal_negotiation_failed: Arc::new(AtomicU64::new(0)),
            authentication_failed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record IKE SA created
    pub fn record_ike_sa_created(&self) {
        self.ike_sa_created.fetch_add(1, Ordering::Relaxed);
        self.ike_sa_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record IKE SA established
    pub fn record_ike_sa_established(&self) {
        self.ike_sa_established.fetch_add(1, Ordering::Relaxed);
    }

    /// Record IKE SA deleted
    pub fn record_ike_sa_deleted(&self) {
        let _ = self
            .ike_sa_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.ike_sa_deleted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record Child SA created
    pub fn record_child_sa_created(&self) {
        self.child_sa_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record Child SA deleted
    pub fn record_child_sa_deleted(&self) {
        self.child_sa_deleted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an IKE_SA_INIT retry with a different DH group
    pub fn record_dh_group_retry(&self) {
        self.dh_group_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record IKE SA rekeyed
    pub fn record_ike_sa_rekeyed(&self) {
        self.ike_sa_rekeyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record IKE SA reauthenticated
    pub fn record_ike_sa_reauthenticated(&self) {
        self.ike_sa_reauthenticated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record message sent
    pub fn record_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record message received
    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record request retransmitted
    pub fn record_retransmit(&self) {
        self.retransmits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record proposal negotiation failure
    pub fn record_proposal_negotiation_failed(&self) {
        self.proposal_negotiation_failed
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record authentication failure
    pub fn record_authentication_failed(&self) {
        self.authentication_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    ///
    /// Values may be slightly inconsistent across counters due to concurrent
    /// updates.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ike_sa_created: self.ike_sa_created.load(Ordering::Relaxed),
            ike_sa_established: self.ike_sa_established.load(Ordering::Relaxed),
            ike_sa_deleted: self.ike_sa_deleted.load(Ordering::Relaxed),
            ike_sa_active: self.ike_sa_active.load(Ordering::Relaxed),
            child_sa_created: self.child_sa_created.load(Ordering::Relaxed),
            child_sa_deleted: self.child_sa_deleted.load(Ordering::Relaxed),
            dh_group_retries: self.dh_group_retries.load(Ordering::Relaxed),
            ike_sa_rekeyed: self.ike_sa_rekeyed.load(Ordering::Relaxed),
            ike_sa_reauthenticated: self.ike_sa_reauthenticated.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
            proposal_negotiation_failed: self.proposal_negotiation_failed.load(Ordering::Relaxed),
            authentication_failed: self.authentication_failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for IkeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all IKE metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// IKE SAs created
    pub ike_sa_created: u64,
    /// IKE SAs established
    pub ike_sa_established: u64,
    /// IKE SAs deleted
    pub ike_sa_deleted: u64,
    /// Currently registered IKE SAs
    pub ike_sa_active: u64,
    /// Child SAs created
    pub child_sa_created: u64,
    /// Child SAs deleted
    pub child_sa_deleted: u64,
    /// DH group retries
    pub dh_group_retries: u64,
    /// IKE SAs rekeyed
    pub ike_sa_rekeyed: u64,
    /// IKE SAs reauthenticated
    pub ike_sa_reauthenticated: u64,
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Requests retransmitted
    pub retransmits: u64,
    /// Proposal negotiation failures
    pub proposal_negotiation_failed: u64,
    /// Authentication failures
    pub authentication_failed: u64,
}

impl MetricsSnapshot {
    /// Fraction of created IKE SAs that reached ESTABLISHED (0.0 to 1.0)
    pub fn establishment_rate(&self) -> f64 {
        if self.ike_sa_created == 0 {
            return 0.0;
        }
        self.ike_sa_established as f64 / self.ike_sa_created as f64
    }
}
