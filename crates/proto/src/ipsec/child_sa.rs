//! Child SA (Security Association) management
//!
//! A Child SA is the data-plane SA negotiated under an IKE_SA, either piggy
//! backed on IKE_AUTH or through CREATE_CHILD_SA (RFC 7296 Sections 1.3, 2.17).
//! The negotiation core tracks its SPIs, selectors and lifecycle; installing
//! it into a packet-processing engine is done through a [`ChildSaFactory`].
//!
//! # Lifecycle
//!
//! ```text
//! ROUTED ──► INSTALLING ──► INSTALLED ──► REKEYING ──► DELETING
//!                 │                                       ▲
//!                 └───────────────────────────────────────┘
//! ```
//!
//! A ROUTED child has policies but no keys; it survives reauthentication by
//! being moved to the replacement IKE_SA as-is.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use crate::ipsec::{
    config::Policy,
    ikev2::{
        payload::TrafficSelector,
        proposal::{EncrTransformId, IntegTransformId, Proposal, ProtocolId, TransformType},
    },
    Error, Result,
};

/// Child SA State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSaState {
    /// Policies installed, no keys negotiated
    Routed,

    /// SPI allocated, negotiation in progress
    Installing,

    /// Keys installed, SA carries traffic
    Installed,

    /// Replacement SA being negotiated
    Rekeying,

    /// Delete in progress
    Deleting,
}

impl fmt::Display for ChildSaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChildSaState::Routed => "ROUTED",
            ChildSaState::Installing => "INSTALLING",
            ChildSaState::Installed => "INSTALLED",
            ChildSaState::Rekeying => "REKEYING",
            ChildSaState::Deleting => "DELETING",
        };
        f.write_str(name)
    }
}

/// SA Lifetime limits
///
/// Defines when an SA should be rekeyed (soft limit) and when it must
/// be deleted (hard limit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SaLifetime {
    /// Soft time limit - initiate rekey when reached
    pub soft_time: Duration,

    /// Hard time limit - delete SA when reached
    pub hard_time: Duration,
}

impl Default for SaLifetime {
    /// 1 hour hard, 45 minutes soft
    fn default() -> Self {
        SaLifetime {
            soft_time: Duration::from_secs(45 * 60),
            hard_time: Duration::from_secs(60 * 60),
        }
    }
}

impl SaLifetime {
    /// Create custom lifetime with time limits
    pub fn new(soft_time: Duration, hard_time: Duration) -> Result<Self> {
        if soft_time >= hard_time {
            return Err(Error::InvalidParameter(
                "Soft lifetime must be less than hard lifetime".into(),
            ));
        }

        Ok(SaLifetime {
            soft_time,
            hard_time,
        })
    }

    /// Check if soft lifetime has been exceeded
    pub fn is_soft_expired(&self, age: Duration) -> bool {
        age >= self.soft_time
    }

    /// Check if hard lifetime has been exceeded
    pub fn is_hard_expired(&self, age: Duration) -> bool {
        age >= self.hard_time
    }
}

/// Child Security Association
#[derive(Debug, Clone)]
pub struct ChildSa {
    /// Our inbound SPI
    pub my_spi: u32,

    /// Peer's inbound SPI (0 until negotiated)
    pub other_spi: u32,

    /// IPsec protocol
    pub protocol: ProtocolId,

    /// Current state
    pub state: ChildSaState,

    /// Policy this child was created from
    pub config: Arc<dyn Policy>,

    /// Selected proposal, once negotiated
    pub proposal: Option<Proposal>,

    /// Selectors on our side
    pub my_ts: Vec<TrafficSelector>,

    /// Selectors on the peer's side
    pub other_ts: Vec<TrafficSelector>,

    /// Local endpoint
    pub my_host: SocketAddr,

    /// Remote endpoint
    pub other_host: SocketAddr,

    /// Lifetime configuration
    pub lifetime: SaLifetime,

    /// Creation timestamp
    pub created_at: Instant,
}

impl ChildSa {
    /// Create a child in INSTALLING state with an allocated SPI
    pub fn new(
        config: Arc<dyn Policy>,
        my_spi: u32,
        my_host: SocketAddr,
        other_host: SocketAddr,
    ) -> Self {
        ChildSa {
            my_spi,
            other_spi: 0,
            protocol: ProtocolId::Esp,
            state: ChildSaState::Installing,
            my_ts: config.my_traffic_selectors(),
            other_ts: config.other_traffic_selectors(),
            lifetime: config.lifetime(),
            config,
            proposal: None,
            my_host,
            other_host,
            created_at: Instant::now(),
        }
    }

    /// Create a trap-only child in ROUTED state
    pub fn routed(config: Arc<dyn Policy>, my_host: SocketAddr, other_host: SocketAddr) -> Self {
        ChildSa {
            state: ChildSaState::Routed,
            ..ChildSa::new(config, 0, my_host, other_host)
        }
    }

    /// Name of the policy this child belongs to
    pub fn name(&self) -> &str {
        self.config.name()
    }

    /// Get SA age
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Check if SA should be rekeyed (soft lifetime)
    pub fn should_rekey(&self) -> bool {
        self.state == ChildSaState::Installed && self.lifetime.is_soft_expired(self.age())
    }

    /// Check if SA has expired (hard lifetime)
    pub fn is_expired(&self) -> bool {
        self.lifetime.is_hard_expired(self.age())
    }

    /// Record negotiation result
    pub fn set_negotiated(&mut self, proposal: Proposal, other_spi: u32) {
        self.protocol = proposal.protocol_id;
        self.proposal = Some(proposal);
        self.other_spi = other_spi;
    }

    /// Transition INSTALLED -> REKEYING
    pub fn start_rekey(&mut self) -> Result<()> {
        if self.state != ChildSaState::Installed {
            return Err(Error::InvalidState(format!(
                "Cannot rekey child SA in state {}",
                self.state
            )));
        }
        self.state = ChildSaState::Rekeying;
        Ok(())
    }

    /// Transition to DELETING from any state
    pub fn start_delete(&mut self) {
        self.state = ChildSaState::Deleting;
    }

    /// Point the child at new endpoints (reauthentication, MOBIKE-style moves)
    pub fn update_hosts(&mut self, my_host: SocketAddr, other_host: SocketAddr) {
        self.my_host = my_host;
        self.other_host = other_host;
    }
}

/// Allocates and installs child SAs
pub trait ChildSaFactory: Send + Sync {
    /// Allocate an inbound SPI and write it into every proposal in `proposals`
    ///
    /// The proposals are the caller's private copies; the returned child is
    /// SPI-bound but not installed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChildSaFailed`] if no SPI could be allocated
    fn alloc(
        &self,
        my_host: SocketAddr,
        other_host: SocketAddr,
        config: Arc<dyn Policy>,
        proposals: &mut [Proposal],
    ) -> Result<ChildSa>;

    /// Install negotiated keys; the child moves to INSTALLED
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChildSaFailed`] if the child cannot be installed
    fn install(&self, child: &mut ChildSa, keymat: &[u8]) -> Result<()>;

    /// Remove an installed child
    fn uninstall(&self, child: &ChildSa);
}

/// In-memory child SA table
///
/// Allocates random SPIs from `0xc0000000..` and records installed SAs by SPI.
#[derive(Debug, Default)]
pub struct MemoryChildSaFactory {
    installed: Mutex<HashMap<u32, usize>>,
}

impl MemoryChildSaFactory {
    /// Create empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an SA with this inbound SPI is installed
    pub fn is_installed(&self, spi: u32) -> bool {
        self.installed.lock().contains_key(&spi)
    }

    /// Number of installed SAs
    pub fn installed_count(&self) -> usize {
        self.installed.lock().len()
    }
}

impl ChildSaFactory for MemoryChildSaFactory {
    fn alloc(
        &self,
        my_host: SocketAddr,
        other_host: SocketAddr,
        config: Arc<dyn Policy>,
        proposals: &mut [Proposal],
    ) -> Result<ChildSa> {
        if proposals.is_empty() {
            return Err(Error::ChildSaFailed("no child proposals to bind".into()));
        }

        let spi = 0xc000_0000 | rand::thread_rng().gen_range(0..0x4000_0000u32);
        for proposal in proposals.iter_mut() {
            proposal.spi = spi.to_be_bytes().to_vec();
        }
        Ok(ChildSa::new(config, spi, my_host, other_host))
    }

    fn install(&self, child: &mut ChildSa, keymat: &[u8]) -> Result<()> {
        if child.other_spi == 0 {
            return Err(Error::ChildSaFailed(format!(
                "child {:08x} has no peer SPI",
                child.my_spi
            )));
        }
        self.installed.lock().insert(child.my_spi, keymat.len());
        child.state = ChildSaState::Installed;
        Ok(())
    }

    fn uninstall(&self, child: &ChildSa) {
        self.installed.lock().remove(&child.my_spi);
    }
}

/// Length of the KEYMAT a negotiated child proposal consumes
///
/// Both directions get an encryption key (plus salt for AEAD) and, for
/// non-AEAD ciphers, an integrity key.
pub fn keymat_len(proposal: &Proposal) -> Result<usize> {
    let encr = proposal
        .get_transform(TransformType::Encr)
        .ok_or_else(|| Error::ChildSaFailed("proposal without encryption transform".into()))?;
    let encr_id = EncrTransformId::from_u16(encr.transform_id).ok_or_else(|| {
        Error::ChildSaFailed(format!("unsupported encryption transform {}", encr.transform_id))
    })?;

    let integ_len = match proposal.get_transform(TransformType::Integ) {
        Some(integ) => IntegTransformId::from_u16(integ.transform_id)
            .map(IntegTransformId::key_len)
            .ok_or_else(|| {
                Error::ChildSaFailed(format!("unsupported integrity transform {}", integ.transform_id))
            })?,
        None if encr_id.is_aead() => 0,
        None => return Err(Error::ChildSaFailed("non-AEAD cipher without integrity".into())),
    };

    Ok(2 * (encr_id.keymat_len(encr.key_length) + integ_len))
}
