//! Connection and policy configuration
//!
//! The negotiation core reads configuration through the [`Connection`],
//! [`Policy`] and [`ConfigStore`] traits. [`ConnectionConfig`],
//! [`PolicyConfig`] and [`StaticConfigStore`] are in-memory implementations
//! built with the usual builder pattern.
//!
//! Configuration objects are shared by `Arc` between IKE_SAs. Everything
//! handed out (proposals, selectors) is a deep copy, so no SA ever aliases
//! configuration state. Only the locally observed host address and dynamic
//! traffic selectors are mutable, behind a lock.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use super::child_sa::SaLifetime;
use super::ikev2::payload::{Identification, TrafficSelector};
use super::ikev2::proposal::{
    self, DhTransformId, EncrTransformId, PrfTransformId, Proposal, ProtocolId, Transform,
};
use super::{Error, Result};

/// Retransmission schedule for outstanding requests
///
/// Attempt `n` (0-based) waits `timeout * base^n` before the next resend.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetransmitConfig {
    /// Delay before the first retransmission
    pub timeout: Duration,

    /// Exponential backoff base
    pub base: f64,

    /// Number of retransmissions before giving up
    pub tries: u32,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        RetransmitConfig {
            timeout: Duration::from_secs(4),
            base: 1.8,
            tries: 5,
        }
    }
}

impl RetransmitConfig {
    /// Delay to wait after the given (0-based) transmission attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        self.timeout.mul_f64(self.base.powi(exponent))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::InvalidParameter(
                "Retransmit timeout must be non-zero".into(),
            ));
        }
        if !(1.0..=10.0).contains(&self.base) {
            return Err(Error::InvalidParameter(format!(
                "Retransmit base {} out of range 1.0..=10.0",
                self.base
            )));
        }
        Ok(())
    }
}

/// IKE-level connection configuration
pub trait Connection: Send + Sync + fmt::Debug {
    /// Connection name
    fn name(&self) -> &str;

    /// Local address (as last observed)
    fn my_host(&self) -> SocketAddr;

    /// Remote address
    fn other_host(&self) -> SocketAddr;

    /// IKE proposals, deep-copied
    fn proposals(&self) -> Vec<Proposal>;

    /// Preferred Diffie-Hellman group for a new IKE_SA_INIT
    fn dh_group(&self) -> u16;

    /// Select one of `offered` against the configured proposals
    fn select_proposal(&self, offered: &[Proposal]) -> Result<Proposal>;

    /// Whether the peer may force us onto `group`
    fn check_dh_group(&self, group: u16) -> bool;

    /// Record the local address the peer actually reached us on
    fn update_my_host(&self, addr: SocketAddr);

    /// Mediation connections carry no child SAs
    fn is_mediation(&self) -> bool;

    /// Retransmission schedule
    fn retransmit(&self) -> RetransmitConfig;
}

/// Child-level policy configuration
pub trait Policy: Send + Sync + fmt::Debug {
    /// Policy name
    fn name(&self) -> &str;

    /// Our identity, shared
    fn my_id(&self) -> Arc<Identification>;

    /// Expected peer identity, shared
    fn other_id(&self) -> Arc<Identification>;

    /// Child SA proposals, deep-copied
    fn proposals(&self) -> Vec<Proposal>;

    /// Selectors for our side of the tunnel
    fn my_traffic_selectors(&self) -> Vec<TrafficSelector>;

    /// Selectors for the peer's side of the tunnel
    fn other_traffic_selectors(&self) -> Vec<TrafficSelector>;

    /// Select one of `offered` against the configured child proposals
    fn select_proposal(&self, offered: &[Proposal]) -> Result<Proposal>;

    /// Narrow dynamic local selectors to the address actually in use
    fn update_my_ts(&self, addr: IpAddr);

    /// Child SA lifetime
    fn lifetime(&self) -> SaLifetime;
}

/// Lookup of configuration for peers that contact us
pub trait ConfigStore: Send + Sync {
    /// Connection matching an inbound IKE_SA_INIT
    fn find_connection(&self, my_host: SocketAddr, other_host: SocketAddr)
        -> Option<Arc<dyn Connection>>;

    /// Policy for an authenticated peer identity
    fn find_policy(&self, connection: &str, other_id: &Identification) -> Option<Arc<dyn Policy>>;
}

/// Default IKE proposal: AES-GCM-128, HMAC-SHA256, MODP-2048
pub fn default_ike_proposals() -> Vec<Proposal> {
    vec![Proposal::new(1, ProtocolId::Ike)
        .add_transform(Transform::encr_with_key(EncrTransformId::AesGcm16, 128))
        .add_transform(Transform::prf(PrfTransformId::HmacSha256))
        .add_transform(Transform::dh(DhTransformId::Group14))]
}

/// Default ESP proposal: AES-GCM-128 without ESN
pub fn default_esp_proposals() -> Vec<Proposal> {
    vec![Proposal::new(1, ProtocolId::Esp)
        .add_transform(Transform::encr_with_key(EncrTransformId::AesGcm16, 128))
        .add_transform(Transform::esn(false))]
}

/// In-memory [`Connection`]
#[derive(Debug)]
pub struct ConnectionConfig {
    name: String,
    my_host: RwLock<SocketAddr>,
    other_host: SocketAddr,
    proposals: Vec<Proposal>,
    mediation: bool,
    retransmit: RetransmitConfig,
}

impl ConnectionConfig {
    /// Create builder for connection configuration
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidParameter("name cannot be empty".into()));
        }
        if self.proposals.is_empty() {
            return Err(Error::InvalidParameter(
                "At least one IKE proposal required".into(),
            ));
        }
        if let Some(p) = self.proposals.iter().find(|p| p.protocol_id != ProtocolId::Ike) {
            return Err(Error::InvalidParameter(format!(
                "Proposal {} is not an IKE proposal",
                p.proposal_num
            )));
        }
        if self.proposals.iter().any(|p| p.dh_group().is_none()) {
            return Err(Error::InvalidParameter(
                "Every IKE proposal needs a DH group".into(),
            ));
        }
        self.retransmit.validate()
    }
}

impl Connection for ConnectionConfig {
    fn name(&self) -> &str {
        &self.name
    }

    fn my_host(&self) -> SocketAddr {
        *self.my_host.read()
    }

    fn other_host(&self) -> SocketAddr {
        self.other_host
    }

    fn proposals(&self) -> Vec<Proposal> {
        self.proposals.clone()
    }

    fn dh_group(&self) -> u16 {
        self.proposals
            .iter()
            .find_map(Proposal::dh_group)
            .unwrap_or(DhTransformId::Group14.to_u16())
    }

    fn select_proposal(&self, offered: &[Proposal]) -> Result<Proposal> {
        proposal::select_proposal(&self.proposals, offered)
    }

    fn check_dh_group(&self, group: u16) -> bool {
        self.proposals.iter().any(|p| p.has_dh_group(group))
    }

    fn update_my_host(&self, addr: SocketAddr) {
        *self.my_host.write() = addr;
    }

    fn is_mediation(&self) -> bool {
        self.mediation
    }

    fn retransmit(&self) -> RetransmitConfig {
        self.retransmit
    }
}

/// Builder for [`ConnectionConfig`]
#[derive(Default)]
pub struct ConnectionBuilder {
    name: Option<String>,
    my_host: Option<SocketAddr>,
    other_host: Option<SocketAddr>,
    proposals: Option<Vec<Proposal>>,
    mediation: bool,
    retransmit: Option<RetransmitConfig>,
}

impl ConnectionBuilder {
    /// Set connection name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set local address
    pub fn with_my_host(mut self, addr: SocketAddr) -> Self {
        self.my_host = Some(addr);
        self
    }

    /// Set remote address
    pub fn with_other_host(mut self, addr: SocketAddr) -> Self {
        self.other_host = Some(addr);
        self
    }

    /// Set IKE proposals
    pub fn with_proposals(mut self, proposals: Vec<Proposal>) -> Self {
        self.proposals = Some(proposals);
        self
    }

    /// Mark as mediation connection
    pub fn with_mediation(mut self, mediation: bool) -> Self {
        self.mediation = mediation;
        self
    }

    /// Set retransmission schedule
    pub fn with_retransmit(mut self, retransmit: RetransmitConfig) -> Self {
        self.retransmit = Some(retransmit);
        self
    }

    /// Build ConnectionConfig with validation
    pub fn build(self) -> Result<ConnectionConfig> {
        let config = ConnectionConfig {
            name: self
                .name
                .ok_or_else(|| Error::InvalidParameter("name is required".into()))?,
            my_host: RwLock::new(
                self.my_host
                    .ok_or_else(|| Error::InvalidParameter("my_host is required".into()))?,
            ),
            other_host: self
                .other_host
                .ok_or_else(|| Error::InvalidParameter("other_host is required".into()))?,
            proposals: self.proposals.unwrap_or_else(default_ike_proposals),
            mediation: self.mediation,
            retransmit: self.retransmit.unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }
}

/// In-memory [`Policy`]
#[derive(Debug)]
pub struct PolicyConfig {
    name: String,
    my_id: Arc<Identification>,
    other_id: Arc<Identification>,
    proposals: Vec<Proposal>,
    my_ts: RwLock<Vec<TrafficSelector>>,
    other_ts: Vec<TrafficSelector>,
    lifetime: SaLifetime,
}

impl PolicyConfig {
    /// Create builder for policy configuration
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidParameter("name cannot be empty".into()));
        }
        if self.proposals.is_empty() {
            return Err(Error::InvalidParameter(
                "At least one child proposal required".into(),
            ));
        }
        if self.proposals.iter().any(|p| p.protocol_id == ProtocolId::Ike) {
            return Err(Error::InvalidParameter(
                "Child proposals must be ESP or AH".into(),
            ));
        }
        if self.my_ts.read().is_empty() || self.other_ts.is_empty() {
            return Err(Error::InvalidParameter(
                "Both traffic selector sets must be non-empty".into(),
            ));
        }
        Ok(())
    }
}

impl Policy for PolicyConfig {
    fn name(&self) -> &str {
        &self.name
    }

    fn my_id(&self) -> Arc<Identification> {
        Arc::clone(&self.my_id)
    }

    fn other_id(&self) -> Arc<Identification> {
        Arc::clone(&self.other_id)
    }

    fn proposals(&self) -> Vec<Proposal> {
        self.proposals.clone()
    }

    fn my_traffic_selectors(&self) -> Vec<TrafficSelector> {
        self.my_ts.read().clone()
    }

    fn other_traffic_selectors(&self) -> Vec<TrafficSelector> {
        self.other_ts.clone()
    }

    fn select_proposal(&self, offered: &[Proposal]) -> Result<Proposal> {
        proposal::select_proposal(&self.proposals, offered)
    }

    fn update_my_ts(&self, addr: IpAddr) {
        for ts in self.my_ts.write().iter_mut() {
            ts.set_address(addr);
        }
    }

    fn lifetime(&self) -> SaLifetime {
        self.lifetime
    }
}

/// Builder for [`PolicyConfig`]
#[derive(Default)]
pub struct PolicyBuilder {
    name: Option<String>,
    my_id: Option<Identification>,
    other_id: Option<Identification>,
    proposals: Option<Vec<Proposal>>,
    my_ts: Vec<TrafficSelector>,
    other_ts: Vec<TrafficSelector>,
    lifetime: Option<SaLifetime>,
}

impl PolicyBuilder {
    /// Set policy name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set local identity
    pub fn with_my_id(mut self, id: Identification) -> Self {
        self.my_id = Some(id);
        self
    }

    /// Set remote identity
    pub fn with_other_id(mut self, id: Identification) -> Self {
        self.other_id = Some(id);
        self
    }

    /// Set child proposals
    pub fn with_proposals(mut self, proposals: Vec<Proposal>) -> Self {
        self.proposals = Some(proposals);
        self
    }

    /// Add a local traffic selector
    pub fn with_my_ts(mut self, ts: TrafficSelector) -> Self {
        self.my_ts.push(ts);
        self
    }

    /// Add a remote traffic selector
    pub fn with_other_ts(mut self, ts: TrafficSelector) -> Self {
        self.other_ts.push(ts);
        self
    }

    /// Set SA lifetime
    pub fn with_lifetime(mut self, lifetime: SaLifetime) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Build PolicyConfig with validation
    pub fn build(self) -> Result<PolicyConfig> {
        let config = PolicyConfig {
            name: self
                .name
                .ok_or_else(|| Error::InvalidParameter("name is required".into()))?,
            my_id: Arc::new(
                self.my_id
                    .ok_or_else(|| Error::InvalidParameter("my_id is required".into()))?,
            ),
            other_id: Arc::new(
                self.other_id
                    .ok_or_else(|| Error::InvalidParameter("other_id is required".into()))?,
            ),
            proposals: self.proposals.unwrap_or_else(default_esp_proposals),
            my_ts: RwLock::new(self.my_ts),
            other_ts: self.other_ts,
            lifetime: self.lifetime.unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Fixed set of connections and policies
///
/// Connections match on the peer address (an unspecified configured address
/// matches any peer). Policies are bound to a connection by name.
#[derive(Default)]
pub struct StaticConfigStore {
    connections: Vec<Arc<dyn Connection>>,
    policies: Vec<(String, Arc<dyn Policy>)>,
}

impl StaticConfigStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection
    pub fn with_connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connections.push(connection);
        self
    }

    /// Add a policy under a connection
    pub fn with_policy(mut self, connection: impl Into<String>, policy: Arc<dyn Policy>) -> Self {
        self.policies.push((connection.into(), policy));
        self
    }
}

impl ConfigStore for StaticConfigStore {
    fn find_connection(
        &self,
        _my_host: SocketAddr,
        other_host: SocketAddr,
    ) -> Option<Arc<dyn Connection>> {
        self.connections
            .iter()
            .find(|c| {
                let configured = c.other_host().ip();
                configured.is_unspecified() || configured == other_host.ip()
            })
            .cloned()
    }

    fn find_policy(&self, connection: &str, other_id: &Identification) -> Option<Arc<dyn Policy>> {
        self.policies
            .iter()
            .find(|(conn, policy)| conn == connection && *policy.other_id() == *other_id)
            .map(|(_, policy)| Arc::clone(policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_connection() -> ConnectionConfig {
        ConnectionConfig::builder()
            .with_name("site-a")
            .with_my_host("10.0.0.1:500".parse().unwrap())
            .with_other_host("10.0.0.2:500".parse().unwrap())
            .build()
            .unwrap()
    }

    fn create_test_policy() -> PolicyConfig {
        PolicyConfig::builder()
            .with_name("net-a")
            .with_my_id(Identification::fqdn("a.example.com"))
            .with_other_id(Identification::fqdn("b.example.com"))
            .with_my_ts(TrafficSelector::dynamic("0.0.0.0".parse().unwrap()))
            .with_other_ts(TrafficSelector::subnet("10.2.0.0".parse().unwrap(), 16).unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn test_connection_defaults() {
        let conn = create_test_connection();
        assert_eq!(conn.dh_group(), 14);
        assert!(conn.check_dh_group(14));
        assert!(!conn.check_dh_group(2));
        assert!(!conn.is_mediation());
        assert_eq!(conn.retransmit(), RetransmitConfig::default());
    }

    #[test]
    fn test_connection_builder_missing_field() {
        let result = ConnectionConfig::builder().with_name("x").build();
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_connection_rejects_esp_proposal() {
        let result = ConnectionConfig::builder()
            .with_name("bad")
            .with_my_host("10.0.0.1:500".parse().unwrap())
            .with_other_host("10.0.0.2:500".parse().unwrap())
            .with_proposals(default_esp_proposals())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_proposals_are_copies() {
        let conn = create_test_connection();
        let mut proposals = conn.proposals();
        proposals[0].spi = vec![1; 8];
        assert!(conn.proposals()[0].spi.is_empty());
    }

    #[test]
    fn test_update_my_host() {
        let conn = create_test_connection();
        let observed: SocketAddr = "192.168.0.7:4500".parse().unwrap();
        conn.update_my_host(observed);
        assert_eq!(conn.my_host(), observed);
    }

    #[test]
    fn test_policy_update_my_ts() {
        let policy = create_test_policy();
        policy.update_my_ts("10.0.0.1".parse().unwrap());

        let ts = policy.my_traffic_selectors();
        assert_eq!(ts[0].start_addr, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(policy.other_traffic_selectors().len(), 1);
    }

    #[test]
    fn test_policy_requires_selectors() {
        let result = PolicyConfig::builder()
            .with_name("empty")
            .with_my_id(Identification::fqdn("a"))
            .with_other_id(Identification::fqdn("b"))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_retransmit_backoff() {
        let config = RetransmitConfig {
            timeout: Duration::from_secs(2),
            base: 2.0,
            tries: 3,
        };
        assert_eq!(config.delay(0), Duration::from_secs(2));
        assert_eq!(config.delay(1), Duration::from_secs(4));
        assert_eq!(config.delay(3), Duration::from_secs(16));

        let bad = RetransmitConfig {
            base: 0.5,
            ..config
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_static_store_lookup() {
        let conn: Arc<dyn Connection> = Arc::new(create_test_connection());
        let policy: Arc<dyn Policy> = Arc::new(create_test_policy());
        let store = StaticConfigStore::new()
            .with_connection(Arc::clone(&conn))
            .with_policy("site-a", policy);

        let found = store
            .find_connection(
                "10.0.0.1:500".parse().unwrap(),
                "10.0.0.2:4500".parse().unwrap(),
            )
            .unwrap();
        assert_eq!(found.name(), "site-a");
        assert!(store
            .find_connection(
                "10.0.0.1:500".parse().unwrap(),
                "10.9.9.9:500".parse().unwrap()
            )
            .is_none());

        assert!(store
            .find_policy("site-a", &Identification::fqdn("b.example.com"))
            .is_some());
        assert!(store
            .find_policy("site-a", &Identification::fqdn("c.example.com"))
            .is_none());
    }
}
