//! IKE_SA: one control-channel security association
//!
//! An [`IkeSa`] owns everything negotiated with one peer: the active state
//! handler, derived key material, the selected proposal, its child SAs and
//! the [`TaskManager`] with message-ID bookkeeping. Configuration objects are
//! shared references and never owned.
//!
//! An `IkeSa` is only ever touched by the thread that checked it out of the
//! [`IkeSaManager`]; nothing in here locks.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tracing::debug;
use vigil_platform::{DhFactory, Packet, Transport};

use super::auth::Authenticator;
use super::constants::ExchangeType;
use super::manager::IkeSaManager;
use super::message::{IkeSaId, Message, MessageCodec};
use super::payload::Identification;
use super::proposal::Proposal;
use super::state::initiator::InitiatorInit;
use super::state::{established, responder, SaState, SaStateKind, StateOutcome, Transition};
use super::task_manager::TaskManager;
use super::tasks::{ChildCreateTask, IkeAuthTask, IkeInitTask, Task};
use crate::ipsec::bus::Bus;
use crate::ipsec::child_sa::{self, ChildSa, ChildSaFactory, ChildSaState};
use crate::ipsec::config::{ConfigStore, Connection, Policy};
use crate::ipsec::crypto::{KeyMaterial, KeySizes};
use crate::ipsec::metrics::IkeMetrics;
use crate::ipsec::{logging, Error, Result};

const UNSPECIFIED: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// Collaborators shared by every IKE_SA of a manager
pub struct Services {
    /// Connection and policy lookup
    pub config: Arc<dyn ConfigStore>,
    /// Message encoding and protection
    pub codec: Arc<dyn MessageCodec>,
    /// Datagram output
    pub transport: Arc<dyn Transport>,
    /// AUTH payload computation
    pub authenticator: Arc<dyn Authenticator>,
    /// Child SA allocation and installation
    pub child_factory: Arc<dyn ChildSaFactory>,
    /// Diffie-Hellman objects
    pub dh_factory: Arc<dyn DhFactory>,
    /// Counters updated by every SA
    pub metrics: IkeMetrics,
}

impl Services {
    /// Bundle collaborators with fresh metrics
    pub fn new(
        config: Arc<dyn ConfigStore>,
        codec: Arc<dyn MessageCodec>,
        transport: Arc<dyn Transport>,
        authenticator: Arc<dyn Authenticator>,
        child_factory: Arc<dyn ChildSaFactory>,
        dh_factory: Arc<dyn DhFactory>,
    ) -> Self {
        Services {
            config,
            codec,
            transport,
            authenticator,
            child_factory,
            dh_factory,
            metrics: IkeMetrics::new(),
        }
    }

    /// Use an existing metrics instance
    pub fn with_metrics(mut self, metrics: IkeMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Handles passed down to states and tasks for one dispatch cycle
#[derive(Clone, Copy)]
pub struct Context<'a> {
    /// Registry the current SA was checked out from
    pub manager: &'a IkeSaManager,
    /// Event sink of the current worker
    pub bus: &'a Bus,
}

impl<'a> Context<'a> {
    /// Create a context
    pub fn new(manager: &'a IkeSaManager, bus: &'a Bus) -> Self {
        Context { manager, bus }
    }
}

/// IKE Security Association
pub struct IkeSa {
    id: IkeSaId,
    version: u8,
    state: Option<SaState>,
    connection: Option<Arc<dyn Connection>>,
    policy: Option<Arc<dyn Policy>>,
    my_host: SocketAddr,
    other_host: SocketAddr,
    virtual_ip: Option<IpAddr>,
    keys: Option<KeyMaterial>,
    proposal: Option<Proposal>,
    peer_id: Option<Arc<Identification>>,
    auth_child: Option<Arc<dyn Policy>>,
    child_sas: Vec<ChildSa>,
    tasks: TaskManager,
    services: Arc<Services>,
}

impl fmt::Debug for IkeSa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IkeSa")
            .field("id", &self.id)
            .field("state", &self.state_kind())
            .field("my_host", &self.my_host)
            .field("other_host", &self.other_host)
            .field("child_sas", &self.child_sas.len())
            .finish_non_exhaustive()
    }
}

impl IkeSa {
    /// Create an IKE_SA with no state
    ///
    /// Normally called by [`IkeSaManager::checkout_new`].
    pub fn new(id: IkeSaId, version: u8, services: Arc<Services>) -> Self {
        IkeSa {
            id,
            version,
            state: None,
            connection: None,
            policy: None,
            my_host: UNSPECIFIED,
            other_host: UNSPECIFIED,
            virtual_ip: None,
            keys: None,
            proposal: None,
            peer_id: None,
            auth_child: None,
            child_sas: Vec::new(),
            tasks: TaskManager::new(),
            services,
        }
    }

    /// SPI pair and role
    pub fn id(&self) -> IkeSaId {
        self.id
    }

    /// Set the SPI chosen by the peer
    pub(crate) fn set_remote_spi(&mut self, spi: u64) {
        if self.id.is_initiator {
            self.id.responder_spi = spi;
        } else {
            self.id.initiator_spi = spi;
        }
    }

    /// IKE major version
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Name of the active state, `None` before anything happened
    pub fn state_kind(&self) -> Option<SaStateKind> {
        self.state.as_ref().map(SaState::kind)
    }

    /// Whether the SA is in ESTABLISHED
    pub fn is_established(&self) -> bool {
        self.state_kind() == Some(SaStateKind::Established)
    }

    /// Connection this SA was set up for
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if no connection has been assigned
    pub fn connection(&self) -> Result<Arc<dyn Connection>> {
        self.connection
            .clone()
            .ok_or_else(|| Error::InvalidState(format!("IKE_SA {} has no connection", self.id)))
    }

    /// Assign the connection; hosts are taken from it
    pub fn set_connection(&mut self, connection: Arc<dyn Connection>) {
        self.my_host = connection.my_host();
        self.other_host = connection.other_host();
        self.connection = Some(connection);
    }

    /// Policy supplying identities and selectors
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if no policy has been assigned
    pub fn policy(&self) -> Result<Arc<dyn Policy>> {
        self.policy
            .clone()
            .ok_or_else(|| Error::InvalidState(format!("IKE_SA {} has no policy", self.id)))
    }

    /// Assign the policy
    pub fn set_policy(&mut self, policy: Arc<dyn Policy>) {
        self.policy = Some(policy);
    }

    /// Local address
    pub fn my_host(&self) -> SocketAddr {
        self.my_host
    }

    /// Remote address
    pub fn other_host(&self) -> SocketAddr {
        self.other_host
    }

    /// Set the local address
    pub fn set_my_host(&mut self, host: SocketAddr) {
        self.my_host = host;
    }

    /// Set the remote address
    pub fn set_other_host(&mut self, host: SocketAddr) {
        self.other_host = host;
    }

    /// Virtual IP assigned to us, if any
    pub fn virtual_ip(&self) -> Option<IpAddr> {
        self.virtual_ip
    }

    /// Set the virtual IP
    pub fn set_virtual_ip(&mut self, ip: Option<IpAddr>) {
        self.virtual_ip = ip;
    }

    /// Derived key material, once IKE_SA_INIT completed
    pub fn keys(&self) -> Option<&KeyMaterial> {
        self.keys.as_ref()
    }

    pub(crate) fn set_keys(&mut self, keys: KeyMaterial, proposal: Proposal) {
        self.keys = Some(keys);
        self.proposal = Some(proposal);
    }

    /// Selected IKE proposal
    pub fn proposal(&self) -> Option<&Proposal> {
        self.proposal.as_ref()
    }

    /// Authenticated peer identity
    pub fn peer_id(&self) -> Option<&Arc<Identification>> {
        self.peer_id.as_ref()
    }

    pub(crate) fn set_peer_id(&mut self, id: Option<Arc<Identification>>) {
        self.peer_id = id;
    }

    pub(crate) fn set_auth_child(&mut self, config: Option<Arc<dyn Policy>>) {
        self.auth_child = config;
    }

    /// Child config to negotiate within IKE_AUTH
    pub(crate) fn auth_child(&self) -> Option<Arc<dyn Policy>> {
        self.auth_child.clone()
    }

    /// Child SAs owned by this IKE_SA
    pub fn child_sas(&self) -> &[ChildSa] {
        &self.child_sas
    }

    /// Number of child SAs
    pub fn child_count(&self) -> usize {
        self.child_sas.len()
    }

    /// Take ownership of a child SA
    pub fn add_child_sa(&mut self, child: ChildSa) {
        self.child_sas.push(child);
    }

    /// Child by our inbound SPI
    pub fn find_child_mut(&mut self, my_spi: u32) -> Option<&mut ChildSa> {
        self.child_sas.iter_mut().find(|c| c.my_spi == my_spi)
    }

    /// Child by the peer's inbound SPI
    pub fn find_child_by_other_spi_mut(&mut self, other_spi: u32) -> Option<&mut ChildSa> {
        self.child_sas.iter_mut().find(|c| c.other_spi == other_spi)
    }

    /// Remove a child by our inbound SPI
    pub fn remove_child_sa(&mut self, my_spi: u32) -> Option<ChildSa> {
        let index = self.child_sas.iter().position(|c| c.my_spi == my_spi)?;
        Some(self.child_sas.remove(index))
    }

    /// Remove all children
    pub fn take_child_sas(&mut self) -> Vec<ChildSa> {
        std::mem::take(&mut self.child_sas)
    }

    /// Uninstall and drop a child
    pub(crate) fn delete_child_sa(&mut self, my_spi: u32, reason: &str) -> bool {
        match self.remove_child_sa(my_spi) {
            Some(child) => {
                if child.state != ChildSaState::Routed {
                    self.services.child_factory.uninstall(&child);
                }
                self.services.metrics.record_child_sa_deleted();
                logging::log_child_sa_deleted(child.my_spi, reason);
                true
            }
            None => false,
        }
    }

    /// Task queues and message-ID bookkeeping
    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub(crate) fn tasks_mut(&mut self) -> &mut TaskManager {
        &mut self.tasks
    }

    /// Queue a task for the next exchange
    pub fn queue_task(&mut self, task: Box<dyn Task>) {
        self.tasks.queue_task(task);
    }

    /// Shared collaborators
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Start the SA, or queue a child negotiation on it
    ///
    /// On a fresh SA this kicks off IKE_SA_INIT; `child` is negotiated within
    /// IKE_AUTH (none for mediation connections). On an SA that is already
    /// underway a CHILD_CREATE task is queued instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake could not be started; the SA is
    /// unusable afterwards
    pub fn initiate(&mut self, ctx: &Context<'_>, child: Option<Arc<dyn Policy>>) -> Result<()> {
        match self.state_kind() {
            None => {
                if !self.id.is_initiator {
                    return Err(Error::InvalidState(
                        "cannot initiate an IKE_SA we are responder of".into(),
                    ));
                }
                self.connection()?;
                if self.policy.is_none() {
                    self.policy = child.clone();
                }
                self.policy()?;

                self.queue_task(Box::new(IkeInitTask::new(self.id)));
                self.queue_task(Box::new(IkeAuthTask::new(child)));
                TaskManager::initiate(self, ctx)
            }
            Some(SaStateKind::Established) | Some(SaStateKind::IkeAuthResponded) => {
                if let Some(config) = child {
                    self.queue_task(Box::new(ChildCreateTask::initiator(config)));
                }
                self.run_tasks(ctx)
            }
            Some(_) => {
                if let Some(config) = child {
                    self.queue_task(Box::new(ChildCreateTask::initiator(config)));
                }
                Ok(())
            }
        }
    }

    /// Start the next queued exchange if nothing is in flight
    ///
    /// # Errors
    ///
    /// Returns a fatal error if a task failed or the request could not be sent
    pub fn run_tasks(&mut self, ctx: &Context<'_>) -> Result<()> {
        if self.state_kind() == Some(SaStateKind::IkeAuthResponded) {
            self.state = Some(SaState::Established(established::Established));
            self.enter_established(Some(SaStateKind::IkeAuthResponded));
        }
        if !self.is_established() {
            return Ok(());
        }
        TaskManager::initiate(self, ctx)
    }

    /// Feed one inbound message to the SA
    pub fn process_message(&mut self, ctx: &Context<'_>, message: Message) -> StateOutcome {
        self.services.metrics.record_message_received();
        logging::log_message_recv(
            &message.to_string(),
            message.source,
            message.packet_data.len(),
        );

        if message.is_request() {
            if let Some(packet) = self.tasks.cached_response(message.message_id).cloned() {
                debug!(
                    ike_sa = %self.id,
                    message_id = message.message_id,
                    "Retransmitting response to duplicate request"
                );
                return match self.transmit(&packet) {
                    Ok(()) => StateOutcome::Continue,
                    Err(e) => StateOutcome::Fail(e),
                };
            }
        } else if !self.tasks.is_expected_response(message.message_id) {
            let error = Error::UnexpectedMessage(format!(
                "response {} does not match an outstanding request",
                message.message_id
            ));
            logging::log_message_rejected(self.id.initiator_spi, &error.to_string());
            return StateOutcome::Fail(error);
        }

        let Some(state) = self.state.take() else {
            return match responder::respond_init(self, message) {
                Ok(transition) => self.apply(ctx, None, transition),
                Err(e) => {
                    logging::log_message_rejected(self.id.initiator_spi, &e.to_string());
                    StateOutcome::Fail(e)
                }
            };
        };

        let from = state.kind();
        let transition = match state {
            SaState::InitiatorInit(init) => Transition::Reject(
                SaState::InitiatorInit(init),
                Error::UnexpectedMessage("no exchange started yet".into()),
            ),
            SaState::IkeSaInitRequested(s) => s.process(self, message),
            SaState::IkeSaInitResponded(s) => s.process(self, message),
            SaState::IkeAuthRequested(s) => s.process(self, message),
            SaState::IkeAuthResponded(s) => {
                if !message.is_request() {
                    Transition::Reject(
                        SaState::IkeAuthResponded(s),
                        Error::UnexpectedMessage("no request outstanding".into()),
                    )
                } else {
                    self.state = Some(SaState::Established(s.promote()));
                    self.enter_established(Some(from));
                    return established::process(self, ctx, message);
                }
            }
            SaState::Established(s) => {
                self.state = Some(SaState::Established(s));
                return established::process(self, ctx, message);
            }
        };
        self.apply(ctx, Some(from), transition)
    }

    /// Install the result of a state handler
    pub(crate) fn apply(
        &mut self,
        ctx: &Context<'_>,
        from: Option<SaStateKind>,
        transition: Transition,
    ) -> StateOutcome {
        match transition {
            Transition::Stay(state) => {
                self.state = Some(state);
                StateOutcome::Continue
            }
            Transition::Next(state) => {
                let to = state.kind();
                self.log_transition(from, to);
                self.state = Some(state);
                self.tasks.handshake_advanced(to);
                if to == SaStateKind::Established {
                    self.enter_established(Some(to));
                    if let Err(e) = TaskManager::initiate(self, ctx) {
                        return self.fail(ctx, e);
                    }
                }
                StateOutcome::Transition(to)
            }
            Transition::Rollback(state) => {
                let to = state.kind();
                self.log_transition(from, SaStateKind::InitiatorInit);
                self.log_transition(Some(SaStateKind::InitiatorInit), to);
                self.state = Some(state);
                StateOutcome::Transition(to)
            }
            Transition::Reject(state, error) => {
                logging::log_message_rejected(self.id.initiator_spi, &error.to_string());
                self.state = Some(state);
                StateOutcome::Fail(error)
            }
            Transition::Delete(error) => self.fail(ctx, error),
        }
    }

    /// Report a fatal error; the caller destroys the SA
    pub(crate) fn fail(&self, ctx: &Context<'_>, error: Error) -> StateOutcome {
        match error {
            Error::AuthenticationFailed(_) => self.services.metrics.record_authentication_failed(),
            Error::NoProposalChosen | Error::ProposalCount(_) => {
                self.services.metrics.record_proposal_negotiation_failed()
            }
            _ => {}
        }
        ctx.bus.sa_failed(&error);
        StateOutcome::DeleteSa(error)
    }

    /// Move straight to ESTABLISHED (SAs created by a rekey)
    pub(crate) fn establish(&mut self) {
        let from = self.state_kind();
        self.state = Some(SaState::Established(established::Established));
        self.enter_established(from);
    }

    /// Take over everything a replaced SA owned
    ///
    /// Moves children and queued tasks, copies config, hosts and identity.
    pub(crate) fn inherit_from(&mut self, old: &mut IkeSa) {
        self.connection = old.connection.clone();
        self.policy = old.policy.clone();
        self.my_host = old.my_host;
        self.other_host = old.other_host;
        self.virtual_ip = old.virtual_ip;
        self.peer_id = old.peer_id.clone();
        self.child_sas.append(&mut old.child_sas);
        self.tasks.adopt_tasks(&mut old.tasks, self.id);
    }

    fn enter_established(&mut self, from: Option<SaStateKind>) {
        if from != Some(SaStateKind::Established) {
            self.log_transition(from, SaStateKind::Established);
        }
        self.tasks.handshake_advanced(SaStateKind::Established);
        self.services.metrics.record_ike_sa_established();
        let peer = self
            .peer_id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_default();
        logging::log_ike_sa_established(
            self.id.initiator_spi,
            self.id.responder_spi,
            self.other_host,
            &peer,
        );
    }

    fn log_transition(&self, from: Option<SaStateKind>, to: SaStateKind) {
        let from = from.map_or("CREATED", SaStateKind::name);
        logging::log_ike_state_transition(self.id.initiator_spi, self.id.responder_spi, from, to.name());
    }

    /// Enter INITIATOR_INIT and send IKE_SA_INIT
    ///
    /// `dh_group` overrides the connection's preferred group.
    pub(crate) fn start_handshake(&mut self, dh_group: Option<u16>) -> Result<()> {
        let group = match dh_group {
            Some(group) => group,
            None => self.connection()?.dh_group(),
        };
        logging::log_handshake_start(self.other_host, "initiator");

        let init = InitiatorInit::new(group);
        self.state = Some(SaState::InitiatorInit(init));
        match init.initiate(self) {
            Ok(requested) => {
                self.log_transition(Some(SaStateKind::InitiatorInit), SaStateKind::IkeSaInitRequested);
                self.state = Some(SaState::IkeSaInitRequested(requested));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Discard message-ID state and cached packets
    pub fn reset_message_buffers(&mut self) {
        self.tasks.reset_message_buffers();
    }

    /// Remember the message ID of the last response we accepted
    pub(crate) fn set_last_replied_message_id(&mut self, message_id: u32) {
        self.tasks.set_last_replied_message_id(message_id);
    }

    /// Empty request for the next outbound message ID
    pub(crate) fn new_request(&self, exchange_type: ExchangeType) -> Message {
        Message::request(
            self.id,
            exchange_type,
            self.tasks.next_message_id(),
            self.my_host,
            self.other_host,
        )
    }

    /// Decrypt and decode a message body
    pub(crate) fn parse_body(&self, message: &mut Message) -> Result<()> {
        let keys = match message.exchange_type {
            ExchangeType::IkeSaInit => None,
            _ => self.keys.as_ref(),
        };
        self.services
            .codec
            .parse_body(message, keys)
            .map_err(|e| match e {
                Error::ParseFailed(_) => e,
                other => Error::ParseFailed(other.to_string()),
            })
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let keys = match message.exchange_type {
            ExchangeType::IkeSaInit => None,
            _ => self.keys.as_ref(),
        };
        self.services
            .codec
            .generate(message, keys)
            .map_err(|e| match e {
                Error::BuildFailed(_) => e,
                other => Error::BuildFailed(other.to_string()),
            })
    }

    fn transmit(&self, packet: &Packet) -> Result<()> {
        self.services
            .transport
            .send(packet)
            .map_err(|e| Error::SendFailed(e.to_string()))?;
        self.services.metrics.record_message_sent();
        Ok(())
    }

    /// Resend a packet as-is
    pub(crate) fn retransmit_packet(&self, packet: &Packet) -> Result<()> {
        self.transmit(packet)
    }

    /// Encode, send and remember a request; returns the datagram
    pub(crate) fn send_request(&mut self, message: Message) -> Result<Vec<u8>> {
        let data = self.encode(&message)?;
        let packet = Packet::new(message.source, message.destination, data.clone());
        logging::log_message_send(&message.to_string(), message.destination, data.len());
        self.transmit(&packet)?;
        self.tasks
            .request_sent(message.message_id, message.exchange_type, packet);
        Ok(data)
    }

    /// Encode, send and cache a response; returns the datagram
    pub(crate) fn send_response(&mut self, message: Message) -> Result<Vec<u8>> {
        let data = self.encode(&message)?;
        let packet = Packet::new(message.source, message.destination, data.clone());
        logging::log_message_send(&message.to_string(), message.destination, data.len());
        self.transmit(&packet)?;
        self.tasks.response_sent(message.message_id, packet);
        Ok(data)
    }

    /// Derive IKE_SA keys from the handshake and keep the proposal
    pub(crate) fn derive_keys(
        &mut self,
        proposal: Proposal,
        shared_secret: &[u8],
        nonce_i: &[u8],
        nonce_r: &[u8],
    ) -> Result<()> {
        let sizes = KeySizes::from_proposal(&proposal)?;
        let keys = KeyMaterial::derive(
            sizes,
            nonce_i,
            nonce_r,
            shared_secret,
            self.id.initiator_spi,
            self.id.responder_spi,
        )?;
        self.set_keys(keys, proposal);
        Ok(())
    }

    /// Key and install a negotiated child, then take ownership of it
    ///
    /// Returns the child's inbound SPI.
    pub(crate) fn install_child(
        &mut self,
        mut child: ChildSa,
        nonce_i: &[u8],
        nonce_r: &[u8],
    ) -> Result<u32> {
        let proposal = child
            .proposal
            .as_ref()
            .ok_or_else(|| Error::ChildSaFailed("child SA has no negotiated proposal".into()))?;
        let len = child_sa::keymat_len(proposal)?;
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| Error::InvalidState("IKE_SA has no keys".into()))?;
        let keymat = keys.child_keymat(nonce_i, nonce_r, len)?;

        self.services.child_factory.install(&mut child, &keymat)?;
        self.services.metrics.record_child_sa_created();
        logging::log_child_sa_created(child.my_spi, child.other_spi, child.name());

        let spi = child.my_spi;
        self.child_sas.push(child);
        Ok(spi)
    }

    /// Release everything the SA owns
    ///
    /// Called by the manager when the SA is checked in for destruction.
    pub(crate) fn destroy(&mut self, manager: &IkeSaManager) {
        self.tasks.flush(manager);
        for child in self.child_sas.drain(..) {
            if child.state != ChildSaState::Routed {
                self.services.child_factory.uninstall(&child);
            }
            self.services.metrics.record_child_sa_deleted();
        }
        self.state = None;
        self.keys = None;
        self.proposal = None;
    }
}
