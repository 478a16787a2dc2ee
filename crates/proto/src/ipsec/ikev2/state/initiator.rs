//! Initiator states: INITIATOR_INIT, IKE_SA_INIT_REQUESTED, IKE_AUTH_REQUESTED

use std::sync::Arc;

use tracing::{debug, warn};
use vigil_platform::DiffieHellman;

use super::{SaState, Transition};
use crate::ipsec::child_sa::ChildSa;
use crate::ipsec::ikev2::constants::{ExchangeType, NotifyType};
use crate::ipsec::ikev2::ike_sa::IkeSa;
use crate::ipsec::ikev2::message::Message;
use crate::ipsec::ikev2::payload::{
    IdPayload, KePayload, NoncePayload, NotifyPayload, Payload, SaPayload, TsPayload,
};
use crate::ipsec::ikev2::proposal::select_response_proposal;
use crate::ipsec::{logging, Disposition, Error, Result};

/// IKE_SA_INIT restarts allowed on INVALID_KE_PAYLOAD before giving up
pub const MAX_INIT_RETRIES: u32 = 5;

/// Pre-exchange state, holding the DH group to offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitiatorInit {
    dh_group: u16,
}

impl InitiatorInit {
    /// Prepare an exchange using `dh_group`
    pub fn new(dh_group: u16) -> Self {
        InitiatorInit { dh_group }
    }

    /// DH group the KE payload will use
    pub fn dh_group(&self) -> u16 {
        self.dh_group
    }

    /// Send IKE_SA_INIT with a fresh DH value and nonce
    pub(crate) fn initiate(self, sa: &mut IkeSa) -> Result<IkeSaInitRequested> {
        let connection = sa.connection()?;
        let dh = sa.services().dh_factory.create(self.dh_group)?;
        let nonce = NoncePayload::generate();

        let mut request = sa.new_request(ExchangeType::IkeSaInit);
        request.add_payload(Payload::Sa(SaPayload::new(connection.proposals())));
        request.add_payload(Payload::Ke(KePayload::new(self.dh_group, dh.my_public_value())));
        request.add_payload(Payload::Nonce(nonce.clone()));

        let init_request = sa.send_request(request)?;

        Ok(IkeSaInitRequested {
            dh,
            my_nonce: nonce.nonce,
            init_request,
            retries: 0,
        })
    }
}

/// What a notify in the IKE_SA_INIT response asks for
enum NotifyAction {
    Continue,
    Retry(u16),
}

/// Initiator waiting for the IKE_SA_INIT response
pub struct IkeSaInitRequested {
    dh: Box<dyn DiffieHellman>,
    my_nonce: Vec<u8>,
    init_request: Vec<u8>,
    retries: u32,
}

impl IkeSaInitRequested {
    /// DH group of the outstanding request
    pub fn dh_group(&self) -> u16 {
        self.dh.group()
    }

    /// Nonce we sent
    pub fn my_nonce(&self) -> &[u8] {
        &self.my_nonce
    }

    /// Times IKE_SA_INIT was restarted with another group
    pub fn retries(&self) -> u32 {
        self.retries
    }

    fn reject(self, error: Error) -> Transition {
        Transition::Reject(SaState::IkeSaInitRequested(self), error)
    }

    fn fail(self, error: Error) -> Transition {
        if error.is_fatal() {
            Transition::Delete(error)
        } else {
            self.reject(error)
        }
    }

    pub(crate) fn process(mut self, sa: &mut IkeSa, mut message: Message) -> Transition {
        if message.exchange_type != ExchangeType::IkeSaInit {
            return self.reject(Error::UnexpectedExchange(format!(
                "{} while waiting for IKE_SA_INIT response",
                message.exchange_type
            )));
        }
        if message.is_request() {
            return self.reject(Error::UnexpectedMessage(
                "IKE_SA_INIT request while waiting for response".into(),
            ));
        }
        if let Err(e) = sa.parse_body(&mut message) {
            return self.reject(e);
        }

        let responder_spi = message.ike_sa_id.responder_spi;
        if responder_spi == 0 {
            return self.reject(Error::ZeroSpi);
        }

        let mut sa_payload = None;
        let mut ke = None;
        let mut nonce = None;
        for payload in &message.payloads {
            match payload {
                Payload::Sa(p) => sa_payload = Some(p),
                Payload::Ke(p) => ke = Some(p),
                Payload::Nonce(p) => nonce = Some(p),
                Payload::Notify(n) => match self.handle_notify(sa, n) {
                    Ok(NotifyAction::Continue) => {}
                    Ok(NotifyAction::Retry(group)) => return self.retry(sa, group),
                    Err(e) if e.disposition() == Disposition::Ignore => logging::log_ignored(&e),
                    Err(e) => return self.fail(e),
                },
                other => logging::log_ignored(&Error::IgnoredPayload(other.type_number())),
            }
        }
        sa.set_remote_spi(responder_spi);

        let (Some(sa_payload), Some(ke), Some(nonce)) = (sa_payload, ke, nonce) else {
            let missing = match (sa_payload, ke) {
                (None, _) => "SA",
                (_, None) => "KE",
                _ => "NONCE",
            };
            return Transition::Delete(Error::MissingPayload(missing));
        };

        let other_nonce = nonce.nonce.clone();

        let connection = match sa.connection() {
            Ok(connection) => connection,
            Err(e) => return Transition::Delete(e),
        };
        let proposal = match select_response_proposal(&connection.proposals(), sa_payload.proposals()) {
            Ok(proposal) => proposal,
            Err(e) => {
                logging::log_proposal_negotiation(sa_payload.proposals().len(), None);
                return Transition::Delete(e);
            }
        };
        logging::log_proposal_negotiation(1, Some(proposal.proposal_num));

        if ke.dh_group != self.dh.group() {
            return Transition::Delete(Error::DhGroupRejected(ke.dh_group));
        }
        if let Err(e) = self.dh.set_other_public_value(&ke.key_data) {
            return Transition::Delete(e.into());
        }
        let shared_secret = match self.dh.shared_secret() {
            Ok(secret) => secret,
            Err(e) => return Transition::Delete(e.into()),
        };
        if let Err(e) = sa.derive_keys(proposal, &shared_secret, &self.my_nonce, &other_nonce) {
            return Transition::Delete(e);
        }

        // the path may differ from the configured one
        connection.update_my_host(message.destination);
        sa.set_my_host(message.destination);

        let (request, child) = match self.build_auth_request(sa, &other_nonce, &message) {
            Ok(built) => built,
            Err(e) => return self.fail(e),
        };
        if let Err(e) = sa.send_request(request) {
            return self.fail(e);
        }
        sa.set_last_replied_message_id(message.message_id);

        Transition::Next(SaState::IkeAuthRequested(IkeAuthRequested {
            my_nonce: self.my_nonce,
            other_nonce,
            init_response: message.packet_data,
            child,
        }))
    }

    fn handle_notify(&self, sa: &IkeSa, notify: &NotifyPayload) -> Result<NotifyAction> {
        logging::log_notify(notify.notify_type, notify.protocol_id, notify.is_error());

        if !notify.is_for_ike() {
            return Err(Error::NotifyProtocolMismatch(notify.protocol_id));
        }

        match notify.known_type() {
            Some(NotifyType::NoProposalChosen) => Err(Error::NoProposalChosen),
            Some(NotifyType::InvalidMajorVersion) => Err(Error::ErrorNotify(notify.notify_type)),
            Some(NotifyType::InvalidKePayload) => {
                let group = notify
                    .requested_group()
                    .map_err(|_| Error::ErrorNotify(notify.notify_type))?;
                if group == self.dh.group() {
                    return Err(Error::UnexpectedMessage(format!(
                        "INVALID_KE_PAYLOAD names group {} already in use",
                        group
                    )));
                }
                if !sa.connection()?.check_dh_group(group) {
                    return Err(Error::DhGroupRejected(group));
                }
                Ok(NotifyAction::Retry(group))
            }
            _ if notify.is_error() => Err(Error::ErrorNotify(notify.notify_type)),
            None => Err(Error::StatusNotify(notify.notify_type)),
            Some(_) => {
                debug!(notify_type = notify.notify_type, "Status notify ignored");
                Ok(NotifyAction::Continue)
            }
        }
    }

    /// Go back to INITIATOR_INIT with `group` and resend IKE_SA_INIT
    fn retry(self, sa: &mut IkeSa, group: u16) -> Transition {
        if self.retries >= MAX_INIT_RETRIES {
            return Transition::Delete(Error::InitRetriesExceeded(self.retries));
        }
        logging::log_dh_group_retry(sa.id().initiator_spi, self.dh.group(), group);
        sa.services().metrics.record_dh_group_retry();
        let retries = self.retries + 1;
        drop(self);

        sa.reset_message_buffers();
        sa.set_remote_spi(0);

        match InitiatorInit::new(group).initiate(sa) {
            Ok(mut requested) => {
                requested.retries = retries;
                Transition::Rollback(SaState::IkeSaInitRequested(requested))
            }
            Err(e) => Transition::Delete(e),
        }
    }

    fn build_auth_request(
        &self,
        sa: &mut IkeSa,
        other_nonce: &[u8],
        init_response: &Message,
    ) -> Result<(Message, Option<ChildSa>)> {
        let services = Arc::clone(sa.services());
        let policy = sa.policy()?;
        policy.update_my_ts(init_response.destination.ip());

        let keys = sa
            .keys()
            .ok_or_else(|| Error::Internal("IKE_SA keys missing after derivation".into()))?;
        let id = IdPayload::new(policy.my_id());
        let auth = services
            .authenticator
            .compute_auth_data(keys, &self.init_request, other_nonce, &id, true)?;

        let mut request = sa.new_request(ExchangeType::IkeAuth);
        request.add_payload(Payload::IdI(id));
        request.add_payload(Payload::Auth(auth));

        let child = match sa.auth_child() {
            Some(config) => {
                let mut proposals = config.proposals();
                let child = services.child_factory.alloc(
                    sa.my_host(),
                    sa.other_host(),
                    config,
                    &mut proposals,
                )?;
                request.add_payload(Payload::Sa(SaPayload::new(proposals)));
                request.add_payload(Payload::TsI(TsPayload::new(child.my_ts.clone())));
                request.add_payload(Payload::TsR(TsPayload::new(child.other_ts.clone())));
                Some(child)
            }
            None => None,
        };

        Ok((request, child))
    }
}

/// Initiator waiting for the IKE_AUTH response
pub struct IkeAuthRequested {
    my_nonce: Vec<u8>,
    other_nonce: Vec<u8>,
    init_response: Vec<u8>,
    child: Option<ChildSa>,
}

impl IkeAuthRequested {
    /// Child SA being negotiated within IKE_AUTH
    pub fn child(&self) -> Option<&ChildSa> {
        self.child.as_ref()
    }

    fn reject(self, error: Error) -> Transition {
        Transition::Reject(SaState::IkeAuthRequested(self), error)
    }

    pub(crate) fn process(self, sa: &mut IkeSa, mut message: Message) -> Transition {
        if message.exchange_type != ExchangeType::IkeAuth {
            return self.reject(Error::UnexpectedExchange(format!(
                "{} while waiting for IKE_AUTH response",
                message.exchange_type
            )));
        }
        if message.is_request() {
            return self.reject(Error::UnexpectedMessage(
                "request while waiting for IKE_AUTH response".into(),
            ));
        }
        if let Err(e) = sa.parse_body(&mut message) {
            return self.reject(e);
        }

        let mut child_refused = false;
        for notify in message.notifies() {
            logging::log_notify(notify.notify_type, notify.protocol_id, notify.is_error());
            if !notify.is_error() {
                continue;
            }
            match notify.known_type() {
                Some(NotifyType::AuthenticationFailed) => {
                    return Transition::Delete(Error::AuthenticationFailed(
                        "peer reported AUTHENTICATION_FAILED".into(),
                    ))
                }
                Some(
                    NotifyType::NoProposalChosen
                    | NotifyType::SinglePairRequired
                    | NotifyType::NoAdditionalSas
                    | NotifyType::InternalAddressFailure
                    | NotifyType::FailedCpRequired
                    | NotifyType::TsUnacceptable
                    | NotifyType::InvalidSelectors,
                ) => child_refused = true,
                _ => return Transition::Delete(Error::ErrorNotify(notify.notify_type)),
            }
        }

        let Some(id_r) = message.id_r() else {
            return Transition::Delete(Error::MissingPayload("IDr"));
        };
        let Some(auth) = message.auth() else {
            return Transition::Delete(Error::MissingPayload("AUTH"));
        };

        let policy = match sa.policy() {
            Ok(policy) => policy,
            Err(e) => return Transition::Delete(e),
        };
        let Some(keys) = sa.keys() else {
            return Transition::Delete(Error::Internal("IKE_SA has no keys".into()));
        };
        if let Err(e) = sa.services().authenticator.verify_auth_data(
            keys,
            &self.init_response,
            &self.my_nonce,
            id_r,
            false,
            auth,
        ) {
            return Transition::Delete(e);
        }
        if *id_r.identity != *policy.other_id() {
            return Transition::Delete(Error::AuthenticationFailed(format!(
                "peer authenticated as {}, expected {}",
                id_r.identity,
                policy.other_id()
            )));
        }
        sa.set_peer_id(Some(Arc::clone(&id_r.identity)));

        if let Some(child) = self.child {
            if child_refused {
                warn!(child = child.name(), "Peer refused child SA in IKE_AUTH");
            } else if message.sa().is_none() {
                warn!(child = child.name(), "IKE_AUTH response carries no child SA");
            } else if let Err(e) =
                complete_child(sa, child, &message, &self.my_nonce, &self.other_nonce)
            {
                return Transition::Delete(e);
            }
        }

        sa.tasks_mut().complete_exchange(message.message_id);
        Transition::Next(SaState::Established(super::established::Established))
    }
}

/// Bind the responder's choice to our child and install it
fn complete_child(
    sa: &mut IkeSa,
    mut child: ChildSa,
    response: &Message,
    my_nonce: &[u8],
    other_nonce: &[u8],
) -> Result<u32> {
    let sa_payload = response.sa().ok_or(Error::MissingPayload("SA"))?;
    let proposal = select_response_proposal(&child.config.proposals(), sa_payload.proposals())?;
    let other_spi = proposal
        .child_spi()
        .ok_or_else(|| Error::ChildSaFailed("responder sent no child SPI".into()))?;
    child.set_negotiated(proposal, other_spi);

    if let Some(ts) = response.ts_i() {
        child.my_ts = ts.selectors.clone();
    }
    if let Some(ts) = response.ts_r() {
        child.other_ts = ts.selectors.clone();
    }

    sa.install_child(child, my_nonce, other_nonce)
}
