//! Responder states: IKE_SA_INIT handling, IKE_SA_INIT_RESPONDED, IKE_AUTH_RESPONDED

use std::sync::Arc;

use tracing::{debug, warn};

use super::established::Established;
use super::{SaState, Transition};
use crate::ipsec::config::Policy;
use crate::ipsec::ikev2::constants::{ExchangeType, NotifyType};
use crate::ipsec::ikev2::ike_sa::IkeSa;
use crate::ipsec::ikev2::message::Message;
use crate::ipsec::ikev2::payload::{
    IdPayload, KePayload, NoncePayload, NotifyPayload, Payload, SaPayload, TsPayload,
};
use crate::ipsec::{logging, Error, Result};

/// Answer the IKE_SA_INIT request that created a responder SA
///
/// Errors are local failures (the request is dropped); fatal outcomes are
/// returned as [`Transition::Delete`].
pub(crate) fn respond_init(sa: &mut IkeSa, mut message: Message) -> Result<Transition> {
    if sa.id().is_initiator {
        return Err(Error::UnexpectedMessage(
            "message for an IKE_SA that was never initiated".into(),
        ));
    }
    if message.exchange_type != ExchangeType::IkeSaInit || !message.is_request() {
        return Err(Error::UnexpectedExchange(format!(
            "{} before IKE_SA_INIT",
            message.exchange_type
        )));
    }
    if message.message_id != 0 {
        return Err(Error::UnexpectedMessage(format!(
            "IKE_SA_INIT request with message ID {}",
            message.message_id
        )));
    }
    sa.parse_body(&mut message)?;

    sa.set_remote_spi(message.ike_sa_id.initiator_spi);
    logging::log_handshake_start(message.source, "responder");

    let services = Arc::clone(sa.services());
    let Some(connection) = services
        .config
        .find_connection(message.destination, message.source)
    else {
        return Ok(Transition::Delete(Error::NoMatchingConfig(format!(
            "no connection for {} - {}",
            message.destination, message.source
        ))));
    };
    sa.set_connection(Arc::clone(&connection));
    sa.set_my_host(message.destination);
    sa.set_other_host(message.source);

    let (Some(sa_payload), Some(ke), Some(nonce)) = (message.sa(), message.ke(), message.nonce())
    else {
        let missing = match (message.sa(), message.ke()) {
            (None, _) => "SA",
            (_, None) => "KE",
            _ => "NONCE",
        };
        return Ok(Transition::Delete(Error::MissingPayload(missing)));
    };

    let proposal = match connection.select_proposal(sa_payload.proposals()) {
        Ok(proposal) => proposal,
        Err(e) => {
            logging::log_proposal_negotiation(sa_payload.proposals().len(), None);
            send_error(sa, &message, NotifyPayload::new(NotifyType::NoProposalChosen, Vec::new()));
            return Ok(Transition::Delete(e));
        }
    };
    logging::log_proposal_negotiation(sa_payload.proposals().len(), Some(proposal.proposal_num));

    let Some(group) = proposal.dh_group() else {
        send_error(sa, &message, NotifyPayload::new(NotifyType::NoProposalChosen, Vec::new()));
        return Ok(Transition::Delete(Error::NoProposalChosen));
    };
    if ke.dh_group != group {
        debug!(offered = ke.dh_group, wanted = group, "Requesting different DH group");
        send_error(sa, &message, NotifyPayload::invalid_ke(group));
        return Ok(Transition::Delete(Error::DhGroupRejected(ke.dh_group)));
    }

    let mut dh = match services.dh_factory.create(group) {
        Ok(dh) => dh,
        Err(e) => return Ok(Transition::Delete(e.into())),
    };
    if let Err(e) = dh.set_other_public_value(&ke.key_data) {
        return Ok(Transition::Delete(e.into()));
    }
    let shared_secret = match dh.shared_secret() {
        Ok(secret) => secret,
        Err(e) => return Ok(Transition::Delete(e.into())),
    };

    let my_nonce = NoncePayload::generate();
    let other_nonce = nonce.nonce.clone();
    if let Err(e) = sa.derive_keys(proposal.clone(), &shared_secret, &other_nonce, &my_nonce.nonce) {
        return Ok(Transition::Delete(e));
    }

    let mut response = Message::response_to(&message, sa.id());
    response.add_payload(Payload::Sa(SaPayload::new(vec![proposal])));
    response.add_payload(Payload::Ke(KePayload::new(group, dh.my_public_value())));
    response.add_payload(Payload::Nonce(my_nonce.clone()));

    let init_response = match sa.send_response(response) {
        Ok(data) => data,
        Err(e) => return Ok(Transition::Delete(e)),
    };

    Ok(Transition::Next(SaState::IkeSaInitResponded(IkeSaInitResponded {
        my_nonce: my_nonce.nonce,
        other_nonce,
        init_request: message.packet_data,
        init_response,
    })))
}

/// Reply to `request` with a single notify, best effort
fn send_error(sa: &mut IkeSa, request: &Message, notify: NotifyPayload) {
    let response =
        Message::response_to(request, sa.id()).with_payload(Payload::Notify(notify));
    if let Err(e) = sa.send_response(response) {
        debug!(error = %e, "Unable to send error notify");
    }
}

/// Responder waiting for the IKE_AUTH request
pub struct IkeSaInitResponded {
    my_nonce: Vec<u8>,
    other_nonce: Vec<u8>,
    init_request: Vec<u8>,
    init_response: Vec<u8>,
}

impl IkeSaInitResponded {
    fn reject(self, error: Error) -> Transition {
        Transition::Reject(SaState::IkeSaInitResponded(self), error)
    }

    pub(crate) fn process(self, sa: &mut IkeSa, mut message: Message) -> Transition {
        if message.exchange_type != ExchangeType::IkeAuth {
            return self.reject(Error::UnexpectedExchange(format!(
                "{} while waiting for IKE_AUTH",
                message.exchange_type
            )));
        }
        if !message.is_request() {
            return self.reject(Error::UnexpectedMessage(
                "response while waiting for IKE_AUTH request".into(),
            ));
        }
        let expected = sa.tasks().expected_request_id();
        if message.message_id != expected {
            return self.reject(Error::UnexpectedMessage(format!(
                "IKE_AUTH request {} while expecting {}",
                message.message_id, expected
            )));
        }
        if let Err(e) = sa.parse_body(&mut message) {
            return self.reject(e);
        }

        let Some(id_i) = message.id_i() else {
            return Transition::Delete(Error::MissingPayload("IDi"));
        };
        let Some(auth) = message.auth() else {
            return Transition::Delete(Error::MissingPayload("AUTH"));
        };

        let services = Arc::clone(sa.services());
        let connection = match sa.connection() {
            Ok(connection) => connection,
            Err(e) => return Transition::Delete(e),
        };
        let Some(policy) = services.config.find_policy(connection.name(), &id_i.identity) else {
            send_error(sa, &message, NotifyPayload::new(NotifyType::AuthenticationFailed, Vec::new()));
            return Transition::Delete(Error::NoMatchingConfig(format!(
                "no policy for peer {}",
                id_i.identity
            )));
        };

        let Some(keys) = sa.keys() else {
            return Transition::Delete(Error::Internal("IKE_SA has no keys".into()));
        };
        if let Err(e) = services.authenticator.verify_auth_data(
            keys,
            &self.init_request,
            &self.my_nonce,
            id_i,
            true,
            auth,
        ) {
            send_error(sa, &message, NotifyPayload::new(NotifyType::AuthenticationFailed, Vec::new()));
            return Transition::Delete(e);
        }

        let id_r = IdPayload::new(policy.my_id());
        let our_auth = match services.authenticator.compute_auth_data(
            keys,
            &self.init_response,
            &self.other_nonce,
            &id_r,
            false,
        ) {
            Ok(auth) => auth,
            Err(e) => return Transition::Delete(e),
        };

        sa.set_policy(Arc::clone(&policy));
        sa.set_peer_id(Some(Arc::clone(&id_i.identity)));

        let mut response = Message::response_to(&message, sa.id());
        response.add_payload(Payload::IdR(id_r));
        response.add_payload(Payload::Auth(our_auth));

        if message.sa().is_some() {
            match self.negotiate_child(sa, &policy, &message) {
                Ok(payloads) => response.payloads.extend(payloads),
                Err(e) => {
                    warn!(error = %e, "Child SA in IKE_AUTH not created");
                    response.add_payload(Payload::Notify(NotifyPayload::new(
                        NotifyType::NoProposalChosen,
                        Vec::new(),
                    )));
                }
            }
        }

        if let Err(e) = sa.send_response(response) {
            return Transition::Delete(e);
        }

        Transition::Next(SaState::IkeAuthResponded(IkeAuthResponded))
    }

    /// Select, allocate and install the child carried in IKE_AUTH
    fn negotiate_child(
        &self,
        sa: &mut IkeSa,
        policy: &Arc<dyn Policy>,
        request: &Message,
    ) -> Result<Vec<Payload>> {
        let offered = request.sa().ok_or(Error::MissingPayload("SA"))?;
        let selected = policy.select_proposal(offered.proposals())?;
        let other_spi = selected
            .child_spi()
            .ok_or_else(|| Error::ChildSaFailed("initiator sent no child SPI".into()))?;

        let mut bound = [selected];
        let mut child = sa.services().child_factory.alloc(
            sa.my_host(),
            sa.other_host(),
            Arc::clone(policy),
            &mut bound,
        )?;
        let [selected] = bound;
        child.set_negotiated(selected.clone(), other_spi);

        let ts_i = TsPayload::new(child.other_ts.clone());
        let ts_r = TsPayload::new(child.my_ts.clone());
        sa.install_child(child, &self.other_nonce, &self.my_nonce)?;

        Ok(vec![
            Payload::Sa(SaPayload::new(vec![selected])),
            Payload::TsI(ts_i),
            Payload::TsR(ts_r),
        ])
    }
}

/// Responder that answered IKE_AUTH
///
/// Becomes ESTABLISHED when the next request arrives or local work starts.
#[derive(Debug)]
pub struct IkeAuthResponded;

impl IkeAuthResponded {
    pub(crate) fn promote(self) -> Established {
        Established
    }
}
