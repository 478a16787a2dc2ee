//! IKE_SA_INIT / IKE_AUTH Integration Tests
//!
//! Runs both peers of a negotiation through the dispatcher and checks the
//! state machine's reaction to well-formed and broken responses.

#![cfg(feature = "ipsec")]

mod common;

use std::time::Duration;

use common::Pair;
use vigil_proto::ipsec::child_sa::ChildSaState;
use vigil_proto::ipsec::config::{Policy, RetransmitConfig};
use vigil_proto::ipsec::ikev2::{
    DhTransformId, EncrTransformId, ExchangeType, IkeSaId, Message, NotifyPayload, NotifyType,
    Payload, PrfTransformId, Proposal, ProtocolId, SaPayload, SaStateKind, StateOutcome,
    Transform, MAX_INIT_RETRIES,
};
use vigil_proto::ipsec::Error;

fn create_ike_proposal(groups: &[DhTransformId]) -> Proposal {
    groups.iter().fold(
        Proposal::new(1, ProtocolId::Ike)
            .add_transform(Transform::encr_with_key(EncrTransformId::AesGcm16, 128))
            .add_transform(Transform::prf(PrfTransformId::HmacSha256)),
        |proposal, group| proposal.add_transform(Transform::dh(*group)),
    )
}

fn create_notify(protocol_id: u8, notify_type: u16) -> NotifyPayload {
    NotifyPayload {
        protocol_id,
        notify_type,
        spi: Vec::new(),
        data: Vec::new(),
    }
}

/// Answer `request` with a bare INVALID_KE_PAYLOAD asking for `group`
fn create_invalid_ke_response(request: &Message, group: u16) -> Message {
    let responder_id = IkeSaId::new(request.ike_sa_id.initiator_spi, 0x5eed, false);
    Message::response_to(request, responder_id)
        .with_payload(Payload::Notify(NotifyPayload::invalid_ke(group)))
}

/// Send IKE_SA_INIT and return the responder's answer, undelivered
fn create_init_response(pair: &Pair) -> Message {
    pair.initiator.initiate();
    pair.deliver(&pair.initiator, &pair.responder);
    let mut responses = pair.take_messages(&pair.responder);
    assert_eq!(responses.len(), 1);
    responses.remove(0)
}

#[test]
fn test_full_handshake() {
    let pair = Pair::new();
    let (id_i, id_r) = pair.establish();

    let (state, children) = pair.initiator.with_sa(&id_i, |sa| {
        (sa.state_kind(), sa.child_sas().to_vec())
    });
    assert_eq!(state, Some(SaStateKind::Established));
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].state, ChildSaState::Installed);

    let (state, peer_children, peer_id) = pair.responder.with_sa(&id_r, |sa| {
        (sa.state_kind(), sa.child_sas().to_vec(), sa.peer_id().cloned())
    });
    // the responder only promotes itself on the next exchange
    assert_eq!(state, Some(SaStateKind::IkeAuthResponded));
    assert_eq!(peer_children.len(), 1);
    assert_eq!(peer_id.unwrap().to_string(), "moon.example.org");

    assert_eq!(children[0].other_spi, peer_children[0].my_spi);
    assert_eq!(children[0].my_spi, peer_children[0].other_spi);
    assert!(pair.initiator.children.is_installed(children[0].my_spi));
    assert!(pair.responder.children.is_installed(peer_children[0].my_spi));

    assert_eq!(id_i.initiator_spi, id_r.initiator_spi);
    assert_eq!(id_i.responder_spi, id_r.responder_spi);

    let metrics = pair.initiator.manager().metrics().snapshot();
    assert_eq!(metrics.ike_sa_established, 1);
    assert_eq!(metrics.child_sa_created, 1);
    assert_eq!(metrics.messages_sent, 2);
    assert_eq!(metrics.messages_received, 2);
}

#[test]
fn test_traffic_selectors_round_trip() {
    let pair = Pair::new();
    let (id_i, id_r) = pair.establish();

    let child = pair.initiator.with_sa(&id_i, |sa| sa.child_sas()[0].clone());
    let peer_child = pair.responder.with_sa(&id_r, |sa| sa.child_sas()[0].clone());

    assert_eq!(child.my_ts, pair.initiator.policy.my_traffic_selectors());
    assert_eq!(child.other_ts, pair.initiator.policy.other_traffic_selectors());
    assert_eq!(peer_child.my_ts, child.other_ts);
    assert_eq!(peer_child.other_ts, child.my_ts);
}

#[test]
fn test_init_response_moves_to_auth_requested() {
    let pair = Pair::new();
    let response = create_init_response(&pair);
    assert_eq!(response.exchange_type, ExchangeType::IkeSaInit);
    assert!(response.sa().is_some() && response.ke().is_some() && response.nonce().is_some());

    let outcomes = pair.deliver_messages(&pair.initiator, vec![response]);
    assert_eq!(outcomes, vec![StateOutcome::Transition(SaStateKind::IkeAuthRequested)]);

    let requests = pair.take_messages(&pair.initiator);
    assert_eq!(requests.len(), 1);
    let auth = &requests[0];
    assert_eq!(auth.exchange_type, ExchangeType::IkeAuth);
    assert_eq!(auth.message_id, 1);
    assert!(auth.is_request());
    assert!(auth.id_i().is_some());
    assert!(auth.auth().is_some());
    assert!(auth.sa().is_some());
    assert!(auth.ts_i().is_some());
    assert!(auth.ts_r().is_some());
}

#[test]
fn test_missing_payload_deletes_sa() {
    for (name, is_missing) in [
        ("SA", (|p: &Payload| matches!(p, Payload::Sa(_))) as fn(&Payload) -> bool),
        ("KE", |p: &Payload| matches!(p, Payload::Ke(_))),
        ("NONCE", |p: &Payload| matches!(p, Payload::Nonce(_))),
    ] {
        let pair = Pair::new();
        let mut response = create_init_response(&pair);
        response.payloads.retain(|p| !is_missing(p));

        let outcomes = pair.deliver_messages(&pair.initiator, vec![response]);
        assert_eq!(outcomes, vec![StateOutcome::DeleteSa(Error::MissingPayload(name))]);
        assert_eq!(pair.initiator.manager().count(), 0);
        assert_eq!(pair.initiator.transport.pending(), 0);
    }
}

#[test]
fn test_two_proposals_in_response_deletes_sa() {
    let pair = Pair::new();
    let mut response = create_init_response(&pair);
    let chosen = response.sa().unwrap().proposals()[0].clone();
    for payload in response.payloads.iter_mut() {
        if let Payload::Sa(_) = payload {
            *payload = Payload::Sa(SaPayload::new(vec![chosen.clone(), chosen.clone()]));
        }
    }

    let outcomes = pair.deliver_messages(&pair.initiator, vec![response]);
    assert_eq!(outcomes, vec![StateOutcome::DeleteSa(Error::ProposalCount(2))]);
    assert_eq!(pair.initiator.manager().count(), 0);
    let metrics = pair.initiator.manager().metrics().snapshot();
    assert_eq!(metrics.proposal_negotiation_failed, 1);
}

#[test]
fn test_no_proposal_chosen_deletes_both_sides() {
    let pair = Pair::builder()
        .initiator_proposals(vec![create_ike_proposal(&[DhTransformId::Group14])])
        .responder_proposals(vec![create_ike_proposal(&[DhTransformId::Group19])])
        .build();

    pair.initiator.initiate();
    let outcomes = pair.deliver(&pair.initiator, &pair.responder);
    assert_eq!(outcomes, vec![StateOutcome::DeleteSa(Error::NoProposalChosen)]);
    assert_eq!(pair.responder.manager().count(), 0);

    let responses = pair.take_messages(&pair.responder);
    assert_eq!(responses.len(), 1);
    assert!(responses[0].get_notify(NotifyType::NoProposalChosen).is_some());

    let outcomes = pair.deliver_messages(&pair.initiator, responses);
    assert_eq!(outcomes, vec![StateOutcome::DeleteSa(Error::NoProposalChosen)]);
    assert_eq!(pair.initiator.manager().count(), 0);
}

#[test]
fn test_invalid_ke_retries_with_requested_group() {
    let pair = Pair::builder()
        .initiator_proposals(vec![create_ike_proposal(&[
            DhTransformId::Group19,
            DhTransformId::Group14,
        ])])
        .responder_proposals(vec![create_ike_proposal(&[DhTransformId::Group14])])
        .build();

    let id = pair.initiator.initiate();
    let first = pair.take_messages(&pair.initiator);
    assert_eq!(first[0].ke().unwrap().dh_group, 19);
    let first_nonce = first[0].nonce().unwrap().nonce.clone();
    let first_ke = first[0].ke().unwrap().key_data.clone();

    let outcomes = pair.deliver_messages(&pair.responder, first);
    assert_eq!(outcomes, vec![StateOutcome::DeleteSa(Error::DhGroupRejected(19))]);
    let responses = pair.take_messages(&pair.responder);
    let notify = responses[0].get_notify(NotifyType::InvalidKePayload).unwrap();
    assert_eq!(notify.requested_group().unwrap(), 14);

    let outcomes = pair.deliver_messages(&pair.initiator, responses);
    assert_eq!(outcomes, vec![StateOutcome::Transition(SaStateKind::IkeSaInitRequested)]);

    let retry = pair.take_messages(&pair.initiator);
    assert_eq!(retry.len(), 1);
    assert_eq!(retry[0].exchange_type, ExchangeType::IkeSaInit);
    assert_eq!(retry[0].message_id, 0);
    assert_eq!(retry[0].ike_sa_id.responder_spi, 0);
    assert_eq!(retry[0].ke().unwrap().dh_group, 14);
    assert_ne!(retry[0].nonce().unwrap().nonce, first_nonce);
    assert_ne!(retry[0].ke().unwrap().key_data, first_ke);
    assert_eq!(pair.initiator.manager().metrics().snapshot().dh_group_retries, 1);

    pair.deliver_messages(&pair.responder, retry);
    pair.settle();
    let state = pair.initiator.with_sa(&id, |sa| sa.state_kind());
    assert_eq!(state, Some(SaStateKind::Established));
}

#[test]
fn test_invalid_ke_with_unacceptable_group_deletes_sa() {
    let pair = Pair::new();
    pair.initiator.initiate();
    let request = pair.take_messages(&pair.initiator).remove(0);

    let response = create_invalid_ke_response(&request, 15);

    let outcomes = pair.deliver_messages(&pair.initiator, vec![response]);
    assert_eq!(outcomes, vec![StateOutcome::DeleteSa(Error::DhGroupRejected(15))]);
    assert_eq!(pair.initiator.manager().count(), 0);
}

#[test]
fn test_invalid_ke_for_current_group_is_rejected() {
    let pair = Pair::new();
    let id = pair.initiator.initiate();
    let request = pair.take_messages(&pair.initiator).remove(0);
    let group = request.ke().unwrap().dh_group;

    for _ in 0..3 {
        let response = create_invalid_ke_response(&request, group);
        let outcomes = pair.deliver_messages(&pair.initiator, vec![response]);
        assert!(matches!(
            outcomes.as_slice(),
            [StateOutcome::Fail(Error::UnexpectedMessage(_))]
        ));
    }
    assert_eq!(pair.initiator.transport.pending(), 0);
    assert_eq!(pair.initiator.manager().metrics().snapshot().dh_group_retries, 0);
    let state = pair.initiator.with_sa(&id, |sa| sa.state_kind());
    assert_eq!(state, Some(SaStateKind::IkeSaInitRequested));

    // the outstanding request is still answerable
    pair.deliver_messages(&pair.responder, vec![request]);
    pair.settle();
    let state = pair.initiator.with_sa(&id, |sa| sa.state_kind());
    assert_eq!(state, Some(SaStateKind::Established));
}

#[test]
fn test_invalid_ke_retries_are_capped() {
    let pair = Pair::builder()
        .initiator_proposals(vec![create_ike_proposal(&[
            DhTransformId::Group19,
            DhTransformId::Group14,
        ])])
        .build();
    pair.initiator.initiate();

    for _ in 0..MAX_INIT_RETRIES {
        let request = pair.take_messages(&pair.initiator).remove(0);
        let other = if request.ke().unwrap().dh_group == 19 { 14 } else { 19 };
        let outcomes =
            pair.deliver_messages(&pair.initiator, vec![create_invalid_ke_response(&request, other)]);
        assert_eq!(outcomes, vec![StateOutcome::Transition(SaStateKind::IkeSaInitRequested)]);
    }

    let request = pair.take_messages(&pair.initiator).remove(0);
    let other = if request.ke().unwrap().dh_group == 19 { 14 } else { 19 };
    let outcomes =
        pair.deliver_messages(&pair.initiator, vec![create_invalid_ke_response(&request, other)]);
    assert_eq!(
        outcomes,
        vec![StateOutcome::DeleteSa(Error::InitRetriesExceeded(MAX_INIT_RETRIES))]
    );
    assert_eq!(pair.initiator.manager().count(), 0);
    assert_eq!(
        pair.initiator.manager().metrics().snapshot().dh_group_retries,
        u64::from(MAX_INIT_RETRIES)
    );
}

#[test]
fn test_unknown_error_notify_deletes_sa() {
    let pair = Pair::new();
    let mut response = create_init_response(&pair);
    response.add_payload(Payload::Notify(create_notify(0, 9000)));

    let outcomes = pair.deliver_messages(&pair.initiator, vec![response]);
    assert_eq!(outcomes, vec![StateOutcome::DeleteSa(Error::ErrorNotify(9000))]);
    assert_eq!(pair.initiator.manager().count(), 0);
}

#[test]
fn test_unknown_status_notify_is_ignored() {
    let pair = Pair::new();
    let mut response = create_init_response(&pair);
    response.add_payload(Payload::Notify(create_notify(0, 40000)));

    let outcomes = pair.deliver_messages(&pair.initiator, vec![response]);
    assert_eq!(outcomes, vec![StateOutcome::Transition(SaStateKind::IkeAuthRequested)]);
    assert_eq!(pair.initiator.transport.pending(), 1);
}

#[test]
fn test_notify_for_esp_is_rejected() {
    let pair = Pair::new();
    let mut response = create_init_response(&pair);
    let esp = ProtocolId::Esp.to_u8();
    response.add_payload(Payload::Notify(create_notify(esp, 14)));

    let outcomes = pair.deliver_messages(&pair.initiator, vec![response]);
    assert_eq!(outcomes, vec![StateOutcome::Fail(Error::NotifyProtocolMismatch(esp))]);
    assert_eq!(pair.initiator.manager().count(), 1);
    assert_eq!(pair.initiator.transport.pending(), 0);
}

#[test]
fn test_zero_responder_spi_is_rejected() {
    let pair = Pair::new();
    let mut response = create_init_response(&pair);
    response.ike_sa_id.responder_spi = 0;

    let outcomes = pair.deliver_messages(&pair.initiator, vec![response]);
    assert_eq!(outcomes, vec![StateOutcome::Fail(Error::ZeroSpi)]);
    assert_eq!(pair.initiator.manager().count(), 1);
}

#[test]
fn test_retransmitted_init_request_reuses_sa() {
    let pair = Pair::new();
    pair.initiator.initiate();
    let request = pair.take_messages(&pair.initiator).remove(0);

    pair.deliver_messages(&pair.responder, vec![request.clone()]);
    let outcomes = pair.deliver_messages(&pair.responder, vec![request]);
    assert_eq!(outcomes, vec![StateOutcome::Continue]);
    assert_eq!(pair.responder.manager().count(), 1);

    let responses = pair.take_messages(&pair.responder);
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0], responses[1]);
}

#[test]
fn test_authentication_failure_deletes_sa() {
    let pair = Pair::new();
    pair.initiator.initiate();
    pair.deliver(&pair.initiator, &pair.responder);
    pair.deliver(&pair.responder, &pair.initiator);

    let mut auth = pair.take_messages(&pair.initiator);
    for payload in auth[0].payloads.iter_mut() {
        if let Payload::Auth(a) = payload {
            a.auth_data[0] ^= 0xff;
        }
    }
    let outcomes = pair.deliver_messages(&pair.responder, auth);
    assert!(matches!(outcomes[0], StateOutcome::DeleteSa(Error::AuthenticationFailed(_))));
    assert_eq!(pair.responder.manager().count(), 0);

    let responses = pair.take_messages(&pair.responder);
    assert!(responses[0].get_notify(NotifyType::AuthenticationFailed).is_some());
    let outcomes = pair.deliver_messages(&pair.initiator, responses);
    assert!(matches!(outcomes[0], StateOutcome::DeleteSa(Error::AuthenticationFailed(_))));
    assert_eq!(pair.initiator.manager().count(), 0);
}

#[test]
fn test_retransmit_until_timeout() {
    let pair = Pair::builder()
        .retransmit(RetransmitConfig {
            timeout: Duration::from_secs(1),
            base: 2.0,
            tries: 2,
        })
        .build();
    let id = pair.initiator.initiate();
    let dispatcher = &pair.initiator.dispatcher;
    let bus = &pair.initiator.bus;

    assert_eq!(dispatcher.retransmit(bus, &id, 0), Ok(Some(Duration::from_secs(2))));
    assert_eq!(dispatcher.retransmit(bus, &id, 0), Ok(Some(Duration::from_secs(4))));
    assert_eq!(pair.initiator.transport.sent_count(), 3);

    let sent = pair.take_messages(&pair.initiator);
    assert!(sent.iter().all(|m| *m == sent[0]));

    assert_eq!(dispatcher.retransmit(bus, &id, 0), Err(Error::RetransmitTimeout(0)));
    assert_eq!(pair.initiator.manager().count(), 0);
    assert_eq!(pair.initiator.manager().metrics().snapshot().retransmits, 2);
}

#[test]
fn test_retransmit_after_response_is_noop() {
    let pair = Pair::new();
    let (id, _) = pair.establish();
    let sent = pair.initiator.transport.sent_count();

    assert_eq!(pair.initiator.dispatcher.retransmit(&pair.initiator.bus, &id, 1), Ok(None));
    assert_eq!(pair.initiator.transport.sent_count(), sent);
}

#[test]
fn test_send_failure_deletes_sa() {
    let pair = Pair::new();
    pair.initiator
        .transport
        .down
        .store(true, std::sync::atomic::Ordering::Relaxed);

    let result = pair.initiator.dispatcher.initiate(
        &pair.initiator.bus,
        pair.initiator.connection.clone(),
        pair.initiator.policy.clone(),
    );
    assert!(matches!(result, Err(Error::SendFailed(_))));
    assert_eq!(pair.initiator.manager().count(), 0);
}
