//! Structured logging for IKEv2 negotiation
//!
//! Provides structured, contextual logging using the `tracing` framework.
//! SPIs are always rendered as hex.
//!
//! # Log Levels
//!
//! - **TRACE**: Message contents, skipped payloads
//! - **DEBUG**: Task progress, retransmissions, notify handling
//! - **INFO**: IKE_SA and child SA lifecycle, state transitions
//! - **WARN/ERROR**: Audit events (target [`AUDIT_TARGET`])
//!
//! # Audit channel
//!
//! Fatal errors (anything that deletes an IKE_SA) are emitted on the separate
//! `vigil::audit` target so they can be routed independently of routine
//! control-flow logging.
//!
//! # Example
//!
//! ```no_run
//! use vigil_proto::ipsec::logging;
//!
//! tracing_subscriber::fmt()
//!     .with_env_filter("vigil_proto::ipsec=debug,vigil::audit=warn")
//!     .init();
//!
//! logging::log_ike_state_transition(0x0102030405060708, 0, "INITIATOR_INIT", "IKE_SA_INIT_REQUESTED");
//! ```

use std::net::SocketAddr;

use tracing::{debug, error, info, trace, warn};

use crate::ipsec::Error;

/// Target of the audit-level channel
pub const AUDIT_TARGET: &str = "vigil::audit";

fn spi_hex(spi: u64) -> String {
    hex::encode(spi.to_be_bytes())
}

/// Log IKE SA state transition
pub fn log_ike_state_transition(spi_i: u64, spi_r: u64, old_state: &str, new_state: &str) {
    info!(
        ike_spi_i = %spi_hex(spi_i),
        ike_spi_r = %spi_hex(spi_r),
        state_from = old_state,
        state_to = new_state,
        "IKE SA state transition"
    );
}

/// Log the controlled rollback after INVALID_KE_PAYLOAD
pub fn log_dh_group_retry(spi_i: u64, old_group: u16, new_group: u16) {
    info!(
        ike_spi_i = %spi_hex(spi_i),
        old_group = old_group,
        new_group = new_group,
        "Peer requested different DH group, retrying IKE_SA_INIT"
    );
}

/// Log IKE handshake start
pub fn log_handshake_start(peer: SocketAddr, role: &str) {
    info!(peer = %peer, role = role, "IKE handshake started");
}

/// Log IKE_SA establishment
pub fn log_ike_sa_established(spi_i: u64, spi_r: u64, peer: SocketAddr, peer_id: &str) {
    info!(
        ike_spi_i = %spi_hex(spi_i),
        ike_spi_r = %spi_hex(spi_r),
        peer = %peer,
        peer_id = peer_id,
        "IKE SA established"
    );
}

/// Log IKE SA creation in the manager
pub fn log_ike_sa_created(spi_i: u64, spi_r: u64, initiator: bool) {
    debug!(
        ike_spi_i = %spi_hex(spi_i),
        ike_spi_r = %spi_hex(spi_r),
        initiator = initiator,
        "IKE SA created"
    );
}

/// Log IKE SA destruction
pub fn log_ike_sa_destroyed(spi_i: u64, spi_r: u64) {
    info!(
        ike_spi_i = %spi_hex(spi_i),
        ike_spi_r = %spi_hex(spi_r),
        "IKE SA destroyed"
    );
}

/// Log IKE SA rekey completion
pub fn log_ike_rekey_complete(old_spi_i: u64, new_spi_i: u64, new_spi_r: u64) {
    info!(
        old_spi_i = %spi_hex(old_spi_i),
        new_spi_i = %spi_hex(new_spi_i),
        new_spi_r = %spi_hex(new_spi_r),
        "IKE SA rekey completed successfully"
    );
}

/// Log reauthentication outcome
pub fn log_reauth(old_spi_i: u64, new_spi_i: u64, migrated: usize, renegotiated: usize) {
    info!(
        old_spi_i = %spi_hex(old_spi_i),
        new_spi_i = %spi_hex(new_spi_i),
        migrated = migrated,
        renegotiated = renegotiated,
        "IKE SA reauthentication started on replacement SA"
    );
}

/// Log Child SA creation
pub fn log_child_sa_created(child_spi: u32, other_spi: u32, policy: &str) {
    info!(
        child_spi = %format!("{:08x}", child_spi),
        other_spi = %format!("{:08x}", other_spi),
        policy = policy,
        "Child SA created"
    );
}

/// Log Child SA rekey completion
pub fn log_child_rekey_complete(old_spi: u32, new_spi: u32) {
    info!(
        old_spi = %format!("{:08x}", old_spi),
        new_spi = %format!("{:08x}", new_spi),
        "Child SA rekey completed successfully"
    );
}

/// Log Child SA deletion
pub fn log_child_sa_deleted(child_spi: u32, reason: &str) {
    info!(
        child_spi = %format!("{:08x}", child_spi),
        reason = reason,
        "Child SA deleted"
    );
}

/// Log proposal negotiation result
pub fn log_proposal_negotiation(offered: usize, chosen: Option<u8>) {
    match chosen {
        Some(num) => debug!(offered = offered, chosen = num, "Proposal selected"),
        None => warn!(offered = offered, "No acceptable proposal"),
    }
}

/// Log a received notify
pub fn log_notify(notify_type: u16, protocol_id: u8, fatal: bool) {
    if fatal {
        warn!(notify_type = notify_type, protocol_id = protocol_id, "Error notify received");
    } else {
        debug!(notify_type = notify_type, protocol_id = protocol_id, "Notify received");
    }
}

/// Log a problem that leaves the IKE_SA untouched
pub fn log_ignored(error: &Error) {
    trace!(error = %error, "Ignoring");
}

/// Log request retransmission
pub fn log_retransmit(message_id: u32, attempt: u32, delay_ms: u128) {
    debug!(
        message_id = message_id,
        attempt = attempt,
        next_delay_ms = %delay_ms,
        "Retransmitting request"
    );
}

/// Log outgoing message
pub fn log_message_send(msg: &str, peer: SocketAddr, size_bytes: usize) {
    debug!(msg = msg, peer = %peer, size_bytes = size_bytes, "Sending IKE message");
}

/// Log incoming message
pub fn log_message_recv(msg: &str, peer: SocketAddr, size_bytes: usize) {
    debug!(msg = msg, peer = %peer, size_bytes = size_bytes, "Received IKE message");
}

/// Log a dropped message (local failure, SA survives)
pub fn log_message_rejected(spi_i: u64, reason: &str) {
    debug!(ike_spi_i = %spi_hex(spi_i), reason = reason, "Message rejected");
}

/// Audit: IKE_SA deleted after a fatal error
pub fn audit_ike_sa_failed(sa: &str, error: &str) {
    error!(target: AUDIT_TARGET, ike_sa = sa, error = error, "IKE SA failed");
}

/// Audit: authentication failure
pub fn audit_authentication_failed(sa: &str, peer_id: &str, reason: &str) {
    error!(
        target: AUDIT_TARGET,
        ike_sa = sa,
        peer_id = peer_id,
        reason = reason,
        "Authentication failed"
    );
}

/// Audit: non-fatal security-relevant event
pub fn audit_event(sa: &str, event: &str) {
    warn!(target: AUDIT_TARGET, ike_sa = sa, event = event, "IKE audit event");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spi_hex() {
        assert_eq!(spi_hex(0x0102030405060708), "0102030405060708");
        assert_eq!(spi_hex(0), "0000000000000000");
    }

    #[test]
    fn test_logging_functions() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .try_init();

        let peer: SocketAddr = "10.0.0.1:500".parse().unwrap();

        log_ike_state_transition(1, 2, "INITIATOR_INIT", "IKE_SA_INIT_REQUESTED");
        log_dh_group_retry(1, 14, 19);
        log_handshake_start(peer, "initiator");
        log_ike_sa_established(1, 2, peer, "vpn.example.com");
        log_ike_sa_created(1, 0, true);
        log_ike_sa_destroyed(1, 2);
        log_ike_rekey_complete(1, 3, 4);
        log_reauth(1, 5, 2, 1);

        log_child_sa_created(0xc0000001, 0xc0000002, "net");
        log_child_rekey_complete(0xc0000001, 0xc0000003);
        log_child_sa_deleted(0xc0000001, "rekeyed");

        log_proposal_negotiation(3, Some(1));
        log_proposal_negotiation(3, None);
        log_notify(14, 1, true);
        log_notify(16384, 0, false);
        log_ignored(&Error::IgnoredPayload(43));
        log_ignored(&Error::StatusNotify(40000));
        log_retransmit(1, 2, 7200);

        log_message_send("IKE_SA_INIT request 0", peer, 256);
        log_message_recv("IKE_SA_INIT response 0", peer, 256);
        log_message_rejected(1, "wrong exchange");

        audit_ike_sa_failed("0000000000000001*_0000000000000002", "no proposal chosen");
        audit_authentication_failed("sa", "client@example.com", "invalid PSK");
        audit_event("sa", "INVALID_KE_PAYLOAD");
    }
}
