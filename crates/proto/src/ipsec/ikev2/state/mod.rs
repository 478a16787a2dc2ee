//! IKE_SA state machine
//!
//! Each state is one variant of [`SaState`] and owns exactly the material
//! the next step needs (DH object, nonces, raw IKE_SA_INIT bytes, child SA).
//! A transition moves that material into the next variant; whatever the old
//! variant does not hand over is dropped with it.
//!
//! # State Transitions
//!
//! ```text
//! Initiator                              Responder
//!
//! INITIATOR_INIT ◄──────┐
//!   ↓ (send IKE_SA_INIT) │ INVALID_KE_PAYLOAD
//! IKE_SA_INIT_REQUESTED ─┘                (recv IKE_SA_INIT)
//!   ↓ (send IKE_AUTH)                    IKE_SA_INIT_RESPONDED
//! IKE_AUTH_REQUESTED                       ↓ (recv IKE_AUTH)
//!   ↓ (recv IKE_AUTH)                    IKE_AUTH_RESPONDED
//! ESTABLISHED                              ↓ (first new request)
//!                                        ESTABLISHED
//! ```
//!
//! The INVALID_KE_PAYLOAD rollback is the only backward edge.

pub mod established;
pub mod initiator;
pub mod responder;

use std::fmt;

use self::established::Established;
use self::initiator::{IkeAuthRequested, IkeSaInitRequested, InitiatorInit};
use self::responder::{IkeAuthResponded, IkeSaInitResponded};
use crate::ipsec::Error;

/// Name of an IKE_SA state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaStateKind {
    /// Pre-exchange, DH group chosen
    InitiatorInit,
    /// Initiator awaiting the IKE_SA_INIT response
    IkeSaInitRequested,
    /// Responder awaiting IKE_AUTH
    IkeSaInitResponded,
    /// Initiator awaiting the IKE_AUTH response
    IkeAuthRequested,
    /// Responder answered IKE_AUTH
    IkeAuthResponded,
    /// Steady state
    Established,
}

impl SaStateKind {
    /// Upper-case state name as used in logs
    pub fn name(self) -> &'static str {
        match self {
            SaStateKind::InitiatorInit => "INITIATOR_INIT",
            SaStateKind::IkeSaInitRequested => "IKE_SA_INIT_REQUESTED",
            SaStateKind::IkeSaInitResponded => "IKE_SA_INIT_RESPONDED",
            SaStateKind::IkeAuthRequested => "IKE_AUTH_REQUESTED",
            SaStateKind::IkeAuthResponded => "IKE_AUTH_RESPONDED",
            SaStateKind::Established => "ESTABLISHED",
        }
    }

    /// Check if state is a valid next state
    pub fn can_transition_to(self, next: SaStateKind) -> bool {
        use SaStateKind::*;

        match (self, next) {
            (InitiatorInit, IkeSaInitRequested) => true,
            (IkeSaInitRequested, IkeAuthRequested) => true,
            (IkeAuthRequested, Established) => true,

            (IkeSaInitResponded, IkeAuthResponded) => true,
            (IkeAuthResponded, Established) => true,

            // INVALID_KE_PAYLOAD
            (IkeSaInitRequested, InitiatorInit) => true,

            (s1, s2) if s1 == s2 => true,
            _ => false,
        }
    }
}

impl fmt::Display for SaStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Active state handler of an IKE_SA
pub enum SaState {
    /// See [`InitiatorInit`]
    InitiatorInit(InitiatorInit),
    /// See [`IkeSaInitRequested`]
    IkeSaInitRequested(IkeSaInitRequested),
    /// See [`IkeSaInitResponded`]
    IkeSaInitResponded(IkeSaInitResponded),
    /// See [`IkeAuthRequested`]
    IkeAuthRequested(IkeAuthRequested),
    /// See [`IkeAuthResponded`]
    IkeAuthResponded(IkeAuthResponded),
    /// See [`Established`]
    Established(Established),
}

impl SaState {
    /// Name of this state
    pub fn kind(&self) -> SaStateKind {
        match self {
            SaState::InitiatorInit(_) => SaStateKind::InitiatorInit,
            SaState::IkeSaInitRequested(_) => SaStateKind::IkeSaInitRequested,
            SaState::IkeSaInitResponded(_) => SaStateKind::IkeSaInitResponded,
            SaState::IkeAuthRequested(_) => SaStateKind::IkeAuthRequested,
            SaState::IkeAuthResponded(_) => SaStateKind::IkeAuthResponded,
            SaState::Established(_) => SaStateKind::Established,
        }
    }
}

impl fmt::Debug for SaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SaState").field(&self.kind()).finish()
    }
}

/// Result of feeding one message to an IKE_SA
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateOutcome {
    /// Handled, state unchanged
    Continue,
    /// Handled, the SA entered the given state
    Transition(SaStateKind),
    /// Message dropped, the SA survives
    Fail(Error),
    /// The SA must be deleted
    DeleteSa(Error),
    /// The SA finished its job (e.g. a completed delete) and must be destroyed
    Destroy,
}

impl StateOutcome {
    /// Whether the caller must check the SA in for destruction
    pub fn is_terminal(&self) -> bool {
        matches!(self, StateOutcome::DeleteSa(_) | StateOutcome::Destroy)
    }
}

/// What a state handler wants done with the SA
pub(crate) enum Transition {
    /// Keep this state
    Stay(SaState),
    /// Install the next state
    Next(SaState),
    /// Went back through INITIATOR_INIT and re-sent IKE_SA_INIT
    Rollback(SaState),
    /// Drop the message, keep the given state
    Reject(SaState, Error),
    /// Mark the SA for deletion
    Delete(Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiator_path() {
        use SaStateKind::*;

        assert!(InitiatorInit.can_transition_to(IkeSaInitRequested));
        assert!(IkeSaInitRequested.can_transition_to(IkeAuthRequested));
        assert!(IkeAuthRequested.can_transition_to(Established));
        assert!(!InitiatorInit.can_transition_to(Established));
    }

    #[test]
    fn test_responder_path() {
        use SaStateKind::*;

        assert!(IkeSaInitResponded.can_transition_to(IkeAuthResponded));
        assert!(IkeAuthResponded.can_transition_to(Established));
        assert!(!IkeSaInitResponded.can_transition_to(IkeAuthRequested));
    }

    #[test]
    fn test_only_backward_edge_is_rollback() {
        use SaStateKind::*;

        assert!(IkeSaInitRequested.can_transition_to(InitiatorInit));
        assert!(!IkeAuthRequested.can_transition_to(InitiatorInit));
        assert!(!Established.can_transition_to(IkeAuthRequested));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SaStateKind::IkeSaInitRequested.to_string(), "IKE_SA_INIT_REQUESTED");
        assert_eq!(SaStateKind::Established.name(), "ESTABLISHED");
    }

    #[test]
    fn test_terminal_outcomes() {
        assert!(StateOutcome::Destroy.is_terminal());
        assert!(StateOutcome::DeleteSa(Error::NoProposalChosen).is_terminal());
        assert!(!StateOutcome::Fail(Error::ZeroSpi).is_terminal());
        assert!(!StateOutcome::Transition(SaStateKind::Established).is_terminal());
    }
}
