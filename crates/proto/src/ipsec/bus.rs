//! Per-worker event bus
//!
//! A [`Bus`] belongs to one worker thread. It remembers which IKE_SA the
//! worker is currently acting for, so audit events can be attributed to it
//! without threading the SA through every call. It is deliberately `!Sync`:
//! each worker owns its own.

use std::cell::Cell;

use super::ikev2::message::IkeSaId;
use super::logging;
use super::Error;

/// Per-worker handle tracking the active IKE_SA
#[derive(Debug, Default)]
pub struct Bus {
    current: Cell<Option<IkeSaId>>,
}

impl Bus {
    /// Create a bus with no active SA
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the active IKE_SA, returning the previous one
    pub fn set_sa(&self, sa: Option<IkeSaId>) -> Option<IkeSaId> {
        self.current.replace(sa)
    }

    /// Currently active IKE_SA
    pub fn current_sa(&self) -> Option<IkeSaId> {
        self.current.get()
    }

    fn sa_label(&self) -> String {
        self.current
            .get()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string())
    }

    /// Report an error that deletes the active IKE_SA
    pub fn sa_failed(&self, error: &Error) {
        match error {
            Error::AuthenticationFailed(reason) => {
                logging::audit_authentication_failed(&self.sa_label(), "-", reason)
            }
            other => logging::audit_ike_sa_failed(&self.sa_label(), &other.to_string()),
        }
    }

    /// Report a security-relevant event for the active IKE_SA
    pub fn audit(&self, event: &str) {
        logging::audit_event(&self.sa_label(), event);
    }
}
