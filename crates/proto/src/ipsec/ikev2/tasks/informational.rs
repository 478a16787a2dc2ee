//! INFORMATIONAL exchanges carrying notifies, or nothing at all
//!
//! An empty INFORMATIONAL request is a liveness check; the peer answers it
//! with an empty response.

use tracing::{debug, info};

use super::{Task, TaskStatus, TaskType};
use crate::ipsec::ikev2::ike_sa::{Context, IkeSa};
use crate::ipsec::ikev2::message::{IkeSaId, Message};
use crate::ipsec::ikev2::payload::{NotifyPayload, Payload};
use crate::ipsec::logging;

/// Sends or acknowledges notifies
#[derive(Debug)]
pub struct InformationalTask {
    initiator: bool,
    notifies: Vec<NotifyPayload>,
}

impl InformationalTask {
    /// Send `notifies`; an empty list checks liveness
    pub fn initiator(notifies: Vec<NotifyPayload>) -> Self {
        InformationalTask {
            initiator: true,
            notifies,
        }
    }

    /// Answer a peer's INFORMATIONAL request
    pub fn responder() -> Self {
        InformationalTask {
            initiator: false,
            notifies: Vec::new(),
        }
    }
}

impl Task for InformationalTask {
    fn task_type(&self) -> TaskType {
        TaskType::Informational
    }

    fn build(&mut self, sa: &mut IkeSa, _ctx: &Context<'_>, message: &mut Message) -> TaskStatus {
        if !self.initiator {
            return TaskStatus::Success;
        }
        if self.notifies.is_empty() {
            debug!(ike_sa = %sa.id(), "Sending liveness check");
        }
        for notify in &self.notifies {
            message.add_payload(Payload::Notify(notify.clone()));
        }
        TaskStatus::NeedMore
    }

    fn process(&mut self, sa: &mut IkeSa, _ctx: &Context<'_>, message: &Message) -> TaskStatus {
        for notify in message.notifies() {
            logging::log_notify(notify.notify_type, notify.protocol_id, notify.is_error());
        }
        if self.initiator {
            debug!(ike_sa = %sa.id(), "INFORMATIONAL exchange completed");
            TaskStatus::Success
        } else {
            if message.is_empty() {
                info!(ike_sa = %sa.id(), "Answering liveness check");
            }
            TaskStatus::NeedMore
        }
    }

    fn migrate(&mut self, _new_owner: IkeSaId) {}
}
