//! IKE_DELETE: INFORMATIONAL with a Delete payload for the IKE_SA
//!
//! ```text
//! HDR, SK {D}  -->
//!         <--  HDR, SK {}
//! ```

use tracing::info;

use super::{Task, TaskStatus, TaskType};
use crate::ipsec::ikev2::ike_sa::{Context, IkeSa};
use crate::ipsec::ikev2::message::{IkeSaId, Message};
use crate::ipsec::ikev2::payload::{DeletePayload, Payload};
use crate::ipsec::{logging, Error};

/// Deletes the IKE_SA together with all of its children
#[derive(Debug)]
pub struct IkeDeleteTask {
    owner: IkeSaId,
    initiator: bool,
}

impl IkeDeleteTask {
    /// Delete the SA `owner`
    pub fn initiator(owner: IkeSaId) -> Self {
        IkeDeleteTask {
            owner,
            initiator: true,
        }
    }

    /// Answer the peer's delete of `owner`
    pub fn responder(owner: IkeSaId) -> Self {
        IkeDeleteTask {
            owner,
            initiator: false,
        }
    }

    /// SA being deleted
    pub fn owner(&self) -> IkeSaId {
        self.owner
    }
}

impl Task for IkeDeleteTask {
    fn task_type(&self) -> TaskType {
        TaskType::IkeDelete
    }

    fn build(&mut self, _sa: &mut IkeSa, _ctx: &Context<'_>, message: &mut Message) -> TaskStatus {
        if self.initiator {
            info!(ike_sa = %self.owner, "Deleting IKE_SA");
            message.add_payload(Payload::Delete(DeletePayload::ike()));
            TaskStatus::NeedMore
        } else {
            TaskStatus::DestroyMe
        }
    }

    fn process(&mut self, _sa: &mut IkeSa, _ctx: &Context<'_>, message: &Message) -> TaskStatus {
        if self.initiator {
            if let Some(notify) = message.notifies().find(|n| n.is_error()) {
                logging::log_notify(notify.notify_type, notify.protocol_id, true);
                return TaskStatus::Failed(Error::ErrorNotify(notify.notify_type));
            }
            TaskStatus::DestroyMe
        } else {
            info!(ike_sa = %self.owner, "IKE_SA deleted by peer");
            TaskStatus::NeedMore
        }
    }

    fn migrate(&mut self, new_owner: IkeSaId) {
        self.owner = new_owner;
    }
}
