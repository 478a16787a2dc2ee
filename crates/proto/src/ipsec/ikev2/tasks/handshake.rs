//! Task handles on the IKE_SA_INIT / IKE_AUTH state machine
//!
//! The handshake itself is driven by the SA's state handlers; these tasks
//! only start it and tell it which child to negotiate. They stay active
//! until the state machine moves past their exchange.

use std::sync::Arc;

use tracing::debug;

use super::{Task, TaskStatus, TaskType};
use crate::ipsec::config::Policy;
use crate::ipsec::ikev2::ike_sa::{Context, IkeSa};
use crate::ipsec::ikev2::message::{IkeSaId, Message};

/// Starts IKE_SA_INIT
#[derive(Debug)]
pub struct IkeInitTask {
    owner: IkeSaId,
}

impl IkeInitTask {
    /// Create task for the SA `owner`
    pub fn new(owner: IkeSaId) -> Self {
        IkeInitTask { owner }
    }
}

impl Task for IkeInitTask {
    fn task_type(&self) -> TaskType {
        TaskType::IkeInit
    }

    fn build(&mut self, sa: &mut IkeSa, _ctx: &Context<'_>, _message: &mut Message) -> TaskStatus {
        debug!(ike_sa = %self.owner, "Starting IKE_SA_INIT");
        match sa.start_handshake(None) {
            Ok(()) => TaskStatus::NeedMore,
            Err(e) => TaskStatus::Failed(e),
        }
    }

    fn process(&mut self, _sa: &mut IkeSa, _ctx: &Context<'_>, _message: &Message) -> TaskStatus {
        TaskStatus::NeedMore
    }

    fn migrate(&mut self, new_owner: IkeSaId) {
        self.owner = new_owner;
    }
}

/// Names the child negotiated within IKE_AUTH
pub struct IkeAuthTask {
    child: Option<Arc<dyn Policy>>,
}

impl IkeAuthTask {
    /// Create task; `None` authenticates without a child (mediation)
    pub fn new(child: Option<Arc<dyn Policy>>) -> Self {
        IkeAuthTask { child }
    }
}

impl Task for IkeAuthTask {
    fn task_type(&self) -> TaskType {
        TaskType::IkeAuth
    }

    fn build(&mut self, sa: &mut IkeSa, _ctx: &Context<'_>, _message: &mut Message) -> TaskStatus {
        sa.set_auth_child(self.child.clone());
        TaskStatus::NeedMore
    }

    fn process(&mut self, _sa: &mut IkeSa, _ctx: &Context<'_>, _message: &Message) -> TaskStatus {
        TaskStatus::NeedMore
    }

    fn migrate(&mut self, _new_owner: IkeSaId) {}
}
