//! ESTABLISHED: every further exchange is driven by tasks

use super::StateOutcome;
use crate::ipsec::ikev2::ike_sa::{Context, IkeSa};
use crate::ipsec::ikev2::message::Message;
use crate::ipsec::ikev2::task_manager::TaskManager;

/// Steady state of a fully authenticated IKE_SA
#[derive(Debug)]
pub struct Established;

/// Hand CREATE_CHILD_SA and INFORMATIONAL traffic to the task manager
pub(crate) fn process(sa: &mut IkeSa, ctx: &Context<'_>, message: Message) -> StateOutcome {
    TaskManager::process_message(sa, ctx, message)
}
