//! IKE_REAUTH: delete the IKE_SA, then build it again from scratch
//!
//! Reauthentication runs the delete exchange of [`IkeDeleteTask`]. Once the
//! peer confirmed, a fresh IKE_SA is started with the same connection and
//! policy. Routed children move to it unchanged; installed children are
//! negotiated again on it, the first one within IKE_AUTH. Queued tasks are
//! migrated to the new SA.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{IkeDeleteTask, Task, TaskStatus, TaskType};
use crate::ipsec::child_sa::{ChildSa, ChildSaState};
use crate::ipsec::config::Policy;
use crate::ipsec::ikev2::ike_sa::{Context, IkeSa};
use crate::ipsec::ikev2::message::{IkeSaId, Message};
use crate::ipsec::{logging, Error, Result};

/// Replaces the IKE_SA by a freshly authenticated one
#[derive(Debug)]
pub struct IkeReauthTask {
    delete: IkeDeleteTask,
}

impl IkeReauthTask {
    /// Reauthenticate the SA `owner`
    pub fn new(owner: IkeSaId) -> Self {
        IkeReauthTask {
            delete: IkeDeleteTask::initiator(owner),
        }
    }

    /// Start the replacement SA; returns its ID
    fn reauthenticate(sa: &mut IkeSa, ctx: &Context<'_>) -> Result<IkeSaId> {
        let connection = sa.connection()?;
        if sa.child_count() == 0 && !connection.is_mediation() {
            return Err(Error::ReauthFailed(format!(
                "IKE_SA {} has no children to carry over",
                sa.id()
            )));
        }

        let mut new_sa = ctx.manager.checkout_new(sa.version(), true);
        new_sa.set_connection(connection.clone());
        if let Ok(policy) = sa.policy() {
            new_sa.set_policy(policy);
        }
        new_sa.set_my_host(sa.my_host());
        new_sa.set_other_host(sa.other_host());
        new_sa.set_virtual_ip(sa.virtual_ip());
        let new_id = new_sa.id();
        let old_bus_sa = ctx.bus.set_sa(Some(new_id));
        new_sa.tasks_mut().adopt_tasks(sa.tasks_mut(), new_id);

        let result = if connection.is_mediation() {
            new_sa.initiate(ctx, None).map(|()| (0, 0))
        } else {
            Self::move_children(sa, &mut new_sa, ctx)
        };

        match result {
            Ok((migrated, renegotiated)) => {
                sa.services().metrics.record_ike_sa_reauthenticated();
                logging::log_reauth(sa.id().initiator_spi, new_id.initiator_spi, migrated, renegotiated);
                ctx.manager.checkin(new_sa);
                ctx.bus.set_sa(old_bus_sa);
                Ok(new_id)
            }
            Err(e) => {
                ctx.manager.checkin_and_destroy(new_sa);
                ctx.bus.set_sa(old_bus_sa);
                Err(Error::ReauthFailed(e.to_string()))
            }
        }
    }

    /// Hand routed children over and negotiate installed ones again
    fn move_children(
        sa: &mut IkeSa,
        new_sa: &mut IkeSa,
        ctx: &Context<'_>,
    ) -> Result<(usize, usize)> {
        let (routed, installed): (Vec<ChildSa>, Vec<ChildSa>) = sa
            .take_child_sas()
            .into_iter()
            .partition(|c| c.state == ChildSaState::Routed);

        let migrated = routed.len();
        for child in routed {
            new_sa.add_child_sa(child);
        }

        let configs: Vec<Arc<dyn Policy>> =
            installed.iter().map(|c| Arc::clone(&c.config)).collect();
        for child in installed {
            sa.add_child_sa(child);
        }

        for config in &configs {
            new_sa.initiate(ctx, Some(Arc::clone(config)))?;
        }
        Ok((migrated, configs.len()))
    }
}

impl Task for IkeReauthTask {
    fn task_type(&self) -> TaskType {
        TaskType::IkeReauth
    }

    fn build(&mut self, sa: &mut IkeSa, ctx: &Context<'_>, message: &mut Message) -> TaskStatus {
        info!(ike_sa = %sa.id(), "Reauthenticating IKE_SA");
        self.delete.build(sa, ctx, message)
    }

    fn process(&mut self, sa: &mut IkeSa, ctx: &Context<'_>, message: &Message) -> TaskStatus {
        match self.delete.process(sa, ctx, message) {
            TaskStatus::Failed(e) => {
                warn!(ike_sa = %sa.id(), error = %e, "Peer did not confirm IKE_SA delete")
            }
            status => debug!(ike_sa = %sa.id(), ?status, "IKE_SA delete confirmed"),
        }
        match Self::reauthenticate(sa, ctx) {
            Ok(_) => TaskStatus::DestroyMe,
            Err(e) => {
                warn!(error = %e, "Reauthentication failed");
                TaskStatus::Failed(e)
            }
        }
    }

    fn migrate(&mut self, new_owner: IkeSaId) {
        self.delete.migrate(new_owner);
    }
}
