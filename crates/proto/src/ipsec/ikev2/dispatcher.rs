//! Dispatcher: entry points of the negotiation core
//!
//! Every inbound message and every local request runs through one cycle:
//!
//! ```text
//! checkout SA -> bus.set_sa -> process / queue tasks -> checkin | checkin_and_destroy
//! ```
//!
//! The dispatcher is shared by all workers; each worker brings its own
//! [`Bus`].

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::constants::IKE_MAJOR_VERSION;
use super::ike_sa::{Context, IkeSa};
use super::manager::IkeSaManager;
use super::message::{IkeSaId, Message};
use super::payload::NotifyPayload;
use super::state::StateOutcome;
use super::task_manager::TaskManager;
use super::tasks::{
    ChildDeleteTask, ChildRekeyTask, IkeDeleteTask, IkeReauthTask, IkeRekeyTask,
    InformationalTask,
};
use crate::ipsec::bus::Bus;
use crate::ipsec::config::{Connection, Policy};
use crate::ipsec::{Error, Result};

/// Routes messages and local requests to IKE_SAs
pub struct Dispatcher {
    manager: Arc<IkeSaManager>,
}

impl Dispatcher {
    /// Create a dispatcher over `manager`
    pub fn new(manager: Arc<IkeSaManager>) -> Self {
        Dispatcher { manager }
    }

    /// Registry used by this dispatcher
    pub fn manager(&self) -> &Arc<IkeSaManager> {
        &self.manager
    }

    /// Process one inbound message
    ///
    /// A new IKE_SA_INIT request creates a responder SA. The SA is destroyed
    /// when the outcome is terminal or when it never got past its first
    /// message.
    pub fn dispatch(&self, bus: &Bus, message: Message) -> StateOutcome {
        let Some((mut sa, created)) = self.manager.checkout_by_message(&message) else {
            return StateOutcome::Fail(Error::SaNotFound(message.ike_sa_id.to_string()));
        };
        if created {
            debug!(ike_sa = %sa.id(), peer = %message.source, "Created responder IKE_SA");
        }

        let previous = bus.set_sa(Some(sa.id()));
        let ctx = Context::new(&self.manager, bus);
        let outcome = sa.process_message(&ctx, message);

        if outcome.is_terminal() || sa.state_kind().is_none() {
            self.manager.checkin_and_destroy(sa);
        } else {
            self.manager.checkin(sa);
        }
        bus.set_sa(previous);
        outcome
    }

    /// Start a new IKE_SA for `connection`
    ///
    /// `policy` supplies the identities and, unless the connection is a
    /// mediation connection, the child negotiated within IKE_AUTH.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake could not be started; the SA has
    /// been destroyed then
    pub fn initiate(
        &self,
        bus: &Bus,
        connection: Arc<dyn Connection>,
        policy: Arc<dyn Policy>,
    ) -> Result<IkeSaId> {
        let mut sa = self.manager.checkout_new(IKE_MAJOR_VERSION, true);
        let child = if connection.is_mediation() {
            None
        } else {
            Some(Arc::clone(&policy))
        };
        sa.set_connection(connection);
        sa.set_policy(policy);

        let previous = bus.set_sa(Some(sa.id()));
        let ctx = Context::new(&self.manager, bus);
        let result = sa.initiate(&ctx, child);
        let id = sa.id();
        match result {
            Ok(()) => self.manager.checkin(sa),
            Err(ref e) => {
                bus.sa_failed(e);
                self.manager.checkin_and_destroy(sa);
            }
        }
        bus.set_sa(previous);
        result.map(|()| id)
    }

    /// Run `f` on a checked-out SA; fatal errors destroy it
    fn with_sa<T>(
        &self,
        bus: &Bus,
        id: &IkeSaId,
        f: impl FnOnce(&mut IkeSa, &Context<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut sa = self
            .manager
            .checkout(id)
            .ok_or_else(|| Error::SaNotFound(id.to_string()))?;
        let previous = bus.set_sa(Some(sa.id()));
        let ctx = Context::new(&self.manager, bus);

        let result = f(&mut sa, &ctx);
        match &result {
            Err(e) if e.is_fatal() => {
                bus.sa_failed(e);
                self.manager.checkin_and_destroy(sa);
            }
            _ => self.manager.checkin(sa),
        }
        bus.set_sa(previous);
        result
    }

    /// Negotiate an additional child SA
    ///
    /// # Errors
    ///
    /// Returns an error if the SA does not exist or the request failed
    pub fn create_child(&self, bus: &Bus, id: &IkeSaId, policy: Arc<dyn Policy>) -> Result<()> {
        self.with_sa(bus, id, |sa, ctx| sa.initiate(ctx, Some(policy)))
    }

    /// Replace the IKE_SA by a freshly authenticated one
    ///
    /// # Errors
    ///
    /// Returns an error if the SA does not exist or the request failed
    pub fn reauthenticate(&self, bus: &Bus, id: &IkeSaId) -> Result<()> {
        self.with_sa(bus, id, |sa, ctx| {
            sa.queue_task(Box::new(IkeReauthTask::new(sa.id())));
            sa.run_tasks(ctx)
        })
    }

    /// Rekey the IKE_SA
    ///
    /// # Errors
    ///
    /// Returns an error if the SA does not exist or the request failed
    pub fn rekey_ike(&self, bus: &Bus, id: &IkeSaId) -> Result<()> {
        self.with_sa(bus, id, |sa, ctx| {
            sa.queue_task(Box::new(IkeRekeyTask::initiator()));
            sa.run_tasks(ctx)
        })
    }

    /// Rekey the child with inbound SPI `spi`
    ///
    /// # Errors
    ///
    /// Returns an error if the SA does not exist or the request failed
    pub fn rekey_child(&self, bus: &Bus, id: &IkeSaId, spi: u32) -> Result<()> {
        self.with_sa(bus, id, |sa, ctx| {
            sa.queue_task(Box::new(ChildRekeyTask::initiator(spi)));
            sa.run_tasks(ctx)
        })
    }

    /// Delete the child with inbound SPI `spi`
    ///
    /// # Errors
    ///
    /// Returns an error if the SA does not exist or the request failed
    pub fn delete_child(&self, bus: &Bus, id: &IkeSaId, spi: u32) -> Result<()> {
        self.with_sa(bus, id, |sa, ctx| {
            sa.queue_task(Box::new(ChildDeleteTask::initiator(vec![spi])));
            sa.run_tasks(ctx)
        })
    }

    /// Delete the IKE_SA and its children
    ///
    /// The SA is destroyed once the peer confirmed.
    ///
    /// # Errors
    ///
    /// Returns an error if the SA does not exist or the request failed
    pub fn delete_ike(&self, bus: &Bus, id: &IkeSaId) -> Result<()> {
        self.with_sa(bus, id, |sa, ctx| {
            sa.queue_task(Box::new(IkeDeleteTask::initiator(sa.id())));
            sa.run_tasks(ctx)
        })
    }

    /// Send notifies, or an empty liveness check
    ///
    /// # Errors
    ///
    /// Returns an error if the SA does not exist or the request failed
    pub fn informational(&self, bus: &Bus, id: &IkeSaId, notifies: Vec<NotifyPayload>) -> Result<()> {
        self.with_sa(bus, id, |sa, ctx| {
            sa.queue_task(Box::new(InformationalTask::initiator(notifies)));
            sa.run_tasks(ctx)
        })
    }

    /// Timer path: resend request `message_id` if still unanswered
    ///
    /// Returns the delay until the next attempt, `None` if the request was
    /// answered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RetransmitTimeout`] when the tries are exhausted; the
    /// SA has been destroyed then
    pub fn retransmit(&self, bus: &Bus, id: &IkeSaId, message_id: u32) -> Result<Option<Duration>> {
        self.with_sa(bus, id, |sa, _ctx| TaskManager::retransmit(sa, message_id))
    }
}
