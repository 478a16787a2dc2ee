//! CHILD_CREATE, CHILD_REKEY and CHILD_DELETE
//!
//! ```text
//! CREATE_CHILD_SA (new child)
//! HDR, SK {SA, Ni, TSi, TSr}  -->
//!                        <--  HDR, SK {SA, Nr, TSi, TSr}
//!
//! CREATE_CHILD_SA (rekey child)
//! HDR, SK {N(REKEY_SA), SA, Ni, TSi, TSr}  -->
//!                                     <--  HDR, SK {SA, Nr, TSi, TSr}
//!
//! INFORMATIONAL (delete children)
//! HDR, SK {D(ESP, SPIs)}  -->
//!                    <--  HDR, SK {D(ESP, SPIs)}
//! ```
//!
//! Failing to negotiate a child never takes the IKE_SA down: the tasks log
//! the failure and complete.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{Task, TaskStatus, TaskType};
use crate::ipsec::child_sa::{ChildSa, ChildSaState};
use crate::ipsec::config::Policy;
use crate::ipsec::ikev2::constants::NotifyType;
use crate::ipsec::ikev2::ike_sa::{Context, IkeSa};
use crate::ipsec::ikev2::message::{IkeSaId, Message};
use crate::ipsec::ikev2::payload::{
    DeletePayload, NoncePayload, NotifyPayload, Payload, SaPayload, TsPayload,
};
use crate::ipsec::ikev2::proposal::{select_response_proposal, Proposal, ProtocolId};
use crate::ipsec::{logging, Error, Result};

/// Negotiates one child SA over CREATE_CHILD_SA
pub struct ChildCreateTask {
    initiator: bool,
    config: Option<Arc<dyn Policy>>,
    rekey_spi: Option<u32>,
    child: Option<ChildSa>,
    my_nonce: Vec<u8>,
    other_nonce: Vec<u8>,
    offered: Vec<Proposal>,
    established_spi: Option<u32>,
}

impl ChildCreateTask {
    /// Create a child from `config`
    pub fn initiator(config: Arc<dyn Policy>) -> Self {
        ChildCreateTask {
            initiator: true,
            config: Some(config),
            rekey_spi: None,
            child: None,
            my_nonce: Vec::new(),
            other_nonce: Vec::new(),
            offered: Vec::new(),
            established_spi: None,
        }
    }

    /// Answer a peer's CREATE_CHILD_SA request
    pub fn responder() -> Self {
        ChildCreateTask {
            initiator: false,
            config: None,
            rekey_spi: None,
            child: None,
            my_nonce: Vec::new(),
            other_nonce: Vec::new(),
            offered: Vec::new(),
            established_spi: None,
        }
    }

    /// Mark the request as replacing the child with inbound SPI `spi`
    pub(crate) fn with_rekey_spi(mut self, spi: u32) -> Self {
        self.rekey_spi = Some(spi);
        self
    }

    /// Use `config` instead of the IKE_SA's policy (responder)
    pub(crate) fn set_config(&mut self, config: Arc<dyn Policy>) {
        self.config = Some(config);
    }

    /// Inbound SPI of the installed child, once the exchange succeeded
    pub fn established_spi(&self) -> Option<u32> {
        self.established_spi
    }

    fn build_request(&mut self, sa: &mut IkeSa, message: &mut Message) -> Result<()> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| Error::InvalidState("child task without config".into()))?;

        let mut proposals = config.proposals();
        let child = sa.services().child_factory.alloc(
            sa.my_host(),
            sa.other_host(),
            config,
            &mut proposals,
        )?;
        let nonce = NoncePayload::generate();

        if let Some(spi) = self.rekey_spi {
            message.add_payload(Payload::Notify(NotifyPayload::rekey_sa(child.protocol, spi)));
        }
        message.add_payload(Payload::Sa(SaPayload::new(proposals)));
        message.add_payload(Payload::Nonce(nonce.clone()));
        message.add_payload(Payload::TsI(TsPayload::new(child.my_ts.clone())));
        message.add_payload(Payload::TsR(TsPayload::new(child.other_ts.clone())));

        self.my_nonce = nonce.nonce;
        self.child = Some(child);
        Ok(())
    }

    fn process_response(&mut self, sa: &mut IkeSa, message: &Message) -> Result<u32> {
        let mut child = self
            .child
            .take()
            .ok_or_else(|| Error::InvalidState("no child negotiation in progress".into()))?;

        if let Some(notify) = message.notifies().find(|n| n.is_error()) {
            logging::log_notify(notify.notify_type, notify.protocol_id, true);
            return Err(Error::ErrorNotify(notify.notify_type));
        }

        let sa_payload = message.sa().ok_or(Error::MissingPayload("SA"))?;
        let nonce = message.nonce().ok_or(Error::MissingPayload("NONCE"))?;
        let proposal = select_response_proposal(&child.config.proposals(), sa_payload.proposals())?;
        let other_spi = proposal
            .child_spi()
            .ok_or_else(|| Error::ChildSaFailed("responder sent no child SPI".into()))?;
        child.set_negotiated(proposal, other_spi);

        if let Some(ts) = message.ts_i() {
            child.my_ts = ts.selectors.clone();
        }
        if let Some(ts) = message.ts_r() {
            child.other_ts = ts.selectors.clone();
        }

        self.other_nonce = nonce.nonce.clone();
        sa.install_child(child, &self.my_nonce, &self.other_nonce)
    }

    fn process_request(&mut self, message: &Message) -> Result<()> {
        let sa_payload = message.sa().ok_or(Error::MissingPayload("SA"))?;
        let nonce = message.nonce().ok_or(Error::MissingPayload("NONCE"))?;
        self.offered = sa_payload.proposals().to_vec();
        self.other_nonce = nonce.nonce.clone();
        Ok(())
    }

    fn build_response(&mut self, sa: &mut IkeSa, message: &mut Message) -> Result<u32> {
        if self.other_nonce.is_empty() {
            return Err(Error::MissingPayload("NONCE"));
        }
        let config = match self.config.clone() {
            Some(config) => config,
            None => sa.policy()?,
        };

        let selected = config.select_proposal(&self.offered)?;
        let other_spi = selected
            .child_spi()
            .ok_or_else(|| Error::ChildSaFailed("initiator sent no child SPI".into()))?;

        let mut bound = [selected];
        let mut child = sa.services().child_factory.alloc(
            sa.my_host(),
            sa.other_host(),
            config,
            &mut bound,
        )?;
        let [selected] = bound;
        child.set_negotiated(selected.clone(), other_spi);

        let nonce = NoncePayload::generate();
        let ts_i = TsPayload::new(child.other_ts.clone());
        let ts_r = TsPayload::new(child.my_ts.clone());
        let spi = sa.install_child(child, &self.other_nonce, &nonce.nonce)?;

        message.add_payload(Payload::Sa(SaPayload::new(vec![selected])));
        message.add_payload(Payload::Nonce(nonce.clone()));
        message.add_payload(Payload::TsI(ts_i));
        message.add_payload(Payload::TsR(ts_r));
        self.my_nonce = nonce.nonce;
        Ok(spi)
    }
}

impl Task for ChildCreateTask {
    fn task_type(&self) -> TaskType {
        TaskType::ChildCreate
    }

    fn build(&mut self, sa: &mut IkeSa, _ctx: &Context<'_>, message: &mut Message) -> TaskStatus {
        if self.initiator {
            match self.build_request(sa, message) {
                Ok(()) => TaskStatus::NeedMore,
                Err(e) => {
                    warn!(error = %e, "Unable to create CHILD_SA request");
                    TaskStatus::Success
                }
            }
        } else {
            match self.build_response(sa, message) {
                Ok(spi) => self.established_spi = Some(spi),
                Err(e) => {
                    warn!(error = %e, "CHILD_SA not created");
                    message.add_payload(Payload::Notify(NotifyPayload::new(
                        NotifyType::NoProposalChosen,
                        Vec::new(),
                    )));
                }
            }
            TaskStatus::Success
        }
    }

    fn process(&mut self, sa: &mut IkeSa, _ctx: &Context<'_>, message: &Message) -> TaskStatus {
        if self.initiator {
            match self.process_response(sa, message) {
                Ok(spi) => self.established_spi = Some(spi),
                Err(e) => warn!(error = %e, "CHILD_SA negotiation failed"),
            }
            TaskStatus::Success
        } else {
            if let Err(e) = self.process_request(message) {
                debug!(error = %e, "Malformed CREATE_CHILD_SA request");
            }
            TaskStatus::NeedMore
        }
    }

    fn migrate(&mut self, _new_owner: IkeSaId) {
        // the SPI was bound to the old SA's hosts; allocate again on rebuild
        self.child = None;
        self.my_nonce.clear();
        self.other_nonce.clear();
        self.established_spi = None;
    }
}

/// Replaces a child SA with a freshly keyed one
pub struct ChildRekeyTask {
    initiator: bool,
    spi: u32,
    create: Option<ChildCreateTask>,
    not_found: bool,
}

impl ChildRekeyTask {
    /// Rekey our child with inbound SPI `spi`
    pub fn initiator(spi: u32) -> Self {
        ChildRekeyTask {
            initiator: true,
            spi,
            create: None,
            not_found: false,
        }
    }

    /// Answer a peer's rekey request
    pub fn responder() -> Self {
        ChildRekeyTask {
            initiator: false,
            spi: 0,
            create: None,
            not_found: false,
        }
    }

    /// Inbound SPI of the replacement, once installed
    pub fn new_spi(&self) -> Option<u32> {
        self.create.as_ref().and_then(ChildCreateTask::established_spi)
    }
}

impl Task for ChildRekeyTask {
    fn task_type(&self) -> TaskType {
        TaskType::ChildRekey
    }

    fn build(&mut self, sa: &mut IkeSa, ctx: &Context<'_>, message: &mut Message) -> TaskStatus {
        if !self.initiator {
            if self.not_found {
                let mut notify = NotifyPayload::new(NotifyType::ChildSaNotFound, Vec::new());
                notify.protocol_id = ProtocolId::Esp.to_u8();
                message.add_payload(Payload::Notify(notify));
                return TaskStatus::Success;
            }
            return match self.create.as_mut() {
                Some(create) => create.build(sa, ctx, message),
                None => TaskStatus::Success,
            };
        }

        let Some(child) = sa.find_child_mut(self.spi) else {
            warn!(child_spi = %format!("{:08x}", self.spi), "Child SA to rekey not found");
            return TaskStatus::Success;
        };
        if let Err(e) = child.start_rekey() {
            warn!(error = %e, "Child SA not rekeyed");
            return TaskStatus::Success;
        }
        let config = Arc::clone(&child.config);

        let mut create = ChildCreateTask::initiator(config).with_rekey_spi(self.spi);
        let status = create.build(sa, ctx, message);
        self.create = Some(create);
        if status != TaskStatus::NeedMore {
            if let Some(child) = sa.find_child_mut(self.spi) {
                child.state = ChildSaState::Installed;
            }
        }
        status
    }

    fn process(&mut self, sa: &mut IkeSa, ctx: &Context<'_>, message: &Message) -> TaskStatus {
        if !self.initiator {
            let rekeyed = message
                .get_notify(NotifyType::RekeySa)
                .and_then(|n| <[u8; 4]>::try_from(n.spi.as_slice()).ok())
                .map(u32::from_be_bytes);
            let Some(peer_spi) = rekeyed else {
                self.not_found = true;
                return TaskStatus::NeedMore;
            };
            let Some(child) = sa.find_child_by_other_spi_mut(peer_spi) else {
                self.not_found = true;
                return TaskStatus::NeedMore;
            };
            child.state = ChildSaState::Rekeying;
            self.spi = child.my_spi;

            let mut create = ChildCreateTask::responder();
            create.set_config(Arc::clone(&child.config));
            let status = create.process(sa, ctx, message);
            self.create = Some(create);
            return status;
        }

        let Some(create) = self.create.as_mut() else {
            return TaskStatus::Success;
        };
        create.process(sa, ctx, message);

        match create.established_spi() {
            Some(new_spi) => {
                logging::log_child_rekey_complete(self.spi, new_spi);
                sa.queue_task(Box::new(ChildDeleteTask::initiator(vec![self.spi])));
            }
            None => {
                if let Some(child) = sa.find_child_mut(self.spi) {
                    child.state = ChildSaState::Installed;
                }
            }
        }
        TaskStatus::Success
    }

    fn migrate(&mut self, new_owner: IkeSaId) {
        if let Some(create) = self.create.as_mut() {
            create.migrate(new_owner);
        }
    }
}

/// Deletes child SAs with an INFORMATIONAL exchange
#[derive(Debug)]
pub struct ChildDeleteTask {
    initiator: bool,
    spis: Vec<u32>,
}

impl ChildDeleteTask {
    /// Delete our children with these inbound SPIs
    pub fn initiator(spis: Vec<u32>) -> Self {
        ChildDeleteTask {
            initiator: true,
            spis,
        }
    }

    /// Answer a peer's delete
    pub fn responder() -> Self {
        ChildDeleteTask {
            initiator: false,
            spis: Vec::new(),
        }
    }

    /// Our inbound SPIs being deleted
    pub fn spis(&self) -> &[u32] {
        &self.spis
    }
}

impl Task for ChildDeleteTask {
    fn task_type(&self) -> TaskType {
        TaskType::ChildDelete
    }

    fn build(&mut self, sa: &mut IkeSa, _ctx: &Context<'_>, message: &mut Message) -> TaskStatus {
        if self.initiator {
            let mut deleting = Vec::new();
            for spi in &self.spis {
                if let Some(child) = sa.find_child_mut(*spi) {
                    child.start_delete();
                    deleting.push(*spi);
                }
            }
            if deleting.is_empty() {
                return TaskStatus::Success;
            }
            message.add_payload(Payload::Delete(DeletePayload::child(
                ProtocolId::Esp,
                deleting.clone(),
            )));
            self.spis = deleting;
            TaskStatus::NeedMore
        } else {
            if !self.spis.is_empty() {
                message.add_payload(Payload::Delete(DeletePayload::child(
                    ProtocolId::Esp,
                    self.spis.clone(),
                )));
            }
            for spi in &self.spis {
                sa.delete_child_sa(*spi, "deleted by peer");
            }
            TaskStatus::Success
        }
    }

    fn process(&mut self, sa: &mut IkeSa, _ctx: &Context<'_>, message: &Message) -> TaskStatus {
        if self.initiator {
            for spi in &self.spis {
                sa.delete_child_sa(*spi, "deleted");
            }
            return TaskStatus::Success;
        }

        for delete in message.deletes() {
            if delete.protocol_id == ProtocolId::Ike {
                continue;
            }
            for peer_spi in &delete.spis {
                match sa.find_child_by_other_spi_mut(*peer_spi) {
                    Some(child) => {
                        child.start_delete();
                        self.spis.push(child.my_spi);
                    }
                    None => debug!(
                        child_spi = %format!("{:08x}", peer_spi),
                        "Peer deleted unknown child SA"
                    ),
                }
            }
        }
        TaskStatus::NeedMore
    }

    fn migrate(&mut self, _new_owner: IkeSaId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_roles() {
        let responder = ChildCreateTask::responder();
        assert!(!responder.initiator);
        assert!(responder.config.is_none());
        assert!(responder.established_spi().is_none());
    }

    #[test]
    fn test_rekey_without_create_has_no_new_spi() {
        let task = ChildRekeyTask::initiator(0xc0000001);
        assert_eq!(task.new_spi(), None);
        assert_eq!(task.task_type(), TaskType::ChildRekey);
    }

    #[test]
    fn test_delete_task_spis() {
        let task = ChildDeleteTask::initiator(vec![1, 2]);
        assert_eq!(task.spis(), &[1, 2]);
        assert_eq!(
            task.task_type().exchange_type(),
            crate::ipsec::ikev2::constants::ExchangeType::Informational
        );
    }
}
