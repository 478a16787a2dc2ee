//! IKE_REKEY: replace the IKE_SA keys with CREATE_CHILD_SA
//!
//! ```text
//! HDR, SK {SA, Ni, KEi}  -->
//!                   <--  HDR, SK {SA, Nr, KEr}
//! ```
//!
//! The SA payload carries the new IKE SPIs. On success a new IKE_SA takes
//! over the children and queued tasks of the old one, which is then deleted
//! by the initiator of the rekey.

use tracing::{debug, warn};
use vigil_platform::DiffieHellman;

use super::{IkeDeleteTask, Task, TaskStatus, TaskType};
use crate::ipsec::crypto::{KeyMaterial, KeySizes};
use crate::ipsec::ikev2::constants::NotifyType;
use crate::ipsec::ikev2::ike_sa::{Context, IkeSa};
use crate::ipsec::ikev2::manager::IkeSaManager;
use crate::ipsec::ikev2::message::{IkeSaId, Message};
use crate::ipsec::ikev2::payload::{KePayload, NoncePayload, NotifyPayload, Payload, SaPayload};
use crate::ipsec::ikev2::proposal::{select_response_proposal, Proposal};
use crate::ipsec::{logging, Error, Result};

/// Rekeys the IKE_SA it runs on
pub struct IkeRekeyTask {
    initiator: bool,
    dh: Option<Box<dyn DiffieHellman>>,
    my_nonce: Vec<u8>,
    other_nonce: Vec<u8>,
    other_ke: Option<KePayload>,
    offered: Vec<Proposal>,
    new_sa: Option<IkeSaId>,
}

impl IkeRekeyTask {
    /// Rekey the current SA
    pub fn initiator() -> Self {
        IkeRekeyTask {
            initiator: true,
            dh: None,
            my_nonce: Vec::new(),
            other_nonce: Vec::new(),
            other_ke: None,
            offered: Vec::new(),
            new_sa: None,
        }
    }

    /// Answer a peer's IKE rekey
    pub fn responder() -> Self {
        IkeRekeyTask {
            initiator: false,
            ..IkeRekeyTask::initiator()
        }
    }

    /// Replacement SA, once allocated
    pub fn new_sa(&self) -> Option<IkeSaId> {
        self.new_sa
    }

    fn dh_group(sa: &IkeSa) -> Result<u16> {
        match sa.proposal().and_then(Proposal::dh_group) {
            Some(group) => Ok(group),
            None => Ok(sa.connection()?.dh_group()),
        }
    }

    fn build_request(&mut self, sa: &mut IkeSa, ctx: &Context<'_>, message: &mut Message) -> Result<()> {
        let group = Self::dh_group(sa)?;
        let dh = sa.services().dh_factory.create(group)?;

        let new_sa = ctx.manager.checkout_new(sa.version(), true);
        let new_id = new_sa.id();
        ctx.manager.checkin(new_sa);

        let spi = new_id.initiator_spi.to_be_bytes().to_vec();
        let proposals = sa
            .connection()?
            .proposals()
            .into_iter()
            .map(|p| p.with_spi(spi.clone()))
            .collect();
        let nonce = NoncePayload::generate();

        message.add_payload(Payload::Sa(SaPayload::new(proposals)));
        message.add_payload(Payload::Nonce(nonce.clone()));
        message.add_payload(Payload::Ke(KePayload::new(group, dh.my_public_value())));

        self.my_nonce = nonce.nonce;
        self.dh = Some(dh);
        self.new_sa = Some(new_id);
        Ok(())
    }

    /// Drop the placeholder SA allocated for the rekey
    fn abort(&mut self, manager: &IkeSaManager) {
        if let Some(id) = self.new_sa.take() {
            if let Some(new_sa) = manager.checkout(&id) {
                manager.checkin_and_destroy(new_sa);
            }
        }
    }

    fn shared_secret(&mut self, ke: &KePayload) -> Result<zeroize::Zeroizing<Vec<u8>>> {
        let dh = self
            .dh
            .as_mut()
            .ok_or_else(|| Error::InvalidState("IKE rekey without DH".into()))?;
        if ke.dh_group != dh.group() {
            return Err(Error::DhGroupRejected(ke.dh_group));
        }
        dh.set_other_public_value(&ke.key_data)?;
        Ok(dh.shared_secret()?)
    }

    fn process_response(&mut self, sa: &mut IkeSa, ctx: &Context<'_>, message: &Message) -> Result<()> {
        if let Some(notify) = message.notifies().find(|n| n.is_error()) {
            logging::log_notify(notify.notify_type, notify.protocol_id, true);
            return Err(Error::ErrorNotify(notify.notify_type));
        }
        let new_id = self
            .new_sa
            .ok_or_else(|| Error::InvalidState("IKE rekey without new SA".into()))?;

        let sa_payload = message.sa().ok_or(Error::MissingPayload("SA"))?;
        let nonce = message.nonce().ok_or(Error::MissingPayload("NONCE"))?;
        let ke = message.ke().ok_or(Error::MissingPayload("KE"))?;

        let proposal = select_response_proposal(&sa.connection()?.proposals(), sa_payload.proposals())?;
        let responder_spi = proposal
            .ike_spi()
            .filter(|spi| *spi != 0)
            .ok_or(Error::ZeroSpi)?;
        let secret = self.shared_secret(ke)?;
        self.other_nonce = nonce.nonce.clone();

        let old_keys = sa
            .keys()
            .ok_or_else(|| Error::InvalidState("IKE_SA has no keys".into()))?;
        let keys = KeyMaterial::derive_rekey(
            old_keys,
            KeySizes::from_proposal(&proposal)?,
            &self.my_nonce,
            &self.other_nonce,
            &secret,
            new_id.initiator_spi,
            responder_spi,
        )?;

        let mut new_sa = ctx
            .manager
            .checkout(&new_id)
            .ok_or_else(|| Error::SaNotFound(new_id.to_string()))?;
        self.new_sa = None;
        new_sa.set_remote_spi(responder_spi);
        new_sa.set_keys(keys, proposal);
        new_sa.inherit_from(sa);
        new_sa.establish();

        let new_id = new_sa.id();
        if let Err(e) = new_sa.run_tasks(ctx) {
            ctx.bus.sa_failed(&e);
            ctx.manager.checkin_and_destroy(new_sa);
            return Err(e);
        }
        ctx.manager.checkin(new_sa);

        sa.services().metrics.record_ike_sa_rekeyed();
        logging::log_ike_rekey_complete(
            sa.id().initiator_spi,
            new_id.initiator_spi,
            new_id.responder_spi,
        );
        Ok(())
    }

    fn process_request(&mut self, message: &Message) -> Result<()> {
        let sa_payload = message.sa().ok_or(Error::MissingPayload("SA"))?;
        let nonce = message.nonce().ok_or(Error::MissingPayload("NONCE"))?;
        let ke = message.ke().ok_or(Error::MissingPayload("KE"))?;
        self.offered = sa_payload.proposals().to_vec();
        self.other_nonce = nonce.nonce.clone();
        self.other_ke = Some(ke.clone());
        Ok(())
    }

    fn build_response(&mut self, sa: &mut IkeSa, ctx: &Context<'_>, message: &mut Message) -> Result<()> {
        let ke = self.other_ke.take().ok_or(Error::MissingPayload("KE"))?;
        let mut proposal = sa.connection()?.select_proposal(&self.offered)?;
        let initiator_spi = proposal
            .ike_spi()
            .filter(|spi| *spi != 0)
            .ok_or(Error::ZeroSpi)?;
        let group = proposal.dh_group().ok_or(Error::NoProposalChosen)?;
        if ke.dh_group != group {
            debug!(offered = ke.dh_group, wanted = group, "Requesting different DH group for rekey");
            message.add_payload(Payload::Notify(NotifyPayload::invalid_ke(group)));
            return Ok(());
        }

        self.dh = Some(sa.services().dh_factory.create(group)?);
        let secret = self.shared_secret(&ke)?;
        let my_nonce = NoncePayload::generate();

        let sizes = KeySizes::from_proposal(&proposal)?;
        let old_keys = sa
            .keys()
            .ok_or_else(|| Error::InvalidState("IKE_SA has no keys".into()))?;

        // from here on every error must hand new_sa back to the manager
        let mut new_sa = ctx.manager.checkout_new(sa.version(), false);
        new_sa.set_remote_spi(initiator_spi);
        let new_id = new_sa.id();

        let keys = match KeyMaterial::derive_rekey(
            old_keys,
            sizes,
            &self.other_nonce,
            &my_nonce.nonce,
            &secret,
            initiator_spi,
            new_id.responder_spi,
        ) {
            Ok(keys) => keys,
            Err(e) => {
                ctx.manager.checkin_and_destroy(new_sa);
                return Err(e);
            }
        };

        proposal.spi = new_id.responder_spi.to_be_bytes().to_vec();
        new_sa.set_keys(keys, proposal.clone());
        new_sa.inherit_from(sa);
        new_sa.establish();
        ctx.manager.checkin(new_sa);

        let dh = self
            .dh
            .as_ref()
            .ok_or_else(|| Error::InvalidState("IKE rekey without DH".into()))?;
        message.add_payload(Payload::Sa(SaPayload::new(vec![proposal])));
        message.add_payload(Payload::Nonce(my_nonce.clone()));
        message.add_payload(Payload::Ke(KePayload::new(group, dh.my_public_value())));

        self.my_nonce = my_nonce.nonce;
        sa.services().metrics.record_ike_sa_rekeyed();
        logging::log_ike_rekey_complete(
            sa.id().initiator_spi,
            new_id.initiator_spi,
            new_id.responder_spi,
        );
        Ok(())
    }
}

impl Task for IkeRekeyTask {
    fn task_type(&self) -> TaskType {
        TaskType::IkeRekey
    }

    fn build(&mut self, sa: &mut IkeSa, ctx: &Context<'_>, message: &mut Message) -> TaskStatus {
        if self.initiator {
            match self.build_request(sa, ctx, message) {
                Ok(()) => TaskStatus::NeedMore,
                Err(e) => {
                    warn!(error = %e, "IKE_SA not rekeyed");
                    self.abort(ctx.manager);
                    TaskStatus::Success
                }
            }
        } else {
            if let Err(e) = self.build_response(sa, ctx, message) {
                warn!(error = %e, "Rejecting IKE_SA rekey");
                message.add_payload(Payload::Notify(NotifyPayload::new(
                    NotifyType::NoProposalChosen,
                    Vec::new(),
                )));
            }
            TaskStatus::Success
        }
    }

    fn process(&mut self, sa: &mut IkeSa, ctx: &Context<'_>, message: &Message) -> TaskStatus {
        if !self.initiator {
            if let Err(e) = self.process_request(message) {
                debug!(error = %e, "Malformed IKE rekey request");
            }
            return TaskStatus::NeedMore;
        }

        match self.process_response(sa, ctx, message) {
            Ok(()) => {
                let old = sa.id();
                sa.queue_task(Box::new(IkeDeleteTask::initiator(old)));
            }
            Err(e) => {
                warn!(error = %e, "IKE_SA rekey failed");
                self.abort(ctx.manager);
            }
        }
        TaskStatus::Success
    }

    fn migrate(&mut self, _new_owner: IkeSaId) {
        self.dh = None;
        self.my_nonce.clear();
    }

    fn destroy(&mut self, manager: &IkeSaManager) {
        self.abort(manager);
    }
}

impl std::fmt::Debug for IkeRekeyTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IkeRekeyTask")
            .field("initiator", &self.initiator)
            .field("new_sa", &self.new_sa)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_sa_unset_until_built() {
        assert!(IkeRekeyTask::initiator().new_sa().is_none());
        assert!(IkeRekeyTask::responder().new_sa().is_none());
    }
}

