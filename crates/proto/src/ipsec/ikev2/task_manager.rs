//! Task manager: queues, message IDs and retransmission state of one IKE_SA
//!
//! Tasks live in three places:
//!
//! - **queued**: waiting for their turn to start an exchange
//! - **active**: contributed to the request in flight, waiting for its response
//! - **passive**: created for an inbound request, gone once answered
//!
//! Only one request is in flight at a time. Its packet is kept for
//! retransmission; the last response we sent is kept to answer duplicates.

use std::time::Duration;

use tracing::debug;
use vigil_platform::Packet;

use super::constants::{ExchangeType, NotifyType};
use super::ike_sa::{Context, IkeSa};
use super::manager::IkeSaManager;
use super::message::{IkeSaId, Message};
use super::proposal::ProtocolId;
use super::state::{SaStateKind, StateOutcome};
use super::tasks::{
    ChildCreateTask, ChildDeleteTask, ChildRekeyTask, IkeDeleteTask, IkeRekeyTask,
    InformationalTask, Task, TaskStatus, TaskType,
};
use crate::ipsec::{logging, Error, Result};

/// Request waiting for its response
struct InFlight {
    message_id: u32,
    exchange: ExchangeType,
    packet: Packet,
    retransmitted: u32,
}

/// Task queues and message-ID bookkeeping of one IKE_SA
pub struct TaskManager {
    queued: Vec<Box<dyn Task>>,
    active: Vec<Box<dyn Task>>,
    next_id: u32,
    in_flight: Option<InFlight>,
    last_replied: Option<u32>,
    expected_id: u32,
    cached: Option<(u32, Packet)>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    /// Create an empty task manager
    pub fn new() -> Self {
        TaskManager {
            queued: Vec::new(),
            active: Vec::new(),
            next_id: 0,
            in_flight: None,
            last_replied: None,
            expected_id: 0,
            cached: None,
        }
    }

    /// Message ID the next request will carry
    pub fn next_message_id(&self) -> u32 {
        self.next_id
    }

    /// Record a request as sent
    pub(crate) fn request_sent(&mut self, message_id: u32, exchange: ExchangeType, packet: Packet) {
        self.next_id = message_id.wrapping_add(1);
        self.in_flight = Some(InFlight {
            message_id,
            exchange,
            packet,
            retransmitted: 0,
        });
    }

    /// Whether a request is waiting for its response
    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Exchange type of the request in flight
    pub fn in_flight_exchange(&self) -> Option<ExchangeType> {
        self.in_flight.as_ref().map(|f| f.exchange)
    }

    /// Whether `message_id` answers the request in flight
    pub fn is_expected_response(&self, message_id: u32) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|f| f.message_id == message_id)
    }

    /// Close the exchange answered by response `message_id`
    pub(crate) fn complete_exchange(&mut self, message_id: u32) {
        if self.is_expected_response(message_id) {
            self.in_flight = None;
        }
        self.last_replied = Some(message_id);
    }

    /// Remember the message ID of the last response we accepted
    pub(crate) fn set_last_replied_message_id(&mut self, message_id: u32) {
        self.last_replied = Some(message_id);
    }

    /// Message ID of the last response we accepted
    pub fn last_replied_message_id(&self) -> Option<u32> {
        self.last_replied
    }

    /// Record a response as sent; it answers later duplicates
    pub(crate) fn response_sent(&mut self, message_id: u32, packet: Packet) {
        self.expected_id = message_id.wrapping_add(1);
        self.cached = Some((message_id, packet));
    }

    /// Message ID the next peer request must carry
    pub fn expected_request_id(&self) -> u32 {
        self.expected_id
    }

    /// Response already sent for request `message_id`
    pub fn cached_response(&self, message_id: u32) -> Option<&Packet> {
        self.cached
            .as_ref()
            .filter(|(id, _)| *id == message_id)
            .map(|(_, packet)| packet)
    }

    /// Forget everything sent so far
    ///
    /// Used when IKE_SA_INIT starts over with a different DH group.
    pub fn reset_message_buffers(&mut self) {
        self.next_id = 0;
        self.in_flight = None;
        self.last_replied = None;
        self.cached = None;
    }

    /// Append a task to the queue
    pub fn queue_task(&mut self, task: Box<dyn Task>) {
        debug!(task = %task.task_type(), "Queueing task");
        self.queued.push(task);
    }

    /// Types of queued tasks, in order
    pub fn queued_types(&self) -> Vec<TaskType> {
        self.queued.iter().map(|t| t.task_type()).collect()
    }

    /// Types of active tasks, in order
    pub fn active_types(&self) -> Vec<TaskType> {
        self.active.iter().map(|t| t.task_type()).collect()
    }

    /// Number of queued tasks
    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    /// Number of active tasks
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Move the queued tasks of `other` over, rebinding them to `new_owner`
    pub fn adopt_tasks(&mut self, other: &mut TaskManager, new_owner: IkeSaId) {
        for mut task in other.queued.drain(..) {
            task.migrate(new_owner);
            debug!(task = %task.task_type(), ike_sa = %new_owner, "Migrating task");
            self.queued.push(task);
        }
    }

    /// Destroy all tasks
    pub(crate) fn flush(&mut self, manager: &IkeSaManager) {
        for mut task in self.queued.drain(..).chain(self.active.drain(..)) {
            task.destroy(manager);
        }
        self.in_flight = None;
        self.cached = None;
    }

    /// Retire handshake tasks the state machine no longer needs
    pub(crate) fn handshake_advanced(&mut self, state: SaStateKind) {
        let done: fn(TaskType) -> bool = match state {
            SaStateKind::IkeAuthRequested => |t| t == TaskType::IkeInit,
            SaStateKind::Established => TaskType::is_handshake,
            _ => return,
        };
        self.active.retain(|t| !done(t.task_type()));
        self.queued.retain(|t| !done(t.task_type()));
    }

    /// Move queued tasks to active for the next exchange
    ///
    /// Before establishment only the handshake tasks start. Afterwards the
    /// first queued task starts, joined by every queued task that can share
    /// its INFORMATIONAL request. CREATE_CHILD_SA carries a single SA payload
    /// and IKE_SA deletion ends the exchange sequence, so those run alone.
    fn activate(&mut self, established: bool) {
        if !established {
            let (handshake, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queued)
                .into_iter()
                .partition(|t| t.task_type().is_handshake());
            self.active = handshake;
            self.queued = rest;
            return;
        }
        let Some(pos) = self.queued.iter().position(|t| !t.task_type().is_handshake()) else {
            return;
        };
        let first = self.queued.remove(pos);
        let batch = first.task_type().shares_request();
        debug!(task = %first.task_type(), "Activating task");
        self.active.push(first);
        if !batch {
            return;
        }

        let (joined, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queued)
            .into_iter()
            .partition(|t| t.task_type().shares_request());
        for task in &joined {
            debug!(task = %task.task_type(), "Activating task");
        }
        self.active.extend(joined);
        self.queued = rest;
    }

    /// Start the next exchange unless a request is in flight
    ///
    /// # Errors
    ///
    /// Returns the error of a task that failed fatally, or a send failure
    pub(crate) fn initiate(sa: &mut IkeSa, ctx: &Context<'_>) -> Result<()> {
        loop {
            if sa.tasks().has_in_flight() {
                return Ok(());
            }
            let established = sa.is_established();
            if sa.tasks().active.is_empty() {
                sa.tasks_mut().activate(established);
            }
            let mut active = std::mem::take(&mut sa.tasks_mut().active);
            let Some(first) = active.first() else {
                return Ok(());
            };
            let exchange = first.task_type().exchange_type();

            let mut message = sa.new_request(exchange);
            let mut failure = None;
            active.retain_mut(|task| match task.build(sa, ctx, &mut message) {
                TaskStatus::NeedMore => true,
                TaskStatus::Success | TaskStatus::DestroyMe => false,
                TaskStatus::Failed(e) => {
                    failure.get_or_insert(e);
                    false
                }
            });
            let done = active.is_empty();
            sa.tasks_mut().active = active;

            if let Some(error) = failure {
                return Err(error);
            }
            if matches!(exchange, ExchangeType::IkeSaInit | ExchangeType::IkeAuth) {
                // the handshake states send their own messages
                return Ok(());
            }
            if done {
                continue;
            }
            sa.send_request(message)?;
            return Ok(());
        }
    }

    /// Tasks that answer an inbound request
    fn passive_tasks(sa: &IkeSa, request: &Message) -> Result<Vec<Box<dyn Task>>> {
        let mut tasks: Vec<Box<dyn Task>> = Vec::new();
        match request.exchange_type {
            ExchangeType::CreateChildSa => {
                let ike_rekey = request
                    .sa()
                    .and_then(|sa| sa.proposals().first())
                    .is_some_and(|p| p.protocol_id == ProtocolId::Ike);
                if request.get_notify(NotifyType::RekeySa).is_some() {
                    tasks.push(Box::new(ChildRekeyTask::responder()));
                } else if ike_rekey {
                    tasks.push(Box::new(IkeRekeyTask::responder()));
                } else {
                    tasks.push(Box::new(ChildCreateTask::responder()));
                }
            }
            ExchangeType::Informational => {
                if request.deletes().any(|d| d.protocol_id == ProtocolId::Ike) {
                    tasks.push(Box::new(IkeDeleteTask::responder(sa.id())));
                } else {
                    let deletes = request.deletes().next().is_some();
                    if deletes {
                        tasks.push(Box::new(ChildDeleteTask::responder()));
                    }
                    if !deletes || request.notifies().next().is_some() {
                        tasks.push(Box::new(InformationalTask::responder()));
                    }
                }
            }
            other => {
                return Err(Error::UnexpectedExchange(format!(
                    "{} request on an established IKE_SA",
                    other
                )))
            }
        }
        Ok(tasks)
    }

    /// Handle a request or response on an established SA
    pub(crate) fn process_message(sa: &mut IkeSa, ctx: &Context<'_>, message: Message) -> StateOutcome {
        if message.is_request() {
            Self::process_request(sa, ctx, message)
        } else {
            Self::process_response(sa, ctx, message)
        }
    }

    fn process_request(sa: &mut IkeSa, ctx: &Context<'_>, mut message: Message) -> StateOutcome {
        let expected = sa.tasks().expected_request_id();
        if message.message_id != expected {
            let error = Error::UnexpectedMessage(format!(
                "request {} while expecting {}",
                message.message_id, expected
            ));
            logging::log_message_rejected(sa.id().initiator_spi, &error.to_string());
            return StateOutcome::Fail(error);
        }
        if let Err(e) = sa.parse_body(&mut message) {
            logging::log_message_rejected(sa.id().initiator_spi, &e.to_string());
            return StateOutcome::Fail(e);
        }
        let mut passive = match Self::passive_tasks(sa, &message) {
            Ok(tasks) => tasks,
            Err(e) => {
                logging::log_message_rejected(sa.id().initiator_spi, &e.to_string());
                return StateOutcome::Fail(e);
            }
        };

        let mut failure = None;
        let mut destroy = false;
        passive.retain_mut(|task| match task.process(sa, ctx, &message) {
            TaskStatus::NeedMore => true,
            TaskStatus::Success => false,
            TaskStatus::DestroyMe => {
                destroy = true;
                false
            }
            TaskStatus::Failed(e) => {
                failure.get_or_insert(e);
                false
            }
        });

        let mut response = Message::response_to(&message, sa.id());
        for task in passive.iter_mut() {
            match task.build(sa, ctx, &mut response) {
                TaskStatus::DestroyMe => destroy = true,
                TaskStatus::Failed(e) => {
                    failure.get_or_insert(e);
                }
                TaskStatus::NeedMore | TaskStatus::Success => {}
            }
        }
        if let Some(error) = failure {
            return sa.fail(ctx, error);
        }
        if let Err(e) = sa.send_response(response) {
            return sa.fail(ctx, e);
        }
        if destroy {
            return StateOutcome::Destroy;
        }
        match Self::initiate(sa, ctx) {
            Ok(()) => StateOutcome::Continue,
            Err(e) => sa.fail(ctx, e),
        }
    }

    fn process_response(sa: &mut IkeSa, ctx: &Context<'_>, mut message: Message) -> StateOutcome {
        if let Err(e) = sa.parse_body(&mut message) {
            logging::log_message_rejected(sa.id().initiator_spi, &e.to_string());
            return StateOutcome::Fail(e);
        }

        let mut active = std::mem::take(&mut sa.tasks_mut().active);
        let mut failure = None;
        let mut destroy = false;
        active.retain_mut(|task| match task.process(sa, ctx, &message) {
            TaskStatus::NeedMore => true,
            TaskStatus::Success => false,
            TaskStatus::DestroyMe => {
                destroy = true;
                false
            }
            TaskStatus::Failed(e) => {
                failure.get_or_insert(e);
                false
            }
        });
        let tasks = sa.tasks_mut();
        tasks.active = active;
        tasks.complete_exchange(message.message_id);

        if let Some(error) = failure {
            return sa.fail(ctx, error);
        }
        if destroy {
            return StateOutcome::Destroy;
        }
        match Self::initiate(sa, ctx) {
            Ok(()) => StateOutcome::Continue,
            Err(e) => sa.fail(ctx, e),
        }
    }

    /// Resend the request `message_id` if it is still unanswered
    ///
    /// Returns the delay until the next attempt, or `None` if the request was
    /// answered in the meantime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RetransmitTimeout`] once all tries are used up
    pub(crate) fn retransmit(sa: &mut IkeSa, message_id: u32) -> Result<Option<Duration>> {
        let config = sa.connection()?.retransmit();
        let Some(flight) = sa
            .tasks_mut()
            .in_flight
            .as_mut()
            .filter(|f| f.message_id == message_id)
        else {
            return Ok(None);
        };
        if flight.retransmitted >= config.tries {
            return Err(Error::RetransmitTimeout(message_id));
        }
        flight.retransmitted += 1;
        let attempt = flight.retransmitted;
        let packet = flight.packet.clone();

        let delay = config.delay(attempt);
        logging::log_retransmit(message_id, attempt, delay.as_millis());
        sa.services().metrics.record_retransmit();
        sa.retransmit_packet(&packet)?;
        Ok(Some(delay))
    }
}
