//! Tasks: resumable units of protocol work
//!
//! Every exchange after the handshake is carried out by tasks. The
//! [`TaskManager`](super::task_manager::TaskManager) asks each active task to
//! contribute payloads to an outgoing message (`build`) and to consume the
//! matching incoming message (`process`). A task that has nothing to add
//! simply leaves the message alone.
//!
//! | Task | Exchange | Initiator | Responder |
//! |---|---|---|---|
//! | [`IkeInitTask`] | IKE_SA_INIT | starts the handshake | - |
//! | [`IkeAuthTask`] | IKE_AUTH | names the first child | - |
//! | [`ChildCreateTask`] | CREATE_CHILD_SA | proposes a child | installs a child |
//! | [`ChildRekeyTask`] | CREATE_CHILD_SA | replaces a child | replaces a child |
//! | [`ChildDeleteTask`] | INFORMATIONAL | deletes children | deletes children |
//! | [`IkeRekeyTask`] | CREATE_CHILD_SA | replaces the IKE_SA | replaces the IKE_SA |
//! | [`IkeReauthTask`] | INFORMATIONAL | deletes, then re-creates | - |
//! | [`IkeDeleteTask`] | INFORMATIONAL | deletes the IKE_SA | deletes the IKE_SA |
//! | [`InformationalTask`] | INFORMATIONAL | notifies / liveness | acknowledges |

mod child;
mod handshake;
mod ike_delete;
mod ike_reauth;
mod ike_rekey;
mod informational;

pub use self::child::{ChildCreateTask, ChildDeleteTask, ChildRekeyTask};
pub use self::handshake::{IkeAuthTask, IkeInitTask};
pub use self::ike_delete::IkeDeleteTask;
pub use self::ike_reauth::IkeReauthTask;
pub use self::ike_rekey::IkeRekeyTask;
pub use self::informational::InformationalTask;

use std::fmt;

use super::constants::ExchangeType;
use super::ike_sa::{Context, IkeSa};
use super::manager::IkeSaManager;
use super::message::{IkeSaId, Message};
use crate::ipsec::Error;

/// Kind of task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// IKE_SA_INIT handle on the handshake
    IkeInit,
    /// IKE_AUTH handle on the handshake
    IkeAuth,
    /// Create a child SA
    ChildCreate,
    /// Rekey a child SA
    ChildRekey,
    /// Delete child SAs
    ChildDelete,
    /// Rekey the IKE_SA
    IkeRekey,
    /// Reauthenticate by replacing the IKE_SA
    IkeReauth,
    /// Delete the IKE_SA
    IkeDelete,
    /// Notifies or liveness check
    Informational,
}

impl TaskType {
    /// Exchange this task runs in
    pub fn exchange_type(self) -> ExchangeType {
        match self {
            TaskType::IkeInit => ExchangeType::IkeSaInit,
            TaskType::IkeAuth => ExchangeType::IkeAuth,
            TaskType::ChildCreate | TaskType::ChildRekey | TaskType::IkeRekey => {
                ExchangeType::CreateChildSa
            }
            TaskType::ChildDelete
            | TaskType::IkeReauth
            | TaskType::IkeDelete
            | TaskType::Informational => ExchangeType::Informational,
        }
    }

    /// Whether the task belongs to the initial handshake
    pub fn is_handshake(self) -> bool {
        matches!(self, TaskType::IkeInit | TaskType::IkeAuth)
    }

    /// Whether the task can join other tasks in one INFORMATIONAL request
    pub fn shares_request(self) -> bool {
        matches!(self, TaskType::ChildDelete | TaskType::Informational)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::IkeInit => "IKE_INIT",
            TaskType::IkeAuth => "IKE_AUTH",
            TaskType::ChildCreate => "CHILD_CREATE",
            TaskType::ChildRekey => "CHILD_REKEY",
            TaskType::ChildDelete => "CHILD_DELETE",
            TaskType::IkeRekey => "IKE_REKEY",
            TaskType::IkeReauth => "IKE_REAUTH",
            TaskType::IkeDelete => "IKE_DELETE",
            TaskType::Informational => "INFORMATIONAL",
        };
        f.write_str(name)
    }
}

/// Progress reported by a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Waiting for the other half of the exchange
    NeedMore,
    /// Done; child-level failures are handled inside and also end here
    Success,
    /// The IKE_SA must be deleted
    Failed(Error),
    /// The IKE_SA has done its job and must be destroyed
    DestroyMe,
}

/// Unit of protocol work queued on an IKE_SA
pub trait Task: Send {
    /// Kind of this task
    fn task_type(&self) -> TaskType;

    /// Add payloads to an outgoing request (initiator) or response (responder)
    fn build(&mut self, sa: &mut IkeSa, ctx: &Context<'_>, message: &mut Message) -> TaskStatus;

    /// Consume an incoming response (initiator) or request (responder)
    fn process(&mut self, sa: &mut IkeSa, ctx: &Context<'_>, message: &Message) -> TaskStatus;

    /// Rebind the task to a replacement IKE_SA
    fn migrate(&mut self, new_owner: IkeSaId);

    /// Release resources held outside the owning SA
    fn destroy(&mut self, _manager: &IkeSaManager) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_exchange_types() {
        assert_eq!(TaskType::IkeInit.exchange_type(), ExchangeType::IkeSaInit);
        assert_eq!(TaskType::ChildRekey.exchange_type(), ExchangeType::CreateChildSa);
        assert_eq!(TaskType::IkeRekey.exchange_type(), ExchangeType::CreateChildSa);
        assert_eq!(TaskType::IkeReauth.exchange_type(), ExchangeType::Informational);
        assert_eq!(TaskType::ChildDelete.exchange_type(), ExchangeType::Informational);
    }

    #[test]
    fn test_handshake_tasks() {
        assert!(TaskType::IkeInit.is_handshake());
        assert!(TaskType::IkeAuth.is_handshake());
        assert!(!TaskType::ChildCreate.is_handshake());
        assert_eq!(TaskType::IkeReauth.to_string(), "IKE_REAUTH");
    }

    #[test]
    fn test_request_sharing() {
        assert!(TaskType::Informational.shares_request());
        assert!(TaskType::ChildDelete.shares_request());
        assert!(!TaskType::IkeDelete.shares_request());
        assert!(!TaskType::IkeReauth.shares_request());
        assert!(!TaskType::ChildCreate.shares_request());
    }
}
