//! IKEv2 negotiation core (RFC 7296)
//!
//! # Exchanges
//!
//! 1. **IKE_SA_INIT**: negotiate algorithms, exchange DH values and nonces
//! 2. **IKE_AUTH**: authenticate both peers and create the first child SA
//! 3. **CREATE_CHILD_SA**: create or rekey child SAs, rekey the IKE_SA
//! 4. **INFORMATIONAL**: deletes, notifies and liveness checks
//!
//! # Structure
//!
//! ```text
//! Dispatcher --checkout--> IkeSaManager
//!     |
//!     v
//!   IkeSa ---- SaState (IKE_SA_INIT / IKE_AUTH handlers)
//!     |
//!     +------- TaskManager ---- Task (everything after ESTABLISHED)
//! ```
//!
//! The handshake runs on the [`state`] handlers; later exchanges are carried
//! out by [`tasks`]. Messages reach the core already decoded; the byte layout
//! belongs to a [`MessageCodec`] supplied from outside.

pub mod auth;
pub mod constants;
pub mod dispatcher;
pub mod ike_sa;
pub mod manager;
pub mod message;
pub mod payload;
pub mod proposal;
pub mod state;
pub mod task_manager;
pub mod tasks;

pub use auth::*;
pub use constants::*;
pub use dispatcher::Dispatcher;
pub use ike_sa::{Context, IkeSa, Services};
pub use manager::IkeSaManager;
pub use message::*;
pub use payload::*;
pub use proposal::*;
pub use state::initiator::MAX_INIT_RETRIES;
pub use state::{SaStateKind, StateOutcome};
pub use task_manager::TaskManager;
pub use tasks::{Task, TaskStatus, TaskType};
