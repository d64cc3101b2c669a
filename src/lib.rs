//! Multi-process reactor runtime
//!
//! A root process runs a [`Loop`], forks labelled children connected to it
//! by socket pairs and exchanges [`ResolutionMessage`]s with them. Signals,
//! child status changes, peer hang-ups and inbound messages all become
//! [`Trigger`]s, and each loop turn runs the actions bound to the armed
//! triggers in priority order.

pub mod action;
pub mod config;
pub mod error;
pub mod logging;
pub mod process;
pub mod protocol;
pub mod reactor;
pub mod sync;

pub use action::{ActionId, LoopAction, RuntimeArg, RuntimeArgs, Trigger};
pub use config::LoopConfig;
pub use error::LoopError;
pub use process::{ProcessInfo, ProcessSnapshot, ProcessStatus};
pub use protocol::{ProtocolMessage, ProtocolRegistry, ResolutionMessage};
pub use reactor::{Action, Loop, TimerId, MAX_EXIT_CODE, RUNTIME_EXIT_CODE};
