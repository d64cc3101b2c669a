//! Errors raised by the reactor loop and process registry
//!
//! Process-level failures (a child crashing, a peer hanging up) are not
//! errors: they arrive as triggers. What ends up here are programming errors
//! (a message with no destination, a pipe to a stranger) and OS calls that
//! failed outright.

use crate::protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoopError {
    /// `submit` was given a message with neither a destination pid nor label
    #[error("message has neither a destination pid nor a destination label")]
    MissingDestination,

    /// A pipe may only connect to the parent or to a known child
    #[error("cannot add a pipe to pid {0}: it is neither the parent nor a known child")]
    PipeTarget(i32),

    /// Valid exit codes are 0..=254, 255 is reserved for the runtime
    #[error("exit code {0} is out of range (0-254)")]
    ExitCode(i32),

    #[error("the loop is not running")]
    NotRunning,

    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("signal setup failed: {0}")]
    Signal(#[source] nix::Error),

    #[error("failed to detach from the controlling terminal: {0}")]
    Detach(#[source] nix::Error),

    /// Closing stdio while log output would still go there
    #[error("cannot close standard descriptors while logging is enabled")]
    LoggingEnabled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, LoopError>;
