use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::context::ManagerContext;
use crate::error::EvaluateError;
use crate::panic_util::panic_payload_to_str;
use crate::suspend::EpisodeId;

/// Why a queued command was discarded without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The manager thread is shutting down.
    QueueClosed,
    /// The episode the command was bound to resumed first.
    EpisodeResumed(EpisodeId),
    /// The connection to the debuggee went away.
    Disconnected,
}

impl From<CancelReason> for EvaluateError {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::QueueClosed | CancelReason::Disconnected => EvaluateError::Disconnected,
            CancelReason::EpisodeResumed(id) => EvaluateError::EpisodeResumed(id),
        }
    }
}

/// A unit of work executed on the manager thread.
pub trait DebuggerCommand: Send + 'static {
    fn run(self: Box<Self>, ctx: &mut ManagerContext);

    /// Called instead of [`DebuggerCommand::run`] when the command is dropped
    /// from the queue. Commands with a waiting caller must complete it here.
    fn cancelled(self: Box<Self>, _reason: CancelReason) {}

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<F> DebuggerCommand for F
where
    F: FnOnce(&mut ManagerContext) + Send + 'static,
{
    fn run(self: Box<Self>, ctx: &mut ManagerContext) {
        (*self)(ctx)
    }

    fn name(&self) -> &str {
        "closure"
    }
}

pub(crate) fn cancel_command(command: Box<dyn DebuggerCommand>, reason: CancelReason) {
    let name = command.name().to_owned();
    tracing::trace!(target = "nova.debugger", command = %name, ?reason, "command cancelled");
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| command.cancelled(reason))) {
        tracing::error!(
            target = "nova.debugger",
            command = %name,
            panic = %panic_payload_to_str(&*panic),
            "cancellation hook panicked"
        );
    }
}
