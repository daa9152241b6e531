use std::time::Duration;

use nova_jdwp::{JdwpError, ThreadId};
use thiserror::Error;

use crate::handle::EvaluationId;
use crate::suspend::EpisodeId;

pub type EvalResult<T> = Result<T, EvaluateError>;

/// Misuse of the evaluation-exclusivity protocol.
///
/// These indicate a broken invariant in the caller, not a target failure.
/// Transition functions return them as values; [`ContractViolation::fatal`]
/// turns one into a loud abort where continuing would corrupt the episode.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContractViolation {
    #[error("episode {episode} is already being evaluated by {holder}")]
    AlreadyEvaluating {
        episode: EpisodeId,
        holder: EvaluationId,
    },
    #[error("episode {0} has resumed")]
    EpisodeResumed(EpisodeId),
    #[error("{caller} does not hold the evaluation of episode {episode}")]
    NotEvaluationHolder {
        episode: EpisodeId,
        caller: EvaluationId,
    },
    #[error("{0} already has an evaluation thread assigned")]
    HandleAlreadyAssigned(EvaluationId),
    #[error("thread {0} is already evaluating")]
    ThreadAlreadyEvaluating(ThreadId),
    #[error("{0} has no evaluation thread assigned")]
    HandleNotAssigned(EvaluationId),
    #[error("thread {0} is not marked as evaluating")]
    ThreadNotEvaluating(ThreadId),
    #[error("blocking wait issued from the manager thread")]
    WaitOnManagerThread,
    #[error("lazy result re-entered while it was being computed")]
    ReentrantLazyResult,
}

impl ContractViolation {
    /// Log the violation and abort the current operation.
    #[track_caller]
    pub fn fatal(self) -> ! {
        tracing::error!(target = "nova.debugger", violation = %self, "evaluation contract violated");
        panic!("evaluation contract violated: {self}");
    }
}

/// Recoverable evaluation failures, delivered through the same completion
/// path a success would use.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvaluateError {
    #[error(transparent)]
    Jdwp(JdwpError),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
    #[error("thread {0} is already running an evaluation")]
    NestedEvaluation(ThreadId),
    #[error("evaluation handle is not bound to a thread")]
    NoFrame,
    #[error("target threw {exception_type}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    TargetException {
        exception_type: String,
        message: Option<String>,
    },
    #[error("suspension episode {0} has resumed")]
    EpisodeResumed(EpisodeId),
    #[error("debuggee disconnected")]
    Disconnected,
    #[error("cancelled")]
    Cancelled,
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("debugger command panicked")]
    CommandPanicked,
    #[error("malformed batch reply: {0}")]
    MalformedBatchReply(String),
    #[error("{0}")]
    Other(String),
}

impl From<JdwpError> for EvaluateError {
    fn from(err: JdwpError) -> Self {
        match err {
            JdwpError::NotConnected => EvaluateError::Disconnected,
            JdwpError::InvocationException { exception } => EvaluateError::TargetException {
                exception_type: exception.runtime_type,
                message: None,
            },
            other => EvaluateError::Jdwp(other),
        }
    }
}
