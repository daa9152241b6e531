//! Evaluation coordination for Nova's Java debugger.
//!
//! All traffic to the debuggee goes through one manager thread
//! ([`DebuggerManagerThread`]) which owns the [`nova_jdwp::JdwpClient`] and
//! runs queued [`DebuggerCommand`]s in FIFO order. Other threads either submit
//! commands or block on a bounded [`CommandQueue::invoke_and_wait`].
//!
//! On top of that this crate provides:
//! - [`SuspensionEpisode`]: one suspension of the debuggee, with its
//!   at-most-one-evaluation rule and keep-alive objects.
//! - [`EvaluationHandle`]: everything an expression evaluation needs (frame,
//!   lazily computed receiver, class loading flags).
//! - [`LazyResult`]: compute-once values that also cache failures.
//! - [`BatchEvaluator`]: per-episode batching of `toString()` renders through a
//!   helper object in the debuggee, with a per-value fallback.
//! - [`DebuggerSession`]: a clonable, thread-safe facade over all of the above.

mod batch;
mod command;
pub mod config;
mod context;
mod error;
mod handle;
mod invoke;
mod lazy;
mod manager_thread;
mod panic_util;
mod render;
mod session;
mod suspend;

pub use crate::batch::{
    decode_batch_reply, BatchCapability, BatchEvaluator, BatchHelper, BatchItem,
    PendingTextRequest, RenderCallback, HELPER_EVALUATE, HELPER_EVALUATE_SIGNATURE,
};
pub use crate::command::{CancelReason, DebuggerCommand};
pub use crate::config::{init_tracing, CancelPolicy, ConfigError, DebugEvalConfig};
pub use crate::context::{EvaluationListener, ManagerContext};
pub use crate::error::{ContractViolation, EvalResult, EvaluateError};
pub use crate::handle::{
    EvaluatingThreads, EvaluationHandle, EvaluationId, ExpressionEvaluator, Receiver,
};
pub use crate::invoke::{promise, Completer, Promise};
pub use crate::lazy::LazyResult;
pub use crate::manager_thread::{CommandQueue, DebuggerManagerThread};
pub use crate::render::{quote_java_string, render_locally};
pub use crate::session::DebuggerSession;
pub use crate::suspend::{EpisodeId, EpisodeState, FrameRef, SuspensionEpisode};
