//! Handing work to the manager thread from any other thread and waiting for
//! its result, with a bounded wait and cooperative cancellation.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::command::{CancelReason, DebuggerCommand};
use crate::config::{CancelPolicy, CrossThreadConfig};
use crate::context::ManagerContext;
use crate::error::{ContractViolation, EvalResult, EvaluateError};
use crate::manager_thread::CommandQueue;
use crate::suspend::SuspensionEpisode;

struct Slot<T> {
    value: Mutex<Option<EvalResult<T>>>,
    ready: Condvar,
}

enum Sink<T> {
    Slot(Arc<Slot<T>>),
    Channel(oneshot::Sender<EvalResult<T>>),
}

impl<T> Sink<T> {
    fn send(self, result: EvalResult<T>) {
        match self {
            Sink::Slot(slot) => {
                *slot.value.lock() = Some(result);
                slot.ready.notify_all();
            }
            Sink::Channel(tx) => {
                let _ = tx.send(result);
            }
        }
    }
}

/// Write side of a cross-thread call.
///
/// Dropping it without completing reports [`EvaluateError::CommandPanicked`]
/// while unwinding and [`EvaluateError::Disconnected`] otherwise, so a waiter
/// is never left hanging.
pub struct Completer<T> {
    sink: Option<Sink<T>>,
}

impl<T> Completer<T> {
    pub fn complete(mut self, result: EvalResult<T>) {
        if let Some(sink) = self.sink.take() {
            sink.send(result);
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            let err = if std::thread::panicking() {
                EvaluateError::CommandPanicked
            } else {
                EvaluateError::Disconnected
            };
            sink.send(Err(err));
        }
    }
}

/// Read side of a cross-thread call, for blocking callers.
pub struct Promise<T> {
    slot: Arc<Slot<T>>,
    config: CrossThreadConfig,
}

pub fn promise<T>(config: &CrossThreadConfig) -> (Promise<T>, Completer<T>) {
    let slot = Arc::new(Slot {
        value: Mutex::new(None),
        ready: Condvar::new(),
    });
    let completer = Completer {
        sink: Some(Sink::Slot(slot.clone())),
    };
    (
        Promise {
            slot,
            config: config.clone(),
        },
        completer,
    )
}

impl<T> Promise<T> {
    /// Wait in `poll_interval` steps, checking `cancel` between steps.
    ///
    /// Gives up after `max_polls` steps; whatever has arrived by then is
    /// returned, otherwise [`EvaluateError::TimedOut`].
    pub fn wait(self, cancel: &CancellationToken) -> EvalResult<T> {
        let interval = self.config.poll_interval();
        let mut value = self.slot.value.lock();
        for _ in 0..self.config.max_polls {
            if let Some(result) = value.take() {
                return result;
            }
            if cancel.is_cancelled() {
                tracing::debug!(
                    target = "nova.debugger",
                    "cross-thread call cancelled; its result will be discarded"
                );
                return Err(EvaluateError::Cancelled);
            }
            let _ = self.slot.ready.wait_for(&mut value, interval);
        }
        match value.take() {
            Some(result) => result,
            None => {
                let waited = self.config.total_wait();
                tracing::warn!(
                    target = "nova.debugger",
                    ?waited,
                    "cross-thread call timed out"
                );
                Err(EvaluateError::TimedOut(waited))
            }
        }
    }
}

struct CrossThreadCommand<T, F> {
    work: F,
    completer: Completer<T>,
    cancel: CancellationToken,
    policy: CancelPolicy,
}

impl<T, F> DebuggerCommand for CrossThreadCommand<T, F>
where
    T: Send + 'static,
    F: FnOnce(&mut ManagerContext) -> EvalResult<T> + Send + 'static,
{
    fn run(self: Box<Self>, ctx: &mut ManagerContext) {
        let Self {
            work,
            completer,
            cancel,
            policy,
        } = *self;
        if policy == CancelPolicy::SkipIfNotStarted && cancel.is_cancelled() {
            tracing::trace!(target = "nova.debugger", "skipping cancelled cross-thread call");
            completer.complete(Err(EvaluateError::Cancelled));
            return;
        }
        completer.complete(work(ctx));
    }

    fn cancelled(self: Box<Self>, reason: CancelReason) {
        self.completer.complete(Err(reason.into()));
    }

    fn name(&self) -> &str {
        "cross-thread call"
    }
}

impl CommandQueue {
    /// Run `work` on the manager thread and wait for its result.
    ///
    /// Must not be called from the manager thread itself; that would wait on
    /// work queued behind the caller.
    pub fn invoke_and_wait<T, F>(&self, cancel: &CancellationToken, work: F) -> EvalResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ManagerContext) -> EvalResult<T> + Send + 'static,
    {
        self.call_blocking(None, cancel, work)
    }

    /// Like [`CommandQueue::invoke_and_wait`], failing with
    /// [`EvaluateError::EpisodeResumed`] if `episode` resumes before `work` starts.
    pub fn invoke_and_wait_for_episode<T, F>(
        &self,
        episode: &Arc<SuspensionEpisode>,
        cancel: &CancellationToken,
        work: F,
    ) -> EvalResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ManagerContext) -> EvalResult<T> + Send + 'static,
    {
        self.call_blocking(Some(episode), cancel, work)
    }

    fn call_blocking<T, F>(
        &self,
        episode: Option<&Arc<SuspensionEpisode>>,
        cancel: &CancellationToken,
        work: F,
    ) -> EvalResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ManagerContext) -> EvalResult<T> + Send + 'static,
    {
        if self.is_manager_thread() {
            return Err(ContractViolation::WaitOnManagerThread.into());
        }
        if cancel.is_cancelled() {
            return Err(EvaluateError::Cancelled);
        }

        let (promise, completer) = promise(self.cross_thread_config());
        let command = CrossThreadCommand {
            work,
            completer,
            cancel: cancel.clone(),
            policy: self.cross_thread_config().cancel_policy,
        };
        match episode {
            Some(episode) => self.submit_for_episode(episode, command),
            None => self.submit(command),
        }
        promise.wait(cancel)
    }

    /// Async variant of [`CommandQueue::invoke_and_wait`] with the same
    /// bounded total wait.
    pub async fn invoke_async<T, F>(&self, cancel: &CancellationToken, work: F) -> EvalResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ManagerContext) -> EvalResult<T> + Send + 'static,
    {
        if self.is_manager_thread() {
            return Err(ContractViolation::WaitOnManagerThread.into());
        }
        if cancel.is_cancelled() {
            return Err(EvaluateError::Cancelled);
        }

        let (tx, rx) = oneshot::channel();
        let config = self.cross_thread_config();
        self.submit(CrossThreadCommand {
            work,
            completer: Completer {
                sink: Some(Sink::Channel(tx)),
            },
            cancel: cancel.clone(),
            policy: config.cancel_policy,
        });

        let total = config.total_wait();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EvaluateError::Cancelled),
            received = tokio::time::timeout(total, rx) => match received {
                Ok(Ok(result)) => result,
                Ok(Err(_closed)) => Err(EvaluateError::Disconnected),
                Err(_elapsed) => Err(EvaluateError::TimedOut(total)),
            },
        }
    }
}
