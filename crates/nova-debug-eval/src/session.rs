use std::sync::Arc;
use std::time::Duration;

use nova_jdwp::{JdwpClient, JdwpValue};
use tokio_util::sync::CancellationToken;

use crate::batch::RenderCallback;
use crate::command::{CancelReason, DebuggerCommand};
use crate::config::DebugEvalConfig;
use crate::context::{EvaluationListener, ManagerContext};
use crate::error::{ContractViolation, EvalResult};
use crate::handle::{EvaluationHandle, ExpressionEvaluator};
use crate::invoke::promise;
use crate::manager_thread::{CommandQueue, DebuggerManagerThread};
use crate::suspend::SuspensionEpisode;

/// Thread-safe entry point to one debuggee connection.
///
/// Every operation is carried out on the manager thread; the blocking ones
/// wait through [`CommandQueue::invoke_and_wait`] and must not be called from
/// inside a command.
#[derive(Clone)]
pub struct DebuggerSession {
    manager: Arc<DebuggerManagerThread>,
}

impl DebuggerSession {
    pub fn start(client: Box<dyn JdwpClient>, config: DebugEvalConfig) -> std::io::Result<Self> {
        let manager = DebuggerManagerThread::start(client, config)?;
        Ok(Self {
            manager: Arc::new(manager),
        })
    }

    pub fn queue(&self) -> &CommandQueue {
        self.manager.queue()
    }

    /// Run `work` against the connection state and wait for its result.
    pub fn with_context<T, F>(&self, cancel: &CancellationToken, work: F) -> EvalResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ManagerContext) -> EvalResult<T> + Send + 'static,
    {
        self.queue().invoke_and_wait(cancel, work)
    }

    pub fn process_events(
        &self,
        cancel: &CancellationToken,
    ) -> EvalResult<Vec<Arc<SuspensionEpisode>>> {
        self.with_context(cancel, ManagerContext::process_events)
    }

    pub fn pause(&self, cancel: &CancellationToken) -> EvalResult<Arc<SuspensionEpisode>> {
        self.with_context(cancel, ManagerContext::pause)
    }

    pub fn resume(
        &self,
        episode: &Arc<SuspensionEpisode>,
        cancel: &CancellationToken,
    ) -> EvalResult<()> {
        let episode = episode.clone();
        self.with_context(cancel, move |ctx| ctx.resume(&episode))
    }

    pub fn detach(&self, cancel: &CancellationToken) -> EvalResult<()> {
        self.with_context(cancel, |ctx| {
            ctx.detach();
            Ok(())
        })
    }

    pub fn attach(&self, client: Box<dyn JdwpClient>, cancel: &CancellationToken) -> EvalResult<()> {
        self.with_context(cancel, move |ctx| {
            ctx.attach(client);
            Ok(())
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn EvaluationListener>) {
        self.queue()
            .submit(move |ctx: &mut ManagerContext| ctx.add_listener(listener));
    }

    pub fn evaluate(
        &self,
        handle: &Arc<EvaluationHandle>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        cancel: &CancellationToken,
    ) -> EvalResult<JdwpValue> {
        let task_handle = handle.clone();
        self.queue()
            .invoke_and_wait_for_episode(handle.episode(), cancel, move |ctx| {
                ctx.evaluate(&task_handle, evaluator.as_ref())
            })
    }

    pub fn compute_receiver(
        &self,
        handle: &Arc<EvaluationHandle>,
        cancel: &CancellationToken,
    ) -> EvalResult<JdwpValue> {
        let task_handle = handle.clone();
        self.queue()
            .invoke_and_wait_for_episode(handle.episode(), cancel, move |ctx| {
                task_handle.compute_receiver(ctx)
            })
    }

    pub fn keep_alive(
        &self,
        handle: &Arc<EvaluationHandle>,
        value: JdwpValue,
        cancel: &CancellationToken,
    ) -> EvalResult<()> {
        let task_handle = handle.clone();
        self.queue()
            .invoke_and_wait_for_episode(handle.episode(), cancel, move |ctx| {
                ctx.keep_alive(&task_handle, &value)
            })
    }

    /// Render `value` asynchronously. `on_done` runs exactly once, on the
    /// manager thread or on the submitting thread if the queue is closed.
    pub fn render_as_text(
        &self,
        episode: &Arc<SuspensionEpisode>,
        value: JdwpValue,
        on_done: impl RenderCallback,
    ) {
        self.queue().submit_for_episode(
            episode,
            RenderCommand {
                episode: episode.clone(),
                value,
                callback: on_done,
            },
        );
    }

    pub fn render_as_text_blocking(
        &self,
        episode: &Arc<SuspensionEpisode>,
        value: JdwpValue,
        cancel: &CancellationToken,
    ) -> EvalResult<Option<String>> {
        if self.queue().is_manager_thread() {
            return Err(ContractViolation::WaitOnManagerThread.into());
        }
        let (promise, completer) = promise(self.queue().cross_thread_config());
        self.render_as_text(episode, value, move |result: EvalResult<Option<String>>| {
            completer.complete(result)
        });
        promise.wait(cancel)
    }

    /// See [`DebuggerManagerThread::shutdown`].
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.manager.shutdown(timeout)
    }
}

struct RenderCommand<C> {
    episode: Arc<SuspensionEpisode>,
    value: JdwpValue,
    callback: C,
}

impl<C: RenderCallback> DebuggerCommand for RenderCommand<C> {
    fn run(self: Box<Self>, ctx: &mut ManagerContext) {
        let Self {
            episode,
            value,
            callback,
        } = *self;
        ctx.render_as_text(&episode, value, callback);
    }

    fn cancelled(self: Box<Self>, reason: CancelReason) {
        Box::new(self.callback).on_failure(reason.into());
    }

    fn name(&self) -> &str {
        "render as text"
    }
}
