use std::collections::BTreeMap;
use std::sync::Arc;

use nova_jdwp::{
    ClassId, InvokeOptions, JdwpClient, JdwpError, JdwpEvent, JdwpValue, MethodRef, ObjectId,
    ObjectRef, StoppedEvent, SuspendPolicy, ThreadId, JAVA_LANG_OBJECT,
};

use crate::batch::{BatchCapability, BatchEvaluator, PendingTextRequest, RenderCallback};
use crate::command::CancelReason;
use crate::config::DebugEvalConfig;
use crate::error::{EvalResult, EvaluateError};
use crate::handle::{EvaluatingThreads, EvaluationHandle, ExpressionEvaluator};
use crate::manager_thread::CommandQueue;
use crate::render::render_locally;
use crate::suspend::{EpisodeId, FrameRef, SuspensionEpisode};

const TO_STRING: &str = "toString";
const TO_STRING_SIGNATURE: &str = "()Ljava/lang/String;";

/// Observes target-side method invocations made on behalf of evaluations.
pub trait EvaluationListener: Send + Sync {
    fn evaluation_started(&self, _episode: &SuspensionEpisode, _thread: ThreadId) {}
    fn evaluation_finished(&self, _episode: &SuspensionEpisode, _thread: ThreadId) {}
}

/// Per-connection state, owned by the manager thread.
///
/// Commands receive `&mut ManagerContext`; nothing else can reach the
/// connection, so no further locking is needed for it.
pub struct ManagerContext {
    client: Box<dyn JdwpClient>,
    queue: CommandQueue,
    config: DebugEvalConfig,
    attached: bool,
    episodes: BTreeMap<EpisodeId, Arc<SuspensionEpisode>>,
    next_episode: u64,
    evaluating: EvaluatingThreads,
    listeners: Vec<Arc<dyn EvaluationListener>>,
    object_to_string: Option<MethodRef>,
    pub(crate) batch: BatchEvaluator,
}

impl ManagerContext {
    pub(crate) fn new(
        client: Box<dyn JdwpClient>,
        queue: CommandQueue,
        config: DebugEvalConfig,
    ) -> Self {
        let batch = BatchEvaluator::new(&config.batch);
        Self {
            client,
            queue,
            config,
            attached: true,
            episodes: BTreeMap::new(),
            next_episode: 1,
            evaluating: EvaluatingThreads::default(),
            listeners: Vec::new(),
            object_to_string: None,
            batch,
        }
    }

    pub fn client(&mut self) -> &mut dyn JdwpClient {
        self.client.as_mut()
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn config(&self) -> &DebugEvalConfig {
        &self.config
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn episode(&self, id: EpisodeId) -> Option<Arc<SuspensionEpisode>> {
        self.episodes.get(&id).cloned()
    }

    pub fn active_episodes(&self) -> Vec<Arc<SuspensionEpisode>> {
        self.episodes.values().cloned().collect()
    }

    pub fn evaluating_threads(&self) -> &EvaluatingThreads {
        &self.evaluating
    }

    pub fn batch_capability(&self) -> &BatchCapability {
        self.batch.capability()
    }

    pub fn add_listener(&mut self, listener: Arc<dyn EvaluationListener>) {
        self.listeners.push(listener);
    }

    fn ensure_attached(&self) -> EvalResult<()> {
        if self.attached {
            Ok(())
        } else {
            Err(EvaluateError::Disconnected)
        }
    }

    fn new_episode(
        &mut self,
        policy: SuspendPolicy,
        threads: Vec<ThreadId>,
        current: Option<FrameRef>,
    ) -> Arc<SuspensionEpisode> {
        let id = EpisodeId::from_raw(self.next_episode);
        self.next_episode += 1;
        let episode = Arc::new(SuspensionEpisode::new(id, policy, threads, current));
        self.episodes.insert(id, episode.clone());
        tracing::debug!(
            target = "nova.debugger",
            episode = %id,
            ?policy,
            current = ?current,
            "suspension episode started"
        );
        episode
    }

    /// Open an episode for a stop reported by the debuggee.
    pub fn on_stopped(&mut self, event: &StoppedEvent) -> Arc<SuspensionEpisode> {
        let thread = event.thread_id;
        let threads = match event.suspend_policy {
            SuspendPolicy::All => match self.client.threads() {
                Ok(threads) => threads.into_iter().map(|info| info.id).collect(),
                Err(err) => {
                    tracing::warn!(
                        target = "nova.debugger",
                        error = %err,
                        "failed to list threads for stop event"
                    );
                    vec![thread]
                }
            },
            SuspendPolicy::EventThread => vec![thread],
        };
        let current = match self.client.stack_frames(thread) {
            Ok(frames) => frames.first().map(|frame| FrameRef {
                thread,
                frame: frame.id,
            }),
            Err(err) => {
                tracing::debug!(
                    target = "nova.debugger",
                    thread,
                    error = %err,
                    "stopped thread has no readable frames"
                );
                None
            }
        };
        self.new_episode(event.suspend_policy, threads, current)
    }

    /// Suspend the whole VM and open an episode for it.
    pub fn pause(&mut self) -> EvalResult<Arc<SuspensionEpisode>> {
        self.ensure_attached()?;
        self.client.vm_suspend()?;
        let threads = self
            .client
            .threads()?
            .into_iter()
            .map(|info| info.id)
            .collect();
        Ok(self.new_episode(SuspendPolicy::All, threads, None))
    }

    /// End `episode`: unpin its objects, drop its queued work and pending
    /// renders, then let the halted threads run.
    pub fn resume(&mut self, episode: &Arc<SuspensionEpisode>) -> EvalResult<()> {
        self.ensure_attached()?;
        let id = episode.id();
        let released = episode.try_mark_resumed()?;
        self.episodes.remove(&id);
        self.queue.purge_episode(id, CancelReason::EpisodeResumed(id));
        self.batch.fail_episode(id, EvaluateError::EpisodeResumed(id));
        self.release_objects(&released);

        match episode.policy() {
            SuspendPolicy::All => self.client.vm_resume()?,
            SuspendPolicy::EventThread => {
                for thread in episode.threads() {
                    self.client.resume_thread(*thread)?;
                }
            }
        }
        tracing::debug!(target = "nova.debugger", episode = %id, "suspension episode resumed");
        Ok(())
    }

    fn release_objects(&mut self, objects: &[ObjectId]) {
        for object in objects {
            if let Err(err) = self.client.enable_collection(*object) {
                tracing::debug!(
                    target = "nova.debugger",
                    object,
                    error = %err,
                    "failed to re-enable collection"
                );
            }
        }
    }

    /// Drop the connection and everything that depended on it.
    pub fn detach(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;
        let connected = self.client.is_connected();

        for episode in std::mem::take(&mut self.episodes).into_values() {
            let released = episode.invalidate();
            if connected {
                self.release_objects(&released);
            }
        }
        self.queue.purge_all_episodes(CancelReason::Disconnected);
        if let Some(helper) = self.batch.reset(EvaluateError::Disconnected) {
            if connected {
                self.release_objects(&[helper.id]);
            }
        }
        self.evaluating.clear();
        self.object_to_string = None;
        self.client.dispose();
        tracing::info!(target = "nova.debugger", "debuggee detached");
    }

    /// Replace the connection. The batch capability probe re-runs lazily.
    pub fn attach(&mut self, client: Box<dyn JdwpClient>) {
        self.detach();
        self.client = client;
        self.attached = true;
        tracing::info!(target = "nova.debugger", "debuggee attached");
    }

    pub(crate) fn check_connection(&mut self) {
        if self.attached && !self.client.is_connected() {
            tracing::warn!(target = "nova.debugger", "debuggee connection lost");
            self.detach();
        }
    }

    /// Dispatch buffered debuggee events. Returns the episodes opened.
    pub fn process_events(&mut self) -> EvalResult<Vec<Arc<SuspensionEpisode>>> {
        self.ensure_attached()?;
        let mut opened = Vec::new();
        loop {
            match self.client.poll_event() {
                Ok(Some(JdwpEvent::Stopped(event))) => opened.push(self.on_stopped(&event)),
                Ok(Some(JdwpEvent::VmDisconnected)) => {
                    self.detach();
                    break;
                }
                Ok(None) => break,
                Err(err) if err.is_disconnect() => {
                    self.detach();
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(opened)
    }

    /// Run a compiled expression against `handle`.
    pub fn evaluate(
        &mut self,
        handle: &Arc<EvaluationHandle>,
        evaluator: &dyn ExpressionEvaluator,
    ) -> EvalResult<JdwpValue> {
        self.ensure_attached()?;
        handle.ensure_active()?;
        evaluator.evaluate(self, handle)
    }

    pub fn keep_alive(&mut self, handle: &EvaluationHandle, value: &JdwpValue) -> EvalResult<()> {
        handle.ensure_active()?;
        handle.keep_alive(self.client.as_mut(), value)
    }

    /// Render `value` as text, batching object renders per episode.
    ///
    /// `on_done` is always called exactly once, possibly before this returns.
    pub fn render_as_text(
        &mut self,
        episode: &Arc<SuspensionEpisode>,
        value: JdwpValue,
        on_done: impl RenderCallback,
    ) {
        let request = PendingTextRequest::new(value, episode.clone(), on_done);
        if let Some(text) = render_locally(request.value()) {
            request.complete(Ok(Some(text)));
            return;
        }
        BatchEvaluator::enqueue(self, request);
    }

    pub fn invoke_method(
        &mut self,
        handle: &EvaluationHandle,
        object: &ObjectRef,
        method: &MethodRef,
        args: &[JdwpValue],
    ) -> EvalResult<JdwpValue> {
        let options = invoke_options(handle);
        self.invoke_guarded(handle, args, |client, thread| {
            client.invoke_method(thread, object.id, method, args, options)
        })
    }

    pub fn invoke_static(
        &mut self,
        handle: &EvaluationHandle,
        class: ClassId,
        method: &MethodRef,
        args: &[JdwpValue],
    ) -> EvalResult<JdwpValue> {
        let options = invoke_options(handle);
        self.invoke_guarded(handle, args, |client, thread| {
            client.invoke_static(thread, class, method, args, options)
        })
    }

    pub fn new_instance(
        &mut self,
        handle: &EvaluationHandle,
        class: ClassId,
        constructor: &MethodRef,
        args: &[JdwpValue],
    ) -> EvalResult<ObjectRef> {
        let options = invoke_options(handle);
        self.invoke_guarded(handle, args, |client, thread| {
            client.new_instance(thread, class, constructor, args, options)
        })
    }

    /// Runs one target-side invocation with the handle's thread assigned for
    /// its whole duration. The thread is always released again, whatever the
    /// outcome of the call.
    fn invoke_guarded<R>(
        &mut self,
        handle: &EvaluationHandle,
        args: &[JdwpValue],
        call: impl FnMut(&mut dyn JdwpClient, ThreadId) -> Result<R, JdwpError>,
    ) -> EvalResult<R> {
        self.ensure_attached()?;
        handle.ensure_active()?;
        let thread = handle.thread().ok_or(EvaluateError::NoFrame)?;
        if self.evaluating.contains(thread) {
            return Err(EvaluateError::NestedEvaluation(thread));
        }
        handle.assign_evaluation_thread(&mut self.evaluating, thread)?;

        let episode = handle.episode().clone();
        for listener in &self.listeners {
            listener.evaluation_started(&episode, thread);
        }

        let result = match self.pin_arguments(args) {
            Ok(pinned) => {
                let result = self.call_loading_classes(handle, thread, call);
                self.release_objects(&pinned);
                result
            }
            Err(err) => Err(err),
        };

        if let Err(violation) = handle.release_evaluation_thread(&mut self.evaluating) {
            violation.fatal();
        }
        for listener in &self.listeners {
            listener.evaluation_finished(&episode, thread);
        }
        result
    }

    fn pin_arguments(&mut self, args: &[JdwpValue]) -> EvalResult<Vec<ObjectId>> {
        let mut pinned = Vec::new();
        for object in args.iter().filter_map(JdwpValue::object_id) {
            if let Err(err) = self.client.disable_collection(object) {
                self.release_objects(&pinned);
                return Err(err.into());
            }
            pinned.push(object);
        }
        Ok(pinned)
    }

    fn call_loading_classes<R>(
        &mut self,
        handle: &EvaluationHandle,
        thread: ThreadId,
        mut call: impl FnMut(&mut dyn JdwpClient, ThreadId) -> Result<R, JdwpError>,
    ) -> EvalResult<R> {
        let mut loaded: Vec<String> = Vec::new();
        loop {
            match call(self.client.as_mut(), thread) {
                Err(JdwpError::ClassNotLoaded { class_name })
                    if handle.auto_load_classes() && !loaded.contains(&class_name) =>
                {
                    tracing::debug!(
                        target = "nova.debugger",
                        class = %class_name,
                        "loading class before retrying invocation"
                    );
                    self.client
                        .load_class(thread, &class_name, handle.class_loader())?;
                    loaded.push(class_name);
                }
                other => return other.map_err(EvaluateError::from),
            }
        }
    }

    /// `java.lang.Object#toString()`, resolved once per connection.
    pub(crate) fn object_to_string(&mut self) -> EvalResult<MethodRef> {
        if let Some(method) = &self.object_to_string {
            return Ok(method.clone());
        }
        let class = self
            .client
            .classes_by_name(JAVA_LANG_OBJECT)?
            .first()
            .copied()
            .ok_or_else(|| EvaluateError::Other(format!("{JAVA_LANG_OBJECT} is not loaded")))?;
        let method = self
            .client
            .find_method(class, TO_STRING, TO_STRING_SIGNATURE)?
            .ok_or_else(|| EvaluateError::Other("Object.toString() not found".to_owned()))?;
        self.object_to_string = Some(method.clone());
        Ok(method)
    }
}

fn invoke_options(handle: &EvaluationHandle) -> InvokeOptions {
    InvokeOptions {
        single_threaded: handle.episode().policy() == SuspendPolicy::EventThread,
        nonvirtual: false,
    }
}
