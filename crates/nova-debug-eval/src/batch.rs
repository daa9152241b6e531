//! Batched `toString()` rendering.
//!
//! Render requests raised while one suspension episode is being inspected
//! accumulate per episode. The first request schedules a drain command; when
//! the manager thread reaches it, every request gathered so far is rendered
//! through one call to a helper object living in the debuggee:
//!
//! ```text
//! String evaluate(Object[] values)
//! ```
//!
//! The reply is one string of entries, in input order. Each entry is a tag
//! (`S` for text, `N` for `null`, `E` for a per-element failure) followed, for
//! `S` and `E`, by a decimal `char` count, `:` and that many `char`s. An `E`
//! payload is `ExceptionType` or `ExceptionType: message`.
//!
//! Without the helper, or if the batched call fails as a whole, each request
//! gets its own round-trip instead. Requests are never dropped: every
//! callback is completed exactly once.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use nova_jdwp::{ClassId, JdwpError, JdwpValue, MethodRef, ObjectRef, JAVA_LANG_OBJECT};

use crate::config::BatchConfig;
use crate::context::ManagerContext;
use crate::error::{EvalResult, EvaluateError};
use crate::handle::EvaluationHandle;
use crate::panic_util::panic_payload_to_str;
use crate::render::{quote_java_string, render_individually, render_locally};
use crate::suspend::{EpisodeId, SuspensionEpisode};

pub const HELPER_EVALUATE: &str = "evaluate";
pub const HELPER_EVALUATE_SIGNATURE: &str = "([Ljava/lang/Object;)Ljava/lang/String;";
const CONSTRUCTOR: &str = "<init>";
const CONSTRUCTOR_SIGNATURE: &str = "()V";

/// Completion path of a render request.
pub trait RenderCallback: Send + 'static {
    fn on_success(self: Box<Self>, text: Option<String>);
    fn on_failure(self: Box<Self>, error: EvaluateError);
}

impl<F> RenderCallback for F
where
    F: FnOnce(EvalResult<Option<String>>) + Send + 'static,
{
    fn on_success(self: Box<Self>, text: Option<String>) {
        (*self)(Ok(text))
    }

    fn on_failure(self: Box<Self>, error: EvaluateError) {
        (*self)(Err(error))
    }
}

pub struct PendingTextRequest {
    value: JdwpValue,
    episode: Arc<SuspensionEpisode>,
    callback: Box<dyn RenderCallback>,
}

impl PendingTextRequest {
    pub fn new(
        value: JdwpValue,
        episode: Arc<SuspensionEpisode>,
        callback: impl RenderCallback,
    ) -> Self {
        Self {
            value,
            episode,
            callback: Box::new(callback),
        }
    }

    pub fn value(&self) -> &JdwpValue {
        &self.value
    }

    pub fn episode(&self) -> &Arc<SuspensionEpisode> {
        &self.episode
    }

    pub(crate) fn complete(self, result: EvalResult<Option<String>>) {
        let callback = self.callback;
        let outcome = catch_unwind(AssertUnwindSafe(move || match result {
            Ok(text) => callback.on_success(text),
            Err(err) => callback.on_failure(err),
        }));
        if let Err(panic) = outcome {
            tracing::error!(
                target = "nova.debugger",
                panic = %panic_payload_to_str(&*panic),
                "render callback panicked"
            );
        }
    }
}

/// The debuggee-side helper, once instantiated for this connection.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchHelper {
    pub class_id: ClassId,
    pub helper: ObjectRef,
    pub evaluate: MethodRef,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum BatchCapability {
    #[default]
    Unprobed,
    Capable(BatchHelper),
    Unsupported,
}

/// One decoded entry of a helper reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchItem {
    Text(String),
    Null,
    Error(String),
}

impl BatchItem {
    fn into_result(self, quote: bool) -> EvalResult<Option<String>> {
        match self {
            BatchItem::Text(text) if quote => Ok(Some(quote_java_string(&text))),
            BatchItem::Text(text) => Ok(Some(text)),
            BatchItem::Null => Ok(None),
            BatchItem::Error(description) => {
                let (exception_type, message) = match description.split_once(": ") {
                    Some((ty, message)) => (ty.to_owned(), Some(message.to_owned())),
                    None => (description, None),
                };
                Err(EvaluateError::TargetException {
                    exception_type,
                    message,
                })
            }
        }
    }
}

/// Decode a helper reply that must hold exactly `expected` entries.
pub fn decode_batch_reply(reply: &str, expected: usize) -> EvalResult<Vec<BatchItem>> {
    let malformed = EvaluateError::MalformedBatchReply;
    let mut chars = reply.chars();
    let mut items = Vec::with_capacity(expected);

    while let Some(tag) = chars.next() {
        if tag == 'N' {
            items.push(BatchItem::Null);
            continue;
        }
        if tag != 'S' && tag != 'E' {
            return Err(malformed(format!("unknown tag {tag:?} at entry {}", items.len())));
        }

        let mut len = String::new();
        loop {
            match chars.next() {
                Some(':') => break,
                Some(digit) if digit.is_ascii_digit() => len.push(digit),
                Some(other) => {
                    return Err(malformed(format!(
                        "unexpected {other:?} in length of entry {}",
                        items.len()
                    )))
                }
                None => return Err(malformed("truncated length".to_owned())),
            }
        }
        let len: usize = len
            .parse()
            .map_err(|_| malformed(format!("missing length at entry {}", items.len())))?;
        let payload: String = chars.by_ref().take(len).collect();
        if payload.chars().count() != len {
            return Err(malformed(format!("truncated payload at entry {}", items.len())));
        }
        items.push(if tag == 'S' {
            BatchItem::Text(payload)
        } else {
            BatchItem::Error(payload)
        });
    }

    if items.len() != expected {
        return Err(malformed(format!(
            "expected {expected} entries, got {}",
            items.len()
        )));
    }
    Ok(items)
}

/// Per-connection batching state, owned by [`ManagerContext`].
pub struct BatchEvaluator {
    enabled: bool,
    helper_class: String,
    capability: BatchCapability,
    pending: HashMap<EpisodeId, Vec<PendingTextRequest>>,
}

impl BatchEvaluator {
    pub(crate) fn new(config: &BatchConfig) -> Self {
        Self {
            enabled: config.enabled,
            helper_class: config.helper_class.clone(),
            capability: BatchCapability::Unprobed,
            pending: HashMap::new(),
        }
    }

    pub fn capability(&self) -> &BatchCapability {
        &self.capability
    }

    pub fn pending_count(&self, episode: EpisodeId) -> usize {
        self.pending.get(&episode).map_or(0, Vec::len)
    }

    /// Add `request` to its episode's batch, scheduling a drain for the first one.
    pub fn enqueue(ctx: &mut ManagerContext, request: PendingTextRequest) {
        let episode = request.episode.clone();
        if episode.is_resumed() {
            request.complete(Err(EvaluateError::EpisodeResumed(episode.id())));
            return;
        }
        if !ctx.is_attached() {
            request.complete(Err(EvaluateError::Disconnected));
            return;
        }

        let id = episode.id();
        let batch = ctx.batch.pending.entry(id).or_default();
        let first = batch.is_empty();
        batch.push(request);
        if first {
            ctx.queue()
                .submit_for_episode(&episode, move |ctx: &mut ManagerContext| {
                    BatchEvaluator::drain(ctx, id)
                });
        }
    }

    /// Whether the debuggee can render many values in one call.
    ///
    /// Probes once per connection. A probe that cannot run for lack of a
    /// suspended frame is not cached.
    pub fn has_capability(ctx: &mut ManagerContext, episode: &Arc<SuspensionEpisode>) -> bool {
        match ctx.batch.capability {
            BatchCapability::Capable(_) => return true,
            BatchCapability::Unsupported => return false,
            BatchCapability::Unprobed => {}
        }
        if !ctx.batch.enabled {
            return false;
        }

        let handle = EvaluationHandle::for_current_frame(episode).with_auto_load_classes(true);
        if handle.thread().is_none() {
            tracing::debug!(
                target = "nova.debugger",
                episode = %episode.id(),
                "no suspended frame to probe the batch helper on"
            );
            return false;
        }

        match Self::probe(ctx, &handle) {
            Ok(helper) => {
                tracing::debug!(
                    target = "nova.debugger",
                    class = %ctx.batch.helper_class,
                    helper = helper.helper.id,
                    "batch rendering helper available"
                );
                ctx.batch.capability = BatchCapability::Capable(helper);
                true
            }
            Err(err) if !helper_unavailable(&err) => {
                tracing::debug!(
                    target = "nova.debugger",
                    episode = %episode.id(),
                    error = %err,
                    "batch helper probe interrupted; will probe again"
                );
                false
            }
            Err(err) => {
                tracing::debug!(
                    target = "nova.debugger",
                    class = %ctx.batch.helper_class,
                    error = %err,
                    "batch rendering helper unavailable; rendering values individually"
                );
                ctx.batch.capability = BatchCapability::Unsupported;
                false
            }
        }
    }

    fn probe(ctx: &mut ManagerContext, handle: &EvaluationHandle) -> EvalResult<BatchHelper> {
        let class_name = ctx.batch.helper_class.clone();
        let thread = handle.thread().ok_or(EvaluateError::NoFrame)?;

        let loaded = ctx.client().classes_by_name(&class_name)?.first().copied();
        let class_id = match loaded {
            Some(id) => id,
            None => ctx
                .client()
                .load_class(thread, &class_name, handle.class_loader())?,
        };
        let constructor = ctx
            .client()
            .find_method(class_id, CONSTRUCTOR, CONSTRUCTOR_SIGNATURE)?
            .ok_or_else(|| EvaluateError::Other(format!("{class_name} has no no-arg constructor")))?;
        let evaluate = ctx
            .client()
            .find_method(class_id, HELPER_EVALUATE, HELPER_EVALUATE_SIGNATURE)?
            .ok_or_else(|| {
                EvaluateError::Other(format!("{class_name} has no `{HELPER_EVALUATE}` method"))
            })?;

        let helper = ctx.new_instance(handle, class_id, &constructor, &[])?;
        ctx.client().disable_collection(helper.id)?;
        Ok(BatchHelper {
            class_id,
            helper,
            evaluate,
        })
    }

    pub(crate) fn drain(ctx: &mut ManagerContext, id: EpisodeId) {
        let Some(requests) = ctx.batch.pending.remove(&id) else {
            return;
        };
        let Some(episode) = requests.first().map(|request| request.episode.clone()) else {
            return;
        };
        if episode.is_resumed() {
            for request in requests {
                request.complete(Err(EvaluateError::EpisodeResumed(id)));
            }
            return;
        }

        let mut remote = Vec::with_capacity(requests.len());
        for request in requests {
            match render_locally(&request.value) {
                Some(text) => request.complete(Ok(Some(text))),
                None => remote.push(request),
            }
        }
        if remote.is_empty() {
            return;
        }

        let handle = EvaluationHandle::for_current_frame(&episode);
        if remote.len() > 1 && Self::has_capability(ctx, &episode) {
            if let BatchCapability::Capable(helper) = ctx.batch.capability.clone() {
                let values: Vec<JdwpValue> =
                    remote.iter().map(|request| request.value.clone()).collect();
                match Self::evaluate_batch(ctx, &handle, &helper, &values) {
                    Ok(items) => {
                        tracing::trace!(
                            target = "nova.debugger",
                            episode = %id,
                            count = items.len(),
                            "rendered batch in one call"
                        );
                        for (request, item) in remote.into_iter().zip(items) {
                            let quote = request.value.is_string();
                            request.complete(item.into_result(quote));
                        }
                        return;
                    }
                    Err(err) => {
                        tracing::debug!(
                            target = "nova.debugger",
                            episode = %id,
                            count = remote.len(),
                            error = %err,
                            "batched rendering failed; falling back to individual requests"
                        );
                    }
                }
            }
        }

        for request in remote {
            let result = render_individually(ctx, &handle, &request.value);
            request.complete(result);
        }
    }

    fn evaluate_batch(
        ctx: &mut ManagerContext,
        handle: &EvaluationHandle,
        helper: &BatchHelper,
        values: &[JdwpValue],
    ) -> EvalResult<Vec<BatchItem>> {
        let array = ctx.client().new_array(JAVA_LANG_OBJECT, values)?;
        handle.episode().keep(ctx.client(), array.id)?;

        let reply = ctx.invoke_method(
            handle,
            &helper.helper,
            &helper.evaluate,
            &[JdwpValue::Object(array)],
        )?;
        let JdwpValue::Object(reply) = reply else {
            return Err(EvaluateError::MalformedBatchReply(format!(
                "helper returned {reply:?}"
            )));
        };
        let text = ctx.client().string_value(reply.id)?;
        decode_batch_reply(&text, values.len())
    }

    /// Fail every request still waiting on `episode`.
    pub(crate) fn fail_episode(&mut self, episode: EpisodeId, err: EvaluateError) {
        for request in self.pending.remove(&episode).unwrap_or_default() {
            request.complete(Err(err.clone()));
        }
    }

    /// Forget the connection: fail all pending requests and drop the cached
    /// helper, returning it so the caller can unpin it.
    pub(crate) fn reset(&mut self, err: EvaluateError) -> Option<ObjectRef> {
        for (_, requests) in std::mem::take(&mut self.pending) {
            for request in requests {
                request.complete(Err(err.clone()));
            }
        }
        match std::mem::take(&mut self.capability) {
            BatchCapability::Capable(helper) => Some(helper.helper),
            _ => None,
        }
    }
}

/// Whether a failed probe means the helper cannot be located or instantiated
/// on this connection, as opposed to the episode being unusable right now.
fn helper_unavailable(err: &EvaluateError) -> bool {
    match err {
        EvaluateError::Jdwp(JdwpError::ThreadNotSuspended(_)) => false,
        EvaluateError::Jdwp(_) | EvaluateError::TargetException { .. } | EvaluateError::Other(_) => {
            true
        }
        EvaluateError::Contract(_)
        | EvaluateError::NestedEvaluation(_)
        | EvaluateError::NoFrame
        | EvaluateError::EpisodeResumed(_)
        | EvaluateError::Disconnected
        | EvaluateError::Cancelled
        | EvaluateError::TimedOut(_)
        | EvaluateError::CommandPanicked
        | EvaluateError::MalformedBatchReply(_) => false,
    }
}
