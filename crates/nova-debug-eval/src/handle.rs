use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nova_jdwp::{JdwpClient, JdwpValue, ObjectId, ThreadId};
use parking_lot::Mutex;

use crate::context::ManagerContext;
use crate::error::{ContractViolation, EvalResult, EvaluateError};
use crate::lazy::LazyResult;
use crate::suspend::{FrameRef, SuspensionEpisode};

static NEXT_EVALUATION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EvaluationId(u64);

impl EvaluationId {
    fn next() -> Self {
        Self(NEXT_EVALUATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for EvaluationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "H{}", self.0)
    }
}

/// The implicit `this` of an evaluation, computed on the manager thread.
pub type Receiver = LazyResult<ManagerContext, JdwpValue>;

/// Target threads that currently run an evaluation, per connection.
#[derive(Debug, Default)]
pub struct EvaluatingThreads {
    threads: BTreeSet<ThreadId>,
}

impl EvaluatingThreads {
    pub fn contains(&self, thread: ThreadId) -> bool {
        self.threads.contains(&thread)
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.threads.clear();
    }
}

/// A scoped context for one evaluation against a suspended thread/frame.
///
/// Handles are shared as `Arc`s. Derived copies share the episode, frame and
/// flags but get their own identity and assignment slot.
pub struct EvaluationHandle {
    id: EvaluationId,
    episode: Arc<SuspensionEpisode>,
    frame: Option<FrameRef>,
    receiver: Arc<Receiver>,
    auto_load_classes: bool,
    class_loader: Option<ObjectId>,
    assigned: Mutex<Option<ThreadId>>,
}

impl fmt::Debug for EvaluationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluationHandle")
            .field("id", &self.id)
            .field("episode", &self.episode.id())
            .field("frame", &self.frame)
            .field("auto_load_classes", &self.auto_load_classes)
            .field("class_loader", &self.class_loader)
            .field("assigned", &*self.assigned.lock())
            .finish()
    }
}

impl EvaluationHandle {
    pub fn new(episode: Arc<SuspensionEpisode>, frame: Option<FrameRef>) -> Arc<Self> {
        let receiver = match frame {
            Some(frame) => Receiver::new(move |ctx: &mut ManagerContext| {
                Ok(ctx.client().this_object(frame.thread, frame.frame)?)
            }),
            None => Receiver::failed(EvaluateError::NoFrame),
        };
        Arc::new(Self {
            id: EvaluationId::next(),
            episode,
            frame,
            receiver: Arc::new(receiver),
            auto_load_classes: false,
            class_loader: None,
            assigned: Mutex::new(None),
        })
    }

    /// A handle bound to the episode's current thread/frame, if it has one.
    pub fn for_current_frame(episode: &Arc<SuspensionEpisode>) -> Arc<Self> {
        Self::new(episode.clone(), episode.current_frame())
    }

    pub fn id(&self) -> EvaluationId {
        self.id
    }

    pub fn episode(&self) -> &Arc<SuspensionEpisode> {
        &self.episode
    }

    pub fn frame(&self) -> Option<FrameRef> {
        self.frame
    }

    pub fn thread(&self) -> Option<ThreadId> {
        self.frame.map(|frame| frame.thread)
    }

    pub fn auto_load_classes(&self) -> bool {
        self.auto_load_classes
    }

    pub fn class_loader(&self) -> Option<ObjectId> {
        self.class_loader
    }

    pub fn assigned_thread(&self) -> Option<ThreadId> {
        *self.assigned.lock()
    }

    fn derive(&self, receiver: Arc<Receiver>) -> Self {
        Self {
            id: EvaluationId::next(),
            episode: self.episode.clone(),
            frame: self.frame,
            receiver,
            auto_load_classes: self.auto_load_classes,
            class_loader: self.class_loader,
            assigned: Mutex::new(None),
        }
    }

    /// The implicit receiver, computed at most once.
    ///
    /// A failed computation is cached and reported again on every call.
    pub fn compute_receiver(&self, ctx: &mut ManagerContext) -> EvalResult<JdwpValue> {
        self.ensure_active()?;
        self.receiver.get(ctx)
    }

    pub fn derive_with_receiver(&self, value: JdwpValue) -> Arc<Self> {
        Arc::new(self.derive(Arc::new(Receiver::ready(value))))
    }

    pub fn with_auto_load_classes(self: &Arc<Self>, auto_load_classes: bool) -> Arc<Self> {
        if self.auto_load_classes == auto_load_classes {
            return self.clone();
        }
        let mut copy = self.derive(self.receiver.clone());
        copy.auto_load_classes = auto_load_classes;
        Arc::new(copy)
    }

    /// Load missing classes through `class_loader` instead of the frame's loader.
    pub fn with_class_loader(self: &Arc<Self>, class_loader: Option<ObjectId>) -> Arc<Self> {
        if self.class_loader == class_loader {
            return self.clone();
        }
        let mut copy = self.derive(self.receiver.clone());
        copy.class_loader = class_loader;
        Arc::new(copy)
    }

    /// Mark `thread` as running this handle's evaluation and take the
    /// episode's evaluation rights.
    pub fn assign_evaluation_thread(
        &self,
        threads: &mut EvaluatingThreads,
        thread: ThreadId,
    ) -> Result<(), ContractViolation> {
        let mut assigned = self.assigned.lock();
        if assigned.is_some() {
            return Err(ContractViolation::HandleAlreadyAssigned(self.id));
        }
        if threads.contains(thread) {
            return Err(ContractViolation::ThreadAlreadyEvaluating(thread));
        }
        self.episode.begin_evaluation(self.id)?;
        threads.threads.insert(thread);
        *assigned = Some(thread);
        Ok(())
    }

    pub fn release_evaluation_thread(
        &self,
        threads: &mut EvaluatingThreads,
    ) -> Result<(), ContractViolation> {
        let mut assigned = self.assigned.lock();
        let Some(thread) = *assigned else {
            return Err(ContractViolation::HandleNotAssigned(self.id));
        };
        if self.episode.is_resumed() {
            // The connection was torn down underneath the evaluation.
            threads.threads.remove(&thread);
            *assigned = None;
            return Ok(());
        }
        if !threads.contains(thread) {
            return Err(ContractViolation::ThreadNotEvaluating(thread));
        }
        self.episode.end_evaluation(self.id)?;
        threads.threads.remove(&thread);
        *assigned = None;
        Ok(())
    }

    /// Pin an object value for the lifetime of the episode. Primitives and
    /// `null` need no pinning.
    pub fn keep_alive(&self, client: &mut dyn JdwpClient, value: &JdwpValue) -> EvalResult<()> {
        match value.object_id() {
            Some(id) => self.episode.keep(client, id),
            None => Ok(()),
        }
    }

    pub(crate) fn ensure_active(&self) -> EvalResult<()> {
        if self.episode.is_resumed() {
            return Err(ContractViolation::EpisodeResumed(self.episode.id()).into());
        }
        Ok(())
    }
}

/// The "evaluate in context" operation supplied by the expression compiler.
///
/// Runs on the manager thread with exclusive access to the connection.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(
        &self,
        ctx: &mut ManagerContext,
        handle: &Arc<EvaluationHandle>,
    ) -> EvalResult<JdwpValue>;
}

impl<F> ExpressionEvaluator for F
where
    F: Fn(&mut ManagerContext, &Arc<EvaluationHandle>) -> EvalResult<JdwpValue> + Send + Sync,
{
    fn evaluate(
        &self,
        ctx: &mut ManagerContext,
        handle: &Arc<EvaluationHandle>,
    ) -> EvalResult<JdwpValue> {
        self(ctx, handle)
    }
}
