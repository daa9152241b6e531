use std::collections::BTreeSet;
use std::fmt;

use nova_jdwp::{FrameId, JdwpClient, ObjectId, SuspendPolicy, ThreadId};
use parking_lot::Mutex;

use crate::error::{ContractViolation, EvalResult, EvaluateError};
use crate::handle::EvaluationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EpisodeId(u64);

impl EpisodeId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameRef {
    pub thread: ThreadId,
    pub frame: FrameId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeState {
    /// Threads are halted and no evaluation is running.
    Active,
    /// `holder` has exclusive evaluation rights.
    Evaluating { holder: EvaluationId },
    /// Terminal. Object handles obtained during the episode are invalid.
    Resumed,
}

#[derive(Debug)]
struct EpisodeInner {
    state: EpisodeState,
    current: Option<FrameRef>,
    kept: BTreeSet<ObjectId>,
}

/// One interval during which target threads are halted and inspectable.
///
/// State transitions only happen on the manager thread; the lock exists so
/// other threads can observe the state (for example to reject work early).
#[derive(Debug)]
pub struct SuspensionEpisode {
    id: EpisodeId,
    policy: SuspendPolicy,
    threads: BTreeSet<ThreadId>,
    inner: Mutex<EpisodeInner>,
}

impl SuspensionEpisode {
    pub fn new(
        id: EpisodeId,
        policy: SuspendPolicy,
        threads: impl IntoIterator<Item = ThreadId>,
        current: Option<FrameRef>,
    ) -> Self {
        Self {
            id,
            policy,
            threads: threads.into_iter().collect(),
            inner: Mutex::new(EpisodeInner {
                state: EpisodeState::Active,
                current,
                kept: BTreeSet::new(),
            }),
        }
    }

    pub fn id(&self) -> EpisodeId {
        self.id
    }

    pub fn policy(&self) -> SuspendPolicy {
        self.policy
    }

    pub fn threads(&self) -> &BTreeSet<ThreadId> {
        &self.threads
    }

    pub fn is_halted(&self, thread: ThreadId) -> bool {
        self.policy == SuspendPolicy::All || self.threads.contains(&thread)
    }

    pub fn state(&self) -> EpisodeState {
        self.inner.lock().state
    }

    pub fn is_resumed(&self) -> bool {
        self.state() == EpisodeState::Resumed
    }

    pub fn current_frame(&self) -> Option<FrameRef> {
        self.inner.lock().current
    }

    pub fn set_current_frame(&self, frame: Option<FrameRef>) {
        self.inner.lock().current = frame;
    }

    /// `Active` -> `Evaluating`.
    pub fn begin_evaluation(&self, holder: EvaluationId) -> Result<(), ContractViolation> {
        let mut inner = self.inner.lock();
        match inner.state {
            EpisodeState::Active => {
                inner.state = EpisodeState::Evaluating { holder };
                Ok(())
            }
            EpisodeState::Evaluating { holder: current } => {
                Err(ContractViolation::AlreadyEvaluating {
                    episode: self.id,
                    holder: current,
                })
            }
            EpisodeState::Resumed => Err(ContractViolation::EpisodeResumed(self.id)),
        }
    }

    /// `Evaluating` -> `Active`; only the current holder may end it.
    pub fn end_evaluation(&self, holder: EvaluationId) -> Result<(), ContractViolation> {
        let mut inner = self.inner.lock();
        match inner.state {
            EpisodeState::Evaluating { holder: current } if current == holder => {
                inner.state = EpisodeState::Active;
                Ok(())
            }
            EpisodeState::Resumed => Err(ContractViolation::EpisodeResumed(self.id)),
            _ => Err(ContractViolation::NotEvaluationHolder {
                episode: self.id,
                caller: holder,
            }),
        }
    }

    /// Pin `object` in the target for the rest of the episode.
    pub fn keep(&self, client: &mut dyn JdwpClient, object: ObjectId) -> EvalResult<()> {
        {
            let inner = self.inner.lock();
            if inner.state == EpisodeState::Resumed {
                return Err(EvaluateError::EpisodeResumed(self.id));
            }
            if inner.kept.contains(&object) {
                return Ok(());
            }
        }
        client.disable_collection(object)?;
        self.inner.lock().kept.insert(object);
        Ok(())
    }

    pub fn is_kept(&self, object: ObjectId) -> bool {
        self.inner.lock().kept.contains(&object)
    }

    pub fn kept_objects(&self) -> Vec<ObjectId> {
        self.inner.lock().kept.iter().copied().collect()
    }

    /// `Active` -> `Resumed`, handing back the objects to release.
    ///
    /// Refused while an evaluation holds the episode.
    pub(crate) fn try_mark_resumed(&self) -> Result<Vec<ObjectId>, ContractViolation> {
        let mut inner = self.inner.lock();
        match inner.state {
            EpisodeState::Active => {
                inner.state = EpisodeState::Resumed;
                inner.current = None;
                Ok(std::mem::take(&mut inner.kept).into_iter().collect())
            }
            EpisodeState::Evaluating { holder } => Err(ContractViolation::AlreadyEvaluating {
                episode: self.id,
                holder,
            }),
            EpisodeState::Resumed => Err(ContractViolation::EpisodeResumed(self.id)),
        }
    }

    /// Force the terminal state after the connection went away.
    pub(crate) fn invalidate(&self) -> Vec<ObjectId> {
        let mut inner = self.inner.lock();
        inner.state = EpisodeState::Resumed;
        inner.current = None;
        std::mem::take(&mut inner.kept).into_iter().collect()
    }
}
