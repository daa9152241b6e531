use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nova_jdwp::JdwpClient;
use parking_lot::{Condvar, Mutex};

use crate::command::{cancel_command, CancelReason, DebuggerCommand};
use crate::config::{CrossThreadConfig, DebugEvalConfig};
use crate::context::ManagerContext;
use crate::panic_util::panic_payload_to_str;
use crate::suspend::{EpisodeId, SuspensionEpisode};

struct Queued {
    command: Box<dyn DebuggerCommand>,
    episode: Option<Arc<SuspensionEpisode>>,
}

#[derive(Default)]
struct QueueState {
    commands: VecDeque<Queued>,
    closed: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    available: Condvar,
    manager: OnceLock<thread::ThreadId>,
    cross_thread: CrossThreadConfig,
}

/// FIFO of work for the manager thread.
///
/// Cloning yields another handle onto the same queue. Cancellation hooks
/// always run outside the queue lock so they may submit further work.
#[derive(Clone)]
pub struct CommandQueue {
    shared: Arc<QueueShared>,
}

impl CommandQueue {
    pub fn new(cross_thread: CrossThreadConfig) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState::default()),
                available: Condvar::new(),
                manager: OnceLock::new(),
                cross_thread,
            }),
        }
    }

    pub fn cross_thread_config(&self) -> &CrossThreadConfig {
        &self.shared.cross_thread
    }

    pub fn submit(&self, command: impl DebuggerCommand) {
        self.push(Box::new(command), None);
    }

    /// Like [`CommandQueue::submit`], but the command is cancelled instead of
    /// run if `episode` resumes before the command is dequeued.
    pub fn submit_for_episode(
        &self,
        episode: &Arc<SuspensionEpisode>,
        command: impl DebuggerCommand,
    ) {
        if episode.is_resumed() {
            cancel_command(Box::new(command), CancelReason::EpisodeResumed(episode.id()));
            return;
        }
        self.push(Box::new(command), Some(episode.clone()));
    }

    fn push(&self, command: Box<dyn DebuggerCommand>, episode: Option<Arc<SuspensionEpisode>>) {
        let mut state = self.shared.state.lock();
        if state.closed {
            drop(state);
            cancel_command(command, CancelReason::QueueClosed);
            return;
        }
        state.commands.push_back(Queued { command, episode });
        drop(state);
        self.shared.available.notify_one();
    }

    /// Whether the caller is running on this queue's manager thread.
    pub fn is_manager_thread(&self) -> bool {
        self.shared.manager.get() == Some(&thread::current().id())
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().commands.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Remove every queued command bound to `episode`.
    pub(crate) fn purge_episode(&self, episode: EpisodeId, reason: CancelReason) -> usize {
        self.purge(|bound| bound.id() == episode, reason)
    }

    /// Remove every queued command bound to any episode.
    pub(crate) fn purge_all_episodes(&self, reason: CancelReason) -> usize {
        self.purge(|_| true, reason)
    }

    fn purge(&self, matches: impl Fn(&SuspensionEpisode) -> bool, reason: CancelReason) -> usize {
        let removed = {
            let mut state = self.shared.state.lock();
            let (removed, kept): (Vec<Queued>, Vec<Queued>) = std::mem::take(&mut state.commands)
                .into_iter()
                .partition(|queued| queued.episode.as_deref().is_some_and(&matches));
            state.commands = kept.into();
            removed
        };
        let count = removed.len();
        for queued in removed {
            cancel_command(queued.command, reason);
        }
        count
    }

    /// Stop accepting work and cancel everything still queued.
    pub fn close(&self) {
        let drained: Vec<Queued> = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.commands.drain(..).collect()
        };
        self.shared.available.notify_all();
        for queued in drained {
            cancel_command(queued.command, CancelReason::QueueClosed);
        }
    }

    fn bind_to_current_thread(&self) {
        let _ = self.shared.manager.set(thread::current().id());
    }

    fn next(&self) -> Option<Queued> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(queued) = state.commands.pop_front() {
                return Some(queued);
            }
            if state.closed {
                return None;
            }
            self.shared.available.wait(&mut state);
        }
    }
}

#[derive(Default)]
struct Finished {
    done: Mutex<bool>,
    signal: Condvar,
}

impl Finished {
    fn wait(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock();
        if !*done {
            let _ = self
                .signal
                .wait_while_for(&mut done, |done| !*done, timeout);
        }
        *done
    }
}

/// Marks the thread finished even if the loop unwinds.
struct FinishOnDrop(Arc<Finished>);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        *self.0.done.lock() = true;
        self.0.signal.notify_all();
    }
}

/// The dedicated thread that owns the debuggee connection and runs queued
/// commands one at a time.
pub struct DebuggerManagerThread {
    queue: CommandQueue,
    handle: Mutex<Option<JoinHandle<()>>>,
    finished: Arc<Finished>,
}

impl DebuggerManagerThread {
    pub fn start(client: Box<dyn JdwpClient>, config: DebugEvalConfig) -> std::io::Result<Self> {
        let queue = CommandQueue::new(config.cross_thread.clone());
        let finished = Arc::new(Finished::default());

        let thread_queue = queue.clone();
        let thread_finished = finished.clone();
        let handle = thread::Builder::new()
            .name(config.manager.thread_name.clone())
            .spawn(move || {
                let _finish = FinishOnDrop(thread_finished);
                thread_queue.bind_to_current_thread();
                let mut ctx = ManagerContext::new(client, thread_queue.clone(), config);
                run_loop(&thread_queue, &mut ctx);
                ctx.detach();
                tracing::debug!(target = "nova.debugger", "manager thread stopped");
            })?;

        Ok(Self {
            queue,
            handle: Mutex::new(Some(handle)),
            finished,
        })
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Close the queue, cancel queued work and wait up to `timeout` for the
    /// thread to detach and exit. Returns whether it did.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.queue.close();
        if !self.finished.wait(timeout) {
            tracing::warn!(
                target = "nova.debugger",
                ?timeout,
                "manager thread did not stop in time"
            );
            return false;
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        true
    }
}

impl Drop for DebuggerManagerThread {
    fn drop(&mut self) {
        self.queue.close();
    }
}

fn run_loop(queue: &CommandQueue, ctx: &mut ManagerContext) {
    while let Some(Queued { command, episode }) = queue.next() {
        if let Some(episode) = episode.filter(|episode| episode.is_resumed()) {
            cancel_command(command, CancelReason::EpisodeResumed(episode.id()));
            continue;
        }

        let name = command.name().to_owned();
        tracing::trace!(target = "nova.debugger", command = %name, "running command");
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| command.run(ctx))) {
            tracing::error!(
                target = "nova.debugger",
                command = %name,
                panic = %panic_payload_to_str(&*panic),
                "debugger command panicked"
            );
        }
        ctx.check_connection();
    }
}
