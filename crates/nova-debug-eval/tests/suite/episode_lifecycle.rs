use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use nova_debug_eval::{
    CancelReason, DebuggerCommand, EpisodeState, EvaluateError, EvaluationHandle, ManagerContext,
};
use nova_jdwp::{JdwpValue, MockCall, SuspendPolicy};

use crate::harness::{debuggee, object, start, stop, token, MAIN_THREAD, WAIT, WORKER_THREAD};

struct RecordCancel {
    ran: Arc<AtomicBool>,
    cancelled: mpsc::Sender<CancelReason>,
}

impl DebuggerCommand for RecordCancel {
    fn run(self: Box<Self>, _ctx: &mut ManagerContext) {
        self.ran.store(true, Ordering::SeqCst);
    }

    fn cancelled(self: Box<Self>, reason: CancelReason) {
        let _ = self.cancelled.send(reason);
    }
}

#[test]
fn pause_opens_a_vm_wide_episode_and_resume_releases_it() {
    let mock = debuggee();
    let session = start(&mock);

    let episode = session.pause(&token()).unwrap();
    assert_eq!(episode.policy(), SuspendPolicy::All);
    assert!(episode.is_halted(MAIN_THREAD));
    assert!(episode.is_halted(WORKER_THREAD));
    assert_eq!(episode.current_frame(), None);
    assert!(mock.is_thread_suspended(WORKER_THREAD));

    session.resume(&episode, &token()).unwrap();
    assert_eq!(episode.state(), EpisodeState::Resumed);
    assert!(!mock.is_thread_suspended(WORKER_THREAD));
    assert!(mock.calls().contains(&MockCall::VmResume));

    // An episode resumes once.
    assert!(session.resume(&episode, &token()).is_err());
    assert!(session.shutdown(Duration::from_secs(5)));
}

#[test]
fn event_thread_episode_resumes_only_its_thread() {
    let mock = debuggee();
    let session = start(&mock);
    let main = stop(&session, &mock, MAIN_THREAD, SuspendPolicy::EventThread);
    let worker = stop(&session, &mock, WORKER_THREAD, SuspendPolicy::EventThread);

    session.resume(&main, &token()).unwrap();
    assert!(!mock.is_thread_suspended(MAIN_THREAD));
    assert!(mock.is_thread_suspended(WORKER_THREAD));
    assert!(!mock.calls().contains(&MockCall::VmResume));

    let still_open = session
        .with_context(&token(), move |ctx| {
            Ok(ctx
                .active_episodes()
                .iter()
                .map(|episode| episode.id())
                .collect::<Vec<_>>())
        })
        .unwrap();
    assert_eq!(still_open, vec![worker.id()]);
    assert!(session.shutdown(Duration::from_secs(5)));
}

#[test]
fn resume_purges_commands_bound_to_the_episode() {
    let mock = debuggee();
    let session = start(&mock);
    let episode = stop(&session, &mock, MAIN_THREAD, SuspendPolicy::EventThread);

    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let gate_episode = episode.clone();
    session.queue().submit(move |ctx: &mut ManagerContext| {
        let _ = gate_rx.recv_timeout(WAIT);
        let _ = ctx.resume(&gate_episode);
    });

    let ran = Arc::new(AtomicBool::new(false));
    let (cancel_tx, cancel_rx) = mpsc::channel();
    session.queue().submit_for_episode(
        &episode,
        RecordCancel {
            ran: ran.clone(),
            cancelled: cancel_tx,
        },
    );
    gate_tx.send(()).unwrap();

    assert_eq!(
        cancel_rx.recv_timeout(WAIT).unwrap(),
        CancelReason::EpisodeResumed(episode.id())
    );
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(session.queue().pending(), 0);

    // Work bound to an already resumed episode never reaches the queue.
    let (late_tx, late_rx) = mpsc::channel();
    session.queue().submit_for_episode(
        &episode,
        RecordCancel {
            ran: ran.clone(),
            cancelled: late_tx,
        },
    );
    assert_eq!(
        late_rx.try_recv().unwrap(),
        CancelReason::EpisodeResumed(episode.id())
    );
    assert!(session.shutdown(Duration::from_secs(5)));
}

#[test]
fn kept_objects_survive_until_resume() {
    let mock = debuggee();
    let session = start(&mock);
    let episode = stop(&session, &mock, MAIN_THREAD, SuspendPolicy::EventThread);
    let handle = EvaluationHandle::for_current_frame(&episode);

    let value = object(&mock, "kept");
    let id = value.object_id().unwrap();
    session.keep_alive(&handle, value.clone(), &token()).unwrap();
    // Keeping twice pins once.
    session.keep_alive(&handle, value, &token()).unwrap();
    session
        .keep_alive(&handle, JdwpValue::Long(1), &token())
        .unwrap();

    assert!(episode.is_kept(id));
    assert!(!mock.collect_object(id));

    session.resume(&episode, &token()).unwrap();
    assert!(!mock.is_collection_disabled(id));
    assert!(mock.collect_object(id));

    assert_eq!(
        session.keep_alive(&handle, JdwpValue::Null, &token()),
        Err(EvaluateError::EpisodeResumed(episode.id()))
    );
    assert!(session.shutdown(Duration::from_secs(5)));
}

#[test]
fn evaluation_rights_are_exclusive_per_episode() {
    let mock = debuggee();
    let session = start(&mock);
    let episode = stop(&session, &mock, MAIN_THREAD, SuspendPolicy::EventThread);

    let outcome = session
        .with_context(&token(), move |_ctx| {
            let first = EvaluationHandle::for_current_frame(&episode);
            let second = EvaluationHandle::for_current_frame(&episode);
            let mut threads = nova_debug_eval::EvaluatingThreads::default();

            first.assign_evaluation_thread(&mut threads, MAIN_THREAD)?;
            let blocked = second.assign_evaluation_thread(&mut threads, WORKER_THREAD);
            first.release_evaluation_thread(&mut threads)?;
            let after_release = second.assign_evaluation_thread(&mut threads, WORKER_THREAD);
            second.release_evaluation_thread(&mut threads)?;
            Ok((blocked.is_err(), after_release.is_ok()))
        })
        .unwrap();
    assert_eq!(outcome, (true, true));
    assert!(session.shutdown(Duration::from_secs(5)));
}
