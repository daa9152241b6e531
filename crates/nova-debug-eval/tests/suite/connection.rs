use std::sync::mpsc;
use std::time::Duration;

use nova_debug_eval::{
    BatchCapability, EvalResult, EvaluateError, EvaluationHandle, ManagerContext,
};
use nova_jdwp::{JdwpClient as _, JdwpValue, MockCall, SuspendPolicy};

use crate::harness::{
    debuggee, install_batch_helper, object, render_all, start, stop, token, MAIN_THREAD, WAIT,
};

fn capability(session: &nova_debug_eval::DebuggerSession) -> BatchCapability {
    session
        .with_context(&token(), |ctx| Ok(ctx.batch_capability().clone()))
        .unwrap()
}

#[test]
fn vm_death_invalidates_episodes_and_pending_work() {
    let mock = debuggee();
    install_batch_helper(&mock);
    let session = start(&mock);
    let episode = stop(&session, &mock, MAIN_THREAD, SuspendPolicy::EventThread);
    let kept = object(&mock, "kept");
    let handle = EvaluationHandle::for_current_frame(&episode);
    session.keep_alive(&handle, kept, &token()).unwrap();

    // A render is waiting for its batch when the VM goes away.
    let (tx, rx) = mpsc::channel();
    let task_episode = episode.clone();
    let value = object(&mock, "pending");
    let dying = mock.clone();
    session
        .with_context(&token(), move |ctx| {
            ctx.render_as_text(&task_episode, value, move |result: EvalResult<Option<String>>| {
                let _ = tx.send(result);
            });
            dying.disconnect();
            ctx.process_events().map(|_| ())
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Err(EvaluateError::Disconnected));
    assert!(episode.is_resumed());
    assert_eq!(
        session.compute_receiver(&handle, &token()),
        Err(EvaluateError::EpisodeResumed(episode.id()))
    );
    assert!(matches!(
        session.pause(&token()),
        Err(EvaluateError::Disconnected)
    ));
    assert!(session.shutdown(Duration::from_secs(5)));
}

#[test]
fn lost_connection_is_noticed_after_a_command() {
    let mock = debuggee();
    let session = start(&mock);
    let episode = stop(&session, &mock, MAIN_THREAD, SuspendPolicy::EventThread);

    mock.disconnect();
    // Any command lets the manager thread observe the dead channel.
    session.with_context(&token(), |_ctx| Ok(())).unwrap();

    let attached = session
        .with_context(&token(), |ctx| Ok(ctx.is_attached()))
        .unwrap();
    assert!(!attached);
    assert!(episode.is_resumed());
    assert!(session.shutdown(Duration::from_secs(5)));
}

#[test]
fn reattaching_reprobes_the_batch_helper() {
    let mock = debuggee();
    install_batch_helper(&mock);
    let session = start(&mock);
    let episode = stop(&session, &mock, MAIN_THREAD, SuspendPolicy::EventThread);

    let first = render_all(&session, &episode, vec![object(&mock, "a"), object(&mock, "b")]);
    assert_eq!(first.len(), 2);
    let helper = match capability(&session) {
        BatchCapability::Capable(helper) => helper.helper.id,
        other => panic!("expected a capable helper, got {other:?}"),
    };
    assert!(mock.is_collection_disabled(helper));

    session.detach(&token()).unwrap();
    assert_eq!(capability(&session), BatchCapability::Unprobed);
    assert!(episode.is_resumed());

    let fresh = debuggee();
    install_batch_helper(&fresh);
    session.attach(Box::new(fresh.clone()), &token()).unwrap();
    let episode = stop(&session, &fresh, MAIN_THREAD, SuspendPolicy::EventThread);

    let second = render_all(&session, &episode, vec![object(&fresh, "c"), object(&fresh, "d")]);
    assert_eq!(
        second,
        vec![Ok(Some("c".to_owned())), Ok(Some("d".to_owned()))]
    );
    assert!(matches!(capability(&session), BatchCapability::Capable(_)));
    let loads = fresh
        .calls()
        .iter()
        .filter(|call| matches!(call, MockCall::LoadClass(_)))
        .count();
    assert_eq!(loads, 1);
    assert_eq!(fresh.invoke_count("evaluate"), 1);
    assert!(session.shutdown(Duration::from_secs(5)));
}

#[test]
fn shutdown_detaches_and_unblocks_everything() {
    let mock = debuggee();
    let session = start(&mock);
    let episode = stop(&session, &mock, MAIN_THREAD, SuspendPolicy::EventThread);

    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    session.queue().submit(move |_ctx: &mut ManagerContext| {
        let _ = gate_rx.recv_timeout(WAIT);
    });
    let (tx, rx) = mpsc::channel();
    session.render_as_text(&episode, JdwpValue::Null, move |result: EvalResult<Option<String>>| {
        let _ = tx.send(result);
    });

    let closer = {
        let session = session.clone();
        std::thread::spawn(move || session.shutdown(Duration::from_secs(5)))
    };
    while !session.queue().is_closed() {
        std::thread::sleep(Duration::from_millis(1));
    }
    let _ = gate_tx.send(());
    assert!(closer.join().unwrap());

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Err(EvaluateError::Disconnected));
    assert!(episode.is_resumed());
    assert!(!mock.is_connected());
}
