use std::time::Duration;

use nova_debug_eval::{
    BatchCapability, ContractViolation, EvalResult, EvaluateError, EvaluationId,
};
use nova_jdwp::{JdwpError, JdwpValue, MockCall, MockObject, SuspendPolicy};

use crate::harness::{
    debuggee, install_batch_helper, object, render_all, start, stop, token, MAIN_THREAD,
    WORKER_THREAD,
};

fn new_array_lengths(calls: &[MockCall]) -> Vec<usize> {
    calls
        .iter()
        .filter_map(|call| match call {
            MockCall::NewArray { len, .. } => Some(*len),
            _ => None,
        })
        .collect()
}

fn failing_object(mock: &nova_jdwp::MockJdwpClient) -> JdwpValue {
    JdwpValue::Object(mock.insert_object(
        MockObject::plain("com.example.Broken", "unused")
            .with_to_string(Err("java.lang.IllegalStateException".to_owned())),
    ))
}

#[test]
fn capable_debuggee_renders_a_burst_in_one_call() {
    let mock = debuggee();
    install_batch_helper(&mock);
    let session = start(&mock);
    let episode = stop(&session, &mock, MAIN_THREAD, SuspendPolicy::EventThread);

    let values = vec![
        JdwpValue::Object(mock.new_string("hi")),
        object(&mock, "Point(1, 2)"),
        JdwpValue::Int(3),
        failing_object(&mock),
        JdwpValue::Object(mock.insert_object(
            MockObject::plain("com.example.Empty", "").with_to_string(Ok(None)),
        )),
    ];
    let results = render_all(&session, &episode, values);

    assert_eq!(
        results,
        vec![
            Ok(Some("\"hi\"".to_owned())),
            Ok(Some("Point(1, 2)".to_owned())),
            Ok(Some("3".to_owned())),
            Err(EvaluateError::TargetException {
                exception_type: "java.lang.IllegalStateException".to_owned(),
                message: None,
            }),
            Ok(None),
        ]
    );
    assert_eq!(mock.invoke_count("evaluate"), 1);
    assert_eq!(mock.invoke_count("toString"), 0);
    assert_eq!(new_array_lengths(&mock.calls()), vec![4]);
    assert!(session.shutdown(Duration::from_secs(5)));
}

#[test]
fn without_helper_each_value_gets_its_own_round_trip() {
    let mock = debuggee();
    let session = start(&mock);
    let episode = stop(&session, &mock, MAIN_THREAD, SuspendPolicy::EventThread);

    let values = vec![
        object(&mock, "a"),
        object(&mock, "b"),
        object(&mock, "c"),
    ];
    let results = render_all(&session, &episode, values);

    assert_eq!(
        results,
        vec![
            Ok(Some("a".to_owned())),
            Ok(Some("b".to_owned())),
            Ok(Some("c".to_owned())),
        ]
    );
    assert_eq!(mock.invoke_count("toString"), 3);
    assert_eq!(mock.invoke_count("evaluate"), 0);
    let capability = session
        .with_context(&token(), |ctx| Ok(ctx.batch_capability().clone()))
        .unwrap();
    assert_eq!(capability, BatchCapability::Unsupported);

    // The negative probe is remembered for the connection.
    let again = render_all(&session, &episode, vec![object(&mock, "d"), object(&mock, "e")]);
    assert_eq!(again.len(), 2);
    let load_attempts = mock
        .calls()
        .iter()
        .filter(|call| matches!(call, MockCall::LoadClass(_)))
        .count();
    assert_eq!(load_attempts, 1);
    assert!(session.shutdown(Duration::from_secs(5)));
}

#[test]
fn busy_episode_does_not_disable_batching() {
    let mock = debuggee();
    install_batch_helper(&mock);
    let session = start(&mock);
    let episode = stop(&session, &mock, MAIN_THREAD, SuspendPolicy::EventThread);

    // Someone else holds the episode's evaluation rights while the burst drains.
    let holder = EvaluationId::from_raw(9999);
    episode.begin_evaluation(holder).unwrap();
    let blocked = render_all(&session, &episode, vec![object(&mock, "a"), object(&mock, "b")]);
    assert_eq!(blocked.len(), 2);
    assert!(blocked.iter().all(|result| matches!(
        result,
        Err(EvaluateError::Contract(ContractViolation::AlreadyEvaluating { .. }))
    )));
    let capability = session
        .with_context(&token(), |ctx| Ok(ctx.batch_capability().clone()))
        .unwrap();
    assert_eq!(capability, BatchCapability::Unprobed);
    episode.end_evaluation(holder).unwrap();

    let results = render_all(
        &session,
        &episode,
        vec![object(&mock, "c"), object(&mock, "d"), object(&mock, "e")],
    );
    assert_eq!(
        results,
        vec![
            Ok(Some("c".to_owned())),
            Ok(Some("d".to_owned())),
            Ok(Some("e".to_owned())),
        ]
    );
    assert_eq!(mock.invoke_count("evaluate"), 1);
    assert_eq!(mock.invoke_count("toString"), 0);
    assert!(session.shutdown(Duration::from_secs(5)));
}

#[test]
fn failed_batch_call_falls_back_to_individual_renders() {
    let mock = debuggee();
    install_batch_helper(&mock);
    let session = start(&mock);
    let episode = stop(&session, &mock, MAIN_THREAD, SuspendPolicy::EventThread);
    mock.fail_next("evaluate", JdwpError::Other("helper crashed".to_owned()));

    let values = vec![
        object(&mock, "one"),
        failing_object(&mock),
        object(&mock, "three"),
    ];
    let results = render_all(&session, &episode, values);

    assert_eq!(
        results,
        vec![
            Ok(Some("one".to_owned())),
            Err(EvaluateError::TargetException {
                exception_type: "java.lang.IllegalStateException".to_owned(),
                message: None,
            }),
            Ok(Some("three".to_owned())),
        ]
    );
    assert_eq!(mock.invoke_count("evaluate"), 1);
    assert_eq!(mock.invoke_count("toString"), 3);
    assert!(session.shutdown(Duration::from_secs(5)));
}

#[test]
fn malformed_reply_falls_back_without_dropping_requests() {
    let mock = debuggee();
    install_batch_helper(&mock);
    let session = start(&mock);
    let episode = stop(&session, &mock, MAIN_THREAD, SuspendPolicy::EventThread);

    // Replace the helper's reply with one entry too few.
    mock.with_vm(|vm| {
        let class = vm.define_class(&nova_debug_eval::DebugEvalConfig::default().batch.helper_class);
        vm.define_method(
            class,
            nova_debug_eval::HELPER_EVALUATE,
            nova_debug_eval::HELPER_EVALUATE_SIGNATURE,
            |vm, _this, _args| Ok(JdwpValue::Object(vm.new_string("S1:x"))),
        );
        vm.define_method(class, "<init>", "()V", |_vm, _this, _args| Ok(JdwpValue::Void));
    });

    let results = render_all(&session, &episode, vec![object(&mock, "p"), object(&mock, "q")]);
    assert_eq!(
        results,
        vec![Ok(Some("p".to_owned())), Ok(Some("q".to_owned()))]
    );
    assert_eq!(mock.invoke_count("evaluate"), 1);
    assert_eq!(mock.invoke_count("toString"), 2);
    assert!(session.shutdown(Duration::from_secs(5)));
}

#[test]
fn single_request_skips_the_helper() {
    let mock = debuggee();
    install_batch_helper(&mock);
    let session = start(&mock);
    let episode = stop(&session, &mock, MAIN_THREAD, SuspendPolicy::EventThread);

    let results = render_all(&session, &episode, vec![object(&mock, "alone")]);
    assert_eq!(results, vec![Ok(Some("alone".to_owned()))]);
    assert_eq!(mock.invoke_count("evaluate"), 0);
    assert_eq!(mock.invoke_count("toString"), 1);
    assert!(session.shutdown(Duration::from_secs(5)));
}

#[test]
fn batches_never_mix_episodes() {
    let mock = debuggee();
    install_batch_helper(&mock);
    let session = start(&mock);
    let first = stop(&session, &mock, MAIN_THREAD, SuspendPolicy::EventThread);
    let second = stop(&session, &mock, WORKER_THREAD, SuspendPolicy::EventThread);

    // Interleave both episodes' requests within one manager-thread turn.
    let requests = vec![
        (first.clone(), object(&mock, "a1")),
        (second.clone(), object(&mock, "b1")),
        (first.clone(), object(&mock, "a2")),
        (second.clone(), object(&mock, "b2")),
        (second.clone(), object(&mock, "b3")),
    ];
    let (tx, rx) = std::sync::mpsc::channel();
    session
        .with_context(&token(), move |ctx| {
            for (index, (episode, value)) in requests.into_iter().enumerate() {
                let tx = tx.clone();
                ctx.render_as_text(&episode, value, move |result: EvalResult<Option<String>>| {
                    let _ = tx.send((index, result));
                });
            }
            Ok(())
        })
        .unwrap();

    let mut results = vec![None; 5];
    for _ in 0..5 {
        let (index, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        results[index] = Some(result);
    }
    let texts: Vec<_> = results
        .into_iter()
        .map(|result| result.unwrap().unwrap().unwrap())
        .collect();
    assert_eq!(texts, vec!["a1", "b1", "a2", "b2", "b3"]);

    assert_eq!(mock.invoke_count("evaluate"), 2);
    assert_eq!(new_array_lengths(&mock.calls()), vec![2, 3]);
    let helper_threads: Vec<_> = mock
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            MockCall::InvokeMethod { thread, method, .. } if method == "evaluate" => Some(thread),
            _ => None,
        })
        .collect();
    assert_eq!(helper_threads, vec![MAIN_THREAD, WORKER_THREAD]);
    assert!(session.shutdown(Duration::from_secs(5)));
}

#[test]
fn resuming_fails_requests_still_waiting_for_their_batch() {
    let mock = debuggee();
    install_batch_helper(&mock);
    let session = start(&mock);
    let episode = stop(&session, &mock, MAIN_THREAD, SuspendPolicy::EventThread);

    let (tx, rx) = std::sync::mpsc::channel();
    let task_episode = episode.clone();
    let value = object(&mock, "late");
    session
        .with_context(&token(), move |ctx| {
            ctx.render_as_text(&task_episode, value, move |result: EvalResult<Option<String>>| {
                let _ = tx.send(result);
            });
            ctx.resume(&task_episode)
        })
        .unwrap();

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        Err(EvaluateError::EpisodeResumed(episode.id()))
    );
    assert_eq!(mock.invoke_count("toString"), 0);
    assert!(session.shutdown(Duration::from_secs(5)));
}
