use std::sync::{mpsc, Arc};
use std::time::Duration;

use nova_debug_eval::{
    BatchCapability, ContractViolation, EvalResult, EvaluateError, EvaluatingThreads,
    EvaluationHandle, ManagerContext,
};
use nova_jdwp::{JdwpValue, MockObject, SuspendPolicy};

use crate::harness::{debuggee, install_batch_helper, start, stop, token, MAIN_THREAD, WAIT};

#[test]
fn render_burst_then_resume() {
    let mock = debuggee();
    install_batch_helper(&mock);
    let this = mock.insert_object(MockObject::plain("com.example.Main", "Main@1"));
    mock.set_this_object(MAIN_THREAD, crate::harness::TOP_FRAME, JdwpValue::Object(this.clone()));
    let session = start(&mock);

    let episode = stop(&session, &mock, MAIN_THREAD, SuspendPolicy::EventThread);
    let handle = EvaluationHandle::for_current_frame(&episode);
    assert_eq!(handle.thread(), Some(MAIN_THREAD));

    // The handle holds the episode's evaluation rights while its thread runs
    // `hashCode()` on the receiver.
    let class = mock.define_class("com.example.Main");
    mock.define_method(class, "hashCode", "()I", |_vm, _this, _args| Ok(JdwpValue::Int(7)));
    let evaluator = Arc::new(
        |ctx: &mut ManagerContext, handle: &Arc<EvaluationHandle>| -> EvalResult<JdwpValue> {
            let JdwpValue::Object(receiver) = handle.compute_receiver(ctx)? else {
                return Err(EvaluateError::Other("no receiver".to_owned()));
            };
            let class = receiver_class(ctx, &receiver.runtime_type)?;
            let method = ctx
                .client()
                .find_method(class, "hashCode", "()I")?
                .ok_or_else(|| EvaluateError::Other("hashCode not found".to_owned()))?;
            ctx.invoke_method(handle, &receiver, &method, &[])
        },
    );
    assert_eq!(
        session.evaluate(&handle, evaluator, &token()),
        Ok(JdwpValue::Int(7))
    );
    assert_eq!(handle.assigned_thread(), None);

    // H1 holds T1 again while the render requests are raised; the batch
    // drains on the next manager-thread turn, after H1 lets go.
    let seven = mock.insert_object(MockObject::plain("com.example.Foo", "<rendered#7>"));
    let values = vec![
        JdwpValue::Object(mock.new_string("x")),
        JdwpValue::Object(seven),
        JdwpValue::Null,
    ];
    let (tx, rx) = mpsc::channel();
    let holder = handle.clone();
    let task_episode = episode.clone();
    let undrained = session
        .with_context(&token(), move |ctx| {
            let mut threads = EvaluatingThreads::default();
            holder.assign_evaluation_thread(&mut threads, MAIN_THREAD)?;
            for (index, value) in values.into_iter().enumerate() {
                let tx = tx.clone();
                ctx.render_as_text(&task_episode, value, move |result: EvalResult<Option<String>>| {
                    let _ = tx.send((index, result));
                });
            }
            let undrained = ctx.batch_capability().clone();
            holder.release_evaluation_thread(&mut threads)?;
            Ok(undrained)
        })
        .unwrap();
    assert_eq!(undrained, BatchCapability::Unprobed);

    let mut results = vec![None; 3];
    for _ in 0..3 {
        let (index, result) = rx.recv_timeout(WAIT).unwrap();
        results[index] = Some(result);
    }
    let results: Vec<_> = results.into_iter().flatten().collect();
    assert_eq!(
        results,
        vec![
            Ok(Some("\"x\"".to_owned())),
            Ok(Some("<rendered#7>".to_owned())),
            Ok(Some("null".to_owned())),
        ]
    );
    let capability = session
        .with_context(&token(), |ctx| Ok(ctx.batch_capability().clone()))
        .unwrap();
    assert!(matches!(capability, BatchCapability::Capable(_)));
    assert_eq!(mock.invoke_count("evaluate"), 1);
    assert_eq!(mock.invoke_count("toString"), 0);

    session.resume(&episode, &token()).unwrap();
    assert!(episode.is_resumed());
    assert!(!mock.is_thread_suspended(MAIN_THREAD));

    let derived = handle.derive_with_receiver(JdwpValue::Object(this));
    assert_eq!(
        session.compute_receiver(&derived, &token()),
        Err(EvaluateError::EpisodeResumed(episode.id()))
    );
    let rejected = session.with_context(&token(), move |ctx| derived.compute_receiver(ctx));
    assert_eq!(
        rejected,
        Err(EvaluateError::Contract(ContractViolation::EpisodeResumed(
            episode.id()
        )))
    );
    assert!(session.shutdown(Duration::from_secs(5)));
}

fn receiver_class(ctx: &mut ManagerContext, name: &str) -> EvalResult<u64> {
    ctx.client()
        .classes_by_name(name)?
        .first()
        .copied()
        .ok_or_else(|| EvaluateError::Other(format!("{name} not loaded")))
}
