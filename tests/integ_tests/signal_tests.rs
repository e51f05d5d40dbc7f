use assert_matches::assert_matches;
use temporal_loom::{
    local::{LocalEngine, LocalWfContext},
    HostError, ReceiveChannel, WorkflowEngine, WorkflowError,
};
use test_utils::LocalWfStarter;

#[tokio::test]
async fn signal_is_observed_once_across_handles() {
    let starter = LocalWfStarter::new("signal_is_observed_once_across_handles");
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let a = engine.get_signal_channel(&ctx, "poke");
        let b = engine.get_signal_channel(&ctx, "poke");
        let mut v = 0u32;
        a.receive(&ctx, &mut v).await?;
        let mut other = 0u32;
        let seen_twice = b.receive_async(&mut other)?;
        Ok::<_, WorkflowError>((v, seen_twice))
    });
    let mut run = starter.start(&());
    run.run_until_blocked().await;
    assert!(!run.is_done());
    run.signal("poke", &5u32).unwrap();
    assert_eq!(
        run.result_as::<(u32, bool)>().await.unwrap(),
        (5, false)
    );
}

#[tokio::test]
async fn early_signals_are_buffered_in_order() {
    let starter = LocalWfStarter::new("early_signals_are_buffered_in_order");
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let sig = engine.get_signal_channel(&ctx, "items");
        let mut got = vec![];
        let mut v = String::new();
        while got.len() < 3 && sig.receive(&ctx, &mut v).await? {
            got.push(v.clone());
        }
        Ok::<_, WorkflowError>(got)
    });
    let mut run = starter.start(&());
    for item in ["a", "b", "c"] {
        run.signal("items", item).unwrap();
    }
    assert_eq!(
        run.result_as::<Vec<String>>().await.unwrap(),
        vec!["a", "b", "c"]
    );
}

#[tokio::test]
async fn signals_of_other_names_stay_queued() {
    let starter = LocalWfStarter::new("signals_of_other_names_stay_queued");
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let wanted = engine.get_signal_channel(&ctx, "wanted");
        let ignored = engine.get_signal_channel(&ctx, "ignored");
        let mut v = 0u32;
        wanted.receive(&ctx, &mut v).await?;
        Ok::<_, WorkflowError>((v, ignored.len()))
    });
    let mut run = starter.start(&());
    run.signal("ignored", &1u32).unwrap();
    run.signal("ignored", &2u32).unwrap();
    run.signal("wanted", &3u32).unwrap();
    assert_eq!(run.result_as::<(u32, usize)>().await.unwrap(), (3, 2));
}

#[tokio::test]
async fn signal_after_completion_is_refused() {
    let starter = LocalWfStarter::new("signal_after_completion_is_refused");
    starter.register_wf(|_: LocalEngine, _: LocalWfContext, _: ()| async move {
        Ok::<_, WorkflowError>(())
    });
    let mut run = starter.start(&());
    run.run_until_done().await.unwrap();
    assert_matches!(
        run.signal("late", &1u32),
        Err(HostError::WorkflowCompleted { .. })
    );
}
