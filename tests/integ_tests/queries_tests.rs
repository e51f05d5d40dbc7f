use assert_matches::assert_matches;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use temporal_loom::{
    local::{LocalEngine, LocalWfContext},
    AsJsonPayloadExt, FromJsonPayloadExt, HostError, ReceiveChannel, WorkflowEngine,
    WorkflowError,
};
use test_utils::LocalWfStarter;

async fn counter_wf(engine: LocalEngine, ctx: LocalWfContext, _: ()) -> Result<u32, WorkflowError> {
    let total = Arc::new(AtomicU32::new(0));
    let reader = total.clone();
    engine.set_query_handler(&ctx, "count", move |_: ()| {
        Ok(reader.load(Ordering::SeqCst))
    })?;
    engine.set_query_handler(&ctx, "echo", |s: String| Ok(format!("echo: {}", s)))?;
    engine.set_query_handler(&ctx, "fails", |_: ()| -> anyhow::Result<u32> {
        Err(anyhow::anyhow!("no state yet"))
    })?;

    let sig = engine.get_signal_channel(&ctx, "add");
    let mut v = 0u32;
    while sig.receive(&ctx, &mut v).await? {
        if v == 0 {
            break;
        }
        total.fetch_add(v, Ordering::SeqCst);
    }
    Ok(total.load(Ordering::SeqCst))
}

#[tokio::test]
async fn query_reads_live_workflow_state() {
    let starter = LocalWfStarter::new("query_reads_live_workflow_state");
    starter.register_wf(counter_wf);
    let mut run = starter.start(&());
    run.run_until_blocked().await;
    let count = |run: &temporal_loom::local::LocalRun| {
        u32::from_json_payload(&run.query("count", &[]).unwrap()).unwrap()
    };
    assert_eq!(count(&run), 0);

    run.signal("add", &3u32).unwrap();
    run.run_until_blocked().await;
    assert_eq!(count(&run), 3);

    let echoed = run
        .query("echo", &["hi".as_json_payload().unwrap()])
        .unwrap();
    assert_eq!(String::from_json_payload(&echoed).unwrap(), "echo: hi");

    run.signal("add", &0u32).unwrap();
    assert_eq!(run.result_as::<u32>().await.unwrap(), 3);
}

#[tokio::test]
async fn failing_and_unknown_queries_are_errors() {
    let starter = LocalWfStarter::new("failing_and_unknown_queries_are_errors");
    starter.register_wf(counter_wf);
    let mut run = starter.start(&());
    run.run_until_blocked().await;

    assert_matches!(
        run.query("fails", &[]),
        Err(HostError::QueryFailed(msg)) if msg.contains("no state yet")
    );
    assert_matches!(
        run.query("missing", &[]),
        Err(HostError::UnknownQuery { query_type, known })
            if query_type == "missing" && known == "[count,echo,fails]"
    );
    // Arguments that do not decode into the handler's input type
    assert_matches!(
        run.query("echo", &[42u32.as_json_payload().unwrap()]),
        Err(HostError::Decode(_))
    );
}

#[tokio::test]
async fn reserved_query_types_are_rejected() {
    let starter = LocalWfStarter::new("reserved_query_types_are_rejected");
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let reserved = engine
            .set_query_handler(&ctx, "__stack_trace", |_: ()| Ok(1u8))
            .err()
            .map(|e| e.to_string());
        let empty = engine.set_query_handler(&ctx, "", |_: ()| Ok(1u8)).is_err();
        Ok::<_, WorkflowError>((reserved, empty))
    });
    let mut run = starter.start(&());
    let (reserved, empty) = run
        .result_as::<(Option<String>, bool)>()
        .await
        .unwrap();
    let reserved = reserved.unwrap();
    assert!(reserved.starts_with("set query handler: "), "{}", reserved);
    assert!(reserved.contains("__stack_trace"), "{}", reserved);
    assert!(empty);
}

#[tokio::test]
async fn registering_again_replaces_handler() {
    let starter = LocalWfStarter::new("registering_again_replaces_handler");
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        engine.set_query_handler(&ctx, "version", |_: ()| Ok(1u32))?;
        engine.set_query_handler(&ctx, "version", |_: ()| Ok(2u32))?;
        let sig = engine.get_signal_channel(&ctx, "finish");
        sig.receive(&ctx, &mut ()).await?;
        Ok::<_, WorkflowError>(())
    });
    let mut run = starter.start(&());
    run.run_until_blocked().await;
    let version = run.query("version", &[]).unwrap();
    assert_eq!(u32::from_json_payload(&version).unwrap(), 2);
    run.signal("finish", &()).unwrap();
    run.run_until_done().await.unwrap();
}
