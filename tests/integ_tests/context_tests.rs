use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};
use temporal_loom::{
    host::NativeContext,
    local::{LocalEngine, LocalWfContext},
    telemetry::Level,
    ActivityOptions, Context, KeyValLogger, SendChannel, WorkflowEngine, WorkflowError,
};
use test_utils::{LocalWfStarter, RecordingLogger, NAMESPACE, TEST_Q};

#[tokio::test]
async fn info_and_clock_describe_the_run() {
    let starter = LocalWfStarter::new("info_and_clock_describe_the_run");
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let info = engine.get_info(&ctx);
        assert_eq!(info.workflow_execution.workflow_id, "info_and_clock_describe_the_run");
        assert_eq!(info.workflow_type, "info_and_clock_describe_the_run");
        assert_eq!(info.task_queue, TEST_Q);
        assert_eq!(info.attempt, 1);
        assert!(info.parent.is_none());
        assert_eq!(info.start_time, SystemTime::UNIX_EPOCH);
        assert_eq!(engine.now(&ctx), SystemTime::UNIX_EPOCH);
        Ok::<_, WorkflowError>(info.workflow_execution.run_id)
    });
    let mut run = starter.start(&());
    let run_id = run.result_as::<String>().await.unwrap();
    assert_eq!(run_id, run.execution().run_id);
}

#[tokio::test]
async fn derived_activity_options_are_independent() {
    let starter = LocalWfStarter::new("derived_activity_options_are_independent");
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let base = engine.with_activity_options(
            &ctx,
            &ActivityOptions {
                task_queue: Some("base".to_string()),
                ..Default::default()
            },
        );
        let a = engine.with_activity_options(
            &base,
            &ActivityOptions {
                start_to_close_timeout: Some(Duration::from_secs(1)),
                ..Default::default()
            },
        );
        let b = engine.with_activity_options(
            &base,
            &ActivityOptions {
                schedule_to_close_timeout: Some(Duration::from_secs(5)),
                ..Default::default()
            },
        );
        let opts = |c: &LocalWfContext| c.native().activity_options().clone();
        assert_eq!(opts(&base).start_to_close_timeout, None);
        assert_eq!(opts(&a).start_to_close_timeout, Some(Duration::from_secs(1)));
        assert_eq!(opts(&a).schedule_to_close_timeout, None);
        assert_eq!(opts(&b).start_to_close_timeout, None);
        assert_eq!(opts(&b).schedule_to_close_timeout, Some(Duration::from_secs(5)));
        assert_eq!(opts(&a).task_queue.as_deref(), Some("base"));
        assert_eq!(opts(&b).task_queue.as_deref(), Some("base"));
        assert_eq!(opts(&ctx).task_queue, None);
        Ok::<_, WorkflowError>(())
    });
    let mut run = starter.start(&());
    run.run_until_done().await.unwrap();
}

#[tokio::test]
async fn values_are_visible_to_derived_contexts() {
    let starter = LocalWfStarter::new("values_are_visible_to_derived_contexts");
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let tagged = engine.with_value(&ctx, "tenant", "acme".to_string());
        let (derived, _handle) = engine.with_cancel(&tagged);
        let derived = engine.with_activity_options(&derived, &ActivityOptions::default());
        let seen = derived.value_as::<String>("tenant").map(|v| v.to_string());
        let wrong_type = derived.value_as::<u32>("tenant").is_some();
        Ok::<_, WorkflowError>((seen, wrong_type, ctx.value("tenant").is_none()))
    });
    let mut run = starter.start(&());
    assert_eq!(
        run.result_as::<(Option<String>, bool, bool)>()
            .await
            .unwrap(),
        (Some("acme".to_string()), false, true)
    );
}

#[tokio::test]
async fn logger_enrichment_leaves_base_untouched() {
    let starter = LocalWfStarter::new("logger_enrichment_leaves_base_untouched");
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let logger = engine.get_logger(&ctx);
        let enriched = logger.with_field("step", "one");
        assert_eq!(logger.fields().get("step"), None);
        assert_eq!(enriched.fields().get("step"), Some("one"));
        assert_eq!(
            logger.fields().get("workflow_id"),
            Some("logger_enrichment_leaves_base_untouched")
        );
        assert_eq!(logger.fields().get("namespace"), Some(NAMESPACE));
        assert_eq!(logger.level(), Level::Debug);
        enriched.info("step finished", &[("items", &3)]);
        Ok::<_, WorkflowError>(())
    });
    let mut run = starter.start(&());
    run.run_until_done().await.unwrap();
}

/// Workflow helper that only knows about the logging capability it is handed
fn report_progress(logger: &impl KeyValLogger, done: usize, total: usize) {
    if done == total {
        logger.info("all items processed", &[("total", &total)]);
    } else {
        logger.debug("items processed", &[("done", &done), ("total", &total)]);
    }
}

#[test]
fn injected_logger_receives_calls() {
    let logger = RecordingLogger::new();
    report_progress(&logger, 1, 2);
    report_progress(&logger, 2, 2);
    let records = logger.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].level, Level::Debug);
    assert_eq!(
        records[0].keyvals,
        vec![
            ("done".to_string(), "1".to_string()),
            ("total".to_string(), "2".to_string())
        ]
    );
    assert_eq!(records[1].level, Level::Info);
    assert_eq!(records[1].msg, "all items processed");
}

#[tokio::test]
#[should_panic(expected = "invalid context")]
async fn foreign_context_is_refused() {
    let stash: Arc<Mutex<Option<LocalWfContext>>> = Arc::new(Mutex::new(None));

    let donor = LocalWfStarter::new("donor");
    let keep = stash.clone();
    donor.register_wf(move |_: LocalEngine, ctx: LocalWfContext, _: ()| {
        let keep = keep.clone();
        async move {
            *keep.lock() = Some(ctx);
            Ok::<_, WorkflowError>(())
        }
    });
    let mut donor_run = donor.start(&());
    donor_run.run_until_done().await.unwrap();

    let receiver = LocalWfStarter::new("receiver");
    let take = stash.clone();
    receiver.register_wf(move |engine: LocalEngine, ctx: LocalWfContext, _: ()| {
        let take = take.clone();
        async move {
            let foreign = take.lock().take().expect("donor ran first");
            let chan = engine.new_buffered_channel(&ctx, "mine", 1);
            chan.send(&foreign, &1u32).await
        }
    });
    let mut run = receiver.start(&());
    let _ = run.run_until_done().await;
}
