use assert_matches::assert_matches;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use temporal_loom::{
    local::{LocalEngine, LocalWfContext},
    ActivityOptions, AsJsonPayloadExt, ConversionError, HostError, RetryPolicy, TimeoutKind,
    WfFuture, WorkflowEngine, WorkflowError,
};
use test_utils::{
    activity_opts, counting_activity, echo_activity, failing_activity, fast_retry_policy,
    flaky_activity, slow_activity, LocalWfStarter,
};

/// Written against the abstract engine only, so it runs unchanged on any host
async fn greet<E: WorkflowEngine>(
    engine: E,
    ctx: E::Context,
    name: String,
) -> Result<String, WorkflowError> {
    let ctx = engine.with_activity_options(&ctx, &activity_opts());
    let greeting = format!("hello {}", name).as_json_payload()?;
    engine
        .execute_activity(&ctx, "echo", vec![greeting])
        .get(&ctx)
        .await
}

#[tokio::test]
async fn activity_result_reaches_workflow() {
    let starter = LocalWfStarter::new("activity_result_reaches_workflow");
    starter.register_activity("echo", echo_activity());
    starter.register_wf(greet::<LocalEngine>);
    let mut run = starter.start("loom");
    assert_eq!(run.result_as::<String>().await.unwrap(), "hello loom");
}

#[tokio::test]
async fn future_get_is_repeatable() {
    let starter = LocalWfStarter::new("future_get_is_repeatable");
    starter.register_activity("echo", echo_activity());
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let ctx = engine.with_activity_options(&ctx, &activity_opts());
        let fut = engine.execute_activity(&ctx, "echo", vec![7u32.as_json_payload()?]);
        let ready_before = fut.is_ready();
        let first: u32 = fut.get(&ctx).await?;
        let second: u32 = fut.get(&ctx).await?;
        Ok::<_, WorkflowError>((ready_before, fut.is_ready(), first, second))
    });
    let mut run = starter.start(&());
    assert_eq!(
        run.result_as::<(bool, bool, u32, u32)>().await.unwrap(),
        (false, true, 7, 7)
    );
}

#[tokio::test]
async fn retries_until_success() {
    let starter = LocalWfStarter::new("retries_until_success");
    let calls = Arc::new(AtomicUsize::new(0));
    starter.register_activity("flaky", flaky_activity(2, calls.clone()));
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let ctx = engine.with_activity_options(&ctx, &activity_opts());
        engine
            .execute_activity(&ctx, "flaky", vec![])
            .get::<u32>(&ctx)
            .await
    });
    let mut run = starter.start(&());
    assert_eq!(run.result_as::<u32>().await.unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // One second of backoff before each of the two retries
    assert_eq!(run.elapsed(), Duration::from_secs(2));
}

#[tokio::test]
async fn retries_stop_at_maximum_attempts() {
    let starter = LocalWfStarter::new("retries_stop_at_maximum_attempts");
    let calls = Arc::new(AtomicUsize::new(0));
    starter.register_activity("fails", failing_activity("Transient", calls.clone()));
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let opts = ActivityOptions {
            start_to_close_timeout: Some(Duration::from_secs(5)),
            retry_policy: Some(fast_retry_policy(3)),
            ..Default::default()
        };
        let ctx = engine.with_activity_options(&ctx, &opts);
        let err = engine
            .execute_activity(&ctx, "fails", vec![])
            .get::<()>(&ctx)
            .await
            .unwrap_err();
        Ok::<_, WorkflowError>(err.to_string())
    });
    let mut run = starter.start(&());
    let msg = run.result_as::<String>().await.unwrap();
    assert!(msg.contains("always fails"), "{}", msg);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn backoff_past_schedule_to_close_fails_the_activity() {
    let starter = LocalWfStarter::new("backoff_past_schedule_to_close_fails_the_activity");
    let calls = Arc::new(AtomicUsize::new(0));
    starter.register_activity("fails", failing_activity("Transient", calls.clone()));
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        engine.sleep(&ctx, Duration::from_secs(1)).await?;
        let opts = ActivityOptions {
            start_to_close_timeout: Some(Duration::from_secs(5)),
            schedule_to_close_timeout: Some(Duration::from_secs(3600)),
            retry_policy: Some(RetryPolicy {
                initial_interval: Duration::MAX,
                ..Default::default()
            }),
            ..Default::default()
        };
        let ctx = engine.with_activity_options(&ctx, &opts);
        let err = engine
            .execute_activity(&ctx, "fails", vec![])
            .get::<()>(&ctx)
            .await
            .unwrap_err();
        Ok::<_, WorkflowError>(matches!(
            err.host_error(),
            Some(HostError::ActivityTimeout {
                kind: TimeoutKind::ScheduleToClose,
                ..
            })
        ))
    });
    let mut run = starter.start(&());
    assert!(run.result_as::<bool>().await.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(run.elapsed(), Duration::from_secs(1));
}

#[tokio::test]
async fn non_retryable_error_types_stop_retries() {
    let starter = LocalWfStarter::new("non_retryable_error_types_stop_retries");
    let calls = Arc::new(AtomicUsize::new(0));
    starter.register_activity("fails", failing_activity("BadInput", calls.clone()));
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let mut retry_policy = fast_retry_policy(5);
        retry_policy.non_retryable_error_types = vec!["BadInput".to_string()];
        let opts = ActivityOptions {
            start_to_close_timeout: Some(Duration::from_secs(5)),
            retry_policy: Some(retry_policy),
            ..Default::default()
        };
        let ctx = engine.with_activity_options(&ctx, &opts);
        let err = engine
            .execute_activity(&ctx, "fails", vec![])
            .get::<()>(&ctx)
            .await
            .unwrap_err();
        Ok::<_, WorkflowError>(matches!(
            err.host_error(),
            Some(HostError::ActivityFailed { error_type: Some(t), .. }) if t == "BadInput"
        ))
    });
    let mut run = starter.start(&());
    assert!(run.result_as::<bool>().await.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(run.elapsed(), Duration::ZERO);
}

#[tokio::test]
async fn canceled_context_never_invokes_activity() {
    let starter = LocalWfStarter::new("canceled_context_never_invokes_activity");
    let calls = Arc::new(AtomicUsize::new(0));
    starter.register_activity("count", counting_activity(calls.clone()));
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let (cctx, handle) = engine.with_cancel(&ctx);
        handle.cancel();
        let cctx = engine.with_activity_options(&cctx, &activity_opts());
        let res = engine
            .execute_activity(&cctx, "count", vec![])
            .get::<usize>(&ctx)
            .await;
        Ok::<_, WorkflowError>(res.unwrap_err().is_cancelled())
    });
    let mut run = starter.start(&());
    assert!(run.result_as::<bool>().await.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn activity_without_timeouts_fails() {
    let starter = LocalWfStarter::new("activity_without_timeouts_fails");
    let calls = Arc::new(AtomicUsize::new(0));
    starter.register_activity("count", counting_activity(calls.clone()));
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let err = engine
            .execute_activity(&ctx, "count", vec![])
            .get::<usize>(&ctx)
            .await
            .unwrap_err();
        Ok::<_, WorkflowError>(matches!(
            err.host_error(),
            Some(HostError::InvalidActivityOptions(_))
        ))
    });
    let mut run = starter.start(&());
    assert!(run.result_as::<bool>().await.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_retry_policy_is_a_ready_conversion_error() {
    let starter = LocalWfStarter::new("invalid_retry_policy_is_a_ready_conversion_error");
    let calls = Arc::new(AtomicUsize::new(0));
    starter.register_activity("count", counting_activity(calls.clone()));
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let opts = ActivityOptions {
            start_to_close_timeout: Some(Duration::from_secs(1)),
            retry_policy: Some(RetryPolicy {
                backoff_coefficient: 0.5,
                ..Default::default()
            }),
            ..Default::default()
        };
        let ctx = engine.with_activity_options(&ctx, &opts);
        let fut = engine.execute_activity(&ctx, "count", vec![]);
        assert!(fut.is_ready());
        let err = fut.get::<usize>(&ctx).await.unwrap_err();
        Ok::<_, WorkflowError>(matches!(
            err,
            WorkflowError::Conversion(ConversionError::InvalidRetryPolicy(_))
        ))
    });
    let mut run = starter.start(&());
    assert!(run.result_as::<bool>().await.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn start_to_close_timeout_fails_the_attempt() {
    let starter = LocalWfStarter::new("start_to_close_timeout_fails_the_attempt");
    starter.register_activity("slow", slow_activity(Duration::from_millis(500)));
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let opts = ActivityOptions {
            start_to_close_timeout: Some(Duration::from_millis(20)),
            retry_policy: Some(fast_retry_policy(1)),
            ..Default::default()
        };
        let ctx = engine.with_activity_options(&ctx, &opts);
        let err = engine
            .execute_activity(&ctx, "slow", vec![])
            .get::<String>(&ctx)
            .await
            .unwrap_err();
        Ok::<_, WorkflowError>(matches!(
            err.host_error(),
            Some(HostError::ActivityTimeout {
                kind: TimeoutKind::StartToClose,
                ..
            })
        ))
    });
    let mut run = starter.start(&());
    assert!(run.result_as::<bool>().await.unwrap());
}

#[tokio::test]
async fn unregistered_activity_fails_without_retries() {
    let starter = LocalWfStarter::new("unregistered_activity_fails_without_retries");
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let ctx = engine.with_activity_options(&ctx, &activity_opts());
        engine
            .execute_activity(&ctx, "missing", vec![])
            .get::<()>(&ctx)
            .await
    });
    let mut run = starter.start(&());
    assert_matches!(
        run.run_until_done().await,
        Err(HostError::WorkflowFailed(msg)) if msg.contains("not registered")
    );
    assert_eq!(run.elapsed(), Duration::ZERO);
}
