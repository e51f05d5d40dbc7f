use assert_matches::assert_matches;
use std::time::{Duration, SystemTime};
use temporal_loom::{
    local::{LocalEngine, LocalWfContext},
    HostError, ReceiveChannel, WorkflowEngine, WorkflowError,
};
use test_utils::LocalWfStarter;

const HOUR: Duration = Duration::from_secs(3600);

async fn sleep_an_hour(
    engine: LocalEngine,
    ctx: LocalWfContext,
    _: (),
) -> Result<u64, WorkflowError> {
    let before = engine.now(&ctx);
    engine.sleep(&ctx, HOUR).await?;
    let slept = engine
        .now(&ctx)
        .duration_since(before)
        .map_err(anyhow::Error::from)?;
    Ok(slept.as_secs())
}

#[tokio::test]
async fn sleep_moves_virtual_clock() {
    let starter = LocalWfStarter::new("sleep_moves_virtual_clock");
    starter.register_wf(sleep_an_hour);
    let mut run = starter.start(&());
    assert_eq!(run.result_as::<u64>().await.unwrap(), 3600);
    assert_eq!(run.elapsed(), HOUR);
    assert_eq!(run.now(), SystemTime::UNIX_EPOCH + HOUR);
}

#[tokio::test]
async fn advance_fires_due_timers_only() {
    let starter = LocalWfStarter::new("advance_fires_due_timers_only");
    starter.register_wf(sleep_an_hour);
    let mut run = starter.start(&());
    run.advance(Duration::from_secs(1800)).await;
    assert!(!run.is_done());
    assert_eq!(run.elapsed(), Duration::from_secs(1800));
    run.advance(Duration::from_secs(1800)).await;
    assert!(run.is_done());
    assert_eq!(run.result_as::<u64>().await.unwrap(), 3600);
}

#[tokio::test]
async fn zero_sleep_returns_at_once() {
    let starter = LocalWfStarter::new("zero_sleep_returns_at_once");
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        engine.sleep(&ctx, Duration::ZERO).await
    });
    let mut run = starter.start(&());
    run.run_until_done().await.unwrap();
    assert_eq!(run.elapsed(), Duration::ZERO);
}

#[tokio::test]
async fn cancel_interrupts_sleep() {
    let starter = LocalWfStarter::new("cancel_interrupts_sleep");
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let err = engine.sleep(&ctx, HOUR).await.unwrap_err();
        Ok::<_, WorkflowError>(err.is_cancelled())
    });
    let mut run = starter.start(&());
    run.cancel_after(Duration::from_secs(10));
    assert!(run.result_as::<bool>().await.unwrap());
    assert_eq!(run.elapsed(), Duration::from_secs(10));
}

#[tokio::test]
async fn sleep_on_canceled_child_context_fails_fast() {
    let starter = LocalWfStarter::new("sleep_on_canceled_child_context_fails_fast");
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let (cctx, handle) = engine.with_cancel(&ctx);
        handle.cancel();
        let child_err = engine.sleep(&cctx, HOUR).await.unwrap_err();
        // The parent context is unaffected
        engine.sleep(&ctx, Duration::from_secs(5)).await?;
        Ok::<_, WorkflowError>(child_err.is_cancelled())
    });
    let mut run = starter.start(&());
    assert!(run.result_as::<bool>().await.unwrap());
    assert_eq!(run.elapsed(), Duration::from_secs(5));
}

#[tokio::test]
async fn execution_timeout_ends_run() {
    let starter = LocalWfStarter::new("execution_timeout_ends_run");
    starter.register_wf(sleep_an_hour);
    let mut run = starter.start_with(Some(Duration::from_secs(30)), &());
    assert_matches!(
        run.run_until_done().await,
        Err(HostError::WorkflowTimedOut { workflow_id }) if workflow_id == "execution_timeout_ends_run"
    );
    assert_eq!(run.elapsed(), Duration::from_secs(30));
}

#[tokio::test]
async fn blocked_workflow_without_timers_deadlocks() {
    let starter = LocalWfStarter::new("blocked_workflow_without_timers_deadlocks");
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let sig = engine.get_signal_channel(&ctx, "never");
        sig.receive(&ctx, &mut ()).await?;
        Ok::<_, WorkflowError>(())
    });
    let mut run = starter.start(&());
    assert_matches!(run.run_until_done().await, Err(HostError::Deadlock(_)));
    assert!(!run.is_done());
}
