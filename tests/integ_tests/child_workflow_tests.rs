use serde::de::IgnoredAny;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use temporal_loom::{
    local::{LocalEngine, LocalWfContext},
    ChildWfFuture, ChildWorkflowOptions, ConversionError, HostError, NamedWorkflow, Payload,
    ReceiveChannel, WfFuture, WorkflowDescriptor, WorkflowEngine, WorkflowError,
    WorkflowExecution,
};
use test_utils::{fast_retry_policy, LocalWfStarter};

/// Always hands out the same workflow id
struct FixedId(&'static str);

impl WorkflowDescriptor for FixedId {
    fn name(&self) -> &str {
        "sleepy"
    }

    fn description(&self) -> &str {
        "sleeps for an hour"
    }

    fn generate_workflow_id(&self, _params: &Payload) -> Result<String, ConversionError> {
        Ok(self.0.to_string())
    }
}

async fn double(
    engine: LocalEngine,
    ctx: LocalWfContext,
    x: u32,
) -> Result<(u32, Option<String>), WorkflowError> {
    let parent = engine.get_info(&ctx).parent.map(|p| p.workflow_id);
    Ok((x * 2, parent))
}

async fn sleepy(engine: LocalEngine, ctx: LocalWfContext, _: ()) -> Result<(), WorkflowError> {
    engine.sleep(&ctx, Duration::from_secs(3600)).await
}

async fn listener(engine: LocalEngine, ctx: LocalWfContext, _: ()) -> Result<u32, WorkflowError> {
    let sig = engine.get_signal_channel(&ctx, "go");
    let mut v = 0u32;
    sig.receive(&ctx, &mut v).await?;
    Ok(v + 1)
}

async fn always_fails(_: LocalEngine, _: LocalWfContext, _: ()) -> Result<(), WorkflowError> {
    Err(anyhow::anyhow!("boom").into())
}

#[tokio::test]
async fn child_result_and_execution_reach_parent() {
    let starter = LocalWfStarter::new("child_result_and_execution_reach_parent");
    starter.host().register_workflow("double", double);
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, x: u32| async move {
        let child = engine.execute_child_workflow(
            &ctx,
            &ChildWorkflowOptions::default(),
            &NamedWorkflow::new("double"),
            &x,
        )?;
        let execution: WorkflowExecution = child.child_workflow_execution().get(&ctx).await?;
        let (doubled, parent): (u32, Option<String>) = child.get(&ctx).await?;
        Ok::<_, WorkflowError>((doubled, parent, execution.workflow_id))
    });
    let mut run = starter.start(&21u32);
    let (doubled, parent, child_id) = run
        .result_as::<(u32, Option<String>, String)>()
        .await
        .unwrap();
    assert_eq!(doubled, 42);
    assert_eq!(
        parent.as_deref(),
        Some("child_result_and_execution_reach_parent")
    );
    assert!(child_id.starts_with("double-"), "{}", child_id);
}

#[tokio::test]
async fn invalid_children_fail_synchronously() {
    let starter = LocalWfStarter::new("invalid_children_fail_synchronously");
    starter.host().register_workflow("double", double);
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let opts = ChildWorkflowOptions::default();
        let empty_name = engine
            .execute_child_workflow(&ctx, &opts, &NamedWorkflow::new(""), &1u32)
            .err();
        let bad_timeouts = ChildWorkflowOptions {
            workflow_execution_timeout: Some(Duration::from_secs(60)),
            workflow_run_timeout: Some(Duration::from_secs(120)),
            ..Default::default()
        };
        let bad_opts = engine
            .execute_child_workflow(&ctx, &bad_timeouts, &NamedWorkflow::new("double"), &1u32)
            .err();
        let unregistered = engine
            .execute_child_workflow(&ctx, &opts, &NamedWorkflow::new("nope"), &1u32)
            .err();
        Ok::<_, WorkflowError>((
            matches!(
                empty_name,
                Some(WorkflowError::Conversion(ConversionError::EmptyWorkflowName))
            ),
            matches!(
                bad_opts,
                Some(WorkflowError::Conversion(
                    ConversionError::InvalidChildWorkflowOptions(_)
                ))
            ),
            matches!(
                unregistered,
                Some(WorkflowError::Runtime {
                    op: "execute child workflow",
                    source: HostError::WorkflowNotRegistered(_),
                })
            ),
        ))
    });
    let mut run = starter.start(&());
    assert_eq!(
        run.result_as::<(bool, bool, bool)>().await.unwrap(),
        (true, true, true)
    );
}

#[tokio::test]
async fn duplicate_child_id_fails_second_start() {
    let starter = LocalWfStarter::new("duplicate_child_id_fails_second_start");
    starter.host().register_workflow("sleepy", sleepy);
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let opts = ChildWorkflowOptions::default();
        let first = engine.execute_child_workflow(&ctx, &opts, &FixedId("only-one"), &())?;
        let second = engine.execute_child_workflow(&ctx, &opts, &FixedId("only-one"), &())?;
        let first_started = first
            .child_workflow_execution()
            .get::<WorkflowExecution>(&ctx)
            .await?;
        let err = second.get::<()>(&ctx).await.unwrap_err();
        Ok::<_, WorkflowError>((
            first_started.workflow_id,
            matches!(
                err.host_error(),
                Some(HostError::WorkflowAlreadyStarted { workflow_id }) if workflow_id == "only-one"
            ),
        ))
    });
    let mut run = starter.start(&());
    assert_eq!(
        run.result_as::<(String, bool)>().await.unwrap(),
        ("only-one".to_string(), true)
    );
}

#[tokio::test]
async fn signal_before_delayed_start_is_delivered() {
    let starter = LocalWfStarter::new("signal_before_delayed_start_is_delivered");
    starter.host().register_workflow("listener", listener);
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let opts = ChildWorkflowOptions {
            start_delay: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        let child = engine.execute_child_workflow(&ctx, &opts, &NamedWorkflow::new("listener"), &())?;
        let ack = child.signal_child_workflow(&ctx, "go", &41u32);
        let acked_early = ack.is_ready();
        ack.get::<IgnoredAny>(&ctx).await?;
        let out: u32 = child.get(&ctx).await?;
        Ok::<_, WorkflowError>((acked_early, out))
    });
    let mut run = starter.start(&());
    assert_eq!(
        run.result_as::<(bool, u32)>().await.unwrap(),
        (false, 42)
    );
    assert_eq!(run.elapsed(), Duration::from_secs(10));
}

#[tokio::test]
async fn failed_child_is_retried_by_policy() {
    let starter = LocalWfStarter::new("failed_child_is_retried_by_policy");
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    starter.host().register_workflow(
        "flaky_child",
        move |engine: LocalEngine, ctx: LocalWfContext, _: ()| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(anyhow::anyhow!("first attempt fails").into());
                }
                Ok::<_, WorkflowError>(engine.get_info(&ctx).attempt)
            }
        },
    );
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let opts = ChildWorkflowOptions {
            retry_policy: Some(fast_retry_policy(3)),
            ..Default::default()
        };
        engine
            .execute_child_workflow(&ctx, &opts, &NamedWorkflow::new("flaky_child"), &())?
            .get::<u32>(&ctx)
            .await
    });
    let mut run = starter.start(&());
    assert_eq!(run.result_as::<u32>().await.unwrap(), 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(run.elapsed(), Duration::from_secs(1));
}

#[tokio::test]
async fn child_failure_surfaces_as_child_workflow_failed() {
    let starter = LocalWfStarter::new("child_failure_surfaces_as_child_workflow_failed");
    starter.host().register_workflow("always_fails", always_fails);
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let err = engine
            .execute_child_workflow(
                &ctx,
                &ChildWorkflowOptions::default(),
                &NamedWorkflow::new("always_fails"),
                &(),
            )?
            .get::<()>(&ctx)
            .await
            .unwrap_err();
        Ok::<_, WorkflowError>(matches!(
            err.host_error(),
            Some(HostError::ChildWorkflowFailed { message, .. }) if message.contains("boom")
        ))
    });
    let mut run = starter.start(&());
    assert!(run.result_as::<bool>().await.unwrap());
}

#[tokio::test]
async fn canceling_parent_context_cancels_child() {
    let starter = LocalWfStarter::new("canceling_parent_context_cancels_child");
    starter.host().register_workflow("sleepy", sleepy);
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let (cctx, handle) = engine.with_cancel(&ctx);
        let child = engine.execute_child_workflow(
            &cctx,
            &ChildWorkflowOptions::default(),
            &NamedWorkflow::new("sleepy"),
            &(),
        )?;
        child
            .child_workflow_execution()
            .get::<IgnoredAny>(&ctx)
            .await?;
        engine.sleep(&ctx, Duration::from_secs(1)).await?;
        handle.cancel();
        let err = child.get::<()>(&ctx).await.unwrap_err();
        Ok::<_, WorkflowError>(err.is_cancelled())
    });
    let mut run = starter.start(&());
    assert!(run.result_as::<bool>().await.unwrap());
    assert_eq!(run.elapsed(), Duration::from_secs(1));
}

#[tokio::test]
async fn child_execution_timeout_fails_child() {
    let starter = LocalWfStarter::new("child_execution_timeout_fails_child");
    starter.host().register_workflow("sleepy", sleepy);
    starter.register_wf(|engine: LocalEngine, ctx: LocalWfContext, _: ()| async move {
        let opts = ChildWorkflowOptions {
            workflow_execution_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let err = engine
            .execute_child_workflow(&ctx, &opts, &NamedWorkflow::new("sleepy"), &())?
            .get::<()>(&ctx)
            .await
            .unwrap_err();
        Ok::<_, WorkflowError>(matches!(
            err.host_error(),
            Some(HostError::WorkflowTimedOut { .. })
        ))
    });
    let mut run = starter.start(&());
    assert!(run.result_as::<bool>().await.unwrap());
    assert_eq!(run.elapsed(), Duration::from_secs(30));
}
