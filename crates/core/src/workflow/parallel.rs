use crate::context::ExecutionContext;
use crate::error::{Failure, FailureKind};
use serde_json::Value;
use std::future::Future;
use tokio::task::JoinSet;

/// Run `branches` sub-workflows concurrently, each on its own copy of the
/// context. Outputs come back in declaration order regardless of completion
/// order. The first branch failure aborts the remaining branches.
pub async fn run_parallel<F, Fut>(
    name: &str,
    ctx: &ExecutionContext,
    branches: usize,
    run_branch: F,
) -> Result<Vec<Value>, Failure>
where
    F: Fn(usize, ExecutionContext) -> Fut,
    Fut: Future<Output = Result<Value, Failure>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for index in 0..branches {
        let branch = run_branch(index, ctx.clone());
        set.spawn(async move { (index, branch.await) });
    }

    let mut slots: Vec<Option<Value>> = vec![None; branches];
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, Ok(output))) => slots[index] = Some(output),
            Ok((index, Err(failure))) => {
                set.abort_all();
                tracing::warn!("Branch {} of {} failed, aborting siblings: {}", index, name, failure);
                return Err(Failure::new(
                    FailureKind::FanOut,
                    format!("branch {index} of {name} failed"),
                )
                .with_stage(name)
                .with_cause(failure));
            }
            Err(e) => {
                set.abort_all();
                return Err(Failure::new(
                    FailureKind::FanOut,
                    format!("branch of {name} did not complete: {e}"),
                )
                .with_stage(name));
            }
        }
    }

    Ok(slots.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_outputs_in_declaration_order() {
        let ctx = ExecutionContext::from_seed(json!({"video": "v1"})).unwrap();

        let outputs = run_parallel("Fan", &ctx, 2, |index, ctx| async move {
            // Branch 0 finishes last
            let delay = if index == 0 { 50 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(json!({"branch": index, "video": ctx.get("$.video").cloned()}))
        })
        .await
        .unwrap();

        assert_eq!(
            outputs,
            vec![
                json!({"branch": 0, "video": "v1"}),
                json!({"branch": 1, "video": "v1"})
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_carries_branch_failure() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let err = run_parallel("Fan", &ExecutionContext::new(), 2, move |index, _| {
            let flag = flag.clone();
            async move {
                if index == 0 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err(Failure::from_task_error(
                        FailureKind::Stage,
                        "RefineTranscript",
                        TaskError::terminal("Unhandled", "model error"),
                    ))
                } else {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(json!(null))
                }
            }
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind, FailureKind::FanOut);
        let cause = err.root_cause();
        assert_eq!(cause.stage.as_deref(), Some("RefineTranscript"));
        assert_eq!(cause.message, "Unhandled: model error");

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_branch_contexts_are_independent() {
        let ctx = ExecutionContext::from_seed(json!({"shared": 1})).unwrap();

        let outputs = run_parallel("Fan", &ctx, 2, |index, mut ctx| async move {
            ctx.insert("mine", json!(index));
            Ok(ctx.into_value())
        })
        .await
        .unwrap();

        assert_eq!(outputs[0], json!({"shared": 1, "mine": 0}));
        assert_eq!(outputs[1], json!({"shared": 1, "mine": 1}));
        assert!(!ctx.contains_key("mine"));
    }
}
