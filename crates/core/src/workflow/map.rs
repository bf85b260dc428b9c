use crate::context::ExecutionContext;
use crate::error::{Failure, FailureKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;

/// What a map does when one of its items fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapFailurePolicy {
    /// Stop at the first failed item and fail the stage
    #[default]
    AbortAll,
    /// Keep going; failed items become markers in the output
    CollectPartial,
}

/// Output entry standing in for a failed item under `CollectPartial`
pub fn failure_marker(index: usize, failure: &Failure) -> Value {
    json!({ "index": index, "failure": failure })
}

/// Run one sub-workflow per item, strictly one at a time. Item `i + 1` is
/// not started before item `i` has completed.
pub async fn run_map_sequential<F, Fut>(
    name: &str,
    items: Vec<Value>,
    policy: MapFailurePolicy,
    mut run_item: F,
) -> Result<Vec<Value>, Failure>
where
    F: FnMut(usize, ExecutionContext) -> Fut,
    Fut: Future<Output = Result<Value, Failure>>,
{
    let mut outputs = Vec::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        match run_item(index, ExecutionContext::for_item(index, item)).await {
            Ok(output) => outputs.push(output),
            Err(failure) => match policy {
                MapFailurePolicy::AbortAll => {
                    return Err(Failure::new(
                        FailureKind::MapItem,
                        format!("item {index} of {name} failed"),
                    )
                    .with_stage(name)
                    .with_cause(failure));
                }
                MapFailurePolicy::CollectPartial => {
                    tracing::warn!("Item {} of {} failed, continuing: {}", index, name, failure);
                    outputs.push(failure_marker(index, &failure));
                }
            },
        }
    }

    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_items_run_in_order_without_overlap() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let outputs = run_map_sequential(
            "Refine",
            vec![json!("A"), json!("B"), json!("C")],
            MapFailurePolicy::AbortAll,
            |index, ctx| {
                let log = log.clone();
                let in_flight = in_flight.clone();
                async move {
                    assert_eq!(in_flight.fetch_add(1, Ordering::SeqCst), 0);
                    let item = ctx.get("$.item").cloned().unwrap_or_default();
                    log.lock().unwrap().push(format!("start {item}"));
                    tokio::time::sleep(Duration::from_millis(10 * (3 - index as u64))).await;
                    log.lock().unwrap().push(format!("end {item}"));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!({"refined": item, "index": ctx.get("$.index").cloned()}))
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "start \"A\"",
                "end \"A\"",
                "start \"B\"",
                "end \"B\"",
                "start \"C\"",
                "end \"C\""
            ]
        );
        assert_eq!(outputs[2], json!({"refined": "C", "index": 2}));
    }

    #[tokio::test]
    async fn test_empty_list_invokes_nothing() {
        let calls = AtomicUsize::new(0);
        let outputs = run_map_sequential("Refine", Vec::new(), MapFailurePolicy::AbortAll, |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Value::Null) }
        })
        .await
        .unwrap();

        assert!(outputs.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    fn fail_second(index: usize, _ctx: ExecutionContext) -> impl Future<Output = Result<Value, Failure>> {
        async move {
            if index == 1 {
                Err(Failure::new(FailureKind::Stage, "bad segment").with_stage("RefineTranscript"))
            } else {
                Ok(json!(index))
            }
        }
    }

    #[tokio::test]
    async fn test_abort_all_stops_at_first_failure() {
        let mut seen = Vec::new();
        let err = run_map_sequential(
            "Refine",
            vec![json!(1), json!(2), json!(3)],
            MapFailurePolicy::AbortAll,
            |index, ctx| {
                seen.push(index);
                fail_second(index, ctx)
            },
        )
        .await
        .unwrap_err();

        assert_eq!(seen, vec![0, 1]);
        assert_eq!(err.kind, FailureKind::MapItem);
        assert_eq!(err.root_cause().message, "bad segment");
    }

    #[tokio::test]
    async fn test_collect_partial_records_markers() {
        let outputs = run_map_sequential(
            "Refine",
            vec![json!(1), json!(2), json!(3)],
            MapFailurePolicy::CollectPartial,
            fail_second,
        )
        .await
        .unwrap();

        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0], json!(0));
        assert_eq!(outputs[1]["index"], 1);
        assert_eq!(outputs[1]["failure"]["kind"], "stage");
        assert_eq!(outputs[2], json!(2));
    }
}
