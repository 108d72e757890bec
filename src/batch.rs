use crate::models::{BatchItemResult, BatchReport, MAX_BATCH_KEYS};
use serde_json::Value;
use std::fmt::Display;
use std::future::Future;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("no keys provided")]
    Empty,
    #[error("batch size {0} exceeds the limit of {MAX_BATCH_KEYS}")]
    TooManyKeys(usize),
}

/// Fetches each key independently through `fetch`, never letting one
/// item's failure abort the rest. Successful items are handed to
/// `persist` as they complete, so a crash mid-batch still leaves the
/// finished items saved. Returns one result per input key, in input
/// order. Empty and oversized batches are rejected before any call.
pub async fn fetch_batch<F, FFut, E, S, SFut>(
    keys: &[String],
    fetch: F,
    mut persist: S,
) -> Result<BatchReport, BatchError>
where
    F: Fn(String) -> FFut,
    FFut: Future<Output = Result<Value, E>>,
    E: Display,
    S: FnMut(String, Value) -> SFut,
    SFut: Future<Output = ()>,
{
    if keys.is_empty() {
        return Err(BatchError::Empty);
    }
    if keys.len() > MAX_BATCH_KEYS {
        return Err(BatchError::TooManyKeys(keys.len()));
    }

    let mut results = Vec::with_capacity(keys.len());
    let mut fetched = 0usize;
    let mut failed = 0usize;

    for key in keys {
        match fetch(key.clone()).await {
            Ok(data) => {
                persist(key.clone(), data.clone()).await;
                fetched += 1;
                results.push(BatchItemResult {
                    key: key.clone(),
                    success: true,
                    data: Some(data),
                    error: None,
                });
            }
            Err(err) => {
                warn!(target = "listforge.batch", key = %key, error = %err, "batch_item_failed");
                failed += 1;
                results.push(BatchItemResult {
                    key: key.clone(),
                    success: false,
                    data: None,
                    error: Some(err.to_string()),
                });
            }
        }
    }

    let message = format!("Fetched {fetched}, {failed} failed");
    Ok(BatchReport {
        results,
        fetched,
        failed,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn keys(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    async fn no_persist(_key: String, _data: Value) {}

    #[tokio::test]
    async fn empty_batch_is_rejected_before_any_call() {
        let calls = Arc::new(Mutex::new(0usize));
        let calls_in = calls.clone();
        let err = fetch_batch(
            &[],
            move |_key| {
                let calls = calls_in.clone();
                async move {
                    *calls.lock().await += 1;
                    Ok::<_, String>(json!({}))
                }
            },
            no_persist,
        )
        .await
        .expect_err("empty batch");
        assert_eq!(err, BatchError::Empty);
        assert_eq!(*calls.lock().await, 0);
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let input: Vec<String> = (0..11).map(|i| format!("B{i:09}")).collect();
        let err = fetch_batch(
            &input,
            |_key| async { Ok::<_, String>(json!({})) },
            no_persist,
        )
        .await
        .expect_err("oversized batch");
        assert_eq!(err, BatchError::TooManyKeys(11));
    }

    #[tokio::test]
    async fn one_failure_does_not_affect_others() {
        let report = fetch_batch(
            &keys(&["B00EXAMPLE1", "B00EXAMPLE2", "B00EXAMPLE3"]),
            |key| async move {
                if key == "B00EXAMPLE2" {
                    Err("provider returned 503".to_string())
                } else {
                    Ok(json!({ "asin": key }))
                }
            },
            no_persist,
        )
        .await
        .expect("batch runs");

        let flags: Vec<bool> = report.results.iter().map(|r| r.success).collect();
        assert_eq!(flags, vec![true, false, true]);
        assert_eq!(report.fetched, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.message, "Fetched 2, 1 failed");
        assert_eq!(
            report.results[1].error.as_deref(),
            Some("provider returned 503")
        );
    }

    #[tokio::test]
    async fn results_preserve_input_order() {
        let input = keys(&["B000000003", "B000000001", "B000000002"]);
        let report = fetch_batch(
            &input,
            |key| async move { Ok::<_, String>(json!({ "asin": key })) },
            no_persist,
        )
        .await
        .expect("batch runs");
        let out: Vec<&str> = report.results.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(out, vec!["B000000003", "B000000001", "B000000002"]);
    }

    #[tokio::test]
    async fn successes_are_persisted_as_they_complete() {
        let saved: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let saved_in = saved.clone();
        let report = fetch_batch(
            &keys(&["A", "BAD", "C"]),
            |key| async move {
                if key == "BAD" {
                    Err("boom".to_string())
                } else {
                    Ok(json!({ "asin": key }))
                }
            },
            move |key, _data| {
                let saved = saved_in.clone();
                async move {
                    saved.lock().await.push(key);
                }
            },
        )
        .await
        .expect("batch runs");

        assert_eq!(*saved.lock().await, vec!["A".to_string(), "C".to_string()]);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn all_failures_still_produce_a_report() {
        let report = fetch_batch(
            &keys(&["X", "Y"]),
            |_key| async { Err::<Value, _>("down".to_string()) },
            no_persist,
        )
        .await
        .expect("aggregate never fails on item errors");
        assert_eq!(report.fetched, 0);
        assert_eq!(report.failed, 2);
        assert!(report.results.iter().all(|r| !r.success));
    }
}
