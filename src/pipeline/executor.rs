use super::cancellation::CancellationToken;
use crate::error::{PreprocessError, Result};
use crate::types::Stage;
use anyhow::anyhow;
use metrics::counter;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Runs opaque backend calls off the async runtime, with an optional timeout
/// and a bounded fan-out across modalities.
#[derive(Debug, Clone)]
pub struct StageExecutor {
    timeout: Option<Duration>,
    max_parallel: usize,
    cancellation: CancellationToken,
}

impl StageExecutor {
    pub fn new(timeout: Option<Duration>, max_parallel: usize, cancellation: CancellationToken) -> Self {
        Self { timeout, max_parallel: max_parallel.max(1), cancellation }
    }

    /// Stage boundary check
    pub fn check_cancelled(&self, next: Stage) -> Result<()> {
        if self.cancellation.is_cancelled() {
            warn!("⏹️ Run cancelled before stage '{}'", next);
            return Err(PreprocessError::Cancelled { stage: next });
        }
        Ok(())
    }

    /// One backend call
    pub async fn call<T, F>(&self, stage: Stage, modality: Option<&str>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        run_blocking(stage, modality.map(str::to_string), self.timeout, f).await
    }

    /// Run `f` once per item, at most `max_parallel` at a time. Results are keyed
    /// by modality name so aggregation does not depend on completion order.
    /// The first failure aborts the fan-out.
    pub async fn fan_out<I, T, F>(
        &self,
        stage: Stage,
        items: Vec<(String, I)>,
        f: F,
    ) -> Result<BTreeMap<String, T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(&str, I) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        if items.is_empty() {
            return Ok(BTreeMap::new());
        }
        debug!(
            "Fanning out {} over {} modalities (max {} in parallel)",
            stage,
            items.len(),
            self.max_parallel
        );

        let f = Arc::new(f);
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks = JoinSet::new();

        for (name, item) in items {
            let f = Arc::clone(&f);
            let semaphore = Arc::clone(&semaphore);
            let timeout = self.timeout;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| {
                    PreprocessError::StageExecution {
                        stage,
                        modality: Some(name.clone()),
                        source: e.into(),
                    }
                })?;
                let task_name = name.clone();
                let value =
                    run_blocking(stage, Some(name.clone()), timeout, move || (*f)(&task_name, item))
                        .await?;
                Ok::<_, PreprocessError>((name, value))
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((name, value))) => {
                    results.insert(name, value);
                }
                Ok(Err(e)) => {
                    tasks.abort_all();
                    return Err(e);
                }
                Err(join_error) => {
                    tasks.abort_all();
                    return Err(PreprocessError::StageExecution {
                        stage,
                        modality: None,
                        source: anyhow!("fan-out task failed: {join_error}"),
                    });
                }
            }
        }
        Ok(results)
    }
}

async fn run_blocking<T, F>(
    stage: Stage,
    modality: Option<String>,
    timeout: Option<Duration>,
    f: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    counter!("brainprep_backend_calls_total", "stage" => stage.as_str()).increment(1);
    let handle = tokio::task::spawn_blocking(f);

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, handle).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(
                    "⏱️ Stage '{}' exceeded {:?} for {}",
                    stage,
                    limit,
                    modality.as_deref().unwrap_or("all modalities")
                );
                return Err(PreprocessError::StageTimeout { stage, modality, timeout: limit });
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(PreprocessError::from_backend(stage, modality.as_deref(), e)),
        Err(join_error) => Err(PreprocessError::StageExecution {
            stage,
            modality,
            source: anyhow!("backend task panicked: {join_error}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn executor(timeout: Option<Duration>, max_parallel: usize) -> StageExecutor {
        StageExecutor::new(timeout, max_parallel, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_call_wraps_backend_errors() {
        let err = executor(None, 1)
            .call(Stage::BiasCorrection, Some("t2w"), || -> anyhow::Result<()> {
                Err(anyhow!("n4 diverged"))
            })
            .await
            .unwrap_err();
        match err {
            PreprocessError::StageExecution { stage, modality, source } => {
                assert_eq!(stage, Stage::BiasCorrection);
                assert_eq!(modality.as_deref(), Some("t2w"));
                assert!(source.to_string().contains("n4 diverged"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let err = executor(Some(Duration::from_millis(20)), 1)
            .call(Stage::Coregistration, Some("flair"), || {
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PreprocessError::StageTimeout { stage: Stage::Coregistration, .. }
        ));
    }

    #[tokio::test]
    async fn test_fan_out_keys_results_by_modality() {
        let items = vec![
            ("t2w".to_string(), 2),
            ("flair".to_string(), 3),
            ("t1".to_string(), 1),
        ];
        let results = executor(None, 2)
            .fan_out(Stage::BiasCorrection, items, |name, value: i32| {
                Ok(format!("{name}:{}", value * 10))
            })
            .await
            .unwrap();

        let keys: Vec<&str> = results.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["flair", "t1", "t2w"]);
        assert_eq!(results["flair"], "flair:30");
    }

    #[tokio::test]
    async fn test_fan_out_respects_parallel_limit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let items: Vec<(String, ())> = (0..6).map(|i| (format!("m{i}"), ())).collect();

        let (running_in, peak_in) = (Arc::clone(&running), Arc::clone(&peak));
        executor(None, 2)
            .fan_out(Stage::Coregistration, items, move |_, _| {
                let now = running_in.fetch_add(1, Ordering::SeqCst) + 1;
                peak_in.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                running_in.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_fan_out_fails_on_first_error() {
        let items = vec![("ok".to_string(), true), ("broken".to_string(), false)];
        let err = executor(None, 4)
            .fan_out(Stage::Coregistration, items, |_, healthy| {
                if healthy {
                    Ok(())
                } else {
                    Err(anyhow!("solver did not converge"))
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PreprocessError::StageExecution { stage: Stage::Coregistration, modality: Some(ref m), .. }
                if m == "broken"
        ));
    }

    #[test]
    fn test_check_cancelled() {
        let token = CancellationToken::new();
        let executor = StageExecutor::new(None, 1, token.clone());
        assert!(executor.check_cancelled(Stage::Defacing).is_ok());
        token.cancel();
        assert!(matches!(
            executor.check_cancelled(Stage::Defacing),
            Err(PreprocessError::Cancelled { stage: Stage::Defacing })
        ));
    }
}
