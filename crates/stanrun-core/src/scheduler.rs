//! Run Scheduler: bounded fan-out of chain tasks.
//!
//! At most `workers` chains run at once. Results are buffered by chain index,
//! so the returned sequence is in chain order whatever the completion order.
//! The first failure aborts every other chain and fails the whole call.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{instrument, Instrument, Span};

use crate::error::{Result, StanError};
use crate::invoker::{ChainRunner, ChainTask, ProcessRunner};
use crate::obs;
use crate::table::{parse_result_file, ResultTable};

/// Parsed output of one successful chain.
#[derive(Debug, Clone)]
pub struct ChainResult {
    pub chain: usize,
    pub output_file: PathBuf,
    pub table: ResultTable,
    pub duration_ms: u64,
}

/// Dispatches chain tasks to a [`ChainRunner`] through a bounded pool.
#[derive(Clone)]
pub struct Scheduler {
    runner: Arc<dyn ChainRunner>,
    workers: usize,
}

impl Scheduler {
    /// A scheduler running at most `workers` chains at once (minimum 1).
    pub fn new(runner: Arc<dyn ChainRunner>, workers: usize) -> Self {
        Self {
            runner,
            workers: workers.max(1),
        }
    }

    /// A scheduler that launches chains as child processes.
    pub fn process(workers: usize) -> Self {
        Self::new(Arc::new(ProcessRunner), workers)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every task and parse its output. All-or-nothing.
    ///
    /// Dropping the returned future aborts in-flight chains.
    #[instrument(skip(self, tasks), fields(chains = tasks.len(), workers = self.workers))]
    pub async fn run_all(&self, run_id: &str, tasks: Vec<ChainTask>) -> Result<Vec<ChainResult>> {
        let count = tasks.len();
        let sem = Arc::new(Semaphore::new(self.workers));
        let mut join_set = JoinSet::new();

        for (idx, task) in tasks.into_iter().enumerate() {
            let runner = Arc::clone(&self.runner);
            let sem = Arc::clone(&sem);
            let run_id = run_id.to_string();
            join_set.spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|e| StanError::TaskJoin(e.to_string()))?;
                let result = run_one(runner.as_ref(), &run_id, &task).await?;
                Ok::<(usize, ChainResult), StanError>((idx, result))
            }
            .instrument(Span::current()));
        }

        let mut ordered: Vec<Option<ChainResult>> =
            std::iter::repeat_with(|| None).take(count).collect();
        while let Some(joined) = join_set.join_next().await {
            let result = joined.map_err(|e| StanError::TaskJoin(e.to_string()))?;
            match result {
                Ok((idx, chain)) => ordered[idx] = Some(chain),
                Err(err) => {
                    join_set.abort_all();
                    return Err(err);
                }
            }
        }

        ordered
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.ok_or_else(|| StanError::TaskJoin(format!("missing result for chain {idx}")))
            })
            .collect()
    }
}

async fn run_one(runner: &dyn ChainRunner, run_id: &str, task: &ChainTask) -> Result<ChainResult> {
    obs::emit_chain_started(run_id, task.chain);
    let outcome = match runner.run_chain(task).await {
        Ok(output) => parse_result_file(&output.output_file).map(|table| ChainResult {
            chain: task.chain,
            output_file: output.output_file,
            table,
            duration_ms: output.duration_ms,
        }),
        Err(err) => Err(err),
    };
    match &outcome {
        Ok(result) => obs::emit_chain_finished(
            run_id,
            result.chain,
            result.table.row_count(),
            result.duration_ms,
        ),
        Err(err) => obs::emit_chain_failed(run_id, task.chain, err),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::invoker::{ChainLayout, ChainOutput};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Writes a small CSV per chain; later chains finish first.
    struct FakeRunner {
        chains: usize,
        fail_chain: Option<usize>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeRunner {
        fn new(chains: usize) -> Self {
            Self {
                chains,
                fail_chain: None,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChainRunner for FakeRunner {
        async fn run_chain(&self, task: &ChainTask) -> Result<ChainOutput> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let delay = 5 * (self.chains - task.chain) as u64;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.fail_chain == Some(task.chain) {
                return Err(StanError::Invocation {
                    chain: task.chain,
                    exit_code: Some(1),
                    stderr: "boom".to_string(),
                });
            }
            std::fs::create_dir_all(&task.work_dir).unwrap();
            let rows = task.chain + 1;
            let mut csv = String::from("# fake\nlp__,theta\n");
            for _ in 0..rows {
                csv.push_str(&format!("-1.0,{}\n", task.chain));
            }
            std::fs::write(&task.output_file, csv).unwrap();
            Ok(ChainOutput {
                chain: task.chain,
                output_file: task.output_file.clone(),
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: delay,
            })
        }
    }

    fn tasks(dir: &std::path::Path, chains: usize) -> Vec<ChainTask> {
        let layout = ChainLayout::new(dir);
        let config = RunConfig::default().with_chains(chains);
        (0..chains)
            .map(|c| ChainTask::new(c, &dir.join("model"), &layout, &config, Arc::from("")))
            .collect()
    }

    #[tokio::test]
    async fn test_results_are_in_chain_order() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(Arc::new(FakeRunner::new(4)), 4);
        let results = scheduler.run_all("run-1", tasks(dir.path(), 4)).await.unwrap();
        assert_eq!(results.len(), 4);
        for (idx, result) in results.iter().enumerate() {
            assert_eq!(result.chain, idx);
            assert_eq!(result.table.row_count(), idx + 1);
            assert_eq!(result.table.column("theta").unwrap()[0], idx as f64);
        }
    }

    #[tokio::test]
    async fn test_worker_bound_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new(6));
        let scheduler = Scheduler::new(runner.clone(), 2);
        scheduler.run_all("run-2", tasks(dir.path(), 6)).await.unwrap();
        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_single_worker_runs_sequentially() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new(3));
        let scheduler = Scheduler::new(runner.clone(), 0);
        assert_eq!(scheduler.workers(), 1);
        scheduler.run_all("run-3", tasks(dir.path(), 3)).await.unwrap();
        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_chain_fails_whole_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = FakeRunner::new(4);
        runner.fail_chain = Some(2);
        let scheduler = Scheduler::new(Arc::new(runner), 4);
        let err = scheduler.run_all("run-4", tasks(dir.path(), 4)).await.unwrap_err();
        assert_eq!(err.chain(), Some(2));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_malformed_output_fails_with_path() {
        struct BadCsv;

        #[async_trait]
        impl ChainRunner for BadCsv {
            async fn run_chain(&self, task: &ChainTask) -> Result<ChainOutput> {
                std::fs::create_dir_all(&task.work_dir).unwrap();
                std::fs::write(&task.output_file, "lp__,theta\n1.0\n").unwrap();
                Ok(ChainOutput {
                    chain: task.chain,
                    output_file: task.output_file.clone(),
                    stdout: String::new(),
                    stderr: String::new(),
                    duration_ms: 0,
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(Arc::new(BadCsv), 1);
        let err = scheduler.run_all("run-5", tasks(dir.path(), 1)).await.unwrap_err();
        match err {
            StanError::Parse { path, line, .. } => {
                assert!(path.ends_with("chain-1/output.csv"));
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_no_tasks_is_empty() {
        let scheduler = Scheduler::process(4);
        let results = scheduler.run_all("run-6", Vec::new()).await.unwrap();
        assert!(results.is_empty());
    }
}
