//! Run Invoker: one chain, one process.
//!
//! Each chain owns a scratch directory under a shared root:
//!
//! ```text
//! <root>/chain-1/data.R
//! <root>/chain-1/output.csv
//! <root>/chain-2/...
//! ```
//!
//! Directories are numbered by CmdStan `id` (chain index + 1), so concurrent
//! chains never share a file.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::RunConfig;
use crate::error::{Result, StanError};

/// Per-chain file layout under a scratch root.
#[derive(Debug, Clone)]
pub struct ChainLayout {
    root: PathBuf,
}

impl ChainLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chain_dir(&self, chain: usize) -> PathBuf {
        self.root.join(format!("chain-{}", chain + 1))
    }

    pub fn data_path(&self, chain: usize) -> PathBuf {
        self.chain_dir(chain).join("data.R")
    }

    pub fn output_path(&self, chain: usize) -> PathBuf {
        self.chain_dir(chain).join("output.csv")
    }
}

/// Everything needed to launch one chain.
#[derive(Debug, Clone)]
pub struct ChainTask {
    /// Zero-based chain index.
    pub chain: usize,
    pub executable: PathBuf,
    /// Working directory of the process.
    pub work_dir: PathBuf,
    pub data_file: PathBuf,
    pub output_file: PathBuf,
    /// Input data in dump format, written to `data_file` before launch.
    pub data_dump: Arc<str>,
    /// Full argument list after the executable.
    pub args: Vec<String>,
    /// Seconds before the process is killed (0 = no limit).
    pub timeout_secs: u64,
}

impl ChainTask {
    /// Build the task for `chain` from the run configuration.
    pub fn new(
        chain: usize,
        executable: &Path,
        layout: &ChainLayout,
        config: &RunConfig,
        data_dump: Arc<str>,
    ) -> Self {
        let data_file = layout.data_path(chain);
        let output_file = layout.output_path(chain);
        let args = chain_args(config, chain, &data_file, &output_file);
        Self {
            chain,
            executable: executable.to_path_buf(),
            work_dir: layout.chain_dir(chain),
            data_file,
            output_file,
            data_dump,
            args,
            timeout_secs: config.chain_timeout_secs,
        }
    }
}

/// Command line for one chain.
///
/// Method-scoped tokens come first so that validated and raw arguments land
/// under the method; `id`, `data`, `output` and `random` close the line.
pub fn chain_args(
    config: &RunConfig,
    chain: usize,
    data_file: &Path,
    output_file: &Path,
) -> Vec<String> {
    let method = config.method;
    let mut args = vec![
        method.token().to_string(),
        format!("{}={}", method.iteration_key(), config.iter),
    ];
    if let Some(warmup) = config.warmup {
        args.push(format!("num_warmup={warmup}"));
    }
    args.extend(config.args.to_args());
    if let Some(raw) = &config.raw_args {
        args.extend(raw.split_whitespace().map(str::to_string));
    }
    args.push(format!("id={}", chain + 1));
    args.push("data".to_string());
    args.push(format!("file={}", data_file.display()));
    args.push("output".to_string());
    args.push(format!("file={}", output_file.display()));
    if let Some(seed) = config.seed {
        args.push("random".to_string());
        args.push(format!("seed={seed}"));
    }
    args
}

/// What a successful chain left behind.
#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub chain: usize,
    pub output_file: PathBuf,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Launches a single chain. The scheduler only talks to this trait.
#[async_trait]
pub trait ChainRunner: Send + Sync {
    async fn run_chain(&self, task: &ChainTask) -> Result<ChainOutput>;
}

/// Runs chains as child processes.
///
/// Children are killed when their future is dropped, so aborting a run
/// terminates every in-flight chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl ChainRunner for ProcessRunner {
    async fn run_chain(&self, task: &ChainTask) -> Result<ChainOutput> {
        let start = Instant::now();

        tokio::fs::create_dir_all(&task.work_dir)
            .await
            .map_err(StanError::io(&task.work_dir))?;
        tokio::fs::write(&task.data_file, task.data_dump.as_bytes())
            .await
            .map_err(StanError::io(&task.data_file))?;

        debug!(chain = task.chain, args = ?task.args, "launching chain");
        let child = Command::new(&task.executable)
            .args(&task.args)
            .current_dir(&task.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StanError::Launch {
                program: task.executable.clone(),
                source,
            })?;

        let waited = if task.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(task.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| StanError::ChainTimeout {
                chain: task.chain,
                timeout_secs: task.timeout_secs,
            })?
        } else {
            child.wait_with_output().await
        };
        let output = waited.map_err(|source| StanError::Launch {
            program: task.executable.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            return Err(StanError::Invocation {
                chain: task.chain,
                exit_code: output.status.code(),
                stderr,
            });
        }
        if !task.output_file.is_file() {
            return Err(StanError::MissingOutput {
                chain: task.chain,
                path: task.output_file.clone(),
                stderr,
            });
        }

        Ok(ChainOutput {
            chain: task.chain,
            output_file: task.output_file.clone(),
            stdout,
            stderr,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::{ArgBuilder, Method};

    fn paths() -> (PathBuf, PathBuf) {
        (PathBuf::from("/s/chain-1/data.R"), PathBuf::from("/s/chain-1/output.csv"))
    }

    #[test]
    fn test_layout_is_disjoint_per_chain() {
        let layout = ChainLayout::new("/scratch");
        assert_eq!(layout.chain_dir(0), PathBuf::from("/scratch/chain-1"));
        assert_eq!(layout.data_path(3), PathBuf::from("/scratch/chain-4/data.R"));
        assert_ne!(layout.output_path(0), layout.output_path(1));
    }

    #[test]
    fn test_sample_args_order() {
        let (data, out) = paths();
        let args = ArgBuilder::new(Method::Sample)
            .group("adapt")
            .set("delta", 0.95)
            .build()
            .unwrap();
        let config = RunConfig::default()
            .with_iter(1000)
            .with_warmup(500)
            .with_args(args)
            .with_raw_args("refresh=0")
            .with_seed(42);
        let argv = chain_args(&config, 0, &data, &out);
        assert_eq!(
            argv,
            vec![
                "sample",
                "num_samples=1000",
                "num_warmup=500",
                "adapt",
                "delta=0.95",
                "refresh=0",
                "id=1",
                "data",
                "file=/s/chain-1/data.R",
                "output",
                "file=/s/chain-1/output.csv",
                "random",
                "seed=42",
            ]
        );
    }

    #[test]
    fn test_iteration_key_follows_method() {
        let (data, out) = paths();
        let optimize = chain_args(&RunConfig::new(Method::Optimize).with_iter(50), 2, &data, &out);
        assert_eq!(&optimize[..2], &["optimize", "iter=50"]);
        assert!(optimize.contains(&"id=3".to_string()));
        assert!(!optimize.iter().any(|a| a == "random"));

        let variational = chain_args(&RunConfig::new(Method::Variational), 0, &data, &out);
        assert_eq!(&variational[..2], &["variational", "output_samples=2000"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_names_chain() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("model.sh");
        std::fs::write(&exe, "#!/bin/sh\necho 'Rejecting initial value' >&2\nexit 70\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let layout = ChainLayout::new(dir.path().join("runs"));
        let task = ChainTask::new(1, &exe, &layout, &RunConfig::default(), Arc::from("N <- 1\n"));
        let err = ProcessRunner.run_chain(&task).await.unwrap_err();
        match err {
            StanError::Invocation { chain, exit_code, stderr } => {
                assert_eq!(chain, 1);
                assert_eq!(exit_code, Some(70));
                assert_eq!(stderr, "Rejecting initial value");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(std::fs::read_to_string(layout.data_path(1)).unwrap(), "N <- 1\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_without_output_is_missing_output() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("model.sh");
        std::fs::write(
            &exe,
            "#!/bin/sh\necho 'could not open output file' >&2\nexit 0\n",
        )
        .unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let layout = ChainLayout::new(dir.path());
        let task = ChainTask::new(0, &exe, &layout, &RunConfig::default(), Arc::from(""));
        let err = ProcessRunner.run_chain(&task).await.unwrap_err();
        assert!(err.to_string().contains("could not open output file"), "{err}");
        match err {
            StanError::MissingOutput { chain, path, stderr } => {
                assert_eq!(chain, 0);
                assert_eq!(path, layout.output_path(0));
                assert_eq!(stderr, "could not open output file");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_executable_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ChainLayout::new(dir.path());
        let task = ChainTask::new(
            0,
            &dir.path().join("no-such-model"),
            &layout,
            &RunConfig::default(),
            Arc::from(""),
        );
        let err = ProcessRunner.run_chain(&task).await.unwrap_err();
        assert!(matches!(err, StanError::Launch { .. }));
    }
}
