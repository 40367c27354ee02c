//! Diagnostics Runner: CmdStan's `diagnose` over the chain outputs.
//!
//! The report text is kept opaque. A missing or crashing tool never fails a
//! run; it becomes [`Diagnostics::Unavailable`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;

use crate::error::{Result, StanError};
use crate::model::CmdStan;
use crate::obs;

/// Printed by `diagnose` when every check passes.
const NO_PROBLEMS: &str = "no problems detected";

/// Outcome of the diagnostics step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Diagnostics {
    /// The tool ran and reported nothing.
    Clean,
    /// The tool ran and reported problems; the report is verbatim.
    Issues(String),
    /// The tool could not be run.
    Unavailable(String),
    /// Diagnostics were disabled or do not apply to the method.
    Skipped,
}

impl Diagnostics {
    /// Classify the text printed by a successful `diagnose` invocation.
    pub fn from_report(report: &str) -> Self {
        let trimmed = report.trim();
        if trimmed.is_empty() || trimmed.contains(NO_PROBLEMS) {
            Diagnostics::Clean
        } else {
            Diagnostics::Issues(trimmed.to_string())
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, Diagnostics::Clean)
    }

    /// The problem report, if any.
    pub fn issues(&self) -> Option<&str> {
        match self {
            Diagnostics::Issues(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostics::Clean => f.write_str("no problems detected"),
            Diagnostics::Issues(text) => f.write_str(text),
            Diagnostics::Unavailable(reason) => write!(f, "diagnostics not available: {reason}"),
            Diagnostics::Skipped => f.write_str("diagnostics not run"),
        }
    }
}

/// Runs one diagnostic program over a set of output files.
#[derive(Debug, Clone)]
pub struct DiagnosticsRunner {
    program: PathBuf,
}

impl DiagnosticsRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// The `diagnose` tool of `cmdstan`, if its location is known.
    pub fn for_cmdstan(cmdstan: &CmdStan) -> Option<Self> {
        cmdstan.diagnose_path().map(Self::new)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Invoke the tool once with every output file.
    pub async fn diagnose(&self, outputs: &[PathBuf]) -> Result<Diagnostics> {
        let output = Command::new(&self.program)
            .args(outputs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StanError::DiagnosticsUnavailable {
                reason: format!("failed to launch {}: {e}", self.program.display()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StanError::DiagnosticsUnavailable {
                reason: format!(
                    "{} exited with {}: {}",
                    self.program.display(),
                    output.status,
                    stderr.trim()
                ),
            });
        }

        Ok(Diagnostics::from_report(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }
}

/// Diagnose a finished run, downgrading every failure to [`Diagnostics::Unavailable`].
pub async fn run_diagnostics(cmdstan: &CmdStan, run_id: &str, outputs: &[PathBuf]) -> Diagnostics {
    let Some(runner) = DiagnosticsRunner::for_cmdstan(cmdstan) else {
        let reason = "CmdStan home is not configured".to_string();
        obs::emit_diagnostics_unavailable(run_id, &reason);
        return Diagnostics::Unavailable(reason);
    };
    match runner.diagnose(outputs).await {
        Ok(diagnostics) => diagnostics,
        Err(err) => {
            let reason = match err {
                StanError::DiagnosticsUnavailable { reason } => reason,
                other => other.to_string(),
            };
            obs::emit_diagnostics_unavailable(run_id, &reason);
            Diagnostics::Unavailable(reason)
        }
    }
}
