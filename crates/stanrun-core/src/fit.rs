//! Fitting a model and the immutable handle it returns.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::aggregate;
use crate::config::{RunConfig, SaveOptions};
use crate::data::DataBindings;
use crate::diagnostics::{run_diagnostics, Diagnostics};
use crate::error::{Result, StanError};
use crate::invoker::{ChainLayout, ChainTask};
use crate::model::{CmdStan, ModelReference};
use crate::obs;
use crate::scheduler::Scheduler;
use crate::table::ResultTable;

/// A completed multi-chain run.
///
/// Created once all chains have succeeded and never mutated afterwards;
/// extraction borrows the per-chain tables.
#[derive(Debug, Clone, Serialize)]
pub struct FitHandle {
    run_id: String,
    model: ModelReference,
    data: DataBindings,
    config: RunConfig,
    chains: Vec<ResultTable>,
    diagnostics: Diagnostics,
    completed_at: DateTime<Utc>,
}

impl FitHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn model(&self) -> &ModelReference {
        &self.model
    }

    pub fn data(&self) -> &DataBindings {
        &self.data
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Per-chain tables, indexed by chain.
    pub fn chains(&self) -> &[ResultTable] {
        &self.chains
    }

    pub fn chain(&self, chain: usize) -> Option<&ResultTable> {
        self.chains.get(chain)
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    /// Sum of the per-chain row counts.
    pub fn total_rows(&self) -> usize {
        self.chains.iter().map(ResultTable::row_count).sum()
    }

    /// All chains merged into one table.
    pub fn merged(&self) -> Result<ResultTable> {
        aggregate::merge(&self.chains)
    }

    /// Every column, concatenated across chains in chain order.
    pub fn extract(&self) -> Result<BTreeMap<String, Vec<f64>>> {
        Ok(self.merged()?.into_map())
    }

    /// Only the named columns; an unknown name fails with
    /// [`StanError::ColumnNotFound`].
    pub fn extract_columns<S: AsRef<str>>(&self, columns: &[S]) -> Result<BTreeMap<String, Vec<f64>>> {
        Ok(aggregate::merge_columns(&self.chains, columns)?.into_map())
    }

    fn save(&self, save: &SaveOptions, executable: &Path, dump: &str) -> Result<()> {
        if let Some(path) = &save.binary {
            create_parent(path)?;
            std::fs::copy(executable, path).map_err(StanError::io(path))?;
        }
        if let Some(path) = &save.data {
            create_parent(path)?;
            std::fs::write(path, dump).map_err(StanError::io(path))?;
        }
        if let Some(path) = &save.result {
            // A column mismatch only fails aggregation; the fit itself stands.
            match self.merged() {
                Ok(merged) => {
                    create_parent(path)?;
                    merged.write_csv(path)?;
                }
                Err(err) => obs::emit_result_save_skipped(&self.run_id, path, &err),
            }
        }
        if let Some(path) = &save.diagnostics {
            create_parent(path)?;
            std::fs::write(path, format!("{}\n", self.diagnostics)).map_err(StanError::io(path))?;
        }
        Ok(())
    }
}

fn create_parent(path: &Path) -> Result<()> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => std::fs::create_dir_all(parent).map_err(StanError::io(parent)),
        None => Ok(()),
    }
}

/// Fit `model` to `data`, running chains as child processes.
///
/// Chains run in a private scratch directory that is removed afterwards,
/// also when the returned future is dropped early.
pub async fn run(
    cmdstan: &CmdStan,
    model: &ModelReference,
    data: &DataBindings,
    config: &RunConfig,
) -> Result<FitHandle> {
    let scheduler = Scheduler::process(config.worker_count());
    run_with_scheduler(&scheduler, cmdstan, model, data, config).await
}

/// [`run`] with a caller-supplied scheduler.
pub async fn run_with_scheduler(
    scheduler: &Scheduler,
    cmdstan: &CmdStan,
    model: &ModelReference,
    data: &DataBindings,
    config: &RunConfig,
) -> Result<FitHandle> {
    config.validate()?;
    let dump: Arc<str> = Arc::from(data.to_dump()?);
    let run_id = Uuid::new_v4().to_string();

    let span = obs::fit_span(&run_id);
    async {
        let start = Instant::now();
        let outcome = fit(scheduler, cmdstan, model, data, config, &run_id, dump).await;
        let total_rows = outcome.as_ref().map(FitHandle::total_rows).unwrap_or(0);
        obs::emit_fit_finished(
            &run_id,
            start.elapsed().as_millis() as u64,
            total_rows,
            outcome.is_ok(),
        );
        outcome
    }
    .instrument(span)
    .await
}

async fn fit(
    scheduler: &Scheduler,
    cmdstan: &CmdStan,
    model: &ModelReference,
    data: &DataBindings,
    config: &RunConfig,
    run_id: &str,
    dump: Arc<str>,
) -> Result<FitHandle> {
    let scratch = tempfile::Builder::new()
        .prefix("stanrun-")
        .tempdir()
        .map_err(StanError::io(std::env::temp_dir()))?;

    let executable = model.resolve(cmdstan, &scratch.path().join("build")).await?;
    obs::emit_fit_started(
        run_id,
        model.path(),
        config.method.token(),
        config.chains,
        scheduler.workers(),
    );

    let layout = ChainLayout::new(scratch.path().join("chains"));
    let tasks = (0..config.chains)
        .map(|chain| ChainTask::new(chain, &executable, &layout, config, Arc::clone(&dump)))
        .collect();
    let results = scheduler.run_all(run_id, tasks).await?;

    let diagnostics = if config.wants_diagnostics() {
        let outputs: Vec<PathBuf> = results.iter().map(|r| r.output_file.clone()).collect();
        run_diagnostics(cmdstan, run_id, &outputs).await
    } else {
        Diagnostics::Skipped
    };

    let handle = FitHandle {
        run_id: run_id.to_string(),
        model: model.clone(),
        data: data.clone(),
        config: config.clone(),
        chains: results.into_iter().map(|r| r.table).collect(),
        diagnostics,
        completed_at: Utc::now(),
    };
    handle.save(&config.save, &executable, &dump)?;
    Ok(handle)
}
