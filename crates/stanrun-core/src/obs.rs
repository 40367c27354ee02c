//! Structured lifecycle events for fits and chains.
//!
//! Every emitter logs at `info!` (failures at `warn!`) with an
//! `event = "<domain>.<action>"` field so log pipelines can filter on it.

use std::path::Path;

use tracing::{info, warn};

/// Span covering one fit; attach with [`tracing::Instrument`] so chain
/// events carry the `run_id`.
pub fn fit_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("stanrun.fit", run_id = %run_id)
}

/// Emit event: fit started.
pub fn emit_fit_started(run_id: &str, model: &Path, method: &str, chains: usize, workers: usize) {
    info!(
        event = "fit.started",
        run_id = %run_id,
        model = %model.display(),
        method = %method,
        chains = chains,
        workers = workers,
    );
}

/// Emit event: one chain process launched.
pub fn emit_chain_started(run_id: &str, chain: usize) {
    info!(event = "chain.started", run_id = %run_id, chain = chain);
}

/// Emit event: chain finished and its output parsed.
pub fn emit_chain_finished(run_id: &str, chain: usize, rows: usize, duration_ms: u64) {
    info!(
        event = "chain.finished",
        run_id = %run_id,
        chain = chain,
        rows = rows,
        duration_ms = duration_ms,
    );
}

/// Emit event: chain failed (warning level).
pub fn emit_chain_failed(run_id: &str, chain: usize, error: &dyn std::fmt::Display) {
    warn!(event = "chain.failed", run_id = %run_id, chain = chain, error = %error);
}

/// Emit event: fit completed or aborted.
pub fn emit_fit_finished(run_id: &str, duration_ms: u64, total_rows: usize, success: bool) {
    info!(
        event = "fit.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        total_rows = total_rows,
        success = success,
    );
}

/// Emit event: a model source was compiled.
pub fn emit_model_compiled(model: &Path, executable: &Path) {
    info!(
        event = "model.compiled",
        model = %model.display(),
        executable = %executable.display(),
    );
}

/// Emit event: the diagnose step could not run (warning level).
pub fn emit_diagnostics_unavailable(run_id: &str, reason: &str) {
    warn!(event = "diagnostics.unavailable", run_id = %run_id, reason = %reason);
}

/// Emit event: the merged result could not be built, so it was not saved
/// (warning level).
pub fn emit_result_save_skipped(run_id: &str, path: &Path, error: &dyn std::fmt::Display) {
    warn!(
        event = "result.save_skipped",
        run_id = %run_id,
        path = %path.display(),
        error = %error,
    );
}
