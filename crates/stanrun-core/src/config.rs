//! Run configuration.

use std::path::PathBuf;

use serde::Serialize;

use crate::args::{Method, MethodArgs};
use crate::error::{Result, StanError};

/// Default number of retained iterations per chain.
pub const DEFAULT_ITER: u32 = 2000;

/// Default number of chains.
pub const DEFAULT_CHAINS: usize = 4;

/// Optional locations to copy run artifacts to once a fit completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SaveOptions {
    /// Copy of the executable that was run.
    pub binary: Option<PathBuf>,
    /// Input data in dump format.
    pub data: Option<PathBuf>,
    /// Merged CSV across all chains.
    pub result: Option<PathBuf>,
    /// Diagnostics report text.
    pub diagnostics: Option<PathBuf>,
}

impl SaveOptions {
    pub fn is_empty(&self) -> bool {
        self.binary.is_none()
            && self.data.is_none()
            && self.result.is_none()
            && self.diagnostics.is_none()
    }
}

/// Configuration of a multi-chain run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfig {
    /// CmdStan method.
    pub method: Method,

    /// Retained iterations per chain (`num_samples` for sampling, the
    /// iteration cap for optimization, `output_samples` for variational).
    pub iter: u32,

    /// Number of independent chains.
    pub chains: usize,

    /// Warmup iterations per chain; sampling only. `None` keeps CmdStan's default.
    pub warmup: Option<u32>,

    /// Base random seed shared by all chains; chains differ by their `id`.
    pub seed: Option<u64>,

    /// Validated method arguments.
    pub args: MethodArgs,

    /// Unvalidated extra tokens appended after `args`.
    pub raw_args: Option<String>,

    /// Maximum number of chain processes running at once. `None` runs chains
    /// one after another.
    pub workers: Option<usize>,

    /// Per-chain timeout in seconds (0 = none).
    pub chain_timeout_secs: u64,

    /// Run CmdStan's `diagnose` tool after sampling.
    pub diagnostics: bool,

    /// Where to copy artifacts after the run.
    pub save: SaveOptions,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::new(Method::Sample)
    }
}

impl RunConfig {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            iter: DEFAULT_ITER,
            chains: DEFAULT_CHAINS,
            warmup: None,
            seed: None,
            args: MethodArgs::empty(method),
            raw_args: None,
            workers: None,
            chain_timeout_secs: 0,
            diagnostics: true,
            save: SaveOptions::default(),
        }
    }

    pub fn with_iter(mut self, iter: u32) -> Self {
        self.iter = iter;
        self
    }

    pub fn with_chains(mut self, chains: usize) -> Self {
        self.chains = chains;
        self
    }

    pub fn with_warmup(mut self, warmup: u32) -> Self {
        self.warmup = Some(warmup);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_args(mut self, args: MethodArgs) -> Self {
        self.args = args;
        self
    }

    pub fn with_raw_args(mut self, raw: impl Into<String>) -> Self {
        self.raw_args = Some(raw.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_chain_timeout(mut self, secs: u64) -> Self {
        self.chain_timeout_secs = secs;
        self
    }

    pub fn without_diagnostics(mut self) -> Self {
        self.diagnostics = false;
        self
    }

    pub fn with_save(mut self, save: SaveOptions) -> Self {
        self.save = save;
        self
    }

    /// Check the invariants a run relies on.
    pub fn validate(&self) -> Result<()> {
        if self.chains == 0 {
            return Err(StanError::InvalidConfig("chains must be at least 1".to_string()));
        }
        if self.iter == 0 {
            return Err(StanError::InvalidConfig("iter must be at least 1".to_string()));
        }
        if !self.args.is_empty() && self.args.method() != self.method {
            return Err(StanError::InvalidConfig(format!(
                "arguments were built for {} but the run method is {}",
                self.args.method(),
                self.method
            )));
        }
        if self.warmup.is_some() && self.method != Method::Sample {
            return Err(StanError::InvalidConfig(format!(
                "warmup only applies to sample, not {}",
                self.method
            )));
        }
        Ok(())
    }

    /// Number of chain processes allowed to run at once.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or(1).clamp(1, self.chains.max(1))
    }

    /// Whether the diagnose tool should run for this configuration.
    pub fn wants_diagnostics(&self) -> bool {
        self.diagnostics && self.method == Method::Sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.method, Method::Sample);
        assert_eq!(config.iter, 2000);
        assert_eq!(config.chains, 4);
        assert!(config.diagnostics);
        assert!(config.save.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_chains_or_iter_rejected() {
        assert!(RunConfig::default().with_chains(0).validate().is_err());
        assert!(RunConfig::default().with_iter(0).validate().is_err());
    }

    #[test]
    fn test_args_must_match_method() {
        let args = MethodArgs::parse(Method::Optimize, "algorithm=newton").unwrap();
        let config = RunConfig::new(Method::Sample).with_args(args.clone());
        assert!(matches!(config.validate(), Err(StanError::InvalidConfig(_))));

        let config = RunConfig::new(Method::Optimize).with_args(args);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_warmup_only_for_sampling() {
        assert!(RunConfig::new(Method::Sample).with_warmup(500).validate().is_ok());
        assert!(RunConfig::new(Method::Optimize).with_warmup(500).validate().is_err());
    }

    #[test]
    fn test_worker_count_is_bounded() {
        assert_eq!(RunConfig::default().worker_count(), 1);
        assert_eq!(RunConfig::default().with_workers(0).worker_count(), 1);
        assert_eq!(RunConfig::default().with_workers(2).worker_count(), 2);
        assert_eq!(RunConfig::default().with_workers(64).worker_count(), 4);
    }

    #[test]
    fn test_diagnostics_only_for_sampling() {
        assert!(RunConfig::new(Method::Sample).wants_diagnostics());
        assert!(!RunConfig::new(Method::Variational).wants_diagnostics());
        assert!(!RunConfig::new(Method::Sample).without_diagnostics().wants_diagnostics());
    }
}
