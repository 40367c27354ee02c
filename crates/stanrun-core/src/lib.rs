//! stanrun core library
//!
//! Runs CmdStan model executables as independent chains, parses their CSV
//! output and merges the per-chain results.
//!
//! ```ignore
//! let cmdstan = CmdStan::from_env();
//! let model = ModelReference::from_path("bernoulli.stan");
//! let data = DataBindings::new().with("N", 5).with("y", vec![0, 0, 0, 1, 1]);
//! let fit = run(&cmdstan, &model, &data, &RunConfig::default().with_workers(4)).await?;
//! let theta = &fit.extract_columns(&["theta"])?["theta"];
//! ```

pub mod aggregate;
pub mod args;
pub mod config;
pub mod data;
pub mod diagnostics;
pub mod error;
pub mod fit;
pub mod invoker;
pub mod model;
pub mod obs;
pub mod scheduler;
pub mod table;
pub mod telemetry;

pub use aggregate::{merge, merge_columns};
pub use args::{ArgBuilder, ArgToken, Method, MethodArgs};
pub use config::{RunConfig, SaveOptions, DEFAULT_CHAINS, DEFAULT_ITER};
pub use data::{DataBindings, DataValue};
pub use diagnostics::{run_diagnostics, Diagnostics, DiagnosticsRunner};
pub use error::{ColumnSide, Result, StanError};
pub use fit::{run, run_with_scheduler, FitHandle};
pub use invoker::{chain_args, ChainLayout, ChainOutput, ChainRunner, ChainTask, ProcessRunner};
pub use model::{build_executable, CmdStan, ModelReference};
pub use obs::{
    emit_chain_failed, emit_chain_finished, emit_chain_started, emit_diagnostics_unavailable,
    emit_fit_finished, emit_fit_started, emit_model_compiled, emit_result_save_skipped, fit_span,
};
pub use scheduler::{ChainResult, Scheduler};
pub use table::{parse_result_file, parse_result_reader, ResultTable};
