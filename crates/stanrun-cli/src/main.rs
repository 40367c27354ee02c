//! stanrun - run CmdStan models from the command line
//!
//! ## Commands
//!
//! - `run`: fit a model (source or executable) with several chains
//! - `build`: compile a `.stan` file into an executable
//! - `merge`: merge per-chain CmdStan CSV files

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::Level;

use stanrun_core::{
    merge, merge_columns, parse_result_file, CmdStan, DataBindings, Diagnostics, Method,
    MethodArgs, ModelReference, ResultTable, RunConfig, SaveOptions,
};

#[derive(Parser)]
#[command(name = "stanrun")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run CmdStan models across parallel chains", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model and print a summary of the draws
    Run(RunArgs),

    /// Compile a Stan model into an executable
    Build {
        /// Stan source file
        model: PathBuf,

        /// Where to place the executable
        output: PathBuf,

        /// CmdStan installation directory
        #[arg(long, env = "CMDSTAN")]
        cmdstan: Option<PathBuf>,
    },

    /// Merge per-chain CmdStan CSV files
    Merge {
        /// Output CSV files, in chain order
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Only keep these columns
        #[arg(long, value_delimiter = ',')]
        columns: Vec<String>,

        /// Write the merged table as CSV
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Stan source (`.stan`) or compiled model executable
    model: PathBuf,

    /// Input data, JSON object or dump format
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// Number of chains
    #[arg(short, long, default_value_t = stanrun_core::DEFAULT_CHAINS)]
    chains: usize,

    /// Retained iterations per chain
    #[arg(short, long, default_value_t = stanrun_core::DEFAULT_ITER)]
    iter: u32,

    /// Warmup iterations per chain (sample only)
    #[arg(long)]
    warmup: Option<u32>,

    /// sample, optimize or variational
    #[arg(short, long, default_value = "sample")]
    method: Method,

    /// Validated method arguments, e.g. "adapt delta=0.95"
    #[arg(long)]
    args: Option<String>,

    /// Extra arguments passed through without validation
    #[arg(long)]
    raw_args: Option<String>,

    /// Maximum number of chains running at once (default: one at a time)
    #[arg(short, long, env = "STANRUN_WORKERS")]
    workers: Option<usize>,

    /// Random seed shared by all chains
    #[arg(long)]
    seed: Option<u64>,

    /// Per-chain timeout in seconds (0 = none)
    #[arg(long, default_value_t = 0)]
    timeout: u64,

    /// Print only these columns
    #[arg(long, value_delimiter = ',')]
    columns: Vec<String>,

    /// Skip the diagnose step
    #[arg(long)]
    no_diagnostics: bool,

    /// Copy the executable here
    #[arg(long)]
    save_binary: Option<PathBuf>,

    /// Write the input data here in dump format
    #[arg(long)]
    save_data: Option<PathBuf>,

    /// Write the merged CSV here
    #[arg(long)]
    save_result: Option<PathBuf>,

    /// Write the diagnostics report here
    #[arg(long)]
    save_diagnostics: Option<PathBuf>,

    /// CmdStan installation directory
    #[arg(long, env = "CMDSTAN")]
    cmdstan: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    stanrun_core::telemetry::init_tracing(cli.json_logs, level);

    match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::Build {
            model,
            output,
            cmdstan,
        } => cmd_build(&model, &output, cmdstan).await,
        Commands::Merge {
            files,
            columns,
            output,
            json,
        } => cmd_merge(&files, &columns, output.as_deref(), json),
    }
}

fn cmdstan_from(home: Option<PathBuf>) -> CmdStan {
    let mut cmdstan = CmdStan::from_env();
    if home.is_some() {
        cmdstan.home = home;
    }
    cmdstan
}

/// Read `.json` files as a JSON object, anything else as dump format.
fn load_data(path: Option<&Path>) -> Result<DataBindings> {
    let Some(path) = path else {
        return Ok(DataBindings::new());
    };
    if path.extension().is_some_and(|ext| ext == "json") {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Invalid JSON data in {}", path.display()))
    } else {
        DataBindings::read_dump(path).with_context(|| format!("Invalid dump data in {}", path.display()))
    }
}

fn run_config(args: &RunArgs) -> Result<RunConfig> {
    let mut config = RunConfig::new(args.method)
        .with_iter(args.iter)
        .with_chains(args.chains)
        .with_chain_timeout(args.timeout)
        .with_save(SaveOptions {
            binary: args.save_binary.clone(),
            data: args.save_data.clone(),
            result: args.save_result.clone(),
            diagnostics: args.save_diagnostics.clone(),
        });
    if let Some(text) = &args.args {
        config = config.with_args(
            MethodArgs::parse(args.method, text).context("Invalid --args")?,
        );
    }
    if let Some(raw) = &args.raw_args {
        config = config.with_raw_args(raw.clone());
    }
    if let Some(warmup) = args.warmup {
        config = config.with_warmup(warmup);
    }
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }
    if args.no_diagnostics {
        config = config.without_diagnostics();
    }
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
struct ColumnSummary {
    len: usize,
    mean: Option<f64>,
}

fn summarize(table: &ResultTable) -> BTreeMap<String, ColumnSummary> {
    table
        .iter()
        .map(|(name, values)| {
            let mean = (!values.is_empty())
                .then(|| values.iter().sum::<f64>() / values.len() as f64);
            (
                name.to_string(),
                ColumnSummary {
                    len: values.len(),
                    mean,
                },
            )
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct RunOutput {
    run_id: String,
    chains: usize,
    rows_per_chain: Vec<usize>,
    diagnostics: Diagnostics,
    columns: BTreeMap<String, ColumnSummary>,
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let config = run_config(&args)?;
    let data = load_data(args.data.as_deref())?;
    let cmdstan = cmdstan_from(args.cmdstan.clone());
    let model = ModelReference::from_path(&args.model);

    let fit = stanrun_core::run(&cmdstan, &model, &data, &config)
        .await
        .with_context(|| format!("Failed to fit {}", args.model.display()))?;

    if !args.columns.is_empty() {
        let draws = fit.extract_columns(args.columns.as_slice())?;
        println!("{}", serde_json::to_string_pretty(&draws)?);
        return Ok(());
    }

    let output = RunOutput {
        run_id: fit.run_id().to_string(),
        chains: fit.chains().len(),
        rows_per_chain: fit.chains().iter().map(ResultTable::row_count).collect(),
        diagnostics: fit.diagnostics().clone(),
        columns: summarize(&fit.merged()?),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Run {} ({} chains)", output.run_id, output.chains);
        print_summary(&output.columns);
        println!("\nDiagnostics: {}", output.diagnostics);
    }
    Ok(())
}

async fn cmd_build(model: &Path, output: &Path, home: Option<PathBuf>) -> Result<()> {
    if !matches!(ModelReference::from_path(model), ModelReference::Source(_)) {
        bail!("{} is not a .stan file", model.display());
    }
    let built = cmdstan_from(home)
        .build_executable(model, output)
        .await
        .with_context(|| format!("Failed to build {}", model.display()))?;
    println!("Built {}", built.display());
    Ok(())
}

fn cmd_merge(files: &[PathBuf], columns: &[String], output: Option<&Path>, json: bool) -> Result<()> {
    let tables = files
        .iter()
        .map(|path| parse_result_file(path).with_context(|| format!("Failed to parse {}", path.display())))
        .collect::<Result<Vec<_>>>()?;

    let merged = if columns.is_empty() {
        merge(&tables)?
    } else {
        merge_columns(&tables, columns)?
    };

    if let Some(path) = output {
        merged
            .write_csv(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    let summary = summarize(&merged);
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Merged {} files, {} rows", files.len(), merged.row_count());
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(columns: &BTreeMap<String, ColumnSummary>) {
    for (name, summary) in columns {
        match summary.mean {
            Some(mean) => println!("  {name:<24} n={:<8} mean={mean:.4}", summary.len),
            None => println!("  {name:<24} n={:<8} mean=-", summary.len),
        }
    }
}
