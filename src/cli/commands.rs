//! CLI command definitions for taskcheck.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::summary::{build_summary, print_text_summary};
use crate::eval::{EvalError, EvalResult, EvalRunner, EvalSpec, LogProgress};

/// Runs AI agents against declarative tasks and verifies what they did.
#[derive(Parser)]
#[command(name = "taskcheck")]
#[command(about = "Run AI agents against declarative tasks and verify what they did")]
#[command(version)]
#[command(
    long_about = "taskcheck runs an agent against every task of an eval file, verifies the outcome with scripts, HTTP checks, extensions or an LLM judge, and writes the results as JSON.\n\nExample usage:\n  taskcheck run eval.yaml --parallel 4 --run 'pod'"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run an evaluation.
    #[command(alias = "check")]
    Run(RunArgs),

    /// Show a compact summary of a results file.
    Summary(SummaryArgs),
}

/// Arguments for `taskcheck run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the eval file.
    pub eval_file: PathBuf,

    /// Regular expression; only tasks whose name matches are run.
    #[arg(short, long, default_value = "")]
    pub run: String,

    /// Only run tasks with these labels (k=v,k2=v2).
    #[arg(short = 'l', long)]
    pub label_selector: Option<String>,

    /// Number of tasks to run at once. 0 uses the number of CPUs.
    #[arg(short, long, default_value = "1", env = "TASKCHECK_PARALLEL")]
    pub parallel: usize,

    /// Where to write the JSON results. Defaults to taskcheck-<eval name>-out.json.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments for `taskcheck summary`.
#[derive(Parser, Debug)]
pub struct SummaryArgs {
    /// Results file written by `taskcheck run`.
    pub results_file: PathBuf,

    /// Only include tasks whose name contains this text.
    #[arg(long)]
    pub task: Option<String>,

    /// Output format (text, json).
    #[arg(short, long, default_value = "text")]
    pub format: String,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and run the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with already parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_eval_command(args).await,
        Commands::Summary(args) => run_summary_command(args),
    }
}

async fn run_eval_command(args: RunArgs) -> anyhow::Result<()> {
    let mut spec = EvalSpec::from_file(&args.eval_file).context("failed to load eval config")?;

    if let Some(selector) = &args.label_selector {
        spec.apply_label_selector(selector)
            .context("failed to apply label selector")?;
    }

    let parallel = match args.parallel {
        0 => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        n => n,
    };

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("taskcheck-{}-out.json", spec.name())));

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling evaluation");
                cancel.cancel();
            }
        })
    };

    let runner = EvalRunner::new(spec).with_parallelism(parallel);
    let results = runner
        .run_with_progress(&cancel, &args.run, &LogProgress)
        .await;
    ctrl_c.abort();
    let results = results.context("eval failed")?;

    save_results(&results, &output)?;
    info!(path = %output.display(), "Results saved");

    log_results(&results);
    if cancel.is_cancelled() {
        return Err(EvalError::Cancelled.into());
    }
    Ok(())
}

fn save_results(results: &[EvalResult], path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(results).context("failed to serialize results")?;
    fs::write(path, json)
        .with_context(|| format!("failed to save results to {}", path.display()))?;
    Ok(())
}

fn log_results(results: &[EvalResult]) {
    for result in results {
        if result.task_passed && result.all_assertions_passed {
            info!(task = %result.task_name, "PASSED");
        } else {
            warn!(
                task = %result.task_name,
                task_passed = result.task_passed,
                assertions_passed = result.all_assertions_passed,
                error = %result.task_error,
                "FAILED"
            );
        }
    }

    let passed = results.iter().filter(|r| r.task_passed).count();
    let assertions = results.iter().filter(|r| r.all_assertions_passed).count();
    info!(
        total = results.len(),
        passed,
        assertions_passed = assertions,
        "Evaluation finished"
    );
}

fn run_summary_command(args: SummaryArgs) -> anyhow::Result<()> {
    let data = fs::read_to_string(&args.results_file)
        .with_context(|| format!("failed to read {}", args.results_file.display()))?;
    let mut results: Vec<EvalResult> =
        serde_json::from_str(&data).context("failed to parse results file")?;

    if let Some(filter) = &args.task {
        results.retain(|r| r.task_name.contains(filter.as_str()));
    }

    let summary = build_summary(&args.results_file.display().to_string(), &results);
    match args.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        "text" => print_text_summary(&summary),
        other => anyhow::bail!("unknown output format: {}", other),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_args() {
        let cli = Cli::try_parse_from([
            "taskcheck",
            "run",
            "eval.yaml",
            "-r",
            "pod",
            "-l",
            "suite=k8s",
            "-p",
            "4",
            "-o",
            "out.json",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.eval_file, PathBuf::from("eval.yaml"));
        assert_eq!(args.run, "pod");
        assert_eq!(args.label_selector.as_deref(), Some("suite=k8s"));
        assert_eq!(args.parallel, 4);
        assert_eq!(args.output, Some(PathBuf::from("out.json")));
    }

    #[test]
    fn test_save_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let results = vec![EvalResult {
            task_name: "t".into(),
            ..Default::default()
        }];
        save_results(&results, &path).unwrap();
        let loaded: Vec<EvalResult> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, results);
    }
}
