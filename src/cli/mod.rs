//! # Command Line
//!
//! `runman run` executes a collection file and exits non-zero when any
//! failure was recorded. `runman history` lists runs kept in a store.

mod report;

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::collections::{Collection, Entrypoint, EntrypointLookup};
use crate::environment::Environment;
use crate::runner::{RunOptions, Runner, RunnerOptions};
use crate::storage::RunStore;

pub use report::Reporter;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURES: i32 = 1;
pub const EXIT_SETUP_ERROR: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "runman", version, about = "Run HTTP request collections from the command line")]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a collection
    Run(RunArgs),
    /// List runs recorded in a store
    History(HistoryArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReporterKind {
    Cli,
    Json,
    Events,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Collection JSON file
    pub collection: PathBuf,

    #[arg(short, long)]
    pub environment: Option<PathBuf>,
    #[arg(short, long)]
    pub globals: Option<PathBuf>,
    /// JSON array of objects, one per iteration
    #[arg(short = 'd', long)]
    pub iteration_data: Option<PathBuf>,
    #[arg(short = 'n', long)]
    pub iteration_count: Option<u32>,

    /// Run only this folder or request. Repeat to select several.
    #[arg(long = "folder")]
    pub folders: Vec<String>,

    /// Stop after the current item on the first error or failure
    #[arg(long)]
    pub bail: bool,
    #[arg(long)]
    pub abort_on_error: bool,

    #[arg(long, value_name = "MS")]
    pub delay_request: Option<u64>,
    #[arg(long, value_name = "MS")]
    pub timeout: Option<u64>,
    #[arg(long, value_name = "MS")]
    pub timeout_request: Option<u64>,

    /// Accept invalid TLS certificates
    #[arg(short = 'k', long)]
    pub insecure: bool,
    #[arg(long)]
    pub ignore_redirects: bool,
    #[arg(long)]
    pub max_redirects: Option<u32>,

    #[arg(long = "env-var", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub env_vars: Vec<(String, String)>,
    #[arg(long = "global-var", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub global_vars: Vec<(String, String)>,

    /// Run options file (TOML, or JSON by extension). Flags override it.
    #[arg(long, env = "RUNMAN_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ReporterKind::Cli)]
    pub reporter: ReporterKind,
    #[arg(long)]
    pub export_summary: Option<PathBuf>,
    #[arg(long)]
    pub export_environment: Option<PathBuf>,
    #[arg(long)]
    pub export_globals: Option<PathBuf>,

    /// SQLite file to record the run in
    #[arg(long, env = "RUNMAN_STORE")]
    pub store: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct HistoryArgs {
    #[arg(long, env = "RUNMAN_STORE")]
    pub store: PathBuf,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
    /// Print one JSON object per run
    #[arg(long)]
    pub json: bool,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in `{raw}`"));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

pub async fn dispatch(cli: Cli) -> Result<i32, String> {
    match cli.cmd {
        Command::Run(args) => run(args).await,
        Command::History(args) => history(args),
    }
}

impl RunArgs {
    /// Merge the options file and the flags into run options.
    pub fn run_options(&self) -> Result<RunOptions, String> {
        let mut options = match &self.config {
            Some(path) => RunOptions::load(path)?,
            None => RunOptions::default(),
        };

        if let Some(path) = &self.environment {
            options.environment = Environment::load(path)?.values;
        }
        if let Some(path) = &self.globals {
            options.globals = Environment::load(path)?.values;
        }
        for (key, value) in &self.env_vars {
            options.environment.set(key.clone(), value.clone());
        }
        for (key, value) in &self.global_vars {
            options.globals.set(key.clone(), value.clone());
        }
        if let Some(path) = &self.iteration_data {
            options.data = RunOptions::load_data(path)?;
        }
        if self.iteration_count.is_some() {
            options.iteration_count = self.iteration_count;
        }

        match self.folders.as_slice() {
            [] => {}
            [single] => options.entrypoint = Some(Entrypoint::id_or_name(single.clone())),
            many => {
                options.entrypoint = Some(Entrypoint {
                    targets: many.to_vec(),
                    lookup: EntrypointLookup::MultipleIdOrName,
                    follow_order: false,
                })
            }
        }

        if self.bail {
            options.stop_on_error = true;
            options.stop_on_failure = true;
        }
        if self.abort_on_error {
            options.abort_on_error = true;
            options.stop_on_error = false;
        }
        if let Some(ms) = self.delay_request {
            options.item_delay_ms = ms;
        }
        if self.timeout.is_some() {
            options.global_timeout_ms = self.timeout;
        }
        if self.timeout_request.is_some() {
            options.request_timeout_ms = self.timeout_request;
        }

        if self.insecure || self.ignore_redirects || self.max_redirects.is_some() {
            let requester = options.requester.get_or_insert_with(Default::default);
            if self.insecure {
                requester.strict_ssl = false;
            }
            if self.ignore_redirects {
                requester.follow_redirects = false;
            }
            if let Some(max) = self.max_redirects {
                requester.max_redirects = max;
            }
        }

        Ok(options)
    }
}

async fn run(args: RunArgs) -> Result<i32, String> {
    let collection = Collection::load(&args.collection).map_err(|err| err.to_string())?;
    let options = args.run_options()?;

    let runner = Runner::new(RunnerOptions::default());
    let run = runner
        .run(&collection, options)
        .map_err(|err| err.to_string())?;

    let handle = run.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, aborting run");
            handle.abort();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut reporter = Reporter::new(args.reporter);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            reporter.on_event(&event);
        }
        reporter
    });

    let summary = run.start(tx).await;
    let reporter = printer
        .await
        .map_err(|err| format!("Reporter task failed: {err}"))?;
    reporter.finish(&summary);

    if let Some(path) = &args.export_summary {
        let raw = serde_json::to_string_pretty(&summary)
            .map_err(|err| format!("Failed to serialize run summary: {err}"))?;
        std::fs::write(path, raw)
            .map_err(|err| format!("Failed to write summary `{}`: {err}", path.display()))?;
    }
    if let Some(path) = &args.export_environment {
        let environment = Environment {
            id: String::new(),
            name: collection.info.name.clone(),
            values: summary.environment.clone(),
        };
        environment.save(path)?;
    }
    if let Some(path) = &args.export_globals {
        let globals = Environment {
            id: String::new(),
            name: "globals".into(),
            values: summary.globals.clone(),
        };
        globals.save(path)?;
    }
    if let Some(path) = &args.store {
        let store = RunStore::open(path)?;
        store.record_run(&summary)?;
        info!(run_id = %summary.run_id, store = %path.display(), "run recorded");
    }

    Ok(if summary.has_failures() {
        EXIT_FAILURES
    } else {
        EXIT_SUCCESS
    })
}

fn history(args: HistoryArgs) -> Result<i32, String> {
    let store = RunStore::open(&args.store)?;
    let runs = store.recent_runs(args.limit)?;

    for run in &runs {
        if args.json {
            let line = serde_json::to_string(run)
                .map_err(|err| format!("Failed to serialize run: {err}"))?;
            println!("{line}");
        } else {
            println!(
                "{}  {:<9}  {:>4} failures  {:>7}ms  {}  {}",
                run.started_at, run.status, run.failures, run.duration_ms, run.run_id, run.collection_name
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
