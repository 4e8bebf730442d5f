//! nightmend - overnight test-suite remediation
//!
//! Runs the test suite on a schedule and repairs failures: deterministic
//! pattern fixes first, then fixes learned from earlier runs, then
//! AI-generated patches. Every edit is backed up; a cycle that cannot fix
//! everything is rolled back.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nightmend::ai::{AiBackend, OpenRouterBackend};
use nightmend::config::{self, Config};
use nightmend::dispatch::FixDispatcher;
use nightmend::learning::LearningStore;
use nightmend::orchestrator::{CycleOutcome, Orchestrator, PublishPolicy};
use nightmend::patch::FixPayload;
use nightmend::runner::CommandTestRunner;
use nightmend::vcs::GitVcs;
use nightmend::{logging, FixResult};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "nightmend",
    about = "Runs your test suite on a schedule and repairs what fails",
    version
)]
struct Args {
    /// Path to the project (defaults to current directory)
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Config file (defaults to <project>/.nightmend/config.json)
    #[arg(long, global = true, env = "NIGHTMEND_CONFIG")]
    config: Option<PathBuf>,

    /// Run a single cycle and exit with its outcome
    #[arg(long)]
    once: bool,

    #[arg(long)]
    max_retries: Option<u32>,

    #[arg(long)]
    interval_minutes: Option<u64>,

    /// Directory failing test paths are relative to
    #[arg(long)]
    test_root: Option<PathBuf>,

    /// Test command, e.g. "pytest -rf --tb=short tests/"
    #[arg(long)]
    test_command: Option<String>,

    /// Skip the AI tier
    #[arg(long)]
    no_ai: bool,

    /// Do not commit or push after a successful cycle
    #[arg(long)]
    no_publish: bool,

    /// Default log filter (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the effective configuration to <project>/.nightmend/config.json
    Init,
    /// Record a fix for an error text
    Learn {
        /// Error text (matched as a substring of future errors)
        error: String,
        /// Fix payload: tagged JSON, a unified diff, or a definition to append
        #[arg(required_unless_present = "payload_file")]
        payload: Option<String>,
        /// Read the payload from a file instead
        #[arg(long, conflicts_with = "payload")]
        payload_file: Option<PathBuf>,
    },
    /// List learned fixes in lookup order
    Learned,
}

impl Args {
    fn apply_to(&self, config: &mut Config) {
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
        if let Some(n) = self.interval_minutes {
            config.interval_minutes = n;
        }
        if let Some(root) = &self.test_root {
            config.test_root = root.clone();
        }
        if let Some(command) = &self.test_command {
            config.test_command = command.clone();
        }
        if self.no_ai {
            config.ai_enabled = false;
        }
        if self.no_publish {
            config.publish = false;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

type Daemon = Orchestrator<CommandTestRunner, GitVcs>;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let project_root = args
        .path
        .canonicalize()
        .with_context(|| format!("Project path {} does not exist", args.path.display()))?;
    let mut config = Config::load(args.config.as_deref(), &project_root)?;
    config.apply_env()?;
    args.apply_to(&mut config);
    config.validate()?;
    logging::init(&config.log_level)?;

    match &args.command {
        Some(Command::Init) => {
            let path = config.save_to_project()?;
            println!("Wrote {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Learn {
            error,
            payload,
            payload_file,
        }) => learn(&config, error, payload.as_deref(), payload_file.as_deref()),
        Some(Command::Learned) => list_learned(&config),
        None => run(config, args.once).await,
    }
}

async fn run(config: Config, once: bool) -> Result<ExitCode> {
    let mut daemon = build_daemon(&config)?;

    if once {
        let (_, result) = run_cycle(daemon).await?;
        return Ok(if report(&result) {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    let period = Duration::from_secs(config.interval_minutes * 60);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(interval_minutes = config.interval_minutes, "scheduler started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (returned, result) = run_cycle(daemon).await?;
                daemon = returned;
                report(&result);
                info!(next_in_minutes = config.interval_minutes, "cycle done");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; shutting down");
                return Ok(ExitCode::SUCCESS);
            }
        }
    }
}

/// Run one cycle off the async runtime. The daemon is moved in and handed
/// back, so two cycles can never overlap.
async fn run_cycle(mut daemon: Daemon) -> Result<(Daemon, FixResult<CycleOutcome>)> {
    tokio::task::spawn_blocking(move || {
        let result = daemon.run_cycle();
        (daemon, result)
    })
    .await
    .context("remediation cycle panicked")
}

/// Print the outcome for the user; true on success.
fn report(result: &FixResult<CycleOutcome>) -> bool {
    match result {
        Ok(outcome) if outcome.is_success() => {
            info!(%outcome, "cycle succeeded");
            println!("{}", outcome);
            true
        }
        Ok(outcome) => {
            warn!(%outcome, "cycle did not fix the suite");
            println!("{}", outcome);
            false
        }
        Err(err) => {
            error!(error = %err, "cycle aborted");
            eprintln!("cycle aborted: {}", err);
            false
        }
    }
}

fn build_daemon(config: &Config) -> Result<Daemon> {
    let store = LearningStore::load(config.learning_store_path())?;
    let dispatcher = FixDispatcher::new(
        &config.project_root,
        config.test_root_path(),
        store,
        build_ai_backend(config)?,
    )
    .with_chunk_lines(config.chunk_lines);

    let runner = CommandTestRunner::new(
        config.test_root_path(),
        &config.test_command,
        Duration::from_secs(config.test_timeout_secs),
    )?;

    Ok(Orchestrator::new(runner, GitVcs::new(&config.project_root), dispatcher)
        .with_max_retries(config.max_retries)
        .with_publish(PublishPolicy {
            enabled: config.publish,
            commit_message: config.commit_message.clone(),
        }))
}

fn build_ai_backend(config: &Config) -> Result<Option<Box<dyn AiBackend>>> {
    if !config.ai_enabled {
        info!("AI tier disabled");
        return Ok(None);
    }
    let Some(key) = config::api_key() else {
        warn!("no NIGHTMEND_API_KEY or OPENROUTER_API_KEY set; AI tier disabled");
        return Ok(None);
    };
    let backend = OpenRouterBackend::new(Handle::current(), key, config.ai_model.clone())?;
    info!(model = backend.model(), "AI tier enabled");
    Ok(Some(Box::new(backend)))
}

fn learn(
    config: &Config,
    error: &str,
    payload: Option<&str>,
    payload_file: Option<&std::path::Path>,
) -> Result<ExitCode> {
    let payload = match (payload, payload_file) {
        (Some(text), _) => text.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, None) => bail!("a payload or --payload-file is required"),
    };
    if error.trim().is_empty() {
        bail!("error text must not be empty");
    }
    let resolved = FixPayload::resolve(&payload)
        .with_context(|| "payload is not a recognized fix (tagged JSON, unified diff, or definition)")?;

    let mut store = LearningStore::load(config.learning_store_path())?;
    store.store(error, resolved.to_stored())?;
    println!(
        "Learned {} fix for \"{}\" ({} entries in {})",
        resolved.kind(),
        error,
        store.len(),
        store.path().display()
    );
    Ok(ExitCode::SUCCESS)
}

fn list_learned(config: &Config) -> Result<ExitCode> {
    let store = LearningStore::load(config.learning_store_path())?;
    if store.is_empty() {
        println!("No learned fixes in {}", store.path().display());
        return Ok(ExitCode::SUCCESS);
    }
    for (i, entry) in store.entries().iter().enumerate() {
        let kind = FixPayload::resolve(&entry.payload)
            .map(|p| p.kind())
            .unwrap_or("marker");
        println!("{:>3}. [{}] {}", i + 1, kind, entry.error);
    }
    Ok(ExitCode::SUCCESS)
}
