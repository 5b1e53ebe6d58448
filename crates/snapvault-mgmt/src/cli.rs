use crate::config::VaultConfig;
use crate::discovery::discover_from_env;
use crate::gate::{AllowList, Gate, GateRefusal, ORIGINAL_COMMAND_VAR};
use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use snapvault_repl::{
    new_cancel_pair, CancelHandle, CancelReason, CompensationStack, ExecutorOptions,
    JobExecutor, JobSet, PlannedTransfer, ProcessInvoker, ToolPaths, VaultError,
};
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "svault")]
#[command(about = "btrfs snapshot, backup and retention runner", long_about = None)]
pub struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Where job files come from.
#[derive(Args, Debug, Clone)]
pub struct JobFiles {
    /// Job file; may be given more than once.
    #[arg(short, long = "config", value_name = "FILE")]
    pub config: Vec<PathBuf>,

    /// Load every *.toml in this directory.
    #[arg(long, value_name = "DIR", env = "SVAULT_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,
}

impl JobFiles {
    pub fn load(&self) -> std::result::Result<VaultConfig, VaultError> {
        VaultConfig::load(&self.config, self.config_dir.as_deref())
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Snapshot, back up, replicate and prune.
    Run {
        #[command(flatten)]
        jobs: JobFiles,
        /// Log what would happen without changing anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Show what the next run would transfer.
    Plan {
        #[command(flatten)]
        jobs: JobFiles,
        #[arg(long)]
        json: bool,
    },
    /// Validate job files and locate tools.
    Check {
        #[command(flatten)]
        jobs: JobFiles,
    },
    /// Serve one request as a forced ssh command.
    Gate {
        /// Directory pattern the gate may serve; matched against the whole path.
        #[arg(long = "allow", value_name = "REGEX", required = true)]
        allow: Vec<String>,
    },
}

impl Cli {
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Run { ref jobs, dry_run } => self.run_jobs(jobs, dry_run).await,
            Command::Plan { ref jobs, json } => self.plan(jobs, json).await,
            Command::Check { ref jobs } => self.check(jobs),
            Command::Gate { ref allow } => self.gate(allow).await,
        }
    }

    async fn run_jobs(&self, files: &JobFiles, dry_run: bool) -> Result<()> {
        let (config, jobs) = prepare(files)?;
        let tools = ProcessInvoker::new(discover_from_env(&config.tools, jobs.needs_remote())?);
        info!(files = config.files.len(), jobs = jobs.len(), dry_run, "starting run");

        let (token, handle) = new_cancel_pair();
        let listener = spawn_signal_listener(handle)?;
        let executor = JobExecutor::new(
            &tools,
            CompensationStack::new(),
            token,
            ExecutorOptions { dry_run },
        );
        let result = executor.run(&jobs).await;
        listener.abort();
        result?;
        Ok(())
    }

    async fn plan(&self, files: &JobFiles, json: bool) -> Result<()> {
        let (config, jobs) = prepare(files)?;
        let tools = ProcessInvoker::new(discover_from_env(&config.tools, jobs.needs_remote())?);
        let (token, handle) = new_cancel_pair();
        let listener = spawn_signal_listener(handle)?;
        let executor = JobExecutor::new(&tools, CompensationStack::new(), token, ExecutorOptions::default());
        let planned = executor.plans(&jobs).await;
        listener.abort();
        let planned = planned?;

        if json {
            println!("{}", serde_json::to_string_pretty(&planned)?);
        } else {
            print_plans(&planned);
        }
        Ok(())
    }

    fn check(&self, files: &JobFiles) -> Result<()> {
        let (config, jobs) = prepare(files)?;
        let tools = discover_from_env(&config.tools, jobs.needs_remote())?;
        print_check(&config, &jobs, &tools);
        Ok(())
    }

    async fn gate(&self, allow: &[String]) -> Result<()> {
        let allow = AllowList::new(allow)?;
        let command = std::env::var(ORIGINAL_COMMAND_VAR).ok();
        let request = match allow.authorize(command.as_deref()) {
            Ok(request) => request,
            Err(refusal) => {
                warn!(command = command.as_deref().unwrap_or(""), %refusal, "refused");
                return Err(refusal.into());
            }
        };
        info!(op = request.op(), path = %request.path().display(), "accepted");

        let btrfs = discover_from_env(&Default::default(), false)?.btrfs;
        let tools = ProcessInvoker::new(ToolPaths { btrfs, ssh: None });
        let (token, handle) = new_cancel_pair();
        let listener = spawn_signal_listener(handle)?;
        let mut stdout = std::io::stdout().lock();
        let result = Gate::new(&tools).execute(&request, &mut stdout, &token).await;
        listener.abort();
        result?;
        Ok(())
    }
}

/// Load every job file and resolve names against one instant.
fn prepare(files: &JobFiles) -> Result<(VaultConfig, JobSet)> {
    let now = Local::now();
    let config = files.load()?;
    let jobs = config.job_set(&now, |name| std::env::var(name).ok())?;
    Ok((config, jobs))
}

/// Process exit status for an error returned by [`Cli::run`].
pub fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<VaultError>() {
        return e.exit_code();
    }
    if err.downcast_ref::<GateRefusal>().is_some() {
        return snapvault_repl::GATE_DENIED_STATUS as u8;
    }
    1
}

/// Translate SIGINT, SIGTERM and SIGHUP into cancellation of `handle`.
pub fn spawn_signal_listener(handle: CancelHandle) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

    Ok(tokio::spawn(async move {
        let reason = tokio::select! {
            _ = interrupt.recv() => CancelReason::Interrupt,
            _ = terminate.recv() => CancelReason::Terminate,
            _ = hangup.recv() => CancelReason::Hangup,
        };
        warn!(%reason, "cancelling, rolling back in-flight work");
        handle.cancel(reason);
    }))
}

fn print_plans(planned: &[PlannedTransfer]) {
    if planned.is_empty() {
        println!("No backup jobs configured.");
        return;
    }
    for p in planned {
        println!("{} -> {}", p.source, p.target);
        println!("  base: {}", p.plan.common_base.as_deref().unwrap_or("(none, full send)"));
        if p.plan.missing.is_empty() {
            println!("  up to date");
            continue;
        }
        println!(
            "  {} to send, {} incremental",
            p.plan.missing.len(),
            p.plan.incremental_count()
        );
        for name in &p.plan.missing {
            println!("    {}", name);
        }
    }
}

fn print_check(config: &VaultConfig, jobs: &JobSet, tools: &ToolPaths) {
    println!("Job files: {}", config.files.len());
    for file in &config.files {
        println!("  {}", file.display());
    }
    println!("btrfs: {}", tools.btrfs.display());
    if let Some(ssh) = &tools.ssh {
        println!("ssh: {}", ssh.display());
    }
    println!("{:<10} {:<40} {}", "PHASE", "SOURCE", "TARGET");
    println!("{}", "-".repeat(80));
    for job in &jobs.snapshots {
        println!(
            "{:<10} {:<40} {}",
            "snapshot",
            job.volume.display(),
            job.destination.display()
        );
    }
    for job in &jobs.backups {
        println!("{:<10} {:<40} {}", "backup", job.source.to_string(), job.target());
    }
    for job in &jobs.remote_backups {
        println!("{:<10} {:<40} {}", "remote", job.source.to_string(), job.target());
    }
    for job in &jobs.prunes {
        println!("{:<10} {:<40} keep {}", "prune", job.pattern.to_string(), job.keep_max);
    }
}
