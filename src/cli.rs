use crate::config::loader::{lookup_preset, HarnessConfig, Manifest};
use crate::config::presets::{self, PolicyOverrides};
use crate::config::types::{
    CauseKind, ExecutionPolicy, ExecutionResult, HarnessError, NetworkMode, PathRule, RunError,
    Submission,
};
use crate::core::harness::Harness;
use crate::core::pool::{Evaluation, Job};
use crate::kernel::host::HostCapabilities;
use crate::kernel::signal::SignalHandler;
use crate::verdict::{Oracle, Verdict, VerdictStatus};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Exit status when the harness itself could not do its job
pub const EXIT_ERROR: i32 = 2;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Internal role selector (hidden; the harness re-executes itself as the proxy)
    #[arg(long, hide = true)]
    internal_role: Option<String>,
    /// Launch request fd for the proxy role
    #[arg(long, hide = true)]
    launch_fd: Option<i32>,
    /// Status fd for the proxy role
    #[arg(long, hide = true)]
    status_fd: Option<i32>,

    /// Harness configuration file (JSON)
    #[arg(long, global = true, env = "PROBEBOX_CONFIG")]
    config: Option<PathBuf>,
    /// Parent directory of per-run working directories
    #[arg(long, global = true)]
    runtime_root: Option<PathBuf>,
    /// Delegated cgroup v2 subtree
    #[arg(long, global = true)]
    cgroup_root: Option<PathBuf>,
    /// Never use cgroups, even when delegation is available
    #[arg(long, global = true)]
    no_cgroups: bool,
    /// Append audit events to this file as JSON lines
    #[arg(long, global = true, env = "PROBEBOX_AUDIT_LOG")]
    audit_log: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one submission and print its result and verdict
    Run(RunArgs),
    /// Run every case of a manifest through the worker pool
    Batch {
        /// Manifest file (JSON)
        #[arg(long)]
        manifest: PathBuf,
        /// Concurrent runs (defaults to the configuration)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Report which isolation primitives this host offers
    CheckHost,
    /// Print the named policy presets
    Presets,
}

#[derive(Args)]
struct RunArgs {
    /// Language tag (c, cpp, python, java, native)
    #[arg(long)]
    language: String,
    /// Source file, or executable for the native runner
    #[arg(long)]
    source: PathBuf,
    /// Argument passed to the program (repeatable)
    #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
    args: Vec<String>,
    /// Data written to the program's stdin
    #[arg(long, conflicts_with = "stdin_file")]
    stdin: Option<String>,
    /// File whose contents are written to the program's stdin
    #[arg(long)]
    stdin_file: Option<PathBuf>,

    /// Policy preset the limits below are layered over
    #[arg(long, default_value = "probe")]
    preset: String,
    #[command(flatten)]
    limits: LimitArgs,

    #[command(flatten)]
    expect: ExpectArgs,
}

#[derive(Args, Default)]
struct LimitArgs {
    /// Wall-clock limit in milliseconds
    #[arg(long)]
    wall_time_ms: Option<u64>,
    /// Time between SIGTERM and SIGKILL on a wall-clock breach
    #[arg(long)]
    grace_period_ms: Option<u64>,
    /// Resource sampling interval
    #[arg(long)]
    sample_interval_ms: Option<u64>,
    /// CPU-time limit in milliseconds
    #[arg(long)]
    cpu_time_ms: Option<u64>,
    /// Memory ceiling in MiB
    #[arg(long)]
    memory_mb: Option<u64>,
    /// Processes and threads alive at once
    #[arg(long)]
    max_processes: Option<u32>,
    /// none, loopback or unrestricted
    #[arg(long, value_parser = parse_network)]
    network: Option<NetworkMode>,
    /// Extra visible host path, PATH[:ro|rw][,optional] (repeatable)
    #[arg(long = "allow", value_name = "RULE", value_parser = PathRule::parse)]
    allow: Vec<PathRule>,
    /// Replace the preset's syscall deny-list (comma separated; empty clears it)
    #[arg(long, value_delimiter = ',')]
    deny_syscalls: Option<Vec<String>>,
    /// Mount a fresh /proc inside the sandbox
    #[arg(long)]
    mount_proc: bool,
    /// Captured bytes per output stream
    #[arg(long)]
    output_limit_bytes: Option<usize>,
    /// Fail instead of degrading when cgroup limits are unavailable
    #[arg(long)]
    require_hard_limits: bool,
}

impl LimitArgs {
    fn overrides(&self) -> PolicyOverrides {
        PolicyOverrides {
            wall_time_limit_ms: self.wall_time_ms,
            grace_period_ms: self.grace_period_ms,
            sample_interval_ms: self.sample_interval_ms,
            cpu_time_limit_ms: self.cpu_time_ms,
            memory_limit_bytes: self.memory_mb.map(|mb| mb * 1024 * 1024),
            max_processes: self.max_processes,
            network: self.network,
            syscall_deny_list: self.deny_syscalls.as_ref().map(|names| {
                names
                    .iter()
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .collect()
            }),
            extra_paths: self.allow.clone(),
            mount_proc: self.mount_proc.then_some(true),
            output_limit_bytes: self.output_limit_bytes,
            require_hard_limits: self.require_hard_limits.then_some(true),
            ..PolicyOverrides::default()
        }
    }
}

#[derive(Args, Default)]
struct ExpectArgs {
    /// Oracle file (JSON); the --expect-* flags are added to it
    #[arg(long)]
    oracle: Option<PathBuf>,
    /// Exact stdout
    #[arg(long)]
    expect_output: Option<String>,
    /// Exact stdout, read from a file
    #[arg(long)]
    expect_output_file: Option<PathBuf>,
    /// Compare stdout ignoring surrounding whitespace
    #[arg(long)]
    trim: bool,
    /// Fragment that must appear in stdout (repeatable)
    #[arg(long)]
    expect_contains: Vec<String>,
    /// Pattern stdout must match
    #[arg(long)]
    expect_regex: Option<String>,
    /// Required exit status
    #[arg(long)]
    expect_exit: Option<i32>,
    /// The run must be stopped for this cause (repeatable)
    #[arg(long, value_parser = parse_cause)]
    expect_terminated: Vec<CauseKind>,
}

impl ExpectArgs {
    fn oracle(&self) -> Result<Oracle> {
        let mut oracles = Vec::new();
        if let Some(path) = &self.oracle {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading oracle {}", path.display()))?;
            oracles.push(
                serde_json::from_str(&content)
                    .with_context(|| format!("parsing oracle {}", path.display()))?,
            );
        }
        let expected = match (&self.expect_output, &self.expect_output_file) {
            (Some(text), _) => Some(text.clone()),
            (None, Some(path)) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?,
            ),
            (None, None) => None,
        };
        if let Some(expected) = expected {
            oracles.push(Oracle::Exact {
                expected,
                trim: self.trim,
            });
        }
        if !self.expect_contains.is_empty() {
            oracles.push(Oracle::Contains {
                fragments: self.expect_contains.clone(),
            });
        }
        if let Some(pattern) = &self.expect_regex {
            oracles.push(Oracle::Regex {
                pattern: pattern.clone(),
            });
        }
        if let Some(code) = self.expect_exit {
            oracles.push(Oracle::ExitCode { code });
        }
        if !self.expect_terminated.is_empty() {
            oracles.push(Oracle::terminated(self.expect_terminated.clone()));
        }

        Ok(match oracles.len() {
            0 => Oracle::NoCrash,
            1 => oracles.remove(0),
            _ => Oracle::All { oracles },
        })
    }
}

fn parse_network(value: &str) -> std::result::Result<NetworkMode, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| format!("unknown network mode '{}' (none, loopback, unrestricted)", value))
}

fn parse_cause(value: &str) -> std::result::Result<CauseKind, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string())).map_err(|_| {
        format!(
            "unknown termination cause '{}' (timed_out, memory_exceeded, cpu_exceeded, signaled, policy_violation, normal)",
            value
        )
    })
}

/// Result and verdict of one run, as printed
#[derive(Serialize)]
struct RunReport<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    verdict: &'a Verdict,
}

#[derive(Serialize, Default, Debug, PartialEq, Eq)]
struct BatchSummary {
    total: usize,
    pass: usize,
    fail: usize,
    error: usize,
    /// Cases never started because a shutdown signal arrived
    skipped: usize,
}

impl BatchSummary {
    fn record(&mut self, verdict: &Verdict) {
        self.total += 1;
        match verdict.status {
            VerdictStatus::Pass => self.pass += 1,
            VerdictStatus::Fail => self.fail += 1,
            VerdictStatus::Error => self.error += 1,
        }
    }

    fn exit_code(&self) -> i32 {
        if self.error > 0 || self.skipped > 0 {
            EXIT_ERROR
        } else if self.fail > 0 {
            1
        } else {
            0
        }
    }
}

#[derive(Serialize)]
struct BatchReport {
    cases: Vec<Evaluation>,
    summary: BatchSummary,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn harness_config(cli: &Cli) -> Result<HarnessConfig> {
    let mut config = match &cli.config {
        Some(path) => HarnessConfig::load_from_file(path)?,
        None => HarnessConfig::default(),
    };
    if let Some(root) = &cli.runtime_root {
        config.runtime_root = root.clone();
    }
    if let Some(root) = &cli.cgroup_root {
        config.cgroup_root = root.clone();
    }
    if cli.no_cgroups {
        config.use_cgroups = false;
    }
    Ok(config)
}

fn start_harness(config: HarnessConfig) -> Result<Harness> {
    match Harness::new(config) {
        Ok(harness) => Ok(harness),
        Err(HarnessError::IsolationUnavailable(reason)) => Err(anyhow!(
            "refusing to run untrusted code without isolation: {}",
            reason
        )),
        Err(e) => Err(e.into()),
    }
}

/// Entry point of the `probebox` binary. Returns the process exit status.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();

    // The proxy must stay single-threaded and quiet: it forks the sandbox
    if let Some(role) = cli.internal_role.as_deref() {
        if role == "proxy" {
            let launch_fd = cli
                .launch_fd
                .ok_or_else(|| anyhow!("--launch-fd is required for --internal-role=proxy"))?;
            let status_fd = cli
                .status_fd
                .ok_or_else(|| anyhow!("--status-fd is required for --internal-role=proxy"))?;
            return Ok(crate::core::proxy::run_proxy_role(launch_fd, status_fd));
        }
        return Err(anyhow!("unsupported internal role: {}", role));
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Some(path) = &cli.audit_log {
        crate::observability::audit::init_audit_log(path)
            .with_context(|| format!("opening audit log {}", path.display()))?;
    }

    let command = cli
        .command
        .as_ref()
        .ok_or_else(|| anyhow!("missing command (run, batch, check-host, presets)"))?;
    match command {
        Commands::Run(args) => run_one(&cli, args),
        Commands::Batch { manifest, workers } => run_batch(&cli, manifest, *workers),
        Commands::CheckHost => {
            let config = harness_config(&cli)?;
            let host = HostCapabilities::detect(&config.cgroup_root);
            print_json(&host)?;
            Ok(if host.can_isolate() { 0 } else { EXIT_ERROR })
        }
        Commands::Presets => {
            let policies: Vec<&ExecutionPolicy> = presets::get_presets().list();
            print_json(&policies)?;
            Ok(0)
        }
    }
}

fn run_one(cli: &Cli, args: &RunArgs) -> Result<i32> {
    let policy = args.limits.overrides().apply(&lookup_preset(&args.preset)?);
    let oracle = args.expect.oracle()?;
    let submission = Submission {
        language: args.language.clone(),
        source: absolute(&args.source)?,
        args: args.args.clone(),
        stdin: args.stdin.clone(),
        stdin_file: args.stdin_file.as_deref().map(absolute).transpose()?,
    };

    let harness = start_harness(harness_config(cli)?)?;
    let (outcome, verdict) = harness.evaluate(&submission, policy, &oracle);
    let report = RunReport {
        result: outcome.as_ref().ok(),
        error: outcome.as_ref().err().map(RunError::to_string),
        verdict: &verdict,
    };
    print_json(&report)?;
    Ok(verdict.exit_code())
}

fn run_batch(cli: &Cli, manifest: &Path, workers: Option<usize>) -> Result<i32> {
    let cases = Manifest::load(manifest)?;
    let mut config = harness_config(cli)?;
    if let Some(workers) = workers {
        config.workers = workers.max(1);
    }

    let signals = SignalHandler::init().map_err(|e| anyhow!(e))?;
    let harness = Arc::new(start_harness(config)?);
    let pool = harness.pool()?;
    log::info!("running {} cases on {} workers", cases.len(), pool.size());

    let mut summary = BatchSummary::default();
    let mut pending = Vec::with_capacity(cases.len());
    for case in cases {
        if signals.shutdown_requested() {
            summary.skipped += 1;
            continue;
        }
        let job = Job {
            name: case.name,
            submission: case.submission,
            policy: case.policy,
            oracle: case.oracle,
        };
        match pool.submit(job) {
            Ok(handle) => pending.push(handle),
            Err(job) => {
                log::error!("worker pool closed before '{}' was queued", job.name);
                summary.skipped += 1;
            }
        }
    }

    let cases: Vec<Evaluation> = pending.into_iter().map(|p| p.wait()).collect();
    pool.shutdown();
    for evaluation in &cases {
        summary.record(&evaluation.verdict);
    }
    if signals.shutdown_requested() {
        log::warn!("interrupted by signal {}", signals.received());
    }

    let exit_code = summary.exit_code();
    print_json(&BatchReport { cases, summary })?;
    Ok(exit_code)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}
