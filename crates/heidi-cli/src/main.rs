// crates/heidi-cli/src/main.rs
// ============================================================================
// Module: Heidi CLI Entry Point
// Description: Command dispatcher for pipeline, keystore, and audit workflows.
// Purpose: Provide a fail-closed operator CLI over the Heidi engine crates.
// Dependencies: clap, heidi-config, heidi-core, heidi-kernel-bridge, serde_jcs.
// ============================================================================

//! ## Overview
//! The `heidi` CLI drives the pipeline runner and exposes the offline tools:
//! keystore sealing, dataset finalization, journal replay, and the doctor.
//! All user-facing strings are routed through the message catalog. Secrets
//! are read from the environment only, never from arguments or config files.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::ArgAction;
use clap::Args;
use clap::CommandFactory;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use heidi_cli::t;
use heidi_config::DoctorReport;
use heidi_config::ENV_SIGNING_KEY;
use heidi_config::HeidiConfig;
use heidi_config::run_checks;
use heidi_core::CommandStageExecutor;
use heidi_core::Finalizer;
use heidi_core::runtime::JOURNAL_FILE;
use heidi_core::Keystore;
use heidi_core::LoopRunner;
use heidi_core::Mode;
use heidi_core::Phase;
use heidi_core::PipelineRunner;
use heidi_core::ReplayError;
use heidi_core::ReplayReport;
use heidi_core::StateCache;
use heidi_core::verify_finalized;
use heidi_core::verify_journal;
use heidi_kernel_bridge::BridgeTelemetrySink;
use heidi_kernel_bridge::FileTelemetrySink;
use heidi_kernel_bridge::KernelBridge;
use heidi_kernel_bridge::METHOD_PING;
use heidi_kernel_bridge::METHOD_STATUS;
use heidi_kernel_bridge::NoopTelemetrySink;
use heidi_kernel_bridge::StderrTelemetrySink;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Exit Codes
// ============================================================================

/// Replay exit code when the journal cannot be read.
const EXIT_REPLAY_UNREADABLE: u8 = 1;
/// Replay exit code when a line is not valid JSON.
const EXIT_REPLAY_INVALID_JSON: u8 = 2;
/// Replay exit code for schema or hash chain violations.
const EXIT_REPLAY_VIOLATION: u8 = 3;

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Top-level CLI definition.
#[derive(Parser, Debug)]
#[command(name = "heidi", disable_help_subcommand = true, disable_version_flag = true)]
struct Cli {
    /// Print version information and exit.
    #[arg(long = "version", action = ArgAction::SetTrue, global = true)]
    show_version: bool,
    /// Selected subcommand to execute.
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Supported CLI subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Seal or open secrets with the passphrase in `HEIDI_KEYSTORE_PWD`.
    Keystore {
        /// Selected keystore subcommand.
        #[command(subcommand)]
        command: KeystoreCommand,
    },
    /// Sign and freeze a pending dataset (key from `HEIDI_SIGNING_KEY`).
    Finalize(FinalizeCommand),
    /// Verify the hash chain of an `events.jsonl` journal.
    Replay(ReplayCommand),
    /// Run pre-flight posture checks.
    Doctor(DoctorCommand),
    /// Run the pipeline until it completes or fails.
    Run(RunCommand),
    /// Print the persisted state of a run.
    State(StateCommand),
    /// Query the kernel daemon.
    Kernel {
        /// Selected kernel subcommand.
        #[command(subcommand)]
        command: KernelCommand,
    },
}

/// Keystore subcommands.
#[derive(Subcommand, Debug)]
enum KeystoreCommand {
    /// Encrypt plaintext and print the base64 blob.
    Encrypt {
        /// Secret to seal.
        plaintext: String,
    },
    /// Decrypt a base64 blob and print the plaintext.
    Decrypt {
        /// Blob produced by `encrypt`.
        blob: String,
    },
}

/// Shared `--config` argument.
#[derive(Args, Debug)]
struct ConfigArgs {
    /// Config file path (defaults to `HEIDI_CONFIG`, then heidi.toml).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

/// Kernel telemetry destination arguments.
#[derive(Args, Debug)]
struct TelemetryArgs {
    /// Append kernel call events to this JSON-lines file.
    #[arg(long, value_name = "PATH", conflicts_with = "telemetry_stderr")]
    telemetry: Option<PathBuf>,
    /// Write kernel call events to stderr.
    #[arg(long, action = ArgAction::SetTrue)]
    telemetry_stderr: bool,
}

/// Arguments for `finalize`.
#[derive(Args, Debug)]
struct FinalizeCommand {
    /// Directory holding `dataset.jsonl`.
    pending_dir: PathBuf,
    /// Root of verified run directories.
    verified_dir: PathBuf,
    /// Run identifier.
    run_id: String,
    /// Journal to verify and record (defaults to `<pending_dir>/events.jsonl` when present).
    #[arg(long, value_name = "PATH")]
    journal: Option<PathBuf>,
    /// Re-verify the signature and dataset hash after writing.
    #[arg(long, action = ArgAction::SetTrue)]
    verify: bool,
    /// Config source for the guardrail snapshot.
    #[command(flatten)]
    config: ConfigArgs,
}

/// Arguments for `replay`.
#[derive(Args, Debug)]
struct ReplayCommand {
    /// Journal path.
    path: PathBuf,
    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

/// Arguments for `doctor`.
#[derive(Args, Debug)]
struct DoctorCommand {
    /// Exit non-zero when any check fails.
    #[arg(long, action = ArgAction::SetTrue)]
    strict: bool,
    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    /// Config source.
    #[command(flatten)]
    config: ConfigArgs,
}

/// Arguments for `run`.
#[derive(Args, Debug)]
struct RunCommand {
    /// Pipeline mode.
    #[arg(long, value_enum, default_value_t = RunModeArg::Full)]
    mode: RunModeArg,
    /// Run to open or resume (overrides `runner.run_id`).
    #[arg(long, value_name = "RUN_ID")]
    run_id: Option<String>,
    /// Config source.
    #[command(flatten)]
    config: ConfigArgs,
    /// Kernel telemetry destination.
    #[command(flatten)]
    telemetry: TelemetryArgs,
}

/// Arguments for `state`.
#[derive(Args, Debug)]
struct StateCommand {
    /// Run identifier.
    run_id: String,
    /// Config source for `paths.autotrain_dir`.
    #[command(flatten)]
    config: ConfigArgs,
}

/// Kernel subcommands.
#[derive(Subcommand, Debug)]
enum KernelCommand {
    /// Send `PING`.
    Ping(KernelArgs),
    /// Send `STATUS`.
    Status(KernelArgs),
}

/// Arguments shared by kernel subcommands.
#[derive(Args, Debug)]
struct KernelArgs {
    /// Config source.
    #[command(flatten)]
    config: ConfigArgs,
    /// Kernel telemetry destination.
    #[command(flatten)]
    telemetry: TelemetryArgs,
}

/// Pipeline modes accepted by `run`.
#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
enum RunModeArg {
    /// Generate, validate, test, train, evaluate.
    Full,
    /// Generate and validate only.
    Collect,
}

impl RunModeArg {
    /// Returns the CLI label.
    const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Collect => "collect",
        }
    }
}

impl From<RunModeArg> for Mode {
    fn from(value: RunModeArg) -> Self {
        match value {
            RunModeArg::Full => Self::Train,
            RunModeArg::Collect => Self::Collect,
        }
    }
}

/// Report output formats.
#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
enum OutputFormat {
    /// Human-readable lines.
    Text,
    /// Canonical JSON.
    Json,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI error wrapper for catalog messages.
#[derive(Debug, Error)]
#[error("{message}")]
struct CliError {
    /// Human-readable error message.
    message: String,
}

impl CliError {
    /// Constructs a new [`CliError`] from a catalog message.
    const fn new(message: String) -> Self {
        Self {
            message,
        }
    }
}

/// CLI result alias for fallible operations.
type CliResult<T> = Result<T, CliError>;

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point returning an exit code.
fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => emit_error(&err.to_string()),
    }
}

/// Executes the CLI command dispatcher.
fn run() -> CliResult<ExitCode> {
    let cli = Cli::parse();
    if cli.show_version {
        write_stdout_line(&t!("main.version", version = env!("CARGO_PKG_VERSION")))?;
        return Ok(ExitCode::SUCCESS);
    }
    let Some(command) = cli.command else {
        show_help()?;
        return Ok(ExitCode::SUCCESS);
    };
    match command {
        Commands::Keystore {
            command,
        } => command_keystore(&command),
        Commands::Finalize(command) => command_finalize(&command),
        Commands::Replay(command) => command_replay(&command),
        Commands::Doctor(command) => command_doctor(&command),
        Commands::Run(command) => command_run(&command),
        Commands::State(command) => command_state(&command),
        Commands::Kernel {
            command,
        } => command_kernel(&command),
    }
}

/// Emits the top-level help message for the CLI.
fn show_help() -> CliResult<()> {
    let mut command = Cli::command();
    command.print_help().map_err(|err| CliError::new(output_error("stdout", &err)))?;
    write_stdout_line("")
}

// ============================================================================
// SECTION: Keystore Commands
// ============================================================================

/// Executes `keystore encrypt|decrypt`.
fn command_keystore(command: &KeystoreCommand) -> CliResult<ExitCode> {
    let keystore =
        Keystore::from_env().map_err(|err| CliError::new(t!("keystore.failed", error = err)))?;
    match command {
        KeystoreCommand::Encrypt {
            plaintext,
        } => {
            let blob = keystore
                .encrypt_gate(plaintext.as_bytes())
                .map_err(|err| CliError::new(t!("keystore.failed", error = err)))?;
            write_stdout_line(&blob)?;
        }
        KeystoreCommand::Decrypt {
            blob,
        } => {
            let plaintext = keystore
                .decrypt_gate(blob)
                .map_err(|err| CliError::new(t!("keystore.failed", error = err)))?;
            write_stdout_bytes(&plaintext)?;
            write_stdout_line("")?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Finalize Command
// ============================================================================

/// Executes `finalize`.
fn command_finalize(command: &FinalizeCommand) -> CliResult<ExitCode> {
    let config = load_config(&command.config)?;
    let signing_key = read_signing_key()?;
    let mut finalizer =
        Finalizer::new(&command.pending_dir, &command.verified_dir, signing_key.clone())
            .and_then(|finalizer| finalizer.with_guardrail_snapshot(config.guardrails.snapshot()))
            .map_err(|err| CliError::new(t!("finalize.failed", error = err)))?;
    let journal =
        command.journal.clone().unwrap_or_else(|| command.pending_dir.join(JOURNAL_FILE));
    if command.journal.is_some() || journal.exists() {
        let report = verify_journal(&journal).map_err(|err| {
            CliError::new(t!("finalize.replay_failed", path = journal.display(), error = err))
        })?;
        finalizer = finalizer.with_replay_report(&report);
    }
    let report = finalizer
        .finalize(&command.run_id)
        .map_err(|err| CliError::new(t!("finalize.failed", error = err)))?;
    write_stdout_line(&t!(
        "finalize.ok",
        run_id = command.run_id,
        path = report.verified_dir.display()
    ))?;
    write_stdout_line(&t!(
        "finalize.dataset",
        hash = report.dataset_hash,
        records = report.record_count
    ))?;
    if command.verify {
        verify_finalized(&report.verified_dir, &signing_key)
            .map_err(|err| CliError::new(t!("finalize.failed", error = err)))?;
        write_stdout_line(&t!("finalize.verified"))?;
    }
    Ok(ExitCode::SUCCESS)
}

/// Reads the manifest signing key from the environment.
fn read_signing_key() -> CliResult<Vec<u8>> {
    match env::var(ENV_SIGNING_KEY) {
        Ok(key) if !key.is_empty() => Ok(key.into_bytes()),
        _ => Err(CliError::new(t!("secret.missing", env = ENV_SIGNING_KEY))),
    }
}

// ============================================================================
// SECTION: Replay Command
// ============================================================================

/// Executes `replay`, mapping the violation class to the exit code.
fn command_replay(command: &ReplayCommand) -> CliResult<ExitCode> {
    match verify_journal(&command.path) {
        Ok(report) => {
            match command.format {
                OutputFormat::Text => write_stdout_line(&render_replay_text(&report))?,
                OutputFormat::Json => write_json(&report)?,
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            let (message, code) = match &err {
                ReplayError::Io(_) => (t!("replay.unreadable", error = err), EXIT_REPLAY_UNREADABLE),
                ReplayError::Json {
                    ..
                } => (t!("replay.failed", error = err), EXIT_REPLAY_INVALID_JSON),
                ReplayError::Schema {
                    ..
                }
                | ReplayError::Chain {
                    ..
                } => (t!("replay.failed", error = err), EXIT_REPLAY_VIOLATION),
            };
            write_stderr_line(&message)?;
            Ok(ExitCode::from(code))
        }
    }
}

/// Renders a verified journal summary.
fn render_replay_text(report: &ReplayReport) -> String {
    let mut lines = vec![t!("replay.ok", events = report.events)];
    match (&report.run_id, &report.last_hash) {
        (Some(run_id), Some(hash)) => {
            lines.push(t!("replay.run_id", run_id = run_id));
            lines.push(t!(
                "replay.final_state",
                state = report.final_state.as_str(),
                round = report.max_round
            ));
            lines.push(t!("replay.chain_head", hash = hash));
        }
        _ => lines.push(t!("replay.empty")),
    }
    lines.join("\n")
}

// ============================================================================
// SECTION: Doctor Command
// ============================================================================

/// Executes `doctor`.
fn command_doctor(command: &DoctorCommand) -> CliResult<ExitCode> {
    let config = load_config(&command.config)?;
    let signing_key_present = env::var(ENV_SIGNING_KEY).is_ok_and(|key| !key.is_empty());
    let report = run_checks(&config, signing_key_present);
    match command.format {
        OutputFormat::Text => write_stdout_line(&render_doctor_text(&report))?,
        OutputFormat::Json => write_json(&report)?,
    }
    if command.strict && !report.passed() {
        return Err(CliError::new(t!("doctor.strict_failed")));
    }
    Ok(ExitCode::SUCCESS)
}

/// Renders one PASS/FAIL line per check plus a summary.
fn render_doctor_text(report: &DoctorReport) -> String {
    let mut lines: Vec<String> = report
        .checks
        .iter()
        .map(|check| {
            if check.passed {
                t!("doctor.pass", check = check.id.as_str())
            } else {
                t!("doctor.fail", check = check.id.as_str())
            }
        })
        .collect();
    let failures = report.failures().count();
    if failures == 0 {
        lines.push(t!("doctor.ok"));
    } else {
        lines.push(t!("doctor.failures", count = failures));
    }
    lines.join("\n")
}

// ============================================================================
// SECTION: Run Commands
// ============================================================================

/// Executes `run`: kernel preflight, then ticks until the pipeline settles.
fn command_run(command: &RunCommand) -> CliResult<ExitCode> {
    let config = load_config(&command.config)?;
    let bridge = build_bridge(&config, &command.telemetry)?;
    bridge.ensure_available().map_err(|err| CliError::new(t!("kernel.unavailable", error = err)))?;
    let mut runner_config = config.runner_config();
    if let Some(run_id) = &command.run_id {
        runner_config.run_id = Some(run_id.clone());
    }
    let mut runner = PipelineRunner::open(runner_config, CommandStageExecutor::new())
        .map_err(|err| CliError::new(t!("run.open_failed", error = err)))?;
    let started = runner
        .start(command.mode.into())
        .map_err(|err| CliError::new(t!("run.open_failed", error = err)))?;
    write_stdout_line(&t!("run.started", run_id = started.run_id, mode = command.mode.as_str()))?;
    let status = runner.run_until_settled().map_err(|err| {
        CliError::new(t!("run.failed", run_id = started.run_id, error = err))
    })?;
    write_stdout_line(&t!(
        "run.finished",
        run_id = status.run_id,
        state = status.state.as_str(),
        phase = status.phase.as_str(),
        round = status.round
    ))?;
    if status.phase == Phase::Error {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Executes `state`.
fn command_state(command: &StateCommand) -> CliResult<ExitCode> {
    let config = load_config(&command.config)?;
    let mut cache = StateCache::default();
    let state = cache.get_run(&config.paths.autotrain_dir, &command.run_id).map_err(|err| {
        CliError::new(t!("state.failed", run_id = command.run_id, error = err))
    })?;
    write_json(&state)?;
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Kernel Commands
// ============================================================================

/// Executes `kernel ping|status`.
fn command_kernel(command: &KernelCommand) -> CliResult<ExitCode> {
    let (args, method) = match command {
        KernelCommand::Ping(args) => (args, METHOD_PING),
        KernelCommand::Status(args) => (args, METHOD_STATUS),
    };
    let config = load_config(&args.config)?;
    let bridge = build_bridge(&config, &args.telemetry)?;
    let result = match command {
        KernelCommand::Ping(_) => bridge.ping(),
        KernelCommand::Status(_) => bridge.status(),
    };
    write_json(&result)?;
    if result.success {
        return Ok(ExitCode::SUCCESS);
    }
    write_stderr_line(&t!(
        "kernel.call_failed",
        method = method,
        status = result.status,
        reason = result.reason.as_deref().unwrap_or_default()
    ))?;
    Ok(ExitCode::FAILURE)
}

/// Builds the kernel bridge with the requested telemetry sink.
fn build_bridge(config: &HeidiConfig, telemetry: &TelemetryArgs) -> CliResult<KernelBridge> {
    let sink: Arc<dyn BridgeTelemetrySink> = if let Some(path) = &telemetry.telemetry {
        Arc::new(FileTelemetrySink::new(path).map_err(|err| {
            CliError::new(t!("telemetry.open_failed", path = path.display(), error = err))
        })?)
    } else if telemetry.telemetry_stderr {
        Arc::new(StderrTelemetrySink)
    } else {
        Arc::new(NoopTelemetrySink)
    };
    KernelBridge::with_telemetry(config.kernel.clone(), sink)
        .map_err(|err| CliError::new(t!("kernel.init_failed", error = err)))
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Loads and validates configuration.
fn load_config(args: &ConfigArgs) -> CliResult<HeidiConfig> {
    HeidiConfig::load(args.config.as_deref())
        .map_err(|err| CliError::new(t!("config.load_failed", error = err)))
}

/// Writes canonical JSON followed by a newline.
fn write_json<T: Serialize>(value: &T) -> CliResult<()> {
    let mut bytes = serde_jcs::to_vec(value)
        .map_err(|err| CliError::new(t!("output.json_failed", error = err)))?;
    bytes.push(b'\n');
    write_stdout_bytes(&bytes)
}

/// Writes a single line to stdout.
fn write_stdout_line(message: &str) -> CliResult<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{message}").map_err(|err| CliError::new(output_error("stdout", &err)))
}

/// Writes raw bytes to stdout.
fn write_stdout_bytes(bytes: &[u8]) -> CliResult<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(bytes).map_err(|err| CliError::new(output_error("stdout", &err)))
}

/// Writes a single line to stderr.
fn write_stderr_line(message: &str) -> CliResult<()> {
    let mut stderr = std::io::stderr().lock();
    writeln!(stderr, "{message}").map_err(|err| CliError::new(output_error("stderr", &err)))
}

/// Formats an output error message.
fn output_error(stream: &str, error: &std::io::Error) -> String {
    let stream_label = match stream {
        "stdout" => t!("output.stream.stdout"),
        "stderr" => t!("output.stream.stderr"),
        _ => t!("output.stream.unknown"),
    };
    t!("output.write_failed", stream = stream_label, error = error)
}

/// Emits an error message to stderr and returns a failure exit code.
fn emit_error(message: &str) -> ExitCode {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{message}");
    ExitCode::FAILURE
}
