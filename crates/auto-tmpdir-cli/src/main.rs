//! auto-tmpdir CLI - create, export and remove per-job temporary directories

use anyhow::{Context, Result, bail};
use auto_tmpdir_core::config::default_config_path;
use auto_tmpdir_core::identity::{BATCH_STEP_ID, EXTERN_STEP_ID};
use auto_tmpdir_core::{
    CleanupPolicy, Credentials, JobIdentity, PathResolver, StepContext, TmpdirConfig,
    TmpdirLifecycle, export, provision, teardown,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::{Command, ExitCode};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "auto-tmpdir")]
#[command(author, version, about = "Per-job private temporary directories")]
struct Cli {
    /// Configuration file (defaults to AUTO_TMPDIR_CONFIG or /etc/auto-tmpdir/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the directory a job/step would use
    Resolve {
        #[command(flatten)]
        job: JobArgs,

        #[command(flatten)]
        overrides: ConfigOverrides,

        /// Print the resolved record as JSON
        #[arg(long)]
        json: bool,

        /// Leave out the per-node segment
        #[arg(long)]
        job_wide: bool,
    },

    /// Create the directory tree and print the TMPDIR assignment
    Provision {
        #[command(flatten)]
        job: JobArgs,

        #[command(flatten)]
        overrides: ConfigOverrides,
    },

    /// Remove whatever this job/step owns
    Teardown {
        #[command(flatten)]
        job: JobArgs,

        #[command(flatten)]
        overrides: ConfigOverrides,
    },

    /// Provision, run a command with TMPDIR set, then tear down
    Run {
        #[command(flatten)]
        job: JobArgs,

        #[command(flatten)]
        overrides: ConfigOverrides,

        /// Command and arguments
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },
}

#[derive(Args)]
struct JobArgs {
    /// Job id
    #[arg(short, long)]
    job: u32,

    /// Step id, or `batch` / `extern`
    #[arg(short, long, default_value = "0", value_parser = parse_step)]
    step: StepContext,

    /// Task id within the step
    #[arg(short, long, default_value = "0")]
    task: u32,

    /// Owner uid (defaults to the effective uid)
    #[arg(long)]
    uid: Option<u32>,

    /// Owner gid (defaults to the effective gid)
    #[arg(long)]
    gid: Option<u32>,
}

impl JobArgs {
    const fn identity(&self) -> JobIdentity {
        JobIdentity::new(self.job, self.step, self.task)
    }

    fn owner(&self) -> Credentials {
        let current = Credentials::current();
        Credentials::new(
            self.uid.unwrap_or_else(|| current.uid.as_raw()),
            self.gid.unwrap_or_else(|| current.gid.as_raw()),
        )
    }
}

#[derive(Args)]
struct ConfigOverrides {
    /// Base directory that wins over everything else
    #[arg(long)]
    tmpdir: Option<PathBuf>,

    /// Node-local base directory
    #[arg(long)]
    local_prefix: Option<PathBuf>,

    /// Put directories on shared storage under this prefix
    #[arg(long)]
    shared_prefix: Option<PathBuf>,

    /// Add a per-host segment under shared storage
    #[arg(long)]
    per_node: bool,

    /// One directory per job instead of per step
    #[arg(long)]
    no_step_tmpdir: bool,

    /// Keep directories after the job exits
    #[arg(long)]
    no_rm_tmpdir: bool,

    /// Only keep directories that live on shared storage
    #[arg(long)]
    keep_shared_only: bool,

    /// Which job-wide context removes job-level directories
    #[arg(long, value_enum)]
    cleanup: Option<Policy>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Policy {
    Standard,
    ExternOnly,
    BatchOnly,
}

impl From<Policy> for CleanupPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Standard => Self::Standard,
            Policy::ExternOnly => Self::ExternOnly,
            Policy::BatchOnly => Self::BatchOnly,
        }
    }
}

impl ConfigOverrides {
    fn apply(self, mut config: TmpdirConfig) -> TmpdirConfig {
        if let Some(path) = self.tmpdir {
            config.tmpdir_override = Some(path);
        }
        if let Some(path) = self.local_prefix {
            config.local_prefix = path;
        }
        if let Some(path) = self.shared_prefix {
            config.shared_prefix = Some(path);
            config.use_shared = true;
        }
        if self.per_node {
            config.per_node = true;
        }
        if self.no_step_tmpdir {
            config.per_step = false;
        }
        if self.no_rm_tmpdir {
            config.remove_on_exit = false;
        }
        if self.keep_shared_only {
            config.keep_shared_only = true;
        }
        if let Some(policy) = self.cleanup {
            config.cleanup = policy.into();
        }
        config
    }
}

fn parse_step(value: &str) -> Result<StepContext, String> {
    match value {
        "batch" => Ok(StepContext::from_raw(BATCH_STEP_ID)),
        "extern" => Ok(StepContext::from_raw(EXTERN_STEP_ID)),
        raw => raw
            .parse::<u32>()
            .map(StepContext::from_raw)
            .map_err(|e| format!("invalid step id `{raw}`: {e}")),
    }
}

/// Read the configuration file, if any. An explicitly named file must exist.
fn load_config(explicit: Option<PathBuf>) -> Result<TmpdirConfig> {
    let (path, required) = match explicit {
        Some(path) => (path, true),
        None => (default_config_path(), false),
    };

    if !required && !path.exists() {
        tracing::debug!(path = %path.display(), "no configuration file, using defaults");
        return Ok(TmpdirConfig::default());
    }

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading configuration {}", path.display()))?;
    let config = serde_json::from_str(&text)
        .with_context(|| format!("parsing configuration {}", path.display()))?;
    tracing::debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

fn build_config(file: Option<PathBuf>, overrides: ConfigOverrides) -> Result<TmpdirConfig> {
    let config = overrides.apply(load_config(file)?);
    config.validate()?;
    Ok(config)
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose { "auto_tmpdir=debug" } else { "auto_tmpdir=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Resolve {
            job,
            overrides,
            json,
            job_wide,
        } => {
            let config = build_config(cli.config, overrides)?;
            let resolved = PathResolver::new(&config).resolve(&job.identity(), job_wide)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&resolved)?);
            } else {
                println!("{}", resolved.path.display());
            }
        }

        Commands::Provision { job, overrides } => {
            let config = build_config(cli.config, overrides)?;
            let resolved = provision(&job.identity(), job.owner(), &config)?;
            let (key, value) = export(&resolved);
            println!("{key}={value}");
        }

        Commands::Teardown { job, overrides } => {
            let config = build_config(cli.config, overrides)?;
            report_teardown(teardown(&job.identity(), job.owner(), &config))?;
        }

        Commands::Run {
            job,
            overrides,
            command,
        } => {
            let config = build_config(cli.config, overrides)?;
            return run(&config, &job, &command);
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Whole lifecycle in one process; the child inherits the private namespace.
fn run(config: &TmpdirConfig, job: &JobArgs, command: &[String]) -> Result<ExitCode> {
    let Some((program, args)) = command.split_first() else {
        bail!("no command given");
    };

    let mut lifecycle = TmpdirLifecycle::new(config, job.identity(), job.owner());
    lifecycle.provision()?;
    if let Err(e) = lifecycle.bind() {
        if let Err(cleanup) = lifecycle.teardown() {
            tracing::debug!(error = %cleanup, "teardown after failed bind");
        }
        return Err(e.into());
    }
    let (key, value) = lifecycle.activate()?;

    tracing::info!(program = %program, tmpdir = %value, "starting command");
    let status = Command::new(program).args(args).env(&key, &value).status();

    if let Err(e) = report_teardown(lifecycle.teardown()) {
        tracing::info!(error = %e, "teardown failed");
    }

    let status = status.with_context(|| format!("running {program}"))?;
    Ok(exit_code(status))
}

/// Leftover trees and foreign owners are diagnostics, not failures.
fn report_teardown(result: auto_tmpdir_core::Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_fatal() => Err(e.into()),
        Err(e) => {
            tracing::info!(error = %e, "teardown incomplete");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

fn exit_code(status: std::process::ExitStatus) -> ExitCode {
    use std::os::unix::process::ExitStatusExt;

    let code = status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1);
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn step_names_map_to_sentinels() {
        assert_eq!(parse_step("batch").unwrap().as_raw(), BATCH_STEP_ID);
        assert_eq!(parse_step("extern").unwrap().as_raw(), EXTERN_STEP_ID);
        assert_eq!(parse_step("3").unwrap(), StepContext::Parallel(3));
        assert!(parse_step("three").is_err());
    }

    #[test]
    fn run_takes_trailing_command() {
        let cli = Cli::try_parse_from([
            "auto-tmpdir", "run", "--job", "42", "--step", "extern", "--", "env", "-0",
        ])
        .unwrap();
        let Commands::Run { job, command, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(job.identity(), JobIdentity::from_raw(42, EXTERN_STEP_ID, 0));
        assert_eq!(command, ["env", "-0"]);
    }

    #[test]
    fn overrides_apply_on_top_of_file() {
        let cli = Cli::try_parse_from([
            "auto-tmpdir",
            "provision",
            "--job",
            "7",
            "--shared-prefix",
            "/gpfs/tmp",
            "--per-node",
            "--no-step-tmpdir",
            "--cleanup",
            "extern-only",
        ])
        .unwrap();
        let Commands::Provision { overrides, .. } = cli.command else {
            panic!("expected provision");
        };

        let config = overrides.apply(TmpdirConfig::default());
        assert_eq!(config.shared_prefix, Some(PathBuf::from("/gpfs/tmp")));
        assert!(config.use_shared);
        assert!(config.per_node);
        assert!(!config.per_step);
        assert_eq!(config.cleanup, CleanupPolicy::ExternOnly);
        config.validate().unwrap();
    }

    #[test]
    fn only_fatal_teardown_errors_fail_the_command() {
        use auto_tmpdir_core::TmpdirError;

        let foreign = TmpdirError::OwnershipMismatch {
            path: PathBuf::from("/tmp/job_42"),
            expected: 1000,
            found: 4242,
        };
        assert!(report_teardown(Err(foreign)).is_ok());

        let leftover = TmpdirError::PartialDelete {
            path: PathBuf::from("/tmp/job_42"),
            failures: vec![],
        };
        assert!(report_teardown(Err(leftover)).is_ok());

        let privilege = TmpdirError::Privilege("seteuid(4242) failed".into());
        assert!(report_teardown(Err(privilege)).is_err());
        assert!(report_teardown(Ok(())).is_ok());
    }

    #[test]
    fn explicit_config_file_must_exist() {
        let dir = std::env::temp_dir().join("auto-tmpdir-missing-config.json");
        assert!(load_config(Some(dir)).is_err());
    }
}
