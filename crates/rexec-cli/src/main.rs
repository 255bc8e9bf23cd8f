//! rexec CLI
//!
//! Runs one command through the configured executor and exits with its status

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use color_eyre::Result;
use eyre::{WrapErr, eyre};
use rexec::{Command, CommandResult, ExecError, Executor, ManagedIo};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

/// Exit code after Ctrl-C, as a shell reports SIGINT
const EXIT_INTERRUPTED: i32 = 130;
/// Exit code after `--timeout`, as coreutils `timeout` reports it
const EXIT_TIMED_OUT: i32 = 124;

#[derive(Parser)]
#[command(name = "rexec", version)]
#[command(about = "Run commands locally or over SSH", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command with the configured executor
    Run(RunArgs),
    /// Print the effective configuration
    #[command(name = "config")]
    ShowConfig,
}

#[derive(Args)]
struct RunArgs {
    /// Working directory for the command
    #[arg(short = 'C', long)]
    workdir: Option<String>,

    /// Environment variable for the command, repeatable
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Cancel the command after this many seconds
    #[arg(short, long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Forward this process's stdin to the command
    #[arg(long)]
    stdin: bool,

    /// Collect the output and print it as JSON
    #[arg(long)]
    json: bool,

    /// Command to run; a single argument is passed through as-is
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl RunArgs {
    fn command_line(&self) -> Result<String> {
        match self.command.as_slice() {
            [line] => Ok(line.clone()),
            words => shlex::try_join(words.iter().map(String::as_str))
                .map_err(|e| eyre!("cannot quote command: {e}")),
        }
    }
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

fn init_logging(level: &str, verbose: bool) {
    let level = if verbose { "debug" } else { level };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    init_logging(&config.log_level, cli.verbose);

    match cli.command {
        Commands::Run(args) => {
            let code = run(&config, &args).await?;
            std::process::exit(code);
        }
        Commands::ShowConfig => {
            print!("{}", config.display_toml()?);
        }
    }

    Ok(())
}

/// Execute the command and return the process exit code
async fn run(config: &Config, args: &RunArgs) -> Result<i32> {
    let executor = config
        .executor
        .build()
        .wrap_err("failed to create executor")?;

    let mut cmd = Command::new(args.command_line()?);
    if let Some(dir) = &args.workdir {
        cmd = cmd.with_workdir(dir.clone());
    }
    for (key, value) in &args.env {
        cmd = cmd.with_env(key.clone(), value.clone());
    }

    let managed = args.json.then(ManagedIo::new);
    match &managed {
        Some(io) => io.hijack(&mut cmd),
        None => {
            cmd.set_stdout(tokio::io::stdout());
            cmd.set_stderr(tokio::io::stderr());
        }
    }
    if args.stdin {
        cmd.set_stdin(tokio::io::stdin());
    }

    let start = Instant::now();
    let result = execute(executor.as_ref(), &cmd, args.timeout.map(Duration::from_secs)).await;
    let duration = start.elapsed();

    if let Err(e) = executor.close().await {
        warn!(error = %e, "failed to close executor");
    }

    let code = match &result {
        Ok(()) => 0,
        Err(ExecError::Exit { status }) => *status,
        Err(ExecError::Canceled) => EXIT_INTERRUPTED,
        Err(ExecError::Timeout { .. }) => EXIT_TIMED_OUT,
        Err(e) => return Err(eyre::Report::new(e.clone()).wrap_err("command failed")),
    };

    if let Some(io) = managed {
        let output = CommandResult::captured(&cmd, &io, duration);
        println!("{}", serde_json::to_string_pretty(&output)?);
    }

    Ok(code)
}

/// Race the command against Ctrl-C and the optional timeout
async fn execute(
    executor: &dyn Executor,
    cmd: &Command,
    timeout: Option<Duration>,
) -> Result<(), ExecError> {
    let cancel = CancellationToken::new();
    let execution = executor.execute(&cancel, cmd);
    tokio::pin!(execution);

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = &mut execution => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, canceling command");
            cancel.cancel();
            execution.await
        }
        () = deadline => {
            cancel.cancel();
            match execution.await {
                Err(ExecError::Canceled) => {
                    warn!(timeout = ?timeout, "command timed out");
                    Err(ExecError::Timeout {
                        timeout: timeout.unwrap_or_default(),
                    })
                }
                other => other,
            }
        }
    }
}
