//! ptyvisor
//!
//! Runs programs on a PTY and manages their lifecycle from the command line.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use nix::sys::signal::Signal;
use tokio::io::AsyncReadExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use ptyvisor::config::{default_config_path, Config};
use ptyvisor::{
    login_environment, resolve_executable, run_command, CommandRunner, ExitStatus,
    ProcessRegistry, Session, SessionState,
};

/// ptyvisor - run programs on a PTY with deterministic teardown.
#[derive(Parser, Debug)]
#[command(name = "ptyvisor")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a program on a PTY, forwarding stdin and stdout
    Run {
        /// Start the program with the login shell's environment
        #[arg(long)]
        login_env: bool,

        /// Program to run (defaults to the configured shell)
        program: Option<String>,

        /// Arguments passed to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run a command once and print its output
    Exec {
        /// Timeout in seconds (defaults to the configured runner timeout)
        #[arg(long, short)]
        timeout: Option<u64>,

        /// Program to run
        program: String,

        /// Arguments passed to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Resolve a program name to an absolute path
    Which {
        /// Program name or path
        name: String,
    },

    /// Print the environment of a login shell
    LoginEnv {
        /// Shell to ask (defaults to the configured shell)
        #[arg(long)]
        shell: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    let level = if cli.verbose {
        "debug"
    } else {
        config.log.level.as_str()
    };
    let log_guard = init_tracing(level, config.log.dir.as_deref())?;
    tracing::debug!(path = %config_path.display(), "Configuration loaded");

    match cli.command {
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                eprintln!(
                    "Config file already exists: {} (use --force to overwrite)",
                    config_path.display()
                );
                std::process::exit(1);
            }
            Config::default().save(&config_path)?;
            println!("Wrote {}", config_path.display());
            return Ok(());
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
            return Ok(());
        }
        _ => {}
    }

    // Validate configuration
    config.validate()?;

    let code = match cli.command {
        Commands::Run {
            login_env,
            program,
            args,
        } => run_session(&config, program, args, login_env).await?,
        Commands::Exec {
            timeout,
            program,
            args,
        } => {
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.runner_timeout());
            match run_command(&program, &args, timeout).await {
                Some(output) => {
                    print!("{output}");
                    0
                }
                None => {
                    eprintln!("Command failed: {program}");
                    1
                }
            }
        }
        Commands::Which { name } => {
            let runner = CommandRunner::new();
            match resolve_executable(&runner, &name, config.runner_timeout()).await {
                Some(path) => {
                    println!("{}", path.display());
                    0
                }
                None => {
                    eprintln!("{name} not found");
                    1
                }
            }
        }
        Commands::LoginEnv { shell, json } => {
            let shell = shell.unwrap_or_else(|| PathBuf::from(&config.session.default_shell));
            let runner = CommandRunner::new();
            match login_environment(&runner, &shell, config.runner_timeout()).await {
                Some(env) => {
                    let env: BTreeMap<_, _> = env.into_iter().collect();
                    if json {
                        println!("{}", serde_json::to_string_pretty(&env)?);
                    } else {
                        for (key, value) in env {
                            println!("{key}={value}");
                        }
                    }
                    0
                }
                None => {
                    eprintln!("Failed to capture environment from {}", shell.display());
                    1
                }
            }
        }
        Commands::Config(_) => 0,
    };

    // Nothing should be left, but never leave children behind.
    ProcessRegistry::global().kill_all(Signal::SIGKILL);

    // Flush buffered log lines; process::exit skips destructors.
    drop(log_guard);

    // Exit explicitly: a pending stdin read would otherwise keep the runtime alive.
    std::process::exit(code);
}

/// Installs the global subscriber, writing to stderr or a daily log file.
fn init_tracing(level: &str, dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Invalid log filter")?;

    match dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "ptyvisor.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// Runs `program` on a PTY until it exits or we are told to stop.
///
/// Returns the exit code to report.
async fn run_session(
    config: &Config,
    program: Option<String>,
    args: Vec<String>,
    login_env: bool,
) -> anyhow::Result<i32> {
    let runner = CommandRunner::new();
    let timeout = config.runner_timeout();
    let program = program.unwrap_or_else(|| config.session.default_shell.clone());

    let executable = resolve_executable(&runner, &program, timeout)
        .await
        .with_context(|| format!("Executable not found: {program}"))?;

    let env = if login_env {
        let shell = Path::new(&config.session.default_shell);
        login_environment(&runner, shell, timeout)
            .await
            .unwrap_or_else(|| {
                tracing::warn!(shell = %shell.display(), "Could not capture login environment");
                HashMap::new()
            })
    } else {
        HashMap::new()
    };

    let session = Session::new(config.session_config());
    session.set_output_handler(|text| {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    });

    let mut states = session.subscribe();
    if let Err(e) = session.start(&executable, &args, &env).await {
        anyhow::bail!(e.user_message());
    }

    let input = session.clone();
    let stdin_task = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if input.write(&buf[..n]) < 0 {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Stopped reading stdin");
                    break;
                }
            }
        }
    });

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, terminating session");
                session.terminate().await;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, terminating session");
                session.terminate().await;
            }
            state = states.recv() => match state {
                Ok(SessionState::Terminated) | Ok(SessionState::Failed { .. }) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    if session.state().is_final() {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    stdin_task.abort();

    Ok(exit_code(session.exit_status()))
}

/// Maps a child's exit status to a shell-style exit code.
fn exit_code(status: Option<ExitStatus>) -> i32 {
    match status {
        Some(ExitStatus::Exited(code)) => code,
        Some(ExitStatus::Signaled(sig)) => 128 + sig as i32,
        Some(ExitStatus::Unknown) | None => 1,
    }
}
