//! gcdctl
//!
//! Runs the gcd G-code interpreter as a child process and talks to it.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use gcdctl::config::{default_config_path, Config};
use gcdctl::invocation::Invocation;
use gcdctl::runner::{exit_code, InputSource, RunOptions, Runner};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// gcdctl - drive gcd through its stdin and stdout.
#[derive(Parser, Debug)]
#[command(name = "gcdctl")]
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
    /// Start gcd, send commands and echo its output
    Run {
        /// gcd executable (overrides the configuration)
        #[arg(long, value_name = "PATH")]
        gcd: Option<String>,

        /// Configuration file handed to gcd with -c
        #[arg(long, value_name = "FILE")]
        gcd_config: Option<String>,

        /// Do not pass --configtest
        #[arg(long)]
        no_configtest: bool,

        /// Pass --raw to gcd
        #[arg(long)]
        raw: bool,

        /// Command to send, repeatable (replaces the configured commands)
        #[arg(short = 'e', long = "command", value_name = "CMD")]
        commands: Vec<String>,

        /// Leave gcd's stdin open after the commands were sent
        #[arg(long)]
        keep_input_open: bool,

        /// Forward lines typed on stdin to gcd after the commands
        #[arg(long)]
        interactive: bool,

        /// Additional arguments passed to gcd
        #[arg(last = true)]
        extra_args: Vec<String>,
    },

    /// Run an arbitrary program as a session (`gcdctl exec -- prog args...`)
    Exec {
        /// Program to run
        program: String,

        /// Arguments for the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Command to send, repeatable
        #[arg(short = 'e', long = "command", value_name = "CMD")]
        commands: Vec<String>,

        /// Forward lines typed on stdin to the program
        #[arg(long)]
        interactive: bool,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

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

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    // Load configuration
    let mut config = Config::load(&config_path)?;

    // Initialize tracing; RUST_LOG wins over the configured level
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.effective_log_level()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some(path) = &cli.config {
        tracing::debug!("Using config file: {:?}", path);
    }

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Run {
            gcd,
            gcd_config,
            no_configtest,
            raw,
            commands,
            keep_input_open,
            interactive,
            extra_args,
        } => {
            if let Some(gcd) = gcd {
                config.gcd.executable = gcd;
            }
            if let Some(path) = gcd_config {
                config.gcd.config_path = path;
            }
            if no_configtest {
                config.gcd.configtest = false;
            }
            if raw {
                config.gcd.raw = true;
            }
            config.gcd.extra_args.extend(extra_args);

            let mut options = RunOptions::from_config(&config.session);
            if !commands.is_empty() {
                options.commands = commands;
            }
            if keep_input_open {
                options.close_input = false;
            }

            let invocation = Invocation::gcd(&config.gcd);
            let code = run_session(invocation, options, interactive).await?;
            std::process::exit(code);
        }
        Commands::Exec {
            program,
            args,
            commands,
            interactive,
        } => {
            let mut options = RunOptions::from_config(&config.session);
            options.commands = commands;

            let invocation = Invocation::new(program).args(args);
            let code = run_session(invocation, options, interactive).await?;
            std::process::exit(code);
        }
        Commands::Config(ConfigCommands::Show { json }) => {
            if json {
                println!("{}", config.to_json()?);
            } else {
                println!("# {}", config_path.display());
                print!("{}", config.to_toml()?);
            }
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                eprintln!(
                    "Error: Config file already exists at {}",
                    config_path.display()
                );
                eprintln!("Use --force to overwrite it.");
                std::process::exit(1);
            }

            Config::default()
                .save(&config_path)
                .with_context(|| format!("Failed to initialize {}", config_path.display()))?;
            println!("Wrote default configuration to {}", config_path.display());
        }
    }

    Ok(())
}

/// Runs one session with Ctrl-C / SIGTERM handling and returns the exit code.
async fn run_session(
    invocation: Invocation,
    options: RunOptions,
    interactive: bool,
) -> anyhow::Result<i32> {
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_token.cancel();
    });

    let mut runner = Runner::new(invocation, options, std::io::stdout()).with_shutdown(shutdown);
    if interactive {
        let input: InputSource = Box::pin(tokio::io::BufReader::new(tokio::io::stdin()));
        runner = runner.with_input(input);
    }

    let status = runner.run().await?;
    Ok(exit_code(status))
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Received Ctrl-C");
    }
}
