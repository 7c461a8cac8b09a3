use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

use midilog_cli::commands::{capture, export, play, sessions, show, status};
use midilog_cli::{Cli, Commands, Config};

fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");
    Ok(config)
}

fn runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Use try_init to avoid panic if tracing is already initialized (e.g., in tests)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let mut stdout = std::io::stdout().lock();

    match &cli.command {
        Some(Commands::Capture { rescan_secs }) => {
            let config = load_config(cli.config.as_deref())?;
            runtime()?.block_on(capture::run(&mut stdout, &config, *rescan_secs))?;
        }
        Some(Commands::Sessions {
            range,
            source,
            json,
        }) => {
            let config = load_config(cli.config.as_deref())?;
            let window = range.window(Utc::now())?;
            sessions::run(&mut stdout, &config, window, source.as_deref(), *json)?;
        }
        Some(Commands::Export { range, source, out }) => {
            let config = load_config(cli.config.as_deref())?;
            let window = range.window(Utc::now())?;
            export::run(&mut stdout, &config, window, source.as_deref(), out)?;
        }
        Some(Commands::Show { number, source }) => {
            let config = load_config(cli.config.as_deref())?;
            show::run(&mut stdout, &config, *number, source.as_deref())?;
        }
        Some(Commands::Play {
            number,
            source,
            device,
        }) => {
            let config = load_config(cli.config.as_deref())?;
            runtime()?.block_on(play::run(
                &mut stdout,
                &config,
                *number,
                source.as_deref(),
                device.as_deref(),
            ))?;
        }
        Some(Commands::Status) => {
            let config = load_config(cli.config.as_deref())?;
            status::run(&mut stdout, &config)?;
        }
        None => {
            // No subcommand, show help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            writeln!(stdout)?;
        }
    }

    Ok(())
}
