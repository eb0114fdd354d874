use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

mod actions;
mod app;
mod cli;
mod config;
mod error;
mod orchestrator;
mod process;
mod remote;
mod tasks;
mod tmux;

use actions::Action;
use app::App;
use cli::{Cli, Command};
use config::Config;
use orchestrator::{LaunchOutcome, Orchestrator, Settings};
use tmux::TmuxClient;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so `running` and `pids` output stays clean. `RUST_LOG` wins.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let path = config::resolve_path(cli.config.as_deref())?;
    let config = config::load(&path, cli.session.as_deref())
        .with_context(|| format!("Failed to load {}", path.display()))?;
    info!(config = %path.display(), session = %config.session, "loaded configuration");
    debug!(vars = ?config.vars, "substitution variables");

    if let Command::List = cli.command {
        print_list(&config);
        return Ok(ExitCode::SUCCESS);
    }

    let tmux = TmuxClient::new(cli.host.as_deref())?;
    let settings = Settings {
        default_wait: Duration::try_from_secs_f64(cli.wait).unwrap_or(Duration::ZERO),
        ..Settings::default()
    };
    let orch = Arc::new(Orchestrator::new(config, tmux, settings));

    let live_status = matches!(cli.command, Command::Server { live_status: true, .. });
    let (app, handle) = App::new(orch.clone(), live_status);
    let control = tokio::spawn(app.run());

    if !cli.no_init {
        handle.execute(Action::Init).await.context("Failed to set up session")?;
    }

    let code = match cli.command {
        Command::List => ExitCode::SUCCESS,
        Command::Launch(sel) => {
            let tags = sel.tag_set();
            exit_code(handle.execute(Action::Launch { window: sel.window, tags }).await?)
        }
        Command::Stop(sel) => {
            let tags = sel.tag_set();
            exit_code(handle.execute(Action::Stop { window: sel.window, tags }).await?)
        }
        Command::Relaunch(sel) => {
            let tags = sel.tag_set();
            exit_code(handle.execute(Action::Relaunch { window: sel.window, tags }).await?)
        }
        Command::Terminate => {
            exit_code(handle.execute(Action::Terminate { reinit: false }).await?)
        }
        Command::Running { window } => {
            println!("{}", orch.is_running(&window).await?);
            ExitCode::SUCCESS
        }
        Command::Pids { window: Some(window) } => {
            println!("{}", join_pids(&orch.window_pids(&window).await?));
            ExitCode::SUCCESS
        }
        Command::Pids { window: None } => {
            for (window, pids) in orch.all_pids().await? {
                println!("{window}: {}", join_pids(&pids));
            }
            ExitCode::SUCCESS
        }
        Command::Server { port, keepalive, .. } => {
            remote::run_server(handle.clone(), port, keepalive).await?;
            ExitCode::SUCCESS
        }
    };

    drop(handle);
    let _ = control.await;
    // Returning drops the runtime, and with it any teardown still in progress
    orch.wait_idle().await;
    Ok(code)
}

fn exit_code(outcome: LaunchOutcome) -> ExitCode {
    match outcome {
        LaunchOutcome::Completed => ExitCode::SUCCESS,
        LaunchOutcome::Aborted { .. } => ExitCode::FAILURE,
    }
}

fn join_pids<'a>(pids: impl IntoIterator<Item = &'a u32>) -> String {
    pids.into_iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_list(config: &Config) {
    println!("session: {}", config.session);
    for window in &config.windows {
        let tags: Vec<&str> = window.tags.iter().map(String::as_str).collect();
        let skip = if window.skip { " (skipped)" } else { "" };
        println!("  {} [{}]{}", window.name, tags.join(", "), skip);
    }
    let known: Vec<String> = config.known_tags().into_iter().collect();
    println!("tags: {}", known.join(", "));
}
