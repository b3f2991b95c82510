use clap::Parser;
use std::fs::File;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, warn, Level};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use netunit::agent::{AgentRegistries, AgentServer};
use netunit::cli::{Cli, Config, RunMode};
use netunit::manager::{SessionLogDir, UnitTestManager};
use netunit::port_manager::PortAllocator;
use netunit::signals::ShutdownSignals;
use netunit::Result;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    let session = match config.mode {
        RunMode::Tests => Some(SessionLogDir::create(
            &config.manager.log_dir,
            config.manager.purge_logs_days,
            config.manager.max_log_dirs,
        )?),
        RunMode::Agent { .. } => None,
    };
    init_tracing(session.as_ref())?;

    let failed = match config.mode.clone() {
        RunMode::Agent { listen, beacon_types } => {
            run_agent(&config, &listen, beacon_types).await?;
            false
        }
        RunMode::Tests => run_tests(config, session).await?,
    };

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Console logging, plus the session status log when there is a session.
fn init_tracing(session: Option<&SessionLogDir>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let status_layer = session
        .map(|s| File::create(s.status_log_path()))
        .transpose()?
        .map(|file| {
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file))
                .with_filter(Targets::new().with_target("netunit::status", Level::INFO))
        });

    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(env_filter))
        .with(status_layer)
        .init();
    Ok(())
}

async fn run_agent(config: &Config, listen: &str, beacon_types: Vec<String>) -> Result<()> {
    let agent = AgentServer::bind(listen, config.agent_config(beacon_types), AgentRegistries::with_defaults()).await?;
    info!("Agent running on {}, waiting for shutdown signal", agent.local_addr());

    let mut signals = ShutdownSignals::new()?;
    signals.next().await;

    info!("Shutting down agent");
    agent.shutdown();
    Ok(())
}

/// Runs every declared test. Returns whether any test failed.
async fn run_tests(config: Config, session: Option<SessionLogDir>) -> Result<bool> {
    let ports = Arc::new(PortAllocator::new(config.port_allocator_config()?));
    let mut manager = UnitTestManager::new(config.manager.clone(), Arc::new(config.environment.clone()), ports, session);

    for declaration in config.tests {
        manager.queue(declaration.into_factory());
    }

    let mut signals = ShutdownSignals::new()?;
    let mut ticker = interval(config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut console = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;
    let mut shutting_down = false;

    info!("Unit test session started");

    loop {
        select! {
            _ = ticker.tick() => {
                manager.tick(Instant::now());

                if manager.final_summary().is_some() && !manager.has_retiring_processes() {
                    break;
                }
                if manager.is_idle() && manager.reports().is_empty() && manager.unsupported().is_empty() {
                    warn!("Nothing to run");
                    break;
                }
            }

            Some(()) = signals.next() => {
                if shutting_down {
                    warn!("Second shutdown signal, exiting without waiting for processes");
                    break;
                }
                info!("Shutdown requested, aborting unit tests");
                manager.abort_all(Instant::now());
                shutting_down = true;
            }

            line = console.next_line(), if console_open => match line {
                Ok(Some(line)) => {
                    let output = manager.exec(&line, Instant::now());
                    if !output.0.is_empty() {
                        println!("{}", output);
                    }
                }
                Ok(None) => console_open = false,
                Err(e) => {
                    warn!("Console input closed: {}", e);
                    console_open = false;
                }
            }
        }
    }

    let failed = manager.final_summary().map_or(shutting_down, |s| s.has_failures());
    info!("Unit test session finished");
    Ok(failed)
}
