use clap::{Parser, Subcommand};
use eyre::{eyre, WrapErr};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::agent::AgentConfig;
use crate::builtin::TestDeclaration;
use crate::environment::UnitTestEnvironment;
use crate::manager::ManagerConfig;
use crate::port_manager::PortAllocatorConfig;
use crate::Result;

/// Runs network unit tests against launched or running game servers
#[derive(Parser)]
#[command(name = "netunit")]
#[command(about = "Runs network unit tests against launched or running game servers")]
#[command(version)]
pub struct Cli {
    /// TOML file with [environment], [manager] and [[test]] sections
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Maximum number of concurrently running unit tests
    #[arg(long)]
    pub cap: Option<usize>,

    /// Base directory for session logs
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Orchestrator tick interval (ms)
    #[arg(long, default_value = "50")]
    pub tick_ms: u64,

    #[command(subcommand)]
    pub command: Option<Command>,

    /// Only run tests whose names contain one of these
    pub filters: Vec<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the cooperating test agent standalone
    Agent {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:7777")]
        listen: String,

        /// Accepted beacon types
        #[arg(long, value_delimiter = ',')]
        beacon: Vec<String>,
    },
}

/// Contents of the configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub environment: UnitTestEnvironment,
    pub manager: ManagerConfig,
    pub test: Vec<TestDeclaration>,
}

impl FileConfig {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).wrap_err("Invalid configuration file")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Tests,
    Agent { listen: String, beacon_types: Vec<String> },
}

/// Runtime configuration
#[derive(Debug)]
pub struct Config {
    pub mode: RunMode,
    pub environment: UnitTestEnvironment,
    pub manager: ManagerConfig,
    /// Declared tests left after filtering
    pub tests: Vec<TestDeclaration>,
    pub tick_interval: Duration,
}

impl Config {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .wrap_err_with(|| format!("Failed to read config file {:?}", path))?;
                FileConfig::parse(&text)?
            }
            None => FileConfig::default(),
        };

        Self::from_parts(cli, file)
    }

    fn from_parts(cli: Cli, file: FileConfig) -> Result<Self> {
        let FileConfig { environment, mut manager, mut test } = file;

        if cli.tick_ms == 0 {
            return Err(eyre!("Tick interval must be positive"));
        }
        if let Some(cap) = cli.cap {
            manager.command_line_cap = Some(cap);
        }
        if let Some(log_dir) = cli.log_dir {
            manager.log_dir = log_dir;
        }

        let mode = match cli.command {
            Some(Command::Agent { listen, beacon }) => RunMode::Agent { listen, beacon_types: beacon },
            None => RunMode::Tests,
        };

        if !cli.filters.is_empty() {
            let filters: Vec<String> = cli.filters.iter().map(|f| f.to_ascii_lowercase()).collect();
            test.retain(|t| {
                let name = t.name().to_ascii_lowercase();
                filters.iter().any(|f| name.contains(f.as_str()))
            });
            if test.is_empty() && mode == RunMode::Tests {
                return Err(eyre!("No unit tests match {:?}", cli.filters));
            }
        }

        if test.is_empty() && mode == RunMode::Tests {
            warn!("No unit tests declared");
        }

        Ok(Config {
            mode,
            environment,
            manager,
            tests: test,
            tick_interval: Duration::from_millis(cli.tick_ms),
        })
    }

    pub fn port_allocator_config(&self) -> Result<PortAllocatorConfig> {
        let host = &self.environment.server_host;
        let bind_address: IpAddr = host
            .parse()
            .map_err(|e| eyre!("Invalid server host '{}': {}", host, e))?;

        Ok(PortAllocatorConfig {
            bind_address,
            base_port: self.environment.base_port,
            port_offset: self.environment.port_offset,
            port_stride: self.environment.port_stride,
            probe_availability: true,
        })
    }

    /// Agent settings derived from the environment.
    pub fn agent_config(&self, beacon_types: Vec<String>) -> AgentConfig {
        let env = &self.environment;
        let mut config = AgentConfig {
            version: env.net_version.clone(),
            game: env.game.clone(),
            offered_actors: vec![
                env.player_controller_class.clone(),
                env.pawn_class.clone(),
                env.agent_actor_class.clone(),
            ],
            beacon_types,
            suspend_pipe_prefix: env.suspend_pipe_prefix.clone(),
            ..AgentConfig::default()
        };
        if !env.default_map.is_empty() {
            config.map = env.default_map.clone();
        }
        config
    }
}
