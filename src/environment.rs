use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Environment variables handed to launched processes.
///
/// Uses `set` rather than `insert` to keep the intent of building a process
/// environment explicit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ProcessEnv(HashMap<String, String>);

impl ProcessEnv {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Variables in `other` overwrite variables of the same name.
    pub fn extend(&mut self, other: ProcessEnv) {
        self.0.extend(other.0);
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<HashMap<String, String>> for ProcessEnv {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

/// The game-specific collaborator: programs, default parameters and the
/// log patterns the harness watches for. Pattern lists are opaque strings
/// supplied by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UnitTestEnvironment {
    /// Name of the game under test, matched against a test's supported games
    pub game: String,
    pub server_program: PathBuf,
    pub client_program: PathBuf,
    /// Parameters prepended to every server launch
    pub server_params: String,
    /// Parameters prepended to every client launch
    pub client_params: String,
    pub server_host: String,
    pub base_port: u16,
    /// Gap between the base port and the first unit test port
    pub port_offset: u16,
    /// Gap between the ports of consecutive unit tests
    pub port_stride: u16,
    pub default_map: String,

    pub service_program: Option<PathBuf>,
    pub service_params: String,
    /// Defer other launches while the service process is alive
    pub service_blocking: bool,

    /// Lines showing the server is still starting up
    pub server_start_progress: Vec<String>,
    /// Lines showing the server is ready for the minimal client
    pub server_ready: Vec<String>,
    /// Lines that are a sign of life from the server
    pub server_timeout_reset: Vec<String>,
    /// Lines that are a sign of life from the client process
    pub client_timeout_reset: Vec<String>,
    /// Lines showing the external service is ready
    pub service_ready: Vec<String>,

    pub player_controller_class: String,
    pub pawn_class: String,
    pub agent_actor_class: String,

    /// Protocol version sent in the minimal client's hello
    pub net_version: String,
    /// Tail log files written by launched processes in addition to stdout
    pub tail_log_files: bool,
    /// Prefix of the per-process resume pipe path
    pub suspend_pipe_prefix: String,

    pub process_env: ProcessEnv,
}

impl Default for UnitTestEnvironment {
    fn default() -> Self {
        Self {
            game: "NullUnitEnv".to_string(),
            server_program: PathBuf::new(),
            client_program: PathBuf::new(),
            server_params: String::new(),
            client_params: "-windowed".to_string(),
            server_host: "127.0.0.1".to_string(),
            base_port: 7777,
            port_offset: 10,
            port_stride: 10,
            default_map: String::new(),
            service_program: None,
            service_params: String::new(),
            service_blocking: false,
            server_start_progress: Vec::new(),
            server_ready: Vec::new(),
            server_timeout_reset: Vec::new(),
            client_timeout_reset: Vec::new(),
            service_ready: Vec::new(),
            player_controller_class: "PlayerController".to_string(),
            pawn_class: "Pawn".to_string(),
            agent_actor_class: "NUTActor".to_string(),
            net_version: "1".to_string(),
            tail_log_files: false,
            suspend_pipe_prefix: "/tmp/netunit-suspend-".to_string(),
            process_env: ProcessEnv::new(),
        }
    }
}

impl UnitTestEnvironment {
    /// Whether a test restricted to `supported_games` runs in this environment.
    pub fn supports(&self, supported_games: &[String]) -> bool {
        supported_games.is_empty()
            || supported_games
                .iter()
                .any(|g| g == &self.game || g == "NullUnitEnv")
    }
}
