use crate::error::HarnessError;
use crate::requirements::{validate_requirements, Requirement, RequirementSet};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Outcome of a unit test.
///
/// Starts `Unverified` and moves to exactly one terminal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum VerificationState {
    #[default]
    Unverified,
    /// Something broke and it is not automatically fixable
    VerifiedNeedsUpdate,
    /// The issue under test is fixed
    VerifiedFixed,
    /// The issue under test still reproduces
    VerifiedUnfixed,
    /// The result differs between runs
    VerifiedUnreliable,
}

impl VerificationState {
    pub fn is_terminal(self) -> bool {
        self != VerificationState::Unverified
    }
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Behavioural flags a unit test declares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TestFlags {
    /// Launch a server process for the test
    pub launch_server: bool,
    /// Launch a full client process once the server is ready
    pub launch_client: bool,
    /// Launch the environment's external service before the server
    pub launch_service: bool,
    /// Connect the minimal client as a beacon instead of joining the game
    pub beacon_connect: bool,
    /// Reconnect the minimal client after a network failure
    pub auto_reconnect: bool,
    /// Accept the player controller even when it is not required
    pub accept_player_controller: bool,
    /// The server is expected to crash; its exit is evidence, not failure
    pub expect_server_crash: bool,
    /// The client process is expected to crash
    pub expect_client_crash: bool,
    /// Server exits are logged but do not fail the test
    pub ignore_server_crash: bool,
    /// Client process exits are logged but do not fail the test
    pub ignore_client_crash: bool,
    /// A disconnect is expected; leave the verdict to later evidence
    pub expect_disconnect: bool,
}

/// Declared settings of one unit test.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UnitTestSettings {
    pub name: String,
    pub description: String,
    /// Games this test supports; empty means any
    pub supported_games: Vec<String>,
    pub expected_result: VerificationState,
    /// Known to need multiple runs to reach the expected result
    pub unreliable: bool,
    pub flags: TestFlags,
    pub requirements: RequirementSet,
    /// Map URL the server loads
    pub server_url: String,
    pub server_params: String,
    pub client_params: String,
    /// Address of an already running server, when none is launched
    pub server_address: Option<String>,
    pub beacon_type: Option<String>,
    /// Extra actor classes the minimal client admits
    pub allowed_actors: Vec<String>,
    pub timeout_secs: u64,
    pub connection_timeout_secs: u64,
    pub bug_tracking: Vec<String>,
    pub changelists: Vec<String>,
}

impl Default for UnitTestSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            supported_games: Vec::new(),
            expected_result: VerificationState::Unverified,
            unreliable: false,
            flags: TestFlags::default(),
            requirements: RequirementSet::new(),
            server_url: String::new(),
            server_params: String::new(),
            client_params: String::new(),
            server_address: None,
            beacon_type: None,
            allowed_actors: Vec::new(),
            timeout_secs: 60,
            connection_timeout_secs: 30,
            bug_tracking: Vec::new(),
            changelists: Vec::new(),
        }
    }
}

impl UnitTestSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Whether the test talks to a server through the minimal client.
    pub fn uses_minimal_client(&self) -> bool {
        self.flags.launch_server || self.server_address.is_some()
    }

    /// Requirements the orchestrator waits for, including the implicit connection.
    pub fn effective_requirements(&self) -> RequirementSet {
        let mut required = self.requirements;
        if self.uses_minimal_client() {
            required.insert(Requirement::Connection);
        }
        if self.flags.beacon_connect {
            required.insert(Requirement::Beacon);
        }
        required
    }

    /// Whether the test tolerates the remote process going away.
    pub fn tolerates_remote_crash(&self) -> bool {
        self.flags.expect_server_crash || self.flags.ignore_server_crash
    }

    /// Checks declared settings before any process is launched.
    pub fn validate(&self) -> Result<(), HarnessError> {
        let fail = |msg: String| Err(HarnessError::ValidationFailed(msg));
        let flags = &self.flags;

        if self.name.trim().is_empty() {
            return fail("unit test has no name".to_string());
        }
        if self.timeout_secs == 0 {
            return fail(format!("'{}' declares a zero timeout", self.name));
        }
        if flags.launch_server && self.server_url.trim().is_empty() {
            return fail(format!("'{}' launches a server but has no server URL", self.name));
        }
        if flags.launch_client && !flags.launch_server && self.server_address.is_none() {
            return fail(format!("'{}' launches a client but has no server to join", self.name));
        }
        if flags.launch_client
            && !self
                .client_params
                .split_whitespace()
                .any(|p| p.eq_ignore_ascii_case("-windowed") || p.eq_ignore_ascii_case("-nullrhi"))
        {
            return fail(format!(
                "'{}' launches a client without -windowed or -nullrhi in its parameters",
                self.name
            ));
        }
        if flags.beacon_connect && self.beacon_type.as_deref().map_or(true, |t| t.trim().is_empty()) {
            return fail(format!("'{}' connects a beacon but declares no beacon type", self.name));
        }
        if (flags.expect_server_crash || flags.ignore_server_crash) && !flags.launch_server {
            return fail(format!("'{}' declares server crash policy without a server", self.name));
        }
        if flags.expect_server_crash && flags.ignore_server_crash {
            return fail(format!("'{}' both expects and ignores a server crash", self.name));
        }
        if flags.expect_client_crash && flags.ignore_client_crash {
            return fail(format!("'{}' both expects and ignores a client crash", self.name));
        }
        if flags.auto_reconnect && flags.expect_disconnect {
            return fail(format!("'{}' both reconnects and expects a disconnect", self.name));
        }
        let mut remote = self.requirements;
        remote.remove(Requirement::Custom);
        if !self.uses_minimal_client() && !remote.is_empty() {
            return fail(format!(
                "'{}' declares requirements {} without a server to connect to",
                self.name, remote
            ));
        }

        validate_requirements(&self.effective_requirements())
    }
}
