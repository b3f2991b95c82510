use crate::codec::{ControlChannelCodec, ControlCommand, ControlMessage};
use crate::environment::UnitTestEnvironment;
use crate::error::HarnessError;
use crate::log_watcher::{LogFileTailer, LogStreamWatcher, MatchEvent, PatternGroup};
use crate::minimal_client::{
    ActorFilter, ClientEvent, ConnectMode, ConnectionState, MinimalClient, MinimalClientConfig,
};
use crate::port_manager::PortAllocator;
use crate::process_supervisor::{
    BlockingTracker, LaunchSpec, LogCategory, ProcessEvent, ProcessExit, ProcessHandle, ProcessSupervisor,
    SupervisorConfig, SuspendState,
};
use crate::requirements::{Requirement, RequirementsStateMachine};
use crate::settings::{UnitTestSettings, VerificationState};
use crate::summary::StatusLog;
use crate::suspend::{ResumeChannel, ResumeOutcome, SuspendResumeChannel};
use crate::timeout::TimeoutSupervisor;
use bytes::Bytes;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A unit test driven by the orchestrator.
///
/// Hooks run synchronously from the tick loop and act through the
/// [`TestContext`]. Only `settings` and `execute_payload` are required.
pub trait UnitTest: Send {
    fn settings(&self) -> &UnitTestSettings;

    /// Runs once, when every declared requirement has been met.
    fn execute_payload(&mut self, ctx: &mut TestContext<'_>);

    /// Patterns matched in server and client output, reported to `on_log_match`.
    fn log_patterns(&self) -> Vec<String> {
        Vec::new()
    }

    fn on_command_result(&mut self, _ctx: &mut TestContext<'_>, _success: bool, _output: &str) {}

    /// `NotifyEvent` for an event this test watches.
    fn on_event(&mut self, _ctx: &mut TestContext<'_>, _event: &str) {}

    /// Control messages not handled by the orchestrator itself.
    fn on_control_message(&mut self, _ctx: &mut TestContext<'_>, _message: &ControlMessage) {}

    fn on_log_match(&mut self, _ctx: &mut TestContext<'_>, _category: LogCategory, _pattern: &str, _line: &str) {}

    fn on_rpc_observed(&mut self, _ctx: &mut TestContext<'_>, _name: &str, _success: bool) {}

    /// Runs before the orchestrator applies its exit policy.
    fn on_process_exit(&mut self, _ctx: &mut TestContext<'_>, _category: LogCategory, _exit: &ProcessExit) {}

    fn on_tick(&mut self, _ctx: &mut TestContext<'_>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OrchestratorPhase {
    Idle,
    Launching,
    AwaitingConnection,
    Running,
    Concluding,
    Done,
}

impl fmt::Display for OrchestratorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Resources shared by every orchestrator of a session.
#[derive(Clone)]
pub struct HarnessResources {
    pub environment: Arc<UnitTestEnvironment>,
    pub ports: Arc<PortAllocator>,
    pub blocking: BlockingTracker,
    pub supervisor: SupervisorConfig,
    /// Directory for this test's process logs
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct ProcessSlots {
    service: Option<ProcessHandle>,
    server: Option<ProcessHandle>,
    client: Option<ProcessHandle>,
}

struct HarnessState {
    name: String,
    run_id: Uuid,
    settings: UnitTestSettings,
    environment: Arc<UnitTestEnvironment>,
    ports: Arc<PortAllocator>,
    log_dir: Option<PathBuf>,
    supervisor: ProcessSupervisor,
    watcher: LogStreamWatcher,
    tailers: Vec<LogFileTailer>,
    resume: Box<dyn ResumeChannel>,
    client: Option<MinimalClient>,
    requirements: RequirementsStateMachine,
    timeout: Option<TimeoutSupervisor>,
    verification: VerificationState,
    phase: OrchestratorPhase,
    status: StatusLog,
    processes: ProcessSlots,
    test_patterns: Vec<String>,
    service_ready: bool,
    server_ready: bool,
    server_port: Option<u16>,
    connect_attempts: u32,
    reconnect_pending: bool,
    /// Pings sent on the current connection and not yet answered
    pings_outstanding: u32,
    payload_executed: bool,
    send_failure: Option<HarnessError>,
    conclude_requested: bool,
    aborted: bool,
    deferral_logged: bool,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

/// What a test hook may do to the running test.
pub struct TestContext<'a> {
    harness: &'a mut HarnessState,
    now: Instant,
}

impl TestContext<'_> {
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn name(&self) -> &str {
        &self.harness.name
    }

    pub fn settings(&self) -> &UnitTestSettings {
        &self.harness.settings
    }

    pub fn phase(&self) -> OrchestratorPhase {
        self.harness.phase
    }

    /// Sends a control message to the agent.
    ///
    /// Returns `false` when nothing was sent. While the payload is running
    /// that concludes the test as `VerifiedNeedsUpdate`; earlier it is only
    /// a cue to try again.
    pub fn send_control(&mut self, kind: ControlCommand, payload: &str) -> bool {
        self.harness.send_control(kind, payload)
    }

    /// Sends a remote call; transmission is reported to `on_rpc_observed`.
    pub fn send_rpc(&mut self, name: &str, params: &str) -> bool {
        let sent = self.harness.client.as_ref().is_some_and(|c| c.send_rpc(name, params));
        if !sent {
            self.harness.record_send_failure(format!("RPC {}", name));
        }
        sent
    }

    /// Sets the verdict. The first terminal verdict wins.
    pub fn verify(&mut self, state: VerificationState, reason: &str) -> bool {
        self.harness.verify(state, reason)
    }

    pub fn verification(&self) -> VerificationState {
        self.harness.verification
    }

    pub fn reset_timeout(&mut self, reason: &str, min_duration: Duration) {
        let now = self.now;
        self.harness.reset_timeout(now, reason, false, min_duration);
    }

    /// Marks the test's custom requirement met.
    pub fn mark_custom_met(&mut self) {
        self.harness.requirements.mark_met(Requirement::Custom);
    }

    /// Adds an important line to the test's status log.
    pub fn log_status(&mut self, message: &str) {
        self.harness.status.important(&self.harness.name, message);
    }
}

impl HarnessState {
    fn send_control(&mut self, kind: ControlCommand, payload: &str) -> bool {
        let sent = self
            .client
            .as_ref()
            .is_some_and(|c| c.send_control_message(kind, payload));
        if !sent {
            self.record_send_failure(format!("{} control message", kind));
        } else if kind == ControlCommand::Ping {
            self.pings_outstanding += 1;
        }
        sent
    }

    fn record_send_failure(&mut self, what: String) {
        let error = HarnessError::SendFailed { what };
        if self.phase == OrchestratorPhase::Running {
            warn!(test = %self.name, "{}", error);
            self.send_failure.get_or_insert(error);
        } else {
            debug!(test = %self.name, "{}, will retry", error);
        }
    }

    fn verify(&mut self, state: VerificationState, reason: &str) -> bool {
        if !state.is_terminal() {
            return false;
        }
        if self.verification.is_terminal() {
            debug!(test = %self.name, "Ignoring verdict {} ({}): already {}", state, reason, self.verification);
            return false;
        }

        self.verification = state;
        let message = format!("Verification state: {} ({})", state, reason);
        self.status.important(&self.name, &message);
        true
    }

    fn fail(&mut self, error: HarnessError) {
        let message = error.to_string();
        self.status.error(&self.name, &message);
        self.verify(VerificationState::VerifiedNeedsUpdate, &message);
    }

    fn reset_timeout(&mut self, now: Instant, reason: &str, extend_connection: bool, min_duration: Duration) {
        if let Some(timeout) = self.timeout.as_mut() {
            timeout.reset_timeout(now, reason, extend_connection, min_duration);
        }
    }

    fn context(&mut self, now: Instant) -> TestContext<'_> {
        TestContext { harness: self, now }
    }

    fn category_of(&self, handle: ProcessHandle) -> Option<LogCategory> {
        self.supervisor.get(handle).map(|p| p.category)
    }

    fn process_log_file(&self, name: &str) -> Option<PathBuf> {
        self.log_dir.as_deref().map(|dir| dir.join(name))
    }

    fn server_address(&self) -> Option<String> {
        match (self.server_port, &self.settings.server_address) {
            (Some(port), _) => Some(format!("{}:{}", self.environment.server_host, port)),
            (None, Some(address)) => Some(address.clone()),
            (None, None) => None,
        }
    }

    fn actor_filter(&self) -> ActorFilter {
        let env = &self.environment;
        let required = self.settings.effective_requirements();
        let mut allowed = self.settings.allowed_actors.clone();

        if required.contains(Requirement::PlayerController)
            || required.contains(Requirement::Ping)
            || self.settings.flags.accept_player_controller
        {
            allowed.push(env.player_controller_class.clone());
        }
        if required.contains(Requirement::Pawn) {
            allowed.push(env.pawn_class.clone());
        }
        if required.contains(Requirement::NutActor) {
            allowed.push(env.agent_actor_class.clone());
        }

        Arc::new(move |class: &str| allowed.iter().any(|a| a == class))
    }

    fn watch_process(&mut self, handle: ProcessHandle, groups: &[(PatternGroup, Vec<String>)], log_file: Option<&Path>) {
        for (group, patterns) in groups {
            self.watcher.watch(handle, *group, patterns);
        }

        if let (true, Some(path)) = (self.environment.tail_log_files, log_file) {
            match LogFileTailer::start(handle, path.to_path_buf(), self.supervisor.line_sender()) {
                Ok(tailer) => self.tailers.push(tailer),
                Err(e) => warn!(test = %self.name, "Failed to tail {:?}: {}", path, e),
            }
        }
    }

    /// Launches what the test needs and has not launched yet. Returns false on failure.
    fn advance_launch(&mut self, now: Instant) -> bool {
        let flags = self.settings.flags.clone();
        let service_pending = flags.launch_service && self.processes.service.is_none();
        let server_pending = flags.launch_server && self.processes.server.is_none();

        if !service_pending && !server_pending {
            return true;
        }

        if self.supervisor.is_blocking_process_active() && !self.service_running() {
            if !self.deferral_logged {
                self.status.log(&self.name, "Deferring launch behind an active blocking process");
                self.deferral_logged = true;
            }
            return true;
        }

        if service_pending {
            return self.launch_service(now);
        }

        if server_pending && (!flags.launch_service || self.service_ready) {
            return self.launch_server(now);
        }

        true
    }

    fn service_running(&self) -> bool {
        self.processes
            .service
            .and_then(|h| self.supervisor.get(h))
            .is_some_and(|p| !p.finished)
    }

    fn launch_service(&mut self, now: Instant) -> bool {
        let Some(program) = self.environment.service_program.clone() else {
            self.fail(HarnessError::LaunchFailed {
                tag: "UT_Service".to_string(),
                reason: "environment names no service program".to_string(),
            });
            return false;
        };

        match self.supervisor.launch(LaunchSpec::service(&self.environment, &program)) {
            Ok(handle) => {
                self.processes.service = Some(handle);
                let patterns = self.environment.service_ready.clone();
                self.service_ready = patterns.is_empty();
                self.watch_process(handle, &[(PatternGroup::ServiceReady, patterns)], None);
                self.reset_timeout(now, "service launched", false, Duration::ZERO);
                self.status.log(&self.name, "Launched service process");
                true
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    fn launch_server(&mut self, now: Instant) -> bool {
        let Some(port) = self.ports.allocate() else {
            self.fail(HarnessError::LaunchFailed {
                tag: "UT_Server".to_string(),
                reason: "no free server port".to_string(),
            });
            return false;
        };

        let log_file = self.process_log_file("Server.log");
        let spec = LaunchSpec::server(
            &self.environment,
            &self.settings.server_url,
            &self.settings.server_params,
            port,
            log_file.as_deref(),
        );

        match self.supervisor.launch(spec) {
            Ok(handle) => {
                self.processes.server = Some(handle);
                self.server_port = Some(port);

                let env = self.environment.clone();
                self.server_ready = env.server_ready.is_empty();
                self.watch_process(
                    handle,
                    &[
                        (PatternGroup::ServerStartProgress, env.server_start_progress.clone()),
                        (PatternGroup::ServerReady, env.server_ready.clone()),
                        (PatternGroup::ServerTimeoutReset, env.server_timeout_reset.clone()),
                        (PatternGroup::Custom, self.test_patterns.clone()),
                    ],
                    log_file.as_deref(),
                );

                self.reset_timeout(now, "server launched", true, Duration::ZERO);
                self.status.log(&self.name, &format!("Launched server on port {}", port));
                true
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    fn launch_client_process(&mut self, now: Instant) {
        let Some(address) = self.server_address() else {
            return;
        };

        let log_file = self.process_log_file("Client.log");
        let spec = LaunchSpec::client(&self.environment, &address, &self.settings.client_params, log_file.as_deref());

        match self.supervisor.launch(spec) {
            Ok(handle) => {
                self.processes.client = Some(handle);
                let env = self.environment.clone();
                self.watch_process(
                    handle,
                    &[
                        (PatternGroup::ClientTimeoutReset, env.client_timeout_reset.clone()),
                        (PatternGroup::Custom, self.test_patterns.clone()),
                    ],
                    log_file.as_deref(),
                );
                self.reset_timeout(now, "client launched", false, Duration::ZERO);
                self.status.log(&self.name, "Launched client process");
            }
            Err(e) => self.fail(e),
        }
    }

    fn connect_minimal_client(&mut self, now: Instant) {
        let Some(address) = self.server_address() else {
            return;
        };

        let mode = match (&self.settings.flags.beacon_connect, &self.settings.beacon_type) {
            (true, Some(beacon_type)) => ConnectMode::Beacon(beacon_type.clone()),
            _ => ConnectMode::Game,
        };

        self.connect_attempts += 1;
        self.status.log(
            &self.name,
            &format!("Connecting minimal client to {} (attempt {})", address, self.connect_attempts),
        );

        self.client = Some(MinimalClient::connect(MinimalClientConfig {
            address,
            mode,
            version: self.environment.net_version.clone(),
            actor_filter: self.actor_filter(),
            connect_timeout: self.settings.connection_timeout(),
        }));
        self.reset_timeout(now, "minimal client connecting", true, Duration::ZERO);
    }

    fn close_client(&mut self) {
        if let Some(mut client) = self.client.take() {
            client.close();
        }
        self.pings_outstanding = 0;
    }

    fn maybe_send_ping(&mut self) {
        let required = self.requirements.required();
        if !required.contains(Requirement::Ping) || self.requirements.met().contains(Requirement::Ping) || self.pings_outstanding > 0 {
            return;
        }
        if self.client.as_ref().map(MinimalClient::state) != Some(ConnectionState::Open) {
            return;
        }

        // Ping goes out once everything else is in place
        let mut rest = self.requirements.unmet();
        rest.remove(Requirement::Ping);
        if !rest.is_empty() {
            return;
        }

        if self.send_control(ControlCommand::Ping, "") {
            debug!(test = %self.name, "Sent ping");
        }
    }

    fn conclude(&mut self) {
        if self.phase >= OrchestratorPhase::Concluding {
            return;
        }
        self.phase = OrchestratorPhase::Concluding;
        self.conclude_requested = false;

        let unmet = self.requirements.unmet();
        if !unmet.is_empty() && !self.verification.is_terminal() {
            self.status.log(&self.name, &format!("Requirements not met: {}", unmet));
        }
    }

    /// Tears down the client, watchers and processes. Finished processes are left alone.
    fn cleanup(&mut self, now: Instant) {
        self.close_client();
        for handle in [self.processes.service, self.processes.server, self.processes.client]
            .into_iter()
            .flatten()
        {
            self.watcher.unwatch(handle);
        }
        self.tailers.clear();
        self.supervisor.release_all();

        if self.phase != OrchestratorPhase::Done {
            self.phase = OrchestratorPhase::Done;
            self.finished_at = Some(now);
            info!(test = %self.name, run_id = %self.run_id, verification = %self.verification, "Unit test finished");
        }
    }
}

/// Drives one unit test from launch to verdict.
///
/// Everything happens inside [`tick`](Self::tick); background tasks only
/// queue process output, connection events and exits for it.
pub struct UnitTestOrchestrator {
    test: Box<dyn UnitTest>,
    harness: HarnessState,
}

impl UnitTestOrchestrator {
    pub fn new(test: Box<dyn UnitTest>, resources: HarnessResources) -> Self {
        let settings = test.settings().clone();
        let test_patterns = test.log_patterns();
        let resume = SuspendResumeChannel::detect(&resources.environment.suspend_pipe_prefix);

        let harness = HarnessState {
            name: settings.name.clone(),
            run_id: Uuid::new_v4(),
            settings,
            environment: resources.environment,
            ports: resources.ports,
            log_dir: resources.log_dir,
            supervisor: ProcessSupervisor::new(resources.supervisor, resources.blocking),
            watcher: LogStreamWatcher::new(),
            tailers: Vec::new(),
            resume,
            client: None,
            requirements: RequirementsStateMachine::new(),
            timeout: None,
            verification: VerificationState::Unverified,
            phase: OrchestratorPhase::Idle,
            status: StatusLog::new(),
            processes: ProcessSlots::default(),
            test_patterns,
            service_ready: false,
            server_ready: false,
            server_port: None,
            connect_attempts: 0,
            reconnect_pending: false,
            pings_outstanding: 0,
            payload_executed: false,
            send_failure: None,
            conclude_requested: false,
            aborted: false,
            deferral_logged: false,
            started_at: None,
            finished_at: None,
        };

        Self { test, harness }
    }

    /// Validates the declared settings and starts the test.
    ///
    /// Nothing is launched when validation fails.
    pub fn execute(&mut self, now: Instant) -> Result<(), HarnessError> {
        let h = &mut self.harness;
        if h.phase != OrchestratorPhase::Idle {
            return Ok(());
        }

        let required = h.settings.effective_requirements();
        let declared = h.settings.validate().and_then(|()| h.requirements.declare(required));
        if let Err(e) = declared {
            h.status.error(&h.name, &e.to_string());
            return Err(e);
        }

        let mut timeout = TimeoutSupervisor::new(now, h.settings.timeout(), h.settings.connection_timeout());
        if h.settings.tolerates_remote_crash() {
            timeout.tolerate_remote_crash();
        }
        h.timeout = Some(timeout);
        h.started_at = Some(now);
        h.phase = OrchestratorPhase::Launching;
        info!(test = %h.name, run_id = %h.run_id, "Executing unit test");
        h.status.log(
            &h.name,
            &format!("Executing unit test (requires {})", h.requirements.required()),
        );

        if !h.advance_launch(now) {
            h.conclude();
            h.cleanup(now);
            return Ok(());
        }

        if h.settings.server_address.is_some() && !h.settings.flags.launch_server {
            h.server_ready = true;
        }
        h.phase = OrchestratorPhase::AwaitingConnection;
        Ok(())
    }

    /// Advances the test by one step.
    pub fn tick(&mut self, now: Instant) {
        if matches!(self.harness.phase, OrchestratorPhase::Idle | OrchestratorPhase::Done) {
            return;
        }

        if self.harness.phase < OrchestratorPhase::Concluding && !self.harness.advance_launch(now) {
            self.harness.conclude();
        }

        self.process_supervisor_events(now);
        self.process_client_events(now);

        if self.harness.phase < OrchestratorPhase::Concluding {
            self.advance_connection(now);
            self.harness.maybe_send_ping();
            self.maybe_execute_payload(now);
            self.test.on_tick(&mut self.harness.context(now));
            self.apply_send_failure();
            self.check_timeout(now);
        }

        if self.harness.verification.is_terminal() || self.harness.conclude_requested {
            self.harness.conclude();
        }
        if self.harness.phase == OrchestratorPhase::Concluding {
            self.harness.cleanup(now);
        }
    }

    fn process_supervisor_events(&mut self, now: Instant) {
        let mut exits = Vec::new();
        for event in self.harness.supervisor.drain_events() {
            match event {
                ProcessEvent::Line { handle, line } => self.harness.watcher.push_line(handle, &line),
                ProcessEvent::Exited(exit) => exits.push(exit),
            }
        }

        for event in self.harness.watcher.scan() {
            self.handle_log_match(now, event);
        }
        for exit in exits {
            self.handle_process_exit(now, exit);
        }
    }

    fn handle_log_match(&mut self, now: Instant, event: MatchEvent) {
        let h = &mut self.harness;
        let Some(category) = h.category_of(event.handle) else {
            return;
        };

        match event.group {
            PatternGroup::ServerStartProgress => {
                h.reset_timeout(now, &format!("server starting: {}", event.line), true, Duration::ZERO);
            }
            PatternGroup::ServerReady => {
                if !h.server_ready {
                    h.server_ready = true;
                    h.watcher.unwatch_group(event.handle, PatternGroup::ServerReady);
                    h.reset_timeout(now, "server ready", true, Duration::ZERO);
                    h.status.log(&h.name, &format!("Server ready: {}", event.line));
                }
            }
            PatternGroup::ServerTimeoutReset | PatternGroup::ClientTimeoutReset => {
                h.reset_timeout(now, &format!("{}: {}", category, event.pattern), false, Duration::ZERO);
            }
            PatternGroup::ServiceReady => {
                if !h.service_ready {
                    h.service_ready = true;
                    h.watcher.unwatch_group(event.handle, PatternGroup::ServiceReady);
                    h.status.log(&h.name, "Service ready");
                }
            }
            PatternGroup::Custom => {
                self.test.on_log_match(&mut h.context(now), category, &event.pattern, &event.line);
            }
        }
    }

    fn handle_process_exit(&mut self, now: Instant, exit: ProcessExit) {
        let Some(process) = self.harness.supervisor.get(exit.handle) else {
            return;
        };
        let category = process.category;
        let tag = process.tag.clone();

        self.harness.watcher.unwatch(exit.handle);
        self.test.on_process_exit(&mut self.harness.context(now), category, &exit);

        let h = &mut self.harness;
        if h.phase >= OrchestratorPhase::Concluding {
            return;
        }

        let flags = &h.settings.flags;
        let (expected, ignored) = match category {
            LogCategory::Server => (flags.expect_server_crash, flags.ignore_server_crash),
            LogCategory::Client => (flags.expect_client_crash, flags.ignore_client_crash),
            LogCategory::Service => (false, false),
        };

        let tail = exit.log_tail.iter().rev().take(5).rev().cloned().collect::<Vec<_>>().join(" | ");
        if expected {
            let error = HarnessError::ExpectedProcessExit { tag, exit_code: exit.exit_code };
            h.status.important(&h.name, &format!("{} (log tail: {})", error, tail));
        } else if ignored {
            h.status.log(&h.name, &format!("Ignoring exit of {} (exit code {:?})", tag, exit.exit_code));
        } else {
            h.status.error(&h.name, &format!("Log tail of {}: {}", tag, tail));
            h.fail(HarnessError::UnexpectedProcessExit { tag, exit_code: exit.exit_code });
            h.conclude_requested = true;
        }
    }

    fn advance_connection(&mut self, now: Instant) {
        let h = &mut self.harness;
        if !h.server_ready || !h.settings.uses_minimal_client() {
            return;
        }

        if h.settings.flags.launch_client && h.processes.client.is_none() {
            h.launch_client_process(now);
        }
        let first_connect = h.phase == OrchestratorPhase::AwaitingConnection && !h.requirements.has_fired();
        if h.client.is_none() && (first_connect || h.reconnect_pending) {
            h.reconnect_pending = false;
            h.connect_minimal_client(now);
        }
    }

    fn process_client_events(&mut self, now: Instant) {
        let events = match self.harness.client.as_mut() {
            Some(client) => client.poll_events(),
            None => return,
        };

        for event in events {
            if self.harness.phase >= OrchestratorPhase::Concluding {
                break;
            }

            match event {
                ClientEvent::Connected { map, .. } => {
                    let h = &mut self.harness;
                    h.status.log(&h.name, &format!("Minimal client connected (map {})", map));
                    if let Some(timeout) = h.timeout.as_mut() {
                        timeout.clear_connection_deadline();
                    }
                    h.reset_timeout(now, "minimal client connected", false, Duration::ZERO);
                    h.requirements.mark_met(Requirement::Connection);
                    if h.settings.flags.beacon_connect {
                        h.requirements.mark_met(Requirement::Beacon);
                    }
                }
                ClientEvent::ControlBunch(bytes) => self.handle_control_bunch(now, bytes),
                ClientEvent::ActorAccepted { class_name, .. } => {
                    let h = &mut self.harness;
                    let env = &h.environment;
                    let requirement = if class_name == env.player_controller_class {
                        Some(Requirement::PlayerController)
                    } else if class_name == env.pawn_class {
                        Some(Requirement::Pawn)
                    } else if class_name == env.agent_actor_class {
                        Some(Requirement::NutActor)
                    } else {
                        None
                    };
                    if let Some(requirement) = requirement {
                        h.requirements.mark_met(requirement);
                    }
                }
                ClientEvent::ActorBlocked { class_name, .. } => {
                    debug!(test = %self.harness.name, "Blocked actor {}", class_name);
                }
                ClientEvent::NetworkFailure(reason) => self.handle_network_failure(&reason),
                ClientEvent::RpcObserved { name, success } => {
                    if !success {
                        self.harness.record_send_failure(format!("RPC {}", name));
                    }
                    self.test.on_rpc_observed(&mut self.harness.context(now), &name, success);
                }
            }
        }
    }

    fn handle_control_bunch(&mut self, now: Instant, bytes: Bytes) {
        let message = match ControlChannelCodec::decode(&bytes) {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(e) => {
                self.harness
                    .fail(HarnessError::ProtocolViolation(format!("undecodable control message: {}", e)));
                return;
            }
        };

        if message.kind == ControlCommand::Pong {
            let h = &mut self.harness;
            if h.pings_outstanding > 0 {
                h.pings_outstanding -= 1;
                h.status.log(&h.name, "Received pong");
                h.requirements.mark_met(Requirement::Ping);
            } else {
                h.fail(HarnessError::ProtocolViolation("received Pong without a pending Ping".to_string()));
            }
            return;
        }

        let mut ctx = self.harness.context(now);
        match message.kind {
            ControlCommand::CommandSucceeded => self.test.on_command_result(&mut ctx, true, &message.payload),
            ControlCommand::CommandFailed => self.test.on_command_result(&mut ctx, false, &message.payload),
            ControlCommand::NotifyEvent => self.test.on_event(&mut ctx, &message.payload),
            _ => self.test.on_control_message(&mut ctx, &message),
        }
    }

    fn handle_network_failure(&mut self, reason: &str) {
        let h = &mut self.harness;
        let error = HarnessError::NetworkFailure(reason.to_string());
        h.close_client();

        if h.settings.flags.auto_reconnect {
            h.status.log(&h.name, &format!("{}; reconnecting", error));
            h.requirements.reset();
            h.reconnect_pending = true;
        } else if h.settings.flags.expect_disconnect {
            h.status.important(&h.name, &format!("Expected disconnect: {}", reason));
        } else {
            h.fail(error);
        }
    }

    fn maybe_execute_payload(&mut self, now: Instant) {
        let h = &mut self.harness;
        h.requirements.try_fire();
        if !h.requirements.has_fired() || h.payload_executed {
            return;
        }

        h.payload_executed = true;
        h.phase = OrchestratorPhase::Running;
        h.reset_timeout(now, "executing payload", false, Duration::ZERO);
        h.status.log(&h.name, "Requirements met, executing payload");

        self.test.execute_payload(&mut self.harness.context(now));
    }

    fn apply_send_failure(&mut self) {
        if let Some(error) = self.harness.send_failure.take() {
            self.harness.fail(error);
        }
    }

    fn check_timeout(&mut self, now: Instant) {
        let h = &mut self.harness;
        let Some(expiry) = h.timeout.as_mut().and_then(|t| t.check(now)) else {
            return;
        };

        let which = if expiry.connection { "connection timeout" } else { "timeout" };
        let error = HarnessError::TimeoutExpired {
            reason: format!("{}; last reset: {}", which, expiry.last_reason),
        };
        if h.verification.is_terminal() {
            debug!(test = %h.name, "{} after verdict", error);
        } else {
            let unmet = h.requirements.unmet();
            if !unmet.is_empty() {
                h.status.error(&h.name, &format!("Unmet requirements at timeout: {}", unmet));
            }
            h.fail(error);
        }
        h.conclude_requested = true;
    }

    /// Ends the test without a verdict.
    pub fn abort(&mut self, now: Instant) {
        let h = &mut self.harness;
        if h.phase == OrchestratorPhase::Done {
            return;
        }
        h.aborted = true;
        h.status.important(&h.name, "Unit test aborted");
        h.conclude();
        h.cleanup(now);
    }

    /// Tears the test down immediately.
    pub fn cleanup(&mut self, now: Instant) {
        self.harness.conclude();
        self.harness.cleanup(now);
    }

    /// Asks the agent to suspend the server process.
    pub fn request_suspend(&mut self) -> Result<(), HarnessError> {
        let h = &mut self.harness;
        if !h.resume.is_supported() {
            return Err(HarnessError::SuspendUnsupported);
        }
        let sent = h
            .client
            .as_ref()
            .is_some_and(|c| c.send_control_message(ControlCommand::SuspendProcess, ""));
        if !sent {
            return Err(HarnessError::SendFailed { what: "suspend request".to_string() });
        }

        if let Some(server) = h.processes.server {
            h.supervisor.set_suspend_state(server, SuspendState::Suspended);
        }
        h.status.log(&h.name, "Requested server suspend");
        Ok(())
    }

    /// Resumes the suspended server process.
    pub fn request_resume(&mut self) -> Result<ResumeOutcome, HarnessError> {
        let h = &mut self.harness;
        let Some(pid) = h.processes.server.and_then(|s| h.supervisor.get(s)).map(|p| p.pid) else {
            return Err(HarnessError::SendFailed { what: "resume signal: no server process".to_string() });
        };
        self.resume_process(pid)
    }

    /// Resumes the process `pid` through its named pipe.
    pub fn resume_process(&mut self, pid: u32) -> Result<ResumeOutcome, HarnessError> {
        let h = &mut self.harness;
        let outcome = h.resume.resume(pid)?;

        if outcome == ResumeOutcome::Resumed {
            if let Some(server) = h.processes.server {
                h.supervisor.set_suspend_state(server, SuspendState::Active);
            }
            h.status.log(&h.name, &format!("Resumed process {}", pid));
        } else {
            h.status.log(&h.name, &format!("Resume pipe for process {} not ready", pid));
        }
        Ok(outcome)
    }

    /// Marks every requirement met (debugging aid).
    pub fn force_ready(&mut self) {
        let h = &mut self.harness;
        for requirement in h.requirements.unmet().iter() {
            h.requirements.mark_met(requirement);
        }
        h.status.log(&h.name, "Forced requirements ready");
    }

    /// Drops the minimal client as if the network failed.
    pub fn force_disconnect(&mut self) {
        if self.harness.client.is_some() {
            self.handle_network_failure("forced disconnect");
        }
    }

    /// Collects exits of processes still shutting down after cleanup.
    pub fn has_running_processes(&mut self) -> bool {
        self.harness.supervisor.drain_events();
        self.harness.supervisor.running_count() > 0
    }

    pub fn name(&self) -> &str {
        &self.harness.name
    }

    /// Identifies this run among reruns of the same test.
    pub fn run_id(&self) -> Uuid {
        self.harness.run_id
    }

    pub fn settings(&self) -> &UnitTestSettings {
        &self.harness.settings
    }

    pub fn phase(&self) -> OrchestratorPhase {
        self.harness.phase
    }

    pub fn is_done(&self) -> bool {
        self.harness.phase == OrchestratorPhase::Done
    }

    pub fn verification(&self) -> VerificationState {
        self.harness.verification
    }

    pub fn was_aborted(&self) -> bool {
        self.harness.aborted
    }

    pub fn requirements(&self) -> &RequirementsStateMachine {
        &self.harness.requirements
    }

    pub fn connect_attempts(&self) -> u32 {
        self.harness.connect_attempts
    }

    pub fn server_port(&self) -> Option<u16> {
        self.harness.server_port
    }

    pub fn has_client(&self) -> bool {
        self.harness.client.is_some()
    }

    pub fn client_state(&self) -> Option<ConnectionState> {
        self.harness.client.as_ref().map(MinimalClient::state)
    }

    pub fn payload_executed(&self) -> bool {
        self.harness.payload_executed
    }

    pub fn timeout(&self) -> Option<&TimeoutSupervisor> {
        self.harness.timeout.as_ref()
    }

    pub fn status_log(&self) -> &StatusLog {
        &self.harness.status
    }

    pub fn server_suspend_state(&self) -> Option<SuspendState> {
        self.harness
            .processes
            .server
            .and_then(|s| self.harness.supervisor.get(s))
            .map(|p| p.suspend_state)
    }

    /// Time from execution to conclusion, or to `now` while running.
    pub fn elapsed(&self, now: Instant) -> Duration {
        match self.harness.started_at {
            Some(start) => self.harness.finished_at.unwrap_or(now).saturating_duration_since(start),
            None => Duration::ZERO,
        }
    }

    /// One-line status for the periodic dump.
    pub fn status_line(&self, now: Instant) -> String {
        let requirements = &self.harness.requirements;
        format!(
            "{}: {} / {} ({:.0}s, required {}, met {})",
            self.harness.name,
            self.harness.phase,
            self.harness.verification,
            self.elapsed(now).as_secs_f64(),
            requirements.required().to_bit_string(),
            requirements.met().to_bit_string(),
        )
    }
}

impl fmt::Debug for UnitTestOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitTestOrchestrator")
            .field("name", &self.harness.name)
            .field("run_id", &self.harness.run_id)
            .field("phase", &self.harness.phase)
            .field("verification", &self.harness.verification)
            .finish()
    }
}
