use anyhow::{Context, Result};
use netunit::agent::{AgentConfig, AgentHandle, AgentRegistries, AgentServer};
use netunit::environment::UnitTestEnvironment;
use netunit::orchestrator::{HarnessResources, TestContext, UnitTest, UnitTestOrchestrator};
use netunit::port_manager::{PortAllocator, PortAllocatorConfig};
use netunit::process_supervisor::{BlockingTracker, SupervisorConfig};
use netunit::settings::{UnitTestSettings, VerificationState};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

/// Each harness gets its own port range so parallel tests do not collide.
static NEXT_PORT_RANGE: AtomicU16 = AtomicU16::new(0);

/// An in-process agent plus the resources orchestrators need to reach it.
pub struct AgentHarness {
    pub agent: AgentHandle,
    pub environment: UnitTestEnvironment,
    temp_dir: TempDir,
    ports: Arc<PortAllocator>,
    blocking: BlockingTracker,
}

impl AgentHarness {
    pub async fn start() -> Result<Self> {
        Self::start_with(AgentConfig::default(), AgentRegistries::with_defaults()).await
    }

    pub async fn start_with(mut config: AgentConfig, registries: AgentRegistries) -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
        let suspend_prefix = format!("{}/resume-", temp_dir.path().display());
        config.suspend_pipe_prefix = suspend_prefix.clone();

        let agent = AgentServer::bind("127.0.0.1:0", config, registries)
            .await
            .context("Failed to bind agent")?;

        let base_port = 31000 + NEXT_PORT_RANGE.fetch_add(1, Ordering::SeqCst) * 200;
        let environment = UnitTestEnvironment {
            server_program: PathBuf::from("sh"),
            server_params: "-c".to_string(),
            base_port,
            suspend_pipe_prefix: suspend_prefix,
            ..Default::default()
        };
        let ports = Arc::new(PortAllocator::new(PortAllocatorConfig {
            base_port,
            ..Default::default()
        }));

        Ok(Self { agent, environment, temp_dir, ports, blocking: BlockingTracker::new() })
    }

    pub fn address(&self) -> String {
        self.agent.local_addr().to_string()
    }

    pub fn temp_path(&self) -> &std::path::Path {
        self.temp_dir.path()
    }

    /// Resources sharing this harness's ports and blocking-process tracker.
    pub fn resources(&self) -> HarnessResources {
        HarnessResources {
            environment: Arc::new(self.environment.clone()),
            ports: self.ports.clone(),
            blocking: self.blocking.clone(),
            supervisor: SupervisorConfig {
                graceful_shutdown_timeout: Duration::from_millis(500),
                ..Default::default()
            },
            log_dir: Some(self.temp_dir.path().to_path_buf()),
        }
    }

    /// Settings of a test joining the in-process agent.
    pub fn client_settings(&self, name: &str) -> UnitTestSettings {
        UnitTestSettings {
            name: name.to_string(),
            server_address: Some(self.address()),
            expected_result: VerificationState::VerifiedFixed,
            timeout_secs: 20,
            connection_timeout_secs: 10,
            ..Default::default()
        }
    }

    pub fn orchestrator(&self, test: impl UnitTest + 'static) -> UnitTestOrchestrator {
        UnitTestOrchestrator::new(Box::new(test), self.resources())
    }
}

/// What a [`RecordingTest`] observed.
#[derive(Debug, Default)]
pub struct Record {
    pub executions: usize,
    pub command_results: Vec<(bool, String)>,
    pub events: Vec<String>,
}

type PayloadFn = Box<dyn FnMut(&mut TestContext<'_>) + Send>;

/// A test whose payload is a closure and whose hooks record what arrives.
pub struct RecordingTest {
    settings: UnitTestSettings,
    payload: PayloadFn,
    record: Arc<Mutex<Record>>,
}

impl RecordingTest {
    pub fn new(
        settings: UnitTestSettings,
        payload: impl FnMut(&mut TestContext<'_>) + Send + 'static,
    ) -> (Self, Arc<Mutex<Record>>) {
        let record = Arc::new(Mutex::new(Record::default()));
        let test = Self { settings, payload: Box::new(payload), record: record.clone() };
        (test, record)
    }
}

impl UnitTest for RecordingTest {
    fn settings(&self) -> &UnitTestSettings {
        &self.settings
    }

    fn execute_payload(&mut self, ctx: &mut TestContext<'_>) {
        self.record.lock().unwrap().executions += 1;
        (self.payload)(ctx);
    }

    fn on_command_result(&mut self, _ctx: &mut TestContext<'_>, success: bool, output: &str) {
        self.record.lock().unwrap().command_results.push((success, output.to_string()));
    }

    fn on_event(&mut self, _ctx: &mut TestContext<'_>, event: &str) {
        self.record.lock().unwrap().events.push(event.to_string());
    }
}

/// Ticks `orchestrator` until `done` holds or `limit` passes. Returns whether `done` held.
pub async fn tick_until(
    orchestrator: &mut UnitTestOrchestrator,
    limit: Duration,
    mut done: impl FnMut(&UnitTestOrchestrator) -> bool,
) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        orchestrator.tick(Instant::now());
        if done(orchestrator) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
