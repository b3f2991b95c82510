use crate::environment::UnitTestEnvironment;
use crate::memory::{MemorySource, ProcMeminfo};
use crate::orchestrator::{HarnessResources, UnitTest, UnitTestOrchestrator};
use crate::port_manager::PortAllocator;
use crate::process_supervisor::{BlockingTracker, SupervisorConfig};
use crate::settings::VerificationState;
use crate::summary::{FinalSummary, TestReport};
use chrono::{DateTime, Local};
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Creates a fresh instance of a unit test for each (re)queue.
pub type UnitTestFactory = Arc<dyn Fn() -> Box<dyn UnitTest> + Send + Sync>;

const SESSION_DIR_NAME: &str = "UnitTests";

/// Ticks after an auto-close before another, unless usage keeps rising.
const MEMORY_CLOSE_COOLDOWN_TICKS: u32 = 10;
/// No tests are started for this long after the auto-close limit is hit.
const MEMORY_LAUNCH_PAUSE: Duration = Duration::from_secs(4);

/// Limits and housekeeping of a test session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Enforce `max_unit_test_count` as a hard cap on active tests
    pub cap_unit_test_count: bool,
    pub max_unit_test_count: usize,
    /// Additional cap given on the command line
    pub command_line_cap: Option<usize>,
    pub allow_requeue: bool,
    /// Aborts after which a test is no longer requeued (0 = unlimited)
    pub max_auto_close_count: u32,
    /// Gate test starts and auto-close tests on system memory usage
    pub cap_unit_test_memory: bool,
    /// Used memory percentage at which no further tests are started
    pub max_memory_percent: u8,
    /// Used memory percentage at which the newest active test is aborted
    pub auto_close_memory_percent: u8,
    pub log_dir: PathBuf,
    pub purge_logs_days: Option<i64>,
    pub max_log_dirs: Option<usize>,
    pub status_interval_secs: u64,
    /// Grace period between SIGTERM and SIGKILL for test processes
    pub graceful_shutdown_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cap_unit_test_count: false,
            max_unit_test_count: 4,
            command_line_cap: None,
            allow_requeue: true,
            max_auto_close_count: 4,
            cap_unit_test_memory: false,
            max_memory_percent: 75,
            auto_close_memory_percent: 90,
            log_dir: PathBuf::from("logs"),
            purge_logs_days: None,
            max_log_dirs: None,
            status_interval_secs: 10,
            graceful_shutdown_secs: 5,
        }
    }
}

/// Log directory of one session: `<log_dir>/UnitTests` or `<log_dir>/UnitTests_<n>`.
#[derive(Debug, Clone)]
pub struct SessionLogDir {
    root: PathBuf,
}

impl SessionLogDir {
    /// Purges old session directories, then creates the first free one.
    pub fn create(base: &Path, purge_days: Option<i64>, max_dirs: Option<usize>) -> std::io::Result<Self> {
        fs::create_dir_all(base)?;
        purge_sessions(base, purge_days, max_dirs, Local::now())?;

        let mut root = base.join(SESSION_DIR_NAME);
        if root.exists() {
            let mut session = 0u32;
            loop {
                let candidate = base.join(format!("{}_{}", SESSION_DIR_NAME, session));
                if !candidate.exists() {
                    root = candidate;
                    break;
                }
                session += 1;
            }
        }

        fs::create_dir_all(&root)?;
        info!("Unit test session logs in {:?}", root);
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn status_log_path(&self) -> PathBuf {
        self.root.join("UnitTestStatus.log")
    }

    /// Creates a directory for one run of a test; reruns get a numeric suffix.
    pub fn test_dir(&self, test_name: &str) -> std::io::Result<PathBuf> {
        let safe: String = test_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();

        let mut dir = self.root.join(&safe);
        let mut run = 1;
        while dir.exists() {
            dir = self.root.join(format!("{}_{}", safe, run));
            run += 1;
        }
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

fn is_session_dir(name: &str) -> bool {
    name == SESSION_DIR_NAME || name.starts_with(&format!("{}_", SESSION_DIR_NAME))
}

/// Deletes session directories older than `purge_days`, then the oldest
/// ones beyond `max_dirs`. Returns the removed paths.
pub fn purge_sessions(
    base: &Path,
    purge_days: Option<i64>,
    max_dirs: Option<usize>,
    now: DateTime<Local>,
) -> std::io::Result<Vec<PathBuf>> {
    if purge_days.is_none() && max_dirs.is_none() {
        return Ok(Vec::new());
    }

    let mut sessions: Vec<(PathBuf, DateTime<Local>)> = Vec::new();
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_dir() || !entry.file_name().to_str().is_some_and(is_session_dir) {
            continue;
        }
        let created = metadata.created().or_else(|_| metadata.modified())?;
        sessions.push((entry.path(), DateTime::<Local>::from(created)));
    }
    sessions.sort_by_key(|(_, created)| *created);

    let mut removed = Vec::new();
    if let Some(days) = purge_days {
        let (old, keep): (Vec<_>, Vec<_>) = sessions
            .into_iter()
            .partition(|(_, created)| (now - *created).num_days() > days);
        removed.extend(old.into_iter().map(|(path, _)| path));
        sessions = keep;
    }

    if let Some(max) = max_dirs {
        let excess = sessions.len().saturating_sub(max);
        removed.extend(sessions.drain(..excess).map(|(path, _)| path));
    }

    for path in &removed {
        info!("Deleting old unit test log directory: {:?}", path);
        fs::remove_dir_all(path)?;
    }
    Ok(removed)
}

struct PendingTest {
    name: String,
    factory: UnitTestFactory,
}

struct ActiveTest {
    orchestrator: UnitTestOrchestrator,
    factory: UnitTestFactory,
    first_run: bool,
}

/// Queues unit tests, runs them within the session limits and reports
/// their results.
pub struct UnitTestManager {
    config: ManagerConfig,
    environment: Arc<UnitTestEnvironment>,
    ports: Arc<PortAllocator>,
    blocking: BlockingTracker,
    session: Option<SessionLogDir>,
    pending: VecDeque<PendingTest>,
    active: Vec<ActiveTest>,
    /// Finished orchestrators whose processes are still shutting down
    retired: Vec<UnitTestOrchestrator>,
    reports: Vec<TestReport>,
    unsupported: Vec<(String, String)>,
    abort_counts: HashMap<String, u32>,
    completed: HashSet<String>,
    aborted_first_run: bool,
    last_status_dump: Option<Instant>,
    summary: Option<FinalSummary>,
    memory: Box<dyn MemorySource>,
    /// Used memory percentage from the last sample
    memory_percent: Option<f64>,
    memory_cooldown: u32,
    memory_at_close: f64,
    last_memory_limit_hit: Option<Instant>,
}

impl UnitTestManager {
    pub fn new(
        config: ManagerConfig,
        environment: Arc<UnitTestEnvironment>,
        ports: Arc<PortAllocator>,
        session: Option<SessionLogDir>,
    ) -> Self {
        Self {
            config,
            environment,
            ports,
            blocking: BlockingTracker::new(),
            session,
            pending: VecDeque::new(),
            active: Vec::new(),
            retired: Vec::new(),
            reports: Vec::new(),
            unsupported: Vec::new(),
            abort_counts: HashMap::new(),
            completed: HashSet::new(),
            aborted_first_run: false,
            last_status_dump: None,
            summary: None,
            memory: Box::new(ProcMeminfo::default()),
            memory_percent: None,
            memory_cooldown: 0,
            memory_at_close: 0.0,
            last_memory_limit_hit: None,
        }
    }

    /// Replaces the system memory source used by the memory caps.
    pub fn with_memory_source(mut self, source: impl MemorySource + 'static) -> Self {
        self.memory = Box::new(source);
        self
    }

    /// Queues a unit test after validating a fresh instance of it.
    pub fn queue(&mut self, factory: UnitTestFactory) -> bool {
        let instance = factory();
        let settings = instance.settings();
        let name = settings.name.clone();

        if let Err(e) = settings.validate() {
            error!(test = %name, "Not queueing unit test: {}", e);
            return false;
        }

        if !self.environment.supports(&settings.supported_games) {
            let reason = format!("Unit test does not support game '{}'", self.environment.game);
            warn!(test = %name, "{}", reason);
            self.unsupported.push((name, reason));
            return false;
        }

        if self.is_queued_or_active(&name) {
            warn!(test = %name, "Unit test already queued or active");
            return false;
        }

        info!(test = %name, "Queued unit test");
        self.pending.push_back(PendingTest { name, factory });
        self.summary = None;
        true
    }

    fn is_queued_or_active(&self, name: &str) -> bool {
        self.pending.iter().any(|p| p.name == name)
            || self.active.iter().any(|a| a.orchestrator.name() == name)
    }

    fn within_limits(&self, now: Instant) -> bool {
        let active = self.active.len();

        if self.last_memory_limit_hit.is_some_and(|hit| now.saturating_duration_since(hit) < MEMORY_LAUNCH_PAUSE) {
            return false;
        }
        // With nothing running a start is always allowed, or the session could never progress
        if active > 0 && self.memory_above(self.config.max_memory_percent) {
            return false;
        }

        if self.config.cap_unit_test_count && active >= self.config.max_unit_test_count {
            return false;
        }
        if let Some(cap) = self.config.command_line_cap.filter(|c| *c > 0) {
            if active >= cap {
                return false;
            }
        }

        // Tests that never completed this session are capped, and more strictly after an abort
        let first_run_cap = if self.aborted_first_run { 2 } else { self.config.max_unit_test_count };
        if !self.config.cap_unit_test_count && active >= first_run_cap {
            let first_runs = self.active.iter().filter(|a| a.first_run).count();
            return first_runs < first_run_cap;
        }

        true
    }

    /// Starts pending tests while within limits.
    pub fn poll_queue(&mut self, now: Instant) {
        while !self.pending.is_empty() && self.within_limits(now) {
            let Some(pending) = self.pending.pop_front() else {
                break;
            };

            let log_dir = match self.session.as_ref().map(|s| s.test_dir(&pending.name)).transpose() {
                Ok(dir) => dir,
                Err(e) => {
                    warn!(test = %pending.name, "Failed to create log directory: {}", e);
                    None
                }
            };

            let resources = HarnessResources {
                environment: self.environment.clone(),
                ports: self.ports.clone(),
                blocking: self.blocking.clone(),
                supervisor: SupervisorConfig {
                    graceful_shutdown_timeout: Duration::from_secs(self.config.graceful_shutdown_secs),
                    ..Default::default()
                },
                log_dir,
            };

            let mut orchestrator = UnitTestOrchestrator::new((pending.factory)(), resources);
            let first_run = !self.completed.contains(&pending.name);

            if let Err(e) = orchestrator.execute(now) {
                error!(test = %pending.name, "Unit test failed to start: {}", e);
                let mut status = orchestrator.status_log().clone();
                status.error(&pending.name, &e.to_string());
                self.reports.push(TestReport::new(
                    orchestrator.settings(),
                    VerificationState::VerifiedNeedsUpdate,
                    false,
                    Duration::ZERO,
                    &status,
                ));
                continue;
            }

            self.active.push(ActiveTest { orchestrator, factory: pending.factory, first_run });
        }
    }

    /// Advances every active test, retires finished ones and refills from the queue.
    ///
    /// Returns the final summary on the tick everything has finished.
    pub fn tick(&mut self, now: Instant) -> Option<&FinalSummary> {
        self.sample_memory();

        for active in &mut self.active {
            active.orchestrator.tick(now);
        }

        let (done, running): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.active).into_iter().partition(|a| a.orchestrator.is_done());
        self.active = running;
        for finished in done {
            self.record_finished(finished.orchestrator, now);
        }

        self.retired.retain_mut(|o| o.has_running_processes());

        self.auto_close_for_memory(now);
        self.poll_queue(now);

        let interval = Duration::from_secs(self.config.status_interval_secs.max(1));
        if self.last_status_dump.map_or(true, |last| now.saturating_duration_since(last) >= interval) {
            if !self.active.is_empty() || !self.pending.is_empty() {
                self.dump_status(now);
            }
            self.last_status_dump = Some(now);
        }

        if self.is_idle() && self.summary.is_none() && (!self.reports.is_empty() || !self.unsupported.is_empty()) {
            let summary = FinalSummary {
                unsupported: self.unsupported.clone(),
                reports: self.reports.clone(),
            };
            summary.log();
            self.summary = Some(summary);
            return self.summary.as_ref();
        }

        None
    }

    fn sample_memory(&mut self) {
        if !self.config.cap_unit_test_memory {
            return;
        }

        self.memory_percent = match self.memory.sample() {
            Ok(info) => Some(info.used_percent()),
            Err(e) => {
                warn!("Failed to sample system memory: {}", e);
                None
            }
        };
    }

    fn memory_above(&self, percent: u8) -> bool {
        self.config.cap_unit_test_memory
            && self.memory_percent.is_some_and(|used| used >= f64::from(percent))
    }

    /// Aborts the most recently started test while memory is critically low.
    ///
    /// Never closes the last test running. After a close, further closes
    /// wait out a cooldown unless usage rises past the level at the close.
    fn auto_close_for_memory(&mut self, now: Instant) {
        let used = self.memory_percent.unwrap_or_default();
        if self.memory_cooldown > 0 {
            self.memory_cooldown -= 1;
            if used > self.memory_at_close {
                self.memory_cooldown = 0;
            }
        }

        if self.active.len() < 2
            || self.memory_cooldown > 0
            || !self.memory_above(self.config.auto_close_memory_percent)
        {
            return;
        }

        let Some(newest) = self.active.last().map(|a| a.orchestrator.name().to_string()) else {
            return;
        };
        warn!(
            test = %newest,
            used_percent = used,
            "Memory usage above {}%, auto-closing unit test",
            self.config.auto_close_memory_percent
        );
        self.memory_cooldown = MEMORY_CLOSE_COOLDOWN_TICKS;
        self.memory_at_close = used;
        self.last_memory_limit_hit = Some(now);
        self.abort_inner(&newest, now, self.config.allow_requeue);
    }

    pub fn memory_percent(&self) -> Option<f64> {
        self.memory_percent
    }

    fn record_finished(&mut self, orchestrator: UnitTestOrchestrator, now: Instant) {
        let aborted = orchestrator.was_aborted();
        let report = TestReport::new(
            orchestrator.settings(),
            orchestrator.verification(),
            aborted,
            orchestrator.elapsed(now),
            orchestrator.status_log(),
        );

        if !aborted {
            self.completed.insert(report.name.clone());
            info!(target: "netunit::status", "Unit test '{}' completed:", report.name);
            for line in report.result_lines(false) {
                info!(target: "netunit::status", "{}", line);
            }
        }

        self.reports.push(report);
        self.retired.push(orchestrator);
    }

    /// Aborts an active test and requeues it when allowed.
    pub fn abort(&mut self, name: &str, now: Instant) -> bool {
        self.abort_inner(name, now, self.config.allow_requeue)
    }

    fn abort_inner(&mut self, name: &str, now: Instant, requeue: bool) -> bool {
        let Some(index) = self.active.iter().position(|a| a.orchestrator.name() == name) else {
            warn!("No active unit test named '{}'", name);
            return false;
        };

        let ActiveTest { mut orchestrator, factory, first_run } = self.active.remove(index);
        orchestrator.abort(now);
        if first_run {
            self.aborted_first_run = true;
        }

        let count = self.abort_counts.entry(name.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        self.record_finished(orchestrator, now);

        if !requeue {
            return true;
        }

        let limit = self.config.max_auto_close_count;
        if limit > 0 && count >= limit {
            warn!(test = %name, "Unit test aborted {} times, can't requeue", limit);
        } else {
            info!(test = %name, "Requeueing aborted unit test");
            self.pending.push_back(PendingTest { name: name.to_string(), factory });
        }
        true
    }

    /// Aborts everything without requeueing and drops pending tests.
    pub fn abort_all(&mut self, now: Instant) {
        self.pending.clear();
        let names: Vec<String> = self.active.iter().map(|a| a.orchestrator.name().to_string()).collect();
        for name in names {
            self.abort_inner(&name, now, false);
        }
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }

    /// Whether shut-down processes of finished tests are still exiting.
    pub fn has_retiring_processes(&self) -> bool {
        !self.retired.is_empty()
    }

    pub fn final_summary(&self) -> Option<&FinalSummary> {
        self.summary.as_ref()
    }

    pub fn reports(&self) -> &[TestReport] {
        &self.reports
    }

    pub fn unsupported(&self) -> &[(String, String)] {
        &self.unsupported
    }

    pub fn active_names(&self) -> Vec<&str> {
        self.active.iter().map(|a| a.orchestrator.name()).collect()
    }

    pub fn pending_names(&self) -> Vec<&str> {
        self.pending.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn abort_count(&self, name: &str) -> u32 {
        self.abort_counts.get(name).copied().unwrap_or(0)
    }

    pub fn orchestrator(&self, name: &str) -> Option<&UnitTestOrchestrator> {
        self.active.iter().map(|a| &a.orchestrator).find(|o| o.name() == name)
    }

    fn orchestrator_mut(&mut self, name: &str) -> Option<&mut UnitTestOrchestrator> {
        self.active.iter_mut().map(|a| &mut a.orchestrator).find(|o| o.name() == name)
    }

    pub fn status_lines(&self, now: Instant) -> Vec<String> {
        let mut lines = vec![format!(
            "Unit test status: {} active, {} pending, {} finished",
            self.active.len(),
            self.pending.len(),
            self.reports.len()
        )];
        lines.extend(self.active.iter().map(|a| format!("  - {}", a.orchestrator.status_line(now))));
        lines.extend(self.pending.iter().map(|p| format!("  - {}: pending", p.name)));
        if let Some(used) = self.memory_percent {
            lines.push(format!("  System memory used: {:.0}%", used));
        }
        lines
    }

    pub fn dump_status(&self, now: Instant) {
        for line in self.status_lines(now) {
            info!(target: "netunit::status", "{}", line);
        }
    }

    /// Runs an operator console command and returns its output.
    pub fn exec(&mut self, line: &str, now: Instant) -> ConsoleOutput {
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or_default().to_ascii_lowercase();

        match command.as_str() {
            "" => ConsoleOutput::default(),
            "status" => ConsoleOutput::lines(self.status_lines(now)),
            "list" => {
                let mut lines = Vec::new();
                lines.extend(self.active_names().into_iter().map(|n| format!("{} (active)", n)));
                lines.extend(self.pending_names().into_iter().map(|n| format!("{} (pending)", n)));
                lines.extend(self.reports.iter().map(|r| format!("{} (finished: {})", r.name, r.result)));
                ConsoleOutput::lines(lines)
            }
            "abort" => match words.next() {
                Some(name) if self.abort(name, now) => ConsoleOutput::line(format!("Aborted '{}'", name)),
                Some(name) => ConsoleOutput::line(format!("No active unit test named '{}'", name)),
                None => ConsoleOutput::line("Usage: abort <test>"),
            },
            "abortall" => {
                self.abort_all(now);
                ConsoleOutput::line("Aborted all unit tests")
            }
            "debug" => {
                let (Some(name), Some(action)) = (words.next(), words.next()) else {
                    return ConsoleOutput::line(
                        "Usage: debug <test> requirements|forceready|disconnect|suspend|resume",
                    );
                };
                self.exec_debug(name, &action.to_ascii_lowercase())
            }
            other => ConsoleOutput::line(format!("Unknown command '{}'", other)),
        }
    }

    fn exec_debug(&mut self, name: &str, action: &str) -> ConsoleOutput {
        let Some(orchestrator) = self.orchestrator_mut(name) else {
            return ConsoleOutput::line(format!("No active unit test named '{}'", name));
        };

        match action {
            "requirements" => {
                let requirements = orchestrator.requirements();
                ConsoleOutput::lines(vec![
                    format!("Required: {} {}", requirements.required().to_bit_string(), requirements.required()),
                    format!("Met:      {} {}", requirements.met().to_bit_string(), requirements.met()),
                    format!("Failed:   {} {}", requirements.unmet().to_bit_string(), requirements.unmet()),
                ])
            }
            "forceready" => {
                orchestrator.force_ready();
                ConsoleOutput::line("Forced requirements ready")
            }
            "disconnect" => {
                orchestrator.force_disconnect();
                ConsoleOutput::line("Disconnected minimal client")
            }
            "suspend" => match orchestrator.request_suspend() {
                Ok(()) => ConsoleOutput::line("Suspend requested"),
                Err(e) => ConsoleOutput::line(e.to_string()),
            },
            "resume" => match orchestrator.request_resume() {
                Ok(outcome) => ConsoleOutput::line(format!("Resume: {:?}", outcome)),
                Err(e) => ConsoleOutput::line(e.to_string()),
            },
            other => ConsoleOutput::line(format!("Unknown debug command '{}'", other)),
        }
    }
}

/// Lines produced by a console command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleOutput(pub Vec<String>);

impl ConsoleOutput {
    fn line(line: impl Into<String>) -> Self {
        Self(vec![line.into()])
    }

    fn lines(lines: Vec<String>) -> Self {
        Self(lines)
    }
}

impl fmt::Display for ConsoleOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("\n"))
    }
}

impl fmt::Debug for UnitTestManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitTestManager")
            .field("pending", &self.pending.len())
            .field("active", &self.active.len())
            .field("reports", &self.reports.len())
            .finish()
    }
}
