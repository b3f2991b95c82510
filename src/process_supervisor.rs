use crate::environment::{ProcessEnv, UnitTestEnvironment};
use crate::error::HarnessError;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Identifies a supervised process. Handles stay valid after the record is
/// gone; lookups then return `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessHandle(u32);

impl ProcessHandle {
    #[cfg(test)]
    pub(crate) fn from_raw(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Base log category of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    Server,
    Client,
    Service,
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendState {
    Active,
    Suspended,
}

/// What to launch and how to tag it.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Human log tag, e.g. `UT_Server`
    pub tag: String,
    pub category: LogCategory,
    /// New launches are deferred while a blocking process is alive
    pub blocking: bool,
    pub env: ProcessEnv,
    pub working_directory: Option<PathBuf>,
    /// Log file the process writes, passed as `-log=`
    pub log_file: Option<PathBuf>,
}

impl LaunchSpec {
    /// Server command line: map URL, `-server`, the computed port and the log file.
    pub fn server(
        environment: &UnitTestEnvironment,
        url: &str,
        params: &str,
        port: u16,
        log_file: Option<&Path>,
    ) -> Self {
        let mut args = split_params(&environment.server_params);
        args.push(url.to_string());
        args.push("-server".to_string());
        args.push(format!("-port={}", port));
        if let Some(path) = log_file {
            args.push(format!("-log={}", path.display()));
        }
        args.extend(split_params(params));

        Self {
            program: environment.server_program.clone(),
            args,
            tag: "UT_Server".to_string(),
            category: LogCategory::Server,
            blocking: false,
            env: environment.process_env.clone(),
            working_directory: None,
            log_file: log_file.map(Path::to_path_buf),
        }
    }

    /// Client command line: server address, `-game` and the log file.
    pub fn client(
        environment: &UnitTestEnvironment,
        server_address: &str,
        params: &str,
        log_file: Option<&Path>,
    ) -> Self {
        let mut args = split_params(&environment.client_params);
        args.push(server_address.to_string());
        args.push("-game".to_string());
        if let Some(path) = log_file {
            args.push(format!("-log={}", path.display()));
        }
        args.extend(split_params(params));

        Self {
            program: environment.client_program.clone(),
            args,
            tag: "UT_Client".to_string(),
            category: LogCategory::Client,
            blocking: false,
            env: environment.process_env.clone(),
            working_directory: None,
            log_file: log_file.map(Path::to_path_buf),
        }
    }

    /// External service launched ahead of the server.
    pub fn service(environment: &UnitTestEnvironment, program: &Path) -> Self {
        Self {
            program: program.to_path_buf(),
            args: split_params(&environment.service_params),
            tag: "UT_Service".to_string(),
            category: LogCategory::Service,
            blocking: environment.service_blocking,
            env: environment.process_env.clone(),
            working_directory: None,
            log_file: None,
        }
    }
}

fn split_params(params: &str) -> Vec<String> {
    params.split_whitespace().map(str::to_string).collect()
}

/// One externally launched process under test.
#[derive(Debug)]
pub struct UnitTestProcess {
    pub handle: ProcessHandle,
    pub pid: u32,
    pub tag: String,
    pub category: LogCategory,
    pub suspend_state: SuspendState,
    pub blocking: bool,
    pub started_at: Instant,
    pub log_file: Option<PathBuf>,
    pub finished: bool,
    pub exit_code: Option<i32>,
}

/// Exit notification, sent once per process.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub handle: ProcessHandle,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// Last lines of output captured before the exit
    pub log_tail: Vec<String>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Line { handle: ProcessHandle, line: String },
    Exited(ProcessExit),
}

/// Count of live blocking processes, shared by every supervisor.
#[derive(Debug, Clone, Default)]
pub struct BlockingTracker(Arc<AtomicUsize>);

impl BlockingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }

    fn enter(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Configuration for process supervision behavior
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time between SIGTERM and SIGKILL on termination
    pub graceful_shutdown_timeout: Duration,
    /// Number of output lines kept for the exit notification
    pub log_tail_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            graceful_shutdown_timeout: Duration::from_secs(5),
            log_tail_lines: 50,
        }
    }
}

/// Spawns, tags and tracks the processes of one unit test.
///
/// Output is drained by a background task per process; the task only
/// enqueues [`ProcessEvent`]s, which the owner collects with
/// [`drain_events`](Self::drain_events) from its tick.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    blocking: BlockingTracker,
    processes: HashMap<ProcessHandle, UnitTestProcess>,
    terminators: HashMap<ProcessHandle, Arc<Notify>>,
    event_tx: mpsc::UnboundedSender<ProcessEvent>,
    event_rx: mpsc::UnboundedReceiver<ProcessEvent>,
    next_id: u32,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, blocking: BlockingTracker) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config,
            blocking,
            processes: HashMap::new(),
            terminators: HashMap::new(),
            event_tx,
            event_rx,
            next_id: 1,
        }
    }

    /// Launches a process. Failure to start is reported synchronously.
    ///
    /// Must be called from within a tokio runtime.
    pub fn launch(&mut self, spec: LaunchSpec) -> Result<ProcessHandle, HarnessError> {
        let launch_failed = |reason: String| HarnessError::LaunchFailed {
            tag: spec.tag.clone(),
            reason,
        };

        info!("Launching {} process: {:?} {:?}", spec.tag, spec.program, spec.args);

        let mut command = Command::new(&spec.program);
        command.args(&spec.args);

        // Own process group, so termination reaches everything the process spawns
        command.process_group(0);
        command.kill_on_drop(true);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        if let Some(ref work_dir) = spec.working_directory {
            command.current_dir(work_dir);
        }
        for (key, value) in spec.env.iter() {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| launch_failed(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| launch_failed("process exited before its id was read".to_string()))?;

        let handle = ProcessHandle(self.next_id);
        self.next_id += 1;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let terminate = Arc::new(Notify::new());

        if spec.blocking {
            self.blocking.enter();
        }

        tokio::spawn(run_process(ProcessTask {
            handle,
            child,
            stdout,
            stderr,
            event_tx: self.event_tx.clone(),
            terminate: terminate.clone(),
            grace: self.config.graceful_shutdown_timeout,
            tail_lines: self.config.log_tail_lines,
            blocking: spec.blocking.then(|| self.blocking.clone()),
        }));

        self.terminators.insert(handle, terminate);
        self.processes.insert(
            handle,
            UnitTestProcess {
                handle,
                pid,
                tag: spec.tag.clone(),
                category: spec.category,
                suspend_state: SuspendState::Active,
                blocking: spec.blocking,
                started_at: Instant::now(),
                log_file: spec.log_file.clone(),
                finished: false,
                exit_code: None,
            },
        );

        info!("{} process {} spawned with PID: {}", spec.tag, handle, pid);
        Ok(handle)
    }

    /// Requests termination. No-op for unknown or already exited processes.
    ///
    /// Sends SIGTERM to the process group; the process task escalates to
    /// SIGKILL after the graceful shutdown timeout.
    pub fn terminate(&mut self, handle: ProcessHandle) -> bool {
        let Some(process) = self.processes.get(&handle) else {
            return false;
        };
        if process.finished {
            return false;
        }

        info!("Terminating {} process {} (PID {})", process.tag, handle, process.pid);
        if let Err(e) = send_signal_to_group(process.pid, Signal::SIGTERM) {
            warn!("Failed to send SIGTERM to {}: {}", process.tag, e);
        }

        if let Some(terminate) = self.terminators.get(&handle) {
            terminate.notify_one();
        }
        true
    }

    /// Terminates every process that is still running.
    pub fn release_all(&mut self) {
        let running: Vec<ProcessHandle> = self
            .processes
            .values()
            .filter(|p| !p.finished)
            .map(|p| p.handle)
            .collect();

        for handle in running {
            self.terminate(handle);
        }
    }

    /// Collects queued output lines and exit notifications.
    pub fn drain_events(&mut self) -> Vec<ProcessEvent> {
        let mut events = Vec::new();

        while let Ok(event) = self.event_rx.try_recv() {
            if let ProcessEvent::Exited(ref exit) = event {
                if let Some(process) = self.processes.get_mut(&exit.handle) {
                    process.finished = true;
                    process.exit_code = exit.exit_code;
                }
                self.terminators.remove(&exit.handle);
            }
            events.push(event);
        }

        events
    }

    /// Sender for lines from other sources (e.g. tailed log files).
    pub fn line_sender(&self) -> mpsc::UnboundedSender<ProcessEvent> {
        self.event_tx.clone()
    }

    /// Whether launches should wait for a blocking process (polled).
    pub fn is_blocking_process_active(&self) -> bool {
        self.blocking.is_active()
    }

    pub fn get(&self, handle: ProcessHandle) -> Option<&UnitTestProcess> {
        self.processes.get(&handle)
    }

    pub fn set_suspend_state(&mut self, handle: ProcessHandle, state: SuspendState) -> bool {
        match self.processes.get_mut(&handle) {
            Some(process) => {
                process.suspend_state = state;
                true
            }
            None => false,
        }
    }

    pub fn processes(&self) -> impl Iterator<Item = &UnitTestProcess> {
        self.processes.values()
    }

    pub fn running_count(&self) -> usize {
        self.processes.values().filter(|p| !p.finished).count()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // Emergency cleanup: no graceful shutdown in Drop
        for process in self.processes.values().filter(|p| !p.finished) {
            match send_signal_to_group(process.pid, Signal::SIGKILL) {
                Ok(()) | Err(nix::Error::ESRCH) => {}
                Err(e) => {
                    eprintln!("Failed to kill {} process group {}: {}", process.tag, process.pid, e);
                }
            }
        }
    }
}

fn send_signal_to_group(pid: u32, signal: Signal) -> nix::Result<()> {
    let pgid = i32::try_from(pid).map_err(|_| nix::Error::EINVAL)?;
    debug!("Sending signal {:?} to process group {}", signal, pgid);
    killpg(Pid::from_raw(pgid), signal)
}

struct ProcessTask {
    handle: ProcessHandle,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    event_tx: mpsc::UnboundedSender<ProcessEvent>,
    terminate: Arc<Notify>,
    grace: Duration,
    tail_lines: usize,
    blocking: Option<BlockingTracker>,
}

struct LineTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LineTail {
    fn push(&mut self, line: &str) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }
}

async fn run_process(task: ProcessTask) {
    let ProcessTask {
        handle,
        mut child,
        stdout,
        stderr,
        event_tx,
        terminate,
        grace,
        tail_lines,
        blocking,
    } = task;

    let pid = child.id();
    let mut out = stdout.map(|s| LineReader::new(handle, s));
    let mut err = stderr.map(|s| LineReader::new(handle, s));
    let mut tail = LineTail { lines: VecDeque::new(), capacity: tail_lines };
    let mut kill_deadline: Option<Instant> = None;

    let emit = |tail: &mut LineTail, line: String| {
        tail.push(&line);
        let _ = event_tx.send(ProcessEvent::Line { handle, line });
    };

    let status: std::io::Result<ExitStatus> = loop {
        tokio::select! {
            line = next_line(&mut out) => match line {
                Some(line) => emit(&mut tail, line),
                None => out = None,
            },
            line = next_line(&mut err) => match line {
                Some(line) => emit(&mut tail, line),
                None => err = None,
            },
            status = child.wait() => break status,
            _ = terminate.notified(), if kill_deadline.is_none() => {
                kill_deadline = Some(Instant::now() + grace);
            }
            _ = sleep_until(kill_deadline.unwrap_or_else(Instant::now)), if kill_deadline.is_some() => {
                warn!("Process {} did not exit within {:?}, forcing kill", handle, grace);
                let group_killed = pid.map(|pid| send_signal_to_group(pid, Signal::SIGKILL).is_ok());
                if group_killed != Some(true) {
                    if let Err(e) = child.start_kill() {
                        error!("Failed to kill process {}: {}", handle, e);
                    }
                }
                kill_deadline = None;
            }
        }
    };

    // Output still buffered in the pipes belongs before the exit notification
    let _ = timeout(Duration::from_millis(250), async {
        while out.is_some() || err.is_some() {
            tokio::select! {
                line = next_line(&mut out) => match line {
                    Some(line) => emit(&mut tail, line),
                    None => out = None,
                },
                line = next_line(&mut err) => match line {
                    Some(line) => emit(&mut tail, line),
                    None => err = None,
                },
            }
        }
    })
    .await;

    let (exit_code, signal) = match status {
        Ok(status) => (status.code(), status.signal()),
        Err(e) => {
            error!("Error waiting for process {}: {}", handle, e);
            (None, None)
        }
    };

    info!("Process {} exited (code {:?}, signal {:?})", handle, exit_code, signal);

    if let Some(blocking) = blocking {
        blocking.leave();
    }

    let _ = event_tx.send(ProcessEvent::Exited(ProcessExit {
        handle,
        exit_code,
        signal,
        log_tail: tail.lines.into_iter().collect(),
    }));
}

/// Splits a process output stream into lines. Bytes that are not UTF-8 are
/// replaced rather than ending the stream, so the pipe stays drained.
struct LineReader<R> {
    handle: ProcessHandle,
    reader: BufReader<R>,
    /// Survives cancelled reads inside `select!`
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(handle: ProcessHandle, inner: R) -> Self {
        Self { handle, reader: BufReader::new(inner), buf: Vec::new() }
    }

    /// `None` at end of stream or on a read error.
    async fn next_line(&mut self) -> Option<String> {
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) if self.buf.is_empty() => None,
            Ok(_) => {
                let mut bytes = std::mem::take(&mut self.buf);
                if bytes.last() == Some(&b'\n') {
                    bytes.pop();
                    if bytes.last() == Some(&b'\r') {
                        bytes.pop();
                    }
                }
                Some(String::from_utf8_lossy(&bytes).into_owned())
            }
            Err(e) => {
                warn!("Reading output of process {} failed: {}", self.handle, e);
                None
            }
        }
    }
}

/// Next line from an optional reader; pends forever once the reader is gone.
async fn next_line<R: AsyncRead + Unpin>(reader: &mut Option<LineReader<R>>) -> Option<String> {
    match reader {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}
