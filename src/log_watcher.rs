use crate::process_supervisor::{ProcessEvent, ProcessHandle};
use crate::Result;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Maximum lines buffered per process between two scans
const MAX_PENDING_LINES: usize = 4096;

/// Named pattern sets supplied by the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PatternGroup {
    /// Server is still starting; extends the timeout only
    ServerStartProgress,
    /// Server is ready for the minimal client
    ServerReady,
    ServerTimeoutReset,
    ClientTimeoutReset,
    /// External service reached its ready state
    ServiceReady,
    /// Patterns a test watches for itself
    Custom,
}

impl fmt::Display for PatternGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A pattern found in a process's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchEvent {
    pub handle: ProcessHandle,
    pub group: PatternGroup,
    pub pattern: String,
    pub line: String,
}

#[derive(Debug)]
struct Watch {
    group: PatternGroup,
    patterns: Vec<String>,
}

/// Matches buffered process output against pattern groups.
///
/// Lines are pushed as they are drained from the process and only matched
/// when [`scan`](Self::scan) runs from the tick loop. Per pass, each
/// (process, group) pair yields at most one match: the earliest matching
/// line, with the first pattern in declaration order that it contains.
#[derive(Debug, Default)]
pub struct LogStreamWatcher {
    watches: BTreeMap<ProcessHandle, Vec<Watch>>,
    pending: BTreeMap<ProcessHandle, VecDeque<String>>,
}

impl LogStreamWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts matching `patterns` for a process, replacing an earlier watch of
    /// the same group. An empty pattern list watches nothing.
    pub fn watch(&mut self, handle: ProcessHandle, group: PatternGroup, patterns: &[String]) {
        let patterns: Vec<String> = patterns.iter().filter(|p| !p.is_empty()).cloned().collect();
        let watches = self.watches.entry(handle).or_default();
        watches.retain(|w| w.group != group);

        if patterns.is_empty() {
            return;
        }

        debug!("Watching {} for {} ({} patterns)", handle, group, patterns.len());
        watches.push(Watch { group, patterns });
    }

    pub fn unwatch_group(&mut self, handle: ProcessHandle, group: PatternGroup) {
        if let Some(watches) = self.watches.get_mut(&handle) {
            watches.retain(|w| w.group != group);
        }
    }

    /// Stops watching a process and drops its unscanned lines.
    pub fn unwatch(&mut self, handle: ProcessHandle) {
        self.watches.remove(&handle);
        self.pending.remove(&handle);
    }

    pub fn is_watching(&self, handle: ProcessHandle, group: PatternGroup) -> bool {
        self.watches
            .get(&handle)
            .is_some_and(|watches| watches.iter().any(|w| w.group == group))
    }

    /// Buffers a line of output. Lines of unwatched processes are dropped.
    pub fn push_line(&mut self, handle: ProcessHandle, line: &str) {
        if !self.watches.get(&handle).is_some_and(|w| !w.is_empty()) {
            return;
        }

        let pending = self.pending.entry(handle).or_default();
        if pending.len() == MAX_PENDING_LINES {
            pending.pop_front();
        }
        pending.push_back(line.to_string());
    }

    /// Matches all lines buffered since the previous pass.
    pub fn scan(&mut self) -> Vec<MatchEvent> {
        let mut events = Vec::new();

        for (handle, lines) in self.pending.iter_mut() {
            let Some(watches) = self.watches.get(handle) else {
                lines.clear();
                continue;
            };

            for watch in watches {
                let found = lines.iter().find_map(|line| {
                    watch
                        .patterns
                        .iter()
                        .find(|pattern| line.contains(pattern.as_str()))
                        .map(|pattern| (pattern, line))
                });

                if let Some((pattern, line)) = found {
                    events.push(MatchEvent {
                        handle: *handle,
                        group: watch.group,
                        pattern: pattern.clone(),
                        line: line.clone(),
                    });
                }
            }

            lines.clear();
        }

        events
    }
}

/// Tails a log file written by a launched process.
///
/// A `notify` watcher on the parent directory feeds a task that reads the
/// bytes appended since the last read and forwards complete lines as
/// [`ProcessEvent::Line`] for the owning process.
pub struct LogFileTailer {
    watcher: Option<RecommendedWatcher>,
    task: JoinHandle<()>,
}

impl LogFileTailer {
    /// Starts tailing `path` on behalf of `handle`
    ///
    /// # Arguments
    /// * `handle` - The process the lines are attributed to
    /// * `path` - Log file to tail; it does not need to exist yet
    /// * `sink` - Queue the lines are delivered to
    ///
    /// # Returns
    /// * `Result<Self>` - The running tailer or an error
    pub fn start(
        handle: ProcessHandle,
        path: PathBuf,
        sink: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel(100);

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                if let Err(e) = tx.blocking_send(res) {
                    error!("Failed to send log file event: {}", e);
                }
            },
            notify::Config::default(),
        )?;

        let watch_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
        info!("Tailing log file {:?} for process {}", path, handle);

        let task = tokio::spawn(async move {
            let mut reader = TailReader::new(path.clone());

            // Content written before the watcher started
            reader.forward(handle, &sink).await;

            while let Some(res) = rx.recv().await {
                match res {
                    Ok(event) => {
                        if Self::is_relevant_change(&event, &path) {
                            reader.forward(handle, &sink).await;
                        }
                    }
                    Err(e) => warn!("Log file watching error: {}", e),
                }

                if sink.is_closed() {
                    break;
                }
            }
        });

        Ok(Self { watcher: Some(watcher), task })
    }

    fn is_relevant_change(event: &notify::Event, path: &Path) -> bool {
        (event.kind.is_modify() || event.kind.is_create())
            && event.paths.iter().any(|p| p.file_name() == path.file_name())
    }
}

impl Drop for LogFileTailer {
    fn drop(&mut self) {
        self.watcher.take();
        self.task.abort();
    }
}

struct TailReader {
    path: PathBuf,
    offset: u64,
    partial: String,
}

impl TailReader {
    fn new(path: PathBuf) -> Self {
        Self { path, offset: 0, partial: String::new() }
    }

    async fn forward(&mut self, handle: ProcessHandle, sink: &mpsc::UnboundedSender<ProcessEvent>) {
        match self.read_new_lines().await {
            Ok(lines) => {
                for line in lines {
                    let _ = sink.send(ProcessEvent::Line { handle, line });
                }
            }
            Err(e) => debug!("Log file {:?} not readable yet: {}", self.path, e),
        }
    }

    async fn read_new_lines(&mut self) -> std::io::Result<Vec<String>> {
        let mut file = File::open(&self.path).await?;
        let len = file.metadata().await?.len();

        if len < self.offset {
            // Truncated or recreated
            self.offset = 0;
            self.partial.clear();
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;
        self.offset += bytes.len() as u64;

        self.partial.push_str(&String::from_utf8_lossy(&bytes));

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
        }
        Ok(lines)
    }
}
