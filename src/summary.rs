//! Per-test status logs and the result reports printed when tests finish.

use crate::settings::{UnitTestSettings, VerificationState};
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// Lists with an entry longer than this print one entry per line
const SHORT_LIST_ENTRY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Important,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub level: StatusLevel,
    pub message: String,
}

/// Status history of one unit test, replayed in the final summary.
///
/// Every entry is also emitted through `tracing` under the
/// `netunit::status` target, which the binary routes to the session status log.
#[derive(Debug, Clone, Default)]
pub struct StatusLog {
    entries: Vec<StatusEntry>,
}

impl StatusLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&mut self, test: &str, message: &str) {
        info!(target: "netunit::status", test, "{}", message);
        self.push(StatusLevel::Info, message);
    }

    pub fn important(&mut self, test: &str, message: &str) {
        info!(target: "netunit::status", test, important = true, "{}", message);
        self.push(StatusLevel::Important, message);
    }

    pub fn error(&mut self, test: &str, message: &str) {
        error!(target: "netunit::status", test, "{}", message);
        self.push(StatusLevel::Error, message);
    }

    fn push(&mut self, level: StatusLevel, message: &str) {
        self.entries.push(StatusEntry { level, message: message.to_string() });
    }

    pub fn entries(&self) -> &[StatusEntry] {
        &self.entries
    }

    /// Entries worth repeating in the final summary.
    pub fn summary(&self) -> impl Iterator<Item = &StatusEntry> {
        self.entries.iter().filter(|e| e.level != StatusLevel::Info)
    }
}

/// Result of one finished (or aborted) run of a unit test.
#[derive(Debug, Clone)]
pub struct TestReport {
    pub name: String,
    pub expected: VerificationState,
    pub result: VerificationState,
    pub unreliable: bool,
    pub aborted: bool,
    pub execution_time: Duration,
    pub bug_tracking: Vec<String>,
    pub changelists: Vec<String>,
    pub log_summary: Vec<StatusEntry>,
}

impl TestReport {
    pub fn new(
        settings: &UnitTestSettings,
        result: VerificationState,
        aborted: bool,
        execution_time: Duration,
        status: &StatusLog,
    ) -> Self {
        Self {
            name: settings.name.clone(),
            expected: settings.expected_result,
            result,
            unreliable: settings.unreliable,
            aborted,
            execution_time,
            bug_tracking: settings.bug_tracking.clone(),
            changelists: settings.changelists.clone(),
            log_summary: status.summary().cloned().collect(),
        }
    }

    /// Whether the run produced its expected result.
    pub fn matches_expectation(&self) -> bool {
        !self.aborted && self.expected.is_terminal() && self.result == self.expected
    }

    /// Result lines for this run. `unfinished` marks a test that never
    /// completed after being aborted.
    pub fn result_lines(&self, unfinished: bool) -> Vec<String> {
        let mut lines = Vec::new();

        let result = if unfinished { "Aborted/Unfinished".to_string() } else { self.result.to_string() };
        lines.push(format!("  - Result: {}", result));
        lines.push(format!("  - Execution Time: {:.3}", self.execution_time.as_secs_f64()));

        if !self.bug_tracking.is_empty() {
            push_short_list(&mut lines, "Bug tracking", &self.bug_tracking);
        }
        if !self.changelists.is_empty() {
            push_short_list(&mut lines, "Changelists", &self.changelists);
        }

        if unfinished {
            lines.push("  - WARNING: Unit test was aborted and could not be successfully run.".to_string());
        } else {
            lines.extend(verdict_lines(self.expected, self.result, self.unreliable).into_iter().map(String::from));
        }

        lines
    }
}

fn push_short_list(lines: &mut Vec<String>, description: &str, entries: &[String]) {
    if entries.iter().any(|e| e.len() > SHORT_LIST_ENTRY_LEN) {
        lines.push(format!("  - {}:", description));
        lines.extend(entries.iter().map(|e| format!("    - {}", e)));
    } else {
        lines.push(format!("  - {}: {}", description, entries.join(", ")));
    }
}

/// Expected-versus-actual commentary for a completed test.
pub fn verdict_lines(expected: VerificationState, result: VerificationState, unreliable: bool) -> Vec<&'static str> {
    use VerificationState::*;

    if expected == Unverified {
        return vec!["  - Unit test does not have 'ExpectedResult' set"];
    }
    if result == VerifiedFixed && expected == VerifiedFixed {
        return vec!["  - Unit test issue has been fixed."];
    }

    let mut lines = Vec::new();
    if expected != result {
        if result == VerifiedNeedsUpdate {
            lines.push("  - WARNING: Unit test returned 'needs update' as its result.");
        } else {
            lines.push("  - Unit test did not return expected result - unit test needs an update.");
        }
        if unreliable || result == VerifiedUnreliable {
            lines.push("  - NOTE: Unit test marked 'unreliable' - may need multiple runs to get expected result.");
        }
    } else if result == VerifiedUnreliable {
        lines.push("  - NOTE: Unit test expected to be unreliable - multiple runs may not change result/outcome.");
    }

    if result != VerifiedFixed {
        if expected == VerifiedFixed {
            lines.push("  - Unit test issue is no longer fixed.");
        } else {
            lines.push("  - Unit test issue has NOT been fixed.");
        }
    }

    lines
}

/// Summary produced once every queued test has finished.
#[derive(Debug, Clone, Default)]
pub struct FinalSummary {
    /// (test name, reason) for tests that could not run here
    pub unsupported: Vec<(String, String)>,
    /// Every finished run, aborted runs included, in completion order
    pub reports: Vec<TestReport>,
}

impl FinalSummary {
    /// Abort counts per test name, in first-abort order.
    pub fn abort_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for report in self.reports.iter().filter(|r| r.aborted) {
            match counts.iter_mut().find(|(name, _)| *name == report.name) {
                Some((_, count)) => *count += 1,
                None => counts.push((report.name.clone(), 1)),
            }
        }
        counts
    }

    fn completed(&self, name: &str) -> bool {
        self.reports.iter().any(|r| r.name == name && !r.aborted)
    }

    /// Tests that never completed, or completed with an unexpected result.
    pub fn failures(&self) -> Vec<String> {
        let mut failures: Vec<String> = self
            .abort_counts()
            .into_iter()
            .filter(|(name, _)| !self.completed(name))
            .map(|(name, _)| name)
            .collect();

        failures.extend(
            self.reports
                .iter()
                .filter(|r| !r.aborted && !r.matches_expectation())
                .map(|r| r.name.clone()),
        );
        failures
    }

    pub fn has_failures(&self) -> bool {
        !self.failures().is_empty()
    }

    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![
            String::new(),
            format!("{:-^128}", "FINAL UNIT TEST SUMMARY"),
            String::new(),
        ];

        for (name, reason) in &self.unsupported {
            lines.push(format!("{}: {}", name, reason));
        }
        if !self.unsupported.is_empty() {
            lines.push(String::new());
        }

        let aborts = self.abort_counts();
        let mut unfinished = Vec::new();
        for (name, count) in &aborts {
            let mut message = if *count == 1 {
                format!("{}: Aborted.", name)
            } else {
                format!("{}: Aborted ('{}' times).", name, count)
            };

            if !self.completed(name) {
                message.push_str(" Failed to successfully retry unit test after aborting.");
                if let Some(last) = self.reports.iter().rev().find(|r| &r.name == name) {
                    unfinished.push(last);
                }
            }
            lines.push(message);
        }
        if !aborts.is_empty() {
            lines.push(String::new());
        }

        let completed = self.reports.iter().filter(|r| !r.aborted).map(|r| (r, false));
        for (report, is_unfinished) in completed.chain(unfinished.into_iter().map(|r| (r, true))) {
            lines.push(format!("{}:", report.name));
            lines.extend(report.result_lines(is_unfinished));
            lines.push("  - Log summary:".to_string());
            lines.extend(report.log_summary.iter().map(|e| format!("      {}", e.message)));
            lines.push(String::new());
        }

        lines
    }

    /// Writes the summary through the status log target.
    pub fn log(&self) {
        for line in self.lines() {
            info!(target: "netunit::status", "{}", line);
        }
        for name in self.failures() {
            warn!(target: "netunit::status", "Unit test '{}' did not produce its expected result", name);
        }
    }
}

impl fmt::Display for FinalSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.lines() {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}
