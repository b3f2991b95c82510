//! Payloads for unit tests declared in the configuration file.

use crate::codec::ControlCommand;
use crate::manager::UnitTestFactory;
use crate::orchestrator::{TestContext, UnitTest};
use crate::process_supervisor::{LogCategory, ProcessExit};
use crate::requirements::Requirement;
use crate::settings::{UnitTestSettings, VerificationState};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

/// What a declared test does once its requirements are met.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadSpec {
    /// Harness self-test: the Ping/Pong round-trip is the whole test
    Ping,
    /// Runs a console command on the agent and checks its output
    Command {
        command: String,
        /// Text the output must contain
        #[serde(default)]
        expect: Option<String>,
    },
    /// Watches an event and waits for the agent to report it
    Event { event: String },
    /// Summons an object, optionally waiting for a log line as evidence
    Summon {
        class: String,
        #[serde(default)]
        args: String,
        #[serde(default)]
        log_pattern: Option<String>,
    },
    /// Sends a remote call and checks it was transmitted
    Rpc {
        function: String,
        #[serde(default)]
        params: String,
    },
    /// Verdict from process output alone
    LogMatch {
        #[serde(default)]
        fixed: Vec<String>,
        #[serde(default)]
        unfixed: Vec<String>,
    },
}

/// One `[[test]]` entry of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TestDeclaration {
    #[serde(flatten)]
    pub settings: UnitTestSettings,
    pub payload: PayloadSpec,
}

impl TestDeclaration {
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn into_factory(self) -> UnitTestFactory {
        Arc::new(move || Box::new(BuiltinTest::new(self.clone())) as Box<dyn UnitTest>)
    }
}

/// A unit test running one of the built-in payloads.
pub struct BuiltinTest {
    settings: UnitTestSettings,
    payload: PayloadSpec,
}

impl BuiltinTest {
    pub fn new(declaration: TestDeclaration) -> Self {
        let TestDeclaration { mut settings, payload } = declaration;
        if payload == PayloadSpec::Ping {
            settings.requirements.insert(Requirement::Ping);
        }
        Self { settings, payload }
    }

    pub fn payload(&self) -> &PayloadSpec {
        &self.payload
    }
}

impl UnitTest for BuiltinTest {
    fn settings(&self) -> &UnitTestSettings {
        &self.settings
    }

    fn execute_payload(&mut self, ctx: &mut TestContext<'_>) {
        match &self.payload {
            PayloadSpec::Ping => {
                ctx.verify(VerificationState::VerifiedFixed, "ping round-trip completed");
            }
            PayloadSpec::Command { command, .. } => {
                ctx.send_control(ControlCommand::SendResultCommand, command);
            }
            PayloadSpec::Event { event } => {
                if ctx.send_control(ControlCommand::WatchEvent, event) {
                    ctx.log_status(&format!("Watching event '{}'", event));
                }
            }
            PayloadSpec::Summon { class, args, .. } => {
                let payload = if args.is_empty() { class.clone() } else { format!("{} {}", class, args) };
                ctx.send_control(ControlCommand::Summon, &payload);
            }
            PayloadSpec::Rpc { function, params } => {
                ctx.send_rpc(function, params);
            }
            PayloadSpec::LogMatch { .. } => {
                debug!(test = %ctx.name(), "Waiting for log evidence");
            }
        }
    }

    fn log_patterns(&self) -> Vec<String> {
        match &self.payload {
            PayloadSpec::Summon { log_pattern: Some(pattern), .. } => vec![pattern.clone()],
            PayloadSpec::LogMatch { fixed, unfixed } => fixed.iter().chain(unfixed).cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn on_command_result(&mut self, ctx: &mut TestContext<'_>, success: bool, output: &str) {
        if !success {
            ctx.verify(VerificationState::VerifiedNeedsUpdate, &format!("command failed: {}", output));
            return;
        }

        match &self.payload {
            PayloadSpec::Command { expect, .. } => match expect {
                Some(expected) if !output.contains(expected.as_str()) => {
                    ctx.verify(
                        VerificationState::VerifiedUnfixed,
                        &format!("output '{}' lacks '{}'", output, expected),
                    );
                }
                _ => {
                    ctx.verify(VerificationState::VerifiedFixed, &format!("command output '{}'", output));
                }
            },
            PayloadSpec::Summon { log_pattern: None, .. } => {
                ctx.verify(VerificationState::VerifiedFixed, output);
            }
            PayloadSpec::Summon { log_pattern: Some(pattern), .. } => {
                ctx.log_status(&format!("{}; waiting for '{}'", output, pattern));
            }
            _ => {}
        }
    }

    fn on_event(&mut self, ctx: &mut TestContext<'_>, event: &str) {
        if let PayloadSpec::Event { event: watched } = &self.payload {
            if watched == event {
                ctx.verify(VerificationState::VerifiedFixed, &format!("event '{}' notified", event));
            }
        }
    }

    fn on_log_match(&mut self, ctx: &mut TestContext<'_>, category: LogCategory, pattern: &str, line: &str) {
        let verdict = match &self.payload {
            PayloadSpec::Summon { log_pattern: Some(expected), .. } if expected == pattern => {
                VerificationState::VerifiedFixed
            }
            PayloadSpec::LogMatch { fixed, .. } if fixed.iter().any(|p| p == pattern) => {
                VerificationState::VerifiedFixed
            }
            PayloadSpec::LogMatch { unfixed, .. } if unfixed.iter().any(|p| p == pattern) => {
                VerificationState::VerifiedUnfixed
            }
            _ => return,
        };
        ctx.verify(verdict, &format!("{} log: {}", category, line));
    }

    fn on_rpc_observed(&mut self, ctx: &mut TestContext<'_>, name: &str, success: bool) {
        if let PayloadSpec::Rpc { function, .. } = &self.payload {
            if function == name && success {
                ctx.verify(VerificationState::VerifiedFixed, &format!("RPC {} transmitted", name));
            }
        }
    }

    fn on_process_exit(&mut self, ctx: &mut TestContext<'_>, category: LogCategory, exit: &ProcessExit) {
        if matches!(self.payload, PayloadSpec::LogMatch { .. }) && ctx.verification() == VerificationState::Unverified {
            ctx.log_status(&format!("{} exited ({:?}) before log evidence", category, exit.exit_code));
        }
    }
}
