//! Integration tests for the netunit harness.
//!
//! Tests run orchestrators against an in-process agent and against shell
//! scripts standing in for server processes.

pub mod infrastructure;
pub mod scenarios;

pub use infrastructure::{tick_until, AgentHarness, NetunitBinary, RecordingTest};
