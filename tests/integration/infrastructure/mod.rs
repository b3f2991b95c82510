pub mod agent_harness;
pub mod binary_harness;

pub use agent_harness::{tick_until, AgentHarness, Record, RecordingTest};
pub use binary_harness::NetunitBinary;
