pub mod agent;
pub mod builtin;
pub mod cli;
pub mod codec;
pub mod environment;
pub mod error;
pub mod log_watcher;
pub mod manager;
pub mod memory;
pub mod minimal_client;
pub mod orchestrator;
pub mod port_manager;
pub mod process_supervisor;
pub mod registry;
pub mod requirements;
pub mod settings;
pub mod signals;
pub mod suspend;
pub mod summary;
pub mod timeout;

pub type Result<T> = color_eyre::eyre::Result<T>;
