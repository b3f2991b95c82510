pub mod control_channel_tests;
pub mod failure_model_tests;
pub mod process_lifecycle_tests;
pub mod requirements_tests;
