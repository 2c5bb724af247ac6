pub mod alert;
pub mod config;
pub mod error;
pub mod git;
pub mod hibernation;
pub mod lock;
pub mod log;
pub mod preflight;
pub mod prompt;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod stage;
pub mod state_machine;
pub mod tracker;
pub mod types;
pub mod worklog;
pub mod workspace;
