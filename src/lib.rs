#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::unnecessary_literal_bound,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod patcher;
pub mod planner;
pub mod publisher;
pub mod registry;
pub mod scanner;
pub mod schedule;
pub mod selector;
pub mod server;
pub mod status;
pub mod utils;
pub mod vcs;

pub use config::Config;
pub use error::{ErrorClass, RunError};
pub use orchestrator::{Orchestrator, RunOptions, RunSummary};
