pub mod cli;
pub mod configuration;
pub mod connection;
pub mod core;
pub mod error;

pub use configuration::Configuration;
pub use crate::core::run::{RunOptions, RunReport, run};
pub use crate::core::scheduler::RunStatus;
pub use error::{DbError, VacmanError};

/// Exit code when `--fail-on-locked` is given and some tables could not be locked.
pub const EXIT_LOCKS_UNAVAILABLE: u8 = 3;
