#![warn(clippy::uninlined_format_args)]

pub mod cli;
pub mod config;
pub mod environment;
pub mod error;
pub mod history;
pub mod launcher;
pub mod logging;
pub mod parallel;
pub mod paths;
pub mod registry;
pub mod resources;
pub mod runner;
pub mod state;
pub mod status_export;
pub mod step;
pub mod substep;
pub mod suite;
pub mod test_case;

pub use cli::{Cli, Commands};
pub use error::{Error, Result};
