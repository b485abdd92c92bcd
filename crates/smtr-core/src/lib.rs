//! `smtr-core`: configuration, run environment and platform clock shared by
//! every pipeline crate.

pub mod config;
pub mod env;
pub mod error;
pub mod time;

pub use config::PipelinesConfig;
pub use env::{resolve_run_env, RunEnv};
pub use error::{CoreError, Result};
pub use time::{format_timestamp, parse_timestamp, TIMEZONE, TIMESTAMP_FORMAT};
