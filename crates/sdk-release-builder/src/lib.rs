pub mod checkpoint;
pub mod config;
pub mod error;
pub mod executor;
pub mod log_sanitize;
pub mod manifest;
pub mod planner;
pub mod profile;
pub mod runner;
pub mod stages;
pub mod store;
pub mod workspace;

pub use error::{Error, Result};
