pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod pipeline;
pub mod report;
pub mod util;

pub use error::{ConfigError, Error, Result};
