//! Configuration module for Sumi-Harvest
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use sumi_harvest::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("harvest.toml")).unwrap();
//! println!("Breaker opens after {} failures", config.breaker.failure_threshold);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    BreakerConfig, Config, DatabaseConfig, FetchConfig, ProgressConfig, RetryConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
