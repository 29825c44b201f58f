//! canon-utils: Common utilities shared across canon crates
//!
//! This crate provides:
//! - Unified error types ([`CanonError`], [`Result`])
//! - Logging infrastructure ([`init_logging`], [`LogConfig`])
//! - XDG-compliant path utilities ([`paths`] module)

pub mod error;
pub mod logging;
pub mod paths;

pub use error::{CanonError, Result};
pub use logging::{init_logging, init_logging_with_config, LogConfig, LogOutput};

pub use paths::{
    alarm_file, config_dir, config_file, log_dir, runtime_dir, session_cache_file, socket_path,
    state_dir,
};
