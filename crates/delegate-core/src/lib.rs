//! # Delegate Core
//!
//! Shared foundation for the Delegate orchestration daemon: the error
//! taxonomy, path computations under the home directory, YAML config
//! loading, and the domain types persisted by the other crates.

pub mod config;
pub mod error;
pub mod paths;
pub mod types;

pub use error::{DelegateError, Result};
pub use paths::Home;
