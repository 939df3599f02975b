//! Security policy model for shellward.
//!
//! This crate defines the declarative policy that governs command
//! execution:
//!
//! - Allow and deny rules with optional subcommand constraints
//! - Working-directory confinement prefixes
//! - Execution timeout and output-size bounds
//! - The restricted environment handed to child processes
//!
//! Policies are decoded from JSON. Rule lists accept bare command
//! names and full objects interchangeably, and [`Policy::decide`] is
//! the single evaluation point shared by static validation and
//! runtime enforcement.

pub mod error;
pub mod policy;
pub mod rules;

pub use error::{ConfigError, Result};
pub use policy::{
    DEFAULT_ERROR_MESSAGE, DEFAULT_EXECUTION_TIMEOUT, DEFAULT_MAX_OUTPUT_SIZE, Policy, Verdict,
};
pub use rules::{AllowRule, DenyRule};
