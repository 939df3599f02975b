//! Validation and execution engine for shellward.
//!
//! This crate turns a security policy into an enforced execution
//! surface: scripts are parsed and statically validated, and every
//! process launch passes through one policy gate with an audit trail.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  SafeRunner                                                 │
//! │  - run(argv)            single command                      │
//! │  - run_script(script)   validate, then interpret            │
//! │  - one deadline, one output cap per call                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              ┌───────────────┼───────────────┐
//!              ▼               ▼               ▼
//!       ┌──────────┐    ┌───────────┐    ┌──────────┐
//!       │ Validator│    │  Interp   │    │ AuditLog │
//!       │ (static) │    │ (runtime) │    │          │
//!       └──────────┘    └───────────┘    └──────────┘
//!              │               │
//!              └───────┬───────┘
//!                      ▼
//!             Policy::decide (shellward-policy)
//! ```
//!
//! # Core Components
//!
//! - [`SafeRunner`]: the only way commands and scripts execute
//! - [`CommandValidator`]: walks every reachable command before any run
//! - [`ExecutionResult`]: exit code, capped output, timing
//! - [`AuditLog`]: allowed/denied records plus the block log file

pub mod ast;
pub mod audit;
pub mod error;
pub mod limits;
pub mod runner;
pub mod validate;

mod interp;

// Re-export the execution surface
pub use audit::AuditLog;
pub use error::{EngineError, Result};
pub use runner::{ExecutionResult, SafeRunner};
pub use validate::CommandValidator;

// Re-export output plumbing for callers that stream
pub use limits::{shared_writer, BoundedSink, SharedWriter};
