//! code-sandbox daemon library
//!
//! Core functionality for running untrusted snippets against a project:
//! - Path confinement to the project directory
//! - Per-project isolated Python environments, cached and repaired on demand
//! - Execution with timeouts, output limits and file change tracking
//! - MCP server implementation using rmcp

pub mod backend;
pub mod config;
pub mod confine;
pub mod environment;
pub mod error;
pub mod executor;
pub mod mcp;
pub mod snapshot;

pub use error::{Error, PathViolation, Result};
pub use executor::{ExecutionRequest, ExecutionResult, Executor, Language};
