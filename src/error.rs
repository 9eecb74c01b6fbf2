//! Custom error types for Vastra
//!
//! Most failures are recovered locally (see the executor and plan builder);
//! these types exist for the boundaries where an error must be reported
//! rather than absorbed.

use thiserror::Error;

/// Main error type for Vastra operations
#[derive(Error, Debug)]
pub enum VastraError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// HTTP transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Rulepack loading errors
    #[error("Rulepack error: {0}")]
    Rulepack(#[from] RulepackError),

    /// Attack plan construction errors
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    /// Task execution errors
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    /// In-browser check errors
    #[error("Browser check error: {0}")]
    Browser(#[from] BrowserError),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value: {field} - {reason}")]
    ValidationError { field: String, reason: String },
}

/// HTTP transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),
}

/// Rulepack loading errors
#[derive(Error, Debug)]
pub enum RulepackError {
    #[error("Failed to parse rulepack: {0}")]
    ParseError(String),

    #[error("Rulepack file not found: {0}")]
    NotFound(String),

    #[error("CVE variant load failed: {0}")]
    CveLoadFailed(String),
}

/// Attack plan construction errors
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Failed to parse raw request: {0}")]
    ParseError(String),

    #[error("Baseline request failed for {url}: {reason}")]
    BaselineFailed { url: String, reason: String },
}

/// Task execution errors
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Expression evaluation failed: {0}")]
    ExpressionError(String),

    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    #[error("Operator '{op}' expects {expected} arguments, got {got}")]
    BadArity {
        op: String,
        expected: usize,
        got: usize,
    },
}

/// In-browser check errors
#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("Browser check timed out after {0}ms")]
    Timeout(u64),
}
