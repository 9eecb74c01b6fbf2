//! Vastra - DAST scan engine
//!
//! Mutation-driven dynamic application security testing: captured HTTP
//! requests are replayed with targeted mutations from a rulepack of attack
//! modules, responses are judged by data-driven validation rules, and
//! confirmed hits are aggregated into a unified finding envelope.

pub mod browser;
pub mod config;
pub mod engine;
pub mod error;
pub mod findings;
pub mod http;
pub mod report;
pub mod rulepack;

pub use config::{DastScanPolicy, ScanSettings, ScanStrategy};
pub use engine::{OneTimeScan, ScanEngine};
pub use error::VastraError;
pub use findings::{Finding, Severity};
pub use report::ScanEnvelope;
