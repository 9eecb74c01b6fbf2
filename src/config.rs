//! Scan configuration and strategy policies

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Named scan strategy controlling mutation mode and early-stop behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScanStrategy {
    /// One request per target, stop after first finding, dedup by url+module
    Fast,
    /// Bulk mutations, stop after first finding, dedup by url+module+param
    #[default]
    Smart,
    /// Bulk mutations, no early stop, no dedup
    Comprehensive,
}

/// Scope of the stop-on-first-finding dedup key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupScope {
    UrlModule,
    UrlModuleParam,
    None,
}

impl ScanStrategy {
    /// Whether mutations are applied one target at a time
    pub fn atomic_mutations(&self) -> bool {
        matches!(self, ScanStrategy::Fast)
    }

    /// Whether to short-circuit tasks once a finding exists for their scope
    pub fn stop_on_first_finding(&self) -> bool {
        !matches!(self, ScanStrategy::Comprehensive)
    }

    /// Dedup scope for stop-on-first-finding accounting
    pub fn dedup_scope(&self) -> DedupScope {
        match self {
            ScanStrategy::Fast => DedupScope::UrlModule,
            ScanStrategy::Smart => DedupScope::UrlModuleParam,
            ScanStrategy::Comprehensive => DedupScope::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStrategy::Fast => "FAST",
            ScanStrategy::Smart => "SMART",
            ScanStrategy::Comprehensive => "COMPREHENSIVE",
        }
    }
}

impl std::str::FromStr for ScanStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "FAST" => Ok(ScanStrategy::Fast),
            "SMART" => Ok(ScanStrategy::Smart),
            "COMPREHENSIVE" => Ok(ScanStrategy::Comprehensive),
            other => Err(ConfigError::ValidationError {
                field: "scanStrategy".to_string(),
                reason: format!("unknown strategy '{}'", other),
            }),
        }
    }
}

/// Whether the scan sends attack traffic or only validates captured responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DastScanPolicy {
    #[default]
    Active,
    /// Passive/recon mode: filters modules to passive-only
    Passive,
}

/// Settings for one scan run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScanSettings {
    /// Token bucket refill per rolling 1-second window
    pub max_requests_per_second: u32,

    /// Number of concurrent worker loops
    pub concurrency: usize,

    /// Scan strategy policy
    pub scan_strategy: ScanStrategy,

    /// Whether to merge CVE-variant modules into the rulepack
    pub run_cve: bool,

    /// Active vs passive-only module filtering
    pub dast_scan_policy: DastScanPolicy,

    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            max_requests_per_second: 20,
            concurrency: 4,
            scan_strategy: ScanStrategy::default(),
            run_cve: false,
            dast_scan_policy: DastScanPolicy::default(),
            request_timeout_ms: 30_000,
        }
    }
}

impl ScanSettings {
    /// Validate settings, clamping out-of-range values to sane minimums
    pub fn normalized(mut self) -> Self {
        if self.max_requests_per_second == 0 {
            self.max_requests_per_second = 1;
        }
        if self.concurrency == 0 {
            self.concurrency = 1;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_table() {
        assert!(ScanStrategy::Fast.atomic_mutations());
        assert!(!ScanStrategy::Smart.atomic_mutations());
        assert!(!ScanStrategy::Comprehensive.atomic_mutations());

        assert!(ScanStrategy::Fast.stop_on_first_finding());
        assert!(ScanStrategy::Smart.stop_on_first_finding());
        assert!(!ScanStrategy::Comprehensive.stop_on_first_finding());

        assert_eq!(ScanStrategy::Fast.dedup_scope(), DedupScope::UrlModule);
        assert_eq!(ScanStrategy::Smart.dedup_scope(), DedupScope::UrlModuleParam);
        assert_eq!(ScanStrategy::Comprehensive.dedup_scope(), DedupScope::None);
    }

    #[test]
    fn test_settings_normalized() {
        let settings = ScanSettings {
            max_requests_per_second: 0,
            concurrency: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(settings.max_requests_per_second, 1);
        assert_eq!(settings.concurrency, 1);
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("fast".parse::<ScanStrategy>().unwrap(), ScanStrategy::Fast);
        assert_eq!(
            "COMPREHENSIVE".parse::<ScanStrategy>().unwrap(),
            ScanStrategy::Comprehensive
        );
        assert!("thorough".parse::<ScanStrategy>().is_err());
    }

    #[test]
    fn test_settings_wire_shape() {
        let settings: ScanSettings =
            serde_json::from_str(r#"{"scanStrategy":"FAST","maxRequestsPerSecond":5}"#).unwrap();
        assert_eq!(settings.scan_strategy, ScanStrategy::Fast);
        assert_eq!(settings.max_requests_per_second, 5);
        assert_eq!(settings.concurrency, 4);
    }
}
