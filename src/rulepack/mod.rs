//! Attack module definitions and rulepack loading
//!
//! A rulepack is pure data: a list of module definitions, each bundling
//! related attack recipes with shared category/severity metadata. Module
//! config is kept on an explicit immutable `ModuleDefinition` and borrowed
//! through a `ModuleRuntime` wrapper; nothing is ever mixed onto live
//! engine objects.

pub mod expr;

use std::io::Read;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::browser::SpaCheck;
use crate::error::RulepackError;
use crate::findings::Severity;
use expr::Expr;

/// Module kind: sends attack traffic, or validates captured responses only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    #[default]
    Active,
    Passive,
}

/// Where a mutation is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationLocation {
    Query,
    Body,
    Header,
    Cookie,
    Url,
}

impl MutationLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationLocation::Query => "query",
            MutationLocation::Body => "body",
            MutationLocation::Header => "header",
            MutationLocation::Cookie => "cookie",
            MutationLocation::Url => "url",
        }
    }
}

/// Mutation primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOp {
    /// Set a fixed value
    Replace,
    /// Concatenate prefix/suffix around the existing value
    Add,
    /// Clear or delete the target
    Remove,
    /// Regex substitution on the existing value
    Regex,
}

fn default_locations() -> Vec<MutationLocation> {
    vec![
        MutationLocation::Query,
        MutationLocation::Body,
        MutationLocation::Header,
        MutationLocation::Cookie,
    ]
}

/// Mutation instructions for one attack.
///
/// `value`, `prefix`, and `replacement` may contain the `%%random%%`
/// placeholder, substituted once per attack instantiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    /// Mutation primitive
    pub op: MutationOp,

    /// Replacement value (replace) or suffix (add)
    #[serde(default)]
    pub value: Option<String>,

    /// Prefix for add mutations
    #[serde(default)]
    pub prefix: Option<String>,

    /// Regex pattern for regex mutations and remove-by-value
    #[serde(default)]
    pub pattern: Option<String>,

    /// Replacement template for regex mutations
    #[serde(default)]
    pub replacement: Option<String>,

    /// Explicit target name (param/header/cookie name or JSON leaf path);
    /// when absent, every eligible target at the listed locations is used
    #[serde(default)]
    pub name: Option<String>,

    /// Locations the mutation applies to
    #[serde(default = "default_locations")]
    pub locations: Vec<MutationLocation>,
}

/// Validation rule judging an attack response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSpec {
    /// Success expression over `{original, attack, module}`
    pub rule: Expr,

    /// Optional proof-extraction expression
    #[serde(default)]
    pub proof: Option<Expr>,

    /// Rule-level severity override
    #[serde(default)]
    pub severity: Option<Severity>,

    /// Rule-level confidence override
    #[serde(default)]
    pub confidence: Option<u8>,
}

/// Follow-up-request confirmation for attacks that cannot be validated from
/// the immediate response (e.g. file-upload probes)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingSpec {
    /// Candidate URLs to probe; at most 3 are tried
    pub urls: Vec<String>,

    /// Marker string searched in the body or Location header
    pub marker: String,

    /// Action token matched by out-of-band confirmations
    #[serde(default)]
    pub token: Option<String>,
}

/// In-browser check descriptors for SPA attacks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaSpec {
    /// Payloads injected into hash-fragment parameters
    pub payloads: Vec<String>,

    /// Checks to run in the browser context
    pub checks: Vec<SpaCheck>,
}

/// One concrete mutation+validation recipe within a module
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttackDefinition {
    /// Attack identifier, unique within the module
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Pre-check expression evaluated against the original response
    #[serde(default)]
    pub condition: Option<Expr>,

    /// Mutation instructions
    #[serde(default)]
    pub action: Option<ActionSpec>,

    /// Validation rule
    #[serde(default)]
    pub validation: Option<ValidationSpec>,

    /// Follow-up confirmation
    #[serde(default)]
    pub tracking: Option<TrackingSpec>,

    /// In-browser check descriptors
    #[serde(default)]
    pub spa: Option<SpaSpec>,

    /// Attack-level severity override
    #[serde(default)]
    pub severity: Option<Severity>,

    /// Attack-level confidence override
    #[serde(default)]
    pub confidence: Option<u8>,
}

fn default_true() -> bool {
    true
}

/// Module metadata shared by its attacks
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModuleMetadata {
    /// Module-level severity
    #[serde(default)]
    pub severity: Option<Severity>,

    /// Vulnerability category
    #[serde(default)]
    pub category: String,

    /// OWASP category tag
    #[serde(default)]
    pub owasp: Option<String>,

    /// CWE identifier
    #[serde(default)]
    pub cwe: Option<u32>,

    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// When false, at most one success per module+attack key is recorded
    #[serde(default = "default_true")]
    pub unique: bool,

    /// Whether the module supports atomic (per-target) mutation
    #[serde(default)]
    pub supports_atomic: Option<bool>,

    /// Module-level confidence override
    #[serde(default)]
    pub confidence: Option<u8>,
}

/// A named bundle of related attack definitions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDefinition {
    /// Module identifier
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Active or passive
    #[serde(default)]
    pub kind: ModuleKind,

    /// Whether concurrent instances are allowed
    #[serde(rename = "async", default = "default_true")]
    pub is_async: bool,

    /// Shared metadata
    #[serde(default)]
    pub metadata: ModuleMetadata,

    /// Attack recipes
    #[serde(default)]
    pub attacks: Vec<AttackDefinition>,
}

/// Runtime wrapper borrowing an immutable module definition
#[derive(Debug, Clone)]
pub struct ModuleRuntime {
    definition: Arc<ModuleDefinition>,
}

impl ModuleRuntime {
    pub fn new(definition: ModuleDefinition) -> Self {
        Self {
            definition: Arc::new(definition),
        }
    }

    pub fn definition(&self) -> &ModuleDefinition {
        &self.definition
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn is_passive(&self) -> bool {
        self.definition.kind == ModuleKind::Passive
    }

    /// Module metadata snapshot for expression contexts
    pub fn context_value(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.definition.id,
            "name": self.definition.name,
            "category": self.definition.metadata.category,
        })
    }
}

/// Parse a rulepack from a JSON reader
pub fn load_modules<R: Read>(reader: R) -> Result<Vec<ModuleDefinition>, RulepackError> {
    serde_json::from_reader(reader).map_err(|e| RulepackError::ParseError(e.to_string()))
}

/// Merge CVE-variant modules into a base set, keyed by module id.
/// CVE entries override base entries on id collision.
pub fn merge_cve(
    base: Vec<ModuleDefinition>,
    cve: Vec<ModuleDefinition>,
) -> Vec<ModuleDefinition> {
    let mut merged = base;
    for module in cve {
        if let Some(existing) = merged.iter_mut().find(|m| m.id == module.id) {
            *existing = module;
        } else {
            merged.push(module);
        }
    }
    merged
}

/// Load base modules, optionally merging a CVE variant. A failed CVE load
/// degrades to base-only operation rather than failing the engine.
pub fn load_with_cve<R: Read>(
    base: R,
    cve: Option<Result<Vec<ModuleDefinition>, RulepackError>>,
) -> Result<Vec<ModuleDefinition>, RulepackError> {
    let base_modules = load_modules(base)?;
    match cve {
        Some(Ok(cve_modules)) => Ok(merge_cve(base_modules, cve_modules)),
        Some(Err(e)) => {
            tracing::warn!(error = %e, "CVE module load failed, using base modules only");
            Ok(base_modules)
        }
        None => Ok(base_modules),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"[{
            "id": "sqli",
            "name": "SQL Injection",
            "kind": "active",
            "metadata": {"severity": "high", "category": "injection", "cwe": 89},
            "attacks": [{
                "id": "error-based",
                "action": {"op": "add", "value": "'"},
                "validation": {
                    "rule": {"op": "regex", "args": ["SQL syntax", {"var": "attack.response.body"}]}
                }
            }]
        }]"#
    }

    #[test]
    fn test_load_modules() {
        let modules = load_modules(sample_json().as_bytes()).unwrap();
        assert_eq!(modules.len(), 1);
        let module = &modules[0];
        assert_eq!(module.id, "sqli");
        assert!(module.is_async);
        assert!(module.metadata.unique);
        assert_eq!(module.attacks.len(), 1);
        assert_eq!(module.attacks[0].action.as_ref().unwrap().op, MutationOp::Add);
    }

    #[test]
    fn test_merge_cve_overrides_on_collision() {
        let base = load_modules(sample_json().as_bytes()).unwrap();
        let cve = vec![
            ModuleDefinition {
                id: "sqli".into(),
                name: "SQLi (CVE variant)".into(),
                kind: ModuleKind::Active,
                is_async: true,
                metadata: ModuleMetadata::default(),
                attacks: Vec::new(),
            },
            ModuleDefinition {
                id: "cve-2024-0001".into(),
                name: "CVE probe".into(),
                kind: ModuleKind::Active,
                is_async: true,
                metadata: ModuleMetadata::default(),
                attacks: Vec::new(),
            },
        ];
        let merged = merge_cve(base, cve);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].name, "SQLi (CVE variant)");
        assert_eq!(merged[1].id, "cve-2024-0001");
    }

    #[test]
    fn test_cve_load_failure_degrades() {
        let modules = load_with_cve(
            sample_json().as_bytes(),
            Some(Err(RulepackError::CveLoadFailed("fetch failed".into()))),
        )
        .unwrap();
        assert_eq!(modules.len(), 1);
    }

    #[test]
    fn test_bad_rulepack_is_parse_error() {
        let result = load_modules(&b"not json"[..]);
        assert!(matches!(result, Err(RulepackError::ParseError(_))));
    }
}
