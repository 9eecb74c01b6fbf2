//! Module mutation engine
//!
//! Expands one request schema plus an attack's mutation instructions into
//! mutated request variants. Atomic mode emits one mutated request per
//! attackable target; bulk mode mutates every eligible target in a single
//! request. Every produced request records before/after values per mutated
//! location and carries a uniqueness marker to defeat response caching.

use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::http::{RequestBody, RequestSchema};
use crate::rulepack::{ActionSpec, MutationLocation, MutationOp};

/// Placeholder substituted once per attack-definition instantiation
const RANDOM_PLACEHOLDER: &str = "%%random%%";

/// Query param appended to every mutated request to defeat caching
const CACHE_MARKER_PARAM: &str = "vstrk";

/// Mutation mode for one build call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationMode {
    /// One mutated request per target
    Atomic,
    /// All eligible targets mutated together
    Bulk,
}

/// Before/after record for one mutated location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRecord {
    /// Location kind ("query", "body", "header", "cookie", "url")
    pub location: String,

    /// Target name (param/header/cookie name or JSON leaf path)
    pub name: String,

    /// Value before mutation
    pub before: String,

    /// Value after mutation; empty for removals
    pub after: String,
}

/// One mutated request variant
#[derive(Debug, Clone)]
pub struct MutatedRequest {
    /// The mutated schema
    pub schema: RequestSchema,

    /// Mutations applied, one per changed location
    pub mutations: Vec<MutationRecord>,
}

/// An enumerable mutation target within a request
#[derive(Debug, Clone)]
struct Target {
    location: MutationLocation,
    name: String,
}

/// The mutation engine. Stateless apart from the compiled deny-list.
pub struct MutationEngine {
    deny: Vec<Regex>,
}

impl MutationEngine {
    pub fn new() -> Self {
        // anti-forgery and tracking tokens are never attacked; mutating
        // them invalidates the session before the payload is evaluated
        let deny = ["^csrf$", "^_csrf$", "^x-.*-token$", "^ptk_.*"]
            .iter()
            .filter_map(|p| Regex::new(&format!("(?i){}", p)).ok())
            .collect();
        Self { deny }
    }

    /// Resolve atomic vs bulk: explicit per-call override, then the module
    /// `supportsAtomic` flag, then default-true.
    pub fn resolve_mode(
        &self,
        call_override: Option<bool>,
        module_supports_atomic: Option<bool>,
        strategy_atomic: bool,
    ) -> MutationMode {
        let atomic = call_override
            .or(module_supports_atomic)
            .unwrap_or(true)
            && strategy_atomic;
        if atomic {
            MutationMode::Atomic
        } else {
            MutationMode::Bulk
        }
    }

    /// Build mutated request variants from a schema and mutation action
    pub fn build_attacks(
        &self,
        schema: &RequestSchema,
        action: &ActionSpec,
        mode: MutationMode,
    ) -> Vec<MutatedRequest> {
        // one random id per attack instantiation, so repeated attacks
        // don't collide on cache keys
        let action = instantiate(action, &random_id());

        // Cookie-header-wide regex fallback: no explicit cookie name and a
        // regex op over the cookie location mutates the whole Cookie header
        // and diffs the result to recover the changed cookie.
        if action.name.is_none()
            && action.op == MutationOp::Regex
            && action.locations == [MutationLocation::Cookie]
        {
            return self
                .mutate_cookie_header(schema, &action)
                .into_iter()
                .collect();
        }

        let targets = self.enumerate_targets(schema, &action);
        if targets.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::new();
        match mode {
            MutationMode::Atomic => {
                for target in &targets {
                    let mut mutated = schema.clone();
                    if let Some(record) = apply_to_target(&mut mutated, target, &action) {
                        append_cache_marker(&mut mutated);
                        out.push(MutatedRequest {
                            schema: mutated,
                            mutations: vec![record],
                        });
                    }
                }
            }
            MutationMode::Bulk => {
                let mut mutated = schema.clone();
                let mut records = Vec::new();
                for target in &targets {
                    if let Some(record) = apply_to_target(&mut mutated, target, &action) {
                        records.push(record);
                    }
                }
                if !records.is_empty() {
                    append_cache_marker(&mut mutated);
                    out.push(MutatedRequest {
                        schema: mutated,
                        mutations: records,
                    });
                }
            }
        }
        out
    }

    /// Enumerate attackable targets, filtered through the deny-list
    fn enumerate_targets(&self, schema: &RequestSchema, action: &ActionSpec) -> Vec<Target> {
        let mut targets = Vec::new();

        for location in &action.locations {
            match location {
                MutationLocation::Query => {
                    for (name, _) in schema.query_pairs() {
                        if self.eligible(action, &name) {
                            targets.push(Target {
                                location: MutationLocation::Query,
                                name,
                            });
                        }
                    }
                }
                MutationLocation::Body => match &schema.body {
                    RequestBody::Form(pairs) => {
                        for (name, _) in pairs {
                            if self.eligible(action, name) {
                                targets.push(Target {
                                    location: MutationLocation::Body,
                                    name: name.clone(),
                                });
                            }
                        }
                    }
                    RequestBody::Json(value) => {
                        if let Some(path) = &action.name {
                            if json_get(value, path).is_some() {
                                targets.push(Target {
                                    location: MutationLocation::Body,
                                    name: path.clone(),
                                });
                            }
                        } else {
                            for (path, _) in json_leaves(value) {
                                if !self.denied(leaf_name(&path)) {
                                    targets.push(Target {
                                        location: MutationLocation::Body,
                                        name: path,
                                    });
                                }
                            }
                        }
                    }
                    RequestBody::Raw(_) | RequestBody::Empty => {}
                },
                MutationLocation::Header => {
                    for (name, _) in &schema.headers {
                        if name.eq_ignore_ascii_case("cookie") {
                            continue;
                        }
                        if self.eligible(action, name) {
                            targets.push(Target {
                                location: MutationLocation::Header,
                                name: name.clone(),
                            });
                        }
                    }
                }
                MutationLocation::Cookie => {
                    for (name, _) in &schema.cookies {
                        if self.eligible(action, name) {
                            targets.push(Target {
                                location: MutationLocation::Cookie,
                                name: name.clone(),
                            });
                        }
                    }
                }
                MutationLocation::Url => {
                    targets.push(Target {
                        location: MutationLocation::Url,
                        name: "url".to_string(),
                    });
                }
            }
        }

        targets
    }

    fn eligible(&self, action: &ActionSpec, name: &str) -> bool {
        if let Some(explicit) = &action.name {
            return explicit == name;
        }
        !self.denied(name)
    }

    fn denied(&self, name: &str) -> bool {
        self.deny.iter().any(|re| re.is_match(name))
    }

    /// Apply a regex mutation across the whole Cookie header and diff the
    /// before/after snapshots to recover which individual cookie changed.
    fn mutate_cookie_header(
        &self,
        schema: &RequestSchema,
        action: &ActionSpec,
    ) -> Option<MutatedRequest> {
        let pattern = action.pattern.as_deref()?;
        let re = Regex::new(pattern).ok()?;
        let before_header = schema.cookie_header();
        let after_header = re
            .replace_all(&before_header, action.replacement.as_deref().unwrap_or(""))
            .to_string();
        if after_header == before_header {
            return None;
        }

        let mut mutated = schema.clone();
        let after_cookies: Vec<(String, String)> = after_header
            .split(';')
            .filter_map(|pair| {
                pair.split_once('=')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            })
            .collect();

        // recover the changed cookie name for reporting
        let record = schema
            .cookies
            .iter()
            .find_map(|(name, before)| {
                let after = after_cookies
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default();
                if &after != before {
                    Some(MutationRecord {
                        location: MutationLocation::Cookie.as_str().to_string(),
                        name: name.clone(),
                        before: before.clone(),
                        after,
                    })
                } else {
                    None
                }
            })
            .unwrap_or(MutationRecord {
                location: MutationLocation::Cookie.as_str().to_string(),
                name: "cookie".to_string(),
                before: before_header,
                after: after_header,
            });

        mutated.cookies = after_cookies;
        append_cache_marker(&mut mutated);
        Some(MutatedRequest {
            schema: mutated,
            mutations: vec![record],
        })
    }
}

impl Default for MutationEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Substitute the `%%random%%` placeholder throughout the action
fn instantiate(action: &ActionSpec, random: &str) -> ActionSpec {
    let sub = |s: &Option<String>| s.as_ref().map(|v| v.replace(RANDOM_PLACEHOLDER, random));
    ActionSpec {
        op: action.op,
        value: sub(&action.value),
        prefix: sub(&action.prefix),
        pattern: action.pattern.clone(),
        replacement: sub(&action.replacement),
        name: action.name.clone(),
        locations: action.locations.clone(),
    }
}

fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

fn append_cache_marker(schema: &mut RequestSchema) {
    schema.append_query_pair(CACHE_MARKER_PARAM, &random_id());
}

/// Compute the mutated value; `None` means delete the target.
/// Returns `Some(before)` unchanged values upstream must drop.
fn mutate_value(action: &ActionSpec, before: &str) -> Option<String> {
    match action.op {
        MutationOp::Replace => Some(action.value.clone().unwrap_or_default()),
        MutationOp::Add => {
            let prefix = action.prefix.as_deref().unwrap_or("");
            let suffix = action.value.as_deref().unwrap_or("");
            Some(format!("{}{}{}", prefix, before, suffix))
        }
        MutationOp::Remove => match &action.pattern {
            // remove-by-value: only delete when the value matches
            Some(pattern) => match Regex::new(pattern) {
                Ok(re) if re.is_match(before) => None,
                _ => Some(before.to_string()),
            },
            None => None,
        },
        MutationOp::Regex => {
            let pattern = action.pattern.as_deref()?;
            let re = Regex::new(pattern).ok()?;
            Some(
                re.replace_all(before, action.replacement.as_deref().unwrap_or(""))
                    .to_string(),
            )
        }
    }
}

/// Apply the action to one target, returning the record when the request
/// actually changed. No-op targets (regex didn't match) yield `None`.
fn apply_to_target(
    schema: &mut RequestSchema,
    target: &Target,
    action: &ActionSpec,
) -> Option<MutationRecord> {
    let location = target.location.as_str().to_string();
    match target.location {
        MutationLocation::Query => {
            let mut pairs = schema.query_pairs();
            let idx = pairs.iter().position(|(k, _)| k == &target.name)?;
            let before = pairs[idx].1.clone();
            let after = match mutate_value(action, &before) {
                Some(v) => {
                    if v == before {
                        return None;
                    }
                    pairs[idx].1 = v.clone();
                    v
                }
                None => {
                    pairs.remove(idx);
                    String::new()
                }
            };
            schema.set_query_pairs(&pairs);
            Some(MutationRecord {
                location,
                name: target.name.clone(),
                before,
                after,
            })
        }
        MutationLocation::Body => match &mut schema.body {
            RequestBody::Form(pairs) => {
                let idx = pairs.iter().position(|(k, _)| k == &target.name)?;
                let before = pairs[idx].1.clone();
                let after = match mutate_value(action, &before) {
                    Some(v) => {
                        if v == before {
                            return None;
                        }
                        pairs[idx].1 = v.clone();
                        v
                    }
                    None => {
                        pairs.remove(idx);
                        String::new()
                    }
                };
                Some(MutationRecord {
                    location,
                    name: target.name.clone(),
                    before,
                    after,
                })
            }
            RequestBody::Json(value) => {
                let leaf = json_get(value, &target.name)?;
                let before = json_leaf_text(&leaf);
                let after = match mutate_value(action, &before) {
                    Some(v) => {
                        if v == before {
                            return None;
                        }
                        json_set(value, &target.name, serde_json::Value::String(v.clone()));
                        v
                    }
                    None => {
                        json_set(value, &target.name, serde_json::Value::Null);
                        String::new()
                    }
                };
                Some(MutationRecord {
                    location,
                    name: target.name.clone(),
                    before,
                    after,
                })
            }
            _ => None,
        },
        MutationLocation::Header => {
            let idx = schema
                .headers
                .iter()
                .position(|(k, _)| k.eq_ignore_ascii_case(&target.name))?;
            let before = schema.headers[idx].1.clone();
            let after = match mutate_value(action, &before) {
                Some(v) => {
                    if v == before {
                        return None;
                    }
                    schema.headers[idx].1 = v.clone();
                    v
                }
                None => {
                    schema.headers.remove(idx);
                    String::new()
                }
            };
            Some(MutationRecord {
                location,
                name: target.name.clone(),
                before,
                after,
            })
        }
        MutationLocation::Cookie => {
            let idx = schema.cookies.iter().position(|(k, _)| k == &target.name)?;
            let before = schema.cookies[idx].1.clone();
            let after = match mutate_value(action, &before) {
                Some(v) => {
                    if v == before {
                        return None;
                    }
                    schema.cookies[idx].1 = v.clone();
                    v
                }
                None => {
                    schema.cookies.remove(idx);
                    String::new()
                }
            };
            Some(MutationRecord {
                location,
                name: target.name.clone(),
                before,
                after,
            })
        }
        MutationLocation::Url => {
            let before = schema.url.clone();
            let after = mutate_value(action, &before)?;
            if after == before {
                return None;
            }
            schema.url = after.clone();
            Some(MutationRecord {
                location,
                name: target.name.clone(),
                before,
                after,
            })
        }
    }
}

/// Enumerate primitive JSON leaves with dot + `[index]` path notation
pub fn json_leaves(value: &serde_json::Value) -> Vec<(String, serde_json::Value)> {
    let mut leaves = Vec::new();
    collect_leaves(value, String::new(), &mut leaves);
    leaves
}

fn collect_leaves(
    value: &serde_json::Value,
    path: String,
    out: &mut Vec<(String, serde_json::Value)>,
) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                collect_leaves(child, child_path, out);
            }
        }
        serde_json::Value::Array(items) => {
            for (idx, child) in items.iter().enumerate() {
                collect_leaves(child, format!("{}[{}]", path, idx), out);
            }
        }
        leaf => {
            if !path.is_empty() {
                out.push((path, leaf.clone()));
            }
        }
    }
}

/// Get a JSON value by dot/`[idx]` path
pub fn json_get(value: &serde_json::Value, path: &str) -> Option<serde_json::Value> {
    let mut current = value;
    for segment in parse_path(path) {
        current = match segment {
            PathSegment::Key(key) => current.get(&key)?,
            PathSegment::Index(idx) => current.get(idx)?,
        };
    }
    Some(current.clone())
}

/// Set a JSON value by dot/`[idx]` path
pub fn json_set(value: &mut serde_json::Value, path: &str, new_value: serde_json::Value) {
    let segments = parse_path(path);
    let mut current = value;
    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        match segment {
            PathSegment::Key(key) => {
                if last {
                    if let Some(map) = current.as_object_mut() {
                        map.insert(key.clone(), new_value);
                    }
                    return;
                }
                match current.get_mut(key) {
                    Some(next) => current = next,
                    None => return,
                }
            }
            PathSegment::Index(idx) => {
                if last {
                    if let Some(items) = current.as_array_mut() {
                        if *idx < items.len() {
                            items[*idx] = new_value;
                        }
                    }
                    return;
                }
                match current.get_mut(idx) {
                    Some(next) => current = next,
                    None => return,
                }
            }
        }
    }
}

enum PathSegment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let mut rest = part;
        while let Some(bracket) = rest.find('[') {
            if bracket > 0 {
                segments.push(PathSegment::Key(rest[..bracket].to_string()));
            }
            let close = match rest[bracket..].find(']') {
                Some(c) => bracket + c,
                None => break,
            };
            if let Ok(idx) = rest[bracket + 1..close].parse::<usize>() {
                segments.push(PathSegment::Index(idx));
            }
            rest = &rest[close + 1..];
        }
        if !rest.is_empty() && !rest.contains('[') {
            segments.push(PathSegment::Key(rest.to_string()));
        }
    }
    segments
}

fn leaf_name(path: &str) -> &str {
    path.rsplit('.')
        .next()
        .map(|last| last.split('[').next().unwrap_or(last))
        .unwrap_or(path)
}

fn json_leaf_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rulepack::{ActionSpec, MutationLocation, MutationOp};
    use serde_json::json;

    fn replace_action(value: &str) -> ActionSpec {
        ActionSpec {
            op: MutationOp::Replace,
            value: Some(value.to_string()),
            prefix: None,
            pattern: None,
            replacement: None,
            name: None,
            locations: vec![
                MutationLocation::Query,
                MutationLocation::Body,
                MutationLocation::Header,
                MutationLocation::Cookie,
            ],
        }
    }

    #[test]
    fn test_atomic_one_request_per_target() {
        let engine = MutationEngine::new();
        let schema = RequestSchema::new("GET", "https://example.com/search?q=test&page=1");
        let attacks = engine.build_attacks(&schema, &replace_action("payload"), MutationMode::Atomic);
        assert_eq!(attacks.len(), 2);
        for attack in &attacks {
            assert_eq!(attack.mutations.len(), 1);
            assert_eq!(attack.mutations[0].after, "payload");
        }
    }

    #[test]
    fn test_bulk_mutates_all_targets_in_one_request() {
        let engine = MutationEngine::new();
        let schema = RequestSchema::new("GET", "https://example.com/search?q=test&page=1");
        let attacks = engine.build_attacks(&schema, &replace_action("payload"), MutationMode::Bulk);
        assert_eq!(attacks.len(), 1);
        assert_eq!(attacks[0].mutations.len(), 2);
        let pairs = attacks[0].schema.query_pairs();
        assert!(pairs
            .iter()
            .filter(|(k, _)| k == "q" || k == "page")
            .all(|(_, v)| v == "payload"));
    }

    #[test]
    fn test_deny_list_filters_tokens() {
        let engine = MutationEngine::new();
        let mut schema = RequestSchema::new("GET", "https://example.com/a?q=1&csrf=tok&ptk_id=x");
        schema.headers.push(("X-Api-Token".into(), "secret".into()));
        schema.headers.push(("Accept".into(), "*/*".into()));
        let attacks = engine.build_attacks(&schema, &replace_action("p"), MutationMode::Atomic);
        let names: Vec<&str> = attacks
            .iter()
            .map(|a| a.mutations[0].name.as_str())
            .collect();
        assert!(names.contains(&"q"));
        assert!(names.contains(&"Accept"));
        assert!(!names.contains(&"csrf"));
        assert!(!names.contains(&"ptk_id"));
        assert!(!names.contains(&"X-Api-Token"));
    }

    #[test]
    fn test_add_op_concatenates() {
        let engine = MutationEngine::new();
        let schema = RequestSchema::new("GET", "https://example.com/a?q=test");
        let action = ActionSpec {
            op: MutationOp::Add,
            value: Some("'--".to_string()),
            prefix: None,
            pattern: None,
            replacement: None,
            name: Some("q".to_string()),
            locations: vec![MutationLocation::Query],
        };
        let attacks = engine.build_attacks(&schema, &action, MutationMode::Atomic);
        assert_eq!(attacks.len(), 1);
        assert_eq!(attacks[0].mutations[0].before, "test");
        assert_eq!(attacks[0].mutations[0].after, "test'--");
    }

    #[test]
    fn test_noop_regex_target_dropped() {
        let engine = MutationEngine::new();
        let schema = RequestSchema::new("GET", "https://example.com/a?q=hello");
        let action = ActionSpec {
            op: MutationOp::Regex,
            value: None,
            prefix: None,
            pattern: Some("\\d+".to_string()),
            replacement: Some("9".to_string()),
            name: Some("q".to_string()),
            locations: vec![MutationLocation::Query],
        };
        let attacks = engine.build_attacks(&schema, &action, MutationMode::Atomic);
        assert!(attacks.is_empty());
    }

    #[test]
    fn test_random_placeholder_substituted() {
        let engine = MutationEngine::new();
        let schema = RequestSchema::new("GET", "https://example.com/a?q=x");
        let action = ActionSpec {
            op: MutationOp::Replace,
            value: Some("probe-%%random%%".to_string()),
            prefix: None,
            pattern: None,
            replacement: None,
            name: Some("q".to_string()),
            locations: vec![MutationLocation::Query],
        };
        let attacks = engine.build_attacks(&schema, &action, MutationMode::Atomic);
        let after = &attacks[0].mutations[0].after;
        assert!(after.starts_with("probe-"));
        assert!(!after.contains("%%random%%"));
    }

    #[test]
    fn test_json_leaf_enumeration() {
        let engine = MutationEngine::new();
        let mut schema = RequestSchema::new("POST", "https://example.com/api");
        schema.body = RequestBody::Json(json!({"user": {"name": "a", "ids": [1, 2]}}));
        let action = ActionSpec {
            locations: vec![MutationLocation::Body],
            ..replace_action("x")
        };
        let attacks = engine.build_attacks(&schema, &action, MutationMode::Atomic);
        let paths: Vec<&str> = attacks
            .iter()
            .map(|a| a.mutations[0].name.as_str())
            .collect();
        assert_eq!(paths.len(), 3);
        assert!(paths.contains(&"user.name"));
        assert!(paths.contains(&"user.ids[0]"));
        assert!(paths.contains(&"user.ids[1]"));
    }

    #[test]
    fn test_json_explicit_path() {
        let engine = MutationEngine::new();
        let mut schema = RequestSchema::new("POST", "https://example.com/api");
        schema.body = RequestBody::Json(json!({"user": {"name": "a"}}));
        let action = ActionSpec {
            name: Some("user.name".to_string()),
            locations: vec![MutationLocation::Body],
            ..replace_action("x")
        };
        let attacks = engine.build_attacks(&schema, &action, MutationMode::Atomic);
        assert_eq!(attacks.len(), 1);
        match &attacks[0].schema.body {
            RequestBody::Json(v) => assert_eq!(v["user"]["name"], "x"),
            other => panic!("expected json body, got {:?}", other),
        }
    }

    #[test]
    fn test_cache_marker_appended() {
        let engine = MutationEngine::new();
        let schema = RequestSchema::new("GET", "https://example.com/a?q=x");
        let attacks = engine.build_attacks(&schema, &replace_action("p"), MutationMode::Atomic);
        assert!(attacks[0]
            .schema
            .query_pairs()
            .iter()
            .any(|(k, _)| k == CACHE_MARKER_PARAM));
    }

    #[test]
    fn test_cookie_header_regex_fallback_diffs_changed_cookie() {
        let engine = MutationEngine::new();
        let mut schema = RequestSchema::new("GET", "https://example.com/a");
        schema.cookies.push(("sid".into(), "abc123".into()));
        schema.cookies.push(("theme".into(), "dark".into()));
        let action = ActionSpec {
            op: MutationOp::Regex,
            value: None,
            prefix: None,
            pattern: Some("abc\\d+".to_string()),
            replacement: Some("evil".to_string()),
            name: None,
            locations: vec![MutationLocation::Cookie],
        };
        let attacks = engine.build_attacks(&schema, &action, MutationMode::Atomic);
        assert_eq!(attacks.len(), 1);
        let record = &attacks[0].mutations[0];
        assert_eq!(record.name, "sid");
        assert_eq!(record.before, "abc123");
        assert_eq!(record.after, "evil");
    }

    #[test]
    fn test_cookie_remove_by_value_regex() {
        let engine = MutationEngine::new();
        let mut schema = RequestSchema::new("GET", "https://example.com/a");
        schema.cookies.push(("sid".into(), "abc123".into()));
        schema.cookies.push(("theme".into(), "dark".into()));
        let action = ActionSpec {
            op: MutationOp::Remove,
            value: None,
            prefix: None,
            pattern: Some("^abc".to_string()),
            replacement: None,
            name: None,
            locations: vec![MutationLocation::Cookie],
        };
        let attacks = engine.build_attacks(&schema, &action, MutationMode::Bulk);
        assert_eq!(attacks.len(), 1);
        let cookies = &attacks[0].schema.cookies;
        assert!(cookies.iter().all(|(k, _)| k != "sid"));
        assert!(cookies.iter().any(|(k, _)| k == "theme"));
    }

    #[test]
    fn test_mode_precedence() {
        let engine = MutationEngine::new();
        // call override wins over module flag
        assert_eq!(
            engine.resolve_mode(Some(true), Some(false), true),
            MutationMode::Atomic
        );
        // module flag wins over default
        assert_eq!(
            engine.resolve_mode(None, Some(false), true),
            MutationMode::Bulk
        );
        // default true
        assert_eq!(engine.resolve_mode(None, None, true), MutationMode::Atomic);
        // strategy bulk forces bulk
        assert_eq!(engine.resolve_mode(None, None, false), MutationMode::Bulk);
    }
}
