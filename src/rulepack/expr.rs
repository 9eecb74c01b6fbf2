//! Rule expression evaluator
//!
//! Conditions and validation rules in the rulepack are small boolean/value
//! expressions over the `{original, attack, module}` context. They are
//! modeled as a sealed AST (literal, variable reference, operator
//! application) over a tagged value tree, with a pluggable operator
//! registry. Custom operators cover `regex` matching and `proof` snippet
//! extraction.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskError;

/// Expression AST node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expr {
    /// Variable reference: `{"var": "attack.response.body"}`
    Var { var: String },
    /// Operator application: `{"op": "contains", "args": [...]}`
    Apply { op: String, args: Vec<Expr> },
    /// Literal JSON value
    Literal(Value),
}

/// Evaluation context: the tagged value trees an expression can reference
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    /// Baseline request/response snapshot
    pub original: Value,
    /// Attack request/response snapshot
    pub attack: Value,
    /// Module metadata snapshot
    pub module: Value,
}

impl EvalContext {
    /// Resolve a dotted variable path against the context roots
    fn resolve(&self, path: &str) -> Value {
        let mut segments = path.split('.');
        let root = match segments.next() {
            Some("original") => &self.original,
            Some("attack") => &self.attack,
            Some("module") => &self.module,
            _ => return Value::Null,
        };

        let mut current = root;
        for segment in segments {
            current = match current {
                Value::Object(map) => match map.get(segment) {
                    Some(v) => v,
                    None => return Value::Null,
                },
                Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                    Some(v) => v,
                    None => return Value::Null,
                },
                _ => return Value::Null,
            };
        }
        current.clone()
    }
}

type Operator = Arc<dyn Fn(&[Value]) -> Result<Value, TaskError> + Send + Sync>;

/// Registry of named operators usable from rule expressions
#[derive(Clone)]
pub struct OperatorRegistry {
    ops: HashMap<String, Operator>,
}

impl OperatorRegistry {
    /// Registry with the built-in operator set
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            ops: HashMap::new(),
        };

        registry.register("eq", |args| {
            expect_arity("eq", args, 2)?;
            Ok(Value::Bool(loose_eq(&args[0], &args[1])))
        });
        registry.register("ne", |args| {
            expect_arity("ne", args, 2)?;
            Ok(Value::Bool(!loose_eq(&args[0], &args[1])))
        });
        registry.register("gt", |args| {
            expect_arity("gt", args, 2)?;
            Ok(Value::Bool(as_num(&args[0]) > as_num(&args[1])))
        });
        registry.register("lt", |args| {
            expect_arity("lt", args, 2)?;
            Ok(Value::Bool(as_num(&args[0]) < as_num(&args[1])))
        });
        registry.register("contains", |args| {
            expect_arity("contains", args, 2)?;
            Ok(Value::Bool(
                as_str(&args[0]).contains(&as_str(&args[1])),
            ))
        });
        registry.register("and", |args| {
            Ok(Value::Bool(args.iter().all(truthy)))
        });
        registry.register("or", |args| {
            Ok(Value::Bool(args.iter().any(truthy)))
        });
        registry.register("not", |args| {
            expect_arity("not", args, 1)?;
            Ok(Value::Bool(!truthy(&args[0])))
        });
        registry.register("len", |args| {
            expect_arity("len", args, 1)?;
            let len = match &args[0] {
                Value::Array(items) => items.len(),
                Value::Null => 0,
                other => as_str(other).len(),
            };
            Ok(Value::from(len))
        });
        // status(snapshot) -> response status code of an exchange snapshot
        registry.register("status", |args| {
            expect_arity("status", args, 1)?;
            Ok(args[0]
                .pointer("/response/status")
                .cloned()
                .unwrap_or(Value::Null))
        });
        // regex(pattern, text) -> bool
        registry.register("regex", |args| {
            expect_arity("regex", args, 2)?;
            let pattern = as_str(&args[0]);
            let re = Regex::new(&pattern)
                .map_err(|e| TaskError::ExpressionError(format!("bad regex '{}': {}", pattern, e)))?;
            Ok(Value::Bool(re.is_match(&as_str(&args[1]))))
        });
        // proof(pattern, text) -> matched snippet or null
        registry.register("proof", |args| {
            expect_arity("proof", args, 2)?;
            let pattern = as_str(&args[0]);
            let re = Regex::new(&pattern)
                .map_err(|e| TaskError::ExpressionError(format!("bad regex '{}': {}", pattern, e)))?;
            let text = as_str(&args[1]);
            Ok(match re.find(&text) {
                Some(m) => Value::String(m.as_str().to_string()),
                None => Value::Null,
            })
        });

        registry
    }

    /// Register a custom operator
    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&[Value]) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        self.ops.insert(name.to_string(), Arc::new(f));
    }

    /// Evaluate an expression against a context
    pub fn eval(&self, expr: &Expr, ctx: &EvalContext) -> Result<Value, TaskError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var { var } => Ok(ctx.resolve(var)),
            Expr::Apply { op, args } => {
                let operator = self
                    .ops
                    .get(op)
                    .ok_or_else(|| TaskError::UnknownOperator(op.clone()))?;
                let values = args
                    .iter()
                    .map(|a| self.eval(a, ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                operator(&values)
            }
        }
    }

    /// Evaluate an expression and coerce the result to a boolean
    pub fn eval_bool(&self, expr: &Expr, ctx: &EvalContext) -> Result<bool, TaskError> {
        Ok(truthy(&self.eval(expr, ctx)?))
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn expect_arity(op: &str, args: &[Value], expected: usize) -> Result<(), TaskError> {
    if args.len() != expected {
        return Err(TaskError::BadArity {
            op: op.to_string(),
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn as_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_num(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Bool(true) => 1.0,
        _ => 0.0,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    // numbers and numeric strings compare equal, matching rulepack data
    // where status codes appear both quoted and bare
    match (a, b) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            as_num(a) == as_num(b) || as_str(a) == as_str(b)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> EvalContext {
        EvalContext {
            original: json!({"response": {"status": 200, "body": "hello world"}}),
            attack: json!({"response": {"status": 500, "body": "SQL syntax error near"}}),
            module: json!({"id": "sqli"}),
        }
    }

    #[test]
    fn test_var_resolution() {
        let registry = OperatorRegistry::with_builtins();
        let expr = Expr::Var {
            var: "attack.response.status".to_string(),
        };
        assert_eq!(registry.eval(&expr, &ctx()).unwrap(), json!(500));
    }

    #[test]
    fn test_missing_var_is_null() {
        let registry = OperatorRegistry::with_builtins();
        let expr = Expr::Var {
            var: "attack.response.nope.deeper".to_string(),
        };
        assert_eq!(registry.eval(&expr, &ctx()).unwrap(), Value::Null);
    }

    #[test]
    fn test_regex_operator() {
        let registry = OperatorRegistry::with_builtins();
        let expr: Expr = serde_json::from_value(json!({
            "op": "regex",
            "args": ["SQL syntax", {"var": "attack.response.body"}]
        }))
        .unwrap();
        assert!(registry.eval_bool(&expr, &ctx()).unwrap());
    }

    #[test]
    fn test_proof_operator_extracts_snippet() {
        let registry = OperatorRegistry::with_builtins();
        let expr: Expr = serde_json::from_value(json!({
            "op": "proof",
            "args": ["SQL [a-z]+ error", {"var": "attack.response.body"}]
        }))
        .unwrap();
        assert_eq!(
            registry.eval(&expr, &ctx()).unwrap(),
            json!("SQL syntax error")
        );
    }

    #[test]
    fn test_compound_expression() {
        let registry = OperatorRegistry::with_builtins();
        let expr: Expr = serde_json::from_value(json!({
            "op": "and",
            "args": [
                {"op": "ne", "args": [{"var": "attack.response.status"}, {"var": "original.response.status"}]},
                {"op": "contains", "args": [{"var": "attack.response.body"}, "error"]}
            ]
        }))
        .unwrap();
        assert!(registry.eval_bool(&expr, &ctx()).unwrap());
    }

    #[test]
    fn test_unknown_operator() {
        let registry = OperatorRegistry::with_builtins();
        let expr = Expr::Apply {
            op: "frobnicate".to_string(),
            args: vec![],
        };
        assert!(matches!(
            registry.eval(&expr, &ctx()),
            Err(TaskError::UnknownOperator(_))
        ));
    }

    #[test]
    fn test_status_operator() {
        let registry = OperatorRegistry::with_builtins();
        let expr: Expr = serde_json::from_value(json!({
            "op": "status",
            "args": [{"var": "attack"}]
        }))
        .unwrap();
        assert_eq!(registry.eval(&expr, &ctx()).unwrap(), json!(500));
    }

    #[test]
    fn test_loose_numeric_eq() {
        let registry = OperatorRegistry::with_builtins();
        let expr: Expr = serde_json::from_value(json!({
            "op": "eq",
            "args": [{"var": "attack.response.status"}, "500"]
        }))
        .unwrap();
        assert!(registry.eval_bool(&expr, &ctx()).unwrap());
    }
}
