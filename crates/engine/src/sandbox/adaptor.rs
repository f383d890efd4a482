//! Adaptor resolution
//!
//! An adaptor specifier such as `@openfn/language-http@1.2.0` names a module of
//! functions available to a job's expression. `common` is built in; any other
//! adaptor must have a resolved location in the run options, and then exposes
//! only its metadata.

use std::collections::HashMap;

use minijinja::value::Value;
use minijinja::{Environment, Error, ErrorKind};
use serde::Serialize;

const LANGUAGE_PREFIX: &str = "language-";

/// Adaptor metadata, visible to expressions as `adaptor`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdaptorInfo {
    /// Short name, e.g. `http`
    pub name: String,
    pub specifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A resolved adaptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adaptor {
    pub info: AdaptorInfo,
    builtin: bool,
}

impl Adaptor {
    /// Resolve a specifier against the known install locations
    pub fn resolve(specifier: &str, paths: &HashMap<String, String>) -> Result<Self, String> {
        let (name, version) = parse_specifier(specifier);
        let path = paths
            .get(specifier)
            .or_else(|| paths.get(&unversioned(specifier)))
            .cloned();
        let builtin = name == "common";

        if !builtin && path.is_none() {
            return Err(format!("Adaptor not found: {specifier}"));
        }

        Ok(Self {
            info: AdaptorInfo {
                name,
                specifier: specifier.to_string(),
                version,
                path,
            },
            builtin,
        })
    }

    pub fn is_builtin(&self) -> bool {
        self.builtin
    }

    /// Register this adaptor's functions
    pub fn install(&self, env: &mut Environment<'_>) {
        if self.builtin {
            env.add_function("merge", merge);
            env.add_function("field", field);
            env.add_function("now", now);
        }
    }
}

/// Split `@scope/language-name@version` into `(name, version)`
pub fn parse_specifier(specifier: &str) -> (String, Option<String>) {
    let (module, version) = match specifier.rfind('@') {
        Some(at) if at > 0 => (&specifier[..at], Some(specifier[at + 1..].to_string())),
        _ => (specifier, None),
    };
    let module = module.rsplit('/').next().unwrap_or(module);
    let name = module.strip_prefix(LANGUAGE_PREFIX).unwrap_or(module);
    (name.to_string(), version.filter(|v| !v.is_empty()))
}

fn unversioned(specifier: &str) -> String {
    match specifier.rfind('@') {
        Some(at) if at > 0 => specifier[..at].to_string(),
        _ => specifier.to_string(),
    }
}

// ============================================================================
// common
// ============================================================================

/// Shallow merge of two maps; keys of `b` win
fn merge(a: Value, b: Value) -> Result<Value, Error> {
    let a: serde_json::Value = to_json(&a)?;
    let b: serde_json::Value = to_json(&b)?;
    match (a, b) {
        (serde_json::Value::Object(mut a), serde_json::Value::Object(b)) => {
            a.extend(b);
            Ok(Value::from_serialize(&a))
        }
        _ => Err(Error::new(
            ErrorKind::InvalidOperation,
            "merge() expects two maps",
        )),
    }
}

/// A `[key, value]` pair
fn field(key: String, value: Value) -> Value {
    Value::from(vec![Value::from(key), value])
}

/// Current time as RFC 3339
fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn to_json(value: &Value) -> Result<serde_json::Value, Error> {
    serde_json::to_value(value)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}
