//! Idempotency keys for call sites.
//!
//! A key is `<kind>:<name>:<canonical json>` with an optional `#salt`
//! suffix; the hash is the lowercase hex SHA-256 of the key. Canonical JSON
//! sorts object keys so structurally equal arguments always hash the same.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::step::{ActivityKey, ActivityKind};

/// How an activity call site derives its key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeyMode {
    /// Name plus arguments; identical calls replay the same record.
    #[default]
    Arguments,
    /// Also salted with the workflow's logical time.
    LogicalTime,
    /// Also salted with a caller-supplied iteration token.
    Token(String),
}

/// Serialize a JSON value with sorted object keys and no whitespace.
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => Value::String(s.clone()).to_string(),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(to_canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> = map
                .iter()
                .map(|(k, v)| (k, to_canonical_json(v)))
                .collect();
            let items: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), v))
                .collect();
            format!("{{{}}}", items.join(","))
        }
    }
}

/// Format a timestamp for use inside a key.
pub fn key_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Build the key for a call site.
pub fn derive_key(
    kind: ActivityKind,
    name: &str,
    canonical_payload: &str,
    salt: Option<&str>,
) -> ActivityKey {
    let mut key = format!("{}:{}:{}", kind.as_str(), name, canonical_payload);
    if let Some(salt) = salt {
        key.push('#');
        key.push_str(salt);
    }

    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let key_hash = format!("{:x}", hasher.finalize());

    ActivityKey {
        kind,
        key_hash,
        key,
    }
}

/// Key of an activity call site.
pub fn activity_key(
    name: &str,
    args: &Value,
    mode: &KeyMode,
    logical_time: DateTime<Utc>,
) -> ActivityKey {
    let salt = match mode {
        KeyMode::Arguments => None,
        KeyMode::LogicalTime => Some(format!("t={}", key_time(logical_time))),
        KeyMode::Token(token) => Some(format!("i={}", token)),
    };
    derive_key(
        ActivityKind::Activity,
        name,
        &to_canonical_json(args),
        salt.as_deref(),
    )
}

/// Key of a durable timer. The due time is part of the key, so two equal
/// delays in a row are distinct records.
pub fn delay_key(eta: DateTime<Utc>) -> ActivityKey {
    derive_key(ActivityKind::Delay, "delay", &key_time(eta), None)
}

/// Key of an event wait over a set of names.
pub fn event_key(names: &[String], eta: DateTime<Utc>) -> ActivityKey {
    let mut sorted: Vec<&str> = names.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    derive_key(
        ActivityKind::Event,
        &sorted.join(","),
        &key_time(eta),
        None,
    )
}

/// Key of a child workflow start.
pub fn child_key(workflow_type: &str, input: &Value) -> ActivityKey {
    derive_key(
        ActivityKind::Workflow,
        workflow_type,
        &to_canonical_json(input),
        None,
    )
}
