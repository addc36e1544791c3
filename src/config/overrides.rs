//! Dotted `key.path=value` overrides on top of a base configuration.
//!
//! The configuration is serialised to a JSON tree, each override replaces one
//! existing leaf or subtree, and the result is deserialised back into the typed
//! [`EvalConfig`]. Paths must already exist in the tree: an override can change
//! a value but never invent a key. Values are parsed as JSON first and fall back
//! to a plain string, so `misc.workers=4`, `codec.operating_points=[22,32]` and
//! `misc.device=cuda` all do what they look like. A value replacing a string is
//! taken verbatim, so `dataset.name=2017` stays a string.

use serde_json::Value;

use super::config::EvalConfig;
use crate::error::{EvalError, EvalResult};

/// Apply a single `path=value` override to a configuration tree.
pub fn apply_override(root: &mut Value, spec: &str) -> EvalResult<()> {
    let (path, raw) = spec.split_once('=').ok_or_else(|| {
        EvalError::config("override", spec, "expected key.path=value")
    })?;
    let path = path.trim();
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(EvalError::config("override", spec, "empty key segment"));
    }
    let raw = raw.trim();

    let mut node = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let map = node.as_object_mut().ok_or_else(|| {
            EvalError::config(path, raw, format!("'{}' is not a section", segment))
        })?;
        let slot = map
            .get_mut(segment)
            .ok_or_else(|| EvalError::config(path, raw, format!("unknown key '{}'", segment)))?;
        if segments.peek().is_none() {
            *slot = parse_value(slot, raw);
            return Ok(());
        }
        node = slot;
    }
    Ok(())
}

/// Parse an override value against the value it replaces.
///
/// String leaves keep the raw text unless it is quoted, so `dataset.name=2017`
/// stays a string. Every other leaf is parsed as JSON with a string fallback.
fn parse_value(current: &Value, raw: &str) -> Value {
    let quoted = raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"');
    if current.is_string() && !quoted {
        return Value::String(raw.to_string());
    }
    serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Apply every override in order and re-check the typed shape.
pub fn apply_overrides(base: &EvalConfig, overrides: &[String]) -> EvalResult<EvalConfig> {
    if overrides.is_empty() {
        return Ok(base.clone());
    }
    let mut tree = serde_json::to_value(base)?;
    for spec in overrides {
        apply_override(&mut tree, spec)?;
    }
    serde_json::from_value(tree).map_err(|e| {
        EvalError::config("override", overrides.join(" "), e.to_string())
    })
}
