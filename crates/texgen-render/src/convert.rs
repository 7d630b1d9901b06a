//! Conversions between MiniJinja values and Rhai values.
//!
//! Both sides speak serde, so data values go through `serde_json::Value`.
//! Callables (template functions, Rhai function pointers) have no data
//! representation and are skipped.

use minijinja::value::ValueKind;
use minijinja::Value;
use rhai::Dynamic;

/// Converts a template value for use in a script scope.
///
/// Returns `None` for undefined values and for callables or other opaque
/// objects.
pub(crate) fn to_dynamic(value: &Value) -> Option<Dynamic> {
    match value.kind() {
        ValueKind::Undefined | ValueKind::Plain | ValueKind::Invalid => None,
        _ => rhai::serde::to_dynamic(value).ok(),
    }
}

/// Converts a script value into plain JSON data, if it has a data form.
pub(crate) fn to_json(value: &Dynamic) -> Option<serde_json::Value> {
    if value.is::<rhai::FnPtr>() {
        return None;
    }
    rhai::serde::from_dynamic::<serde_json::Value>(value).ok()
}

/// Converts a script value back into a template value.
///
/// Strings map directly so filter output is not re-quoted; anything without a
/// data form becomes its display string.
pub(crate) fn to_value(value: Dynamic) -> Value {
    if value.is_string() {
        return Value::from(value.into_string().unwrap_or_default());
    }
    if value.is_unit() {
        return Value::from(());
    }
    match to_json(&value) {
        Some(json) => Value::from_serialize(&json),
        None => Value::from(value.to_string()),
    }
}
