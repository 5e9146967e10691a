//! Lenient typed access to the open-ended request parameter map.
//!
//! Parameters arrive as JSON values, so numeric values are often floating
//! point even when a backend flag expects an integer. The getters here
//! coerce between the two (integers truncate toward zero) and fall back to
//! the supplied default on a missing key or an incompatible type.

use std::collections::HashMap;

use serde_json::Value;

/// A value that can be extracted from a JSON parameter.
pub trait FromParam: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromParam for i64 {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
    }
}

impl FromParam for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_f64().or_else(|| value.as_i64().map(|i| i as f64))
    }
}

impl FromParam for bool {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

impl FromParam for String {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }
}

/// Retrieve a typed parameter, falling back to `default` when the key is
/// missing or the value cannot be coerced.
pub fn get<T: FromParam>(params: &HashMap<String, Value>, key: &str, default: T) -> T {
    params.get(key).and_then(T::from_value).unwrap_or(default)
}

/// Retrieve a typed parameter without a default.
pub fn get_opt<T: FromParam>(params: &HashMap<String, Value>, key: &str) -> Option<T> {
    params.get(key).and_then(T::from_value)
}
