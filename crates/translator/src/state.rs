//! Small helpers over the per-stream state bag the executor hands each
//! plugin.

use serde_json::Value;
use std::collections::HashMap;

pub fn set(state: &mut HashMap<String, Value>, key: &str, value: Value) {
    state.insert(key.to_string(), value);
}

pub fn get_str(state: &HashMap<String, Value>, key: &str) -> Option<String> {
    state.get(key).and_then(|v| v.as_str()).map(String::from)
}

pub fn get_i64(state: &HashMap<String, Value>, key: &str) -> Option<i64> {
    state.get(key).and_then(|v| v.as_i64())
}

pub fn get_bool(state: &HashMap<String, Value>, key: &str) -> bool {
    state.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}
