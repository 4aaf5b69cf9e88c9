//! Loosely-typed diagnostic metadata attached to tasks and workspaces.
//!
//! Producers write arbitrary JSON values; readers go through typed accessors
//! that return `None` on a missing key *or* a type mismatch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PUSH_ERROR_TYPE: &str = "push_error_type";
pub const CI_URL: &str = "ci_url";
pub const GITHUB_ACTIONS_URL: &str = "github_actions_url";
pub const VALIDATION_ERROR_COUNT: &str = "validation_error_count";
pub const LAST_ERROR: &str = "last_error";
pub const RETRY_CONTEXT: &str = "retry_context";
pub const PR_URL: &str = "pr_url";
pub const REPOSITORY: &str = "repository";
/// Set once an operator approves; lets the pipeline finish past the gate.
pub const APPROVED: &str = "approved";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Value>);

impl Metadata {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// String value for `key`; `None` when missing or not a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Like [`Metadata::get_str`] but also treats `""` as absent.
    pub fn get_non_empty_str(&self, key: &str) -> Option<&str> {
        self.get_str(key).filter(|value| !value.is_empty())
    }

    /// Non-negative integer for `key`. Integral floats are accepted since
    /// some producers emit every number as a float.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        let value = self.0.get(key)?;
        if let Some(number) = value.as_u64() {
            return Some(number);
        }
        let float = value.as_f64()?;
        if float >= 0.0 && float.fract() == 0.0 && float <= u64::MAX as f64 {
            return Some(float as u64);
        }
        None
    }

    pub fn push_error_type(&self) -> Option<&str> {
        self.get_non_empty_str(PUSH_ERROR_TYPE)
    }

    pub fn ci_url(&self) -> Option<&str> {
        self.get_non_empty_str(CI_URL)
    }

    pub fn github_actions_url(&self) -> Option<&str> {
        self.get_non_empty_str(GITHUB_ACTIONS_URL)
    }

    pub fn validation_error_count(&self) -> Option<u64> {
        self.get_u64(VALIDATION_ERROR_COUNT)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.get_non_empty_str(LAST_ERROR)
    }

    pub fn retry_context(&self) -> Option<&str> {
        self.get_non_empty_str(RETRY_CONTEXT)
    }

    pub fn pr_url(&self) -> Option<&str> {
        self.get_non_empty_str(PR_URL)
    }

    pub fn repository(&self) -> Option<&str> {
        self.get_non_empty_str(REPOSITORY)
    }

    pub fn approved(&self) -> bool {
        self.0.get(APPROVED).and_then(Value::as_bool).unwrap_or(false)
    }
}
