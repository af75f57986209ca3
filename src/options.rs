//! Per-workflow options.
//!
//! Options arrive as JSON alongside the workflow submission. Values may be
//! encrypted at rest; encrypted values are purged when the workflow reaches a
//! terminal state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Plain(String),
    Encrypted { iv: String, ciphertext: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowOptions {
    values: HashMap<String, OptionValue>,
}

impl WorkflowOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_plain(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values
            .insert(key.into(), OptionValue::Plain(value.into()));
    }

    pub fn insert_encrypted(
        &mut self,
        key: impl Into<String>,
        iv: impl Into<String>,
        ciphertext: impl Into<String>,
    ) {
        self.values.insert(
            key.into(),
            OptionValue::Encrypted {
                iv: iv.into(),
                ciphertext: ciphertext.into(),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.values.get(key)
    }

    pub fn get_plain(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(OptionValue::Plain(value)) => Some(value),
            _ => None,
        }
    }

    pub fn has_encrypted(&self) -> bool {
        self.values
            .values()
            .any(|value| matches!(value, OptionValue::Encrypted { .. }))
    }

    /// Drop every encrypted value. Called on terminal workflow transitions so
    /// secrets do not outlive the run.
    pub fn clear_encrypted(&mut self) {
        self.values
            .retain(|_, value| !matches!(value, OptionValue::Encrypted { .. }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_encrypted_keeps_plain_values() {
        let mut options = WorkflowOptions::new();
        options.insert_plain("zone", "us-central1");
        options.insert_encrypted("refresh_token", "abc", "0xdeadbeef");
        assert!(options.has_encrypted());

        options.clear_encrypted();
        assert!(!options.has_encrypted());
        assert_eq!(options.get_plain("zone"), Some("us-central1"));
        assert!(options.get("refresh_token").is_none());
    }

    #[test]
    fn serde_round_trip() {
        let mut options = WorkflowOptions::new();
        options.insert_plain("memory_retry_multiplier", "1.5");
        options.insert_encrypted("token", "iv0", "ct0");
        let json = serde_json::to_string(&options).unwrap();
        let back: WorkflowOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, options);
    }
}
