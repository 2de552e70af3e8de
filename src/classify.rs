//! Decides which upstream answers are worth keeping forever.
//!
//! A "good" answer carries the data that was asked for (verified source,
//! an ABI). Anything else is still a valid reply and is handed back to the
//! caller, but only lives in the volatile tier.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use crate::upstream::CacheKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Good,
    NotVerified,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Good => "good",
            Verdict::NotVerified => "not_verified",
        }
    }
}

pub trait Classifier: Send + Sync {
    fn classify(&self, key: &CacheKey, response: &Value) -> Verdict;
}

/// Etherscan-style `{"status", "message", "result"}` payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct EtherscanClassifier;

impl EtherscanClassifier {
    fn source_code_present(result: &Value) -> bool {
        result.as_array().is_some_and(|items| {
            items.iter().any(|item| {
                item.get("SourceCode")
                    .and_then(Value::as_str)
                    .is_some_and(|source| !source.trim().is_empty())
            })
        })
    }

    fn abi_present(result: &Value) -> bool {
        result
            .as_str()
            .and_then(|abi| serde_json::from_str::<Value>(abi).ok())
            .is_some_and(|abi| abi.is_array())
    }

    fn generic_present(response: &Value, result: &Value) -> bool {
        let failed = response.get("status").and_then(Value::as_str) == Some("0");
        let empty = match result {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::Object(fields) => fields.is_empty(),
            _ => false,
        };
        !failed && !empty
    }
}

impl Classifier for EtherscanClassifier {
    fn classify(&self, key: &CacheKey, response: &Value) -> Verdict {
        let Some(result) = response.get("result") else {
            return Verdict::NotVerified;
        };

        let good = match key.action.as_str() {
            "getsourcecode" => Self::source_code_present(result),
            "getabi" => Self::abi_present(result),
            _ => Self::generic_present(response, result),
        };

        if good {
            Verdict::Good
        } else {
            Verdict::NotVerified
        }
    }
}

/// Routes classification by explorer, for explorers whose API deviates
/// from the Etherscan shape.
pub struct PerExplorerClassifier {
    overrides: HashMap<String, Arc<dyn Classifier>>,
    fallback: Arc<dyn Classifier>,
}

impl PerExplorerClassifier {
    pub fn new(fallback: Arc<dyn Classifier>) -> Self {
        Self {
            overrides: HashMap::new(),
            fallback,
        }
    }

    pub fn with(mut self, explorer: impl Into<String>, classifier: Arc<dyn Classifier>) -> Self {
        self.overrides.insert(explorer.into(), classifier);
        self
    }
}

impl Classifier for PerExplorerClassifier {
    fn classify(&self, key: &CacheKey, response: &Value) -> Verdict {
        self.overrides
            .get(&key.explorer)
            .unwrap_or(&self.fallback)
            .classify(key, response)
    }
}
