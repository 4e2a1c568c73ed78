//! Identifier wrapper for experiments tracked by the coordinator.
//!
//! Experiment ids are short, human-scannable strings of the form
//! `<prefix>-<8 hex chars>` (for example `plugin-3f9a01bc`). The prefix
//! records which kind of session produced the experiment.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of hex characters taken from a random UUID for the id suffix.
const SUFFIX_LEN: usize = 8;

/// Unique identifier for an experiment session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(String);

impl ExperimentId {
    /// Allocate a fresh identifier with the given prefix.
    pub fn generate(prefix: &str) -> Self {
        let suffix: String = Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(SUFFIX_LEN)
            .collect();
        Self(format!("{prefix}-{suffix}"))
    }

    /// Return the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ExperimentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ExperimentId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix() {
        let id = ExperimentId::generate("plugin");
        assert!(id.as_str().starts_with("plugin-"));
        assert_eq!(id.as_str().len(), "plugin-".len() + SUFFIX_LEN);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = ExperimentId::generate("live");
        let b = ExperimentId::generate("live");
        assert_ne!(a, b);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = ExperimentId::from("live-0000abcd");
        let json = serde_json::to_string(&id).unwrap_or_default();
        assert_eq!(json, "\"live-0000abcd\"");
    }
}
