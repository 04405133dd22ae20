//! Record of external operations performed during a command

use super::Outcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One external operation and how it ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub at: DateTime<Utc>,
    pub vpc: String,
    pub step: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
}

/// Entries collected while one command runs
///
/// Persisted by the store once the command finishes, whatever the result.
#[derive(Debug, Default)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, vpc: &str, step: &str, outcome: &Outcome) {
        self.entries.push(JournalEntry {
            at: Utc::now(),
            vpc: vpc.to_string(),
            step: step.to_string(),
            success: outcome.success,
            status: outcome.status,
            output: outcome.output.trim().to_string(),
        });
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn failures(&self) -> impl Iterator<Item = &JournalEntry> {
        self.entries.iter().filter(|e| !e.success)
    }
}
