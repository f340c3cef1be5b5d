//! # Accounting Journal
//!
//! Append-only, newline-delimited JSON shared by every component. One
//! record per line, written under a single mutex so concurrent workers
//! can never interleave partial lines. A signing hook may be attached;
//! without one the `signature` field is written as an explicit `null` so
//! readers can always assume the field exists.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::canonical::canonical_json;
use crate::error::CommonError;

/// Signs the canonical form of an entry; returns the hex signature.
pub type JournalSigner = Box<dyn Fn(&[u8]) -> String + Send + Sync>;

/// One accounting record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp_utc: DateTime<Utc>,
    pub task_id: String,
    pub event_type: String,
    pub node_id: String,
    pub details: Value,
    /// Always present; `null` when no signer is attached.
    pub signature: Option<String>,
}

/// The append-only accounting journal.
pub struct Journal {
    path: PathBuf,
    file: Mutex<File>,
    signer: Option<JournalSigner>,
}

impl Journal {
    /// Opens (creating if needed) the journal at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CommonError> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            signer: None,
        })
    }

    /// Attaches a signing hook applied to every subsequent entry.
    pub fn with_signer(mut self, signer: JournalSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record. Write failures are logged and swallowed —
    /// accounting must never take down the flow it is accounting for.
    pub fn append(&self, event_type: &str, task_id: &str, node_id: &str, details: Value) {
        let mut entry = JournalEntry {
            timestamp_utc: Utc::now(),
            task_id: task_id.to_string(),
            event_type: event_type.to_string(),
            node_id: node_id.to_string(),
            details,
            signature: None,
        };
        if let Some(signer) = &self.signer {
            match canonical_json(&entry) {
                Ok(bytes) => entry.signature = Some(signer(bytes.as_bytes())),
                Err(e) => warn!("journal entry not signable: {}", e),
            }
        }
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!("journal entry not serializable: {}", e);
                return;
            }
        };
        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{}", line) {
            warn!("journal append failed: {}", e);
        }
    }

    /// Full journal contents, for the `/logs` endpoint.
    pub fn contents(&self) -> Result<String, CommonError> {
        // Take the lock so a concurrent append cannot be half-flushed.
        let _guard = self.file.lock();
        Ok(std::fs::read_to_string(&self.path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{verify_hex, NodeKeypair};
    use serde_json::json;

    fn open_temp() -> (tempfile::TempDir, Journal) {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path().join("task_accounting.log")).unwrap();
        (dir, journal)
    }

    #[test]
    fn test_one_json_object_per_line() {
        let (_dir, journal) = open_temp();
        journal.append("TASK_SCHEDULED_TO_NODE_X", "t1", "n1", json!({"a": 1}));
        journal.append("TASK_COMPLETED_ON_NODE_X", "t2", "n1", json!({}));
        let contents = journal.contents().unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let entry: JournalEntry = serde_json::from_str(line).unwrap();
            assert_eq!(entry.node_id, "n1");
        }
    }

    #[test]
    fn test_unsigned_entries_have_explicit_null_signature() {
        let (_dir, journal) = open_temp();
        journal.append("TASK_ACCEPTED_BY_NODE_X", "t1", "n1", json!({}));
        let contents = journal.contents().unwrap();
        let raw: Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        // The key must exist and be null, not be absent.
        assert!(raw.as_object().unwrap().contains_key("signature"));
        assert!(raw["signature"].is_null());
    }

    #[test]
    fn test_signed_entries_verify() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = NodeKeypair::generate();
        let public = keypair.public_key_hex();
        let journal = Journal::open(dir.path().join("log"))
            .unwrap()
            .with_signer(Box::new(move |bytes| keypair.sign_hex(bytes)));
        journal.append("PAYMENT_EARNED_BY_NODE_X", "t1", "n1", json!({"amount": 1.0}));

        let contents = journal.contents().unwrap();
        let entry: JournalEntry =
            serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        let signature = entry.signature.clone().unwrap();
        let bytes = canonical_json(&entry).unwrap();
        assert!(verify_hex(&public, bytes.as_bytes(), &signature));
    }

    #[test]
    fn test_append_order_preserved() {
        let (_dir, journal) = open_temp();
        for i in 0..20 {
            journal.append("TASK_STARTED_ON_NODE_X", &format!("t{}", i), "n1", json!({}));
        }
        let contents = journal.contents().unwrap();
        let ids: Vec<String> = contents
            .lines()
            .map(|l| serde_json::from_str::<JournalEntry>(l).unwrap().task_id)
            .collect();
        let expected: Vec<String> = (0..20).map(|i| format!("t{}", i)).collect();
        assert_eq!(ids, expected);
    }
}
