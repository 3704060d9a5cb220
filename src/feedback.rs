//! Feedback log for assistant answers, kept in a local sled tree.
//!
//! Keys are big-endian ids from sled's monotonic generator, so iteration
//! order is submission order.

use std::path::Path;

use sled::Db;

use crate::models::FeedbackEntry;

#[derive(Clone)]  // sled handles are cheap to clone and thread-safe
pub struct FeedbackStore {
    db: Db,
    tree: sled::Tree,
}

impl FeedbackStore {
    /// Open or create the store under `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, sled::Error> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Throwaway store that lives only in memory.
    pub fn temporary() -> Result<Self, sled::Error> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, sled::Error> {
        let tree = db.open_tree("feedback")?;
        Ok(Self { db, tree })
    }

    pub fn insert(&self, entry: &FeedbackEntry) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let key = self.db.generate_id()?.to_be_bytes();
        let value = serde_json::to_vec(entry)?;
        self.tree.insert(key, value)?;
        Ok(())
    }

    /// Up to `limit` entries, newest first. Undecodable rows are skipped.
    pub fn recent(&self, limit: usize) -> Result<Vec<FeedbackEntry>, sled::Error> {
        let mut entries = Vec::new();
        for item in self.tree.iter().rev() {
            if entries.len() >= limit {
                break;
            }
            let (_, value) = item?;
            if let Ok(entry) = serde_json::from_slice(&value) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(feedback: &str) -> FeedbackEntry {
        FeedbackEntry {
            timestamp: Utc::now(),
            username: "anonymous".into(),
            prompt: "center the title".into(),
            solution: "use flexbox".into(),
            feedback: feedback.into(),
        }
    }

    #[test]
    fn recent_returns_newest_first() {
        let store = FeedbackStore::temporary().expect("temporary sled");
        assert!(store.is_empty());
        for f in ["first", "second", "third"] {
            store.insert(&entry(f)).unwrap();
        }

        let recent = store.recent(2).unwrap();
        let texts: Vec<_> = recent.iter().map(|e| e.feedback.as_str()).collect();
        assert_eq!(texts, ["third", "second"]);
        assert_eq!(store.len(), 3);
    }
}
