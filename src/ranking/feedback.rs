use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::ranking::ranker::compute_feedback_boost;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub primary_key: String,
    /// Most recent feedback timestamp, seconds since the epoch.
    pub last_seen_secs: i64,
    pub frequency: u32,
}

/// Click-feedback signal per exact query string. Consulted by score-sorted
/// operators when the caller set no explicit sort criterion.
#[derive(Debug, Default)]
pub struct FeedbackIndex {
    entries: RwLock<HashMap<String, Vec<FeedbackEntry>>>,
}

impl FeedbackIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_feedback(&self, query: &str, primary_key: &str) {
        self.add_feedback_at(query, primary_key, Utc::now().timestamp());
    }

    pub fn add_feedback_at(&self, query: &str, primary_key: &str, timestamp_secs: i64) {
        let mut entries = self.entries.write();
        let list = entries.entry(query.to_string()).or_default();
        match list.iter_mut().find(|e| e.primary_key == primary_key) {
            Some(entry) => {
                entry.frequency += 1;
                entry.last_seen_secs = entry.last_seen_secs.max(timestamp_secs);
            }
            None => list.push(FeedbackEntry {
                primary_key: primary_key.to_string(),
                last_seen_secs: timestamp_secs,
                frequency: 1,
            }),
        }
    }

    pub fn has_feedback(&self, query: &str) -> bool {
        self.entries.read().contains_key(query)
    }

    /// Largest click count among this query's entries; bounds the boost any
    /// record can receive.
    pub fn max_frequency(&self, query: &str) -> u32 {
        self.entries
            .read()
            .get(query)
            .map(|list| list.iter().map(|e| e.frequency).max().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Boost for one result of `query`, or 1.0 without signal.
    pub fn boost_for(&self, query: &str, primary_key: &str, now_secs: i64) -> f32 {
        let entries = self.entries.read();
        let Some(list) = entries.get(query) else {
            return 1.0;
        };
        match list.iter().find(|e| e.primary_key == primary_key) {
            Some(entry) => {
                let recency = (now_secs - entry.last_seen_secs).max(0) as u64;
                compute_feedback_boost(recency, entry.frequency)
            }
            None => 1.0,
        }
    }

    pub fn snapshot(&self) -> HashMap<String, Vec<FeedbackEntry>> {
        self.entries.read().clone()
    }

    pub fn restore(&self, snapshot: HashMap<String, Vec<FeedbackEntry>>) {
        *self.entries.write() = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_feedback_accumulates() {
        let index = FeedbackIndex::new();
        index.add_feedback_at("coffee", "r-1", 1_000);
        index.add_feedback_at("coffee", "r-1", 2_000);
        index.add_feedback_at("coffee", "r-2", 1_500);

        let boost_r1 = index.boost_for("coffee", "r-1", 2_100);
        let boost_r2 = index.boost_for("coffee", "r-2", 2_100);
        assert!(boost_r1 > boost_r2);
        assert_eq!(index.boost_for("tea", "r-1", 2_100), 1.0);
    }
}
