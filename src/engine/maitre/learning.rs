// ── Waystation Engine: Menu Learning Journal ───────────────────────────────
//
// JSON-file-backed store of past classification wins. On each new query the
// journal is scored against history and servers that keep winning similar
// queries become recall hints for the classifier prompt.
//
//   score = (keyword_overlap + coverage_ratio + 0.4·fuzzy_ratio) · exp(-age_days / 3)
//
// Writes take an advisory file lock (`fs2`) so several gateway processes can
// share one journal.

use crate::atoms::constants::{
    JOURNAL_MAX_ENTRIES, JOURNAL_TRIM_KEEP_RATIO, RECALL_AGE_DECAY_DAYS, RECALL_SCORE_THRESHOLD,
};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::warn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub query_hash: String,
    /// The winning query text, kept for similarity scoring.
    pub query: String,
    pub winning_server: String,
    pub timestamp: DateTime<Utc>,
}

pub struct FeedbackJournal {
    path: PathBuf,
}

impl FeedbackJournal {
    pub fn new(path: PathBuf) -> Self {
        FeedbackJournal { path }
    }

    /// Record that `server` satisfied `query`. Appends under an exclusive
    /// advisory lock; on overflow the oldest entries are dropped, keeping
    /// the newest 20%.
    pub fn record_success(&self, query: &str, server: &str) {
        if let Err(e) = self.record_inner(query, server) {
            // Journal I/O must never fail a request
            warn!("[maitre] Feedback journal write failed: {}", e);
        }
    }

    fn record_inner(&self, query: &str, server: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        file.lock_exclusive()?;

        let mut raw = String::new();
        file.read_to_string(&mut raw)?;
        let mut entries: Vec<FeedbackEntry> = serde_json::from_str(&raw).unwrap_or_default();
        entries.push(FeedbackEntry {
            query_hash: query_hash(query),
            query: query.to_string(),
            winning_server: server.to_string(),
            timestamp: Utc::now(),
        });
        if entries.len() > JOURNAL_MAX_ENTRIES {
            let keep = ((JOURNAL_MAX_ENTRIES as f64) * JOURNAL_TRIM_KEEP_RATIO) as usize;
            entries = entries.split_off(entries.len() - keep);
        }

        let encoded = serde_json::to_string(&entries)?;
        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        file.write_all(encoded.as_bytes())?;
        // Lock released when `file` drops
        Ok(())
    }

    /// Servers whose past wins score above the threshold for this query,
    /// best score first.
    pub fn recall_hints(&self, query: &str) -> Vec<(String, f64)> {
        let entries = self.load();
        let now = Utc::now();
        let mut best: HashMap<String, f64> = HashMap::new();
        for entry in &entries {
            let age_days =
                (now - entry.timestamp).num_seconds().max(0) as f64 / 86_400.0;
            let score = similarity_score(&entry.query, query) * (-age_days / RECALL_AGE_DECAY_DAYS).exp();
            if score > RECALL_SCORE_THRESHOLD {
                let slot = best.entry(entry.winning_server.clone()).or_insert(0.0);
                if score > *slot {
                    *slot = score;
                }
            }
        }
        let mut hints: Vec<(String, f64)> = best.into_iter().collect();
        hints.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hints
    }

    pub fn len(&self) -> usize {
        self.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load(&self) -> Vec<FeedbackEntry> {
        let Ok(file) = OpenOptions::new().read(true).open(&self.path) else {
            return Vec::new();
        };
        if file.lock_shared().is_err() {
            return Vec::new();
        }
        let mut raw = String::new();
        let mut file = file;
        if file.read_to_string(&mut raw).is_err() {
            return Vec::new();
        }
        serde_json::from_str(&raw).unwrap_or_default()
    }
}

/// Raw similarity before age decay: keyword overlap relative to the new
/// query, coverage of the stored query, and a fuzzy whole-string ratio.
fn similarity_score(stored: &str, query: &str) -> f64 {
    let stored_tokens = tokenize(stored);
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() || stored_tokens.is_empty() {
        return 0.0;
    }
    let intersection = query_tokens.intersection(&stored_tokens).count() as f64;
    let keyword_overlap = intersection / query_tokens.len() as f64;
    let coverage_ratio = intersection / stored_tokens.len() as f64;
    let fuzzy_ratio =
        strsim::normalized_levenshtein(&stored.to_lowercase(), &query.to_lowercase());
    keyword_overlap + coverage_ratio + 0.4 * fuzzy_ratio
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_string())
        .collect()
}

fn query_hash(query: &str) -> String {
    let digest = Sha256::digest(query.trim().to_lowercase().as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_journal() -> (tempfile::TempDir, FeedbackJournal) {
        let dir = tempfile::tempdir().unwrap();
        let journal = FeedbackJournal::new(dir.path().join("feedback.json"));
        (dir, journal)
    }

    #[test]
    fn record_then_recall_identical_query() {
        let (_dir, journal) = scratch_journal();
        journal.record_success("search the web for rust news", "web_search");
        let hints = journal.recall_hints("search the web for rust news");
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].0, "web_search");
        assert!(hints[0].1 > 2.0); // fresh identical query scores near 2.4
    }

    #[test]
    fn similar_query_still_recalls() {
        let (_dir, journal) = scratch_journal();
        journal.record_success("search the web for rust news", "web_search");
        let hints = journal.recall_hints("search web for news about rust");
        assert!(!hints.is_empty());
        assert_eq!(hints[0].0, "web_search");
    }

    #[test]
    fn unrelated_query_recalls_nothing() {
        let (_dir, journal) = scratch_journal();
        journal.record_success("search the web for rust news", "web_search");
        let hints = journal.recall_hints("delete the temp directory");
        assert!(hints.is_empty());
    }

    #[test]
    fn best_score_per_server_wins() {
        let (_dir, journal) = scratch_journal();
        journal.record_success("read config file", "filesystem");
        journal.record_success("read the main config file", "filesystem");
        let hints = journal.recall_hints("read the config file");
        assert_eq!(hints.len(), 1); // deduped to one filesystem hint
    }

    #[test]
    fn journal_survives_corrupt_content() {
        let (dir, journal) = scratch_journal();
        std::fs::write(dir.path().join("feedback.json"), "{broken").unwrap();
        assert!(journal.recall_hints("anything").is_empty());
        journal.record_success("q", "s"); // overwrites the corrupt file
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn similarity_formula_components() {
        // Identical strings: 1 + 1 + 0.4 = 2.4
        let s = similarity_score("read the config", "read the config");
        assert!((s - 2.4).abs() < 1e-9);
        // Disjoint strings: overlap and coverage are 0, fuzzy is small
        let s = similarity_score("alpha beta", "gamma delta");
        assert!(s < 0.3);
    }

    #[test]
    fn hash_is_stable_and_case_insensitive() {
        assert_eq!(query_hash("Hello World"), query_hash("  hello world "));
        assert_eq!(query_hash("x").len(), 16);
    }
}
