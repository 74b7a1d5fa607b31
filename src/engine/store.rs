// ── Waystation Engine: Durable Store ───────────────────────────────────────
// SQLite via rusqlite behind a deliberately narrow API: upsert by key, query
// by predicate, cosine scan over embedded chunks. The gateway works without
// it (degraded: memory) — every caller treats the store as optional.

use crate::atoms::error::GatewayResult;
use chrono::Utc;
use log::info;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

/// Get the default path to the gateway's SQLite database.
pub fn default_db_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_default();
    let dir = home.join(".waystation");
    std::fs::create_dir_all(&dir).ok();
    dir.join("gateway.db")
}

/// One row of persisted config state.
#[derive(Debug, Clone)]
pub struct ConfigRow {
    pub value: String,
    pub mtime_ms: i64,
    pub content_hash: String,
}

/// One stored fact (long-term knowledge).
#[derive(Debug, Clone)]
pub struct FactRow {
    pub id: String,
    pub subject: String,
    pub content: String,
    pub confidence: f64,
}

/// Thread-safe database wrapper.
pub struct DurableStore {
    conn: Mutex<Connection>,
}

impl DurableStore {
    /// Open (or create) the gateway database and initialize tables.
    pub fn open(path: &Path) -> GatewayResult<Self> {
        info!("[store] Opening durable store at {:?}", path);
        let conn = Connection::open(path)?;

        // WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS config_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                mtime_ms INTEGER NOT NULL DEFAULT 0,
                content_hash TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS mcp_server (
                name TEXT PRIMARY KEY,
                config_json TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS fact (
                id TEXT PRIMARY KEY,
                subject TEXT NOT NULL,
                content TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 0.5,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_fact_subject ON fact(subject);

            CREATE TABLE IF NOT EXISTS episode (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS chunk (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                embedding BLOB,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )?;

        Ok(DurableStore {
            conn: Mutex::new(conn),
        })
    }

    // ── config_state ───────────────────────────────────────────────────────

    pub fn upsert_config(
        &self,
        key: &str,
        value: &str,
        mtime_ms: i64,
        content_hash: &str,
    ) -> GatewayResult<()> {
        self.conn.lock().execute(
            "INSERT INTO config_state (key, value, mtime_ms, content_hash, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                mtime_ms = excluded.mtime_ms,
                content_hash = excluded.content_hash,
                updated_at = excluded.updated_at",
            params![key, value, mtime_ms, content_hash, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_config(&self, key: &str) -> GatewayResult<Option<ConfigRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT value, mtime_ms, content_hash FROM config_state WHERE key = ?1",
                params![key],
                |row| {
                    Ok(ConfigRow {
                        value: row.get(0)?,
                        mtime_ms: row.get(1)?,
                        content_hash: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn all_config(&self) -> GatewayResult<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key, value FROM config_state ORDER BY key")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── mcp_server ─────────────────────────────────────────────────────────

    pub fn upsert_mcp_server(&self, name: &str, config_json: &str, enabled: bool) -> GatewayResult<()> {
        self.conn.lock().execute(
            "INSERT INTO mcp_server (name, config_json, enabled, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                config_json = excluded.config_json,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at",
            params![name, config_json, enabled, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn list_mcp_servers(&self) -> GatewayResult<Vec<(String, String, bool)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT name, config_json, enabled FROM mcp_server ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── fact / episode ─────────────────────────────────────────────────────

    pub fn put_fact(&self, id: &str, subject: &str, content: &str, confidence: f64) -> GatewayResult<()> {
        self.conn.lock().execute(
            "INSERT INTO fact (id, subject, content, confidence)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                subject = excluded.subject,
                content = excluded.content,
                confidence = excluded.confidence",
            params![id, subject, content, confidence],
        )?;
        Ok(())
    }

    /// Predicate query: facts whose subject or content matches the pattern
    /// (SQL LIKE, caller supplies wildcards).
    pub fn query_facts(&self, pattern: &str, limit: usize) -> GatewayResult<Vec<FactRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, subject, content, confidence FROM fact
             WHERE subject LIKE ?1 OR content LIKE ?1
             ORDER BY confidence DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![pattern, limit as i64], |row| {
                Ok(FactRow {
                    id: row.get(0)?,
                    subject: row.get(1)?,
                    content: row.get(2)?,
                    confidence: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn add_episode(&self, id: &str, content: &str) -> GatewayResult<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO episode (id, content) VALUES (?1, ?2)",
            params![id, content],
        )?;
        Ok(())
    }

    pub fn recent_episodes(&self, limit: usize) -> GatewayResult<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, content FROM episode ORDER BY created_at DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── chunk + vector scan ────────────────────────────────────────────────

    pub fn put_chunk(&self, id: &str, content: &str, embedding: &[f32]) -> GatewayResult<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO chunk (id, content, embedding) VALUES (?1, ?2, ?3)",
            params![id, content, embedding_to_blob(embedding)],
        )?;
        Ok(())
    }

    /// Top-k cosine scan over stored chunks, dropping scores below
    /// `min_confidence`.
    pub fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        min_confidence: f64,
    ) -> GatewayResult<Vec<(String, String, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, content, embedding FROM chunk")?;
        let mut scored: Vec<(String, String, f64)> = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let content: String = row.get(1)?;
                let blob: Option<Vec<u8>> = row.get(2)?;
                Ok((id, content, blob))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(id, content, blob)| {
                let emb = blob_to_embedding(&blob?);
                let score = cosine_similarity(query, &emb);
                (score >= min_confidence).then_some((id, content, score))
            })
            .collect();
        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

// ── Embedding codec ────────────────────────────────────────────────────────

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64) * (*x as f64);
        nb += (*y as f64) * (*y as f64);
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

// ── Tests ──────────────────────────────────────────────────────────────────
