// ── Waystation Engine: Config Store ────────────────────────────────────────
//
// Read/write configuration map with a three-level authority chain:
//   database > RAM > disk snapshot
//
// Reconciliation (startup and on reload) per tracked file:
//   1. mtime unchanged → skip (fast path)
//   2. hash unchanged  → update mtime only
//   3. else parse, validate, merge into RAM, upsert into the database,
//      update mtime + hash
//
// Parse failures never abort reconciliation: the offending file is skipped,
// an error is recorded, and the previous in-memory values stay authoritative.
// Secrets (keys sourced from `.env`) persist back via regex in-place patching
// so surrounding comments survive.
//
// Readers hold copy-on-write snapshots; writers swap a fresh Arc.

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::engine::store::DurableStore;
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ── File tracking ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct FileMeta {
    mtime_ms: i64,
    content_hash: String,
}

/// Outcome of one `sync_all` pass.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub files_scanned: usize,
    pub files_parsed: usize,
    pub files_skipped: usize,
    pub errors: Vec<String>,
}

impl SyncReport {
    /// True when nothing changed on disk — a reload of an unchanged config.
    pub fn is_noop(&self) -> bool {
        self.files_parsed == 0 && self.errors.is_empty()
    }
}

// ── Store ──────────────────────────────────────────────────────────────────

pub struct ConfigStore {
    /// Directory holding `config/*.json`, `config/mcp_manifests/*.json`; the
    /// `.env` file lives next to it.
    config_dir: PathBuf,
    /// Durable backing store. Absent while the database is down.
    store: RwLock<Option<Arc<DurableStore>>>,
    /// In-memory merged map. Copy-on-write: readers clone the Arc.
    ram: RwLock<Arc<HashMap<String, String>>>,
    /// Keys that came from `.env` — persisted by patching, never by dump.
    secret_keys: Mutex<HashSet<String>>,
    tracked: Mutex<HashMap<PathBuf, FileMeta>>,
}

impl ConfigStore {
    pub fn new(config_dir: PathBuf) -> Self {
        ConfigStore {
            config_dir,
            store: RwLock::new(None),
            ram: RwLock::new(Arc::new(HashMap::new())),
            secret_keys: Mutex::new(HashSet::new()),
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the durable store once boot phase 2 connects it.
    pub fn attach_store(&self, store: Arc<DurableStore>) {
        *self.store.write() = Some(store);
    }

    pub fn has_store(&self) -> bool {
        self.store.read().is_some()
    }

    // ── Reads ──────────────────────────────────────────────────────────────

    /// Authority chain: database > RAM (which includes the disk snapshot).
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(store) = self.store.read().as_ref() {
            match store.get_config(key) {
                Ok(Some(row)) => return Some(row.value),
                Ok(None) => {}
                Err(e) => {
                    // Store I/O failures degrade to the RAM snapshot
                    warn!("[config] DB read for '{}' failed: {}", key, e);
                }
            }
        }
        self.ram.read().get(key).cloned()
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key)?.trim().parse().ok()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)?.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        }
    }

    /// Copy-on-write snapshot for readers that need a consistent view.
    pub fn snapshot(&self) -> Arc<HashMap<String, String>> {
        self.ram.read().clone()
    }

    // ── Writes ─────────────────────────────────────────────────────────────

    /// Write-through: database first, then RAM, then disk mirror.
    pub fn set(&self, key: &str, value: &str) -> GatewayResult<()> {
        if let Some(store) = self.store.read().as_ref() {
            store.upsert_config(key, value, 0, "")?;
        }
        self.swap_ram(|map| {
            map.insert(key.to_string(), value.to_string());
        });
        self.mirror_to_disk(key, value);
        Ok(())
    }

    /// Replace every key under `<section>.` with the new map in one swap.
    pub fn atomic_swap(&self, section: &str, new_map: HashMap<String, String>) -> GatewayResult<()> {
        let prefix = format!("{section}.");
        let prefixed: HashMap<String, String> = new_map
            .into_iter()
            .map(|(k, v)| (format!("{prefix}{k}"), v))
            .collect();
        if let Some(store) = self.store.read().as_ref() {
            for (k, v) in &prefixed {
                store.upsert_config(k, v, 0, "")?;
            }
        }
        self.swap_ram(|map| {
            map.retain(|k, _| !k.starts_with(&prefix));
            map.extend(prefixed.clone());
        });
        Ok(())
    }

    // ── Reconciliation ─────────────────────────────────────────────────────

    /// Startup / reload reconciliation over every tracked file. Never
    /// returns Err for per-file problems; they land in the report.
    pub fn sync_all(&self) -> SyncReport {
        let mut report = SyncReport::default();
        for path in self.discover_files() {
            report.files_scanned += 1;
            match self.sync_file(&path) {
                Ok(true) => report.files_parsed += 1,
                Ok(false) => report.files_skipped += 1,
                Err(e) => {
                    let msg = format!("{}: {}", path.display(), e);
                    warn!("[config] Skipping unparseable file — {}", msg);
                    report.errors.push(msg);
                }
            }
        }
        // Process environment outranks the disk snapshot it just merged
        if report.files_parsed > 0 {
            self.load_env_overrides();
        }
        info!(
            "[config] sync_all: {} scanned, {} parsed, {} unchanged, {} errors",
            report.files_scanned,
            report.files_parsed,
            report.files_skipped,
            report.errors.len()
        );
        report
    }

    /// Returns Ok(true) if the file was (re)parsed, Ok(false) if unchanged.
    fn sync_file(&self, path: &Path) -> GatewayResult<bool> {
        let meta = std::fs::metadata(path)?;
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        {
            let tracked = self.tracked.lock();
            if let Some(known) = tracked.get(path) {
                if known.mtime_ms == mtime_ms {
                    return Ok(false); // fast path
                }
            }
        }

        let content = std::fs::read_to_string(path)?;
        let hash = content_hash(&content);
        {
            let mut tracked = self.tracked.lock();
            let entry = tracked.entry(path.to_path_buf()).or_default();
            if entry.content_hash == hash {
                entry.mtime_ms = mtime_ms; // touch only
                return Ok(false);
            }
        }

        // Parse BEFORE touching any state so a bad file leaves the previous
        // values authoritative.
        let parsed = self.parse_file(path, &content)?;

        self.swap_ram(|map| {
            for (k, v) in &parsed {
                map.insert(k.clone(), v.clone());
            }
        });
        if let Some(store) = self.store.read().as_ref() {
            for (k, v) in &parsed {
                if let Err(e) = store.upsert_config(k, v, mtime_ms, &hash) {
                    warn!("[config] DB upsert for '{}' failed: {}", k, e);
                }
            }
        }
        let mut tracked = self.tracked.lock();
        tracked.insert(
            path.to_path_buf(),
            FileMeta {
                mtime_ms,
                content_hash: hash,
            },
        );
        Ok(true)
    }

    fn parse_file(&self, path: &Path, content: &str) -> GatewayResult<Vec<(String, String)>> {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name == ".env" {
            let pairs = parse_env(content);
            let mut secrets = self.secret_keys.lock();
            for (k, _) in &pairs {
                secrets.insert(k.clone());
            }
            return Ok(pairs);
        }
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            let value: Value = serde_json::from_str(content)?;
            if path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                == Some("mcp_manifests")
            {
                // Manifests are consumed whole by the MCP manager
                let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("manifest");
                return Ok(vec![(format!("mcp_manifest.{stem}"), content.to_string())]);
            }
            if !value.is_object() {
                return Err(GatewayError::Config(format!(
                    "{name}: top level must be a JSON object"
                )));
            }
            let mut out = Vec::new();
            flatten_json("", &value, &mut out);
            return Ok(out);
        }
        Err(GatewayError::Config(format!("{name}: unsupported config file type")))
    }

    /// Files under authority of this store, in a stable order.
    fn discover_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let env_path = self
            .config_dir
            .parent()
            .unwrap_or(&self.config_dir)
            .join(".env");
        if env_path.is_file() {
            files.push(env_path);
        }
        for dir in [self.config_dir.clone(), self.config_dir.join("mcp_manifests")] {
            if let Ok(entries) = std::fs::read_dir(&dir) {
                let mut batch: Vec<PathBuf> = entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("json"))
                    .collect();
                batch.sort();
                files.extend(batch);
            }
        }
        files
    }

    // ── Environment overrides ──────────────────────────────────────────────

    /// Load recognized process environment variables into RAM (source: ram,
    /// above disk but below db).
    pub fn load_env_overrides(&self) {
        let mut loaded = 0usize;
        self.swap_ram(|map| {
            for (key, value) in std::env::vars() {
                if key.starts_with("WAYSTATION_") || key.starts_with("MCP_TOKEN_") {
                    map.insert(key, value);
                    loaded += 1;
                }
            }
        });
        if loaded > 0 {
            info!("[config] {} environment overrides loaded", loaded);
        }
    }

    // ── Disk mirroring ─────────────────────────────────────────────────────

    fn mirror_to_disk(&self, key: &str, value: &str) {
        let is_secret = self.secret_keys.lock().contains(key);
        let result = if is_secret {
            let env_path = self
                .config_dir
                .parent()
                .unwrap_or(&self.config_dir)
                .join(".env");
            patch_env_file(&env_path, key, value)
        } else {
            self.patch_runtime_json(key, value)
        };
        if let Err(e) = result {
            // Disk mirror failures are recorded, not raised — DB stays
            // authoritative
            warn!("[config] Disk mirror for '{}' failed: {}", key, e);
        }
    }

    fn patch_runtime_json(&self, key: &str, value: &str) -> GatewayResult<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        let path = self.config_dir.join("runtime.json");
        let mut map: serde_json::Map<String, Value> = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => serde_json::Map::new(),
        };
        map.insert(key.to_string(), Value::String(value.to_string()));
        std::fs::write(&path, serde_json::to_string_pretty(&Value::Object(map))?)?;
        Ok(())
    }

    fn swap_ram(&self, mutate: impl FnOnce(&mut HashMap<String, String>)) {
        let mut guard = self.ram.write();
        let mut next: HashMap<String, String> = (**guard).clone();
        mutate(&mut next);
        *guard = Arc::new(next);
    }
}

// ── Parsing helpers ────────────────────────────────────────────────────────

fn parse_env(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            let value = value.trim().trim_matches('"').trim_matches('\'');
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Flatten nested JSON objects into `a.b.c` keys; scalars stringify, arrays
/// keep their JSON encoding.
fn flatten_json(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten_json(&key, v, out);
            }
        }
        Value::String(s) => out.push((prefix.to_string(), s.clone())),
        Value::Null => out.push((prefix.to_string(), String::new())),
        other => out.push((prefix.to_string(), other.to_string())),
    }
}

/// Regex-based in-place patch of one `KEY=value` line; comments and unrelated
/// lines are preserved byte-for-byte. Appends the key when absent.
pub fn patch_env_file(path: &Path, key: &str, value: &str) -> GatewayResult<()> {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    let pattern = Regex::new(&format!(r"(?m)^\s*{}\s*=.*$", regex::escape(key)))
        .map_err(|e| GatewayError::Config(format!("env patch regex: {e}")))?;
    let replacement = format!("{key}={value}");
    let patched = if pattern.is_match(&content) {
        pattern.replace(&content, replacement.as_str()).into_owned()
    } else {
        let mut patched = content;
        if !patched.is_empty() && !patched.ends_with('\n') {
            patched.push('\n');
        }
        patched.push_str(&replacement);
        patched.push('\n');
        patched
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, patched)?;
    Ok(())
}

fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::DurableStore;

    fn scratch() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");
        std::fs::create_dir_all(&config_dir).unwrap();
        (dir, ConfigStore::new(config_dir))
    }

    #[test]
    fn read_your_write_in_ram() {
        let (_dir, cfg) = scratch();
        cfg.set("AGENT_MODEL", "foo").unwrap();
        assert_eq!(cfg.get("AGENT_MODEL").as_deref(), Some("foo"));
    }

    #[test]
    fn db_beats_ram() {
        let (dir, cfg) = scratch();
        cfg.set("k", "ram-value").unwrap();
        let store = Arc::new(DurableStore::open(&dir.path().join("db.sqlite")).unwrap());
        store.upsert_config("k", "db-value", 0, "").unwrap();
        cfg.attach_store(store);
        assert_eq!(cfg.get("k").as_deref(), Some("db-value"));
    }

    #[test]
    fn sync_all_parses_json_and_env() {
        let (dir, cfg) = scratch();
        std::fs::write(
            dir.path().join("config/gateway.json"),
            r#"{"port": 9000, "providers": {"openai": {"base_url": "https://api.openai.com/v1"}}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join(".env"), "# secrets\nOPENAI_KEY=sk-test\n").unwrap();

        let report = cfg.sync_all();
        assert_eq!(report.files_parsed, 2);
        assert!(report.errors.is_empty());
        assert_eq!(cfg.get("port").as_deref(), Some("9000"));
        assert_eq!(
            cfg.get("providers.openai.base_url").as_deref(),
            Some("https://api.openai.com/v1")
        );
        assert_eq!(cfg.get("OPENAI_KEY").as_deref(), Some("sk-test"));
    }

    #[test]
    fn unchanged_reload_is_noop() {
        let (dir, cfg) = scratch();
        std::fs::write(dir.path().join("config/gateway.json"), r#"{"a": 1}"#).unwrap();
        let first = cfg.sync_all();
        assert_eq!(first.files_parsed, 1);
        let second = cfg.sync_all();
        assert!(second.is_noop());
        assert_eq!(second.files_skipped, 1);
    }

    #[test]
    fn parse_failure_keeps_previous_values() {
        let (dir, cfg) = scratch();
        let path = dir.path().join("config/gateway.json");
        std::fs::write(&path, r#"{"a": "good"}"#).unwrap();
        cfg.sync_all();
        assert_eq!(cfg.get("a").as_deref(), Some("good"));

        std::fs::write(&path, "{not json").unwrap();
        // mtime granularity can hide the rewrite; force a re-check
        cfg.tracked.lock().clear();
        let report = cfg.sync_all();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(cfg.get("a").as_deref(), Some("good"));
    }

    #[test]
    fn env_patch_preserves_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "# api keys live here\nOPENAI_KEY=old\nOTHER=x\n").unwrap();
        patch_env_file(&path, "OPENAI_KEY", "new").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("# api keys live here"));
        assert!(content.contains("OPENAI_KEY=new"));
        assert!(content.contains("OTHER=x"));
        assert!(!content.contains("old"));
    }

    #[test]
    fn env_patch_appends_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "EXISTING=1\n").unwrap();
        patch_env_file(&path, "NEW_KEY", "v").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("EXISTING=1"));
        assert!(content.ends_with("NEW_KEY=v\n"));
    }

    #[test]
    fn atomic_swap_replaces_section() {
        let (_dir, cfg) = scratch();
        cfg.set("providers.old", "1").unwrap();
        cfg.set("unrelated", "keep").unwrap();
        let mut fresh = HashMap::new();
        fresh.insert("openai.base_url".to_string(), "https://x".to_string());
        cfg.atomic_swap("providers", fresh).unwrap();
        assert!(cfg.get("providers.old").is_none());
        assert_eq!(cfg.get("providers.openai.base_url").as_deref(), Some("https://x"));
        assert_eq!(cfg.get("unrelated").as_deref(), Some("keep"));
    }

    #[test]
    fn env_parser_skips_comments_and_quotes() {
        let pairs = parse_env("# c\n\nA=1\nB=\"two\"\nC='three'\nbad-line\n");
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[1], ("B".to_string(), "two".to_string()));
        assert_eq!(pairs[2], ("C".to_string(), "three".to_string()));
    }
}
