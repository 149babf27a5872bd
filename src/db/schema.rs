/// Schema for every persistent store.
pub const SCHEMA: &str = r#"
-- Namespaced string store (expiring key-value cache envelopes live here)
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Named HTTP response caches
CREATE TABLE IF NOT EXISTS cache_names (
    name TEXT PRIMARY KEY,
    created_seq INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS cached_responses (
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_key)
);

-- Offline form submissions awaiting replay
CREATE TABLE IF NOT EXISTS offline_forms (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB
);

CREATE TABLE IF NOT EXISTS replay_attempts (
    form_id INTEGER PRIMARY KEY,
    attempts INTEGER NOT NULL,
    last_error TEXT,
    last_attempt_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS dead_letters (
    id INTEGER PRIMARY KEY,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    attempts INTEGER NOT NULL,
    last_error TEXT,
    dead_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
