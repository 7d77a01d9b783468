/// Tables backing the cache store set, the sync queue and lifecycle state.
pub const SCHEMA: &str = r#"
-- Named, versioned cache partitions (e.g. "lifeline-crisis-v1")
CREATE TABLE IF NOT EXISTS cache_namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Request -> response snapshots
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (namespace, method, url)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_cached
    ON cache_entries(namespace, cached_at);

-- Failed mutating requests awaiting replay
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body TEXT,
    timestamp TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_timestamp ON sync_queue(timestamp);

-- Last known lifecycle state per engine version
CREATE TABLE IF NOT EXISTS engine_versions (
    version TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;
