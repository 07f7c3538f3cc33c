use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

/// SQLite-backed store for user preferences and the emote-art cache index.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// Chat preferences persisted across sessions; the web original kept these
/// in localStorage.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatPrefs {
    pub user_delay_secs: f64,
    pub show_timestamp: bool,
    pub alternate_bg: bool,
}

impl Default for ChatPrefs {
    fn default() -> Self {
        Self {
            user_delay_secs: 0.0,
            show_timestamp: false,
            alternate_bg: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaEntry {
    pub id: i64,
    pub url: String,
    pub media_type: String,
    pub file_path: String,
    pub size_bytes: i64,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub checksum: String,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", &"WAL")
            .context("storage: set WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS prefs (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS media_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE,
                media_type TEXT NOT NULL,
                file_path TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                fetched_at TEXT NOT NULL,
                expires_at TEXT,
                checksum TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_media_cache_fetched
                ON media_cache(fetched_at);",
        )
        .context("storage: apply schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn get_pref(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM prefs WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("storage: read pref")
    }

    pub fn set_pref(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO prefs(key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                            updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )
        .context("storage: write pref")?;
        Ok(())
    }

    pub fn load_chat_prefs(&self) -> Result<ChatPrefs> {
        let defaults = ChatPrefs::default();
        let user_delay_secs = self
            .get_pref("chat.user_delay_secs")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.user_delay_secs);
        let show_timestamp = self
            .get_pref("chat.show_timestamp")?
            .map(|v| v == "true")
            .unwrap_or(defaults.show_timestamp);
        let alternate_bg = self
            .get_pref("chat.alternate_bg")?
            .map(|v| v == "true")
            .unwrap_or(defaults.alternate_bg);
        Ok(ChatPrefs {
            user_delay_secs,
            show_timestamp,
            alternate_bg,
        })
    }

    pub fn save_chat_prefs(&self, prefs: &ChatPrefs) -> Result<()> {
        self.set_pref("chat.user_delay_secs", &prefs.user_delay_secs.to_string())?;
        self.set_pref("chat.show_timestamp", &prefs.show_timestamp.to_string())?;
        self.set_pref("chat.alternate_bg", &prefs.alternate_bg.to_string())?;
        Ok(())
    }

    pub fn get_media_entry_by_url(&self, url: &str) -> Result<Option<MediaEntry>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, url, media_type, file_path, size_bytes, fetched_at, expires_at, checksum
             FROM media_cache WHERE url = ?1",
            params![url],
            media_entry_from_row,
        )
        .optional()
        .context("storage: read media entry")
    }

    pub fn upsert_media_entry(&self, entry: MediaEntry) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO media_cache(url, media_type, file_path, size_bytes, fetched_at, expires_at, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(url) DO UPDATE SET
                media_type = excluded.media_type,
                file_path = excluded.file_path,
                size_bytes = excluded.size_bytes,
                fetched_at = excluded.fetched_at,
                expires_at = excluded.expires_at,
                checksum = excluded.checksum",
            params![
                entry.url,
                entry.media_type,
                entry.file_path,
                entry.size_bytes,
                entry.fetched_at.to_rfc3339(),
                entry.expires_at.map(|t| t.to_rfc3339()),
                entry.checksum,
            ],
        )
        .context("storage: upsert media entry")?;
        let id = conn.query_row(
            "SELECT id FROM media_cache WHERE url = ?1",
            params![entry.url],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn total_media_size(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM media_cache",
            [],
            |row| row.get(0),
        )
        .context("storage: total media size")
    }

    pub fn list_oldest_media(&self, limit: usize) -> Result<Vec<MediaEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, url, media_type, file_path, size_bytes, fetched_at, expires_at, checksum
             FROM media_cache ORDER BY fetched_at ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], media_entry_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn delete_media_entries(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("DELETE FROM media_cache WHERE id IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        stmt.execute(rusqlite::params_from_iter(ids.iter()))
            .context("storage: delete media entries")?;
        Ok(())
    }
}

fn media_entry_from_row(row: &Row<'_>) -> rusqlite::Result<MediaEntry> {
    let fetched_at: String = row.get(5)?;
    let expires_at: Option<String> = row.get(6)?;
    Ok(MediaEntry {
        id: row.get(0)?,
        url: row.get(1)?,
        media_type: row.get(2)?,
        file_path: row.get(3)?,
        size_bytes: row.get(4)?,
        fetched_at: DateTime::parse_from_rfc3339(&fetched_at)
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now()),
        expires_at: expires_at
            .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
            .map(DateTime::<Utc>::from),
        checksum: row.get(7)?,
    })
}

fn default_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("vodchat").join("vodchat.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(Options {
            path: Some(dir.path().join("test.db")),
        })
        .unwrap();
        (dir, store)
    }

    fn entry(url: &str, size: i64, fetched_at: DateTime<Utc>) -> MediaEntry {
        MediaEntry {
            id: 0,
            url: url.into(),
            media_type: "image/webp".into(),
            file_path: format!("/tmp/{size}.bin"),
            size_bytes: size,
            fetched_at,
            expires_at: None,
            checksum: "abc".into(),
        }
    }

    #[test]
    fn chat_prefs_round_trip() {
        let (_dir, store) = open_temp();
        assert_eq!(store.load_chat_prefs().unwrap(), ChatPrefs::default());

        let prefs = ChatPrefs {
            user_delay_secs: -2.5,
            show_timestamp: true,
            alternate_bg: true,
        };
        store.save_chat_prefs(&prefs).unwrap();
        assert_eq!(store.load_chat_prefs().unwrap(), prefs);
    }

    #[test]
    fn media_entries_upsert_and_prune_queries() {
        let (_dir, store) = open_temp();
        let now = Utc::now();
        let old = now - chrono::Duration::hours(2);

        let id_a = store.upsert_media_entry(entry("https://a", 100, old)).unwrap();
        let id_b = store.upsert_media_entry(entry("https://b", 50, now)).unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(store.total_media_size().unwrap(), 150);

        // Upsert by URL replaces, it does not duplicate.
        let id_a2 = store.upsert_media_entry(entry("https://a", 120, now)).unwrap();
        assert_eq!(id_a, id_a2);
        assert_eq!(store.total_media_size().unwrap(), 170);

        let oldest = store.list_oldest_media(1).unwrap();
        assert_eq!(oldest.len(), 1);

        store.delete_media_entries(&[id_a]).unwrap();
        assert_eq!(store.total_media_size().unwrap(), 50);
        assert!(store.get_media_entry_by_url("https://a").unwrap().is_none());
        assert!(store.get_media_entry_by_url("https://b").unwrap().is_some());
    }
}
