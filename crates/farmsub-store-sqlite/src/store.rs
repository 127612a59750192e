use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use farmsub_core::now_ms;
use farmsub_core::BucketId;
use farmsub_services::{Blob, ServiceError, ServiceResult, SharedStore};

/// Durable [`SharedStore`] over a single SQLite file.
///
/// One row per `(bucket, key)`; blobs are stored as JSON text. Several
/// worker processes may point at the same file, so the connection runs in
/// WAL mode with a busy timeout.
pub struct SqliteSharedStore {
    conn: Mutex<Connection>,
}

impl SqliteSharedStore {
    /// Opens (creating if needed) the store at `db_path`.
    pub fn open(db_path: &Path) -> ServiceResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)
            .map_err(|e| ServiceError::Store(format!("open {}: {e}", db_path.display())))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(store_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(store_err)?;

        let init_sql = include_str!("../migrations/0001_init.sql");
        conn.execute_batch(init_sql).map_err(store_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl SharedStore for SqliteSharedStore {
    fn get(&self, bucket: &BucketId, key: &str) -> ServiceResult<Option<Blob>> {
        let conn = self.conn.lock().unwrap();
        let text: Option<String> = conn
            .query_row(
                "SELECT blob FROM store WHERE bucket = ?1 AND key = ?2",
                params![bucket.as_str(), key],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        match text {
            None => Ok(None),
            Some(text) => {
                let blob: Blob = serde_json::from_str(&text).map_err(|e| {
                    ServiceError::Store(format!("decode {}/{key}: {e}", bucket.as_str()))
                })?;
                Ok(Some(blob))
            }
        }
    }

    fn put(&self, bucket: &BucketId, key: &str, blob: &Blob) -> ServiceResult<()> {
        let text = serde_json::to_string(blob)
            .map_err(|e| ServiceError::Store(format!("encode {}/{key}: {e}", bucket.as_str())))?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO store (bucket, key, blob, updated_at_ms) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(bucket, key) DO UPDATE SET
                 blob = excluded.blob,
                 updated_at_ms = excluded.updated_at_ms",
            params![bucket.as_str(), key, text, now_ms()],
        )
        .map_err(store_err)?;
        Ok(())
    }
}

fn store_err(e: rusqlite::Error) -> ServiceError {
    ServiceError::Store(e.to_string())
}
