//! SQLite database for Peergate state persistence

use crate::Result;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Expose the underlying connection for subsystems that run their own queries
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path.as_ref())?;

        // WAL lets the CLI and the daemon share the file
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    ///
    /// The partial unique indexes on `peers` are what enforce the active-peer
    /// invariants; revoked rows are excluded from all three. `confirmed_at`
    /// is set once a node apply of the row succeeded.
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- Devices: one canonical row per (user, platform)
            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_user_platform
                ON devices(user_id, platform);

            -- Nodes: upserted from deployment configuration
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                ssh_host TEXT NOT NULL,
                ssh_user TEXT NOT NULL,
                wg_interface TEXT NOT NULL,
                server_public_key TEXT NOT NULL,
                endpoint_host TEXT NOT NULL,
                wg_port INTEGER NOT NULL,
                pool_start TEXT NOT NULL,
                pool_end TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Peers: soft-revoked, never deleted
            CREATE TABLE IF NOT EXISTS peers (
                id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL REFERENCES nodes(id),
                device_id TEXT NOT NULL REFERENCES devices(id),
                user_id TEXT NOT NULL,
                public_key TEXT NOT NULL,
                allowed_ip TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                confirmed_at INTEGER,
                revoked_at INTEGER
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_peers_active_device
                ON peers(device_id, node_id) WHERE revoked_at IS NULL;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_peers_active_ip
                ON peers(node_id, allowed_ip) WHERE revoked_at IS NULL;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_peers_active_key
                ON peers(node_id, public_key) WHERE revoked_at IS NULL;
            CREATE INDEX IF NOT EXISTS idx_peers_user ON peers(user_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }
}

/// Current time as unix seconds
pub fn now_epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_file_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");

        {
            let db = Database::open(&path).unwrap();
            let conn = db.connection();
            let conn = conn.lock();
            conn.execute(
                "INSERT INTO devices (id, user_id, platform, name, created_at) VALUES ('d1', 'u1', 'ios', 'iphone', 0)",
                [],
            )
            .unwrap();
        }

        // Schema creation is idempotent and data survives
        let db = Database::open(&path).unwrap();
        let conn = db.connection();
        let conn = conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_device_uniqueness_enforced() {
        let db = Database::open_memory().unwrap();
        let conn = db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO devices (id, user_id, platform, name, created_at) VALUES ('d1', 'u1', 'ios', 'a', 0)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO devices (id, user_id, platform, name, created_at) VALUES ('d2', 'u1', 'ios', 'b', 0)",
            [],
        );
        assert!(dup.is_err());
    }
}
