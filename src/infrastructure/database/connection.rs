//! Database connection and change tracking

use futures::stream::{self, BoxStream, StreamExt};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info};

use super::{schema, BeaconDao, DeviceDao, NotificationDao};
use crate::error::{StoreError, StoreResult};

/// Tables observed by streaming queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Device,
    Beacon,
    Notification,
}

impl Table {
    fn index(self) -> usize {
        match self {
            Table::Device => 0,
            Table::Beacon => 1,
            Table::Notification => 2,
        }
    }
}

/// Shared SQLite connection plus one version counter per table.
///
/// Writers bump the counter of every table they touched; streams created
/// with [`Database::observe`] re-run their query when the counter moves.
/// Bumps that happen while a stream is not being polled are coalesced.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    versions: Arc<[watch::Sender<u64>; 3]>,
}

impl Database {
    /// Open (or create) the database file at `path`
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        info!("Opened device database at {}", path.display());
        Self::from_connection(conn, path)
    }

    /// In-memory database, used by tests and simulated runs
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, PathBuf::from(":memory:"))
    }

    fn from_connection(conn: Connection, path: PathBuf) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        schema::create_tables(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
            versions: Arc::new(std::array::from_fn(|_| watch::channel(0u64).0)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn device_dao(&self) -> DeviceDao {
        DeviceDao::new(self.clone())
    }

    pub fn beacon_dao(&self) -> BeaconDao {
        BeaconDao::new(self.clone())
    }

    pub fn notification_dao(&self) -> NotificationDao {
        NotificationDao::new(self.clone())
    }

    /// Run `f` with exclusive access to the connection
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&conn)
    }

    /// Mark tables as modified, waking their observers
    pub(crate) fn notify(&self, tables: &[Table]) {
        for table in tables {
            self.versions[table.index()].send_modify(|v| *v = v.wrapping_add(1));
        }
        debug!(?tables, "Invalidated observers");
    }

    /// Stream of `query` results: the current result first, then a fresh one
    /// after each write to `table`.
    pub(crate) fn observe<T, F>(&self, table: Table, query: F) -> BoxStream<'static, StoreResult<T>>
    where
        T: Send + 'static,
        F: Fn(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let rx = self.versions[table.index()].subscribe();
        let db = self.clone();

        stream::unfold(
            (db, rx, query, true),
            |(db, mut rx, query, first)| async move {
                if !first && rx.changed().await.is_err() {
                    return None;
                }
                let item = db.with_conn(|conn| query(conn));
                Some((item, (db, rx, query, false)))
            },
        )
        .boxed()
    }
}
