use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, TransactionBehavior};
use tracing::info;

use crate::error::StoreError;
use crate::schema::{self, SCHEMA_VERSION};

/// Shared handle to the switchyard database. Clones share one connection;
/// the lock is never held across an `.await`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| StoreError::Io(format!("create {}: {e}", dir.display())))?;
        }
        let db = Self::init(Connection::open(path)?, path.to_owned())?;
        info!(path = %path.display(), version = SCHEMA_VERSION, "database ready");
        Ok(db)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Run `f` with exclusive use of the connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        f(&self.conn.lock())
    }

    /// Run `f` inside one immediate transaction. Any error rolls every
    /// write in `f` back; readers see either the old or the new state.
    pub fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// `SELECT 1`, for the health route.
    pub fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| Ok(conn.query_row("SELECT 1", [], |_| Ok(()))?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Idempotent: a second open of the same file only re-checks the version.
/// Files stamped with an older version run the pending `MIGRATIONS`.
fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let step = |what: &'static str| move |e: rusqlite::Error| StoreError::Database(format!("{what}: {e}"));

    conn.execute_batch(schema::PRAGMAS).map_err(step("pragmas"))?;
    conn.execute_batch(schema::CREATE_TABLES).map_err(step("create tables"))?;

    let stamped: Option<u32> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .map_err(step("read schema version"))?;
    match stamped {
        Some(found) if found > SCHEMA_VERSION => Err(StoreError::Database(format!(
            "schema version {found} was written by a newer switchyard (this build knows {SCHEMA_VERSION})"
        ))),
        Some(found) if found < SCHEMA_VERSION => upgrade(conn, found),
        Some(_) => Ok(()),
        None => conn
            .execute("INSERT INTO schema_version (version) VALUES (?1)", [SCHEMA_VERSION])
            .map(drop)
            .map_err(step("stamp schema version")),
    }
}

fn upgrade(conn: &Connection, from: u32) -> Result<(), StoreError> {
    for &(version, sql) in schema::MIGRATIONS.iter().filter(|(v, _)| *v > from) {
        conn.execute_batch(sql)
            .map_err(|e| StoreError::Database(format!("migrate to {version}: {e}")))?;
        info!(from, to = version, "schema migrated");
    }
    conn.execute("UPDATE schema_version SET version = ?1", [SCHEMA_VERSION])?;
    Ok(())
}
