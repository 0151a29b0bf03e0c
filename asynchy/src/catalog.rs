//! Persistent record of which EPNs still need transferring.

use crate::error::AsynchyResult;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// Direction in which items are taken by modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        })
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown order '{}', expected asc or desc", other)),
        }
    }
}

/// One transferable unit as stored in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub key: String,
    pub expected_size: u64,
    pub complete: bool,
    pub bytes_transferred: u64,
    pub modified_at: DateTime<Utc>,
}

impl Item {
    pub fn new(key: impl Into<String>, expected_size: u64, modified_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            expected_size,
            complete: false,
            bytes_transferred: 0,
            modified_at,
        }
    }
}

/// An incomplete item as the scheduler sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingItem {
    pub key: String,
    pub expected_size: u64,
}

/// The two catalog operations the scheduler depends on.
pub trait Catalog: Send + Sync {
    /// Incomplete items ordered by modification time, at most `limit` of them.
    fn list_incomplete(&self, order: SortOrder, limit: Option<usize>) -> AsynchyResult<Vec<PendingItem>>;

    /// Record a finished transfer. Calling it again with the same key is a
    /// harmless overwrite.
    fn mark_complete(&self, key: &str, bytes_transferred: u64) -> AsynchyResult<()>;
}

/// Catalog stored in a SQLite `epns` table.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    pub fn open(path: &Path) -> AsynchyResult<Self> {
        let conn = Connection::open(path)?;
        debug!("Opened catalog at {}", path.display());
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> AsynchyResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> AsynchyResult<Self> {
        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.init_schema()?;
        Ok(catalog)
    }

    /// Create the `epns` table if it does not exist yet.
    pub fn init_schema(&self) -> AsynchyResult<()> {
        self.conn.lock().execute_batch(
            "CREATE TABLE IF NOT EXISTS epns (
                epn TEXT PRIMARY KEY NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                complete INTEGER NOT NULL DEFAULT 0,
                bytesTransferred INTEGER NOT NULL DEFAULT 0,
                modified INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS epns_pending ON epns (complete, modified);",
        )?;
        Ok(())
    }

    /// Insert `item`, or refresh its size and timestamp if the key exists.
    /// Completion state of an existing row is left alone.
    pub fn upsert_item(&self, item: &Item) -> AsynchyResult<()> {
        self.conn.lock().execute(
            "INSERT INTO epns (epn, size, complete, bytesTransferred, modified)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(epn) DO UPDATE SET size = excluded.size, modified = excluded.modified",
            params![
                item.key,
                to_sql_u64(item.expected_size),
                item.complete,
                to_sql_u64(item.bytes_transferred),
                item.modified_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn get_item(&self, key: &str) -> AsynchyResult<Option<Item>> {
        let item = self
            .conn
            .lock()
            .query_row(
                "SELECT epn, size, complete, bytesTransferred, modified FROM epns WHERE epn = ?1",
                params![key],
                |row| {
                    Ok(Item {
                        key: row.get(0)?,
                        expected_size: from_sql_i64(row.get(1)?),
                        complete: row.get(2)?,
                        bytes_transferred: from_sql_i64(row.get(3)?),
                        modified_at: Utc
                            .timestamp_opt(row.get(4)?, 0)
                            .single()
                            .unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(item)
    }
}

impl Catalog for SqliteCatalog {
    fn list_incomplete(&self, order: SortOrder, limit: Option<usize>) -> AsynchyResult<Vec<PendingItem>> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX)).unwrap_or(-1);
        let sql = format!(
            "SELECT epn, size FROM epns WHERE complete = 0 ORDER BY modified {}, epn {} LIMIT ?1",
            order.as_sql(),
            order.as_sql()
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params![limit], |row| {
                Ok(PendingItem {
                    key: row.get(0)?,
                    expected_size: from_sql_i64(row.get(1)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn mark_complete(&self, key: &str, bytes_transferred: u64) -> AsynchyResult<()> {
        let updated = self.conn.lock().execute(
            "UPDATE epns SET complete = 1, bytesTransferred = ?1 WHERE epn = ?2",
            params![to_sql_u64(bytes_transferred), key],
        )?;
        if updated == 0 {
            debug!("No catalog row for {}; nothing marked complete", key);
        }
        Ok(())
    }
}

fn to_sql_u64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
