use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use thiserror::Error;

use crate::models::Subscriber;
use crate::utils;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store connection poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Catalog {
    Venues,
    Tags,
}

impl Catalog {
    fn table(self) -> &'static str {
        match self {
            Catalog::Venues => "venues",
            Catalog::Tags => "tags",
        }
    }
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open_default() -> Result<Self, StoreError> {
        Self::open(&utils::database_path())
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        utils::ensure_parent(path);
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn ping(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    pub fn insert_subscriber(&self, subscriber: &Subscriber) -> Result<(), StoreError> {
        let venues = serde_json::to_string(&subscriber.venues)?;
        let genres = serde_json::to_string(&subscriber.genres)?;
        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO subscribers (email, subscribed_at_utc, venues, genres)
             VALUES (?1, ?2, ?3, ?4)",
            params![subscriber.email, subscriber.subscribed_at, venues, genres],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateKey(subscriber.email.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Every readable subscriber. A row that fails to decode is logged and
    /// left out so the rest of the list is still usable.
    pub fn find_subscribers(&self) -> Result<Vec<Subscriber>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT email, subscribed_at_utc, venues, genres FROM subscribers ORDER BY subscribed_at_utc, email",
        )?;
        let mut rows = stmt.query([])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            match subscriber_from_row(row) {
                Ok(subscriber) => out.push(subscriber),
                Err(err) => {
                    let email = row.get::<_, String>(0).unwrap_or_default();
                    tracing::warn!(email = %email, "skipping unreadable subscriber row: {err}");
                }
            }
        }
        Ok(out)
    }

    pub fn find_subscriber(&self, email: &str) -> Result<Option<Subscriber>, StoreError> {
        let conn = self.conn()?;
        let subscriber = conn
            .query_row(
                "SELECT email, subscribed_at_utc, venues, genres FROM subscribers WHERE email = ?1",
                params![email.trim()],
                subscriber_from_row,
            )
            .optional()?;
        Ok(subscriber)
    }

    pub fn delete_subscriber(&self, email: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM subscribers WHERE email = ?1",
            params![email.trim()],
        )?;
        Ok(removed > 0)
    }

    /// Insert-if-absent for each name, refreshing `last_seen_utc` when present.
    /// All names of one call land in a single transaction.
    pub fn upsert_catalog_entries<'a, I>(&self, catalog: Catalog, names: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let now = Utc::now();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut written = 0;
        {
            let sql = format!(
                "INSERT INTO {table} (name, first_seen_utc, last_seen_utc)
                 VALUES (?1, ?2, ?2)
                 ON CONFLICT(name) DO UPDATE SET last_seen_utc = excluded.last_seen_utc",
                table = catalog.table()
            );
            let mut stmt = tx.prepare(&sql)?;
            for name in names {
                stmt.execute(params![name, now])?;
                written += 1;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn list_catalog(&self, catalog: Catalog) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let sql = format!("SELECT name FROM {} ORDER BY name", catalog.table());
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn load_cache_payload(&self, feed_key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        let payload = conn
            .query_row(
                "SELECT payload FROM feed_cache WHERE feed_key = ?1",
                params![feed_key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(payload)
    }

    pub fn save_cache_payload(&self, feed_key: &str, payload: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO feed_cache (feed_key, payload, stored_at_utc)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(feed_key) DO UPDATE SET
               payload = excluded.payload,
               stored_at_utc = excluded.stored_at_utc",
            params![feed_key, payload, Utc::now()],
        )?;
        Ok(())
    }

    pub fn delete_cache_payload(&self, feed_key: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM feed_cache WHERE feed_key = ?1",
            params![feed_key],
        )?;
        Ok(())
    }
}

#[cfg(test)]
impl Store {
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<(), StoreError> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS subscribers(
            email TEXT PRIMARY KEY,
            subscribed_at_utc TEXT NOT NULL,
            venues TEXT NOT NULL,
            genres TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS venues(
            name TEXT PRIMARY KEY,
            first_seen_utc TEXT NOT NULL,
            last_seen_utc TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS tags(
            name TEXT PRIMARY KEY,
            first_seen_utc TEXT NOT NULL,
            last_seen_utc TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS feed_cache(
            feed_key TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            stored_at_utc TEXT NOT NULL
        );",
    )
}

fn subscriber_from_row(row: &Row<'_>) -> rusqlite::Result<Subscriber> {
    let email: String = row.get(0)?;
    let subscribed_at: DateTime<Utc> = row.get(1)?;
    let venues = json_set(row, 2)?;
    let genres = json_set(row, 3)?;
    Ok(Subscriber {
        email,
        subscribed_at,
        venues,
        genres,
    })
}

fn json_set(row: &Row<'_>, idx: usize) -> rusqlite::Result<BTreeSet<String>> {
    let payload: String = row.get(idx)?;
    serde_json::from_str(&payload).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    })
}
