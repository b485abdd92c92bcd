use std::path::Path;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rusqlite::{Connection, OptionalExtension};
use smtr_core::RunEnv;
use tracing::info;

use crate::error::Result;

/// Initialise the materialization state schema in `conn`.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS materializations (
            env         TEXT NOT NULL,
            selector    TEXT NOT NULL,
            last_end    TEXT NOT NULL,   -- RFC 3339, platform offset
            updated_at  TEXT NOT NULL,
            PRIMARY KEY (env, selector)
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Last successfully materialized instant per environment and selector.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self { conn })
    }

    pub fn last_materialized(&self, env: RunEnv, selector: &str) -> Result<Option<DateTime<Tz>>> {
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT last_end FROM materializations WHERE env = ?1 AND selector = ?2",
                rusqlite::params![env.as_str(), selector],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stored
            .map(|value| smtr_core::parse_timestamp(&value))
            .transpose()?)
    }

    /// Store `end` as the selector's last materialized instant.
    pub fn record_success(&self, env: RunEnv, selector: &str, end: &DateTime<Tz>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO materializations (env, selector, last_end, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (env, selector)
             DO UPDATE SET last_end = excluded.last_end, updated_at = excluded.updated_at",
            rusqlite::params![
                env.as_str(),
                selector,
                end.to_rfc3339(),
                Utc::now().to_rfc3339()
            ],
        )?;
        info!(%env, selector, last_end = %smtr_core::format_timestamp(end), "materialization state updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smtr_core::parse_timestamp;

    #[test]
    fn unknown_selector_has_no_state() {
        let store = StateStore::in_memory().unwrap();
        assert!(store.last_materialized(RunEnv::Dev, "cadastro").unwrap().is_none());
    }

    #[test]
    fn success_is_upserted_per_env() {
        let store = StateStore::in_memory().unwrap();
        let first = parse_timestamp("2025-04-01 10:00").unwrap();
        let second = parse_timestamp("2025-04-01 11:00").unwrap();

        store.record_success(RunEnv::Dev, "cadastro", &first).unwrap();
        store.record_success(RunEnv::Dev, "cadastro", &second).unwrap();

        assert_eq!(store.last_materialized(RunEnv::Dev, "cadastro").unwrap(), Some(second));
        assert!(store.last_materialized(RunEnv::Prod, "cadastro").unwrap().is_none());
    }

    #[test]
    fn state_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.db");
        let end = parse_timestamp("2025-04-01 10:00").unwrap();

        StateStore::open(&path)
            .unwrap()
            .record_success(RunEnv::Prod, "gps_validador", &end)
            .unwrap();

        let reopened = StateStore::open(&path).unwrap();
        assert_eq!(
            reopened.last_materialized(RunEnv::Prod, "gps_validador").unwrap(),
            Some(end)
        );
    }
}
