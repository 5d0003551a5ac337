use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

use crate::logging::ts_epoch_ms;

/// Recovery checkpoint for the ingestion layer: the last accepted bar
/// timestamp per instrument.
pub trait CheckpointStore: Send {
    fn load(&mut self, instrument: &str) -> Result<Option<i64>>;
    fn save(&mut self, instrument: &str, last_ts: i64) -> Result<()>;
    fn clear(&mut self, instrument: &str) -> Result<()>;
    fn exists(&mut self, instrument: &str) -> bool;
}

pub struct SqliteCheckpoint {
    conn: Connection,
}

impl SqliteCheckpoint {
    pub fn open(path: &str) -> Result<Self> {
        let mut store = Self { conn: Connection::open(path)? };
        store.init()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let mut store = Self { conn: Connection::open_in_memory()? };
        store.init()?;
        Ok(store)
    }

    fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS candle_checkpoint (
                instrument TEXT PRIMARY KEY,
                last_ts INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }
}

impl CheckpointStore for SqliteCheckpoint {
    fn load(&mut self, instrument: &str) -> Result<Option<i64>> {
        let ts = self
            .conn
            .query_row(
                "SELECT last_ts FROM candle_checkpoint WHERE instrument = ?1",
                params![instrument],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(ts)
    }

    fn save(&mut self, instrument: &str, last_ts: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO candle_checkpoint (instrument, last_ts, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(instrument) DO UPDATE SET last_ts = excluded.last_ts, updated_at = excluded.updated_at",
            params![instrument, last_ts, ts_epoch_ms()],
        )?;
        Ok(())
    }

    fn clear(&mut self, instrument: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM candle_checkpoint WHERE instrument = ?1",
            params![instrument],
        )?;
        Ok(())
    }

    fn exists(&mut self, instrument: &str) -> bool {
        matches!(self.load(instrument), Ok(Some(_)))
    }
}

/// Store that remembers nothing. Used by tests and one-shot replays.
#[derive(Debug, Default)]
pub struct NullCheckpoint;

impl CheckpointStore for NullCheckpoint {
    fn load(&mut self, _instrument: &str) -> Result<Option<i64>> {
        Ok(None)
    }

    fn save(&mut self, _instrument: &str, _last_ts: i64) -> Result<()> {
        Ok(())
    }

    fn clear(&mut self, _instrument: &str) -> Result<()> {
        Ok(())
    }

    fn exists(&mut self, _instrument: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_checkpoint_upsert() {
        let mut store = SqliteCheckpoint::in_memory().unwrap();
        assert_eq!(store.load("NQ").unwrap(), None);
        store.save("NQ", 1_000).unwrap();
        store.save("NQ", 2_000).unwrap();
        assert_eq!(store.load("NQ").unwrap(), Some(2_000));
        assert!(store.exists("NQ"));
    }

    #[test]
    fn test_sqlite_checkpoint_scoped_by_instrument() {
        let mut store = SqliteCheckpoint::in_memory().unwrap();
        store.save("NQ", 1_000).unwrap();
        store.save("ES", 5_000).unwrap();
        store.clear("NQ").unwrap();
        assert_eq!(store.load("NQ").unwrap(), None);
        assert_eq!(store.load("ES").unwrap(), Some(5_000));
    }

    #[test]
    fn test_null_checkpoint() {
        let mut store = NullCheckpoint;
        store.save("NQ", 1).unwrap();
        assert_eq!(store.load("NQ").unwrap(), None);
        assert!(!store.exists("NQ"));
    }
}
