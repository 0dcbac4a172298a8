//! SQLite-backed reservation ledger engine.
//!
//! Uses WAL journaling and a single connection guarded by a mutex, which
//! serializes all ledger operations. Atomicity of the reserve step is
//! enforced twice over: the mutex serializes callers, and the UPDATE that
//! claims an item re-checks `status = 'available'` so a row can never be
//! reserved out from under a concurrent claimant.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::{Address, AssetName, CatalogItem, Collection, IssuanceRecord, ItemStatus, Payment, TxHash};

use super::{Ledger, LedgerError, Result, SeedItem};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS items (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  collection TEXT NOT NULL,
  asset_name TEXT NOT NULL,
  image TEXT NOT NULL,
  media_type TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'available',
  reserved_at INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_items_unique
  ON items(collection, asset_name);

CREATE TABLE IF NOT EXISTS payments (
  tx_hash TEXT PRIMARY KEY,
  payer_address TEXT NOT NULL,
  amount_lovelace INTEGER NOT NULL,
  processed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS issuances (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  tx_hash TEXT NOT NULL,
  payer_address TEXT NOT NULL,
  first_asset TEXT NOT NULL,
  second_asset TEXT NOT NULL,
  created_at INTEGER NOT NULL
);
";

/// SQLite-backed reservation ledger.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Opens (or creates) the database at `path` and ensures the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteLedger {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteLedger {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| LedgerError::LockPoisoned)
    }

    /// Reservation with an explicit timestamp, used by [`Ledger::pick_random_available`]
    /// and directly by tests that need time control.
    pub fn pick_random_available_at(
        &self,
        collection: &Collection,
        now: DateTime<Utc>,
    ) -> Result<Option<CatalogItem>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let picked: Option<(String, String, String)> = tx
            .query_row(
                "SELECT asset_name, image, media_type FROM items
                 WHERE collection = ?1 AND status = 'available'
                 ORDER BY RANDOM() LIMIT 1",
                params![collection.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((name, image, media_type)) = picked else {
            return Ok(None);
        };

        let claimed = tx.execute(
            "UPDATE items SET status = 'reserved', reserved_at = ?3
             WHERE collection = ?1 AND asset_name = ?2 AND status = 'available'",
            params![collection.as_str(), name, now.timestamp()],
        )?;
        if claimed != 1 {
            // The row vanished between SELECT and UPDATE; inside one
            // transaction that means corruption, not a race.
            return Err(LedgerError::Corrupt(format!(
                "failed to claim selected item {}/{}",
                collection, name
            )));
        }
        tx.commit()?;

        Ok(Some(CatalogItem {
            collection: collection.clone(),
            name: AssetName::new(name),
            image,
            media_type,
            status: ItemStatus::Reserved,
            reserved_at: Utc.timestamp_opt(now.timestamp(), 0).single(),
        }))
    }

    /// Expiry sweep with an explicit `now`, used by [`Ledger::expire_stale`]
    /// and directly by tests that need time control.
    pub fn expire_stale_at(&self, ttl: Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now.timestamp() - ttl.as_secs() as i64;
        let conn = self.lock()?;
        let freed = conn.execute(
            "UPDATE items SET status = 'available', reserved_at = NULL
             WHERE status = 'reserved' AND reserved_at < ?1",
            params![cutoff],
        )?;
        Ok(freed)
    }

    #[cfg(test)]
    fn issuance_count(&self) -> usize {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM issuances", [], |row| row.get::<_, i64>(0))
            .unwrap() as usize
    }
}

impl Ledger for SqliteLedger {
    fn seed_catalog(&self, collection: &Collection, items: &[SeedItem]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO items (collection, asset_name, image, media_type)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for item in items {
                inserted += stmt.execute(params![
                    collection.as_str(),
                    item.name.as_str(),
                    item.image,
                    item.media_type,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn pick_random_available(&self, collection: &Collection) -> Result<Option<CatalogItem>> {
        self.pick_random_available_at(collection, Utc::now())
    }

    fn release_reservation(&self, collection: &Collection, name: &AssetName) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE items SET status = 'available', reserved_at = NULL
             WHERE collection = ?1 AND asset_name = ?2 AND status = 'reserved'",
            params![collection.as_str(), name.as_str()],
        )?;
        Ok(())
    }

    fn mark_issued(&self, collection: &Collection, name: &AssetName) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE items SET status = 'issued', reserved_at = NULL
             WHERE collection = ?1 AND asset_name = ?2",
            params![collection.as_str(), name.as_str()],
        )?;
        Ok(())
    }

    fn expire_stale(&self, ttl: Duration) -> Result<usize> {
        self.expire_stale_at(ttl, Utc::now())
    }

    fn save_payment(&self, hash: &TxHash, payer: &Address, amount: u64) -> Result<bool> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO payments (tx_hash, payer_address, amount_lovelace)
             VALUES (?1, ?2, ?3)",
            params![hash.as_str(), payer.as_str(), amount as i64],
        )?;
        Ok(inserted > 0)
    }

    fn next_unprocessed_payment(&self, min_amount: u64) -> Result<Option<Payment>> {
        let conn = self.lock()?;
        let payment = conn
            .query_row(
                "SELECT tx_hash, payer_address, amount_lovelace, processed FROM payments
                 WHERE processed = 0 AND amount_lovelace >= ?1
                 ORDER BY rowid ASC LIMIT 1",
                params![min_amount as i64],
                |row| {
                    Ok(Payment {
                        tx_hash: TxHash::new(row.get::<_, String>(0)?),
                        payer: Address::new(row.get::<_, String>(1)?),
                        amount: row.get::<_, i64>(2)? as u64,
                        processed: row.get::<_, i64>(3)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(payment)
    }

    fn mark_payment_processed(&self, hash: &TxHash) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE payments SET processed = 1 WHERE tx_hash = ?1",
            params![hash.as_str()],
        )?;
        Ok(())
    }

    fn record_issuance(&self, record: &IssuanceRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO issuances (tx_hash, payer_address, first_asset, second_asset, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.tx_hash.as_str(),
                record.payer.as_str(),
                record.first_asset.as_str(),
                record.second_asset.as_str(),
                record.created_at.timestamp(),
            ],
        )?;
        Ok(())
    }
}
