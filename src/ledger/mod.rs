//! Reservation ledger: the source of truth for item lifecycle, payments, and
//! issuances.
//!
//! The ledger owns three data sets:
//! - **Catalog items** with lifecycle `available → reserved → {issued | available}`
//! - **Payments** keyed by transaction hash (the dedup/idempotency boundary)
//! - **Issuance records**, append-only
//!
//! Two interchangeable engines implement the same contract:
//! - [`sqlite::SqliteLedger`]: rusqlite with WAL journaling
//! - [`store::LogLedger`]: append-only JSON Lines event log with crash-safe
//!   replay
//!
//! All mutating operations are atomic with respect to concurrent callers; in
//! particular no two concurrent [`Ledger::pick_random_available`] calls can
//! return the same item. A crash mid-operation can at worst leave an item
//! `reserved`, which [`Ledger::expire_stale`] recovers after the TTL.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::types::{Address, AssetName, CatalogItem, Collection, IssuanceRecord, Payment, TxHash};

pub mod sqlite;
pub mod store;

pub use sqlite::SqliteLedger;
pub use store::LogLedger;

/// Errors raised by ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// IO error from the event-log engine.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error from the event-log engine.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error from the SQLite engine.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A lock guarding shared state was poisoned by a panicking thread.
    #[error("ledger lock poisoned")]
    LockPoisoned,

    /// The on-disk log contains an entry that cannot be applied.
    #[error("corrupt ledger log: {0}")]
    Corrupt(String),
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// One row of catalog seed data: the immutable identity and content fields of
/// an item, without lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedItem {
    pub name: AssetName,
    /// Content reference (bare CID or URI).
    pub image: String,
    pub media_type: String,
}

/// The reservation ledger contract.
///
/// Engines take `&self` and serialize internally, so a single instance can be
/// shared behind an `Arc` by the scanner and the coordinator.
pub trait Ledger: Send + Sync {
    /// Idempotent bulk insert of catalog items. Existing (collection, name)
    /// pairs are left untouched. Returns the number of newly inserted items.
    fn seed_catalog(&self, collection: &Collection, items: &[SeedItem]) -> Result<usize>;

    /// Atomically selects one `available` item uniformly at random from the
    /// collection and transitions it to `reserved` with a fresh timestamp.
    ///
    /// Returns `None` when the collection is exhausted.
    fn pick_random_available(&self, collection: &Collection) -> Result<Option<CatalogItem>>;

    /// Transitions a `reserved` item back to `available`, clearing the
    /// timestamp. No-op if the item is already `available` or `issued`, or
    /// does not exist.
    fn release_reservation(&self, collection: &Collection, name: &AssetName) -> Result<()>;

    /// Transitions an item to `issued`. Idempotent: re-marking an
    /// already-issued item is a no-op, never an error.
    fn mark_issued(&self, collection: &Collection, name: &AssetName) -> Result<()>;

    /// Returns every `reserved` item older than `ttl` to `available` and
    /// reports how many were freed. Items reserved after the sweep's cutoff
    /// are untouched.
    fn expire_stale(&self, ttl: Duration) -> Result<usize>;

    /// Insert-if-absent payment capture. A duplicate hash is a silent no-op;
    /// the return value reports whether the payment was newly inserted.
    ///
    /// This is the system's sole duplicate-payment defense.
    fn save_payment(&self, hash: &TxHash, payer: &Address, amount: u64) -> Result<bool>;

    /// Returns the oldest payment with `processed == false` and
    /// `amount >= min_amount`, or `None`.
    fn next_unprocessed_payment(&self, min_amount: u64) -> Result<Option<Payment>>;

    /// Idempotent transition of a payment to `processed`.
    fn mark_payment_processed(&self, hash: &TxHash) -> Result<()>;

    /// Append-only insert of a successful issuance.
    fn record_issuance(&self, record: &IssuanceRecord) -> Result<()>;
}
