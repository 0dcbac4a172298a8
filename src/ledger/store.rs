//! Append-only event-log ledger engine with crash-safe replay.
//!
//! The whole ledger state is small (a few thousand items, one payment row per
//! sale), so rather than a snapshot/compaction scheme the engine keeps a
//! single JSON Lines log and replays it from the start on open:
//! - Complete lines are always valid JSON
//! - A partial trailing line (crash mid-write) is detected and truncated
//! - Sequence numbers must be monotonic; a non-monotonic entry is treated as
//!   corruption and the log is truncated at that point
//!
//! # fsync Strategy
//!
//! Single lifecycle transitions and payment captures are fsynced immediately.
//! Bulk operations (catalog seeding, expiry sweeps) batch their entries and
//! sync once at the end.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::{Address, AssetName, CatalogItem, Collection, IssuanceRecord, ItemStatus, Payment, TxHash};

use super::{Ledger, LedgerError, Result, SeedItem};

/// A single ledger mutation, as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LedgerEvent {
    ItemSeeded {
        collection: Collection,
        name: AssetName,
        image: String,
        media_type: String,
    },
    ItemReserved {
        collection: Collection,
        name: AssetName,
        at: DateTime<Utc>,
    },
    ItemReleased {
        collection: Collection,
        name: AssetName,
    },
    ItemIssued {
        collection: Collection,
        name: AssetName,
    },
    PaymentSaved {
        tx_hash: TxHash,
        payer: Address,
        amount: u64,
    },
    PaymentProcessed {
        tx_hash: TxHash,
    },
    IssuanceRecorded {
        tx_hash: TxHash,
        payer: Address,
        first_asset: AssetName,
        second_asset: AssetName,
        created_at: DateTime<Utc>,
    },
}

/// On-disk envelope: sequence number, wall-clock timestamp, payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogEntry {
    seq: u64,
    ts: DateTime<Utc>,
    #[serde(flatten)]
    event: LedgerEvent,
}

/// In-memory state materialized from the log.
#[derive(Debug, Clone, Default, PartialEq)]
struct State {
    items: BTreeMap<(Collection, AssetName), CatalogItem>,
    /// Payments in insertion order (oldest first).
    payments: Vec<Payment>,
    payment_index: HashMap<TxHash, usize>,
    issuances: Vec<IssuanceRecord>,
}

impl State {
    /// Applies one event. Transitions that don't apply to the current state
    /// (e.g. releasing an issued item) are no-ops, mirroring the ledger
    /// contract's idempotency rules.
    fn apply(&mut self, event: &LedgerEvent) {
        match event {
            LedgerEvent::ItemSeeded {
                collection,
                name,
                image,
                media_type,
            } => {
                self.items
                    .entry((collection.clone(), name.clone()))
                    .or_insert_with(|| CatalogItem {
                        collection: collection.clone(),
                        name: name.clone(),
                        image: image.clone(),
                        media_type: media_type.clone(),
                        status: ItemStatus::Available,
                        reserved_at: None,
                    });
            }
            LedgerEvent::ItemReserved {
                collection,
                name,
                at,
            } => {
                if let Some(item) = self.items.get_mut(&(collection.clone(), name.clone())) {
                    if item.status == ItemStatus::Available {
                        item.status = ItemStatus::Reserved;
                        item.reserved_at = Some(*at);
                    }
                }
            }
            LedgerEvent::ItemReleased { collection, name } => {
                if let Some(item) = self.items.get_mut(&(collection.clone(), name.clone())) {
                    if item.status == ItemStatus::Reserved {
                        item.status = ItemStatus::Available;
                        item.reserved_at = None;
                    }
                }
            }
            LedgerEvent::ItemIssued { collection, name } => {
                if let Some(item) = self.items.get_mut(&(collection.clone(), name.clone())) {
                    item.status = ItemStatus::Issued;
                    item.reserved_at = None;
                }
            }
            LedgerEvent::PaymentSaved {
                tx_hash,
                payer,
                amount,
            } => {
                if !self.payment_index.contains_key(tx_hash) {
                    self.payment_index.insert(tx_hash.clone(), self.payments.len());
                    self.payments.push(Payment {
                        tx_hash: tx_hash.clone(),
                        payer: payer.clone(),
                        amount: *amount,
                        processed: false,
                    });
                }
            }
            LedgerEvent::PaymentProcessed { tx_hash } => {
                if let Some(&idx) = self.payment_index.get(tx_hash) {
                    self.payments[idx].processed = true;
                }
            }
            LedgerEvent::IssuanceRecorded {
                tx_hash,
                payer,
                first_asset,
                second_asset,
                created_at,
            } => {
                self.issuances.push(IssuanceRecord {
                    tx_hash: tx_hash.clone(),
                    payer: payer.clone(),
                    first_asset: first_asset.clone(),
                    second_asset: second_asset.clone(),
                    created_at: *created_at,
                });
            }
        }
    }
}

struct Inner {
    file: File,
    state: State,
    next_seq: u64,
}

/// Event-log backed reservation ledger.
pub struct LogLedger {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl LogLedger {
    /// Opens the log at `path` (creating it if absent), replays it into
    /// memory, and truncates any partial trailing line left by a crash.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (state, next_seq) = Self::replay(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        Ok(LogLedger {
            path,
            inner: Mutex::new(Inner {
                file,
                state,
                next_seq,
            }),
        })
    }

    /// Returns the path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replays the log, truncating at the first partial or non-monotonic
    /// entry. Returns the materialized state and the next sequence number.
    fn replay(path: &Path) -> Result<(State, u64)> {
        if !path.exists() {
            return Ok((State::default(), 0));
        }

        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut state = State::default();
        let mut max_seq: Option<u64> = None;
        let mut valid_pos: u64 = 0;
        let mut current_pos: u64 = 0;

        loop {
            let mut line = String::new();
            let bytes_read = reader.read_line(&mut line)?;
            if bytes_read == 0 {
                break;
            }
            current_pos += bytes_read as u64;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                valid_pos = current_pos;
                continue;
            }

            match serde_json::from_str::<LogEntry>(trimmed) {
                Ok(entry) => {
                    if max_seq.is_some_and(|prev| entry.seq <= prev) {
                        // Non-monotonic sequence: corruption. Truncate here.
                        break;
                    }
                    max_seq = Some(entry.seq);
                    state.apply(&entry.event);
                    valid_pos = current_pos;
                }
                Err(_) => {
                    // Partial line from a crash mid-write. Truncate here.
                    break;
                }
            }
        }

        if valid_pos < file_len {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_pos)?;
            file.sync_all()?;
        }

        let next_seq = max_seq.map(|s| s + 1).unwrap_or(0);
        Ok((state, next_seq))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| LedgerError::LockPoisoned)
    }

    /// Appends one event and applies it to the in-memory state.
    ///
    /// The state is only mutated after the entry is durably on its way to
    /// disk, so a write failure never leaves memory ahead of the log.
    fn append(inner: &mut Inner, event: LedgerEvent, sync: bool) -> Result<()> {
        let entry = LogEntry {
            seq: inner.next_seq,
            ts: Utc::now(),
            event,
        };
        let json = serde_json::to_string(&entry)?;
        writeln!(inner.file, "{}", json)?;
        if sync {
            inner.file.sync_all()?;
        }
        inner.next_seq += 1;
        inner.state.apply(&entry.event);
        Ok(())
    }

    /// Reservation with an explicit timestamp, used by [`Ledger::pick_random_available`]
    /// and directly by tests that need time control.
    pub fn pick_random_available_at(
        &self,
        collection: &Collection,
        now: DateTime<Utc>,
    ) -> Result<Option<CatalogItem>> {
        let mut inner = self.lock()?;

        let available: Vec<AssetName> = inner
            .state
            .items
            .iter()
            .filter(|((c, _), item)| c == collection && item.status == ItemStatus::Available)
            .map(|((_, name), _)| name.clone())
            .collect();

        if available.is_empty() {
            return Ok(None);
        }

        let name = available[rand::thread_rng().gen_range(0..available.len())].clone();
        Self::append(
            &mut inner,
            LedgerEvent::ItemReserved {
                collection: collection.clone(),
                name: name.clone(),
                at: now,
            },
            true,
        )?;

        Ok(inner
            .state
            .items
            .get(&(collection.clone(), name))
            .cloned())
    }

    /// Expiry sweep with an explicit `now`, used by [`Ledger::expire_stale`]
    /// and directly by tests that need time control.
    pub fn expire_stale_at(&self, ttl: Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now
            - chrono::Duration::from_std(ttl)
                .map_err(|e| LedgerError::Corrupt(format!("TTL out of range: {}", e)))?;

        let mut inner = self.lock()?;

        let stale: Vec<(Collection, AssetName)> = inner
            .state
            .items
            .values()
            .filter(|item| {
                item.status == ItemStatus::Reserved
                    && item.reserved_at.is_some_and(|at| at < cutoff)
            })
            .map(|item| (item.collection.clone(), item.name.clone()))
            .collect();

        for (collection, name) in &stale {
            Self::append(
                &mut inner,
                LedgerEvent::ItemReleased {
                    collection: collection.clone(),
                    name: name.clone(),
                },
                false,
            )?;
        }
        if !stale.is_empty() {
            inner.file.sync_all()?;
        }

        Ok(stale.len())
    }

    #[cfg(test)]
    fn snapshot(&self) -> State {
        self.inner.lock().unwrap().state.clone()
    }
}

impl Ledger for LogLedger {
    fn seed_catalog(&self, collection: &Collection, items: &[SeedItem]) -> Result<usize> {
        let mut inner = self.lock()?;
        let mut inserted = 0;
        for item in items {
            let key = (collection.clone(), item.name.clone());
            if inner.state.items.contains_key(&key) {
                continue;
            }
            Self::append(
                &mut inner,
                LedgerEvent::ItemSeeded {
                    collection: collection.clone(),
                    name: item.name.clone(),
                    image: item.image.clone(),
                    media_type: item.media_type.clone(),
                },
                false,
            )?;
            inserted += 1;
        }
        if inserted > 0 {
            inner.file.sync_all()?;
        }
        Ok(inserted)
    }

    fn pick_random_available(&self, collection: &Collection) -> Result<Option<CatalogItem>> {
        self.pick_random_available_at(collection, Utc::now())
    }

    fn release_reservation(&self, collection: &Collection, name: &AssetName) -> Result<()> {
        let mut inner = self.lock()?;
        let reserved = inner
            .state
            .items
            .get(&(collection.clone(), name.clone()))
            .is_some_and(|item| item.status == ItemStatus::Reserved);
        if !reserved {
            return Ok(());
        }
        Self::append(
            &mut inner,
            LedgerEvent::ItemReleased {
                collection: collection.clone(),
                name: name.clone(),
            },
            true,
        )
    }

    fn mark_issued(&self, collection: &Collection, name: &AssetName) -> Result<()> {
        let mut inner = self.lock()?;
        let needs_transition = inner
            .state
            .items
            .get(&(collection.clone(), name.clone()))
            .is_some_and(|item| item.status != ItemStatus::Issued);
        if !needs_transition {
            return Ok(());
        }
        Self::append(
            &mut inner,
            LedgerEvent::ItemIssued {
                collection: collection.clone(),
                name: name.clone(),
            },
            true,
        )
    }

    fn expire_stale(&self, ttl: Duration) -> Result<usize> {
        self.expire_stale_at(ttl, Utc::now())
    }

    fn save_payment(&self, hash: &TxHash, payer: &Address, amount: u64) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.state.payment_index.contains_key(hash) {
            return Ok(false);
        }
        Self::append(
            &mut inner,
            LedgerEvent::PaymentSaved {
                tx_hash: hash.clone(),
                payer: payer.clone(),
                amount,
            },
            true,
        )?;
        Ok(true)
    }

    fn next_unprocessed_payment(&self, min_amount: u64) -> Result<Option<Payment>> {
        let inner = self.lock()?;
        Ok(inner
            .state
            .payments
            .iter()
            .find(|p| !p.processed && p.amount >= min_amount)
            .cloned())
    }

    fn mark_payment_processed(&self, hash: &TxHash) -> Result<()> {
        let mut inner = self.lock()?;
        let pending = inner
            .state
            .payment_index
            .get(hash)
            .map(|&idx| !inner.state.payments[idx].processed)
            .unwrap_or(false);
        if !pending {
            return Ok(());
        }
        Self::append(
            &mut inner,
            LedgerEvent::PaymentProcessed {
                tx_hash: hash.clone(),
            },
            true,
        )
    }

    fn record_issuance(&self, record: &IssuanceRecord) -> Result<()> {
        let mut inner = self.lock()?;
        Self::append(
            &mut inner,
            LedgerEvent::IssuanceRecorded {
                tx_hash: record.tx_hash.clone(),
                payer: record.payer.clone(),
                first_asset: record.first_asset.clone(),
                second_asset: record.second_asset.clone(),
                created_at: record.created_at,
            },
            true,
        )
    }
}
