//! Fulfillment coordinator: matches one unprocessed payment to a reserved
//! pair and drives the issuance to completion.
//!
//! One fulfillment per tick, at most one in flight per process. Ordering on
//! the happy path is deliberate: confirmation first, then `mark_issued`,
//! `record_issuance`, `mark_payment_processed`. A crash after issuance but
//! before bookkeeping leaves the payment unprocessed and the items reserved;
//! the mint already happened, so the failure is surfaced for manual
//! reconciliation instead of risking a second mint.
//!
//! Failures before confirmation release both reservations and leave the
//! payment unprocessed; the next tick retries with a fresh random pair
//! (items are fungible within a collection).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::catalog::{AssetDescriptor, Catalog};
use crate::issuer::{Issuer, IssuerError};
use crate::ledger::{Ledger, LedgerError};
use crate::types::{AssetName, CatalogItem, Collection, IssuanceRecord, Payment, TxHash};

/// Errors raised by a fulfillment attempt.
///
/// Every variant identifies the payment it concerns, so no failure can hit
/// the logs anonymously.
#[derive(Debug, Error)]
pub enum FulfillError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// A reserved item has no descriptor in the static catalog. Fatal for
    /// this payment only; indicates catalog drift.
    #[error("payment {payment}: no catalog descriptor for {collection}/{name}")]
    DescriptorMissing {
        payment: TxHash,
        collection: Collection,
        name: AssetName,
    },

    /// The issuance action failed; reservations were released.
    #[error("payment {payment}: issuance failed: {source}")]
    Issuance {
        payment: TxHash,
        #[source]
        source: IssuerError,
    },

    /// The issuance never reached a confirmed state; reservations were
    /// released.
    #[error("payment {payment}: issuance {issuance} not confirmed: {source}")]
    Confirmation {
        payment: TxHash,
        issuance: TxHash,
        #[source]
        source: IssuerError,
    },

    /// Ledger bookkeeping failed after a confirmed issuance. Reservations are
    /// deliberately NOT released; the assets exist on-chain and an operator
    /// must reconcile.
    #[error(
        "payment {payment}: issuance {issuance} confirmed but bookkeeping failed, \
         manual reconciliation required: {source}"
    )]
    Bookkeeping {
        payment: TxHash,
        issuance: TxHash,
        #[source]
        source: LedgerError,
    },
}

/// Coordinator policy.
#[derive(Debug, Clone)]
pub struct FulfillConfig {
    /// The two collections a payment buys one item from each of.
    pub collections: [Collection; 2],

    /// Minimum payment amount eligible for fulfillment (the amount window's
    /// lower bound).
    pub min_amount: u64,

    /// How long an item may sit reserved before the expiry sweep frees it.
    pub reservation_ttl: Duration,
}

/// RAII guard for the in-process single-flight flag.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            .then_some(FlightGuard(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Single-flight fulfillment driver.
pub struct Coordinator<I> {
    ledger: Arc<dyn Ledger>,
    catalog: Arc<Catalog>,
    issuer: I,
    config: FulfillConfig,
    in_flight: AtomicBool,
}

impl<I: Issuer> Coordinator<I> {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        catalog: Arc<Catalog>,
        issuer: I,
        config: FulfillConfig,
    ) -> Self {
        Coordinator {
            ledger,
            catalog,
            issuer,
            config,
            in_flight: AtomicBool::new(false),
        }
    }

    /// One fulfillment tick: expire stale reservations, then fulfill the
    /// oldest eligible payment, if any.
    pub async fn fulfill_one(&self) -> Result<(), FulfillError> {
        let freed = self.ledger.expire_stale(self.config.reservation_ttl)?;
        if freed > 0 {
            info!(freed, "expiry sweep released stale reservations");
        }

        let Some(_guard) = FlightGuard::try_acquire(&self.in_flight) else {
            debug!("fulfillment already in flight, skipping tick");
            return Ok(());
        };

        let Some(payment) = self
            .ledger
            .next_unprocessed_payment(self.config.min_amount)?
        else {
            return Ok(());
        };

        info!(
            payment = %payment.tx_hash.short(),
            payer = %payment.payer.short(),
            amount = payment.amount,
            "fulfilling payment"
        );
        self.fulfill(&payment).await
    }

    async fn fulfill(&self, payment: &Payment) -> Result<(), FulfillError> {
        let [first_collection, second_collection] = &self.config.collections;

        let Some(first) = self.ledger.pick_random_available(first_collection)? else {
            warn!(
                payment = %payment.tx_hash.short(),
                collection = %first_collection,
                "inventory exhausted, payment left unprocessed"
            );
            return Ok(());
        };
        let Some(second) = self.ledger.pick_random_available(second_collection)? else {
            self.release_pair(Some(&first), None);
            warn!(
                payment = %payment.tx_hash.short(),
                collection = %second_collection,
                "inventory exhausted, payment left unprocessed"
            );
            return Ok(());
        };

        let (first_descriptor, second_descriptor) =
            match (self.resolve(&first), self.resolve(&second)) {
                (Some(a), Some(b)) => (a.clone(), b.clone()),
                (missing_first, _) => {
                    self.release_pair(Some(&first), Some(&second));
                    let lost = if missing_first.is_none() { &first } else { &second };
                    return Err(FulfillError::DescriptorMissing {
                        payment: payment.tx_hash.clone(),
                        collection: lost.collection.clone(),
                        name: lost.name.clone(),
                    });
                }
            };

        let issuance_hash = match self
            .issuer
            .issue(&payment.payer, &first_descriptor, &second_descriptor)
            .await
        {
            Ok(hash) => hash,
            Err(source) => {
                self.release_pair(Some(&first), Some(&second));
                return Err(FulfillError::Issuance {
                    payment: payment.tx_hash.clone(),
                    source,
                });
            }
        };

        if let Err(source) = self.issuer.await_confirmation(&issuance_hash).await {
            self.release_pair(Some(&first), Some(&second));
            return Err(FulfillError::Confirmation {
                payment: payment.tx_hash.clone(),
                issuance: issuance_hash,
                source,
            });
        }

        if let Err(source) = self.commit(payment, &issuance_hash, &first, &second) {
            return Err(FulfillError::Bookkeeping {
                payment: payment.tx_hash.clone(),
                issuance: issuance_hash,
                source,
            });
        }

        info!(
            payment = %payment.tx_hash.short(),
            issuance = %issuance_hash.short(),
            first = %first.name,
            second = %second.name,
            payer = %payment.payer.short(),
            "minted pair"
        );
        Ok(())
    }

    fn resolve(&self, item: &CatalogItem) -> Option<&AssetDescriptor> {
        self.catalog.resolve(&item.collection, &item.name)
    }

    /// Durably records a confirmed issuance: items first, then the issuance
    /// record, then the payment flag, so every prefix of this sequence is
    /// safe to re-run or reconcile.
    fn commit(
        &self,
        payment: &Payment,
        issuance_hash: &TxHash,
        first: &CatalogItem,
        second: &CatalogItem,
    ) -> Result<(), LedgerError> {
        self.ledger.mark_issued(&first.collection, &first.name)?;
        self.ledger.mark_issued(&second.collection, &second.name)?;
        self.ledger.record_issuance(&IssuanceRecord {
            tx_hash: issuance_hash.clone(),
            payer: payment.payer.clone(),
            first_asset: first.name.clone(),
            second_asset: second.name.clone(),
            created_at: Utc::now(),
        })?;
        self.ledger.mark_payment_processed(&payment.tx_hash)
    }

    /// Best-effort release of reserved items. A failed release is logged and
    /// left to the expiry sweep.
    fn release_pair(&self, first: Option<&CatalogItem>, second: Option<&CatalogItem>) {
        for item in [first, second].into_iter().flatten() {
            if let Err(e) = self
                .ledger
                .release_reservation(&item.collection, &item.name)
            {
                error!(
                    collection = %item.collection,
                    item = %item.name,
                    error = %e,
                    "failed to release reservation, expiry sweep will recover it"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LogLedger, SeedItem};
    use crate::types::Address;
    use std::io::Write;
    use std::sync::atomic::AtomicU32;
    use tempfile::tempdir;

    const MIN_AMOUNT: u64 = 29_500_000;
    const TTL: Duration = Duration::from_secs(600);

    fn collections() -> [Collection; 2] {
        [Collection::from("TDD"), Collection::from("TRIX_2056")]
    }

    fn seed_items(names: &[&str]) -> Vec<SeedItem> {
        names
            .iter()
            .map(|n| SeedItem {
                name: AssetName::from(*n),
                image: format!("Qm{}", n),
                media_type: "image/png".to_string(),
            })
            .collect()
    }

    /// Builds a catalog whose files list the given names per collection.
    fn catalog(dir: &tempfile::TempDir, first: &[&str], second: &[&str]) -> Arc<Catalog> {
        let mut sources = Vec::new();
        for (collection, names) in [("TDD", first), ("TRIX_2056", second)] {
            let entries: Vec<String> = names
                .iter()
                .map(|n| {
                    format!(
                        r#"{{"name": "{}", "image": "ipfs://Qm{}", "mediaType": "image/png"}}"#,
                        n, n
                    )
                })
                .collect();
            let path = dir.path().join(format!("{}.json", collection));
            let mut file = std::fs::File::create(&path).unwrap();
            write!(file, "[{}]", entries.join(",")).unwrap();
            sources.push((Collection::from(collection), path));
        }
        Arc::new(Catalog::load(&sources).unwrap())
    }

    /// Issuer double with scriptable failures and a call counter.
    #[derive(Default)]
    struct MockIssuer {
        fail_issue: bool,
        fail_confirmation: bool,
        delay: Option<Duration>,
        issue_calls: AtomicU32,
    }

    impl Issuer for MockIssuer {
        async fn issue(
            &self,
            _payer: &Address,
            _first: &AssetDescriptor,
            _second: &AssetDescriptor,
        ) -> Result<TxHash, IssuerError> {
            self.issue_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_issue {
                return Err(IssuerError::Rejected {
                    status: 500,
                    message: "tx build failed".to_string(),
                });
            }
            Ok(TxHash::from("mint_tx_hash"))
        }

        async fn await_confirmation(&self, hash: &TxHash) -> Result<(), IssuerError> {
            if self.fail_confirmation {
                return Err(IssuerError::ConfirmationTimeout {
                    hash: hash.clone(),
                    waited: Duration::from_secs(300),
                });
            }
            Ok(())
        }
    }

    struct Fixture {
        ledger: Arc<LogLedger>,
        coordinator: Coordinator<MockIssuer>,
    }

    fn fixture(dir: &tempfile::TempDir, issuer: MockIssuer) -> Fixture {
        fixture_with_names(dir, issuer, &["tdd_a", "tdd_b"], &["trix_a", "trix_b"])
    }

    fn fixture_with_names(
        dir: &tempfile::TempDir,
        issuer: MockIssuer,
        first: &[&str],
        second: &[&str],
    ) -> Fixture {
        let ledger = Arc::new(LogLedger::open(dir.path().join("ledger.log")).unwrap());
        ledger
            .seed_catalog(&Collection::from("TDD"), &seed_items(first))
            .unwrap();
        ledger
            .seed_catalog(&Collection::from("TRIX_2056"), &seed_items(second))
            .unwrap();

        let coordinator = Coordinator::new(
            Arc::clone(&ledger) as Arc<dyn Ledger>,
            catalog(dir, first, second),
            issuer,
            FulfillConfig {
                collections: collections(),
                min_amount: MIN_AMOUNT,
                reservation_ttl: TTL,
            },
        );
        Fixture { ledger, coordinator }
    }

    fn save_payment(ledger: &LogLedger, hash: &str) {
        ledger
            .save_payment(&TxHash::from(hash), &Address::from("addr1payer"), 30_000_000)
            .unwrap();
    }

    fn available_count(ledger: &LogLedger, collection: &Collection) -> usize {
        // Drain the collection to count, then release everything back.
        let mut picked = Vec::new();
        while let Some(item) = ledger.pick_random_available(collection).unwrap() {
            picked.push(item);
        }
        for item in &picked {
            ledger.release_reservation(collection, &item.name).unwrap();
        }
        picked.len()
    }

    #[tokio::test]
    async fn success_issues_records_and_processes() {
        let dir = tempdir().unwrap();
        let fx = fixture(&dir, MockIssuer::default());
        save_payment(&fx.ledger, "pay1");

        fx.coordinator.fulfill_one().await.unwrap();

        // Payment consumed, one item gone from each collection.
        assert!(fx.ledger.next_unprocessed_payment(MIN_AMOUNT).unwrap().is_none());
        assert_eq!(available_count(&fx.ledger, &Collection::from("TDD")), 1);
        assert_eq!(available_count(&fx.ledger, &Collection::from("TRIX_2056")), 1);
        assert_eq!(fx.coordinator.issuer.issue_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn processed_payments_are_never_reselected() {
        let dir = tempdir().unwrap();
        let fx = fixture(&dir, MockIssuer::default());
        save_payment(&fx.ledger, "pay1");

        fx.coordinator.fulfill_one().await.unwrap();
        fx.coordinator.fulfill_one().await.unwrap();

        assert_eq!(fx.coordinator.issuer.issue_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn issuance_failure_rolls_back() {
        let dir = tempdir().unwrap();
        let fx = fixture(
            &dir,
            MockIssuer {
                fail_issue: true,
                ..Default::default()
            },
        );
        save_payment(&fx.ledger, "pay1");

        let err = fx.coordinator.fulfill_one().await.unwrap_err();
        assert!(matches!(err, FulfillError::Issuance { .. }));

        // Both items back in the pool, payment still pending retry.
        assert_eq!(available_count(&fx.ledger, &Collection::from("TDD")), 2);
        assert_eq!(available_count(&fx.ledger, &Collection::from("TRIX_2056")), 2);
        let payment = fx.ledger.next_unprocessed_payment(MIN_AMOUNT).unwrap().unwrap();
        assert_eq!(payment.tx_hash, TxHash::from("pay1"));
        assert!(!payment.processed);
    }

    #[tokio::test]
    async fn confirmation_failure_rolls_back() {
        let dir = tempdir().unwrap();
        let fx = fixture(
            &dir,
            MockIssuer {
                fail_confirmation: true,
                ..Default::default()
            },
        );
        save_payment(&fx.ledger, "pay1");

        let err = fx.coordinator.fulfill_one().await.unwrap_err();
        assert!(matches!(err, FulfillError::Confirmation { .. }));

        assert_eq!(available_count(&fx.ledger, &Collection::from("TDD")), 2);
        assert!(fx.ledger.next_unprocessed_payment(MIN_AMOUNT).unwrap().is_some());
    }

    #[tokio::test]
    async fn exhausted_first_collection_leaves_payment_untouched() {
        let dir = tempdir().unwrap();
        let fx = fixture_with_names(&dir, MockIssuer::default(), &[], &["trix_a"]);
        save_payment(&fx.ledger, "pay1");

        fx.coordinator.fulfill_one().await.unwrap();

        assert_eq!(fx.coordinator.issuer.issue_calls.load(Ordering::SeqCst), 0);
        assert!(fx.ledger.next_unprocessed_payment(MIN_AMOUNT).unwrap().is_some());
        // The second collection must not have been touched.
        assert_eq!(available_count(&fx.ledger, &Collection::from("TRIX_2056")), 1);
    }

    #[tokio::test]
    async fn exhausted_second_collection_releases_first_pick() {
        let dir = tempdir().unwrap();
        let fx = fixture_with_names(&dir, MockIssuer::default(), &["tdd_a"], &[]);
        save_payment(&fx.ledger, "pay1");

        fx.coordinator.fulfill_one().await.unwrap();

        assert_eq!(fx.coordinator.issuer.issue_calls.load(Ordering::SeqCst), 0);
        // The picked first item went back to the pool instead of leaking.
        assert_eq!(available_count(&fx.ledger, &Collection::from("TDD")), 1);
        assert!(fx.ledger.next_unprocessed_payment(MIN_AMOUNT).unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_descriptor_releases_and_errors() {
        let dir = tempdir().unwrap();
        // Ledger knows an item the catalog file doesn't list.
        let ledger = Arc::new(LogLedger::open(dir.path().join("ledger.log")).unwrap());
        ledger
            .seed_catalog(&Collection::from("TDD"), &seed_items(&["ghost"]))
            .unwrap();
        ledger
            .seed_catalog(&Collection::from("TRIX_2056"), &seed_items(&["trix_a"]))
            .unwrap();

        let coordinator = Coordinator::new(
            Arc::clone(&ledger) as Arc<dyn Ledger>,
            catalog(&dir, &["tdd_a"], &["trix_a"]),
            MockIssuer::default(),
            FulfillConfig {
                collections: collections(),
                min_amount: MIN_AMOUNT,
                reservation_ttl: TTL,
            },
        );
        save_payment(&ledger, "pay1");

        let err = coordinator.fulfill_one().await.unwrap_err();
        match err {
            FulfillError::DescriptorMissing { collection, name, .. } => {
                assert_eq!(collection, Collection::from("TDD"));
                assert_eq!(name, AssetName::from("ghost"));
            }
            other => panic!("expected DescriptorMissing, got {:?}", other),
        }

        // Both reservations released, payment untouched.
        assert!(ledger
            .pick_random_available(&Collection::from("TDD"))
            .unwrap()
            .is_some());
        assert!(ledger.next_unprocessed_payment(MIN_AMOUNT).unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_ticks_run_at_most_one_fulfillment() {
        let dir = tempdir().unwrap();
        let fx = fixture(
            &dir,
            MockIssuer {
                delay: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        );
        save_payment(&fx.ledger, "pay1");
        save_payment(&fx.ledger, "pay2");

        let (a, b) = tokio::join!(fx.coordinator.fulfill_one(), fx.coordinator.fulfill_one());
        a.unwrap();
        b.unwrap();

        // The second tick saw the in-flight flag and returned immediately.
        assert_eq!(fx.coordinator.issuer.issue_calls.load(Ordering::SeqCst), 1);
        assert!(fx.ledger.next_unprocessed_payment(MIN_AMOUNT).unwrap().is_some());
    }

    #[tokio::test]
    async fn expiry_sweep_runs_before_selection() {
        let dir = tempdir().unwrap();
        let fx = fixture_with_names(&dir, MockIssuer::default(), &["tdd_a"], &["trix_a"]);

        // Strand both items in `reserved` long past the TTL.
        let stale = Utc::now() - chrono::Duration::seconds(700);
        fx.ledger
            .pick_random_available_at(&Collection::from("TDD"), stale)
            .unwrap();
        fx.ledger
            .pick_random_available_at(&Collection::from("TRIX_2056"), stale)
            .unwrap();
        save_payment(&fx.ledger, "pay1");

        // The sweep frees them, so the same tick can fulfill.
        fx.coordinator.fulfill_one().await.unwrap();
        assert_eq!(fx.coordinator.issuer.issue_calls.load(Ordering::SeqCst), 1);
        assert!(fx.ledger.next_unprocessed_payment(MIN_AMOUNT).unwrap().is_none());
    }

    #[tokio::test]
    async fn payments_below_minimum_are_not_fulfilled() {
        let dir = tempdir().unwrap();
        let fx = fixture(&dir, MockIssuer::default());
        fx.ledger
            .save_payment(&TxHash::from("small"), &Address::from("p"), 10_000_000)
            .unwrap();

        fx.coordinator.fulfill_one().await.unwrap();
        assert_eq!(fx.coordinator.issuer.issue_calls.load(Ordering::SeqCst), 0);
    }
}
