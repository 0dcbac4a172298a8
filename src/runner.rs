//! The poll loop: scan, fulfill, sleep, forever.
//!
//! Each tick is fully fenced: a scan failure never prevents the fulfillment
//! attempt, and no error ever escapes a tick. The poll interval doubles as
//! the retry cadence for everything that failed transiently during the tick.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{error, warn};

use crate::chain::ChainIndex;
use crate::fulfill::Coordinator;
use crate::issuer::Issuer;
use crate::scanner::PaymentScanner;

/// Drives the scanner and coordinator on a fixed interval.
pub struct Runner<C, I> {
    scanner: PaymentScanner<C>,
    coordinator: Coordinator<I>,
    poll_interval: Duration,
}

impl<C: ChainIndex, I: Issuer> Runner<C, I> {
    pub fn new(
        scanner: PaymentScanner<C>,
        coordinator: Coordinator<I>,
        poll_interval: Duration,
    ) -> Self {
        Runner {
            scanner,
            coordinator,
            poll_interval,
        }
    }

    /// Runs ticks forever. Never returns and never panics on tick failures.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// One tick: scan for payments, then attempt one fulfillment.
    async fn tick(&self) {
        if let Err(e) = self.scanner.scan().await {
            warn!(error = %e, "payment scan failed, retrying next tick");
        }
        if let Err(e) = self.coordinator.fulfill_one().await {
            error!(error = %e, "fulfillment failed");
        }
    }
}
