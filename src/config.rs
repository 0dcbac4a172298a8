//! Operator configuration, read from `MINT_VENDOR_*` environment variables.
//!
//! The bot consumes these as plain values; policy choices (price tolerance,
//! poll cadence, TTL) deliberately stay configurable rather than hard-coded.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::fulfill::FulfillConfig;
use crate::scanner::ScanConfig;
use crate::types::{Address, Collection};

const DEFAULT_BLOCKFROST_URL: &str = "https://cardano-mainnet.blockfrost.io/api/v0";
const DEFAULT_PRICE_LOVELACE: u64 = 30_000_000;
const DEFAULT_TOLERANCE_LOVELACE: u64 = 500_000;
const DEFAULT_SCAN_WINDOW: u32 = 25;
const DEFAULT_POLL_SECS: u64 = 6;
const DEFAULT_RESERVATION_TTL_SECS: u64 = 600;
const DEFAULT_ISSUANCE_LABEL: &str = "721";
const DEFAULT_PORT: u16 = 3000;

/// Errors raised while reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Which ledger engine to open, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    /// rusqlite database file.
    Sqlite(PathBuf),
    /// JSON Lines event log.
    Log(PathBuf),
}

/// Everything the bot needs from the operator.
#[derive(Debug, Clone)]
pub struct Config {
    pub blockfrost_url: String,
    pub blockfrost_key: String,

    pub receive_address: Address,
    /// Controlled wallet addresses beyond the receiving address.
    pub own_addresses: Vec<Address>,

    /// Expected price in lovelace.
    pub price: u64,
    /// Symmetric window half-width in lovelace.
    pub tolerance: u64,
    /// Recent transactions inspected per scan tick.
    pub scan_window: u32,

    pub poll_interval: Duration,
    pub reservation_ttl: Duration,

    pub first_collection: Collection,
    pub first_catalog: PathBuf,
    pub second_collection: Collection,
    pub second_catalog: PathBuf,

    pub store: StoreConfig,

    pub issuer_url: String,
    pub issuance_label: String,

    pub listen_port: u16,
}

impl Config {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration through an arbitrary lookup, so tests don't need
    /// to mutate the process environment.
    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let store_kind = get("MINT_VENDOR_STORE").unwrap_or_else(|| "sqlite".to_string());
        let store = match store_kind.as_str() {
            "sqlite" => StoreConfig::Sqlite(
                get("MINT_VENDOR_STORE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("data/vendor.db")),
            ),
            "log" => StoreConfig::Log(
                get("MINT_VENDOR_STORE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("data/vendor.log")),
            ),
            other => {
                return Err(ConfigError::Invalid {
                    name: "MINT_VENDOR_STORE",
                    value: other.to_string(),
                    reason: "expected \"sqlite\" or \"log\"".to_string(),
                })
            }
        };

        Ok(Config {
            blockfrost_url: get("MINT_VENDOR_BLOCKFROST_URL")
                .unwrap_or_else(|| DEFAULT_BLOCKFROST_URL.to_string()),
            blockfrost_key: required(&get, "MINT_VENDOR_BLOCKFROST_KEY")?,
            receive_address: Address::new(required(&get, "MINT_VENDOR_RECEIVE_ADDRESS")?),
            own_addresses: parse_addresses(
                &get("MINT_VENDOR_OWN_ADDRESSES").unwrap_or_default(),
            ),
            price: parse_or(&get, "MINT_VENDOR_PRICE_LOVELACE", DEFAULT_PRICE_LOVELACE)?,
            tolerance: parse_or(
                &get,
                "MINT_VENDOR_TOLERANCE_LOVELACE",
                DEFAULT_TOLERANCE_LOVELACE,
            )?,
            scan_window: parse_or(&get, "MINT_VENDOR_SCAN_WINDOW", DEFAULT_SCAN_WINDOW)?,
            poll_interval: Duration::from_secs(parse_or(
                &get,
                "MINT_VENDOR_POLL_SECS",
                DEFAULT_POLL_SECS,
            )?),
            reservation_ttl: Duration::from_secs(parse_or(
                &get,
                "MINT_VENDOR_RESERVATION_TTL_SECS",
                DEFAULT_RESERVATION_TTL_SECS,
            )?),
            first_collection: Collection::new(
                get("MINT_VENDOR_FIRST_COLLECTION").unwrap_or_else(|| "TDD".to_string()),
            ),
            first_catalog: PathBuf::from(required(&get, "MINT_VENDOR_FIRST_CATALOG")?),
            second_collection: Collection::new(
                get("MINT_VENDOR_SECOND_COLLECTION").unwrap_or_else(|| "TRIX_2056".to_string()),
            ),
            second_catalog: PathBuf::from(required(&get, "MINT_VENDOR_SECOND_CATALOG")?),
            store,
            issuer_url: required(&get, "MINT_VENDOR_ISSUER_URL")?,
            issuance_label: get("MINT_VENDOR_ISSUANCE_LABEL")
                .unwrap_or_else(|| DEFAULT_ISSUANCE_LABEL.to_string()),
            listen_port: parse_or(&get, "MINT_VENDOR_PORT", DEFAULT_PORT)?,
        })
    }

    /// Scanner policy derived from this configuration.
    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            receive_address: self.receive_address.clone(),
            own_addresses: self.own_addresses.iter().cloned().collect::<HashSet<_>>(),
            price: self.price,
            tolerance: self.tolerance,
            window: self.scan_window,
            issuance_label: self.issuance_label.clone(),
        }
    }

    /// Coordinator policy derived from this configuration.
    pub fn fulfill_config(&self) -> FulfillConfig {
        FulfillConfig {
            collections: [self.first_collection.clone(), self.second_collection.clone()],
            min_amount: self.price.saturating_sub(self.tolerance),
            reservation_ttl: self.reservation_ttl,
        }
    }
}

fn required(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    match get(name) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match get(name) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value,
            reason: e.to_string(),
        }),
    }
}

/// Parses a comma-separated address list, ignoring empty segments.
fn parse_addresses(raw: &str) -> Vec<Address> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Address::from)
        .collect()
}
