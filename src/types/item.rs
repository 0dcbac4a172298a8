//! Catalog item, payment, and issuance record types.
//!
//! These are the rows the reservation ledger stores. Lifecycle transitions are
//! performed by the ledger implementations; the types here only encode the
//! shapes and the legal states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{Address, AssetName, Collection, TxHash};

/// Lifecycle state of a catalog item.
///
/// Transitions: `Available → Reserved → {Issued | Available}`. `Issued` is
/// terminal; `Reserved` returns to `Available` via explicit release or TTL
/// expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Available,
    Reserved,
    Issued,
}

impl ItemStatus {
    /// Returns the canonical storage string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Available => "available",
            ItemStatus::Reserved => "reserved",
            ItemStatus::Issued => "issued",
        }
    }

    /// Parses a storage string back into a status.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(ItemStatus::Available),
            "reserved" => Some(ItemStatus::Reserved),
            "issued" => Some(ItemStatus::Issued),
            _ => None,
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single sellable item, owned exclusively by the reservation ledger.
///
/// Identity is the (collection, name) pair. Items are created once at
/// catalog-seed time and never deleted; only `status` and `reserved_at`
/// change afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub collection: Collection,
    pub name: AssetName,
    /// Content reference (IPFS CID or full image URI).
    pub image: String,
    pub media_type: String,
    pub status: ItemStatus,
    /// Set while `status == Reserved`, cleared otherwise.
    pub reserved_at: Option<DateTime<Utc>>,
}

/// An observed incoming payment, keyed by its transaction hash.
///
/// `processed` flips to true exactly once, after issuance succeeds and is
/// durably recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub tx_hash: TxHash,
    pub payer: Address,
    /// Observed amount in lovelace.
    pub amount: u64,
    pub processed: bool,
}

/// Append-only record of a successful issuance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceRecord {
    /// Hash of the issuance (mint) transaction.
    pub tx_hash: TxHash,
    pub payer: Address,
    pub first_asset: AssetName,
    pub second_asset: AssetName,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_roundtrip() {
        for status in [ItemStatus::Available, ItemStatus::Reserved, ItemStatus::Issued] {
            assert_eq!(ItemStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn status_parse_rejects_unknown() {
        assert_eq!(ItemStatus::parse("minted"), None);
        assert_eq!(ItemStatus::parse(""), None);
    }

    #[test]
    fn status_serde_uses_snake_case() {
        let json = serde_json::to_string(&ItemStatus::Available).unwrap();
        assert_eq!(json, r#""available""#);
    }
}
