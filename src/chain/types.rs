//! Wire types for the chain-indexing API.
//!
//! These mirror the Blockfrost response shapes the scanner needs: the recent
//! transaction list for an address, and per-transaction UTxO and metadata
//! detail. Amount quantities arrive as decimal strings and are only
//! interpreted for the native-currency unit (`lovelace`).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::types::{Address, TxHash};

/// One asset quantity inside an input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitAmount {
    pub unit: String,
    pub quantity: String,
}

impl UnitAmount {
    /// Returns the quantity in lovelace, or `None` for non-lovelace units or
    /// unparseable quantities.
    pub fn lovelace(&self) -> Option<u64> {
        if self.unit != "lovelace" {
            return None;
        }
        self.quantity.parse().ok()
    }
}

/// A transaction input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIo {
    pub address: Address,
    pub amount: Vec<UnitAmount>,
}

impl TxIo {
    /// Total lovelace carried by this input/output.
    pub fn lovelace(&self) -> u64 {
        self.amount.iter().filter_map(UnitAmount::lovelace).sum()
    }
}

/// Everything the scanner needs to know about one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxDetail {
    pub hash: TxHash,
    pub inputs: Vec<TxIo>,
    pub outputs: Vec<TxIo>,
    /// Metadata labels attached to the transaction (e.g. `"721"` on a
    /// CIP-25 mint).
    pub metadata_labels: Vec<String>,
}

impl TxDetail {
    /// Total lovelace sent to `address` across all outputs.
    pub fn total_to(&self, address: &Address) -> u64 {
        self.outputs
            .iter()
            .filter(|out| &out.address == address)
            .map(TxIo::lovelace)
            .sum()
    }

    /// The payer, derived as the address of the first input.
    pub fn payer(&self) -> Option<&Address> {
        self.inputs.first().map(|input| &input.address)
    }

    /// True when every input address belongs to `owned`.
    ///
    /// A transaction with no inputs at all is not treated as self-originated.
    pub fn all_inputs_from(&self, owned: &HashSet<Address>) -> bool {
        !self.inputs.is_empty() && self.inputs.iter().all(|input| owned.contains(&input.address))
    }

    /// True when the transaction carries the given metadata label.
    pub fn has_label(&self, label: &str) -> bool {
        self.metadata_labels.iter().any(|l| l == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io(address: &str, lovelace: u64) -> TxIo {
        TxIo {
            address: Address::from(address),
            amount: vec![UnitAmount {
                unit: "lovelace".to_string(),
                quantity: lovelace.to_string(),
            }],
        }
    }

    #[test]
    fn lovelace_ignores_other_units() {
        let out = TxIo {
            address: Address::from("addr1x"),
            amount: vec![
                UnitAmount {
                    unit: "lovelace".to_string(),
                    quantity: "1500000".to_string(),
                },
                UnitAmount {
                    unit: "b0d07d45fe9514f80213f4020e5a61241458be626841cde717cb38a7".to_string(),
                    quantity: "1".to_string(),
                },
            ],
        };
        assert_eq!(out.lovelace(), 1_500_000);
    }

    #[test]
    fn unparseable_quantity_is_ignored() {
        let unit = UnitAmount {
            unit: "lovelace".to_string(),
            quantity: "not-a-number".to_string(),
        };
        assert_eq!(unit.lovelace(), None);
    }

    #[test]
    fn total_to_sums_across_outputs() {
        let detail = TxDetail {
            hash: TxHash::from("t1"),
            inputs: vec![io("addr1payer", 31_000_000)],
            outputs: vec![
                io("addr1vendor", 20_000_000),
                io("addr1payer", 500_000),
                io("addr1vendor", 10_000_000),
            ],
            metadata_labels: vec![],
        };
        assert_eq!(detail.total_to(&Address::from("addr1vendor")), 30_000_000);
        assert_eq!(detail.total_to(&Address::from("addr1elsewhere")), 0);
    }

    #[test]
    fn payer_is_first_input() {
        let detail = TxDetail {
            hash: TxHash::from("t1"),
            inputs: vec![io("addr1first", 1), io("addr1second", 2)],
            outputs: vec![],
            metadata_labels: vec![],
        };
        assert_eq!(detail.payer(), Some(&Address::from("addr1first")));
    }

    #[test]
    fn all_inputs_from_requires_every_input_owned() {
        let owned: HashSet<Address> =
            [Address::from("addr1own")].into_iter().collect();

        let fully_owned = TxDetail {
            hash: TxHash::from("t1"),
            inputs: vec![io("addr1own", 1), io("addr1own", 2)],
            outputs: vec![],
            metadata_labels: vec![],
        };
        assert!(fully_owned.all_inputs_from(&owned));

        let mixed = TxDetail {
            hash: TxHash::from("t2"),
            inputs: vec![io("addr1own", 1), io("addr1customer", 2)],
            outputs: vec![],
            metadata_labels: vec![],
        };
        assert!(!mixed.all_inputs_from(&owned));

        let empty = TxDetail {
            hash: TxHash::from("t3"),
            inputs: vec![],
            outputs: vec![],
            metadata_labels: vec![],
        };
        assert!(!empty.all_inputs_from(&owned));
    }
}
