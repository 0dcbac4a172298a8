//! Core domain types for the mint vendor bot.
//!
//! This module contains all the fundamental types used throughout the
//! application, designed to encode invariants via the type system.

pub mod ids;
pub mod item;

// Re-export commonly used types at the module level
pub use ids::{Address, AssetName, Collection, TxHash};
pub use item::{CatalogItem, IssuanceRecord, ItemStatus, Payment};
