//! Chain-index collaborator: the system's read-only view of the ledger.
//!
//! The scanner only needs two questions answered: "which transactions
//! recently paid the receiving address" and "what does one transaction look
//! like in detail". The [`ChainIndex`] trait captures exactly that, so tests
//! can substitute a mock and the production code can use Blockfrost.

use std::future::Future;

use crate::types::{Address, TxHash};

pub mod blockfrost;
pub mod error;
pub mod retry;
pub mod types;

pub use blockfrost::BlockfrostClient;
pub use error::{IndexError, IndexErrorKind};
pub use retry::{retry_with_backoff, RetryConfig};
pub use types::{TxDetail, TxIo, UnitAmount};

/// Read access to the chain-indexing API.
///
/// Implementations are constructed with their credentials and base URL, so
/// call sites only deal in domain types.
pub trait ChainIndex: Send + Sync {
    /// The most recent transactions (newest first) that touch `address`,
    /// up to `limit`.
    fn recent_transactions(
        &self,
        address: &Address,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<TxHash>, IndexError>> + Send;

    /// Inputs, outputs, and metadata labels for one transaction.
    fn transaction_detail(
        &self,
        hash: &TxHash,
    ) -> impl Future<Output = Result<TxDetail, IndexError>> + Send;
}
