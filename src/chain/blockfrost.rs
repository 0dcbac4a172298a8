//! Blockfrost client implementing the [`ChainIndex`] contract.
//!
//! Endpoints used:
//! - `GET /addresses/{address}/transactions?order=desc&count=N`
//! - `GET /txs/{hash}/utxos`
//! - `GET /txs/{hash}/metadata` (404 means "no metadata", not an error)
//!
//! Authentication is the `project_id` header. Transient failures are retried
//! in-call with exponential backoff; the poll loop provides the coarse retry
//! beyond that.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use crate::types::{Address, TxHash};

use super::error::IndexError;
use super::retry::{retry_with_backoff, RetryConfig};
use super::types::{TxDetail, TxIo};
use super::ChainIndex;

/// Request timeout for individual index calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct AddressTransaction {
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct TxUtxos {
    inputs: Vec<TxIo>,
    outputs: Vec<TxIo>,
}

#[derive(Debug, Deserialize)]
struct TxMetadataLabel {
    label: String,
}

/// A chain-index client bound to one Blockfrost project.
#[derive(Clone)]
pub struct BlockfrostClient {
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    retry: RetryConfig,
}

impl BlockfrostClient {
    /// Creates a client for the given API base URL (no trailing slash) and
    /// project key.
    pub fn new(base_url: impl Into<String>, project_id: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        BlockfrostClient {
            http,
            base_url: base_url.into(),
            project_id: project_id.into(),
            retry: RetryConfig::DEFAULT,
        }
    }

    /// Overrides the in-call retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Performs one GET and decodes the JSON body.
    ///
    /// `not_found` supplies the value to return on HTTP 404, for endpoints
    /// where absence is a legitimate answer.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        not_found: Option<fn() -> T>,
    ) -> Result<T, IndexError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .header("project_id", &self.project_id)
            .send()
            .await
            .map_err(IndexError::from_reqwest)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            if let Some(default) = not_found {
                return Ok(default());
            }
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::from_status(
                status.as_u16(),
                format!("GET {}: {}", path, body),
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| IndexError::permanent(format!("GET {}: undecodable body: {}", path, e)))
    }
}

impl ChainIndex for BlockfrostClient {
    async fn recent_transactions(
        &self,
        address: &Address,
        limit: u32,
    ) -> Result<Vec<TxHash>, IndexError> {
        let path = format!(
            "/addresses/{}/transactions?order=desc&count={}",
            address, limit
        );
        let txs: Vec<AddressTransaction> = retry_with_backoff(self.retry, || {
            self.get_json(&path, Some(Vec::new))
        })
        .await?;
        Ok(txs.into_iter().map(|t| TxHash::new(t.tx_hash)).collect())
    }

    async fn transaction_detail(&self, hash: &TxHash) -> Result<TxDetail, IndexError> {
        let utxos_path = format!("/txs/{}/utxos", hash);
        let utxos: TxUtxos =
            retry_with_backoff(self.retry, || self.get_json(&utxos_path, None)).await?;

        let metadata_path = format!("/txs/{}/metadata", hash);
        let labels: Vec<TxMetadataLabel> = retry_with_backoff(self.retry, || {
            self.get_json(&metadata_path, Some(Vec::new))
        })
        .await?;

        Ok(TxDetail {
            hash: hash.clone(),
            inputs: utxos.inputs,
            outputs: utxos.outputs,
            metadata_labels: labels.into_iter().map(|l| l.label).collect(),
        })
    }
}

impl std::fmt::Debug for BlockfrostClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockfrostClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
