//! Issuance collaborator: the external mint service.
//!
//! The service owns transaction building, policy signing, and submission; this
//! side only knows how to ask for a pair mint and how to wait for the result.
//! Issuer errors are opaque and never retried in place: the coordinator
//! releases its reservations and the next poll tick starts over with a fresh
//! random pair.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::AssetDescriptor;
use crate::types::{Address, TxHash};

/// Errors surfaced by the issuance collaborator.
#[derive(Debug, Error)]
pub enum IssuerError {
    /// Transport failure talking to the mint service.
    #[error("mint service unreachable: {0}")]
    Http(#[from] reqwest::Error),

    /// The mint service refused the request.
    #[error("mint service rejected issuance (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The mint service answered with something undecodable.
    #[error("mint service returned malformed response: {0}")]
    Malformed(String),

    /// The submitted transaction was reported failed by the mint service.
    #[error("issuance {hash} failed: {reason}")]
    Failed { hash: TxHash, reason: String },

    /// The transaction did not confirm within the wait budget.
    #[error("issuance {hash} unconfirmed after {waited:?}")]
    ConfirmationTimeout { hash: TxHash, waited: Duration },
}

/// The issuance action: mint one pair of assets to a payer.
pub trait Issuer: Send + Sync {
    /// Builds, signs, and submits the mint of both assets to `payer`.
    /// Returns the issuance transaction hash on successful submission.
    fn issue(
        &self,
        payer: &Address,
        first: &AssetDescriptor,
        second: &AssetDescriptor,
    ) -> impl Future<Output = Result<TxHash, IssuerError>> + Send;

    /// Waits until the submitted issuance reaches a confirmed state.
    fn await_confirmation(
        &self,
        hash: &TxHash,
    ) -> impl Future<Output = Result<(), IssuerError>> + Send;
}

#[derive(Debug, Serialize)]
struct IssueRequest<'a> {
    payer: &'a Address,
    assets: [&'a AssetDescriptor; 2],
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    tx_hash: TxHash,
}

/// Confirmation state reported by the mint service's status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ConfirmationStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: ConfirmationStatus,
    #[serde(default)]
    reason: Option<String>,
}

/// Default overall budget for the confirmation wait.
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default interval between confirmation checks.
const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_secs(5);

/// HTTP adapter for a mint service exposing `POST /issue` and
/// `GET /issuance/{hash}`.
#[derive(Clone)]
pub struct HttpIssuer {
    http: reqwest::Client,
    base_url: String,
    wait_timeout: Duration,
    recheck_interval: Duration,
}

impl HttpIssuer {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpIssuer {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            recheck_interval: DEFAULT_RECHECK_INTERVAL,
        }
    }

    /// Overrides the confirmation wait budget and recheck interval.
    pub fn with_confirmation_timing(mut self, timeout: Duration, recheck: Duration) -> Self {
        self.wait_timeout = timeout;
        self.recheck_interval = recheck;
        self
    }

    async fn fetch_status(&self, hash: &TxHash) -> Result<StatusResponse, IssuerError> {
        let url = format!("{}/issuance/{}", self.base_url, hash);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(IssuerError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<StatusResponse>()
            .await
            .map_err(|e| IssuerError::Malformed(e.to_string()))
    }
}

impl Issuer for HttpIssuer {
    async fn issue(
        &self,
        payer: &Address,
        first: &AssetDescriptor,
        second: &AssetDescriptor,
    ) -> Result<TxHash, IssuerError> {
        let url = format!("{}/issue", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&IssueRequest {
                payer,
                assets: [first, second],
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(IssuerError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .json::<IssueResponse>()
            .await
            .map_err(|e| IssuerError::Malformed(e.to_string()))?;
        Ok(body.tx_hash)
    }

    async fn await_confirmation(&self, hash: &TxHash) -> Result<(), IssuerError> {
        let started = tokio::time::Instant::now();
        loop {
            match self.fetch_status(hash).await? {
                StatusResponse {
                    status: ConfirmationStatus::Confirmed,
                    ..
                } => return Ok(()),
                StatusResponse {
                    status: ConfirmationStatus::Failed,
                    reason,
                } => {
                    return Err(IssuerError::Failed {
                        hash: hash.clone(),
                        reason: reason.unwrap_or_else(|| "unspecified".to_string()),
                    });
                }
                StatusResponse {
                    status: ConfirmationStatus::Pending,
                    ..
                } => {
                    let waited = started.elapsed();
                    if waited + self.recheck_interval > self.wait_timeout {
                        return Err(IssuerError::ConfirmationTimeout {
                            hash: hash.clone(),
                            waited,
                        });
                    }
                    tokio::time::sleep(self.recheck_interval).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for HttpIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpIssuer")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
