//! Rail adapter interface.
//!
//! A "rail" is the external system of record for value movement: a
//! blockchain node or a fiat payment processor. Concrete RPC/gateway
//! clients live outside this crate; the reconciler only sees this
//! capability set.

pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt::Debug;
use thiserror::Error;

use crate::ledger::entities::{AssetId, ObservedTx, RailKind};

pub use mock::MockRail;

#[derive(Debug, Error)]
pub enum RailError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Invalid address format")]
    InvalidAddress,
    #[error("Unsupported asset")]
    UnsupportedAsset,
    #[error("Transaction not found: {0}")]
    TxNotFound(String),
    #[error("Operation not supported by this rail")]
    Unsupported,
}

/// Result of a send/pull call against the rail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Rail accepted the movement and assigned an external id
    Accepted { external_id: String, fee: Decimal },
    /// The rail-side wallet/account lacks funds; retry later
    InsufficientBalance,
    /// Rail rejected the movement
    Failed(String),
}

/// Where an already-submitted transaction stands on the rail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStanding {
    /// Crypto rails: current confirmation count
    Confirms(i32),
    /// Fiat rails: explicit completion
    Completed,
    /// Rail reports the transaction as failed
    Failed,
    /// The external id is unknown to the rail
    Missing,
}

/// One miner/processor fee option. `fee_quote` returns options ordered
/// from fastest to slowest, evenly spaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeOption {
    pub asset_id: AssetId,
    pub fee: Decimal,
    pub blocks: i32,
    pub seconds: i32,
}

/// Request payload for an outgoing send (or incoming pull) on the rail.
#[derive(Debug, Clone)]
pub struct RailSendRequest {
    pub asset_code: String,
    /// Positive magnitude to move
    pub amount: Decimal,
    pub address: Option<String>,
    /// Earlier quoted fee the rail should aim for
    pub fee_hint: Decimal,
    /// Our-side record id, usable as an idempotency key
    pub reference: i64,
}

/// Capability set every rail instance implements.
///
/// All calls are synchronous from the reconciler's viewpoint; failures
/// propagate as `RailError` or a non-accepted `SendOutcome`, and the
/// caller never retries within one call.
#[async_trait]
pub trait Rail: Send + Sync + Debug {
    fn kind(&self) -> RailKind;

    /// Balance held on the rail side. `address` of None means the main
    /// wallet/account.
    async fn balance(&self, address: Option<&str>) -> Result<Decimal, RailError>;

    /// Syntactic validity of an external address
    fn validate_address(&self, address: &str) -> bool;

    /// Whether the address belongs to this node/wallet
    async fn owns_address(&self, address: &str) -> Result<bool, RailError>;

    /// Some rails cannot send to certain valid addresses (e.g. their own
    /// node address); default is permissive.
    async fn can_send_to(&self, _address: &str) -> Result<bool, RailError> {
        Ok(true)
    }

    /// Generate a fresh deposit address
    async fn new_address(&self) -> Result<String, RailError>;

    /// The address outbound sends originate from, when the rail has one
    async fn main_address(&self) -> Result<Option<String>, RailError> {
        Ok(None)
    }

    /// Look up the legs of one external transaction
    async fn tx_details(&self, external_id: &str) -> Result<Vec<ObservedTx>, RailError>;

    /// List transactions observed after an external position (block
    /// height or rail cursor)
    async fn list_since(&self, position: i64) -> Result<Vec<ObservedTx>, RailError>;

    /// Confirmation count or final status for a submitted transaction
    async fn standing(
        &self,
        external_id: &str,
        time_sent: Option<DateTime<Utc>>,
    ) -> Result<TxStanding, RailError>;

    /// Latest external position, used to advance the sync checkpoint
    async fn tip_position(&self) -> Result<i64, RailError>;

    /// Quote `number` fee options for moving `amount`, fastest first
    async fn fee_quote(
        &self,
        asset_code: &str,
        amount: Decimal,
        address_from: Option<&str>,
        address_to: Option<&str>,
        number: usize,
    ) -> Result<Vec<FeeOption>, RailError>;

    /// Submit an outgoing movement
    async fn send(&self, request: &RailSendRequest) -> Result<SendOutcome, RailError>;

    /// Charge an external funding source (fiat rails only)
    async fn pull(&self, _request: &RailSendRequest) -> Result<SendOutcome, RailError> {
        Err(RailError::Unsupported)
    }
}
