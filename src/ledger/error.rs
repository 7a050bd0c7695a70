use rust_decimal::Decimal;
use thiserror::Error;

use super::status::EntryStatus;
use crate::rail::RailError;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Asset not found: {0}")]
    AssetNotFound(String),
    #[error("Account not found: {0}")]
    AccountNotFound(i64),
    #[error("Account number not found: {0}")]
    AccountNumberNotFound(String),
    #[error("Core not found: {0}")]
    CoreNotFound(String),
    #[error("Rail transaction not found: {0}")]
    RailTxNotFound(i64),
    #[error(
        "Insufficient available balance on account {account}: available {available}, required {required}"
    )]
    InsufficientBalance {
        account: String,
        available: Decimal,
        required: Decimal,
    },
    #[error("Invalid amount")]
    InvalidAmount,
    #[error("Invalid address")]
    InvalidAddress,
    #[error("Cannot cancel rail transaction {id} in status {status}")]
    NotCancelable { id: i64, status: EntryStatus },
    #[error("Rail transaction {id} left status {expected} concurrently")]
    StatusRace { id: i64, expected: EntryStatus },
    #[error("Unknown status id {0} in stored row")]
    UnknownStatus(i16),
    #[error("Unknown kind id {0} in stored row")]
    UnknownKind(i16),
    #[error("Rail error: {0}")]
    Rail(#[from] RailError),
}
