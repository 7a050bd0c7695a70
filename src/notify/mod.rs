//! Outbound notifications.
//!
//! Fired after commit, never inside a transaction; a lost notification
//! is acceptable, a phantom one is not.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::fmt::Debug;

use crate::ledger::entities::{AccountId, EntryId};

/// Sink for events downstream systems care about.
#[async_trait]
pub trait Notifier: Send + Sync + Debug {
    /// A movement settled (deposit confirmed, send confirmed)
    async fn funding_event(&self, account_id: AccountId, rail_tx_id: EntryId, amount: Decimal);

    /// An account's balances changed
    async fn balance_update(&self, account_id: AccountId);

    /// Something needs a human: unidentified sends, repeated failures
    async fn admin_alert(&self, message: &str);
}

/// Default sink: structured log lines only.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn funding_event(&self, account_id: AccountId, rail_tx_id: EntryId, amount: Decimal) {
        tracing::info!(
            account_id,
            rail_tx_id,
            %amount,
            "Funding event settled"
        );
    }

    async fn balance_update(&self, account_id: AccountId) {
        tracing::debug!(account_id, "Balance updated");
    }

    async fn admin_alert(&self, message: &str) {
        tracing::warn!(alert = message, "Admin attention required");
    }
}
