//! User-facing operations: submitting sends, manual state transitions,
//! account-to-account moves, deposit address issuance.
//!
//! This layer validates and orchestrates; all multi-leg construction is
//! the posting engine's and everything it persists goes through the
//! store's atomic batch application.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;

use crate::ledger::entities::{Account, AddressKind, EntryKind, UserId};
use crate::ledger::posting::{self, SendParams};
use crate::ledger::store::{AppliedBatch, LedgerStore};
use crate::ledger::{EntryId, LedgerError};
use crate::notify::Notifier;
use crate::rail::Rail;
use crate::reconciler::RateSource;

pub struct CustodyService {
    store: LedgerStore,
    notifier: Arc<dyn Notifier>,
    rates: Arc<dyn RateSource>,
    rails: HashMap<String, Arc<dyn Rail>>,
}

impl CustodyService {
    pub fn new(
        store: LedgerStore,
        notifier: Arc<dyn Notifier>,
        rates: Arc<dyn RateSource>,
    ) -> Self {
        Self {
            store,
            notifier,
            rates,
            rails: HashMap::new(),
        }
    }

    pub fn add_rail(&mut self, core_name: &str, rail: Arc<dyn Rail>) {
        self.rails.insert(core_name.to_string(), rail);
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    fn rail_for(&self, core_name: &str) -> Result<&Arc<dyn Rail>, LedgerError> {
        self.rails
            .get(core_name)
            .ok_or_else(|| LedgerError::CoreNotFound(core_name.to_string()))
    }

    /// Queue an outgoing send. Validates the address and the available
    /// balance; on success the whole leg family sits in NEW (or
    /// PENDING_ADMIN) waiting for the send pass.
    pub async fn submit_send(
        &self,
        core_name: &str,
        account_number: &str,
        amount: Decimal,
        address: &str,
        created_by: Option<UserId>,
        requires_approval: bool,
    ) -> Result<AppliedBatch, LedgerError> {
        let core = self
            .store
            .core_by_name(core_name)
            .await?
            .ok_or_else(|| LedgerError::CoreNotFound(core_name.to_string()))?;
        let rail = self.rail_for(core_name)?;

        if !rail.validate_address(address) || !rail.can_send_to(address).await? {
            return Err(LedgerError::InvalidAddress);
        }

        let account = self.account(account_number).await?;
        let asset = self
            .store
            .asset_by_id(account.asset_id)
            .await?
            .ok_or_else(|| LedgerError::AssetNotFound(account.asset_id.to_string()))?;

        let quotes = rail
            .fee_quote(&asset.code, amount, None, Some(address), 1)
            .await?;
        let fee_quote = quotes
            .first()
            .ok_or(crate::rail::RailError::UnsupportedAsset)?;

        let rates = self.rates.rates(asset.id, fee_quote.asset_id);
        let batch = posting::send(&SendParams {
            account: &account,
            asset: &asset,
            core: &core,
            rates,
            amount,
            address: address.to_string(),
            fee_quote,
            created_by,
            requires_approval,
        })?;

        let applied = self.store.apply_batch(&batch).await?;
        if applied.notify_balance {
            self.notifier.balance_update(account.id).await;
        }
        tracing::info!(
            core = core_name,
            account = account_number,
            %amount,
            rail_tx = ?applied.rail_tx_id,
            "Send queued"
        );
        Ok(applied)
    }

    /// Cancel a send that has not reached the rail yet.
    pub async fn cancel_send(&self, rail_tx_id: EntryId) -> Result<(), LedgerError> {
        let family = self.store.load_family(rail_tx_id).await?;
        let update = posting::cancel(&family)?;
        self.store.apply_family_update(&family, &update).await?;
        if update.notify_balance {
            if let Some(account_id) = family.rail.account_id {
                self.notifier.balance_update(account_id).await;
            }
        }
        tracing::info!(rail_tx = rail_tx_id, "Send canceled");
        Ok(())
    }

    /// Release a held send into the queue. A no-op with a warning when
    /// the record is not waiting for approval.
    pub async fn approve_send(&self, rail_tx_id: EntryId) -> Result<bool, LedgerError> {
        let family = self.store.load_family(rail_tx_id).await?;
        match posting::approve(&family) {
            Some(update) => {
                self.store.apply_family_update(&family, &update).await?;
                tracing::info!(rail_tx = rail_tx_id, "Send approved");
                Ok(true)
            }
            None => {
                tracing::warn!(
                    rail_tx = rail_tx_id,
                    status = %family.rail.status,
                    "Approval ignored; not awaiting approval"
                );
                Ok(false)
            }
        }
    }

    /// Same-asset move between two ledger accounts, settled immediately.
    pub async fn move_funds(
        &self,
        from_number: &str,
        to_number: &str,
        amount: Decimal,
        kind: EntryKind,
        created_by: Option<UserId>,
    ) -> Result<(EntryId, EntryId), LedgerError> {
        let from = self.account(from_number).await?;
        let to = self.account(to_number).await?;

        let rates = self.rates.rates(from.asset_id, from.asset_id);
        let mv = posting::move_funds(&from, &to, amount, kind, rates.asset, created_by, Utc::now())?;
        let ids = self.store.apply_move(&mv).await?;

        self.notifier.balance_update(from.id).await;
        self.notifier.balance_update(to.id).await;
        tracing::info!(
            from = from_number,
            to = to_number,
            %amount,
            "Funds moved between accounts"
        );
        Ok(ids)
    }

    /// Issue and register a fresh deposit address for an account.
    pub async fn new_deposit_address(
        &self,
        core_name: &str,
        account_number: &str,
    ) -> Result<String, LedgerError> {
        let core = self
            .store
            .core_by_name(core_name)
            .await?
            .ok_or_else(|| LedgerError::CoreNotFound(core_name.to_string()))?;
        let rail = self.rail_for(core_name)?;
        let account = self.account(account_number).await?;

        let address = rail.new_address().await?;
        self.store
            .register_address(
                core.id,
                account.asset_id,
                account.id,
                &address,
                AddressKind::User,
            )
            .await?;
        tracing::info!(core = core_name, account = account_number, %address, "Deposit address issued");
        Ok(address)
    }

    async fn account(&self, number: &str) -> Result<Account, LedgerError> {
        self.store
            .account_by_number(number)
            .await?
            .ok_or_else(|| LedgerError::AccountNumberNotFound(number.to_string()))
    }
}
