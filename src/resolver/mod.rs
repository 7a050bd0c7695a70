//! Account resolution for externally observed transactions.
//!
//! The sync pass hands every new rail event here. Routing is a pure
//! decision over the address registry; the async wrapper then loads or
//! creates the target account and applies the posting batch.

use rust_decimal::Decimal;

use crate::ledger::entities::{AddressKind, AddressRecord, Asset, CoreRow, ObservedTx};
use crate::ledger::posting::{self, DepositParams, Rates};
use crate::ledger::store::{AppliedBatch, LedgerStore};
use crate::ledger::{AccountId, LedgerError};
use crate::notify::Notifier;

/// Where an observed event should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// One of our wallet-management addresses: internal rebalancing
    Internal,
    /// No user posting: dust below the deposit minimum, or an outgoing
    /// event we have no record of
    NonUser,
    /// Straight deposit to the registered account
    User { account_id: AccountId },
    /// Address registered under a different asset: deposit to a sibling
    /// account of the same owner, found or created by the caller
    CrossAsset { via_account: AccountId },
    /// Unknown address: credit the unclaimed admin account and register
    /// the address so the next event routes directly
    Unclaimed,
}

/// Decide the route for one observed event. `entry` is the registry row
/// for the event's address, when one exists.
pub fn route(entry: Option<&AddressRecord>, asset: &Asset, obs: &ObservedTx) -> Route {
    if let Some(e) = entry {
        if e.kind == AddressKind::Internal {
            return Route::Internal;
        }
    }

    // Outgoing events either matched an existing send by external id
    // before reaching the resolver, or nobody we know initiated them.
    if obs.amount < Decimal::ZERO {
        return Route::NonUser;
    }

    match entry {
        None => Route::Unclaimed,
        Some(e) => {
            if obs.amount < asset.deposit_min {
                Route::NonUser
            } else if e.asset_id != obs.asset_id {
                Route::CrossAsset {
                    via_account: e.account_id,
                }
            } else {
                Route::User {
                    account_id: e.account_id,
                }
            }
        }
    }
}

/// Resolve one observed event and persist its posting batch. Returns
/// None when the event was already mirrored.
pub async fn resolve_observed(
    store: &LedgerStore,
    notifier: &dyn Notifier,
    core: &CoreRow,
    rates: Rates,
    obs: &ObservedTx,
) -> Result<Option<AppliedBatch>, LedgerError> {
    if store
        .rail_tx_exists(core.id, &obs.external_id, obs.index)
        .await?
    {
        return Ok(None);
    }

    let asset = store
        .asset_by_id(obs.asset_id)
        .await?
        .ok_or_else(|| LedgerError::AssetNotFound(obs.asset_id.to_string()))?;

    let entry = match &obs.address {
        Some(address) => store.address_entry(core.id, address).await?,
        None => None,
    };

    if obs.amount < Decimal::ZERO && entry.is_none() {
        // An outgoing event may be our own send, observed before the
        // acknowledge step committed. Attach it instead of double-posting.
        if let Some(address) = &obs.address {
            if let Some(inflight) = store
                .inflight_send_matching(core.id, address, obs.amount)
                .await?
            {
                store
                    .mark_send_accepted(inflight.id, &obs.external_id, -obs.fee.abs(), obs.time)
                    .await?;
                let family = store.load_family(inflight.id).await?;
                let update = posting::finalize(&family, obs.time);
                store.apply_family_update(&family, &update).await?;
                tracing::info!(
                    core = %core.name,
                    rail_tx = inflight.id,
                    external_id = %obs.external_id,
                    "Observed transaction attached to an in-flight send"
                );
                return Ok(None);
            }
        }
        tracing::warn!(
            core = %core.name,
            external_id = %obs.external_id,
            amount = %obs.amount,
            "Unidentified outgoing transaction observed"
        );
        notifier
            .admin_alert(&format!(
                "Unidentified send on core {}: tx {} amount {}",
                core.name, obs.external_id, obs.amount
            ))
            .await;
    }

    let batch = match route(entry.as_ref(), &asset, obs) {
        Route::Internal => posting::internal_move(core, rates, obs),
        Route::NonUser => posting::non_user_posting(core, &asset, rates, obs),
        Route::User { account_id } => {
            let account = store
                .account_by_id(account_id)
                .await?
                .ok_or(LedgerError::AccountNotFound(account_id))?;
            posting::deposit(&DepositParams {
                account: &account,
                asset: &asset,
                core,
                rates,
                observed: obs,
            })
        }
        Route::CrossAsset { via_account } => {
            let via = store
                .account_by_id(via_account)
                .await?
                .ok_or(LedgerError::AccountNotFound(via_account))?;
            let account = sibling_account(store, &via, &asset).await?;
            tracing::info!(
                core = %core.name,
                address_account = via.id,
                target_account = account.id,
                asset = %asset.code,
                "Cross-asset deposit routed to sibling account"
            );
            posting::deposit(&DepositParams {
                account: &account,
                asset: &asset,
                core,
                rates,
                observed: obs,
            })
        }
        Route::Unclaimed => {
            let account = store.unclaimed_account(asset.id).await?;
            if let Some(address) = &obs.address {
                store
                    .register_address(core.id, asset.id, account.id, address, AddressKind::User)
                    .await?;
            }
            tracing::warn!(
                core = %core.name,
                external_id = %obs.external_id,
                "Deposit to unregistered address routed to the unclaimed account"
            );
            notifier
                .admin_alert(&format!(
                    "Deposit to unknown address on core {}: tx {}",
                    core.name, obs.external_id
                ))
                .await;
            posting::deposit(&DepositParams {
                account: &account,
                asset: &asset,
                core,
                rates,
                observed: obs,
            })
        }
    };

    let applied = store.apply_batch(&batch).await?;
    Ok(Some(applied))
}

/// Account of the same owner holding `asset`, created on first use. The
/// unclaimed owner (None) maps to the per-asset unclaimed account.
async fn sibling_account(
    store: &LedgerStore,
    via: &crate::ledger::entities::Account,
    asset: &Asset,
) -> Result<crate::ledger::entities::Account, LedgerError> {
    match via.owner_id {
        Some(owner) => {
            if let Some(acct) = store.account_for_owner(owner, asset.id).await? {
                return Ok(acct);
            }
            let number = format!("{}-{}", owner, asset.code.to_lowercase());
            store
                .create_account(asset.id, &number, via.name.as_deref(), Some(owner))
                .await
        }
        // Administrative addresses stay administrative across assets
        None => store.unclaimed_account(asset.id).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::entities::ObservedState;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn asset(id: i64, deposit_min: Decimal) -> Asset {
        Asset {
            id,
            code: "BTC".into(),
            ticker: "BTC".into(),
            is_crypto: true,
            core_type: "BTC".into(),
            fee_rate: dec!(0),
            fee_flat: dec!(0),
            fee_min: dec!(0),
            deposit_min,
        }
    }

    fn entry(asset_id: i64, account_id: i64, kind: AddressKind) -> AddressRecord {
        AddressRecord {
            id: 1,
            core_id: 3,
            asset_id,
            account_id,
            address: "1abc".into(),
            kind,
            amount_received: dec!(0),
        }
    }

    fn obs(asset_id: i64, amount: Decimal) -> ObservedTx {
        ObservedTx {
            external_id: "txid".into(),
            address: Some("1abc".into()),
            address_ext: None,
            asset_id,
            amount,
            fee: dec!(0),
            fee_asset_id: asset_id,
            confirmations: 0,
            block_number: 1,
            index: Some(0),
            time: Utc::now(),
            state: ObservedState::Pending,
        }
    }

    #[test]
    fn test_known_user_address_routes_to_account() {
        let e = entry(1, 7, AddressKind::User);
        let r = route(Some(&e), &asset(1, dec!(0.0001)), &obs(1, dec!(1)));
        assert_eq!(r, Route::User { account_id: 7 });
    }

    #[test]
    fn test_internal_address_wins_over_everything() {
        let e = entry(1, 7, AddressKind::Internal);
        assert_eq!(
            route(Some(&e), &asset(1, dec!(0)), &obs(1, dec!(1))),
            Route::Internal
        );
        assert_eq!(
            route(Some(&e), &asset(1, dec!(0)), &obs(1, dec!(-1))),
            Route::Internal
        );
    }

    #[test]
    fn test_dust_below_deposit_min_is_not_credited() {
        let e = entry(1, 7, AddressKind::User);
        let r = route(Some(&e), &asset(1, dec!(0.01)), &obs(1, dec!(0.005)));
        assert_eq!(r, Route::NonUser);
    }

    #[test]
    fn test_cross_asset_routes_via_address_account() {
        let e = entry(1, 7, AddressKind::User);
        let r = route(Some(&e), &asset(2, dec!(0)), &obs(2, dec!(5)));
        assert_eq!(r, Route::CrossAsset { via_account: 7 });
    }

    #[test]
    fn test_unknown_address_goes_unclaimed() {
        let r = route(None, &asset(1, dec!(0)), &obs(1, dec!(5)));
        assert_eq!(r, Route::Unclaimed);
    }

    #[test]
    fn test_unmatched_outgoing_is_non_user() {
        let r = route(None, &asset(1, dec!(0)), &obs(1, dec!(-5)));
        assert_eq!(r, Route::NonUser);
        let e = entry(1, 7, AddressKind::User);
        let r = route(Some(&e), &asset(1, dec!(0)), &obs(1, dec!(-5)));
        assert_eq!(r, Route::NonUser);
    }
}
