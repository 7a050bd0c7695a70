//! Sync pass: pull observed rail events into the ledger.
//!
//! Events are read from the last fully-processed external position,
//! resolved one at a time, and the checkpoint only advances past an
//! event once its batch committed. Everything downstream of the
//! checkpoint is idempotent against replays via the external-id dedupe.

use chrono::Utc;

use super::CoreContext;
use crate::ledger::LedgerError;
use crate::resolver;

pub async fn run(ctx: &CoreContext, iteration: u64) -> Result<(), LedgerError> {
    let core = ctx.core_row().await?;

    let events = ctx.rail.list_since(core.last_sync_block).await?;
    let mut position = core.last_sync_block;

    let mut sorted = events;
    sorted.sort_by_key(|e| (e.block_number, e.index));

    for obs in &sorted {
        let rates = ctx.rates.rates(obs.asset_id, obs.fee_asset_id);
        match resolver::resolve_observed(&ctx.store, ctx.notifier.as_ref(), &core, rates, obs)
            .await?
        {
            Some(applied) => {
                tracing::info!(
                    core = %core.name,
                    external_id = %obs.external_id,
                    amount = %obs.amount,
                    rail_tx = ?applied.rail_tx_id,
                    "Observed transaction mirrored"
                );
                if let Some(account_id) = applied.account_id {
                    if applied.notify_funding {
                        if let Some(rail_tx_id) = applied.rail_tx_id {
                            ctx.notifier
                                .funding_event(account_id, rail_tx_id, obs.amount)
                                .await;
                        }
                    }
                    if applied.notify_balance {
                        ctx.notifier.balance_update(account_id).await;
                    }
                }
            }
            None => {
                tracing::debug!(
                    core = %core.name,
                    external_id = %obs.external_id,
                    "Observed transaction already known"
                );
            }
        }
        if obs.block_number > position {
            position = obs.block_number;
        }
    }

    ctx.store
        .set_sync_checkpoint(core.id, position, Utc::now())
        .await?;

    if ctx.timings.snapshot_every > 0 && iteration % ctx.timings.snapshot_every == 0 {
        snapshot_rail_balances(ctx).await?;
    }
    Ok(())
}

/// Periodic snapshot of what the rail itself holds, for drift audits
/// against the ledger's system totals. One figure per core: the rail
/// reports a wallet-level balance, not a per-asset one.
async fn snapshot_rail_balances(ctx: &CoreContext) -> Result<(), LedgerError> {
    let core = ctx.core_row().await?;
    match ctx.rail.balance(None).await {
        Ok(balance) => {
            ctx.store.record_core_balance(core.id, balance).await?;
            tracing::debug!(core = %core.name, %balance, "Rail balance recorded");
        }
        Err(e) => {
            tracing::warn!(core = %core.name, error = %e, "Rail balance unavailable");
        }
    }
    Ok(())
}
