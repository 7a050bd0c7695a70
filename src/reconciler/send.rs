//! Send pass: push queued outgoing movements to the rail.
//!
//! Each candidate is claimed with a compare-and-swap (NEW -> ACTIVE,
//! attempt counter bumped) in its own transaction before the rail call,
//! so a crash mid-call leaves an ACTIVE row for the recovery pass rather
//! than a double send.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use super::CoreContext;
use crate::ledger::entities::{CoreRow, RailTx};
use crate::ledger::posting;
use crate::ledger::status::EntryStatus;
use crate::ledger::LedgerError;
use crate::rail::{RailSendRequest, SendOutcome};

/// What to do with a claimed send after the rail call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendDisposition {
    /// Requeue: NEW again, retry no earlier than `at`
    Retry { at: DateTime<Utc> },
    /// Permanent failure, cascade across the family
    FailCascade,
    /// Rail took it; record the id and move the family along
    Accepted {
        external_id: String,
        rail_fee: rust_decimal::Decimal,
    },
}

/// Decide the disposition for one rail outcome. Internal moves stop
/// retrying after `max_internal_attempts`; user sends requeue until an
/// operator cancels them.
pub fn send_disposition(
    tx: &RailTx,
    outcome: &SendOutcome,
    max_internal_attempts: i32,
    retry_delay: ChronoDuration,
    now: DateTime<Utc>,
) -> SendDisposition {
    match outcome {
        SendOutcome::Accepted { external_id, fee } => SendDisposition::Accepted {
            external_id: external_id.clone(),
            rail_fee: -fee.abs(),
        },
        SendOutcome::InsufficientBalance | SendOutcome::Failed(_) => {
            if tx.is_internal && tx.send_attempts > max_internal_attempts {
                SendDisposition::FailCascade
            } else {
                SendDisposition::Retry {
                    at: now + retry_delay,
                }
            }
        }
    }
}

/// An internal move chained under another movement may only go out once
/// its parent has settled.
pub fn parent_blocks_send(tx: &RailTx, parent_status: Option<EntryStatus>) -> bool {
    if !tx.is_internal || tx.parent_id.is_none() {
        return false;
    }
    parent_status != Some(EntryStatus::Success)
}

pub async fn run(ctx: &CoreContext) -> Result<(), LedgerError> {
    let core = ctx.core_row().await?;
    let now = Utc::now();
    let candidates = ctx
        .store
        .sendable_rail_txs(core.id, now, ctx.timings.batch_size)
        .await?;

    for tx in candidates {
        if let Err(e) = process_one(ctx, &core, &tx, now).await {
            tracing::error!(core = %core.name, rail_tx = tx.id, error = %e, "Send failed");
            return Err(e);
        }
    }
    Ok(())
}

async fn process_one(
    ctx: &CoreContext,
    core: &CoreRow,
    tx: &RailTx,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    let retry_unconfirmed =
        ChronoDuration::from_std(ctx.timings.retry_unconfirmed_delay).unwrap_or_default();
    let retry_balance =
        ChronoDuration::from_std(ctx.timings.retry_balance_delay).unwrap_or_default();

    // Chained internal moves wait for their parent to settle
    if tx.is_internal {
        if let Some(parent_id) = tx.parent_id {
            let parent_status = ctx
                .store
                .rail_tx_by_id(parent_id)
                .await?
                .map(|p| p.status);
            if parent_blocks_send(tx, parent_status) {
                ctx.store.defer_send(tx.id, now + retry_unconfirmed).await?;
                tracing::debug!(rail_tx = tx.id, parent = parent_id, "Send deferred; parent unsettled");
                return Ok(());
            }
        }
    }

    // Unit 1: claim. Losing the race just means another worker has it.
    let Some(claimed) = ctx.store.claim_send(tx.id, now).await? else {
        return Ok(());
    };

    let asset = ctx
        .store
        .asset_by_id(claimed.asset_id)
        .await?
        .ok_or_else(|| LedgerError::AssetNotFound(claimed.asset_id.to_string()))?;

    // Unit 2: the rail call and its outcome
    let request = RailSendRequest {
        asset_code: asset.code.clone(),
        amount: claimed.amount.abs(),
        address: claimed.address_ext.clone(),
        fee_hint: claimed.rail_fee.abs(),
        reference: claimed.id,
    };

    let outcome = match ctx.rail.send(&request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            // Transport error: the rail may or may not have seen it.
            // Requeue on the balance timer and let confirmation dedupe.
            tracing::warn!(rail_tx = claimed.id, error = %e, "Rail send errored; requeued");
            ctx.store
                .release_send(claimed.id, now + retry_balance)
                .await?;
            return Ok(());
        }
    };

    match send_disposition(
        &claimed,
        &outcome,
        ctx.timings.max_internal_attempts,
        retry_balance,
        now,
    ) {
        SendDisposition::Accepted {
            external_id,
            rail_fee,
        } => {
            ctx.store
                .mark_send_accepted(claimed.id, &external_id, rail_fee, now)
                .await?;
            // Reload so finalize sees the rail-reported fee
            let family = ctx.store.load_family(claimed.id).await?;
            let update = posting::finalize(&family, now);
            ctx.store.apply_family_update(&family, &update).await?;
            if update.notify_balance {
                if let Some(account_id) = family.rail.account_id {
                    ctx.notifier.balance_update(account_id).await;
                }
            }
            tracing::info!(
                core = %core.name,
                rail_tx = claimed.id,
                external_id = %external_id,
                "Send accepted by rail"
            );
        }
        SendDisposition::Retry { at } => {
            ctx.store.release_send(claimed.id, at).await?;
            tracing::warn!(
                core = %core.name,
                rail_tx = claimed.id,
                attempts = claimed.send_attempts,
                outcome = ?outcome,
                "Send requeued"
            );
        }
        SendDisposition::FailCascade => {
            let family = ctx.store.load_family(claimed.id).await?;
            let update = posting::fail(&family);
            ctx.store.apply_family_update(&family, &update).await?;
            ctx.notifier
                .admin_alert(&format!(
                    "Internal move {} failed permanently after {} attempts on core {}",
                    claimed.id, claimed.send_attempts, core.name
                ))
                .await;
            tracing::error!(
                core = %core.name,
                rail_tx = claimed.id,
                attempts = claimed.send_attempts,
                "Send failed permanently"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::entities::{RailKind, added_by};
    use rust_decimal_macros::dec;

    fn rail_tx(is_internal: bool, attempts: i32) -> RailTx {
        RailTx {
            id: 1,
            rail_kind: RailKind::Crypto,
            core_id: 3,
            account_id: Some(7),
            asset_id: 1,
            user_tx_id: Some(100),
            internal_tx_id: None,
            parent_id: if is_internal { Some(9) } else { None },
            amount: dec!(-5),
            rail_fee: dec!(-0.01),
            fee_asset_id: 1,
            address: None,
            address_ext: Some("dest".into()),
            external_id: None,
            external_index: None,
            send_attempts: attempts,
            time_retry: None,
            time_executed: None,
            status: EntryStatus::Active,
            is_internal,
            added_by: added_by::USER,
        }
    }

    #[test]
    fn test_accepted_normalizes_fee_sign() {
        let d = send_disposition(
            &rail_tx(false, 1),
            &SendOutcome::Accepted {
                external_id: "txid".into(),
                fee: dec!(0.02),
            },
            10,
            ChronoDuration::hours(1),
            Utc::now(),
        );
        assert_eq!(
            d,
            SendDisposition::Accepted {
                external_id: "txid".into(),
                rail_fee: dec!(-0.02),
            }
        );
    }

    #[test]
    fn test_user_send_keeps_retrying() {
        let now = Utc::now();
        let d = send_disposition(
            &rail_tx(false, 50),
            &SendOutcome::Failed("rejected".into()),
            10,
            ChronoDuration::hours(1),
            now,
        );
        assert_eq!(
            d,
            SendDisposition::Retry {
                at: now + ChronoDuration::hours(1)
            }
        );
    }

    #[test]
    fn test_internal_move_fails_after_max_attempts() {
        let now = Utc::now();
        // The cap counts completed attempts, so the 10th still requeues
        let at_cap = send_disposition(
            &rail_tx(true, 10),
            &SendOutcome::InsufficientBalance,
            10,
            ChronoDuration::hours(1),
            now,
        );
        assert!(matches!(at_cap, SendDisposition::Retry { .. }));

        let over = send_disposition(
            &rail_tx(true, 11),
            &SendOutcome::InsufficientBalance,
            10,
            ChronoDuration::hours(1),
            now,
        );
        assert_eq!(over, SendDisposition::FailCascade);
    }

    #[test]
    fn test_parent_gates_internal_sends_only() {
        let internal = rail_tx(true, 0);
        assert!(parent_blocks_send(&internal, Some(EntryStatus::Pending)));
        assert!(parent_blocks_send(&internal, None));
        assert!(!parent_blocks_send(&internal, Some(EntryStatus::Success)));

        let user = rail_tx(false, 0);
        assert!(!parent_blocks_send(&user, Some(EntryStatus::Pending)));
    }
}
