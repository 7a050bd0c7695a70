//! Confirm pass: settle submitted movements once the rail finalizes
//! them, in submission order, one atomic family transition per row.

use super::CoreContext;
use crate::ledger::LedgerError;
use crate::ledger::entities::RailKind;
use crate::ledger::posting;
use crate::rail::TxStanding;

/// Outcome of checking one pending movement against the rail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmDecision {
    /// Settle the family now
    Settle,
    /// Not final yet; check again next pass
    Wait,
    /// The rail lost or rejected it; fail the family
    Fail,
}

/// Crypto settles at the confirmation threshold; fiat settles only on
/// explicit completion. A missing external id means the rail never had
/// (or has dropped) the transaction.
pub fn confirm_decision(
    kind: RailKind,
    min_confirms: i32,
    standing: TxStanding,
) -> ConfirmDecision {
    match (kind, standing) {
        (RailKind::Crypto, TxStanding::Confirms(n)) if n >= min_confirms => {
            ConfirmDecision::Settle
        }
        (RailKind::Crypto, TxStanding::Confirms(_)) => ConfirmDecision::Wait,
        (_, TxStanding::Completed) => ConfirmDecision::Settle,
        (_, TxStanding::Failed) | (_, TxStanding::Missing) => ConfirmDecision::Fail,
        (RailKind::Fiat, TxStanding::Confirms(_)) => ConfirmDecision::Wait,
    }
}

pub async fn run(ctx: &CoreContext) -> Result<(), LedgerError> {
    let core = ctx.core_row().await?;
    let pending = ctx
        .store
        .pending_rail_txs(core.id, ctx.timings.batch_size)
        .await?;

    for tx in pending {
        let decision = match &tx.external_id {
            Some(external_id) => {
                let standing = ctx.rail.standing(external_id, tx.time_executed).await?;
                confirm_decision(core.rail_kind, core.min_confirms, standing)
            }
            // Pending without an external id is a bookkeeping bug
            None => {
                tracing::error!(rail_tx = tx.id, "Pending movement has no external id");
                ConfirmDecision::Fail
            }
        };

        match decision {
            ConfirmDecision::Wait => {}
            ConfirmDecision::Settle => {
                let family = ctx.store.load_family(tx.id).await?;
                let update = posting::confirm(&family, tx.rail_fee);
                ctx.store.apply_family_update(&family, &update).await?;
                if let Some(account_id) = family.rail.account_id {
                    if update.notify_funding {
                        ctx.notifier
                            .funding_event(account_id, tx.id, family.rail.amount)
                            .await;
                    }
                    if update.notify_balance {
                        ctx.notifier.balance_update(account_id).await;
                    }
                }
                tracing::info!(
                    core = %core.name,
                    rail_tx = tx.id,
                    external_id = ?tx.external_id,
                    "Movement settled"
                );
            }
            ConfirmDecision::Fail => {
                let family = ctx.store.load_family(tx.id).await?;
                let update = posting::fail(&family);
                ctx.store.apply_family_update(&family, &update).await?;
                ctx.notifier
                    .admin_alert(&format!(
                        "Movement {} failed on rail (core {}, external id {:?})",
                        tx.id, core.name, tx.external_id
                    ))
                    .await;
                tracing::error!(
                    core = %core.name,
                    rail_tx = tx.id,
                    external_id = ?tx.external_id,
                    "Movement failed on rail"
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_settles_at_threshold() {
        assert_eq!(
            confirm_decision(RailKind::Crypto, 3, TxStanding::Confirms(2)),
            ConfirmDecision::Wait
        );
        assert_eq!(
            confirm_decision(RailKind::Crypto, 3, TxStanding::Confirms(3)),
            ConfirmDecision::Settle
        );
    }

    #[test]
    fn test_fiat_needs_explicit_completion() {
        assert_eq!(
            confirm_decision(RailKind::Fiat, 0, TxStanding::Confirms(100)),
            ConfirmDecision::Wait
        );
        assert_eq!(
            confirm_decision(RailKind::Fiat, 0, TxStanding::Completed),
            ConfirmDecision::Settle
        );
    }

    #[test]
    fn test_missing_and_failed_standings_fail() {
        for kind in [RailKind::Crypto, RailKind::Fiat] {
            assert_eq!(
                confirm_decision(kind, 1, TxStanding::Missing),
                ConfirmDecision::Fail
            );
            assert_eq!(
                confirm_decision(kind, 1, TxStanding::Failed),
                ConfirmDecision::Fail
            );
        }
    }
}
