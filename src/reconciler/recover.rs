//! Recovery pass: requeue sends claimed by a worker that died before
//! the rail call completed.
//!
//! A claim is only considered stranded once the sync time shows the
//! rail has been observed well past the claim time; a merely slow rail
//! call must not be requeued under the caller's feet.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use super::CoreContext;
use crate::ledger::LedgerError;
use crate::ledger::entities::RailTx;

/// Whether a claimed send is old enough to requeue. `time_synced` is
/// when the rail was last fully observed; without it nothing is stuck.
pub fn is_stuck(
    tx: &RailTx,
    time_synced: Option<DateTime<Utc>>,
    recovery_delay: ChronoDuration,
) -> bool {
    match (tx.time_executed, time_synced) {
        (Some(claimed_at), Some(synced)) => claimed_at < synced - recovery_delay,
        _ => false,
    }
}

pub async fn run(ctx: &CoreContext) -> Result<(), LedgerError> {
    let core = ctx.core_row().await?;
    let Some(time_synced) = core.time_synced else {
        return Ok(());
    };
    let delay = ChronoDuration::from_std(ctx.timings.recovery_delay).unwrap_or_default();
    let cutoff = time_synced - delay;

    let stuck = ctx.store.stuck_active(core.id, cutoff).await?;
    for tx in stuck {
        ctx.store.release_send(tx.id, Utc::now()).await?;
        tracing::warn!(
            core = %core.name,
            rail_tx = tx.id,
            claimed_at = ?tx.time_executed,
            "Stranded send claim requeued"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::entities::{RailKind, added_by};
    use crate::ledger::status::EntryStatus;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn active_tx(claimed_at: Option<DateTime<Utc>>) -> RailTx {
        RailTx {
            id: 1,
            rail_kind: RailKind::Crypto,
            core_id: 3,
            account_id: Some(7),
            asset_id: 1,
            user_tx_id: Some(100),
            internal_tx_id: None,
            parent_id: None,
            amount: dec!(-5),
            rail_fee: dec!(0),
            fee_asset_id: 1,
            address: None,
            address_ext: Some("dest".into()),
            external_id: None,
            external_index: None,
            send_attempts: 1,
            time_retry: None,
            time_executed: claimed_at,
            status: EntryStatus::Active,
            is_internal: false,
            added_by: added_by::USER,
        }
    }

    #[test]
    fn test_stuck_only_past_recovery_delay() {
        let synced = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let delay = ChronoDuration::hours(1);

        let old = active_tx(Some(synced - ChronoDuration::hours(2)));
        assert!(is_stuck(&old, Some(synced), delay));

        let recent = active_tx(Some(synced - ChronoDuration::minutes(30)));
        assert!(!is_stuck(&recent, Some(synced), delay));
    }

    #[test]
    fn test_nothing_stuck_without_sync_time() {
        let old = active_tx(Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()));
        assert!(!is_stuck(&old, None, ChronoDuration::hours(1)));
        assert!(!is_stuck(&active_tx(None), Some(Utc::now()), ChronoDuration::hours(1)));
    }
}
