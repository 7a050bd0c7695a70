//! Balance engine.
//!
//! Balances are a materialized view over the immutable leg log: a leg
//! counts toward the running total when it is settled, or when it is
//! pending with a positive amount (uncleared deposits are shown, uncleared
//! withdrawals are not double-counted because they are already reserved).
//! The replay is a pure function so it can be re-run from any checkpoint;
//! the store wraps it in an account row lock.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;

use super::entities::LedgerEntry;
use super::status::EntryStatus;

/// Default replay checkpoint: before any leg the system can have recorded.
pub fn replay_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()
}

/// Whether a leg participates in the running total.
#[inline]
pub fn counts_toward_total(status: EntryStatus, amount: Decimal) -> bool {
    status == EntryStatus::Success || (status == EntryStatus::Pending && amount > Decimal::ZERO)
}

/// Sum of all qualifying legs strictly before `start_time`. This is the
/// base the tail replay starts from.
pub fn base_sum(entries: &[LedgerEntry], start_time: DateTime<Utc>) -> Decimal {
    entries
        .iter()
        .filter(|e| e.effective_time() < start_time)
        .filter(|e| counts_toward_total(e.status, e.amount))
        .map(|e| e.amount)
        .sum()
}

/// Result of replaying the ledger tail: the new account total and the
/// `balance_after` snapshot per replayed leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replay {
    pub balance_total: Decimal,
    pub snapshots: Vec<(i64, Decimal)>,
}

/// Replay every leg at or after `start_time` on top of `base`, in
/// ascending (effective time, id) order, producing the new total and the
/// running-balance snapshot for each replayed leg.
///
/// `entries` is the full leg log of one account; ordering is enforced
/// here so callers only need a stable fetch.
pub fn replay(entries: &[LedgerEntry], start_time: DateTime<Utc>, base: Decimal) -> Replay {
    let mut tail: Vec<&LedgerEntry> = entries
        .iter()
        .filter(|e| e.effective_time() >= start_time)
        .collect();
    tail.sort_by_key(|e| (e.effective_time(), e.id));

    let mut balance = base;
    let mut snapshots = Vec::with_capacity(tail.len());

    for entry in tail {
        if counts_toward_total(entry.status, entry.amount) {
            balance += entry.amount;
        }
        snapshots.push((entry.id, balance));
    }

    Replay {
        balance_total: balance,
        snapshots,
    }
}

/// Full recomputation from the epoch: base plus tail in one call.
pub fn replay_from(entries: &[LedgerEntry], start_time: DateTime<Utc>) -> Replay {
    replay(entries, start_time, base_sum(entries, start_time))
}

/// The audit-time total: same filter as the replay, no snapshot side
/// effects, order-independent.
pub fn calc_real_balance(entries: &[LedgerEntry]) -> Decimal {
    entries
        .iter()
        .filter(|e| counts_toward_total(e.status, e.amount))
        .map(|e| e.amount)
        .sum()
}
