//! Ledger posting engine.
//!
//! Turns one economic event into the full correlated leg family, and one
//! state-machine transition into the full cascade across that family.
//! Everything here is pure construction: drafts reference each other by
//! arena slot (index into the batch vectors) and the store resolves slots
//! to row ids inside a single transaction. That keeps the multi-leg
//! invariants unit-testable without a database and removes the
//! insert-then-relink ordering dance entirely.

use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;

use super::entities::{
    Account, AccountId, Asset, AssetId, CoreId, CoreRow, EntryId, EntryKind, InternalEntry,
    LedgerEntry, ObservedState, ObservedTx, RailKind, RailTx, SystemEntry, SystemKind, UserId,
    added_by,
};
use super::error::LedgerError;
use super::status::EntryStatus;
use crate::rail::FeeOption;

/// Exchange rates to the main asset, captured at posting time.
#[derive(Debug, Clone, Copy)]
pub struct Rates {
    pub asset: Decimal,
    pub fee_asset: Decimal,
}

impl Rates {
    pub fn flat() -> Self {
        Rates {
            asset: Decimal::ONE,
            fee_asset: Decimal::ONE,
        }
    }
}

/// Balance deltas applied to the owning account under its row lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountPatch {
    pub d_total: Decimal,
    pub d_reserved: Decimal,
    pub d_pending: Decimal,
}

impl AccountPatch {
    pub fn is_empty(&self) -> bool {
        self.d_total.is_zero() && self.d_reserved.is_zero() && self.d_pending.is_zero()
    }
}

/// Draft of a user-visible leg. Always in the account's asset.
#[derive(Debug, Clone)]
pub struct DraftEntry {
    pub asset_id: AssetId,
    pub amount: Decimal,
    pub kind: EntryKind,
    pub status: EntryStatus,
    pub ex_rate: Decimal,
    pub balance_after: Decimal,
    pub created_by: Option<UserId>,
    pub time_executed: Option<DateTime<Utc>>,
    /// Slot of the principal this fee leg belongs to
    pub parent: Option<usize>,
}

/// Draft of a wallet-level internal leg.
#[derive(Debug, Clone)]
pub struct DraftInternal {
    pub asset_id: AssetId,
    pub amount: Decimal,
    pub status: EntryStatus,
    pub ex_rate: Decimal,
    pub time_executed: Option<DateTime<Utc>>,
    /// Slot (into `entries`) of the user leg this internal leg funds
    pub user_tx: Option<usize>,
    /// Slot (into `internals`) of the prior internal leg in the chain
    pub parent: Option<usize>,
}

/// Draft of the rail-backed record.
#[derive(Debug, Clone)]
pub struct DraftRailTx {
    pub rail_kind: RailKind,
    pub core_id: CoreId,
    pub account_id: Option<AccountId>,
    pub asset_id: AssetId,
    pub amount: Decimal,
    pub rail_fee: Decimal,
    pub fee_asset_id: AssetId,
    pub address: Option<String>,
    pub address_ext: Option<String>,
    pub external_id: Option<String>,
    pub external_index: Option<i32>,
    pub time_executed: Option<DateTime<Utc>>,
    pub status: EntryStatus,
    pub is_internal: bool,
    pub added_by: i16,
    pub user_tx: Option<usize>,
    pub internal_tx: Option<usize>,
}

/// Draft of a system-mirror leg.
#[derive(Debug, Clone)]
pub struct DraftSystem {
    pub kind: SystemKind,
    pub asset_id: AssetId,
    pub amount: Decimal,
    pub ex_rate: Decimal,
    pub status: EntryStatus,
    /// Link to the batch's rail record
    pub linked_to_rail: bool,
    /// Slot (into `systems`) of the principal mirror
    pub parent: Option<usize>,
}

/// The full correlated leg family for one event, committed atomically.
#[derive(Debug, Clone, Default)]
pub struct PostingBatch {
    pub account_id: Option<AccountId>,
    pub patch: AccountPatch,
    pub entries: Vec<DraftEntry>,
    pub internals: Vec<DraftInternal>,
    pub rail_tx: Option<DraftRailTx>,
    pub systems: Vec<DraftSystem>,
    /// Rerun the balance replay from this checkpoint after insert
    pub replay_from: Option<DateTime<Utc>>,
    /// Bump `amount_received` on this address
    pub credit_address: Option<(String, Decimal)>,
    pub notify_funding: bool,
    pub notify_balance: bool,
}

impl PostingBatch {
    /// Net user-visible effect: principal plus fee legs. Used by the
    /// double-entry audit in tests and assertions.
    pub fn net_entry_amount(&self) -> Decimal {
        self.entries.iter().map(|e| e.amount).sum()
    }
}

fn round_to_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(0)
}

/// Rail fee sign normalization: a miner/processor fee is always carried
/// as a non-positive amount; crypto rails only charge the sender, so an
/// incoming crypto event drops the fee entirely.
fn normalize_rail_fee(kind: RailKind, amount: Decimal, fee: Decimal) -> Decimal {
    if fee.is_zero() {
        return Decimal::ZERO;
    }
    match kind {
        RailKind::Crypto if amount >= Decimal::ZERO => Decimal::ZERO,
        _ => -fee.abs(),
    }
}

fn entry_kind_for(rail: RailKind) -> EntryKind {
    match rail {
        RailKind::Crypto => EntryKind::Crypto,
        RailKind::Fiat => EntryKind::Fiat,
    }
}

/// Whether an observed event counts as settled under the core's policy.
pub fn is_observed_confirmed(core: &CoreRow, obs: &ObservedTx) -> bool {
    match core.rail_kind {
        RailKind::Crypto => core.min_confirms <= obs.confirmations,
        RailKind::Fiat => obs.state == ObservedState::Completed,
    }
}

/// Inputs for recording one observed rail event against a user account.
#[derive(Debug)]
pub struct DepositParams<'a> {
    pub account: &'a Account,
    pub asset: &'a Asset,
    pub core: &'a CoreRow,
    pub rates: Rates,
    pub observed: &'a ObservedTx,
}

/// Record an observed deposit (or unidentified outgoing event) against a
/// user account: principal, fee child, internal fee legs, rail record,
/// and for outgoing events the system mirror pair.
pub fn deposit(p: &DepositParams<'_>) -> PostingBatch {
    let obs = p.observed;
    let time = round_to_seconds(obs.time);
    let rail_fee = normalize_rail_fee(p.core.rail_kind, obs.amount, obs.fee);
    let confirmed = is_observed_confirmed(p.core, obs);
    let failed = obs.state == ObservedState::Failed;
    let tx_fee = p.asset.compute_fee(obs.amount);

    let entry_status = if failed {
        EntryStatus::Failed
    } else if confirmed {
        EntryStatus::Success
    } else {
        EntryStatus::Pending
    };

    let mut batch = PostingBatch {
        account_id: Some(p.account.id),
        replay_from: (!failed).then_some(time),
        notify_funding: confirmed,
        notify_balance: !failed,
        ..Default::default()
    };

    // Principal leg
    batch.entries.push(DraftEntry {
        asset_id: p.asset.id,
        amount: obs.amount,
        kind: entry_kind_for(p.core.rail_kind),
        status: entry_status,
        ex_rate: p.rates.asset,
        balance_after: Decimal::ZERO, // replay fills this in
        created_by: None,
        time_executed: Some(time),
        parent: None,
    });
    let principal_slot = 0;

    // Account-level deposit/withdrawal fee; zero suppresses the leg
    let fee_slot = if tx_fee > Decimal::ZERO {
        batch.entries.push(DraftEntry {
            asset_id: p.asset.id,
            amount: -tx_fee,
            kind: EntryKind::Fee,
            status: entry_status,
            ex_rate: p.rates.asset,
            balance_after: Decimal::ZERO,
            created_by: None,
            time_executed: Some(time),
            parent: Some(principal_slot),
        });
        Some(batch.entries.len() - 1)
    } else {
        None
    };

    // Internal rail-fee leg
    let rail_fee_slot = if rail_fee < Decimal::ZERO && !failed {
        batch.internals.push(DraftInternal {
            asset_id: obs.fee_asset_id,
            amount: rail_fee,
            status: EntryStatus::Success,
            ex_rate: p.rates.fee_asset,
            time_executed: Some(time),
            user_tx: Some(principal_slot),
            parent: None,
        });
        Some(batch.internals.len() - 1)
    } else {
        None
    };

    // Internal mirror of the account-level fee
    if let Some(fee) = fee_slot {
        if !failed {
            batch.internals.push(DraftInternal {
                asset_id: p.asset.id,
                amount: tx_fee,
                status: EntryStatus::Success,
                ex_rate: p.rates.asset,
                time_executed: Some(time),
                user_tx: Some(fee),
                parent: rail_fee_slot,
            });
        }
    }

    batch.rail_tx = Some(DraftRailTx {
        rail_kind: p.core.rail_kind,
        core_id: p.core.id,
        account_id: Some(p.account.id),
        asset_id: p.asset.id,
        amount: obs.amount,
        rail_fee,
        fee_asset_id: obs.fee_asset_id,
        address: obs.address.clone(),
        address_ext: obs.address_ext.clone(),
        external_id: Some(obs.external_id.clone()),
        external_index: obs.index,
        time_executed: Some(time),
        status: entry_status,
        is_internal: false,
        added_by: added_by::SYNC,
        user_tx: Some(principal_slot),
        internal_tx: rail_fee_slot,
    });

    if confirmed {
        if obs.amount > Decimal::ZERO {
            if let Some(addr) = &obs.address {
                batch.credit_address = Some((addr.clone(), obs.amount));
            }
        }
    } else if !failed {
        // Uncleared: show the net amount as pending until confirmation
        batch.patch.d_pending = obs.amount - tx_fee;
    }

    // Outgoing (or unidentified) events always hit the exchange-wide
    // mirror; incoming crypto does not until a user posting exists.
    if obs.amount < Decimal::ZERO && !failed {
        batch.systems.push(DraftSystem {
            kind: SystemKind::User,
            asset_id: p.asset.id,
            amount: obs.amount,
            ex_rate: p.rates.asset,
            status: entry_status,
            linked_to_rail: true,
            parent: None,
        });
        if rail_fee < Decimal::ZERO {
            batch.systems.push(DraftSystem {
                kind: SystemKind::Fee,
                asset_id: obs.fee_asset_id,
                amount: rail_fee,
                ex_rate: p.rates.fee_asset,
                status: entry_status,
                linked_to_rail: false,
                parent: Some(0),
            });
        }
    }

    batch
}

/// Record an observed event not attached to any user account (unknown
/// non-user address, below-minimum deposit, failed fiat event): rail
/// record only, plus the system mirror unless the event failed.
pub fn non_user_posting(core: &CoreRow, asset: &Asset, rates: Rates, obs: &ObservedTx) -> PostingBatch {
    let time = round_to_seconds(obs.time);
    let rail_fee = normalize_rail_fee(core.rail_kind, obs.amount, obs.fee);
    let failed = obs.state == ObservedState::Failed;
    let status = if failed {
        EntryStatus::Failed
    } else if is_observed_confirmed(core, obs) {
        EntryStatus::Success
    } else {
        EntryStatus::Pending
    };

    let mut batch = PostingBatch::default();
    batch.rail_tx = Some(DraftRailTx {
        rail_kind: core.rail_kind,
        core_id: core.id,
        account_id: None,
        asset_id: asset.id,
        amount: obs.amount,
        rail_fee,
        fee_asset_id: obs.fee_asset_id,
        address: obs.address.clone(),
        address_ext: obs.address_ext.clone(),
        external_id: Some(obs.external_id.clone()),
        external_index: obs.index,
        time_executed: Some(time),
        status,
        is_internal: false,
        added_by: added_by::SYNC,
        user_tx: None,
        internal_tx: None,
    });

    if !failed {
        batch.systems.push(DraftSystem {
            kind: SystemKind::External,
            asset_id: asset.id,
            amount: obs.amount,
            ex_rate: rates.asset,
            status,
            linked_to_rail: true,
            parent: None,
        });
        if rail_fee < Decimal::ZERO {
            batch.systems.push(DraftSystem {
                kind: SystemKind::Fee,
                asset_id: obs.fee_asset_id,
                amount: rail_fee,
                ex_rate: rates.fee_asset,
                status,
                linked_to_rail: false,
                parent: Some(0),
            });
        }
    }

    batch
}

/// Record an observed internal wallet rebalancing: internal fee leg and
/// rail record only, no user or system legs.
pub fn internal_move(core: &CoreRow, rates: Rates, obs: &ObservedTx) -> PostingBatch {
    let time = round_to_seconds(obs.time);
    let rail_fee = normalize_rail_fee(core.rail_kind, obs.amount, obs.fee);

    let mut batch = PostingBatch::default();

    let rail_fee_slot = if rail_fee < Decimal::ZERO {
        batch.internals.push(DraftInternal {
            asset_id: obs.fee_asset_id,
            amount: rail_fee,
            status: EntryStatus::Success,
            ex_rate: rates.fee_asset,
            time_executed: Some(time),
            user_tx: None,
            parent: None,
        });
        Some(0)
    } else {
        None
    };

    batch.rail_tx = Some(DraftRailTx {
        rail_kind: core.rail_kind,
        core_id: core.id,
        account_id: None,
        asset_id: obs.asset_id,
        amount: obs.amount,
        rail_fee,
        fee_asset_id: obs.fee_asset_id,
        address: obs.address.clone(),
        address_ext: obs.address_ext.clone(),
        external_id: Some(obs.external_id.clone()),
        external_index: obs.index,
        time_executed: Some(time),
        status: if is_observed_confirmed(core, obs) {
            EntryStatus::Success
        } else {
            EntryStatus::Pending
        },
        is_internal: true,
        added_by: added_by::SYNC,
        user_tx: None,
        internal_tx: rail_fee_slot,
    });

    batch
}

/// Inputs for an outgoing user send.
#[derive(Debug)]
pub struct SendParams<'a> {
    pub account: &'a Account,
    pub asset: &'a Asset,
    pub core: &'a CoreRow,
    pub rates: Rates,
    /// Positive magnitude the user asked to send
    pub amount: Decimal,
    pub address: String,
    pub fee_quote: &'a FeeOption,
    pub created_by: Option<UserId>,
    /// External verification policy decided the send needs approval
    pub requires_approval: bool,
}

/// Build the leg family for an outgoing user send. Validates available
/// balance before constructing anything; an error means nothing was
/// built and nothing may be persisted.
pub fn send(p: &SendParams<'_>) -> Result<PostingBatch, LedgerError> {
    if p.amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount);
    }

    let withdrawal_fee = p.asset.compute_fee(-p.amount);
    let required = p.amount + withdrawal_fee;
    let available = p.account.available();

    if available < required {
        return Err(LedgerError::InsufficientBalance {
            account: p.account.number.clone(),
            available,
            required,
        });
    }

    let rail_fee = p.fee_quote.fee;

    let mut batch = PostingBatch {
        account_id: Some(p.account.id),
        notify_balance: true,
        ..Default::default()
    };
    batch.patch.d_reserved = required;

    batch.entries.push(DraftEntry {
        asset_id: p.asset.id,
        amount: -p.amount,
        kind: entry_kind_for(p.core.rail_kind),
        status: EntryStatus::New,
        ex_rate: p.rates.asset,
        balance_after: p.account.balance_total,
        created_by: p.created_by,
        time_executed: None,
        parent: None,
    });
    let principal_slot = 0;

    let fee_slot = if withdrawal_fee > Decimal::ZERO {
        batch.entries.push(DraftEntry {
            asset_id: p.asset.id,
            amount: -withdrawal_fee,
            kind: EntryKind::Fee,
            status: EntryStatus::New,
            ex_rate: p.rates.asset,
            balance_after: p.account.balance_total,
            created_by: p.created_by,
            time_executed: None,
            parent: Some(principal_slot),
        });
        Some(batch.entries.len() - 1)
    } else {
        None
    };

    let rail_fee_slot = if rail_fee > Decimal::ZERO {
        batch.internals.push(DraftInternal {
            asset_id: p.fee_quote.asset_id,
            amount: -rail_fee,
            status: EntryStatus::New,
            ex_rate: p.rates.fee_asset,
            time_executed: None,
            user_tx: Some(principal_slot),
            parent: None,
        });
        Some(batch.internals.len() - 1)
    } else {
        None
    };

    if let Some(fee) = fee_slot {
        batch.internals.push(DraftInternal {
            asset_id: p.asset.id,
            amount: withdrawal_fee,
            status: EntryStatus::New,
            ex_rate: p.rates.asset,
            time_executed: None,
            user_tx: Some(fee),
            parent: rail_fee_slot,
        });
    }

    batch.rail_tx = Some(DraftRailTx {
        rail_kind: p.core.rail_kind,
        core_id: p.core.id,
        account_id: Some(p.account.id),
        asset_id: p.asset.id,
        amount: -p.amount,
        rail_fee: -rail_fee,
        fee_asset_id: p.fee_quote.asset_id,
        address: None,
        address_ext: Some(p.address.clone()),
        external_id: None,
        external_index: None,
        time_executed: None,
        status: if p.requires_approval {
            EntryStatus::PendingAdmin
        } else {
            EntryStatus::New
        },
        is_internal: false,
        added_by: added_by::USER,
        user_tx: Some(principal_slot),
        internal_tx: rail_fee_slot,
    });

    // User sends always have an external effect
    batch.systems.push(DraftSystem {
        kind: SystemKind::User,
        asset_id: p.asset.id,
        amount: -p.amount,
        ex_rate: p.rates.asset,
        status: EntryStatus::Pending,
        linked_to_rail: true,
        parent: None,
    });
    if rail_fee > Decimal::ZERO {
        batch.systems.push(DraftSystem {
            kind: SystemKind::Fee,
            asset_id: p.fee_quote.asset_id,
            amount: -rail_fee,
            ex_rate: p.rates.fee_asset,
            status: EntryStatus::Pending,
            linked_to_rail: false,
            parent: Some(0),
        });
    }

    Ok(batch)
}

/// An account-to-account move of one asset: two settled legs linked as
/// reciprocals, balances adjusted directly (these are the newest legs,
/// no replay needed).
#[derive(Debug, Clone)]
pub struct MoveBatch {
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub out_leg: DraftEntry,
    pub in_leg: DraftEntry,
}

pub fn move_funds(
    from: &Account,
    to: &Account,
    amount: Decimal,
    kind: EntryKind,
    ex_rate: Decimal,
    created_by: Option<UserId>,
    now: DateTime<Utc>,
) -> Result<MoveBatch, LedgerError> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount);
    }
    if from.available() < amount {
        return Err(LedgerError::InsufficientBalance {
            account: from.number.clone(),
            available: from.available(),
            required: amount,
        });
    }

    let time = round_to_seconds(now);

    Ok(MoveBatch {
        from_account: from.id,
        to_account: to.id,
        out_leg: DraftEntry {
            asset_id: from.asset_id,
            amount: -amount,
            kind,
            status: EntryStatus::Success,
            ex_rate,
            balance_after: from.balance_total - amount,
            created_by,
            time_executed: Some(time),
            parent: None,
        },
        in_leg: DraftEntry {
            asset_id: to.asset_id,
            amount,
            kind,
            status: EntryStatus::Success,
            ex_rate,
            balance_after: to.balance_total + amount,
            created_by,
            time_executed: Some(time),
            parent: None,
        },
    })
}

// ---------------------------------------------------------------------
// Family transitions
// ---------------------------------------------------------------------

/// One rail record together with every leg correlated to it, as loaded
/// by the store in the mutating transaction.
#[derive(Debug, Clone)]
pub struct TxFamily {
    pub rail: RailTx,
    pub principal: Option<LedgerEntry>,
    /// Fee child of the principal
    pub fee: Option<LedgerEntry>,
    /// Internal leg linked via `rail.internal_tx_id`
    pub internal_rail_fee: Option<InternalEntry>,
    /// Internal mirror of the account-level fee (user_tx = fee leg)
    pub internal_account_fee: Option<InternalEntry>,
    pub system: Option<SystemEntry>,
    pub system_fee: Option<SystemEntry>,
    /// Rail records chained under this one
    pub child_ids: Vec<EntryId>,
}

impl TxFamily {
    /// Positive account-level fee charged with this movement, zero when
    /// the fee leg was suppressed.
    fn tx_fee(&self) -> Decimal {
        self.fee.as_ref().map(|f| -f.amount).unwrap_or_default()
    }
}

/// A status/amount patch against one already-persisted row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPatch {
    pub id: EntryId,
    pub status: Option<EntryStatus>,
    pub time_executed: Option<DateTime<Utc>>,
    pub amount: Option<Decimal>,
}

impl StatusPatch {
    fn status(id: EntryId, status: EntryStatus) -> Self {
        StatusPatch {
            id,
            status: Some(status),
            time_executed: None,
            amount: None,
        }
    }
}

/// Every mutation a family transition produces, applied in one unit.
#[derive(Debug, Clone, Default)]
pub struct FamilyUpdate {
    pub rail_status: Option<EntryStatus>,
    pub rail_fee: Option<Decimal>,
    pub clear_time_executed: bool,
    pub entry_patches: Vec<StatusPatch>,
    pub internal_patches: Vec<StatusPatch>,
    pub system_patches: Vec<StatusPatch>,
    /// Fail every chained child rail record (cascades recursively)
    pub fail_children: bool,
    pub patch: AccountPatch,
    pub replay_from: Option<DateTime<Utc>>,
    pub credit_address: Option<(String, Decimal)>,
    pub notify_funding: bool,
    pub notify_balance: bool,
}

impl FamilyUpdate {
    pub fn is_noop(&self) -> bool {
        self.rail_status.is_none()
            && self.rail_fee.is_none()
            && self.entry_patches.is_empty()
            && self.internal_patches.is_empty()
            && self.system_patches.is_empty()
            && !self.fail_children
            && self.patch.is_empty()
    }
}

/// After the rail accepted a send: principal and fee move NEW -> PENDING,
/// the internal fee legs settle, and the rail-reported fee replaces the
/// quote. The reservation is retained until confirmation.
pub fn finalize(family: &TxFamily, time: DateTime<Utc>) -> FamilyUpdate {
    let time = round_to_seconds(time);
    let mut up = FamilyUpdate::default();

    if let Some(principal) = &family.principal {
        up.entry_patches.push(StatusPatch {
            id: principal.id,
            status: Some(EntryStatus::Pending),
            time_executed: Some(time),
            amount: None,
        });
        if let Some(fee) = &family.fee {
            up.entry_patches.push(StatusPatch {
                id: fee.id,
                status: Some(EntryStatus::Pending),
                time_executed: Some(time),
                amount: None,
            });
        }
        if let Some(internal) = &family.internal_account_fee {
            up.internal_patches.push(StatusPatch {
                id: internal.id,
                status: Some(EntryStatus::Success),
                time_executed: Some(time),
                amount: None,
            });
        }
        up.replay_from = Some(time);
        up.notify_balance = true;
    }

    if let Some(internal) = &family.internal_rail_fee {
        up.internal_patches.push(StatusPatch {
            id: internal.id,
            status: Some(EntryStatus::Success),
            time_executed: Some(time),
            amount: Some(family.rail.rail_fee),
        });
    }

    up
}

/// Rail-confirmed settlement: principal and fee settle, the counter the
/// movement accrued is released, system mirrors settle, incoming
/// addresses record the received amount.
pub fn confirm(family: &TxFamily, rail_fee: Decimal) -> FamilyUpdate {
    let mut up = FamilyUpdate {
        rail_status: Some(EntryStatus::Success),
        rail_fee: Some(rail_fee),
        ..Default::default()
    };

    if let Some(principal) = &family.principal {
        up.entry_patches
            .push(StatusPatch::status(principal.id, EntryStatus::Success));
        if let Some(fee) = &family.fee {
            up.entry_patches
                .push(StatusPatch::status(fee.id, EntryStatus::Success));
        }

        let tx_fee = family.tx_fee();
        if principal.amount > Decimal::ZERO {
            // Release what the pending counter accrued at posting time
            up.patch.d_pending = -(principal.amount - tx_fee);
        } else {
            up.patch.d_reserved = -(-principal.amount + tx_fee);
        }

        up.replay_from = Some(
            family
                .rail
                .time_executed
                .unwrap_or_else(|| principal.effective_time()),
        );
        up.notify_funding = true;
        up.notify_balance = true;
    }

    if let Some(internal) = &family.internal_rail_fee {
        up.internal_patches.push(StatusPatch {
            id: internal.id,
            status: Some(EntryStatus::Success),
            time_executed: None,
            amount: Some(rail_fee),
        });
    }

    if let Some(system) = &family.system {
        up.system_patches
            .push(StatusPatch::status(system.id, EntryStatus::Success));
        if let Some(system_fee) = &family.system_fee {
            up.system_patches.push(StatusPatch {
                id: system_fee.id,
                status: Some(EntryStatus::Success),
                time_executed: None,
                amount: Some(rail_fee),
            });
        }
    }

    if family.rail.amount > Decimal::ZERO {
        if let Some(addr) = &family.rail.address {
            up.credit_address = Some((addr.clone(), family.rail.amount));
        }
    }

    up
}

/// Permanent failure: cascade FAILED across the whole family and unwind
/// whichever counter the movement had accrued. Idempotent: an already
/// failed family produces a no-op.
pub fn fail(family: &TxFamily) -> FamilyUpdate {
    if family.rail.status == EntryStatus::Failed {
        return FamilyUpdate::default();
    }

    let mut up = FamilyUpdate {
        rail_status: Some(EntryStatus::Failed),
        fail_children: true,
        ..Default::default()
    };

    if let Some(principal) = &family.principal {
        let tx_fee = family.tx_fee();

        if !principal.status.is_terminal() {
            up.entry_patches
                .push(StatusPatch::status(principal.id, EntryStatus::Failed));
            if let Some(fee) = &family.fee {
                up.entry_patches
                    .push(StatusPatch::status(fee.id, EntryStatus::Failed));
            }
            if let Some(internal) = &family.internal_account_fee {
                up.internal_patches
                    .push(StatusPatch::status(internal.id, EntryStatus::Failed));
            }

            if principal.amount < Decimal::ZERO {
                up.patch.d_reserved = -(-principal.amount + tx_fee);
            } else if principal.status == EntryStatus::Pending {
                up.patch.d_pending = -(principal.amount - tx_fee);
            }

            up.replay_from = Some(principal.effective_time());
            up.notify_balance = true;
        }
    }

    if let Some(internal) = &family.internal_rail_fee {
        if !internal.status.is_terminal() {
            up.internal_patches
                .push(StatusPatch::status(internal.id, EntryStatus::Failed));
        }
    }
    if let Some(system) = &family.system {
        if !system.status.is_terminal() {
            up.system_patches
                .push(StatusPatch::status(system.id, EntryStatus::Failed));
        }
    }
    if let Some(system_fee) = &family.system_fee {
        if !system_fee.status.is_terminal() {
            up.system_patches
                .push(StatusPatch::status(system_fee.id, EntryStatus::Failed));
        }
    }

    up
}

/// Cancel before any send attempt. Legal only from NEW or PENDING_ADMIN;
/// outgoing sends release their reservation, incoming events no-op on
/// balances. Internal and system legs fail like a failure cascade.
pub fn cancel(family: &TxFamily) -> Result<FamilyUpdate, LedgerError> {
    if !family.rail.status.is_cancelable() {
        return Err(LedgerError::NotCancelable {
            id: family.rail.id,
            status: family.rail.status,
        });
    }

    let mut up = FamilyUpdate {
        rail_status: Some(EntryStatus::Canceled),
        fail_children: true,
        ..Default::default()
    };

    if let Some(principal) = &family.principal {
        up.entry_patches
            .push(StatusPatch::status(principal.id, EntryStatus::Canceled));
        if let Some(fee) = &family.fee {
            up.entry_patches
                .push(StatusPatch::status(fee.id, EntryStatus::Canceled));
        }
        if let Some(internal) = &family.internal_account_fee {
            up.internal_patches
                .push(StatusPatch::status(internal.id, EntryStatus::Failed));
        }

        if principal.amount < Decimal::ZERO {
            up.patch.d_reserved = -(-principal.amount + family.tx_fee());
            up.notify_balance = true;
        }
    }

    if let Some(internal) = &family.internal_rail_fee {
        up.internal_patches
            .push(StatusPatch::status(internal.id, EntryStatus::Failed));
    }
    if let Some(system) = &family.system {
        up.system_patches
            .push(StatusPatch::status(system.id, EntryStatus::Failed));
    }
    if let Some(system_fee) = &family.system_fee {
        up.system_patches
            .push(StatusPatch::status(system_fee.id, EntryStatus::Failed));
    }

    Ok(up)
}

/// Manual approval: PENDING_ADMIN -> NEW. Anything else is a warned
/// no-op, reported as None so the caller can log it.
pub fn approve(family: &TxFamily) -> Option<FamilyUpdate> {
    if family.rail.status != EntryStatus::PendingAdmin {
        return None;
    }
    Some(FamilyUpdate {
        rail_status: Some(EntryStatus::New),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn asset() -> Asset {
        Asset {
            id: 1,
            code: "BTC".into(),
            ticker: "BTC".into(),
            is_crypto: true,
            core_type: "BTC".into(),
            fee_rate: dec!(0.01),
            fee_flat: dec!(0),
            fee_min: dec!(0),
            deposit_min: dec!(0.0001),
        }
    }

    fn free_asset() -> Asset {
        Asset {
            fee_rate: dec!(0),
            ..asset()
        }
    }

    fn account(total: Decimal, reserved: Decimal, pending: Decimal) -> Account {
        Account {
            id: 7,
            asset_id: 1,
            number: "A-7".into(),
            name: None,
            owner_id: Some(42),
            balance_total: total,
            balance_reserved: reserved,
            balance_pending: pending,
        }
    }

    fn core(min_confirms: i32) -> CoreRow {
        CoreRow {
            id: 3,
            name: "BTC".into(),
            core_type: "BTC".into(),
            rail_kind: RailKind::Crypto,
            is_primary: true,
            last_sync_block: 0,
            time_synced: None,
            min_confirms,
        }
    }

    fn observed(amount: Decimal, fee: Decimal, confirmations: i32) -> ObservedTx {
        ObservedTx {
            external_id: "txid-1".into(),
            address: Some("addr-1".into()),
            address_ext: None,
            asset_id: 1,
            amount,
            fee,
            fee_asset_id: 1,
            confirmations,
            block_number: 100,
            index: Some(0),
            time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            state: ObservedState::Pending,
        }
    }

    fn quote(fee: Decimal) -> FeeOption {
        FeeOption {
            asset_id: 1,
            fee,
            blocks: 1,
            seconds: 600,
        }
    }

    // -- deposit --------------------------------------------------------

    #[test]
    fn test_unconfirmed_deposit_goes_to_pending() {
        let acct = account(dec!(100), dec!(0), dec!(0));
        let obs = observed(dec!(10), dec!(0), 1);
        let batch = deposit(&DepositParams {
            account: &acct,
            asset: &free_asset(),
            core: &core(3),
            rates: Rates::flat(),
            observed: &obs,
        });

        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].status, EntryStatus::Pending);
        assert_eq!(batch.patch.d_pending, dec!(10));
        assert_eq!(batch.patch.d_total, dec!(0));
        assert!(!batch.notify_funding);
        assert!(batch.systems.is_empty(), "incoming crypto has no system mirror");
    }

    #[test]
    fn test_confirmed_deposit_settles_and_credits_address() {
        let acct = account(dec!(100), dec!(0), dec!(0));
        let obs = observed(dec!(10), dec!(0), 3);
        let batch = deposit(&DepositParams {
            account: &acct,
            asset: &free_asset(),
            core: &core(3),
            rates: Rates::flat(),
            observed: &obs,
        });

        assert_eq!(batch.entries[0].status, EntryStatus::Success);
        assert!(batch.patch.is_empty());
        assert_eq!(batch.credit_address, Some(("addr-1".into(), dec!(10))));
        assert!(batch.notify_funding);
        assert_eq!(batch.replay_from, Some(obs.time));
    }

    #[test]
    fn test_deposit_fee_leg_and_internal_mirror() {
        let acct = account(dec!(100), dec!(0), dec!(0));
        let obs = observed(dec!(100), dec!(0), 1);
        let batch = deposit(&DepositParams {
            account: &acct,
            asset: &asset(), // 1% fee
            core: &core(3),
            rates: Rates::flat(),
            observed: &obs,
        });

        assert_eq!(batch.entries.len(), 2);
        assert_eq!(batch.entries[1].amount, dec!(-1.00));
        assert_eq!(batch.entries[1].kind, EntryKind::Fee);
        assert_eq!(batch.entries[1].parent, Some(0));
        // Pending counter carries the net amount
        assert_eq!(batch.patch.d_pending, dec!(99.00));
        // Internal mirror of the account fee
        assert_eq!(batch.internals.len(), 1);
        assert_eq!(batch.internals[0].amount, dec!(1.00));
        assert_eq!(batch.internals[0].user_tx, Some(1));
    }

    #[test]
    fn test_zero_fee_suppresses_fee_leg() {
        let acct = account(dec!(100), dec!(0), dec!(0));
        let obs = observed(dec!(10), dec!(0), 3);
        let batch = deposit(&DepositParams {
            account: &acct,
            asset: &free_asset(),
            core: &core(3),
            rates: Rates::flat(),
            observed: &obs,
        });
        assert_eq!(batch.entries.len(), 1);
        assert!(batch.internals.is_empty());
    }

    #[test]
    fn test_incoming_crypto_drops_rail_fee() {
        let acct = account(dec!(100), dec!(0), dec!(0));
        let obs = observed(dec!(10), dec!(0.5), 3);
        let batch = deposit(&DepositParams {
            account: &acct,
            asset: &free_asset(),
            core: &core(3),
            rates: Rates::flat(),
            observed: &obs,
        });
        assert_eq!(batch.rail_tx.as_ref().unwrap().rail_fee, dec!(0));
        assert!(batch.internals.is_empty());
    }

    #[test]
    fn test_outgoing_observed_event_mirrors_to_system() {
        let acct = account(dec!(100), dec!(0), dec!(0));
        let obs = observed(dec!(-10), dec!(0.5), 3);
        let batch = deposit(&DepositParams {
            account: &acct,
            asset: &free_asset(),
            core: &core(3),
            rates: Rates::flat(),
            observed: &obs,
        });

        let rail = batch.rail_tx.as_ref().unwrap();
        assert_eq!(rail.rail_fee, dec!(-0.5), "fee normalized negative");
        assert_eq!(batch.systems.len(), 2);
        assert_eq!(batch.systems[0].kind, SystemKind::User);
        assert_eq!(batch.systems[0].amount, dec!(-10));
        assert_eq!(batch.systems[1].kind, SystemKind::Fee);
        assert_eq!(batch.systems[1].amount, dec!(-0.5));
        assert_eq!(batch.systems[1].parent, Some(0));
        // Internal rail fee leg present and linked
        assert_eq!(batch.internals.len(), 1);
        assert_eq!(rail.internal_tx, Some(0));
    }

    // -- send -----------------------------------------------------------

    #[test]
    fn test_send_insufficient_balance_builds_nothing() {
        let acct = account(dec!(100), dec!(30), dec!(20)); // available 50
        let err = send(&SendParams {
            account: &acct,
            asset: &free_asset(),
            core: &core(3),
            rates: Rates::flat(),
            amount: dec!(50.5),
            address: "dest".into(),
            fee_quote: &quote(dec!(0.1)),
            created_by: Some(42),
            requires_approval: false,
        })
        .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
    }

    #[test]
    fn test_send_reserves_amount_plus_withdrawal_fee() {
        let acct = account(dec!(100), dec!(0), dec!(0));
        let batch = send(&SendParams {
            account: &acct,
            asset: &asset(), // 1% withdrawal fee
            core: &core(3),
            rates: Rates::flat(),
            amount: dec!(50),
            address: "dest".into(),
            fee_quote: &quote(dec!(0.5)),
            created_by: Some(42),
            requires_approval: false,
        })
        .unwrap();

        assert_eq!(batch.patch.d_reserved, dec!(50.50));
        assert_eq!(batch.patch.d_total, dec!(0));
        // Principal + fee legs, all NEW
        assert_eq!(batch.entries.len(), 2);
        assert!(batch.entries.iter().all(|e| e.status == EntryStatus::New));
        assert_eq!(batch.net_entry_amount(), dec!(-50.50));
        // Internal miner fee + internal withdrawal fee
        assert_eq!(batch.internals.len(), 2);
        assert_eq!(batch.internals[0].amount, dec!(-0.5));
        assert_eq!(batch.internals[1].amount, dec!(0.50));
        assert_eq!(batch.internals[1].parent, Some(0));
        // System mirror pair always present for user sends
        assert_eq!(batch.systems.len(), 2);
        let rail = batch.rail_tx.as_ref().unwrap();
        assert_eq!(rail.status, EntryStatus::New);
        assert_eq!(rail.rail_fee, dec!(-0.5));
    }

    #[test]
    fn test_send_requiring_approval_enters_pending_admin() {
        let acct = account(dec!(100), dec!(0), dec!(0));
        let batch = send(&SendParams {
            account: &acct,
            asset: &free_asset(),
            core: &core(3),
            rates: Rates::flat(),
            amount: dec!(10),
            address: "dest".into(),
            fee_quote: &quote(dec!(0)),
            created_by: Some(42),
            requires_approval: true,
        })
        .unwrap();
        assert_eq!(batch.rail_tx.unwrap().status, EntryStatus::PendingAdmin);
    }

    #[test]
    fn test_send_exact_available_is_allowed() {
        let acct = account(dec!(100), dec!(0), dec!(0));
        let batch = send(&SendParams {
            account: &acct,
            asset: &free_asset(),
            core: &core(3),
            rates: Rates::flat(),
            amount: dec!(100),
            address: "dest".into(),
            fee_quote: &quote(dec!(0)),
            created_by: None,
            requires_approval: false,
        });
        assert!(batch.is_ok());
    }

    // -- internal move / non-user --------------------------------------

    #[test]
    fn test_internal_move_has_no_user_or_system_legs() {
        let obs = observed(dec!(-5), dec!(0.2), 5);
        let batch = internal_move(&core(3), Rates::flat(), &obs);
        assert!(batch.entries.is_empty());
        assert!(batch.systems.is_empty());
        let rail = batch.rail_tx.as_ref().unwrap();
        assert!(rail.is_internal);
        assert_eq!(rail.user_tx, None);
        assert_eq!(batch.internals.len(), 1);
        assert!(batch.patch.is_empty());
    }

    #[test]
    fn test_non_user_posting_failed_event_has_no_mirror() {
        let mut obs = observed(dec!(25), dec!(1), 0);
        obs.state = ObservedState::Failed;
        let mut fiat = core(0);
        fiat.rail_kind = RailKind::Fiat;
        let batch = non_user_posting(&fiat, &free_asset(), Rates::flat(), &obs);
        assert_eq!(batch.rail_tx.as_ref().unwrap().status, EntryStatus::Failed);
        assert!(batch.systems.is_empty());
    }

    // -- family transitions --------------------------------------------

    fn send_family(principal_status: EntryStatus, rail_status: EntryStatus) -> TxFamily {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        TxFamily {
            rail: RailTx {
                id: 900,
                rail_kind: RailKind::Crypto,
                core_id: 3,
                account_id: Some(7),
                asset_id: 1,
                user_tx_id: Some(100),
                internal_tx_id: Some(500),
                parent_id: None,
                amount: dec!(-50),
                rail_fee: dec!(-0.5),
                fee_asset_id: 1,
                address: None,
                address_ext: Some("dest".into()),
                external_id: Some("txid-9".into()),
                external_index: None,
                send_attempts: 1,
                time_retry: None,
                time_executed: Some(t),
                status: rail_status,
                is_internal: false,
                added_by: added_by::USER,
            },
            principal: Some(LedgerEntry {
                id: 100,
                account_id: 7,
                asset_id: 1,
                amount: dec!(-50),
                balance_after: dec!(100),
                ex_rate: Decimal::ONE,
                number: 1,
                created_by: Some(42),
                time_added: t,
                time_executed: Some(t),
                kind: EntryKind::Crypto,
                status: principal_status,
                parent_id: None,
                reciprocal_id: None,
            }),
            fee: Some(LedgerEntry {
                id: 101,
                account_id: 7,
                asset_id: 1,
                amount: dec!(-0.50),
                balance_after: dec!(100),
                ex_rate: Decimal::ONE,
                number: 2,
                created_by: Some(42),
                time_added: t,
                time_executed: Some(t),
                kind: EntryKind::Fee,
                status: principal_status,
                parent_id: Some(100),
                reciprocal_id: None,
            }),
            internal_rail_fee: Some(InternalEntry {
                id: 500,
                account_id: Some(7),
                asset_id: 1,
                user_tx_id: Some(100),
                parent_id: None,
                amount: dec!(-0.5),
                ex_rate: Decimal::ONE,
                time_executed: None,
                status: EntryStatus::New,
            }),
            internal_account_fee: Some(InternalEntry {
                id: 501,
                account_id: Some(7),
                asset_id: 1,
                user_tx_id: Some(101),
                parent_id: Some(500),
                amount: dec!(0.50),
                ex_rate: Decimal::ONE,
                time_executed: None,
                status: EntryStatus::New,
            }),
            system: Some(SystemEntry {
                id: 700,
                kind: SystemKind::User,
                asset_id: 1,
                amount: dec!(-50),
                ex_rate: Decimal::ONE,
                rail_tx_id: Some(900),
                parent_id: None,
                status: EntryStatus::Pending,
            }),
            system_fee: Some(SystemEntry {
                id: 701,
                kind: SystemKind::Fee,
                asset_id: 1,
                amount: dec!(-0.5),
                ex_rate: Decimal::ONE,
                rail_tx_id: None,
                parent_id: Some(700),
                status: EntryStatus::Pending,
            }),
            child_ids: vec![],
        }
    }

    #[test]
    fn test_finalize_moves_user_legs_to_pending_keeps_reservation() {
        let family = send_family(EntryStatus::New, EntryStatus::Active);
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 5, 0).unwrap();
        let up = finalize(&family, t);

        assert_eq!(up.entry_patches.len(), 2);
        assert!(
            up.entry_patches
                .iter()
                .all(|p| p.status == Some(EntryStatus::Pending))
        );
        // Reservation untouched until confirmation
        assert!(up.patch.is_empty());
        // Internal legs settle with the rail fee amount
        let rail_fee_patch = up.internal_patches.iter().find(|p| p.id == 500).unwrap();
        assert_eq!(rail_fee_patch.amount, Some(dec!(-0.5)));
        assert_eq!(rail_fee_patch.status, Some(EntryStatus::Success));
    }

    #[test]
    fn test_confirm_outgoing_releases_reservation() {
        let family = send_family(EntryStatus::Pending, EntryStatus::Pending);
        let up = confirm(&family, dec!(-0.4));

        assert_eq!(up.rail_status, Some(EntryStatus::Success));
        assert_eq!(up.patch.d_reserved, dec!(-50.50));
        assert_eq!(up.patch.d_pending, dec!(0));
        // System mirror settles, fee mirror amount refreshed
        assert!(
            up.system_patches
                .iter()
                .any(|p| p.id == 701 && p.amount == Some(dec!(-0.4)))
        );
        assert!(up.notify_funding);
    }

    #[test]
    fn test_confirm_incoming_releases_pending_net_of_fee() {
        let mut family = send_family(EntryStatus::Pending, EntryStatus::Pending);
        family.rail.amount = dec!(100);
        family.rail.address = Some("addr-1".into());
        family.principal.as_mut().unwrap().amount = dec!(100);
        family.fee.as_mut().unwrap().amount = dec!(-1.00);

        let up = confirm(&family, dec!(0));
        // Creation added 100 - 1 to pending; confirmation removes exactly that
        assert_eq!(up.patch.d_pending, dec!(-99.00));
        assert_eq!(up.patch.d_reserved, dec!(0));
        assert_eq!(up.credit_address, Some(("addr-1".into(), dec!(100))));
    }

    #[test]
    fn test_fail_outgoing_unwinds_reservation_and_cascades() {
        let family = send_family(EntryStatus::Pending, EntryStatus::Pending);
        let up = fail(&family);

        assert_eq!(up.rail_status, Some(EntryStatus::Failed));
        assert_eq!(up.patch.d_reserved, dec!(-50.50));
        assert!(up.fail_children);
        assert!(
            up.entry_patches
                .iter()
                .all(|p| p.status == Some(EntryStatus::Failed))
        );
        assert!(
            up.system_patches
                .iter()
                .all(|p| p.status == Some(EntryStatus::Failed))
        );
    }

    #[test]
    fn test_fail_is_idempotent() {
        let mut family = send_family(EntryStatus::Failed, EntryStatus::Failed);
        family.internal_rail_fee.as_mut().unwrap().status = EntryStatus::Failed;
        family.internal_account_fee.as_mut().unwrap().status = EntryStatus::Failed;
        family.system.as_mut().unwrap().status = EntryStatus::Failed;
        family.system_fee.as_mut().unwrap().status = EntryStatus::Failed;

        let up = fail(&family);
        assert!(up.is_noop(), "second fail must not double-unwind: {up:?}");
    }

    #[test]
    fn test_cancel_only_from_new_or_pending_admin() {
        let family = send_family(EntryStatus::Pending, EntryStatus::Pending);
        assert!(matches!(
            cancel(&family),
            Err(LedgerError::NotCancelable { .. })
        ));

        let family = send_family(EntryStatus::New, EntryStatus::New);
        let up = cancel(&family).unwrap();
        assert_eq!(up.rail_status, Some(EntryStatus::Canceled));
        assert_eq!(up.patch.d_reserved, dec!(-50.50));
    }

    #[test]
    fn test_cancel_incoming_is_balance_neutral() {
        let mut family = send_family(EntryStatus::New, EntryStatus::New);
        family.rail.amount = dec!(10);
        family.principal.as_mut().unwrap().amount = dec!(10);
        family.fee = None;
        family.internal_account_fee = None;
        let up = cancel(&family).unwrap();
        assert!(up.patch.is_empty());
    }

    #[test]
    fn test_approve_requires_pending_admin() {
        let family = send_family(EntryStatus::New, EntryStatus::PendingAdmin);
        let up = approve(&family).unwrap();
        assert_eq!(up.rail_status, Some(EntryStatus::New));

        let family = send_family(EntryStatus::New, EntryStatus::New);
        assert!(approve(&family).is_none());
    }

    // -- double entry ---------------------------------------------------

    #[test]
    fn test_double_entry_sum_matches_net_effect() {
        // Deposit of 100 with 1% account fee: user sees +99 net
        let acct = account(dec!(0), dec!(0), dec!(0));
        let obs = observed(dec!(100), dec!(0), 3);
        let batch = deposit(&DepositParams {
            account: &acct,
            asset: &asset(),
            core: &core(3),
            rates: Rates::flat(),
            observed: &obs,
        });
        assert_eq!(batch.net_entry_amount(), dec!(99.00));
        // The internal mirror carries the fee the house collected
        let internal_sum: Decimal = batch.internals.iter().map(|i| i.amount).sum();
        assert_eq!(batch.net_entry_amount() + internal_sum, dec!(100));
    }
}
