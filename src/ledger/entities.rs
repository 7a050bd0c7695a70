//! Row types for the ledger store.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::status::EntryStatus;

pub type AccountId = i64;
pub type AssetId = i64;
pub type CoreId = i64;
pub type EntryId = i64;
pub type UserId = i64;

/// Name of the administrative account that receives value whose owning
/// account could not be resolved.
pub const UNCLAIMED_ACCOUNT: &str = "unclaimed";

/// Which external system of record a core talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RailKind {
    Crypto,
    Fiat,
}

impl fmt::Display for RailKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RailKind::Crypto => write!(f, "crypto"),
            RailKind::Fiat => write!(f, "fiat"),
        }
    }
}

impl FromStr for RailKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "crypto" => Ok(RailKind::Crypto),
            "fiat" => Ok(RailKind::Fiat),
            _ => Err(format!("Invalid rail kind: {}", s)),
        }
    }
}

/// User-visible leg classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum EntryKind {
    Crypto = 1,
    Fiat = 2,
    Fee = 3,
    Transfer = 4,
    Trade = 5,
}

impl EntryKind {
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(EntryKind::Crypto),
            2 => Some(EntryKind::Fiat),
            3 => Some(EntryKind::Fee),
            4 => Some(EntryKind::Transfer),
            5 => Some(EntryKind::Trade),
            _ => None,
        }
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }
}

/// System-mirror leg classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum SystemKind {
    /// Mirrors a user-initiated rail movement
    User = 1,
    /// Rail fee mirror, parented to its principal mirror
    Fee = 2,
    /// Rail event with no user counterpart
    External = 3,
}

impl SystemKind {
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(SystemKind::User),
            2 => Some(SystemKind::Fee),
            3 => Some(SystemKind::External),
            _ => None,
        }
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }
}

/// Address registry classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum AddressKind {
    User = 1,
    Internal = 2,
}

impl AddressKind {
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(AddressKind::User),
            2 => Some(AddressKind::Internal),
            _ => None,
        }
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }
}

/// Who recorded a rail-backed transaction.
pub mod added_by {
    pub const SYNC: i16 = 0;
    pub const USER: i16 = 1;
    pub const ADMIN: i16 = 2;
}

/// An asset with its fee formula and deposit policy.
#[derive(Debug, Clone)]
pub struct Asset {
    pub id: AssetId,
    pub code: String,
    pub ticker: String,
    pub is_crypto: bool,
    pub core_type: String,
    /// Proportional component of the deposit/withdrawal fee
    pub fee_rate: Decimal,
    /// Flat component added on top of the proportional part
    pub fee_flat: Decimal,
    /// Floor applied to a nonzero computed fee
    pub fee_min: Decimal,
    /// Incoming amounts below this are not credited to user accounts
    pub deposit_min: Decimal,
}

impl Asset {
    /// Deposit/withdrawal fee charged on a movement of `amount`.
    ///
    /// The formula works on the magnitude; a zero result means the fee
    /// leg is suppressed entirely.
    pub fn compute_fee(&self, amount: Decimal) -> Decimal {
        let fee = self.fee_rate * amount.abs() + self.fee_flat;
        if fee <= Decimal::ZERO {
            Decimal::ZERO
        } else {
            fee.max(self.fee_min)
        }
    }
}

/// A user (or administrative) account holding one asset.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: AccountId,
    pub asset_id: AssetId,
    pub number: String,
    pub name: Option<String>,
    /// None for administrative accounts
    pub owner_id: Option<UserId>,
    pub balance_total: Decimal,
    pub balance_reserved: Decimal,
    pub balance_pending: Decimal,
}

impl Account {
    /// Amount available for new outgoing operations. Must never be driven
    /// negative by a send.
    #[inline]
    pub fn available(&self) -> Decimal {
        self.balance_total - self.balance_reserved - self.balance_pending
    }
}

/// One configured rail instance (a node or a payment processor).
#[derive(Debug, Clone)]
pub struct CoreRow {
    pub id: CoreId,
    pub name: String,
    pub core_type: String,
    pub rail_kind: RailKind,
    pub is_primary: bool,
    /// Last external position the sync pass has fully processed
    pub last_sync_block: i64,
    pub time_synced: Option<DateTime<Utc>>,
    /// Minimum confirmations before a crypto movement settles
    pub min_confirms: i32,
}

/// One user-visible ledger leg.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub account_id: AccountId,
    pub asset_id: AssetId,
    pub amount: Decimal,
    /// Running balance snapshot written by the balance replay
    pub balance_after: Decimal,
    /// Exchange rate to the main asset at posting time
    pub ex_rate: Decimal,
    /// Monotonic per-ledger sequence number
    pub number: i64,
    /// None means system-initiated
    pub created_by: Option<UserId>,
    pub time_added: DateTime<Utc>,
    pub time_executed: Option<DateTime<Utc>>,
    pub kind: EntryKind,
    pub status: EntryStatus,
    /// Fee legs point to their principal leg
    pub parent_id: Option<EntryId>,
    /// Paired leg of an account-to-account move
    pub reciprocal_id: Option<EntryId>,
}

impl LedgerEntry {
    /// Ordering key for the balance replay: execution time when known,
    /// insertion time otherwise.
    #[inline]
    pub fn effective_time(&self) -> DateTime<Utc> {
        self.time_executed.unwrap_or(self.time_added)
    }
}

/// Wallet-level fee accounting leg, not user-visible.
#[derive(Debug, Clone)]
pub struct InternalEntry {
    pub id: EntryId,
    pub account_id: Option<AccountId>,
    pub asset_id: AssetId,
    /// The user-visible leg this internal leg funds
    pub user_tx_id: Option<EntryId>,
    /// Chains to a prior internal leg (fee of a fee)
    pub parent_id: Option<EntryId>,
    pub amount: Decimal,
    pub ex_rate: Decimal,
    pub time_executed: Option<DateTime<Utc>>,
    pub status: EntryStatus,
}

/// The rail-backed record the reconciliation scheduler operates on.
#[derive(Debug, Clone)]
pub struct RailTx {
    pub id: EntryId,
    pub rail_kind: RailKind,
    pub core_id: CoreId,
    /// None for system-only movements
    pub account_id: Option<AccountId>,
    pub asset_id: AssetId,
    pub user_tx_id: Option<EntryId>,
    /// The internal rail-fee leg
    pub internal_tx_id: Option<EntryId>,
    /// Chained internal moves
    pub parent_id: Option<EntryId>,
    pub amount: Decimal,
    /// Rail-reported fee, normalized to be <= 0
    pub rail_fee: Decimal,
    pub fee_asset_id: AssetId,
    pub address: Option<String>,
    pub address_ext: Option<String>,
    /// Txid or external payment id once the rail has acknowledged
    pub external_id: Option<String>,
    pub external_index: Option<i32>,
    pub send_attempts: i32,
    /// Earliest retry eligibility for the send pass
    pub time_retry: Option<DateTime<Utc>>,
    pub time_executed: Option<DateTime<Utc>>,
    pub status: EntryStatus,
    /// Wallet rebalancing rather than a user-facing movement
    pub is_internal: bool,
    pub added_by: i16,
}

/// Exchange-wide mirror of a rail movement's economic effect.
#[derive(Debug, Clone)]
pub struct SystemEntry {
    pub id: EntryId,
    pub kind: SystemKind,
    pub asset_id: AssetId,
    pub amount: Decimal,
    pub ex_rate: Decimal,
    pub rail_tx_id: Option<EntryId>,
    pub parent_id: Option<EntryId>,
    pub status: EntryStatus,
}

/// Registry row for an address this system controls.
#[derive(Debug, Clone)]
pub struct AddressRecord {
    pub id: EntryId,
    pub core_id: CoreId,
    pub asset_id: AssetId,
    pub account_id: AccountId,
    pub address: String,
    pub kind: AddressKind,
    pub amount_received: Decimal,
}

/// Terminal disposition of an externally observed event, as reported by
/// the rail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedState {
    Pending,
    Completed,
    Failed,
}

/// One transaction observed on the rail, before it is mirrored into the
/// ledger.
#[derive(Debug, Clone)]
pub struct ObservedTx {
    pub external_id: String,
    pub address: Option<String>,
    pub address_ext: Option<String>,
    /// Asset the amount is denominated in
    pub asset_id: AssetId,
    /// Signed: positive incoming, negative outgoing
    pub amount: Decimal,
    /// Rail fee as reported; sign normalized during posting
    pub fee: Decimal,
    pub fee_asset_id: AssetId,
    pub confirmations: i32,
    pub block_number: i64,
    /// Output/leg index within the external transaction
    pub index: Option<i32>,
    pub time: DateTime<Utc>,
    /// Explicit disposition for fiat rails; crypto rails report Pending
    /// and let confirmations decide
    pub state: ObservedState,
}
