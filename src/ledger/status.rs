//! Ledger entry status state machine.
//!
//! Status IDs are stored in PostgreSQL as SMALLINT. Terminal states:
//! SUCCESS (30), FAILED (-10), CANCELED (-20).

use std::fmt;

/// Lifecycle status shared by ledger legs and rail-backed records.
///
/// The send pipeline moves NEW -> ACTIVE -> PENDING -> SUCCESS/FAILED.
/// PENDING_ADMIN is an alternate entry state for sends awaiting manual
/// approval; CANCELED is only reachable from NEW or PENDING_ADMIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum EntryStatus {
    /// Eligible for pickup by the send pass (retry time permitting)
    New = 0,

    /// Awaiting manual approval; approval moves it back to NEW
    PendingAdmin = 5,

    /// Claimed by a send attempt; transient, repaired by recovery if stuck
    Active = 10,

    /// Accepted by the rail, awaiting confirmation
    Pending = 20,

    /// Terminal: settled and counted fully in the account total
    Success = 30,

    /// Terminal: rail rejected or lost the transaction
    Failed = -10,

    /// Terminal: withdrawn before any send attempt
    Canceled = -20,
}

impl EntryStatus {
    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EntryStatus::Success | EntryStatus::Failed | EntryStatus::Canceled
        )
    }

    /// Whether a leg in this status participates in the running balance.
    /// Positive pending legs also count; that filter lives in the balance
    /// engine because it depends on the leg amount.
    #[inline]
    pub fn is_settled(&self) -> bool {
        matches!(self, EntryStatus::Success)
    }

    /// States a cancel request is legal from.
    #[inline]
    pub fn is_cancelable(&self) -> bool {
        matches!(self, EntryStatus::New | EntryStatus::PendingAdmin)
    }

    /// Legal forward transitions, as driven by the scheduler passes and
    /// the admin approve/cancel operations.
    pub fn can_transition(&self, next: EntryStatus) -> bool {
        use EntryStatus::*;
        matches!(
            (self, next),
            (New, Active)
                | (New, Canceled)
                | (New, Failed)
                | (PendingAdmin, New)
                | (PendingAdmin, Canceled)
                | (Active, Pending)
                | (Active, New)      // recovery reset / rail retry pushback
                | (Active, Failed)
                | (Pending, Success)
                | (Pending, Failed)
        )
    }

    /// Get the numeric status ID for PostgreSQL storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from a PostgreSQL status ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(EntryStatus::New),
            5 => Some(EntryStatus::PendingAdmin),
            10 => Some(EntryStatus::Active),
            20 => Some(EntryStatus::Pending),
            30 => Some(EntryStatus::Success),
            -10 => Some(EntryStatus::Failed),
            -20 => Some(EntryStatus::Canceled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::New => "NEW",
            EntryStatus::PendingAdmin => "PENDING_ADMIN",
            EntryStatus::Active => "ACTIVE",
            EntryStatus::Pending => "PENDING",
            EntryStatus::Success => "SUCCESS",
            EntryStatus::Failed => "FAILED",
            EntryStatus::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for EntryStatus {
    type Error = i16;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        EntryStatus::from_id(value).ok_or(value)
    }
}
