//! The ledger core: entities, the balance replay, the posting engine and
//! the persistence layer that applies its batches atomically.

pub mod balance;
pub mod entities;
pub mod error;
pub mod posting;
pub mod status;
pub mod store;

pub use entities::{
    Account, AccountId, AddressKind, AddressRecord, Asset, AssetId, CoreId, CoreRow, EntryId,
    EntryKind, InternalEntry, LedgerEntry, ObservedState, ObservedTx, RailKind, RailTx,
    SystemEntry, SystemKind, UNCLAIMED_ACCOUNT, UserId,
};
pub use error::LedgerError;
pub use status::EntryStatus;
pub use store::LedgerStore;
