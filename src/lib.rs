//! Custodian - Multi-Asset Custodial Ledger Core
//!
//! Transaction processing for a custodial system holding crypto and
//! fiat assets: multi-leg posting, replay-based balances, and a
//! reconciliation scheduler that keeps the ledger consistent with the
//! external rails.
//!
//! # Modules
//!
//! - [`ledger`] - Entities, status machine, posting engine, balance
//!   replay, and the Postgres store
//! - [`rail`] - Adapter trait for external rails plus a scriptable mock
//! - [`reconciler`] - The four per-core loops: send, sync, confirm,
//!   recover
//! - [`resolver`] - Routes observed rail events to accounts
//! - [`service`] - User-facing operations (sends, cancels, moves)
//! - [`notify`] - Post-commit notification sinks

pub mod config;
pub mod db;
pub mod ledger;
pub mod logging;
pub mod notify;
pub mod rail;
pub mod reconciler;
pub mod resolver;
pub mod service;

// Convenient re-exports at crate root
pub use config::{AppConfig, CoreConfig};
pub use db::Database;
pub use ledger::{
    Account, AccountId, Asset, AssetId, CoreRow, EntryId, EntryStatus, LedgerError, LedgerStore,
    RailKind, RailTx,
};
pub use notify::{LogNotifier, Notifier};
pub use rail::{MockRail, Rail, RailError, SendOutcome, TxStanding};
pub use reconciler::{CoreContext, CoreTimings, CoreWorker, FlatRates, RateSource};
pub use service::CustodyService;
