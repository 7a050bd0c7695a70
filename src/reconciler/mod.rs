//! Reconciliation scheduler.
//!
//! One worker per configured core runs four independent loops against
//! the rail: send (push queued movements out), sync (pull observed
//! events in), confirm (settle submitted movements), recover (requeue
//! claims orphaned by a crash). Loops share nothing but the store and
//! the rail handle; each pass re-reads its work from row status, so a
//! failed iteration is simply retried on the next tick.

pub mod confirm;
pub mod recover;
pub mod send;
pub mod sync;
pub mod worker;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::ledger::entities::{AssetId, RailKind};
use crate::ledger::posting::Rates;
use crate::ledger::store::LedgerStore;
use crate::notify::Notifier;
use crate::rail::Rail;

pub use worker::CoreWorker;

/// Exchange rates to the main asset at posting time.
pub trait RateSource: Send + Sync + Debug {
    fn rates(&self, asset_id: AssetId, fee_asset_id: AssetId) -> Rates;
}

/// All rates pinned to 1. Used when no market feed is wired in.
#[derive(Debug, Default)]
pub struct FlatRates;

impl RateSource for FlatRates {
    fn rates(&self, _asset_id: AssetId, _fee_asset_id: AssetId) -> Rates {
        Rates::flat()
    }
}

/// Cadence and retry policy for one core's loops.
#[derive(Debug, Clone)]
pub struct CoreTimings {
    /// Pause before the first iteration so the rail can come up
    pub startup_delay: Duration,
    /// Tick between iterations of every loop
    pub process_interval: Duration,
    /// How long a claimed send may be stranded before recovery requeues it
    pub recovery_delay: Duration,
    /// Pushback after a rail-side insufficient-balance outcome
    pub retry_balance_delay: Duration,
    /// Pushback while an upstream movement is still unconfirmed
    pub retry_unconfirmed_delay: Duration,
    /// Internal moves give up for good after this many attempts
    pub max_internal_attempts: i32,
    /// Rows pulled per pass iteration
    pub batch_size: i64,
    /// Rail balance snapshot cadence, in sync iterations
    pub snapshot_every: u64,
}

impl CoreTimings {
    pub fn for_kind(kind: RailKind) -> Self {
        CoreTimings {
            startup_delay: match kind {
                RailKind::Crypto => Duration::from_secs(30),
                RailKind::Fiat => Duration::from_secs(60),
            },
            process_interval: Duration::from_secs(10),
            recovery_delay: Duration::from_secs(3600),
            retry_balance_delay: Duration::from_secs(3600),
            retry_unconfirmed_delay: Duration::from_secs(3600),
            max_internal_attempts: 10,
            batch_size: 1000,
            snapshot_every: 60,
        }
    }
}

/// Everything one core's loops need, shared by Arc across the four
/// tasks.
pub struct CoreContext {
    pub core_name: String,
    pub store: LedgerStore,
    pub rail: Arc<dyn Rail>,
    pub notifier: Arc<dyn Notifier>,
    pub rates: Arc<dyn RateSource>,
    pub timings: CoreTimings,
}

impl CoreContext {
    /// Reload the core row so every pass sees the freshest checkpoint.
    pub async fn core_row(
        &self,
    ) -> Result<crate::ledger::entities::CoreRow, crate::ledger::LedgerError> {
        self.store
            .core_by_name(&self.core_name)
            .await?
            .ok_or_else(|| crate::ledger::LedgerError::CoreNotFound(self.core_name.clone()))
    }
}
