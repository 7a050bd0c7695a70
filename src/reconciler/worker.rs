//! Per-core worker: spawns the four reconciliation loops and stops them
//! on the shutdown signal.
//!
//! Every sleep point honors shutdown, so stopping takes at most one
//! in-flight pass. A failed pass logs and waits for the next tick; work
//! is reselected from row status, so nothing is lost.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::{CoreContext, confirm, recover, send, sync};

pub struct CoreWorker {
    handles: Vec<JoinHandle<()>>,
}

impl CoreWorker {
    /// Spawn all four loops for one core. Each loop waits out the
    /// startup delay, then ticks on the process interval.
    pub fn spawn(ctx: Arc<CoreContext>, shutdown: watch::Receiver<bool>) -> Self {
        tracing::info!(
            core = %ctx.core_name,
            startup_delay = ?ctx.timings.startup_delay,
            interval = ?ctx.timings.process_interval,
            "Starting reconciliation loops"
        );

        let handles = vec![
            spawn_loop("send", ctx.clone(), shutdown.clone(), |ctx, _| {
                Box::pin(async move { send::run(&ctx).await })
            }),
            spawn_loop("sync", ctx.clone(), shutdown.clone(), |ctx, iteration| {
                Box::pin(async move { sync::run(&ctx, iteration).await })
            }),
            spawn_loop("confirm", ctx.clone(), shutdown.clone(), |ctx, _| {
                Box::pin(async move { confirm::run(&ctx).await })
            }),
            spawn_loop("recover", ctx, shutdown, |ctx, _| {
                Box::pin(async move { recover::run(&ctx).await })
            }),
        ];

        Self { handles }
    }

    /// Wait for every loop to exit after shutdown was signalled.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Reconciliation loop panicked");
            }
        }
    }
}

type PassFuture = std::pin::Pin<
    Box<dyn Future<Output = Result<(), crate::ledger::LedgerError>> + Send>,
>;

fn spawn_loop<F>(
    name: &'static str,
    ctx: Arc<CoreContext>,
    mut shutdown: watch::Receiver<bool>,
    pass: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<CoreContext>, u64) -> PassFuture + Send + 'static,
{
    tokio::spawn(async move {
        if sleep_or_shutdown(ctx.timings.startup_delay, &mut shutdown).await {
            return;
        }

        let mut iteration: u64 = 0;
        loop {
            iteration += 1;
            if let Err(e) = pass(ctx.clone(), iteration).await {
                tracing::error!(
                    core = %ctx.core_name,
                    pass = name,
                    iteration,
                    error = %e,
                    "Pass aborted; will retry next tick"
                );
            }
            if sleep_or_shutdown(ctx.timings.process_interval, &mut shutdown).await {
                tracing::info!(core = %ctx.core_name, pass = name, "Loop stopped");
                return;
            }
        }
    })
}

/// Sleep for `duration`, returning true if shutdown arrived first.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = sleep(duration) => false,
        _ = shutdown.changed() => *shutdown.borrow(),
    }
}
