//! Background runners: pricing poll, wallet sweep, period close, jti sweep.
//!
//! Each loop is a plain interval ticker with cooperative shutdown: the watch
//! channel flips, the loop finishes the in-flight tick (store calls complete,
//! so ledger idempotency is never violated by a torn write) and exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use meterline_billing::PeriodCloseService;
use meterline_pricing::{PricingWorker, WalletDebitService};
use meterline_shared::Clock;
use meterline_store::{JtiStore, Store};

const WALLET_SWEEP_BATCH: usize = 500;

/// Shutdown signal shared by every runner. Workers stop after their current
/// tick once `trigger` is called.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl Shutdown {
    async fn wait(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub fn spawn_pricing_loop(
    worker: Arc<PricingWorker>,
    poll_interval: Duration,
    mut shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    worker.tick().await;
                }
                _ = shutdown.wait() => {
                    tracing::info!("pricing loop stopped");
                    return;
                }
            }
        }
    })
}

pub fn spawn_wallet_sweep(
    wallet: WalletDebitService,
    sweep_interval: Duration,
    mut shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match wallet.debit_batch(WALLET_SWEEP_BATCH).await {
                        Ok(0) => {}
                        Ok(count) => tracing::info!(count, "wallet sweep debited items"),
                        Err(err) => tracing::error!(error = %err, "wallet sweep failed"),
                    }
                }
                _ = shutdown.wait() => {
                    tracing::info!("wallet sweep stopped");
                    return;
                }
            }
        }
    })
}

pub fn spawn_period_close(
    close: Arc<PeriodCloseService>,
    clock: Arc<dyn Clock>,
    run_interval: Duration,
    mut shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(run_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a crash-looping
        // process does not hammer the close path.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = close.run(clock.now()).await {
                        tracing::error!(error = %err, "period close run failed");
                    }
                }
                _ = shutdown.wait() => {
                    tracing::info!("period close stopped");
                    return;
                }
            }
        }
    })
}

pub fn spawn_jti_sweep(
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    sweep_interval: Duration,
    mut shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match store.delete_expired_jtis(clock.now()).await {
                        Ok(0) => {}
                        Ok(count) => tracing::debug!(count, "expired jti records dropped"),
                        Err(err) => tracing::error!(error = %err, "jti sweep failed"),
                    }
                }
                _ = shutdown.wait() => {
                    tracing::info!("jti sweep stopped");
                    return;
                }
            }
        }
    })
}
