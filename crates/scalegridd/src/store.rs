//! `scalegridd store` — hosts the shared coordination store over HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::Args;
use scalegrid_state::StateStore;
use scalegrid_state::duration::parse_duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::node::shutdown_signal;

#[derive(Debug, Clone, Args)]
pub struct StoreArgs {
    /// Address to serve the store on.
    #[arg(long = "listen-address", default_value = "0.0.0.0:8700")]
    pub listen_address: SocketAddr,

    /// Data directory for the store file.
    #[arg(long = "data-dir", default_value = "/var/lib/scalegrid")]
    pub data_dir: PathBuf,

    /// Interval between expired-lease sweeps.
    #[arg(long = "reap-interval", default_value = "1s")]
    pub reap_interval: String,
}

/// Periodically delete expired leases and their keys, so that watchers see
/// the deletion even when nothing else touches the store.
pub fn spawn_reaper(
    store: StateStore,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match store.reap_expired() {
                        Ok(0) => {}
                        Ok(n) => debug!(leases = n, "reaped expired leases"),
                        Err(e) => warn!(error = %e, "lease reaper failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

pub async fn run_store(args: StoreArgs) -> anyhow::Result<()> {
    let reap_every = parse_duration(&args.reap_interval)
        .map_err(|e| anyhow!("invalid reap interval {:?}: {e}", args.reap_interval))?;
    if reap_every.is_zero() {
        return Err(anyhow!("reap interval must be positive"));
    }

    std::fs::create_dir_all(&args.data_dir)?;
    let db_path = args.data_dir.join("scalegrid.redb");
    let store = StateStore::open(&db_path)
        .with_context(|| format!("opening store {}", db_path.display()))?;
    info!(path = ?db_path, revision = store.revision(), "store opened");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = spawn_reaper(store.clone(), reap_every, shutdown_rx);

    let listener = tokio::net::TcpListener::bind(args.listen_address)
        .await
        .with_context(|| format!("binding {}", args.listen_address))?;
    info!(addr = %args.listen_address, "store service starting");

    let served = axum::serve(listener, scalegrid_api::store_router(store))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let _ = shutdown_tx.send(true);
    let _ = reaper.await;
    served.context("store service failed")?;
    info!("store service stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use scalegrid_state::ManualClock;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn reaper_expires_idle_leases() {
        let clock = ManualClock::new(0);
        let store = StateStore::open_in_memory()
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        let lease = store.grant_lease(Duration::from_secs(5)).unwrap();
        store.put_if_absent("locks/p1", "node-a", Some(lease)).unwrap();
        let since = store.revision();

        let (tx, rx) = watch::channel(false);
        let reaper = spawn_reaper(store.clone(), Duration::from_secs(1), rx);

        clock.advance(Duration::from_secs(6));
        tokio::time::sleep(Duration::from_secs(2)).await;

        // Only the reaper has touched the store since the lease expired.
        assert_eq!(store.revision(), since + 1);
        assert_eq!(store.get("locks/p1").unwrap(), None);

        tx.send(true).unwrap();
        reaper.await.unwrap();
    }
}
