//! Collectors and the interval scheduler driving them.

use std::time::Duration;

use anyhow::{bail, Error};
use tokio_util::sync::CancellationToken;

pub mod pbs;
pub mod pve;

pub use pbs::PbsCollector;
pub use pve::PveCollector;

/// One periodic data source.
#[async_trait::async_trait]
pub trait Collector: Send {
    /// Unique name, also the key for the cache's per-collector liveness.
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    /// Run one poll cycle. An error means the whole cycle was fatal;
    /// partial failures are handled (and logged) inside.
    async fn collect(&mut self, token: &CancellationToken) -> Result<(), Error>;
}

/// Drive one collector until cancellation: one cycle immediately on
/// startup, then one per interval tick. Collect errors are logged and the
/// loop continues - a collector is expected to self-recover at the next
/// tick.
pub async fn run_collector(
    mut collector: Box<dyn Collector>,
    token: CancellationToken,
) -> Result<(), Error> {
    let name = collector.name().to_string();

    if let Err(err) = collector.collect(&token).await {
        if token.is_cancelled() {
            bail!("collector {} cancelled", name);
        }
        log::error!("collector {} failed - {}", name, err);
    }

    let mut ticker = tokio::time::interval(collector.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = collector.collect(&token).await {
                    if token.is_cancelled() {
                        bail!("collector {} cancelled", name);
                    }
                    log::error!("collector {} failed - {}", name, err);
                }
            }
            _ = token.cancelled() => {
                bail!("collector {} cancelled", name);
            }
        }
    }
}
