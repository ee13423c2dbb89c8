/// Sync Module
///
/// The ingestion orchestrator: one logical control loop that, per iteration,
/// pulls missing blocks from the node (following forks), persists them,
/// snapshots account state, and on a slower cadence recomputes fee bands and
/// prunes stale account rows. All failures are recovered at the iteration
/// boundary; the loop only stops on shutdown.
pub mod accounts;
pub mod blocks;

use anyhow::{Context, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::models::OperationKind;
use crate::rpc::NodeClient;

/// Loop cadence and sampling knobs, supplied at startup
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Pause between iterations
    pub sleep_interval: Duration,
    /// Recompute fee bands every this many iterations
    pub fee_update_interval: u64,
    /// Purge stale account rows every this many iterations
    pub purge_accounts_interval: u64,
    /// Number of recent fee samples per kind
    pub fee_sample_count: i64,
    /// Maximum number of diverging blocks to collect when walking back a fork
    pub fork_depth_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sleep_interval: Duration::from_secs(30),
            fee_update_interval: 20,
            purge_accounts_interval: 60,
            fee_sample_count: 100,
            fork_depth_limit: 1000,
        }
    }
}

/// The ingestion orchestrator
pub struct Syncer {
    pub(crate) node: NodeClient,
    pub(crate) database: Database,
    pub(crate) config: SyncConfig,
}

impl Syncer {
    pub fn new(node: NodeClient, database: Database, config: SyncConfig) -> Self {
        Self { node, database, config }
    }

    /// Run the sync loop until the shutdown token fires.
    ///
    /// Iterations never overlap: each one runs to completion (success or
    /// logged failure) before the inter-iteration sleep, which bounds load
    /// on both the node and the store. The shutdown token is checked at the
    /// top of each iteration and during the sleep, never mid-iteration, so
    /// in-flight transactions always complete or roll back cleanly.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut iteration: u64 = 0;

        loop {
            if shutdown.is_cancelled() {
                tracing::info!("Shutdown requested, stopping sync loop after {} iterations", iteration);
                return Ok(());
            }

            iteration += 1;
            tracing::info!("Starting sync iteration {}", iteration);

            if let Err(e) = self.run_iteration(iteration).await {
                tracing::error!("Sync iteration {} failed, will retry next iteration: {:#}", iteration, e);
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested during sleep, stopping sync loop");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.sleep_interval) => {}
            }
        }
    }

    /// One sync pass: blocks, then accounts, then due maintenance.
    ///
    /// Account processing always observes the effects of this iteration's
    /// block processing; a failure in any step aborts the remaining steps
    /// and surfaces at the loop boundary.
    async fn run_iteration(&self, iteration: u64) -> Result<()> {
        self.process_blocks().await.context("Block processing failed")?;
        self.process_accounts().await.context("Account processing failed")?;

        if is_due(iteration, self.config.fee_update_interval) {
            self.update_average_fees().await.context("Fee band update failed")?;
        }

        if is_due(iteration, self.config.purge_accounts_interval) {
            self.database.purge_old_accounts().await.context("Account purge failed")?;
        }

        Ok(())
    }

    /// Recompute and persist the fee band for every fee-carrying kind
    async fn update_average_fees(&self) -> Result<()> {
        for kind in OperationKind::FEE_KINDS {
            match self.database.calculate_average_fees(kind, self.config.fee_sample_count).await? {
                Some(band) => {
                    tracing::info!(
                        "Fee band for {}: low={} medium={} high={}",
                        band.kind,
                        band.low,
                        band.medium,
                        band.high
                    );
                    self.database.write_fees(&band).await?;
                }
                None => tracing::debug!("No fee samples yet for kind {}", kind.as_str()),
            }
        }

        Ok(())
    }
}

/// Whether a maintenance task with the given iteration cadence runs now
fn is_due(iteration: u64, interval: u64) -> bool {
    interval > 0 && iteration % interval == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_due_cadence() {
        assert!(!is_due(1, 20));
        assert!(!is_due(19, 20));
        assert!(is_due(20, 20));
        assert!(is_due(40, 20));
        assert!(is_due(3, 1));
    }

    #[test]
    fn test_is_due_zero_interval_never_fires() {
        assert!(!is_due(0, 0));
        assert!(!is_due(100, 0));
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(config.sleep_interval > Duration::ZERO);
        assert!(config.fee_update_interval > 0);
        assert!(config.purge_accounts_interval > 0);
    }
}
