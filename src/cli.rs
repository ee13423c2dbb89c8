/// CLI Module
///
/// Command-line interface configuration using clap.
use clap::Parser;
use std::time::Duration;

use crate::sync::SyncConfig;

/// Chain Harvester - continuous chain sync engine
///
/// Continuously ingest blocks and account state from a node RPC,
/// reconcile chain reorganizations, and persist history to PostgreSQL
#[derive(Parser, Debug)]
#[command(name = "chain-harvester")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Node RPC endpoint URL (overrides NODE_RPC_URL env var)
    #[arg(short = 'r', long, value_name = "URL")]
    pub node_url: Option<String>,

    /// Database connection URL (overrides DATABASE_URL env var)
    #[arg(short = 'd', long, value_name = "URL")]
    pub database_url: Option<String>,

    /// Target network identifier
    #[arg(short = 'n', long, value_name = "NETWORK", default_value = "main")]
    pub network: String,

    /// Seconds to sleep between sync iterations
    #[arg(short = 's', long, value_name = "SECONDS", default_value = "30")]
    pub sleep_interval: u64,

    /// Recompute fee bands every N iterations
    #[arg(long, value_name = "ITERATIONS", default_value = "20")]
    pub fee_update_interval: u64,

    /// Purge stale account rows every N iterations
    #[arg(long, value_name = "ITERATIONS", default_value = "60")]
    pub purge_accounts_interval: u64,

    /// Number of recent fee samples per operation kind
    #[arg(long, value_name = "COUNT", default_value = "100")]
    pub fee_sample_count: i64,

    /// Concurrent requests per batched node fetch
    #[arg(short = 'b', long, value_name = "SIZE", default_value = "10")]
    pub batch_size: usize,

    /// Maximum diverging blocks collected when walking back a fork
    #[arg(long, value_name = "COUNT", default_value = "1000")]
    pub fork_depth_limit: usize,
}

impl Cli {
    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("Batch size must be greater than 0");
        }

        if self.fee_update_interval == 0 {
            anyhow::bail!("Fee update interval must be greater than 0");
        }

        if self.purge_accounts_interval == 0 {
            anyhow::bail!("Purge accounts interval must be greater than 0");
        }

        if self.fee_sample_count <= 0 {
            anyhow::bail!("Fee sample count must be greater than 0");
        }

        if self.fork_depth_limit == 0 {
            anyhow::bail!("Fork depth limit must be greater than 0");
        }

        Ok(())
    }

    /// Build the orchestrator configuration from the parsed arguments
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            sleep_interval: Duration::from_secs(self.sleep_interval),
            fee_update_interval: self.fee_update_interval,
            purge_accounts_interval: self.purge_accounts_interval,
            fee_sample_count: self.fee_sample_count,
            fork_depth_limit: self.fork_depth_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            node_url: None,
            database_url: None,
            network: "main".to_string(),
            sleep_interval: 30,
            fee_update_interval: 20,
            purge_accounts_interval: 60,
            fee_sample_count: 100,
            batch_size: 10,
            fork_depth_limit: 1000,
        }
    }

    #[test]
    fn test_validation_accepts_defaults() {
        assert!(base_cli().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_batch_size() {
        let cli = Cli { batch_size: 0, ..base_cli() };
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_intervals() {
        let cli = Cli { fee_update_interval: 0, ..base_cli() };
        assert!(cli.validate().is_err());

        let cli = Cli { purge_accounts_interval: 0, ..base_cli() };
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_sync_config_mapping() {
        let config = base_cli().sync_config();
        assert_eq!(config.sleep_interval, Duration::from_secs(30));
        assert_eq!(config.fee_update_interval, 20);
        assert_eq!(config.fee_sample_count, 100);
    }
}
