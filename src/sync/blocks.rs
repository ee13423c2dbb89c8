/// Block Sync Module
///
/// Per-iteration block processing: work out which levels are missing
/// locally, pull them from the node in one batched pass (block shell and
/// operation groups decoded from the same payload), persist them, and walk
/// back any fork so the invalidation ledger keeps exactly one canonical
/// block per level.
use anyhow::{Context, Result};

use super::Syncer;
use crate::fetch::{self, DataFetcher};
use crate::models::{decode_operation_groups, Block, OperationGroup};

impl Syncer {
    /// Fetch and persist all blocks not yet present locally, following
    /// forks back to the common ancestor.
    pub(crate) async fn process_blocks(&self) -> Result<()> {
        let head = self.node.head().await.context("Failed to fetch chain head")?;
        let head_level = head.header.level;
        let local_max = self.database.fetch_max_block_level().await?;

        if local_max >= head_level {
            if self.database.block_exists(&head.hash).await? {
                tracing::debug!("Up to date at level {} ({})", head_level, head.hash);
                return Ok(());
            }

            // a previously-seen height now carries a different hash: the
            // head itself is the start of the diverging branch
            tracing::warn!("Fork detected at level {}: new head {}", head_level, head.hash);
            return self.follow_fork(head).await;
        }

        if !self.database.do_blocks_exist().await? {
            tracing::info!("No local blocks yet, bootstrapping from genesis");
        }

        let missing = (head_level - local_max) as usize;
        tracing::info!("Fetching {} missing blocks up to level {}", missing, head_level);

        // one round trip per offset, two decodings of each payload
        let fetcher = fetch::add_decoding(self.node.block_fetcher(&head.hash), decode_operation_groups);
        let offsets: Vec<i64> = (0..missing as i64).collect();
        let fetched = fetcher.fetch(&offsets).await.context("Failed to fetch missing blocks")?;
        let blocks = attach_groups(fetched);

        self.database.write_blocks(&blocks).await?;

        // the deepest fetched block must join onto local canonical history;
        // when it does not, the chain reorganized below the fetched suffix
        if let Some(oldest) = blocks.last() {
            if oldest.header.level > 0 && !self.is_locally_canonical(&oldest.header.predecessor).await? {
                tracing::warn!(
                    "Fork detected below level {}: predecessor {} is not canonical locally",
                    oldest.header.level,
                    oldest.header.predecessor
                );
                let predecessor = self.node.block(&oldest.header.predecessor).await?;
                self.follow_fork(predecessor).await?;
            }
        }

        Ok(())
    }

    /// Walk the predecessor chain from a diverging block until a locally
    /// canonical block is reached, then persist the collected branch and
    /// revalidate it so it becomes the canonical history at those levels.
    async fn follow_fork(&self, from: Block) -> Result<()> {
        let mut diverging = vec![from];

        loop {
            let tip = diverging.last().context("diverging branch cannot be empty")?;

            if tip.header.level == 0 {
                break;
            }
            if diverging.len() >= self.config.fork_depth_limit {
                tracing::warn!(
                    "Fork walk stopped at depth limit {} without finding a common ancestor",
                    self.config.fork_depth_limit
                );
                break;
            }

            let predecessor_hash = tip.header.predecessor.clone();
            if self.is_locally_canonical(&predecessor_hash).await? {
                break;
            }

            let predecessor = self
                .node
                .block(&predecessor_hash)
                .await
                .with_context(|| format!("Failed to fetch fork predecessor {predecessor_hash}"))?;
            diverging.push(predecessor);
        }

        self.database.write_and_invalidate_blocks(&diverging).await?;
        let (demoted, promoted) = self.database.revalidate_blocks(&diverging).await?;

        tracing::info!(
            "Fork resolved: {} blocks revalidated ({} demoted, {} promoted)",
            diverging.len(),
            demoted,
            promoted
        );
        Ok(())
    }

    /// Whether a hash is currently the canonical local block at its level:
    /// either its ledger row is not invalidated, or it was stored through
    /// the plain path and never entered the ledger. Plain-path writes are
    /// transactional, so a stored block always carries every operation
    /// group it had, including none at all for a legitimately empty block.
    async fn is_locally_canonical(&self, hash: &str) -> Result<bool> {
        match self.database.invalidated_block(hash).await? {
            Some(row) => Ok(!row.is_invalidated),
            None => self.database.block_exists(hash).await,
        }
    }
}

/// Attach the separately-decoded operation groups to their block shells,
/// dropping the offset keys once correlation has served its purpose.
fn attach_groups(fetched: Vec<(i64, (Block, Vec<OperationGroup>))>) -> Vec<Block> {
    fetched
        .into_iter()
        .map(|(_, (mut block, groups))| {
            block.operation_groups = groups;
            block
        })
        .collect()
}
