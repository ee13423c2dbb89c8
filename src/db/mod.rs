/// Database Module
///
/// This module handles all PostgreSQL operations including:
/// - Connection pool management and schema migrations
/// - Transactional writes for blocks, operation groups, operations, accounts
/// - The invalidation/revalidation ledger used for fork resolution
/// - Existence and max-level queries driving the sync loop's work selection
pub mod fees;

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

use crate::models::{Account, AverageFees, Block, InvalidatedBlock, NO_LEVEL};

pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL database")?;

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await.context("Failed to run database migrations")?;

        tracing::info!("Database migrations completed successfully");
        Ok(())
    }

    /// Test the database connection
    pub async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.context("Database connection test failed")?;

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Atomically insert blocks with their operation groups and operations.
    ///
    /// Plain inserts: any constraint violation (duplicate hash, etc.) rolls
    /// back the whole transaction, so no partial block writes ever land.
    /// Returns (blocks, groups, operations) inserted.
    pub async fn write_blocks(&self, blocks: &[Block]) -> Result<(usize, usize, usize)> {
        let mut tx = self.pool.begin().await?;

        let mut groups_inserted = 0;
        let mut operations_inserted = 0;

        for block in blocks {
            let (groups, operations) = insert_block_rows(&mut tx, block, false).await?;
            groups_inserted += groups;
            operations_inserted += operations;
        }

        tx.commit().await.context("Failed to commit block write")?;

        tracing::info!(
            "Wrote {} blocks with {} operation groups and {} operations",
            blocks.len(),
            groups_inserted,
            operations_inserted
        );
        Ok((blocks.len(), groups_inserted, operations_inserted))
    }

    /// Atomically write blocks re-fetched during fork resolution and append
    /// each of them to the invalidated-blocks ledger.
    ///
    /// Blocks on this path may already exist locally (a previously demoted
    /// branch coming back), so their derived rows are replaced rather than
    /// plainly inserted. The ledger append leaves `is_invalidated` at its
    /// FALSE default; promotion/demotion happens in `revalidate_blocks`.
    pub async fn write_and_invalidate_blocks(&self, blocks: &[Block]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        for block in blocks {
            insert_block_rows(&mut tx, block, true).await?;

            sqlx::query(
                r#"
                INSERT INTO invalidated_blocks (hash, level)
                VALUES ($1, $2)
                ON CONFLICT (hash) DO NOTHING
                "#,
            )
            .bind(&block.hash)
            .bind(block.header.level)
            .execute(&mut *tx)
            .await?;

            // rival blocks at the same level that were stored through the
            // plain path have no ledger row yet; enroll them so the
            // revalidation pass can demote them
            sqlx::query(
                r#"
                INSERT INTO invalidated_blocks (hash, level)
                SELECT hash, level FROM blocks
                WHERE level = $2 AND hash <> $1
                ON CONFLICT (hash) DO NOTHING
                "#,
            )
            .bind(&block.hash)
            .bind(block.header.level)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.context("Failed to commit fork block write")?;

        tracing::info!("Wrote {} fork blocks into the invalidation ledger", blocks.len());
        Ok(blocks.len())
    }

    /// Bulk insert one account row per snapshot entry, all tagged with the
    /// snapshot's block level. Re-running a snapshot at the same level
    /// replaces the rows.
    pub async fn write_accounts(&self, accounts: &[Account]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        for account in accounts {
            sqlx::query(
                r#"
                INSERT INTO accounts (
                    account_id, block_id, block_level, manager, spendable,
                    delegate_setable, delegate_value, balance, counter, script
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (account_id, block_level)
                DO UPDATE SET
                    block_id = EXCLUDED.block_id,
                    manager = EXCLUDED.manager,
                    spendable = EXCLUDED.spendable,
                    delegate_setable = EXCLUDED.delegate_setable,
                    delegate_value = EXCLUDED.delegate_value,
                    balance = EXCLUDED.balance,
                    counter = EXCLUDED.counter,
                    script = EXCLUDED.script
                "#,
            )
            .bind(&account.account_id)
            .bind(&account.block_id)
            .bind(account.block_level)
            .bind(&account.manager)
            .bind(account.spendable)
            .bind(account.delegate_setable)
            .bind(&account.delegate_value)
            .bind(account.balance)
            .bind(account.counter)
            .bind(&account.script)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.context("Failed to commit account snapshot")?;

        tracing::info!("Wrote {} account snapshots", accounts.len());
        Ok(accounts.len())
    }

    /// Atomically delete every account row whose block_level differs from
    /// the maximum level present, keeping only the most recent snapshot.
    ///
    /// This is deliberately global, not per-account: it assumes every current
    /// account was snapshotted at the same level in the same pass. Calling it
    /// again with no intervening writes deletes nothing.
    pub async fn purge_old_accounts(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let max_level: Option<i64> =
            sqlx::query_scalar("SELECT MAX(block_level) FROM accounts").fetch_one(&mut *tx).await?;

        let deleted = match max_level {
            Some(level) => sqlx::query("DELETE FROM accounts WHERE block_level <> $1")
                .bind(level)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
            None => 0,
        };

        tx.commit().await.context("Failed to commit account purge")?;

        if deleted > 0 {
            tracing::info!("Purged {} stale account rows", deleted);
        }
        Ok(deleted)
    }

    /// Append a freshly computed fee band; consumers read the latest row
    /// per kind, so no truncation happens here.
    pub async fn write_fees(&self, fees: &AverageFees) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fees (low, medium, high, timestamp, kind)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(fees.low)
        .bind(fees.medium)
        .bind(fees.high)
        .bind(fees.timestamp)
        .bind(&fees.kind)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write fee band for kind {}", fees.kind))?;

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Fork resolution ledger
    // -----------------------------------------------------------------------

    /// Make this block's hash the canonical entry at its level: atomically
    /// demote every other row at the same level and promote the row matching
    /// this exact hash. Returns (demoted, promoted) row counts.
    ///
    /// At most one canonical row per level survives every call, which is the
    /// invariant the whole fork resolution rests on.
    pub async fn revalidate_block(&self, block: &Block) -> Result<(u64, u64)> {
        let mut tx = self.pool.begin().await?;

        let demoted = sqlx::query(
            r#"
            UPDATE invalidated_blocks
            SET is_invalidated = TRUE
            WHERE level = $1 AND hash <> $2 AND is_invalidated = FALSE
            "#,
        )
        .bind(block.header.level)
        .bind(&block.hash)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let promoted = sqlx::query(
            r#"
            UPDATE invalidated_blocks
            SET is_invalidated = FALSE
            WHERE hash = $1 AND is_invalidated = TRUE
            "#,
        )
        .bind(&block.hash)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await.context("Failed to commit block revalidation")?;

        tracing::debug!(
            "Revalidated block {} at level {}: {} demoted, {} promoted",
            block.hash,
            block.header.level,
            demoted,
            promoted
        );
        Ok((demoted, promoted))
    }

    /// Apply `revalidate_block` to each block of a fork-following pass and
    /// sum the two counters.
    pub async fn revalidate_blocks(&self, blocks: &[Block]) -> Result<(u64, u64)> {
        let mut total_demoted = 0;
        let mut total_promoted = 0;

        for block in blocks {
            let (demoted, promoted) = self.revalidate_block(block).await?;
            total_demoted += demoted;
            total_promoted += promoted;
        }

        Ok((total_demoted, total_promoted))
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Whether a block row with this hash exists
    pub async fn block_exists(&self, hash: &str) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM blocks WHERE hash = $1)")
            .bind(hash)
            .fetch_one(&self.pool)
            .await?;

        Ok(exists)
    }

    /// Whether a block row exists AND at least one operation group was
    /// stored for it
    #[allow(dead_code)]
    pub async fn block_and_ops_exists(&self, hash: &str) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(SELECT 1 FROM blocks WHERE hash = $1)
               AND EXISTS(SELECT 1 FROM operation_groups WHERE block_id = $1)
            "#,
        )
        .bind(hash)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    /// Whether this hash appears in the invalidation ledger at all
    #[allow(dead_code)]
    pub async fn block_exists_in_invalidated_blocks(&self, hash: &str) -> Result<bool> {
        let exists =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM invalidated_blocks WHERE hash = $1)")
                .bind(hash)
                .fetch_one(&self.pool)
                .await?;

        Ok(exists)
    }

    /// Fetch the invalidation ledger row for a hash, if any
    pub async fn invalidated_block(&self, hash: &str) -> Result<Option<InvalidatedBlock>> {
        let row = sqlx::query_as::<_, InvalidatedBlock>(
            "SELECT hash, level, is_invalidated FROM invalidated_blocks WHERE hash = $1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Whether any blocks have been stored yet
    pub async fn do_blocks_exist(&self) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM blocks)")
            .fetch_one(&self.pool)
            .await?;

        Ok(exists)
    }

    /// Maximum stored block level, or the no-data sentinel
    pub async fn fetch_max_block_level(&self) -> Result<i64> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(level) FROM blocks").fetch_one(&self.pool).await?;

        Ok(max.unwrap_or(NO_LEVEL))
    }

    /// Maximum block level any account snapshot was taken at, or the
    /// no-data sentinel
    pub async fn fetch_accounts_max_block_level(&self) -> Result<i64> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(block_level) FROM accounts").fetch_one(&self.pool).await?;

        Ok(max.unwrap_or(NO_LEVEL))
    }

    /// Whether any account snapshot was taken from this exact block.
    ///
    /// A level match alone is not enough: after a same-level reorg the stored
    /// snapshot may belong to the demoted rival, and must be re-taken.
    pub async fn accounts_exist_at(&self, block_id: &str, block_level: i64) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM accounts WHERE block_id = $1 AND block_level = $2)",
        )
        .bind(block_id)
        .bind(block_level)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }
}

/// Insert the rows derived from one decoded block: the block itself, its
/// operation groups, and their operations (denormalized with the block's
/// hash, level, and timestamp).
///
/// With `replace` set, existing derived rows for the hash are dropped first
/// so a re-fetched fork block lands as a clean replacement.
async fn insert_block_rows(
    tx: &mut Transaction<'_, Postgres>,
    block: &Block,
    replace: bool,
) -> Result<(usize, usize)> {
    if replace {
        sqlx::query("DELETE FROM operations WHERE block_hash = $1").bind(&block.hash).execute(&mut **tx).await?;
        sqlx::query("DELETE FROM operation_groups WHERE block_id = $1").bind(&block.hash).execute(&mut **tx).await?;
        sqlx::query("DELETE FROM blocks WHERE hash = $1").bind(&block.hash).execute(&mut **tx).await?;
    }

    sqlx::query(
        r#"
        INSERT INTO blocks (hash, level, predecessor, timestamp, protocol, fitness, operations_hash, signature)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(&block.hash)
    .bind(block.header.level)
    .bind(&block.header.predecessor)
    .bind(block.header.timestamp)
    .bind(&block.protocol)
    .bind(block.header.fitness.join(","))
    .bind(&block.header.operations_hash)
    .bind(&block.header.signature)
    .execute(&mut **tx)
    .await?;

    let mut groups_inserted = 0;
    let mut operations_inserted = 0;

    for group in &block.operation_groups {
        sqlx::query("INSERT INTO operation_groups (hash, block_id) VALUES ($1, $2)")
            .bind(&group.hash)
            .bind(&group.block_id)
            .execute(&mut **tx)
            .await?;
        groups_inserted += 1;

        for operation in &group.operations {
            sqlx::query(
                r#"
                INSERT INTO operations (
                    operation_group_hash, kind, source, destination, delegate,
                    amount, fee, balance, gas_limit, storage_limit, counter,
                    block_hash, block_level, timestamp
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(&group.hash)
            .bind(&operation.kind)
            .bind(&operation.source)
            .bind(&operation.destination)
            .bind(&operation.delegate)
            .bind(operation.amount)
            .bind(operation.fee)
            .bind(operation.balance)
            .bind(operation.gas_limit)
            .bind(operation.storage_limit)
            .bind(operation.counter)
            .bind(&operation.block_hash)
            .bind(operation.block_level)
            .bind(operation.timestamp)
            .execute(&mut **tx)
            .await?;
            operations_inserted += 1;
        }
    }

    Ok((groups_inserted, operations_inserted))
}
