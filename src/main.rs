/// Chain Harvester
///
/// A sync engine that continuously ingests blocks and account state from a
/// chain node, reconciles reorganizations, and persists history to PostgreSQL.
mod cli;
mod db;
mod fetch;
mod models;
mod rpc;
mod sync;

use anyhow::{Context, Result};
use clap::Parser;
use db::Database;
use rpc::NodeClient;
use std::env;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = cli::Cli::parse();
    cli.validate()?;

    println!("🚀 Starting Chain Harvester...");

    // Get node RPC URL from CLI or environment
    let node_url = match cli.node_url.clone() {
        Some(url) => url,
        None => env::var("NODE_RPC_URL")
            .context("NODE_RPC_URL not found in environment. Please check your .env file")?,
    };

    // Initialize node client and verify the node is reachable
    let node =
        NodeClient::new(node_url, cli.network.clone(), cli.batch_size).context("Failed to create node client")?;
    node.test_connection().await.context("Failed to connect to node RPC")?;

    let head = node.head().await.context("Failed to fetch chain head")?;
    println!("✅ Connected to network: {}", node.network());
    println!("🎯 Current head: level {} ({})", head.header.level, head.hash);

    // Initialize database connection
    let database_url = match cli.database_url.clone() {
        Some(url) => url,
        None => env::var("DATABASE_URL")
            .context("DATABASE_URL not found in environment. Please check your .env file")?,
    };

    println!("\n💾 Connecting to PostgreSQL database...");
    let database = Database::new(&database_url).await.context("Failed to connect to PostgreSQL database")?;

    // Test database connection
    database.test_connection().await.context("Database connection test failed")?;

    println!("✅ Database connected successfully!");

    // Run database migrations
    println!("📋 Running database migrations...");
    database.migrate().await.context("Failed to run database migrations")?;

    println!("✅ Database schema ready!");

    tracing::info!("Chain harvester initialized successfully");

    // Cancel the sync loop on ctrl-c; the in-flight iteration drains first
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\n🛑 Shutdown signal received, finishing current iteration...");
                shutdown.cancel();
            }
        });
    }

    // Run the sync loop until shutdown
    let syncer = sync::Syncer::new(node, database, cli.sync_config());
    syncer.run(shutdown).await.context("Sync loop failed")?;

    println!("\n✨ Sync loop stopped cleanly");
    Ok(())
}
