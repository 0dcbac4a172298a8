use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mint_vendor::catalog::Catalog;
use mint_vendor::chain::BlockfrostClient;
use mint_vendor::config::{Config, StoreConfig};
use mint_vendor::fulfill::Coordinator;
use mint_vendor::issuer::HttpIssuer;
use mint_vendor::ledger::{Ledger, LogLedger, SqliteLedger};
use mint_vendor::runner::Runner;
use mint_vendor::scanner::PaymentScanner;
use mint_vendor::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mint_vendor=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("reading configuration")?;

    let catalog = Arc::new(
        Catalog::load(&[
            (config.first_collection.clone(), config.first_catalog.clone()),
            (
                config.second_collection.clone(),
                config.second_catalog.clone(),
            ),
        ])
        .context("loading catalogs")?,
    );

    let ledger = open_ledger(&config).context("opening reservation ledger")?;
    for collection in [&config.first_collection, &config.second_collection] {
        let inserted = ledger.seed_catalog(collection, &catalog.seed_items(collection))?;
        tracing::info!(
            %collection,
            inserted,
            total = catalog.len(collection),
            "catalog seeded"
        );
    }

    let scanner = PaymentScanner::new(
        BlockfrostClient::new(config.blockfrost_url.clone(), config.blockfrost_key.clone()),
        Arc::clone(&ledger),
        config.scan_config(),
    );
    let coordinator = Coordinator::new(
        Arc::clone(&ledger),
        catalog,
        HttpIssuer::new(config.issuer_url.clone()),
        config.fulfill_config(),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding health endpoint on {}", addr))?;
    tracing::info!("health endpoint listening on {}", addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, server::router()).await {
            tracing::error!(error = %e, "health server exited");
        }
    });

    tracing::info!(
        receive_address = %config.receive_address.short(),
        price = config.price,
        tolerance = config.tolerance,
        poll_secs = config.poll_interval.as_secs(),
        "starting poll loop"
    );
    Runner::new(scanner, coordinator, config.poll_interval)
        .run()
        .await;
    Ok(())
}

/// Opens the configured ledger engine, creating parent directories as needed.
fn open_ledger(config: &Config) -> anyhow::Result<Arc<dyn Ledger>> {
    let path = match &config.store {
        StoreConfig::Sqlite(path) => path,
        StoreConfig::Log(path) => path,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let ledger: Arc<dyn Ledger> = match &config.store {
        StoreConfig::Sqlite(path) => Arc::new(SqliteLedger::open(path)?),
        StoreConfig::Log(path) => Arc::new(LogLedger::open(path)?),
    };
    Ok(ledger)
}
