use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use vault_sentinel::store::KubeSecretStore;
use vault_sentinel::vault::VaultClient;
use vault_sentinel::{Args, config, controller};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    info!("starting vault-sentinel");

    let mut settings = config::Settings::new(args.config.clone())
        .context("Failed to load configuration")?;
    settings.merge_with_args(&args);
    settings.validate()?;

    let timeout = Duration::from_secs(settings.vault.request_timeout_secs);
    let client = VaultClient::new(&settings.vault.addr, timeout)
        .context("Failed to build backend client")?;
    let store = KubeSecretStore::in_cluster(&settings.controller.namespace, timeout)
        .await
        .context("Failed to build cluster secret store")?;

    if args.oneshot {
        controller::run_once(&client, &store, &settings).await;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = controller::wait_for_shutdown().await {
            error!("Shutdown signal handler error: {err}");
        }
        let _ = shutdown_tx.send(true);
    });

    controller::run(&client, &store, &settings, shutdown_rx).await
}
