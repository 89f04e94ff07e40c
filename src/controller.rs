use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::creds::CredentialCache;
use crate::store::SecretStore;
use crate::vault::{BackendState, VaultClient};
use crate::{bootstrap, init, unseal};

/// Runs the reconciliation loop until a shutdown signal arrives.
///
/// Ticks are strictly sequential: each one probes the backend, dispatches
/// on the observed state and then sleeps for the configured interval or
/// until shutdown, whichever comes first. An in-flight phase is abandoned
/// on shutdown without cleanup — every phase is idempotent, so the next
/// start resumes safely.
///
/// # Errors
/// Returns an error only if the configured interval cannot be parsed.
pub async fn run<S: SecretStore + ?Sized>(
    client: &VaultClient,
    store: &S,
    settings: &Settings,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let interval = settings.check_interval()?;
    let mut creds = CredentialCache::new();
    info!(
        "watching backend {} every {}",
        settings.vault.addr, settings.controller.check_interval
    );

    loop {
        if *shutdown.borrow() {
            info!("shutdown signal received, exiting");
            break;
        }
        tick(client, store, settings, &mut creds).await;

        tokio::select! {
            _ = shutdown.changed() => {
                info!("shutdown signal received, exiting");
                break;
            }
            () = tokio::time::sleep(interval) => {}
        }
    }
    Ok(())
}

/// Runs a single reconcile pass.
pub async fn run_once<S: SecretStore + ?Sized>(
    client: &VaultClient,
    store: &S,
    settings: &Settings,
) {
    let mut creds = CredentialCache::new();
    tick(client, store, settings, &mut creds).await;
}

/// One poll/dispatch cycle: observe the backend state and take the
/// corrective action it calls for. Never fails the loop — every error is
/// logged and retried on the next tick.
pub async fn tick<S: SecretStore + ?Sized>(
    client: &VaultClient,
    store: &S,
    settings: &Settings,
    creds: &mut CredentialCache,
) {
    let state = client.health_state().await;
    match state {
        BackendState::Active => {
            info!("backend is initialized and unsealed");
            if let Err(err) = bootstrap::run(client, store, settings, creds).await {
                error!("bootstrap pass failed: {err:#}");
            }
        }
        BackendState::Standby => {
            info!("backend is unsealed and in standby mode");
        }
        BackendState::Uninitialized => {
            info!("backend is not initialized; initializing and unsealing");
            match init::initialize(client, store, &settings.init).await {
                Ok(_) => {
                    // The previous root token, if any, died with the re-init.
                    creds.invalidate();
                    run_unseal(client, store, settings).await;
                }
                Err(err) => error!("initialization failed: {err}"),
            }
        }
        BackendState::Sealed => {
            info!("backend is sealed; unsealing");
            run_unseal(client, store, settings).await;
        }
        BackendState::Unreachable => {
            warn!("backend is unreachable; retrying next tick");
        }
        BackendState::Unknown => {
            warn!("backend reported an unexpected health status");
        }
    }
}

async fn run_unseal<S: SecretStore + ?Sized>(
    client: &VaultClient,
    store: &S,
    settings: &Settings,
) {
    match unseal::unseal(client, store, &settings.init).await {
        Ok(outcome) if outcome.sealed => warn!(
            "backend still sealed after applying {}/{} key shares",
            outcome.shares_applied, outcome.total_shares
        ),
        Ok(outcome) => info!(
            "backend unsealed after {} of {} key shares",
            outcome.shares_applied, outcome.total_shares
        ),
        Err(err) => error!("unseal attempt failed: {err}"),
    }
}

/// Resolves when SIGINT or SIGTERM is received.
///
/// # Errors
/// Returns an error if the signal handlers cannot be installed.
pub async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {e}"))?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {e}"))?;
            }
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {e}"))?;
    }

    Ok(())
}
