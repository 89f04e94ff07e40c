use tracing::{error, info, warn};

use crate::config::InitSettings;
use crate::creds::TOKEN_FIELD;
use crate::store::{SecretData, SecretStore, StoreError};
use crate::vault::{VaultClient, VaultError};

/// Field name prefix for persisted unseal key shares; the full field is
/// `vault-key-<index>` and the index fixes the submission order.
pub const KEY_SHARE_FIELD_PREFIX: &str = "vault-key-";

/// Credentials produced by a successful initialization.
#[derive(Debug, Clone)]
pub struct InitCredentials {
    pub root_token: String,
    pub keys_base64: Vec<String>,
    pub shares: u8,
    pub threshold: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("backend init request failed: {0}")]
    Backend(#[from] VaultError),
    #[error("cluster store error while handling init credentials: {0}")]
    Store(#[from] StoreError),
    #[error("backend returned no unseal key shares")]
    NoKeyShares,
}

/// Runs the one-time init protocol and persists the generated credentials.
///
/// Stale credentials from a prior, now-reset backend are deleted before the
/// init request is issued; this is destructive and logged explicitly. The
/// two persisted secrets are not written transactionally — if the key
/// shares fail to persist after the token was saved, the error is surfaced
/// and a rerun (which deletes both secrets first) recovers.
///
/// # Errors
/// Returns `Backend` if the backend rejects the init request (nothing is
/// persisted in that case) and `Store` on any non-NotFound store failure.
pub async fn initialize<S: SecretStore + ?Sized>(
    client: &VaultClient,
    store: &S,
    settings: &InitSettings,
) -> Result<InitCredentials, InitError> {
    let stale_token = secret_exists(store, &settings.root_token_secret).await?;
    let stale_keys = secret_exists(store, &settings.unseal_keys_secret).await?;

    if stale_token || stale_keys {
        warn!(
            "stale credentials found in {} / {}; deleting before re-init",
            settings.root_token_secret, settings.unseal_keys_secret
        );
        delete_if_present(store, &settings.root_token_secret).await?;
        delete_if_present(store, &settings.unseal_keys_secret).await?;
    }

    let response = client
        .init(settings.secret_shares, settings.secret_threshold)
        .await?;
    if response.keys_base64.is_empty() {
        return Err(InitError::NoKeyShares);
    }

    let mut token_data = SecretData::new();
    token_data.insert(
        TOKEN_FIELD.to_string(),
        response.root_token.clone().into_bytes(),
    );
    store.create(&settings.root_token_secret, &token_data).await?;

    let mut key_data = SecretData::new();
    for (index, share) in response.keys_base64.iter().enumerate() {
        key_data.insert(
            format!("{KEY_SHARE_FIELD_PREFIX}{index}"),
            share.clone().into_bytes(),
        );
    }
    if let Err(err) = store.create(&settings.unseal_keys_secret, &key_data).await {
        error!(
            "root token persisted but unseal keys were not; rerun will reset both: {err}"
        );
        return Err(err.into());
    }

    info!(
        "backend initialized with {} key shares (threshold {})",
        settings.secret_shares, settings.secret_threshold
    );
    Ok(InitCredentials {
        root_token: response.root_token,
        keys_base64: response.keys_base64,
        shares: settings.secret_shares,
        threshold: settings.secret_threshold,
    })
}

async fn secret_exists<S: SecretStore + ?Sized>(
    store: &S,
    name: &str,
) -> Result<bool, StoreError> {
    match store.get(name).await {
        Ok(_) => Ok(true),
        Err(StoreError::NotFound) => Ok(false),
        Err(err) => Err(err),
    }
}

async fn delete_if_present<S: SecretStore + ?Sized>(
    store: &S,
    name: &str,
) -> Result<(), StoreError> {
    match store.delete(name).await {
        Ok(()) => {
            info!("deleted stale secret {name}");
            Ok(())
        }
        Err(StoreError::NotFound) => Ok(()),
        Err(err) => Err(err),
    }
}
