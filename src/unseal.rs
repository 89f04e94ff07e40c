use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, info};

use crate::config::InitSettings;
use crate::init::KEY_SHARE_FIELD_PREFIX;
use crate::store::{SecretData, SecretStore, StoreError};
use crate::vault::{VaultClient, VaultError};

/// Result of one unseal attempt.
#[derive(Debug, Clone, Copy)]
pub struct UnsealOutcome {
    pub sealed: bool,
    pub threshold: u32,
    pub total_shares: u32,
    pub shares_applied: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum UnsealError {
    #[error("no persisted unseal key material")]
    MissingKeyMaterial,
    #[error("persisted key share {field} is not decodable: {reason}")]
    InvalidShare { field: String, reason: String },
    #[error("backend unseal request failed: {0}")]
    Backend(#[from] VaultError),
    #[error("cluster store error while reading unseal keys: {0}")]
    Store(#[from] StoreError),
}

/// Applies persisted unseal key shares in stored order until the backend
/// reports `sealed == false`, then stops; remaining shares are not
/// submitted.
///
/// # Errors
/// Returns `MissingKeyMaterial` if no shares are persisted, and `Backend`
/// if any submission is rejected — the backend stays sealed and the next
/// poll cycle retries.
pub async fn unseal<S: SecretStore + ?Sized>(
    client: &VaultClient,
    store: &S,
    settings: &InitSettings,
) -> Result<UnsealOutcome, UnsealError> {
    let data = match store.get(&settings.unseal_keys_secret).await {
        Ok(data) => data,
        Err(StoreError::NotFound) => return Err(UnsealError::MissingKeyMaterial),
        Err(err) => return Err(err.into()),
    };

    let shares = ordered_shares(&data);
    if shares.is_empty() {
        return Err(UnsealError::MissingKeyMaterial);
    }
    let total_shares = u32::try_from(shares.len()).unwrap_or(u32::MAX);
    info!("unsealing backend with {total_shares} persisted key shares");

    let mut shares_applied = 0u32;
    let mut last = None;
    for (field, value) in shares {
        let key = decode_share(&field, value)?;
        let progress = client.unseal(&key).await?;
        shares_applied += 1;
        debug!(
            "unseal share {shares_applied}/{total_shares} applied, progress {}/{}",
            progress.progress, progress.t
        );
        last = Some(progress);
        if !progress.sealed {
            break;
        }
    }

    // The loop body runs at least once: shares is non-empty.
    let progress = last.ok_or(UnsealError::MissingKeyMaterial)?;
    Ok(UnsealOutcome {
        sealed: progress.sealed,
        threshold: progress.t,
        total_shares,
        shares_applied,
    })
}

/// Orders key-share fields by their numeric suffix; fields not matching
/// the share naming scheme are ignored.
fn ordered_shares(data: &SecretData) -> Vec<(String, &[u8])> {
    let mut shares: Vec<(u32, String, &[u8])> = data
        .iter()
        .filter_map(|(field, value)| {
            let index = field.strip_prefix(KEY_SHARE_FIELD_PREFIX)?.parse().ok()?;
            Some((index, field.clone(), value.as_slice()))
        })
        .collect();
    shares.sort_by_key(|(index, _, _)| *index);
    shares
        .into_iter()
        .map(|(_, field, value)| (field, value))
        .collect()
}

fn decode_share(field: &str, value: &[u8]) -> Result<String, UnsealError> {
    let encoded = std::str::from_utf8(value).map_err(|err| UnsealError::InvalidShare {
        field: field.to_string(),
        reason: err.to_string(),
    })?;
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|err| UnsealError::InvalidShare {
            field: field.to_string(),
            reason: err.to_string(),
        })?;
    String::from_utf8(decoded).map_err(|err| UnsealError::InvalidShare {
        field: field.to_string(),
        reason: err.to_string(),
    })
}
