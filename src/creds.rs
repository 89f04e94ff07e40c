use crate::store::{SecretStore, StoreError};

/// Field holding the root token inside its named secret.
pub const TOKEN_FIELD: &str = "token";
/// Field holding the file decryption key inside its named secret.
pub const FILE_KEY_FIELD: &str = "key";

#[derive(Debug, thiserror::Error)]
pub enum CredsError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("secret {secret} has no {field} field")]
    MissingField { secret: String, field: String },
    #[error("secret {secret} field {field} is not valid UTF-8")]
    InvalidEncoding { secret: String, field: String },
}

/// Short-lived cache for credential material read from the cluster store.
///
/// Values persist across bootstrap passes until `invalidate` is called —
/// after a fresh initialization (the old token is dead) or when the
/// backend rejects the cached token.
#[derive(Debug, Default)]
pub struct CredentialCache {
    root_token: Option<String>,
    file_key: Option<String>,
}

impl CredentialCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the backend root token, reading it from the store on a
    /// cache miss.
    ///
    /// # Errors
    /// Returns an error if the secret is missing, unreadable, or lacks
    /// the token field.
    pub async fn root_token<S: SecretStore + ?Sized>(
        &mut self,
        store: &S,
        secret_name: &str,
    ) -> Result<String, CredsError> {
        if let Some(token) = &self.root_token {
            return Ok(token.clone());
        }
        let token = read_field(store, secret_name, TOKEN_FIELD).await?;
        self.root_token = Some(token.clone());
        Ok(token)
    }

    /// Returns the file decryption key, reading it from the store on a
    /// cache miss.
    ///
    /// # Errors
    /// Returns an error if the secret is missing, unreadable, or lacks
    /// the key field.
    pub async fn file_key<S: SecretStore + ?Sized>(
        &mut self,
        store: &S,
        secret_name: &str,
    ) -> Result<String, CredsError> {
        if let Some(key) = &self.file_key {
            return Ok(key.clone());
        }
        let key = read_field(store, secret_name, FILE_KEY_FIELD).await?;
        self.file_key = Some(key.clone());
        Ok(key)
    }

    /// Drops all cached material; the next accessor call re-reads the store.
    pub fn invalidate(&mut self) {
        self.root_token = None;
        self.file_key = None;
    }
}

async fn read_field<S: SecretStore + ?Sized>(
    store: &S,
    secret_name: &str,
    field: &str,
) -> Result<String, CredsError> {
    let data = store.get(secret_name).await?;
    let bytes = data.get(field).ok_or_else(|| CredsError::MissingField {
        secret: secret_name.to_string(),
        field: field.to_string(),
    })?;
    let value = std::str::from_utf8(bytes).map_err(|_| CredsError::InvalidEncoding {
        secret: secret_name.to_string(),
        field: field.to_string(),
    })?;
    Ok(value.trim_end_matches('\n').to_string())
}
