use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";

/// Errors surfaced by the backend client.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("backend transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: StatusCode, message: String },
    #[error("failed to decode backend response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("backend token is not set")]
    MissingToken,
}

impl VaultError {
    /// Classifies an "already exists" rejection on a creation call.
    ///
    /// Mounting an existing path or enabling an existing auth method is
    /// reported by the backend as a 400 with one of a few stock phrases.
    /// All creation paths treat this outcome as success.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Rejected { status, message } => {
                *status == StatusCode::BAD_REQUEST
                    && (message.contains("already in use")
                        || message.contains("already enabled")
                        || message.contains("existing mount"))
            }
            _ => false,
        }
    }
}

/// Observed backend health, derived fresh on every poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Backend has never been initialized (501).
    Uninitialized,
    /// Backend is initialized but sealed (503).
    Sealed,
    /// Backend is unsealed but not the active node (429).
    Standby,
    /// Backend is initialized, unsealed and active (200).
    Active,
    /// The health endpoint could not be reached at all.
    Unreachable,
    /// Any other status code.
    Unknown,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Uninitialized => "uninitialized",
            Self::Sealed => "sealed",
            Self::Standby => "standby",
            Self::Active => "active",
            Self::Unreachable => "unreachable",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitResponse {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub keys_base64: Vec<String>,
    pub root_token: String,
}

/// Per-share unseal progress as reported by the backend.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SealProgress {
    pub sealed: bool,
    #[serde(default)]
    pub t: u32,
    #[serde(default)]
    pub n: u32,
    #[serde(default)]
    pub progress: u32,
}

#[derive(Debug, Deserialize)]
struct TableResponse {
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct VaultClient {
    base_url: String,
    client: Client,
    token: Option<String>,
}

impl VaultClient {
    /// Builds a client for the backend at `base_url` with a bounded
    /// per-request timeout.
    ///
    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, VaultError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            token: None,
        })
    }

    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Probes the health endpoint and maps the outcome to a `BackendState`.
    ///
    /// Total by design: transport failures map to `Unreachable` and
    /// unexpected status codes to `Unknown`. Retry cadence belongs to the
    /// caller, never to the probe.
    pub async fn health_state(&self) -> BackendState {
        let url = self.endpoint("sys/health");
        match self.client.get(url).send().await {
            Ok(response) => match response.status().as_u16() {
                200 => BackendState::Active,
                429 => BackendState::Standby,
                501 => BackendState::Uninitialized,
                503 => BackendState::Sealed,
                _ => BackendState::Unknown,
            },
            Err(err) => {
                warn!("health probe failed: {err}");
                BackendState::Unreachable
            }
        }
    }

    /// Runs the one-time init protocol.
    ///
    /// # Errors
    /// Returns `Rejected` on a non-2xx response; an already-initialized
    /// backend rejects a second init this way.
    pub async fn init(&self, shares: u8, threshold: u8) -> Result<InitResponse, VaultError> {
        #[derive(Serialize)]
        struct InitRequest {
            secret_shares: u8,
            secret_threshold: u8,
        }
        let response = self
            .client
            .put(self.endpoint("sys/init"))
            .json(&InitRequest {
                secret_shares: shares,
                secret_threshold: threshold,
            })
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// Submits one unseal key share.
    ///
    /// # Errors
    /// Returns `Rejected` on a non-2xx response, leaving the backend sealed.
    pub async fn unseal(&self, key: &str) -> Result<SealProgress, VaultError> {
        #[derive(Serialize)]
        struct UnsealRequest<'a> {
            key: &'a str,
            reset: bool,
        }
        let response = self
            .client
            .put(self.endpoint("sys/unseal"))
            .json(&UnsealRequest { key, reset: false })
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// Lists currently mounted secret engine paths (trailing slash included).
    ///
    /// # Errors
    /// Requires a token; returns `Rejected` on a non-2xx response.
    pub async fn list_mounts(&self) -> Result<BTreeSet<String>, VaultError> {
        self.list_table("sys/mounts").await
    }

    /// Mounts a secret engine at `path`.
    ///
    /// # Errors
    /// Requires a token; returns `Rejected` on a non-2xx response.
    pub async fn mount(
        &self,
        path: &str,
        engine_type: &str,
        max_lease_ttl: &str,
    ) -> Result<(), VaultError> {
        #[derive(Serialize)]
        struct MountRequest<'a> {
            #[serde(rename = "type")]
            engine_type: &'a str,
            description: String,
            config: MountConfig<'a>,
        }
        #[derive(Serialize)]
        struct MountConfig<'a> {
            max_lease_ttl: &'a str,
        }
        let request = MountRequest {
            engine_type,
            description: format!("KV {path} secrets engine"),
            config: MountConfig { max_lease_ttl },
        };
        self.post_checked(&format!("sys/mounts/{path}"), &request)
            .await
    }

    /// Lists currently enabled auth method paths (trailing slash included).
    ///
    /// # Errors
    /// Requires a token; returns `Rejected` on a non-2xx response.
    pub async fn list_auth(&self) -> Result<BTreeSet<String>, VaultError> {
        self.list_table("sys/auth").await
    }

    /// Enables an auth method at `path`.
    ///
    /// # Errors
    /// Requires a token; returns `Rejected` on a non-2xx response.
    pub async fn enable_auth(
        &self,
        path: &str,
        auth_type: &str,
        default_lease_ttl: &str,
        max_lease_ttl: &str,
        token_type: &str,
    ) -> Result<(), VaultError> {
        #[derive(Serialize)]
        struct EnableAuthRequest<'a> {
            #[serde(rename = "type")]
            auth_type: &'a str,
            config: AuthConfig<'a>,
        }
        #[derive(Serialize)]
        struct AuthConfig<'a> {
            default_lease_ttl: &'a str,
            max_lease_ttl: &'a str,
            token_type: &'a str,
        }
        let request = EnableAuthRequest {
            auth_type,
            config: AuthConfig {
                default_lease_ttl,
                max_lease_ttl,
                token_type,
            },
        };
        self.post_checked(&format!("sys/auth/{path}"), &request)
            .await
    }

    /// Writes a named access-control policy document.
    ///
    /// # Errors
    /// Requires a token; returns `Rejected` on a non-2xx response.
    pub async fn put_policy(&self, name: &str, policy: &str) -> Result<(), VaultError> {
        #[derive(Serialize)]
        struct PolicyRequest<'a> {
            policy: &'a str,
        }
        self.post_checked(&format!("sys/policies/acl/{name}"), &PolicyRequest { policy })
            .await
    }

    /// Writes an arbitrary JSON document to a logical path.
    ///
    /// # Errors
    /// Requires a token; returns `Rejected` on a non-2xx response.
    pub async fn write_logical(
        &self,
        path: &str,
        data: &serde_json::Value,
    ) -> Result<(), VaultError> {
        self.post_checked(path, data).await
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.base_url)
    }

    fn token(&self) -> Result<&str, VaultError> {
        self.token.as_deref().ok_or(VaultError::MissingToken)
    }

    async fn list_table(&self, path: &str) -> Result<BTreeSet<String>, VaultError> {
        let response = self
            .client
            .get(self.endpoint(path))
            .header(VAULT_TOKEN_HEADER, self.token()?)
            .send()
            .await?;
        let table: TableResponse = Self::parse_response(response).await?;
        let paths = table
            .data
            .as_object()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        Ok(paths)
    }

    async fn post_checked<T: Serialize>(&self, path: &str, body: &T) -> Result<(), VaultError> {
        let response = self
            .client
            .post(self.endpoint(path))
            .header(VAULT_TOKEN_HEADER, self.token()?)
            .json(body)
            .send()
            .await?;
        Self::check_response(response).await
    }

    async fn check_response(response: reqwest::Response) -> Result<(), VaultError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(VaultError::Rejected { status, message })
    }

    async fn parse_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, VaultError> {
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(VaultError::Rejected {
                status,
                message: text,
            });
        }
        Ok(serde_json::from_str(&text)?)
    }
}
