use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Certificate, Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Errors surfaced by the cluster secret store.
///
/// `NotFound` is a distinguished, non-fatal outcome; every other variant is
/// returned to the caller, which decides between retry and escalation. The
/// store never terminates the process.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("secret not found")]
    NotFound,
    #[error("cluster store transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("cluster store rejected request ({status}): {message}")]
    Rejected { status: StatusCode, message: String },
    #[error("failed to decode stored secret: {0}")]
    Decode(String),
}

/// Opaque byte-map value of a named secret.
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// CRUD over named opaque secrets in one namespace.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<SecretData, StoreError>;
    async fn create(&self, name: &str, data: &SecretData) -> Result<(), StoreError>;
    async fn delete(&self, name: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Deserialize)]
struct SecretManifest {
    #[serde(default)]
    data: BTreeMap<String, String>,
}

/// Kubernetes-backed secret store, scoped to a single namespace.
#[derive(Debug, Clone)]
pub struct KubeSecretStore {
    base_url: String,
    namespace: String,
    token: String,
    client: Client,
}

impl KubeSecretStore {
    /// Builds a store against an explicit API endpoint and bearer token.
    ///
    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        namespace: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
            token: token.to_string(),
            client,
        })
    }

    /// Builds a store from the pod's service-account mount.
    ///
    /// # Errors
    /// Returns an error if the in-cluster environment variables or the
    /// service-account token/CA files are missing or unreadable.
    pub async fn in_cluster(namespace: &str, timeout: Duration) -> anyhow::Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .context("KUBERNETES_SERVICE_HOST is not set; not running in a cluster?")?;
        let port =
            std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let token = tokio::fs::read_to_string(format!("{SERVICE_ACCOUNT_DIR}/token"))
            .await
            .context("Failed to read service-account token")?;
        let ca = tokio::fs::read(format!("{SERVICE_ACCOUNT_DIR}/ca.crt"))
            .await
            .context("Failed to read service-account CA certificate")?;
        let client = Client::builder()
            .timeout(timeout)
            .add_root_certificate(
                Certificate::from_pem(&ca).context("Invalid service-account CA certificate")?,
            )
            .build()
            .context("Failed to build cluster store HTTP client")?;
        Ok(Self {
            base_url: format!("https://{host}:{port}"),
            namespace: namespace.to_string(),
            token: token.trim().to_string(),
            client,
        })
    }

    fn secrets_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/secrets",
            self.base_url, self.namespace
        )
    }

    fn secret_url(&self, name: &str) -> String {
        format!("{}/{name}", self.secrets_url())
    }

    async fn check_response(response: reqwest::Response) -> Result<(), StoreError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound);
        }
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(StoreError::Rejected { status, message })
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, name: &str) -> Result<SecretData, StoreError> {
        let response = self
            .client
            .get(self.secret_url(name))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound);
        }
        let text = response.text().await?;
        if !status.is_success() {
            return Err(StoreError::Rejected {
                status,
                message: text,
            });
        }
        let manifest: SecretManifest = serde_json::from_str(&text)
            .map_err(|err| StoreError::Decode(err.to_string()))?;
        let mut data = SecretData::new();
        for (field, value) in manifest.data {
            let bytes = STANDARD
                .decode(&value)
                .map_err(|err| StoreError::Decode(format!("field {field}: {err}")))?;
            data.insert(field, bytes);
        }
        Ok(data)
    }

    async fn create(&self, name: &str, data: &SecretData) -> Result<(), StoreError> {
        let encoded: BTreeMap<&str, String> = data
            .iter()
            .map(|(field, value)| (field.as_str(), STANDARD.encode(value)))
            .collect();
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": name, "namespace": self.namespace },
            "type": "Opaque",
            "data": encoded,
        });
        let response = self
            .client
            .post(self.secrets_url())
            .bearer_auth(&self.token)
            .json(&manifest)
            .send()
            .await?;
        Self::check_response(response).await
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .delete(self.secret_url(name))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::check_response(response).await
    }
}
