use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub vault: VaultSettings,
    pub controller: ControllerSettings,
    pub init: InitSettings,
    pub policy: PolicySettings,
    pub bootstrap: BootstrapSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultSettings {
    pub addr: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControllerSettings {
    pub check_interval: String,
    pub namespace: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InitSettings {
    pub secret_shares: u8,
    pub secret_threshold: u8,
    pub root_token_secret: String,
    pub unseal_keys_secret: String,
    pub file_key_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicySettings {
    pub dir: PathBuf,
    pub extension: String,
    pub max_concurrent: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BootstrapSettings {
    pub base_path: PathBuf,
    pub secret_engines: Vec<String>,
    pub engine_max_lease_ttl: String,
    pub auth_methods: Vec<String>,
    pub auth_type: String,
    pub auth_default_lease_ttl: String,
    pub auth_max_lease_ttl: String,
    pub auth_token_type: String,
    pub userpass_path: String,
    pub userpass_lease_ttl: String,
    #[serde(default = "default_cluster_import")]
    pub cluster: ClusterImportSettings,
    #[serde(default = "default_imports")]
    pub imports: Vec<ImportMapping>,
}

/// Per-cluster environment file import: files under each listed directory
/// matching `pattern` land under `dest/<terminal path segment of the dir>/`.
#[derive(Debug, Deserialize, Clone)]
pub struct ClusterImportSettings {
    pub dirs: Vec<String>,
    pub pattern: String,
    pub dest: String,
}

/// Declarative source-subtree to logical-destination mapping for the bulk
/// keyed-secret import.
#[derive(Debug, Deserialize, Clone)]
pub struct ImportMapping {
    pub source: String,
    pub dest: String,
}

const DEFAULT_VAULT_ADDR: &str = "http://127.0.0.1:8200";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
const DEFAULT_CHECK_INTERVAL: &str = "60s";
const DEFAULT_NAMESPACE: &str = "vault";
const DEFAULT_SECRET_SHARES: u8 = 3;
const DEFAULT_SECRET_THRESHOLD: u8 = 3;
const DEFAULT_ROOT_TOKEN_SECRET: &str = "vault-root-token";
const DEFAULT_UNSEAL_KEYS_SECRET: &str = "vault-init-keys";
const DEFAULT_FILE_KEY_SECRET: &str = "vault-file-key";
const DEFAULT_POLICY_DIR: &str = "/tmp/vault";
const DEFAULT_POLICY_EXTENSION: &str = "hcl";
const DEFAULT_POLICY_MAX_CONCURRENT: u64 = 8;
const DEFAULT_BASE_PATH: &str = "/tmp/vault/roles/vault-store/files";
const DEFAULT_SECRET_ENGINES: [&str; 4] =
    ["environment/", "cluster/", "infrastructure/", "workflow/"];
const DEFAULT_ENGINE_MAX_LEASE_TTL: &str = "10800";
const DEFAULT_AUTH_METHODS: [&str; 2] = ["jwt/", "token/"];
const DEFAULT_AUTH_TYPE: &str = "jwt";
const DEFAULT_AUTH_DEFAULT_LEASE_TTL: &str = "300";
const DEFAULT_AUTH_MAX_LEASE_TTL: &str = "600";
const DEFAULT_AUTH_TOKEN_TYPE: &str = "default-service";
const DEFAULT_USERPASS_PATH: &str = "environment-userpass-pipeline";
const DEFAULT_USERPASS_LEASE_TTL: &str = "2764800";
const DEFAULT_CLUSTER_PATTERN: &str = "*";
const DEFAULT_CLUSTER_DEST: &str = "environment/openshift";
const DEFAULT_IMPORT_PATHS: [&str; 5] = [
    "workflow/gard/",
    "infrastructure/keys/",
    "environment/aws/",
    "cluster/aws/",
    "cluster/openshift/",
];

fn default_cluster_import() -> ClusterImportSettings {
    ClusterImportSettings {
        dirs: Vec::new(),
        pattern: DEFAULT_CLUSTER_PATTERN.to_string(),
        dest: DEFAULT_CLUSTER_DEST.to_string(),
    }
}

fn default_imports() -> Vec<ImportMapping> {
    DEFAULT_IMPORT_PATHS
        .iter()
        .map(|path| ImportMapping {
            source: (*path).to_string(),
            dest: (*path).to_string(),
        })
        .collect()
}

impl Settings {
    /// Creates a new `Settings` instance.
    ///
    /// # Errors
    /// Returns error if configuration parsing fails (e.g. invalid file format).
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut s = Config::builder();

        // 1. Set defaults
        s = s
            .set_default("vault.addr", DEFAULT_VAULT_ADDR)?
            .set_default("vault.request_timeout_secs", DEFAULT_REQUEST_TIMEOUT_SECS)?
            .set_default("controller.check_interval", DEFAULT_CHECK_INTERVAL)?
            .set_default("controller.namespace", DEFAULT_NAMESPACE)?
            .set_default("init.secret_shares", u64::from(DEFAULT_SECRET_SHARES))?
            .set_default("init.secret_threshold", u64::from(DEFAULT_SECRET_THRESHOLD))?
            .set_default("init.root_token_secret", DEFAULT_ROOT_TOKEN_SECRET)?
            .set_default("init.unseal_keys_secret", DEFAULT_UNSEAL_KEYS_SECRET)?
            .set_default("init.file_key_secret", DEFAULT_FILE_KEY_SECRET)?
            .set_default("policy.dir", DEFAULT_POLICY_DIR)?
            .set_default("policy.extension", DEFAULT_POLICY_EXTENSION)?
            .set_default("policy.max_concurrent", DEFAULT_POLICY_MAX_CONCURRENT)?
            .set_default("bootstrap.base_path", DEFAULT_BASE_PATH)?
            .set_default(
                "bootstrap.secret_engines",
                DEFAULT_SECRET_ENGINES.map(str::to_string).to_vec(),
            )?
            .set_default(
                "bootstrap.engine_max_lease_ttl",
                DEFAULT_ENGINE_MAX_LEASE_TTL,
            )?
            .set_default(
                "bootstrap.auth_methods",
                DEFAULT_AUTH_METHODS.map(str::to_string).to_vec(),
            )?
            .set_default("bootstrap.auth_type", DEFAULT_AUTH_TYPE)?
            .set_default(
                "bootstrap.auth_default_lease_ttl",
                DEFAULT_AUTH_DEFAULT_LEASE_TTL,
            )?
            .set_default("bootstrap.auth_max_lease_ttl", DEFAULT_AUTH_MAX_LEASE_TTL)?
            .set_default("bootstrap.auth_token_type", DEFAULT_AUTH_TOKEN_TYPE)?
            .set_default("bootstrap.userpass_path", DEFAULT_USERPASS_PATH)?
            .set_default("bootstrap.userpass_lease_ttl", DEFAULT_USERPASS_LEASE_TTL)?;

        // 2. Merge file (optional); default name sentinel.toml
        let path = config_path.unwrap_or_else(|| PathBuf::from("sentinel.toml"));
        s = s.add_source(File::from(path).required(false));

        // 3. Environment variables, e.g. SENTINEL_VAULT_ADDR
        s = s.add_source(Environment::with_prefix("SENTINEL").separator("_"));

        // 4. Build
        s.build()?.try_deserialize()
    }

    /// Merges CLI arguments into the settings, overriding values if present.
    pub fn merge_with_args(&mut self, args: &crate::Args) {
        if let Some(vault_addr) = &args.vault_addr {
            vault_addr.clone_into(&mut self.vault.addr);
        }
        if let Some(namespace) = &args.namespace {
            namespace.clone_into(&mut self.controller.namespace);
        }
        if let Some(check_interval) = &args.check_interval {
            check_interval.clone_into(&mut self.controller.check_interval);
        }
        if let Some(base_path) = &args.base_path {
            base_path.clone_into(&mut self.bootstrap.base_path);
        }
    }

    /// Parses the poll interval.
    ///
    /// # Errors
    /// Returns an error if the interval is not a valid humantime string.
    pub fn check_interval(&self) -> Result<Duration> {
        let interval = humantime::parse_duration(&self.controller.check_interval)
            .map_err(|err| anyhow::anyhow!("controller.check_interval is invalid: {err}"))?;
        Ok(interval)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Errors
    /// Returns error if any setting is invalid or out of range.
    pub fn validate(&self) -> Result<()> {
        if self.vault.addr.is_empty() {
            anyhow::bail!("vault.addr must not be empty");
        }
        if self.vault.request_timeout_secs == 0 {
            anyhow::bail!("vault.request_timeout_secs must be greater than 0");
        }
        let interval = self.check_interval()?;
        if interval.is_zero() {
            anyhow::bail!("controller.check_interval must be greater than 0");
        }
        if self.controller.namespace.is_empty() {
            anyhow::bail!("controller.namespace must not be empty");
        }
        if self.init.secret_shares == 0 {
            anyhow::bail!("init.secret_shares must be greater than 0");
        }
        if self.init.secret_threshold == 0 {
            anyhow::bail!("init.secret_threshold must be greater than 0");
        }
        if self.init.secret_threshold > self.init.secret_shares {
            anyhow::bail!("init.secret_threshold must be <= init.secret_shares");
        }
        if self.init.root_token_secret.is_empty()
            || self.init.unseal_keys_secret.is_empty()
            || self.init.file_key_secret.is_empty()
        {
            anyhow::bail!("init secret names must not be empty");
        }
        if self.init.root_token_secret == self.init.unseal_keys_secret {
            anyhow::bail!("init.root_token_secret and init.unseal_keys_secret must differ");
        }
        if self.policy.extension.is_empty() {
            anyhow::bail!("policy.extension must not be empty");
        }
        if self.policy.max_concurrent == 0 {
            anyhow::bail!("policy.max_concurrent must be greater than 0");
        }
        if self.bootstrap.secret_engines.iter().any(String::is_empty) {
            anyhow::bail!("bootstrap.secret_engines entries must not be empty");
        }
        if self.bootstrap.auth_methods.iter().any(String::is_empty) {
            anyhow::bail!("bootstrap.auth_methods entries must not be empty");
        }
        if self.bootstrap.cluster.pattern.is_empty() {
            anyhow::bail!("bootstrap.cluster.pattern must not be empty");
        }
        if self.bootstrap.cluster.dest.is_empty() {
            anyhow::bail!("bootstrap.cluster.dest must not be empty");
        }
        for dir in &self.bootstrap.cluster.dirs {
            if Path::new(dir).file_name().is_none() {
                anyhow::bail!("bootstrap.cluster.dirs entry {dir:?} has no terminal path segment");
            }
        }
        for mapping in &self.bootstrap.imports {
            if mapping.source.is_empty() || mapping.dest.is_empty() {
                anyhow::bail!("bootstrap.imports entries must have a source and a dest");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_load_settings_defaults() {
        let settings = Settings::new(None).unwrap();
        assert_eq!(settings.vault.addr, "http://127.0.0.1:8200");
        assert_eq!(settings.controller.check_interval, "60s");
        assert_eq!(settings.controller.namespace, "vault");
        assert_eq!(settings.init.secret_shares, 3);
        assert_eq!(settings.init.secret_threshold, 3);
        assert_eq!(settings.init.root_token_secret, "vault-root-token");
        assert_eq!(settings.init.unseal_keys_secret, "vault-init-keys");
        assert_eq!(settings.policy.extension, "hcl");
        assert_eq!(settings.bootstrap.secret_engines.len(), 4);
        assert_eq!(settings.bootstrap.imports.len(), 5);
        assert_eq!(settings.bootstrap.imports[0].source, "workflow/gard/");
        assert!(settings.bootstrap.cluster.dirs.is_empty());
        settings.validate().unwrap();
    }

    #[test]
    fn test_load_settings_file_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [vault]
            addr = "http://vault.internal:8200"
            [controller]
            check_interval = "5m"
            namespace = "secrets"
            [bootstrap]
            secret_engines = ["environment/"]
            [[bootstrap.imports]]
            source = "workflow/gard/"
            dest = "workflow/renamed/"
        "#
        )
        .unwrap();
        file.flush().unwrap();

        let settings = Settings::new(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(settings.vault.addr, "http://vault.internal:8200");
        assert_eq!(settings.controller.namespace, "secrets");
        assert_eq!(settings.check_interval().unwrap(), Duration::from_secs(300));
        assert_eq!(settings.bootstrap.secret_engines, vec!["environment/"]);
        assert_eq!(settings.bootstrap.imports.len(), 1);
        assert_eq!(settings.bootstrap.imports[0].dest, "workflow/renamed/");
    }

    #[test]
    fn test_merge_with_args() {
        let mut settings = Settings::new(None).unwrap();
        let args = crate::Args {
            config: None,
            vault_addr: Some("http://cli-vault:8200".to_string()),
            namespace: Some("cli-ns".to_string()),
            base_path: None,
            check_interval: Some("30s".to_string()),
            oneshot: false,
        };

        settings.merge_with_args(&args);

        assert_eq!(settings.vault.addr, "http://cli-vault:8200");
        assert_eq!(settings.controller.namespace, "cli-ns");
        assert_eq!(settings.controller.check_interval, "30s");
        assert_eq!(
            settings.bootstrap.base_path,
            PathBuf::from("/tmp/vault/roles/vault-store/files")
        );
    }

    #[test]
    fn test_validate_rejects_threshold_above_shares() {
        let mut settings = Settings::new(None).unwrap();
        settings.init.secret_threshold = 5;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("secret_threshold"));
    }

    #[test]
    fn test_validate_rejects_bad_interval() {
        let mut settings = Settings::new(None).unwrap();
        settings.controller.check_interval = "soon".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("check_interval"));
    }

    #[test]
    fn test_validate_rejects_empty_cluster_pattern() {
        let mut settings = Settings::new(None).unwrap();
        settings.bootstrap.cluster.pattern = String::new();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("cluster.pattern"));
    }

    #[test]
    fn test_validate_rejects_cluster_dir_without_segment() {
        let mut settings = Settings::new(None).unwrap();
        settings.bootstrap.cluster.dirs = vec!["/".to_string()];
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("terminal path segment"));
    }
}
