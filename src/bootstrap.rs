use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::creds::CredentialCache;
use crate::decrypt::{self, DecryptError};
use crate::store::SecretStore;
use crate::vault::{VaultClient, VaultError};

#[derive(Debug, thiserror::Error)]
enum ApplyError {
    #[error(transparent)]
    Decrypt(#[from] DecryptError),
    #[error(transparent)]
    Backend(#[from] VaultError),
}

impl ApplyError {
    fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::Backend(VaultError::Rejected { status, .. })
                if *status == StatusCode::FORBIDDEN
        )
    }
}

/// Runs one full bootstrap pass: policy phase, then object phase. Both
/// phases are idempotent and safe to repeat on every active tick.
///
/// # Errors
/// Returns an error only when a whole phase cannot run (credentials
/// unavailable, mount/auth tables unlistable); per-item failures are
/// logged and skipped.
pub async fn run<S: SecretStore + ?Sized>(
    client: &VaultClient,
    store: &S,
    settings: &Settings,
    creds: &mut CredentialCache,
) -> Result<()> {
    apply_policies(client, store, settings, creds).await?;
    ensure_objects(client, store, settings, creds).await?;
    Ok(())
}

/// Discovers encrypted policy files and applies them concurrently through
/// a bounded worker pool. A failure to decrypt or write one policy is
/// logged and does not cancel sibling tasks or fail the phase.
///
/// # Errors
/// Returns an error if credential material cannot be fetched; per-file
/// failures never propagate.
pub async fn apply_policies<S: SecretStore + ?Sized>(
    client: &VaultClient,
    store: &S,
    settings: &Settings,
    creds: &mut CredentialCache,
) -> Result<()> {
    let started = Instant::now();
    if !settings.policy.dir.exists() {
        debug!(
            "policy directory {} does not exist, skipping policy phase",
            settings.policy.dir.display()
        );
        return Ok(());
    }
    let files = collect_files_with_extension(&settings.policy.dir, &settings.policy.extension);
    if files.is_empty() {
        debug!("no policy files discovered, skipping policy phase");
        return Ok(());
    }

    let token = creds
        .root_token(store, &settings.init.root_token_secret)
        .await
        .context("Failed to fetch root token for policy phase")?;
    let file_key = creds
        .file_key(store, &settings.init.file_key_secret)
        .await
        .context("Failed to fetch file decryption key for policy phase")?;

    let mut authed = client.clone();
    authed.set_token(token);

    let semaphore = Arc::new(Semaphore::new(settings.policy.max_concurrent));
    let total = files.len();
    let mut handles = Vec::with_capacity(total);
    for path in files {
        let Some(name) = policy_name(&path) else {
            warn!("policy file {} has no usable stem, skipping", path.display());
            continue;
        };
        let client = authed.clone();
        let file_key = file_key.clone();
        let semaphore = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let result = apply_policy_file(&client, &path, &name, &file_key).await;
            (path, name, result)
        }));
    }

    let mut applied = 0usize;
    let mut auth_failed = false;
    for handle in handles {
        match handle.await {
            Ok((_, _, Ok(()))) => applied += 1,
            Ok((path, name, Err(err))) => {
                error!("failed to apply policy {name} from {}: {err}", path.display());
                if err.is_auth_failure() {
                    auth_failed = true;
                }
            }
            Err(err) => error!("policy task join error: {err}"),
        }
    }
    if auth_failed {
        warn!("backend rejected the cached root token; invalidating cached credentials");
        creds.invalidate();
    }
    info!(
        "policy phase applied {applied}/{total} policies in {:?}",
        started.elapsed()
    );
    Ok(())
}

async fn apply_policy_file(
    client: &VaultClient,
    path: &Path,
    name: &str,
    file_key: &str,
) -> Result<(), ApplyError> {
    let document = decrypt::decrypt_file(path, file_key)?;
    client.put_policy(name, &document).await?;
    Ok(())
}

/// Reconciles secret engines and auth methods, then imports cluster-scoped
/// and bulk keyed secrets. Steps run in order because later steps assume
/// earlier ones succeeded; failures within a step are isolated per item.
///
/// # Errors
/// Returns an error if credentials cannot be fetched or the mount/auth
/// tables cannot be listed; per-item failures never propagate.
pub async fn ensure_objects<S: SecretStore + ?Sized>(
    client: &VaultClient,
    store: &S,
    settings: &Settings,
    creds: &mut CredentialCache,
) -> Result<()> {
    let token = creds
        .root_token(store, &settings.init.root_token_secret)
        .await
        .context("Failed to fetch root token for object phase")?;
    let mut authed = client.clone();
    authed.set_token(token);

    ensure_secret_engines(&authed, settings).await?;
    ensure_auth_methods(&authed, settings).await?;

    let file_key = creds
        .file_key(store, &settings.init.file_key_secret)
        .await
        .context("Failed to fetch file decryption key for secret import")?;
    import_cluster_secrets(&authed, settings, &file_key).await;
    import_keyed_secrets(&authed, settings, &file_key).await;
    Ok(())
}

async fn ensure_secret_engines(client: &VaultClient, settings: &Settings) -> Result<()> {
    let mounts = client
        .list_mounts()
        .await
        .context("Failed to list secret engine mounts")?;
    for engine in &settings.bootstrap.secret_engines {
        let path = with_trailing_slash(engine);
        if mounts.contains(&path) {
            debug!("secret engine {path} exists");
            continue;
        }
        info!("secret engine {path} not found, creating");
        match client
            .mount(&path, "kv", &settings.bootstrap.engine_max_lease_ttl)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_already_exists() => {}
            Err(err) => error!("failed to mount secret engine {path}: {err}"),
        }
    }
    Ok(())
}

async fn ensure_auth_methods(client: &VaultClient, settings: &Settings) -> Result<()> {
    let enabled = client
        .list_auth()
        .await
        .context("Failed to list auth methods")?;
    for method in &settings.bootstrap.auth_methods {
        let path = with_trailing_slash(method);
        if enabled.contains(&path) {
            debug!("auth method {path} exists");
            continue;
        }
        info!("auth method {path} not found, creating");
        match client
            .enable_auth(
                &path,
                &settings.bootstrap.auth_type,
                &settings.bootstrap.auth_default_lease_ttl,
                &settings.bootstrap.auth_max_lease_ttl,
                &settings.bootstrap.auth_token_type,
            )
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_already_exists() => {}
            Err(err) => error!("failed to enable auth method {path}: {err}"),
        }
    }

    // The pipeline userpass method is enabled unconditionally every pass.
    match client
        .enable_auth(
            &settings.bootstrap.userpass_path,
            "userpass",
            &settings.bootstrap.userpass_lease_ttl,
            &settings.bootstrap.userpass_lease_ttl,
            &settings.bootstrap.auth_token_type,
        )
        .await
    {
        Ok(()) => info!("enabled userpass auth method {}", settings.bootstrap.userpass_path),
        Err(err) if err.is_already_exists() => {
            debug!("userpass auth method {} exists", settings.bootstrap.userpass_path);
        }
        Err(err) => error!(
            "failed to enable userpass auth method {}: {err}",
            settings.bootstrap.userpass_path
        ),
    }
    Ok(())
}

async fn import_cluster_secrets(client: &VaultClient, settings: &Settings, file_key: &str) {
    let cluster = &settings.bootstrap.cluster;
    let dest = cluster.dest.trim_end_matches('/');
    for dir in &cluster.dirs {
        let root = settings.bootstrap.base_path.join(dir);
        if !root.exists() {
            debug!("cluster directory {} does not exist, skipping", root.display());
            continue;
        }
        // Validated at config load: every cluster dir has a terminal segment.
        let Some(cluster_name) = Path::new(dir).file_name().and_then(|name| name.to_str())
        else {
            warn!("cluster directory {dir:?} has no terminal path segment, skipping");
            continue;
        };
        for path in collect_files(&root) {
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !file_name_matches(&cluster.pattern, file_name) {
                debug!("cluster file {} does not match pattern, skipping", path.display());
                continue;
            }
            let destination = format!("{dest}/{cluster_name}/{file_name}");
            write_secret_file(client, &path, &destination, file_key).await;
        }
    }
}

async fn import_keyed_secrets(client: &VaultClient, settings: &Settings, file_key: &str) {
    for mapping in &settings.bootstrap.imports {
        let root = settings.bootstrap.base_path.join(&mapping.source);
        if !root.exists() {
            debug!("import path {} does not exist, skipping", root.display());
            continue;
        }
        let dest = mapping.dest.trim_end_matches('/');
        for path in collect_files(&root) {
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let destination = format!("{dest}/{file_name}");
            write_secret_file(client, &path, &destination, file_key).await;
        }
    }
}

/// Decrypts one file, parses it as a JSON document and writes it to the
/// backend. Every failure mode is logged and swallowed: one bad file must
/// not abort processing of its siblings.
async fn write_secret_file(client: &VaultClient, path: &Path, destination: &str, file_key: &str) {
    let plaintext = match decrypt::decrypt_file(path, file_key) {
        Ok(plaintext) => plaintext,
        Err(err) => {
            error!("failed to decrypt {}: {err}", path.display());
            return;
        }
    };
    let document: serde_json::Value = match serde_json::from_str(&plaintext) {
        Ok(document) => document,
        Err(err) => {
            error!("failed to parse {} as JSON: {err}", path.display());
            return;
        }
    };
    if !document.is_object() {
        error!("{} does not contain a JSON object, skipping", path.display());
        return;
    }
    match client.write_logical(destination, &document).await {
        Ok(()) => debug!("wrote secret {destination}"),
        Err(err) => error!("failed to write secret {destination}: {err}"),
    }
}

fn policy_name(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
}

fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Recursively collects regular files under `root`, sorted for
/// deterministic processing order. Unreadable directories are logged and
/// skipped.
fn collect_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("cannot read directory {}: {err}", dir.display());
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

fn collect_files_with_extension(root: &Path, extension: &str) -> Vec<PathBuf> {
    collect_files(root)
        .into_iter()
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == extension)
        })
        .collect()
}

/// Matches a file name against a pattern where `*` spans any run of
/// characters and everything else is literal.
fn file_name_matches(pattern: &str, name: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == name;
    }
    let segments: Vec<&str> = pattern.split('*').collect();
    let first = segments[0];
    let last = segments[segments.len() - 1];
    if !name.starts_with(first) || !name.ends_with(last) {
        return false;
    }
    if name.len() < first.len() + last.len() {
        return false;
    }
    let mut rest = &name[first.len()..name.len() - last.len()];
    for segment in &segments[1..segments.len() - 1] {
        if segment.is_empty() {
            continue;
        }
        match rest.find(segment) {
            Some(position) => rest = &rest[position + segment.len()..],
            None => return false,
        }
    }
    true
}
