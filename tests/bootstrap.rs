use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;
use vault_sentinel::config::Settings;
use vault_sentinel::creds::CredentialCache;
use vault_sentinel::store::KubeSecretStore;
use vault_sentinel::vault::VaultClient;
use vault_sentinel::{bootstrap, decrypt};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TIMEOUT: Duration = Duration::from_secs(2);
const FILE_KEY: &str = "test-file-key";

fn vault_client(server: &MockServer) -> VaultClient {
    VaultClient::new(&server.uri(), TIMEOUT).expect("client init should succeed")
}

fn kube_store(server: &MockServer) -> KubeSecretStore {
    KubeSecretStore::new(&server.uri(), "vault", "sa-token", TIMEOUT)
        .expect("store init should succeed")
}

async fn mount_credential_secrets(kube: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/vault/secrets/vault-root-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "token": STANDARD.encode("s.root") }
        })))
        .mount(kube)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/vault/secrets/vault-file-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "key": STANDARD.encode(FILE_KEY) }
        })))
        .mount(kube)
        .await;
}

/// Mounts and auth methods that already exist on the backend.
async fn mount_fully_configured_tables(vault: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v1/sys/mounts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "cubbyhole/": {}, "identity/": {}, "sys/": {},
                "environment/": {}, "cluster/": {},
                "infrastructure/": {}, "workflow/": {},
            }
        })))
        .mount(vault)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/sys/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "jwt/": {}, "token/": {} }
        })))
        .mount(vault)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/sys/auth/environment-userpass-pipeline"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_string("path is already in use at environment-userpass-pipeline/"),
        )
        .mount(vault)
        .await;
}

fn test_settings(policy_dir: &std::path::Path, base_dir: &std::path::Path) -> Settings {
    let mut settings = Settings::new(None).expect("default settings");
    settings.policy.dir = policy_dir.to_path_buf();
    settings.bootstrap.base_path = base_dir.to_path_buf();
    settings
}

#[tokio::test]
async fn object_phase_creates_nothing_on_configured_backend() {
    let vault = MockServer::start().await;
    let kube = MockServer::start().await;
    mount_credential_secrets(&kube).await;
    mount_fully_configured_tables(&vault).await;
    Mock::given(method("POST"))
        .and(path_regex("^/v1/sys/mounts/.+"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&vault)
        .await;
    Mock::given(method("POST"))
        .and(path_regex("^/v1/sys/auth/(jwt|token)/$"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&vault)
        .await;

    let policy_dir = tempfile::tempdir().expect("policy dir");
    let base_dir = tempfile::tempdir().expect("base dir");
    let settings = test_settings(policy_dir.path(), base_dir.path());
    let client = vault_client(&vault);
    let store = kube_store(&kube);
    let mut creds = CredentialCache::new();

    // Two full passes: the second must also observe existing objects and
    // issue zero creation calls.
    bootstrap::run(&client, &store, &settings, &mut creds)
        .await
        .expect("first pass should succeed");
    bootstrap::run(&client, &store, &settings, &mut creds)
        .await
        .expect("second pass should succeed");
}

#[tokio::test]
async fn policy_phase_continues_past_undecryptable_file() {
    let vault = MockServer::start().await;
    let kube = MockServer::start().await;
    mount_credential_secrets(&kube).await;

    let policy_dir = tempfile::tempdir().expect("policy dir");
    for name in ["admin", "ci"] {
        let sealed = decrypt::encrypt_to_string(&format!("path \"{name}/*\" {{}}"), FILE_KEY)
            .expect("encrypt policy");
        std::fs::write(policy_dir.path().join(format!("{name}.hcl")), sealed)
            .expect("write policy");
    }
    std::fs::write(policy_dir.path().join("broken.hcl"), "this is not encrypted")
        .expect("write corrupt policy");

    Mock::given(method("POST"))
        .and(path_regex("^/v1/sys/policies/acl/(admin|ci)$"))
        .respond_with(ResponseTemplate::new(204))
        .expect(2)
        .mount(&vault)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/sys/policies/acl/broken"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&vault)
        .await;

    let base_dir = tempfile::tempdir().expect("base dir");
    let settings = test_settings(policy_dir.path(), base_dir.path());
    let client = vault_client(&vault);
    let store = kube_store(&kube);
    let mut creds = CredentialCache::new();

    bootstrap::apply_policies(&client, &store, &settings, &mut creds)
        .await
        .expect("phase must complete despite the corrupt file");
}

#[tokio::test]
async fn bulk_import_skips_corrupt_json_file() {
    let vault = MockServer::start().await;
    let kube = MockServer::start().await;
    mount_credential_secrets(&kube).await;
    mount_fully_configured_tables(&vault).await;

    let policy_dir = tempfile::tempdir().expect("policy dir");
    let base_dir = tempfile::tempdir().expect("base dir");
    let gard_dir = base_dir.path().join("workflow/gard");
    std::fs::create_dir_all(&gard_dir).expect("create import dir");
    for name in ["first.json", "second.json"] {
        let sealed = decrypt::encrypt_to_string(r#"{"value":"ok"}"#, FILE_KEY)
            .expect("encrypt secret");
        std::fs::write(gard_dir.join(name), sealed).expect("write secret");
    }
    let sealed = decrypt::encrypt_to_string("definitely [not json", FILE_KEY)
        .expect("encrypt corrupt secret");
    std::fs::write(gard_dir.join("corrupt.json"), sealed).expect("write corrupt secret");

    Mock::given(method("POST"))
        .and(path_regex("^/v1/workflow/gard/(first|second)\\.json$"))
        .respond_with(ResponseTemplate::new(204))
        .expect(2)
        .mount(&vault)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/workflow/gard/corrupt.json"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&vault)
        .await;

    let settings = test_settings(policy_dir.path(), base_dir.path());
    let client = vault_client(&vault);
    let store = kube_store(&kube);
    let mut creds = CredentialCache::new();

    bootstrap::ensure_objects(&client, &store, &settings, &mut creds)
        .await
        .expect("object phase should complete");
}

#[tokio::test]
async fn cluster_import_applies_glob_and_directory_name() {
    let vault = MockServer::start().await;
    let kube = MockServer::start().await;
    mount_credential_secrets(&kube).await;
    mount_fully_configured_tables(&vault).await;

    let policy_dir = tempfile::tempdir().expect("policy dir");
    let base_dir = tempfile::tempdir().expect("base dir");
    let cluster_dir = base_dir.path().join("environment/cluster/alpha");
    std::fs::create_dir_all(&cluster_dir).expect("create cluster dir");
    let sealed = decrypt::encrypt_to_string(r#"{"region":"eu-west-1"}"#, FILE_KEY)
        .expect("encrypt cluster secret");
    std::fs::write(cluster_dir.join("env-alpha.json"), sealed).expect("write cluster secret");
    let sealed = decrypt::encrypt_to_string(r#"{"ignored":true}"#, FILE_KEY)
        .expect("encrypt unmatched file");
    std::fs::write(cluster_dir.join("notes.txt"), sealed).expect("write unmatched file");

    Mock::given(method("POST"))
        .and(path("/v1/environment/openshift/alpha/env-alpha.json"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&vault)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/environment/openshift/alpha/notes.txt"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&vault)
        .await;

    let mut settings = test_settings(policy_dir.path(), base_dir.path());
    settings.bootstrap.cluster.dirs = vec!["environment/cluster/alpha".to_string()];
    settings.bootstrap.cluster.pattern = "env-*".to_string();
    settings.validate().expect("settings remain valid");

    let client = vault_client(&vault);
    let store = kube_store(&kube);
    let mut creds = CredentialCache::new();

    bootstrap::ensure_objects(&client, &store, &settings, &mut creds)
        .await
        .expect("object phase should complete");
}

#[tokio::test]
async fn mount_creation_failure_does_not_abort_the_step() {
    let vault = MockServer::start().await;
    let kube = MockServer::start().await;
    mount_credential_secrets(&kube).await;

    Mock::given(method("GET"))
        .and(path("/v1/sys/mounts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": {} })))
        .mount(&vault)
        .await;
    // The first engine rejects; the remaining three must still be attempted.
    Mock::given(method("POST"))
        .and(path("/v1/sys/mounts/environment/"))
        .respond_with(ResponseTemplate::new(500).set_body_string("backend busy"))
        .expect(1)
        .mount(&vault)
        .await;
    Mock::given(method("POST"))
        .and(path_regex("^/v1/sys/mounts/(cluster|infrastructure|workflow)/$"))
        .respond_with(ResponseTemplate::new(204))
        .expect(3)
        .mount(&vault)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/sys/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "jwt/": {}, "token/": {} }
        })))
        .mount(&vault)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/sys/auth/environment-userpass-pipeline"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&vault)
        .await;

    let policy_dir = tempfile::tempdir().expect("policy dir");
    let base_dir = tempfile::tempdir().expect("base dir");
    let settings = test_settings(policy_dir.path(), base_dir.path());
    let client = vault_client(&vault);
    let store = kube_store(&kube);
    let mut creds = CredentialCache::new();

    bootstrap::ensure_objects(&client, &store, &settings, &mut creds)
        .await
        .expect("object phase should complete despite one mount failure");
}
