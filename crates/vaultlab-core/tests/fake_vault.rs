//! Init, unseal, readiness, demo-feature configuration and the full
//! start/restart/reset lifecycle against an in-process fake Vault HTTP API.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tempfile::TempDir;
use vaultlab_core::client::{VaultClient, http_client};
use vaultlab_core::config::{LabConfig, LabContext, Timeouts};
use vaultlab_core::error::{InitError, ProcessError};
use vaultlab_core::features;
use vaultlab_core::init::{self, VaultState};
use vaultlab_core::lifecycle::{Lab, LabState};
use vaultlab_core::paths::{LabPaths, Ports};
use vaultlab_core::state::{self, AppRoleCredential, UnsealMaterial};
use vaultlab_core::supervisor;
use vaultlab_core::version::VersionSpec;

const ROOT: &str = "hvs.fake-root";
const KEY: &str = "ZmFrZS11bnNlYWwta2V5";

// ── Fake server ──────────────────────────────────────────────────────

#[derive(Default)]
struct Fake {
    initialized: bool,
    sealed: bool,
    mounts: BTreeMap<String, String>,
    auth: BTreeMap<String, String>,
    audit: BTreeMap<String, String>,
    policies: BTreeSet<String>,
    kv: BTreeSet<String>,
    audit_broken: bool,
    root_generated: u32,
    secret_ids: u32,
}

type Shared = Arc<Mutex<Fake>>;

fn fresh_fake() -> Fake {
    Fake {
        sealed: true,
        mounts: [("sys/", "system"), ("cubbyhole/", "cubbyhole")]
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect(),
        auth: [("token/".to_owned(), "token".to_owned())].into(),
        policies: ["default".to_owned(), "root".to_owned()].into(),
        ..Fake::default()
    }
}

fn table(map: &BTreeMap<String, String>) -> Value {
    let data: serde_json::Map<String, Value> = map
        .iter()
        .map(|(k, v)| (k.clone(), json!({ "type": v })))
        .collect();
    json!({ "data": data })
}

fn seal_json(f: &Fake) -> Value {
    json!({
        "type": "shamir",
        "initialized": f.initialized,
        "sealed": f.sealed,
        "t": 1,
        "n": 1,
        "progress": 0,
        "version": "1.15.6",
    })
}

fn error(status: StatusCode, msg: &str) -> Response {
    (status, axum::Json(json!({ "errors": [msg] }))).into_response()
}

fn ok(value: Value) -> Response {
    axum::Json(value).into_response()
}

async fn handle(
    State(shared): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let path = uri.path().trim_start_matches("/v1/").to_owned();
    let mut f = shared.lock().unwrap();

    match (method.as_str(), path.as_str()) {
        ("GET", "sys/seal-status") => return ok(seal_json(&f)),
        ("GET", "sys/health") => {
            return match (f.initialized, f.sealed) {
                (true, false) => ok(seal_json(&f)),
                (false, _) => error(StatusCode::NOT_IMPLEMENTED, "not initialized"),
                (true, true) => error(StatusCode::SERVICE_UNAVAILABLE, "sealed"),
            };
        }
        ("PUT", "sys/init") => {
            if f.initialized {
                return error(StatusCode::BAD_REQUEST, "Vault is already initialized");
            }
            f.initialized = true;
            return ok(json!({ "keys": ["hex-key"], "keys_base64": [KEY], "root_token": ROOT }));
        }
        ("PUT", "sys/unseal") => {
            if body["key"] == KEY {
                f.sealed = false;
            }
            return ok(seal_json(&f));
        }
        _ => {}
    }

    if headers.get("x-vault-token").and_then(|v| v.to_str().ok()) != Some(ROOT) {
        return error(StatusCode::FORBIDDEN, "permission denied");
    }
    if f.sealed {
        return error(StatusCode::SERVICE_UNAVAILABLE, "Vault is sealed");
    }

    let mount = |map: &mut BTreeMap<String, String>, name: &str, kind: &str| -> Response {
        let key = format!("{name}/");
        if map.contains_key(&key) {
            return error(
                StatusCode::BAD_REQUEST,
                &format!("path is already in use at {key}"),
            );
        }
        map.insert(key, kind.to_owned());
        StatusCode::NO_CONTENT.into_response()
    };

    match (method.as_str(), path.as_str()) {
        ("GET", "sys/mounts") => ok(table(&f.mounts)),
        ("GET", "sys/auth") => ok(table(&f.auth)),
        ("GET", "sys/audit") => ok(table(&f.audit)),
        ("GET", "sys/policy") => ok(json!({ "policies": f.policies })),
        ("POST", p) if p.starts_with("sys/mounts/") => {
            let kind = body["type"].as_str().unwrap_or("kv").to_owned();
            mount(&mut f.mounts, &p["sys/mounts/".len()..], &kind)
        }
        ("POST", p) if p.starts_with("sys/auth/") => {
            let kind = body["type"].as_str().unwrap_or("token").to_owned();
            mount(&mut f.auth, &p["sys/auth/".len()..], &kind)
        }
        ("PUT", p) if p.starts_with("sys/audit/") => {
            if f.audit_broken {
                return error(StatusCode::BAD_REQUEST, "sink path not writable");
            }
            mount(&mut f.audit, &p["sys/audit/".len()..], "file")
        }
        ("PUT", p) if p.starts_with("sys/policies/acl/") => {
            f.policies.insert(p["sys/policies/acl/".len()..].to_owned());
            StatusCode::NO_CONTENT.into_response()
        }
        ("POST", "pki/root/generate/internal") => {
            f.root_generated += 1;
            ok(json!({ "data": { "certificate": "-----BEGIN CERTIFICATE-----" } }))
        }
        ("POST", p)
            if p.starts_with("pki/roles/")
                || p.starts_with("auth/userpass/users/")
                || p == "auth/approle/role/lab-role" =>
        {
            StatusCode::NO_CONTENT.into_response()
        }
        ("GET", "auth/approle/role/lab-role/role-id") => {
            ok(json!({ "data": { "role_id": "role-1234" } }))
        }
        ("POST", "auth/approle/role/lab-role/secret-id") => {
            f.secret_ids += 1;
            ok(json!({ "data": { "secret_id": format!("secret-{}", f.secret_ids) } }))
        }
        ("GET", p) if p.starts_with("secret/data/") => {
            if f.kv.contains(p) {
                ok(json!({ "data": { "data": { "username": "demo" } } }))
            } else {
                error(StatusCode::NOT_FOUND, "")
            }
        }
        ("POST", p) if p.starts_with("secret/data/") => {
            f.kv.insert(p.to_owned());
            ok(json!({ "data": { "version": 1 } }))
        }
        _ => error(StatusCode::NOT_FOUND, "unsupported path"),
    }
}

async fn serve(fake: Fake) -> (String, Shared) {
    let shared = Arc::new(Mutex::new(fake));
    let app = Router::new().fallback(handle).with_state(Arc::clone(&shared));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, shared)
}

fn lab() -> (TempDir, LabPaths) {
    let dir = TempDir::new().unwrap();
    let paths = LabPaths::new(dir.path());
    (dir, paths)
}

fn client(addr: &str) -> VaultClient {
    VaultClient::new(http_client(None).unwrap(), addr)
}

const FAST: Duration = Duration::from_millis(20);

// ── Init & unseal ────────────────────────────────────────────────────

#[tokio::test]
async fn init_persists_material_once() {
    let (addr, shared) = serve(fresh_fake()).await;
    let (_dir, paths) = lab();
    let vault = client(&addr);

    let first = init::ensure_initialized(&vault, &paths).await.unwrap();
    assert!(first.fresh);
    assert_eq!(first.material.root_token, ROOT);
    assert_eq!(first.material.unseal_key, KEY);
    assert_eq!(UnsealMaterial::load(&paths).unwrap(), Some(first.material.clone()));

    let second = init::ensure_initialized(&vault, &paths).await.unwrap();
    assert!(!second.fresh);
    assert_eq!(second.material, first.material);
    assert!(shared.lock().unwrap().initialized);
}

#[tokio::test]
async fn initialized_vault_without_local_key_is_an_error() {
    let mut fake = fresh_fake();
    fake.initialized = true;
    let (addr, _) = serve(fake).await;
    let (_dir, paths) = lab();

    let err = init::ensure_initialized(&client(&addr), &paths)
        .await
        .unwrap_err();
    assert!(matches!(err, InitError::MissingUnsealMaterial { .. }));
    assert!(!paths.unseal_key().exists());
}

#[tokio::test]
async fn bring_up_unseals_every_node() {
    let (addr_a, _) = serve(fresh_fake()).await;
    let mut follower = fresh_fake();
    follower.initialized = true;
    let (addr_b, shared_b) = serve(follower).await;
    let (_dir, paths) = lab();

    let nodes = [client(&addr_a), client(&addr_b)];
    let up = init::bring_up(&nodes, &paths, Duration::from_secs(2), FAST)
        .await
        .unwrap();
    assert!(up.fresh);
    for node in &nodes {
        let status = node.seal_status().await.unwrap();
        assert_eq!(VaultState::from(&status), VaultState::Unsealed);
    }
    assert!(!shared_b.lock().unwrap().sealed);

    // Already unsealed nodes are left alone.
    init::unseal_all(&nodes, "wrong-key").await.unwrap();
    assert!(!shared_b.lock().unwrap().sealed);
}

#[tokio::test]
async fn wait_unsealed_times_out_on_wrong_key() {
    let mut fake = fresh_fake();
    fake.initialized = true;
    let (addr, _) = serve(fake).await;
    let vault = client(&addr);

    init::unseal_all(std::slice::from_ref(&vault), "wrong-key")
        .await
        .unwrap();
    let err = init::wait_unsealed(&vault, Duration::from_millis(150), FAST)
        .await
        .unwrap_err();
    assert!(matches!(err, InitError::UnsealTimeout { .. }));
}

// ── Readiness ────────────────────────────────────────────────────────

#[tokio::test]
async fn readiness_requires_http_200() {
    let (addr, shared) = serve(fresh_fake()).await;
    let (dir, _) = lab();
    let log = dir.path().join("vault.log");
    std::fs::write(&log, "==> Vault server started!\ncore: security barrier not initialized\n").unwrap();
    let http = http_client(None).unwrap();
    let url = format!("{addr}/v1/sys/health");

    let err = supervisor::wait_ready(&http, "vault-1", &url, &log, Duration::from_millis(150), FAST)
        .await
        .unwrap_err();
    match err {
        ProcessError::ReadinessTimeout { name, log_tail, .. } => {
            assert_eq!(name, "vault-1");
            assert!(log_tail.contains("security barrier not initialized"));
        }
        other => panic!("unexpected error: {other}"),
    }

    {
        let mut f = shared.lock().unwrap();
        f.initialized = true;
        f.sealed = false;
    }
    supervisor::wait_ready(&http, "vault-1", &url, &log, Duration::from_secs(2), FAST)
        .await
        .unwrap();
}

#[tokio::test]
async fn readiness_times_out_without_listener() {
    let (dir, _) = lab();
    let http = http_client(None).unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/v1/sys/health", listener.local_addr().unwrap());
    drop(listener);

    let result = supervisor::wait_ready(
        &http,
        "vault-1",
        &url,
        &dir.path().join("missing.log"),
        Duration::from_millis(100),
        FAST,
    )
    .await;
    assert!(matches!(result, Err(ProcessError::ReadinessTimeout { log_tail, .. }) if log_tail.is_empty()));
}

// ── Demo features ────────────────────────────────────────────────────

async fn unsealed_fake() -> (VaultClient, Shared, TempDir, LabPaths) {
    let mut fake = fresh_fake();
    fake.initialized = true;
    fake.sealed = false;
    let (addr, shared) = serve(fake).await;
    let (dir, paths) = lab();
    (client(&addr).with_token(ROOT), shared, dir, paths)
}

#[tokio::test]
async fn features_configure_everything_on_fresh_vault() {
    let (vault, shared, _dir, paths) = unsealed_fake().await;

    let report = features::configure(&vault, &paths).await.unwrap();
    for item in [
        "secrets/kv-v2",
        "secrets/pki",
        "auth/userpass",
        "auth/approle",
        "secret/lab/demo",
        "audit/file",
    ] {
        assert!(report.created.iter().any(|c| c == item), "missing {item}: {report:?}");
    }
    assert!(report.warnings.is_empty());

    let cred = report.approle.clone().unwrap();
    assert_eq!(cred.role_id, "role-1234");
    assert_eq!(AppRoleCredential::load(&paths).unwrap(), Some(cred));

    let f = shared.lock().unwrap();
    assert_eq!(f.mounts.get("secret/").map(String::as_str), Some("kv"));
    assert_eq!(f.mounts.get("pki/").map(String::as_str), Some("pki"));
    assert!(f.policies.contains(features::DEMO_POLICY));
    assert_eq!(f.root_generated, 1);
}

#[tokio::test]
async fn features_are_idempotent() {
    let (vault, shared, _dir, paths) = unsealed_fake().await;

    let first = features::configure(&vault, &paths).await.unwrap();
    let second = features::configure(&vault, &paths).await.unwrap();

    assert!(second.created.is_empty(), "second pass created {:?}", second.created);
    for item in &first.created {
        if item.starts_with("pki root") {
            continue;
        }
        assert!(second.existing.contains(item), "{item} not reported existing");
    }
    let f = shared.lock().unwrap();
    assert_eq!(f.root_generated, 1, "PKI root must only be generated once");
    assert_eq!(f.secret_ids, 2, "each pass issues a fresh secret_id");
    drop(f);

    let saved = AppRoleCredential::load(&paths).unwrap().unwrap();
    assert_eq!(saved.secret_id, "secret-2");
}

#[tokio::test]
async fn audit_failure_is_only_a_warning() {
    let (vault, shared, _dir, paths) = unsealed_fake().await;
    shared.lock().unwrap().audit_broken = true;

    let report = features::configure(&vault, &paths).await.unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].starts_with("audit/file"));
    assert!(report.created.iter().any(|c| c == "auth/approle"));
}

#[tokio::test]
async fn features_without_token_fail() {
    let (vault, _, _dir, paths) = unsealed_fake().await;
    let anonymous = VaultClient::new(http_client(None).unwrap(), vault.addr());
    let err = features::configure(&anonymous, &paths).await.unwrap_err();
    assert!(matches!(err, InitError::Api(_)), "got {err}");
}

// ── Lifecycle ────────────────────────────────────────────────────────

/// Stand-in `vault` binary: reports a fixed version, otherwise idles until
/// SIGTERM. The shell stays in the foreground so its command line keeps the
/// `-config=` argument the supervisor matches on.
#[cfg(unix)]
const FAKE_VAULT_SH: &str = r#"#!/bin/sh
if [ "$1" = "version" ]; then
  echo "Vault v1.15.6 (fake), built 2024-01-01T00:00:00Z"
  exit 0
fi
# Linger briefly on SIGTERM so the listener is gone before the exit is seen.
trap 'kill "$child" 2>/dev/null; sleep 0.3; exit 0' TERM
sleep 30 &
child=$!
wait "$child"
"#;

#[cfg(unix)]
fn install_fake_vault(paths: &LabPaths) {
    use std::os::unix::fs::PermissionsExt;
    let bin = paths.binary("vault");
    std::fs::create_dir_all(paths.bin_dir()).unwrap();
    std::fs::write(&bin, FAKE_VAULT_SH).unwrap();
    std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// A free port whose successor (the cluster port) is free as well.
#[cfg(unix)]
fn free_api_port() -> u16 {
    (0..50)
        .find_map(|_| {
            let reserved = std::net::TcpListener::bind("127.0.0.1:0").ok()?;
            let port = reserved.local_addr().ok()?.port();
            drop(reserved);
            let cluster = port.checked_add(1)?;
            (!supervisor::port_in_use(port) && !supervisor::port_in_use(cluster)).then_some(port)
        })
        .expect("no free port pair")
}

/// Serve the fake on `port` only while the process recorded at `pid_path`
/// is alive, so the listener lives and dies with the launched server. The
/// fake comes back sealed after every exit.
#[cfg(unix)]
async fn follow_process(shared: Shared, port: u16, pid_path: PathBuf) {
    let tick = Duration::from_millis(5);
    loop {
        let pid = loop {
            if let Some(pid) = state::read_pid(&pid_path).filter(|p| supervisor::pid_alive(*p)) {
                break pid;
            }
            tokio::time::sleep(tick).await;
        };
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let app = Router::new().fallback(handle).with_state(Arc::clone(&shared));
        let exited = {
            let shared = Arc::clone(&shared);
            async move {
                while supervisor::pid_alive(pid) {
                    tokio::time::sleep(tick).await;
                }
                shared.lock().unwrap().sealed = true;
            }
        };
        axum::serve(listener, app)
            .with_graceful_shutdown(exited)
            .await
            .unwrap();
    }
}

#[cfg(unix)]
fn lifecycle_lab(base: &Path, port: u16) -> Lab {
    let mut ctx = LabContext::new(LabPaths::new(base), LabConfig::default());
    ctx.vault_version = VersionSpec::Exact("1.15.6".parse().unwrap());
    ctx.ports = Ports {
        vault_base: port,
        ..Ports::default()
    };
    ctx.timeouts = Timeouts {
        single: Duration::from_secs(10),
        extended: Duration::from_secs(10),
        stop_grace: Duration::from_secs(5),
        poll_interval: Duration::from_millis(50),
    };
    Lab::new(ctx).unwrap()
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_restart_reset_report_initialization() {
    let (_dir, paths) = lab();
    install_fake_vault(&paths);
    let port = free_api_port();
    let shared = Arc::new(Mutex::new(fresh_fake()));
    tokio::spawn(follow_process(Arc::clone(&shared), port, paths.vault_pid(1)));
    let mut lab = lifecycle_lab(paths.base(), port);

    // start: fresh Vault gets initialized, unsealed and configured.
    let started = lab.start().await.unwrap();
    assert!(started.initialized);
    assert!(started.features.created.iter().any(|c| c == "secrets/kv-v2"));
    assert_eq!(started.access.vault_addrs, [format!("http://127.0.0.1:{port}")]);
    assert_eq!(started.access.root_token.as_deref(), Some(ROOT));
    assert!(lab.is_running());
    assert_eq!(lab.status().await.state, LabState::RunningUnsealed);
    assert_eq!(LabConfig::load(&paths.lab_config()).unwrap(), Some(LabConfig::default()));

    // A second start refuses while the tracked server is alive.
    let pid = state::read_pid(&paths.vault_pid(1)).unwrap();
    let err = lab.start().await.unwrap_err();
    assert!(err.to_string().contains(&pid.to_string()), "got {err}");

    // restart: same data, comes back sealed and is unsealed with the
    // stored key; nothing is initialized or created again.
    let restarted = lab.restart().await.unwrap();
    assert!(!restarted.initialized);
    assert!(restarted.features.created.is_empty(), "{:?}", restarted.features.created);
    assert_ne!(state::read_pid(&paths.vault_pid(1)), Some(pid));
    assert!(!shared.lock().unwrap().sealed);

    // reset: wiped storage means a brand-new Vault behind the same port.
    *shared.lock().unwrap() = fresh_fake();
    let reset = lab.reset().await.unwrap();
    assert!(reset.initialized);
    assert_eq!(UnsealMaterial::load(&paths).unwrap().unwrap().unseal_key, KEY);
    assert_eq!(shared.lock().unwrap().root_generated, 1);

    assert_eq!(lab.stop().await, 1);
    assert!(!lab.is_running());
    assert!(!paths.vault_pid(1).exists());
}
