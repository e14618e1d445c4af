//! Demo secrets engines, auth methods, and data for a fresh lab.
//!
//! Every step inspects current state first and treats Vault's
//! "path is already in use" rejection as success, so running
//! [`configure`] twice leaves the same end state.

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::client::VaultClient;
use crate::error::{ApiError, InitError};
use crate::paths::LabPaths;
use crate::state::AppRoleCredential;

pub const KV_PATH: &str = "secret";
pub const PKI_PATH: &str = "pki";
pub const PKI_MAX_LEASE: &str = "87600h";
pub const PKI_ROOT_CN: &str = "vault-lab.local";
pub const PKI_ROLE: &str = "lab-dot-local";
pub const DEMO_POLICY: &str = "demo-policy";
pub const DEMO_USER: &str = "demo";
pub const DEMO_PASSWORD: &str = "demo-password";
pub const APPROLE_ROLE: &str = "lab-role";
pub const DEMO_SECRET_PATH: &str = "lab/demo";
pub const AUDIT_PATH: &str = "file";

const DEMO_POLICY_HCL: &str = r#"path "secret/data/*" {
  capabilities = ["create", "read", "update", "delete", "list"]
}

path "secret/metadata/*" {
  capabilities = ["list"]
}
"#;

/// What a configuration pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureReport {
    /// Mounts and objects created by this pass.
    pub created: Vec<String>,
    /// Steps skipped because the state already existed.
    pub existing: Vec<String>,
    /// Best-effort steps that failed.
    pub warnings: Vec<String>,
    pub approle: Option<AppRoleCredential>,
}

impl FeatureReport {
    fn created(&mut self, what: impl Into<String>) {
        let what = what.into();
        info!(feature = %what, "enabled");
        self.created.push(what);
    }

    fn existing(&mut self, what: impl Into<String>) {
        let what = what.into();
        debug!(feature = %what, "already present");
        self.existing.push(what);
    }
}

/// Configure every demo feature through `client`, which must carry the
/// root token.
///
/// # Errors
///
/// Returns [`InitError::Api`] for failures outside the tolerated
/// "already exists" case, or [`InitError::Io`] if the AppRole credential
/// files cannot be written. Audit device failures are warnings only.
pub async fn configure(client: &VaultClient, paths: &LabPaths) -> Result<FeatureReport, InitError> {
    let mut report = FeatureReport::default();

    let mounts = client.mounts().await?;
    if mounts.contains_key(&format!("{KV_PATH}/")) {
        report.existing("secrets/kv-v2");
    } else {
        let body = json!({ "type": "kv", "options": { "version": "2" } });
        if tolerate(client.post(&format!("/v1/sys/mounts/{KV_PATH}"), &body).await)? {
            report.created("secrets/kv-v2");
        } else {
            report.existing("secrets/kv-v2");
        }
    }

    let pki_new = if mounts.contains_key(&format!("{PKI_PATH}/")) {
        report.existing("secrets/pki");
        false
    } else {
        let body = json!({ "type": "pki", "config": { "max_lease_ttl": PKI_MAX_LEASE } });
        let created = tolerate(client.post(&format!("/v1/sys/mounts/{PKI_PATH}"), &body).await)?;
        if created {
            report.created("secrets/pki");
        } else {
            report.existing("secrets/pki");
        }
        created
    };
    if pki_new {
        let body = json!({ "common_name": PKI_ROOT_CN, "ttl": PKI_MAX_LEASE });
        client
            .post(&format!("/v1/{PKI_PATH}/root/generate/internal"), &body)
            .await?;
        report.created(format!("pki root CA {PKI_ROOT_CN}"));
    }
    let role = json!({
        "allowed_domains": "lab.local",
        "allow_subdomains": true,
        "max_ttl": "72h",
    });
    client
        .post(&format!("/v1/{PKI_PATH}/roles/{PKI_ROLE}"), &role)
        .await?;

    client
        .put(
            &format!("/v1/sys/policies/acl/{DEMO_POLICY}"),
            &json!({ "policy": DEMO_POLICY_HCL }),
        )
        .await?;

    let auth = client.auth_methods().await?;
    enable_auth(client, &auth, "userpass", &mut report).await?;
    client
        .post(
            &format!("/v1/auth/userpass/users/{DEMO_USER}"),
            &json!({ "password": DEMO_PASSWORD, "token_policies": DEMO_POLICY }),
        )
        .await?;

    enable_auth(client, &auth, "approle", &mut report).await?;
    report.approle = Some(configure_approle(client, paths).await?);

    seed_demo_secret(client, &mut report).await?;
    enable_audit(client, paths, &mut report).await;

    Ok(report)
}

async fn enable_auth(
    client: &VaultClient,
    enabled: &std::collections::BTreeMap<String, String>,
    kind: &str,
    report: &mut FeatureReport,
) -> Result<(), InitError> {
    let label = format!("auth/{kind}");
    if enabled.contains_key(&format!("{kind}/")) {
        report.existing(label);
        return Ok(());
    }
    if tolerate(
        client
            .post(&format!("/v1/sys/auth/{kind}"), &json!({ "type": kind }))
            .await,
    )? {
        report.created(label);
    } else {
        report.existing(label);
    }
    Ok(())
}

async fn configure_approle(
    client: &VaultClient,
    paths: &LabPaths,
) -> Result<AppRoleCredential, InitError> {
    let role_path = format!("/v1/auth/approle/role/{APPROLE_ROLE}");
    client
        .post(
            &role_path,
            &json!({
                "token_policies": DEMO_POLICY,
                "secret_id_num_uses": 1,
                "secret_id_ttl": "24h",
            }),
        )
        .await?;

    let role_id = data_field(
        client.get(&format!("{role_path}/role-id")).await?,
        "role_id",
        &role_path,
    )?;
    let secret_id = data_field(
        client
            .post(&format!("{role_path}/secret-id"), &json!({}))
            .await?,
        "secret_id",
        &role_path,
    )?;
    let cred = AppRoleCredential { role_id, secret_id };
    cred.save(paths)
        .map_err(InitError::io(paths.approle_role_id()))?;
    info!(role = APPROLE_ROLE, "wrote AppRole role_id and a fresh secret_id");
    Ok(cred)
}

async fn seed_demo_secret(client: &VaultClient, report: &mut FeatureReport) -> Result<(), InitError> {
    let path = format!("/v1/{KV_PATH}/data/{DEMO_SECRET_PATH}");
    match client.get(&path).await {
        Ok(_) => {
            report.existing(format!("{KV_PATH}/{DEMO_SECRET_PATH}"));
            Ok(())
        }
        Err(ApiError::Status { status: 404, .. }) => {
            client
                .post(
                    &path,
                    &json!({ "data": { "username": "demo", "password": "changeme" } }),
                )
                .await?;
            report.created(format!("{KV_PATH}/{DEMO_SECRET_PATH}"));
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn enable_audit(client: &VaultClient, paths: &LabPaths, report: &mut FeatureReport) {
    let label = format!("audit/{AUDIT_PATH}");
    match client.audit_devices().await {
        Ok(devices) if devices.contains_key(&format!("{AUDIT_PATH}/")) => {
            report.existing(label);
            return;
        }
        Ok(_) => {}
        Err(e) => {
            warn!(error = %e, "could not list audit devices");
            report.warnings.push(format!("{label}: {e}"));
            return;
        }
    }
    let body = json!({
        "type": "file",
        "options": { "file_path": paths.audit_log().display().to_string() },
    });
    match tolerate(
        client
            .put(&format!("/v1/sys/audit/{AUDIT_PATH}"), &body)
            .await,
    ) {
        Ok(true) => report.created(label),
        Ok(false) => report.existing(label),
        Err(e) => {
            warn!(error = %e, "could not enable the file audit device");
            report.warnings.push(format!("{label}: {e}"));
        }
    }
}

/// `Ok(true)` if the call succeeded, `Ok(false)` if Vault said the path is
/// already in use.
fn tolerate(result: Result<Value, ApiError>) -> Result<bool, ApiError> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if e.is_already_exists() => Ok(false),
        Err(e) => Err(e),
    }
}

fn data_field(value: Value, field: &str, url: &str) -> Result<String, ApiError> {
    value
        .get("data")
        .and_then(|d| d.get(field))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| ApiError::Decode {
            url: url.to_owned(),
            reason: format!("missing data.{field}"),
        })
}
