//! Minimal typed HTTP clients for the Vault and Consul APIs.
//!
//! Only the endpoints the lab drives are covered. Responses that the lab
//! inspects are decoded into structs; everything else stays a
//! [`serde_json::Value`].

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// `GET /v1/sys/seal-status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealStatus {
    pub initialized: bool,
    pub sealed: bool,
    #[serde(default, rename = "t")]
    pub threshold: u32,
    #[serde(default, rename = "n")]
    pub shares: u32,
    #[serde(default)]
    pub progress: u32,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub cluster_name: Option<String>,
}

/// `PUT /v1/sys/init` response.
#[derive(Debug, Clone, Deserialize)]
pub struct InitResponse {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub keys_base64: Vec<String>,
    pub root_token: String,
}

/// Build a reqwest client, trusting `ca_cert` in addition to system roots.
///
/// # Errors
///
/// Returns [`ApiError::Client`] if the CA bundle is unreadable or invalid.
pub fn http_client(ca_cert: Option<&Path>) -> Result<reqwest::Client, ApiError> {
    let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
    if let Some(path) = ca_cert {
        let pem = std::fs::read(path).map_err(|e| ApiError::Client {
            reason: format!("failed to read CA certificate {}: {e}", path.display()),
        })?;
        let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| ApiError::Client {
            reason: format!("invalid CA certificate {}: {e}", path.display()),
        })?;
        builder = builder.add_root_certificate(cert);
    }
    builder.build().map_err(|e| ApiError::Client {
        reason: e.to_string(),
    })
}

// ── Vault ────────────────────────────────────────────────────────────

/// Client for one Vault node.
#[derive(Debug, Clone)]
pub struct VaultClient {
    http: reqwest::Client,
    addr: String,
    token: Option<String>,
}

impl VaultClient {
    #[must_use]
    pub fn new(http: reqwest::Client, addr: impl Into<String>) -> Self {
        Self {
            http,
            addr: addr.into().trim_end_matches('/').to_owned(),
            token: None,
        }
    }

    /// Attach a token sent as `X-Vault-Token` on every request.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.addr)
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, ApiError> {
        let url = self.url(path);
        let mut req = self.http.request(method, &url);
        if let Some(token) = &self.token {
            req = req.header("X-Vault-Token", token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.map_err(|e| ApiError::Transport {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        handle_response(&url, resp).await
    }

    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or a non-2xx status.
    pub async fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.send(Method::GET, path, None).await
    }

    /// `POST` (Vault treats it the same as `PUT`).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or a non-2xx status.
    pub async fn post(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        self.send(Method::POST, path, Some(body)).await
    }

    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or a non-2xx status.
    pub async fn put(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        self.send(Method::PUT, path, Some(body)).await
    }

    /// # Errors
    ///
    /// Returns [`ApiError`] on transport, status, or decode failure.
    pub async fn seal_status(&self) -> Result<SealStatus, ApiError> {
        let path = "/v1/sys/seal-status";
        let value = self.get(path).await?;
        decode(&self.url(path), value)
    }

    /// One-shot initialization.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport, status, or decode failure.
    pub async fn init(&self, shares: u32, threshold: u32) -> Result<InitResponse, ApiError> {
        let path = "/v1/sys/init";
        let body = serde_json::json!({ "secret_shares": shares, "secret_threshold": threshold });
        let value = self.put(path, &body).await?;
        decode(&self.url(path), value)
    }

    /// Submit one unseal key share.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport, status, or decode failure.
    pub async fn unseal(&self, key: &str) -> Result<SealStatus, ApiError> {
        let path = "/v1/sys/unseal";
        let value = self.put(path, &serde_json::json!({ "key": key })).await?;
        decode(&self.url(path), value)
    }

    /// Enabled secrets engines as `path/ → type`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport or status failure.
    pub async fn mounts(&self) -> Result<BTreeMap<String, String>, ApiError> {
        Ok(mount_table(&self.get("/v1/sys/mounts").await?))
    }

    /// Enabled auth methods as `path/ → type`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport or status failure.
    pub async fn auth_methods(&self) -> Result<BTreeMap<String, String>, ApiError> {
        Ok(mount_table(&self.get("/v1/sys/auth").await?))
    }

    /// Enabled audit devices as `path/ → type`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport or status failure.
    pub async fn audit_devices(&self) -> Result<BTreeMap<String, String>, ApiError> {
        Ok(mount_table(&self.get("/v1/sys/audit").await?))
    }
}

/// Pull `path/ → type` pairs out of a `sys/mounts`-style listing. Newer
/// Vaults nest the table under `data`; older ones return it at top level.
#[must_use]
pub fn mount_table(value: &Value) -> BTreeMap<String, String> {
    let table = value
        .get("data")
        .filter(|d| d.is_object())
        .unwrap_or(value);
    table
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter(|(k, _)| k.ends_with('/'))
                .filter_map(|(k, v)| {
                    let kind = v.get("type")?.as_str()?;
                    Some((k.clone(), kind.to_owned()))
                })
                .collect()
        })
        .unwrap_or_default()
}

// ── Consul ───────────────────────────────────────────────────────────

/// Client for the local Consul agent.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    addr: String,
}

impl ConsulClient {
    #[must_use]
    pub fn new(http: reqwest::Client, addr: impl Into<String>) -> Self {
        Self {
            http,
            addr: addr.into().trim_end_matches('/').to_owned(),
        }
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Current raft leader address, `None` while an election is pending.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport or status failure.
    pub async fn leader(&self) -> Result<Option<String>, ApiError> {
        let url = format!("{}/v1/status/leader", self.addr);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ApiError::Transport {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        let value = handle_response(&url, resp).await?;
        Ok(value.as_str().filter(|s| !s.is_empty()).map(str::to_owned))
    }
}

// ── Shared helpers ───────────────────────────────────────────────────

/// Status code of a bare `GET`.
///
/// # Errors
///
/// Returns [`ApiError::Transport`] if no response was received.
pub async fn probe(http: &reqwest::Client, url: &str) -> Result<StatusCode, ApiError> {
    http.get(url)
        .send()
        .await
        .map(|r| r.status())
        .map_err(|e| ApiError::Transport {
            url: url.to_owned(),
            reason: e.to_string(),
        })
}

async fn handle_response(url: &str, resp: reqwest::Response) -> Result<Value, ApiError> {
    let status = resp.status();
    if status == StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }
    let body = resp.text().await.map_err(|e| ApiError::Transport {
        url: url.to_owned(),
        reason: format!("failed to read response body: {e}"),
    })?;
    if !status.is_success() {
        return Err(ApiError::Status {
            url: url.to_owned(),
            status: status.as_u16(),
            body,
        });
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).map_err(|e| ApiError::Decode {
        url: url.to_owned(),
        reason: e.to_string(),
    })
}

fn decode<T: serde::de::DeserializeOwned>(url: &str, value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::Decode {
        url: url.to_owned(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn seal_status_decodes_vault_shape() {
        let raw = serde_json::json!({
            "type": "shamir", "initialized": true, "sealed": false,
            "t": 1, "n": 1, "progress": 0, "nonce": "",
            "version": "1.15.2", "build_date": "2023-11-06T11:33:28Z",
            "migration": false, "cluster_name": "vault-cluster-1",
            "recovery_seal": false, "storage_type": "file"
        });
        let status: SealStatus = serde_json::from_value(raw).unwrap();
        assert!(status.initialized);
        assert!(!status.sealed);
        assert_eq!(status.threshold, 1);
        assert_eq!(status.version, "1.15.2");
    }

    #[test]
    fn mount_table_reads_nested_and_flat_shapes() {
        let nested = serde_json::json!({
            "request_id": "x",
            "data": {
                "secret/": { "type": "kv" },
                "sys/": { "type": "system" }
            }
        });
        let table = mount_table(&nested);
        assert_eq!(table.get("secret/").map(String::as_str), Some("kv"));
        assert_eq!(table.len(), 2);

        let flat = serde_json::json!({ "userpass/": { "type": "userpass" }, "lease_id": "" });
        assert_eq!(mount_table(&flat).len(), 1);
    }

    #[test]
    fn already_exists_detection() {
        let err = ApiError::Status {
            url: "u".to_owned(),
            status: 400,
            body: r#"{"errors":["path is already in use at secret/"]}"#.to_owned(),
        };
        assert!(err.is_already_exists());
        let other = ApiError::Status {
            url: "u".to_owned(),
            status: 503,
            body: "sealed".to_owned(),
        };
        assert!(!other.is_already_exists());
    }
}
