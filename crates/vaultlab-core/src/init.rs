//! Vault initialize/unseal state machine.
//!
//! ```text
//! uninitialized ──init──▶ initialized-sealed ──unseal──▶ initialized-unsealed
//! ```
//!
//! The state always comes from `sys/seal-status`; init is never attempted
//! on a Vault that reports `initialized = true`.

use std::time::Duration;

use tracing::{debug, info};

use crate::client::{SealStatus, VaultClient};
use crate::error::InitError;
use crate::paths::LabPaths;
use crate::state::UnsealMaterial;
use crate::supervisor;

/// Key shares requested at init. One share keeps the lab simple.
pub const KEY_SHARES: u32 = 1;
pub const KEY_THRESHOLD: u32 = 1;

/// Observed Vault state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultState {
    Uninitialized,
    Sealed,
    Unsealed,
}

impl From<&SealStatus> for VaultState {
    fn from(s: &SealStatus) -> Self {
        match (s.initialized, s.sealed) {
            (false, _) => Self::Uninitialized,
            (true, true) => Self::Sealed,
            (true, false) => Self::Unsealed,
        }
    }
}

/// Outcome of [`ensure_initialized`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Initialized {
    pub material: UnsealMaterial,
    /// `true` when this call performed `sys/init`.
    pub fresh: bool,
}

/// Initialize Vault if it is not yet, otherwise load the local unseal
/// material.
///
/// # Errors
///
/// [`InitError::MissingUnsealMaterial`] if Vault is initialized but the
/// unseal key is not on disk; API and I/O failures otherwise.
pub async fn ensure_initialized(
    client: &VaultClient,
    paths: &LabPaths,
) -> Result<Initialized, InitError> {
    let status = client.seal_status().await?;
    let local = UnsealMaterial::load(paths).map_err(InitError::io(paths.unseal_key()))?;

    if status.initialized {
        let Some(material) = local else {
            return Err(InitError::MissingUnsealMaterial {
                addr: client.addr().to_owned(),
                key_path: paths.unseal_key(),
            });
        };
        debug!(addr = client.addr(), "already initialized, skipping init");
        return Ok(Initialized {
            material,
            fresh: false,
        });
    }

    info!(addr = client.addr(), "initializing vault");
    let resp = client.init(KEY_SHARES, KEY_THRESHOLD).await?;
    let unseal_key = resp
        .keys_base64
        .first()
        .or_else(|| resp.keys.first())
        .cloned()
        .ok_or_else(|| InitError::EmptyInitResponse {
            addr: client.addr().to_owned(),
        })?;
    let material = UnsealMaterial {
        root_token: resp.root_token,
        unseal_key,
    };
    material
        .save(paths)
        .map_err(InitError::io(paths.unseal_key()))?;
    info!(
        key = %paths.unseal_key().display(),
        token = %paths.root_token().display(),
        "stored unseal key and root token"
    );
    Ok(Initialized {
        material,
        fresh: true,
    })
}

/// Submit the unseal key to every sealed node.
///
/// # Errors
///
/// Returns the first API failure.
pub async fn unseal_all(nodes: &[VaultClient], unseal_key: &str) -> Result<(), InitError> {
    for node in nodes {
        let status = node.seal_status().await?;
        if !status.sealed {
            debug!(addr = node.addr(), "already unsealed");
            continue;
        }
        let after = node.unseal(unseal_key).await?;
        debug!(addr = node.addr(), sealed = after.sealed, progress = after.progress, "unseal submitted");
    }
    Ok(())
}

/// Poll a node until it reports initialized and unsealed.
///
/// # Errors
///
/// Returns [`InitError::UnsealTimeout`] when `timeout` elapses first.
pub async fn wait_unsealed(
    node: &VaultClient,
    timeout: Duration,
    interval: Duration,
) -> Result<(), InitError> {
    let ok = supervisor::poll_until(timeout, interval, || async {
        matches!(
            node.seal_status().await.as_ref().map(VaultState::from),
            Ok(VaultState::Unsealed)
        )
    })
    .await;
    if ok {
        info!(addr = node.addr(), "unsealed");
        Ok(())
    } else {
        Err(InitError::UnsealTimeout {
            addr: node.addr().to_owned(),
            timeout_secs: timeout.as_secs(),
        })
    }
}

/// Full sequence: init through the first node if needed, unseal every
/// node, then wait until each reports unsealed.
///
/// # Errors
///
/// Propagates any [`InitError`] from the steps above.
pub async fn bring_up(
    nodes: &[VaultClient],
    paths: &LabPaths,
    timeout: Duration,
    interval: Duration,
) -> Result<Initialized, InitError> {
    let Some(first) = nodes.first() else {
        return Err(InitError::EmptyInitResponse {
            addr: "(no nodes)".to_owned(),
        });
    };
    let initialized = ensure_initialized(first, paths).await?;
    unseal_all(nodes, &initialized.material.unseal_key).await?;
    for node in nodes {
        wait_unsealed(node, timeout, interval).await?;
    }
    Ok(initialized)
}
