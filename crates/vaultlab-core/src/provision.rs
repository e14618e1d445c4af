//! Binary provisioning from the HashiCorp release site.
//!
//! [`Provisioner::ensure`] makes `<base>/bin/<product>` exist at the
//! requested version. The release listing and archive download go through
//! the [`ReleaseIndex`] trait so resolution and fallback can be tested
//! without the network.

use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::ProvisionError;
use crate::paths::LabPaths;
use crate::version::{self, Version, VersionSpec};

/// Default release site.
pub const RELEASES_URL: &str = "https://releases.hashicorp.com";

/// Host tools needed to install a release archive.
pub const REQUIRED_TOOLS: &[&str] = &["unzip"];

/// A downloadable HashiCorp product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Product {
    Vault,
    Consul,
}

impl Product {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vault => "vault",
            Self::Consul => "consul",
        }
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Release-site naming of an OS/architecture pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: &'static str,
    pub arch: &'static str,
}

impl Platform {
    /// The host this binary was compiled for.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::UnsupportedPlatform`] for hosts without
    /// published builds.
    pub fn current() -> Result<Self, ProvisionError> {
        Self::from_rust(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Map Rust's `target_os`/`target_arch` names onto release-site names.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::UnsupportedPlatform`] for unknown pairs.
    pub fn from_rust(os: &str, arch: &str) -> Result<Self, ProvisionError> {
        let unsupported = || ProvisionError::UnsupportedPlatform {
            os: os.to_owned(),
            arch: arch.to_owned(),
        };
        let os_name = match os {
            "linux" => "linux",
            "macos" => "darwin",
            "windows" => "windows",
            "freebsd" => "freebsd",
            _ => return Err(unsupported()),
        };
        let arch_name = match arch {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "arm" => "arm",
            _ => return Err(unsupported()),
        };
        Ok(Self {
            os: os_name,
            arch: arch_name,
        })
    }

    /// Archive file name, e.g. `vault_1.15.2_linux_amd64.zip`.
    #[must_use]
    pub fn archive_name(&self, product: Product, version: &Version) -> String {
        format!("{product}_{version}_{}_{}.zip", self.os, self.arch)
    }
}

/// Source of release listings and archives.
#[async_trait]
pub trait ReleaseIndex: Send + Sync {
    /// Every published version tag of `product`.
    async fn versions(&self, product: Product) -> Result<Vec<String>, ProvisionError>;

    /// Download the release archive to `dest`.
    async fn download(
        &self,
        product: Product,
        version: &Version,
        platform: Platform,
        dest: &Path,
    ) -> Result<(), ProvisionError>;
}

/// [`ReleaseIndex`] backed by `releases.hashicorp.com`.
#[derive(Debug, Clone)]
pub struct HashicorpReleases {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct IndexDocument {
    #[serde(default)]
    versions: std::collections::BTreeMap<String, serde_json::Value>,
}

impl HashicorpReleases {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_base_url(http, RELEASES_URL)
    }

    #[must_use]
    pub fn with_base_url(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }
}

#[async_trait]
impl ReleaseIndex for HashicorpReleases {
    async fn versions(&self, product: Product) -> Result<Vec<String>, ProvisionError> {
        let url = format!("{}/{product}/index.json", self.base_url);
        let fail = |reason: String| ProvisionError::ReleaseIndex {
            url: url.clone(),
            reason,
        };
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(fail(format!("HTTP {}", resp.status())));
        }
        let doc: IndexDocument = resp.json().await.map_err(|e| fail(e.to_string()))?;
        Ok(doc.versions.into_keys().collect())
    }

    async fn download(
        &self,
        product: Product,
        version: &Version,
        platform: Platform,
        dest: &Path,
    ) -> Result<(), ProvisionError> {
        let url = format!(
            "{}/{product}/{version}/{}",
            self.base_url,
            platform.archive_name(product, version)
        );
        let fail = |reason: String| ProvisionError::Download {
            url: url.clone(),
            reason,
        };
        info!(%url, "downloading");
        let mut resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(fail(format!("HTTP {}", resp.status())));
        }
        let mut file = std::fs::File::create(dest).map_err(ProvisionError::io(dest))?;
        while let Some(chunk) = resp.chunk().await.map_err(|e| fail(e.to_string()))? {
            file.write_all(&chunk).map_err(ProvisionError::io(dest))?;
        }
        file.flush().map_err(ProvisionError::io(dest))?;
        Ok(())
    }
}

/// How [`Provisioner::ensure`] satisfied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinarySource {
    /// The installed binary already had the target version.
    Reused,
    /// A fresh archive was downloaded and installed.
    Downloaded,
    /// Resolution or download failed; the existing binary is used as-is.
    Fallback,
}

/// Result of provisioning one product.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub product: Product,
    pub path: PathBuf,
    /// Version reported by the binary, when it could be determined.
    pub version: Option<Version>,
    pub source: BinarySource,
}

/// Fail early, listing every missing host tool at once.
///
/// # Errors
///
/// Returns [`ProvisionError::MissingTools`].
pub fn check_tools() -> Result<(), ProvisionError> {
    let missing: Vec<String> = REQUIRED_TOOLS
        .iter()
        .filter(|tool| which::which(tool).is_err())
        .map(|tool| (*tool).to_owned())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ProvisionError::MissingTools { tools: missing })
    }
}

/// Version printed by `<binary> version`, if the binary runs and reports one.
pub async fn installed_version(binary: &Path) -> Option<Version> {
    if !binary.is_file() {
        return None;
    }
    let output = tokio::process::Command::new(binary)
        .arg("version")
        .output()
        .await
        .ok()?;
    version::parse_version_output(&String::from_utf8_lossy(&output.stdout))
}

/// Downloads and installs release binaries into `<base>/bin`.
pub struct Provisioner<I> {
    index: I,
    paths: LabPaths,
    platform: Platform,
    allow_fallback: bool,
}

impl<I: ReleaseIndex> Provisioner<I> {
    #[must_use]
    pub fn new(index: I, paths: LabPaths, platform: Platform, allow_fallback: bool) -> Self {
        Self {
            index,
            paths,
            platform,
            allow_fallback,
        }
    }

    /// Make `<base>/bin/<product>` exist at the requested version.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the version cannot be resolved or
    /// installed and no fallback binary is usable.
    pub async fn ensure(
        &self,
        product: Product,
        spec: &VersionSpec,
    ) -> Result<Provisioned, ProvisionError> {
        let path = self.paths.binary(product.as_str());
        std::fs::create_dir_all(self.paths.bin_dir())
            .map_err(ProvisionError::io(self.paths.bin_dir()))?;

        let target = match self.resolve(product, spec).await {
            Ok(v) => v,
            Err(e) => return self.fall_back(product, path, e).await,
        };

        let installed = installed_version(&path).await;
        if installed.as_ref() == Some(&target) {
            info!(%product, version = %target, "binary up to date");
            return Ok(Provisioned {
                product,
                path,
                version: installed,
                source: BinarySource::Reused,
            });
        }
        match &installed {
            Some(v) => info!(%product, from = %v, to = %target, "updating binary"),
            None => info!(%product, version = %target, "installing binary"),
        }

        match self.install(product, &target, &path).await {
            Ok(()) => Ok(Provisioned {
                product,
                path,
                version: Some(target),
                source: BinarySource::Downloaded,
            }),
            Err(e) => self.fall_back(product, path, e).await,
        }
    }

    async fn resolve(&self, product: Product, spec: &VersionSpec) -> Result<Version, ProvisionError> {
        match spec {
            VersionSpec::Exact(v) => Ok(v.clone()),
            VersionSpec::Latest => {
                let tags = self.index.versions(product).await?;
                let latest = version::latest_stable(tags.iter().map(String::as_str)).ok_or_else(|| {
                    ProvisionError::NoStableRelease {
                        product: product.to_string(),
                        url: format!("{RELEASES_URL}/{product}/index.json"),
                    }
                })?;
                debug!(%product, version = %latest, candidates = tags.len(), "resolved latest");
                Ok(latest)
            }
        }
    }

    async fn install(&self, product: Product, version: &Version, dest: &Path) -> Result<(), ProvisionError> {
        let bin_dir = self.paths.bin_dir();
        let staging = tempfile::Builder::new()
            .prefix(".download-")
            .tempdir_in(&bin_dir)
            .map_err(ProvisionError::io(&bin_dir))?;
        let archive = staging.path().join(self.platform.archive_name(product, version));
        self.index
            .download(product, version, self.platform, &archive)
            .await?;

        let extract_dir = staging.path().join("extract");
        let output = tokio::process::Command::new("unzip")
            .arg("-o")
            .arg("-q")
            .arg(&archive)
            .arg("-d")
            .arg(&extract_dir)
            .output()
            .await
            .map_err(|e| ProvisionError::Extract {
                archive: archive.clone(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(ProvisionError::Extract {
                archive,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let file_name = dest.file_name().unwrap_or_default();
        let extracted = extract_dir.join(file_name);
        if !extracted.is_file() {
            return Err(ProvisionError::Extract {
                archive,
                reason: format!("archive does not contain {}", file_name.to_string_lossy()),
            });
        }
        set_executable(&extracted)?;
        std::fs::rename(&extracted, dest).map_err(ProvisionError::io(dest))?;
        info!(%product, %version, path = %dest.display(), "installed");
        Ok(())
    }

    async fn fall_back(
        &self,
        product: Product,
        path: PathBuf,
        err: ProvisionError,
    ) -> Result<Provisioned, ProvisionError> {
        if !self.allow_fallback || !path.is_file() {
            return Err(err);
        }
        let version = installed_version(&path).await;
        warn!(
            %product,
            error = %err,
            path = %path.display(),
            version = version.as_ref().map_or_else(|| "unknown".to_owned(), ToString::to_string),
            "PROVISIONING FAILED, falling back to the existing local binary"
        );
        Ok(Provisioned {
            product,
            path,
            version,
            source: BinarySource::Fallback,
        })
    }
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<(), ProvisionError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(ProvisionError::io(path))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<(), ProvisionError> {
    Ok(())
}
