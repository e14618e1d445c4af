//! Release version parsing and ordering.
//!
//! HashiCorp publishes stable releases as plain `MAJOR.MINOR.PATCH`; every
//! other tag (`1.15.0+ent`, `1.16.0-rc1`, `1.14.2+ent.hsm.fips1402`,
//! `0.9.0-beta2`) carries a suffix and is never picked for `latest`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::ProvisionError;

/// A release version. Only the numeric triple participates in ordering;
/// the suffix is kept so unstable tags can be recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Anything after the numeric triple, including the leading `-` or `+`.
    pub suffix: String,
}

impl Version {
    /// Stable means no pre-release or build suffix at all.
    #[must_use]
    pub fn is_stable(&self) -> bool {
        self.suffix.is_empty()
    }

    fn triple(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        // A suffixed tag sorts before the stable release of the same triple.
        self.triple()
            .cmp(&other.triple())
            .then_with(|| match (self.suffix.is_empty(), other.suffix.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => self.suffix.cmp(&other.suffix),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}{}", self.major, self.minor, self.patch, self.suffix)
    }
}

impl FromStr for Version {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProvisionError::InvalidVersion {
            value: s.to_owned(),
        };
        let raw = s.trim().trim_start_matches('v');
        let split = raw.find(['-', '+']).unwrap_or(raw.len());
        let (numbers, suffix) = raw.split_at(split);

        let mut parts = numbers.split('.');
        let mut next = || -> Result<u64, ProvisionError> {
            parts
                .next()
                .filter(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|p| p.parse().ok())
                .ok_or_else(invalid)
        };
        let major = next()?;
        let minor = next()?;
        let patch = next()?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            major,
            minor,
            patch,
            suffix: suffix.to_owned(),
        })
    }
}

/// What the user asked for on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VersionSpec {
    #[default]
    Latest,
    Exact(Version),
}

impl FromStr for VersionSpec {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("latest") {
            Ok(Self::Latest)
        } else {
            s.parse().map(Self::Exact)
        }
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Exact(v) => v.fmt(f),
        }
    }
}

/// Highest stable version among the given tags; unparseable tags are skipped.
#[must_use]
pub fn latest_stable<'a>(tags: impl IntoIterator<Item = &'a str>) -> Option<Version> {
    tags.into_iter()
        .filter_map(|t| t.parse::<Version>().ok())
        .filter(Version::is_stable)
        .max()
}

/// Extract the version from `vault version` / `consul version` output,
/// e.g. `Vault v1.15.2 (abc123), built 2023-11-06` or `Consul v1.17.0`.
#[must_use]
pub fn parse_version_output(output: &str) -> Option<Version> {
    output
        .split_whitespace()
        .filter(|w| w.starts_with('v') && w[1..].starts_with(|c: char| c.is_ascii_digit()))
        .find_map(|w| w.trim_end_matches([',', ')']).parse().ok())
}
