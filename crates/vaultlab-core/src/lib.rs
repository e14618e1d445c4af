//! Core library for `vault-lab`.
//!
//! Drives disposable local HashiCorp Vault labs: downloads release
//! binaries, renders server configs, supervises the server processes,
//! initializes and unseals Vault, enables a set of demo engines and auth
//! methods, and keeps checksummed backups of the lab's state. Vault and
//! Consul themselves are opaque executables reached over their HTTP APIs.
//!
//! [`lifecycle::Lab`] is the entry point; every other module is a
//! component it sequences.

pub mod backup;
pub mod client;
pub mod config;
pub mod error;
pub mod features;
pub mod hcl;
pub mod init;
pub mod lifecycle;
pub mod lock;
pub mod paths;
pub mod procfs;
pub mod provision;
pub mod state;
pub mod supervisor;
pub mod tls;
pub mod version;
