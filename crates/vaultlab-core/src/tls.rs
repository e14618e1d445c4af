//! Ephemeral self-signed TLS material for the lab's Vault listener.
//!
//! A throwaway CA signs one server certificate valid for `localhost` and
//! `127.0.0.1`. Existing material is reused so clients that already trust
//! the CA keep working across restarts; `reset`/`cleanup` wipe it.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose,
};
use tracing::{debug, info};

use crate::error::TlsError;
use crate::paths::LabPaths;
use crate::state;

const CA_COMMON_NAME: &str = "vault-lab CA";
const SERVER_COMMON_NAME: &str = "vault-lab server";
const SERVER_NAMES: [&str; 2] = ["localhost", "127.0.0.1"];

/// Whether a complete set of CA and server files exists.
#[must_use]
pub fn material_present(paths: &LabPaths) -> bool {
    [
        paths.ca_cert(),
        paths.ca_key(),
        paths.server_cert(),
        paths.server_key(),
    ]
    .iter()
    .all(|p| p.is_file())
}

/// Make sure the CA and server certificate exist, generating both if any
/// file is missing. Returns `true` if new material was written.
///
/// # Errors
///
/// Returns [`TlsError`] if generation or a file write fails.
pub fn ensure_material(paths: &LabPaths) -> Result<bool, TlsError> {
    if material_present(paths) {
        debug!(dir = %paths.tls_dir().display(), "reusing existing TLS material");
        return Ok(false);
    }

    let ca_key = KeyPair::generate().map_err(generation)?;
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).map_err(generation)?;
    ca_params.distinguished_name = name(CA_COMMON_NAME);
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let ca_cert = ca_params.self_signed(&ca_key).map_err(generation)?;

    let server_key = KeyPair::generate().map_err(generation)?;
    let mut server_params = CertificateParams::new(
        SERVER_NAMES.iter().map(|s| (*s).to_owned()).collect::<Vec<_>>(),
    )
    .map_err(generation)?;
    server_params.distinguished_name = name(SERVER_COMMON_NAME);
    server_params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    server_params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .map_err(generation)?;

    write(&paths.ca_cert(), &ca_cert.pem(), false)?;
    write(&paths.ca_key(), &ca_key.serialize_pem(), true)?;
    write(&paths.server_cert(), &server_cert.pem(), false)?;
    write(&paths.server_key(), &server_key.serialize_pem(), true)?;

    info!(ca = %paths.ca_cert().display(), "generated lab TLS certificates");
    Ok(true)
}

fn name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "vault-lab");
    dn
}

fn write(path: &std::path::Path, pem: &str, private: bool) -> Result<(), TlsError> {
    state::write_atomic(path, pem.as_bytes(), private).map_err(TlsError::io(path))
}

#[allow(clippy::needless_pass_by_value)]
fn generation(e: rcgen::Error) -> TlsError {
    TlsError::Generation {
        reason: e.to_string(),
    }
}
