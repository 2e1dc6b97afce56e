//! Node identity and private-network key material.
//!
//! Identity precedence: base64 option > key file > fresh ephemeral key. The
//! key file is created on first use with owner-only permissions. PSK and CA
//! material never degrade: malformed input fails host construction.

use crate::config::IdentityOptions;
use crate::types::NetworkError;
use base64::Engine as _;
use libp2p::identity::Keypair;
use libp2p::pnet::PreSharedKey;
use std::fs;
use std::path::Path;

/// First line of the libp2p v1 PSK file format.
const PSK_HEADER: &str = "/key/swarm/psk/1.0.0/";
/// Encoding line of the libp2p v1 PSK file format.
const PSK_ENCODING: &str = "/base16/";

/// Load the node keypair according to the configured precedence.
pub fn load_or_create_keypair(options: &IdentityOptions) -> Result<Keypair, NetworkError> {
    if let Some(encoded) = options.key_base64.as_deref() {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| {
                NetworkError::HostBuildFailed(format!("p2p.identity.key_base64 is not base64: {e}"))
            })?;
        return Keypair::from_protobuf_encoding(&bytes).map_err(|e| {
            NetworkError::HostBuildFailed(format!(
                "p2p.identity.key_base64 does not decode to a libp2p keypair: {e}"
            ))
        });
    }

    if let Some(path) = options.key_file.as_deref() {
        return load_or_create_key_file(path);
    }

    tracing::debug!("no identity source configured, using an ephemeral key");
    Ok(Keypair::generate_ed25519())
}

fn load_or_create_key_file(path: &Path) -> Result<Keypair, NetworkError> {
    if path.exists() {
        let bytes = fs::read(path).map_err(|e| {
            NetworkError::HostBuildFailed(format!(
                "p2p.identity.key_file {}: unreadable: {e}",
                path.display()
            ))
        })?;
        return Keypair::from_protobuf_encoding(&bytes).map_err(|e| {
            NetworkError::HostBuildFailed(format!(
                "p2p.identity.key_file {}: not a serialized libp2p keypair: {e}",
                path.display()
            ))
        });
    }

    let keypair = Keypair::generate_ed25519();
    let bytes = keypair
        .to_protobuf_encoding()
        .map_err(|e| NetworkError::HostBuildFailed(format!("keypair encoding failed: {e}")))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            NetworkError::HostBuildFailed(format!(
                "cannot create identity key directory {}: {e}",
                parent.display()
            ))
        })?;
    }
    fs::write(path, &bytes).map_err(|e| {
        NetworkError::HostBuildFailed(format!(
            "cannot write identity key file {}: {e}",
            path.display()
        ))
    })?;
    restrict_permissions(path)?;
    tracing::info!(path = %path.display(), "created node identity key file");
    Ok(keypair)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), NetworkError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| {
        NetworkError::HostBuildFailed(format!(
            "cannot restrict identity key permissions on {}: {e}",
            path.display()
        ))
    })
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), NetworkError> {
    Ok(())
}

/// Load a pre-shared key from the libp2p v1 PSK text format.
///
/// The file must contain exactly the header line, the `/base16/` encoding
/// line and 64 hex characters (32 bytes). Anything else fails construction.
pub fn load_psk(path: &Path) -> Result<PreSharedKey, NetworkError> {
    let content = fs::read_to_string(path).map_err(|e| {
        NetworkError::HostBuildFailed(format!("p2p.psk_path {}: unreadable: {e}", path.display()))
    })?;
    parse_psk(&content).map_err(|reason| {
        NetworkError::HostBuildFailed(format!(
            "p2p.psk_path {}: {reason}; regenerate the file in libp2p v1 PSK format",
            path.display()
        ))
    })
}

fn parse_psk(content: &str) -> Result<PreSharedKey, String> {
    let mut lines = content.lines().map(str::trim).filter(|l| !l.is_empty());
    match lines.next() {
        Some(PSK_HEADER) => {}
        other => return Err(format!("expected header {PSK_HEADER:?}, found {other:?}")),
    }
    match lines.next() {
        Some(PSK_ENCODING) => {}
        other => return Err(format!("expected encoding {PSK_ENCODING:?}, found {other:?}")),
    }
    let hex_line = lines.next().ok_or("missing key line")?;
    if lines.next().is_some() {
        return Err("trailing content after key line".into());
    }
    let bytes = hex::decode(hex_line).map_err(|e| format!("key line is not hex: {e}"))?;
    let key: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| format!("key is {} bytes, expected exactly 32", bytes.len()))?;
    Ok(PreSharedKey::new(key))
}
