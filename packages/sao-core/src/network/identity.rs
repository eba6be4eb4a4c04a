//! Persistent node identity.

use std::path::Path;

use libp2p::identity::Keypair;

use crate::error::{Error, Result};

/// Load the node keypair from `path`, generating and saving an ed25519
/// keypair on first use
pub fn load_or_generate_keypair(path: &Path) -> Result<Keypair> {
    if path.exists() {
        let bytes = std::fs::read(path)?;
        let keypair = Keypair::from_protobuf_encoding(&bytes).map_err(|e| {
            Error::Config(format!("invalid node key {}: {}", path.display(), e))
        })?;
        tracing::debug!(peer_id = %keypair.public().to_peer_id(), "Loaded node key");
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    let bytes = keypair
        .to_protobuf_encoding()
        .map_err(|e| Error::Internal(format!("Failed to encode node key: {}", e)))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    restrict_permissions(path)?;

    tracing::info!(peer_id = %keypair.public().to_peer_id(), "Generated node key");
    Ok(keypair)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
