//! Persisted iroh secret key for the relay identity (spec.md §6
//! `relay.key`). Grounded on `goop-peer::node`'s
//! `load_or_create_iroh_key`: hex-encoded 32 random bytes on first run,
//! read back verbatim after that.

use std::path::Path;

use rand::RngCore;

pub fn load_or_create(path: &Path) -> anyhow::Result<iroh::SecretKey> {
    if path.exists() {
        let hex_str = std::fs::read_to_string(path)?;
        hex_str.trim().parse().map_err(|e| anyhow::anyhow!("invalid relay key at {}: {e}", path.display()))
    } else {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let key = iroh::SecretKey::from_bytes(&bytes);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let hex_str: String = key.to_bytes().iter().map(|b| format!("{b:02x}")).collect();
        std::fs::write(path, &hex_str)?;
        tracing::info!(path = %path.display(), "generated new relay identity key");
        Ok(key)
    }
}
