use crate::config::NodeConfigIdentity;
use anyhow::{Context, Result, bail};
use data_encoding::{BASE64URL_NOPAD, HEXLOWER_PERMISSIVE};
use iroh::SecretKey;
use std::path::{Path, PathBuf};

/// Resolves `path` against the directory of the config file.
pub fn resolve_path(path: &str, config_dir: Option<&Path>) -> PathBuf {
    let path = Path::new(path);
    match config_dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}

/// Load the node's secret key from config.
///
/// The peer id of a replica is derived from this key, so a node without
/// one cannot take part in a cluster and this is an error.
pub fn load_secret_key(
    identity: &NodeConfigIdentity,
    config_dir: Option<&Path>,
) -> Result<SecretKey> {
    if let Some(s) = &identity.secret_key {
        return parse_secret_key_string(s).context("invalid inline secret_key");
    }
    let Some(path) = &identity.secret_key_file else {
        bail!("node config has neither secret_key nor secret_key_file");
    };
    let resolved = resolve_path(path, config_dir);
    let bytes = std::fs::read(&resolved)
        .with_context(|| format!("failed to read secret key file {}", resolved.display()))?;
    if let Ok(s) = std::str::from_utf8(&bytes)
        && let Some(sk) = parse_secret_key_string(s)
    {
        return Ok(sk);
    }
    parse_secret_key_bytes(&bytes)
        .with_context(|| format!("no 32 byte secret key in {}", resolved.display()))
}

pub fn parse_secret_key_string(s: &str) -> Option<SecretKey> {
    let s = s.trim().as_bytes();
    if let Ok(bytes) = HEXLOWER_PERMISSIVE.decode(s)
        && let Some(sk) = parse_secret_key_bytes(&bytes)
    {
        return Some(sk);
    }
    if let Ok(bytes) = BASE64URL_NOPAD.decode(s)
        && let Some(sk) = parse_secret_key_bytes(&bytes)
    {
        return Some(sk);
    }
    None
}

pub fn parse_secret_key_bytes(bytes: &[u8]) -> Option<SecretKey> {
    let arr: [u8; 32] = bytes.try_into().ok()?;
    Some(SecretKey::from_bytes(&arr))
}
