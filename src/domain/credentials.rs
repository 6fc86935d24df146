use crate::error::{GatewayError, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

/// An API key digest together with the secret version that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedApiKey {
    pub hash: String,
    pub version: String,
}

/// Hashes API credentials with versioned HMAC secrets.
///
/// New credentials are hashed with the active version; lookups try every
/// configured version so secrets can rotate without invalidating keys.
/// Constructed once at startup and shared by reference.
#[derive(Debug, Clone)]
pub struct ApiKeyHasher {
    active_version: String,
    secrets: BTreeMap<String, String>,
}

impl ApiKeyHasher {
    pub fn new(active_version: impl Into<String>, secrets: BTreeMap<String, String>) -> Result<Self> {
        let active_version = active_version.into();
        if !secrets.contains_key(&active_version) {
            return Err(GatewayError::ConfigError(format!(
                "Active API key version {active_version} has no secret"
            )));
        }
        Ok(Self {
            active_version,
            secrets,
        })
    }

    /// Parses `version:secret` pairs separated by commas, e.g. `v1:abc,v2:def`.
    pub fn parse(pairs: &str, active_version: &str) -> Result<Self> {
        let mut secrets = BTreeMap::new();
        for pair in pairs.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match pair.split_once(':') {
                Some((version, secret)) if !version.is_empty() && !secret.is_empty() => {
                    secrets.insert(version.to_string(), secret.to_string());
                }
                _ => {
                    return Err(GatewayError::ConfigError(
                        "Invalid API key secrets format".to_string(),
                    ));
                }
            }
        }
        Self::new(active_version, secrets)
    }

    pub fn active_version(&self) -> &str {
        &self.active_version
    }

    pub fn hash_active(&self, api_key: &str) -> Result<HashedApiKey> {
        let secret = self
            .secrets
            .get(&self.active_version)
            .ok_or_else(|| GatewayError::ConfigError("Active API key secret missing".to_string()))?;
        Ok(HashedApiKey {
            hash: hash_with_secret(api_key, secret)?,
            version: self.active_version.clone(),
        })
    }

    /// Digests of `api_key` under every configured version, active first.
    pub fn candidates(&self, api_key: &str) -> Result<Vec<HashedApiKey>> {
        let mut hashes = vec![self.hash_active(api_key)?];
        for (version, secret) in &self.secrets {
            if version != &self.active_version {
                hashes.push(HashedApiKey {
                    hash: hash_with_secret(api_key, secret)?,
                    version: version.clone(),
                });
            }
        }
        Ok(hashes)
    }
}

fn hash_with_secret(api_key: &str, secret: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::ConfigError(format!("Invalid API key secret: {e}")))?;
    mac.update(api_key.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Generates a fresh 128-bit API key, hex encoded.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
