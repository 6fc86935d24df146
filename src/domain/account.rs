use crate::domain::credentials::HashedApiKey;
use crate::error::{GatewayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A merchant account receiving settled invoice amounts.
///
/// The balance is only ever credited, either by settlement of an approved
/// invoice or by an explicit atomic increment through the ledger store.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    /// Balance in minor currency units.
    pub balance_cents: i64,
    /// HMAC digest of the API key; the plain key is never stored.
    pub api_key_hash: String,
    /// Secret version the digest was produced with.
    pub api_key_version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(name: impl Into<String>, email: impl Into<String>, credential: HashedApiKey) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            email: email.into(),
            balance_cents: 0,
            api_key_hash: credential.hash,
            api_key_version: credential.version,
            created_at: now,
            updated_at: now,
        }
    }

    /// Credits the balance. On overflow the account is left unchanged.
    pub fn credit(&mut self, amount_cents: i64) -> Result<()> {
        self.balance_cents = self
            .balance_cents
            .checked_add(amount_cents)
            .ok_or_else(|| GatewayError::ValidationError("Balance overflow".to_string()))?;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn matches_credential(&self, hash: &str, version: &str) -> bool {
        self.api_key_hash == hash && self.api_key_version == version
    }
}
