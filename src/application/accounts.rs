use crate::domain::account::Account;
use crate::domain::credentials::{ApiKeyHasher, generate_api_key};
use crate::domain::ports::LedgerStoreRef;
use crate::error::{GatewayError, Result};
use std::sync::Arc;
use tracing::info;

/// Registers merchant accounts and resolves them from API keys.
#[derive(Clone)]
pub struct AccountService {
    ledger: LedgerStoreRef,
    hasher: Arc<ApiKeyHasher>,
}

impl AccountService {
    pub fn new(ledger: LedgerStoreRef, hasher: Arc<ApiKeyHasher>) -> Self {
        Self { ledger, hasher }
    }

    /// Creates an account and returns it with its plain API key. The key is
    /// not recoverable afterwards.
    pub async fn register(&self, name: &str, email: &str) -> Result<(Account, String)> {
        let name = name.trim();
        let email = email.trim();
        if name.is_empty() {
            return Err(GatewayError::ValidationError("name is required".to_string()));
        }
        if !is_plausible_email(email) {
            return Err(GatewayError::ValidationError("invalid email".to_string()));
        }

        let api_key = generate_api_key();
        let account = Account::new(name, email, self.hasher.hash_active(&api_key)?);
        self.ledger.create_account(account.clone()).await?;
        info!(account_id = %account.id, version = %account.api_key_version, "account registered");
        Ok((account, api_key))
    }

    /// Finds the account owning `api_key` under any configured secret
    /// version.
    pub async fn authenticate(&self, api_key: &str) -> Result<Account> {
        for candidate in self.hasher.candidates(api_key)? {
            if let Some(account) = self
                .ledger
                .find_account_by_api_key(&candidate.hash, &candidate.version)
                .await?
            {
                return Ok(account);
            }
        }
        Err(GatewayError::not_found("account", "api key"))
    }
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.contains('@')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::in_memory::InMemoryStore;
    use std::collections::BTreeMap;

    fn hasher(active: &str) -> Arc<ApiKeyHasher> {
        let secrets = BTreeMap::from([
            ("v1".to_string(), "first-secret".to_string()),
            ("v2".to_string(), "second-secret".to_string()),
        ]);
        Arc::new(ApiKeyHasher::new(active, secrets).unwrap())
    }

    #[tokio::test]
    async fn test_register_and_authenticate() {
        let store = Arc::new(InMemoryStore::new());
        let service = AccountService::new(store, hasher("v1"));

        let (account, api_key) = service.register("Shop", "shop@example.com").await.unwrap();
        let found = service.authenticate(&api_key).await.unwrap();
        assert_eq!(found.id, account.id);

        let err = service.authenticate("not-a-key").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFoundError { entity: "account", .. }));
    }

    #[tokio::test]
    async fn test_authenticate_after_secret_rotation() {
        let store = Arc::new(InMemoryStore::new());
        let before = AccountService::new(store.clone(), hasher("v1"));
        let (account, api_key) = before.register("Shop", "shop@example.com").await.unwrap();

        let after = AccountService::new(store, hasher("v2"));
        assert_eq!(after.authenticate(&api_key).await.unwrap().id, account.id);
    }

    #[tokio::test]
    async fn test_register_validates_input() {
        let service = AccountService::new(Arc::new(InMemoryStore::new()), hasher("v1"));
        assert!(service.register(" ", "shop@example.com").await.is_err());
        assert!(service.register("Shop", "shop.example.com").await.is_err());
    }
}
