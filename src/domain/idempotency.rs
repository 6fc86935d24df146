use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How long a reserved key is honored before it may be reused.
pub const DEFAULT_IDEMPOTENCY_TTL_HOURS: i64 = 24;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyStatus {
    Processing,
    Completed,
}

/// A reserved (key, endpoint) pair and, once completed, the response that
/// later requests with the same key receive.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct IdempotencyRecord {
    pub key: String,
    pub endpoint: String,
    pub request_hash: String,
    pub status: IdempotencyStatus,
    pub status_code: Option<u16>,
    pub response_body: Option<Vec<u8>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn processing(
        key: impl Into<String>,
        endpoint: impl Into<String>,
        request_hash: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            endpoint: endpoint.into(),
            request_hash: request_hash.into(),
            status: IdempotencyStatus::Processing,
            status_code: None,
            response_body: None,
            expires_at: now + ttl,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_completed(&self) -> bool {
        self.status == IdempotencyStatus::Completed
    }

    pub fn complete(&mut self, status_code: u16, body: Vec<u8>) {
        self.status = IdempotencyStatus::Completed;
        self.status_code = Some(status_code);
        self.response_body = Some(body);
        self.updated_at = Utc::now();
    }
}

/// Fingerprint of a request: hex SHA-256 over the body followed by the
/// caller's credential, so equal bodies from different callers differ.
pub fn request_hash(body: &[u8], credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hasher.update(credential.as_bytes());
    hex::encode(hasher.finalize())
}

/// Scope of a key, e.g. `POST:/invoice`.
pub fn endpoint_key(method: &http::Method, path: &str) -> String {
    format!("{}:{}", method.as_str(), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_hash_depends_on_credential() {
        let body = br#"{"amount":10}"#;
        assert_eq!(request_hash(body, "k1"), request_hash(body, "k1"));
        assert_ne!(request_hash(body, "k1"), request_hash(body, "k2"));
        assert_ne!(request_hash(body, "k1"), request_hash(b"{}", "k1"));
        assert_eq!(request_hash(body, "k1").len(), 64);
    }

    #[test]
    fn test_endpoint_key() {
        assert_eq!(endpoint_key(&http::Method::POST, "/invoice"), "POST:/invoice");
    }

    #[test]
    fn test_record_expiry() {
        let record = IdempotencyRecord::processing("k", "POST:/invoice", "h", Duration::hours(24));
        assert!(!record.is_expired(Utc::now()));
        assert!(record.is_expired(Utc::now() + Duration::hours(25)));
        assert!(!record.is_completed());
    }
}
