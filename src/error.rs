use crate::domain::invoice::InvoiceStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("{entity} not found: {id}")]
    NotFoundError { entity: &'static str, id: String },
    #[error("Invalid status transition from {from} to {to}")]
    InvalidStateTransition {
        from: InvoiceStatus,
        to: InvoiceStatus,
    },
    #[error("Store error: {0}")]
    StoreError(String),
    #[error("Transport error: {0}")]
    TransportError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
}

impl GatewayError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFoundError {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether a caller may try the same operation again and expect a
    /// different result.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreError(_) | Self::TransportError(_) | Self::NotFoundError { .. } => true,
            Self::IoError(_) => true,
            #[cfg(feature = "storage-rocksdb")]
            Self::RocksDb(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(GatewayError::StoreError("lock timeout".into()).is_retryable());
        assert!(GatewayError::not_found("account", "a-1").is_retryable());
        assert!(!GatewayError::ValidationError("bad".into()).is_retryable());
        assert!(
            !GatewayError::InvalidStateTransition {
                from: InvoiceStatus::Approved,
                to: InvoiceStatus::Rejected,
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_not_found_message() {
        let err = GatewayError::not_found("invoice", "abc");
        assert_eq!(err.to_string(), "invoice not found: abc");
    }
}
