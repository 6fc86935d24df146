pub mod bus;
pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;

use crate::domain::ports::{
    IdempotencyStore, IdempotencyStoreRef, LedgerStore, LedgerStoreRef, OutboxStore,
    OutboxStoreRef, ProcessedEventStore, ProcessedEventStoreRef, ReplayAuditStore,
    ReplayAuditStoreRef,
};
use crate::error::Result;
use in_memory::InMemoryStore;
use std::path::Path;
use std::sync::Arc;

/// Every store port, backed by one shared backend.
#[derive(Clone)]
pub struct Stores {
    pub ledger: LedgerStoreRef,
    pub outbox: OutboxStoreRef,
    pub processed: ProcessedEventStoreRef,
    pub idempotency: IdempotencyStoreRef,
    pub audits: ReplayAuditStoreRef,
}

impl Stores {
    pub fn from_backend<S>(store: Arc<S>) -> Self
    where
        S: LedgerStore + OutboxStore + ProcessedEventStore + IdempotencyStore + ReplayAuditStore + 'static,
    {
        Self {
            ledger: store.clone(),
            outbox: store.clone(),
            processed: store.clone(),
            idempotency: store.clone(),
            audits: store,
        }
    }

    pub fn in_memory() -> Self {
        Self::from_backend(Arc::new(InMemoryStore::new()))
    }

    /// RocksDB at `db_path` when given, otherwise in memory.
    pub fn open(db_path: Option<&Path>) -> Result<Self> {
        match db_path {
            #[cfg(feature = "storage-rocksdb")]
            Some(path) => Ok(Self::from_backend(Arc::new(self::rocksdb::RocksDBStore::open(path)?))),
            #[cfg(not(feature = "storage-rocksdb"))]
            Some(path) => Err(crate::error::GatewayError::ConfigError(format!(
                "Cannot open {}: built without the storage-rocksdb feature",
                path.display()
            ))),
            None => Ok(Self::in_memory()),
        }
    }
}
