//! Application layer: the settlement pipeline's moving parts.
//!
//! The relay, the consumer and the replayer are long-running loops over the
//! ports in `domain::ports`; the gate and the rate limiter guard the write
//! path in front of `InvoiceService`.

pub mod accounts;
pub mod consumer;
pub mod idempotency;
pub mod invoices;
pub mod rate_limit;
pub mod relay;
pub mod replay;
pub mod retry;
