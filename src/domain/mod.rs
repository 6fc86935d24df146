//! Domain layer: entities, wire contracts and the ports infrastructure
//! implements.

pub mod account;
pub mod audit;
pub mod credentials;
pub mod events;
pub mod idempotency;
pub mod invoice;
pub mod message;
pub mod money;
pub mod outbox;
pub mod ports;
