use crate::domain::idempotency::{DEFAULT_IDEMPOTENCY_TTL_HOURS, IdempotencyRecord};
use crate::domain::ports::IdempotencyStoreRef;
use crate::error::{GatewayError, Result};
use chrono::Utc;
use http::StatusCode;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use tracing::{debug, error, warn};

/// A response as the gate stores and replays it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a BTreeMap<&'static str, String>>,
}

impl HttpReply {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::new(status, body),
            Err(e) => {
                error!(error = %e, "response not serializable");
                Self::error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal server error")
            }
        }
    }

    pub fn error(status: StatusCode, code: &str, message: &str) -> Self {
        Self::error_with_details(status, code, message, None)
    }

    pub fn error_with_details(
        status: StatusCode,
        code: &str,
        message: &str,
        details: Option<&BTreeMap<&'static str, String>>,
    ) -> Self {
        let body = ErrorBody {
            code,
            message,
            details,
        };
        // An ErrorBody of plain strings always serializes.
        Self::new(status, serde_json::to_vec(&body).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    /// The key was used before with a different request.
    PayloadMismatch,
    /// The first request with this key has not finished.
    InProgress,
}

impl Conflict {
    pub fn reply(&self) -> HttpReply {
        match self {
            Self::PayloadMismatch => HttpReply::error(
                StatusCode::CONFLICT,
                "idempotency_conflict",
                "idempotency key payload mismatch",
            ),
            Self::InProgress => HttpReply::error(
                StatusCode::CONFLICT,
                "idempotency_in_progress",
                "request with this idempotency key is still processing",
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// The handler ran for this request.
    Executed(HttpReply),
    /// A completed response was returned without running the handler.
    Replayed(HttpReply),
    Conflict(Conflict),
}

impl GateOutcome {
    pub fn into_reply(self) -> HttpReply {
        match self {
            Self::Executed(reply) | Self::Replayed(reply) => reply,
            Self::Conflict(conflict) => conflict.reply(),
        }
    }
}

/// Runs a write handler at most once per (idempotency key, endpoint).
#[derive(Clone)]
pub struct IdempotencyGate {
    store: IdempotencyStoreRef,
    ttl: chrono::Duration,
}

impl IdempotencyGate {
    pub fn new(store: IdempotencyStoreRef) -> Self {
        Self {
            store,
            ttl: chrono::Duration::hours(DEFAULT_IDEMPOTENCY_TTL_HOURS),
        }
    }

    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Guards `handler` with `key`. Without a key the handler always runs.
    ///
    /// Store failures before the handler runs are returned as errors; the
    /// handler has not run in that case.
    pub async fn execute<F, Fut>(
        &self,
        key: Option<&str>,
        endpoint: &str,
        request_hash: &str,
        handler: F,
    ) -> Result<GateOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = HttpReply>,
    {
        let Some(key) = key.map(str::trim).filter(|k| !k.is_empty()) else {
            return Ok(GateOutcome::Executed(handler().await));
        };

        match self.store.delete_expired(Utc::now()).await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "expired idempotency keys purged"),
            Err(e) => warn!(error = %e, "idempotency purge failed"),
        }

        if let Some(existing) = self.store.get(key, endpoint).await? {
            if existing.is_expired(Utc::now()) {
                self.store.delete(key, endpoint).await?;
            } else {
                return decide(&existing, request_hash);
            }
        }

        let record = IdempotencyRecord::processing(key, endpoint, request_hash, self.ttl);
        if !self.store.create_processing(record).await? {
            return match self.store.get(key, endpoint).await? {
                Some(existing) => decide(&existing, request_hash),
                None => Ok(GateOutcome::Conflict(Conflict::InProgress)),
            };
        }

        let reply = handler().await;
        if reply.status.is_server_error() {
            self.release(key, endpoint).await;
        } else if let Err(e) = self
            .store
            .complete(key, endpoint, reply.status.as_u16(), reply.body.clone())
            .await
        {
            error!(error = %e, key, endpoint, "idempotent response not stored");
            self.release(key, endpoint).await;
        }

        Ok(GateOutcome::Executed(reply))
    }

    async fn release(&self, key: &str, endpoint: &str) {
        if let Err(e) = self.store.delete(key, endpoint).await {
            error!(error = %e, key, endpoint, "idempotency key not released");
        }
    }
}

fn decide(existing: &IdempotencyRecord, request_hash: &str) -> Result<GateOutcome> {
    if existing.request_hash != request_hash {
        return Ok(GateOutcome::Conflict(Conflict::PayloadMismatch));
    }
    if !existing.is_completed() {
        return Ok(GateOutcome::Conflict(Conflict::InProgress));
    }

    let code = existing.status_code.unwrap_or(StatusCode::OK.as_u16());
    let status = StatusCode::from_u16(code)
        .map_err(|e| GatewayError::StoreError(format!("Invalid cached status {code}: {e}")))?;
    Ok(GateOutcome::Replayed(HttpReply::new(
        status,
        existing.response_body.clone().unwrap_or_default(),
    )))
}
