//! Framework-agnostic write endpoint. A web framework adapter maps its
//! request type onto [`ApiRequest`] and writes the returned [`HttpReply`].

use crate::application::idempotency::{HttpReply, IdempotencyGate};
use crate::application::invoices::{CreateInvoiceInput, InvoiceService};
use crate::application::rate_limit::{ClientIdentity, HEADER_API_KEY, RateLimitDecision, RateLimiter};
use crate::domain::idempotency::{endpoint_key, request_hash};
use crate::domain::invoice::{Invoice, InvoiceStatus, PaymentType};
use crate::domain::message::HEADER_REQUEST_ID;
use crate::domain::money::cents_to_amount;
use crate::error::GatewayError;
use chrono::{DateTime, Utc};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

pub const HEADER_IDEMPOTENCY_KEY: &str = "idempotency-key";
pub const INVOICE_PATH: &str = "/invoice";

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub remote_addr: Option<SocketAddr>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: Vec::new(),
            remote_addr: None,
        }
    }

    /// Invalid header names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// Invoice as returned to API clients.
#[derive(Debug, Serialize)]
pub struct InvoiceView {
    pub id: Uuid,
    pub account_id: Uuid,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub status: InvoiceStatus,
    pub description: String,
    pub payment_type: PaymentType,
    pub card_last_digits: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Invoice> for InvoiceView {
    fn from(invoice: &Invoice) -> Self {
        Self {
            id: invoice.id,
            account_id: invoice.account_id,
            amount: cents_to_amount(invoice.amount_cents),
            status: invoice.status,
            description: invoice.description.clone(),
            payment_type: invoice.payment_type,
            card_last_digits: invoice.card_last_digits.clone(),
            created_at: invoice.created_at,
            updated_at: invoice.updated_at,
        }
    }
}

/// `POST /invoice`: rate limit, API key, idempotency, decoding, validation,
/// then creation.
#[derive(Clone)]
pub struct InvoiceEndpoint {
    limiter: Arc<RateLimiter>,
    gate: IdempotencyGate,
    invoices: InvoiceService,
}

impl InvoiceEndpoint {
    pub fn new(limiter: Arc<RateLimiter>, gate: IdempotencyGate, invoices: InvoiceService) -> Self {
        Self {
            limiter,
            gate,
            invoices,
        }
    }

    pub async fn create(&self, request: &ApiRequest) -> HttpReply {
        if let Some(identity) = ClientIdentity::from_request(&request.headers, request.remote_addr)
            && let RateLimitDecision::Limited { retry_after } = self.limiter.check(&identity)
        {
            let seconds = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            let details = BTreeMap::from([("retry_after_seconds", seconds.to_string())]);
            return HttpReply::error_with_details(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "rate limit exceeded",
                Some(&details),
            );
        }

        let Some(api_key) = request.header(HEADER_API_KEY) else {
            return HttpReply::error(StatusCode::UNAUTHORIZED, "api_key_required", "api key required");
        };

        let correlation_id = request
            .header(HEADER_REQUEST_ID)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let endpoint = endpoint_key(&request.method, &request.path);
        let hash = request_hash(&request.body, api_key);

        let outcome = self
            .gate
            .execute(request.header(HEADER_IDEMPOTENCY_KEY), &endpoint, &hash, || {
                self.handle(&request.body, api_key, &correlation_id)
            })
            .await;

        match outcome {
            Ok(outcome) => outcome.into_reply(),
            Err(e) => {
                error!(error = %e, endpoint, "idempotency gate failed");
                internal_error()
            }
        }
    }

    async fn handle(&self, body: &[u8], api_key: &str, correlation_id: &str) -> HttpReply {
        let input: CreateInvoiceInput = match serde_json::from_slice(body) {
            Ok(input) => input,
            Err(e) => {
                warn!(error = %e, "invoice payload rejected");
                return HttpReply::error(
                    StatusCode::BAD_REQUEST,
                    "invalid_payload",
                    "invalid request payload",
                );
            }
        };

        if let Err(details) = input.validate() {
            return HttpReply::error_with_details(
                StatusCode::UNPROCESSABLE_ENTITY,
                "validation_error",
                "validation failed",
                Some(&details),
            );
        }

        match self.invoices.create(&input, api_key, Some(correlation_id)).await {
            Ok(invoice) => HttpReply::json(StatusCode::CREATED, &InvoiceView::from(&invoice)),
            Err(GatewayError::NotFoundError {
                entity: "account", ..
            }) => HttpReply::error(StatusCode::UNAUTHORIZED, "invalid_api_key", "invalid api key"),
            Err(GatewayError::ValidationError(message)) => {
                HttpReply::error(StatusCode::UNPROCESSABLE_ENTITY, "validation_error", &message)
            }
            Err(e) => {
                error!(error = %e, correlation_id, "invoice creation failed");
                internal_error()
            }
        }
    }
}

fn internal_error() -> HttpReply {
    HttpReply::error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "internal server error",
    )
}
