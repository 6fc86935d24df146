use crate::application::accounts::AccountService;
use crate::domain::events::{PENDING_TRANSACTION_EVENT, PendingTransaction};
use crate::domain::invoice::{Invoice, PaymentType, REVIEW_THRESHOLD_CENTS};
use crate::domain::money::amount_to_cents;
use crate::domain::ports::LedgerStoreRef;
use crate::error::{GatewayError, Result};
use chrono::{Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, instrument};

/// Field name to human readable problem.
pub type FieldErrors = BTreeMap<&'static str, String>;

/// Body of an invoice creation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CreateInvoiceInput {
    pub amount: Decimal,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub payment_type: String,
    #[serde(default)]
    pub card_number: String,
    #[serde(default)]
    pub cvv: String,
    #[serde(default)]
    pub expiry_month: u32,
    #[serde(default)]
    pub expiry_year: i32,
    #[serde(default)]
    pub cardholder_name: String,
}

impl CreateInvoiceInput {
    pub fn validate(&self) -> std::result::Result<(), FieldErrors> {
        self.validate_on(Utc::now().date_naive())
    }

    /// Validates against `today` for the card expiry check.
    pub fn validate_on(&self, today: NaiveDate) -> std::result::Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();

        if self.amount <= Decimal::ZERO {
            errors.insert("amount", "amount must be greater than zero".into());
        }
        if self.description.trim().is_empty() {
            errors.insert("description", "description is required".into());
        }

        match self.payment_type.trim() {
            "" => {
                errors.insert("payment_type", "payment_type is required".into());
            }
            "credit_card" => self.validate_card(today, &mut errors),
            "boleto" => {}
            _ => {
                errors.insert("payment_type", "payment_type must be credit_card or boleto".into());
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_card(&self, today: NaiveDate, errors: &mut FieldErrors) {
        let card_len = self.card_number.chars().count();
        if !(12..=19).contains(&card_len) {
            errors.insert("card_number", "card_number must have 12 to 19 digits".into());
        } else if !is_digits(&self.card_number) {
            errors.insert("card_number", "card_number must contain only digits".into());
        }

        let cvv_len = self.cvv.chars().count();
        if !(3..=4).contains(&cvv_len) {
            errors.insert("cvv", "cvv must have 3 to 4 digits".into());
        } else if !is_digits(&self.cvv) {
            errors.insert("cvv", "cvv must contain only digits".into());
        }

        if !(1..=12).contains(&self.expiry_month) {
            errors.insert("expiry_month", "expiry_month must be between 1 and 12".into());
        }
        if self.expiry_year < today.year()
            || (self.expiry_year == today.year() && self.expiry_month < today.month())
        {
            errors.insert("expiry_year", "card expired".into());
        }

        if self.cardholder_name.trim().is_empty() {
            errors.insert("cardholder_name", "cardholder_name is required".into());
        }
    }

    fn payment_type(&self) -> Result<PaymentType> {
        match self.payment_type.trim() {
            "credit_card" => Ok(PaymentType::CreditCard),
            "boleto" => Ok(PaymentType::Boleto),
            other => Err(GatewayError::ValidationError(format!(
                "Unknown payment type: {other}"
            ))),
        }
    }
}

fn is_digits(value: &str) -> bool {
    value.chars().all(|c| c.is_ascii_digit())
}

/// Creates invoices, deciding on the spot whether they need antifraud review.
#[derive(Clone)]
pub struct InvoiceService {
    ledger: LedgerStoreRef,
    accounts: AccountService,
    review_threshold_cents: i64,
}

impl InvoiceService {
    pub fn new(ledger: LedgerStoreRef, accounts: AccountService) -> Self {
        Self {
            ledger,
            accounts,
            review_threshold_cents: REVIEW_THRESHOLD_CENTS,
        }
    }

    pub fn with_review_threshold(mut self, threshold_cents: i64) -> Self {
        self.review_threshold_cents = threshold_cents;
        self
    }

    /// Invoices above the review threshold are stored pending with their
    /// review request staged in the outbox. The rest are approved and
    /// credited in the same write.
    #[instrument(skip(self, input, api_key), fields(correlation_id = correlation_id.unwrap_or_default()))]
    pub async fn create(
        &self,
        input: &CreateInvoiceInput,
        api_key: &str,
        correlation_id: Option<&str>,
    ) -> Result<Invoice> {
        let account = self.accounts.authenticate(api_key).await?;
        let amount_cents = amount_to_cents(input.amount)?;
        let card_number = Some(input.card_number.as_str()).filter(|n| !n.is_empty());

        let mut invoice = Invoice::new(
            account.id,
            amount_cents,
            input.description.trim(),
            input.payment_type()?,
            card_number,
        )?;
        invoice.triage(self.review_threshold_cents);

        if invoice.requires_review(self.review_threshold_cents) {
            let payload = PendingTransaction::for_invoice(&invoice).encode()?;
            let staged = self
                .ledger
                .create_with_outbox(invoice.clone(), PENDING_TRANSACTION_EVENT, payload, correlation_id)
                .await?;
            info!(invoice_id = %invoice.id, outbox_id = %staged.id, amount_cents, "invoice held for review");
        } else {
            self.ledger.create(invoice.clone(), correlation_id).await?;
            info!(invoice_id = %invoice.id, amount_cents, "invoice approved");
        }

        Ok(invoice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn card_input() -> CreateInvoiceInput {
        CreateInvoiceInput {
            amount: dec!(150.00),
            description: "headphones".into(),
            payment_type: "credit_card".into(),
            card_number: "4111111111111111".into(),
            cvv: "123".into(),
            expiry_month: 12,
            expiry_year: 2030,
            cardholder_name: "Ana Lima".into(),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 6, 15).unwrap()
    }

    #[test]
    fn test_valid_card_input() {
        assert!(card_input().validate_on(today()).is_ok());
    }

    #[test]
    fn test_boleto_skips_card_checks() {
        let input = CreateInvoiceInput {
            payment_type: "boleto".into(),
            card_number: String::new(),
            cvv: String::new(),
            ..card_input()
        };
        assert!(input.validate_on(today()).is_ok());
    }

    #[test]
    fn test_invalid_fields_are_reported_together() {
        let input = CreateInvoiceInput {
            amount: dec!(0),
            card_number: "4111-1111-1111".into(),
            cvv: "12".into(),
            expiry_month: 13,
            cardholder_name: " ".into(),
            ..card_input()
        };
        let errors = input.validate_on(today()).unwrap_err();
        assert_eq!(errors["amount"], "amount must be greater than zero");
        assert_eq!(errors["card_number"], "card_number must contain only digits");
        assert_eq!(errors["cvv"], "cvv must have 3 to 4 digits");
        assert_eq!(errors["expiry_month"], "expiry_month must be between 1 and 12");
        assert!(errors.contains_key("cardholder_name"));
    }

    #[test]
    fn test_expired_card() {
        let input = CreateInvoiceInput {
            expiry_month: 5,
            expiry_year: 2026,
            ..card_input()
        };
        let errors = input.validate_on(today()).unwrap_err();
        assert_eq!(errors["expiry_year"], "card expired");
    }

    #[test]
    fn test_unknown_payment_type() {
        let input = CreateInvoiceInput {
            payment_type: "pix".into(),
            ..card_input()
        };
        let errors = input.validate_on(today()).unwrap_err();
        assert_eq!(errors["payment_type"], "payment_type must be credit_card or boleto");
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let raw = r#"{"amount": 10, "description": "x", "payment_type": "boleto", "tip": 1}"#;
        assert!(serde_json::from_str::<CreateInvoiceInput>(raw).is_err());
    }
}
