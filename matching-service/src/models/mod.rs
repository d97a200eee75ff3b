//! Domain models for matching-service.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Transaction Models
// ============================================================================

/// A bank transaction imported from a statement feed.
///
/// Amounts are stored in minor units (cents for two-exponent currencies) so
/// equality checks never depend on floating point.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Transaction {
    pub transaction_id: Uuid,
    pub team_id: Uuid,
    pub bank_account_id: Uuid,
    pub amount_minor: i64,
    pub currency: String,
    pub transaction_date: NaiveDate,
    pub counterparty_name: Option<String>,
    pub raw_description: String,
    pub matched_document_id: Option<Uuid>,
    pub match_confidence: Option<f64>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Transaction {
    /// Signed amount in major units, derived from the minor-unit storage.
    pub fn amount_major(&self) -> Decimal {
        minor_to_major(self.amount_minor, &self.currency)
    }

    /// The name used for counterparty comparison. Falls back to the raw
    /// statement description when no structured name was extracted.
    pub fn counterparty_text(&self) -> &str {
        match self.counterparty_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.raw_description,
        }
    }
}

// ============================================================================
// Inbox Document Models
// ============================================================================

/// Lifecycle states for an inbox document.
///
/// `new` and `analyzing` are upstream extraction states; the matcher only
/// operates on documents that reached `pending` or later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    New,
    Analyzing,
    Pending,
    SuggestedMatch,
    Done,
    NoMatch,
    Other,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Analyzing => "analyzing",
            Self::Pending => "pending",
            Self::SuggestedMatch => "suggested_match",
            Self::Done => "done",
            Self::NoMatch => "no_match",
            Self::Other => "other",
        }
    }

    /// Parses a stored status string. Unknown values are rejected rather
    /// than coerced to a default so corrupt rows surface as errors.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "analyzing" => Some(Self::Analyzing),
            "pending" => Some(Self::Pending),
            "suggested_match" => Some(Self::SuggestedMatch),
            "done" => Some(Self::Done),
            "no_match" => Some(Self::NoMatch),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbox document (receipt, invoice, statement page) with fields
/// extracted upstream. Every extracted field is optional; extraction can
/// fail partially and the matcher has to cope.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct InboxDocument {
    pub document_id: Uuid,
    pub team_id: Uuid,
    pub extracted_amount: Option<Decimal>,
    pub extracted_currency: Option<String>,
    pub extracted_date: Option<NaiveDate>,
    pub extracted_counterparty: Option<String>,
    pub status: String,
    pub matched_transaction_id: Option<Uuid>,
    pub match_confidence: Option<f64>,
    pub suggested_transaction_id: Option<Uuid>,
    pub suggested_confidence: Option<f64>,
    pub evaluation_attempts: i32,
    pub last_evaluated_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl InboxDocument {
    /// Parses the stored status, treating unknown values as data corruption.
    pub fn status(&self) -> Result<DocumentStatus, AppError> {
        DocumentStatus::parse(&self.status).ok_or_else(|| {
            AppError::DataIntegrity(anyhow::anyhow!(
                "Document {} has unknown status '{}'",
                self.document_id,
                self.status
            ))
        })
    }
}

// ============================================================================
// Anchor
// ============================================================================

/// The entity an evaluation cycle starts from. Arrival of either side of a
/// potential match triggers evaluation anchored at the arriving entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum AnchorRef {
    Transaction(Uuid),
    Document(Uuid),
}

impl AnchorRef {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transaction(_) => "transaction",
            Self::Document(_) => "document",
        }
    }
}

impl fmt::Display for AnchorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transaction(id) => write!(f, "transaction:{id}"),
            Self::Document(id) => write!(f, "document:{id}"),
        }
    }
}

// ============================================================================
// Match Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchEventKind {
    Matched,
    CrossCurrencyMatched,
    Suggested,
    Unmatched,
}

impl MatchEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::CrossCurrencyMatched => "cross_currency_matched",
            Self::Suggested => "suggested",
            Self::Unmatched => "unmatched",
        }
    }
}

/// Domain event emitted when match state changes.
#[derive(Debug, Clone, Serialize)]
pub struct MatchEvent {
    pub kind: MatchEventKind,
    pub team_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub document_id: Uuid,
    pub combined_score: Option<f64>,
    pub from_currency: Option<String>,
    pub to_currency: Option<String>,
    pub decided_utc: DateTime<Utc>,
}

impl MatchEvent {
    pub fn matched(
        team_id: Uuid,
        transaction_id: Uuid,
        document_id: Uuid,
        combined_score: f64,
    ) -> Self {
        Self {
            kind: MatchEventKind::Matched,
            team_id,
            transaction_id: Some(transaction_id),
            document_id,
            combined_score: Some(combined_score),
            from_currency: None,
            to_currency: None,
            decided_utc: Utc::now(),
        }
    }

    pub fn cross_currency_matched(
        team_id: Uuid,
        transaction_id: Uuid,
        document_id: Uuid,
        combined_score: f64,
        from_currency: String,
        to_currency: String,
    ) -> Self {
        Self {
            kind: MatchEventKind::CrossCurrencyMatched,
            team_id,
            transaction_id: Some(transaction_id),
            document_id,
            combined_score: Some(combined_score),
            from_currency: Some(from_currency),
            to_currency: Some(to_currency),
            decided_utc: Utc::now(),
        }
    }

    pub fn suggested(
        team_id: Uuid,
        transaction_id: Uuid,
        document_id: Uuid,
        combined_score: f64,
    ) -> Self {
        Self {
            kind: MatchEventKind::Suggested,
            team_id,
            transaction_id: Some(transaction_id),
            document_id,
            combined_score: Some(combined_score),
            from_currency: None,
            to_currency: None,
            decided_utc: Utc::now(),
        }
    }

    pub fn unmatched(team_id: Uuid, transaction_id: Option<Uuid>, document_id: Uuid) -> Self {
        Self {
            kind: MatchEventKind::Unmatched,
            team_id,
            transaction_id,
            document_id,
            combined_score: None,
            from_currency: None,
            to_currency: None,
            decided_utc: Utc::now(),
        }
    }
}

// ============================================================================
// Match Decisions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionOutcome {
    Auto,
    Suggested,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Suggested => "suggested",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "suggested" => Some(Self::Suggested),
            _ => None,
        }
    }
}

/// Audit record for a match decision. Written once per state change so a
/// re-run over unchanged inputs leaves the audit trail untouched.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct MatchDecision {
    pub decision_id: Uuid,
    pub team_id: Uuid,
    pub transaction_id: Uuid,
    pub document_id: Uuid,
    pub outcome: String,
    pub combined_score: f64,
    pub decided_by: Option<String>,
    pub decided_utc: DateTime<Utc>,
}

impl MatchDecision {
    pub fn new(
        team_id: Uuid,
        transaction_id: Uuid,
        document_id: Uuid,
        outcome: DecisionOutcome,
        combined_score: f64,
        decided_by: Option<String>,
    ) -> Self {
        Self {
            decision_id: Uuid::new_v4(),
            team_id,
            transaction_id,
            document_id,
            outcome: outcome.as_str().to_string(),
            combined_score,
            decided_by,
            decided_utc: Utc::now(),
        }
    }
}

// ============================================================================
// Currency Helpers
// ============================================================================

/// ISO 4217 minor-unit exponent for a currency code.
pub fn currency_exponent(currency: &str) -> u32 {
    match currency {
        "JPY" | "KRW" | "VND" | "CLP" => 0,
        "BHD" | "IQD" | "JOD" | "KWD" | "LYD" | "OMR" | "TND" => 3,
        _ => 2,
    }
}

/// Converts a major-unit decimal amount to minor units, rounding half away
/// from zero. Returns `None` when the scaled value overflows an `i64`.
pub fn to_minor_units(amount: Decimal, currency: &str) -> Option<i64> {
    let exponent = currency_exponent(currency);
    let scale = Decimal::from(10_i64.checked_pow(exponent)?);
    amount
        .checked_mul(scale)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

/// Converts a minor-unit amount back to major units.
pub fn minor_to_major(minor: i64, currency: &str) -> Decimal {
    Decimal::new(minor, currency_exponent(currency))
}
