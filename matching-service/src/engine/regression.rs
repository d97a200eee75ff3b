//! Scoring regression harness.
//!
//! A corpus of labeled transaction/document pairs is embedded in the
//! binary and replayed through the pure scoring pipeline, with no store
//! or network behind it. Tuning weights, tolerances or normalization is
//! only safe while the corpus stays green.

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;

use crate::config::ScoringConfig;
use crate::engine::decision::{classify, combine, Classification};
use crate::engine::scorers::score_pair;
use crate::models::{DocumentStatus, InboxDocument, Transaction};

const EMBEDDED_CORPUS: &str = include_str!("../../fixtures/regression.json");

/// Combined scores may drift in the last few decimals as float math is
/// reordered; anything past this is a behavior change.
const CASE_TOLERANCE: f64 = 0.001;

#[derive(Debug, Deserialize)]
pub struct RegressionCorpus {
    pub cases: Vec<RegressionCase>,
}

#[derive(Debug, Deserialize)]
pub struct RegressionCase {
    pub name: String,
    pub transaction: CaseTransaction,
    pub document: CaseDocument,
    #[serde(default)]
    pub fx_rate: Option<Decimal>,
    pub expected: Expectation,
}

#[derive(Debug, Deserialize)]
pub struct CaseTransaction {
    pub amount_minor: i64,
    pub currency: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub counterparty: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CaseDocument {
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub counterparty: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Expectation {
    /// "auto", "suggested" or "none".
    pub classification: String,
    #[serde(default)]
    pub combined: Option<f64>,
    #[serde(default)]
    pub cross_currency: bool,
}

#[derive(Debug)]
pub struct CaseFailure {
    pub name: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct RegressionReport {
    pub total: usize,
    pub failures: Vec<CaseFailure>,
}

impl RegressionReport {
    pub fn is_green(&self) -> bool {
        self.failures.is_empty()
    }
}

impl RegressionCorpus {
    /// The corpus compiled into the binary.
    pub fn embedded() -> Result<Self, AppError> {
        serde_json::from_str(EMBEDDED_CORPUS).map_err(|e| {
            AppError::DataIntegrity(anyhow::anyhow!("Malformed regression corpus: {}", e))
        })
    }

    /// Replay every case against the given configuration.
    pub fn run(&self, config: &ScoringConfig) -> RegressionReport {
        let failures = self
            .cases
            .iter()
            .filter_map(|case| {
                case.check(config).map(|reason| CaseFailure {
                    name: case.name.clone(),
                    reason,
                })
            })
            .collect();
        RegressionReport {
            total: self.cases.len(),
            failures,
        }
    }
}

impl RegressionCase {
    fn check(&self, config: &ScoringConfig) -> Option<String> {
        let txn = self.transaction.build();
        let doc = self.document.build();
        let signals = score_pair(&txn, &doc, self.fx_rate, config);

        let (label, value, cross) = match combine(&signals) {
            None => ("none", None, false),
            Some(c) => {
                let label = match classify(c.value, config) {
                    Classification::Auto => "auto",
                    Classification::Suggested => "suggested",
                    Classification::NoContribution => "none",
                };
                (label, Some(c.value), c.cross_currency)
            }
        };

        if label != self.expected.classification {
            return Some(format!(
                "expected {} but scored {} (combined {:?})",
                self.expected.classification, label, value
            ));
        }
        if let Some(expected_value) = self.expected.combined {
            match value {
                Some(v) if (v - expected_value).abs() <= CASE_TOLERANCE => {}
                _ => {
                    return Some(format!(
                        "expected combined {} but got {:?}",
                        expected_value, value
                    ));
                }
            }
            if cross != self.expected.cross_currency {
                return Some(format!(
                    "expected cross_currency {} but got {}",
                    self.expected.cross_currency, cross
                ));
            }
        }
        None
    }
}

impl CaseTransaction {
    fn build(&self) -> Transaction {
        let now = Utc::now();
        Transaction {
            transaction_id: Uuid::new_v4(),
            team_id: Uuid::nil(),
            bank_account_id: Uuid::nil(),
            amount_minor: self.amount_minor,
            currency: self.currency.clone(),
            transaction_date: self.date,
            counterparty_name: self.counterparty.clone(),
            raw_description: String::new(),
            matched_document_id: None,
            match_confidence: None,
            created_utc: now,
            updated_utc: now,
        }
    }
}

impl CaseDocument {
    fn build(&self) -> InboxDocument {
        let now = Utc::now();
        InboxDocument {
            document_id: Uuid::new_v4(),
            team_id: Uuid::nil(),
            extracted_amount: self.amount,
            extracted_currency: self.currency.clone(),
            extracted_date: self.date,
            extracted_counterparty: self.counterparty.clone(),
            status: DocumentStatus::Pending.as_str().to_string(),
            matched_transaction_id: None,
            match_confidence: None,
            suggested_transaction_id: None,
            suggested_confidence: None,
            evaluation_attempts: 0,
            last_evaluated_utc: None,
            created_utc: now,
            updated_utc: now,
        }
    }
}
