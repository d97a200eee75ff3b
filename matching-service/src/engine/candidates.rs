//! Candidate generation.
//!
//! Builds the bounded, ordered pool of opposite-type entities an anchor is
//! evaluated against. Pools are recomputed on every evaluation rather than
//! cached, since FX rates and the candidate sets themselves move between
//! evaluations.

use chrono::{Duration, NaiveDate};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use service_core::error::AppError;

use crate::config::ScoringConfig;
use crate::models::{to_minor_units, InboxDocument, Transaction};
use crate::services::store::MatchStore;

/// Inclusive date range for candidate lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateWindow {
    pub fn around(date: NaiveDate, days: i64) -> Self {
        let span = Duration::days(days);
        Self {
            from: date - span,
            to: date + span,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.from && date <= self.to
    }
}

/// Absolute minor-unit bounds for amount-bucket lookups. The slack is
/// rounded outward so a candidate sitting exactly on the tolerance edge is
/// still fetched and scored.
pub fn amount_bounds_minor(amount_minor: i64, tolerance: f64) -> (i64, i64) {
    let magnitude = amount_minor.unsigned_abs() as f64;
    let slack = (magnitude * tolerance).ceil();
    let lo = (magnitude - slack).max(0.0) as i64;
    let hi = (magnitude + slack).min(i64::MAX as f64) as i64;
    (lo, hi)
}

/// Absolute major-unit bounds for the document side of amount buckets.
pub fn amount_bounds_major(amount: Decimal, tolerance: f64) -> (Decimal, Decimal) {
    let magnitude = amount.abs();
    let slack = magnitude * Decimal::from_f64(tolerance).unwrap_or_default();
    let lo = (magnitude - slack).max(Decimal::ZERO);
    (lo, magnitude + slack)
}

/// Candidate documents for a transaction anchor: dated documents inside
/// the search window ordered by date proximity, then undated documents
/// from the amount bucket ordered by amount closeness, capped.
pub async fn for_transaction(
    store: &dyn MatchStore,
    txn: &Transaction,
    config: &ScoringConfig,
) -> Result<Vec<InboxDocument>, AppError> {
    let window = DateWindow::around(txn.transaction_date, config.candidate_window_days());
    let mut pool = store.candidate_documents(txn.team_id, window).await?;
    pool.sort_by_key(|d| {
        let distance = d
            .extracted_date
            .map(|date| (txn.transaction_date - date).num_days().abs())
            .unwrap_or(i64::MAX);
        (distance, d.document_id)
    });

    let txn_magnitude = txn.amount_major().abs();
    let (lo, hi) = amount_bounds_major(txn_magnitude, config.amount_tolerance);
    let mut undated = store
        .candidate_documents_by_amount(txn.team_id, &txn.currency, lo, hi)
        .await?;
    undated.sort_by_key(|d| {
        let closeness = d
            .extracted_amount
            .map(|a| (a.abs() - txn_magnitude).abs())
            .unwrap_or(Decimal::MAX);
        (closeness, d.document_id)
    });

    pool.extend(undated);
    pool.truncate(config.candidate_limit);
    Ok(pool)
}

/// Candidate transactions for a document anchor. A dated document uses
/// the date window; an undated one falls back to the amount bucket over
/// any date. A document with neither date nor amount has no reachable
/// candidates and gets an empty pool.
pub async fn for_document(
    store: &dyn MatchStore,
    doc: &InboxDocument,
    config: &ScoringConfig,
) -> Result<Vec<Transaction>, AppError> {
    if let Some(date) = doc.extracted_date {
        let window = DateWindow::around(date, config.candidate_window_days());
        let mut pool = store.candidate_transactions(doc.team_id, window).await?;
        pool.sort_by_key(|t| {
            (
                (t.transaction_date - date).num_days().abs(),
                t.transaction_id,
            )
        });
        pool.truncate(config.candidate_limit);
        return Ok(pool);
    }

    let Some(amount) = doc.extracted_amount else {
        return Ok(Vec::new());
    };
    // Unknown document currency scales at the default two-decimal exponent
    // and matches transactions of any currency.
    let currency = doc.extracted_currency.as_deref();
    let reference_minor = match to_minor_units(amount, currency.unwrap_or_default()) {
        Some(minor) => minor,
        None => return Ok(Vec::new()),
    };
    let (lo, hi) = amount_bounds_minor(reference_minor, config.amount_tolerance);
    let mut pool = store
        .candidate_transactions_by_amount(doc.team_id, currency, lo, hi)
        .await?;
    pool.sort_by_key(|t| {
        (
            t.amount_minor
                .unsigned_abs()
                .abs_diff(reference_minor.unsigned_abs()),
            t.transaction_id,
        )
    });
    pool.truncate(config.candidate_limit);
    Ok(pool)
}
