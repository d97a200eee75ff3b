//! Signal scorers.
//!
//! Each scorer is a pure function over one transaction-document pair and
//! returns `Option<f64>`: `Some(value)` in [0, 1], or `None` to abstain
//! when a required input is missing. Abstention is not a zero score; the
//! decision engine renormalizes weights over non-abstaining signals only.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashSet;

use crate::config::ScoringConfig;
use crate::models::{to_minor_units, InboxDocument, Transaction};

/// The signals that can contribute to a combined score. Amount and Fx are
/// mutually exclusive for a given pair: same-currency pairs use Amount,
/// cross-currency pairs use Fx.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Amount,
    Fx,
    Date,
    Counterparty,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amount => "amount",
            Self::Fx => "fx",
            Self::Date => "date",
            Self::Counterparty => "counterparty",
        }
    }
}

/// A non-abstaining scorer result with the weight it carries into the
/// combined score.
#[derive(Debug, Clone, Copy)]
pub struct SignalScore {
    pub signal: Signal,
    pub value: f64,
    pub weight: f64,
}

/// Runs every scorer for one pair and collects the non-abstaining results.
///
/// `fx_rate` is the rate converting one unit of the document's currency
/// into the transaction's currency, effective at the transaction date, or
/// `None` when no rate could be obtained.
pub fn score_pair(
    txn: &Transaction,
    doc: &InboxDocument,
    fx_rate: Option<Decimal>,
    config: &ScoringConfig,
) -> Vec<SignalScore> {
    let mut scores = Vec::with_capacity(3);

    if let Some(value) = score_amount(txn, doc, config) {
        scores.push(SignalScore {
            signal: Signal::Amount,
            value,
            weight: config.amount_weight,
        });
    } else if let Some(value) = score_fx(txn, doc, fx_rate, config) {
        scores.push(SignalScore {
            signal: Signal::Fx,
            value,
            weight: config.amount_weight,
        });
    }

    if let Some(value) = score_date(txn, doc, config) {
        scores.push(SignalScore {
            signal: Signal::Date,
            value,
            weight: config.date_weight,
        });
    }

    if let Some(value) = score_counterparty(txn, doc) {
        scores.push(SignalScore {
            signal: Signal::Counterparty,
            value,
            weight: config.counterparty_weight,
        });
    }

    scores
}

/// Same-currency amount comparison on minor-unit magnitudes. Signs are
/// ignored: a bank debit is negative while the document total is positive.
/// Abstains when the document has no amount or the currencies differ.
pub fn score_amount(
    txn: &Transaction,
    doc: &InboxDocument,
    config: &ScoringConfig,
) -> Option<f64> {
    let amount = doc.extracted_amount?;
    // A document without an extracted currency is assumed to be in the
    // transaction's currency rather than excluded from amount scoring.
    let currency = doc.extracted_currency.as_deref().unwrap_or(&txn.currency);
    if currency != txn.currency {
        return None;
    }
    let doc_minor = to_minor_units(amount, currency)?;
    Some(relative_decay_minor(
        txn.amount_minor.unsigned_abs(),
        doc_minor.unsigned_abs(),
        config.amount_tolerance,
    ))
}

/// Cross-currency amount comparison. Active only when the currencies
/// differ, the document has an amount, and a rate is available; abstains
/// otherwise so a missing rate never reads as a mismatch.
pub fn score_fx(
    txn: &Transaction,
    doc: &InboxDocument,
    fx_rate: Option<Decimal>,
    config: &ScoringConfig,
) -> Option<f64> {
    let amount = doc.extracted_amount?;
    let doc_currency = doc.extracted_currency.as_deref()?;
    if doc_currency == txn.currency {
        return None;
    }
    let rate = fx_rate?;

    let converted = amount.checked_mul(rate)?.abs();
    let txn_amount = txn.amount_major().abs();
    if converted == txn_amount {
        return Some(1.0);
    }
    let max = converted.max(txn_amount);
    let ratio = ((converted - txn_amount).abs() / max).to_f64()?;
    Some(if ratio > config.fx_tolerance {
        0.0
    } else {
        1.0 - ratio
    })
}

/// Linear decay over calendar-day distance, symmetric because documents
/// post both before and after their transaction. 1.0 at zero days, 0.0 at
/// the window edge and beyond.
pub fn score_date(txn: &Transaction, doc: &InboxDocument, config: &ScoringConfig) -> Option<f64> {
    let doc_date = doc.extracted_date?;
    let days = (txn.transaction_date - doc_date).num_days().abs();
    Some((1.0 - days as f64 / config.date_window_days as f64).max(0.0))
}

/// Name similarity after normalization. Abstains when either side is
/// empty once case, punctuation and legal suffixes are stripped.
pub fn score_counterparty(txn: &Transaction, doc: &InboxDocument) -> Option<f64> {
    let doc_name = doc.extracted_counterparty.as_deref()?;
    let doc_tokens = normalize_name(doc_name);
    if doc_tokens.is_empty() {
        return None;
    }
    let txn_tokens = normalize_name(txn.counterparty_text());
    if txn_tokens.is_empty() {
        return None;
    }
    Some(similarity(&txn_tokens, &doc_tokens))
}

fn relative_decay_minor(a: u64, b: u64, tolerance: f64) -> f64 {
    if a == b {
        return 1.0;
    }
    let ratio = a.abs_diff(b) as f64 / a.max(b) as f64;
    if ratio > tolerance {
        0.0
    } else {
        1.0 - ratio
    }
}

/// Trailing legal-form tokens stripped during normalization so "Acme Inc"
/// and "Acme Incorporated" compare equal.
const LEGAL_SUFFIXES: &[&str] = &[
    "ab", "ag", "aps", "bv", "co", "company", "corp", "corporation", "gmbh", "inc", "incorporated",
    "kg", "limited", "llc", "llp", "lp", "ltd", "nv", "oy", "plc", "pte", "pty", "sa", "sarl",
    "srl",
];

/// Case-folds, replaces punctuation with spaces and strips trailing legal
/// suffixes. The last remaining token is never stripped, so a name that is
/// nothing but a legal form ("LLC") still compares as itself.
fn normalize_name(raw: &str) -> Vec<String> {
    let cleaned: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let mut tokens: Vec<String> = cleaned.split_whitespace().map(str::to_string).collect();
    while tokens.len() > 1 && LEGAL_SUFFIXES.contains(&tokens[tokens.len() - 1].as_str()) {
        tokens.pop();
    }
    tokens
}

///// Similarity in [0, 1]: the better of an edit-distance ratio over the
/// joined names and a token-set overlap ratio. The overlap side keeps
/// reordered names ("Acme Trading" vs "Trading Acme") from scoring low.
fn similarity(a: &[String], b: &[String]) -> f64 {
    let joined_a = a.join(" ");
    let joined_b = b.join(" ");
    if joined_a == joined_b {
        return 1.0;
    }

    let edit = strsim::jaro_winkler(&joined_a, &joined_b);

    let set_a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let set_b: HashSet<&str> = b.iter().map(String::as_str).collect();
    let union = set_a.union(&set_b).count();
    let overlap = if union == 0 {
        0.0
    } else {
        set_a.intersection(&set_b).count() as f64 / union as f64
    };

    edit.max(overlap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use uuid::Uuid;

    fn txn(
        amount_minor: i64,
        currency: &str,
        date: &str,
        counterparty: Option<&str>,
    ) -> Transaction {
        Transaction {
            transaction_id: Uuid::new_v4(),
            team_id: Uuid::new_v4(),
            bank_account_id: Uuid::new_v4(),
            amount_minor,
            currency: currency.to_string(),
            transaction_date: date.parse().unwrap(),
            counterparty_name: counterparty.map(str::to_string),
            raw_description: String::new(),
            matched_document_id: None,
            match_confidence: None,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        }
    }

    fn doc(
        amount: Option<&str>,
        currency: Option<&str>,
        date: Option<&str>,
        counterparty: Option<&str>,
    ) -> InboxDocument {
        InboxDocument {
            document_id: Uuid::new_v4(),
            team_id: Uuid::new_v4(),
            extracted_amount: amount.map(|a| a.parse().unwrap()),
            extracted_currency: currency.map(str::to_string),
            extracted_date: date.map(|d| d.parse().unwrap()),
            extracted_counterparty: counterparty.map(str::to_string),
            status: "pending".to_string(),
            matched_transaction_id: None,
            match_confidence: None,
            suggested_transaction_id: None,
            suggested_confidence: None,
            evaluation_attempts: 0,
            last_evaluated_utc: None,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        }
    }

    fn config() -> ScoringConfig {
        ScoringConfig::default()
    }

    #[test]
    fn test_amount_exact_match_scores_one() {
        let t = txn(-4999, "USD", "2024-03-01", None);
        let d = doc(Some("49.99"), Some("USD"), None, None);
        assert_eq!(score_amount(&t, &d, &config()), Some(1.0));
    }

    #[test]
    fn test_amount_ignores_sign() {
        let t = txn(4999, "USD", "2024-03-01", None);
        let d = doc(Some("-49.99"), Some("USD"), None, None);
        assert_eq!(score_amount(&t, &d, &config()), Some(1.0));
    }

    #[test]
    fn test_amount_decays_within_tolerance() {
        let t = txn(-10000, "USD", "2024-03-01", None);
        let d = doc(Some("100.50"), Some("USD"), None, None);
        let score = score_amount(&t, &d, &config()).unwrap();
        assert!((score - 0.995_025).abs() < 1e-4);
    }

    #[test]
    fn test_amount_floors_to_zero_beyond_tolerance() {
        let t = txn(-10000, "USD", "2024-03-01", None);
        let d = doc(Some("103.00"), Some("USD"), None, None);
        assert_eq!(score_amount(&t, &d, &config()), Some(0.0));
    }

    #[test]
    fn test_amount_abstains_without_document_amount() {
        let t = txn(-10000, "USD", "2024-03-01", None);
        let d = doc(None, Some("USD"), None, None);
        assert_eq!(score_amount(&t, &d, &config()), None);
    }

    #[test]
    fn test_amount_abstains_for_cross_currency_pairs() {
        let t = txn(-10000, "USD", "2024-03-01", None);
        let d = doc(Some("93.00"), Some("EUR"), None, None);
        assert_eq!(score_amount(&t, &d, &config()), None);
    }

    #[test]
    fn test_amount_missing_currency_defaults_to_transaction_currency() {
        let t = txn(-4999, "USD", "2024-03-01", None);
        let d = doc(Some("49.99"), None, None, None);
        assert_eq!(score_amount(&t, &d, &config()), Some(1.0));
    }

    #[test]
    fn test_amount_zero_exponent_currency() {
        let t = txn(-5000, "JPY", "2024-03-01", None);
        let d = doc(Some("5000"), Some("JPY"), None, None);
        assert_eq!(score_amount(&t, &d, &config()), Some(1.0));
    }

    #[test]
    fn test_amount_three_exponent_currency() {
        let t = txn(-12345, "KWD", "2024-03-01", None);
        let d = doc(Some("12.345"), Some("KWD"), None, None);
        assert_eq!(score_amount(&t, &d, &config()), Some(1.0));
    }

    #[test]
    fn test_fx_converts_at_provided_rate() {
        // 93.00 EUR * 1.075 = 99.975 vs 100.00 USD, relative diff 0.025%.
        let t = txn(-10000, "USD", "2024-03-05", None);
        let d = doc(Some("93.00"), Some("EUR"), None, None);
        let rate = "1.075".parse().unwrap();
        let score = score_fx(&t, &d, Some(rate), &config()).unwrap();
        assert!((score - 0.99975).abs() < 1e-5);
    }

    #[test]
    fn test_fx_abstains_without_rate() {
        let t = txn(-10000, "USD", "2024-03-05", None);
        let d = doc(Some("93.00"), Some("EUR"), None, None);
        assert_eq!(score_fx(&t, &d, None, &config()), None);
    }

    #[test]
    fn test_fx_abstains_for_same_currency() {
        let t = txn(-10000, "USD", "2024-03-05", None);
        let d = doc(Some("100.00"), Some("USD"), None, None);
        let rate = "1.0".parse().unwrap();
        assert_eq!(score_fx(&t, &d, Some(rate), &config()), None);
    }

    #[test]
    fn test_fx_floors_to_zero_beyond_tolerance() {
        // 93.00 EUR * 1.16 = 107.88 vs 100.00 USD, relative diff 7.3%.
        let t = txn(-10000, "USD", "2024-03-05", None);
        let d = doc(Some("93.00"), Some("EUR"), None, None);
        let rate = "1.16".parse().unwrap();
        assert_eq!(score_fx(&t, &d, Some(rate), &config()), Some(0.0));
    }

    #[test]
    fn test_date_same_day_scores_one() {
        let t = txn(-100, "USD", "2024-03-01", None);
        let d = doc(None, None, Some("2024-03-01"), None);
        assert_eq!(score_date(&t, &d, &config()), Some(1.0));
    }

    #[test]
    fn test_date_decay_is_symmetric() {
        let t = txn(-100, "USD", "2024-03-10", None);
        let before = doc(None, None, Some("2024-03-07"), None);
        let after = doc(None, None, Some("2024-03-13"), None);
        let score_before = score_date(&t, &before, &config()).unwrap();
        let score_after = score_date(&t, &after, &config()).unwrap();
        assert!((score_before - score_after).abs() < f64::EPSILON);
        assert!((score_before - (1.0 - 3.0 / 7.0)).abs() < 1e-9);
    }

    #[test]
    fn test_date_window_edge_scores_zero() {
        let t = txn(-100, "USD", "2024-03-01", None);
        let at_edge = doc(None, None, Some("2024-03-08"), None);
        let beyond = doc(None, None, Some("2024-03-15"), None);
        assert_eq!(score_date(&t, &at_edge, &config()), Some(0.0));
        assert_eq!(score_date(&t, &beyond, &config()), Some(0.0));
    }

    #[test]
    fn test_date_abstains_without_document_date() {
        let t = txn(-100, "USD", "2024-03-01", None);
        let d = doc(None, None, None, None);
        assert_eq!(score_date(&t, &d, &config()), None);
    }

    #[test]
    fn test_counterparty_equal_after_normalization() {
        let t = txn(-100, "USD", "2024-03-01", Some("Acme Inc"));
        let d = doc(None, None, None, Some("ACME, Inc."));
        assert_eq!(score_counterparty(&t, &d), Some(1.0));
    }

    #[test]
    fn test_counterparty_strips_legal_suffixes() {
        let t = txn(-100, "USD", "2024-03-01", Some("Acme Incorporated"));
        let d = doc(None, None, None, Some("acme ltd"));
        assert_eq!(score_counterparty(&t, &d), Some(1.0));
    }

    #[test]
    fn test_counterparty_unrelated_names_score_low() {
        let t = txn(-100, "USD", "2024-03-01", Some("Acme Inc"));
        let d = doc(None, None, None, Some("Globex Co"));
        let score = score_counterparty(&t, &d).unwrap();
        assert!(score < 0.5, "unrelated names scored {score}");
    }

    #[test]
    fn test_counterparty_token_overlap_handles_reordering() {
        let t = txn(-100, "USD", "2024-03-01", Some("Trading Acme"));
        let d = doc(None, None, None, Some("Acme Trading"));
        let score = score_counterparty(&t, &d).unwrap();
        assert_eq!(score, 1.0);
    }

    #[test]
    fn test_counterparty_abstains_when_empty_after_normalization() {
        let t = txn(-100, "USD", "2024-03-01", Some("Acme Inc"));
        let d = doc(None, None, None, Some("..."));
        assert_eq!(score_counterparty(&t, &d), None);
    }

    #[test]
    fn test_counterparty_abstains_without_document_name() {
        let t = txn(-100, "USD", "2024-03-01", Some("Acme Inc"));
        let d = doc(None, None, None, None);
        assert_eq!(score_counterparty(&t, &d), None);
    }

    #[test]
    fn test_counterparty_uses_description_fallback() {
        let t = txn(-100, "USD", "2024-03-01", None);
        let mut t = t;
        t.raw_description = "ACME INC PAYMENT".to_string();
        let d = doc(None, None, None, Some("Acme Inc"));
        let score = score_counterparty(&t, &d).unwrap();
        assert!(score > 0.5);
    }

    #[test]
    fn test_score_pair_same_currency_uses_amount_signal() {
        let t = txn(-4999, "USD", "2024-03-01", Some("Acme Inc"));
        let d = doc(Some("49.99"), Some("USD"), Some("2024-03-01"), Some("Acme Inc."));
        let scores = score_pair(&t, &d, None, &config());
        assert!(scores.iter().any(|s| s.signal == Signal::Amount));
        assert!(scores.iter().all(|s| s.signal != Signal::Fx));
        assert_eq!(scores.len(), 3);
    }

    #[test]
    fn test_score_pair_cross_currency_uses_fx_signal() {
        let t = txn(-10000, "USD", "2024-03-05", None);
        let d = doc(Some("93.00"), Some("EUR"), Some("2024-03-05"), None);
        let rate = "1.075".parse().unwrap();
        let scores = score_pair(&t, &d, Some(rate), &config());
        assert!(scores.iter().any(|s| s.signal == Signal::Fx));
        assert!(scores.iter().all(|s| s.signal != Signal::Amount));
    }

    #[test]
    fn test_score_pair_cross_currency_without_rate_has_no_amount_signal() {
        let t = txn(-10000, "USD", "2024-03-05", None);
        let d = doc(Some("93.00"), Some("EUR"), Some("2024-03-05"), None);
        let scores = score_pair(&t, &d, None, &config());
        assert!(scores
            .iter()
            .all(|s| s.signal != Signal::Amount && s.signal != Signal::Fx));
    }

    #[test]
    fn test_score_pair_all_abstaining_is_empty() {
        let t = txn(-10000, "USD", "2024-03-05", None);
        let d = doc(None, None, None, None);
        assert!(score_pair(&t, &d, None, &config()).is_empty());
    }
}
