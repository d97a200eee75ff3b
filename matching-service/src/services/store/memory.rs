//! In-memory match store.
//!
//! Backs the regression harness and the test suites so the engine can run
//! with no database at all. One `RwLock` over the whole world makes every
//! conditional update atomic, which is exactly the guarantee the Postgres
//! implementation provides per statement.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::engine::candidates::DateWindow;
use crate::engine::state::{ClaimOutcome, EmptyCycleOutcome, ReleaseOutcome, SuggestOutcome};
use crate::models::{DocumentStatus, InboxDocument, MatchDecision, Transaction};
use crate::services::store::MatchStore;

#[derive(Default)]
struct World {
    transactions: HashMap<Uuid, Transaction>,
    documents: HashMap<Uuid, InboxDocument>,
    decisions: Vec<MatchDecision>,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    world: Arc<RwLock<World>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_transaction(&self, transaction: Transaction) {
        let mut world = self.world.write().await;
        world
            .transactions
            .insert(transaction.transaction_id, transaction);
    }

    pub async fn insert_document(&self, document: InboxDocument) {
        let mut world = self.world.write().await;
        world.documents.insert(document.document_id, document);
    }

    /// Simulates an upstream deletion (bank re-import, document removal).
    pub async fn remove_transaction(&self, transaction_id: Uuid) {
        let mut world = self.world.write().await;
        world.transactions.remove(&transaction_id);
    }

    pub async fn remove_document(&self, document_id: Uuid) {
        let mut world = self.world.write().await;
        world.documents.remove(&document_id);
    }
}

/// Eligibility shared by every candidate query: unlinked, or linked at a
/// confidence an upgrade could still beat.
fn document_is_beatable(doc: &InboxDocument) -> bool {
    matches!(
        DocumentStatus::parse(&doc.status),
        Some(DocumentStatus::Pending) | Some(DocumentStatus::SuggestedMatch)
    ) || (DocumentStatus::parse(&doc.status) == Some(DocumentStatus::Done)
        && doc.match_confidence.is_some_and(|c| c < 1.0))
}

fn document_is_open(doc: &InboxDocument) -> bool {
    matches!(
        DocumentStatus::parse(&doc.status),
        Some(DocumentStatus::Pending) | Some(DocumentStatus::SuggestedMatch)
    )
}

fn transaction_is_beatable(txn: &Transaction) -> bool {
    txn.matched_document_id.is_none() || txn.match_confidence.is_some_and(|c| c < 1.0)
}

fn document_amount_in_bucket(doc: &InboxDocument, currency: &str, lo: Decimal, hi: Decimal) -> bool {
    let currency_matches = doc
        .extracted_currency
        .as_deref()
        .map(|c| c == currency)
        .unwrap_or(true);
    currency_matches
        && doc
            .extracted_amount
            .is_some_and(|a| a.abs() >= lo && a.abs() <= hi)
}

#[async_trait]
impl MatchStore for InMemoryStore {
    async fn get_transaction(
        &self,
        team_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, AppError> {
        let world = self.world.read().await;
        Ok(world
            .transactions
            .get(&transaction_id)
            .filter(|t| t.team_id == team_id)
            .cloned())
    }

    async fn get_document(
        &self,
        team_id: Uuid,
        document_id: Uuid,
    ) -> Result<Option<InboxDocument>, AppError> {
        let world = self.world.read().await;
        Ok(world
            .documents
            .get(&document_id)
            .filter(|d| d.team_id == team_id)
            .cloned())
    }

    async fn candidate_documents(
        &self,
        team_id: Uuid,
        window: DateWindow,
    ) -> Result<Vec<InboxDocument>, AppError> {
        let world = self.world.read().await;
        Ok(world
            .documents
            .values()
            .filter(|d| d.team_id == team_id && document_is_beatable(d))
            .filter(|d| d.extracted_date.is_some_and(|date| window.contains(date)))
            .cloned()
            .collect())
    }

    async fn candidate_documents_by_amount(
        &self,
        team_id: Uuid,
        currency: &str,
        lo: Decimal,
        hi: Decimal,
    ) -> Result<Vec<InboxDocument>, AppError> {
        let world = self.world.read().await;
        Ok(world
            .documents
            .values()
            .filter(|d| d.team_id == team_id && document_is_beatable(d))
            .filter(|d| d.extracted_date.is_none())
            .filter(|d| document_amount_in_bucket(d, currency, lo, hi))
            .cloned()
            .collect())
    }

    async fn candidate_transactions(
        &self,
        team_id: Uuid,
        window: DateWindow,
    ) -> Result<Vec<Transaction>, AppError> {
        let world = self.world.read().await;
        Ok(world
            .transactions
            .values()
            .filter(|t| t.team_id == team_id && transaction_is_beatable(t))
            .filter(|t| window.contains(t.transaction_date))
            .cloned()
            .collect())
    }

    async fn candidate_transactions_by_amount(
        &self,
        team_id: Uuid,
        currency: Option<&str>,
        lo_minor: i64,
        hi_minor: i64,
    ) -> Result<Vec<Transaction>, AppError> {
        let lo = lo_minor.max(0) as u64;
        let hi = hi_minor.max(0) as u64;
        let world = self.world.read().await;
        Ok(world
            .transactions
            .values()
            .filter(|t| t.team_id == team_id && transaction_is_beatable(t))
            .filter(|t| currency.map(|c| t.currency == c).unwrap_or(true))
            .filter(|t| {
                let magnitude = t.amount_minor.unsigned_abs();
                magnitude >= lo && magnitude <= hi
            })
            .cloned()
            .collect())
    }

    async fn open_documents(
        &self,
        team_id: Uuid,
        window: DateWindow,
    ) -> Result<Vec<InboxDocument>, AppError> {
        let world = self.world.read().await;
        Ok(world
            .documents
            .values()
            .filter(|d| d.team_id == team_id && document_is_open(d))
            .filter(|d| d.extracted_date.is_some_and(|date| window.contains(date)))
            .cloned()
            .collect())
    }

    async fn open_documents_by_amount(
        &self,
        team_id: Uuid,
        currency: &str,
        lo: Decimal,
        hi: Decimal,
    ) -> Result<Vec<InboxDocument>, AppError> {
        let world = self.world.read().await;
        Ok(world
            .documents
            .values()
            .filter(|d| d.team_id == team_id && document_is_open(d))
            .filter(|d| d.extracted_date.is_none())
            .filter(|d| document_amount_in_bucket(d, currency, lo, hi))
            .cloned()
            .collect())
    }

    async fn reopen_no_match_in_window(
        &self,
        team_id: Uuid,
        window: DateWindow,
    ) -> Result<u64, AppError> {
        let now = Utc::now();
        let mut world = self.world.write().await;
        let mut reopened = 0;
        for doc in world.documents.values_mut() {
            if doc.team_id == team_id
                && DocumentStatus::parse(&doc.status) == Some(DocumentStatus::NoMatch)
                && doc.extracted_date.is_some_and(|date| window.contains(date))
            {
                doc.status = DocumentStatus::Pending.as_str().to_string();
                doc.evaluation_attempts = 0;
                doc.updated_utc = now;
                reopened += 1;
            }
        }
        Ok(reopened)
    }

    async fn reopen_no_match_by_amount(
        &self,
        team_id: Uuid,
        currency: &str,
        lo: Decimal,
        hi: Decimal,
    ) -> Result<u64, AppError> {
        let now = Utc::now();
        let mut world = self.world.write().await;
        let mut reopened = 0;
        for doc in world.documents.values_mut() {
            if doc.team_id == team_id
                && DocumentStatus::parse(&doc.status) == Some(DocumentStatus::NoMatch)
                && doc.extracted_date.is_none()
                && document_amount_in_bucket(doc, currency, lo, hi)
            {
                doc.status = DocumentStatus::Pending.as_str().to_string();
                doc.evaluation_attempts = 0;
                doc.updated_utc = now;
                reopened += 1;
            }
        }
        Ok(reopened)
    }

    async fn reopen_document(&self, team_id: Uuid, document_id: Uuid) -> Result<bool, AppError> {
        let mut world = self.world.write().await;
        let Some(doc) = world
            .documents
            .get_mut(&document_id)
            .filter(|d| d.team_id == team_id)
        else {
            return Ok(false);
        };
        if DocumentStatus::parse(&doc.status) != Some(DocumentStatus::NoMatch) {
            return Ok(false);
        }
        doc.status = DocumentStatus::Pending.as_str().to_string();
        doc.evaluation_attempts = 0;
        doc.updated_utc = Utc::now();
        Ok(true)
    }

    async fn claim_match(
        &self,
        team_id: Uuid,
        transaction_id: Uuid,
        document_id: Uuid,
        confidence: f64,
    ) -> Result<ClaimOutcome, AppError> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(AppError::DataIntegrity(anyhow::anyhow!(
                "Match confidence {} out of range",
                confidence
            )));
        }
        let mut world = self.world.write().await;

        let Some(txn) = world
            .transactions
            .get(&transaction_id)
            .filter(|t| t.team_id == team_id)
        else {
            return Ok(ClaimOutcome::Conflict);
        };
        let Some(doc) = world
            .documents
            .get(&document_id)
            .filter(|d| d.team_id == team_id)
        else {
            return Ok(ClaimOutcome::Conflict);
        };

        if txn.matched_document_id == Some(document_id)
            && doc.matched_transaction_id == Some(transaction_id)
        {
            return Ok(ClaimOutcome::AlreadyLinked);
        }

        let status = doc.status()?;
        match status {
            DocumentStatus::Pending | DocumentStatus::SuggestedMatch => {}
            DocumentStatus::Done => match doc.match_confidence {
                Some(existing) if existing < confidence => {}
                _ => return Ok(ClaimOutcome::Conflict),
            },
            _ => return Ok(ClaimOutcome::Conflict),
        }
        if let Some(existing) = txn.match_confidence {
            if existing >= confidence {
                return Ok(ClaimOutcome::Conflict);
            }
        }

        let displaced_document = txn.matched_document_id.filter(|id| *id != document_id);
        let displaced_transaction = doc.matched_transaction_id.filter(|id| *id != transaction_id);
        let now = Utc::now();

        if let Some(prev_id) = displaced_document {
            if let Some(prev) = world.documents.get_mut(&prev_id) {
                prev.status = DocumentStatus::Pending.as_str().to_string();
                prev.matched_transaction_id = None;
                prev.match_confidence = None;
                prev.evaluation_attempts = 0;
                prev.updated_utc = now;
            }
        }
        if let Some(prev_id) = displaced_transaction {
            if let Some(prev) = world.transactions.get_mut(&prev_id) {
                prev.matched_document_id = None;
                prev.match_confidence = None;
                prev.updated_utc = now;
            }
        }

        if let Some(txn) = world.transactions.get_mut(&transaction_id) {
            txn.matched_document_id = Some(document_id);
            txn.match_confidence = Some(confidence);
            txn.updated_utc = now;
        }
        if let Some(doc) = world.documents.get_mut(&document_id) {
            doc.status = DocumentStatus::Done.as_str().to_string();
            doc.matched_transaction_id = Some(transaction_id);
            doc.match_confidence = Some(confidence);
            doc.suggested_transaction_id = None;
            doc.suggested_confidence = None;
            doc.evaluation_attempts = 0;
            doc.last_evaluated_utc = Some(now);
            doc.updated_utc = now;
        }

        Ok(ClaimOutcome::Claimed {
            displaced_transaction,
            displaced_document,
        })
    }

    async fn suggest_match(
        &self,
        team_id: Uuid,
        document_id: Uuid,
        transaction_id: Uuid,
        confidence: f64,
    ) -> Result<SuggestOutcome, AppError> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(AppError::DataIntegrity(anyhow::anyhow!(
                "Suggestion confidence {} out of range",
                confidence
            )));
        }
        let now = Utc::now();
        let mut world = self.world.write().await;
        let Some(doc) = world
            .documents
            .get_mut(&document_id)
            .filter(|d| d.team_id == team_id)
        else {
            return Ok(SuggestOutcome::Conflict);
        };

        let status = doc.status()?;
        if !matches!(
            status,
            DocumentStatus::Pending | DocumentStatus::SuggestedMatch
        ) {
            return Ok(SuggestOutcome::Conflict);
        }

        let mut replaced = None;
        if let Some(existing_txn) = doc.suggested_transaction_id {
            if existing_txn == transaction_id {
                let existing = doc.suggested_confidence.unwrap_or(0.0);
                if (existing - confidence).abs() < f64::EPSILON {
                    return Ok(SuggestOutcome::Unchanged);
                }
            } else {
                let existing = doc.suggested_confidence.unwrap_or(0.0);
                if existing >= confidence {
                    return Ok(SuggestOutcome::Conflict);
                }
                replaced = Some(existing_txn);
            }
        }

        doc.status = DocumentStatus::SuggestedMatch.as_str().to_string();
        doc.suggested_transaction_id = Some(transaction_id);
        doc.suggested_confidence = Some(confidence);
        doc.evaluation_attempts = 0;
        doc.last_evaluated_utc = Some(now);
        doc.updated_utc = now;

        Ok(SuggestOutcome::Applied { replaced })
    }

    async fn clear_suggestion(
        &self,
        team_id: Uuid,
        document_id: Uuid,
    ) -> Result<ReleaseOutcome, AppError> {
        let mut world = self.world.write().await;
        let Some(doc) = world
            .documents
            .get_mut(&document_id)
            .filter(|d| d.team_id == team_id)
        else {
            return Ok(ReleaseOutcome::Conflict);
        };
        if DocumentStatus::parse(&doc.status) != Some(DocumentStatus::SuggestedMatch) {
            return Ok(ReleaseOutcome::Conflict);
        }
        let transaction_id = doc.suggested_transaction_id;
        doc.status = DocumentStatus::Pending.as_str().to_string();
        doc.suggested_transaction_id = None;
        doc.suggested_confidence = None;
        doc.updated_utc = Utc::now();
        Ok(ReleaseOutcome::Released { transaction_id })
    }

    async fn release_match(
        &self,
        team_id: Uuid,
        document_id: Uuid,
    ) -> Result<ReleaseOutcome, AppError> {
        let now = Utc::now();
        let mut world = self.world.write().await;
        let Some(doc) = world
            .documents
            .get_mut(&document_id)
            .filter(|d| d.team_id == team_id)
        else {
            return Ok(ReleaseOutcome::Conflict);
        };
        if DocumentStatus::parse(&doc.status) != Some(DocumentStatus::Done) {
            return Ok(ReleaseOutcome::Conflict);
        }
        let transaction_id = doc.matched_transaction_id;
        doc.status = DocumentStatus::Pending.as_str().to_string();
        doc.matched_transaction_id = None;
        doc.match_confidence = None;
        doc.evaluation_attempts = 0;
        doc.updated_utc = now;

        if let Some(txn_id) = transaction_id {
            if let Some(txn) = world.transactions.get_mut(&txn_id) {
                txn.matched_document_id = None;
                txn.match_confidence = None;
                txn.updated_utc = now;
            }
        }
        Ok(ReleaseOutcome::Released { transaction_id })
    }

    async fn release_transaction_link(
        &self,
        team_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<(), AppError> {
        let mut world = self.world.write().await;
        if let Some(txn) = world
            .transactions
            .get_mut(&transaction_id)
            .filter(|t| t.team_id == team_id)
        {
            txn.matched_document_id = None;
            txn.match_confidence = None;
            txn.updated_utc = Utc::now();
        }
        Ok(())
    }

    async fn record_empty_cycle(
        &self,
        team_id: Uuid,
        document_id: Uuid,
        max_attempts: i32,
    ) -> Result<EmptyCycleOutcome, AppError> {
        let now = Utc::now();
        let mut world = self.world.write().await;
        let Some(doc) = world
            .documents
            .get_mut(&document_id)
            .filter(|d| d.team_id == team_id)
        else {
            return Ok(EmptyCycleOutcome::Conflict);
        };
        if DocumentStatus::parse(&doc.status) != Some(DocumentStatus::Pending) {
            return Ok(EmptyCycleOutcome::Conflict);
        }
        doc.evaluation_attempts += 1;
        doc.last_evaluated_utc = Some(now);
        doc.updated_utc = now;
        if doc.evaluation_attempts >= max_attempts {
            doc.status = DocumentStatus::NoMatch.as_str().to_string();
            Ok(EmptyCycleOutcome::MarkedNoMatch)
        } else {
            Ok(EmptyCycleOutcome::StillPending {
                attempts: doc.evaluation_attempts,
            })
        }
    }

    async fn touch_last_evaluated(
        &self,
        team_id: Uuid,
        document_id: Uuid,
    ) -> Result<(), AppError> {
        let mut world = self.world.write().await;
        if let Some(doc) = world
            .documents
            .get_mut(&document_id)
            .filter(|d| d.team_id == team_id)
        {
            doc.last_evaluated_utc = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_decision(&self, decision: &MatchDecision) -> Result<(), AppError> {
        let mut world = self.world.write().await;
        world.decisions.push(decision.clone());
        Ok(())
    }

    async fn decisions_for_team(&self, team_id: Uuid) -> Result<Vec<MatchDecision>, AppError> {
        let world = self.world.read().await;
        let mut decisions: Vec<MatchDecision> = world
            .decisions
            .iter()
            .filter(|d| d.team_id == team_id)
            .cloned()
            .collect();
        decisions.sort_by(|a, b| b.decided_utc.cmp(&a.decided_utc));
        Ok(decisions)
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn txn(team_id: Uuid) -> Transaction {
        Transaction {
            transaction_id: Uuid::new_v4(),
            team_id,
            bank_account_id: Uuid::new_v4(),
            amount_minor: -4999,
            currency: "USD".to_string(),
            transaction_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            counterparty_name: Some("Acme Inc".to_string()),
            raw_description: "ACME INC".to_string(),
            matched_document_id: None,
            match_confidence: None,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        }
    }

    fn doc(team_id: Uuid, status: DocumentStatus) -> InboxDocument {
        InboxDocument {
            document_id: Uuid::new_v4(),
            team_id,
            extracted_amount: Some(Decimal::new(4999, 2)),
            extracted_currency: Some("USD".to_string()),
            extracted_date: Some(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()),
            extracted_counterparty: Some("Acme Inc.".to_string()),
            status: status.as_str().to_string(),
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

    #[tokio::test]
    async fn test_claim_links_both_sides() {
        let team_id = Uuid::new_v4();
        let store = InMemoryStore::new();
        let t = txn(team_id);
        let d = doc(team_id, DocumentStatus::Pending);
        store.insert_transaction(t.clone()).await;
        store.insert_document(d.clone()).await;

        let outcome = store
            .claim_match(team_id, t.transaction_id, d.document_id, 0.95)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Claimed {
                displaced_transaction: None,
                displaced_document: None,
            }
        );

        let stored_txn = store
            .get_transaction(team_id, t.transaction_id)
            .await
            .unwrap()
            .unwrap();
        let stored_doc = store
            .get_document(team_id, d.document_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_txn.matched_document_id, Some(d.document_id));
        assert_eq!(stored_txn.match_confidence, Some(0.95));
        assert_eq!(stored_doc.status, "done");
        assert_eq!(stored_doc.matched_transaction_id, Some(t.transaction_id));
        assert_eq!(stored_doc.match_confidence, Some(0.95));
    }

    #[tokio::test]
    async fn test_claim_rejected_at_equal_confidence() {
        let team_id = Uuid::new_v4();
        let store = InMemoryStore::new();
        let t = txn(team_id);
        let d1 = doc(team_id, DocumentStatus::Pending);
        let d2 = doc(team_id, DocumentStatus::Pending);
        store.insert_transaction(t.clone()).await;
        store.insert_document(d1.clone()).await;
        store.insert_document(d2.clone()).await;

        store
            .claim_match(team_id, t.transaction_id, d1.document_id, 0.95)
            .await
            .unwrap();
        let outcome = store
            .claim_match(team_id, t.transaction_id, d2.document_id, 0.95)
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::Conflict);

        let stored_txn = store
            .get_transaction(team_id, t.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_txn.matched_document_id, Some(d1.document_id));
    }

    #[tokio::test]
    async fn test_claim_upgrade_displaces_weaker_document() {
        let team_id = Uuid::new_v4();
        let store = InMemoryStore::new();
        let t = txn(team_id);
        let weaker = doc(team_id, DocumentStatus::Pending);
        let stronger = doc(team_id, DocumentStatus::Pending);
        store.insert_transaction(t.clone()).await;
        store.insert_document(weaker.clone()).await;
        store.insert_document(stronger.clone()).await;

        store
            .claim_match(team_id, t.transaction_id, weaker.document_id, 0.92)
            .await
            .unwrap();
        let outcome = store
            .claim_match(team_id, t.transaction_id, stronger.document_id, 0.95)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Claimed {
                displaced_transaction: None,
                displaced_document: Some(weaker.document_id),
            }
        );

        let displaced = store
            .get_document(team_id, weaker.document_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(displaced.status, "pending");
        assert_eq!(displaced.matched_transaction_id, None);
        assert_eq!(displaced.match_confidence, None);
    }

    #[tokio::test]
    async fn test_claim_same_pair_is_noop() {
        let team_id = Uuid::new_v4();
        let store = InMemoryStore::new();
        let t = txn(team_id);
        let d = doc(team_id, DocumentStatus::Pending);
        store.insert_transaction(t.clone()).await;
        store.insert_document(d.clone()).await;

        store
            .claim_match(team_id, t.transaction_id, d.document_id, 0.95)
            .await
            .unwrap();
        let outcome = store
            .claim_match(team_id, t.transaction_id, d.document_id, 0.95)
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::AlreadyLinked);
    }

    #[tokio::test]
    async fn test_claim_rejects_unclaimable_statuses() {
        let team_id = Uuid::new_v4();
        let store = InMemoryStore::new();
        let t = txn(team_id);
        store.insert_transaction(t.clone()).await;
        for status in [
            DocumentStatus::New,
            DocumentStatus::Analyzing,
            DocumentStatus::NoMatch,
            DocumentStatus::Other,
        ] {
            let d = doc(team_id, status);
            store.insert_document(d.clone()).await;
            let outcome = store
                .claim_match(team_id, t.transaction_id, d.document_id, 0.95)
                .await
                .unwrap();
            assert_eq!(outcome, ClaimOutcome::Conflict, "status {}", status.as_str());
        }
    }

    #[tokio::test]
    async fn test_manual_confidence_is_never_displaced() {
        let team_id = Uuid::new_v4();
        let store = InMemoryStore::new();
        let t = txn(team_id);
        let manual = doc(team_id, DocumentStatus::Pending);
        let rival = doc(team_id, DocumentStatus::Pending);
        store.insert_transaction(t.clone()).await;
        store.insert_document(manual.clone()).await;
        store.insert_document(rival.clone()).await;

        store
            .claim_match(team_id, t.transaction_id, manual.document_id, 1.0)
            .await
            .unwrap();
        let outcome = store
            .claim_match(team_id, t.transaction_id, rival.document_id, 1.0)
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::Conflict);
    }

    #[tokio::test]
    async fn test_suggestion_leaves_transaction_untouched() {
        let team_id = Uuid::new_v4();
        let store = InMemoryStore::new();
        let t = txn(team_id);
        let d = doc(team_id, DocumentStatus::Pending);
        store.insert_transaction(t.clone()).await;
        store.insert_document(d.clone()).await;

        let outcome = store
            .suggest_match(team_id, d.document_id, t.transaction_id, 0.75)
            .await
            .unwrap();
        assert_eq!(outcome, SuggestOutcome::Applied { replaced: None });

        let stored_txn = store
            .get_transaction(team_id, t.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_txn.matched_document_id, None);
        let stored_doc = store
            .get_document(team_id, d.document_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_doc.status, "suggested_match");
        assert_eq!(stored_doc.suggested_transaction_id, Some(t.transaction_id));
        assert_eq!(stored_doc.suggested_confidence, Some(0.75));
    }

    #[tokio::test]
    async fn test_repeat_suggestion_is_unchanged() {
        let team_id = Uuid::new_v4();
        let store = InMemoryStore::new();
        let t = txn(team_id);
        let d = doc(team_id, DocumentStatus::Pending);
        store.insert_transaction(t.clone()).await;
        store.insert_document(d.clone()).await;

        store
            .suggest_match(team_id, d.document_id, t.transaction_id, 0.75)
            .await
            .unwrap();
        let outcome = store
            .suggest_match(team_id, d.document_id, t.transaction_id, 0.75)
            .await
            .unwrap();
        assert_eq!(outcome, SuggestOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_stronger_suggestion_replaces_weaker() {
        let team_id = Uuid::new_v4();
        let store = InMemoryStore::new();
        let t1 = txn(team_id);
        let t2 = txn(team_id);
        let d = doc(team_id, DocumentStatus::Pending);
        store.insert_transaction(t1.clone()).await;
        store.insert_transaction(t2.clone()).await;
        store.insert_document(d.clone()).await;

        store
            .suggest_match(team_id, d.document_id, t1.transaction_id, 0.70)
            .await
            .unwrap();
        let outcome = store
            .suggest_match(team_id, d.document_id, t2.transaction_id, 0.80)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SuggestOutcome::Applied {
                replaced: Some(t1.transaction_id)
            }
        );

        let weaker = store
            .suggest_match(team_id, d.document_id, t1.transaction_id, 0.70)
            .await
            .unwrap();
        assert_eq!(weaker, SuggestOutcome::Conflict);
    }

    #[tokio::test]
    async fn test_suggest_on_done_document_conflicts() {
        let team_id = Uuid::new_v4();
        let store = InMemoryStore::new();
        let t = txn(team_id);
        let rival = txn(team_id);
        let d = doc(team_id, DocumentStatus::Pending);
        store.insert_transaction(t.clone()).await;
        store.insert_transaction(rival.clone()).await;
        store.insert_document(d.clone()).await;

        store
            .claim_match(team_id, t.transaction_id, d.document_id, 0.95)
            .await
            .unwrap();
        let outcome = store
            .suggest_match(team_id, d.document_id, rival.transaction_id, 0.80)
            .await
            .unwrap();
        assert_eq!(outcome, SuggestOutcome::Conflict);
    }

    #[tokio::test]
    async fn test_release_match_clears_both_sides() {
        let team_id = Uuid::new_v4();
        let store = InMemoryStore::new();
        let t = txn(team_id);
        let d = doc(team_id, DocumentStatus::Pending);
        store.insert_transaction(t.clone()).await;
        store.insert_document(d.clone()).await;

        store
            .claim_match(team_id, t.transaction_id, d.document_id, 0.95)
            .await
            .unwrap();
        let outcome = store.release_match(team_id, d.document_id).await.unwrap();
        assert_eq!(
            outcome,
            ReleaseOutcome::Released {
                transaction_id: Some(t.transaction_id)
            }
        );

        let stored_txn = store
            .get_transaction(team_id, t.transaction_id)
            .await
            .unwrap()
            .unwrap();
        let stored_doc = store
            .get_document(team_id, d.document_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_txn.matched_document_id, None);
        assert_eq!(stored_doc.status, "pending");
        assert_eq!(stored_doc.evaluation_attempts, 0);
    }

    #[tokio::test]
    async fn test_empty_cycles_reach_no_match_horizon() {
        let team_id = Uuid::new_v4();
        let store = InMemoryStore::new();
        let d = doc(team_id, DocumentStatus::Pending);
        store.insert_document(d.clone()).await;

        for attempt in 1..5 {
            let outcome = store
                .record_empty_cycle(team_id, d.document_id, 5)
                .await
                .unwrap();
            assert_eq!(outcome, EmptyCycleOutcome::StillPending { attempts: attempt });
        }
        let outcome = store
            .record_empty_cycle(team_id, d.document_id, 5)
            .await
            .unwrap();
        assert_eq!(outcome, EmptyCycleOutcome::MarkedNoMatch);

        let stored = store
            .get_document(team_id, d.document_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "no_match");
    }

    #[tokio::test]
    async fn test_reopen_no_match_in_window() {
        let team_id = Uuid::new_v4();
        let store = InMemoryStore::new();
        let mut inside = doc(team_id, DocumentStatus::NoMatch);
        inside.evaluation_attempts = 5;
        let mut outside = doc(team_id, DocumentStatus::NoMatch);
        outside.extracted_date = Some(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        store.insert_document(inside.clone()).await;
        store.insert_document(outside.clone()).await;

        let window = DateWindow::around(NaiveDate::from_ymd_opt(2024, 3, 3).unwrap(), 10);
        let reopened = store
            .reopen_no_match_in_window(team_id, window)
            .await
            .unwrap();
        assert_eq!(reopened, 1);

        let stored = store
            .get_document(team_id, inside.document_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "pending");
        assert_eq!(stored.evaluation_attempts, 0);
        let untouched = store
            .get_document(team_id, outside.document_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.status, "no_match");
    }

    #[tokio::test]
    async fn test_candidate_documents_exclude_fully_confident_links() {
        let team_id = Uuid::new_v4();
        let store = InMemoryStore::new();
        let t = txn(team_id);
        let perfect = doc(team_id, DocumentStatus::Pending);
        let beatable = doc(team_id, DocumentStatus::Pending);
        let other_txn = txn(team_id);
        store.insert_transaction(t.clone()).await;
        store.insert_transaction(other_txn.clone()).await;
        store.insert_document(perfect.clone()).await;
        store.insert_document(beatable.clone()).await;

        store
            .claim_match(team_id, t.transaction_id, perfect.document_id, 1.0)
            .await
            .unwrap();
        store
            .claim_match(team_id, other_txn.transaction_id, beatable.document_id, 0.92)
            .await
            .unwrap();

        let window = DateWindow::around(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(), 10);
        let pool = store.candidate_documents(team_id, window).await.unwrap();
        let ids: Vec<Uuid> = pool.iter().map(|d| d.document_id).collect();
        assert_eq!(ids, vec![beatable.document_id]);
    }
}
