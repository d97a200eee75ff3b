//! Evaluation orchestration.
//!
//! An evaluation is anchored at one entity, a transaction or an inbox
//! document, and runs the full pipeline against it: candidate retrieval,
//! signal scoring, combination, ranking, then a claim or suggestion
//! through the store's conditional updates. Losing a claim to a concurrent
//! evaluation is an expected outcome and falls back to the next candidate.
//!
//! Scorers and the decision layer are pure; every state change goes
//! through [`MatchStore`] so the same orchestrator runs against Postgres
//! in production and the in-memory store in tests.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use service_core::error::AppError;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::ScoringConfig;
use crate::engine::candidates::{self, amount_bounds_major, DateWindow};
use crate::engine::decision::{classify, combine, rank, Classification, ScoredCandidate};
use crate::engine::scorers::score_pair;
use crate::engine::state::{ClaimOutcome, EmptyCycleOutcome, ReleaseOutcome, SuggestOutcome};
use crate::models::{
    AnchorRef, DecisionOutcome, DocumentStatus, InboxDocument, MatchDecision, MatchEvent,
    Transaction,
};
use crate::services::events::EventPublisher;
use crate::services::fx::FxRateSource;
use crate::services::metrics::{
    record_decision, record_evaluation, CLAIM_CONFLICTS, EVALUATION_DURATION, FX_DEGRADATIONS,
};
use crate::services::store::MatchStore;

// ============================================================================
// Evaluation Report
// ============================================================================

/// Counters describing what one evaluation run did.
#[derive(Debug, Default, Clone)]
pub struct EvaluationReport {
    pub documents_evaluated: u32,
    pub auto_matched: u32,
    pub suggested: u32,
    pub unmatched_events: u32,
    pub marked_no_match: u32,
    pub claim_conflicts: u32,
    pub fx_degraded: bool,
}

// ============================================================================
// FX rate memoization
// ============================================================================

/// Per-evaluation cache of FX lookups. A failing rate source is asked at
/// most once per run; all later lookups degrade to abstention.
struct RateCache {
    rates: HashMap<(String, String, NaiveDate), Option<Decimal>>,
    degraded: bool,
}

impl RateCache {
    fn new() -> Self {
        Self {
            rates: HashMap::new(),
            degraded: false,
        }
    }

    async fn get(
        &mut self,
        fx: &dyn FxRateSource,
        from: &str,
        to: &str,
        as_of: NaiveDate,
    ) -> Option<Decimal> {
        let key = (from.to_string(), to.to_string(), as_of);
        if let Some(cached) = self.rates.get(&key) {
            return *cached;
        }
        if self.degraded {
            return None;
        }
        let fetched = match fx.rate(from, to, as_of).await {
            Ok(rate) => rate,
            Err(e) => {
                warn!(
                    error = %e,
                    from = %from,
                    to = %to,
                    "FX rate source unavailable, cross-currency signal abstains"
                );
                FX_DEGRADATIONS.inc();
                self.degraded = true;
                None
            }
        };
        self.rates.insert(key, fetched);
        fetched
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Which side of the pair anchors the current claim loop. Decides how a
/// suggestion conflict is handled: for a document anchor a standing better
/// suggestion settles the run, for a transaction anchor the loop moves on
/// to the next document.
#[derive(Clone, Copy, PartialEq, Eq)]
enum AnchorSide {
    Document,
    Transaction,
}

/// A ranked candidate together with the entities it refers to.
struct ScoredPair<'a> {
    candidate: ScoredCandidate,
    txn: &'a Transaction,
    doc: &'a InboxDocument,
}

pub struct Orchestrator {
    store: Arc<dyn MatchStore>,
    fx: Arc<dyn FxRateSource>,
    events: Arc<dyn EventPublisher>,
    config: ScoringConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn MatchStore>,
        fx: Arc<dyn FxRateSource>,
        events: Arc<dyn EventPublisher>,
        config: ScoringConfig,
    ) -> Self {
        Self {
            store,
            fx,
            events,
            config,
        }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Run one evaluation cycle for the given anchor.
    #[instrument(skip(self), fields(team_id = %team_id, anchor = %anchor))]
    pub async fn evaluate(
        &self,
        team_id: Uuid,
        anchor: AnchorRef,
    ) -> Result<EvaluationReport, AppError> {
        let timer = EVALUATION_DURATION
            .with_label_values(&[anchor.kind()])
            .start_timer();

        let result = match anchor {
            AnchorRef::Document(document_id) => self.evaluate_document(team_id, document_id).await,
            AnchorRef::Transaction(transaction_id) => {
                self.evaluate_transaction(team_id, transaction_id).await
            }
        };

        timer.observe_duration();
        match &result {
            Ok(report) => {
                record_evaluation(anchor.kind(), "completed");
                debug!(?report, "Evaluation completed");
            }
            Err(e) => record_evaluation(anchor.kind(), e.kind()),
        }
        result
    }

    // ===== Document-anchored evaluation =====

    async fn evaluate_document(
        &self,
        team_id: Uuid,
        document_id: Uuid,
    ) -> Result<EvaluationReport, AppError> {
        let mut report = EvaluationReport::default();
        let mut rates = RateCache::new();

        let Some(doc) = self.store.get_document(team_id, document_id).await? else {
            return Err(AppError::DataIntegrity(anyhow::anyhow!(
                "Document {} not found for team {}",
                document_id,
                team_id
            )));
        };

        match doc.status()? {
            DocumentStatus::New | DocumentStatus::Analyzing => {
                // Extraction has not produced a scorable document yet.
                debug!(document_id = %document_id, "Document not ready for matching");
                return Ok(report);
            }
            DocumentStatus::Other => {
                self.store.touch_last_evaluated(team_id, document_id).await?;
                return Ok(report);
            }
            DocumentStatus::Done => {
                let Some(linked_txn) = doc.matched_transaction_id else {
                    return Err(AppError::DataIntegrity(anyhow::anyhow!(
                        "Document {} is done without a matched transaction",
                        document_id
                    )));
                };
                if self.store.get_transaction(team_id, linked_txn).await?.is_some() {
                    self.store.touch_last_evaluated(team_id, document_id).await?;
                    return Ok(report);
                }
                // The linked transaction was deleted upstream; release the
                // document back into evaluation.
                match self.store.release_match(team_id, document_id).await? {
                    ReleaseOutcome::Released { transaction_id } => {
                        info!(
                            document_id = %document_id,
                            "Released match whose transaction no longer exists"
                        );
                        self.publish(MatchEvent::unmatched(team_id, transaction_id, document_id))
                            .await;
                        report.unmatched_events += 1;
                    }
                    ReleaseOutcome::Conflict => return Ok(report),
                }
            }
            DocumentStatus::NoMatch => {
                // An explicit evaluation request reopens a parked document.
                if !self.store.reopen_document(team_id, document_id).await? {
                    return Ok(report);
                }
            }
            DocumentStatus::Pending | DocumentStatus::SuggestedMatch => {}
        }

        let Some(doc) = self.store.get_document(team_id, document_id).await? else {
            return Ok(report);
        };
        self.evaluate_document_inner(team_id, &doc, &mut report, &mut rates)
            .await?;
        report.fx_degraded = rates.degraded;
        Ok(report)
    }

    /// Score, rank and settle one open document against its candidate pool.
    async fn evaluate_document_inner(
        &self,
        team_id: Uuid,
        doc: &InboxDocument,
        report: &mut EvaluationReport,
        rates: &mut RateCache,
    ) -> Result<(), AppError> {
        report.documents_evaluated += 1;

        let pool = candidates::for_document(self.store.as_ref(), doc, &self.config).await?;
        let mut pairs = Vec::with_capacity(pool.len());
        for txn in &pool {
            if let Some(candidate) = self.score_one(txn, doc, rates).await {
                pairs.push(ScoredPair {
                    candidate,
                    txn,
                    doc,
                });
            }
        }

        if pairs.is_empty() {
            return self.settle_empty_cycle(team_id, doc, report).await;
        }
        if self
            .apply_best(team_id, AnchorSide::Document, &pairs, report)
            .await?
        {
            return Ok(());
        }
        // Every qualifying candidate was claimed away by concurrent
        // evaluations; the cycle ends with nothing for this document.
        self.settle_empty_cycle(team_id, doc, report).await
    }

    // ===== Transaction-anchored evaluation =====

    async fn evaluate_transaction(
        &self,
        team_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<EvaluationReport, AppError> {
        let mut report = EvaluationReport::default();
        let mut rates = RateCache::new();

        let Some(mut txn) = self.store.get_transaction(team_id, transaction_id).await? else {
            return Err(AppError::DataIntegrity(anyhow::anyhow!(
                "Transaction {} not found for team {}",
                transaction_id,
                team_id
            )));
        };

        if let Some(doc_id) = txn.matched_document_id {
            if self.store.get_document(team_id, doc_id).await?.is_none() {
                // The linked document was deleted upstream.
                self.store
                    .release_transaction_link(team_id, transaction_id)
                    .await?;
                info!(
                    transaction_id = %transaction_id,
                    "Released link whose document no longer exists"
                );
                self.publish(MatchEvent::unmatched(team_id, Some(transaction_id), doc_id))
                    .await;
                report.unmatched_events += 1;
                txn.matched_document_id = None;
                txn.match_confidence = None;
            }
        }

        // A newly arrived transaction can revive documents that were parked
        // as no_match before it existed.
        let window = DateWindow::around(txn.transaction_date, self.config.candidate_window_days());
        let (lo, hi) = amount_bounds_major(txn.amount_major(), self.config.amount_tolerance);
        let reopened = self.store.reopen_no_match_in_window(team_id, window).await?
            + self
                .store
                .reopen_no_match_by_amount(team_id, &txn.currency, lo, hi)
                .await?;
        if reopened > 0 {
            info!(count = reopened, "Reopened parked documents for new transaction");
        }

        // Direct match against the transaction's own candidate pool.
        let pool = candidates::for_transaction(self.store.as_ref(), &txn, &self.config).await?;
        let mut pairs = Vec::with_capacity(pool.len());
        for doc in &pool {
            if let Some(candidate) = self.score_one(&txn, doc, &mut rates).await {
                pairs.push(ScoredPair {
                    candidate,
                    txn: &txn,
                    doc,
                });
            }
        }
        if !pairs.is_empty() {
            self.apply_best(team_id, AnchorSide::Transaction, &pairs, &mut report)
                .await?;
        }

        // Fan out: open documents near this transaction get a fresh cycle,
        // their best candidate may now be this transaction.
        let mut open = self.store.open_documents(team_id, window).await?;
        let undated = self
            .store
            .open_documents_by_amount(team_id, &txn.currency, lo, hi)
            .await?;
        open.extend(undated);
        open.sort_by_key(|d| {
            let distance = d
                .extracted_date
                .map(|date| (txn.transaction_date - date).num_days().abs())
                .unwrap_or(i64::MAX);
            (distance, d.document_id)
        });
        open.truncate(self.config.candidate_limit);

        for doc in &open {
            if let Err(e) = self
                .evaluate_document_inner(team_id, doc, &mut report, &mut rates)
                .await
            {
                if e.is_retryable() {
                    return Err(e);
                }
                warn!(
                    error = %e,
                    document_id = %doc.document_id,
                    "Skipping document during fan-out"
                );
            }
        }

        report.fx_degraded = rates.degraded;
        Ok(report)
    }

    // ===== Shared pipeline pieces =====

    /// Score a single pair. Returns `None` when every signal abstained or
    /// the combined score falls below the suggestion floor; such pairs
    /// contribute nothing to the evaluation.
    async fn score_one(
        &self,
        txn: &Transaction,
        doc: &InboxDocument,
        rates: &mut RateCache,
    ) -> Option<ScoredCandidate> {
        let rate = self.rate_for(txn, doc, rates).await;
        let signals = score_pair(txn, doc, rate, &self.config);
        let combined = combine(&signals)?;
        if classify(combined.value, &self.config) == Classification::NoContribution {
            return None;
        }
        Some(ScoredCandidate {
            transaction_id: txn.transaction_id,
            document_id: doc.document_id,
            combined: combined.value,
            cross_currency: combined.cross_currency,
            date_distance_days: doc
                .extracted_date
                .map(|d| (txn.transaction_date - d).num_days().abs()),
            signals,
        })
    }

    async fn rate_for(
        &self,
        txn: &Transaction,
        doc: &InboxDocument,
        rates: &mut RateCache,
    ) -> Option<Decimal> {
        let from = doc.extracted_currency.as_deref()?;
        if from == txn.currency || doc.extracted_amount.is_none() {
            return None;
        }
        rates
            .get(self.fx.as_ref(), from, &txn.currency, txn.transaction_date)
            .await
    }

    /// Walk the ranked candidates best-first and settle the anchor with a
    /// claim or suggestion. Returns whether the run ended with a link or
    /// suggestion in place (including pre-existing ones found unchanged).
    async fn apply_best(
        &self,
        team_id: Uuid,
        side: AnchorSide,
        pairs: &[ScoredPair<'_>],
        report: &mut EvaluationReport,
    ) -> Result<bool, AppError> {
        let mut ranked: Vec<ScoredCandidate> =
            pairs.iter().map(|p| p.candidate.clone()).collect();
        rank(&mut ranked);
        let by_pair: HashMap<(Uuid, Uuid), usize> = pairs
            .iter()
            .enumerate()
            .map(|(i, p)| ((p.candidate.transaction_id, p.candidate.document_id), i))
            .collect();

        for candidate in &ranked {
            let Some(&idx) = by_pair.get(&(candidate.transaction_id, candidate.document_id))
            else {
                continue;
            };
            let pair = &pairs[idx];

            match classify(candidate.combined, &self.config) {
                Classification::Auto => {
                    match self
                        .store
                        .claim_match(
                            team_id,
                            candidate.transaction_id,
                            candidate.document_id,
                            candidate.combined,
                        )
                        .await?
                    {
                        ClaimOutcome::Claimed {
                            displaced_transaction,
                            displaced_document,
                        } => {
                            self.announce_claim(
                                team_id,
                                pair,
                                displaced_transaction,
                                displaced_document,
                                report,
                            )
                            .await?;
                            return Ok(true);
                        }
                        // Re-running over unchanged inputs finds the link
                        // already in place and changes nothing.
                        ClaimOutcome::AlreadyLinked => return Ok(true),
                        ClaimOutcome::Conflict => {
                            debug!(
                                transaction_id = %candidate.transaction_id,
                                document_id = %candidate.document_id,
                                "Claim lost to a concurrent or stronger match"
                            );
                            report.claim_conflicts += 1;
                            CLAIM_CONFLICTS.inc();
                            continue;
                        }
                    }
                }
                Classification::Suggested => {
                    match self
                        .store
                        .suggest_match(
                            team_id,
                            candidate.document_id,
                            candidate.transaction_id,
                            candidate.combined,
                        )
                        .await?
                    {
                        SuggestOutcome::Applied { .. } => {
                            report.suggested += 1;
                            self.publish(MatchEvent::suggested(
                                team_id,
                                candidate.transaction_id,
                                candidate.document_id,
                                candidate.combined,
                            ))
                            .await;
                            record_decision(DecisionOutcome::Suggested.as_str());
                            self.store
                                .record_decision(&MatchDecision::new(
                                    team_id,
                                    candidate.transaction_id,
                                    candidate.document_id,
                                    DecisionOutcome::Suggested,
                                    candidate.combined,
                                    None,
                                ))
                                .await?;
                            return Ok(true);
                        }
                        SuggestOutcome::Unchanged => return Ok(true),
                        SuggestOutcome::Conflict => match side {
                            // The document already holds an equal or better
                            // suggestion; nothing to improve here.
                            AnchorSide::Document => return Ok(true),
                            // This document is spoken for; the transaction
                            // may still suit the next one.
                            AnchorSide::Transaction => continue,
                        },
                    }
                }
                Classification::NoContribution => break,
            }
        }
        Ok(false)
    }

    async fn announce_claim(
        &self,
        team_id: Uuid,
        pair: &ScoredPair<'_>,
        displaced_transaction: Option<Uuid>,
        displaced_document: Option<Uuid>,
        report: &mut EvaluationReport,
    ) -> Result<(), AppError> {
        report.auto_matched += 1;

        if let Some(prev_doc) = displaced_document {
            self.publish(MatchEvent::unmatched(
                team_id,
                Some(pair.txn.transaction_id),
                prev_doc,
            ))
            .await;
            report.unmatched_events += 1;
        }
        if let Some(prev_txn) = displaced_transaction {
            self.publish(MatchEvent::unmatched(
                team_id,
                Some(prev_txn),
                pair.doc.document_id,
            ))
            .await;
            report.unmatched_events += 1;
        }

        let event = if pair.candidate.cross_currency {
            record_decision("auto_cross_currency");
            MatchEvent::cross_currency_matched(
                team_id,
                pair.txn.transaction_id,
                pair.doc.document_id,
                pair.candidate.combined,
                pair.doc.extracted_currency.clone().unwrap_or_default(),
                pair.txn.currency.clone(),
            )
        } else {
            record_decision(DecisionOutcome::Auto.as_str());
            MatchEvent::matched(
                team_id,
                pair.txn.transaction_id,
                pair.doc.document_id,
                pair.candidate.combined,
            )
        };
        self.publish(event).await;

        self.store
            .record_decision(&MatchDecision::new(
                team_id,
                pair.txn.transaction_id,
                pair.doc.document_id,
                DecisionOutcome::Auto,
                pair.candidate.combined,
                None,
            ))
            .await?;
        Ok(())
    }

    /// Settle a cycle that produced neither a link nor a suggestion. A
    /// stale suggestion is cleared, and the bounded retry counter moves
    /// the document toward no_match.
    async fn settle_empty_cycle(
        &self,
        team_id: Uuid,
        doc: &InboxDocument,
        report: &mut EvaluationReport,
    ) -> Result<(), AppError> {
        if doc.status()? == DocumentStatus::SuggestedMatch {
            match self.store.clear_suggestion(team_id, doc.document_id).await? {
                ReleaseOutcome::Released { transaction_id } => {
                    info!(
                        document_id = %doc.document_id,
                        "Cleared suggestion without a qualifying candidate"
                    );
                    self.publish(MatchEvent::unmatched(
                        team_id,
                        transaction_id,
                        doc.document_id,
                    ))
                    .await;
                    report.unmatched_events += 1;
                }
                // Concurrently mutated; the fresh state gets its own cycle.
                ReleaseOutcome::Conflict => return Ok(()),
            }
        }

        match self
            .store
            .record_empty_cycle(team_id, doc.document_id, self.config.max_evaluation_attempts)
            .await?
        {
            EmptyCycleOutcome::MarkedNoMatch => {
                report.marked_no_match += 1;
                info!(
                    document_id = %doc.document_id,
                    attempts = self.config.max_evaluation_attempts,
                    "Document parked as no_match after unproductive cycles"
                );
            }
            EmptyCycleOutcome::StillPending { attempts } => {
                debug!(
                    document_id = %doc.document_id,
                    attempts = attempts,
                    "Unproductive evaluation cycle recorded"
                );
            }
            EmptyCycleOutcome::Conflict => {}
        }
        Ok(())
    }

    async fn publish(&self, event: MatchEvent) {
        if let Err(e) = self.events.publish(&event).await {
            warn!(
                error = %e,
                event = event.kind.as_str(),
                document_id = %event.document_id,
                "Failed to publish match event"
            );
        }
    }
}

// ============================================================================
// Human review commands
// ============================================================================

/// Review actions taken by humans: confirming or dismissing suggestions,
/// picking a match by hand, or unlinking a confirmed match. Manual links
/// are written at full confidence, which automatic evaluation can never
/// displace.
pub struct MatchCommands {
    store: Arc<dyn MatchStore>,
    events: Arc<dyn EventPublisher>,
}

impl MatchCommands {
    pub fn new(store: Arc<dyn MatchStore>, events: Arc<dyn EventPublisher>) -> Self {
        Self { store, events }
    }

    /// Confirm a standing suggestion, linking both sides at full confidence.
    #[instrument(skip(self), fields(team_id = %team_id, document_id = %document_id))]
    pub async fn confirm_suggestion(
        &self,
        team_id: Uuid,
        document_id: Uuid,
        decided_by: Option<String>,
    ) -> Result<MatchDecision, AppError> {
        let Some(doc) = self.store.get_document(team_id, document_id).await? else {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Document {} not found",
                document_id
            )));
        };
        if doc.status()? != DocumentStatus::SuggestedMatch {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Document has no standing suggestion"
            )));
        }
        let Some(transaction_id) = doc.suggested_transaction_id else {
            return Err(AppError::DataIntegrity(anyhow::anyhow!(
                "Suggested document {} has no suggested transaction",
                document_id
            )));
        };

        match self
            .store
            .claim_match(team_id, transaction_id, document_id, 1.0)
            .await?
        {
            ClaimOutcome::Claimed {
                displaced_transaction,
                displaced_document,
            } => {
                self.emit_displacements(
                    team_id,
                    transaction_id,
                    document_id,
                    displaced_transaction,
                    displaced_document,
                )
                .await;
                self.publish(MatchEvent::matched(team_id, transaction_id, document_id, 1.0))
                    .await;
                record_decision(DecisionOutcome::Auto.as_str());
                let decision = MatchDecision::new(
                    team_id,
                    transaction_id,
                    document_id,
                    DecisionOutcome::Auto,
                    1.0,
                    decided_by,
                );
                self.store.record_decision(&decision).await?;
                Ok(decision)
            }
            ClaimOutcome::AlreadyLinked | ClaimOutcome::Conflict => Err(AppError::Conflict(
                anyhow::anyhow!("Suggested transaction is no longer available"),
            )),
        }
    }

    /// Dismiss a standing suggestion, returning the document to pending.
    #[instrument(skip(self), fields(team_id = %team_id, document_id = %document_id))]
    pub async fn dismiss_suggestion(
        &self,
        team_id: Uuid,
        document_id: Uuid,
    ) -> Result<(), AppError> {
        match self.store.clear_suggestion(team_id, document_id).await? {
            ReleaseOutcome::Released { transaction_id } => {
                self.publish(MatchEvent::unmatched(team_id, transaction_id, document_id))
                    .await;
                Ok(())
            }
            ReleaseOutcome::Conflict => Err(AppError::Conflict(anyhow::anyhow!(
                "Document has no standing suggestion"
            ))),
        }
    }

    /// Link a document to a transaction picked by a human.
    #[instrument(
        skip(self),
        fields(team_id = %team_id, document_id = %document_id, transaction_id = %transaction_id)
    )]
    pub async fn manual_match(
        &self,
        team_id: Uuid,
        document_id: Uuid,
        transaction_id: Uuid,
        decided_by: Option<String>,
    ) -> Result<MatchDecision, AppError> {
        let Some(doc) = self.store.get_document(team_id, document_id).await? else {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Document {} not found",
                document_id
            )));
        };
        if self
            .store
            .get_transaction(team_id, transaction_id)
            .await?
            .is_none()
        {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Transaction {} not found",
                transaction_id
            )));
        }
        if doc.status()? == DocumentStatus::NoMatch {
            self.store.reopen_document(team_id, document_id).await?;
        }

        match self
            .store
            .claim_match(team_id, transaction_id, document_id, 1.0)
            .await?
        {
            ClaimOutcome::Claimed {
                displaced_transaction,
                displaced_document,
            } => {
                self.emit_displacements(
                    team_id,
                    transaction_id,
                    document_id,
                    displaced_transaction,
                    displaced_document,
                )
                .await;
                self.publish(MatchEvent::matched(team_id, transaction_id, document_id, 1.0))
                    .await;
                record_decision(DecisionOutcome::Auto.as_str());
                let decision = MatchDecision::new(
                    team_id,
                    transaction_id,
                    document_id,
                    DecisionOutcome::Auto,
                    1.0,
                    decided_by,
                );
                self.store.record_decision(&decision).await?;
                Ok(decision)
            }
            ClaimOutcome::AlreadyLinked => Err(AppError::Conflict(anyhow::anyhow!(
                "Document is already matched to this transaction"
            ))),
            // A standing full-confidence link must be unlinked explicitly
            // before it can be replaced.
            ClaimOutcome::Conflict => Err(AppError::Conflict(anyhow::anyhow!(
                "Document or transaction is already matched at full confidence"
            ))),
        }
    }

    /// Remove a confirmed link, returning the document to pending.
    #[instrument(skip(self), fields(team_id = %team_id, document_id = %document_id))]
    pub async fn unlink(&self, team_id: Uuid, document_id: Uuid) -> Result<(), AppError> {
        match self.store.release_match(team_id, document_id).await? {
            ReleaseOutcome::Released { transaction_id } => {
                self.publish(MatchEvent::unmatched(team_id, transaction_id, document_id))
                    .await;
                Ok(())
            }
            ReleaseOutcome::Conflict => Err(AppError::Conflict(anyhow::anyhow!(
                "Document is not matched"
            ))),
        }
    }

    async fn emit_displacements(
        &self,
        team_id: Uuid,
        transaction_id: Uuid,
        document_id: Uuid,
        displaced_transaction: Option<Uuid>,
        displaced_document: Option<Uuid>,
    ) {
        if let Some(prev_doc) = displaced_document {
            self.publish(MatchEvent::unmatched(team_id, Some(transaction_id), prev_doc))
                .await;
        }
        if let Some(prev_txn) = displaced_transaction {
            self.publish(MatchEvent::unmatched(team_id, Some(prev_txn), document_id))
                .await;
        }
    }

    async fn publish(&self, event: MatchEvent) {
        if let Err(e) = self.events.publish(&event).await {
            warn!(
                error = %e,
                event = event.kind.as_str(),
                document_id = %event.document_id,
                "Failed to publish match event"
            );
        }
    }
}
