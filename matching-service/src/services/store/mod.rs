//! Persistence contract for match state.
//!
//! The engine talks to storage only through [`MatchStore`], so the
//! evaluation pipeline and the regression harness can run against the
//! in-memory implementation while the service itself runs on Postgres.
//! Every write that touches a match link goes through one of the atomic
//! conditional operations below; callers never read-modify-write links.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::Database;

use async_trait::async_trait;
use rust_decimal::Decimal;
use service_core::error::AppError;
use uuid::Uuid;

use crate::engine::candidates::DateWindow;
use crate::engine::state::{ClaimOutcome, EmptyCycleOutcome, ReleaseOutcome, SuggestOutcome};
use crate::models::{InboxDocument, MatchDecision, Transaction};

#[async_trait]
pub trait MatchStore: Send + Sync {
    async fn get_transaction(
        &self,
        team_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, AppError>;

    async fn get_document(
        &self,
        team_id: Uuid,
        document_id: Uuid,
    ) -> Result<Option<InboxDocument>, AppError>;

    /// Dated documents eligible as candidates for a transaction anchor:
    /// pending, suggested, or linked at beatable (below 1.0) confidence,
    /// with an extracted date inside the window.
    async fn candidate_documents(
        &self,
        team_id: Uuid,
        window: DateWindow,
    ) -> Result<Vec<InboxDocument>, AppError>;

    /// Undated eligible documents whose absolute amount falls in the
    /// bucket. Documents without an extracted currency are included, since
    /// scoring assumes they are in the transaction's currency.
    async fn candidate_documents_by_amount(
        &self,
        team_id: Uuid,
        currency: &str,
        lo: Decimal,
        hi: Decimal,
    ) -> Result<Vec<InboxDocument>, AppError>;

    /// Transactions eligible as candidates for a document anchor:
    /// unmatched or linked at beatable confidence, dated inside the window.
    async fn candidate_transactions(
        &self,
        team_id: Uuid,
        window: DateWindow,
    ) -> Result<Vec<Transaction>, AppError>;

    /// Eligible transactions in an absolute minor-unit amount bucket.
    /// `currency: None` matches any currency.
    async fn candidate_transactions_by_amount(
        &self,
        team_id: Uuid,
        currency: Option<&str>,
        lo_minor: i64,
        hi_minor: i64,
    ) -> Result<Vec<Transaction>, AppError>;

    /// Open (pending or suggested) dated documents a newly arrived
    /// transaction fans out to for re-evaluation.
    async fn open_documents(
        &self,
        team_id: Uuid,
        window: DateWindow,
    ) -> Result<Vec<InboxDocument>, AppError>;

    /// Open undated documents in the transaction's amount bucket.
    async fn open_documents_by_amount(
        &self,
        team_id: Uuid,
        currency: &str,
        lo: Decimal,
        hi: Decimal,
    ) -> Result<Vec<InboxDocument>, AppError>;

    /// Moves `no_match` documents dated inside the window back to
    /// `pending` because a new transaction arrived there. Returns the
    /// number of reopened documents.
    async fn reopen_no_match_in_window(
        &self,
        team_id: Uuid,
        window: DateWindow,
    ) -> Result<u64, AppError>;

    /// Same reopen for undated `no_match` documents in the amount bucket.
    async fn reopen_no_match_by_amount(
        &self,
        team_id: Uuid,
        currency: &str,
        lo: Decimal,
        hi: Decimal,
    ) -> Result<u64, AppError>;

    /// Reopens one `no_match` document. Returns false when the document
    /// is not in `no_match`.
    async fn reopen_document(&self, team_id: Uuid, document_id: Uuid) -> Result<bool, AppError>;

    /// Atomically links a pair, writing both sides in one conditional
    /// update. Succeeds only while each side is unlinked or linked at
    /// strictly lower confidence. Manual selections claim at confidence
    /// 1.0, which automatic evaluation can never displace.
    async fn claim_match(
        &self,
        team_id: Uuid,
        transaction_id: Uuid,
        document_id: Uuid,
        confidence: f64,
    ) -> Result<ClaimOutcome, AppError>;

    /// Stores a suggestion on the document side only. The transaction
    /// stays unmatched until a human confirms.
    async fn suggest_match(
        &self,
        team_id: Uuid,
        document_id: Uuid,
        transaction_id: Uuid,
        confidence: f64,
    ) -> Result<SuggestOutcome, AppError>;

    /// Dismisses a suggestion, returning the document to `pending`.
    async fn clear_suggestion(
        &self,
        team_id: Uuid,
        document_id: Uuid,
    ) -> Result<ReleaseOutcome, AppError>;

    /// Unlinks a confirmed match, returning both sides to unmatched and
    /// the document to `pending` for re-evaluation.
    async fn release_match(
        &self,
        team_id: Uuid,
        document_id: Uuid,
    ) -> Result<ReleaseOutcome, AppError>;

    /// Clears the transaction side only. Used when the linked document
    /// was deleted upstream and there is no document row left to release.
    async fn release_transaction_link(
        &self,
        team_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<(), AppError>;

    /// Records an evaluation cycle that produced no qualifying candidate
    /// for a pending document. Moves the document to `no_match` once the
    /// attempt counter reaches `max_attempts`.
    async fn record_empty_cycle(
        &self,
        team_id: Uuid,
        document_id: Uuid,
        max_attempts: i32,
    ) -> Result<EmptyCycleOutcome, AppError>;

    /// Bookkeeping-only update of `last_evaluated_utc`.
    async fn touch_last_evaluated(
        &self,
        team_id: Uuid,
        document_id: Uuid,
    ) -> Result<(), AppError>;

    async fn record_decision(&self, decision: &MatchDecision) -> Result<(), AppError>;

    async fn decisions_for_team(&self, team_id: Uuid) -> Result<Vec<MatchDecision>, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}
