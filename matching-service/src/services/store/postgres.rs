//! Postgres-backed match store.
//!
//! Conditional updates that touch match links run inside a database
//! transaction with `SELECT ... FOR UPDATE` on the affected rows, so two
//! concurrent evaluations serialize on the entities they contend for. A
//! partial unique index on `(team_id, matched_transaction_id)` backstops
//! the 1:1 exclusivity invariant at the storage layer.

use async_trait::async_trait;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::engine::candidates::DateWindow;
use crate::engine::state::{ClaimOutcome, EmptyCycleOutcome, ReleaseOutcome, SuggestOutcome};
use crate::models::{DocumentStatus, InboxDocument, MatchDecision, Transaction};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::MatchStore;

const TRANSACTION_COLUMNS: &str = "transaction_id, team_id, bank_account_id, amount_minor, \
     currency, transaction_date, counterparty_name, raw_description, matched_document_id, \
     match_confidence, created_utc, updated_utc";

const DOCUMENT_COLUMNS: &str = "document_id, team_id, extracted_amount, extracted_currency, \
     extracted_date, extracted_counterparty, status, matched_transaction_id, match_confidence, \
     suggested_transaction_id, suggested_confidence, evaluation_attempts, last_evaluated_utc, \
     created_utc, updated_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "matching-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl MatchStore for Database {
    #[instrument(skip(self), fields(team_id = %team_id, transaction_id = %transaction_id))]
    async fn get_transaction(
        &self,
        team_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction"])
            .start_timer();

        let transaction = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE team_id = $1 AND transaction_id = $2"
        ))
        .bind(team_id)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get transaction: {}", e)))?;

        timer.observe_duration();
        Ok(transaction)
    }

    #[instrument(skip(self), fields(team_id = %team_id, document_id = %document_id))]
    async fn get_document(
        &self,
        team_id: Uuid,
        document_id: Uuid,
    ) -> Result<Option<InboxDocument>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_document"])
            .start_timer();

        let document = sqlx::query_as::<_, InboxDocument>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM inbox_documents \
             WHERE team_id = $1 AND document_id = $2"
        ))
        .bind(team_id)
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get document: {}", e)))?;

        timer.observe_duration();
        Ok(document)
    }

    #[instrument(skip(self), fields(team_id = %team_id))]
    async fn candidate_documents(
        &self,
        team_id: Uuid,
        window: DateWindow,
    ) -> Result<Vec<InboxDocument>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["candidate_documents"])
            .start_timer();

        let documents = sqlx::query_as::<_, InboxDocument>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM inbox_documents \
             WHERE team_id = $1 \
               AND extracted_date BETWEEN $2 AND $3 \
               AND (status IN ('pending', 'suggested_match') \
                    OR (status = 'done' AND match_confidence < 1.0)) \
             ORDER BY extracted_date, document_id"
        ))
        .bind(team_id)
        .bind(window.from)
        .bind(window.to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to query candidate documents: {}", e))
        })?;

        timer.observe_duration();
        Ok(documents)
    }

    #[instrument(skip(self), fields(team_id = %team_id))]
    async fn candidate_documents_by_amount(
        &self,
        team_id: Uuid,
        currency: &str,
        lo: Decimal,
        hi: Decimal,
    ) -> Result<Vec<InboxDocument>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["candidate_documents_by_amount"])
            .start_timer();

        let documents = sqlx::query_as::<_, InboxDocument>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM inbox_documents \
             WHERE team_id = $1 \
               AND extracted_date IS NULL \
               AND extracted_amount IS NOT NULL \
               AND abs(extracted_amount) BETWEEN $3 AND $4 \
               AND (extracted_currency = $2 OR extracted_currency IS NULL) \
               AND (status IN ('pending', 'suggested_match') \
                    OR (status = 'done' AND match_confidence < 1.0)) \
             ORDER BY abs(extracted_amount), document_id"
        ))
        .bind(team_id)
        .bind(currency)
        .bind(lo)
        .bind(hi)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to query documents by amount bucket: {}",
                e
            ))
        })?;

        timer.observe_duration();
        Ok(documents)
    }

    #[instrument(skip(self), fields(team_id = %team_id))]
    async fn candidate_transactions(
        &self,
        team_id: Uuid,
        window: DateWindow,
    ) -> Result<Vec<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["candidate_transactions"])
            .start_timer();

        let transactions = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE team_id = $1 \
               AND transaction_date BETWEEN $2 AND $3 \
               AND (matched_document_id IS NULL OR match_confidence < 1.0) \
             ORDER BY transaction_date, transaction_id"
        ))
        .bind(team_id)
        .bind(window.from)
        .bind(window.to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to query candidate transactions: {}",
                e
            ))
        })?;

        timer.observe_duration();
        Ok(transactions)
    }

    #[instrument(skip(self), fields(team_id = %team_id))]
    async fn candidate_transactions_by_amount(
        &self,
        team_id: Uuid,
        currency: Option<&str>,
        lo_minor: i64,
        hi_minor: i64,
    ) -> Result<Vec<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["candidate_transactions_by_amount"])
            .start_timer();

        let transactions = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE team_id = $1 \
               AND ($2::text IS NULL OR currency = $2) \
               AND abs(amount_minor) BETWEEN $3 AND $4 \
               AND (matched_document_id IS NULL OR match_confidence < 1.0) \
             ORDER BY abs(amount_minor), transaction_id"
        ))
        .bind(team_id)
        .bind(currency)
        .bind(lo_minor)
        .bind(hi_minor)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to query transactions by amount bucket: {}",
                e
            ))
        })?;

        timer.observe_duration();
        Ok(transactions)
    }

    #[instrument(skip(self), fields(team_id = %team_id))]
    async fn open_documents(
        &self,
        team_id: Uuid,
        window: DateWindow,
    ) -> Result<Vec<InboxDocument>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["open_documents"])
            .start_timer();

        let documents = sqlx::query_as::<_, InboxDocument>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM inbox_documents \
             WHERE team_id = $1 \
               AND extracted_date BETWEEN $2 AND $3 \
               AND status IN ('pending', 'suggested_match') \
             ORDER BY extracted_date, document_id"
        ))
        .bind(team_id)
        .bind(window.from)
        .bind(window.to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to query open documents: {}", e))
        })?;

        timer.observe_duration();
        Ok(documents)
    }

    #[instrument(skip(self), fields(team_id = %team_id))]
    async fn open_documents_by_amount(
        &self,
        team_id: Uuid,
        currency: &str,
        lo: Decimal,
        hi: Decimal,
    ) -> Result<Vec<InboxDocument>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["open_documents_by_amount"])
            .start_timer();

        let documents = sqlx::query_as::<_, InboxDocument>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM inbox_documents \
             WHERE team_id = $1 \
               AND extracted_date IS NULL \
               AND extracted_amount IS NOT NULL \
               AND abs(extracted_amount) BETWEEN $3 AND $4 \
               AND (extracted_currency = $2 OR extracted_currency IS NULL) \
               AND status IN ('pending', 'suggested_match') \
             ORDER BY abs(extracted_amount), document_id"
        ))
        .bind(team_id)
        .bind(currency)
        .bind(lo)
        .bind(hi)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to query open documents by amount: {}",
                e
            ))
        })?;

        timer.observe_duration();
        Ok(documents)
    }

    #[instrument(skip(self), fields(team_id = %team_id))]
    async fn reopen_no_match_in_window(
        &self,
        team_id: Uuid,
        window: DateWindow,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reopen_no_match_in_window"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE inbox_documents \
             SET status = 'pending', evaluation_attempts = 0, updated_utc = now() \
             WHERE team_id = $1 AND status = 'no_match' \
               AND extracted_date BETWEEN $2 AND $3",
        )
        .bind(team_id)
        .bind(window.from)
        .bind(window.to)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to reopen no_match documents: {}", e))
        })?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(team_id = %team_id))]
    async fn reopen_no_match_by_amount(
        &self,
        team_id: Uuid,
        currency: &str,
        lo: Decimal,
        hi: Decimal,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reopen_no_match_by_amount"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE inbox_documents \
             SET status = 'pending', evaluation_attempts = 0, updated_utc = now() \
             WHERE team_id = $1 AND status = 'no_match' \
               AND extracted_date IS NULL \
               AND extracted_amount IS NOT NULL \
               AND abs(extracted_amount) BETWEEN $3 AND $4 \
               AND (extracted_currency = $2 OR extracted_currency IS NULL)",
        )
        .bind(team_id)
        .bind(currency)
        .bind(lo)
        .bind(hi)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to reopen no_match documents by amount: {}",
                e
            ))
        })?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(team_id = %team_id, document_id = %document_id))]
    async fn reopen_document(&self, team_id: Uuid, document_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reopen_document"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE inbox_documents \
             SET status = 'pending', evaluation_attempts = 0, updated_utc = now() \
             WHERE team_id = $1 AND document_id = $2 AND status = 'no_match'",
        )
        .bind(team_id)
        .bind(document_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to reopen document: {}", e))
        })?;

        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(
        skip(self),
        fields(team_id = %team_id, transaction_id = %transaction_id, document_id = %document_id)
    )]
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

        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_match"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin claim: {}", e))
        })?;

        // Lock order: transaction row first, then document row. Concurrent
        // claims of either entity serialize here; a deadlock aborts one
        // side with a retryable database error.
        let Some(txn) = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE team_id = $1 AND transaction_id = $2 FOR UPDATE"
        ))
        .bind(team_id)
        .bind(transaction_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to lock transaction: {}", e))
        })?
        else {
            return Ok(ClaimOutcome::Conflict);
        };

        let Some(doc) = sqlx::query_as::<_, InboxDocument>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM inbox_documents \
             WHERE team_id = $1 AND document_id = $2 FOR UPDATE"
        ))
        .bind(team_id)
        .bind(document_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock document: {}", e)))?
        else {
            return Ok(ClaimOutcome::Conflict);
        };

        if txn.matched_document_id == Some(document_id)
            && doc.matched_transaction_id == Some(transaction_id)
        {
            return Ok(ClaimOutcome::AlreadyLinked);
        }

        match doc.status()? {
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

        if let Some(prev_id) = displaced_document {
            sqlx::query(
                "UPDATE inbox_documents \
                 SET status = 'pending', matched_transaction_id = NULL, \
                     match_confidence = NULL, evaluation_attempts = 0, updated_utc = now() \
                 WHERE team_id = $1 AND document_id = $2",
            )
            .bind(team_id)
            .bind(prev_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to displace document: {}", e))
            })?;
        }
        if let Some(prev_id) = displaced_transaction {
            sqlx::query(
                "UPDATE transactions \
                 SET matched_document_id = NULL, match_confidence = NULL, updated_utc = now() \
                 WHERE team_id = $1 AND transaction_id = $2",
            )
            .bind(team_id)
            .bind(prev_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to displace transaction: {}", e))
            })?;
        }

        sqlx::query(
            "UPDATE transactions \
             SET matched_document_id = $3, match_confidence = $4, updated_utc = now() \
             WHERE team_id = $1 AND transaction_id = $2",
        )
        .bind(team_id)
        .bind(transaction_id)
        .bind(document_id)
        .bind(confidence)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to claim transaction side: {}", e))
        })?;

        sqlx::query(
            "UPDATE inbox_documents \
             SET status = 'done', matched_transaction_id = $3, match_confidence = $4, \
                 suggested_transaction_id = NULL, suggested_confidence = NULL, \
                 evaluation_attempts = 0, last_evaluated_utc = now(), updated_utc = now() \
             WHERE team_id = $1 AND document_id = $2",
        )
        .bind(team_id)
        .bind(document_id)
        .bind(transaction_id)
        .bind(confidence)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to claim document side: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit claim: {}", e))
        })?;

        timer.observe_duration();
        Ok(ClaimOutcome::Claimed {
            displaced_transaction,
            displaced_document,
        })
    }

    #[instrument(
        skip(self),
        fields(team_id = %team_id, document_id = %document_id, transaction_id = %transaction_id)
    )]
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

        let timer = DB_QUERY_DURATION
            .with_label_values(&["suggest_match"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin suggestion: {}", e))
        })?;

        let Some(doc) = sqlx::query_as::<_, InboxDocument>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM inbox_documents \
             WHERE team_id = $1 AND document_id = $2 FOR UPDATE"
        ))
        .bind(team_id)
        .bind(document_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock document: {}", e)))?
        else {
            return Ok(SuggestOutcome::Conflict);
        };

        if !matches!(
            doc.status()?,
            DocumentStatus::Pending | DocumentStatus::SuggestedMatch
        ) {
            return Ok(SuggestOutcome::Conflict);
        }

        let mut replaced = None;
        if let Some(existing_txn) = doc.suggested_transaction_id {
            let existing = doc.suggested_confidence.unwrap_or(0.0);
            if existing_txn == transaction_id {
                if (existing - confidence).abs() < f64::EPSILON {
                    return Ok(SuggestOutcome::Unchanged);
                }
            } else {
                if existing >= confidence {
                    return Ok(SuggestOutcome::Conflict);
                }
                replaced = Some(existing_txn);
            }
        }

        sqlx::query(
            "UPDATE inbox_documents \
             SET status = 'suggested_match', suggested_transaction_id = $3, \
                 suggested_confidence = $4, evaluation_attempts = 0, \
                 last_evaluated_utc = now(), updated_utc = now() \
             WHERE team_id = $1 AND document_id = $2",
        )
        .bind(team_id)
        .bind(document_id)
        .bind(transaction_id)
        .bind(confidence)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to store suggestion: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit suggestion: {}", e))
        })?;

        timer.observe_duration();
        Ok(SuggestOutcome::Applied { replaced })
    }

    #[instrument(skip(self), fields(team_id = %team_id, document_id = %document_id))]
    async fn clear_suggestion(
        &self,
        team_id: Uuid,
        document_id: Uuid,
    ) -> Result<ReleaseOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["clear_suggestion"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin dismiss: {}", e))
        })?;

        let Some(doc) = sqlx::query_as::<_, InboxDocument>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM inbox_documents \
             WHERE team_id = $1 AND document_id = $2 AND status = 'suggested_match' FOR UPDATE"
        ))
        .bind(team_id)
        .bind(document_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock document: {}", e)))?
        else {
            return Ok(ReleaseOutcome::Conflict);
        };

        sqlx::query(
            "UPDATE inbox_documents \
             SET status = 'pending', suggested_transaction_id = NULL, \
                 suggested_confidence = NULL, updated_utc = now() \
             WHERE team_id = $1 AND document_id = $2",
        )
        .bind(team_id)
        .bind(document_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to clear suggestion: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit dismiss: {}", e))
        })?;

        timer.observe_duration();
        Ok(ReleaseOutcome::Released {
            transaction_id: doc.suggested_transaction_id,
        })
    }

    #[instrument(skip(self), fields(team_id = %team_id, document_id = %document_id))]
    async fn release_match(
        &self,
        team_id: Uuid,
        document_id: Uuid,
    ) -> Result<ReleaseOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["release_match"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin unlink: {}", e))
        })?;

        let Some(doc) = sqlx::query_as::<_, InboxDocument>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM inbox_documents \
             WHERE team_id = $1 AND document_id = $2 AND status = 'done' FOR UPDATE"
        ))
        .bind(team_id)
        .bind(document_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock document: {}", e)))?
        else {
            return Ok(ReleaseOutcome::Conflict);
        };

        sqlx::query(
            "UPDATE inbox_documents \
             SET status = 'pending', matched_transaction_id = NULL, match_confidence = NULL, \
                 evaluation_attempts = 0, updated_utc = now() \
             WHERE team_id = $1 AND document_id = $2",
        )
        .bind(team_id)
        .bind(document_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to unlink document: {}", e)))?;

        if let Some(txn_id) = doc.matched_transaction_id {
            sqlx::query(
                "UPDATE transactions \
                 SET matched_document_id = NULL, match_confidence = NULL, updated_utc = now() \
                 WHERE team_id = $1 AND transaction_id = $2",
            )
            .bind(team_id)
            .bind(txn_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to unlink transaction: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit unlink: {}", e))
        })?;

        timer.observe_duration();
        Ok(ReleaseOutcome::Released {
            transaction_id: doc.matched_transaction_id,
        })
    }

    #[instrument(skip(self), fields(team_id = %team_id, transaction_id = %transaction_id))]
    async fn release_transaction_link(
        &self,
        team_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["release_transaction_link"])
            .start_timer();

        sqlx::query(
            "UPDATE transactions \
             SET matched_document_id = NULL, match_confidence = NULL, updated_utc = now() \
             WHERE team_id = $1 AND transaction_id = $2",
        )
        .bind(team_id)
        .bind(transaction_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to release transaction link: {}",
                e
            ))
        })?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(team_id = %team_id, document_id = %document_id))]
    async fn record_empty_cycle(
        &self,
        team_id: Uuid,
        document_id: Uuid,
        max_attempts: i32,
    ) -> Result<EmptyCycleOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_empty_cycle"])
            .start_timer();

        let row = sqlx::query_as::<_, (i32, String)>(
            "UPDATE inbox_documents \
             SET evaluation_attempts = evaluation_attempts + 1, \
                 status = CASE WHEN evaluation_attempts + 1 >= $3 \
                               THEN 'no_match' ELSE status END, \
                 last_evaluated_utc = now(), updated_utc = now() \
             WHERE team_id = $1 AND document_id = $2 AND status = 'pending' \
             RETURNING evaluation_attempts, status",
        )
        .bind(team_id)
        .bind(document_id)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record empty cycle: {}", e))
        })?;

        timer.observe_duration();
        Ok(match row {
            None => EmptyCycleOutcome::Conflict,
            Some((_, status)) if status == DocumentStatus::NoMatch.as_str() => {
                EmptyCycleOutcome::MarkedNoMatch
            }
            Some((attempts, _)) => EmptyCycleOutcome::StillPending { attempts },
        })
    }

    #[instrument(skip(self), fields(team_id = %team_id, document_id = %document_id))]
    async fn touch_last_evaluated(
        &self,
        team_id: Uuid,
        document_id: Uuid,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE inbox_documents SET last_evaluated_utc = now() \
             WHERE team_id = $1 AND document_id = $2",
        )
        .bind(team_id)
        .bind(document_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to touch document: {}", e))
        })?;
        Ok(())
    }

    #[instrument(skip(self, decision), fields(team_id = %decision.team_id))]
    async fn record_decision(&self, decision: &MatchDecision) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_decision"])
            .start_timer();

        sqlx::query(
            "INSERT INTO match_decisions \
             (decision_id, team_id, transaction_id, document_id, outcome, combined_score, \
              decided_by, decided_utc) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(decision.decision_id)
        .bind(decision.team_id)
        .bind(decision.transaction_id)
        .bind(decision.document_id)
        .bind(&decision.outcome)
        .bind(decision.combined_score)
        .bind(&decision.decided_by)
        .bind(decision.decided_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record decision: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(team_id = %team_id))]
    async fn decisions_for_team(&self, team_id: Uuid) -> Result<Vec<MatchDecision>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["decisions_for_team"])
            .start_timer();

        let decisions = sqlx::query_as::<_, MatchDecision>(
            "SELECT decision_id, team_id, transaction_id, document_id, outcome, combined_score, \
                    decided_by, decided_utc \
             FROM match_decisions \
             WHERE team_id = $1 \
             ORDER BY decided_utc DESC \
             LIMIT 100",
        )
        .bind(team_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list decisions: {}", e))
        })?;

        timer.observe_duration();
        Ok(decisions)
    }

    /// Check database health.
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }
}
