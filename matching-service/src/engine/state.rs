//! Match state machine for inbox documents.
//!
//! The status column on a document is only ever moved along the closed
//! transition table below. `new` and `analyzing` belong to the upstream
//! extraction pipeline; `other` is terminal and never touched here.

use crate::models::DocumentStatus;
use uuid::Uuid;

/// Checks a document status transition against the closed transition
/// table. Anything not listed is rejected, including identity moves.
pub fn can_transition(from: DocumentStatus, to: DocumentStatus) -> bool {
    use DocumentStatus::*;
    matches!(
        (from, to),
        (New, Analyzing)
            | (Analyzing, Pending)
            | (Analyzing, Other)
            | (Pending, SuggestedMatch)
            | (Pending, Done)
            | (Pending, NoMatch)
            | (SuggestedMatch, Pending)
            | (SuggestedMatch, Done)
            | (SuggestedMatch, NoMatch)
            | (Done, Pending)
            | (NoMatch, Pending)
    )
}

/// Result of the atomic claim of a transaction-document pair.
///
/// Claiming writes both sides (transaction's `matched_document_id` and the
/// document's `matched_transaction_id`) in one conditional update, so two
/// concurrent evaluations can never double-book an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The pair is now linked. Entities that lost their previous link in
    /// the process are reported so the caller can emit unmatched events.
    Claimed {
        displaced_transaction: Option<Uuid>,
        displaced_document: Option<Uuid>,
    },
    /// The pair was already linked; nothing was written.
    AlreadyLinked,
    /// One side is held with equal or higher confidence, or the document
    /// is not in a claimable state. Expected under concurrency, not an
    /// error.
    Conflict,
}

/// Result of recording a suggestion on a document.
///
/// Suggestions live entirely on the document side; the transaction stays
/// unmatched until a human confirms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuggestOutcome {
    /// The suggestion was stored. If it replaced a previous suggestion
    /// for a different transaction, that transaction id is reported.
    Applied { replaced: Option<Uuid> },
    /// The same suggestion was already in place; nothing was written.
    Unchanged,
    /// The document was claimed or suggested at equal-or-higher
    /// confidence by a concurrent evaluation.
    Conflict,
}

/// Result of clearing a link or a suggestion from a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The document is back to `pending`. The transaction it pointed at,
    /// if any, is reported so its side can be cleared and events emitted.
    Released { transaction_id: Option<Uuid> },
    /// The document was not in a releasable state.
    Conflict,
}

/// Result of recording an evaluation cycle that produced no qualifying
/// candidate for a pending document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyCycleOutcome {
    /// The attempt counter was bumped but the retry horizon has not
    /// elapsed yet.
    StillPending { attempts: i32 },
    /// The retry horizon elapsed; the document moved to `no_match`.
    MarkedNoMatch,
    /// The document left `pending` concurrently; nothing was written.
    Conflict,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentStatus::*;

    #[test]
    fn test_extraction_pipeline_transitions_allowed() {
        assert!(can_transition(New, Analyzing));
        assert!(can_transition(Analyzing, Pending));
        assert!(can_transition(Analyzing, Other));
    }

    #[test]
    fn test_matching_cycle_transitions_allowed() {
        assert!(can_transition(Pending, SuggestedMatch));
        assert!(can_transition(SuggestedMatch, Pending));
        assert!(can_transition(Pending, Done));
        assert!(can_transition(SuggestedMatch, Done));
        assert!(can_transition(Done, Pending));
        assert!(can_transition(Pending, NoMatch));
        assert!(can_transition(SuggestedMatch, NoMatch));
        assert!(can_transition(NoMatch, Pending));
    }

    #[test]
    fn test_unlisted_transitions_rejected() {
        assert!(!can_transition(New, Pending));
        assert!(!can_transition(New, Done));
        assert!(!can_transition(Done, NoMatch));
        assert!(!can_transition(Done, SuggestedMatch));
        assert!(!can_transition(NoMatch, Done));
        assert!(!can_transition(NoMatch, SuggestedMatch));
        assert!(!can_transition(Other, Pending));
        assert!(!can_transition(Other, Done));
        assert!(!can_transition(Analyzing, Done));
    }

    #[test]
    fn test_identity_transitions_rejected() {
        for status in [New, Analyzing, Pending, SuggestedMatch, Done, NoMatch, Other] {
            assert!(!can_transition(status, status));
        }
    }

    #[test]
    fn test_other_is_terminal() {
        for status in [New, Analyzing, Pending, SuggestedMatch, Done, NoMatch] {
            assert!(!can_transition(Other, status));
        }
    }
}
