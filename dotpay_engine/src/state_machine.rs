//! The authoritative transition table for the transaction lifecycle.
//!
//! Every status change in the system, whether it originates from an initiate handler, a provider
//! webhook, the reconciler or the refund service, goes through [`assert_transition`]. A same-state
//! call is a no-op; an illegal call fails with [`StateError`] and changes nothing. A real
//! transition mutates the transaction in place and appends the history entry that the storage
//! layer persists together with the new status.

use chrono::Utc;
use thiserror::Error;

use crate::db_types::{HistoryEntry, Transaction, TransactionStatus};

#[derive(Debug, Clone, Error)]
pub enum StateError {
    #[error("Illegal state transition from {from} to {to}")]
    IllegalTransition { from: TransactionStatus, to: TransactionStatus },
    #[error("Quote {0} has expired")]
    QuoteExpired(String),
    #[error("Funding transaction {tx_hash} is already linked to transaction {other}")]
    DuplicateFundingTx { tx_hash: String, other: String },
}

/// Whether `from -> to` is a legal transition.
pub fn allowed(from: TransactionStatus, to: TransactionStatus) -> bool {
    use TransactionStatus::*;
    matches!(
        (from, to),
        (Created, Quoted)
            | (Created, AwaitingUserAuthorization)
            | (Created, Failed)
            | (Quoted, AwaitingUserAuthorization)
            | (Quoted, MpesaSubmitted)
            | (Quoted, Failed)
            | (AwaitingUserAuthorization, AwaitingOnchainFunding)
            | (AwaitingUserAuthorization, MpesaSubmitted)
            | (AwaitingUserAuthorization, Failed)
            | (AwaitingOnchainFunding, MpesaSubmitted)
            | (AwaitingOnchainFunding, Failed)
            | (MpesaSubmitted, MpesaProcessing)
            | (MpesaSubmitted, Succeeded)
            | (MpesaSubmitted, Failed)
            | (MpesaProcessing, Succeeded)
            | (MpesaProcessing, Failed)
            | (Failed, RefundPending)
            | (Failed, Refunded)
            | (RefundPending, Refunded)
            | (RefundPending, Failed)
    )
}

/// Apply a transition to `tx`, appending a history entry.
///
/// Returns the appended entry, or `None` when `to` equals the current status (no-op).
pub fn assert_transition(
    tx: &mut Transaction,
    to: TransactionStatus,
    reason: &str,
    source: &str,
) -> Result<Option<HistoryEntry>, StateError> {
    let from = tx.status;
    if from == to {
        return Ok(None);
    }
    if !allowed(from, to) {
        return Err(StateError::IllegalTransition { from, to });
    }
    let entry =
        HistoryEntry { from, to, reason: reason.to_string(), source: source.to_string(), at: Utc::now() };
    tx.status = to;
    tx.history.push(entry.clone());
    Ok(Some(entry))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{db_types::FlowType, test_utils::sample_transaction};

    fn tx_with_status(status: TransactionStatus) -> Transaction {
        sample_transaction(FlowType::Offramp, status)
    }

    #[test]
    fn legal_transition_appends_history() {
        let mut tx = tx_with_status(TransactionStatus::Quoted);
        let entry = assert_transition(&mut tx, TransactionStatus::MpesaSubmitted, "submit", "test")
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::MpesaSubmitted);
        assert_eq!(tx.history.len(), 1);
        assert_eq!(entry.from, TransactionStatus::Quoted);
        assert_eq!(entry.to, TransactionStatus::MpesaSubmitted);
        assert_eq!(entry.reason, "submit");
        assert_eq!(entry.source, "test");
    }

    #[test]
    fn same_state_is_a_noop() {
        let mut tx = tx_with_status(TransactionStatus::MpesaProcessing);
        let entry =
            assert_transition(&mut tx, TransactionStatus::MpesaProcessing, "again", "test").unwrap();
        assert!(entry.is_none());
        assert!(tx.history.is_empty());
    }

    #[test]
    fn terminal_states_admit_no_transitions() {
        let mut tx = tx_with_status(TransactionStatus::Succeeded);
        let err = assert_transition(&mut tx, TransactionStatus::Failed, "late timeout", "webhook")
            .unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition { .. }));
        assert_eq!(tx.status, TransactionStatus::Succeeded);
        assert!(tx.history.is_empty());

        let mut tx = tx_with_status(TransactionStatus::Refunded);
        assert!(assert_transition(&mut tx, TransactionStatus::Failed, "x", "test").is_err());
    }

    #[test]
    fn refund_cycle_is_legal() {
        let mut tx = tx_with_status(TransactionStatus::Failed);
        assert_transition(&mut tx, TransactionStatus::RefundPending, "refund", "refund").unwrap();
        assert_transition(&mut tx, TransactionStatus::Refunded, "refund complete", "refund").unwrap();
        assert_eq!(tx.history.len(), 2);
    }

    #[test]
    fn failed_refund_attempt_returns_to_failed() {
        let mut tx = tx_with_status(TransactionStatus::RefundPending);
        assert_transition(&mut tx, TransactionStatus::Failed, "refund error", "refund").unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
    }

    #[test]
    fn skipping_authorization_is_illegal_for_funded_states() {
        let mut tx = tx_with_status(TransactionStatus::AwaitingOnchainFunding);
        assert!(assert_transition(&mut tx, TransactionStatus::Succeeded, "skip", "test").is_err());
        assert!(assert_transition(&mut tx, TransactionStatus::MpesaProcessing, "skip", "test").is_err());
    }
}
