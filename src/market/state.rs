use std::fmt;

use serde::{Deserialize, Serialize};

use super::transaction::{MarketTransaction, RetryConfig};
use crate::error::ErrorClass;

/// States of a marketplace booking.
///
/// A transaction flows strictly forward:
/// DISCOVERED → SELECTED → INITIALIZED → CONFIRMED,
/// with FAILED reachable from any non-terminal state and ABANDONED recording
/// a cancellation mid-protocol that needs manual reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    Discovered,
    Selected,
    Initialized,
    Confirmed,
    Failed,
    Abandoned,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Confirmed | TransactionState::Failed | TransactionState::Abandoned
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Discovered => write!(f, "DISCOVERED"),
            TransactionState::Selected => write!(f, "SELECTED"),
            TransactionState::Initialized => write!(f, "INITIALIZED"),
            TransactionState::Confirmed => write!(f, "CONFIRMED"),
            TransactionState::Failed => write!(f, "FAILED"),
            TransactionState::Abandoned => write!(f, "ABANDONED"),
        }
    }
}

/// The result of one protocol step attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success,
    Failure { class: ErrorClass, reason: String },
}

/// The result of evaluating a state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Advance to the next protocol state.
    Next(TransactionState),
    /// Retry the current step after backing off.
    Retry { reason: String },
    /// Unrecoverable: the transaction is now Failed.
    Fail { reason: String },
    /// The transaction was already in a terminal state.
    Complete(TransactionState),
}

/// Drives a [`MarketTransaction`] through the protocol state machine.
pub struct TransactionMachine;

impl TransactionMachine {
    /// Compute and apply the next transition for the given transaction.
    ///
    /// Success advances one state. A Transient failure retries the current
    /// step while the budget lasts, then fails; a Permanent failure fails
    /// immediately. The retry counter is per step — it resets on every
    /// successful advance.
    pub fn next(
        tx: &mut MarketTransaction,
        retry: &RetryConfig,
        outcome: StepOutcome,
    ) -> Transition {
        let transition = match tx.state {
            TransactionState::Discovered => {
                Self::step(tx, retry, outcome, TransactionState::Selected)
            }
            TransactionState::Selected => {
                Self::step(tx, retry, outcome, TransactionState::Initialized)
            }
            TransactionState::Initialized => {
                Self::step(tx, retry, outcome, TransactionState::Confirmed)
            }
            TransactionState::Confirmed
            | TransactionState::Failed
            | TransactionState::Abandoned => Transition::Complete(tx.state),
        };

        match &transition {
            Transition::Next(next_state) => {
                tx.state_history.push(tx.state);
                tx.state = *next_state;
                tx.retry_count = 0;
            }
            Transition::Retry { .. } => {
                // State unchanged; retry count was bumped in `step`.
            }
            Transition::Fail { reason } => {
                tx.state_history.push(tx.state);
                tx.state = TransactionState::Failed;
                tx.failure = Some(reason.clone());
            }
            Transition::Complete(_) => {}
        }
        tx.updated_at = chrono::Utc::now();

        transition
    }

    /// Mark a transaction cancelled mid-protocol. Whatever was committed
    /// upstream stays booked until someone reconciles it by hand, so this is
    /// recorded as its own state rather than folded into Failed.
    pub fn abandon(tx: &mut MarketTransaction, reason: &str) {
        tx.state_history.push(tx.state);
        tx.state = TransactionState::Abandoned;
        tx.failure = Some(reason.to_string());
        tx.updated_at = chrono::Utc::now();
    }

    fn step(
        tx: &mut MarketTransaction,
        retry: &RetryConfig,
        outcome: StepOutcome,
        next_state: TransactionState,
    ) -> Transition {
        match outcome {
            StepOutcome::Success => Transition::Next(next_state),
            StepOutcome::Failure {
                class: ErrorClass::Permanent,
                reason,
            } => Transition::Fail { reason },
            StepOutcome::Failure {
                class: ErrorClass::Transient,
                reason,
            } => {
                tx.retry_count += 1;
                if tx.retry_count <= retry.max_retries {
                    Transition::Retry { reason }
                } else {
                    Transition::Fail {
                        reason: format!("retry budget exhausted: {reason}"),
                    }
                }
            }
        }
    }
}
