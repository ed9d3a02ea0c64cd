//! Error type definitions for the reputation module.

use thiserror::Error;

use crate::trs::{Alpha, Reputation};

/// The error type for operations in Reputation module
#[derive(Debug, PartialEq, Eq, Error)]
pub enum ReputationError {
    /// Proposed epoch for updating is not after the current one
    #[error("Proposed epoch for updating ({new_epoch}) is not after current epoch ({current_epoch})")]
    InvalidUpdateEpoch { new_epoch: u64, current_epoch: u64 },
    /// Received an expiry threshold lower than the last queued one
    #[error("Received an alpha < max_alpha: {alpha} < {max_alpha}")]
    NonSortedAlpha { alpha: Alpha, max_alpha: Alpha },
    /// Expiring a packet would leave an identity with negative reputation
    #[error(
        "Expiring {amount} reputation from {identity} would leave a negative balance (current balance: {balance})"
    )]
    NegativeReputation {
        identity: String,
        balance: Reputation,
        amount: Reputation,
    },
    /// The reputation packets of an identity do not add up to the amount being slashed
    #[error(
        "Mismatch between cache and queue: cannot slash {amount} reputation from {identity}, {missing} missing in the packet queue"
    )]
    InsufficientPackets {
        identity: String,
        amount: Reputation,
        missing: Reputation,
    },
    /// A previous update failed with a fatal error and left the ledger half updated
    #[error("The reputation ledger is unusable after a failed update at epoch {epoch}")]
    Poisoned { epoch: u64 },
}

impl ReputationError {
    /// Errors that reveal an accounting inconsistency. The batch run must be aborted and the
    /// in-memory ledger discarded.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReputationError::NegativeReputation { .. }
                | ReputationError::InsufficientPackets { .. }
                | ReputationError::Poisoned { .. }
        )
    }
}
