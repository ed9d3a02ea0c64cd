//! Reputation engine
//!
//! Off-chain replica of the reputation bookkeeping of the Witnet network: reputation is issued
//! for every witnessing act, granted to honest identities in packets that expire after a fixed
//! number of witnessing acts, and slashed from identities that lie.

#![deny(rust_2018_idioms)]
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]

pub mod trs;
pub use trs::{Alpha, Reputation, ReputationPacket, TotalReputationSet};

pub mod ledger;
pub use ledger::{
    DeltaKind, EpochReport, FrequencyMap, LedgerParams, LedgerState, ReputationDelta,
    ReputationLedger, StepReport,
};

/// Module containing error definitions
pub mod error;
pub use error::ReputationError;
