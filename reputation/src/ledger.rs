//! Reputation ledger
//!
//! The state machine that replays the reputation bookkeeping of the network one epoch at a time:
//! expire old packets, issue new reputation, slash liars, and distribute everything that is
//! available among the honest identities.

use std::{cmp, fmt, hash::Hash};

use indexmap::IndexMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    error::ReputationError,
    trs::{Alpha, Reputation, TotalReputationSet},
};

/// Number of occurrences of every identity in one epoch. Iteration follows insertion order, so
/// tie-breaks and distribution are deterministic.
pub type FrequencyMap<K> = IndexMap<K, u32>;

/// Constants of the reputation engine
#[derive(Clone, Debug, PartialEq)]
pub struct LedgerParams {
    /// Witnessing acts needed for a reputation packet to expire, counting from the moment it was
    /// granted
    pub expire_alpha_diff: u64,
    /// Once the witnessing acts counter reaches this value, no more reputation is issued
    pub issuance_stop: u64,
    /// Fraction of the reputation kept for every lie
    pub penalization_factor: f64,
    /// Maximum distance in epochs between a restored snapshot and the first processed epoch
    /// before emitting a warning
    pub drift_tolerance: u64,
}

impl Default for LedgerParams {
    fn default() -> Self {
        Self {
            expire_alpha_diff: 20_000,
            issuance_stop: 1 << 20,
            penalization_factor: 0.5,
            drift_tolerance: 10,
        }
    }
}

/// Everything the reputation engine needs to continue from one epoch to the next
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerState<K>
where
    K: Eq + Hash,
{
    /// Total number of witnessing acts so far
    pub witnessing_acts: Alpha,
    /// Reputation that could not be divided among the honest identities of the last epoch
    pub leftover_reputation: Reputation,
    /// Identities with reputation and the queue of packets that explains it
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub trs: TotalReputationSet<K>,
    /// Last processed epoch
    pub epoch: u64,
}

impl<K> Default for LedgerState<K>
where
    K: Clone + Eq + Hash + fmt::Display,
{
    fn default() -> Self {
        Self {
            witnessing_acts: Alpha::default(),
            leftover_reputation: Reputation::default(),
            trs: TotalReputationSet::new(),
            epoch: 0,
        }
    }
}

/// Cause of a change of reputation
#[cfg_attr(
    feature = "serde",
    derive(Deserialize, Serialize),
    serde(rename_all = "lowercase")
)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    /// Reputation granted for an honest reveal
    Gain,
    /// A reputation packet reached its expiry threshold
    Expire,
    /// Reputation slashed for lying
    Lie,
}

impl DeltaKind {
    /// Name of this kind as stored in the audit rows
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::Gain => "gain",
            DeltaKind::Expire => "expire",
            DeltaKind::Lie => "lie",
        }
    }
}

impl fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change of the reputation of one identity
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReputationDelta<K> {
    /// Affected identity
    pub address: K,
    /// Epoch in which the change happened
    pub epoch: u64,
    /// Absolute value of the change
    pub amount: Reputation,
    /// Cause of the change
    pub kind: DeltaKind,
}

impl<K> ReputationDelta<K> {
    /// Signed value of the change: positive for gains, negative for expirations and lies
    #[allow(clippy::cast_possible_wrap)]
    pub fn signed_amount(&self) -> i64 {
        let amount = self.amount.0 as i64;
        match self.kind {
            DeltaKind::Gain => amount,
            DeltaKind::Expire | DeltaKind::Lie => -amount,
        }
    }
}

/// Result of processing one epoch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepReport<K> {
    /// Processed epoch
    pub epoch: u64,
    /// Expiry-only step inserted because of a gap in the epochs
    pub synthetic: bool,
    /// Witnessing acts before processing this epoch
    pub old_alpha: Alpha,
    /// Witnessing acts after processing this epoch
    pub new_alpha: Alpha,
    /// Every change of reputation, in the order it was applied
    pub deltas: Vec<ReputationDelta<K>>,
    /// Full ledger after processing this epoch
    pub identities: Vec<(K, Reputation)>,
    /// Leftover reputation from the previous epoch
    pub extra_rep_previous_epoch: Reputation,
    /// Reputation that expired
    pub expired_rep: Reputation,
    /// Reputation that was created
    pub issued_rep: Reputation,
    /// Reputation subtracted from dishonest identities
    pub penalized_rep: Reputation,
    /// Total reputation that can be divided amongst all the honest identities
    pub reputation_bounty: Reputation,
    /// Reputation gained by each honest identity
    pub rep_reward: Reputation,
    /// Number of honest identities
    pub num_honest: u64,
    /// Leftover reputation for the next epoch
    pub extra_reputation: Reputation,
}

impl<K> StepReport<K> {
    /// Reputation gained by the honest identities in this epoch
    pub fn gained_rep(&self) -> Reputation {
        Reputation(self.rep_reward.0 * self.num_honest)
    }
}

/// Result of one call to `ReputationLedger::update`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EpochReport<K> {
    /// Expiry-only step for the epoch after the previous one, when there was a gap
    pub gap_step: Option<StepReport<K>>,
    /// The requested epoch
    pub step: StepReport<K>,
    /// Distance in epochs between a restored snapshot and this epoch, when it exceeds the drift
    /// tolerance
    pub drift: Option<u64>,
}

impl<K> EpochReport<K> {
    /// Steps in the order they were applied, and must be persisted
    pub fn steps(&self) -> impl Iterator<Item = &StepReport<K>> {
        self.gap_step.iter().chain(std::iter::once(&self.step))
    }
}

/// Owner of the `LedgerState`. All the mutations go through `update`.
#[derive(Debug)]
pub struct ReputationLedger<K>
where
    K: Eq + Hash,
{
    state: LedgerState<K>,
    params: LedgerParams,
    // Set when the state was restored from a snapshot, until the first update
    restored: bool,
    // At least one epoch was processed, or the state was restored
    started: bool,
    // Epoch of an update that failed half way
    poisoned: Option<u64>,
    log_level: log::Level,
}

impl<K> ReputationLedger<K>
where
    K: Clone + Eq + Hash + fmt::Display,
{
    /// Cold start: empty ledger
    pub fn new(params: LedgerParams) -> Self {
        Self {
            state: LedgerState::default(),
            params,
            restored: false,
            started: false,
            poisoned: None,
            log_level: log::Level::Debug,
        }
    }

    /// Warm start from a previously saved state
    pub fn restore(state: LedgerState<K>, params: LedgerParams) -> Self {
        Self {
            state,
            params,
            restored: true,
            started: true,
            poisoned: None,
            log_level: log::Level::Debug,
        }
    }

    /// Log level used to print the accounting of every epoch
    pub fn with_log_level(mut self, log_level: log::Level) -> Self {
        self.log_level = log_level;
        self
    }

    /// Current state
    pub fn state(&self) -> &LedgerState<K> {
        &self.state
    }

    /// Consume the ledger, returning its state
    pub fn into_state(self) -> LedgerState<K> {
        self.state
    }

    /// Engine constants
    pub fn params(&self) -> &LedgerParams {
        &self.params
    }

    /// Last processed epoch
    pub fn epoch(&self) -> u64 {
        self.state.epoch
    }

    /// Total witnessing acts
    pub fn witnessing_acts(&self) -> Alpha {
        self.state.witnessing_acts
    }

    /// Reputation waiting to be distributed
    pub fn leftover_reputation(&self) -> Reputation {
        self.state.leftover_reputation
    }

    /// Reputation of one identity
    pub fn reputation(&self, id: &K) -> Reputation {
        self.state.trs.get(id)
    }

    /// Sum of the reputation of all the identities
    pub fn total_reputation(&self) -> Reputation {
        self.state.trs.get_total_sum()
    }

    /// Share of the total reputation owned by one identity
    #[allow(clippy::cast_precision_loss)]
    pub fn eligibility(&self, id: &K) -> f64 {
        let total = self.total_reputation();
        if total.0 == 0 {
            0.0
        } else {
            self.reputation(id).0 as f64 / total.0 as f64
        }
    }

    /// Number of identities with reputation
    pub fn num_identities(&self) -> usize {
        self.state.trs.num_identities()
    }

    /// Iterator over all the identities and their reputation
    pub fn identities(&self) -> impl Iterator<Item = (&K, &Reputation)> {
        self.state.trs.identities()
    }

    /// No epoch was processed by this ledger, and it was not restored from a snapshot
    pub fn is_cold(&self) -> bool {
        !self.started
    }

    /// Apply the outcome of one epoch.
    ///
    /// Epochs must be applied in strictly ascending order. A fatal error leaves the ledger
    /// unusable: no report is returned for the failed epoch, and later calls return
    /// `ReputationError::Poisoned`.
    pub fn update(
        &mut self,
        epoch: u64,
        revealers: &FrequencyMap<K>,
        honest: &FrequencyMap<K>,
        errors: &FrequencyMap<K>,
        liars: &FrequencyMap<K>,
    ) -> Result<EpochReport<K>, ReputationError> {
        if let Some(epoch) = self.poisoned {
            return Err(ReputationError::Poisoned { epoch });
        }

        let cold = self.is_cold();
        let current_epoch = self.state.epoch;
        if epoch < current_epoch || (epoch == current_epoch && !cold) {
            return Err(ReputationError::InvalidUpdateEpoch {
                new_epoch: epoch,
                current_epoch,
            });
        }

        let mut drift = None;
        if self.restored {
            self.restored = false;
            let distance = epoch.abs_diff(current_epoch);
            if distance > self.params.drift_tolerance {
                log::warn!(
                    "Reputation snapshot is at epoch {} but the next processed epoch is {} ({} epochs apart)",
                    current_epoch,
                    epoch,
                    distance
                );
                drift = Some(distance);
            }
        }

        // Past this point the state may be partially updated
        self.started = true;
        match self.apply(epoch, cold, revealers, honest, errors, liars) {
            Ok(mut report) => {
                report.drift = drift;
                Ok(report)
            }
            Err(e) => {
                log::error!("Reputation update failed at epoch {}: {}", epoch, e);
                self.poisoned = Some(epoch);
                Err(e)
            }
        }
    }

    fn apply(
        &mut self,
        epoch: u64,
        cold: bool,
        revealers: &FrequencyMap<K>,
        honest: &FrequencyMap<K>,
        errors: &FrequencyMap<K>,
        liars: &FrequencyMap<K>,
    ) -> Result<EpochReport<K>, ReputationError> {
        let gap_step = if epoch > self.state.epoch + 1 && !cold {
            let gap_epoch = self.state.epoch + 1;
            if epoch > gap_epoch + 1 {
                log::warn!(
                    "Epochs {} to {} have no reputation changes, only expiring reputation at epoch {}",
                    gap_epoch,
                    epoch - 1,
                    gap_epoch
                );
            }
            Some(self.state.expire_only(gap_epoch)?)
        } else {
            None
        };

        let step = self.state.process_epoch(
            epoch,
            revealers,
            honest,
            errors,
            liars,
            &self.params,
            self.log_level,
        )?;

        Ok(EpochReport {
            gap_step,
            step,
            drift: None,
        })
    }
}

impl<K> LedgerState<K>
where
    K: Clone + Eq + Hash + fmt::Display,
{
    // Expiry step for epochs without settled data requests
    fn expire_only(&mut self, epoch: u64) -> Result<StepReport<K>, ReputationError> {
        self.epoch = epoch;
        let extra_rep_previous_epoch = self.leftover_reputation;
        let mut deltas = vec![];
        let expired_rep = self.expire(epoch, &mut deltas)?;
        self.leftover_reputation += expired_rep;
        self.trs.remove_zero_identities();

        Ok(StepReport {
            epoch,
            synthetic: true,
            old_alpha: self.witnessing_acts,
            new_alpha: self.witnessing_acts,
            deltas,
            identities: self.materialize(),
            extra_rep_previous_epoch,
            expired_rep,
            issued_rep: Reputation(0),
            penalized_rep: Reputation(0),
            reputation_bounty: self.leftover_reputation,
            rep_reward: Reputation(0),
            num_honest: 0,
            extra_reputation: self.leftover_reputation,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn process_epoch(
        &mut self,
        epoch: u64,
        revealers: &FrequencyMap<K>,
        honest: &FrequencyMap<K>,
        errors: &FrequencyMap<K>,
        liars: &FrequencyMap<K>,
        params: &LedgerParams,
        log_level: log::Level,
    ) -> Result<StepReport<K>, ReputationError> {
        self.epoch = epoch;
        let honests = separate_honests(honest, errors, liars);
        // 1 reveal = 1 witnessing act
        let alpha_diff: u64 = revealers.values().map(|x| u64::from(*x)).sum();
        let old_alpha = self.witnessing_acts;
        let new_alpha = Alpha(old_alpha.0 + alpha_diff);
        log::log!(
            log_level,
            "Reputation update at epoch {}: witnessing acts total {} + new {}",
            epoch,
            old_alpha.0,
            alpha_diff
        );

        let mut deltas = vec![];
        // Leftover reputation from the previous epoch
        let extra_rep_previous_epoch = self.leftover_reputation;
        // Expire in old_alpha to maximize reputation lost in penalizations
        let expired_rep = self.expire(epoch, &mut deltas)?;
        // There is some reputation issued for every witnessing act
        let issued_rep = reputation_issuance(Alpha(params.issuance_stop), old_alpha, new_alpha);
        // Penalize liars and accumulate the reputation
        let penalized_rep =
            self.penalize_liars(epoch, liars, params.penalization_factor, &mut deltas)?;

        let mut reputation_bounty = extra_rep_previous_epoch;
        reputation_bounty += expired_rep;
        reputation_bounty += issued_rep;
        reputation_bounty += penalized_rep;

        log::log!(log_level, "+ {:9} rep from previous epoch", extra_rep_previous_epoch.0);
        log::log!(log_level, "+ {:9} expired rep", expired_rep.0);
        log::log!(log_level, "+ {:9} issued rep", issued_rep.0);
        log::log!(log_level, "+ {:9} penalized rep", penalized_rep.0);
        log::log!(log_level, "= {:9} reputation bounty", reputation_bounty.0);

        let num_honest = honests.len() as u64;
        let mut rep_reward = Reputation(0);
        if num_honest > 0 {
            let reward = Reputation(reputation_bounty.0 / num_honest);
            if reward.0 > 0 {
                rep_reward = reward;
                // Expiration starts counting from new_alpha.
                // All the reputation earned in this epoch will expire at the same time.
                let expire_alpha = Alpha(new_alpha.0 + params.expire_alpha_diff);
                self.trs
                    .gain(expire_alpha, honests.iter().map(|id| (id.clone(), rep_reward)))?;
                deltas.extend(honests.into_iter().map(|address| ReputationDelta {
                    address,
                    epoch,
                    amount: rep_reward,
                    kind: DeltaKind::Gain,
                }));
                reputation_bounty -= Reputation(rep_reward.0 * num_honest);
            }
            log::log!(
                log_level,
                "({} rep x {} honest identities = {})",
                rep_reward.0,
                num_honest,
                rep_reward.0 * num_honest
            );
        } else {
            log::log!(log_level, "(no honest identities for this epoch)");
        }

        let extra_reputation = reputation_bounty;
        self.leftover_reputation = extra_reputation;
        self.witnessing_acts = new_alpha;
        self.trs.remove_zero_identities();
        log::log!(log_level, "= {:9} extra rep for next epoch", extra_reputation.0);

        Ok(StepReport {
            epoch,
            synthetic: false,
            old_alpha,
            new_alpha,
            deltas,
            identities: self.materialize(),
            extra_rep_previous_epoch,
            expired_rep,
            issued_rep,
            penalized_rep,
            reputation_bounty: extra_rep_previous_epoch + expired_rep + issued_rep + penalized_rep,
            rep_reward,
            num_honest,
            extra_reputation,
        })
    }

    fn expire(
        &mut self,
        epoch: u64,
        deltas: &mut Vec<ReputationDelta<K>>,
    ) -> Result<Reputation, ReputationError> {
        let expired = self.trs.expire(&self.witnessing_acts)?;
        let mut expired_rep = Reputation(0);
        for (address, amount) in expired {
            expired_rep += amount;
            deltas.push(ReputationDelta {
                address,
                epoch,
                amount,
                kind: DeltaKind::Expire,
            });
        }

        Ok(expired_rep)
    }

    // The penalization depends on the number of lies in this epoch. Identities with more lies
    // are slashed first.
    fn penalize_liars(
        &mut self,
        epoch: u64,
        liars: &FrequencyMap<K>,
        penalization_factor: f64,
        deltas: &mut Vec<ReputationDelta<K>>,
    ) -> Result<Reputation, ReputationError> {
        let mut liars: Vec<(&K, u32)> = liars
            .iter()
            .filter(|(_pkh, num_lies)| **num_lies > 0)
            .map(|(pkh, num_lies)| (pkh, *num_lies))
            .collect();
        liars.sort_by_key(|(_pkh, num_lies)| cmp::Reverse(*num_lies));

        let mut penalized_rep = Reputation(0);
        for (pkh, num_lies) in liars {
            let old_rep = self.trs.get(pkh);
            let new_rep = penalize_factor(penalization_factor, num_lies)(old_rep);
            let slashed_rep = old_rep - new_rep;
            if slashed_rep.0 == 0 {
                continue;
            }
            self.trs.penalize(pkh, slashed_rep)?;
            penalized_rep += slashed_rep;
            deltas.push(ReputationDelta {
                address: pkh.clone(),
                epoch,
                amount: slashed_rep,
                kind: DeltaKind::Lie,
            });
        }

        Ok(penalized_rep)
    }

    fn materialize(&self) -> Vec<(K, Reputation)> {
        self.trs
            .identities()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

/// Honest identities of one epoch: those which did not lie and revealed a value at least as many
/// times as they revealed an error.
pub fn separate_honests<K>(
    honest: &FrequencyMap<K>,
    errors: &FrequencyMap<K>,
    liars: &FrequencyMap<K>,
) -> Vec<K>
where
    K: Clone + Eq + Hash,
{
    honest
        .iter()
        .filter(|(pkh, truths)| {
            let lies = liars.get(*pkh).copied().unwrap_or(0);
            let errors = errors.get(*pkh).copied().unwrap_or(0);
            lies == 0 && **truths >= errors
        })
        .map(|(pkh, _)| pkh.clone())
        .collect()
}

/// Reputation issued when the witnessing acts counter goes from `old_alpha` to `new_alpha`:
/// one point per act, until `issuance_stop`.
pub fn reputation_issuance(issuance_stop: Alpha, old_alpha: Alpha, new_alpha: Alpha) -> Reputation {
    Reputation(cmp::min(issuance_stop, new_alpha).0.saturating_sub(old_alpha.0))
}

/// Penalization function: given the reputation of an identity, return the reputation it keeps
/// after lying `num_lies` times.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn penalize_factor(
    penalization_factor: f64,
    num_lies: u32,
) -> impl Fn(Reputation) -> Reputation {
    move |Reputation(r)| {
        let kept = (r as f64 * penalization_factor.powf(f64::from(num_lies))).floor() as u64;
        Reputation(cmp::min(kept, r))
    }
}
