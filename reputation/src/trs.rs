//! Total Reputation Set

use std::{
    cmp::Ordering,
    collections::VecDeque,
    fmt,
    hash::Hash,
    iter::Sum,
    ops::{Add, AddAssign, Sub, SubAssign},
};

use indexmap::IndexMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ReputationError;

/// Counter of witnessing acts. One reveal in one settled data request is one witnessing act.
///
/// It is used both as the global clock of the reputation engine and as the expiry threshold of
/// reputation packets.
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Alpha(pub u64);

/// Amount of reputation
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reputation(pub u64);

impl fmt::Display for Alpha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Reputation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Reputation {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Reputation(self.0 + rhs.0)
    }
}

impl AddAssign for Reputation {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0
    }
}

impl Sub for Reputation {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Reputation(self.0 - rhs.0)
    }
}

impl SubAssign for Reputation {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0
    }
}

impl Sum for Reputation {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Reputation::default(), Add::add)
    }
}

/// All the reputation granted in one epoch. The whole packet expires at once, when the global
/// witnessing acts counter reaches `expiry_threshold`.
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReputationPacket<K>
where
    K: Eq + Hash,
{
    /// Witnessing acts count at which this packet expires
    pub expiry_threshold: Alpha,
    /// Reputation granted to every identity
    pub grants: IndexMap<K, Reputation>,
}

impl<K> ReputationPacket<K>
where
    K: Eq + Hash,
{
    /// Sum of all the grants of this packet
    pub fn total(&self) -> Reputation {
        self.grants.values().copied().sum()
    }
}

/// Total Reputation Set
///
/// This data structure keeps track of the total reputation associated to every identity `K`.
/// Reputation is issued in packets which expire once the witnessing acts counter reaches their
/// threshold. In order to keep track of what to expire and when, the reputation packets are
/// stored in a queue ordered by expiry threshold.
///
/// The method `gain(alpha, vec![(id1, diff1)])` queues a packet granting `diff1` to `id1`, which
/// will expire at `alpha`.
///
/// The method `expire(alpha)` will remove all the packets with `expiry_threshold <= alpha`.
///
/// The method `penalize(id, amount)` removes `amount` from an identity, taking it from the most
/// recent packets first (those which would expire later).
///
/// Balances that drop to zero are kept in the cache until `remove_zero_identities` is called.
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TotalReputationSet<K>
where
    K: Eq + Hash,
{
    // A cache of <identity: total_reputation>
    // All the identities with reputation are in the cache: identities
    // not in the cache must have null reputation
    #[cfg_attr(feature = "serde", serde(rename = "identities"))]
    pub(crate) map: IndexMap<K, Reputation>,
    // The list of reputation packets ordered by expiration
    #[cfg_attr(feature = "serde", serde(rename = "expiry_queue"))]
    pub(crate) queue: VecDeque<ReputationPacket<K>>,
}

impl<K> TotalReputationSet<K>
where
    K: Clone + Eq + Hash + fmt::Display,
{
    /// Builds a new empty Trs
    pub fn new() -> Self {
        Self {
            map: IndexMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// Builds a new Trs from an ordered list of packets
    pub fn from_queue<I1, I2>(queue: I1) -> Result<Self, ReputationError>
    where
        I1: IntoIterator<Item = (Alpha, I2)>,
        I2: IntoIterator<Item = (K, Reputation)>,
    {
        let mut trs = Self::new();
        for (alpha, diff) in queue {
            trs.gain(alpha, diff)?;
        }

        Ok(trs)
    }

    /// Provides an iterator over the underlying queue
    pub fn queue(&self) -> impl Iterator<Item = &ReputationPacket<K>> {
        self.queue.iter()
    }

    /// Number of packets waiting to expire
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Queue a new reputation packet. Packets are never merged, even if they share the same
    /// threshold. Null grants are ignored, and a packet without grants is not queued.
    pub fn gain<I>(&mut self, expiry_threshold: Alpha, diff: I) -> Result<(), ReputationError>
    where
        I: IntoIterator<Item = (K, Reputation)>,
    {
        if let Some(back) = self.queue.back() {
            if back.expiry_threshold > expiry_threshold {
                return Err(ReputationError::NonSortedAlpha {
                    alpha: expiry_threshold,
                    max_alpha: back.expiry_threshold,
                });
            }
        }

        let mut grants: IndexMap<K, Reputation> = IndexMap::new();
        for (k, v) in diff.into_iter().filter(|(_k, v)| v.0 > 0) {
            increment_cache(&mut self.map, k.clone(), v);
            *grants.entry(k).or_default() += v;
        }

        if !grants.is_empty() {
            self.queue.push_back(ReputationPacket {
                expiry_threshold,
                grants,
            });
        }

        Ok(())
    }

    /// Expire all reputation packets with `expiry_threshold <= alpha`, return the expired grants
    /// in queue order.
    pub fn expire(&mut self, alpha: &Alpha) -> Result<Vec<(K, Reputation)>, ReputationError> {
        let mut expired = vec![];
        while let Some(front) = self.queue.front() {
            if front.expiry_threshold > *alpha {
                break;
            }

            if let Some(packet) = self.queue.pop_front() {
                for (k, v) in packet.grants {
                    decrement_cache(&mut self.map, &k, v)?;
                    expired.push((k, v));
                }
            }
        }

        Ok(expired)
    }

    /// Subtract `amount` from one identity. The reputation is taken from the most recent
    /// packets first.
    ///
    /// This walks the queue back to front, so it is O(queue length).
    pub fn penalize(&mut self, id: &K, amount: Reputation) -> Result<(), ReputationError> {
        if amount.0 == 0 {
            return Ok(());
        }

        let mut to_subtract = amount;
        // Iterate back to front
        for packet in self.queue.iter_mut().rev() {
            if let Some(coin) = packet.grants.get_mut(id) {
                if !spend_coin(coin, &mut to_subtract) {
                    packet.grants.shift_remove(id);
                }
            }
            if to_subtract.0 == 0 {
                break;
            }
        }

        if to_subtract.0 > 0 {
            return Err(ReputationError::InsufficientPackets {
                identity: id.to_string(),
                amount,
                missing: to_subtract,
            });
        }

        decrement_cache(&mut self.map, id, amount)
    }

    /// Get the reputation for this identity.
    /// If the identity does not exist, return zero.
    pub fn get(&self, id: &K) -> Reputation {
        self.map.get(id).copied().unwrap_or_default()
    }

    /// Get the sum of the reputation of many identities.
    pub fn get_sum<'a, I>(&'a self, ids: I) -> Reputation
    where
        I: IntoIterator<Item = &'a K>,
    {
        ids.into_iter().map(|id| self.get(id)).sum()
    }

    /// Get the sum of the reputation of all the identities
    pub fn get_total_sum(&self) -> Reputation {
        self.map.values().copied().sum()
    }

    /// Reputation of one identity still queued in packets
    pub fn queued_sum(&self, id: &K) -> Reputation {
        self.queue
            .iter()
            .filter_map(|packet| packet.grants.get(id))
            .copied()
            .sum()
    }

    /// Reputation of all the queued packets
    pub fn queued_total(&self) -> Reputation {
        self.queue.iter().map(ReputationPacket::total).sum()
    }

    /// Get the number of identities present in the cache
    pub fn num_identities(&self) -> usize {
        self.map.len()
    }

    /// Iterator over all the identities and their corresponding reputation
    pub fn identities(&self) -> impl Iterator<Item = (&K, &Reputation)> {
        self.map.iter()
    }

    /// Drop the identities whose balance reached zero
    pub fn remove_zero_identities(&mut self) {
        self.map.retain(|_k, v| v.0 > 0);
    }

    /// Check that every cached balance is fully explained by the queued packets
    pub fn is_consistent(&self) -> bool {
        let mut from_queue: IndexMap<&K, Reputation> = IndexMap::new();
        for packet in &self.queue {
            for (k, v) in &packet.grants {
                *from_queue.entry(k).or_default() += *v;
            }
        }

        let cached = self.map.iter().filter(|(_k, v)| v.0 > 0);
        let queued = from_queue.iter().filter(|(_k, v)| v.0 > 0);

        cached.clone().count() == queued.count()
            && cached.into_iter().all(|(k, v)| from_queue.get(k) == Some(v))
    }

    /// Clear the Trs
    pub fn clear(&mut self) {
        self.map.clear();
        self.queue.clear();
    }
}

impl<K> Default for TotalReputationSet<K>
where
    K: Clone + Eq + Hash + fmt::Display,
{
    fn default() -> Self {
        Self::new()
    }
}

// Subtract `ts` from coin `x`. Returns whether the coin should be kept.
// if x > ts, keep coin but remove `ts`
// if x == ts, remove both
// if x < ts, remove coin but keep `ts`
fn spend_coin(x: &mut Reputation, ts: &mut Reputation) -> bool {
    match (*x).cmp(ts) {
        Ordering::Greater => {
            *x -= *ts;
            *ts = Reputation(0);
            true
        }
        Ordering::Equal => {
            *ts = Reputation(0);
            false
        }
        Ordering::Less => {
            *ts -= *x;
            false
        }
    }
}

/// Increment a cache entry
fn increment_cache<K>(map: &mut IndexMap<K, Reputation>, k: K, v: Reputation)
where
    K: Eq + Hash,
{
    if v.0 != 0 {
        *map.entry(k).or_default() += v;
    }
}

/// Decrement a cache entry.
/// Fails when there is not enough to subtract, or the identity does not exist.
fn decrement_cache<K>(
    map: &mut IndexMap<K, Reputation>,
    k: &K,
    v: Reputation,
) -> Result<(), ReputationError>
where
    K: Eq + Hash + fmt::Display,
{
    if v.0 == 0 {
        return Ok(());
    }

    let balance = map.get(k).copied().unwrap_or_default();
    match map.get_mut(k) {
        Some(x) if *x >= v => {
            *x -= v;
            Ok(())
        }
        _ => Err(ReputationError::NegativeReputation {
            identity: k.to_string(),
            balance,
            amount: v,
        }),
    }
}
