//! Merge the classified data requests of every epoch into frequency counts

use std::collections::BTreeMap;

use witnet_reputation::FrequencyMap;

use crate::settlement::ClassifiedDataRequest;

/// Multiplicity of every identity in the data requests settled in one epoch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EpochCounts {
    pub epoch: u64,
    /// One entry per reveal: the sum of the values is the number of witnessing acts
    pub revealers: FrequencyMap<String>,
    pub honest: FrequencyMap<String>,
    pub errors: FrequencyMap<String>,
    pub liars: FrequencyMap<String>,
}

impl EpochCounts {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            ..Self::default()
        }
    }

    /// Number of witnessing acts of this epoch
    pub fn witnessing_acts(&self) -> u64 {
        self.revealers.values().map(|x| u64::from(*x)).sum()
    }

    fn add(&mut self, dr: &ClassifiedDataRequest) {
        count(&mut self.revealers, &dr.revealers);
        count(&mut self.honest, &dr.honest);
        count(&mut self.errors, &dr.errors);
        count(&mut self.liars, &dr.liars);
    }
}

fn count(map: &mut FrequencyMap<String>, addresses: &[String]) {
    for address in addresses {
        *map.entry(address.clone()).or_default() += 1;
    }
}

/// Accumulates classified data requests by epoch
#[derive(Debug, Default)]
pub struct EpochAggregator {
    epochs: BTreeMap<u64, EpochCounts>,
}

impl EpochAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group all the data requests by epoch, in one go
    pub fn aggregate<I>(classified: I) -> Vec<EpochCounts>
    where
        I: IntoIterator<Item = ClassifiedDataRequest>,
    {
        let mut aggregator = Self::new();
        for dr in classified {
            aggregator.add(&dr);
        }

        aggregator.finish()
    }

    pub fn add(&mut self, dr: &ClassifiedDataRequest) {
        self.epochs
            .entry(dr.epoch)
            .or_insert_with(|| EpochCounts::new(dr.epoch))
            .add(dr);
    }

    /// Counts of every epoch, in ascending epoch order
    pub fn finish(self) -> Vec<EpochCounts> {
        self.epochs.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn classified(epoch: u64, revealers: &[&str], honest: &[&str], liars: &[&str]) -> ClassifiedDataRequest {
        ClassifiedDataRequest {
            dr_pointer: format!("dr-{}", epoch),
            epoch,
            revealers: addrs(revealers),
            honest: addrs(honest),
            errors: vec![],
            liars: addrs(liars),
        }
    }

    #[test]
    fn same_epoch_accumulates() {
        let counts = EpochAggregator::aggregate(vec![
            classified(8, &["B", "A"], &["B", "A"], &[]),
            classified(3, &["C"], &["C"], &[]),
            classified(8, &["A", "C"], &["A"], &["C"]),
        ]);

        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].epoch, 3);
        assert_eq!(counts[1].epoch, 8);

        let e8 = &counts[1];
        // First-seen order
        assert_eq!(
            e8.revealers.iter().map(|(k, v)| (k.as_str(), *v)).collect::<Vec<_>>(),
            vec![("B", 1), ("A", 2), ("C", 1)]
        );
        assert_eq!(e8.honest["A"], 2);
        assert_eq!(e8.liars["C"], 1);
        assert!(e8.errors.is_empty());
        assert_eq!(e8.witnessing_acts(), 4);
    }

    #[test]
    fn empty_input() {
        assert_eq!(EpochAggregator::aggregate(vec![]), vec![]);
    }
}
