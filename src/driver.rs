//! Batch driver
//!
//! Walks the epoch range of a run, feeding the settled data requests of every epoch to the
//! reputation ledger in ascending order, and persisting the outcome of every update before moving
//! on to the next one.

use std::cmp;

use witnet_reputation::{DeltaKind, EpochReport, Reputation, ReputationError, ReputationLedger};

use crate::{
    aggregator::EpochAggregator,
    config,
    persistence::{DurableSink, PersistenceAdapter, PersistenceError},
    settlement::{classify, SettlementError, SettlementReader},
};

/// Errors that abort a batch run
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Reputation(#[from] ReputationError),
    #[error(transparent)]
    Settlement(#[from] SettlementError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl DriverError {
    /// The ledger is inconsistent and the run must be retried from the last durable epoch
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::Reputation(e) if e.is_fatal())
    }
}

/// Largest change of reputation of one identity in one epoch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeltaRecord {
    pub epoch: u64,
    pub address: String,
    pub amount: Reputation,
}

/// Debug statistics collected during a run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EpochStatistics {
    /// Largest reputation gain
    pub max_gain: Option<DeltaRecord>,
    /// Largest reputation slash
    pub max_slash: Option<DeltaRecord>,
    pub total_gained: Reputation,
    pub total_expired: Reputation,
    pub total_slashed: Reputation,
}

impl EpochStatistics {
    pub fn record(&mut self, report: &EpochReport<String>) {
        for delta in report.steps().flat_map(|step| step.deltas.iter()) {
            let (max, total) = match delta.kind {
                DeltaKind::Gain => (Some(&mut self.max_gain), &mut self.total_gained),
                DeltaKind::Lie => (Some(&mut self.max_slash), &mut self.total_slashed),
                DeltaKind::Expire => (None, &mut self.total_expired),
            };
            *total += delta.amount;
            if let Some(max) = max {
                if max.as_ref().map_or(true, |m| delta.amount > m.amount) {
                    *max = Some(DeltaRecord {
                        epoch: delta.epoch,
                        address: delta.address.clone(),
                        amount: delta.amount,
                    });
                }
            }
        }
    }
}

/// What a run did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Last epoch of the range
    pub stop_epoch: Option<u64>,
    /// Calls to `ReputationLedger::update`
    pub updates: usize,
    /// Steps written to the durable sink, including the synthetic expiry steps
    pub steps: usize,
    /// Data requests read from the settlement reader
    pub data_requests: usize,
    /// Failed data requests, without reputation events
    pub skipped_data_requests: usize,
    pub snapshot_saved: bool,
}

/// Reads settlements, updates the ledger and persists the results
#[derive(Debug)]
pub struct Driver<R, D> {
    reader: R,
    persistence: PersistenceAdapter<D>,
    ledger: ReputationLedger<String>,
    settings: config::Driver,
    stats: EpochStatistics,
}

impl<R, D> Driver<R, D>
where
    R: SettlementReader,
    D: DurableSink,
{
    pub fn new(
        reader: R,
        persistence: PersistenceAdapter<D>,
        ledger: ReputationLedger<String>,
        settings: config::Driver,
    ) -> Self {
        Self {
            reader,
            persistence,
            ledger,
            settings,
            stats: EpochStatistics::default(),
        }
    }

    pub fn ledger(&self) -> &ReputationLedger<String> {
        &self.ledger
    }

    pub fn persistence(&self) -> &PersistenceAdapter<D> {
        &self.persistence
    }

    pub fn statistics(&self) -> &EpochStatistics {
        &self.stats
    }

    /// Process every epoch up to the configured stop epoch, then save the file snapshot if
    /// enabled.
    pub fn run(&mut self) -> Result<RunSummary, DriverError> {
        let mut summary = RunSummary::default();
        let stop_epoch = match self.settings.stop_epoch {
            Some(stop_epoch) => stop_epoch,
            None => match self.reader.last_epoch()? {
                Some(last_epoch) => last_epoch,
                None => {
                    log::info!("No settled data requests found");
                    return Ok(summary);
                }
            },
        };
        summary.stop_epoch = Some(stop_epoch);

        let mut from_epoch = if self.ledger.is_cold() {
            self.settings.start_epoch
        } else {
            self.ledger.epoch() + 1
        };
        if from_epoch > stop_epoch {
            log::info!(
                "Reputation ledger is already at epoch {}, nothing to do until epoch {}",
                self.ledger.epoch(),
                stop_epoch
            );
        }

        let batch_epochs = cmp::max(self.settings.batch_epochs, 1);
        while from_epoch <= stop_epoch {
            let to_epoch = cmp::min(from_epoch.saturating_add(batch_epochs - 1), stop_epoch);
            self.process_window(from_epoch, to_epoch, &mut summary)?;
            if to_epoch == u64::MAX {
                break;
            }
            from_epoch = to_epoch + 1;
        }

        summary.snapshot_saved = self.persistence.save_ledger(&self.ledger)?;
        log::info!(
            "Reputation ledger at epoch {}: {} identities, {} total reputation, {} leftover",
            self.ledger.epoch(),
            self.ledger.num_identities(),
            self.ledger.total_reputation(),
            self.ledger.leftover_reputation()
        );

        Ok(summary)
    }

    fn process_window(
        &mut self,
        from_epoch: u64,
        to_epoch: u64,
        summary: &mut RunSummary,
    ) -> Result<(), DriverError> {
        let settled = self.reader.settled_between(from_epoch, to_epoch)?;
        let classified: Vec<_> = settled.iter().filter_map(classify).collect();
        let skipped = settled.len() - classified.len();
        summary.data_requests += settled.len();
        summary.skipped_data_requests += skipped;

        let epochs = EpochAggregator::aggregate(classified);
        let num_epochs = epochs.len();
        for counts in epochs {
            let report = self.ledger.update(
                counts.epoch,
                &counts.revealers,
                &counts.honest,
                &counts.errors,
                &counts.liars,
            )?;
            self.persistence.persist(&report)?;
            self.stats.record(&report);
            summary.updates += 1;
            summary.steps += report.steps().count();
        }

        log::info!(
            "Processed epochs [{}, {}]: {} data requests ({} skipped), {} epochs with reputation events",
            from_epoch,
            to_epoch,
            settled.len(),
            skipped,
            num_epochs
        );

        Ok(())
    }
}
