//! Settled data requests
//!
//! Source of the reputation events: which identities took part in every settled data request, and
//! how the network judged them.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// Default number of epochs scanned for reveals before the start of a window, so that the reveals
/// of a tally settled at the beginning of the window are not missed
pub const LOOKBACK_MARGIN: u64 = 10;

/// Errors raised while reading settled data requests
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    /// The settlements file cannot be read
    #[error("Cannot read settlements file `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The settlements file is not a JSON array of settled data requests
    #[error("Invalid settlements file `{}`: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// Asked for a window that ends before it starts
    #[error("Invalid epoch window: [{from_epoch}, {to_epoch}]")]
    InvalidWindow { from_epoch: u64, to_epoch: u64 },
}

/// Outcome of one data request, as found in the tally transaction that settled it
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SettledDataRequest {
    /// Hash of the data request transaction
    pub dr_pointer: String,
    /// Epoch of the tally transaction
    pub epoch: u64,
    /// Epoch of the first reveal, when it is known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reveal_epoch: Option<u64>,
    /// Addresses that revealed, one entry per reveal
    pub revealers: Vec<String>,
    /// Addresses paid by the tally transaction, in output order
    #[serde(alias = "tally_output_addresses")]
    pub tally_outputs: Vec<String>,
    /// Addresses that committed to the data request, whose collateral the tally returns
    pub tally_inputs: Vec<String>,
    /// Addresses that revealed an error
    #[serde(default, alias = "error_addresses")]
    pub error_committers: Vec<String>,
    /// Addresses that did not reveal, or revealed a value out of consensus
    #[serde(default, alias = "liar_addresses")]
    pub out_of_consensus: Vec<String>,
}

impl SettledDataRequest {
    fn first_seen_epoch(&self) -> u64 {
        self.reveal_epoch.unwrap_or(self.epoch)
    }
}

/// Identities of one data request grouped by how they behaved
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassifiedDataRequest {
    pub dr_pointer: String,
    pub epoch: u64,
    pub revealers: Vec<String>,
    pub honest: Vec<String>,
    pub errors: Vec<String>,
    pub liars: Vec<String>,
}

/// Split the identities of a settled data request into honest, error and liar sets.
///
/// Returns `None` when the data request failed as a whole: the tally just returns the collateral
/// to every committer, so there is nothing to reward or slash.
pub fn classify(dr: &SettledDataRequest) -> Option<ClassifiedDataRequest> {
    if same_addresses(&dr.tally_outputs, &dr.tally_inputs) {
        log::trace!(
            "Skipping data request {} settled at epoch {}: tally outputs match its inputs",
            dr.dr_pointer,
            dr.epoch
        );
        return None;
    }

    let errors = dr.error_committers.clone();
    // Error committers are not liars, even if they are out of consensus
    let liars: Vec<String> = dr
        .out_of_consensus
        .iter()
        .filter(|pkh| !errors.contains(pkh))
        .cloned()
        .collect();

    let mut outputs = dr.tally_outputs.as_slice();
    if !errors.is_empty() || !liars.is_empty() {
        // The last output refunds the requester
        if let Some((_refund, rewards)) = outputs.split_last() {
            outputs = rewards;
        }
    }
    let honest = outputs
        .iter()
        .filter(|pkh| !errors.contains(pkh))
        .cloned()
        .collect();

    Some(ClassifiedDataRequest {
        dr_pointer: dr.dr_pointer.clone(),
        epoch: dr.epoch,
        revealers: dr.revealers.clone(),
        honest,
        errors,
        liars,
    })
}

// Same addresses, regardless of the order
fn same_addresses(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a: Vec<&String> = a.iter().collect();
    let mut b: Vec<&String> = b.iter().collect();
    a.sort();
    b.sort();

    a == b
}

/// Query interface over the settled data requests
pub trait SettlementReader {
    /// Every data request whose tally settled in `[from_epoch, to_epoch]`, ordered by settlement
    /// epoch.
    ///
    /// Reveals are looked up from `lookback_margin` epochs before `from_epoch`. The margin never
    /// excludes a tally settled inside the window.
    fn settled_between(
        &self,
        from_epoch: u64,
        to_epoch: u64,
    ) -> Result<Vec<SettledDataRequest>, SettlementError>;

    /// Most recent settlement epoch, if any
    fn last_epoch(&self) -> Result<Option<u64>, SettlementError>;
}

// Shared selection logic of the readers backed by a list of records
fn select(
    records: &[SettledDataRequest],
    from_epoch: u64,
    to_epoch: u64,
    lookback_margin: u64,
) -> Result<Vec<SettledDataRequest>, SettlementError> {
    if to_epoch < from_epoch {
        return Err(SettlementError::InvalidWindow {
            from_epoch,
            to_epoch,
        });
    }

    let reveals_from = from_epoch.saturating_sub(lookback_margin);
    let mut selected: Vec<SettledDataRequest> = records
        .iter()
        .filter(|dr| dr.epoch >= from_epoch && dr.epoch <= to_epoch)
        .cloned()
        .collect();
    // Stable: data requests of the same epoch keep their order
    selected.sort_by_key(|dr| dr.epoch);

    // Revealers come with the record
    let early_reveals = selected
        .iter()
        .filter(|dr| dr.first_seen_epoch() < reveals_from)
        .count();
    if early_reveals > 0 {
        log::debug!(
            "{} data requests settled in epochs [{}, {}] were revealed before epoch {}",
            early_reveals,
            from_epoch,
            to_epoch,
            reveals_from
        );
    }

    log::debug!(
        "Found {} settled data requests in epochs [{}, {}] (reveals from epoch {})",
        selected.len(),
        from_epoch,
        to_epoch,
        reveals_from
    );

    Ok(selected)
}

/// Reader over a JSON file containing an array of `SettledDataRequest`
#[derive(Debug)]
pub struct JsonSettlementReader {
    records: Vec<SettledDataRequest>,
    lookback_margin: u64,
}

impl JsonSettlementReader {
    /// Load all the records of the file
    pub fn from_file<P: AsRef<Path>>(path: P, lookback_margin: u64) -> Result<Self, SettlementError> {
        let path = path.as_ref();
        log::debug!("Loading settled data requests from `{}`", path.display());

        let contents = fs::read_to_string(path).map_err(|source| SettlementError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let records: Vec<SettledDataRequest> =
            serde_json::from_str(&contents).map_err(|source| SettlementError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        log::info!(
            "Loaded {} settled data requests from `{}`",
            records.len(),
            path.display()
        );

        Ok(Self {
            records,
            lookback_margin,
        })
    }
}

impl SettlementReader for JsonSettlementReader {
    fn settled_between(
        &self,
        from_epoch: u64,
        to_epoch: u64,
    ) -> Result<Vec<SettledDataRequest>, SettlementError> {
        select(&self.records, from_epoch, to_epoch, self.lookback_margin)
    }

    fn last_epoch(&self) -> Result<Option<u64>, SettlementError> {
        Ok(self.records.iter().map(|dr| dr.epoch).max())
    }
}

/// Reader over records kept in memory
#[derive(Debug, Default)]
pub struct MemorySettlementReader {
    records: Vec<SettledDataRequest>,
    lookback_margin: u64,
}

impl MemorySettlementReader {
    pub fn new(records: Vec<SettledDataRequest>) -> Self {
        Self {
            records,
            lookback_margin: LOOKBACK_MARGIN,
        }
    }

    pub fn with_lookback_margin(mut self, lookback_margin: u64) -> Self {
        self.lookback_margin = lookback_margin;
        self
    }

    pub fn push(&mut self, record: SettledDataRequest) {
        self.records.push(record);
    }
}

impl SettlementReader for MemorySettlementReader {
    fn settled_between(
        &self,
        from_epoch: u64,
        to_epoch: u64,
    ) -> Result<Vec<SettledDataRequest>, SettlementError> {
        select(&self.records, from_epoch, to_epoch, self.lookback_margin)
    }

    fn last_epoch(&self) -> Result<Option<u64>, SettlementError> {
        Ok(self.records.iter().map(|dr| dr.epoch).max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn dr(epoch: u64, outputs: &[&str], inputs: &[&str]) -> SettledDataRequest {
        SettledDataRequest {
            dr_pointer: format!("dr-{}", epoch),
            epoch,
            reveal_epoch: None,
            revealers: addrs(inputs),
            tally_outputs: addrs(outputs),
            tally_inputs: addrs(inputs),
            error_committers: vec![],
            out_of_consensus: vec![],
        }
    }

    #[test]
    fn classify_all_honest() {
        let d = dr(5, &["A", "B", "C"], &["A", "B", "C", "D"]);
        let c = classify(&d).unwrap();
        assert_eq!(c.honest, addrs(&["A", "B", "C"]));
        assert!(c.errors.is_empty());
        assert!(c.liars.is_empty());
        assert_eq!(c.revealers, addrs(&["A", "B", "C", "D"]));
    }

    #[test]
    fn classify_failed_data_request_is_skipped() {
        let d = dr(5, &["B", "A"], &["A", "B"]);
        assert_eq!(classify(&d), None);
    }

    #[test]
    fn classify_drops_refund_output() {
        let mut d = dr(5, &["A", "B", "E", "REQUESTER"], &["A", "B", "E", "L"]);
        d.error_committers = addrs(&["E"]);
        d.out_of_consensus = addrs(&["E", "L"]);
        let c = classify(&d).unwrap();

        assert_eq!(c.honest, addrs(&["A", "B"]));
        assert_eq!(c.errors, addrs(&["E"]));
        assert_eq!(c.liars, addrs(&["L"]));
    }

    #[test]
    fn classify_keeps_last_output_without_errors_or_liars() {
        let d = dr(5, &["A", "B"], &["A", "B", "C"]);
        assert_eq!(classify(&d).unwrap().honest, addrs(&["A", "B"]));
    }

    #[test]
    fn reader_selects_by_settlement_epoch() {
        let mut late = dr(20, &["A"], &["A", "B"]);
        late.dr_pointer = "late".to_string();
        late.reveal_epoch = Some(12);
        let mut stale = dr(21, &["A"], &["A", "B"]);
        stale.dr_pointer = "stale".to_string();
        stale.reveal_epoch = Some(5);
        let reader = MemorySettlementReader::new(vec![
            dr(25, &["A"], &["A", "B"]),
            dr(19, &["A"], &["A", "B"]),
            late,
            stale,
            dr(31, &["A"], &["A", "B"]),
        ]);

        let found: Vec<_> = reader
            .settled_between(20, 30)
            .unwrap()
            .into_iter()
            .map(|dr| dr.dr_pointer)
            .collect();
        // A reveal older than the margin does not drop a tally settled inside the window
        assert_eq!(
            found,
            vec!["late".to_string(), "stale".to_string(), "dr-25".to_string()]
        );
        assert_eq!(reader.last_epoch().unwrap(), Some(31));

        assert!(matches!(
            reader.settled_between(30, 20),
            Err(SettlementError::InvalidWindow { .. })
        ));
    }

    #[test]
    fn selection_does_not_depend_on_window_start() {
        let mut old_reveal = dr(21, &["A"], &["A", "B"]);
        old_reveal.reveal_epoch = Some(5);
        let reader = MemorySettlementReader::new(vec![old_reveal]);

        assert_eq!(reader.settled_between(0, 30).unwrap().len(), 1);
        assert_eq!(reader.settled_between(20, 30).unwrap().len(), 1);
        assert_eq!(reader.settled_between(21, 21).unwrap().len(), 1);
        assert!(reader.settled_between(22, 30).unwrap().is_empty());
    }

    #[test]
    fn json_reader_accepts_query_field_names() {
        let path = std::env::temp_dir().join(format!(
            "witnet_explorer_settlements_{}.json",
            std::process::id()
        ));
        fs::write(
            &path,
            r#"[{
                "dr_pointer": "abc",
                "epoch": 7,
                "revealers": ["A", "B"],
                "tally_output_addresses": ["A", "REQUESTER"],
                "tally_inputs": ["A", "B"],
                "liar_addresses": ["B"]
            }]"#,
        )
        .unwrap();

        let reader = JsonSettlementReader::from_file(&path, LOOKBACK_MARGIN).unwrap();
        let found = reader.settled_between(0, 10).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(found.len(), 1);
        let c = classify(&found[0]).unwrap();
        assert_eq!(c.honest, addrs(&["A"]));
        assert_eq!(c.liars, addrs(&["B"]));
    }

    #[test]
    fn json_reader_missing_file() {
        let err = JsonSettlementReader::from_file("/nonexistent/settlements.json", 10).unwrap_err();
        assert!(matches!(err, SettlementError::Io { .. }));
    }
}
