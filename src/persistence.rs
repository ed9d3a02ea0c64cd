//! Persistence of the reputation ledger
//!
//! Two independent outputs:
//!
//! * The durable sink: an append-only audit trail of reputation deltas and one full ledger row per
//!   epoch, stored in a `witnet_storage` backend.
//! * The file snapshot: a JSON dump of the whole `LedgerState`, only used to restart faster.

use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use witnet_reputation::{
    DeltaKind, EpochReport, LedgerParams, LedgerState, Reputation, ReputationLedger, StepReport,
};
use witnet_storage::{Storage, WriteBatch};

/// Errors raised by the persistence layer
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// The storage backend failed
    #[error("Storage error: {0:#}")]
    Storage(anyhow::Error),
    /// A row could not be encoded or decoded
    #[error("Cannot encode or decode row `{key}`: {source}")]
    Row {
        key: String,
        source: serde_json::Error,
    },
    /// A ledger row references an address id that is not in the catalog
    #[error("Address id {id} is not in the address catalog")]
    UnknownAddressId { id: u64 },
    /// The file snapshot cannot be read or written
    #[error("Snapshot file error on `{}`: {source}", path.display())]
    SnapshotIo {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file snapshot is not a valid ledger state
    #[error("Invalid snapshot file `{}`: {source}", path.display())]
    SnapshotFormat {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// The identities of the file snapshot are not backed by its packet queue
    #[error("Inconsistent snapshot file `{}`: identities do not match the expiry queue", path.display())]
    SnapshotInconsistent { path: PathBuf },
}

impl From<anyhow::Error> for PersistenceError {
    fn from(e: anyhow::Error) -> Self {
        PersistenceError::Storage(e)
    }
}

/// Audit row of one reputation change
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeltaRow {
    pub address: String,
    pub epoch: u64,
    pub signed_delta: i64,
    pub kind: DeltaKind,
}

/// Full ledger at the end of one epoch
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct LedgerRow {
    pub epoch: u64,
    pub address_ids: Vec<u64>,
    pub reputations: Vec<u64>,
}

/// Append-only bidirectional mapping between addresses and integer ids
pub trait AddressCatalog {
    /// Id of `address`, inserting it if it is not in the catalog yet
    fn get_or_create_id(&mut self, address: &str) -> Result<u64, PersistenceError>;

    /// Address with this id
    fn address(&self, id: u64) -> Result<Option<String>, PersistenceError>;
}

/// Destination of the outcome of every processed epoch
pub trait DurableSink {
    /// Write the deltas of one step and the full ledger after it
    fn write_epoch(&mut self, step: &StepReport<String>) -> Result<(), PersistenceError>;

    /// Full ledger row written for this epoch
    fn ledger_at(&self, epoch: u64) -> Result<Option<LedgerRow>, PersistenceError>;

    /// Deltas written for this epoch, in the order they were applied
    fn deltas_at(&self, epoch: u64) -> Result<Vec<DeltaRow>, PersistenceError>;

    /// Most recent epoch with a ledger row
    fn last_epoch(&self) -> Result<Option<u64>, PersistenceError>;
}

const ADDRESS_COUNT_KEY: &str = "address-count";

fn address_key(address: &str) -> String {
    format!("address-{}", address)
}

fn address_id_key(id: u64) -> String {
    format!("address-id-{:020}", id)
}

fn delta_prefix(epoch: u64) -> String {
    format!("delta-{:020}-", epoch)
}

fn delta_key(epoch: u64, seq: usize) -> String {
    format!("delta-{:020}-{:06}", epoch, seq)
}

const LEDGER_PREFIX: &str = "trs-";

fn ledger_key(epoch: u64) -> String {
    format!("{}{:020}", LEDGER_PREFIX, epoch)
}

fn to_json<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, PersistenceError> {
    serde_json::to_vec(value).map_err(|source| PersistenceError::Row {
        key: key.to_string(),
        source,
    })
}

fn from_json<T: DeserializeOwned>(key: &[u8], value: &[u8]) -> Result<T, PersistenceError> {
    serde_json::from_slice(value).map_err(|source| PersistenceError::Row {
        key: String::from_utf8_lossy(key).into_owned(),
        source,
    })
}

/// `DurableSink` and `AddressCatalog` on top of a key/value storage. Rows are stored as JSON.
#[derive(Debug)]
pub struct StorageSink<S> {
    storage: S,
}

impl<S> StorageSink<S>
where
    S: Storage,
{
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PersistenceError> {
        match self.storage.get(key.as_bytes())? {
            Some(value) => Ok(Some(from_json(key.as_bytes(), &value)?)),
            None => Ok(None),
        }
    }

    /// Number of addresses in the catalog
    pub fn address_count(&self) -> Result<u64, PersistenceError> {
        Ok(self.get_json(ADDRESS_COUNT_KEY)?.unwrap_or(0))
    }

    // Resolve the ids of all these addresses. New addresses are added to `batch`, so they are
    // only visible once the batch is written.
    fn assign_ids<'a, I>(
        &self,
        addresses: I,
        batch: &mut WriteBatch,
    ) -> Result<IndexMap<String, u64>, PersistenceError>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let count = self.address_count()?;
        let mut next_id = count;
        let mut ids = IndexMap::new();
        for address in addresses {
            if ids.contains_key(address) {
                continue;
            }
            let id = match self.get_json(&address_key(address))? {
                Some(id) => id,
                None => {
                    let id = next_id;
                    next_id += 1;
                    let key = address_key(address);
                    batch.put(key.clone(), to_json(&key, &id)?);
                    let key = address_id_key(id);
                    batch.put(key.clone(), to_json(&key, address)?);
                    log::trace!("New address {} with id {}", address, id);
                    id
                }
            };
            ids.insert(address.clone(), id);
        }
        if next_id != count {
            batch.put(ADDRESS_COUNT_KEY, to_json(ADDRESS_COUNT_KEY, &next_id)?);
        }

        Ok(ids)
    }

    /// Reputation of every identity at the end of `epoch`, translated back to addresses
    pub fn reputations_at(
        &self,
        epoch: u64,
    ) -> Result<Option<Vec<(String, Reputation)>>, PersistenceError> {
        let row = match self.ledger_at(epoch)? {
            Some(row) => row,
            None => return Ok(None),
        };
        let mut reputations = Vec::with_capacity(row.address_ids.len());
        for (id, rep) in row.address_ids.iter().zip(row.reputations.iter()) {
            let address = self
                .address(*id)?
                .ok_or(PersistenceError::UnknownAddressId { id: *id })?;
            reputations.push((address, Reputation(*rep)));
        }

        Ok(Some(reputations))
    }
}

impl<S> AddressCatalog for StorageSink<S>
where
    S: Storage,
{
    fn get_or_create_id(&mut self, address: &str) -> Result<u64, PersistenceError> {
        let mut batch = WriteBatch::default();
        let address = address.to_string();
        let ids = self.assign_ids(std::iter::once(&address), &mut batch)?;
        if !batch.is_empty() {
            self.storage.write(batch)?;
        }

        Ok(ids[&address])
    }

    fn address(&self, id: u64) -> Result<Option<String>, PersistenceError> {
        self.get_json(&address_id_key(id))
    }
}

impl<S> DurableSink for StorageSink<S>
where
    S: Storage,
{
    fn write_epoch(&mut self, step: &StepReport<String>) -> Result<(), PersistenceError> {
        let mut batch = WriteBatch::default();
        let ids = self.assign_ids(
            step.deltas
                .iter()
                .map(|delta| &delta.address)
                .chain(step.identities.iter().map(|(address, _)| address)),
            &mut batch,
        )?;

        // Rows left by a previous run of the same epoch are replaced
        let prefix = delta_prefix(step.epoch);
        for (key, _value) in self.storage.prefix_iterator(prefix.as_bytes())? {
            batch.delete(key);
        }
        for (seq, delta) in step.deltas.iter().enumerate() {
            let key = delta_key(step.epoch, seq);
            let row = DeltaRow {
                address: delta.address.clone(),
                epoch: delta.epoch,
                signed_delta: delta.signed_amount(),
                kind: delta.kind,
            };
            batch.put(key.clone(), to_json(&key, &row)?);
        }

        let key = ledger_key(step.epoch);
        let row = LedgerRow {
            epoch: step.epoch,
            address_ids: step
                .identities
                .iter()
                .map(|(address, _)| ids[address])
                .collect(),
            reputations: step.identities.iter().map(|(_, rep)| rep.0).collect(),
        };
        batch.put(key.clone(), to_json(&key, &row)?);

        log::debug!(
            "Writing epoch {}: {} deltas, {} identities",
            step.epoch,
            step.deltas.len(),
            step.identities.len()
        );
        self.storage.write(batch)?;

        Ok(())
    }

    fn ledger_at(&self, epoch: u64) -> Result<Option<LedgerRow>, PersistenceError> {
        self.get_json(&ledger_key(epoch))
    }

    fn deltas_at(&self, epoch: u64) -> Result<Vec<DeltaRow>, PersistenceError> {
        let prefix = delta_prefix(epoch);
        let rows: Result<Vec<DeltaRow>, _> = self
            .storage
            .prefix_iterator(prefix.as_bytes())?
            .map(|(key, value)| from_json(&key, &value))
            .collect();

        rows
    }

    fn last_epoch(&self) -> Result<Option<u64>, PersistenceError> {
        match self
            .storage
            .prefix_iterator_reverse(LEDGER_PREFIX.as_bytes())?
            .next()
        {
            Some((key, value)) => Ok(Some(from_json::<LedgerRow>(&key, &value)?.epoch)),
            None => Ok(None),
        }
    }
}

fn read_snapshot(path: &Path) -> Result<LedgerState<String>, PersistenceError> {
    let contents = fs::read_to_string(path).map_err(|source| PersistenceError::SnapshotIo {
        path: path.to_path_buf(),
        source,
    })?;
    let state: LedgerState<String> =
        serde_json::from_str(&contents).map_err(|source| PersistenceError::SnapshotFormat {
            path: path.to_path_buf(),
            source,
        })?;
    if !state.trs.is_consistent() {
        return Err(PersistenceError::SnapshotInconsistent {
            path: path.to_path_buf(),
        });
    }

    Ok(state)
}

/// Load the ledger state saved in a file snapshot.
///
/// A missing, unreadable or invalid file is not an error: it results in a cold start.
pub fn load_snapshot<P: AsRef<Path>>(path: P) -> LedgerState<String> {
    let path = path.as_ref();
    match read_snapshot(path) {
        Ok(state) => {
            log::info!(
                "Loaded reputation snapshot from `{}`: epoch {}, {} identities",
                path.display(),
                state.epoch,
                state.trs.num_identities()
            );
            state
        }
        Err(e) => {
            log::warn!("{}. Starting from an empty reputation ledger", e);
            LedgerState::default()
        }
    }
}

/// Save the ledger state to a file snapshot. The file is replaced atomically.
pub fn save_snapshot<P: AsRef<Path>>(
    path: P,
    state: &LedgerState<String>,
) -> Result<(), PersistenceError> {
    let path = path.as_ref();
    let io_error = |source| PersistenceError::SnapshotIo {
        path: path.to_path_buf(),
        source,
    };

    let contents =
        serde_json::to_vec(state).map_err(|source| PersistenceError::SnapshotFormat {
            path: path.to_path_buf(),
            source,
        })?;
    let mut tmp_path = OsString::from(path.as_os_str());
    tmp_path.push(".tmp");
    let tmp_path = PathBuf::from(tmp_path);
    fs::write(&tmp_path, contents).map_err(io_error)?;
    fs::rename(&tmp_path, path).map_err(io_error)?;

    log::info!(
        "Saved reputation snapshot to `{}`: epoch {}, {} identities",
        path.display(),
        state.epoch,
        state.trs.num_identities()
    );

    Ok(())
}

/// Durable sink plus the optional file snapshot
#[derive(Debug)]
pub struct PersistenceAdapter<D> {
    sink: D,
    snapshot_path: Option<PathBuf>,
    load_snapshot: bool,
    persist_snapshot: bool,
}

impl<D> PersistenceAdapter<D>
where
    D: DurableSink,
{
    pub fn new(sink: D) -> Self {
        Self {
            sink,
            snapshot_path: None,
            load_snapshot: false,
            persist_snapshot: false,
        }
    }

    /// Use a file snapshot to warm start (`load`) and to save the final state (`persist`)
    pub fn with_snapshot(mut self, path: PathBuf, load: bool, persist: bool) -> Self {
        self.snapshot_path = Some(path);
        self.load_snapshot = load;
        self.persist_snapshot = persist;
        self
    }

    pub fn sink(&self) -> &D {
        &self.sink
    }

    /// Ledger to start the run with: restored from the file snapshot if enabled, empty otherwise
    pub fn load_ledger(&self, params: LedgerParams) -> ReputationLedger<String> {
        match &self.snapshot_path {
            Some(path) if self.load_snapshot => {
                let state = load_snapshot(path);
                if state == LedgerState::default() {
                    ReputationLedger::new(params)
                } else {
                    ReputationLedger::restore(state, params)
                }
            }
            _ => ReputationLedger::new(params),
        }
    }

    /// Write every step of this update to the durable sink
    pub fn persist(&mut self, report: &EpochReport<String>) -> Result<(), PersistenceError> {
        for step in report.steps() {
            self.sink.write_epoch(step)?;
        }

        Ok(())
    }

    /// Save the file snapshot, if enabled. Returns whether it was saved.
    pub fn save_ledger(&self, ledger: &ReputationLedger<String>) -> Result<bool, PersistenceError> {
        match &self.snapshot_path {
            Some(path) if self.persist_snapshot => {
                save_snapshot(path, ledger.state())?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
