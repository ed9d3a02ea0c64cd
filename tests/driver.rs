use std::{fs, path::PathBuf};

use witnet_explorer::{
    config,
    driver::{Driver, RunSummary},
    persistence::{DurableSink, PersistenceAdapter, StorageSink},
    settlement::{MemorySettlementReader, SettledDataRequest},
};
use witnet_reputation::{DeltaKind, LedgerParams, Reputation, ReputationLedger};
use witnet_storage::backends::btreemap;

type TestDriver = Driver<MemorySettlementReader, StorageSink<btreemap::Backend>>;

fn addrs(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

fn settled(
    epoch: u64,
    revealers: &[&str],
    outputs: &[&str],
    inputs: &[&str],
    liars: &[&str],
) -> SettledDataRequest {
    SettledDataRequest {
        dr_pointer: format!("dr-{}-{}", epoch, outputs.join("-")),
        epoch,
        reveal_epoch: None,
        revealers: addrs(revealers),
        tally_outputs: addrs(outputs),
        tally_inputs: addrs(inputs),
        error_committers: vec![],
        out_of_consensus: addrs(liars),
    }
}

fn driver(
    records: Vec<SettledDataRequest>,
    ledger: ReputationLedger<String>,
    stop_epoch: u64,
    snapshot: Option<(PathBuf, bool, bool)>,
) -> TestDriver {
    driver_with_batch(records, ledger, stop_epoch, snapshot, 7)
}

fn driver_with_batch(
    records: Vec<SettledDataRequest>,
    ledger: ReputationLedger<String>,
    stop_epoch: u64,
    snapshot: Option<(PathBuf, bool, bool)>,
    batch_epochs: u64,
) -> TestDriver {
    let mut persistence = PersistenceAdapter::new(StorageSink::new(btreemap::Backend::default()));
    if let Some((path, load, persist)) = snapshot {
        persistence = persistence.with_snapshot(path, load, persist);
    }
    let settings = config::Driver {
        start_epoch: 0,
        stop_epoch: Some(stop_epoch),
        batch_epochs,
    };

    Driver::new(
        MemorySettlementReader::new(records),
        persistence,
        ledger,
        settings,
    )
}

#[test]
fn failed_data_requests_are_skipped() {
    let records = vec![
        settled(1, &["A", "B"], &["A", "B"], &["A", "B", "C"], &[]),
        // Tally just returns the collateral
        settled(2, &["A", "B"], &["A", "B"], &["B", "A"], &[]),
        // B lies, the last output refunds the requester
        settled(3, &["A", "B"], &["A", "REQUESTER"], &["A", "B"], &["B"]),
    ];
    let mut driver = driver(
        records,
        ReputationLedger::new(LedgerParams::default()),
        5,
        None,
    );

    let summary = driver.run().unwrap();
    assert_eq!(
        summary,
        RunSummary {
            stop_epoch: Some(5),
            updates: 2,
            steps: 3,
            data_requests: 3,
            skipped_data_requests: 1,
            snapshot_saved: false,
        }
    );

    let sink = driver.persistence().sink();
    assert_eq!(
        sink.reputations_at(1).unwrap(),
        Some(vec![
            ("A".to_string(), Reputation(1)),
            ("B".to_string(), Reputation(1))
        ])
    );
    // Epoch 2 only has the synthetic expiry step: nothing changes
    assert!(sink.deltas_at(2).unwrap().is_empty());
    assert_eq!(
        sink.reputations_at(2).unwrap(),
        sink.reputations_at(1).unwrap()
    );

    let deltas: Vec<_> = sink
        .deltas_at(3)
        .unwrap()
        .into_iter()
        .map(|row| (row.address, row.signed_delta, row.kind))
        .collect();
    assert_eq!(
        deltas,
        vec![
            ("B".to_string(), -1, DeltaKind::Lie),
            ("A".to_string(), 3, DeltaKind::Gain),
        ]
    );
    assert_eq!(
        sink.reputations_at(3).unwrap(),
        Some(vec![("A".to_string(), Reputation(4))])
    );
    assert_eq!(sink.last_epoch().unwrap(), Some(3));
    assert_eq!(sink.address_count().unwrap(), 2);
    assert_eq!(driver.ledger().leftover_reputation(), Reputation(0));
}

// Deterministic list of settled data requests with gaps, liars and failed requests
fn history(last_epoch: u64) -> Vec<SettledDataRequest> {
    let ids = ["wit1a", "wit1b", "wit1c", "wit1d", "wit1e"];
    let mut records = vec![];
    for epoch in 1..=last_epoch {
        if epoch % 5 == 0 || epoch % 7 == 0 {
            continue;
        }
        let i = usize::try_from(epoch).unwrap();
        let a = ids[i % 5];
        let b = ids[(i + 1) % 5];
        let c = ids[(i * 3 + 2) % 5];
        if epoch % 3 == 0 && c != a && c != b {
            records.push(settled(epoch, &[a, b, c], &[a, b, "REQUESTER"], &[a, b, c], &[c]));
        } else {
            records.push(settled(epoch, &[a, b], &[a, b], &[a, b, "wit1late"], &[]));
        }
        if epoch % 4 == 0 {
            records.push(settled(epoch, &[a], &[a], &[a], &[]));
        }
    }

    records
}

fn params() -> LedgerParams {
    LedgerParams {
        expire_alpha_diff: 12,
        ..LedgerParams::default()
    }
}

#[test]
fn warm_restart_matches_single_run() {
    let path = std::env::temp_dir().join(format!(
        "witnet_explorer_warm_restart_{}.json",
        std::process::id()
    ));

    let mut single = driver(history(60), ReputationLedger::new(params()), 60, None);
    single.run().unwrap();

    let mut first = driver(
        history(60),
        ReputationLedger::new(params()),
        30,
        Some((path.clone(), false, true)),
    );
    assert!(first.run().unwrap().snapshot_saved);

    let adapter = PersistenceAdapter::new(StorageSink::new(btreemap::Backend::default()))
        .with_snapshot(path.clone(), true, false);
    let ledger = adapter.load_ledger(params());
    assert_eq!(ledger.state(), first.ledger().state());

    let mut second = driver(history(60), ledger, 60, Some((path.clone(), true, false)));
    second.run().unwrap();
    fs::remove_file(&path).unwrap();

    assert_eq!(second.ledger().state(), single.ledger().state());
    let single_sink = single.persistence().sink();
    let second_sink = second.persistence().sink();
    // Epoch 29 is the last one of the first run
    assert_eq!(second_sink.ledger_at(29).unwrap(), None);
    assert!(second_sink.ledger_at(30).unwrap().is_some());
    for epoch in 30..=60 {
        assert_eq!(
            second_sink.deltas_at(epoch).unwrap(),
            single_sink.deltas_at(epoch).unwrap(),
            "deltas of epoch {}",
            epoch
        );
        assert_eq!(
            second_sink.reputations_at(epoch).unwrap(),
            single_sink.reputations_at(epoch).unwrap(),
            "ledger of epoch {}",
            epoch
        );
    }
}

#[test]
fn history_exercises_every_delta_kind() {
    let mut d = driver(history(60), ReputationLedger::new(params()), 60, None);
    d.run().unwrap();

    let sink = d.persistence().sink();
    let mut kinds = vec![];
    for epoch in 1..=60 {
        for row in sink.deltas_at(epoch).unwrap() {
            if !kinds.contains(&row.kind) {
                kinds.push(row.kind);
            }
        }
    }
    kinds.sort_by_key(|kind| kind.as_str());
    assert_eq!(kinds, vec![DeltaKind::Expire, DeltaKind::Gain, DeltaKind::Lie]);

    let stats = d.statistics();
    assert!(stats.max_gain.is_some());
    assert!(stats.max_slash.is_some());
    assert!(d.ledger().state().trs.is_consistent());
}

#[test]
fn batch_size_does_not_change_the_ledger() {
    // Some tallies settle long after their first reveal
    let records: Vec<_> = history(60)
        .into_iter()
        .enumerate()
        .map(|(i, mut dr)| {
            if i % 3 == 0 {
                dr.reveal_epoch = Some(dr.epoch.saturating_sub(25));
            }
            dr
        })
        .collect();

    let mut runs = vec![];
    for batch_epochs in [1, 5, 7, 1000] {
        let mut d = driver_with_batch(
            records.clone(),
            ReputationLedger::new(params()),
            60,
            None,
            batch_epochs,
        );
        let summary = d.run().unwrap();
        assert_eq!(summary.data_requests, records.len(), "batch of {}", batch_epochs);
        runs.push(d);
    }

    let first = &runs[0];
    for other in &runs[1..] {
        assert_eq!(other.ledger().state(), first.ledger().state());
        for epoch in 1..=60 {
            assert_eq!(
                other.persistence().sink().deltas_at(epoch).unwrap(),
                first.persistence().sink().deltas_at(epoch).unwrap(),
                "deltas of epoch {}",
                epoch
            );
        }
    }
}
