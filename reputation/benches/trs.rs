#[macro_use]
extern crate bencher;
use bencher::Bencher;
use witnet_reputation::{
    Alpha, FrequencyMap, LedgerParams, Reputation, ReputationLedger, TotalReputationSet,
};

fn grants(n: u32) -> Vec<(u32, Reputation)> {
    (0..n)
        .map(|i| (i, Reputation(10 + u64::from(i % 4))))
        .collect()
}

fn bench_gain(b: &mut Bencher) {
    let v = grants(10000);

    b.iter(|| {
        let mut a = TotalReputationSet::new();
        a.gain(Alpha(10), v.clone()).unwrap();
    })
}

fn bench_gain_x10(b: &mut Bencher) {
    let v = grants(10000);

    b.iter(|| {
        let mut a = TotalReputationSet::new();
        for j in 0..10 {
            a.gain(Alpha(10 + j), v.clone()).unwrap();
        }
    })
}

fn bench_gain_expire(b: &mut Bencher) {
    let v = grants(10000);

    b.iter(|| {
        let mut a = TotalReputationSet::new();
        a.gain(Alpha(10), v.clone()).unwrap();
        a.expire(&Alpha(10)).unwrap();
    })
}

fn bench_gain_expire_x10(b: &mut Bencher) {
    let v = grants(10000);

    b.iter(|| {
        let mut a = TotalReputationSet::new();
        for j in 0..10 {
            a.expire(&Alpha(j)).unwrap();
            a.gain(Alpha(10 + j), v.clone()).unwrap();
        }
    })
}

fn bench_penalize(b: &mut Bencher) {
    let v = grants(1000);
    let mut a = TotalReputationSet::new();
    for j in 0..100 {
        a.gain(Alpha(10 + j), v.clone()).unwrap();
    }

    b.iter(|| {
        let mut a = a.clone();
        for i in 0..1000 {
            // Half of the reputation of every identity
            let slash = Reputation(a.get(&i).0 / 2);
            a.penalize(&i, slash).unwrap();
        }
    })
}

fn bench_ledger_update(b: &mut Bencher) {
    let revealers: FrequencyMap<u32> = (0..1000).map(|i| (i, 1 + i % 3)).collect();
    let honest: FrequencyMap<u32> = revealers
        .iter()
        .filter(|(i, _)| *i % 10 != 0)
        .map(|(i, n)| (*i, *n))
        .collect();
    let liars: FrequencyMap<u32> = revealers
        .iter()
        .filter(|(i, _)| *i % 10 == 0)
        .map(|(i, n)| (*i, *n))
        .collect();
    let errors = FrequencyMap::new();

    b.iter(|| {
        let mut ledger = ReputationLedger::new(LedgerParams {
            expire_alpha_diff: 5000,
            ..LedgerParams::default()
        });
        for epoch in 1..=50 {
            ledger
                .update(epoch, &revealers, &honest, &errors, &liars)
                .unwrap();
        }
    })
}

benchmark_group!(
    benches,
    bench_gain,
    bench_gain_x10,
    bench_gain_expire,
    bench_gain_expire_x10,
    bench_penalize,
    bench_ledger_update
);
benchmark_main!(benches);
