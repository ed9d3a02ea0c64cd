use std::cmp::Reverse;

use itertools::Itertools;
use num_format::{Locale, ToFormattedString};
use prettytable::{cell, row, Table};

use witnet_explorer::driver::{DeltaRecord, EpochStatistics};
use witnet_reputation::ReputationLedger;

pub fn print_ledger(ledger: &ReputationLedger<String>) {
    if ledger.num_identities() == 0 {
        println!("No identities have reputation yet");
    } else {
        let mut table = Table::new();
        table.set_format(*prettytable::format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
        table.set_titles(row!["Identity", r->"Reputation", r->"Eligibility"]);
        for (pkh, rep) in ledger
            .identities()
            .sorted_by_key(|(pkh, rep)| (Reverse(**rep), (*pkh).clone()))
        {
            table.add_row(row![
                pkh,
                r->rep.0.to_formatted_string(&Locale::en),
                r->format!("{:.6}%", ledger.eligibility(pkh) * 100_f64)
            ]);
        }
        table.printstd();
    }

    let mut totals = Table::new();
    totals.set_format(*prettytable::format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
    totals.add_row(row!["Epoch", r->ledger.epoch().to_formatted_string(&Locale::en)]);
    totals.add_row(row![
        "Witnessing acts",
        r->ledger.witnessing_acts().0.to_formatted_string(&Locale::en)
    ]);
    totals.add_row(row![
        "Identities",
        r->ledger.num_identities().to_formatted_string(&Locale::en)
    ]);
    totals.add_row(row![
        "Total reputation",
        r->ledger.total_reputation().0.to_formatted_string(&Locale::en)
    ]);
    totals.add_row(row![
        "Leftover reputation",
        r->ledger.leftover_reputation().0.to_formatted_string(&Locale::en)
    ]);
    totals.printstd();
}

pub fn print_statistics(stats: &EpochStatistics) {
    let mut table = Table::new();
    table.set_format(*prettytable::format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
    table.set_titles(row!["", r->"Epoch", "Identity", r->"Reputation"]);
    for (name, record) in [("Max gain", &stats.max_gain), ("Max slash", &stats.max_slash)] {
        match record {
            Some(DeltaRecord {
                epoch,
                address,
                amount,
            }) => table.add_row(row![
                name,
                r->epoch.to_formatted_string(&Locale::en),
                address,
                r->amount.0.to_formatted_string(&Locale::en)
            ]),
            None => table.add_row(row![name, r->"-", "-", r->"-"]),
        };
    }
    table.add_row(row![
        "Total gained",
        "",
        "",
        r->stats.total_gained.0.to_formatted_string(&Locale::en)
    ]);
    table.add_row(row![
        "Total slashed",
        "",
        "",
        r->stats.total_slashed.0.to_formatted_string(&Locale::en)
    ]);
    table.add_row(row![
        "Total expired",
        "",
        "",
        r->stats.total_expired.0.to_formatted_string(&Locale::en)
    ]);
    table.printstd();
}
