use std::{
    env,
    path::{Path, PathBuf},
};

use structopt::StructOpt;

use witnet_explorer::{
    config::{self, Config, StorageBackend},
    driver::Driver,
    persistence::{DurableSink, PersistenceAdapter, StorageSink},
    settlement::JsonSettlementReader,
};
use witnet_storage::{backends::btreemap, Storage};

mod report;

/// Config file used when `--config` is not given, if it exists
const DEFAULT_CONFIG_FILE: &str = "witnet_explorer.toml";

pub fn from_args() -> Cli {
    Cli::from_args()
}

pub fn exec(cli: Cli) -> anyhow::Result<()> {
    let mut log_opts = LogOptions {
        timestamp: !cli.no_timestamp,
        module_path: !cli.no_module_path,
        ..LogOptions::default()
    };

    if let Ok(rust_log) = env::var("RUST_LOG") {
        if rust_log.contains("witnet") {
            log_opts.level = env_logger::Logger::from_default_env().filter();
            log_opts.source = LogOptionsSource::Env;
        }
    }

    if cli.trace {
        log_opts.level = log::LevelFilter::Trace;
        log_opts.source = LogOptionsSource::Flag;
    } else if cli.debug {
        log_opts.level = log::LevelFilter::Debug;
        log_opts.source = LogOptionsSource::Flag;
    }

    init_logger(log_opts);

    let mut config = get_config(cli.config.clone().or_else(find_config))?;
    if let Some(stop_epoch) = cli.stop_epoch {
        config.driver.stop_epoch = Some(stop_epoch);
    }
    config.snapshot.load |= cli.load_snapshot;
    config.snapshot.persist |= cli.persist_snapshot;

    run(&cli, config)
}

fn run(cli: &Cli, config: Config) -> anyhow::Result<()> {
    let params = config.reputation.to_params()?;
    let reader = JsonSettlementReader::from_file(
        &config.settlements.path,
        config.settlements.lookback_margin,
    )?;
    let sink = StorageSink::new(open_storage(&config.storage)?);
    if let Some(last_epoch) = sink.last_epoch()? {
        log::info!("Durable storage has reputation rows up to epoch {}", last_epoch);
    }
    let persistence = PersistenceAdapter::new(sink).with_snapshot(
        config.snapshot.path.clone(),
        config.snapshot.load,
        config.snapshot.persist,
    );
    let ledger = persistence.load_ledger(params);

    let mut driver = Driver::new(reader, persistence, ledger, config.driver.clone());
    let summary = driver.run()?;
    log::info!(
        "Run finished: {} data requests ({} skipped), {} ledger updates, {} steps persisted",
        summary.data_requests,
        summary.skipped_data_requests,
        summary.updates,
        summary.steps
    );

    if cli.dump_ledger {
        report::print_ledger(driver.ledger());
    }
    if cli.print_max_stats {
        report::print_statistics(driver.statistics());
    }

    Ok(())
}

fn open_storage(config: &config::Storage) -> anyhow::Result<Box<dyn Storage>> {
    match config.backend {
        StorageBackend::InMemory => {
            log::warn!("Using in-memory storage: reputation rows will be lost at exit");
            Ok(Box::new(btreemap::Backend::default()))
        }
        StorageBackend::RocksDB => open_rocksdb(&config.db_path),
    }
}

#[cfg(feature = "rocksdb-backend")]
fn open_rocksdb(path: &Path) -> anyhow::Result<Box<dyn Storage>> {
    Ok(Box::new(witnet_storage::backends::rocksdb::open(path)?))
}

#[cfg(not(feature = "rocksdb-backend"))]
fn open_rocksdb(path: &Path) -> anyhow::Result<Box<dyn Storage>> {
    anyhow::bail!(
        "Cannot open RocksDB database at `{}`: built without the `rocksdb-backend` feature",
        path.display()
    )
}

fn init_logger(opts: LogOptions) {
    println!(
        "Setting log level to: {}, source: {:?}",
        opts.level, opts.source
    );
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
    if !opts.timestamp {
        builder.format_timestamp(None);
    }
    builder
        .format_module_path(opts.module_path)
        .filter_level(log::LevelFilter::Info)
        .filter_module("witnet", opts.level)
        .init();
}

fn find_config() -> Option<PathBuf> {
    let path = PathBuf::from(DEFAULT_CONFIG_FILE);

    path.exists().then_some(path)
}

fn get_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(p) => {
            println!("Loading config from: {}", p.display());
            Ok(config::from_file(p)?)
        }
        None => {
            println!("HEADS UP! No configuration specified/found. Using default one!");
            Ok(Config::default())
        }
    }
}

#[derive(Debug, StructOpt)]
#[structopt(
    name = "witnet-explorer",
    about = "Replay the reputation of the Witnet network from its settled data requests."
)]
pub struct Cli {
    /// Load configuration from this file. If not specified, `witnet_explorer.toml` is used when
    /// found in the current path. If no configuration is found, the default one is used.
    #[structopt(short = "c", long = "config")]
    config: Option<PathBuf>,
    /// Turn on DEBUG logging.
    #[structopt(long = "debug")]
    debug: bool,
    /// Turn on TRACE logging.
    #[structopt(long = "trace")]
    trace: bool,
    /// Do not show timestamps in logs.
    #[structopt(long = "no-timestamp")]
    no_timestamp: bool,
    /// Do not show module path in logs.
    #[structopt(long = "no-module-path")]
    no_module_path: bool,
    /// Last epoch to process. Overrides the config file.
    #[structopt(long = "stop-epoch")]
    stop_epoch: Option<u64>,
    /// Start from the reputation snapshot file instead of an empty ledger.
    #[structopt(long = "load-snapshot")]
    load_snapshot: bool,
    /// Save the reputation snapshot file at the end of the run.
    #[structopt(long = "persist-snapshot")]
    persist_snapshot: bool,
    /// Print the reputation of every identity at the end of the run.
    #[structopt(long = "dump-ledger")]
    dump_ledger: bool,
    /// Print the largest reputation gain and slash of the run.
    #[structopt(long = "print-max-stats")]
    print_max_stats: bool,
}

struct LogOptions {
    level: log::LevelFilter,
    timestamp: bool,
    module_path: bool,
    source: LogOptionsSource,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: log::LevelFilter::Info,
            timestamp: true,
            module_path: true,
            source: LogOptionsSource::Defaults,
        }
    }
}

#[derive(Debug)]
enum LogOptionsSource {
    Defaults,
    Env,
    Flag,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_flags() {
        let cli = Cli::from_iter(vec![
            "witnet-explorer",
            "--config",
            "explorer.toml",
            "--stop-epoch",
            "1500",
            "--load-snapshot",
            "--dump-ledger",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("explorer.toml")));
        assert_eq!(cli.stop_epoch, Some(1500));
        assert!(cli.load_snapshot);
        assert!(!cli.persist_snapshot);
        assert!(cli.dump_ledger);
        assert!(!cli.print_max_stats);
    }
}
