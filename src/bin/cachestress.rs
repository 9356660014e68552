use argh::FromArgs;
use cachestress::{
    cache::InMemoryCache,
    config::Config,
    manager::OperationsManager,
    stats::{self, cache_size_max_relative_deviation},
};
use eyre::{bail, Context};
use std::{fs, path::PathBuf, sync::Arc, thread, time::Duration};

/// Runs the background stressors against an in-memory cache and prints the collected
/// statistics.
#[derive(FromArgs)]
struct Args {
    #[argh(positional)]
    config_file: PathBuf,
    /// how long the stressors run, in seconds
    #[argh(option, default = "10")]
    duration: u64,
    /// log every statistics interval, not just the totals
    #[argh(switch)]
    intervals: bool,
}

fn main() -> eyre::Result<()> {
    let args: Args = argh::from_env();

    if let Err(err) = cachestress::set_up_logger("cachestress.log", log::LevelFilter::Info) {
        eprintln!("failed to set up logger: {}", err);
    }

    let config: Config = serde_yaml::from_str(
        &fs::read_to_string(&args.config_file).context("failed to read config file")?,
    )
    .context("failed to parse config file")?;
    config.validate().context("invalid config")?;
    let threads = config.general.num_threads;
    let log_logic = config.log_logic.enabled;

    let run_id = uuid::Uuid::new_v4();
    log::info!("Starting run {} for {} s", run_id, args.duration);

    let manager = OperationsManager::new(Arc::new(config), Arc::new(InMemoryCache::new()));
    manager.start_stressors()?;
    manager.start_stats()?;
    thread::sleep(Duration::from_secs(args.duration));
    manager.stop_stressors()?;
    let intervals = manager.stop_stats()?;
    if log_logic {
        manager.wait_until_checked()?;
    }

    if args.intervals {
        for (i, interval) in intervals.iter().enumerate() {
            let results = interval.results(threads, "");
            log::info!("Interval {}: {}", i, serde_json::to_string(&results)?);
        }
    }
    log::info!(
        "Cache size deviated by at most {:.2}%",
        cache_size_max_relative_deviation(&intervals)
    );
    match stats::merge_all(intervals.iter().filter(|s| s.is_node_up()))? {
        Some(total) => {
            let mut results = total.results(threads, "");
            results.insert("RUN_ID".to_owned(), run_id.to_string().into());
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        None => log::warn!("No statistics were collected"),
    }

    if let Some(error) = manager.get_error() {
        bail!(error);
    }
    log::info!("Run {} finished", run_id);
    Ok(())
}
