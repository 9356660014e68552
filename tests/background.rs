use cachestress::{
    cache::{CacheBackend, CacheValue, InMemoryCache},
    checker::{
        CheckerSettings, FailureManager, KeySelector, LastOperation, LogChecker, Pool,
        PrivateLogValue,
    },
    config::Config,
    control::ThreadControl,
    key_generator::KeyGenerator,
    keys::StressorThread,
    manager::OperationsManager,
    range::{self, KeyRange},
    stats::{self, Operation},
};
use pretty_assertions::assert_eq;
use std::{sync::Arc, thread, time::Duration};

const NUM_ENTRIES: i64 = 100;

fn single_thread_checker(cache: &InMemoryCache) -> (Arc<Pool>, LogChecker) {
    let pool = Arc::new(Pool::new(1, 1, NUM_ENTRIES, 0, Arc::new(FailureManager::new())));
    let settings = CheckerSettings {
        worker_index: 0,
        bucket: None,
        key_generator: KeyGenerator::String,
        counter_update_period: 50,
        write_apply_max_delay: Duration::ZERO,
    };
    let checker = LogChecker::new(
        0,
        Arc::new(settings),
        Arc::new(cache.clone()),
        Arc::clone(&pool),
        Arc::new(ThreadControl::new()),
    );
    (pool, checker)
}

/// Writes a checkpoint after operation 6 and returns the key of operation 7.
fn confirm_up_to_six(cache: &InMemoryCache, thread: StressorThread) -> i64 {
    let mut selector = KeySelector::new(thread, KeyRange::new(0, NUM_ENTRIES));
    for _ in 0..=6 {
        selector.next_key_id();
    }
    let checkpoint = LastOperation {
        operation_id: 6,
        seed: selector.position(),
    };
    cache.poke(None, thread.checker_key(0), CacheValue::LastOperation(checkpoint));
    selector.next_key_id()
}

fn heartbeat(cache: &InMemoryCache, thread: StressorThread, operation_id: i64) {
    cache.poke(
        None,
        thread.last_operation_key(),
        CacheValue::LastOperation(LastOperation {
            operation_id,
            seed: 0,
        }),
    );
}

#[test]
fn stored_operation_is_confirmed() {
    let _ = set_up_logger();

    let cache = InMemoryCache::new();
    let (pool, checker) = single_thread_checker(&cache);
    let thread = StressorThread::new(0);
    let key_id = confirm_up_to_six(&cache, thread);

    cache.poke(
        None,
        KeyGenerator::String.generate_key(key_id),
        CacheValue::Log(PrivateLogValue::new(thread, 5).with(7)),
    );
    heartbeat(&cache, thread, 7);

    let mut record = pool.take().unwrap();
    checker.check(&mut record).unwrap();
    assert_eq!(record.operation_id(), 8);
    assert_eq!(pool.missing_operations(), 0);
    assert!(pool.failures().last_stored_operation().is_some());
}

#[test]
fn overwritten_operation_is_missing() {
    let _ = set_up_logger();

    let cache = InMemoryCache::new();
    let (pool, checker) = single_thread_checker(&cache);
    let thread = StressorThread::new(0);
    let key_id = confirm_up_to_six(&cache, thread);

    // the log of operation 7 was replaced by one that lacks it
    cache.poke(
        None,
        KeyGenerator::String.generate_key(key_id),
        CacheValue::Log(PrivateLogValue::new(thread, 5)),
    );
    heartbeat(&cache, thread, 6);

    let mut record = pool.take().unwrap();
    checker.check(&mut record).unwrap();
    // the stressor may not have got there yet
    assert_eq!(record.operation_id(), 7);
    assert_eq!(pool.missing_operations(), 0);

    heartbeat(&cache, thread, 9);
    checker.check(&mut record).unwrap();
    assert_eq!(record.operation_id(), 8);
    assert_eq!(pool.missing_operations(), 1);
}

#[test]
fn thread_ranges_partition_the_key_space() {
    let (workers, threads) = (3, 4);
    let mut keys: Vec<i64> = Vec::new();
    for worker in 0..workers {
        for thread in 0..threads {
            keys.extend(range::thread_range(1000, workers, threads, worker, thread).iter());
        }
    }
    assert_eq!(keys, (0..1000).collect::<Vec<_>>());
}

fn config(configure: impl FnOnce(&mut Config)) -> Arc<Config> {
    let mut config = Config::default();
    config.general.num_entries = 120;
    config.general.num_threads = 2;
    config.general.entry_size = 16;
    config.general.termination_grace_period = Duration::from_millis(200);
    config.statistics.period = Duration::from_millis(50);
    configure(&mut config);
    config.validate().unwrap();
    Arc::new(config)
}

#[test]
fn log_logic_run_loses_nothing() {
    let _ = set_up_logger();

    let cache = InMemoryCache::new();
    let manager = OperationsManager::new(
        config(|config| {
            config.general.gets = 0;
            config.general.puts = 2;
            config.general.removes = 1;
            config.log_logic.enabled = true;
            config.log_logic.checking_threads = 2;
            config.log_logic.counter_update_period = 5;
            config.log_logic.value_max_size = 10;
            config.statistics.sample_cache_size = false;
        }),
        Arc::new(cache.clone()),
    );

    manager.start_stressors().unwrap();
    manager.start_stats().unwrap();
    thread::sleep(Duration::from_millis(300));
    manager.stop_stressors().unwrap();
    let intervals = manager.stop_stats().unwrap();
    manager.wait_until_checked().unwrap();

    assert_eq!(manager.missing_operations(), 0);
    assert_eq!(manager.get_error(), None);
    let total = stats::merge_all(intervals.iter().filter(|s| s.is_node_up()))
        .unwrap()
        .unwrap();
    assert!(total.operation_stats(Operation::Put).requests > 0);
    // both stressors left a heartbeat
    for thread in 0..2 {
        let heartbeat = cache.peek(None, &StressorThread::new(thread).last_operation_key());
        assert!(heartbeat.is_some(), "no heartbeat of thread {}", thread);
    }
}

#[test]
fn live_worker_loads_dead_worker_range() {
    let _ = set_up_logger();

    let cache = InMemoryCache::new();
    let manager = OperationsManager::new(
        config(|config| {
            config.cluster.size = 2;
            config.legacy_logic.load_data_for_dead_workers = vec![1];
        }),
        Arc::new(cache.clone()),
    );
    manager.start_stressors().unwrap();

    // the own range and the range of the dead worker are loaded
    assert_eq!(cache.local_size().unwrap(), 120);
    for key_id in 0..120 {
        let key = KeyGenerator::String.generate_key(key_id);
        assert!(cache.peek(None, &key).is_some(), "key {} not loaded", key);
    }

    manager.stop_stressors().unwrap();
    assert_eq!(manager.get_error(), None);
}

fn set_up_logger() -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}] {}",
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}
