use tempfile::TempDir;

use perflab::db::Database;
use perflab::error::PerflabError;
use perflab::stats::{
    aggregate, merge, reduce_parallel, PartialAggregate, RunStats, StatsService, WarmupFilter,
    PARALLEL_THRESHOLD,
};
use perflab::store::{Run, RunStore, Sample, SampleStore};

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

fn series(n: usize) -> Vec<f64> {
    (0..n).map(|i| ((i * 7919) % 1000) as f64 / 3.0 + 1e6).collect()
}

#[test]
fn test_warmup_discard_examples() {
    let stats = aggregate(&[100.0, 10.0, 10.0, 10.0], 4);
    assert_eq!(stats.count, 4);
    assert_eq!(stats.average, Some(10.0));
    assert_eq!(stats.min, Some(10.0));
    assert_eq!(stats.max, Some(10.0));
    assert_eq!(stats.stddev, Some(0.0));

    let single = aggregate(&[100.0], 1);
    assert_eq!(single.count, 1);
    assert_eq!(single.average, Some(100.0));
    assert_eq!(single.stddev, None);
}

#[test]
fn test_only_warmup_sample_gives_sentinel() {
    assert_eq!(aggregate(&[42.0], 5), RunStats::empty());
    assert_eq!(aggregate(&[], 1), RunStats::empty());
    assert_eq!(RunStats::empty().count, 1);
}

#[test]
fn test_warmup_counter_is_per_run() {
    // Two runs aggregated back to back each lose their own first sample.
    let first = aggregate(&[1000.0, 1.0, 3.0], 3);
    let second = aggregate(&[1000.0, 1.0, 3.0], 3);
    assert_eq!(first, second);
    assert_eq!(first.average, Some(2.0));

    let filter = WarmupFilter::new(3);
    assert_eq!(filter.retained(&[9.0, 1.0, 2.0]), &[1.0, 2.0]);
    let keep_all = WarmupFilter::new(1);
    assert_eq!(keep_all.retained(&[9.0, 1.0]), &[9.0, 1.0]);
}

#[test]
fn test_combine_associative_over_partitions() {
    let samples = series(1_000);
    let whole = PartialAggregate::from_samples(&samples).unwrap();

    for cuts in [vec![1], vec![10, 500], vec![333, 334, 999], vec![250, 500, 750]] {
        let mut bounds = vec![0];
        bounds.extend(cuts);
        bounds.push(samples.len());
        let parts: Vec<PartialAggregate> = bounds
            .windows(2)
            .filter_map(|w| PartialAggregate::from_samples(&samples[w[0]..w[1]]))
            .collect();

        let forward = parts.iter().cloned().map(Some).fold(None, merge).unwrap();
        let backward = parts.iter().rev().cloned().map(Some).fold(None, merge).unwrap();

        for combined in [forward, backward] {
            assert_eq!(combined.count, whole.count);
            assert!(close(combined.mean(), whole.mean()));
            assert!(close(combined.m2, whole.m2));
            assert_eq!(combined.min, whole.min);
            assert_eq!(combined.max, whole.max);
        }
    }
}

#[test]
fn test_parallel_reduce_matches_serial() {
    let samples = series(PARALLEL_THRESHOLD * 3 + 17);
    let serial = PartialAggregate::from_samples(&samples).unwrap();
    let parallel = reduce_parallel(&samples, 1_024).unwrap();

    assert_eq!(parallel.count, serial.count);
    assert!(close(parallel.sum, serial.sum));
    assert!(close(parallel.m2, serial.m2));

    let stats = aggregate(&samples, 10);
    assert_eq!(stats.count, samples.len() as u64);
}

#[test]
fn test_large_offset_values_stay_stable() {
    // Naive sum-of-squares loses all precision here.
    let samples: Vec<f64> = (0..10_000).map(|i| 1e9 + (i % 2) as f64).collect();
    let stats = aggregate(&samples, 1);
    let stddev = stats.stddev.unwrap();
    assert!((stddev - 0.5).abs() < 1e-3, "stddev = {}", stddev);
}

#[test]
fn test_stats_service_idempotent_on_sqlite() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("stats.db")).unwrap();
    let runs = db.run_store();

    let run = Run::new(uuid::Uuid::new_v4(), 4);
    let run_id = run.id;
    runs.insert_run(run.clone()).unwrap();
    for v in [100.0, 12.0, 10.0, 8.0] {
        runs.insert_sample(Sample::new(run_id, run.config_id, v)).unwrap();
    }

    let service = StatsService::new(runs.clone(), runs.clone());
    let first = service.update_run_stats(&run_id).unwrap();
    let second = service.update_run_stats(&run_id).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.count, 4);
    assert_eq!(first.average, Some(10.0));
    assert!(close(first.stddev.unwrap(), 2.0));
    assert_eq!(runs.get_run(&run_id).unwrap().unwrap().stats, Some(first));
}

#[test]
fn test_stats_overwrite_after_new_samples() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("stats.db")).unwrap();
    let runs = db.run_store();

    let run = Run::new(uuid::Uuid::new_v4(), 3);
    let run_id = run.id;
    runs.insert_run(run.clone()).unwrap();
    let service = StatsService::new(runs.clone(), runs.clone());

    runs.insert_sample(Sample::new(run_id, run.config_id, 50.0)).unwrap();
    assert_eq!(service.update_run_stats(&run_id).unwrap(), RunStats::empty());

    runs.insert_sample(Sample::new(run_id, run.config_id, 4.0)).unwrap();
    runs.insert_sample(Sample::new(run_id, run.config_id, 6.0)).unwrap();
    let stats = service.update_run_stats(&run_id).unwrap();
    assert_eq!(stats.count, 3);
    assert_eq!(stats.average, Some(5.0));
    assert_eq!(runs.get_run(&run_id).unwrap().unwrap().stats, Some(stats));
}

#[test]
fn test_stats_for_unknown_run() {
    let db = Database::open_in_memory().unwrap();
    let runs = db.run_store();
    let service = StatsService::new(runs.clone(), runs);
    assert!(matches!(
        service.update_run_stats(&uuid::Uuid::new_v4()),
        Err(PerflabError::RunNotFound(_))
    ));
}
