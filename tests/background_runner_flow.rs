use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chartlab::application::analyzer::{AnalyzerConfig, VisibleChartAnalyzer};
use chartlab::application::runner::background_runner::{BackgroundRunner, RunnerConfig};
use chartlab::application::runner::events::RunnerEvent;
use chartlab::domain::market::candle::{Candle, VisibleRange};
use chartlab::domain::market::timeframe::Timeframe;
use chartlab::infrastructure::cache::AnalyzerCache;
use chartlab::infrastructure::mock::{CountingAnalyzer, SyntheticSource};

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Real analyzer over a synthetic feed, wrapped so tests can tell full
/// analyses from incremental ones. Optimization is off to keep each
/// analysis fast; the scheduler is disabled so only explicit requests run.
fn build_runner(seed: u64) -> (Arc<CountingAnalyzer>, BackgroundRunner) {
    let source = Arc::new(SyntheticSource::new(seed));
    let cache = Arc::new(AnalyzerCache::default());
    let inner = Arc::new(VisibleChartAnalyzer::new(
        source,
        cache,
        AnalyzerConfig {
            use_optimizer: false,
            ..AnalyzerConfig::default()
        },
    ));
    let counting = Arc::new(CountingAnalyzer::wrap(inner));
    let runner = BackgroundRunner::new(
        counting.clone(),
        RunnerConfig {
            reanalyze_interval_sec: 0.0,
            debounce_ms: 50.0,
            max_queue_size: 10,
            use_optimizer: false,
            auto_start: false,
            performance_log_interval: 1_000,
        },
    );
    (counting, runner)
}

#[test]
fn test_incremental_without_cache_falls_back_to_full() {
    let (counting, runner) = build_runner(7);
    let events = runner.subscribe();
    runner.start();

    let range = VisibleRange::new(100_000, 103_600);
    let candle = Candle::new(103_600, 100.0, 100.5, 99.5, 100.0, 1_000.0);
    assert!(runner.push_new_candles(vec![candle], range, "EURUSD", Timeframe::OneMin));

    // The worker has no cached window yet, so the update runs as a full
    // analysis.
    assert!(wait_until(Duration::from_secs(5), || counting.full_calls() == 1));
    assert_eq!(counting.incremental_calls(), 0);

    let mut saw_result = false;
    while let Ok(event) = events.recv_timeout(Duration::from_millis(500)) {
        if matches!(event, RunnerEvent::Result(_)) {
            saw_result = true;
            break;
        }
    }
    assert!(saw_result);
    runner.stop();
}

#[test]
fn test_fresh_candles_use_the_incremental_path() {
    let (counting, runner) = build_runner(7);
    runner.start();

    let range = VisibleRange::new(100_000, 103_600);
    assert!(runner.request_analysis(range, "EURUSD", Timeframe::OneMin, true));
    assert!(wait_until(Duration::from_secs(5), || counting.full_calls() == 1));

    // One bar past the cached window, range shifted by one bar.
    let next = Candle::new(103_660, 100.0, 100.5, 99.5, 100.0, 1_000.0);
    let shifted = VisibleRange::new(100_060, 103_660);
    assert!(runner.push_new_candles(vec![next], shifted, "EURUSD", Timeframe::OneMin));

    assert!(wait_until(Duration::from_secs(5), || {
        counting.incremental_calls() == 1
    }));
    assert_eq!(counting.full_calls(), 1);

    assert!(wait_until(Duration::from_secs(5), || {
        runner.last_result().is_some_and(|result| result.range == shifted)
    }));
    runner.stop();
}

#[test]
fn test_metrics_capture_analyzer_cache_hits() {
    let (counting, runner) = build_runner(3);
    runner.start();

    let range = VisibleRange::new(200_000, 203_600);
    assert!(runner.request_analysis(range, "EURUSD", Timeframe::OneMin, true));
    assert!(wait_until(Duration::from_secs(5), || counting.full_calls() == 1));
    assert!(runner.request_analysis(range, "EURUSD", Timeframe::OneMin, true));
    assert!(wait_until(Duration::from_secs(5), || counting.full_calls() == 2));

    assert!(wait_until(Duration::from_secs(5), || {
        runner.metrics().total_analyses == 2
    }));

    // The repeated window is served from the analyzer's result cache.
    let metrics = runner.metrics();
    assert!((metrics.cache_hit_rate - 0.5).abs() < 1e-9);
    assert_eq!(metrics.queue_overflows, 0);
    runner.stop();
}

#[test]
fn test_burst_of_requests_collapses_to_one_analysis() {
    let (counting, runner) = build_runner(9);
    runner.start();

    let first = VisibleRange::new(300_000, 303_600);
    let second = VisibleRange::new(300_060, 303_660);
    assert!(runner.request_analysis(first, "EURUSD", Timeframe::OneMin, false));
    assert!(runner.request_analysis(second, "EURUSD", Timeframe::OneMin, false));

    assert!(wait_until(Duration::from_secs(5), || counting.full_calls() >= 1));
    // Long enough for a second analysis to surface if one were queued.
    thread::sleep(Duration::from_millis(700));
    assert_eq!(counting.full_calls(), 1);
    assert!(
        runner
            .last_result()
            .is_some_and(|result| result.range == second)
    );
    runner.stop();
}
