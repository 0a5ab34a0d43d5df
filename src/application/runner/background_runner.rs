use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::application::analyzer::{AnalysisResult, ChartAnalyzer};
use crate::application::runner::events::{EventHub, RunnerEvent};
use crate::application::runner::metrics::PerformanceMetrics;
use crate::application::runner::task::{AnalysisTask, TaskKind, TaskQueue};
use crate::domain::market::candle::{Candle, VisibleRange};
use crate::domain::market::timeframe::Timeframe;

const POP_TIMEOUT: Duration = Duration::from_millis(500);
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Warmup lookback is fixed at 100 minutes regardless of timeframe.
const WARMUP_SECS: i64 = 100 * 60;
/// A candle cache whose newest bar trails the requested window by more
/// than this is refreshed with a full analysis.
const STALE_AFTER_SECS: i64 = 300;
const MAX_CACHED_CANDLES: usize = 5000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Periodic re-analysis interval. Zero disables the scheduler.
    pub reanalyze_interval_sec: f64,
    /// Window during which non-forced requests are held back and
    /// collapsed, last one wins.
    pub debounce_ms: f64,
    pub max_queue_size: usize,
    /// Forwarded to the analyzer wiring; the runner itself never
    /// branches on it.
    pub use_optimizer: bool,
    pub auto_start: bool,
    /// Emit a performance summary every N completed analyses.
    pub performance_log_interval: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            reanalyze_interval_sec: 60.0,
            debounce_ms: 500.0,
            max_queue_size: 10,
            use_optimizer: true,
            auto_start: false,
            performance_log_interval: 10,
        }
    }
}

#[derive(Default)]
struct DebounceState {
    last_request: Option<Instant>,
    pending: Option<AnalysisTask>,
}

#[derive(Clone)]
struct AnalysisTarget {
    symbol: String,
    range: VisibleRange,
    timeframe: Timeframe,
}

struct Shared {
    queue: TaskQueue,
    events: EventHub,
    metrics: Mutex<PerformanceMetrics>,
    debounce: Mutex<DebounceState>,
    stop_signal: (Mutex<bool>, Condvar),
    running: AtomicBool,
    target: Mutex<Option<AnalysisTarget>>,
    last_result: Mutex<Option<Arc<AnalysisResult>>>,
    analyzer: Arc<dyn ChartAnalyzer>,
    config: RunnerConfig,
}

/// Runs analyses off the caller's thread.
///
/// One worker thread drains the task queue; an optional scheduler
/// thread re-requests the current target at a fixed interval. Both
/// exit on `stop()`. The worker owns the candle cache outright, so
/// incremental updates never contend with submitters.
pub struct BackgroundRunner {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundRunner {
    pub fn new(analyzer: Arc<dyn ChartAnalyzer>, config: RunnerConfig) -> Self {
        let runner = Self {
            shared: Arc::new(Shared {
                queue: TaskQueue::new(config.max_queue_size),
                events: EventHub::new(),
                metrics: Mutex::new(PerformanceMetrics::default()),
                debounce: Mutex::new(DebounceState::default()),
                stop_signal: (Mutex::new(false), Condvar::new()),
                running: AtomicBool::new(false),
                target: Mutex::new(None),
                last_result: Mutex::new(None),
                analyzer,
                config,
            }),
            handles: Mutex::new(Vec::new()),
        };
        if runner.shared.config.auto_start {
            runner.start();
        }
        runner
    }

    /// Spawn the worker and scheduler threads. Calling this on a
    /// running instance warns and does nothing.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            warn!("Runner: Already running");
            return;
        }
        {
            let (lock, _) = &self.shared.stop_signal;
            *lock_or_recover(lock, "stop signal") = false;
        }
        // A stale Stop sentinel from a previous run would kill the new
        // worker immediately.
        self.shared.queue.clear();

        let mut handles = lock_or_recover(&self.handles, "thread handles");
        let worker_shared = Arc::clone(&self.shared);
        handles.push(thread::spawn(move || worker_loop(worker_shared)));
        if self.shared.config.reanalyze_interval_sec > 0.0 {
            let scheduler_shared = Arc::clone(&self.shared);
            handles.push(thread::spawn(move || scheduler_loop(scheduler_shared)));
        }
        info!(
            "Runner: Started (queue capacity {}, debounce {:.0}ms, re-analyze every {:.0}s)",
            self.shared.config.max_queue_size,
            self.shared.config.debounce_ms,
            self.shared.config.reanalyze_interval_sec
        );
    }

    /// Signal both threads and wait up to two seconds for them to
    /// finish. Idempotent; a task still in flight is allowed to
    /// complete and the thread is detached if it overruns the wait.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let (lock, cvar) = &self.shared.stop_signal;
            *lock_or_recover(lock, "stop signal") = true;
            cvar.notify_all();
        }
        self.shared.queue.try_push(AnalysisTask::stop());

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *lock_or_recover(&self.handles, "thread handles"));
        let deadline = Instant::now() + JOIN_TIMEOUT;
        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("Runner: Thread panicked before shutdown");
                }
            } else {
                warn!("Runner: Thread still busy after {:?}, detaching", JOIN_TIMEOUT);
            }
        }
        info!("Runner: Stopped");
    }

    /// Ask for a full analysis of the given window.
    ///
    /// Non-forced requests are debounced: within `debounce_ms` of the
    /// previous request the submission is parked (replacing any parked
    /// predecessor) and queued once the window elapses. Returns false
    /// only when the request was dropped, either because the runner is
    /// stopped or the queue is full; a parked request returns true.
    pub fn request_analysis(
        &self,
        range: VisibleRange,
        symbol: &str,
        timeframe: Timeframe,
        force: bool,
    ) -> bool {
        if !self.shared.running.load(Ordering::SeqCst) {
            debug!("Runner: Not running, ignoring request for {}", symbol);
            return false;
        }
        let task = AnalysisTask::full(range, symbol, timeframe);
        if force {
            return self.shared.submit(task);
        }
        self.shared.flush_debounce();
        let mut debounce = lock_or_recover(&self.shared.debounce, "debounce");
        debounce.pending = Some(task);
        debounce.last_request = Some(Instant::now());
        true
    }

    /// Hand freshly closed candles to the worker. Never debounced.
    pub fn push_new_candles(
        &self,
        new_candles: Vec<Candle>,
        range: VisibleRange,
        symbol: &str,
        timeframe: Timeframe,
    ) -> bool {
        if !self.shared.running.load(Ordering::SeqCst) {
            debug!("Runner: Not running, dropping {} candles", new_candles.len());
            return false;
        }
        self.shared
            .submit(AnalysisTask::incremental(range, symbol, timeframe, new_candles))
    }

    pub fn subscribe(&self) -> Receiver<RunnerEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        lock_or_recover(&self.shared.metrics, "metrics").clone()
    }

    pub fn last_result(&self) -> Option<Arc<AnalysisResult>> {
        lock_or_recover(&self.shared.last_result, "last result").clone()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.shared.config
    }
}

impl Drop for BackgroundRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn submit(&self, task: AnalysisTask) -> bool {
        let kind = task.kind;
        if self.queue.try_push(task) {
            true
        } else {
            warn!("Runner: Queue full, dropping {:?} task", kind);
            lock_or_recover(&self.metrics, "metrics").queue_overflows += 1;
            false
        }
    }

    /// Queue the parked request once its debounce window has elapsed.
    /// Called on every submission and on each idle poll of the worker.
    fn flush_debounce(&self) {
        let flushed = {
            let mut debounce = lock_or_recover(&self.debounce, "debounce");
            let window_elapsed = debounce
                .last_request
                .is_some_and(|last| last.elapsed() >= self.debounce_window());
            if window_elapsed && debounce.pending.is_some() {
                debounce.last_request = Some(Instant::now());
                debounce.pending.take()
            } else {
                None
            }
        };
        if let Some(task) = flushed {
            debug!("Runner: Debounce window elapsed, queuing {}", task.symbol);
            self.submit(task);
        }
    }

    fn debounce_window(&self) -> Duration {
        Duration::from_secs_f64((self.config.debounce_ms / 1000.0).max(0.0))
    }

    fn stop_requested(&self) -> bool {
        let (lock, _) = &self.stop_signal;
        *lock_or_recover(lock, "stop signal")
    }

    /// Block until the stop signal fires or `timeout` passes. Returns
    /// true when stopping.
    fn wait_for_stop(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &self.stop_signal;
        let deadline = Instant::now() + timeout;
        let mut stopped = lock_or_recover(lock, "stop signal");
        while !*stopped {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            stopped = match cvar.wait_timeout(stopped, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => {
                    error!("Runner: stop signal lock poisoned, recovering");
                    poisoned.into_inner().0
                }
            };
        }
        true
    }
}

fn worker_loop(shared: Arc<Shared>) {
    debug!("Runner: Worker started");
    let mut candle_cache: Vec<Candle> = Vec::new();
    loop {
        let Some(task) = shared.queue.pop_timeout(POP_TIMEOUT) else {
            shared.flush_debounce();
            if shared.stop_requested() {
                break;
            }
            continue;
        };
        if task.kind == TaskKind::Stop {
            break;
        }
        let started = Instant::now();
        let kind = task.kind;
        let symbol = task.symbol.clone();
        match run_task(&shared, task, &mut candle_cache) {
            Ok(result) => {
                finish_task(&shared, kind, &result, &mut candle_cache);
                record_timing(&shared, started);
            }
            Err(error) => {
                error!("Runner: Analysis of {} failed: {:#}", symbol, error);
                shared
                    .events
                    .publish(RunnerEvent::Error(format!("{:#}", error)));
            }
        }
    }
    debug!("Runner: Worker exited");
}

fn scheduler_loop(shared: Arc<Shared>) {
    let interval = Duration::from_secs_f64(shared.config.reanalyze_interval_sec.max(0.01));
    debug!("Runner: Scheduler started ({:.1}s interval)", interval.as_secs_f64());
    loop {
        if shared.wait_for_stop(interval) {
            break;
        }
        let target = lock_or_recover(&shared.target, "target").clone();
        if let Some(target) = target {
            debug!(
                "Runner: Scheduled re-analysis of {} {}",
                target.symbol, target.timeframe
            );
            shared.submit(AnalysisTask::full(
                target.range,
                &target.symbol,
                target.timeframe,
            ));
        }
    }
    debug!("Runner: Scheduler exited");
}

fn run_task(
    shared: &Shared,
    task: AnalysisTask,
    cache: &mut Vec<Candle>,
) -> Result<Arc<AnalysisResult>> {
    match task.kind {
        TaskKind::FullAnalyze => {
            debug!("Runner: Full analysis of {} {}", task.symbol, task.timeframe);
            shared.analyzer.analyze(task.range, &task.symbol, task.timeframe)
        }
        TaskKind::IncrementalUpdate => run_incremental(shared, task, cache),
        TaskKind::Stop => unreachable!("stop sentinel is handled by the worker loop"),
    }
}

/// Serve an incremental update from the worker's candle cache, falling
/// back to a full analysis whenever the cache cannot cover the window.
fn run_incremental(
    shared: &Shared,
    task: AnalysisTask,
    cache: &mut Vec<Candle>,
) -> Result<Arc<AnalysisResult>> {
    if cache.is_empty() {
        debug!(
            "Runner: No cached candles for {}, falling back to full analysis",
            task.symbol
        );
        return shared.analyzer.analyze(task.range, &task.symbol, task.timeframe);
    }
    append_new_candles(cache, &task.new_candles);

    let required_start = task.range.from_ts - WARMUP_SECS;
    let earliest = cache.first().map_or(i64::MAX, |c| c.timestamp);
    let latest = cache.last().map_or(i64::MIN, |c| c.timestamp);
    if earliest > required_start || latest < task.range.to_ts - STALE_AFTER_SECS {
        debug!(
            "Runner: Cache span {}..{} cannot serve {}..{}, falling back to full analysis",
            earliest, latest, required_start, task.range.to_ts
        );
        return shared.analyzer.analyze(task.range, &task.symbol, task.timeframe);
    }

    let start_idx = cache
        .iter()
        .position(|c| c.timestamp >= required_start)
        .unwrap_or(0);
    let window = cache[start_idx..].to_vec();
    shared
        .analyzer
        .analyze_with_candles(task.range, &task.symbol, task.timeframe, window)
}

/// Append candles strictly newer than the cache tail, dropping the
/// oldest bars once the cache exceeds its cap.
fn append_new_candles(cache: &mut Vec<Candle>, new_candles: &[Candle]) {
    let mut newest = cache.last().map_or(i64::MIN, |c| c.timestamp);
    let mut appended = 0usize;
    for candle in new_candles {
        if candle.timestamp > newest {
            cache.push(*candle);
            newest = candle.timestamp;
            appended += 1;
        }
    }
    if cache.len() > MAX_CACHED_CANDLES {
        let excess = cache.len() - MAX_CACHED_CANDLES;
        cache.drain(0..excess);
    }
    if appended > 0 {
        debug!("Runner: Appended {} candles ({} cached)", appended, cache.len());
    }
}

/// Update runner state from a completed analysis, then publish events.
/// The `Result` event goes out last, after all state is in place.
fn finish_task(
    shared: &Shared,
    kind: TaskKind,
    result: &Arc<AnalysisResult>,
    cache: &mut Vec<Candle>,
) {
    match kind {
        // Full analyses resync the cache wholesale; incremental ones
        // only backfill an empty cache.
        TaskKind::FullAnalyze => *cache = result.candles.clone(),
        TaskKind::IncrementalUpdate => {
            if cache.is_empty() {
                *cache = result.candles.clone();
            }
        }
        TaskKind::Stop => {}
    }

    let previous = {
        let mut last = lock_or_recover(&shared.last_result, "last result");
        last.replace(Arc::clone(result))
    };
    {
        let mut target = lock_or_recover(&shared.target, "target");
        *target = Some(AnalysisTarget {
            symbol: result.symbol.clone(),
            range: result.range,
            timeframe: result.timeframe,
        });
    }

    if let Some(previous) = &previous {
        let from = previous.regime.regime;
        let to = result.regime.regime;
        if from != to {
            info!("Runner: Regime change {} -> {}", from, to);
            shared.events.publish(RunnerEvent::RegimeChange { from, to });
        }
    }

    if kind == TaskKind::IncrementalUpdate {
        if let Some(previous) = &previous {
            let known: HashSet<i64> = previous.entries.iter().map(|e| e.timestamp).collect();
            for entry in result.entries.iter().filter(|e| !known.contains(&e.timestamp)) {
                info!(
                    "Runner: New {} entry at {} ({:.5})",
                    entry.side, entry.timestamp, entry.price
                );
                shared.events.publish(RunnerEvent::NewEntry(entry.clone()));
            }
        }
    }

    shared.events.publish(RunnerEvent::Result(Arc::clone(result)));
}

fn record_timing(shared: &Shared, started: Instant) {
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    let mut metrics = lock_or_recover(&shared.metrics, "metrics");
    metrics.record_analysis(elapsed_ms);
    if let Some(stats) = shared.analyzer.cache_stats() {
        metrics.cache_hit_rate = stats.hit_rate;
    }
    let interval = shared.config.performance_log_interval.max(1);
    if metrics.total_analyses % interval == 0 {
        info!(
            "Runner: {} analyses, avg {:.0}ms, max {:.0}ms, cache hit rate {:.0}%, {} queue overflows",
            metrics.total_analyses,
            metrics.avg_time_ms,
            metrics.max_time_ms,
            metrics.cache_hit_rate * 100.0,
            metrics.queue_overflows
        );
    }
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("Runner: {} lock poisoned, recovering", what);
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use crate::application::trading::trade_filter::FilterStats;
    use crate::domain::market::regime::{MarketRegime, RegimeSnapshot};
    use crate::domain::trading::types::{EntryEvent, Side};

    struct ScriptedAnalyzer {
        full_calls: AtomicUsize,
        incremental_calls: AtomicUsize,
        last_symbol: Mutex<Option<String>>,
        last_candles: Mutex<Option<Vec<Candle>>>,
        delay: Duration,
        regimes: Mutex<VecDeque<MarketRegime>>,
        entry_batches: Mutex<VecDeque<Vec<EntryEvent>>>,
    }

    impl ScriptedAnalyzer {
        fn new() -> Self {
            Self {
                full_calls: AtomicUsize::new(0),
                incremental_calls: AtomicUsize::new(0),
                last_symbol: Mutex::new(None),
                last_candles: Mutex::new(None),
                delay: Duration::ZERO,
                regimes: Mutex::new(VecDeque::new()),
                entry_batches: Mutex::new(VecDeque::new()),
            }
        }

        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new()
            }
        }

        fn script_regimes(&self, regimes: &[MarketRegime]) {
            *self.regimes.lock().unwrap() = regimes.iter().copied().collect();
        }

        fn script_entries(&self, batches: Vec<Vec<EntryEvent>>) {
            *self.entry_batches.lock().unwrap() = batches.into();
        }

        fn full_calls(&self) -> usize {
            self.full_calls.load(Ordering::SeqCst)
        }

        fn incremental_calls(&self) -> usize {
            self.incremental_calls.load(Ordering::SeqCst)
        }

        fn result_for(
            &self,
            range: VisibleRange,
            symbol: &str,
            timeframe: Timeframe,
            candles: Vec<Candle>,
        ) -> Arc<AnalysisResult> {
            let regime = self
                .regimes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(MarketRegime::Ranging);
            let entries = self
                .entry_batches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            Arc::new(AnalysisResult {
                symbol: symbol.to_string(),
                timeframe,
                range,
                regime: RegimeSnapshot::new(regime, 1.0, 0.0, 0.0),
                entries,
                candles,
                best_set: None,
                validation: None,
                filter_stats: FilterStats::default(),
                elapsed_ms: 1.0,
            })
        }
    }

    impl ChartAnalyzer for ScriptedAnalyzer {
        fn analyze(
            &self,
            range: VisibleRange,
            symbol: &str,
            timeframe: Timeframe,
        ) -> Result<Arc<AnalysisResult>> {
            self.full_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_symbol.lock().unwrap() = Some(symbol.to_string());
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            let candles = minute_candles(range.from_ts - WARMUP_SECS, range.to_ts);
            Ok(self.result_for(range, symbol, timeframe, candles))
        }

        fn analyze_with_candles(
            &self,
            range: VisibleRange,
            symbol: &str,
            timeframe: Timeframe,
            candles: Vec<Candle>,
        ) -> Result<Arc<AnalysisResult>> {
            self.incremental_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_candles.lock().unwrap() = Some(candles.clone());
            Ok(self.result_for(range, symbol, timeframe, candles))
        }
    }

    fn minute_candles(from_ts: i64, to_ts: i64) -> Vec<Candle> {
        (from_ts..=to_ts)
            .step_by(60)
            .map(|ts| Candle::new(ts, 100.0, 101.0, 99.0, 100.0, 1000.0))
            .collect()
    }

    fn quiet_config() -> RunnerConfig {
        RunnerConfig {
            reanalyze_interval_sec: 0.0,
            ..RunnerConfig::default()
        }
    }

    fn wait_until(limit_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(limit_ms);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    fn range(from_ts: i64, to_ts: i64) -> VisibleRange {
        VisibleRange::new(from_ts, to_ts)
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let analyzer = Arc::new(ScriptedAnalyzer::new());
        let runner = BackgroundRunner::new(analyzer, quiet_config());
        assert!(!runner.is_running());

        runner.start();
        assert!(runner.is_running());
        runner.start();
        assert!(runner.is_running());

        runner.stop();
        assert!(!runner.is_running());
        runner.stop();
    }

    #[test]
    fn test_auto_start_spawns_worker() {
        let analyzer = Arc::new(ScriptedAnalyzer::new());
        let config = RunnerConfig {
            auto_start: true,
            ..quiet_config()
        };
        let runner = BackgroundRunner::new(analyzer, config);
        assert!(runner.is_running());
        runner.stop();
    }

    #[test]
    fn test_requests_rejected_when_stopped() {
        let analyzer = Arc::new(ScriptedAnalyzer::new());
        let runner = BackgroundRunner::new(analyzer, quiet_config());

        assert!(!runner.request_analysis(range(0, 600), "EURUSD", Timeframe::OneMin, true));
        assert!(!runner.push_new_candles(Vec::new(), range(0, 600), "EURUSD", Timeframe::OneMin));
    }

    #[test]
    fn test_forced_request_produces_result_event() {
        let analyzer = Arc::new(ScriptedAnalyzer::new());
        let runner = BackgroundRunner::new(analyzer.clone(), quiet_config());
        runner.start();
        let events = runner.subscribe();

        assert!(runner.request_analysis(range(10_000, 10_600), "EURUSD", Timeframe::OneMin, true));
        assert!(wait_until(2_000, || analyzer.full_calls() == 1));

        let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
        match event {
            RunnerEvent::Result(result) => assert_eq!(result.symbol, "EURUSD"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(runner.last_result().unwrap().symbol, "EURUSD");
        runner.stop();
    }

    #[test]
    fn test_debounced_requests_collapse_to_latest() {
        let analyzer = Arc::new(ScriptedAnalyzer::new());
        let runner = BackgroundRunner::new(analyzer.clone(), quiet_config());
        runner.start();

        assert!(runner.request_analysis(range(0, 600), "FIRST", Timeframe::OneMin, false));
        thread::sleep(Duration::from_millis(100));
        assert!(runner.request_analysis(range(0, 600), "SECOND", Timeframe::OneMin, false));

        assert!(wait_until(3_000, || analyzer.full_calls() >= 1));
        thread::sleep(Duration::from_millis(700));

        assert_eq!(analyzer.full_calls(), 1);
        assert_eq!(
            analyzer.last_symbol.lock().unwrap().as_deref(),
            Some("SECOND")
        );
        runner.stop();
    }

    #[test]
    fn test_queue_overflow_counts_and_returns_false() {
        let analyzer = Arc::new(ScriptedAnalyzer::with_delay(Duration::from_millis(400)));
        let config = RunnerConfig {
            max_queue_size: 1,
            ..quiet_config()
        };
        let runner = BackgroundRunner::new(analyzer.clone(), config);
        runner.start();

        assert!(runner.request_analysis(range(0, 600), "BUSY", Timeframe::OneMin, true));
        assert!(wait_until(1_000, || analyzer.full_calls() == 1));

        assert!(runner.request_analysis(range(0, 600), "QUEUED", Timeframe::OneMin, true));
        assert!(!runner.request_analysis(range(0, 600), "DROPPED", Timeframe::OneMin, true));
        assert_eq!(runner.metrics().queue_overflows, 1);
        runner.stop();
    }

    #[test]
    fn test_incremental_without_cache_falls_back_to_full() {
        let analyzer = Arc::new(ScriptedAnalyzer::new());
        let runner = BackgroundRunner::new(analyzer.clone(), quiet_config());
        runner.start();

        let fresh = minute_candles(10_540, 10_600);
        assert!(runner.push_new_candles(fresh, range(10_000, 10_600), "EURUSD", Timeframe::OneMin));

        assert!(wait_until(2_000, || analyzer.full_calls() == 1));
        assert_eq!(analyzer.incremental_calls(), 0);
        runner.stop();
    }

    #[test]
    fn test_incremental_with_cache_slices_warmup_window() {
        let analyzer = Arc::new(ScriptedAnalyzer::new());
        let runner = BackgroundRunner::new(analyzer.clone(), quiet_config());
        runner.start();

        assert!(runner.request_analysis(range(10_000, 10_600), "EURUSD", Timeframe::OneMin, true));
        assert!(wait_until(2_000, || runner.last_result().is_some()));

        let fresh = minute_candles(10_660, 10_660);
        assert!(runner.push_new_candles(fresh, range(10_060, 10_660), "EURUSD", Timeframe::OneMin));
        assert!(wait_until(2_000, || analyzer.incremental_calls() == 1));

        let captured = analyzer.last_candles.lock().unwrap().clone().unwrap();
        assert_eq!(captured.first().unwrap().timestamp, 4_060);
        assert_eq!(captured.last().unwrap().timestamp, 10_660);
        assert_eq!(analyzer.full_calls(), 1);
        runner.stop();
    }

    #[test]
    fn test_regime_change_and_new_entry_event_order() {
        let analyzer = Arc::new(ScriptedAnalyzer::new());
        analyzer.script_regimes(&[MarketRegime::Ranging, MarketRegime::TrendingUp]);
        analyzer.script_entries(vec![
            vec![EntryEvent::new(10_300, Side::Long, 100.0, "rsi")],
            vec![
                EntryEvent::new(10_300, Side::Long, 100.0, "rsi"),
                EntryEvent::new(10_360, Side::Long, 100.5, "rsi"),
            ],
        ]);
        let runner = BackgroundRunner::new(analyzer.clone(), quiet_config());
        runner.start();
        let events = runner.subscribe();

        assert!(runner.request_analysis(range(10_000, 10_600), "EURUSD", Timeframe::OneMin, true));
        assert!(wait_until(2_000, || runner.last_result().is_some()));
        assert!(runner.push_new_candles(
            minute_candles(10_660, 10_660),
            range(10_060, 10_660),
            "EURUSD",
            Timeframe::OneMin,
        ));
        assert!(wait_until(2_000, || analyzer.incremental_calls() == 1));

        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(events.recv_timeout(Duration::from_secs(2)).unwrap());
        }
        assert!(matches!(received[0], RunnerEvent::Result(_)));
        match &received[1] {
            RunnerEvent::RegimeChange { from, to } => {
                assert_eq!(*from, MarketRegime::Ranging);
                assert_eq!(*to, MarketRegime::TrendingUp);
            }
            other => panic!("expected regime change, got {:?}", other),
        }
        match &received[2] {
            RunnerEvent::NewEntry(entry) => assert_eq!(entry.timestamp, 10_360),
            other => panic!("expected new entry, got {:?}", other),
        }
        assert!(matches!(received[3], RunnerEvent::Result(_)));
        runner.stop();
    }

    #[test]
    fn test_scheduler_reissues_current_target() {
        let analyzer = Arc::new(ScriptedAnalyzer::new());
        let config = RunnerConfig {
            reanalyze_interval_sec: 0.15,
            ..RunnerConfig::default()
        };
        let runner = BackgroundRunner::new(analyzer.clone(), config);
        runner.start();

        assert!(runner.request_analysis(range(10_000, 10_600), "EURUSD", Timeframe::OneMin, true));
        assert!(wait_until(2_000, || analyzer.full_calls() >= 1));
        assert!(wait_until(3_000, || analyzer.full_calls() >= 3));
        runner.stop();
    }

    #[test]
    fn test_task_error_emits_error_event_and_worker_survives() {
        struct FailingAnalyzer {
            calls: AtomicUsize,
        }

        impl ChartAnalyzer for FailingAnalyzer {
            fn analyze(
                &self,
                _range: VisibleRange,
                _symbol: &str,
                _timeframe: Timeframe,
            ) -> Result<Arc<AnalysisResult>> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("no candles available")
            }

            fn analyze_with_candles(
                &self,
                _range: VisibleRange,
                _symbol: &str,
                _timeframe: Timeframe,
                _candles: Vec<Candle>,
            ) -> Result<Arc<AnalysisResult>> {
                anyhow::bail!("no candles available")
            }
        }

        let analyzer = Arc::new(FailingAnalyzer {
            calls: AtomicUsize::new(0),
        });
        let runner = BackgroundRunner::new(analyzer.clone(), quiet_config());
        runner.start();
        let events = runner.subscribe();

        assert!(runner.request_analysis(range(0, 600), "EURUSD", Timeframe::OneMin, true));
        match events.recv_timeout(Duration::from_secs(2)).unwrap() {
            RunnerEvent::Error(message) => assert!(message.contains("no candles")),
            other => panic!("expected error event, got {:?}", other),
        }

        assert!(runner.request_analysis(range(0, 600), "EURUSD", Timeframe::OneMin, true));
        assert!(wait_until(2_000, || analyzer.calls.load(Ordering::SeqCst) == 2));
        assert!(runner.is_running());
        runner.stop();
    }
}
