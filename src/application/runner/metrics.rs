use serde::Serialize;

/// Process-lifetime counters for the background runner.
///
/// Analysis timings are recorded by the worker after each completed
/// task; `queue_overflows` is bumped by whichever thread had its
/// submission rejected. `stop()` and `reset()` on the runner leave
/// these untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceMetrics {
    pub total_analyses: u64,
    pub total_time_ms: f64,
    /// Running mean over all analyses, not a windowed average.
    pub avg_time_ms: f64,
    pub max_time_ms: f64,
    /// Hit rate of the analyzer result cache at the last completed task.
    pub cache_hit_rate: f64,
    pub queue_overflows: u64,
}

impl PerformanceMetrics {
    pub fn record_analysis(&mut self, elapsed_ms: f64) {
        self.total_analyses += 1;
        self.total_time_ms += elapsed_ms;
        self.avg_time_ms = self.total_time_ms / self.total_analyses as f64;
        if elapsed_ms > self.max_time_ms {
            self.max_time_ms = elapsed_ms;
        }
    }
}
