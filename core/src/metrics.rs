use std::sync::atomic::{AtomicU64, Ordering};

// Latency histogram with fixed upper bounds, in seconds.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>, // (upper_bound, count)
    overflow: AtomicU64,
    sum_micros: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        let bounds = vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];
        Self {
            buckets: bounds.into_iter().map(|b| (b, AtomicU64::new(0))).collect(),
            overflow: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    fn record(&self, value: f64) {
        self.sum_micros
            .fetch_add((value * 1_000_000.0) as u64, Ordering::Relaxed);
        for (bound, count) in &self.buckets {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.overflow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.buckets
            .iter()
            .map(|(_, c)| c.load(Ordering::Relaxed))
            .sum::<u64>()
            + self.overflow.load(Ordering::Relaxed)
    }

    fn to_prometheus(&self, name: &str) -> String {
        let mut output = format!("# HELP {}_seconds Duration histogram.\n", name);
        output.push_str(&format!("# TYPE {}_seconds histogram\n", name));
        let mut cumulative = 0;
        for (bound, count) in &self.buckets {
            cumulative += count.load(Ordering::Relaxed);
            output.push_str(&format!(
                "{}_seconds_bucket{{le=\"{}\"}} {}\n",
                name, bound, cumulative
            ));
        }
        let total = self.count();
        output.push_str(&format!("{}_seconds_bucket{{le=\"+Inf\"}} {}\n", name, total));
        output.push_str(&format!(
            "{}_seconds_sum {}\n",
            name,
            self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
        ));
        output.push_str(&format!("{}_seconds_count {}\n", name, total));
        output
    }
}

pub struct SystemMetrics {
    pub jobs_submitted: AtomicU64,
    pub jobs_rejected: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_cancelled: AtomicU64,
    pub chunks_processed: AtomicU64,
    pub rows_scanned: AtomicU64,
    pub rows_written: AtomicU64,
    pub previews_evaluated: AtomicU64,
    pub chunk_duration: Histogram,
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMetrics {
    pub fn new() -> Self {
        Self {
            jobs_submitted: AtomicU64::new(0),
            jobs_rejected: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_cancelled: AtomicU64::new(0),
            chunks_processed: AtomicU64::new(0),
            rows_scanned: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            previews_evaluated: AtomicU64::new(0),
            chunk_duration: Histogram::new(),
        }
    }

    pub fn record_chunk(&self, rows_scanned: u64, rows_written: u64, duration_secs: f64) {
        self.chunks_processed.fetch_add(1, Ordering::Relaxed);
        self.rows_scanned.fetch_add(rows_scanned, Ordering::Relaxed);
        self.rows_written.fetch_add(rows_written, Ordering::Relaxed);
        self.chunk_duration.record(duration_secs);
    }

    pub fn record_preview(&self) {
        self.previews_evaluated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            chunks_processed: self.chunks_processed.load(Ordering::Relaxed),
            rows_scanned: self.rows_scanned.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            previews_evaluated: self.previews_evaluated.load(Ordering::Relaxed),
        }
    }

    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let counters = [
            ("sieve_jobs_submitted_total", "Jobs accepted for execution.", s.jobs_submitted),
            ("sieve_jobs_rejected_total", "Submissions rejected at compile time.", s.jobs_rejected),
            ("sieve_jobs_completed_total", "Jobs that committed their output.", s.jobs_completed),
            ("sieve_jobs_failed_total", "Jobs that ended in failure.", s.jobs_failed),
            ("sieve_jobs_cancelled_total", "Jobs cancelled between chunks.", s.jobs_cancelled),
            ("sieve_chunks_processed_total", "Dataset chunks evaluated.", s.chunks_processed),
            ("sieve_rows_scanned_total", "Rows read by streaming execution.", s.rows_scanned),
            ("sieve_rows_written_total", "Rows written to job output.", s.rows_written),
            ("sieve_previews_evaluated_total", "Sample previews evaluated.", s.previews_evaluated),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            output.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        }
        output.push_str(&self.chunk_duration.to_prometheus("sieve_chunk_duration"));
        output
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_rejected: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub chunks_processed: u64,
    pub rows_scanned: u64,
    pub rows_written: u64,
    pub previews_evaluated: u64,
}

lazy_static::lazy_static! {
    pub static ref METRICS: SystemMetrics = SystemMetrics::new();
}
