use crate::error::AsynchyResult;
use prometheus::{Counter, Encoder, Histogram, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub jobs_total: IntCounter,
    pub jobs_active: IntGauge,
    pub jobs_completed: IntCounter,
    pub jobs_failed: IntCounter,
    pub jobs_cancelled: IntCounter,
    pub bytes_transferred_total: Counter,
    pub job_duration: Histogram,
}

impl Metrics {
    pub fn new() -> AsynchyResult<Self> {
        let registry = Arc::new(Registry::new());

        let jobs_total = IntCounter::new("asynchy_jobs_total", "Total number of transfer jobs submitted")?;
        let jobs_active = IntGauge::new("asynchy_jobs_active", "Number of currently running transfer jobs")?;
        let jobs_completed = IntCounter::new("asynchy_jobs_completed_total", "Total number of successful transfer jobs")?;
        let jobs_failed = IntCounter::new("asynchy_jobs_failed_total", "Total number of failed transfer jobs")?;
        let jobs_cancelled = IntCounter::new("asynchy_jobs_cancelled_total", "Total number of cancelled transfer jobs")?;
        let bytes_transferred_total = Counter::new("asynchy_bytes_transferred_total", "Total bytes reported by transfer workers")?;
        let job_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new("asynchy_job_duration_seconds", "Time taken by a single transfer job")
                .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 14400.0, 43200.0]),
        )?;

        registry.register(Box::new(jobs_total.clone()))?;
        registry.register(Box::new(jobs_active.clone()))?;
        registry.register(Box::new(jobs_completed.clone()))?;
        registry.register(Box::new(jobs_failed.clone()))?;
        registry.register(Box::new(jobs_cancelled.clone()))?;
        registry.register(Box::new(bytes_transferred_total.clone()))?;
        registry.register(Box::new(job_duration.clone()))?;

        Ok(Self {
            registry,
            jobs_total,
            jobs_active,
            jobs_completed,
            jobs_failed,
            jobs_cancelled,
            bytes_transferred_total,
            job_duration,
        })
    }

    pub fn export(&self) -> AsynchyResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::AsynchyError::Metrics(e.to_string()))
    }

    pub fn record_job_submitted(&self) {
        self.jobs_total.inc();
    }

    pub fn record_job_started(&self) {
        self.jobs_active.inc();
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.bytes_transferred_total.inc_by(bytes as f64);
    }

    pub fn record_job_completed(&self, duration_secs: f64) {
        self.jobs_completed.inc();
        self.jobs_active.dec();
        self.job_duration.observe(duration_secs);
    }

    pub fn record_job_failed(&self, duration_secs: f64) {
        self.jobs_failed.inc();
        self.jobs_active.dec();
        self.job_duration.observe(duration_secs);
    }

    /// Jobs cancelled while still waiting for a pool slot never became active.
    pub fn record_job_cancelled(&self, started: bool) {
        self.jobs_cancelled.inc();
        if started {
            self.jobs_active.dec();
        }
    }
}
