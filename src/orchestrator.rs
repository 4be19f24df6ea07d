//! Batch orchestrator
//!
//! Splits the target list into batches, probes each batch on a bounded
//! worker pool with pacing between targets, retries rate-limited targets
//! with exponential backoff and writes every finished batch to the sink.
//! Results are inserted by the dispatching loop only, one final entry per
//! target.

use anyhow::Context;
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::constants::BATCH_SIZE;
use crate::error::ProbeError;
use crate::model::{ProbeResult, ResultSet, RunId};
use crate::pacing::{cancelled, is_cancelled, Pacer, Sleeper, TokioSleeper};
use crate::pipeline::TargetProber;
use crate::sink::ResultSink;
use crate::target::Target;

/// Retry schedule for rate-limited targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total probe attempts per target, including the first
    pub max_attempts: u32,
    /// Backoff after attempt `n` is `backoff_base^n` seconds
    pub backoff_base: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 6, backoff_base: 5 }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.backoff_base.saturating_pow(attempt))
    }
}

/// Probe `target`, retrying only on HTTP 429. After the last attempt, or
/// when cancellation interrupts a backoff, the last observed result is
/// accepted as final.
pub async fn probe_with_retry(
    prober: &dyn TargetProber,
    target: &Target,
    retry: &RetryPolicy,
    sleeper: &dyn Sleeper,
    cancel: &watch::Receiver<bool>,
) -> ProbeResult {
    let mut attempt = 1;
    loop {
        match prober.probe(target).await {
            Ok(result) => return result,
            Err(ProbeError::RateLimited { last }) => {
                if attempt >= retry.max_attempts {
                    warn!(site = %target, attempt, "Still rate limited, accepting last result");
                    return *last;
                }

                let delay = retry.backoff(attempt);
                warn!(site = %target, attempt, backoff_secs = delay.as_secs(), "Rate limited, backing off");
                let interrupted = tokio::select! {
                    _ = sleeper.sleep(delay) => is_cancelled(cancel),
                    _ = cancelled(cancel.clone()) => true,
                };
                if interrupted {
                    return *last;
                }
                attempt += 1;
            }
            Err(err) => {
                warn!(site = %target, %err, "Probe failed without a result");
                return ProbeResult::partial(target.as_str(), err.to_string());
            }
        }
    }
}

/// Outcome of a probing run.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    /// Batches written
    pub batches: usize,
    /// Targets with a final result
    pub targets: usize,
    /// Files produced by the sink, in batch order
    pub files: Vec<PathBuf>,
    /// Whether the run stopped early on request
    pub cancelled: bool,
    /// Index of the first batch not fully probed, for resuming
    pub next_batch: usize,
}

pub struct Orchestrator {
    prober: Arc<dyn TargetProber>,
    pacer: Pacer,
    sleeper: Arc<dyn Sleeper>,
    retry: RetryPolicy,
    workers: usize,
    batch_size: usize,
    label: String,
}

impl Orchestrator {
    pub fn new(prober: Arc<dyn TargetProber>, label: impl Into<String>) -> Self {
        Self {
            prober,
            pacer: Pacer::default(),
            sleeper: Arc::new(TokioSleeper),
            retry: RetryPolicy::default(),
            workers: 1,
            batch_size: BATCH_SIZE,
            label: label.into(),
        }
    }

    /// Build from the `orchestrator` configuration section.
    pub fn from_config(
        prober: Arc<dyn TargetProber>,
        label: impl Into<String>,
        config: &OrchestratorConfig,
    ) -> anyhow::Result<Self> {
        let mut pacer = Pacer::new(config.pacing_min_ms, config.pacing_max_ms)?;
        if let Some(limit) = config.targets_per_minute.and_then(NonZeroU32::new) {
            pacer = pacer.with_rate_limit(limit);
        }

        Ok(Self::new(prober, label)
            .with_pacer(pacer)
            .with_retry(RetryPolicy {
                max_attempts: config.max_attempts,
                backoff_base: config.backoff_base,
            })
            .with_workers(config.workers)
            .with_batch_size(config.batch_size))
    }

    pub fn with_pacer(mut self, pacer: Pacer) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Probe all targets batch by batch, skipping the first `resume_batches`
    /// batches. A batch interrupted by cancellation is still written with
    /// the targets that finished.
    pub async fn run(
        &self,
        targets: &[Target],
        resume_batches: usize,
        sink: &dyn ResultSink,
        cancel: watch::Receiver<bool>,
    ) -> anyhow::Result<RunSummary> {
        let mut summary = RunSummary { next_batch: resume_batches, ..RunSummary::default() };
        let total_batches = targets.len().div_ceil(self.batch_size);
        if resume_batches > 0 {
            info!(resume_batches, total_batches, "Resuming run");
        }

        let mut first = true;
        for (index, batch) in targets.chunks(self.batch_size).enumerate().skip(resume_batches) {
            if is_cancelled(&cancel) {
                summary.cancelled = true;
                break;
            }

            info!(batch = index, total_batches, targets = batch.len(), "Starting batch");
            let set = self.run_batch(index, batch, !first, &cancel).await;
            first = false;
            let distinct: HashSet<&str> = batch.iter().map(Target::as_str).collect();
            if set.len() == distinct.len() && !is_cancelled(&cancel) {
                summary.next_batch = index + 1;
            }

            if !set.is_empty() {
                let path = sink
                    .write(&set)
                    .await
                    .with_context(|| format!("Failed to write batch {}", index))?;
                summary.batches += 1;
                summary.targets += set.len();
                summary.files.push(path);
            }

            if is_cancelled(&cancel) {
                summary.cancelled = true;
                break;
            }
        }

        if summary.cancelled {
            warn!(batches = summary.batches, targets = summary.targets, "Run cancelled");
        } else {
            info!(batches = summary.batches, targets = summary.targets, "Run complete");
        }
        Ok(summary)
    }

    /// Probe one batch. Every target that was dispatched ends up with
    /// exactly one entry.
    pub async fn run_batch(
        &self,
        index: usize,
        targets: &[Target],
        pace_first: bool,
        cancel: &watch::Receiver<bool>,
    ) -> ResultSet {
        let mut set = ResultSet::new(RunId::new(&self.label, index));
        let mut running: JoinSet<(Target, ProbeResult)> = JoinSet::new();
        let mut dispatched = Vec::with_capacity(targets.len());

        for (position, target) in targets.iter().enumerate() {
            while running.len() >= self.workers {
                if let Some(joined) = running.join_next().await {
                    collect(&mut set, joined);
                }
            }

            if is_cancelled(cancel) {
                info!(batch = index, "Cancellation requested, no further targets dispatched");
                break;
            }
            if (pace_first || position > 0) && !self.pacer.pace(self.sleeper.as_ref(), cancel).await {
                info!(batch = index, "Cancellation requested while pacing");
                break;
            }

            debug!(batch = index, site = %target, "Dispatching target");
            dispatched.push(target.clone());

            let prober = self.prober.clone();
            let sleeper = self.sleeper.clone();
            let retry = self.retry;
            let cancel = cancel.clone();
            let target = target.clone();
            running.spawn(async move {
                let result =
                    probe_with_retry(prober.as_ref(), &target, &retry, sleeper.as_ref(), &cancel).await;
                (target, result)
            });
        }

        while let Some(joined) = running.join_next().await {
            collect(&mut set, joined);
        }

        // A worker that died takes its target name with it
        let mut seen = HashSet::new();
        for target in dispatched {
            if seen.insert(target.as_str().to_string()) && !set.contains(target.as_str()) {
                set.insert(
                    target.as_str(),
                    ProbeResult::partial(target.as_str(), "probe worker terminated"),
                );
            }
        }
        set
    }
}

fn collect(set: &mut ResultSet, joined: Result<(Target, ProbeResult), JoinError>) {
    match joined {
        Ok((target, result)) => set.insert(target.as_str(), result),
        Err(err) => warn!(%err, "Probe worker terminated"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Duration>>);

    #[async_trait]
    impl Sleeper for Recorder {
        async fn sleep(&self, duration: Duration) {
            self.0.lock().unwrap().push(duration);
        }
    }

    #[derive(Default)]
    struct MemorySink(Mutex<Vec<ResultSet>>);

    #[async_trait]
    impl ResultSink for MemorySink {
        async fn write(&self, set: &ResultSet) -> anyhow::Result<PathBuf> {
            self.0.lock().unwrap().push(set.clone());
            Ok(PathBuf::from(set.run.file_name()))
        }
    }

    fn limited(target: &Target) -> ProbeError {
        let mut last = ProbeResult::unavailable(target.as_str());
        last.http.status = crate::model::ProbeValue::Integer(429);
        ProbeError::RateLimited { last: Box::new(last) }
    }

    /// Answers 429 for the first `limited_calls` calls, then succeeds.
    struct Flaky {
        limited_calls: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TargetProber for Flaky {
        async fn probe(&self, target: &Target) -> Result<ProbeResult, ProbeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.limited_calls {
                Err(limited(target))
            } else {
                Ok(ProbeResult::unavailable(target.as_str()))
            }
        }
    }

    struct Broken(AtomicUsize);

    #[async_trait]
    impl TargetProber for Broken {
        async fn probe(&self, _target: &Target) -> Result<ProbeResult, ProbeError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(ProbeError::Connection("refused".to_string()))
        }
    }

    /// Records the order targets arrive in and the peak concurrency.
    #[derive(Default)]
    struct Tracking {
        seen: Mutex<Vec<String>>,
        active: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
        cancel_after: Option<(usize, watch::Sender<bool>)>,
    }

    #[async_trait]
    impl TargetProber for Tracking {
        async fn probe(&self, target: &Target) -> Result<ProbeResult, ProbeError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            let count = {
                let mut seen = self.seen.lock().unwrap();
                seen.push(target.as_str().to_string());
                seen.len()
            };
            if let Some((limit, tx)) = &self.cancel_after {
                if count >= *limit {
                    let _ = tx.send(true);
                }
            }
            Ok(ProbeResult::unavailable(target.as_str()))
        }
    }

    fn targets(n: usize) -> Vec<Target> {
        (0..n).map(|i| Target::new(format!("site{}.example", i))).collect()
    }

    #[test]
    fn test_backoff_schedule() {
        let retry = RetryPolicy::default();
        let schedule: Vec<u64> = (1..retry.max_attempts).map(|n| retry.backoff(n).as_secs()).collect();
        assert_eq!(schedule, vec![5, 25, 125, 625, 3125]);
    }

    #[tokio::test]
    async fn test_persistent_429_makes_six_attempts() {
        let (_tx, rx) = watch::channel(false);
        let prober = Flaky { limited_calls: usize::MAX, calls: AtomicUsize::new(0) };
        let recorder = Recorder::default();
        let target = Target::new("example.com");

        let result = probe_with_retry(&prober, &target, &RetryPolicy::default(), &recorder, &rx).await;

        assert_eq!(prober.calls.load(Ordering::SeqCst), 6);
        let sleeps: Vec<u64> = recorder.0.lock().unwrap().iter().map(|d| d.as_secs()).collect();
        assert_eq!(sleeps, vec![5, 25, 125, 625, 3125]);
        assert_eq!(result.http.status_code(), Some(429));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_429() {
        let (_tx, rx) = watch::channel(false);
        let prober = Flaky { limited_calls: 2, calls: AtomicUsize::new(0) };
        let recorder = Recorder::default();

        let result =
            probe_with_retry(&prober, &Target::new("a.example"), &RetryPolicy::default(), &recorder, &rx).await;

        assert_eq!(prober.calls.load(Ordering::SeqCst), 3);
        assert_eq!(recorder.0.lock().unwrap().len(), 2);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_other_failures_are_not_retried() {
        let (_tx, rx) = watch::channel(false);
        let prober = Broken(AtomicUsize::new(0));
        let recorder = Recorder::default();

        let result =
            probe_with_retry(&prober, &Target::new("a.example"), &RetryPolicy::default(), &recorder, &rx).await;

        assert_eq!(prober.0.load(Ordering::SeqCst), 1);
        assert!(recorder.0.lock().unwrap().is_empty());
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_accepts_last_result() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let prober = Flaky { limited_calls: usize::MAX, calls: AtomicUsize::new(0) };

        let result =
            probe_with_retry(&prober, &Target::new("a.example"), &RetryPolicy::default(), &TokioSleeper, &rx)
                .await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.http.status_code(), Some(429));
    }

    #[tokio::test]
    async fn test_batches_of_ten_with_one_entry_per_target() {
        let (_tx, rx) = watch::channel(false);
        let prober = Arc::new(Flaky { limited_calls: 3, calls: AtomicUsize::new(0) });
        let recorder = Arc::new(Recorder::default());
        let orchestrator = Orchestrator::new(prober, "cz")
            .with_pacer(Pacer::disabled())
            .with_sleeper(recorder);
        let sink = MemorySink::default();

        let summary = orchestrator.run(&targets(25), 0, &sink, rx).await.unwrap();

        assert_eq!(summary.batches, 3);
        assert_eq!(summary.targets, 25);
        assert!(!summary.cancelled);
        let written = sink.0.lock().unwrap();
        let sizes: Vec<usize> = written.iter().map(ResultSet::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        let indices: Vec<usize> = written.iter().map(|set| set.run.batch).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(written[0].get("site0.example").is_some());
    }

    #[tokio::test]
    async fn test_resume_skips_whole_batches() {
        let (_tx, rx) = watch::channel(false);
        let prober = Arc::new(Tracking::default());
        let orchestrator = Orchestrator::new(prober.clone(), "cz").with_pacer(Pacer::disabled());
        let sink = MemorySink::default();

        let summary = orchestrator.run(&targets(25), 2, &sink, rx).await.unwrap();

        assert_eq!(summary.batches, 1);
        assert_eq!(summary.next_batch, 3);
        let seen = prober.seen.lock().unwrap();
        assert_eq!(seen.first().map(String::as_str), Some("site20.example"));
        assert_eq!(seen.len(), 5);
        assert_eq!(sink.0.lock().unwrap()[0].run.batch, 2);
    }

    #[tokio::test]
    async fn test_pacing_skips_first_target_of_run() {
        let (_tx, rx) = watch::channel(false);
        let recorder = Arc::new(Recorder::default());
        let orchestrator = Orchestrator::new(Arc::new(Tracking::default()), "cz")
            .with_pacer(Pacer::new(7, 7).unwrap())
            .with_sleeper(recorder.clone());

        orchestrator.run(&targets(12), 0, &MemorySink::default(), rx).await.unwrap();

        let sleeps = recorder.0.lock().unwrap();
        assert_eq!(sleeps.len(), 11);
        assert!(sleeps.iter().all(|d| *d == Duration::from_millis(7)));
    }

    #[tokio::test]
    async fn test_cancel_stops_new_probes_and_writes_partial_batch() {
        let (tx, rx) = watch::channel(false);
        let prober = Arc::new(Tracking { cancel_after: Some((3, tx)), ..Tracking::default() });
        let orchestrator = Orchestrator::new(prober.clone(), "cz").with_pacer(Pacer::disabled());
        let sink = MemorySink::default();

        let summary = orchestrator.run(&targets(25), 0, &sink, rx).await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.next_batch, 0);
        assert_eq!(prober.seen.lock().unwrap().len(), 3);
        let written = sink.0.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].len(), 3);
    }

    #[tokio::test]
    async fn test_worker_pool_is_bounded() {
        let (_tx, rx) = watch::channel(false);
        let prober = Arc::new(Tracking { delay: Duration::from_millis(20), ..Tracking::default() });
        let orchestrator = Orchestrator::new(prober.clone(), "cz")
            .with_pacer(Pacer::disabled())
            .with_workers(4);
        let sink = MemorySink::default();

        let summary = orchestrator.run(&targets(10), 0, &sink, rx).await.unwrap();

        assert_eq!(summary.targets, 10);
        let peak = prober.peak.load(Ordering::SeqCst);
        assert!(peak > 1 && peak <= 4, "peak concurrency {}", peak);
    }

    #[tokio::test]
    async fn test_duplicate_targets_collapse_to_one_entry() {
        let (_tx, rx) = watch::channel(false);
        let orchestrator = Orchestrator::new(Arc::new(Tracking::default()), "cz").with_pacer(Pacer::disabled());
        let list = vec![Target::new("a.example"), Target::new("a.example"), Target::new("b.example")];

        let set = orchestrator.run_batch(0, &list, false, &rx).await;
        assert_eq!(set.len(), 2);

        let sink = MemorySink::default();
        let summary = orchestrator.run(&list, 0, &sink, rx).await.unwrap();
        assert_eq!(summary.next_batch, 1);
        assert!(!summary.cancelled);
    }
}
