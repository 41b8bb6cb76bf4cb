use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{
    allocate, group_negatives, AllocationPlan, CandidateOrder, Cents, GroupKey, MatchResult,
    MatchStatus, NegativeInvoice, NegativeOrder,
};
use crate::error::{reason, MatchError};
use crate::metrics::PerfCounters;
use crate::store::{BatchStatus, MatchStore};

pub(crate) const STREAMING_THRESHOLD_DEFAULT: usize = 10_000;
pub(crate) const WORKER_COUNT_DEFAULT: usize = 4;
pub(crate) const CANDIDATE_LIMIT_BASE_DEFAULT: i64 = 200;
pub(crate) const CANDIDATE_LIMIT_MAX_DEFAULT: i64 = 2_000;
pub(crate) const MAX_STALE_RETRIES_DEFAULT: u32 = 3;
pub(crate) const MAX_REFETCH_ROUNDS_DEFAULT: u32 = 2;
pub(crate) const FRAGMENT_THRESHOLD_CENTS_DEFAULT: Cents = 100;
pub(crate) const GROUP_TIMEOUT_SECS_DEFAULT: u64 = 30;

const FETCH_RETRY_MAX: u32 = 3;
const FETCH_RETRY_BASE_MS: u64 = 50;
const GROUP_SLOW_WARN_MS: u128 = 250;
const SLOW_WARN_COOLDOWN_MS: i64 = 1_000;
const STREAM_CHANNEL_CAP: usize = 1_024;

// Keep slow-group warnings from flooding the log when a whole batch is slow.
static SLOW_WARN_LAST_MS: Lazy<DashMap<&'static str, i64>> = Lazy::new(DashMap::new);

fn should_emit_slow_warn(label: &'static str) -> bool {
    let now = crate::now_epoch_ms();
    if let Some(mut last) = SLOW_WARN_LAST_MS.get_mut(label) {
        if now - *last < SLOW_WARN_COOLDOWN_MS {
            return false;
        }
        *last = now;
        true
    } else {
        SLOW_WARN_LAST_MS.insert(label, now);
        true
    }
}

/// Execution profile. `Standard` buffers per-negative results; `Streaming`
/// hands them to the caller as groups commit. Candidate materialization is
/// bounded by `worker_count x candidate_limit` either way, since each worker
/// holds at most one group's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    Standard,
    Streaming,
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub mode: ExecMode,
    /// Auto-switch to streaming at this input size.
    pub streaming_threshold: usize,
    pub worker_count: usize,
    /// Base candidate window per group; scaled by group demand up to
    /// `candidate_limit_max`.
    pub candidate_limit_per_group: i64,
    pub candidate_limit_max: i64,
    pub sort_strategy: NegativeOrder,
    pub candidate_order: CandidateOrder,
    pub max_stale_retries: u32,
    pub max_refetch_rounds: u32,
    /// Caller-supplied batch id; generated when absent.
    pub batch_id: Option<String>,
    /// Resume a previously failed run of the same batch id.
    pub resume: bool,
    pub fragment_threshold_cents: Cents,
    /// Soft deadline for one group's transactional scope.
    pub group_timeout: Duration,
    /// Whole-batch deadline; breach cancels the remainder.
    pub batch_deadline: Option<Duration>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            mode: ExecMode::Standard,
            streaming_threshold: STREAMING_THRESHOLD_DEFAULT,
            worker_count: WORKER_COUNT_DEFAULT,
            candidate_limit_per_group: CANDIDATE_LIMIT_BASE_DEFAULT,
            candidate_limit_max: CANDIDATE_LIMIT_MAX_DEFAULT,
            sort_strategy: NegativeOrder::AmountDesc,
            candidate_order: CandidateOrder::RemainingAsc,
            max_stale_retries: MAX_STALE_RETRIES_DEFAULT,
            max_refetch_rounds: MAX_REFETCH_ROUNDS_DEFAULT,
            batch_id: None,
            resume: false,
            fragment_threshold_cents: FRAGMENT_THRESHOLD_CENTS_DEFAULT,
            group_timeout: Duration::from_secs(GROUP_TIMEOUT_SECS_DEFAULT),
            batch_deadline: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch_id: String,
    pub status: BatchStatus,
    pub mode: ExecMode,
    /// Per-negative results. Empty when results were streamed.
    pub results: Vec<MatchResult>,
    pub success_count: u64,
    pub partial_count: u64,
    pub failed_count: u64,
    pub matched_amount_cents: Cents,
    pub fragment_created: u64,
    pub stale_retries: u64,
    pub execution_time_ms: u64,
}

/// Cooperative cancellation flag shared between the caller and the workers.
/// Groups already committing run to completion; pending groups are skipped.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A streaming run: results arrive on `results` as groups commit; `outcome`
/// resolves once the whole batch has finished.
pub struct StreamingBatch {
    pub results: mpsc::Receiver<MatchResult>,
    handle: JoinHandle<Result<BatchOutcome, MatchError>>,
}

impl StreamingBatch {
    pub async fn recv(&mut self) -> Option<MatchResult> {
        self.results.recv().await
    }

    pub async fn outcome(self) -> Result<BatchOutcome, MatchError> {
        drop(self.results);
        self.handle
            .await
            .map_err(|e| MatchError::Internal(format!("batch task failed: {e}")))?
    }
}

#[derive(Clone)]
pub struct BatchExecutor {
    store: Arc<dyn MatchStore>,
    perf: Arc<PerfCounters>,
    running: Arc<DashMap<String, ()>>,
}

impl BatchExecutor {
    pub fn new(store: Arc<dyn MatchStore>) -> Self {
        Self::with_metrics(store, Arc::new(PerfCounters::new()))
    }

    pub fn with_metrics(store: Arc<dyn MatchStore>, perf: Arc<PerfCounters>) -> Self {
        Self { store, perf, running: Arc::new(DashMap::new()) }
    }

    pub fn metrics(&self) -> &Arc<PerfCounters> {
        &self.perf
    }

    pub async fn execute(
        &self,
        negatives: Vec<NegativeInvoice>,
        opts: BatchOptions,
    ) -> Result<BatchOutcome, MatchError> {
        self.execute_with_cancel(negatives, opts, CancelToken::new()).await
    }

    pub async fn execute_with_cancel(
        &self,
        negatives: Vec<NegativeInvoice>,
        opts: BatchOptions,
        cancel: CancelToken,
    ) -> Result<BatchOutcome, MatchError> {
        run_batch(
            self.store.clone(),
            self.perf.clone(),
            self.running.clone(),
            negatives,
            opts,
            cancel,
            None,
        )
        .await
    }

    /// Run the batch in the background and stream results out as they
    /// commit. The receiver is finite and not restartable.
    pub fn execute_streaming(
        &self,
        negatives: Vec<NegativeInvoice>,
        opts: BatchOptions,
        cancel: CancelToken,
    ) -> StreamingBatch {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAP);
        let handle = tokio::spawn(run_batch(
            self.store.clone(),
            self.perf.clone(),
            self.running.clone(),
            negatives,
            opts,
            cancel,
            Some(tx),
        ));
        StreamingBatch { results: rx, handle }
    }
}

fn resolve_mode(opts: &BatchOptions, input_len: usize) -> ExecMode {
    if opts.mode == ExecMode::Streaming || input_len >= opts.streaming_threshold {
        ExecMode::Streaming
    } else {
        ExecMode::Standard
    }
}

/// Candidate window for a group: the per-negative base scaled by group
/// demand, clamped to the configured ceiling.
fn candidate_limit_for(opts: &BatchOptions, group_size: usize) -> i64 {
    let base = opts.candidate_limit_per_group.max(1);
    let max = opts.candidate_limit_max.max(base);
    base.saturating_mul(group_size as i64).clamp(base, max)
}

fn fail_all(negatives: &[NegativeInvoice], why: &str) -> Vec<MatchResult> {
    negatives
        .iter()
        .map(|n| MatchResult::failed(n.negative_invoice_id, n.amount_cents, why))
        .collect()
}

enum GroupReport {
    Done { results: Vec<MatchResult>, fragments: u64, stale_retries: u64 },
    Skipped { results: Vec<MatchResult> },
    Fatal(MatchError),
}

struct OutcomeAgg {
    buffering: bool,
    results: Vec<MatchResult>,
    success: u64,
    partial: u64,
    failed: u64,
    matched_amount_cents: Cents,
    fragments: u64,
    stale_retries: u64,
}

impl OutcomeAgg {
    fn new(buffering: bool) -> Self {
        Self {
            buffering,
            results: Vec::new(),
            success: 0,
            partial: 0,
            failed: 0,
            matched_amount_cents: 0,
            fragments: 0,
            stale_retries: 0,
        }
    }

    async fn push(
        &mut self,
        result: MatchResult,
        perf: &PerfCounters,
        stream_tx: Option<&mpsc::Sender<MatchResult>>,
    ) {
        perf.record_result(&result);
        match result.status {
            MatchStatus::Matched => self.success += 1,
            MatchStatus::Partial => self.partial += 1,
            MatchStatus::Unmatched => self.failed += 1,
        }
        self.matched_amount_cents += result.total_allocated_cents;
        if self.buffering {
            self.results.push(result);
        } else if let Some(tx) = stream_tx {
            // A consumer that walked away is not an engine failure.
            let _ = tx.send(result).await;
        }
    }
}

// Drops the in-process running marker even on early returns.
struct RunningGuard {
    running: Arc<DashMap<String, ()>>,
    batch_id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.remove(&self.batch_id);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_batch(
    store: Arc<dyn MatchStore>,
    perf: Arc<PerfCounters>,
    running: Arc<DashMap<String, ()>>,
    negatives: Vec<NegativeInvoice>,
    opts: BatchOptions,
    cancel: CancelToken,
    stream_tx: Option<mpsc::Sender<MatchResult>>,
) -> Result<BatchOutcome, MatchError> {
    let started = Instant::now();
    let batch_id = opts
        .batch_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mode = resolve_mode(&opts, negatives.len());

    // Same-process double submission fails fast, before touching the store.
    if running.insert(batch_id.clone(), ()).is_some() {
        return Err(MatchError::DuplicateBatch {
            batch_id,
            status: "running".to_string(),
        });
    }
    let _running = RunningGuard { running, batch_id: batch_id.clone() };
    perf.batches_started.fetch_add(1, Ordering::Relaxed);

    // Input validation happens before the store admission; a rejected
    // negative never reaches a group.
    let mut seen: HashSet<i64> = HashSet::with_capacity(negatives.len());
    let mut valid: Vec<NegativeInvoice> = Vec::with_capacity(negatives.len());
    let mut upfront: Vec<MatchResult> = Vec::new();
    let mut total_amount_cents: Cents = 0;
    for n in &negatives {
        total_amount_cents += n.amount_cents.max(0);
        if n.amount_cents <= 0 {
            upfront.push(MatchResult::failed(n.negative_invoice_id, 0, reason::INVALID_AMOUNT));
        } else if !seen.insert(n.negative_invoice_id) {
            upfront.push(MatchResult::failed(
                n.negative_invoice_id,
                n.amount_cents,
                reason::DUPLICATE_NEGATIVE,
            ));
        } else {
            valid.push(n.clone());
        }
    }

    // DuplicateBatch aborts here, before any matching work.
    let admission = store.admit_batch(&batch_id, valid.len() as i64, opts.resume).await?;
    if admission.resumed {
        let before = valid.len();
        valid.retain(|n| !admission.processed.contains(&n.negative_invoice_id));
        info!(
            "batch_resume batch_id={} already_processed={} remaining={}",
            batch_id,
            before - valid.len(),
            valid.len()
        );
    }

    let mut agg = OutcomeAgg::new(stream_tx.is_none());
    for r in upfront {
        agg.push(r, &perf, stream_tx.as_ref()).await;
    }

    let groups = group_negatives(&valid);
    let worker_count = opts.worker_count.max(1);
    info!(
        "batch_start batch_id={} mode={:?} negatives={} groups={} workers={}",
        batch_id,
        mode,
        valid.len(),
        groups.len(),
        worker_count
    );

    let deadline = opts.batch_deadline.map(|d| Instant::now() + d);
    let watchdog = deadline.map(|d| {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await;
            cancel.cancel();
        })
    });

    let (job_tx, job_rx) = mpsc::channel::<(GroupKey, Vec<NegativeInvoice>)>(groups.len().max(1));
    let job_rx = Arc::new(Mutex::new(job_rx));
    let (report_tx, mut report_rx) = mpsc::channel::<GroupReport>(worker_count * 2);

    let mut workers = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let store = store.clone();
        let perf = perf.clone();
        let cancel = cancel.clone();
        let job_rx = job_rx.clone();
        let report_tx = report_tx.clone();
        let batch_id = batch_id.clone();
        let opts = opts.clone();
        workers.push(tokio::spawn(async move {
            loop {
                let job = { job_rx.lock().await.recv().await };
                let Some((key, group)) = job else { break };
                let expired = deadline.map(|d| Instant::now() >= d).unwrap_or(false);
                if cancel.is_cancelled() || expired {
                    perf.groups_skipped.fetch_add(1, Ordering::Relaxed);
                    let report = GroupReport::Skipped { results: fail_all(&group, reason::CANCELLED) };
                    if report_tx.send(report).await.is_err() {
                        break;
                    }
                    continue;
                }
                let report = run_group(store.as_ref(), &perf, &batch_id, key, &group, &opts).await;
                if report_tx.send(report).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(report_tx);

    for job in groups {
        if job_tx.send(job).await.is_err() {
            break;
        }
    }
    drop(job_tx);

    let mut fatal: Option<MatchError> = None;
    while let Some(report) = report_rx.recv().await {
        match report {
            GroupReport::Done { results, fragments, stale_retries } => {
                agg.fragments += fragments;
                agg.stale_retries += stale_retries;
                for r in results {
                    agg.push(r, &perf, stream_tx.as_ref()).await;
                }
            }
            GroupReport::Skipped { results } => {
                for r in results {
                    agg.push(r, &perf, stream_tx.as_ref()).await;
                }
            }
            GroupReport::Fatal(e) => {
                // Drain remaining groups as skipped; the batch is done for.
                cancel.cancel();
                if fatal.is_none() {
                    fatal = Some(e);
                }
            }
        }
    }
    for w in workers {
        let _ = w.await;
    }
    if let Some(w) = watchdog {
        w.abort();
    }

    if let Some(e) = fatal {
        perf.batches_failed.fetch_add(1, Ordering::Relaxed);
        let _ = store
            .finish_batch(&batch_id, BatchStatus::Failed, Some(&e.to_string()))
            .await;
        warn!("batch_failed batch_id={} error={}", batch_id, e);
        return Err(e);
    }

    let status = if cancel.is_cancelled() { BatchStatus::Cancelled } else { BatchStatus::Completed };
    store.finish_batch(&batch_id, status, None).await?;
    match status {
        BatchStatus::Cancelled => {
            perf.batches_cancelled.fetch_add(1, Ordering::Relaxed);
        }
        _ => {
            perf.batches_completed.fetch_add(1, Ordering::Relaxed);
        }
    }
    perf.fragments_created.fetch_add(agg.fragments, Ordering::Relaxed);

    let outcome = BatchOutcome {
        batch_id: batch_id.clone(),
        status,
        mode,
        results: agg.results,
        success_count: agg.success,
        partial_count: agg.partial,
        failed_count: agg.failed,
        matched_amount_cents: agg.matched_amount_cents,
        fragment_created: agg.fragments,
        stale_retries: agg.stale_retries,
        execution_time_ms: started.elapsed().as_millis() as u64,
    };
    if let Err(e) = store
        .record_outcome(&outcome, negatives.len() as i64, total_amount_cents)
        .await
    {
        warn!("outcome_record_failed batch_id={} error={}", batch_id, e);
    }
    info!(
        "batch_done batch_id={} status={:?} matched={} partial={} unmatched={} elapsed_ms={}",
        batch_id,
        status,
        outcome.success_count,
        outcome.partial_count,
        outcome.failed_count,
        outcome.execution_time_ms
    );
    Ok(outcome)
}

/// One group end to end: restart on stale plans, back off on retryable fetch
/// failures, give up cleanly on everything else. Never returns an error
/// except for integrity violations, which poison the whole batch.
async fn run_group(
    store: &dyn MatchStore,
    perf: &PerfCounters,
    batch_id: &str,
    key: GroupKey,
    negatives: &[NegativeInvoice],
    opts: &BatchOptions,
) -> GroupReport {
    let started = Instant::now();
    let mut stale_retries = 0u64;
    let mut fetch_attempts = 0u32;
    loop {
        let attempt = commit_group_once(store, perf, batch_id, key, negatives, opts);
        let outcome = tokio::time::timeout(opts.group_timeout, attempt).await;
        match outcome {
            Err(_) => {
                perf.group_timeouts.fetch_add(1, Ordering::Relaxed);
                perf.groups_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "group_timeout batch_id={} key={} negatives={} timeout_ms={}",
                    batch_id,
                    key,
                    negatives.len(),
                    opts.group_timeout.as_millis()
                );
                return GroupReport::Done {
                    results: fail_all(negatives, reason::TIMEOUT_EXCEEDED),
                    fragments: 0,
                    stale_retries,
                };
            }
            Ok(Ok(plan)) => {
                perf.groups_committed.fetch_add(1, Ordering::Relaxed);
                let elapsed = started.elapsed().as_millis();
                perf.observe_group_ms(elapsed as u64);
                if elapsed >= GROUP_SLOW_WARN_MS && should_emit_slow_warn("group_commit") {
                    warn!(
                        "slow_group batch_id={} key={} negatives={} elapsed_ms={} stale_retries={}",
                        batch_id,
                        key,
                        negatives.len(),
                        elapsed,
                        stale_retries
                    );
                }
                let fragments = plan.fragment_created;
                return GroupReport::Done { results: plan.results, fragments, stale_retries };
            }
            Ok(Err(e)) if e.is_stale() => {
                stale_retries += 1;
                perf.stale_restarts.fetch_add(1, Ordering::Relaxed);
                if stale_retries > opts.max_stale_retries as u64 {
                    perf.groups_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "contention_exceeded batch_id={} key={} retries={}",
                        batch_id, key, stale_retries
                    );
                    return GroupReport::Done {
                        results: fail_all(negatives, reason::CONTENTION_EXCEEDED),
                        fragments: 0,
                        stale_retries,
                    };
                }
                debug!("stale_restart batch_id={} key={} retry={}", batch_id, key, stale_retries);
            }
            Ok(Err(e @ MatchError::CandidateFetch { .. })) => {
                if e.retryable_fetch() && fetch_attempts < FETCH_RETRY_MAX {
                    fetch_attempts += 1;
                    perf.fetch_retries.fetch_add(1, Ordering::Relaxed);
                    let delay = FETCH_RETRY_BASE_MS << fetch_attempts.min(4);
                    debug!(
                        "fetch_retry batch_id={} key={} attempt={} delay_ms={}",
                        batch_id, key, fetch_attempts, delay
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    continue;
                }
                perf.groups_failed.fetch_add(1, Ordering::Relaxed);
                warn!("fetch_failed batch_id={} key={} error={}", batch_id, key, e);
                return GroupReport::Done {
                    results: fail_all(negatives, reason::FETCH_FAILED),
                    fragments: 0,
                    stale_retries,
                };
            }
            Ok(Err(MatchError::Integrity(msg))) => {
                perf.groups_failed.fetch_add(1, Ordering::Relaxed);
                warn!("integrity_violation batch_id={} key={} error={}", batch_id, key, msg);
                return GroupReport::Fatal(MatchError::Integrity(msg));
            }
            Ok(Err(e)) => {
                perf.groups_failed.fetch_add(1, Ordering::Relaxed);
                warn!("group_error batch_id={} key={} error={}", batch_id, key, e);
                return GroupReport::Done {
                    results: fail_all(negatives, e.group_failure_reason()),
                    fragments: 0,
                    stale_retries,
                };
            }
        }
    }
}

/// A single commit attempt: snapshot fetch, pure allocation, then the lock /
/// re-read / apply / commit protocol. The scope rolls back on drop, so any
/// error path simply bubbles out.
async fn commit_group_once(
    store: &dyn MatchStore,
    perf: &PerfCounters,
    batch_id: &str,
    key: GroupKey,
    negatives: &[NegativeInvoice],
    opts: &BatchOptions,
) -> Result<AllocationPlan, MatchError> {
    let mut scope = store.begin_group().await?;
    let limit = candidate_limit_for(opts, negatives.len());

    let fetch_started = Instant::now();
    let mut candidates = scope.fetch(key, limit, opts.candidate_order, &[]).await?;
    perf.observe_fetch_ms(fetch_started.elapsed().as_millis() as u64);

    let mut plan = allocate(negatives, &candidates, opts.sort_strategy, opts.fragment_threshold_cents);

    // A full window plus unmet demand may mean more rows exist beyond the
    // cap; widen with the already-seen lines excluded. Windows concatenate
    // in provider order, so the merged list stays sorted.
    let mut last_fetch_full = candidates.len() as i64 == limit;
    let mut rounds = 0u32;
    while !plan.fully_matched() && last_fetch_full && rounds < opts.max_refetch_rounds {
        rounds += 1;
        perf.refetch_rounds.fetch_add(1, Ordering::Relaxed);
        let exclude: Vec<i64> = candidates.iter().map(|c| c.line_id).collect();
        let extra = scope.fetch(key, limit, opts.candidate_order, &exclude).await?;
        last_fetch_full = extra.len() as i64 == limit;
        if extra.is_empty() {
            break;
        }
        candidates.extend(extra);
        plan = allocate(negatives, &candidates, opts.sort_strategy, opts.fragment_threshold_cents);
    }

    if plan.decrements.is_empty() {
        // Nothing to persist; dropping the scope rolls the snapshot back.
        return Ok(plan);
    }

    let commit_started = Instant::now();
    scope.lock_and_check(&plan.decrements).await?;
    let allocations = plan.allocations();
    scope.apply(batch_id, &plan.decrements, &allocations).await?;
    scope.commit().await?;
    perf.observe_commit_ms(commit_started.elapsed().as_millis() as u64);
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_resolution_honors_threshold() {
        let opts = BatchOptions { streaming_threshold: 100, ..Default::default() };
        assert_eq!(resolve_mode(&opts, 99), ExecMode::Standard);
        assert_eq!(resolve_mode(&opts, 100), ExecMode::Streaming);
        let opts = BatchOptions { mode: ExecMode::Streaming, ..Default::default() };
        assert_eq!(resolve_mode(&opts, 1), ExecMode::Streaming);
    }

    #[test]
    fn candidate_limit_scales_with_demand() {
        let opts = BatchOptions {
            candidate_limit_per_group: 200,
            candidate_limit_max: 2_000,
            ..Default::default()
        };
        assert_eq!(candidate_limit_for(&opts, 1), 200);
        assert_eq!(candidate_limit_for(&opts, 5), 1_000);
        assert_eq!(candidate_limit_for(&opts, 50), 2_000);
    }
}
