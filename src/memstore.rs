//! In-memory implementation of the store boundary.
//!
//! Mirrors the Postgres commit protocol closely enough to exercise the
//! executor without a database: fetch is a snapshot read, and the stale check
//! collapses onto commit, where the whole store is mutated under one lock.
//! Useful for tests and for embedding the engine without Postgres.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::engine::{sort_candidates, Allocation, BlueLine, CandidateOrder, Cents, GroupKey};
use crate::error::MatchError;
use crate::executor::BatchOutcome;
use crate::store::{BatchAdmission, BatchStatus, GroupScope, MatchStore};

#[derive(Debug, Clone)]
pub struct MemLine {
    pub key: GroupKey,
    pub original_cents: Cents,
    pub remaining_cents: Cents,
}

#[derive(Debug, Clone)]
pub struct MemRecord {
    pub batch_id: String,
    pub negative_invoice_id: i64,
    pub blue_line_id: i64,
    pub amount_used_cents: Cents,
    pub status: String,
}

#[derive(Debug, Clone)]
struct MemBatch {
    status: String,
    total_lines: i64,
    resumed_from: Option<String>,
    error: Option<String>,
}

#[derive(Default)]
struct MemInner {
    lines: BTreeMap<i64, MemLine>,
    records: Vec<MemRecord>,
    batches: HashMap<String, MemBatch>,
    outcomes: Vec<(String, i64, Cents)>,
}

// Live fetched-row gauge: how many candidate rows are currently materialized
// across open scopes, and the high-water mark. This is the observable side of
// the streaming memory contract.
#[derive(Default)]
struct FetchGauge {
    current: AtomicI64,
    peak: AtomicI64,
}

impl FetchGauge {
    fn add(&self, n: i64) {
        let cur = self.current.fetch_add(n, Ordering::SeqCst) + n;
        self.peak.fetch_max(cur, Ordering::SeqCst);
    }

    fn sub(&self, n: i64) {
        self.current.fetch_sub(n, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub struct MemoryMatchStore {
    inner: Arc<Mutex<MemInner>>,
    gauge: Arc<FetchGauge>,
    induced_stale: Arc<AtomicU32>,
}

impl MemoryMatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a blue line with `remaining = original = amount_cents`.
    pub async fn insert_line(&self, line_id: i64, key: GroupKey, amount_cents: Cents) {
        let mut inner = self.inner.lock().await;
        inner.lines.insert(
            line_id,
            MemLine { key, original_cents: amount_cents, remaining_cents: amount_cents },
        );
    }

    pub async fn remaining_cents(&self, line_id: i64) -> Option<Cents> {
        self.inner.lock().await.lines.get(&line_id).map(|l| l.remaining_cents)
    }

    pub async fn records_for_batch(&self, batch_id: &str) -> Vec<MemRecord> {
        self.inner
            .lock()
            .await
            .records
            .iter()
            .filter(|r| r.batch_id == batch_id)
            .cloned()
            .collect()
    }

    /// Sum of active allocations against one blue line, across all batches.
    pub async fn active_allocated_cents(&self, line_id: i64) -> Cents {
        self.inner
            .lock()
            .await
            .records
            .iter()
            .filter(|r| r.blue_line_id == line_id && r.status == "active")
            .map(|r| r.amount_used_cents)
            .sum()
    }

    pub async fn batch_status(&self, batch_id: &str) -> Option<String> {
        self.inner.lock().await.batches.get(batch_id).map(|b| b.status.clone())
    }

    /// Metadata snapshot for one batch: (status, total_lines, resumed_from,
    /// error_message).
    pub async fn batch_meta(
        &self,
        batch_id: &str,
    ) -> Option<(String, i64, Option<String>, Option<String>)> {
        self.inner
            .lock()
            .await
            .batches
            .get(batch_id)
            .map(|b| (b.status.clone(), b.total_lines, b.resumed_from.clone(), b.error.clone()))
    }

    /// Recorded reporting-sink rows: (batch_id, total_negatives,
    /// total_amount_cents).
    pub async fn outcomes(&self) -> Vec<(String, i64, Cents)> {
        self.inner.lock().await.outcomes.clone()
    }

    pub async fn set_batch_status(&self, batch_id: &str, status: &str) {
        if let Some(b) = self.inner.lock().await.batches.get_mut(batch_id) {
            b.status = status.to_string();
        }
    }

    /// Apply one committed allocation directly (decrement plus record), as a
    /// prior run of the same batch would have left it.
    pub async fn seed_record(
        &self,
        batch_id: &str,
        negative_invoice_id: i64,
        blue_line_id: i64,
        amount_cents: Cents,
    ) {
        let mut inner = self.inner.lock().await;
        if let Some(line) = inner.lines.get_mut(&blue_line_id) {
            line.remaining_cents -= amount_cents;
        }
        inner.records.push(MemRecord {
            batch_id: batch_id.to_string(),
            negative_invoice_id,
            blue_line_id,
            amount_used_cents: amount_cents,
            status: "active".to_string(),
        });
    }

    /// High-water mark of candidate rows materialized at once.
    pub fn peak_fetched_rows(&self) -> i64 {
        self.gauge.peak.load(Ordering::SeqCst)
    }

    /// Make the next `n` lock checks report a stale plan, regardless of
    /// balances. Exercises the restart/contention path deterministically.
    pub fn induce_stale(&self, n: u32) {
        self.induced_stale.store(n, Ordering::SeqCst);
    }

    /// Counterpart of [`crate::store::PgMatchStore::reverse_match`].
    pub async fn reverse_match(&self, batch_id: &str, negative_invoice_id: i64) -> u64 {
        let mut inner = self.inner.lock().await;
        let mut restore: Vec<(i64, Cents)> = Vec::new();
        let mut flipped = 0u64;
        for r in inner.records.iter_mut() {
            if r.batch_id == batch_id
                && r.negative_invoice_id == negative_invoice_id
                && r.status == "active"
            {
                r.status = "reversed".to_string();
                restore.push((r.blue_line_id, r.amount_used_cents));
                flipped += 1;
            }
        }
        for (line_id, amount) in restore {
            if let Some(line) = inner.lines.get_mut(&line_id) {
                line.remaining_cents += amount;
            }
        }
        flipped
    }
}

#[async_trait]
impl MatchStore for MemoryMatchStore {
    async fn begin_group(&self) -> Result<Box<dyn GroupScope>, MatchError> {
        Ok(Box::new(MemoryGroupScope {
            store: self.clone(),
            fetched_rows: 0,
            staged: None,
        }))
    }

    async fn admit_batch(
        &self,
        batch_id: &str,
        total_lines: i64,
        resume: bool,
    ) -> Result<BatchAdmission, MatchError> {
        let mut inner = self.inner.lock().await;
        match inner.batches.get(batch_id) {
            None => {
                inner.batches.insert(
                    batch_id.to_string(),
                    MemBatch {
                        status: "running".to_string(),
                        total_lines,
                        resumed_from: None,
                        error: None,
                    },
                );
                Ok(BatchAdmission::default())
            }
            Some(existing) if resume && existing.status == "failed" => {
                let processed: HashSet<i64> = inner
                    .records
                    .iter()
                    .filter(|r| r.batch_id == batch_id && r.status == "active")
                    .map(|r| r.negative_invoice_id)
                    .collect();
                let batch = inner.batches.get_mut(batch_id).expect("batch present");
                batch.status = "running".to_string();
                batch.resumed_from = Some(batch_id.to_string());
                batch.error = None;
                Ok(BatchAdmission { resumed: true, processed })
            }
            Some(existing) => Err(MatchError::DuplicateBatch {
                batch_id: batch_id.to_string(),
                status: existing.status.clone(),
            }),
        }
    }

    async fn finish_batch(
        &self,
        batch_id: &str,
        status: BatchStatus,
        error: Option<&str>,
    ) -> Result<(), MatchError> {
        let mut inner = self.inner.lock().await;
        if let Some(b) = inner.batches.get_mut(batch_id) {
            b.status = status.as_str().to_string();
            b.error = error.map(|e| e.to_string());
        }
        Ok(())
    }

    async fn record_outcome(
        &self,
        outcome: &BatchOutcome,
        total_negatives: i64,
        total_amount_cents: Cents,
    ) -> Result<(), MatchError> {
        let mut inner = self.inner.lock().await;
        inner.outcomes.push((outcome.batch_id.clone(), total_negatives, total_amount_cents));
        Ok(())
    }
}

struct Staged {
    batch_id: String,
    decrements: Vec<(i64, Cents)>,
    allocations: Vec<Allocation>,
}

struct MemoryGroupScope {
    store: MemoryMatchStore,
    fetched_rows: i64,
    staged: Option<Staged>,
}

#[async_trait]
impl GroupScope for MemoryGroupScope {
    async fn fetch(
        &mut self,
        key: GroupKey,
        limit: i64,
        order: CandidateOrder,
        exclude: &[i64],
    ) -> Result<Vec<BlueLine>, MatchError> {
        let inner = self.store.inner.lock().await;
        let excluded: HashSet<i64> = exclude.iter().copied().collect();
        let mut out: Vec<BlueLine> = inner
            .lines
            .iter()
            .filter(|(id, l)| l.key == key && l.remaining_cents > 0 && !excluded.contains(*id))
            .map(|(id, l)| BlueLine { line_id: *id, key, remaining_cents: l.remaining_cents })
            .collect();
        drop(inner);
        sort_candidates(&mut out, order);
        out.truncate(limit.max(0) as usize);
        self.fetched_rows += out.len() as i64;
        self.store.gauge.add(out.len() as i64);
        Ok(out)
    }

    async fn lock_and_check(&mut self, decrements: &[(i64, Cents)]) -> Result<(), MatchError> {
        if self
            .store
            .induced_stale
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
        {
            return Err(MatchError::StaleAllocation {
                line_id: 0,
                planned_cents: 0,
                remaining_cents: 0,
            });
        }
        let inner = self.store.inner.lock().await;
        for (line_id, planned) in decrements {
            let remaining = inner.lines.get(line_id).map(|l| l.remaining_cents).unwrap_or(0);
            if remaining < *planned {
                return Err(MatchError::StaleAllocation {
                    line_id: *line_id,
                    planned_cents: *planned,
                    remaining_cents: remaining,
                });
            }
        }
        Ok(())
    }

    async fn apply(
        &mut self,
        batch_id: &str,
        decrements: &[(i64, Cents)],
        allocations: &[Allocation],
    ) -> Result<(), MatchError> {
        self.staged = Some(Staged {
            batch_id: batch_id.to_string(),
            decrements: decrements.to_vec(),
            allocations: allocations.to_vec(),
        });
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), MatchError> {
        let Some(staged) = self.staged.take() else {
            return Ok(());
        };
        let mut inner = self.store.inner.lock().await;

        // The re-check under the store lock stands in for the row locks a
        // relational store would have held from lock_and_check to commit: a
        // concurrent commit in the gap surfaces here as a stale plan.
        for (line_id, planned) in &staged.decrements {
            let remaining = inner.lines.get(line_id).map(|l| l.remaining_cents).unwrap_or(0);
            if remaining < *planned {
                return Err(MatchError::StaleAllocation {
                    line_id: *line_id,
                    planned_cents: *planned,
                    remaining_cents: remaining,
                });
            }
        }
        for a in &staged.allocations {
            let dup = inner.records.iter().any(|r| {
                r.batch_id == staged.batch_id
                    && r.negative_invoice_id == a.negative_invoice_id
                    && r.blue_line_id == a.blue_line_id
            });
            if dup {
                return Err(MatchError::Integrity(format!(
                    "duplicate record batch={} negative={} line={}",
                    staged.batch_id, a.negative_invoice_id, a.blue_line_id
                )));
            }
        }

        for (line_id, dec) in &staged.decrements {
            if let Some(line) = inner.lines.get_mut(line_id) {
                line.remaining_cents -= dec;
            }
        }
        for a in &staged.allocations {
            inner.records.push(MemRecord {
                batch_id: staged.batch_id.clone(),
                negative_invoice_id: a.negative_invoice_id,
                blue_line_id: a.blue_line_id,
                amount_used_cents: a.amount_used_cents,
                status: "active".to_string(),
            });
        }
        Ok(())
    }
}

impl Drop for MemoryGroupScope {
    fn drop(&mut self) {
        self.store.gauge.sub(self.fetched_rows);
    }
}
