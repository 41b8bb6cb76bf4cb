use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, QueryBuilder, Row, Transaction};

use crate::config::DatabaseConfig;
use crate::engine::{Allocation, BlueLine, CandidateOrder, Cents, GroupKey};
use crate::error::MatchError;
use crate::executor::BatchOutcome;
use crate::{cents_to_decimal, decimal_to_cents};

/// Terminal state of a batch as recorded in `batch_metadata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }
}

/// Result of claiming a batch id: whether this run resumes a failed one, and
/// which negatives already have committed records.
#[derive(Debug, Default)]
pub struct BatchAdmission {
    pub resumed: bool,
    pub processed: HashSet<i64>,
}

/// One key-group's transactional scope. Fetch is a snapshot read; the commit
/// protocol is lock (ascending `line_id`) → re-read check → apply → commit.
/// Dropping a scope without committing rolls everything back.
#[async_trait]
pub trait GroupScope: Send {
    /// Ordered candidate window for `key`: every row has `remaining > 0` at
    /// read time. `exclude` supports refetch rounds. Empty is not an error.
    async fn fetch(
        &mut self,
        key: GroupKey,
        limit: i64,
        order: CandidateOrder,
        exclude: &[i64],
    ) -> Result<Vec<BlueLine>, MatchError>;

    /// Lock the planned rows in ascending `line_id` order and verify each
    /// re-read balance still covers its planned decrement. A shortfall means
    /// the plan is stale and the group must restart.
    async fn lock_and_check(&mut self, decrements: &[(i64, Cents)]) -> Result<(), MatchError>;

    /// Apply balance decrements and insert the allocation records.
    async fn apply(
        &mut self,
        batch_id: &str,
        decrements: &[(i64, Cents)],
        allocations: &[Allocation],
    ) -> Result<(), MatchError>;

    async fn commit(self: Box<Self>) -> Result<(), MatchError>;
}

/// Store capability boundary for the batch executor. Implemented for
/// Postgres ([`PgMatchStore`]) and in memory
/// ([`crate::memstore::MemoryMatchStore`]).
#[async_trait]
pub trait MatchStore: Send + Sync {
    async fn begin_group(&self) -> Result<Box<dyn GroupScope>, MatchError>;

    /// Claim `batch_id`. A fresh id inserts the metadata row with status
    /// `running`. An existing id is rejected with
    /// [`MatchError::DuplicateBatch`] unless its status is `failed` and
    /// `resume` is set, in which case the previously committed negative ids
    /// come back so the executor can skip them.
    async fn admit_batch(
        &self,
        batch_id: &str,
        total_lines: i64,
        resume: bool,
    ) -> Result<BatchAdmission, MatchError>;

    async fn finish_batch(
        &self,
        batch_id: &str,
        status: BatchStatus,
        error: Option<&str>,
    ) -> Result<(), MatchError>;

    /// Optional reporting sink (`test_results` table in Postgres).
    async fn record_outcome(
        &self,
        outcome: &BatchOutcome,
        total_negatives: i64,
        total_amount_cents: Cents,
    ) -> Result<(), MatchError>;
}

fn fetch_error(e: sqlx::Error) -> MatchError {
    if let sqlx::Error::Database(db) = &e {
        // A serialization failure mid-fetch is a stale snapshot, not a
        // transport problem; let the group restart instead of backing off.
        if db.code().as_deref() == Some("40001") {
            return MatchError::from(e);
        }
        return MatchError::CandidateFetch { message: e.to_string(), retryable: false };
    }
    // Everything transport-shaped might heal on retry; decode trouble won't.
    let retryable = !matches!(e, sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_));
    MatchError::CandidateFetch { message: e.to_string(), retryable }
}

/// Postgres-backed store. Raw queries against the normative schema; the
/// compound partial index on `(tax_rate, buyer_id, seller_id) WHERE
/// remaining > 0` backs the candidate fetch.
#[derive(Clone)]
pub struct PgMatchStore {
    pool: Pool<Postgres>,
}

impl PgMatchStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self, MatchError> {
        let pool = PgPoolOptions::new()
            .min_connections(cfg.min_pool_size)
            .max_connections(cfg.max_pool_size)
            .max_lifetime(Duration::from_secs(cfg.max_lifetime_seconds))
            .acquire_timeout(Duration::from_secs(cfg.acquire_timeout_seconds))
            .connect(&cfg.url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Remaining-balance distribution across all blue lines, bucketed the way
    /// operations reads it: depleted / fragment / small / medium / large.
    pub async fn remaining_distribution(&self) -> Result<Vec<RemainingBucket>, MatchError> {
        let rows = sqlx::query(
            r#"
            SELECT
                CASE
                    WHEN remaining = 0 THEN '0_depleted'
                    WHEN remaining < 50 THEN '1_fragment'
                    WHEN remaining < 100 THEN '2_small'
                    WHEN remaining < 500 THEN '3_medium'
                    ELSE '4_large'
                END AS category,
                COUNT(*) AS line_count,
                COALESCE(SUM(remaining), 0) AS total_amount
            FROM blue_lines
            GROUP BY category
            ORDER BY category
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(RemainingBucket {
                category: r.get("category"),
                line_count: r.get("line_count"),
                total_amount_cents: decimal_to_cents(r.get::<Decimal, _>("total_amount"))?,
            });
        }
        Ok(out)
    }

    /// Reverse a negative's committed allocations: restore each blue line's
    /// balance and flip the records to `reversed`. Append-only in spirit; the
    /// `(batch_id, negative_invoice_id, blue_line_id)` uniqueness makes the
    /// status flip the reversal record. Returns the number of reversed rows.
    pub async fn reverse_match(
        &self,
        batch_id: &str,
        negative_invoice_id: i64,
    ) -> Result<u64, MatchError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE blue_lines b
            SET remaining = b.remaining + r.amount_used,
                last_update = CURRENT_TIMESTAMP
            FROM match_records r
            WHERE r.batch_id = $1
              AND r.negative_invoice_id = $2
              AND r.status = 'active'
              AND r.blue_line_id = b.line_id
            "#,
        )
        .bind(batch_id)
        .bind(negative_invoice_id)
        .execute(&mut *tx)
        .await?;

        let flipped = sqlx::query(
            "UPDATE match_records SET status = 'reversed' \
             WHERE batch_id = $1 AND negative_invoice_id = $2 AND status = 'active'",
        )
        .bind(batch_id)
        .bind(negative_invoice_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(flipped)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RemainingBucket {
    pub category: String,
    pub line_count: i64,
    pub total_amount_cents: Cents,
}

#[async_trait]
impl MatchStore for PgMatchStore {
    async fn begin_group(&self) -> Result<Box<dyn GroupScope>, MatchError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgGroupScope { tx }))
    }

    async fn admit_batch(
        &self,
        batch_id: &str,
        total_lines: i64,
        resume: bool,
    ) -> Result<BatchAdmission, MatchError> {
        let inserted = sqlx::query(
            "INSERT INTO batch_metadata (batch_id, total_lines, status, start_time) \
             VALUES ($1, $2, 'running', CURRENT_TIMESTAMP) \
             ON CONFLICT (batch_id) DO NOTHING",
        )
        .bind(batch_id)
        .bind(total_lines)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if inserted == 1 {
            return Ok(BatchAdmission::default());
        }

        let status: String =
            sqlx::query_scalar("SELECT status FROM batch_metadata WHERE batch_id = $1")
                .bind(batch_id)
                .fetch_one(&self.pool)
                .await?;
        if !(resume && status == "failed") {
            return Err(MatchError::DuplicateBatch { batch_id: batch_id.to_string(), status });
        }

        // The guard on status makes concurrent resume attempts race safely:
        // only one of them flips the row back to running.
        let claimed = sqlx::query(
            "UPDATE batch_metadata \
             SET status = 'running', resumed_at = CURRENT_TIMESTAMP, resumed_from = $1, \
                 error_message = NULL \
             WHERE batch_id = $1 AND status = 'failed'",
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if claimed != 1 {
            return Err(MatchError::DuplicateBatch {
                batch_id: batch_id.to_string(),
                status: "running".to_string(),
            });
        }

        let rows = sqlx::query(
            "SELECT DISTINCT negative_invoice_id FROM match_records \
             WHERE batch_id = $1 AND status = 'active'",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        let processed = rows
            .into_iter()
            .map(|r| r.get::<i64, _>("negative_invoice_id"))
            .collect();
        Ok(BatchAdmission { resumed: true, processed })
    }

    async fn finish_batch(
        &self,
        batch_id: &str,
        status: BatchStatus,
        error: Option<&str>,
    ) -> Result<(), MatchError> {
        sqlx::query(
            "UPDATE batch_metadata \
             SET status = $2, end_time = CURRENT_TIMESTAMP, error_message = $3 \
             WHERE batch_id = $1",
        )
        .bind(batch_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_outcome(
        &self,
        outcome: &BatchOutcome,
        total_negatives: i64,
        total_amount_cents: Cents,
    ) -> Result<(), MatchError> {
        sqlx::query(
            "INSERT INTO test_results \
             (batch_id, total_negatives, success_count, failed_count, total_amount, \
              matched_amount, execution_time_ms, fragment_created, test_time) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, CURRENT_TIMESTAMP)",
        )
        .bind(&outcome.batch_id)
        .bind(total_negatives)
        .bind(outcome.success_count as i64)
        .bind((outcome.partial_count + outcome.failed_count) as i64)
        .bind(cents_to_decimal(total_amount_cents))
        .bind(cents_to_decimal(outcome.matched_amount_cents))
        .bind(outcome.execution_time_ms as i64)
        .bind(outcome.fragment_created as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

struct PgGroupScope {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl GroupScope for PgGroupScope {
    async fn fetch(
        &mut self,
        key: GroupKey,
        limit: i64,
        order: CandidateOrder,
        exclude: &[i64],
    ) -> Result<Vec<BlueLine>, MatchError> {
        let order_sql = match order {
            CandidateOrder::RemainingAsc => "remaining ASC, line_id ASC",
            CandidateOrder::RemainingDesc => "remaining DESC, line_id ASC",
            CandidateOrder::LineIdAsc => "line_id ASC",
        };
        let sql = format!(
            "SELECT line_id, remaining FROM blue_lines \
             WHERE tax_rate = $1 AND buyer_id = $2 AND seller_id = $3 \
               AND remaining > 0 AND line_id <> ALL($4) \
             ORDER BY {order_sql} LIMIT $5"
        );
        let rows = sqlx::query(&sql)
            .bind(key.tax_rate)
            .bind(key.buyer_id)
            .bind(key.seller_id)
            .bind(exclude.to_vec())
            .bind(limit)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(fetch_error)?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(BlueLine {
                line_id: r.get("line_id"),
                key,
                remaining_cents: decimal_to_cents(r.get::<Decimal, _>("remaining"))?,
            });
        }
        Ok(out)
    }

    async fn lock_and_check(&mut self, decrements: &[(i64, Cents)]) -> Result<(), MatchError> {
        if decrements.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = decrements.iter().map(|(id, _)| *id).collect();
        let rows = sqlx::query(
            "SELECT line_id, remaining FROM blue_lines \
             WHERE line_id = ANY($1) ORDER BY line_id FOR UPDATE",
        )
        .bind(ids)
        .fetch_all(&mut *self.tx)
        .await?;

        let mut current: HashMap<i64, Cents> = HashMap::with_capacity(rows.len());
        for r in rows {
            current.insert(r.get("line_id"), decimal_to_cents(r.get::<Decimal, _>("remaining"))?);
        }
        for (line_id, planned) in decrements {
            let remaining = current.get(line_id).copied().unwrap_or(0);
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
        for (line_id, dec) in decrements {
            let amount = cents_to_decimal(*dec);
            let updated = sqlx::query(
                "UPDATE blue_lines \
                 SET remaining = remaining - $1, last_update = CURRENT_TIMESTAMP \
                 WHERE line_id = $2 AND remaining >= $1",
            )
            .bind(amount)
            .bind(line_id)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
            // The guard cannot fire with the locks held; if it does, the
            // plan no longer reflects the store.
            if updated != 1 {
                return Err(MatchError::StaleAllocation {
                    line_id: *line_id,
                    planned_cents: *dec,
                    remaining_cents: 0,
                });
            }
        }

        if allocations.is_empty() {
            return Ok(());
        }
        let match_time = Utc::now();
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO match_records \
             (batch_id, negative_invoice_id, blue_line_id, amount_used, match_time, status) ",
        );
        qb.push_values(allocations, |mut b, a| {
            b.push_bind(batch_id)
                .push_bind(a.negative_invoice_id)
                .push_bind(a.blue_line_id)
                .push_bind(cents_to_decimal(a.amount_used_cents))
                .push_bind(match_time)
                .push_bind("active");
        });
        qb.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), MatchError> {
        self.tx.commit().await?;
        Ok(())
    }
}
