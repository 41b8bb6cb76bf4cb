//! Batch matching engine for negative invoices.
//!
//! A negative invoice (refund/credit line of magnitude `A`) is matched
//! against outstanding blue line items sharing its `(tax_rate, buyer_id,
//! seller_id)` key: the engine allocates `A` worth of remaining balance
//! across one or more blue lines and commits the decrements plus the
//! allocation records in one transaction per key-group.
//!
//! The allocator itself is a pure function over in-memory candidates; the
//! store boundary ([`store::MatchStore`]) supplies candidates and commits
//! group plans, with a Postgres implementation ([`store::PgMatchStore`]) and
//! an in-memory one ([`memstore::MemoryMatchStore`]) for tests and embedding.

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod memstore;
pub mod metrics;
pub mod store;

pub use crate::config::{load_config, AppConfig, BatchDefaults, DatabaseConfig};
pub use crate::engine::{
    allocate, group_negatives, Allocation, AllocationPlan, BlueLine, CandidateOrder, Cents,
    GroupKey, MatchResult, MatchStatus, NegativeInvoice, NegativeOrder,
};
pub use crate::error::MatchError;
pub use crate::executor::{
    BatchExecutor, BatchOptions, BatchOutcome, CancelToken, ExecMode, StreamingBatch,
};
pub use crate::memstore::MemoryMatchStore;
pub use crate::metrics::PerfCounters;
pub use crate::store::{
    BatchAdmission, BatchStatus, GroupScope, MatchStore, PgMatchStore, RemainingBucket,
};

pub(crate) fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Convert integer cents to the scale-2 decimal used at the store boundary.
pub fn cents_to_decimal(cents: Cents) -> Decimal {
    Decimal::new(cents, 2)
}

/// Convert a scale-2 decimal read from the store into integer cents.
///
/// Values are expected to carry at most two fractional digits; anything finer
/// is rejected rather than rounded so balance math stays exact.
pub fn decimal_to_cents(value: Decimal) -> Result<Cents, MatchError> {
    let scaled = value * Decimal::from(100);
    if scaled.fract() != Decimal::ZERO {
        return Err(MatchError::InvalidInput(format!(
            "amount {value} has more than two fractional digits"
        )));
    }
    scaled
        .to_i64()
        .ok_or_else(|| MatchError::InvalidInput(format!("amount {value} out of range")))
}

/// Parse a scale-2 decimal string (e.g. a configured threshold) into cents.
pub fn parse_amount_to_cents(raw: &str) -> Result<Cents, MatchError> {
    let d = Decimal::from_str(raw)
        .map_err(|_| MatchError::InvalidInput(format!("invalid amount: {raw}")))?;
    decimal_to_cents(d)
}
