use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::engine::{CandidateOrder, Cents, NegativeOrder};
use crate::executor::{
    BatchOptions, CANDIDATE_LIMIT_BASE_DEFAULT, CANDIDATE_LIMIT_MAX_DEFAULT,
    FRAGMENT_THRESHOLD_CENTS_DEFAULT, GROUP_TIMEOUT_SECS_DEFAULT, MAX_REFETCH_ROUNDS_DEFAULT,
    MAX_STALE_RETRIES_DEFAULT, STREAMING_THRESHOLD_DEFAULT, WORKER_COUNT_DEFAULT,
};
use crate::parse_amount_to_cents;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub batch: BatchDefaults,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub min_pool_size: u32,
    pub max_pool_size: u32,
    pub max_lifetime_seconds: u64,
    pub acquire_timeout_seconds: u64,
}

/// Default batch options sourced from the environment; per-call
/// [`BatchOptions`] override any of these.
#[derive(Debug, Deserialize, Clone)]
pub struct BatchDefaults {
    pub worker_count: usize,
    pub streaming_threshold: usize,
    pub candidate_limit_per_group: i64,
    pub candidate_limit_max: i64,
    pub max_stale_retries: u32,
    pub max_refetch_rounds: u32,
    pub fragment_threshold_cents: Cents,
    pub group_timeout_seconds: u64,
    pub sort_strategy: NegativeOrder,
    pub candidate_order: CandidateOrder,
}

impl BatchDefaults {
    pub fn to_options(&self) -> BatchOptions {
        BatchOptions {
            worker_count: self.worker_count,
            streaming_threshold: self.streaming_threshold,
            candidate_limit_per_group: self.candidate_limit_per_group,
            candidate_limit_max: self.candidate_limit_max,
            max_stale_retries: self.max_stale_retries,
            max_refetch_rounds: self.max_refetch_rounds,
            fragment_threshold_cents: self.fragment_threshold_cents,
            group_timeout: Duration::from_secs(self.group_timeout_seconds),
            sort_strategy: self.sort_strategy,
            candidate_order: self.candidate_order,
            ..BatchOptions::default()
        }
    }
}

pub fn load_config() -> Result<AppConfig> {
    let fragment_threshold_cents = match std::env::var("MATCH_FRAGMENT_THRESHOLD") {
        Ok(raw) => parse_amount_to_cents(&raw)
            .map_err(|e| anyhow!("MATCH_FRAGMENT_THRESHOLD: {e}"))?,
        Err(_) => FRAGMENT_THRESHOLD_CENTS_DEFAULT,
    };
    let sort_strategy = {
        let raw = env_string("MATCH_SORT_STRATEGY", "amount_desc");
        NegativeOrder::parse(&raw).ok_or_else(|| anyhow!("invalid MATCH_SORT_STRATEGY: {raw}"))?
    };
    let candidate_order = {
        let raw = env_string("MATCH_CANDIDATE_ORDER", "remaining_asc");
        CandidateOrder::parse(&raw)
            .ok_or_else(|| anyhow!("invalid MATCH_CANDIDATE_ORDER: {raw}"))?
    };

    let cfg = AppConfig {
        database: DatabaseConfig {
            url: env_required("DATABASE_URL")?,
            min_pool_size: env_u32("DB_MIN_POOL_SIZE", 2),
            max_pool_size: env_u32("DB_MAX_POOL_SIZE", 16),
            max_lifetime_seconds: env_u64("DB_MAX_LIFETIME_SECONDS", 1800),
            acquire_timeout_seconds: env_u64("DB_ACQUIRE_TIMEOUT_SECONDS", 30),
        },
        batch: BatchDefaults {
            worker_count: env_usize("MATCH_WORKER_COUNT", WORKER_COUNT_DEFAULT).max(1),
            streaming_threshold: env_usize("MATCH_STREAMING_THRESHOLD", STREAMING_THRESHOLD_DEFAULT),
            candidate_limit_per_group: env_i64("MATCH_CANDIDATE_LIMIT", CANDIDATE_LIMIT_BASE_DEFAULT),
            candidate_limit_max: env_i64("MATCH_CANDIDATE_LIMIT_MAX", CANDIDATE_LIMIT_MAX_DEFAULT),
            max_stale_retries: env_u32("MATCH_MAX_STALE_RETRIES", MAX_STALE_RETRIES_DEFAULT),
            max_refetch_rounds: env_u32("MATCH_MAX_REFETCH_ROUNDS", MAX_REFETCH_ROUNDS_DEFAULT),
            fragment_threshold_cents,
            group_timeout_seconds: env_u64("MATCH_GROUP_TIMEOUT_SECONDS", GROUP_TIMEOUT_SECS_DEFAULT),
            sort_strategy,
            candidate_order,
        },
    };
    if cfg.database.max_pool_size < cfg.database.min_pool_size {
        return Err(anyhow!("DB_MAX_POOL_SIZE must be >= DB_MIN_POOL_SIZE"));
    }
    Ok(cfg)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("missing required env var: {key}"))
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}
