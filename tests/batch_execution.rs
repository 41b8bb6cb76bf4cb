//! End-to-end batch execution over the in-memory store: group isolation,
//! persistence semantics, contention, resumption, cancellation, and the
//! streaming memory contract.

use std::sync::Arc;

use bluematch::error::reason;
use bluematch::{
    BatchExecutor, BatchOptions, CancelToken, CandidateOrder, ExecMode, GroupKey, MatchError,
    MatchStatus, MatchStore, MemoryMatchStore, NegativeInvoice, NegativeOrder,
};

fn k(tax_rate: i16, buyer_id: i32, seller_id: i32) -> GroupKey {
    GroupKey::new(tax_rate, buyer_id, seller_id)
}

fn neg(id: i64, key: GroupKey, amount_cents: i64) -> NegativeInvoice {
    NegativeInvoice::new(id, key, amount_cents)
}

fn executor(store: &MemoryMatchStore) -> BatchExecutor {
    BatchExecutor::new(Arc::new(store.clone()))
}

fn opts() -> BatchOptions {
    BatchOptions {
        worker_count: 2,
        candidate_order: CandidateOrder::RemainingDesc,
        sort_strategy: NegativeOrder::AmountDesc,
        ..Default::default()
    }
}

/// remaining = original - sum of active allocations, per line.
async fn assert_balance_invariant(store: &MemoryMatchStore, line_id: i64, original: i64) {
    let remaining = store.remaining_cents(line_id).await.unwrap();
    let allocated = store.active_allocated_cents(line_id).await;
    assert_eq!(remaining, original - allocated, "line {line_id}");
    assert!(remaining >= 0, "line {line_id} went negative");
}

#[tokio::test]
async fn single_negative_spans_two_lines() {
    let store = MemoryMatchStore::new();
    store.insert_line(1, k(13, 1, 1), 10_000).await;
    store.insert_line(2, k(13, 1, 1), 5_000).await;

    let outcome = executor(&store)
        .execute(
            vec![neg(1, k(13, 1, 1), 12_000)],
            BatchOptions { batch_id: Some("s1".into()), ..opts() },
        )
        .await
        .unwrap();

    assert_eq!(outcome.success_count, 1);
    assert_eq!(outcome.failed_count, 0);
    let r = &outcome.results[0];
    assert_eq!(r.status, MatchStatus::Matched);
    assert_eq!(r.total_allocated_cents, 12_000);
    let pairs: Vec<(i64, i64)> = r
        .allocations
        .iter()
        .map(|a| (a.blue_line_id, a.amount_used_cents))
        .collect();
    assert_eq!(pairs, vec![(1, 10_000), (2, 2_000)]);

    assert_eq!(store.remaining_cents(1).await, Some(0));
    assert_eq!(store.remaining_cents(2).await, Some(3_000));
    assert_balance_invariant(&store, 1, 10_000).await;
    assert_balance_invariant(&store, 2, 5_000).await;
    assert_eq!(store.records_for_batch("s1").await.len(), 2);
    assert_eq!(store.batch_status("s1").await.as_deref(), Some("completed"));
}

#[tokio::test]
async fn partial_exhausts_pool_and_persists() {
    let store = MemoryMatchStore::new();
    store.insert_line(1, k(13, 1, 1), 10_000).await;
    store.insert_line(2, k(13, 1, 1), 5_000).await;

    let outcome = executor(&store)
        .execute(
            vec![neg(1, k(13, 1, 1), 20_000)],
            BatchOptions { batch_id: Some("s2".into()), ..opts() },
        )
        .await
        .unwrap();

    assert_eq!(outcome.partial_count, 1);
    let r = &outcome.results[0];
    assert_eq!(r.status, MatchStatus::Partial);
    assert_eq!(r.total_allocated_cents, 15_000);
    assert_eq!(r.shortfall_cents, 5_000);

    // Partial allocations persist and drain the pool.
    assert_eq!(store.remaining_cents(1).await, Some(0));
    assert_eq!(store.remaining_cents(2).await, Some(0));
    let persisted: i64 = store
        .records_for_batch("s2")
        .await
        .iter()
        .map(|rec| rec.amount_used_cents)
        .sum();
    assert_eq!(persisted, 15_000);
}

#[tokio::test]
async fn unmatched_persists_nothing() {
    let store = MemoryMatchStore::new();
    // Candidates exist only under a different key.
    store.insert_line(1, k(6, 9, 9), 10_000).await;

    let outcome = executor(&store)
        .execute(
            vec![neg(1, k(13, 1, 1), 500)],
            BatchOptions { batch_id: Some("s0".into()), ..opts() },
        )
        .await
        .unwrap();

    assert_eq!(outcome.failed_count, 1);
    assert_eq!(outcome.results[0].status, MatchStatus::Unmatched);
    assert!(store.records_for_batch("s0").await.is_empty());
    assert_eq!(store.remaining_cents(1).await, Some(10_000));
}

#[tokio::test]
async fn independent_groups_run_apart() {
    let store = MemoryMatchStore::new();
    store.insert_line(1, k(13, 1, 1), 10_000).await;
    store.insert_line(2, k(13, 2, 1), 10_000).await;

    let outcome = executor(&store)
        .execute(
            vec![neg(1, k(13, 1, 1), 5_000), neg(2, k(13, 2, 1), 5_000)],
            BatchOptions { batch_id: Some("s4".into()), ..opts() },
        )
        .await
        .unwrap();

    assert_eq!(outcome.success_count, 2);
    assert_eq!(store.remaining_cents(1).await, Some(5_000));
    assert_eq!(store.remaining_cents(2).await, Some(5_000));
    // No allocation crosses keys.
    for rec in store.records_for_batch("s4").await {
        match rec.negative_invoice_id {
            1 => assert_eq!(rec.blue_line_id, 1),
            2 => assert_eq!(rec.blue_line_id, 2),
            other => panic!("unexpected negative {other}"),
        }
    }
}

#[tokio::test]
async fn concurrent_batches_never_oversubscribe() {
    let store = MemoryMatchStore::new();
    store.insert_line(1, k(13, 1, 1), 10_000).await;

    let ex1 = executor(&store);
    let ex2 = executor(&store);
    let (a, b) = tokio::join!(
        ex1.execute(
            vec![neg(1, k(13, 1, 1), 6_000)],
            BatchOptions { batch_id: Some("c1".into()), ..opts() },
        ),
        ex2.execute(
            vec![neg(2, k(13, 1, 1), 6_000)],
            BatchOptions { batch_id: Some("c2".into()), ..opts() },
        ),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let statuses = [a.results[0].status, b.results[0].status];
    let matched = statuses.iter().filter(|s| **s == MatchStatus::Matched).count();
    assert_eq!(matched, 1, "exactly one side wins the full 60.00");

    let remaining = store.remaining_cents(1).await.unwrap();
    assert!(remaining == 0 || remaining == 4_000, "remaining={remaining}");
    assert_balance_invariant(&store, 1, 10_000).await;

    // The loser either took the 40.00 leftover or gave up on contention.
    let loser = if a.results[0].status == MatchStatus::Matched { &b } else { &a };
    match loser.results[0].status {
        MatchStatus::Partial => {
            assert_eq!(loser.results[0].total_allocated_cents, 4_000);
            assert_eq!(loser.results[0].shortfall_cents, 2_000);
        }
        MatchStatus::Unmatched => {
            assert_eq!(
                loser.results[0].error.as_deref(),
                Some(reason::CONTENTION_EXCEEDED)
            );
        }
        MatchStatus::Matched => unreachable!(),
    }
}

#[tokio::test]
async fn streaming_bounds_candidate_window() {
    let store = MemoryMatchStore::new();
    let mut negatives = Vec::new();
    let mut line_id = 0i64;
    for g in 0..20i32 {
        let key = k(13, g, 1);
        for _ in 0..5 {
            line_id += 1;
            store.insert_line(line_id, key, 1_000).await;
        }
        for j in 0..5i64 {
            negatives.push(neg(i64::from(g) * 10 + j, key, 800));
        }
    }

    let options = BatchOptions {
        mode: ExecMode::Streaming,
        worker_count: 4,
        candidate_limit_per_group: 8,
        candidate_limit_max: 8,
        batch_id: Some("s6".into()),
        ..opts()
    };
    let mut run = executor(&store).execute_streaming(negatives, options, CancelToken::new());

    let mut streamed = 0usize;
    while let Some(result) = run.recv().await {
        assert_eq!(result.status, MatchStatus::Matched);
        streamed += 1;
    }
    let outcome = run.outcome().await.unwrap();

    assert_eq!(streamed, 100);
    assert_eq!(outcome.success_count, 100);
    assert_eq!(outcome.mode, ExecMode::Streaming);
    assert!(outcome.results.is_empty(), "streamed results are not buffered");
    // worker_count x candidate_limit is the materialization ceiling.
    assert!(
        store.peak_fetched_rows() <= 4 * 8,
        "peak={}",
        store.peak_fetched_rows()
    );
}

#[tokio::test]
async fn empty_and_invalid_inputs() {
    let store = MemoryMatchStore::new();
    store.insert_line(1, k(13, 1, 1), 1_000).await;

    let outcome = executor(&store)
        .execute(vec![], BatchOptions { batch_id: Some("e0".into()), ..opts() })
        .await
        .unwrap();
    assert_eq!(outcome.success_count + outcome.partial_count + outcome.failed_count, 0);
    assert!(outcome.results.is_empty());

    let outcome = executor(&store)
        .execute(
            vec![neg(1, k(13, 1, 1), 0)],
            BatchOptions { batch_id: Some("e1".into()), ..opts() },
        )
        .await
        .unwrap();
    assert_eq!(outcome.failed_count, 1);
    assert_eq!(outcome.results[0].error.as_deref(), Some(reason::INVALID_AMOUNT));
    assert!(store.records_for_batch("e1").await.is_empty());
    assert_eq!(store.remaining_cents(1).await, Some(1_000));
}

#[tokio::test]
async fn duplicate_negative_within_batch_rejected() {
    let store = MemoryMatchStore::new();
    store.insert_line(1, k(13, 1, 1), 1_000).await;

    let outcome = executor(&store)
        .execute(
            vec![neg(7, k(13, 1, 1), 400), neg(7, k(13, 1, 1), 400)],
            BatchOptions { batch_id: Some("d1".into()), ..opts() },
        )
        .await
        .unwrap();

    assert_eq!(outcome.success_count, 1);
    assert_eq!(outcome.failed_count, 1);
    let rejected = outcome
        .results
        .iter()
        .find(|r| r.error.is_some())
        .expect("one rejected duplicate");
    assert_eq!(rejected.error.as_deref(), Some(reason::DUPLICATE_NEGATIVE));
    assert_eq!(store.remaining_cents(1).await, Some(600));
}

#[tokio::test]
async fn duplicate_batch_id_rejected_before_work() {
    let store = MemoryMatchStore::new();
    store.insert_line(1, k(13, 1, 1), 1_000).await;
    let ex = executor(&store);

    ex.execute(
        vec![neg(1, k(13, 1, 1), 100)],
        BatchOptions { batch_id: Some("dup".into()), ..opts() },
    )
    .await
    .unwrap();

    let err = ex
        .execute(
            vec![neg(2, k(13, 1, 1), 100)],
            BatchOptions { batch_id: Some("dup".into()), ..opts() },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MatchError::DuplicateBatch { .. }));
    // The rejected run changed nothing.
    assert_eq!(store.remaining_cents(1).await, Some(900));
}

#[tokio::test]
async fn resume_processes_only_the_remainder() {
    let key = k(13, 1, 1);
    let negatives = vec![neg(1, key, 1_000), neg(2, key, 2_000)];

    // Reference: one clean run.
    let fresh = MemoryMatchStore::new();
    fresh.insert_line(1, key, 5_000).await;
    executor(&fresh)
        .execute(negatives.clone(), BatchOptions { batch_id: Some("rb".into()), ..opts() })
        .await
        .unwrap();

    // Interrupted run: negative 1 committed, then the batch failed.
    let store = MemoryMatchStore::new();
    store.insert_line(1, key, 5_000).await;
    store.admit_batch("rb", 2, false).await.unwrap();
    store.seed_record("rb", 1, 1, 1_000).await;
    store.set_batch_status("rb", "failed").await;

    let outcome = executor(&store)
        .execute(
            negatives,
            BatchOptions { batch_id: Some("rb".into()), resume: true, ..opts() },
        )
        .await
        .unwrap();

    // Only the unprocessed negative ran.
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].negative_invoice_id, 2);
    assert_eq!(outcome.results[0].status, MatchStatus::Matched);

    // Same end state as the clean run: balances and the record union.
    assert_eq!(store.remaining_cents(1).await, fresh.remaining_cents(1).await);
    let mut resumed: Vec<(i64, i64, i64)> = store
        .records_for_batch("rb")
        .await
        .iter()
        .map(|r| (r.negative_invoice_id, r.blue_line_id, r.amount_used_cents))
        .collect();
    let mut reference: Vec<(i64, i64, i64)> = fresh
        .records_for_batch("rb")
        .await
        .iter()
        .map(|r| (r.negative_invoice_id, r.blue_line_id, r.amount_used_cents))
        .collect();
    resumed.sort_unstable();
    reference.sort_unstable();
    assert_eq!(resumed, reference);
    assert_eq!(store.batch_status("rb").await.as_deref(), Some("completed"));
}

#[tokio::test]
async fn contention_exhaustion_reports_unmatched() {
    let store = MemoryMatchStore::new();
    store.insert_line(1, k(13, 1, 1), 1_000).await;
    store.induce_stale(10);

    let outcome = executor(&store)
        .execute(
            vec![neg(1, k(13, 1, 1), 400)],
            BatchOptions { batch_id: Some("st".into()), ..opts() },
        )
        .await
        .unwrap();

    assert_eq!(outcome.failed_count, 1);
    assert_eq!(
        outcome.results[0].error.as_deref(),
        Some(reason::CONTENTION_EXCEEDED)
    );
    // Default max_stale_retries = 3: initial attempt plus three restarts.
    assert_eq!(outcome.stale_retries, 4);
    assert_eq!(store.remaining_cents(1).await, Some(1_000));
    assert!(store.records_for_batch("st").await.is_empty());
}

#[tokio::test]
async fn cancelled_before_start_skips_all_groups() {
    let store = MemoryMatchStore::new();
    store.insert_line(1, k(13, 1, 1), 1_000).await;
    let cancel = CancelToken::new();
    cancel.cancel();

    let outcome = executor(&store)
        .execute_with_cancel(
            vec![neg(1, k(13, 1, 1), 400), neg(2, k(13, 2, 1), 400)],
            BatchOptions { batch_id: Some("cx".into()), ..opts() },
            cancel,
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, bluematch::BatchStatus::Cancelled);
    assert_eq!(outcome.failed_count, 2);
    for r in &outcome.results {
        assert_eq!(r.error.as_deref(), Some(reason::CANCELLED));
    }
    assert_eq!(store.remaining_cents(1).await, Some(1_000));
    assert_eq!(store.batch_status("cx").await.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn split_batches_reach_the_same_state() {
    let key_a = k(13, 1, 1);
    let key_b = k(13, 2, 1);
    let seed = |store: &MemoryMatchStore| {
        let store = store.clone();
        async move {
            store.insert_line(1, key_a, 3_000).await;
            store.insert_line(2, key_a, 1_500).await;
            store.insert_line(3, key_b, 2_000).await;
        }
    };
    let negatives = vec![
        neg(1, key_a, 1_200),
        neg(2, key_b, 900),
        neg(3, key_a, 2_500),
        neg(4, key_b, 600),
    ];

    let whole = MemoryMatchStore::new();
    seed(&whole).await;
    executor(&whole)
        .execute(negatives.clone(), BatchOptions { batch_id: Some("w".into()), ..opts() })
        .await
        .unwrap();

    let split = MemoryMatchStore::new();
    seed(&split).await;
    let ex = executor(&split);
    ex.execute(negatives[..2].to_vec(), BatchOptions { batch_id: Some("p1".into()), ..opts() })
        .await
        .unwrap();
    ex.execute(negatives[2..].to_vec(), BatchOptions { batch_id: Some("p2".into()), ..opts() })
        .await
        .unwrap();

    for line_id in 1..=3 {
        assert_eq!(
            whole.remaining_cents(line_id).await,
            split.remaining_cents(line_id).await,
            "line {line_id}"
        );
    }
}

#[tokio::test]
async fn single_worker_runs_are_identical() {
    let build = || {
        let store = MemoryMatchStore::new();
        let negatives = vec![
            neg(3, k(13, 1, 1), 700),
            neg(1, k(13, 1, 1), 700),
            neg(2, k(13, 2, 1), 300),
        ];
        (store, negatives)
    };

    let mut snapshots = Vec::new();
    for run in 0..2 {
        let (store, negatives) = build();
        store.insert_line(1, k(13, 1, 1), 1_000).await;
        store.insert_line(2, k(13, 1, 1), 1_000).await;
        store.insert_line(3, k(13, 2, 1), 1_000).await;
        let outcome = executor(&store)
            .execute(
                negatives,
                BatchOptions {
                    worker_count: 1,
                    batch_id: Some(format!("det{run}")),
                    ..opts()
                },
            )
            .await
            .unwrap();
        snapshots.push(serde_json::to_value(&outcome.results).unwrap());
    }
    assert_eq!(snapshots[0], snapshots[1]);
}
