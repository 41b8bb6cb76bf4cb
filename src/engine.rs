use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Monetary amounts are integer hundredths (scale 2). Decimals exist only at
/// the store boundary.
pub type Cents = i64;

/// The compound key partitioning blue lines and negatives into independent
/// matching units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub tax_rate: i16,
    pub buyer_id: i32,
    pub seller_id: i32,
}

impl GroupKey {
    pub fn new(tax_rate: i16, buyer_id: i32, seller_id: i32) -> Self {
        Self { tax_rate, buyer_id, seller_id }
    }
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.tax_rate, self.buyer_id, self.seller_id)
    }
}

/// A candidate blue line as seen by the allocator: identity, key, and the
/// unconsumed balance at fetch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueLine {
    pub line_id: i64,
    pub key: GroupKey,
    pub remaining_cents: Cents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegativeInvoice {
    pub negative_invoice_id: i64,
    pub key: GroupKey,
    pub amount_cents: Cents,
    pub priority: i32,
}

impl NegativeInvoice {
    pub fn new(negative_invoice_id: i64, key: GroupKey, amount_cents: Cents) -> Self {
        Self { negative_invoice_id, key, amount_cents, priority: 0 }
    }
}

/// One (negative, blue line, amount) triple. A negative may produce many.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub negative_invoice_id: i64,
    pub blue_line_id: i64,
    pub amount_used_cents: Cents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Matched,
    Partial,
    Unmatched,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub negative_invoice_id: i64,
    pub status: MatchStatus,
    pub allocations: Vec<Allocation>,
    pub total_allocated_cents: Cents,
    pub shortfall_cents: Cents,
    pub error: Option<String>,
}

impl MatchResult {
    /// Result for a negative that never reached allocation (validation
    /// failure, cancelled group, exhausted retries).
    pub(crate) fn failed(negative_invoice_id: i64, amount_cents: Cents, reason: &str) -> Self {
        Self {
            negative_invoice_id,
            status: MatchStatus::Unmatched,
            allocations: Vec::new(),
            total_allocated_cents: 0,
            shortfall_cents: amount_cents,
            error: Some(reason.to_string()),
        }
    }
}

/// Ordering applied to negatives within a group before allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegativeOrder {
    AmountDesc,
    AmountAsc,
    PriorityDesc,
}

impl NegativeOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "amount_desc" => Some(Self::AmountDesc),
            "amount_asc" => Some(Self::AmountAsc),
            "priority_desc" => Some(Self::PriorityDesc),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AmountDesc => "amount_desc",
            Self::AmountAsc => "amount_asc",
            Self::PriorityDesc => "priority_desc",
        }
    }
}

/// Ordering of the candidate window returned by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateOrder {
    RemainingAsc,
    RemainingDesc,
    LineIdAsc,
}

impl CandidateOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "remaining_asc" => Some(Self::RemainingAsc),
            "remaining_desc" => Some(Self::RemainingDesc),
            "line_id_asc" => Some(Self::LineIdAsc),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RemainingAsc => "remaining_asc",
            Self::RemainingDesc => "remaining_desc",
            Self::LineIdAsc => "line_id_asc",
        }
    }
}

/// Sort candidates the way the store's index-ordered scan would return them.
/// Ties break by `line_id` ascending so plans are deterministic.
pub fn sort_candidates(candidates: &mut [BlueLine], order: CandidateOrder) {
    match order {
        CandidateOrder::RemainingAsc => candidates.sort_by(|a, b| {
            a.remaining_cents
                .cmp(&b.remaining_cents)
                .then(a.line_id.cmp(&b.line_id))
        }),
        CandidateOrder::RemainingDesc => candidates.sort_by(|a, b| {
            b.remaining_cents
                .cmp(&a.remaining_cents)
                .then(a.line_id.cmp(&b.line_id))
        }),
        CandidateOrder::LineIdAsc => candidates.sort_by(|a, b| a.line_id.cmp(&b.line_id)),
    }
}

/// Output of one group allocation: per-negative results in the original
/// input order, the per-line decrement map (ascending `line_id`), and the
/// number of fragments the plan would leave behind.
#[derive(Debug, Clone)]
pub struct AllocationPlan {
    pub results: Vec<MatchResult>,
    pub decrements: Vec<(i64, Cents)>,
    pub fragment_created: u64,
}

impl AllocationPlan {
    /// True when every negative in the plan is fully covered.
    pub fn fully_matched(&self) -> bool {
        self.results.iter().all(|r| r.status == MatchStatus::Matched)
    }

    /// All allocations that will be persisted (matched and partial results).
    pub fn allocations(&self) -> Vec<Allocation> {
        self.results
            .iter()
            .flat_map(|r| r.allocations.iter().cloned())
            .collect()
    }
}

fn negative_sort_key(order: NegativeOrder, a: &NegativeInvoice, b: &NegativeInvoice) -> std::cmp::Ordering {
    let primary = match order {
        NegativeOrder::AmountDesc => b.amount_cents.cmp(&a.amount_cents),
        NegativeOrder::AmountAsc => a.amount_cents.cmp(&b.amount_cents),
        NegativeOrder::PriorityDesc => b
            .priority
            .cmp(&a.priority)
            .then(b.amount_cents.cmp(&a.amount_cents)),
    };
    primary.then(a.negative_invoice_id.cmp(&b.negative_invoice_id))
}

/// Greedy allocation over one key-group.
///
/// `candidates` must already be in provider order (see [`sort_candidates`]);
/// the allocator walks them with a single cursor, never revisiting an
/// exhausted line. Negatives are processed in `order` with a stable
/// `negative_invoice_id` tiebreak, and results come back in the original
/// input order. Pure: no I/O, no locks, exact integer arithmetic.
pub fn allocate(
    negatives: &[NegativeInvoice],
    candidates: &[BlueLine],
    order: NegativeOrder,
    fragment_threshold_cents: Cents,
) -> AllocationPlan {
    let mut idx: Vec<usize> = (0..negatives.len()).collect();
    idx.sort_by(|&a, &b| negative_sort_key(order, &negatives[a], &negatives[b]));

    let mut working: Vec<Cents> = candidates.iter().map(|c| c.remaining_cents).collect();
    let mut touched = vec![false; candidates.len()];
    let mut cursor = 0usize;
    let mut results: Vec<Option<MatchResult>> = (0..negatives.len()).map(|_| None).collect();

    for &i in &idx {
        let neg = &negatives[i];
        let demand = neg.amount_cents.max(0);
        let mut need = demand;
        let mut allocations = Vec::new();

        while need > 0 && cursor < candidates.len() {
            if working[cursor] <= 0 {
                cursor += 1;
                continue;
            }
            let use_cents = need.min(working[cursor]);
            allocations.push(Allocation {
                negative_invoice_id: neg.negative_invoice_id,
                blue_line_id: candidates[cursor].line_id,
                amount_used_cents: use_cents,
            });
            working[cursor] -= use_cents;
            touched[cursor] = true;
            need -= use_cents;
            if working[cursor] == 0 {
                cursor += 1;
            }
        }

        let total = demand - need;
        let status = if need == 0 && demand > 0 {
            MatchStatus::Matched
        } else if total > 0 {
            MatchStatus::Partial
        } else {
            MatchStatus::Unmatched
        };
        results[i] = Some(MatchResult {
            negative_invoice_id: neg.negative_invoice_id,
            status,
            allocations,
            total_allocated_cents: total,
            shortfall_cents: need,
            error: None,
        });
    }

    let results: Vec<MatchResult> = results.into_iter().flatten().collect();

    let mut decrements: BTreeMap<i64, Cents> = BTreeMap::new();
    for r in &results {
        for a in &r.allocations {
            *decrements.entry(a.blue_line_id).or_insert(0) += a.amount_used_cents;
        }
    }

    let fragment_created = working
        .iter()
        .zip(touched.iter())
        .filter(|(w, t)| **t && **w > 0 && **w < fragment_threshold_cents)
        .count() as u64;

    AllocationPlan {
        results,
        decrements: decrements.into_iter().collect(),
        fragment_created,
    }
}

/// Partition negatives by key. Groups come back ordered by descending
/// aggregate magnitude (largest demand first), key ascending on ties, so a
/// warm candidate cache serves the heaviest groups earliest.
pub fn group_negatives(negatives: &[NegativeInvoice]) -> Vec<(GroupKey, Vec<NegativeInvoice>)> {
    let mut by_key: HashMap<GroupKey, Vec<NegativeInvoice>> = HashMap::new();
    for n in negatives {
        by_key.entry(n.key).or_default().push(n.clone());
    }
    let mut groups: Vec<(GroupKey, Vec<NegativeInvoice>)> = by_key.into_iter().collect();
    groups.sort_by(|(ka, va), (kb, vb)| {
        let ta: Cents = va.iter().map(|n| n.amount_cents).sum();
        let tb: Cents = vb.iter().map(|n| n.amount_cents).sum();
        tb.cmp(&ta).then(ka.cmp(kb))
    });
    groups
}
