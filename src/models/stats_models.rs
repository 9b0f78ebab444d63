// src/models/stats_models.rs
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::matching::BlockKeyKind;

/// Counters for one blocking pass, accumulated across batches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassStats {
    pub blocks_processed: usize,
    pub blocks_narrowed: usize,
    pub blocks_chunked: usize,
    pub pairs_scored: usize,
    pub edges_proposed: usize,
    pub edges_accepted: usize,
    pub mentions_needing_review: usize,
    pub entities_created: usize,
}

impl PassStats {
    pub fn absorb(&mut self, other: &PassStats) {
        self.blocks_processed += other.blocks_processed;
        self.blocks_narrowed += other.blocks_narrowed;
        self.blocks_chunked += other.blocks_chunked;
        self.pairs_scored += other.pairs_scored;
        self.edges_proposed += other.edges_proposed;
        self.edges_accepted += other.edges_accepted;
        self.mentions_needing_review += other.mentions_needing_review;
        self.entities_created += other.entities_created;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchingStats {
    pub run_id: String,
    pub epoch: u64,
    pub batches_committed: usize,
    pub commit_retries: usize,
    pub mentions_restored: usize,
    pub mentions_processed: usize,
    pub duplicate_mentions_skipped: usize,
    pub unlinkable: usize,
    pub corrupted: usize,
    pub singleton_entities: usize,
    pub pass_stats: BTreeMap<BlockKeyKind, PassStats>,
    pub matching_time: f64,
}

/// Totals reported alongside the output tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub mentions_total: usize,
    pub mentions_counted: usize,
    pub mentions_excluded: usize,
    pub mentions_needing_review: usize,
    pub canonical_entities: usize,
    pub multi_employer_groups: usize,
    pub hierarchy_nodes: usize,
    pub employer_counted_total: u64,
    pub employer_excluded_total: u64,
    pub needs_review_reported_total: u64,
    pub membership_counted_total: u64,
    pub membership_excluded_total: u64,
    pub excluded_by_reason: BTreeMap<String, u64>,
}
