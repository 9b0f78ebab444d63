// src/utils/progress_bars/logging.rs - Logging helpers for resolution passes and pipeline phases
use log::{debug, info, warn};
use std::time::{Duration, Instant};

use crate::models::matching::BlockKeyKind;
use crate::models::stats_models::{MatchingStats, PassStats, RunSummary};

#[derive(Clone)]
pub struct PassLogger {
    pass_name: &'static str,
    pass_emoji: &'static str,
    start_time: Instant,
}

impl PassLogger {
    pub fn new(kind: BlockKeyKind) -> Self {
        let (pass_name, pass_emoji) = match kind {
            BlockKeyKind::StatePrefix4 => ("STATE+4", "🔤"),
            BlockKeyKind::StatePrefix3 => ("STATE+3", "🔡"),
            BlockKeyKind::StreetZip => ("STREET+ZIP", "📍"),
        };
        Self {
            pass_name,
            pass_emoji,
            start_time: Instant::now(),
        }
    }

    /// Logger for a non-blocking stage (normalization, deduplication, aggregation).
    pub fn stage(pass_name: &'static str, pass_emoji: &'static str) -> Self {
        Self {
            pass_name,
            pass_emoji,
            start_time: Instant::now(),
        }
    }

    pub fn log_start(&self, batch_num: usize, mentions: usize) {
        debug!(
            "[{}] {} 🚀 Batch {}: resolving {} pending mentions",
            self.pass_name, self.pass_emoji, batch_num, mentions
        );
    }

    pub fn log_phase(&self, phase: &str, details: Option<&str>) {
        let elapsed = self.start_time.elapsed();
        match details {
            Some(details) => info!(
                "[{}] {} 🔄 Phase: {} - {} [+{:.1}s]",
                self.pass_name,
                self.pass_emoji,
                phase,
                details,
                elapsed.as_secs_f32()
            ),
            None => info!(
                "[{}] {} 🔄 Phase: {} [+{:.1}s]",
                self.pass_name,
                self.pass_emoji,
                phase,
                elapsed.as_secs_f32()
            ),
        }
    }

    pub fn log_blocks_planned(&self, blocks: usize, narrowed: usize, chunked: usize) {
        debug!(
            "[{}] {} 🧱 {} blocks planned ({} narrowed, {} chunked)",
            self.pass_name, self.pass_emoji, blocks, narrowed, chunked
        );
    }

    pub fn log_block_overflow(&self, block_key: &str, size: usize, max_block_size: usize) {
        warn!(
            "[{}] {} ⚠️  Block '{}' still holds {} mentions after narrowing (limit {}); chunking by mention id",
            self.pass_name, self.pass_emoji, block_key, size, max_block_size
        );
    }

    pub fn log_pass_complete(&self, stats: &PassStats) {
        debug!(
            "[{}] {} ✅ {} blocks, {} pairs scored, {} proposed → {} accepted, {} need review [{:.2?}]",
            self.pass_name,
            self.pass_emoji,
            stats.blocks_processed,
            stats.pairs_scored,
            stats.edges_proposed,
            stats.edges_accepted,
            stats.mentions_needing_review,
            self.start_time.elapsed()
        );
    }

    pub fn log_data_quality_issue(&self, issue_type: &str, count: usize) {
        if count > 0 {
            warn!(
                "[{}] {} ⚠️  Data quality: {} instances of {}",
                self.pass_name, self.pass_emoji, count, issue_type
            );
        }
    }

    pub fn log_completion(&self, summary: &str) {
        info!(
            "[{}] {} 🎉 COMPLETED in {:.2?}: {}",
            self.pass_name,
            self.pass_emoji,
            self.start_time.elapsed(),
            summary
        );
    }
}

// Pipeline-level logging functions
pub fn log_pipeline_start(run_id: &str, mode: &str, mention_count: usize, node_count: usize, worker_count: usize) {
    info!("🚀 ===== UNION LINKAGE PIPELINE STARTING =====");
    info!("📅 Run ID: {} (mode: {})", run_id, mode);
    info!("⚙️  Configuration:");
    info!("   • {} input mentions, {} hierarchy filings", mention_count, node_count);
    info!("   • Block workers: {}", worker_count);
    info!("🎯 Passes: state+4 🔤, state+3 🔡, street+zip 📍");
    info!("================================================");
}

pub fn log_pipeline_phase(phase: &str, details: Option<&str>) {
    match details {
        Some(details) => info!("🔄 Pipeline Phase: {} - {}", phase, details),
        None => info!("🔄 Pipeline Phase: {}", phase),
    }
}

pub fn log_batch_committed(batch_num: usize, total_batches: usize, mentions: usize, edges: usize, memory_mb: Option<u64>) {
    if batch_num % 5 == 0 || batch_num == 1 || batch_num == total_batches {
        match memory_mb {
            Some(mb) => info!(
                "📦 Batch {}/{} committed: {} mentions, {} edges (memory: {} MB)",
                batch_num, total_batches, mentions, edges, mb
            ),
            None => info!(
                "📦 Batch {}/{} committed: {} mentions, {} edges",
                batch_num, total_batches, mentions, edges
            ),
        }
    }
}

pub fn log_pipeline_completion(duration: Duration, stats: &MatchingStats, summary: &RunSummary) {
    info!("🎉 ===== UNION LINKAGE PIPELINE COMPLETED =====");
    info!("📅 Run ID: {} (epoch {})", stats.run_id, stats.epoch);
    info!("⏱️  Total Duration: {:.2?}", duration);
    info!(
        "🧩 {} mentions → {} canonical entities in {} batches",
        summary.mentions_total, summary.canonical_entities, stats.batches_committed
    );
    info!("");
    info!("📈 Pass Breakdown:");
    for (kind, pass) in &stats.pass_stats {
        info!(
            "   • {}: {} accepted of {} proposed, {} need review",
            kind.as_str(),
            pass.edges_accepted,
            pass.edges_proposed,
            pass.mentions_needing_review
        );
    }
    info!("");
    info!(
        "👷 Workers: {} counted, {} excluded, {} held for review",
        summary.employer_counted_total, summary.employer_excluded_total, summary.needs_review_reported_total
    );
    info!(
        "🏛️  Members: {} counted, {} excluded across {} hierarchy nodes",
        summary.membership_counted_total, summary.membership_excluded_total, summary.hierarchy_nodes
    );
    for (reason, total) in &summary.excluded_by_reason {
        info!("   • {}: {}", reason, total);
    }
    if summary.mentions_needing_review > 0 {
        warn!(
            "⚠️  {} mentions need manual review and were not counted",
            summary.mentions_needing_review
        );
    }
    info!("================================================");
}
