// src/pipeline.rs - End-to-end run: normalize, resolve, deduplicate, aggregate, verify
use anyhow::{Context, Result};
use indicatif::MultiProgress;
use log::info;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Instant;

use crate::clustering::entity_store::CanonicalEntityRow;
use crate::consolidation::aggregator::{aggregate, verify_no_silent_drops, AggregationInput, DispositionRecord, ReviewItem};
use crate::consolidation::hierarchy::HierarchyDeduplicator;
use crate::consolidation::multi_employer::MultiEmployerDeduplicator;
use crate::matching::manager::{LinkageEngine, RunMode};
use crate::matching::normalize::Normalizer;
use crate::models::consolidation::{AggregationResult, GroupAssignment, HierarchyNode, HierarchyNodeInput, MultiEmployerGroup};
use crate::models::core::{MentionId, MentionQuality, MentionRecord, SourceMention};
use crate::models::matching::MatchEdge;
use crate::models::stats_models::{MatchingStats, RunSummary};
use crate::rules::CompiledRules;
use crate::utils::engine_config::EngineConfig;
use crate::utils::jsonl::write_jsonl;
use crate::utils::pipeline_state::RunStateStore;
use crate::utils::progress_bars::logging::{log_pipeline_completion, log_pipeline_phase, log_pipeline_start, PassLogger};
use crate::utils::progress_bars::progress_config::ProgressConfig;

#[derive(Debug, Clone, Default)]
pub struct PipelineInputs {
    pub mentions: Vec<MentionRecord>,
    pub hierarchy: Vec<HierarchyNodeInput>,
}

#[derive(Serialize)]
struct SummaryFile<'a> {
    fingerprint: String,
    summary: &'a RunSummary,
    stats: &'a MatchingStats,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub entities: Vec<CanonicalEntityRow>,
    pub edges: Vec<MatchEdge>,
    pub group_assignments: Vec<GroupAssignment>,
    pub groups: Vec<MultiEmployerGroup>,
    pub hierarchy: Vec<HierarchyNode>,
    pub entity_results: Vec<AggregationResult>,
    pub group_results: Vec<AggregationResult>,
    pub org_results: Vec<AggregationResult>,
    pub dispositions: Vec<DispositionRecord>,
    pub review_queue: Vec<ReviewItem>,
    pub summary: RunSummary,
    pub stats: MatchingStats,
}

impl PipelineOutput {
    /// SHA-256 over the canonical partition, group assignments and hierarchy classifications.
    /// Independent of run id, epoch and timing.
    pub fn fingerprint(&self) -> String {
        let mut lines: Vec<String> = Vec::with_capacity(
            self.entities.len() + self.group_assignments.len() + self.hierarchy.len(),
        );
        for e in &self.entities {
            let members: Vec<&str> = e.member_mentions.iter().map(MentionId::as_str).collect();
            lines.push(format!("E|{}|{}", e.canonical_id, members.join(",")));
        }
        for g in &self.group_assignments {
            lines.push(format!(
                "G|{}|{}|{}|{}",
                g.canonical_id,
                g.group_id,
                g.role.as_str(),
                g.exclusion_reason.map_or("-", |r| r.as_str())
            ));
        }
        for n in &self.hierarchy {
            lines.push(format!(
                "H|{}|{}|{}|{}",
                n.node_id,
                n.level.as_str(),
                n.count_in_total,
                n.exclusion_reason.map_or("-", |r| r.as_str())
            ));
        }
        lines.sort();

        let mut hasher = Sha256::new();
        for line in &lines {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Writes every output table as JSON Lines under `dir`, plus `summary.json`.
    pub fn write_tables(&self, dir: &Path) -> Result<()> {
        write_jsonl(&dir.join("canonical_entities.jsonl"), &self.entities)?;
        write_jsonl(&dir.join("match_edges.jsonl"), &self.edges)?;
        write_jsonl(&dir.join("group_assignments.jsonl"), &self.group_assignments)?;
        write_jsonl(&dir.join("multi_employer_groups.jsonl"), &self.groups)?;
        write_jsonl(&dir.join("hierarchy_nodes.jsonl"), &self.hierarchy)?;
        let results: Vec<&AggregationResult> = self
            .entity_results
            .iter()
            .chain(&self.group_results)
            .chain(&self.org_results)
            .collect();
        write_jsonl(&dir.join("aggregation_results.jsonl"), &results)?;
        write_jsonl(&dir.join("dispositions.jsonl"), &self.dispositions)?;
        write_jsonl(&dir.join("review_queue.jsonl"), &self.review_queue)?;

        let summary_path = dir.join("summary.json");
        let summary = SummaryFile {
            fingerprint: self.fingerprint(),
            summary: &self.summary,
            stats: &self.stats,
        };
        let body = serde_json::to_string_pretty(&summary).context("Failed to serialize the run summary")?;
        fs::write(&summary_path, body).with_context(|| format!("Failed to write {}", summary_path.display()))?;
        info!("💾 Output tables written to {}", dir.display());
        Ok(())
    }
}

fn normalize_all(records: &[MentionRecord], normalizer: &Normalizer<'_>) -> Vec<SourceMention> {
    let logger = PassLogger::stage("NORMALIZE", "🧹");
    let mentions: Vec<SourceMention> = records.iter().map(|r| normalizer.prepare(r)).collect();
    let unlinkable = mentions.iter().filter(|m| m.quality == MentionQuality::Unlinkable).count();
    let corrupted = mentions.iter().filter(|m| m.quality == MentionQuality::Corrupted).count();
    logger.log_data_quality_issue("names that normalize to nothing", unlinkable);
    logger.log_data_quality_issue("corrupted names", corrupted);
    logger.log_completion(&format!("{} mentions normalized", mentions.len()));
    mentions
}

#[allow(clippy::too_many_arguments)]
pub async fn run_pipeline<S: RunStateStore>(
    config: &EngineConfig,
    rules: &CompiledRules,
    store: &mut S,
    mode: RunMode,
    run_id: &str,
    inputs: PipelineInputs,
    progress: &ProgressConfig,
    multi_progress: Option<MultiProgress>,
) -> Result<PipelineOutput> {
    let start = Instant::now();
    config.validate().context("Invalid engine configuration")?;
    log_pipeline_start(
        run_id,
        mode.as_str(),
        inputs.mentions.len(),
        inputs.hierarchy.len(),
        config.worker_count,
    );

    log_pipeline_phase("Normalization", Some(&format!("rules v{}", rules.version)));
    let normalizer = Normalizer::new(rules, config.max_name_length);
    let mentions = normalize_all(&inputs.mentions, &normalizer);
    let input_ids: HashSet<MentionId> = mentions.iter().map(|m| m.id.clone()).collect();

    log_pipeline_phase("Resolution", Some(mode.as_str()));
    let mut engine = LinkageEngine::new(config, store, run_id)
        .with_progress(
            multi_progress,
            progress.should_show_memory(),
            progress.should_show_detailed(),
        );
    engine.run(mode, mentions).await.context("Entity resolution failed")?;
    let matching = engine.into_output();
    matching
        .entities
        .verify_partition(&matching.arena, &matching.edges)
        .context("Canonical partition does not match the accepted edge log")?;

    log_pipeline_phase("Multi-employer deduplication", None);
    let multi_employer = MultiEmployerDeduplicator::new(rules, config).deduplicate(&matching.arena, &matching.entities);

    log_pipeline_phase("Hierarchy deduplication", None);
    let hierarchy = HierarchyDeduplicator::new(rules, config).deduplicate(&inputs.hierarchy);

    log_pipeline_phase("Aggregation", None);
    let aggregation = aggregate(&AggregationInput {
        arena: &matching.arena,
        entities: &matching.entities,
        resolutions: &matching.resolutions,
        edges: &matching.edges,
        multi_employer: &multi_employer,
        hierarchy: &hierarchy,
    });
    aggregation.verify_conservation()?;
    verify_no_silent_drops(&input_ids, &aggregation.dispositions)?;

    let entities: Vec<CanonicalEntityRow> = matching
        .entities
        .iter()
        .map(|e| {
            matching
                .entities
                .row(&matching.arena, e, aggregation.counted_size(e.canonical_id))
        })
        .collect();

    log_pipeline_completion(start.elapsed(), &matching.stats, &aggregation.summary);

    let output = PipelineOutput {
        entities,
        edges: matching.edges,
        group_assignments: multi_employer.assignments,
        groups: multi_employer.groups,
        hierarchy: hierarchy.nodes,
        entity_results: aggregation.entity_results,
        group_results: aggregation.group_results,
        org_results: aggregation.org_results,
        dispositions: aggregation.dispositions,
        review_queue: aggregation.review_queue,
        summary: aggregation.summary,
        stats: matching.stats,
    };
    info!("🔏 Output fingerprint: {}", output.fingerprint());
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::consolidation::{Disposition, ExclusionReason, GroupRole};
    use crate::models::core::{Location, RawMention, SourceKind};
    use crate::rules::ClassificationRules;
    use crate::utils::jsonl::read_jsonl;
    use crate::utils::pipeline_state::MemoryStateStore;

    fn record(
        kind: SourceKind,
        id: &str,
        offset: u64,
        name: &str,
        state: &str,
        union: Option<&str>,
        size: Option<u64>,
    ) -> MentionRecord {
        MentionRecord {
            partition: 0,
            offset,
            mention: RawMention {
                source_kind: kind,
                source_id: id.to_string(),
                raw_name: name.to_string(),
                location: Location {
                    state: Some(state.to_string()),
                    city: Some("Oakland".to_string()),
                    street: None,
                    postal_code: None,
                },
                reported_size: size,
                group_hint: None,
                union_key: union.map(str::to_string),
                reported_on: None,
                jurisdiction: None,
            },
        }
    }

    fn inputs() -> PipelineInputs {
        use SourceKind::*;
        let mentions = vec![
            record(Filer, "1", 0, "ACME Supply, Inc.", "CA", Some("U-77"), Some(250)),
            record(CaseParticipant, "1", 0, "acme supply inc", "california", None, Some(250)),
            record(InspectionRecord, "9", 0, "Acme Supply", "CA", None, None),
            record(Filer, "2", 1, "Bay Electric", "NV", Some("X"), Some(12_000)),
            record(Filer, "3", 2, "All Signatories to Agreement X", "NV", Some("X"), Some(12_000)),
            record(Filer, "4", 3, "Coastal Wiring", "WA", Some("X"), Some(12_000)),
            record(Filer, "5", 4, "Delta Power", "OR", Some("X"), Some(12_000)),
            record(Filer, "6", 5, "Evergreen Electric", "ID", Some("X"), Some(12_000)),
            record(Filer, "7", 6, "???", "CA", None, Some(40)),
            record(Filer, "8", 7, "Acme #NAME? Supply", "CA", None, Some(55)),
            record(Filer, "2", 1, "Bay Electric", "NV", Some("X"), Some(12_000)),
        ];
        let node = |id: &str, designation: Option<&str>, size: u64, federation: bool| HierarchyNodeInput {
            node_id: id.to_string(),
            organization_key: "IBX".to_string(),
            designation: designation.map(str::to_string),
            reported_size: Some(size),
            known_federation: federation,
        };
        PipelineInputs {
            mentions,
            hierarchy: vec![
                node("fed", None, 9_000_000, true),
                node("nat", Some("NHQ"), 1_300_000, false),
                node("lu-1", Some("LU"), 400_000, false),
                node("lu-2", Some("LU"), 500_000, false),
                node("lu-3", Some("LU"), 400_000, false),
            ],
        }
    }

    fn config(batch_size: usize) -> EngineConfig {
        EngineConfig {
            batch_size,
            worker_count: 2,
            commit_retries: 0,
            ..EngineConfig::default()
        }
    }

    async fn run(config: &EngineConfig, store: &mut MemoryStateStore, mode: RunMode, inputs: PipelineInputs) -> Result<PipelineOutput> {
        let rules = ClassificationRules::default().compile().unwrap();
        let progress = ProgressConfig {
            enabled: false,
            ..ProgressConfig::default()
        };
        run_pipeline(config, &rules, store, mode, "test-run", inputs, &progress, None).await
    }

    #[tokio::test]
    async fn test_end_to_end_counts() {
        let config = config(4);
        let output = run(&config, &mut MemoryStateStore::new(), RunMode::Fresh, inputs())
            .await
            .unwrap();

        // Case and punctuation variants in the same state land in one entity.
        let acme = output
            .entities
            .iter()
            .find(|e| e.source_mention_count == 3)
            .expect("acme variants should merge");
        assert_eq!(acme.counted_size, 250);

        let secondaries = output
            .group_assignments
            .iter()
            .filter(|a| a.exclusion_reason == Some(ExclusionReason::MultiEmployerSecondary))
            .count();
        assert_eq!(secondaries, 4);
        assert!(output
            .group_assignments
            .iter()
            .any(|a| a.group_id == "X#12000" && a.role == GroupRole::Primary));

        // 250 for acme plus 12,000 for the agreement.
        assert_eq!(output.summary.employer_counted_total, 12_250);
        assert_eq!(output.summary.excluded_by_reason.get("MULTI_EMPLOYER_SECONDARY"), Some(&48_000));
        assert_eq!(output.summary.excluded_by_reason.get("UNLINKABLE"), Some(&40));
        assert_eq!(output.summary.excluded_by_reason.get("CORRUPTED_DATA"), Some(&55));
        assert_eq!(output.summary.membership_counted_total, 1_300_000);
        assert_eq!(output.stats.duplicate_mentions_skipped, 1);
    }

    #[tokio::test]
    async fn test_no_silent_drops() {
        let config = config(3);
        let output = run(&config, &mut MemoryStateStore::new(), RunMode::Fresh, inputs())
            .await
            .unwrap();
        // Eleven records, one repeated id.
        assert_eq!(output.dispositions.len(), 10);
        assert_eq!(
            output.summary.mentions_counted + output.summary.mentions_excluded + output.summary.mentions_needing_review,
            10
        );
        let corrupted = output
            .dispositions
            .iter()
            .find(|d| d.mention_id.as_str() == "filer:8")
            .map(|d| d.disposition);
        assert_eq!(corrupted, Some(Disposition::Excluded(ExclusionReason::CorruptedData)));
        assert!(output.review_queue.iter().any(|r| r.mention_id.as_str() == "filer:7"));
    }

    #[tokio::test]
    async fn test_fingerprint_is_stable() {
        let config = config(3);
        let first = run(&config, &mut MemoryStateStore::new(), RunMode::Fresh, inputs())
            .await
            .unwrap();

        let mut shuffled = inputs();
        shuffled.mentions.reverse();
        shuffled.hierarchy.reverse();
        let second = run(&config, &mut MemoryStateStore::new(), RunMode::Fresh, shuffled)
            .await
            .unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.fingerprint().len(), 64);

        let mut changed = inputs();
        changed.hierarchy.pop();
        let third = run(&config, &mut MemoryStateStore::new(), RunMode::Fresh, changed)
            .await
            .unwrap();
        assert_ne!(first.fingerprint(), third.fingerprint());
    }

    #[tokio::test]
    async fn test_tables_written_as_jsonl() {
        let config = config(4);
        let output = run(&config, &mut MemoryStateStore::new(), RunMode::Fresh, inputs())
            .await
            .unwrap();
        let dir = std::env::temp_dir().join(format!("linkage-out-{}", uuid::Uuid::new_v4()));
        output.write_tables(&dir).unwrap();

        let rows: Vec<CanonicalEntityRow> = read_jsonl(&dir.join("canonical_entities.jsonl")).unwrap();
        assert_eq!(rows, output.entities);
        let ledger: Vec<DispositionRecord> = read_jsonl(&dir.join("dispositions.jsonl")).unwrap();
        assert_eq!(ledger, output.dispositions);
        let results: Vec<AggregationResult> = read_jsonl(&dir.join("aggregation_results.jsonl")).unwrap();
        assert_eq!(
            results.len(),
            output.entity_results.len() + output.group_results.len() + output.org_results.len()
        );
        assert!(dir.join("summary.json").exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_resumed_run_reproduces_fresh_fingerprint() {
        let config = config(3);
        let fresh = run(&config, &mut MemoryStateStore::new(), RunMode::Fresh, inputs())
            .await
            .unwrap();

        let mut store = MemoryStateStore::new();
        store.inject_failures(2, 1);
        assert!(run(&config, &mut store, RunMode::Fresh, inputs()).await.is_err());
        store.clear_failures();
        let resumed = run(&config, &mut store, RunMode::Resume, inputs()).await.unwrap();

        assert_eq!(resumed.stats.epoch, 1);
        assert!(resumed.stats.mentions_restored > 0);
        assert_eq!(resumed.fingerprint(), fresh.fingerprint());
        assert_eq!(resumed.summary, fresh.summary);
    }
}
