// src/matching/manager.rs - Micro-batched resolution: block fan-out, serialized id allocation,
// transactional commit and checkpoint-driven resumption.
use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use indicatif::{MultiProgress, ProgressBar};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

use crate::clustering::entity_store::EntityStore;
use crate::matching::blocking::BlockingIndex;
use crate::matching::resolver::{
    resolve_block, BlockMember, BlockOutcome, BlockWork, EntityRef, MemberState, ProposedTarget,
    ResolveParams,
};
use crate::matching::similarity::{Comparable, SimilarityScorer};
use crate::models::core::{CanonicalId, MentionArena, MentionIdx, MentionQuality, SourceKind, SourceMention};
use crate::models::matching::{BlockKeyKind, EdgeTarget, MatchEdge, Resolution};
use crate::models::stats_models::{MatchingStats, PassStats};
use crate::utils::engine_config::EngineConfig;
use crate::utils::get_memory_usage;
use crate::utils::pipeline_state::{BatchCommit, Checkpoint, EntityDelta, RunStateStore, StoredResolution};
use crate::utils::progress_bars::logging::{log_batch_committed, PassLogger};
use crate::utils::progress_bars::progress_config::add_bar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Discard persisted state and start at epoch 0.
    Fresh,
    /// Restore everything at or below the stored checkpoints and continue.
    Resume,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Fresh => "fresh",
            RunMode::Resume => "resume",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "fresh" => Some(RunMode::Fresh),
            "resume" => Some(RunMode::Resume),
            _ => None,
        }
    }
}

/// Everything resolution produced, handed to the deduplicators.
#[derive(Debug)]
pub struct MatchingOutput {
    pub arena: MentionArena,
    pub entities: EntityStore,
    pub resolutions: HashMap<MentionIdx, Resolution>,
    /// Audit log in sequence order.
    pub edges: Vec<MatchEdge>,
    pub stats: MatchingStats,
}

/// Mutations of one batch, invisible until the commit succeeds.
#[derive(Debug, Default)]
struct StagedBatch {
    resolutions: BTreeMap<MentionIdx, Resolution>,
    assigned: HashMap<MentionIdx, CanonicalId>,
    /// Linked mentions of this batch in assignment order.
    linked: Vec<MentionIdx>,
    new_members: BTreeMap<CanonicalId, Vec<MentionIdx>>,
    needs_review: HashSet<MentionIdx>,
    edges: Vec<MatchEdge>,
    next_canonical_id: u64,
    pass_stats: BTreeMap<BlockKeyKind, PassStats>,
    singletons: usize,
}

impl StagedBatch {
    fn allocate(&mut self) -> CanonicalId {
        let id = CanonicalId(self.next_canonical_id);
        self.next_canonical_id += 1;
        id
    }

    fn assign(&mut self, idx: MentionIdx, canonical_id: CanonicalId) {
        self.assigned.insert(idx, canonical_id);
        self.linked.push(idx);
        self.new_members.entry(canonical_id).or_default().push(idx);
        self.resolutions.insert(idx, Resolution::Linked(canonical_id));
    }

    fn is_settled(&self, idx: MentionIdx) -> bool {
        self.assigned.contains_key(&idx) || self.needs_review.contains(&idx)
    }
}

pub struct LinkageEngine<'a, S: RunStateStore> {
    config: &'a EngineConfig,
    store: &'a mut S,
    run_id: String,
    multi_progress: Option<MultiProgress>,
    show_memory: bool,
    show_pass_bars: bool,
    arena: MentionArena,
    resolutions: HashMap<MentionIdx, Resolution>,
    entities: EntityStore,
    index: BlockingIndex,
    edges: Vec<MatchEdge>,
    checkpoints: BTreeMap<(SourceKind, u32), Checkpoint>,
    next_canonical_id: u64,
    next_edge_seq: u64,
    epoch: u64,
    batch_num: usize,
    stats: MatchingStats,
}

impl<'a, S: RunStateStore> LinkageEngine<'a, S> {
    pub fn new(config: &'a EngineConfig, store: &'a mut S, run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        Self {
            config,
            store,
            stats: MatchingStats {
                run_id: run_id.clone(),
                ..MatchingStats::default()
            },
            run_id,
            multi_progress: None,
            show_memory: false,
            show_pass_bars: false,
            arena: MentionArena::new(),
            resolutions: HashMap::new(),
            entities: EntityStore::new(),
            index: BlockingIndex::new(),
            edges: Vec::new(),
            checkpoints: BTreeMap::new(),
            next_canonical_id: 1,
            next_edge_seq: 0,
            epoch: 0,
            batch_num: 0,
        }
    }

    /// `show_pass_bars` adds a sub-bar per pass that counts resolved blocks.
    pub fn with_progress(mut self, multi_progress: Option<MultiProgress>, show_memory: bool, show_pass_bars: bool) -> Self {
        self.multi_progress = multi_progress;
        self.show_memory = show_memory;
        self.show_pass_bars = show_pass_bars;
        self
    }

    fn pass_bar(&self, kind: BlockKeyKind, blocks: usize) -> Option<ProgressBar> {
        if !self.show_pass_bars {
            return None;
        }
        add_bar(self.multi_progress.as_ref(), blocks as u64, &format!("{} blocks", kind.as_str()))
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn committed_mentions(&self) -> usize {
        self.arena.len()
    }

    /// Resolves `mentions` into canonical entities, committing one micro-batch at a time.
    ///
    /// Mentions are processed in (source kind, partition, offset, id) order so that batch
    /// boundaries, and therefore results, do not depend on delivery order or on resumption.
    pub async fn run(&mut self, mode: RunMode, mentions: Vec<SourceMention>) -> Result<()> {
        let start = Instant::now();
        let mentions = self.order_and_dedup(mentions);
        let pending = self.prepare_state(mode, mentions).await?;

        let total_batches = pending.len().div_ceil(self.config.batch_size);
        info!(
            "🧮 Resolving {} pending mentions in {} batches of up to {} (epoch {}, {} restored)",
            pending.len(),
            total_batches,
            self.config.batch_size,
            self.epoch,
            self.stats.mentions_restored
        );
        let batch_pb = add_bar(self.multi_progress.as_ref(), total_batches as u64, "Resolving batches");

        let mut pending = pending.into_iter();
        for batch_index in 0..total_batches {
            let batch: Vec<SourceMention> = pending.by_ref().take(self.config.batch_size).collect();
            self.process_batch(batch, batch_index + 1, total_batches)
                .await
                .with_context(|| format!("Batch {}/{} aborted", batch_index + 1, total_batches))?;
            if let Some(pb) = &batch_pb {
                pb.inc(1);
            }
        }

        if let Some(pb) = batch_pb {
            pb.finish_with_message("Resolution complete");
        }
        for (kind, pass) in &self.stats.pass_stats {
            PassLogger::new(*kind).log_completion(&format!(
                "{} blocks, {} pairs, {} edges accepted, {} entities created",
                pass.blocks_processed, pass.pairs_scored, pass.edges_accepted, pass.entities_created
            ));
        }
        self.stats.matching_time += start.elapsed().as_secs_f64();
        Ok(())
    }

    pub fn into_output(self) -> MatchingOutput {
        MatchingOutput {
            arena: self.arena,
            entities: self.entities,
            resolutions: self.resolutions,
            edges: self.edges,
            stats: self.stats,
        }
    }

    fn order_and_dedup(&mut self, mut mentions: Vec<SourceMention>) -> Vec<SourceMention> {
        mentions.sort_by(|a, b| {
            (a.source_kind, a.partition, a.offset, &a.id).cmp(&(b.source_kind, b.partition, b.offset, &b.id))
        });
        let mut seen = HashSet::new();
        let before = mentions.len();
        mentions.retain(|m| seen.insert(m.id.clone()));
        let skipped = before - mentions.len();
        if skipped > 0 {
            warn!("⚠️  Skipped {} repeated mention ids; the first delivery of each was kept", skipped);
        }
        self.stats.duplicate_mentions_skipped += skipped;
        mentions
    }

    /// Resets or restores persisted state and returns the mentions that still need resolving.
    async fn prepare_state(&mut self, mode: RunMode, mentions: Vec<SourceMention>) -> Result<Vec<SourceMention>> {
        match mode {
            RunMode::Fresh => {
                self.store.reset().await.context("Failed to reset run state")?;
                self.epoch = 0;
                self.stats.epoch = 0;
                return Ok(mentions);
            }
            RunMode::Resume => {}
        }

        let checkpoints = self.store.load_checkpoints().await.context("Failed to load checkpoints")?;
        self.epoch = checkpoints.iter().map(|c| c.epoch + 1).max().unwrap_or(0);
        self.stats.epoch = self.epoch;
        for cp in checkpoints {
            self.checkpoints.insert((cp.source_kind, cp.partition), cp);
        }
        let stored: HashMap<_, _> = self
            .store
            .load_resolutions()
            .await
            .context("Failed to load committed resolutions")?
            .into_iter()
            .map(|r| (r.mention_id, r.resolution))
            .collect();

        let mut pending = Vec::new();
        let mut unresolved_below_checkpoint = 0usize;
        for mention in mentions {
            let covered = self
                .checkpoints
                .get(&(mention.source_kind, mention.partition))
                .is_some_and(|cp| mention.offset <= cp.last_offset);
            match (covered, stored.get(&mention.id).copied()) {
                (true, Some(resolution)) => self.restore(mention, resolution),
                (true, None) => {
                    unresolved_below_checkpoint += 1;
                    pending.push(mention);
                }
                (false, _) => pending.push(mention),
            }
        }
        if unresolved_below_checkpoint > 0 {
            warn!(
                "⚠️  {} mentions are below their checkpoint but have no committed resolution; re-resolving them",
                unresolved_below_checkpoint
            );
        }

        let restored_ids: HashSet<_> = self.arena.iter().map(|(_, m)| m.id.clone()).collect();
        let edges = self.store.load_edges().await.context("Failed to load the edge log")?;
        let total_edges = edges.len();
        self.next_edge_seq = edges.iter().map(|e| e.seq + 1).max().unwrap_or(0);
        self.edges = edges.into_iter().filter(|e| restored_ids.contains(&e.mention)).collect();
        if self.edges.len() < total_edges {
            warn!(
                "⚠️  Ignored {} stored edges whose mentions are not part of this input",
                total_edges - self.edges.len()
            );
        }
        self.next_canonical_id = self.entities.max_canonical_id().map_or(1, |id| id.0 + 1);

        info!(
            "♻️  Resumed at epoch {}: {} mentions restored into {} entities, {} edges, {} checkpoints",
            self.epoch,
            self.stats.mentions_restored,
            self.entities.len(),
            self.edges.len(),
            self.checkpoints.len()
        );
        Ok(pending)
    }

    fn restore(&mut self, mention: SourceMention, resolution: Resolution) {
        let Some(idx) = self.arena.push(mention) else {
            return;
        };
        if let Resolution::Linked(canonical_id) = resolution {
            self.entities.add_member(canonical_id, idx);
            self.index.insert(idx, self.arena.get(idx));
        }
        self.resolutions.insert(idx, resolution);
        self.stats.mentions_restored += 1;
    }

    async fn process_batch(&mut self, batch: Vec<SourceMention>, batch_num: usize, total_batches: usize) -> Result<()> {
        let mark = self.arena.len();
        let mut batch_idx = Vec::with_capacity(batch.len());
        for mention in batch {
            if let Some(idx) = self.arena.push(mention) {
                batch_idx.push(idx);
            }
        }

        let result = self.stage_and_commit(&batch_idx, batch_num, total_batches).await;
        if result.is_err() {
            self.arena.truncate(mark);
        }
        result
    }

    async fn stage_and_commit(&mut self, batch_idx: &[MentionIdx], batch_num: usize, total_batches: usize) -> Result<()> {
        let mut staged = StagedBatch {
            next_canonical_id: self.next_canonical_id,
            ..StagedBatch::default()
        };

        let mut linkable = Vec::with_capacity(batch_idx.len());
        for &idx in batch_idx {
            match self.arena.get(idx).quality {
                MentionQuality::Linkable => linkable.push(idx),
                MentionQuality::Unlinkable => {
                    staged.resolutions.insert(idx, Resolution::Unlinkable);
                }
                MentionQuality::Corrupted => {
                    staged.resolutions.insert(idx, Resolution::Corrupted);
                }
            }
        }

        for kind in BlockKeyKind::PASSES {
            let pending: Vec<MentionIdx> = linkable.iter().copied().filter(|&idx| !staged.is_settled(idx)).collect();
            if pending.is_empty() {
                continue;
            }
            self.run_pass(kind, &pending, &mut staged, batch_num).await?;
        }

        // Whatever no pass could link seeds its own entity, in mention-id order.
        let mut unmatched: Vec<MentionIdx> = linkable.into_iter().filter(|&idx| !staged.is_settled(idx)).collect();
        unmatched.sort_by(|a, b| self.arena.get(*a).id.cmp(&self.arena.get(*b).id));
        for idx in unmatched {
            let canonical_id = staged.allocate();
            staged.assign(idx, canonical_id);
            staged.singletons += 1;
        }

        let commit = self.build_commit(&staged, batch_idx, batch_num);
        self.commit_with_retries(&commit).await?;
        self.apply(staged, commit, batch_idx);

        let memory = if self.show_memory {
            Some(get_memory_usage().await)
        } else {
            None
        };
        log_batch_committed(
            batch_num,
            total_batches,
            batch_idx.len(),
            self.edges.len(),
            memory,
        );
        Ok(())
    }

    async fn run_pass(
        &mut self,
        kind: BlockKeyKind,
        pending: &[MentionIdx],
        staged: &mut StagedBatch,
        batch_num: usize,
    ) -> Result<()> {
        let logger = PassLogger::new(kind);
        logger.log_start(batch_num, pending.len());

        let plan = self.index.plan_blocks(
            kind,
            &self.arena,
            pending,
            &staged.linked,
            self.config.max_block_size,
            self.config.max_prefix_len,
        );
        logger.log_blocks_planned(plan.blocks.len(), plan.narrowed, plan.chunked);
        for (key, size) in &plan.overflow {
            logger.log_block_overflow(key, *size, self.config.max_block_size);
        }

        let works: Vec<BlockWork> = plan
            .blocks
            .iter()
            .map(|block| BlockWork {
                kind,
                key: block.key.clone(),
                members: block.members.iter().map(|&idx| self.block_member(idx, staged)).collect(),
            })
            .collect();

        let params = ResolveParams {
            threshold: self.config.threshold_for(kind),
            scorer: SimilarityScorer::new(self.config.city_boost),
        };
        let pass_pb = self.pass_bar(kind, works.len());
        let mut outcomes = self.resolve_concurrently(works, params, pass_pb.as_ref()).await?;
        if let Some(pb) = pass_pb {
            pb.finish_and_clear();
        }
        outcomes.sort_by(|a, b| a.key.cmp(&b.key));

        let mut pass_stats = PassStats {
            blocks_narrowed: plan.narrowed,
            blocks_chunked: plan.chunked,
            ..PassStats::default()
        };
        for outcome in outcomes {
            pass_stats.absorb(&outcome.stats);
            self.apply_outcome(outcome, staged);
        }
        logger.log_pass_complete(&pass_stats);
        staged.pass_stats.entry(kind).or_default().absorb(&pass_stats);
        Ok(())
    }

    fn block_member(&self, idx: MentionIdx, staged: &StagedBatch) -> BlockMember {
        let mention = self.arena.get(idx);
        let linked_to = staged
            .assigned
            .get(&idx)
            .copied()
            .or_else(|| self.entities.entity_of(idx));
        let state = match linked_to {
            Some(canonical_id) => MemberState::Linked {
                canonical_id,
                entity_size: self.entities.size(canonical_id)
                    + staged.new_members.get(&canonical_id).map_or(0, Vec::len),
            },
            None => MemberState::Pending,
        };
        BlockMember {
            idx,
            id: mention.id.clone(),
            comparable: Comparable::from_mention(mention),
            state,
        }
    }

    /// Fans blocks out to blocking workers, at most `worker_count` at a time.
    async fn resolve_concurrently(
        &self,
        works: Vec<BlockWork>,
        params: ResolveParams,
        pass_pb: Option<&ProgressBar>,
    ) -> Result<Vec<BlockOutcome>> {
        let semaphore = Arc::new(Semaphore::new(self.config.worker_count.max(1)));
        let mut handles = Vec::with_capacity(works.len());
        for work in works {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("Block worker semaphore closed")?;
            let pb = pass_pb.cloned();
            handles.push(tokio::task::spawn_blocking(move || {
                let outcome = resolve_block(work, params);
                drop(permit);
                if let Some(pb) = pb {
                    pb.inc(1);
                }
                outcome
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for joined in join_all(handles).await {
            outcomes.push(joined.context("Block resolution task failed")?);
        }
        Ok(outcomes)
    }

    /// Turns block-local results into staged assignments, allocating ids for new entities.
    fn apply_outcome(&self, outcome: BlockOutcome, staged: &mut StagedBatch) {
        let provisional: Vec<CanonicalId> = (0..outcome.provisional_entities).map(|_| staged.allocate()).collect();
        let resolve = |entity: EntityRef| match entity {
            EntityRef::Committed(id) => id,
            EntityRef::Provisional(k) => provisional[k],
        };

        for (idx, entity) in outcome.assignments {
            staged.assign(idx, resolve(entity));
        }
        for idx in outcome.needs_review {
            staged.needs_review.insert(idx);
            staged.resolutions.insert(idx, Resolution::NeedsReview);
        }
        for edge in outcome.edges {
            let target = match edge.target {
                ProposedTarget::Entity(entity) => EdgeTarget::Entity(resolve(entity)),
                ProposedTarget::Mention(_, id) => EdgeTarget::Mention(id),
            };
            staged.edges.push(MatchEdge {
                seq: 0,
                mention: self.arena.get(edge.mention).id.clone(),
                target,
                method: edge.method,
                score: edge.score,
                state: edge.state,
                block_kind: outcome.kind,
                block_key: outcome.key.clone(),
            });
        }
    }

    fn build_commit(&self, staged: &StagedBatch, batch_idx: &[MentionIdx], batch_num: usize) -> BatchCommit {
        let mut resolutions: Vec<StoredResolution> = staged
            .resolutions
            .iter()
            .map(|(&idx, &resolution)| StoredResolution {
                mention_id: self.arena.get(idx).id.clone(),
                resolution,
            })
            .collect();
        resolutions.sort_by(|a, b| a.mention_id.cmp(&b.mention_id));

        let edges = staged
            .edges
            .iter()
            .enumerate()
            .map(|(i, edge)| MatchEdge {
                seq: self.next_edge_seq + i as u64,
                ..edge.clone()
            })
            .collect();

        let entities = staged
            .new_members
            .iter()
            .map(|(&canonical_id, added)| {
                let committed = self.entities.get(canonical_id);
                let seed = committed
                    .and_then(|e| e.seed())
                    .into_iter()
                    .chain(added.iter().copied())
                    .min();
                EntityDelta {
                    canonical_id,
                    display_name: seed
                        .map(|idx| self.arena.get(idx).raw_name.trim().to_string())
                        .unwrap_or_default(),
                    mention_count: committed.map_or(0, |e| e.members.len()) + added.len(),
                }
            })
            .collect();

        let mut offsets: BTreeMap<(SourceKind, u32), u64> = BTreeMap::new();
        for &idx in batch_idx {
            let m = self.arena.get(idx);
            let entry = offsets.entry((m.source_kind, m.partition)).or_insert(m.offset);
            *entry = (*entry).max(m.offset);
        }
        let now = Utc::now();
        let checkpoints = offsets
            .into_iter()
            .map(|((source_kind, partition), offset)| {
                let previous = self
                    .checkpoints
                    .get(&(source_kind, partition))
                    .map_or(0, |cp| cp.last_offset);
                Checkpoint {
                    source_kind,
                    partition,
                    last_offset: previous.max(offset),
                    epoch: self.epoch,
                    updated_at: now,
                }
            })
            .collect();

        BatchCommit {
            run_id: self.run_id.clone(),
            epoch: self.epoch,
            batch_num,
            resolutions,
            edges,
            entities,
            checkpoints,
        }
    }

    async fn commit_with_retries(&mut self, commit: &BatchCommit) -> Result<()> {
        let mut attempt = 0usize;
        loop {
            match self.store.commit_batch(commit).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.commit_retries => {
                    attempt += 1;
                    self.stats.commit_retries += 1;
                    warn!(
                        "⚠️  Commit of batch {} failed (attempt {}/{}): {:#}; retrying",
                        commit.batch_num,
                        attempt,
                        self.config.commit_retries + 1,
                        e
                    );
                }
                Err(e) => {
                    return Err(e.context(format!(
                        "Commit of batch {} failed after {} attempts; checkpoint not advanced",
                        commit.batch_num,
                        attempt + 1
                    )))
                }
            }
        }
    }

    /// Publishes a committed batch to the in-memory entity store, index and audit log.
    fn apply(&mut self, staged: StagedBatch, commit: BatchCommit, batch_idx: &[MentionIdx]) {
        for (&canonical_id, members) in &staged.new_members {
            for &idx in members {
                self.entities.add_member(canonical_id, idx);
                self.index.insert(idx, self.arena.get(idx));
            }
        }
        for (idx, resolution) in staged.resolutions {
            match resolution {
                Resolution::Unlinkable => self.stats.unlinkable += 1,
                Resolution::Corrupted => self.stats.corrupted += 1,
                _ => {}
            }
            self.resolutions.insert(idx, resolution);
        }
        self.next_edge_seq += commit.edges.len() as u64;
        self.edges.extend(commit.edges);
        for cp in commit.checkpoints {
            self.checkpoints.insert((cp.source_kind, cp.partition), cp);
        }
        for (kind, pass) in &staged.pass_stats {
            self.stats.pass_stats.entry(*kind).or_default().absorb(pass);
        }
        self.next_canonical_id = staged.next_canonical_id;
        self.stats.singleton_entities += staged.singletons;
        self.stats.mentions_processed += batch_idx.len();
        self.stats.batches_committed += 1;
        self.batch_num = commit.batch_num;
        debug!(
            "Batch {} applied: {} entities total, next canonical id {}",
            self.batch_num,
            self.entities.len(),
            self.next_canonical_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::normalize::Normalizer;
    use crate::models::core::{Location, MentionRecord, RawMention};
    use crate::models::matching::EdgeState;
    use crate::rules::ClassificationRules;
    use crate::utils::pipeline_state::MemoryStateStore;
    use indicatif::ProgressDrawTarget;

    fn mentions() -> Vec<SourceMention> {
        let rules = ClassificationRules::default().compile().unwrap();
        let normalizer = Normalizer::new(&rules, 200);
        let rows = [
            ("Acme Supply, Inc.", "CA", "Oakland"),
            ("ACME SUPPLY INC", "CA", "Oakland"),
            ("Acme Supplies", "CA", "Oakland"),
            ("Zenith Plumbing LLC", "NV", "Reno"),
            ("Zenith Plumbing", "NV", "Reno"),
            ("Harbor Freight Lines", "WA", "Seattle"),
            ("", "WA", "Seattle"),
            ("Acme Supply Co", "CA", "Oakland"),
            ("Northwind Traders", "OR", "Salem"),
        ];
        rows.iter()
            .enumerate()
            .map(|(i, (name, state, city))| {
                normalizer.prepare(&MentionRecord {
                    partition: (i % 2) as u32,
                    offset: i as u64,
                    mention: RawMention {
                        source_kind: SourceKind::Filer,
                        source_id: format!("{:03}", i),
                        raw_name: name.to_string(),
                        location: Location {
                            state: Some(state.to_string()),
                            city: Some(city.to_string()),
                            street: None,
                            postal_code: None,
                        },
                        reported_size: Some(100),
                        group_hint: None,
                        union_key: None,
                        reported_on: None,
                        jurisdiction: None,
                    },
                })
            })
            .collect()
    }

    fn config(batch_size: usize, commit_retries: usize) -> EngineConfig {
        EngineConfig {
            batch_size,
            commit_retries,
            worker_count: 2,
            ..EngineConfig::default()
        }
    }

    /// Entities as sorted sets of mention ids, independent of arena layout.
    fn partition(output: &MatchingOutput) -> Vec<(CanonicalId, Vec<String>)> {
        output
            .entities
            .iter()
            .map(|e| {
                let mut ids: Vec<String> = e.members.iter().map(|&i| output.arena.get(i).id.to_string()).collect();
                ids.sort();
                (e.canonical_id, ids)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_fresh_run_links_and_commits() {
        let config = config(4, 0);
        let mut store = MemoryStateStore::new();
        let mut engine = LinkageEngine::new(&config, &mut store, "run-1");
        engine.run(RunMode::Fresh, mentions()).await.unwrap();
        let output = engine.into_output();

        let acme = output
            .entities
            .iter()
            .find(|e| e.members.len() == 4)
            .expect("acme mentions should form one entity");
        assert!(acme.members.iter().all(|&i| output.arena.get(i).normalized_name.starts_with("acme")));
        assert_eq!(output.stats.unlinkable, 1);
        assert_eq!(output.stats.batches_committed, 3);
        assert!(output.entities.verify_partition(&output.arena, &output.edges).is_ok());

        // One accepted edge per linked non-seed mention, sequence numbers gap-free.
        let accepted = output.edges.iter().filter(|e| e.state == EdgeState::Accepted).count();
        let linked: usize = output.entities.iter().map(|e| e.members.len() - 1).sum();
        assert_eq!(accepted, linked);
        for (i, edge) in output.edges.iter().enumerate() {
            assert_eq!(edge.seq, i as u64);
        }
        assert_eq!(store.commits_succeeded(), 3);
        assert_eq!(store.checkpoint(SourceKind::Filer, 0).map(|c| c.last_offset), Some(8));
        assert_eq!(store.checkpoint(SourceKind::Filer, 1).map(|c| c.last_offset), Some(7));
    }

    #[tokio::test]
    async fn test_pass_bars_follow_detailed_setting() {
        let config = config(4, 0);
        let hidden = || Some(MultiProgress::with_draw_target(ProgressDrawTarget::hidden()));

        let mut quiet_store = MemoryStateStore::new();
        let quiet = LinkageEngine::new(&config, &mut quiet_store, "quiet").with_progress(hidden(), false, false);
        assert!(quiet.pass_bar(BlockKeyKind::StatePrefix4, 3).is_none());
        drop(quiet);

        let mut store = MemoryStateStore::new();
        let mut detailed = LinkageEngine::new(&config, &mut store, "detailed").with_progress(hidden(), false, true);
        let bar = detailed.pass_bar(BlockKeyKind::StreetZip, 3).expect("detailed progress adds a pass bar");
        assert_eq!(bar.length(), Some(3));
        assert_eq!(bar.message(), "street_zip blocks");
        drop(bar);

        detailed.run(RunMode::Fresh, mentions()).await.unwrap();
        let with_bars = detailed.into_output();

        let mut plain_store = MemoryStateStore::new();
        let mut plain = LinkageEngine::new(&config, &mut plain_store, "plain");
        plain.run(RunMode::Fresh, mentions()).await.unwrap();
        assert_eq!(partition(&with_bars), partition(&plain.into_output()));
    }

    #[tokio::test]
    async fn test_commit_retry_recovers() {
        let config = config(4, 2);
        let mut store = MemoryStateStore::new();
        store.inject_failures(1, 2);
        let mut engine = LinkageEngine::new(&config, &mut store, "run-1");
        engine.run(RunMode::Fresh, mentions()).await.unwrap();
        let output = engine.into_output();
        assert_eq!(output.stats.commit_retries, 2);
        assert_eq!(output.stats.batches_committed, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_checkpoint_untouched() {
        let config = config(4, 1);
        let mut store = MemoryStateStore::new();
        store.inject_failures(1, 5);
        let mut engine = LinkageEngine::new(&config, &mut store, "run-1");
        assert!(engine.run(RunMode::Fresh, mentions()).await.is_err());
        // Only the first batch is visible, in memory and in the store.
        assert_eq!(engine.committed_mentions(), 4);
        drop(engine);
        assert_eq!(store.commits_succeeded(), 1);
        let resolved = store.load_resolutions().await.unwrap();
        assert_eq!(resolved.len(), 4);
        // The first batch holds offsets 0, 2, 4 and 6, all on partition 0.
        assert_eq!(store.checkpoint(SourceKind::Filer, 0).map(|c| c.last_offset), Some(6));
        assert!(store.checkpoint(SourceKind::Filer, 1).is_none());
    }

    #[tokio::test]
    async fn test_resume_matches_uninterrupted_run() {
        let config = config(3, 0);

        let mut clean_store = MemoryStateStore::new();
        let mut clean = LinkageEngine::new(&config, &mut clean_store, "clean");
        clean.run(RunMode::Fresh, mentions()).await.unwrap();
        let clean = clean.into_output();

        let mut store = MemoryStateStore::new();
        store.inject_failures(2, 1);
        let mut interrupted = LinkageEngine::new(&config, &mut store, "first");
        assert!(interrupted.run(RunMode::Fresh, mentions()).await.is_err());
        drop(interrupted);
        store.clear_failures();

        let mut input = mentions();
        input.reverse();
        let mut resumed = LinkageEngine::new(&config, &mut store, "second");
        resumed.run(RunMode::Resume, input).await.unwrap();
        assert_eq!(resumed.epoch(), 1);
        let resumed = resumed.into_output();

        assert_eq!(resumed.stats.mentions_restored, 6);
        assert_eq!(partition(&resumed), partition(&clean));
        let strip = |edges: &[MatchEdge]| -> Vec<(u64, String, String)> {
            edges.iter().map(|e| (e.seq, e.mention.to_string(), e.target.to_string())).collect()
        };
        assert_eq!(strip(&resumed.edges), strip(&clean.edges));
    }
}
