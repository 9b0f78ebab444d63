// src/matching/blocking.rs - Cheap high-recall keys that bound pairwise comparison
use std::collections::{BTreeMap, HashMap};

use crate::matching::normalize::street_number;
use crate::models::core::{MentionArena, MentionIdx, SourceMention};
use crate::models::matching::BlockKeyKind;

/// First `n` characters of a normalized name.
fn name_prefix(name: &str, n: usize) -> String {
    name.chars().take(n).collect()
}

fn base_prefix_len(kind: BlockKeyKind) -> usize {
    match kind {
        BlockKeyKind::StatePrefix4 => 4,
        BlockKeyKind::StatePrefix3 => 3,
        BlockKeyKind::StreetZip => 0,
    }
}

/// The un-narrowed key of `mention` for `kind`, or `None` when a component is missing.
pub fn base_key(kind: BlockKeyKind, mention: &SourceMention) -> Option<String> {
    if !mention.is_linkable() {
        return None;
    }
    match kind {
        BlockKeyKind::StatePrefix4 | BlockKeyKind::StatePrefix3 => {
            let state = mention.location.state.as_deref()?;
            Some(format!(
                "{}|{}",
                state,
                name_prefix(&mention.normalized_name, base_prefix_len(kind))
            ))
        }
        BlockKeyKind::StreetZip => {
            let postal = mention.location.postal_code.as_deref()?;
            let number = street_number(mention.location.street.as_deref()?)?;
            Some(format!("{}|{}", postal, number))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBlock {
    pub key: String,
    /// Sorted by mention id.
    pub members: Vec<MentionIdx>,
}

#[derive(Debug, Default)]
pub struct BlockPlan {
    /// Sorted by key.
    pub blocks: Vec<PlannedBlock>,
    pub narrowed: usize,
    pub chunked: usize,
    /// (key, size) of blocks that had to be chunked.
    pub overflow: Vec<(String, usize)>,
}

#[derive(Debug, Clone, Copy)]
enum NarrowStep {
    Prefix(usize),
    City,
    Chunk,
}

struct Narrower<'a> {
    arena: &'a MentionArena,
    max_block_size: usize,
    max_prefix_len: usize,
    plan: BlockPlan,
}

impl<'a> Narrower<'a> {
    fn first_step(&self, kind: BlockKeyKind) -> NarrowStep {
        let next = base_prefix_len(kind) + 1;
        if next <= self.max_prefix_len {
            NarrowStep::Prefix(next)
        } else {
            NarrowStep::City
        }
    }

    fn step_after(&self, step: NarrowStep) -> NarrowStep {
        match step {
            NarrowStep::Prefix(n) if n < self.max_prefix_len => NarrowStep::Prefix(n + 1),
            NarrowStep::Prefix(_) => NarrowStep::City,
            NarrowStep::City | NarrowStep::Chunk => NarrowStep::Chunk,
        }
    }

    fn emit(&mut self, key: String, members: Vec<MentionIdx>) {
        if !members.is_empty() {
            self.plan.blocks.push(PlannedBlock { key, members });
        }
    }

    /// Splits `members` until every block fits, trying longer prefixes, then city, then chunks.
    fn narrow(&mut self, key: String, members: Vec<MentionIdx>, step: NarrowStep, narrowed: bool) {
        if members.is_empty() {
            return;
        }
        if members.len() <= self.max_block_size {
            if narrowed {
                self.plan.narrowed += 1;
            }
            self.emit(key, members);
            return;
        }

        if let NarrowStep::Chunk = step {
            self.plan.chunked += 1;
            self.plan.overflow.push((key.clone(), members.len()));
            for (i, chunk) in members.chunks(self.max_block_size).enumerate() {
                self.emit(format!("{}#{}", key, i), chunk.to_vec());
            }
            return;
        }

        let arena = self.arena;
        let component = |idx: MentionIdx| -> Option<String> {
            let m = arena.get(idx);
            match step {
                NarrowStep::Prefix(n) => {
                    if m.normalized_name.chars().count() >= n {
                        Some(name_prefix(&m.normalized_name, n))
                    } else {
                        None
                    }
                }
                NarrowStep::City => m.location.city.clone(),
                NarrowStep::Chunk => None,
            }
        };

        let mut groups: BTreeMap<String, Vec<MentionIdx>> = BTreeMap::new();
        let mut residual = Vec::new();
        for &idx in &members {
            match component(idx) {
                Some(c) => groups.entry(c).or_default().push(idx),
                None => residual.push(idx),
            }
        }

        let next = self.step_after(step);
        // Residual members lack this component; the next prefix length can't help them either.
        let residual_next = match step {
            NarrowStep::Prefix(_) => NarrowStep::City,
            _ => NarrowStep::Chunk,
        };
        let tag = match step {
            NarrowStep::Prefix(_) => "p",
            _ => "c",
        };
        for (component, group) in groups {
            self.narrow(format!("{}|{}:{}", key, tag, component), group, next, true);
        }
        self.narrow(key, residual, residual_next, true);
    }
}

/// Committed mentions by pass and base key; written only at batch commit.
#[derive(Debug, Default)]
pub struct BlockingIndex {
    keys: HashMap<BlockKeyKind, HashMap<String, Vec<MentionIdx>>>,
}

impl BlockingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, idx: MentionIdx, mention: &SourceMention) {
        for kind in BlockKeyKind::PASSES {
            if let Some(key) = base_key(kind, mention) {
                self.keys
                    .entry(kind)
                    .or_default()
                    .entry(key)
                    .or_default()
                    .push(idx);
            }
        }
    }

    pub fn lookup(&self, kind: BlockKeyKind, key: &str) -> &[MentionIdx] {
        self.keys
            .get(&kind)
            .and_then(|by_key| by_key.get(key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Blocks for one pass: every key holding a pending mention, populated with the committed
    /// and batch-staged mentions sharing it, narrowed to `max_block_size`.
    pub fn plan_blocks(
        &self,
        kind: BlockKeyKind,
        arena: &MentionArena,
        pending: &[MentionIdx],
        staged: &[MentionIdx],
        max_block_size: usize,
        max_prefix_len: usize,
    ) -> BlockPlan {
        let mut populations: BTreeMap<String, Vec<MentionIdx>> = BTreeMap::new();
        for &idx in pending {
            if let Some(key) = base_key(kind, arena.get(idx)) {
                populations.entry(key).or_default().push(idx);
            }
        }
        for &idx in staged {
            if let Some(key) = base_key(kind, arena.get(idx)) {
                if let Some(members) = populations.get_mut(&key) {
                    members.push(idx);
                }
            }
        }
        for (key, members) in populations.iter_mut() {
            members.extend_from_slice(self.lookup(kind, key));
            members.sort_by(|a, b| arena.get(*a).id.cmp(&arena.get(*b).id));
            members.dedup();
        }

        let pending_set: std::collections::HashSet<MentionIdx> = pending.iter().copied().collect();
        let mut narrower = Narrower {
            arena,
            max_block_size,
            max_prefix_len,
            plan: BlockPlan::default(),
        };
        for (key, members) in populations {
            let step = narrower.first_step(kind);
            narrower.narrow(key, members, step, false);
        }

        let mut plan = narrower.plan;
        plan.blocks
            .retain(|b| b.members.len() >= 2 && b.members.iter().any(|m| pending_set.contains(m)));
        plan.blocks.sort_by(|a, b| a.key.cmp(&b.key));
        plan
    }
}
