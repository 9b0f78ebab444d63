// src/clustering/entity_store.rs - Canonical entities as an index-based partition of the mention arena
use anyhow::{bail, Result};
use log::debug;
use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::models::core::{CanonicalId, Location, MentionArena, MentionId, MentionIdx};
use crate::models::matching::{EdgeState, EdgeTarget, MatchEdge};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalEntity {
    pub canonical_id: CanonicalId,
    /// Arena indices, ascending. The first one is the seed that names the entity.
    pub members: Vec<MentionIdx>,
}

impl CanonicalEntity {
    pub fn seed(&self) -> Option<MentionIdx> {
        self.members.first().copied()
    }
}

/// Output row of the canonical entity table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEntityRow {
    pub canonical_id: CanonicalId,
    pub display_name: String,
    pub location: Location,
    pub counted_size: u64,
    pub source_mention_count: usize,
    pub member_mentions: Vec<MentionId>,
}

#[derive(Debug, Default, Clone)]
pub struct EntityStore {
    entities: BTreeMap<CanonicalId, CanonicalEntity>,
    by_mention: HashMap<MentionIdx, CanonicalId>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `idx` into `canonical_id`, creating the entity on first use.
    pub fn add_member(&mut self, canonical_id: CanonicalId, idx: MentionIdx) {
        let entity = self
            .entities
            .entry(canonical_id)
            .or_insert_with(|| CanonicalEntity {
                canonical_id,
                members: Vec::new(),
            });
        if let Err(pos) = entity.members.binary_search(&idx) {
            entity.members.insert(pos, idx);
        }
        self.by_mention.insert(idx, canonical_id);
    }

    pub fn entity_of(&self, idx: MentionIdx) -> Option<CanonicalId> {
        self.by_mention.get(&idx).copied()
    }

    pub fn get(&self, canonical_id: CanonicalId) -> Option<&CanonicalEntity> {
        self.entities.get(&canonical_id)
    }

    pub fn size(&self, canonical_id: CanonicalId) -> usize {
        self.entities.get(&canonical_id).map_or(0, |e| e.members.len())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entities in canonical id order.
    pub fn iter(&self) -> impl Iterator<Item = &CanonicalEntity> {
        self.entities.values()
    }

    pub fn max_canonical_id(&self) -> Option<CanonicalId> {
        self.entities.keys().next_back().copied()
    }

    pub fn display_name(&self, arena: &MentionArena, canonical_id: CanonicalId) -> String {
        self.get(canonical_id)
            .and_then(CanonicalEntity::seed)
            .map(|idx| arena.get(idx).raw_name.trim().to_string())
            .unwrap_or_default()
    }

    pub fn row(&self, arena: &MentionArena, entity: &CanonicalEntity, counted_size: u64) -> CanonicalEntityRow {
        let location = entity
            .seed()
            .map(|idx| arena.get(idx).location.clone())
            .unwrap_or_default();
        let mut member_mentions: Vec<MentionId> =
            entity.members.iter().map(|&idx| arena.get(idx).id.clone()).collect();
        member_mentions.sort();
        CanonicalEntityRow {
            canonical_id: entity.canonical_id,
            display_name: self.display_name(arena, entity.canonical_id),
            location,
            counted_size,
            source_mention_count: entity.members.len(),
            member_mentions,
        }
    }

    /// Rebuilds the partition from accepted edges and checks it matches the store:
    /// every entity is one connected component and no component spans two entities.
    pub fn verify_partition(&self, arena: &MentionArena, edges: &[MatchEdge]) -> Result<()> {
        let mut uf: UnionFind<usize> = UnionFind::new(arena.len());
        let mut accepted_per_mention: HashMap<&MentionId, usize> = HashMap::new();

        for edge in edges.iter().filter(|e| e.state == EdgeState::Accepted) {
            let count = accepted_per_mention.entry(&edge.mention).or_insert(0);
            *count += 1;
            if *count > 1 {
                bail!("Mention {} has more than one accepted edge", edge.mention);
            }
            let Some(from) = arena.index_of(&edge.mention) else {
                bail!("Accepted edge {} references unknown mention {}", edge.seq, edge.mention);
            };
            let to = match &edge.target {
                EdgeTarget::Mention(id) => arena.index_of(id),
                EdgeTarget::Entity(cid) => self.get(*cid).and_then(CanonicalEntity::seed),
            };
            let Some(to) = to else {
                bail!("Accepted edge {} references unknown target {}", edge.seq, edge.target);
            };
            uf.union(from, to);
        }

        let mut component_owner: HashMap<usize, CanonicalId> = HashMap::new();
        for entity in self.iter() {
            let Some(seed) = entity.seed() else {
                bail!("Entity {} has no members", entity.canonical_id);
            };
            let root = uf.find(seed);
            for &idx in &entity.members {
                if uf.find(idx) != root {
                    bail!(
                        "Mention {} is in entity {} without an accepted edge path to its seed",
                        arena.get(idx).id,
                        entity.canonical_id
                    );
                }
            }
            if let Some(other) = component_owner.insert(root, entity.canonical_id) {
                bail!(
                    "Entities {} and {} are connected by accepted edges but were not merged",
                    other,
                    entity.canonical_id
                );
            }
        }
        debug!("Verified partition of {} entities against {} edges", self.len(), edges.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::core::{MentionQuality, SourceKind, SourceMention};
    use crate::models::matching::{BlockKeyKind, MatchMethod};

    fn arena(n: usize) -> MentionArena {
        let mut arena = MentionArena::new();
        for i in 0..n {
            arena.push(SourceMention {
                id: MentionId::new(SourceKind::Filer, &i.to_string()),
                source_kind: SourceKind::Filer,
                source_id: i.to_string(),
                partition: 0,
                offset: i as u64,
                raw_name: format!("Employer {}", i),
                normalized_name: format!("employer {}", i),
                location: Location::default(),
                reported_size: None,
                group_hint: None,
                union_key: None,
                reported_on: None,
                jurisdiction: None,
                quality: MentionQuality::Linkable,
            });
        }
        arena
    }

    fn edge(seq: u64, mention: usize, target: EdgeTarget) -> MatchEdge {
        MatchEdge {
            seq,
            mention: MentionId::new(SourceKind::Filer, &mention.to_string()),
            target,
            method: MatchMethod::FuzzyName,
            score: 0.9,
            state: EdgeState::Accepted,
            block_kind: BlockKeyKind::StatePrefix4,
            block_key: "k".to_string(),
        }
    }

    #[test]
    fn test_partition_verifies() {
        let arena = arena(4);
        let mut store = EntityStore::new();
        store.add_member(CanonicalId(1), 0);
        store.add_member(CanonicalId(1), 1);
        store.add_member(CanonicalId(1), 2);
        store.add_member(CanonicalId(2), 3);

        let edges = vec![
            edge(0, 0, EdgeTarget::Mention(MentionId::new(SourceKind::Filer, "1"))),
            edge(1, 2, EdgeTarget::Entity(CanonicalId(1))),
        ];
        assert!(store.verify_partition(&arena, &edges).is_ok());
        assert_eq!(store.display_name(&arena, CanonicalId(1)), "Employer 0");
        assert_eq!(store.entity_of(2), Some(CanonicalId(1)));
        assert_eq!(store.max_canonical_id(), Some(CanonicalId(2)));
    }

    #[test]
    fn test_partition_detects_unmerged_and_orphaned_members() {
        let arena = arena(3);
        let mut store = EntityStore::new();
        store.add_member(CanonicalId(1), 0);
        store.add_member(CanonicalId(2), 1);
        let bridging = vec![edge(0, 1, EdgeTarget::Mention(MentionId::new(SourceKind::Filer, "0")))];
        assert!(store.verify_partition(&arena, &bridging).is_err());

        let mut store = EntityStore::new();
        store.add_member(CanonicalId(1), 0);
        store.add_member(CanonicalId(1), 2);
        assert!(store.verify_partition(&arena, &[]).is_err());
    }
}
