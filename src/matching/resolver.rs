// src/matching/resolver.rs - Per-block greedy resolution of pending mentions into entities
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::matching::similarity::{jaccard, trigrams, Comparable, SimilarityScorer};
use crate::models::core::{CanonicalId, MentionId, MentionIdx};
use crate::models::matching::{BlockKeyKind, EdgeState, MatchMethod};
use crate::models::stats_models::PassStats;

const SCORE_EPSILON: f64 = 1e-9;

/// An entity as seen from inside one block: already allocated, or created by this block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityRef {
    Committed(CanonicalId),
    /// Block-local number; replaced by a real id when the outcome is applied.
    Provisional(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberState {
    Pending,
    Linked {
        canonical_id: CanonicalId,
        /// Mentions in the entity before this pass started.
        entity_size: usize,
    },
}

/// One block member, carrying its own copy of the comparison data.
#[derive(Debug, Clone)]
pub struct BlockMember {
    pub idx: MentionIdx,
    pub id: MentionId,
    pub comparable: Comparable,
    pub state: MemberState,
}

#[derive(Debug, Clone)]
pub struct BlockWork {
    pub kind: BlockKeyKind,
    pub key: String,
    /// Sorted by mention id.
    pub members: Vec<BlockMember>,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolveParams {
    pub threshold: f64,
    pub scorer: SimilarityScorer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposedTarget {
    Entity(EntityRef),
    Mention(MentionIdx, MentionId),
}

impl ProposedTarget {
    /// Committed entities, then provisional ones, then bare mentions.
    fn order_key(&self) -> (u8, u64, &str) {
        match self {
            ProposedTarget::Entity(EntityRef::Committed(id)) => (0, id.0, ""),
            ProposedTarget::Entity(EntityRef::Provisional(k)) => (1, *k as u64, ""),
            ProposedTarget::Mention(_, id) => (2, 0, id.as_str()),
        }
    }
}

impl Ord for ProposedTarget {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

impl PartialOrd for ProposedTarget {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProposedEdge {
    pub mention: MentionIdx,
    pub target: ProposedTarget,
    pub method: MatchMethod,
    pub score: f64,
    pub state: EdgeState,
}

#[derive(Debug, Clone)]
pub struct BlockOutcome {
    pub kind: BlockKeyKind,
    pub key: String,
    pub assignments: Vec<(MentionIdx, EntityRef)>,
    pub needs_review: Vec<MentionIdx>,
    /// Finalized edges in resolution order.
    pub edges: Vec<ProposedEdge>,
    pub provisional_entities: usize,
    pub stats: PassStats,
}

#[derive(Debug, Clone)]
struct Candidate {
    target: ProposedTarget,
    score: f64,
    method: MatchMethod,
    /// Normalized name of the best-scoring member behind the target.
    name: String,
    prior_mentions: usize,
}

/// The tied candidates a mention cannot choose between, or the chosen one.
enum Choice {
    Accept(usize),
    Ambiguous(Vec<usize>),
}

/// Highest score wins; then most prior mentions; then lowest id, but only among
/// interchangeable targets (identical name). Anything else is ambiguous.
fn choose(candidates: &[Candidate]) -> Choice {
    let best = candidates
        .iter()
        .map(|c| c.score)
        .fold(f64::NEG_INFINITY, f64::max);
    let tied: Vec<usize> = (0..candidates.len())
        .filter(|&i| (best - candidates[i].score).abs() <= SCORE_EPSILON)
        .collect();
    if tied.len() == 1 {
        return Choice::Accept(tied[0]);
    }

    let most_prior = tied
        .iter()
        .map(|&i| candidates[i].prior_mentions)
        .max()
        .unwrap_or(0);
    let by_prior: Vec<usize> = tied
        .iter()
        .copied()
        .filter(|&i| candidates[i].prior_mentions == most_prior)
        .collect();
    if by_prior.len() == 1 {
        return Choice::Accept(by_prior[0]);
    }

    let first_name = &candidates[by_prior[0]].name;
    if by_prior.iter().all(|&i| candidates[i].name == *first_name) {
        if let Some(&lowest) = by_prior
            .iter()
            .min_by(|&&a, &&b| candidates[a].target.cmp(&candidates[b].target))
        {
            return Choice::Accept(lowest);
        }
    }
    Choice::Ambiguous(tied)
}

/// Resolves every pending member of the block in mention-id order. Pure: reads only `work`.
pub fn resolve_block(work: BlockWork, params: ResolveParams) -> BlockOutcome {
    let members = &work.members;
    let grams: Vec<HashSet<String>> = members
        .iter()
        .map(|m| trigrams(&m.comparable.name))
        .collect();

    let mut assigned: Vec<Option<EntityRef>> = members
        .iter()
        .map(|m| match m.state {
            MemberState::Linked { canonical_id, .. } => Some(EntityRef::Committed(canonical_id)),
            MemberState::Pending => None,
        })
        .collect();
    let mut in_review = vec![false; members.len()];

    let mut entity_sizes: HashMap<EntityRef, usize> = HashMap::new();
    for m in members {
        if let MemberState::Linked {
            canonical_id,
            entity_size,
        } = m.state
        {
            entity_sizes.insert(EntityRef::Committed(canonical_id), entity_size);
        }
    }

    let mut stats = PassStats {
        blocks_processed: 1,
        ..PassStats::default()
    };
    let mut edges = Vec::new();
    let mut provisional = 0usize;

    for p in 0..members.len() {
        if members[p].state != MemberState::Pending || assigned[p].is_some() {
            continue;
        }

        let mut by_target: BTreeMap<ProposedTarget, Candidate> = BTreeMap::new();
        for q in 0..members.len() {
            if q == p || in_review[q] {
                continue;
            }
            let target = match assigned[q] {
                Some(entity) => ProposedTarget::Entity(entity),
                None => ProposedTarget::Mention(members[q].idx, members[q].id.clone()),
            };
            let a = &members[p].comparable;
            let b = &members[q].comparable;
            let score = params.scorer.score_with(jaccard(&grams[p], &grams[q]), a, b);
            stats.pairs_scored += 1;
            if score < params.threshold {
                continue;
            }

            let prior_mentions = match &target {
                ProposedTarget::Entity(entity) => entity_sizes.get(entity).copied().unwrap_or(1),
                ProposedTarget::Mention(..) => 1,
            };
            let candidate = Candidate {
                target: target.clone(),
                score,
                method: params.scorer.method_for(work.kind, a, b),
                name: b.name.clone(),
                prior_mentions,
            };
            match by_target.get_mut(&target) {
                Some(existing) => {
                    let better = score > existing.score + SCORE_EPSILON
                        || ((score - existing.score).abs() <= SCORE_EPSILON && candidate.name < existing.name);
                    if better {
                        *existing = candidate;
                    }
                }
                None => {
                    by_target.insert(target, candidate);
                }
            }
        }

        if by_target.is_empty() {
            continue;
        }
        let candidates: Vec<Candidate> = by_target.into_values().collect();
        stats.edges_proposed += candidates.len();

        let finalize = |states: &dyn Fn(usize) -> EdgeState| -> Vec<ProposedEdge> {
            candidates
                .iter()
                .enumerate()
                .map(|(i, c)| ProposedEdge {
                    mention: members[p].idx,
                    target: c.target.clone(),
                    method: c.method,
                    score: c.score,
                    state: states(i),
                })
                .collect()
        };

        match choose(&candidates) {
            Choice::Accept(winner) => {
                edges.extend(finalize(&|i| {
                    if i == winner {
                        EdgeState::Accepted
                    } else {
                        EdgeState::Rejected
                    }
                }));
                stats.edges_accepted += 1;

                match &candidates[winner].target {
                    ProposedTarget::Entity(entity) => {
                        assigned[p] = Some(*entity);
                        *entity_sizes.entry(*entity).or_insert(1) += 1;
                    }
                    ProposedTarget::Mention(target_idx, _) => {
                        let entity = EntityRef::Provisional(provisional);
                        provisional += 1;
                        assigned[p] = Some(entity);
                        if let Some(q) = members.iter().position(|m| m.idx == *target_idx) {
                            assigned[q] = Some(entity);
                        }
                        entity_sizes.insert(entity, 2);
                    }
                }
            }
            Choice::Ambiguous(tied) => {
                in_review[p] = true;
                stats.mentions_needing_review += 1;
                edges.extend(finalize(&|i| {
                    if tied.contains(&i) {
                        EdgeState::NeedsReview
                    } else {
                        EdgeState::Rejected
                    }
                }));
            }
        }
    }

    let assignments = members
        .iter()
        .zip(assigned.iter())
        .filter(|(m, _)| m.state == MemberState::Pending)
        .filter_map(|(m, a)| a.map(|entity| (m.idx, entity)))
        .collect();
    let needs_review = members
        .iter()
        .zip(in_review.iter())
        .filter(|(_, r)| **r)
        .map(|(m, _)| m.idx)
        .collect();
    stats.entities_created = provisional;

    BlockOutcome {
        kind: work.kind,
        key: work.key,
        assignments,
        needs_review,
        edges,
        provisional_entities: provisional,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::core::SourceKind;

    fn member(idx: MentionIdx, name: &str, state: MemberState) -> BlockMember {
        BlockMember {
            idx,
            id: MentionId::new(SourceKind::Filer, &format!("{:03}", idx)),
            comparable: Comparable {
                name: name.to_string(),
                state: Some("CA".to_string()),
                city: None,
                street: None,
            },
            state,
        }
    }

    fn linked(id: u64, size: usize) -> MemberState {
        MemberState::Linked {
            canonical_id: CanonicalId(id),
            entity_size: size,
        }
    }

    fn params() -> ResolveParams {
        ResolveParams {
            threshold: 0.6,
            scorer: SimilarityScorer::new(0.05),
        }
    }

    fn work(members: Vec<BlockMember>) -> BlockWork {
        BlockWork {
            kind: BlockKeyKind::StatePrefix4,
            key: "CA|abc ".to_string(),
            members,
        }
    }

    #[test]
    fn test_pending_pair_creates_provisional_entity() {
        let outcome = resolve_block(
            work(vec![
                member(0, "acme supply", MemberState::Pending),
                member(1, "acme supply", MemberState::Pending),
            ]),
            params(),
        );
        assert_eq!(outcome.provisional_entities, 1);
        assert_eq!(
            outcome.assignments,
            vec![(0, EntityRef::Provisional(0)), (1, EntityRef::Provisional(0))]
        );
        assert_eq!(outcome.edges.len(), 1);
        assert_eq!(outcome.edges[0].state, EdgeState::Accepted);
        assert_eq!(outcome.edges[0].method, MatchMethod::BlockExact);
        assert_eq!(outcome.edges[0].score, 1.0);
    }

    #[test]
    fn test_links_to_committed_entity() {
        let outcome = resolve_block(
            work(vec![
                member(0, "acme supply", linked(4, 2)),
                member(1, "acme supply", linked(4, 2)),
                member(2, "acme supplies", MemberState::Pending),
            ]),
            params(),
        );
        assert_eq!(outcome.assignments, vec![(2, EntityRef::Committed(CanonicalId(4)))]);
        // Both members of entity 4 collapse to a single edge.
        assert_eq!(outcome.edges.len(), 1);
        assert_eq!(outcome.edges[0].target, ProposedTarget::Entity(EntityRef::Committed(CanonicalId(4))));
        assert_eq!(outcome.edges[0].method, MatchMethod::FuzzyName);
    }

    #[test]
    fn test_tie_with_different_names_needs_review() {
        let outcome = resolve_block(
            work(vec![
                member(0, "abc def ghi", linked(1, 1)),
                member(1, "abc def jkl", linked(2, 1)),
                member(2, "abc def", MemberState::Pending),
            ]),
            params(),
        );
        assert!(outcome.assignments.is_empty());
        assert_eq!(outcome.needs_review, vec![2]);
        assert_eq!(outcome.edges.len(), 2);
        assert!(outcome.edges.iter().all(|e| e.state == EdgeState::NeedsReview));
        assert_eq!(outcome.stats.mentions_needing_review, 1);
    }

    #[test]
    fn test_tie_broken_by_prior_mentions() {
        let outcome = resolve_block(
            work(vec![
                member(0, "abc def ghi", linked(1, 1)),
                member(1, "abc def jkl", linked(2, 3)),
                member(2, "abc def", MemberState::Pending),
            ]),
            params(),
        );
        assert_eq!(outcome.assignments, vec![(2, EntityRef::Committed(CanonicalId(2)))]);
        let accepted: Vec<_> = outcome.edges.iter().filter(|e| e.state == EdgeState::Accepted).collect();
        assert_eq!(accepted.len(), 1);
        assert_eq!(outcome.edges.iter().filter(|e| e.state == EdgeState::Rejected).count(), 1);
    }

    #[test]
    fn test_interchangeable_tie_takes_lowest_id() {
        let outcome = resolve_block(
            work(vec![
                member(0, "abc def ghi", linked(9, 1)),
                member(1, "abc def ghi", linked(5, 1)),
                member(2, "abc def", MemberState::Pending),
            ]),
            params(),
        );
        assert_eq!(outcome.assignments, vec![(2, EntityRef::Committed(CanonicalId(5)))]);
    }

    #[test]
    fn test_below_threshold_stays_unmatched() {
        let outcome = resolve_block(
            work(vec![
                member(0, "acme supply", MemberState::Pending),
                member(1, "zenith plumbing", MemberState::Pending),
            ]),
            params(),
        );
        assert!(outcome.assignments.is_empty());
        assert!(outcome.edges.is_empty());
        assert_eq!(outcome.stats.pairs_scored, 2);
    }
}
