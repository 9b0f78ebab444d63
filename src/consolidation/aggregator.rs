// src/consolidation/aggregator.rs - Provenance-carrying totals per entity, group and organization,
// plus the per-mention disposition ledger.
use anyhow::{bail, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::clustering::entity_store::EntityStore;
use crate::consolidation::hierarchy::HierarchyOutcome;
use crate::consolidation::multi_employer::{representative_mention, MultiEmployerOutcome};
use crate::models::consolidation::{AggregationResult, Disposition, ExclusionReason};
use crate::models::core::{CanonicalId, MentionArena, MentionId, MentionIdx};
use crate::models::matching::{EdgeState, MatchEdge, Resolution};
use crate::models::stats_models::RunSummary;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispositionRecord {
    pub mention_id: MentionId,
    #[serde(flatten)]
    pub disposition: Disposition,
}

/// A mention the engine would not decide on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub mention_id: MentionId,
    pub raw_name: String,
    pub status: Resolution,
    pub reported_size: Option<u64>,
    /// Targets tied at the top score, for ambiguous matches.
    pub candidate_targets: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AggregationOutcome {
    /// `entity:{canonical id}`, by canonical id.
    pub entity_results: Vec<AggregationResult>,
    /// `group:{group id}`, by group id.
    pub group_results: Vec<AggregationResult>,
    /// `org:{organization key}`, by key.
    pub org_results: Vec<AggregationResult>,
    /// By mention id.
    pub dispositions: Vec<DispositionRecord>,
    pub review_queue: Vec<ReviewItem>,
    pub summary: RunSummary,
}

impl AggregationOutcome {
    pub fn counted_size(&self, canonical_id: CanonicalId) -> u64 {
        let key = entity_key(canonical_id);
        self.entity_results
            .iter()
            .find(|r| r.entity_or_org_id == key)
            .map_or(0, |r| r.counted_total)
    }

    /// Every rollup balances and every exclusion names its reason.
    pub fn verify_conservation(&self) -> Result<()> {
        for result in self
            .entity_results
            .iter()
            .chain(&self.group_results)
            .chain(&self.org_results)
        {
            if !result.is_conserved() {
                bail!(
                    "{} does not balance: counted {} + excluded {} != reported {}",
                    result.entity_or_org_id,
                    result.counted_total,
                    result.excluded_total,
                    result.total_reported
                );
            }
        }
        Ok(())
    }
}

pub fn entity_key(canonical_id: CanonicalId) -> String {
    format!("entity:{}", canonical_id)
}

pub struct AggregationInput<'a> {
    pub arena: &'a MentionArena,
    pub entities: &'a EntityStore,
    pub resolutions: &'a HashMap<MentionIdx, Resolution>,
    pub edges: &'a [MatchEdge],
    pub multi_employer: &'a MultiEmployerOutcome,
    pub hierarchy: &'a HierarchyOutcome,
}

fn add_to_reason(totals: &mut BTreeMap<String, u64>, reason: ExclusionReason, reported: u64) {
    let total = totals.entry(reason.as_str().to_string()).or_insert(0);
    *total = total.saturating_add(reported);
}

pub fn aggregate(input: &AggregationInput<'_>) -> AggregationOutcome {
    let arena = input.arena;
    let mut dispositions: BTreeMap<MentionId, Disposition> = BTreeMap::new();
    let mut summary = RunSummary::default();
    let mut excluded_by_reason: BTreeMap<String, u64> = BTreeMap::new();

    let mut entity_results = Vec::with_capacity(input.entities.len());
    for entity in input.entities.iter() {
        let mut result = AggregationResult::new(entity_key(entity.canonical_id));
        let entity_reason = input
            .multi_employer
            .assignment(entity.canonical_id)
            .and_then(|a| a.exclusion_reason);
        let representative = representative_mention(arena, &entity.members);

        let mut members = entity.members.clone();
        members.sort_by(|a, b| arena.get(*a).id.cmp(&arena.get(*b).id));
        for idx in members {
            let m = arena.get(idx);
            let reported = m.size_or_zero();
            let disposition = if Some(idx) == representative {
                match entity_reason {
                    Some(reason) => Disposition::Excluded(reason),
                    None => Disposition::Counted,
                }
            } else {
                Disposition::Excluded(ExclusionReason::DuplicateMention)
            };
            match disposition {
                Disposition::Excluded(reason) => {
                    result.exclude(m.id.as_str(), reported, reason);
                    add_to_reason(&mut excluded_by_reason, reason, reported);
                }
                _ => result.include(m.id.as_str(), reported),
            }
            dispositions.insert(m.id.clone(), disposition);
        }
        summary.employer_counted_total = summary.employer_counted_total.saturating_add(result.counted_total);
        summary.employer_excluded_total = summary.employer_excluded_total.saturating_add(result.excluded_total);
        entity_results.push(result);
    }

    let mut review_queue = Vec::new();
    let mut review_targets: HashMap<&MentionId, Vec<String>> = HashMap::new();
    for edge in input.edges.iter().filter(|e| e.state == EdgeState::NeedsReview) {
        review_targets.entry(&edge.mention).or_default().push(edge.target.to_string());
    }
    for (idx, m) in arena.iter() {
        let Some(resolution) = input.resolutions.get(&idx).copied() else {
            continue;
        };
        let disposition = match resolution {
            Resolution::Linked(_) => continue,
            Resolution::NeedsReview => Disposition::NeedsReview,
            Resolution::Unlinkable => Disposition::Excluded(ExclusionReason::Unlinkable),
            Resolution::Corrupted => Disposition::Excluded(ExclusionReason::CorruptedData),
        };
        let reported = m.size_or_zero();
        match disposition {
            Disposition::Excluded(reason) => {
                summary.employer_excluded_total = summary.employer_excluded_total.saturating_add(reported);
                add_to_reason(&mut excluded_by_reason, reason, reported);
            }
            _ => summary.needs_review_reported_total = summary.needs_review_reported_total.saturating_add(reported),
        }
        if matches!(resolution, Resolution::NeedsReview | Resolution::Unlinkable) {
            let mut candidate_targets = review_targets.get(&m.id).cloned().unwrap_or_default();
            candidate_targets.sort();
            review_queue.push(ReviewItem {
                mention_id: m.id.clone(),
                raw_name: m.raw_name.clone(),
                status: resolution,
                reported_size: m.reported_size,
                candidate_targets,
            });
        }
        dispositions.insert(m.id.clone(), disposition);
    }
    review_queue.sort_by(|a, b| a.mention_id.cmp(&b.mention_id));

    let group_results = group_results(input);

    let mut org_results = Vec::new();
    for (org, nodes) in input.hierarchy.by_organization() {
        let mut result = AggregationResult::new(format!("org:{}", org));
        for node in nodes {
            let reported = node.reported_size.unwrap_or(0);
            match node.exclusion_reason {
                Some(reason) => {
                    result.exclude(node.node_id.as_str(), reported, reason);
                    add_to_reason(&mut excluded_by_reason, reason, reported);
                }
                None => result.include(node.node_id.as_str(), reported),
            }
        }
        summary.membership_counted_total = summary.membership_counted_total.saturating_add(result.counted_total);
        summary.membership_excluded_total = summary.membership_excluded_total.saturating_add(result.excluded_total);
        org_results.push(result);
    }

    summary.mentions_total = dispositions.len();
    for disposition in dispositions.values() {
        match disposition {
            Disposition::Counted => summary.mentions_counted += 1,
            Disposition::Excluded(_) => summary.mentions_excluded += 1,
            Disposition::NeedsReview => summary.mentions_needing_review += 1,
        }
    }
    summary.canonical_entities = input.entities.len();
    summary.multi_employer_groups = input.multi_employer.groups.len();
    summary.hierarchy_nodes = input.hierarchy.nodes.len();
    summary.excluded_by_reason = excluded_by_reason;

    info!(
        "🧾 Aggregated {} entities and {} organizations: {} workers counted, {} excluded",
        entity_results.len(),
        org_results.len(),
        summary.employer_counted_total,
        summary.employer_excluded_total
    );
    debug!("Review queue holds {} mentions", review_queue.len());

    AggregationOutcome {
        entity_results,
        group_results,
        org_results,
        dispositions: dispositions
            .into_iter()
            .map(|(mention_id, disposition)| DispositionRecord {
                mention_id,
                disposition,
            })
            .collect(),
        review_queue,
        summary,
    }
}

/// One result per group: the primary's report counted, every other member's excluded.
fn group_results(input: &AggregationInput<'_>) -> Vec<AggregationResult> {
    let me = input.multi_employer;
    me.groups
        .iter()
        .map(|group| {
            let mut result = AggregationResult::new(format!("group:{}", group.group_id));
            for &cid in &group.members {
                let reported = me.profiles.get(&cid).and_then(|p| p.size).unwrap_or(0);
                let reason = me.assignment(cid).and_then(|a| a.exclusion_reason);
                match reason {
                    Some(reason) => result.exclude(cid.to_string(), reported, reason),
                    None => result.include(cid.to_string(), reported),
                }
            }
            result
        })
        .collect()
}

/// Every input mention has exactly one disposition, and nothing else does.
pub fn verify_no_silent_drops<'a>(
    input_ids: impl IntoIterator<Item = &'a MentionId>,
    dispositions: &[DispositionRecord],
) -> Result<()> {
    let mut ledger: HashSet<&MentionId> = HashSet::with_capacity(dispositions.len());
    for record in dispositions {
        if !ledger.insert(&record.mention_id) {
            bail!("Mention {} has more than one disposition", record.mention_id);
        }
    }
    let inputs: HashSet<&MentionId> = input_ids.into_iter().collect();
    if let Some(missing) = inputs.iter().find(|id| !ledger.contains(*id)) {
        bail!("Mention {} has no terminal disposition", missing);
    }
    if let Some(extra) = ledger.iter().find(|id| !inputs.contains(*id)) {
        bail!("Disposition recorded for unknown mention {}", extra);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consolidation::hierarchy::HierarchyDeduplicator;
    use crate::consolidation::multi_employer::MultiEmployerDeduplicator;
    use crate::matching::normalize::Normalizer;
    use crate::models::consolidation::{HierarchyNodeInput, Inclusion};
    use crate::models::core::{Location, MentionRecord, RawMention, SourceKind};
    use crate::rules::ClassificationRules;
    use crate::utils::engine_config::EngineConfig;
    use chrono::NaiveDate;

    /// Provenance entries excluded for `reason` across a set of results.
    fn excluded_entries(results: &[AggregationResult], reason: ExclusionReason) -> usize {
        results
            .iter()
            .flat_map(|r| &r.provenance)
            .filter(|p| p.inclusion == Inclusion::Excluded && p.reason == Some(reason))
            .count()
    }

    struct Row {
        name: &'static str,
        union: Option<&'static str>,
        size: Option<u64>,
        reported_on: Option<NaiveDate>,
    }

    fn row(name: &'static str, union: Option<&'static str>, size: Option<u64>) -> Row {
        Row {
            name,
            union,
            size,
            reported_on: None,
        }
    }

    /// Builds an arena plus entities from `(canonical id, row)` pairs.
    fn build(rows: Vec<(Option<u64>, Row)>) -> (MentionArena, EntityStore, HashMap<MentionIdx, Resolution>) {
        let rules = ClassificationRules::default().compile().unwrap();
        let normalizer = Normalizer::new(&rules, 200);
        let mut arena = MentionArena::new();
        let mut entities = EntityStore::new();
        let mut resolutions = HashMap::new();
        for (i, (cid, r)) in rows.into_iter().enumerate() {
            let mention = normalizer.prepare(&MentionRecord {
                partition: 0,
                offset: i as u64,
                mention: RawMention {
                    source_kind: SourceKind::CaseParticipant,
                    source_id: format!("{:03}", i),
                    raw_name: r.name.to_string(),
                    location: Location::default(),
                    reported_size: r.size,
                    group_hint: None,
                    union_key: r.union.map(str::to_string),
                    reported_on: r.reported_on,
                    jurisdiction: None,
                },
            });
            let quality = mention.quality;
            let idx = arena.push(mention).unwrap();
            let resolution = match (cid, quality) {
                (Some(cid), _) => {
                    entities.add_member(CanonicalId(cid), idx);
                    Resolution::Linked(CanonicalId(cid))
                }
                (None, crate::models::core::MentionQuality::Unlinkable) => Resolution::Unlinkable,
                (None, crate::models::core::MentionQuality::Corrupted) => Resolution::Corrupted,
                (None, _) => Resolution::NeedsReview,
            };
            resolutions.insert(idx, resolution);
        }
        (arena, entities, resolutions)
    }

    fn aggregate_all(
        arena: &MentionArena,
        entities: &EntityStore,
        resolutions: &HashMap<MentionIdx, Resolution>,
        nodes: &[HierarchyNodeInput],
    ) -> AggregationOutcome {
        let rules = ClassificationRules::default().compile().unwrap();
        let config = EngineConfig::default();
        let multi_employer = MultiEmployerDeduplicator::new(&rules, &config).deduplicate(arena, entities);
        let hierarchy = HierarchyDeduplicator::new(&rules, &config).deduplicate(nodes);
        aggregate(&AggregationInput {
            arena,
            entities,
            resolutions,
            edges: &[],
            multi_employer: &multi_employer,
            hierarchy: &hierarchy,
        })
    }

    #[test]
    fn test_multi_employer_counts_collapse() {
        let (arena, entities, resolutions) = build(vec![
            (Some(1), row("Bay Electric", Some("X"), Some(12_000))),
            (Some(2), row("All Signatories to Agreement X", Some("X"), Some(12_000))),
            (Some(3), row("Coastal Wiring", Some("X"), Some(12_000))),
            (Some(4), row("Delta Power", Some("X"), Some(12_000))),
            (Some(5), row("Evergreen Electric", Some("X"), Some(12_000))),
        ]);
        let outcome = aggregate_all(&arena, &entities, &resolutions, &[]);

        assert_eq!(outcome.summary.employer_counted_total, 12_000);
        assert_eq!(outcome.summary.employer_excluded_total, 48_000);
        assert_eq!(
            excluded_entries(&outcome.entity_results, ExclusionReason::MultiEmployerSecondary),
            4
        );
        let group = &outcome.group_results[0];
        assert_eq!((group.counted_total, group.excluded_total), (12_000, 48_000));
        assert!(outcome.verify_conservation().is_ok());
    }

    #[test]
    fn test_repeated_mentions_count_once() {
        let older = NaiveDate::from_ymd_opt(2021, 3, 1);
        let newer = NaiveDate::from_ymd_opt(2023, 6, 1);
        let (arena, entities, resolutions) = build(vec![
            (
                Some(1),
                Row {
                    reported_on: older,
                    ..row("Acme Supply", Some("U1"), Some(900))
                },
            ),
            (
                Some(1),
                Row {
                    reported_on: newer,
                    ..row("ACME SUPPLY INC", Some("U1"), Some(750))
                },
            ),
            (Some(1), row("Acme Supply Co", None, None)),
        ]);
        let outcome = aggregate_all(&arena, &entities, &resolutions, &[]);
        let result = &outcome.entity_results[0];
        assert_eq!(result.counted_total, 750);
        assert_eq!(result.excluded_total, 900);
        assert_eq!(outcome.counted_size(CanonicalId(1)), 750);
        assert_eq!(outcome.summary.mentions_counted, 1);
        assert_eq!(outcome.summary.excluded_by_reason.get("DUPLICATE_MENTION"), Some(&900));
    }

    #[test]
    fn test_newer_report_without_size_does_not_hide_older_count() {
        let (arena, entities, resolutions) = build(vec![
            (
                Some(1),
                Row {
                    reported_on: NaiveDate::from_ymd_opt(2022, 1, 1),
                    ..row("Acme Supply", None, Some(500))
                },
            ),
            (
                Some(1),
                Row {
                    reported_on: NaiveDate::from_ymd_opt(2024, 1, 1),
                    ..row("ACME SUPPLY INC", None, None)
                },
            ),
        ]);
        let outcome = aggregate_all(&arena, &entities, &resolutions, &[]);
        let result = &outcome.entity_results[0];
        assert_eq!(result.counted_total, 500);
        assert_eq!(result.excluded_total, 0);
        let counted: Vec<&str> = result
            .provenance
            .iter()
            .filter(|p| p.inclusion == Inclusion::Included)
            .map(|p| p.source_id.as_str())
            .collect();
        assert_eq!(counted, vec!["case_participant:000"]);
        assert_eq!(outcome.summary.employer_counted_total, 500);
    }

    #[test]
    fn test_every_mention_gets_one_disposition() {
        let (arena, entities, resolutions) = build(vec![
            (Some(1), row("Acme Supply", None, Some(10))),
            (None, row("", None, Some(20))),
            (None, row("Acme Supplies West", None, Some(30))),
        ]);
        let outcome = aggregate_all(&arena, &entities, &resolutions, &[]);
        let ids: Vec<MentionId> = arena.iter().map(|(_, m)| m.id.clone()).collect();
        assert!(verify_no_silent_drops(&ids, &outcome.dispositions).is_ok());

        assert_eq!(outcome.summary.mentions_needing_review, 1);
        assert_eq!(outcome.summary.needs_review_reported_total, 30);
        assert_eq!(outcome.summary.employer_excluded_total, 20);
        assert_eq!(outcome.review_queue.len(), 2);

        let mut short = outcome.dispositions.clone();
        short.pop();
        assert!(verify_no_silent_drops(&ids, &short).is_err());
        let mut doubled = outcome.dispositions.clone();
        doubled.push(doubled[0].clone());
        assert!(verify_no_silent_drops(&ids, &doubled).is_err());
    }

    #[test]
    fn test_organization_rollup() {
        let federation = HierarchyNodeInput {
            node_id: "fed".to_string(),
            organization_key: "X".to_string(),
            designation: None,
            reported_size: Some(9_000_000),
            known_federation: true,
        };
        let local = |id: &str, size: u64| HierarchyNodeInput {
            node_id: id.to_string(),
            organization_key: "X".to_string(),
            designation: Some("LU".to_string()),
            reported_size: Some(size),
            known_federation: false,
        };
        let national = HierarchyNodeInput {
            node_id: "nat".to_string(),
            designation: Some("NHQ".to_string()),
            reported_size: Some(1_300_000),
            known_federation: false,
            ..federation.clone()
        };
        let nodes = vec![federation, national, local("a", 400_000), local("b", 500_000), local("c", 400_000)];

        let (arena, entities, resolutions) = build(Vec::new());
        let outcome = aggregate_all(&arena, &entities, &resolutions, &nodes);
        let org = &outcome.org_results[0];
        assert_eq!(org.entity_or_org_id, "org:X");
        assert_eq!(org.counted_total, 1_300_000);
        assert_eq!(org.excluded_total, 10_300_000);
        assert_eq!(excluded_entries(&outcome.org_results, ExclusionReason::Federation), 1);
        assert_eq!(excluded_entries(&outcome.org_results, ExclusionReason::HasLocalChildren), 1);
        assert_eq!(outcome.summary.membership_counted_total, 1_300_000);
        assert!(outcome.verify_conservation().is_ok());
    }
}
