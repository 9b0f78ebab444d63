// src/consolidation/multi_employer.rs - Collapses worker counts repeated across the signatories
// of one multi-employer agreement.
use chrono::NaiveDate;
use log::{debug, info};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, HashMap};

use crate::clustering::entity_store::{CanonicalEntity, EntityStore};
use crate::models::consolidation::{ExclusionReason, GroupAssignment, GroupBasis, GroupRole, MultiEmployerGroup};
use crate::models::core::{CanonicalId, MentionArena, MentionIdx};
use crate::rules::CompiledRules;
use crate::utils::engine_config::EngineConfig;
use crate::utils::progress_bars::logging::PassLogger;

/// Mentions that report a size first; among those the most recent report, then the largest,
/// then the lowest mention id.
fn report_order(arena: &MentionArena, a: MentionIdx, b: MentionIdx) -> Ordering {
    let (ma, mb) = (arena.get(a), arena.get(b));
    mb.reported_size
        .is_some()
        .cmp(&ma.reported_size.is_some())
        .then(mb.reported_on.cmp(&ma.reported_on))
        .then(mb.reported_size.cmp(&ma.reported_size))
        .then(ma.id.cmp(&mb.id))
}

/// The member whose report stands for the entity.
pub fn representative_mention(arena: &MentionArena, members: &[MentionIdx]) -> Option<MentionIdx> {
    members.iter().copied().min_by(|&a, &b| report_order(arena, a, b))
}

/// What the deduplicator needs to know about one canonical entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityProfile {
    pub canonical_id: CanonicalId,
    pub representative: MentionIdx,
    pub union_key: Option<String>,
    pub size: Option<u64>,
    pub reported_on: Option<NaiveDate>,
    pub umbrella: bool,
    pub placeholder: bool,
    pub jurisdiction: Option<String>,
}

impl EntityProfile {
    pub fn build(arena: &MentionArena, entity: &CanonicalEntity, rules: &CompiledRules) -> Option<Self> {
        let representative = representative_mention(arena, &entity.members)?;
        let rep = arena.get(representative);

        // Members in representative-first order, for the fields a single report may lack.
        let mut ordered = entity.members.clone();
        ordered.sort_by(|&a, &b| report_order(arena, a, b));
        let union_key = ordered.iter().find_map(|&idx| arena.get(idx).union_key.clone());

        let umbrella = entity.members.iter().any(|&idx| {
            let m = arena.get(idx);
            rules.is_umbrella(&m.normalized_name) || m.group_hint.as_deref().is_some_and(|h| rules.is_umbrella(h))
        });
        let placeholder = rules.is_placeholder(&rep.normalized_name)
            || rep.group_hint.as_deref().is_some_and(|h| rules.is_placeholder(h));

        Some(Self {
            canonical_id: entity.canonical_id,
            representative,
            union_key,
            size: rep.reported_size,
            reported_on: rep.reported_on,
            umbrella,
            placeholder,
            jurisdiction: entity_jurisdiction(arena, &entity.members, &rep.normalized_name, rules),
        })
    }
}

/// Majority of the explicit values (ties to the lowest), else the first matching name rule.
fn entity_jurisdiction(
    arena: &MentionArena,
    members: &[MentionIdx],
    representative_name: &str,
    rules: &CompiledRules,
) -> Option<String> {
    let mut votes: BTreeMap<&str, usize> = BTreeMap::new();
    for &idx in members {
        if let Some(j) = arena.get(idx).jurisdiction.as_deref() {
            *votes.entry(j).or_insert(0) += 1;
        }
    }
    let mut best: Option<(&str, usize)> = None;
    for (j, count) in votes {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((j, count));
        }
    }
    best.map(|(j, _)| j.to_string())
        .or_else(|| rules.jurisdiction_for(representative_name).map(str::to_string))
}

#[derive(Debug, Clone, Default)]
pub struct MultiEmployerOutcome {
    /// One per canonical entity, by canonical id.
    pub assignments: Vec<GroupAssignment>,
    /// By group id.
    pub groups: Vec<MultiEmployerGroup>,
    pub profiles: BTreeMap<CanonicalId, EntityProfile>,
}

impl MultiEmployerOutcome {
    pub fn assignment(&self, canonical_id: CanonicalId) -> Option<&GroupAssignment> {
        self.assignments
            .binary_search_by(|a| a.canonical_id.cmp(&canonical_id))
            .ok()
            .map(|i| &self.assignments[i])
    }
}

/// A run of entities under one union whose sizes are close enough to be one report.
#[derive(Debug, Clone)]
struct SizeCluster {
    members: Vec<(u64, CanonicalId)>,
}

impl SizeCluster {
    fn max_size(&self) -> u64 {
        self.members.iter().map(|(s, _)| *s).max().unwrap_or(0)
    }
}

/// Single-linkage clustering over sorted sizes: neighbours join when `b - a <= tolerance * b`.
fn cluster_sizes(mut entries: Vec<(u64, CanonicalId)>, tolerance: f64) -> Vec<SizeCluster> {
    entries.sort();
    let mut clusters: Vec<SizeCluster> = Vec::new();
    for (size, id) in entries {
        let joins = clusters
            .last()
            .and_then(|c| c.members.last())
            .is_some_and(|&(prev, _)| size == prev || (size - prev) as f64 <= tolerance * size as f64);
        match clusters.last_mut() {
            Some(current) if joins => current.members.push((size, id)),
            _ => clusters.push(SizeCluster {
                members: vec![(size, id)],
            }),
        }
    }
    clusters
}

pub struct MultiEmployerDeduplicator<'a> {
    rules: &'a CompiledRules,
    config: &'a EngineConfig,
}

impl<'a> MultiEmployerDeduplicator<'a> {
    pub fn new(rules: &'a CompiledRules, config: &'a EngineConfig) -> Self {
        Self { rules, config }
    }

    pub fn deduplicate(&self, arena: &MentionArena, entities: &EntityStore) -> MultiEmployerOutcome {
        let logger = PassLogger::stage("MULTI-EMPLOYER", "🏗️");
        logger.log_phase("Profiling entities", Some(&format!("{} entities", entities.len())));

        let profiles: BTreeMap<CanonicalId, EntityProfile> = entities
            .iter()
            .filter_map(|e| EntityProfile::build(arena, e, self.rules))
            .map(|p| (p.canonical_id, p))
            .collect();

        let mut assignments: BTreeMap<CanonicalId, GroupAssignment> = BTreeMap::new();
        let mut groups: Vec<MultiEmployerGroup> = Vec::new();
        let mut by_union: BTreeMap<&str, Vec<(u64, CanonicalId)>> = BTreeMap::new();
        let (mut placeholders, mut out_of_scope) = (0usize, 0usize);

        for profile in profiles.values() {
            let cid = profile.canonical_id;
            let excluded = if profile.placeholder {
                placeholders += 1;
                Some(ExclusionReason::PlaceholderEntity)
            } else if profile
                .jurisdiction
                .as_deref()
                .is_some_and(|j| !self.config.is_in_scope(j))
            {
                out_of_scope += 1;
                Some(ExclusionReason::OutOfScopeJurisdiction)
            } else {
                None
            };

            if let Some(reason) = excluded {
                let group_id = format!("entity-{}", cid);
                groups.push(MultiEmployerGroup {
                    group_id: group_id.clone(),
                    union_key: profile.union_key.clone(),
                    basis: GroupBasis::Singleton,
                    primary: None,
                    members: vec![cid],
                });
                assignments.insert(
                    cid,
                    GroupAssignment {
                        canonical_id: cid,
                        group_id,
                        role: GroupRole::Secondary,
                        exclusion_reason: Some(reason),
                    },
                );
                continue;
            }

            match (profile.union_key.as_deref(), profile.size) {
                (Some(union_key), Some(size)) => by_union.entry(union_key).or_default().push((size, cid)),
                _ => {
                    let group_id = format!("entity-{}", cid);
                    groups.push(MultiEmployerGroup {
                        group_id: group_id.clone(),
                        union_key: profile.union_key.clone(),
                        basis: GroupBasis::Singleton,
                        primary: Some(cid),
                        members: vec![cid],
                    });
                    assignments.insert(
                        cid,
                        GroupAssignment {
                            canonical_id: cid,
                            group_id,
                            role: GroupRole::Primary,
                            exclusion_reason: None,
                        },
                    );
                }
            }
        }
        logger.log_data_quality_issue("placeholder entity names", placeholders);
        if out_of_scope > 0 {
            info!("🗺️  {} entities fall outside the in-scope jurisdictions", out_of_scope);
        }

        logger.log_phase("Clustering sizes per union", Some(&format!("{} unions", by_union.len())));
        for (union_key, entries) in by_union {
            let clusters = self.attach_umbrellas(cluster_sizes(entries, self.config.size_tolerance), &profiles);
            for cluster in clusters {
                let group = self.build_group(union_key, &cluster, &profiles);
                for &(_, cid) in &cluster.members {
                    let is_primary = group.primary == Some(cid);
                    assignments.insert(
                        cid,
                        GroupAssignment {
                            canonical_id: cid,
                            group_id: group.group_id.clone(),
                            role: if is_primary { GroupRole::Primary } else { GroupRole::Secondary },
                            exclusion_reason: (!is_primary).then_some(ExclusionReason::MultiEmployerSecondary),
                        },
                    );
                }
                groups.push(group);
            }
        }

        groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        let collapsed = groups.iter().filter(|g| g.members.len() > 1).count();
        logger.log_completion(&format!(
            "{} groups, {} collapse more than one entity",
            groups.len(),
            collapsed
        ));

        MultiEmployerOutcome {
            assignments: assignments.into_values().collect(),
            groups,
            profiles,
        }
    }

    /// Moves each lone umbrella entity into the cluster with the closest size not above its own.
    fn attach_umbrellas(
        &self,
        clusters: Vec<SizeCluster>,
        profiles: &BTreeMap<CanonicalId, EntityProfile>,
    ) -> Vec<SizeCluster> {
        let is_lone_umbrella = |c: &SizeCluster| {
            c.members.len() == 1 && profiles.get(&c.members[0].1).is_some_and(|p| p.umbrella)
        };
        let (lone, mut kept): (Vec<SizeCluster>, Vec<SizeCluster>) =
            clusters.into_iter().partition(|c| is_lone_umbrella(c));

        for umbrella in lone {
            let (size, cid) = umbrella.members[0];
            let target = kept
                .iter()
                .enumerate()
                .filter(|(_, c)| c.max_size() <= size)
                .max_by_key(|(_, c)| (c.max_size(), Reverse(c.members[0].1)))
                .map(|(i, _)| i);
            match target {
                Some(i) => {
                    let cluster = &mut kept[i];
                    debug!("Umbrella entity {} ({}) joins the {} cluster", cid, size, cluster.max_size());
                    cluster.members.push((size, cid));
                    cluster.members.sort();
                }
                None => kept.push(umbrella),
            }
        }
        kept.sort_by_key(|c| c.members.first().copied());
        kept
    }

    fn build_group(
        &self,
        union_key: &str,
        cluster: &SizeCluster,
        profiles: &BTreeMap<CanonicalId, EntityProfile>,
    ) -> MultiEmployerGroup {
        let members: Vec<CanonicalId> = {
            let mut ids: Vec<CanonicalId> = cluster.members.iter().map(|&(_, cid)| cid).collect();
            ids.sort();
            ids
        };
        let dates: HashMap<CanonicalId, Option<NaiveDate>> =
            members.iter().map(|cid| (*cid, profiles.get(cid).and_then(|p| p.reported_on))).collect();

        let primary = cluster
            .members
            .iter()
            .copied()
            .min_by(|&(sa, a), &(sb, b)| {
                sb.cmp(&sa)
                    .then(dates.get(&b).copied().flatten().cmp(&dates.get(&a).copied().flatten()))
                    .then(a.cmp(&b))
            })
            .map(|(_, cid)| cid);

        let any_umbrella = members.iter().any(|cid| profiles.get(cid).is_some_and(|p| p.umbrella));
        let all_identical = cluster.members.windows(2).all(|w| w[0].0 == w[1].0);
        let basis = if members.len() == 1 {
            GroupBasis::Singleton
        } else if members.len() >= self.config.repeated_size_threshold {
            GroupBasis::RepeatedSizePattern
        } else if any_umbrella {
            GroupBasis::UmbrellaSignatory
        } else if all_identical {
            GroupBasis::IdenticalSize
        } else {
            GroupBasis::NearDuplicateSize
        };

        MultiEmployerGroup {
            group_id: format!("{}#{}", union_key, cluster.max_size()),
            union_key: Some(union_key.to_string()),
            basis,
            primary,
            members,
        }
    }
}
