// src/consolidation/hierarchy.rs - Local / intermediate / national classification of union filings
//
// A heuristic: designation codes and size thresholds stand in for the real affiliation
// structure, which the filings do not carry. Outputs say which rule fired for each node.
use log::warn;
use std::collections::{BTreeMap, HashSet};

use crate::models::consolidation::{ExclusionReason, HierarchyLevel, HierarchyNode, HierarchyNodeInput};
use crate::rules::CompiledRules;
use crate::utils::engine_config::EngineConfig;
use crate::utils::progress_bars::logging::PassLogger;

#[derive(Debug, Clone, Copy)]
pub struct HierarchyThresholds {
    pub large_org_threshold: u64,
    pub ambiguity_band: f64,
}

impl HierarchyThresholds {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            large_org_threshold: config.large_org_threshold,
            ambiguity_band: config.unclassified_ambiguity_band,
        }
    }
}

fn node(
    input: &HierarchyNodeInput,
    level: HierarchyLevel,
    exclusion_reason: Option<ExclusionReason>,
    classification_reason: String,
) -> HierarchyNode {
    HierarchyNode {
        node_id: input.node_id.clone(),
        organization_key: input.organization_key.clone(),
        level,
        count_in_total: exclusion_reason.is_none(),
        reported_size: input.reported_size,
        exclusion_reason,
        classification_reason,
    }
}

/// Classifies one filing from its own fields; first matching rule wins.
///
/// National nodes come back counted; whether they stay counted depends on their siblings,
/// which [`HierarchyDeduplicator::deduplicate`] decides.
pub fn classify_node(
    input: &HierarchyNodeInput,
    rules: &CompiledRules,
    thresholds: HierarchyThresholds,
) -> HierarchyNode {
    if input.known_federation || rules.is_federation(&input.organization_key) || rules.is_federation(&input.node_id) {
        return node(
            input,
            HierarchyLevel::Federation,
            Some(ExclusionReason::Federation),
            "known top-level federation".to_string(),
        );
    }

    let designation = input.designation.as_deref().map(str::trim).filter(|d| !d.is_empty());
    let unrecognized = match designation {
        Some(code) => match rules.designation_level(code) {
            Some(HierarchyLevel::Local) => {
                return node(input, HierarchyLevel::Local, None, format!("local designation '{}'", code))
            }
            Some(HierarchyLevel::Intermediate) => {
                return node(
                    input,
                    HierarchyLevel::Intermediate,
                    Some(ExclusionReason::IntermediateBody),
                    format!("intermediate designation '{}'", code),
                )
            }
            Some(_) => {
                return node(
                    input,
                    HierarchyLevel::National,
                    None,
                    format!("national designation '{}'", code),
                )
            }
            None => Some(code),
        },
        None => None,
    };

    let basis = match unrecognized {
        Some(code) => format!("unrecognized designation '{}'", code),
        None => "no designation".to_string(),
    };
    let threshold = thresholds.large_org_threshold;
    let band_floor = (threshold as f64 * (1.0 - thresholds.ambiguity_band)).ceil() as u64;
    match input.reported_size {
        None => node(
            input,
            HierarchyLevel::Unclassified,
            Some(ExclusionReason::AmbiguousHierarchyLevel),
            format!("{}, no reported size", basis),
        ),
        Some(size) if size >= threshold => node(
            input,
            HierarchyLevel::Unclassified,
            Some(ExclusionReason::AssumedNationalRollup),
            format!("{}, size {} at or above {}", basis, size, threshold),
        ),
        Some(size) if size >= band_floor => node(
            input,
            HierarchyLevel::Unclassified,
            Some(ExclusionReason::AmbiguousHierarchyLevel),
            format!("{}, size {} within the ambiguity band below {}", basis, size, threshold),
        ),
        Some(size) => node(
            input,
            HierarchyLevel::Unclassified,
            None,
            format!("{}, size {} below {}", basis, size, threshold),
        ),
    }
}

#[derive(Debug, Clone, Default)]
pub struct HierarchyOutcome {
    /// Sorted by (organization key, node id).
    pub nodes: Vec<HierarchyNode>,
    pub duplicates_skipped: usize,
}

impl HierarchyOutcome {
    pub fn by_organization(&self) -> BTreeMap<&str, Vec<&HierarchyNode>> {
        let mut orgs: BTreeMap<&str, Vec<&HierarchyNode>> = BTreeMap::new();
        for node in &self.nodes {
            orgs.entry(node.organization_key.as_str()).or_default().push(node);
        }
        orgs
    }
}

pub struct HierarchyDeduplicator<'a> {
    rules: &'a CompiledRules,
    thresholds: HierarchyThresholds,
}

impl<'a> HierarchyDeduplicator<'a> {
    pub fn new(rules: &'a CompiledRules, config: &EngineConfig) -> Self {
        Self {
            rules,
            thresholds: HierarchyThresholds::from_config(config),
        }
    }

    pub fn deduplicate(&self, inputs: &[HierarchyNodeInput]) -> HierarchyOutcome {
        let logger = PassLogger::stage("HIERARCHY", "🏛️");
        logger.log_phase("Classifying filings", Some(&format!("{} nodes", inputs.len())));

        let mut seen = HashSet::new();
        let mut duplicates_skipped = 0usize;
        let mut nodes: Vec<HierarchyNode> = Vec::with_capacity(inputs.len());
        for input in inputs {
            if !seen.insert(input.node_id.as_str()) {
                duplicates_skipped += 1;
                warn!("⚠️  Hierarchy node '{}' delivered more than once; keeping the first", input.node_id);
                continue;
            }
            nodes.push(classify_node(input, self.rules, self.thresholds));
        }

        let orgs_with_locals: HashSet<String> = nodes
            .iter()
            .filter(|n| n.level == HierarchyLevel::Local)
            .map(|n| n.organization_key.clone())
            .collect();
        let mut displaced = 0usize;
        for node in nodes
            .iter_mut()
            .filter(|n| n.level == HierarchyLevel::National && orgs_with_locals.contains(&n.organization_key))
        {
            node.count_in_total = false;
            node.exclusion_reason = Some(ExclusionReason::HasLocalChildren);
            node.classification_reason.push_str(", organization reports locals");
            displaced += 1;
        }

        nodes.sort_by(|a, b| {
            (a.organization_key.as_str(), a.node_id.as_str()).cmp(&(b.organization_key.as_str(), b.node_id.as_str()))
        });

        let mut by_level: BTreeMap<HierarchyLevel, usize> = BTreeMap::new();
        for n in &nodes {
            *by_level.entry(n.level).or_insert(0) += 1;
        }
        let ambiguous = nodes
            .iter()
            .filter(|n| n.exclusion_reason == Some(ExclusionReason::AmbiguousHierarchyLevel))
            .count();
        logger.log_data_quality_issue("hierarchy nodes with an ambiguous level", ambiguous);
        logger.log_completion(&format!(
            "{:?}; {} national totals displaced by their locals",
            by_level, displaced
        ));

        HierarchyOutcome {
            nodes,
            duplicates_skipped,
        }
    }
}
