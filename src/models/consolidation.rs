// src/models/consolidation.rs - Exclusion reasons, group roles, hierarchy nodes and rollups
use serde::{Deserialize, Serialize};

use crate::models::core::CanonicalId;

/// Machine-readable reason attached to every excluded count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExclusionReason {
    DuplicateMention,
    MultiEmployerSecondary,
    PlaceholderEntity,
    OutOfScopeJurisdiction,
    CorruptedData,
    Unlinkable,
    NeedsReview,
    Federation,
    IntermediateBody,
    HasLocalChildren,
    AssumedNationalRollup,
    AmbiguousHierarchyLevel,
}

impl ExclusionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExclusionReason::DuplicateMention => "DUPLICATE_MENTION",
            ExclusionReason::MultiEmployerSecondary => "MULTI_EMPLOYER_SECONDARY",
            ExclusionReason::PlaceholderEntity => "PLACEHOLDER_ENTITY",
            ExclusionReason::OutOfScopeJurisdiction => "OUT_OF_SCOPE_JURISDICTION",
            ExclusionReason::CorruptedData => "CORRUPTED_DATA",
            ExclusionReason::Unlinkable => "UNLINKABLE",
            ExclusionReason::NeedsReview => "NEEDS_REVIEW",
            ExclusionReason::Federation => "FEDERATION",
            ExclusionReason::IntermediateBody => "INTERMEDIATE_BODY",
            ExclusionReason::HasLocalChildren => "HAS_LOCAL_CHILDREN",
            ExclusionReason::AssumedNationalRollup => "ASSUMED_NATIONAL_ROLLUP",
            ExclusionReason::AmbiguousHierarchyLevel => "AMBIGUOUS_HIERARCHY_LEVEL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupRole {
    Primary,
    Secondary,
}

impl GroupRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupRole::Primary => "primary",
            GroupRole::Secondary => "secondary",
        }
    }
}

/// Why a set of entities was grouped together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBasis {
    Singleton,
    IdenticalSize,
    NearDuplicateSize,
    UmbrellaSignatory,
    RepeatedSizePattern,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupAssignment {
    pub canonical_id: CanonicalId,
    pub group_id: String,
    pub role: GroupRole,
    pub exclusion_reason: Option<ExclusionReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiEmployerGroup {
    pub group_id: String,
    pub union_key: Option<String>,
    pub basis: GroupBasis,
    /// `None` only for singleton groups whose entity is excluded outright. Such groups have no
    /// counted member, so they intentionally carry no primary.
    pub primary: Option<CanonicalId>,
    pub members: Vec<CanonicalId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HierarchyLevel {
    Local,
    Intermediate,
    National,
    Federation,
    Unclassified,
}

impl HierarchyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HierarchyLevel::Local => "local",
            HierarchyLevel::Intermediate => "intermediate",
            HierarchyLevel::National => "national",
            HierarchyLevel::Federation => "federation",
            HierarchyLevel::Unclassified => "unclassified",
        }
    }
}

/// One union filing record as delivered upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyNodeInput {
    pub node_id: String,
    /// National affiliation the filing rolls up to.
    pub organization_key: String,
    #[serde(default)]
    pub designation: Option<String>,
    #[serde(default)]
    pub reported_size: Option<u64>,
    #[serde(default)]
    pub known_federation: bool,
}

/// A classified filing record; the hierarchy output table row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyNode {
    pub node_id: String,
    pub organization_key: String,
    pub level: HierarchyLevel,
    pub count_in_total: bool,
    pub reported_size: Option<u64>,
    pub exclusion_reason: Option<ExclusionReason>,
    pub classification_reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inclusion {
    Included,
    Excluded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    /// Mention id, node id or canonical id, depending on the rollup.
    pub source_id: String,
    pub inclusion: Inclusion,
    pub reported: u64,
    pub reason: Option<ExclusionReason>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub entity_or_org_id: String,
    pub counted_total: u64,
    pub excluded_total: u64,
    pub total_reported: u64,
    pub provenance: Vec<ProvenanceEntry>,
}

impl AggregationResult {
    pub fn new(entity_or_org_id: impl Into<String>) -> Self {
        Self {
            entity_or_org_id: entity_or_org_id.into(),
            counted_total: 0,
            excluded_total: 0,
            total_reported: 0,
            provenance: Vec::new(),
        }
    }

    pub fn include(&mut self, source_id: impl Into<String>, reported: u64) {
        self.counted_total = self.counted_total.saturating_add(reported);
        self.total_reported = self.total_reported.saturating_add(reported);
        self.provenance.push(ProvenanceEntry {
            source_id: source_id.into(),
            inclusion: Inclusion::Included,
            reported,
            reason: None,
        });
    }

    pub fn exclude(&mut self, source_id: impl Into<String>, reported: u64, reason: ExclusionReason) {
        self.excluded_total = self.excluded_total.saturating_add(reported);
        self.total_reported = self.total_reported.saturating_add(reported);
        self.provenance.push(ProvenanceEntry {
            source_id: source_id.into(),
            inclusion: Inclusion::Excluded,
            reported,
            reason: Some(reason),
        });
    }

    /// `counted + excluded == total`, and the provenance trail adds up to the same numbers.
    pub fn is_conserved(&self) -> bool {
        let (included, excluded) = self.provenance.iter().fold((0u64, 0u64), |(i, e), p| {
            match p.inclusion {
                Inclusion::Included => (i.saturating_add(p.reported), e),
                Inclusion::Excluded => (i, e.saturating_add(p.reported)),
            }
        });
        let reasons_present = self
            .provenance
            .iter()
            .all(|p| (p.inclusion == Inclusion::Excluded) == p.reason.is_some());
        self.counted_total.checked_add(self.excluded_total) == Some(self.total_reported)
            && included == self.counted_total
            && excluded == self.excluded_total
            && reasons_present
    }
}

/// Terminal disposition of one input mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", content = "reason", rename_all = "snake_case")]
pub enum Disposition {
    Counted,
    Excluded(ExclusionReason),
    NeedsReview,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregation_conservation() {
        let mut result = AggregationResult::new("entity:CE00000001");
        result.include("filer:1", 120);
        result.exclude("filer:2", 120, ExclusionReason::DuplicateMention);
        result.exclude("filer:3", 0, ExclusionReason::DuplicateMention);
        assert_eq!(result.counted_total, 120);
        assert_eq!(result.excluded_total, 120);
        assert_eq!(result.total_reported, 240);
        assert!(result.is_conserved());

        result.counted_total += 1;
        assert!(!result.is_conserved());
    }

    #[test]
    fn test_huge_reports_saturate_instead_of_overflowing() {
        let mut result = AggregationResult::new("org:X");
        result.include("a", u64::MAX - 1);
        result.include("b", 10);
        assert_eq!(result.counted_total, u64::MAX);
        assert_eq!(result.total_reported, u64::MAX);
        assert!(result.is_conserved());

        result.exclude("c", 5, ExclusionReason::DuplicateMention);
        assert_eq!(result.total_reported, u64::MAX);
        assert!(!result.is_conserved());
    }

    #[test]
    fn test_reason_wire_format() {
        assert_eq!(
            serde_json::to_string(&ExclusionReason::MultiEmployerSecondary).unwrap(),
            "\"MULTI_EMPLOYER_SECONDARY\""
        );
        assert_eq!(ExclusionReason::HasLocalChildren.as_str(), "HAS_LOCAL_CHILDREN");
    }
}
