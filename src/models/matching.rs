// src/models/matching.rs - Match edges, blocking passes and per-mention resolutions
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::core::{CanonicalId, MentionId};

/// Blocking key families, in the order their resolution passes run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKeyKind {
    /// state + first 4 normalized-name characters
    StatePrefix4,
    /// state + first 3 normalized-name characters
    StatePrefix3,
    /// postal code + leading street-number token
    StreetZip,
}

impl BlockKeyKind {
    pub const PASSES: [BlockKeyKind; 3] = [
        BlockKeyKind::StatePrefix4,
        BlockKeyKind::StatePrefix3,
        BlockKeyKind::StreetZip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKeyKind::StatePrefix4 => "state_prefix4",
            BlockKeyKind::StatePrefix3 => "state_prefix3",
            BlockKeyKind::StreetZip => "street_zip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::PASSES.into_iter().find(|k| k.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchMethod {
    BlockExact,
    FuzzyName,
    AddressBlock,
    StreetZip,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMethod::BlockExact => "block-exact",
            MatchMethod::FuzzyName => "fuzzy-name",
            MatchMethod::AddressBlock => "address-block",
            MatchMethod::StreetZip => "street-zip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "block-exact" => Some(MatchMethod::BlockExact),
            "fuzzy-name" => Some(MatchMethod::FuzzyName),
            "address-block" => Some(MatchMethod::AddressBlock),
            "street-zip" => Some(MatchMethod::StreetZip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeState {
    Proposed,
    Accepted,
    Rejected,
    NeedsReview,
}

impl EdgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeState::Proposed => "proposed",
            EdgeState::Accepted => "accepted",
            EdgeState::Rejected => "rejected",
            EdgeState::NeedsReview => "needs-review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "proposed" => Some(EdgeState::Proposed),
            "accepted" => Some(EdgeState::Accepted),
            "rejected" => Some(EdgeState::Rejected),
            "needs-review" => Some(EdgeState::NeedsReview),
            _ => None,
        }
    }
}

/// The other side of a match edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum EdgeTarget {
    Entity(CanonicalId),
    Mention(MentionId),
}

impl fmt::Display for EdgeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeTarget::Entity(id) => write!(f, "entity:{}", id),
            EdgeTarget::Mention(id) => write!(f, "{}", id),
        }
    }
}

/// One finalized row of the append-only match audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEdge {
    pub seq: u64,
    pub mention: MentionId,
    pub target: EdgeTarget,
    pub method: MatchMethod,
    pub score: f64,
    pub state: EdgeState,
    pub block_kind: BlockKeyKind,
    pub block_key: String,
}

/// Terminal outcome of resolution for one mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "status", content = "canonical_id", rename_all = "snake_case")]
pub enum Resolution {
    Linked(CanonicalId),
    NeedsReview,
    Unlinkable,
    Corrupted,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Linked(_) => "linked",
            Resolution::NeedsReview => "needs_review",
            Resolution::Unlinkable => "unlinkable",
            Resolution::Corrupted => "corrupted",
        }
    }

    pub fn canonical_id(&self) -> Option<CanonicalId> {
        match self {
            Resolution::Linked(id) => Some(*id),
            _ => None,
        }
    }

    pub fn from_parts(status: &str, canonical_id: Option<CanonicalId>) -> Option<Self> {
        match (status, canonical_id) {
            ("linked", Some(id)) => Some(Resolution::Linked(id)),
            ("needs_review", _) => Some(Resolution::NeedsReview),
            ("unlinkable", _) => Some(Resolution::Unlinkable),
            ("corrupted", _) => Some(Resolution::Corrupted),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&MatchMethod::AddressBlock).unwrap(),
            "\"address-block\""
        );
        assert_eq!(EdgeState::parse("needs-review"), Some(EdgeState::NeedsReview));
        assert_eq!(BlockKeyKind::parse("street_zip"), Some(BlockKeyKind::StreetZip));
        assert_eq!(
            EdgeTarget::Entity(CanonicalId(7)).to_string(),
            "entity:CE00000007"
        );
    }

    #[test]
    fn test_resolution_parts() {
        let linked = Resolution::Linked(CanonicalId(3));
        assert_eq!(
            Resolution::from_parts(linked.as_str(), linked.canonical_id()),
            Some(linked)
        );
        assert_eq!(Resolution::from_parts("linked", None), None);
        assert_eq!(
            Resolution::from_parts("needs_review", None),
            Some(Resolution::NeedsReview)
        );
    }
}
