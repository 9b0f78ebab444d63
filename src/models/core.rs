// src/models/core.rs - Source mentions, canonical identifiers and the mention arena
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Upstream dataset family a mention was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    InspectionRecord,
    CaseParticipant,
    Filer,
    RegistryEntity,
    FirmographicRecord,
    DisclosureFiler,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::InspectionRecord => "inspection_record",
            SourceKind::CaseParticipant => "case_participant",
            SourceKind::Filer => "filer",
            SourceKind::RegistryEntity => "registry_entity",
            SourceKind::FirmographicRecord => "firmographic_record",
            SourceKind::DisclosureFiler => "disclosure_filer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inspection_record" => Some(SourceKind::InspectionRecord),
            "case_participant" => Some(SourceKind::CaseParticipant),
            "filer" => Some(SourceKind::Filer),
            "registry_entity" => Some(SourceKind::RegistryEntity),
            "firmographic_record" => Some(SourceKind::FirmographicRecord),
            "disclosure_filer" => Some(SourceKind::DisclosureFiler),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable mention identity: `{source_kind}:{source_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MentionId(pub String);

impl MentionId {
    pub fn new(kind: SourceKind, source_id: &str) -> Self {
        MentionId(format!("{}:{}", kind.as_str(), source_id.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MentionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalId(pub u64);

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CE{:08}", self.0)
    }
}

/// Index of a mention inside the run's arena.
pub type MentionIdx = usize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
}

/// A mention as delivered by an upstream loader: parsed, but not normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMention {
    pub source_kind: SourceKind,
    pub source_id: String,
    pub raw_name: String,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub reported_size: Option<u64>,
    #[serde(default)]
    pub group_hint: Option<String>,
    /// Affiliated union / bargaining-unit filing identifier.
    #[serde(default)]
    pub union_key: Option<String>,
    #[serde(default)]
    pub reported_on: Option<NaiveDate>,
    /// Upstream sector classification (`private`, `public`, `federal`, ...).
    #[serde(default)]
    pub jurisdiction: Option<String>,
}

/// Input envelope carrying the resumption coordinates of one mention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentionRecord {
    #[serde(default)]
    pub partition: u32,
    pub offset: u64,
    pub mention: RawMention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MentionQuality {
    Linkable,
    /// Normalization collapsed the name to nothing usable.
    Unlinkable,
    /// Over-long name or a known corruption marker.
    Corrupted,
}

/// A normalized, immutable mention owned by the pipeline run that created it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMention {
    pub id: MentionId,
    pub source_kind: SourceKind,
    pub source_id: String,
    pub partition: u32,
    pub offset: u64,
    pub raw_name: String,
    pub normalized_name: String,
    /// Normalized location key.
    pub location: Location,
    pub reported_size: Option<u64>,
    pub group_hint: Option<String>,
    pub union_key: Option<String>,
    pub reported_on: Option<NaiveDate>,
    pub jurisdiction: Option<String>,
    pub quality: MentionQuality,
}

impl SourceMention {
    pub fn is_linkable(&self) -> bool {
        self.quality == MentionQuality::Linkable
    }

    pub fn size_or_zero(&self) -> u64 {
        self.reported_size.unwrap_or(0)
    }
}

/// Append-only arena of mentions; everything else refers to mentions by index.
#[derive(Debug, Default)]
pub struct MentionArena {
    mentions: Vec<SourceMention>,
    by_id: HashMap<MentionId, MentionIdx>,
}

impl MentionArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` when a mention with the same id is already present.
    pub fn push(&mut self, mention: SourceMention) -> Option<MentionIdx> {
        if self.by_id.contains_key(&mention.id) {
            return None;
        }
        let idx = self.mentions.len();
        self.by_id.insert(mention.id.clone(), idx);
        self.mentions.push(mention);
        Some(idx)
    }

    pub fn get(&self, idx: MentionIdx) -> &SourceMention {
        &self.mentions[idx]
    }

    pub fn index_of(&self, id: &MentionId) -> Option<MentionIdx> {
        self.by_id.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.mentions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mentions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MentionIdx, &SourceMention)> {
        self.mentions.iter().enumerate()
    }

    /// Drops every mention pushed after `len`. Used to roll back a failed batch.
    pub fn truncate(&mut self, len: usize) {
        for m in self.mentions.drain(len.min(self.mentions.len())..) {
            self.by_id.remove(&m.id);
        }
    }
}
