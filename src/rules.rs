// src/rules.rs - Versioned classification rules (name tokens, placeholder/umbrella patterns, designations)
//
// Everything the normalizer and the deduplicators treat as "known text" lives here as data.
// The defaults can be replaced wholesale by a JSON file named in LINKAGE_RULES_PATH.

use anyhow::{bail, Context, Result};
use log::{info, warn};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::env;
use std::fs;
use std::path::Path;

use crate::models::consolidation::HierarchyLevel;

pub const DEFAULT_RULES_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JurisdictionPattern {
    pub pattern: String,
    pub jurisdiction: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRules {
    pub version: u32,
    /// Stripped from the start of a lower-cased name.
    pub noise_prefixes: Vec<String>,
    /// Whole tokens removed from normalized names.
    pub legal_suffixes: Vec<String>,
    /// Leading tokens removed from normalized names.
    pub leading_articles: Vec<String>,
    /// Token → expansion.
    pub abbreviations: BTreeMap<String, String>,
    /// Substrings that mark a raw name as corrupted.
    pub corruption_markers: Vec<String>,
    /// Regexes over normalized names that denote no real bargaining unit.
    pub placeholder_patterns: Vec<String>,
    /// Regexes over normalized names / group hints that denote multi-employer umbrellas.
    pub umbrella_patterns: Vec<String>,
    pub jurisdiction_patterns: Vec<JurisdictionPattern>,
    /// Organization keys or node ids of top-level federations.
    pub federation_identifiers: Vec<String>,
    pub local_designations: Vec<String>,
    pub intermediate_designations: Vec<String>,
    pub national_designations: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for ClassificationRules {
    fn default() -> Self {
        let abbreviations = [
            ("ctr", "center"),
            ("cntr", "center"),
            ("assoc", "association"),
            ("assn", "association"),
            ("dept", "department"),
            ("dpt", "department"),
            ("intl", "international"),
            ("natl", "national"),
            ("svc", "service"),
            ("svcs", "services"),
            ("univ", "university"),
            ("hosp", "hospital"),
            ("mfg", "manufacturing"),
            ("bros", "brothers"),
            ("mgmt", "management"),
            ("constr", "construction"),
            ("dist", "district"),
            ("amer", "american"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            version: DEFAULT_RULES_VERSION,
            noise_prefixes: strings(&["zzz - ", "zzz ", "re-add ", "dup - ", "do not use "]),
            legal_suffixes: strings(&[
                "inc", "incorporated", "llc", "corp", "corporation", "co", "company", "ltd",
                "limited", "lp", "llp", "lllp", "pc", "pllc", "plc", "pa", "dba",
            ]),
            leading_articles: strings(&["the"]),
            abbreviations,
            corruption_markers: strings(&["\u{fffd}", "#name?", "#value!", "<?xml", "<html", "\\x00"]),
            placeholder_patterns: strings(&[
                r"^(unknown|none|n a|na|various|varies|see attached|see schedule|tbd|to be determined|not applicable|not available|confidential|withheld|redacted|test)$",
                r"^(unknown|unnamed|no) (employer|company|name)$",
                r"^employer name (withheld|redacted|unknown)$",
            ]),
            umbrella_patterns: strings(&[
                r"\ball signator(y|ies)\b",
                r"\bmulti ?employer\b",
                r"\bmultiple employers\b",
                r"\bvarious (employers|contractors|signatories)\b",
                r"\bsignatory (employers|contractors)\b",
                r"\bemployers association\b",
                r"\bcontractors association\b",
            ]),
            jurisdiction_patterns: vec![
                JurisdictionPattern {
                    pattern: r"^(city|town|village|county|borough|township|state|commonwealth) of\b".to_string(),
                    jurisdiction: "public".to_string(),
                },
                JurisdictionPattern {
                    pattern: r"\b(school district|public schools|board of education|transit authority)\b".to_string(),
                    jurisdiction: "public".to_string(),
                },
                JurisdictionPattern {
                    pattern: r"^(u s|united states|us) (postal service|department|army|navy|air force)\b".to_string(),
                    jurisdiction: "federal".to_string(),
                },
                JurisdictionPattern {
                    pattern: r"\b(railroad|railway|airlines?|air lines)\b".to_string(),
                    jurisdiction: "railway_airline".to_string(),
                },
            ],
            federation_identifiers: strings(&["afl-cio", "aflcio", "soc", "ctw", "change to win"]),
            local_designations: strings(&[
                "LU", "L", "LL", "LG", "LODGE", "BR", "BRANCH", "CH", "CHAPTER", "DIV", "SLG",
                "SL", "UNIT", "LOCAL", "GRP",
            ]),
            intermediate_designations: strings(&[
                "DC", "JC", "C", "COUNCIL", "CONF", "SC", "D", "DLG", "GC", "SA", "SBA", "JB",
                "RC", "BCTC", "FED", "LEG",
            ]),
            national_designations: strings(&["NHQ", "HQ", "NATL", "INTL", "NU", "IU", "I"]),
        }
    }
}

impl ClassificationRules {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read classification rules from {}", path.display()))?;
        let rules: ClassificationRules = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse classification rules in {}", path.display()))?;
        Ok(rules)
    }

    /// Uses LINKAGE_RULES_PATH when set, the built-in defaults otherwise.
    pub fn load_from_env() -> Result<Self> {
        match env::var("LINKAGE_RULES_PATH") {
            Ok(path) if !path.trim().is_empty() => {
                let rules = Self::from_json_file(Path::new(path.trim()))?;
                info!("📚 Loaded classification rules v{} from {}", rules.version, path.trim());
                Ok(rules)
            }
            _ => {
                info!("📚 Using built-in classification rules v{}", DEFAULT_RULES_VERSION);
                Ok(Self::default())
            }
        }
    }

    pub fn compile(&self) -> Result<CompiledRules> {
        let compile_all = |patterns: &[String], what: &str| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    RegexBuilder::new(p)
                        .case_insensitive(true)
                        .build()
                        .with_context(|| format!("Invalid {} pattern: '{}'", what, p))
                })
                .collect()
        };

        let upper_set = |codes: &[String]| -> HashSet<String> {
            codes.iter().map(|c| designation_code(c)).filter(|c| !c.is_empty()).collect()
        };

        let local = upper_set(&self.local_designations);
        let intermediate = upper_set(&self.intermediate_designations);
        let national = upper_set(&self.national_designations);
        for code in &local {
            if intermediate.contains(code) || national.contains(code) {
                bail!("Designation code '{}' is listed under more than one hierarchy level", code);
            }
        }
        if let Some(code) = intermediate.intersection(&national).next() {
            bail!("Designation code '{}' is listed under more than one hierarchy level", code);
        }

        let jurisdiction = self
            .jurisdiction_patterns
            .iter()
            .map(|jp| {
                RegexBuilder::new(&jp.pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|re| (re, jp.jurisdiction.trim().to_lowercase()))
                    .with_context(|| format!("Invalid jurisdiction pattern: '{}'", jp.pattern))
            })
            .collect::<Result<Vec<_>>>()?;

        if self.placeholder_patterns.is_empty() {
            warn!("⚠️ Classification rules v{} define no placeholder patterns", self.version);
        }

        Ok(CompiledRules {
            version: self.version,
            noise_prefixes: self.noise_prefixes.iter().map(|p| p.to_lowercase()).collect(),
            legal_suffixes: self.legal_suffixes.iter().map(|s| s.to_lowercase()).collect(),
            leading_articles: self.leading_articles.iter().map(|s| s.to_lowercase()).collect(),
            abbreviations: self
                .abbreviations
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.to_lowercase()))
                .collect(),
            corruption_markers: self.corruption_markers.iter().map(|m| m.to_lowercase()).collect(),
            placeholder: compile_all(&self.placeholder_patterns, "placeholder")?,
            umbrella: compile_all(&self.umbrella_patterns, "umbrella")?,
            jurisdiction,
            federation: self
                .federation_identifiers
                .iter()
                .map(|f| f.trim().to_lowercase())
                .collect(),
            local_designations: local,
            intermediate_designations: intermediate,
            national_designations: national,
        })
    }
}

/// Canonical form of a designation code: upper-cased, alphanumerics only.
pub fn designation_code(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

/// Rules ready for matching; shared read-only across workers.
#[derive(Debug, Clone)]
pub struct CompiledRules {
    pub version: u32,
    pub noise_prefixes: Vec<String>,
    pub legal_suffixes: HashSet<String>,
    pub leading_articles: HashSet<String>,
    pub abbreviations: HashMap<String, String>,
    pub corruption_markers: Vec<String>,
    pub placeholder: Vec<Regex>,
    pub umbrella: Vec<Regex>,
    pub jurisdiction: Vec<(Regex, String)>,
    pub federation: HashSet<String>,
    pub local_designations: HashSet<String>,
    pub intermediate_designations: HashSet<String>,
    pub national_designations: HashSet<String>,
}

impl CompiledRules {
    pub fn is_placeholder(&self, normalized_name: &str) -> bool {
        self.placeholder.iter().any(|re| re.is_match(normalized_name))
    }

    pub fn is_umbrella(&self, text: &str) -> bool {
        self.umbrella.iter().any(|re| re.is_match(text))
    }

    pub fn jurisdiction_for(&self, normalized_name: &str) -> Option<&str> {
        self.jurisdiction
            .iter()
            .find(|(re, _)| re.is_match(normalized_name))
            .map(|(_, j)| j.as_str())
    }

    pub fn is_federation(&self, identifier: &str) -> bool {
        self.federation.contains(&identifier.trim().to_lowercase())
    }

    /// Hierarchy level named by a designation code, if any rule recognizes it.
    pub fn designation_level(&self, designation: &str) -> Option<HierarchyLevel> {
        let code = designation_code(designation);
        if self.local_designations.contains(&code) {
            Some(HierarchyLevel::Local)
        } else if self.intermediate_designations.contains(&code) {
            Some(HierarchyLevel::Intermediate)
        } else if self.national_designations.contains(&code) {
            Some(HierarchyLevel::National)
        } else {
            None
        }
    }

    pub fn has_corruption_marker(&self, raw_name: &str) -> bool {
        let lower = raw_name.to_lowercase();
        self.corruption_markers.iter().any(|m| lower.contains(m.as_str()))
    }
}
