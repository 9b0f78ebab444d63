// src/matching/normalize.rs - Raw mention → comparable name and location key
use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::models::core::{Location, MentionId, MentionQuality, MentionRecord, SourceMention};
use crate::rules::CompiledRules;

static STATE_CODES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("alabama", "AL"), ("alaska", "AK"), ("arizona", "AZ"), ("arkansas", "AR"),
        ("california", "CA"), ("colorado", "CO"), ("connecticut", "CT"), ("delaware", "DE"),
        ("district of columbia", "DC"), ("florida", "FL"), ("georgia", "GA"), ("hawaii", "HI"),
        ("idaho", "ID"), ("illinois", "IL"), ("indiana", "IN"), ("iowa", "IA"),
        ("kansas", "KS"), ("kentucky", "KY"), ("louisiana", "LA"), ("maine", "ME"),
        ("maryland", "MD"), ("massachusetts", "MA"), ("michigan", "MI"), ("minnesota", "MN"),
        ("mississippi", "MS"), ("missouri", "MO"), ("montana", "MT"), ("nebraska", "NE"),
        ("nevada", "NV"), ("new hampshire", "NH"), ("new jersey", "NJ"), ("new mexico", "NM"),
        ("new york", "NY"), ("north carolina", "NC"), ("north dakota", "ND"), ("ohio", "OH"),
        ("oklahoma", "OK"), ("oregon", "OR"), ("pennsylvania", "PA"), ("rhode island", "RI"),
        ("south carolina", "SC"), ("south dakota", "SD"), ("tennessee", "TN"), ("texas", "TX"),
        ("utah", "UT"), ("vermont", "VT"), ("virginia", "VA"), ("washington", "WA"),
        ("west virginia", "WV"), ("wisconsin", "WI"), ("wyoming", "WY"), ("puerto rico", "PR"),
        ("guam", "GU"), ("virgin islands", "VI"), ("american samoa", "AS"),
        ("northern mariana islands", "MP"),
    ]
    .into_iter()
    .collect()
});

const STREET_SUFFIXES: [(&str, &str); 15] = [
    ("st", "street"),
    ("str", "street"),
    ("rd", "road"),
    ("ave", "avenue"),
    ("av", "avenue"),
    ("blvd", "boulevard"),
    ("blv", "boulevard"),
    ("dr", "drive"),
    ("ln", "lane"),
    ("ct", "court"),
    ("pl", "place"),
    ("sq", "square"),
    ("pkwy", "parkway"),
    ("cir", "circle"),
    ("hwy", "highway"),
];

const UNIT_DESIGNATORS: [&str; 11] = [
    "apt", "apartment", "suite", "ste", "unit", "bldg", "building", "fl", "floor", "room", "rm",
];

/// Collapses runs of whitespace and trims.
fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Removes `(...)` groups at the end of the string, repeatedly.
fn strip_trailing_parentheticals(s: &str) -> String {
    let mut out = s.trim_end().to_string();
    while out.ends_with(')') {
        match out.rfind('(') {
            Some(idx) => out = out[..idx].trim_end().to_string(),
            None => break,
        }
    }
    out
}

pub struct Normalizer<'a> {
    rules: &'a CompiledRules,
    max_name_length: usize,
}

impl<'a> Normalizer<'a> {
    pub fn new(rules: &'a CompiledRules, max_name_length: usize) -> Self {
        Self {
            rules,
            max_name_length,
        }
    }

    /// Case-folds, strips punctuation, noise prefixes and legal suffixes, expands abbreviations.
    /// An empty result means the name carries nothing comparable.
    pub fn normalize_name(&self, raw: &str) -> String {
        let mut normalized = raw.trim().to_lowercase();

        let mut stripped = true;
        while stripped {
            stripped = false;
            for prefix in &self.rules.noise_prefixes {
                if let Some(rest) = normalized.strip_prefix(prefix.as_str()) {
                    normalized = rest.trim_start().to_string();
                    stripped = true;
                }
            }
        }

        normalized = strip_trailing_parentheticals(&normalized);
        normalized = normalized.replace('&', " and ").replace('+', " plus ");

        // Apostrophes and periods join ("mcdonald's", "inc."); everything else splits.
        let cleaned: String = normalized
            .chars()
            .filter(|c| *c != '\'' && *c != '.' && *c != '’')
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();

        let mut tokens: Vec<String> = Vec::new();
        for token in cleaned.split_whitespace() {
            let expanded = self
                .rules
                .abbreviations
                .get(token)
                .map(String::as_str)
                .unwrap_or(token);
            for part in expanded.split_whitespace() {
                if self.rules.legal_suffixes.contains(part) {
                    continue;
                }
                tokens.push(part.to_string());
            }
        }

        while tokens.len() > 1 && self.rules.leading_articles.contains(&tokens[0]) {
            tokens.remove(0);
        }
        if tokens.len() == 1 && self.rules.leading_articles.contains(&tokens[0]) {
            tokens.clear();
        }

        tokens.join(" ")
    }

    pub fn normalize_location(&self, location: &Location) -> Location {
        Location {
            state: location.state.as_deref().and_then(normalize_state),
            city: location
                .city
                .as_deref()
                .map(|c| {
                    collapse(
                        &c.to_lowercase()
                            .chars()
                            .filter(|ch| *ch != '.' && *ch != '\'')
                            .map(|ch| if ch.is_alphanumeric() { ch } else { ' ' })
                            .collect::<String>(),
                    )
                })
                .filter(|c| !c.is_empty()),
            street: location
                .street
                .as_deref()
                .map(normalize_street)
                .filter(|s| !s.is_empty()),
            postal_code: location.postal_code.as_deref().and_then(normalize_postal_code),
        }
    }

    /// Quality screen over the raw name and its normalized form.
    pub fn screen(&self, raw_name: &str, normalized_name: &str) -> MentionQuality {
        if raw_name.chars().count() > self.max_name_length
            || self.rules.has_corruption_marker(raw_name)
            || raw_name.chars().any(|c| c.is_control() && c != '\t')
        {
            MentionQuality::Corrupted
        } else if normalized_name.is_empty() {
            MentionQuality::Unlinkable
        } else {
            MentionQuality::Linkable
        }
    }

    /// Builds the immutable mention the rest of the pipeline works on.
    pub fn prepare(&self, record: &MentionRecord) -> SourceMention {
        let raw = &record.mention;
        let normalized_name = self.normalize_name(&raw.raw_name);
        let quality = self.screen(&raw.raw_name, &normalized_name);
        SourceMention {
            id: MentionId::new(raw.source_kind, &raw.source_id),
            source_kind: raw.source_kind,
            source_id: raw.source_id.trim().to_string(),
            partition: record.partition,
            offset: record.offset,
            raw_name: raw.raw_name.clone(),
            normalized_name,
            location: self.normalize_location(&raw.location),
            reported_size: raw.reported_size,
            group_hint: raw
                .group_hint
                .as_deref()
                .map(|h| collapse(&h.to_lowercase()))
                .filter(|h| !h.is_empty()),
            union_key: raw
                .union_key
                .as_deref()
                .map(|k| k.trim().to_uppercase())
                .filter(|k| !k.is_empty()),
            reported_on: raw.reported_on,
            jurisdiction: raw
                .jurisdiction
                .as_deref()
                .map(|j| j.trim().to_lowercase())
                .filter(|j| !j.is_empty()),
            quality,
        }
    }
}

pub fn normalize_state(state: &str) -> Option<String> {
    let cleaned = collapse(&state.replace('.', "").to_lowercase());
    if cleaned.len() == 2 && cleaned.chars().all(|c| c.is_ascii_alphabetic()) {
        return Some(cleaned.to_uppercase());
    }
    STATE_CODES.get(cleaned.as_str()).map(|code| code.to_string())
}

/// Leading five digits of a US postal code.
pub fn normalize_postal_code(postal: &str) -> Option<String> {
    let digits: String = postal
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    match digits.len() {
        n if n >= 5 => Some(digits[..5].to_string()),
        // Spreadsheet exports drop leading zeros.
        3 | 4 => Some(format!("{:0>5}", digits)),
        _ => None,
    }
}

pub fn normalize_street(street: &str) -> String {
    let lower = street.to_lowercase();
    let cleaned: String = lower
        .chars()
        .filter(|c| *c != '.')
        .map(|c| if c.is_alphanumeric() || c == '#' { c } else { ' ' })
        .collect();

    let mut tokens: Vec<String> = Vec::new();
    let mut iter = cleaned.split_whitespace();
    while let Some(token) = iter.next() {
        if token.starts_with('#') {
            // "#200" or "# 200"
            if token == "#" {
                iter.next();
            }
            continue;
        }
        if UNIT_DESIGNATORS.contains(&token) {
            iter.next();
            continue;
        }
        let expanded = STREET_SUFFIXES
            .iter()
            .find(|(abbr, _)| *abbr == token)
            .map(|(_, full)| *full)
            .unwrap_or(token);
        tokens.push(expanded.to_string());
    }
    tokens.join(" ")
}

/// Leading token of a street line when it is a house number ("123", "12b").
pub fn street_number(street: &str) -> Option<&str> {
    let first = street.split_whitespace().next()?;
    if first.chars().next().map_or(false, |c| c.is_ascii_digit()) {
        Some(first)
    } else {
        None
    }
}
