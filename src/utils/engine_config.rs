// src/utils/engine_config.rs - Tunables for blocking, scoring and the two deduplicators
use anyhow::{bail, Result};
use log::{info, warn};
use std::env;
use std::str::FromStr;

use crate::models::matching::BlockKeyKind;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Mentions per micro-batch.
    pub batch_size: usize,
    pub max_block_size: usize,
    /// Longest name prefix tried when narrowing an oversized block.
    pub max_prefix_len: usize,
    pub state_prefix4_threshold: f64,
    pub state_prefix3_threshold: f64,
    pub street_zip_threshold: f64,
    pub city_boost: f64,
    /// Raw names longer than this (in chars) are treated as corrupted.
    pub max_name_length: usize,
    pub repeated_size_threshold: usize,
    /// Relative tolerance for near-duplicate sizes; 0 means identical only.
    pub size_tolerance: f64,
    pub large_org_threshold: u64,
    /// Fraction below `large_org_threshold` where unclassified nodes are too close to call.
    pub unclassified_ambiguity_band: f64,
    pub in_scope_jurisdictions: Vec<String>,
    pub worker_count: usize,
    pub commit_retries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_block_size: 200,
            max_prefix_len: 12,
            state_prefix4_threshold: 0.60,
            state_prefix3_threshold: 0.70,
            street_zip_threshold: 0.50,
            city_boost: 0.05,
            max_name_length: 200,
            repeated_size_threshold: 10,
            size_tolerance: 0.0,
            large_org_threshold: 50_000,
            unclassified_ambiguity_band: 0.10,
            in_scope_jurisdictions: vec!["private".to_string()],
            worker_count: num_cpus::get().max(1),
            commit_retries: 2,
        }
    }
}

fn env_or<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!("Invalid value '{}' for {}, falling back to {}", raw, key, default);
                default
            }
        },
        Err(_) => default,
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let in_scope_jurisdictions = env::var("LINKAGE_IN_SCOPE_JURISDICTIONS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .ok()
            .filter(|list| !list.is_empty())
            .unwrap_or(defaults.in_scope_jurisdictions.clone());

        Self {
            batch_size: env_or("LINKAGE_BATCH_SIZE", defaults.batch_size),
            max_block_size: env_or("LINKAGE_MAX_BLOCK_SIZE", defaults.max_block_size),
            max_prefix_len: env_or("LINKAGE_MAX_PREFIX_LEN", defaults.max_prefix_len),
            state_prefix4_threshold: env_or(
                "LINKAGE_STATE_PREFIX4_THRESHOLD",
                defaults.state_prefix4_threshold,
            ),
            state_prefix3_threshold: env_or(
                "LINKAGE_STATE_PREFIX3_THRESHOLD",
                defaults.state_prefix3_threshold,
            ),
            street_zip_threshold: env_or("LINKAGE_STREET_ZIP_THRESHOLD", defaults.street_zip_threshold),
            city_boost: env_or("LINKAGE_CITY_BOOST", defaults.city_boost),
            max_name_length: env_or("LINKAGE_MAX_NAME_LENGTH", defaults.max_name_length),
            repeated_size_threshold: env_or(
                "LINKAGE_REPEATED_SIZE_THRESHOLD",
                defaults.repeated_size_threshold,
            ),
            size_tolerance: env_or("LINKAGE_SIZE_TOLERANCE", defaults.size_tolerance),
            large_org_threshold: env_or("LINKAGE_LARGE_ORG_THRESHOLD", defaults.large_org_threshold),
            unclassified_ambiguity_band: env_or(
                "LINKAGE_UNCLASSIFIED_AMBIGUITY_BAND",
                defaults.unclassified_ambiguity_band,
            ),
            in_scope_jurisdictions,
            worker_count: env_or("LINKAGE_WORKERS", defaults.worker_count).max(1),
            commit_retries: env_or("LINKAGE_COMMIT_RETRIES", defaults.commit_retries),
        }
    }

    /// Acceptance threshold for a blocking pass; less specific keys demand more similarity.
    pub fn threshold_for(&self, kind: BlockKeyKind) -> f64 {
        match kind {
            BlockKeyKind::StatePrefix4 => self.state_prefix4_threshold,
            BlockKeyKind::StatePrefix3 => self.state_prefix3_threshold,
            BlockKeyKind::StreetZip => self.street_zip_threshold,
        }
    }

    pub fn is_in_scope(&self, jurisdiction: &str) -> bool {
        let j = jurisdiction.trim().to_lowercase();
        self.in_scope_jurisdictions.iter().any(|s| *s == j)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("LINKAGE_BATCH_SIZE must be at least 1");
        }
        if self.max_block_size < 2 {
            bail!("LINKAGE_MAX_BLOCK_SIZE must be at least 2, got {}", self.max_block_size);
        }
        if self.max_prefix_len < 4 {
            bail!("LINKAGE_MAX_PREFIX_LEN must be at least 4, got {}", self.max_prefix_len);
        }
        for kind in BlockKeyKind::PASSES {
            let t = self.threshold_for(kind);
            if !(0.0..=1.0).contains(&t) || t == 0.0 {
                bail!("Threshold for {} must be in (0, 1], got {}", kind.as_str(), t);
            }
        }
        if !(0.0..=1.0).contains(&self.city_boost) {
            bail!("LINKAGE_CITY_BOOST must be in [0, 1], got {}", self.city_boost);
        }
        if !(0.0..1.0).contains(&self.size_tolerance) {
            bail!("LINKAGE_SIZE_TOLERANCE must be in [0, 1), got {}", self.size_tolerance);
        }
        if !(0.0..1.0).contains(&self.unclassified_ambiguity_band) {
            bail!(
                "LINKAGE_UNCLASSIFIED_AMBIGUITY_BAND must be in [0, 1), got {}",
                self.unclassified_ambiguity_band
            );
        }
        if self.repeated_size_threshold < 2 {
            bail!("LINKAGE_REPEATED_SIZE_THRESHOLD must be at least 2");
        }
        if self.state_prefix3_threshold < self.state_prefix4_threshold {
            warn!(
                "⚠️ state_prefix3 threshold ({}) is looser than state_prefix4 ({}); the wider key will accept more",
                self.state_prefix3_threshold, self.state_prefix4_threshold
            );
        }
        Ok(())
    }

    pub fn log_config(&self) {
        info!("🔧 Linkage engine configuration:");
        info!(
            "   Batch size: {}, workers: {}, commit retries: {}",
            self.batch_size, self.worker_count, self.commit_retries
        );
        info!(
            "   Blocking: max block size {}, max prefix length {}",
            self.max_block_size, self.max_prefix_len
        );
        info!(
            "   Thresholds: state+4 {:.2}, state+3 {:.2}, street+zip {:.2} (city boost {:.2})",
            self.state_prefix4_threshold,
            self.state_prefix3_threshold,
            self.street_zip_threshold,
            self.city_boost
        );
        info!(
            "   Multi-employer: repeated-size threshold {}, size tolerance {:.3}",
            self.repeated_size_threshold, self.size_tolerance
        );
        info!(
            "   Hierarchy: large-organization threshold {}, ambiguity band {:.2}",
            self.large_org_threshold, self.unclassified_ambiguity_band
        );
        info!("   In-scope jurisdictions: {:?}", self.in_scope_jurisdictions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.threshold_for(BlockKeyKind::StatePrefix4), 0.60);
        assert!(config.threshold_for(BlockKeyKind::StatePrefix3) > config.threshold_for(BlockKeyKind::StatePrefix4));
        assert!(config.is_in_scope(" Private "));
        assert!(!config.is_in_scope("public"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.max_block_size = 1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.street_zip_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.size_tolerance = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_config_with_fallback() {
        env::set_var("LINKAGE_MAX_BLOCK_SIZE", "64");
        env::set_var("LINKAGE_LARGE_ORG_THRESHOLD", "not-a-number");
        env::set_var("LINKAGE_IN_SCOPE_JURISDICTIONS", "private, railway_airline");

        let config = EngineConfig::from_env();
        assert_eq!(config.max_block_size, 64);
        assert_eq!(config.large_org_threshold, 50_000);
        assert!(config.is_in_scope("railway_airline"));

        env::remove_var("LINKAGE_MAX_BLOCK_SIZE");
        env::remove_var("LINKAGE_LARGE_ORG_THRESHOLD");
        env::remove_var("LINKAGE_IN_SCOPE_JURISDICTIONS");
    }
}
