//! Engine and cache configuration.
//!
//! Options are supplied once at startup and stay immutable for the lifetime
//! of the `CacheSupervisor` built from them.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::policy::PlanningPolicy;

/// Cost of fetching one requirement of one entity, used by the default
/// prefetch estimate.
pub const DEFAULT_PREFETCH_COST_PER_FIELD: u64 = 148;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheOptions {
    /// Master switch. When `false`, cache analysis is the identity function.
    pub enabled: bool,
    /// Byte budget of all cached payloads together.
    pub cache_size_in_bytes: u64,
    /// Usages that an adept must exceed before its ratio becomes positive.
    pub minimal_usage_threshold: u32,
    /// Minimal estimated cost of a formula/computer/sorter to be cacheable at all.
    pub minimal_complexity_threshold: u64,
    /// Adepts whose ratio is not above this value are not considered.
    pub minimal_space_to_performance_ratio: u64,
    /// Number of sweeps a cached record may stay unused before eviction.
    pub cool_enough: u32,
    /// Records estimated larger than this never enter the cache.
    pub max_record_size_in_bytes: u64,
    /// Tracked adept count that triggers an early (inline) sweep.
    pub anteroom_record_limit: usize,
    /// Period of the background sweeper.
    pub reevaluate_every_millis: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_size_in_bytes: 100 * 1024 * 1024,
            minimal_usage_threshold: 2,
            minimal_complexity_threshold: 10_000,
            minimal_space_to_performance_ratio: 0,
            cool_enough: 3,
            max_record_size_in_bytes: 1_048_576,
            anteroom_record_limit: 100_000,
            reevaluate_every_millis: 60_000,
        }
    }
}

impl CacheOptions {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.cache_size_in_bytes == 0 {
            return Err(EngineError::configuration(
                "cache is enabled but `cacheSizeInBytes` is zero",
            ));
        }
        if self.reevaluate_every_millis == 0 {
            return Err(EngineError::configuration(
                "`reevaluateEveryMillis` must be positive",
            ));
        }
        Ok(())
    }

    /// Load options from a JSON document; missing keys fall back to defaults.
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let options: CacheOptions = serde_json::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

/// Everything the query engine needs at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineOptions {
    pub cache: CacheOptions,
    pub planning_policy: PlanningPolicy,
    pub prefetch_cost_per_field: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            cache: CacheOptions::default(),
            planning_policy: PlanningPolicy::Default,
            prefetch_cost_per_field: DEFAULT_PREFETCH_COST_PER_FIELD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let options = CacheOptions::from_json(r#"{"cacheSizeInBytes": 4096, "coolEnough": 5}"#)
            .expect("valid options");
        assert_eq!(options.cache_size_in_bytes, 4096);
        assert_eq!(options.cool_enough, 5);
        assert!(options.enabled);
        assert_eq!(
            options.minimal_usage_threshold,
            CacheOptions::default().minimal_usage_threshold
        );
    }

    #[test]
    fn zero_budget_is_rejected_only_when_enabled() {
        assert!(CacheOptions::from_json(r#"{"cacheSizeInBytes": 0}"#).is_err());
        assert!(CacheOptions::from_json(r#"{"enabled": false, "cacheSizeInBytes": 0}"#).is_ok());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"enabled": false}}"#).unwrap();
        let options = CacheOptions::from_json_file(file.path()).unwrap();
        assert!(!options.enabled);
    }

    #[test]
    fn engine_options_parse_policy() {
        let options: EngineOptions =
            serde_json::from_str(r#"{"planningPolicy": "cacheEnforcing"}"#).unwrap();
        assert_eq!(options.planning_policy, PlanningPolicy::CacheEnforcing);
        assert_eq!(options.prefetch_cost_per_field, DEFAULT_PREFETCH_COST_PER_FIELD);
    }
}
