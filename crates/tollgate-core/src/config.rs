//! Harness configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tollgate_state::PolicyMode;

use crate::error::{HarnessError, HarnessResult};

/// What a second concurrent writer on the same trajectory experiences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterPolicy {
    /// Wait for the current writer to finish.
    #[default]
    Serialize,
    /// Fail immediately with `WriterConflict`.
    Reject,
}

impl std::str::FromStr for WriterPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "serialize" | "wait" => Ok(WriterPolicy::Serialize),
            "reject" => Ok(WriterPolicy::Reject),
            other => Err(format!("unknown writer policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub mode: PolicyMode,
    /// A Running trajectory idle this long may be resumed by a new session.
    pub stale_after: Duration,
    /// `None` waits for the engine indefinitely.
    pub evaluation_timeout: Option<Duration>,
    pub writer_policy: WriterPolicy,
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Length of ranked analytics lists.
    pub top_n: usize,
}

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);
pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 1000;
/// Upper bound accepted for `max_page_size`.
pub const PAGE_SIZE_CEILING: usize = 100_000;
pub const DEFAULT_TOP_N: usize = 10;

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            mode: PolicyMode::Govern,
            stale_after: DEFAULT_STALE_AFTER,
            evaluation_timeout: None,
            writer_policy: WriterPolicy::Serialize,
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
            top_n: DEFAULT_TOP_N,
        }
    }
}

impl HarnessConfig {
    pub fn with_mode(mut self, mode: PolicyMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_evaluation_timeout(mut self, timeout: Duration) -> Self {
        self.evaluation_timeout = Some(timeout);
        self
    }

    pub fn with_writer_policy(mut self, policy: WriterPolicy) -> Self {
        self.writer_policy = policy;
        self
    }

    pub fn with_page_sizes(mut self, default: usize, max: usize) -> Self {
        self.default_page_size = default;
        self.max_page_size = max;
        self
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> HarnessResult<()> {
        if self.default_page_size == 0 || self.max_page_size == 0 {
            return Err(HarnessError::Configuration(
                "page sizes must be positive".to_string(),
            ));
        }
        if self.max_page_size > PAGE_SIZE_CEILING {
            return Err(HarnessError::Configuration(format!(
                "max page size {} exceeds {PAGE_SIZE_CEILING}",
                self.max_page_size
            )));
        }
        if self.default_page_size > self.max_page_size {
            return Err(HarnessError::Configuration(format!(
                "default page size {} exceeds max page size {}",
                self.default_page_size, self.max_page_size
            )));
        }
        if self.top_n == 0 {
            return Err(HarnessError::Configuration(
                "top_n must be positive".to_string(),
            ));
        }
        if self.evaluation_timeout == Some(Duration::ZERO) {
            return Err(HarnessError::Configuration(
                "evaluation timeout must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Page size to use for a caller request.
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        match requested {
            None | Some(0) => self.default_page_size,
            Some(n) => n.min(self.max_page_size),
        }
    }

    /// Read settings from environment variables.
    ///
    /// Reads:
    /// - TOLLGATE_MODE (govern | monitor, default: govern)
    /// - TOLLGATE_STALE_AFTER_SECS (default: 300)
    /// - TOLLGATE_EVALUATION_TIMEOUT_MS (unset or 0: no limit)
    /// - TOLLGATE_WRITER_POLICY (serialize | reject, default: serialize)
    /// - TOLLGATE_PAGE_SIZE (default: 50)
    /// - TOLLGATE_MAX_PAGE_SIZE (default: 1000)
    /// - TOLLGATE_TOP_N (default: 10)
    pub fn from_env() -> HarnessResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`HarnessConfig::from_env`] with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> HarnessResult<Self> {
        let mut config = Self::default();

        if let Some(mode) = lookup("TOLLGATE_MODE") {
            config.mode = mode
                .trim()
                .to_lowercase()
                .parse()
                .map_err(|e| HarnessError::Configuration(format!("TOLLGATE_MODE: {e}")))?;
        }
        if let Some(secs) = number(&lookup, "TOLLGATE_STALE_AFTER_SECS")? {
            config.stale_after = Duration::from_secs(secs);
        }
        if let Some(ms) = number(&lookup, "TOLLGATE_EVALUATION_TIMEOUT_MS")? {
            config.evaluation_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(policy) = lookup("TOLLGATE_WRITER_POLICY") {
            config.writer_policy = policy
                .parse()
                .map_err(|e| HarnessError::Configuration(format!("TOLLGATE_WRITER_POLICY: {e}")))?;
        }
        if let Some(n) = number(&lookup, "TOLLGATE_PAGE_SIZE")? {
            config.default_page_size = n as usize;
        }
        if let Some(n) = number(&lookup, "TOLLGATE_MAX_PAGE_SIZE")? {
            config.max_page_size = n as usize;
        }
        if let Some(n) = number(&lookup, "TOLLGATE_TOP_N")? {
            config.top_n = n as usize;
        }

        config.validate()?;
        Ok(config)
    }
}

fn number(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> HarnessResult<Option<u64>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| HarnessError::Configuration(format!("{key}: '{raw}': {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = HarnessConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, HarnessConfig::default());
        assert_eq!(config.stale_after, Duration::from_secs(300));
        assert!(config.evaluation_timeout.is_none());
    }

    #[test]
    fn reads_every_variable() {
        let config = HarnessConfig::from_lookup(lookup(&[
            ("TOLLGATE_MODE", "Monitor"),
            ("TOLLGATE_STALE_AFTER_SECS", "60"),
            ("TOLLGATE_EVALUATION_TIMEOUT_MS", "750"),
            ("TOLLGATE_WRITER_POLICY", "reject"),
            ("TOLLGATE_PAGE_SIZE", "20"),
            ("TOLLGATE_MAX_PAGE_SIZE", "100"),
            ("TOLLGATE_TOP_N", "3"),
        ]))
        .unwrap();
        assert_eq!(config.mode, PolicyMode::Monitor);
        assert_eq!(config.stale_after, Duration::from_secs(60));
        assert_eq!(config.evaluation_timeout, Some(Duration::from_millis(750)));
        assert_eq!(config.writer_policy, WriterPolicy::Reject);
        assert_eq!(config.page_size(None), 20);
        assert_eq!(config.page_size(Some(500)), 100);
        assert_eq!(config.top_n, 3);
    }

    #[test]
    fn zero_timeout_means_no_limit() {
        let config =
            HarnessConfig::from_lookup(lookup(&[("TOLLGATE_EVALUATION_TIMEOUT_MS", "0")])).unwrap();
        assert!(config.evaluation_timeout.is_none());
    }

    #[test]
    fn bad_values_are_configuration_errors() {
        for pairs in [
            vec![("TOLLGATE_MODE", "enforce")],
            vec![("TOLLGATE_STALE_AFTER_SECS", "-1")],
            vec![("TOLLGATE_WRITER_POLICY", "yolo")],
            vec![("TOLLGATE_PAGE_SIZE", "0")],
            vec![("TOLLGATE_PAGE_SIZE", "200"), ("TOLLGATE_MAX_PAGE_SIZE", "100")],
            vec![("TOLLGATE_MAX_PAGE_SIZE", "18446744073709551615")],
        ] {
            let err = HarnessConfig::from_lookup(lookup(&pairs)).unwrap_err();
            assert!(matches!(err, HarnessError::Configuration(_)), "{pairs:?}");
        }
    }
}
