//! Named rate limit policies loaded from configuration.
//!
//! A policy file maps policy names to limits:
//!
//! ```yaml
//! api:
//!   algorithm: gcra
//!   rate: 10
//!   period: 2
//!   unit: minute
//!   burst: 10
//! login:
//!   algorithm: sliding_window
//!   rate: 5
//!   unit: minute
//! ```
//!
//! The same map may also appear under a top-level `policies:` key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::limit::{Algorithm, Limit};
use crate::error::{LimiterError, Result};

/// Time unit for policy periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// One policy as written in configuration.
///
/// The algorithm is kept as its name so an unknown algorithm is reported as
/// such when the policy is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Events per period
    pub rate: u64,
    /// Number of `unit`s in one period
    #[serde(default = "default_period")]
    pub period: u32,
    pub unit: TimeUnit,
    /// GCRA burst; defaults to the rate
    #[serde(default)]
    pub burst: Option<u64>,
}

fn default_algorithm() -> String {
    Algorithm::Gcra.name().to_string()
}

fn default_period() -> u32 {
    1
}

impl PolicyRule {
    /// Resolve into a validated [`Limit`].
    pub fn to_limit(&self) -> Result<Limit> {
        let algorithm = Algorithm::from_name(&self.algorithm)?;
        let limit = Limit {
            algorithm,
            rate: self.rate,
            period: self.unit.duration() * self.period,
            burst: match algorithm {
                Algorithm::Gcra => self.burst.unwrap_or(self.rate),
                Algorithm::SlidingWindow => 0,
            },
        };
        limit.validate()?;
        Ok(limit)
    }
}

/// A set of named policies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicySet {
    pub policies: BTreeMap<String, PolicyRule>,
}

#[derive(Deserialize)]
struct WrappedPolicies {
    policies: PolicySet,
}

impl PolicySet {
    /// Create an empty policy set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // First, try the wrapped form with a top-level `policies:` key
        if let Ok(wrapped) = serde_yaml::from_str::<WrappedPolicies>(yaml) {
            return Ok(wrapped.policies);
        }

        serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse rate limit policies: {}", e)))
    }

    pub fn get(&self, name: &str) -> Option<&PolicyRule> {
        self.policies.get(name)
    }

    /// Resolve the policy `name` into a [`Limit`].
    pub fn limit(&self, name: &str) -> Result<Limit> {
        self.get(name)
            .ok_or_else(|| LimiterError::Config(format!("no rate limit policy named {:?}", name)))?
            .to_limit()
    }

    /// Resolve every policy, failing on the first invalid one.
    pub fn validate(&self) -> Result<()> {
        for (name, rule) in &self.policies {
            rule.to_limit().map_err(|e| match e {
                LimiterError::InvalidLimit(msg) => {
                    LimiterError::InvalidLimit(format!("policy {}: {}", name, msg))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    /// Add every policy from `other`, replacing ones with the same name.
    pub fn merge(&mut self, other: PolicySet) {
        self.policies.extend(other.policies);
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PolicyRule)> {
        self.policies.iter()
    }
}
