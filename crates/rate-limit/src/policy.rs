use std::collections::HashMap;
use std::time::Duration;

use admission_common::{
    AdmissionResult, EndpointPolicy, RateLimit, RateLimitAlgorithm, RateLimitConfig,
};

/// Result of looking up an endpoint in the policy table.
///
/// An unknown endpoint is not an error: it falls back to the global default,
/// and the caller gets to see that it did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PolicyLookup {
    Found(EndpointPolicy),
    FallbackToDefault(EndpointPolicy),
}

impl PolicyLookup {
    pub fn policy(&self) -> &EndpointPolicy {
        match self {
            Self::Found(policy) | Self::FallbackToDefault(policy) => policy,
        }
    }
}

/// Validated, immutable snapshot of the configured policies.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    global: RateLimit,
    anonymous: RateLimit,
    endpoints: HashMap<String, EndpointPolicy>,
    idle_ttl: Duration,
}

impl PolicyTable {
    /// Build a table from configuration, rejecting it entirely if any entry
    /// is malformed.
    pub fn from_config(config: &RateLimitConfig) -> AdmissionResult<Self> {
        config.validate()?;
        Ok(Self {
            global: config.global,
            anonymous: config.anonymous,
            endpoints: config
                .endpoints
                .iter()
                .map(|(name, policy)| (name.clone(), *policy))
                .collect(),
            idle_ttl: Duration::from_secs(config.idle_ttl_secs),
        })
    }

    pub fn lookup(&self, endpoint: &str) -> PolicyLookup {
        match self.endpoints.get(endpoint) {
            Some(policy) => PolicyLookup::Found(*policy),
            None => PolicyLookup::FallbackToDefault(EndpointPolicy {
                limit: self.global,
                algorithm: RateLimitAlgorithm::TokenBucket,
            }),
        }
    }

    pub fn global(&self) -> RateLimit {
        self.global
    }

    pub fn anonymous(&self) -> RateLimit {
        self.anonymous
    }

    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }
}
