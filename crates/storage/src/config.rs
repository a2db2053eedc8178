//! Datastore tuning.
//!
//! Values come from the node configuration file and can be overridden with
//! `GOSSIP_STORE_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Limits and retention horizons for the datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Objects kept in memory in front of the persistent store.
    /// Default: 4096
    pub cache_capacity: usize,

    /// Seconds an address survives without being refreshed.
    /// Default: 3 hours
    pub address_retention_secs: u64,

    /// Seconds a requested but unanswered vector stays known.
    /// Default: 1 hour
    pub request_retention_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 4096,
            address_retention_secs: 3 * 60 * 60,
            request_retention_secs: 60 * 60,
        }
    }
}

impl StoreConfig {
    /// Load overrides from environment variables with the `GOSSIP_STORE_` prefix.
    ///
    /// Example: `GOSSIP_STORE_CACHE_CAPACITY=10000`
    pub fn from_env(mut self) -> Self {
        use std::env;

        if let Ok(val) = env::var("GOSSIP_STORE_CACHE_CAPACITY")
            && let Ok(num) = val.parse()
        {
            self.cache_capacity = num;
        }
        if let Ok(val) = env::var("GOSSIP_STORE_ADDRESS_RETENTION_SECS")
            && let Ok(num) = val.parse()
        {
            self.address_retention_secs = num;
        }
        if let Ok(val) = env::var("GOSSIP_STORE_REQUEST_RETENTION_SECS")
            && let Ok(num) = val.parse()
        {
            self.request_retention_secs = num;
        }

        self.validate_and_clamp()
    }

    /// Clamp values to ranges the datastore can work with.
    pub fn validate_and_clamp(mut self) -> Self {
        if self.cache_capacity < 16 {
            warn!(
                "cache_capacity={} is too low, clamping to 16",
                self.cache_capacity
            );
            self.cache_capacity = 16;
        } else if self.cache_capacity > 1_000_000 {
            warn!(
                "cache_capacity={} is too high, clamping to 1000000",
                self.cache_capacity
            );
            self.cache_capacity = 1_000_000;
        }

        if self.address_retention_secs < 60 {
            warn!(
                "address_retention_secs={} is too low, clamping to 60",
                self.address_retention_secs
            );
            self.address_retention_secs = 60;
        }

        if self.request_retention_secs < 10 {
            warn!(
                "request_retention_secs={} is too low, clamping to 10",
                self.request_retention_secs
            );
            self.request_retention_secs = 10;
        }

        self
    }

    pub fn address_retention(&self) -> Duration {
        Duration::from_secs(self.address_retention_secs)
    }

    pub fn request_retention(&self) -> Duration {
        Duration::from_secs(self.request_retention_secs)
    }
}
