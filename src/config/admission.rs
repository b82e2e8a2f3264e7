//! Admission control settings

use serde::{Deserialize, Serialize};

use crate::admission::RateLimit;

/// Per-client admission configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Simultaneous generation streams allowed per client address
    #[serde(default = "default_max_streams")]
    pub max_streams_per_client: usize,

    /// Request rate allowed per client address, e.g. "20/minute"
    #[serde(default = "default_rate_limit")]
    pub rate_limit: RateLimit,
}

fn default_max_streams() -> usize {
    1
}

fn default_rate_limit() -> RateLimit {
    RateLimit::per_minute(20)
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_streams_per_client: default_max_streams(),
            rate_limit: default_rate_limit(),
        }
    }
}
