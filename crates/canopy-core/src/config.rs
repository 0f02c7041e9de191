//! Runtime configuration for the overlay engine
//!
//! Every numeric or behavioral knob called out as a fixed constant in the
//! component design is a field here instead, following the builder pattern
//! the rest of the stack uses for its own configuration structs.

use std::time::Duration;

use crate::error::ConfigError;

/// Tunable parameters for a Host or Node peer
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayConfig {
    pub max_host_children: usize,
    pub max_node_children: usize,
    pub cousin_cap: usize,

    pub rain_interval: Duration,
    pub subtree_status_interval: Duration,
    pub stall_threshold: Duration,
    pub patch_to_rebind_threshold: Duration,
    pub rebind_jitter_max: Duration,

    pub ack_timeout: Duration,
    pub ping_timeout: Duration,

    pub host_cache_size: usize,
    pub node_cache_size: usize,

    pub dedup_cache_size: usize,
    pub dedup_eviction_fraction: f64,

    pub rate_limit_window: Duration,
    pub rate_limit_max_attempts: usize,
    pub rate_limit_sweep_interval: Duration,

    pub max_attach_attempts: u32,
    pub max_redirect_depth: u32,
    pub attach_backoff_base: Duration,
    pub attach_backoff_cap: Duration,

    pub seed_list_min: usize,
    pub seed_list_max: usize,
    pub redirect_list_cap: usize,

    pub req_state_host_fallback_interval: Duration,

    /// How long the Host keeps a `keepAlive=false` connection open after
    /// `JOIN_ACCEPT` before closing it (§4.1 bootstrap).
    pub join_reject_grace: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            max_host_children: 5,
            max_node_children: 3,
            cousin_cap: 2,

            rain_interval: Duration::from_secs(1),
            subtree_status_interval: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(3),
            patch_to_rebind_threshold: Duration::from_secs(60),
            rebind_jitter_max: Duration::from_secs(10),

            ack_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(10),

            host_cache_size: 100,
            node_cache_size: 20,

            dedup_cache_size: 100,
            dedup_eviction_fraction: 0.2,

            rate_limit_window: Duration::from_secs(10),
            rate_limit_max_attempts: 5,
            rate_limit_sweep_interval: Duration::from_secs(30),

            max_attach_attempts: 10,
            max_redirect_depth: 5,
            attach_backoff_base: Duration::from_millis(500),
            attach_backoff_cap: Duration::from_millis(5000),

            seed_list_min: 5,
            seed_list_max: 10,
            redirect_list_cap: 10,

            req_state_host_fallback_interval: Duration::from_secs(5),

            join_reject_grace: Duration::from_millis(100),
        }
    }
}

impl OverlayConfig {
    /// Validate the configuration, rejecting values outside their documented
    /// range. Called once at construction rather than at each use site.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.dedup_eviction_fraction) || self.dedup_eviction_fraction == 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "dedup_eviction_fraction",
                range: "(0, 1]",
                value: self.dedup_eviction_fraction.to_string(),
            });
        }
        if self.max_host_children == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_host_children",
                range: "> 0",
                value: self.max_host_children.to_string(),
            });
        }
        if self.seed_list_min > self.seed_list_max {
            return Err(ConfigError::OutOfRange {
                field: "seed_list_min",
                range: "<= seed_list_max",
                value: self.seed_list_min.to_string(),
            });
        }
        Ok(())
    }

    pub fn with_max_node_children(mut self, max: usize) -> Self {
        self.max_node_children = max;
        self
    }

    pub fn with_node_cache_size(mut self, size: usize) -> Self {
        self.node_cache_size = size;
        self
    }

    pub fn with_host_cache_size(mut self, size: usize) -> Self {
        self.host_cache_size = size;
        self
    }

    pub fn with_cousin_cap(mut self, cap: usize) -> Self {
        self.cousin_cap = cap;
        self
    }

    pub fn with_rain_interval(mut self, interval: Duration) -> Self {
        self.rain_interval = interval;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(OverlayConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_eviction_fraction() {
        let cfg = OverlayConfig::default().with_node_cache_size(20);
        let mut cfg = cfg;
        cfg.dedup_eviction_fraction = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn builder_overrides_apply() {
        let cfg = OverlayConfig::default().with_max_node_children(7);
        assert_eq!(cfg.max_node_children, 7);
    }
}
