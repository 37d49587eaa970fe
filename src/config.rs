//! Driver configuration knobs.
//!
//! Mirrors the builder pattern used for network entries elsewhere in this
//! codebase: a plain struct of settled values plus a fluent builder that
//! fills in defaults for anything the caller doesn't set explicitly.

/// Policy governing how transmit payload memory is exposed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadPolicy {
    /// Always grant payload pages directly; fail if the slot budget would
    /// be exceeded.
    Grant,
    /// Always bounce-copy payload into owned buffers before granting.
    Copy,
    /// Try to grant; fall back to copying if granting would exceed the
    /// per-packet slot budget. Default policy.
    GrantElseCopy,
}

impl Default for PayloadPolicy {
    fn default() -> Self {
        PayloadPolicy::GrantElseCopy
    }
}

/// Settled driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub max_queues: u32,
    pub disable_gso_ipv4: bool,
    pub disable_gso_ipv6: bool,
    pub payload_policy: PayloadPolicy,
    pub ring_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            max_queues: 1,
            disable_gso_ipv4: false,
            disable_gso_ipv6: false,
            payload_policy: PayloadPolicy::default(),
            ring_capacity: 256,
        }
    }
}

impl DriverConfig {
    pub fn builder() -> DriverConfigBuilder {
        DriverConfigBuilder::default()
    }
}

/// Fluent builder for [`DriverConfig`].
#[derive(Debug, Default)]
pub struct DriverConfigBuilder {
    max_queues: Option<u32>,
    disable_gso_ipv4: Option<bool>,
    disable_gso_ipv6: Option<bool>,
    always_copy: Option<bool>,
    ring_capacity: Option<usize>,
}

impl DriverConfigBuilder {
    pub fn max_queues(mut self, n: u32) -> Self {
        self.max_queues = Some(n);
        self
    }

    pub fn disable_gso_ipv4(mut self, v: bool) -> Self {
        self.disable_gso_ipv4 = Some(v);
        self
    }

    pub fn disable_gso_ipv6(mut self, v: bool) -> Self {
        self.disable_gso_ipv6 = Some(v);
        self
    }

    pub fn always_copy(mut self, v: bool) -> Self {
        self.always_copy = Some(v);
        self
    }

    pub fn ring_capacity(mut self, n: usize) -> Self {
        self.ring_capacity = Some(n);
        self
    }

    pub fn build(self) -> DriverConfig {
        let defaults = DriverConfig::default();
        DriverConfig {
            max_queues: self.max_queues.unwrap_or(defaults.max_queues),
            disable_gso_ipv4: self.disable_gso_ipv4.unwrap_or(defaults.disable_gso_ipv4),
            disable_gso_ipv6: self.disable_gso_ipv6.unwrap_or(defaults.disable_gso_ipv6),
            payload_policy: if self.always_copy.unwrap_or(false) {
                PayloadPolicy::Copy
            } else {
                defaults.payload_policy
            },
            ring_capacity: self.ring_capacity.unwrap_or(defaults.ring_capacity),
        }
    }

    /// Overlay values taken from environment variables, for use by the demo
    /// binary only; the library itself never reads the environment.
    pub fn from_env(mut self) -> Self {
        if let Ok(v) = std::env::var("VIF_MAX_QUEUES") {
            if let Ok(n) = v.parse() {
                self.max_queues = Some(n);
            }
        }
        if let Ok(v) = std::env::var("VIF_DISABLE_GSO4") {
            self.disable_gso_ipv4 = Some(v == "1");
        }
        if let Ok(v) = std::env::var("VIF_DISABLE_GSO6") {
            self.disable_gso_ipv6 = Some(v == "1");
        }
        if let Ok(v) = std::env::var("VIF_ALWAYS_COPY") {
            self.always_copy = Some(v == "1");
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = DriverConfig::default();
        assert_eq!(cfg.max_queues, 1);
        assert_eq!(cfg.payload_policy, PayloadPolicy::GrantElseCopy);
    }

    #[test]
    fn test_builder_always_copy() {
        let cfg = DriverConfig::builder().always_copy(true).build();
        assert_eq!(cfg.payload_policy, PayloadPolicy::Copy);
    }

    #[test]
    fn test_builder_overrides() {
        let cfg = DriverConfig::builder()
            .max_queues(4)
            .disable_gso_ipv4(true)
            .ring_capacity(512)
            .build();
        assert_eq!(cfg.max_queues, 4);
        assert!(cfg.disable_gso_ipv4);
        assert_eq!(cfg.ring_capacity, 512);
    }
}
