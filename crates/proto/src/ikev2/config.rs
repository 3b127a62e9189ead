//! Engine configuration
//!
//! Builder-validated knobs for the demultiplexer: window size, DoS
//! thresholds, fragmentation policy, timers and liveness.

use super::error::{Error, Result};
use std::time::Duration;

/// Dead Peer Detection configuration
#[derive(Debug, Clone)]
pub struct DpdConfig {
    /// Enable DPD
    pub enabled: bool,

    /// Interval between liveness probes when the SA is quiet
    pub interval: Duration,

    /// How long to wait for a probe response
    pub timeout: Duration,

    /// Failed probes before the peer counts as dead
    pub max_retries: u32,
}

impl Default for DpdConfig {
    fn default() -> Self {
        DpdConfig {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

/// Configuration of one engine instance
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Request window per direction; this implementation only supports 1
    pub window_size: u32,

    /// Accept and emit encrypted fragments (RFC 7383)
    pub fragmentation_allowed: bool,

    /// Half-open SAs above which cookies are demanded
    pub half_open_soft_limit: usize,

    /// Half-open SAs above which new exchanges are dropped outright
    pub half_open_hard_limit: usize,

    /// Delay before re-sending an unanswered request
    pub retransmit_interval: Duration,

    /// Retransmissions before the exchange counts as failed
    pub max_retransmits: u32,

    /// How long a provisional or failed SA lingers to absorb peer
    /// retransmits
    pub discard_wait: Duration,

    /// Lifetime after which an established SA is replaced
    pub replace_after: Duration,

    /// Liveness configuration, `None` disables probes
    pub dpd: Option<DpdConfig>,
}

impl EngineConfig {
    /// Start a builder
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error for a window size other than 1 (concurrent
    /// exchanges need per-msgid child indexing this design does not
    /// have), or inconsistent thresholds.
    pub fn validate(&self) -> Result<()> {
        if self.window_size != 1 {
            return Err(Error::InvalidParameter(
                "window_size must be 1; concurrent exchanges are not supported".into(),
            ));
        }
        if self.half_open_hard_limit < self.half_open_soft_limit {
            return Err(Error::InvalidParameter(
                "half_open_hard_limit below half_open_soft_limit".into(),
            ));
        }
        if self.max_retransmits == 0 {
            return Err(Error::InvalidParameter(
                "max_retransmits must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            window_size: 1,
            fragmentation_allowed: true,
            half_open_soft_limit: 1000,
            half_open_hard_limit: 5000,
            retransmit_interval: Duration::from_millis(500),
            max_retransmits: 6,
            discard_wait: Duration::from_secs(30),
            replace_after: Duration::from_secs(3600),
            dpd: Some(DpdConfig::default()),
        }
    }
}

/// Builder for [`EngineConfig`]
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    fragmentation_allowed: Option<bool>,
    half_open_soft_limit: Option<usize>,
    half_open_hard_limit: Option<usize>,
    retransmit_interval: Option<Duration>,
    max_retransmits: Option<u32>,
    discard_wait: Option<Duration>,
    replace_after: Option<Duration>,
    dpd: Option<Option<DpdConfig>>,
}

impl EngineConfigBuilder {
    /// Allow or forbid encrypted fragments
    pub fn with_fragmentation(mut self, allowed: bool) -> Self {
        self.fragmentation_allowed = Some(allowed);
        self
    }

    /// Set the half-open thresholds (soft demands cookies, hard drops)
    pub fn with_half_open_limits(mut self, soft: usize, hard: usize) -> Self {
        self.half_open_soft_limit = Some(soft);
        self.half_open_hard_limit = Some(hard);
        self
    }

    /// Set the retransmission interval
    pub fn with_retransmit_interval(mut self, interval: Duration) -> Self {
        self.retransmit_interval = Some(interval);
        self
    }

    /// Set the retransmission budget
    pub fn with_max_retransmits(mut self, max: u32) -> Self {
        self.max_retransmits = Some(max);
        self
    }

    /// Set how long failed SAs linger
    pub fn with_discard_wait(mut self, wait: Duration) -> Self {
        self.discard_wait = Some(wait);
        self
    }

    /// Set the SA replacement lifetime
    pub fn with_replace_after(mut self, lifetime: Duration) -> Self {
        self.replace_after = Some(lifetime);
        self
    }

    /// Enable DPD with the given parameters
    pub fn with_dpd(mut self, dpd: DpdConfig) -> Self {
        self.dpd = Some(Some(dpd));
        self
    }

    /// Disable DPD
    pub fn without_dpd(mut self) -> Self {
        self.dpd = Some(None);
        self
    }

    /// Build with validation
    ///
    /// # Errors
    ///
    /// Returns an error when the resulting configuration fails
    /// [`EngineConfig::validate`].
    pub fn build(self) -> Result<EngineConfig> {
        let defaults = EngineConfig::default();
        let config = EngineConfig {
            window_size: defaults.window_size,
            fragmentation_allowed: self
                .fragmentation_allowed
                .unwrap_or(defaults.fragmentation_allowed),
            half_open_soft_limit: self
                .half_open_soft_limit
                .unwrap_or(defaults.half_open_soft_limit),
            half_open_hard_limit: self
                .half_open_hard_limit
                .unwrap_or(defaults.half_open_hard_limit),
            retransmit_interval: self
                .retransmit_interval
                .unwrap_or(defaults.retransmit_interval),
            max_retransmits: self.max_retransmits.unwrap_or(defaults.max_retransmits),
            discard_wait: self.discard_wait.unwrap_or(defaults.discard_wait),
            replace_after: self.replace_after.unwrap_or(defaults.replace_after),
            dpd: self.dpd.unwrap_or(defaults.dpd),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::builder()
            .with_fragmentation(false)
            .with_half_open_limits(10, 20)
            .with_retransmit_interval(Duration::from_secs(1))
            .with_max_retransmits(3)
            .without_dpd()
            .build()
            .expect("Failed to build engine config");

        assert!(!config.fragmentation_allowed);
        assert_eq!(config.half_open_soft_limit, 10);
        assert_eq!(config.half_open_hard_limit, 20);
        assert_eq!(config.max_retransmits, 3);
        assert!(config.dpd.is_none());
    }

    #[test]
    fn test_inverted_limits_rejected() {
        let result = EngineConfig::builder()
            .with_half_open_limits(100, 10)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_retransmits_rejected() {
        let result = EngineConfig::builder().with_max_retransmits(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_window_size_pinned_to_one() {
        let mut config = EngineConfig::default();
        config.window_size = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dpd_defaults() {
        let dpd = DpdConfig::default();
        assert!(dpd.enabled);
        assert_eq!(dpd.interval, Duration::from_secs(30));
        assert_eq!(dpd.max_retries, 3);
    }
}
