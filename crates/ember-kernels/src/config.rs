//! Backend configuration.

use serde::{Deserialize, Serialize};

use crate::activation::DEFAULT_LEAKY_SLOPE;
use crate::error::{BackendError, Result};

/// Configuration for a [`DeviceContext`](crate::DeviceContext).
///
/// Every field has a default, so a config file only needs the fields it
/// overrides:
///
/// ```
/// use ember_kernels::BackendConfig;
///
/// let config = BackendConfig::from_json_str(r#"{ "default_device": 1, "random_seed": 7 }"#).unwrap();
/// assert_eq!(config.default_device, 1);
/// assert_eq!(config.random_seed, Some(7));
/// assert_eq!(config.host_devices, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Device selected when a context is created.
    pub default_device: usize,

    /// Seed for per-device random generators. `None` seeds from wall-clock time.
    pub random_seed: Option<u64>,

    /// Negative slope of the `leaky` activation.
    pub leaky_slope: f32,

    /// Number of emulated devices exposed by the host runtime.
    pub host_devices: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            default_device: 0,
            random_seed: None,
            leaky_slope: DEFAULT_LEAKY_SLOPE,
            host_devices: 1,
        }
    }
}

impl BackendConfig {
    /// Parse a JSON config.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| BackendError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BackendError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Same config with a fixed random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    /// Same config with `n` emulated host devices.
    pub fn with_host_devices(mut self, n: usize) -> Self {
        self.host_devices = n;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.leaky_slope.is_finite() {
            return Err(BackendError::Config(format!("leaky_slope must be finite, got {}", self.leaky_slope)));
        }
        if self.host_devices == 0 {
            return Err(BackendError::Config("host_devices must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BackendConfig::default();
        assert_eq!(config.default_device, 0);
        assert_eq!(config.random_seed, None);
        assert_eq!(config.leaky_slope, 0.1);
        assert_eq!(config.host_devices, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = BackendConfig::from_json_str(r#"{ "leaky_slope": 0.01, "host_devices": 4 }"#).unwrap();
        assert_eq!(config.leaky_slope, 0.01);
        assert_eq!(config.host_devices, 4);
        assert_eq!(config.default_device, 0);
    }

    #[test]
    fn test_roundtrip_json() {
        let config = BackendConfig::default().with_seed(42).with_host_devices(2);
        let text = serde_json::to_string(&config).unwrap();
        assert_eq!(BackendConfig::from_json_str(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            BackendConfig::from_json_str(r#"{ "host_devices": 0 }"#),
            Err(BackendError::Config(_))
        ));
        assert!(matches!(BackendConfig::from_json_str("not json"), Err(BackendError::Config(_))));
    }
}
