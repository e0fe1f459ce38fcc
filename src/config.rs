// Pipeline configuration
//
// One nested configuration object supplied at session start. The core
// never reads globals or environment state; everything tunable arrives
// through this struct.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::behavior::CollectorConfig;
use crate::captcha::CaptchaConfig;
use crate::completion::MonitorConfig;
use crate::quality::QualityConfig;
use crate::registry::RegistryConfig;
use crate::trap_question::TrapConfig;

/// Full pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub captcha: CaptchaConfig,
    pub trap: TrapConfig,
    pub collector: CollectorConfig,
    pub monitor: MonitorConfig,
    pub quality: QualityConfig,
    pub registry: RegistryConfig,
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(&self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.captcha.max_consecutive_failures == 0 {
            anyhow::bail!("Invalid captcha.max_consecutive_failures: must be > 0");
        }
        if self.captcha.hold_duration_ms == 0 {
            anyhow::bail!("Invalid captcha.hold_duration_ms: must be > 0");
        }
        if self.collector.curve_capacity == 0 || self.collector.click_capacity == 0 {
            anyhow::bail!("Invalid collector buffer capacity: must be > 0");
        }
        if self.monitor.fast_poll_ms == 0 || self.monitor.slow_poll_ms == 0 {
            anyhow::bail!("Invalid monitor poll interval: must be > 0");
        }
        if self.monitor.fast_poll_ms > self.monitor.slow_poll_ms {
            anyhow::bail!("Invalid monitor intervals: fast_poll_ms must be <= slow_poll_ms");
        }
        if self.monitor.ceiling_secs == 0 {
            anyhow::bail!("Invalid monitor.ceiling_secs: must be > 0");
        }
        if self.quality.low_score_floor > 100 {
            anyhow::bail!("Invalid quality.low_score_floor: must be <= 100");
        }
        if self.quality.min_completion_secs > self.quality.max_completion_secs {
            anyhow::bail!(
                "Invalid quality completion bounds: min_completion_secs must be <= max_completion_secs"
            );
        }
        if self.registry.base_url.is_empty() {
            anyhow::bail!("Invalid registry.base_url: cannot be empty");
        }
        Ok(())
    }
}
