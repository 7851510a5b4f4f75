//! slotgrid.toml configuration parser.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::bail;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridConfig {
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sim: SimConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Memory consumed by one capacity block.
    pub block_size: f64,
    pub housekeeping_period: String,
    /// Host deprioritised by allocation ordering.
    pub privileged_host: String,
    pub request_timeout: String,
    pub request_retries: u32,
    /// Per-host reserved memory overrides.
    pub reserved: HashMap<String, f64>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            block_size: 1.75,
            housekeeping_period: "5s".to_string(),
            privileged_host: "home".to_string(),
            request_timeout: "1s".to_string(),
            request_retries: 3,
            reserved: HashMap::from([("home".to_string(), 32.0)]),
        }
    }
}

impl AllocatorConfig {
    pub fn housekeeping_period(&self) -> Duration {
        parse_duration(&self.housekeeping_period).unwrap_or(Duration::from_secs(5))
    }

    pub fn request_timeout(&self) -> Duration {
        parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub target: String,
    /// Spacing between the two corrective stages (S).
    pub skew: String,
    /// Margin kept around every execution window (G).
    pub guard: String,
    pub oom_delay: String,
    pub oom_warn_interval: String,
    pub poll_interval: String,
    pub status_interval: String,
    /// Fraction of the target's yield one batch tries to extract.
    pub extraction_fraction: f64,
    /// Share of the remaining gap slept per deferred-stage back-off step.
    pub backoff_fraction: f64,
    pub min_backoff: String,
    pub include_privileged: bool,
    pub max_batches: Option<u64>,
    pub force: bool,
    pub prep: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            target: "target".to_string(),
            skew: "750ms".to_string(),
            guard: "25ms".to_string(),
            oom_delay: "5s".to_string(),
            oom_warn_interval: "60s".to_string(),
            poll_interval: "5ms".to_string(),
            status_interval: "10s".to_string(),
            extraction_fraction: 0.25,
            backoff_fraction: 0.5,
            min_backoff: "1ms".to_string(),
            include_privileged: false,
            max_batches: None,
            force: false,
            prep: false,
        }
    }
}

impl SchedulerConfig {
    pub fn skew(&self) -> Duration {
        parse_duration(&self.skew).unwrap_or(Duration::from_millis(750))
    }

    pub fn guard(&self) -> Duration {
        parse_duration(&self.guard).unwrap_or(Duration::from_millis(25))
    }

    pub fn oom_delay(&self) -> Duration {
        parse_duration(&self.oom_delay).unwrap_or(Duration::from_secs(5))
    }

    pub fn oom_warn_interval(&self) -> Duration {
        parse_duration(&self.oom_warn_interval).unwrap_or(Duration::from_secs(60))
    }

    pub fn poll_interval(&self) -> Duration {
        parse_duration(&self.poll_interval).unwrap_or(Duration::from_millis(5))
    }

    pub fn status_interval(&self) -> Duration {
        parse_duration(&self.status_interval).unwrap_or(Duration::from_secs(10))
    }

    pub fn min_backoff(&self) -> Duration {
        parse_duration(&self.min_backoff).unwrap_or(Duration::from_millis(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Relative jitter applied to worker durations (0.0 = none).
    pub jitter: f64,
    pub seed: u64,
    pub hosts: Vec<SimHostConfig>,
    pub target: SimTargetConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            jitter: 0.0,
            seed: 1,
            hosts: vec![
                SimHostConfig { id: "home".to_string(), memory: 64.0 },
                SimHostConfig { id: "node-1".to_string(), memory: 128.0 },
                SimHostConfig { id: "node-2".to_string(), memory: 64.0 },
            ],
            target: SimTargetConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimHostConfig {
    pub id: String,
    pub memory: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimTargetConfig {
    pub difficulty: f64,
    pub floor: f64,
    pub yield_amount: f64,
    pub ceiling: f64,
    /// Primary duration at zero difficulty.
    pub base_time: String,
    pub growth_rate: f64,
    pub extraction_rate: f64,
}

impl Default for SimTargetConfig {
    fn default() -> Self {
        Self {
            difficulty: 10.0,
            floor: 2.0,
            yield_amount: 400_000.0,
            ceiling: 1_000_000.0,
            base_time: "2s".to_string(),
            growth_rate: 0.0025,
            extraction_rate: 0.004,
        }
    }
}

impl SimTargetConfig {
    pub fn base_time(&self) -> Duration {
        parse_duration(&self.base_time).unwrap_or(Duration::from_secs(2))
    }
}

impl GridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GridConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the allocator or scheduler cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.allocator.block_size.is_nan() || self.allocator.block_size <= 0.0 {
            bail!("allocator.block_size must be positive");
        }
        let durations = [
            ("allocator.housekeeping_period", &self.allocator.housekeeping_period),
            ("allocator.request_timeout", &self.allocator.request_timeout),
            ("scheduler.skew", &self.scheduler.skew),
            ("scheduler.guard", &self.scheduler.guard),
            ("scheduler.oom_delay", &self.scheduler.oom_delay),
            ("scheduler.oom_warn_interval", &self.scheduler.oom_warn_interval),
            ("scheduler.poll_interval", &self.scheduler.poll_interval),
            ("scheduler.status_interval", &self.scheduler.status_interval),
            ("scheduler.min_backoff", &self.scheduler.min_backoff),
            ("sim.target.base_time", &self.sim.target.base_time),
        ];
        for (name, value) in durations {
            if parse_duration(value).is_none() {
                bail!("{name}: invalid duration {value:?}");
            }
        }
        if self.scheduler.guard().saturating_mul(2) >= self.scheduler.skew() {
            bail!("scheduler.guard must be less than half of scheduler.skew");
        }
        if !(self.scheduler.extraction_fraction > 0.0 && self.scheduler.extraction_fraction < 1.0) {
            bail!("scheduler.extraction_fraction must be in (0, 1)");
        }
        if !(self.scheduler.backoff_fraction > 0.0 && self.scheduler.backoff_fraction <= 1.0) {
            bail!("scheduler.backoff_fraction must be in (0, 1]");
        }
        Ok(())
    }
}

/// Parse a duration string like "750ms", "5s", "2m" or "1.5s".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (number, unit_millis) = if let Some(ms) = s.strip_suffix("ms") {
        (ms.trim(), 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs.trim(), 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins.trim(), 60_000)
    } else {
        return None;
    };
    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(unit_millis).map(Duration::from_millis);
    }
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(value * unit_millis as f64 / 1_000.0).ok()
}
