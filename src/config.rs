//! Collector configuration.
//!
//! Values come from three places, highest priority first: command-line
//! flags, an optional YAML file, built-in defaults. `main.rs` applies the
//! flags on top of whatever [`CollectorConfig::load`] returned and then
//! calls [`CollectorConfig::validate`].

use crate::control_plane::{KpmSubscription, NodeType};
use crate::dataset_writer::{DatasetSchema, WriterOptions, DEFAULT_FLUSH_EVERY};
use crate::error::ConfigError;
use crate::measurement::{Layer, ReportInterval};
use crate::stop::StopCondition;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_OUTPUT: &str = "/tmp/kpm_metrics_dataset.csv";
pub const DEFAULT_TARGET_SAMPLES: u64 = 1000;

/// Throughput service model subscription settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KpmConfig {
    pub enabled: bool,
    pub report_period_ms: u32,
    pub granularity_period_ms: u32,
    /// Slice/service type UEs must match to be reported.
    pub sst: i64,
}

impl Default for KpmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            report_period_ms: 100,
            granularity_period_ms: 100,
            sst: 1,
        }
    }
}

/// Control-plane relay connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub connect_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 36422,
            connect_attempts: 5,
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub output: PathBuf,
    /// 0 disables the sample target.
    pub target_samples: u64,
    #[serde(with = "humantime_serde")]
    pub duration: Option<Duration>,
    pub flush_every: u64,
    pub progress_every: u64,
    pub interval: ReportInterval,
    pub schema: DatasetSchema,
    pub primary: Layer,
    pub kpm: KpmConfig,
    pub node_types: Vec<NodeType>,
    /// Idle tick of the collection loop.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub unsubscribe_timeout: Duration,
    pub relay: RelayConfig,
    pub simulate: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            output: PathBuf::from(DEFAULT_OUTPUT),
            target_samples: DEFAULT_TARGET_SAMPLES,
            duration: None,
            flush_every: DEFAULT_FLUSH_EVERY,
            progress_every: crate::assembler::DEFAULT_PROGRESS_EVERY,
            interval: ReportInterval::default(),
            schema: DatasetSchema::default(),
            primary: Layer::Mac,
            kpm: KpmConfig::default(),
            node_types: vec![NodeType::Gnb, NodeType::Enb],
            poll_interval: Duration::from_secs(1),
            unsubscribe_timeout: Duration::from_secs(2),
            relay: RelayConfig::default(),
            simulate: false,
        }
    }
}

impl CollectorConfig {
    /// Read a YAML file. Missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_every == 0 {
            return Err(ConfigError::Invalid("flush_every must be positive".to_string()));
        }
        if self.progress_every == 0 {
            return Err(ConfigError::Invalid("progress_every must be positive".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be positive".to_string()));
        }
        if self.node_types.is_empty() {
            return Err(ConfigError::Invalid("node_types must not be empty".to_string()));
        }

        match self.primary {
            Layer::Mac => {}
            Layer::Kpm => {
                if self.schema != DatasetSchema::Throughput || !self.kpm.enabled {
                    return Err(ConfigError::Invalid(
                        "primary layer kpm needs the throughput schema".to_string(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::Invalid(format!(
                    "primary layer must be mac or kpm, got {:?}",
                    other
                )))
            }
        }
        if self.schema == DatasetSchema::Throughput && !self.kpm.enabled {
            return Err(ConfigError::Invalid(
                "throughput schema needs the kpm subscription enabled".to_string(),
            ));
        }
        if self.kpm.enabled
            && (self.kpm.report_period_ms == 0 || self.kpm.granularity_period_ms == 0)
        {
            return Err(ConfigError::Invalid(
                "kpm report and granularity periods must be positive".to_string(),
            ));
        }

        if !self.simulate {
            if self.relay.host.trim().is_empty() {
                return Err(ConfigError::Invalid("relay host must not be empty".to_string()));
            }
            if self.relay.port == 0 {
                return Err(ConfigError::Invalid("relay port must be non-zero".to_string()));
            }
            if self.relay.connect_attempts == 0 {
                return Err(ConfigError::Invalid(
                    "relay connect_attempts must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Switch to the 41-column layout and enable the KPM subscription.
    pub fn enable_throughput(&mut self) {
        self.schema = DatasetSchema::Throughput;
        self.kpm.enabled = true;
    }

    pub fn stop_condition(&self) -> StopCondition {
        StopCondition {
            target_samples: (self.target_samples > 0).then_some(self.target_samples),
            max_duration: self.duration,
        }
    }

    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            flush_every: self.flush_every,
            row_limit: (self.target_samples > 0).then_some(self.target_samples),
        }
    }

    pub fn kpm_subscription(&self) -> Option<KpmSubscription> {
        self.kpm.enabled.then(|| {
            KpmSubscription::throughput(
                self.kpm.report_period_ms,
                self.kpm.granularity_period_ms,
                self.kpm.sst,
            )
        })
    }
}
