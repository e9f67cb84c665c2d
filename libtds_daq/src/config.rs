use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::ConfigError;

/// Addresses of the two multicast groups the external trigger system publishes on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Local interface used to join the groups
    pub interface: Ipv4Addr,
    pub info_group: Ipv4Addr,
    pub info_port: u16,
    pub control_group: Ipv4Addr,
    pub control_port: u16,
    /// Upper bound on how long a receive call blocks before re-checking for stop
    pub poll_interval_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            interface: Ipv4Addr::UNSPECIFIED,
            info_group: Ipv4Addr::new(239, 0, 0, 1),
            info_port: 2001,
            control_group: Ipv4Addr::new(239, 0, 0, 2),
            control_port: 2002,
            poll_interval_ms: 250,
        }
    }
}

impl TriggerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Frequency probe window settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencyConfig {
    pub duration_ms: u64,
    pub slice_us: u64,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            duration_ms: 1000,
            slice_us: 100,
        }
    }
}

impl FrequencyConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn slice(&self) -> Duration {
        Duration::from_micros(self.slice_us)
    }
}

/// Structure representing the acquisition configuration. Contains pathing, rotation and timing information
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub output_path: PathBuf,
    pub channel_map_path: Option<PathBuf>,
    pub records_per_file: u64,
    pub read_interval_us: u64,
    pub frequency: FrequencyConfig,
    pub trigger: Option<TriggerConfig>,
}

impl Default for Config {
    /// Generate a new Config object. Paths are placeholders, timings are usable
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("None"),
            channel_map_path: None,
            records_per_file: 10_000,
            read_interval_us: 1000,
            frequency: FrequencyConfig::default(),
            trigger: Some(TriggerConfig::default()),
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        let config = serde_yaml::from_str::<Self>(&yaml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the pipeline spin or never rotate
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.records_per_file == 0 {
            return Err(ConfigError::ZeroValue("records_per_file"));
        }
        if self.read_interval_us == 0 {
            return Err(ConfigError::ZeroValue("read_interval_us"));
        }
        if self.frequency.slice_us == 0 {
            return Err(ConfigError::ZeroValue("frequency.slice_us"));
        }
        if let Some(trigger) = &self.trigger {
            if trigger.poll_interval_ms == 0 {
                return Err(ConfigError::ZeroValue("trigger.poll_interval_ms"));
            }
        }
        Ok(())
    }

    pub fn read_interval(&self) -> Duration {
        Duration::from_micros(self.read_interval_us)
    }

    /// Get the directory holding all of the files of a run
    pub fn get_run_directory(&self, run_number: u64) -> PathBuf {
        self.output_path.join(get_run_str(run_number))
    }

    pub fn is_correlated(&self) -> bool {
        self.trigger.is_some()
    }
}

/// Construct the run string used for directory and file names
pub fn get_run_str(run_number: u64) -> String {
    format!("run_{run_number:0>6}")
}
