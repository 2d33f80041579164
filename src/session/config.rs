// Configuration de session - chargée depuis un fichier RON

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{MixerError, MixerResult};

/// Session parameters.
///
/// Every field has a default, so a RON file only needs to name what it
/// changes:
///
/// ```ron
/// (output_channels: 2, command_queue_capacity: 512)
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub input_channels: usize,
    pub output_channels: usize,
    /// Requested sample rate. Drivers may override it with the device rate.
    pub sample_rate: u32,
    /// Must be a power of two
    pub command_queue_capacity: usize,
    /// Must be a power of two
    pub result_queue_capacity: usize,
    /// Upper bound of actions owned by the executor at once
    pub max_active_actions: usize,
    /// Fixed driver block size in frames, `None` lets the device decide
    pub block_size: Option<u32>,
    pub poll_interval_ms: u64,
    /// Retired play and cancel records kept for `take_finished`, oldest
    /// dropped first. Records that hand something back are kept until taken.
    pub finished_history: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input_channels: 0,
            output_channels: 2,
            sample_rate: 44100,
            command_queue_capacity: 16,
            result_queue_capacity: 16,
            max_active_actions: 1024,
            block_size: None,
            poll_interval_ms: 10,
            finished_history: 64,
        }
    }
}

impl SessionConfig {
    /// Playback-only session
    pub fn output(channels: usize, sample_rate: u32) -> Self {
        Self {
            input_channels: 0,
            output_channels: channels,
            sample_rate,
            ..Self::default()
        }
    }

    /// Recording-only session
    pub fn input(channels: usize, sample_rate: u32) -> Self {
        Self {
            input_channels: channels,
            output_channels: 0,
            sample_rate,
            ..Self::default()
        }
    }

    pub fn duplex(input_channels: usize, output_channels: usize, sample_rate: u32) -> Self {
        Self {
            input_channels,
            output_channels,
            sample_rate,
            ..Self::default()
        }
    }

    /// Set both queue capacities
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.command_queue_capacity = capacity;
        self.result_queue_capacity = capacity;
        self
    }

    pub fn from_ron_str(data: &str) -> MixerResult<Self> {
        let config: SessionConfig = ron::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> MixerResult<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_ron_str(&data)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> MixerResult<()> {
        let data = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn validate(&self) -> MixerResult<()> {
        for capacity in [self.command_queue_capacity, self.result_queue_capacity] {
            if !capacity.is_power_of_two() {
                return Err(MixerError::InvalidCapacity(capacity));
            }
        }
        if self.max_active_actions == 0 {
            return Err(MixerError::InvalidConfig(
                "max_active_actions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
