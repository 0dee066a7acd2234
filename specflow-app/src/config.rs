//! Simple configuration persistence for specflow
//!
//! Stores the initial property values applied to the supervisor at startup.

use specflow_engine::Settings;
use std::fs;
use std::io;
use std::path::Path;

/// Startup configuration; every field falls back to the engine default
#[derive(Debug, Default)]
pub struct Config {
    pub fft_size: Option<usize>,
    pub overlap: Option<usize>,
    pub num_avg: Option<usize>,
    pub log_coefficient: Option<f32>,
    pub rf_freq_units: Option<bool>,
}

impl Config {
    /// Load config from a specific path
    pub fn load_from(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Fold the configured values over the engine defaults
    pub fn settings(&self) -> Settings {
        let defaults = Settings::default();
        Settings {
            fft_size: self.fft_size.unwrap_or(defaults.fft_size),
            overlap: self.overlap.unwrap_or(defaults.overlap),
            num_avg: self.num_avg.unwrap_or(defaults.num_avg),
            log_coefficient: self.log_coefficient.unwrap_or(defaults.log_coefficient),
            rf_freq_units: self.rf_freq_units.unwrap_or(defaults.rf_freq_units),
        }
    }

    /// Parse config from simple key=value format
    fn parse(content: &str) -> Self {
        let mut config = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim();

                match key {
                    "fft_size" => config.fft_size = value.parse().ok(),
                    "overlap" => config.overlap = value.parse().ok(),
                    "num_avg" => config.num_avg = value.parse().ok(),
                    "log_coefficient" => config.log_coefficient = value.parse().ok(),
                    "rf_freq_units" => config.rf_freq_units = value.parse().ok(),
                    _ => {} // Ignore unknown keys
                }
            }
        }

        config
    }
}
