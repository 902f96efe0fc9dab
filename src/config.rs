// Processing configuration
// One row in processing_config, read at startup and validated before any
// worker spawns. Invalid values are a fatal startup error; the pipeline
// refuses to run on unsafe defaults.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::{PackCamError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Seconds of pre/post padding added when cutting a clip.
    pub video_buffer: f64,
    /// Cap used to decide whether two incomplete halves may be merged.
    pub max_packing_time: f64,
    pub batch_size_min: u32,
    pub batch_size_max: u32,
    pub batch_size_default: u32,
    pub cpu_threshold_low: f64,
    pub cpu_threshold_high: f64,
    pub memory_threshold: f64,
    pub segment_length_seconds: f64,
    pub frame_sample_stride: u32,
}

impl ProcessingConfig {
    /// Load the singleton row. Missing row is a configuration error, not a
    /// silent default: migrations seed it, so absence means a broken deploy.
    pub fn load(conn: &Connection) -> Result<Self> {
        let config = conn
            .query_row(
                "SELECT video_buffer, max_packing_time, batch_size_min, batch_size_max,
                        batch_size_default, cpu_threshold_low, cpu_threshold_high,
                        memory_threshold, segment_length_seconds, frame_sample_stride
                 FROM processing_config WHERE id = 1",
                [],
                |row| {
                    Ok(ProcessingConfig {
                        video_buffer: row.get(0)?,
                        max_packing_time: row.get(1)?,
                        batch_size_min: row.get(2)?,
                        batch_size_max: row.get(3)?,
                        batch_size_default: row.get(4)?,
                        cpu_threshold_low: row.get(5)?,
                        cpu_threshold_high: row.get(6)?,
                        memory_threshold: row.get(7)?,
                        segment_length_seconds: row.get(8)?,
                        frame_sample_stride: row.get(9)?,
                    })
                },
            )
            .map_err(|_| {
                PackCamError::Config("processing_config row missing; re-run migrations".to_string())
            })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size_min == 0 || self.batch_size_min >= self.batch_size_max {
            return Err(PackCamError::Config(format!(
                "batch size bounds invalid: min {} must be in 1..max {}",
                self.batch_size_min, self.batch_size_max
            )));
        }
        if self.batch_size_default < self.batch_size_min
            || self.batch_size_default > self.batch_size_max
        {
            return Err(PackCamError::Config(format!(
                "default batch size {} outside [{}, {}]",
                self.batch_size_default, self.batch_size_min, self.batch_size_max
            )));
        }
        for (name, value) in [
            ("cpu_threshold_low", self.cpu_threshold_low),
            ("cpu_threshold_high", self.cpu_threshold_high),
            ("memory_threshold", self.memory_threshold),
        ] {
            if value <= 0.0 || value > 100.0 {
                return Err(PackCamError::Config(format!(
                    "{} must be within (0, 100], got {}",
                    name, value
                )));
            }
        }
        if self.cpu_threshold_low >= self.cpu_threshold_high {
            return Err(PackCamError::Config(format!(
                "cpu_threshold_low {} must be below cpu_threshold_high {}",
                self.cpu_threshold_low, self.cpu_threshold_high
            )));
        }
        if self.video_buffer < 0.0 {
            return Err(PackCamError::Config("video_buffer must be >= 0".to_string()));
        }
        if self.max_packing_time <= 0.0 {
            return Err(PackCamError::Config("max_packing_time must be > 0".to_string()));
        }
        if self.segment_length_seconds <= 0.0 {
            return Err(PackCamError::Config("segment_length_seconds must be > 0".to_string()));
        }
        if self.frame_sample_stride == 0 {
            return Err(PackCamError::Config("frame_sample_stride must be >= 1".to_string()));
        }
        Ok(())
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            video_buffer: DEFAULT_VIDEO_BUFFER_SECONDS,
            max_packing_time: DEFAULT_MAX_PACKING_TIME_SECONDS,
            batch_size_min: DEFAULT_BATCH_SIZE_MIN,
            batch_size_max: DEFAULT_BATCH_SIZE_MAX,
            batch_size_default: DEFAULT_BATCH_SIZE,
            cpu_threshold_low: DEFAULT_CPU_THRESHOLD_LOW,
            cpu_threshold_high: DEFAULT_CPU_THRESHOLD_HIGH,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            segment_length_seconds: DEFAULT_SEGMENT_LENGTH_SECONDS,
            frame_sample_stride: DEFAULT_FRAME_SAMPLE_STRIDE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::run_migrations;

    #[test]
    fn test_load_seeded_defaults() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let config = ProcessingConfig::load(&conn).unwrap();
        assert_eq!(config.batch_size_min, 2);
        assert_eq!(config.batch_size_max, 6);
        assert_eq!(config.cpu_threshold_low, 70.0);
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let mut config = ProcessingConfig::default();
        config.cpu_threshold_high = 120.0;
        assert!(config.validate().is_err());

        let mut config = ProcessingConfig::default();
        config.cpu_threshold_low = 95.0; // above high
        assert!(config.validate().is_err());

        let mut config = ProcessingConfig::default();
        config.memory_threshold = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_batch_bounds_rejected() {
        let mut config = ProcessingConfig::default();
        config.batch_size_min = 6;
        config.batch_size_max = 6;
        assert!(config.validate().is_err());

        let mut config = ProcessingConfig::default();
        config.batch_size_default = 7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stride_zero_rejected() {
        let mut config = ProcessingConfig::default();
        config.frame_sample_stride = 0;
        assert!(config.validate().is_err());
    }
}
