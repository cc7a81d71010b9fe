// Timeouts, topics, machine configuration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

// Default stepping loop frequency (overridable per machine)
pub const DEFAULT_TICK_HZ: u32 = 1000;

// Status snapshots are published at this rate, not every tick
pub const STATUS_HZ: u32 = 10;

// No command for this long -> request idle (drives DISABLE_WHEN_IDLE)
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(2);

// Zenoh topics
pub const TOPIC_CMD_MOTION: &str = "plotter/cmd/motion"; // moves, pen, home, abort
pub const TOPIC_STATUS: &str = "plotter/state/status"; // position + motor snapshot
pub const TOPIC_HEALTH: &str = "plotter/state/health"; // health status

// Serial port for the step-bridge MCU
pub const STEP_BRIDGE_PORT: &str = "/dev/ttyUSB0";

// Pending-move window (matches the sender's sliding window)
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Errors raised while loading or validating a [`MachineConfig`]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid calibration for {axis}: {reason}")]
    InvalidCalibration { axis: String, reason: String },
}

/// Logical machine axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
}

impl Axis {
    pub const ALL: [Axis; 2] = [Axis::X, Axis::Y];
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::X => write!(f, "X"),
            Axis::Y => write!(f, "Y"),
        }
    }
}

/// Where (0, 0) sits on the canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Typical for graphics
    #[default]
    TopLeft,
    /// Typical for CNC
    BottomLeft,
    /// Center of the working area
    Center,
}

/// Per-axis calibration, all rates in steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisCalibration {
    /// (steps_per_rev * microstepping) / (belt_pitch_mm * pulley_teeth)
    pub steps_per_mm: f64,
    pub max_speed_steps_s: f64,
    pub accel_steps_s2: f64,
    /// Flip the pulse direction. On the gantry axis this applies to X1.
    #[serde(default)]
    pub invert: bool,
    /// Slack taken up after each direction reversal (0 disables)
    #[serde(default)]
    pub backlash_steps: u32,
}

impl Default for AxisCalibration {
    fn default() -> Self {
        Self {
            steps_per_mm: 10.0,
            max_speed_steps_s: 2000.0,
            accel_steps_s2: 1000.0,
            invert: false,
            backlash_steps: 0,
        }
    }
}

impl AxisCalibration {
    fn validate(&self, axis: Axis) -> Result<(), ConfigError> {
        let checks = [
            ("steps_per_mm", self.steps_per_mm),
            ("max_speed_steps_s", self.max_speed_steps_s),
            ("accel_steps_s2", self.accel_steps_s2),
        ];
        for (name, value) in checks {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::InvalidCalibration {
                    axis: axis.to_string(),
                    reason: format!("{} must be positive, got {}", name, value),
                });
            }
        }
        Ok(())
    }
}

/// Complete machine description, loaded once at startup and read-only after
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub canvas_width_mm: f64,
    pub canvas_height_mm: f64,
    pub x: AxisCalibration,
    pub y: AxisCalibration,
    /// Direction flip for the second gantry motor
    pub invert_x2: bool,
    pub origin: Origin,
    /// De-energize motors once everything is at rest and idle is requested
    pub disable_when_idle: bool,
    pub queue_capacity: usize,
    pub tick_hz: u32,
    /// Path speed for pen-up moves in mm/min (G0 feed). None runs at the axis limits.
    pub travel_feed_mm_min: Option<f64>,
    /// Path speed for pen-down moves in mm/min (G1 feed)
    pub draw_feed_mm_min: Option<f64>,
    /// Settle time after a pen change before motion resumes
    pub pen_delay_ms: u32,
    // Tessellation hints for upstream clients; the core only sees line segments
    pub curve_segments: u32,
    pub circle_segments: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            canvas_width_mm: 600.0,
            canvas_height_mm: 400.0,
            x: AxisCalibration::default(),
            y: AxisCalibration::default(),
            invert_x2: false,
            origin: Origin::TopLeft,
            disable_when_idle: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            tick_hz: DEFAULT_TICK_HZ,
            travel_feed_mm_min: None,
            draw_feed_mm_min: None,
            pen_delay_ms: 0,
            curve_segments: 20,
            circle_segments: 36,
        }
    }
}

impl MachineConfig {
    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading machine config from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: MachineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject anything that would make the motion subsystem misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        for axis in Axis::ALL {
            self.axis(axis).validate(axis)?;
            let extent = self.canvas_extent_mm(axis);
            if !(extent.is_finite() && extent > 0.0) {
                return Err(ConfigError::InvalidCalibration {
                    axis: axis.to_string(),
                    reason: format!("canvas dimension must be positive, got {}", extent),
                });
            }
        }
        if self.tick_hz == 0 {
            return Err(ConfigError::InvalidCalibration {
                axis: "all".to_string(),
                reason: "tick_hz must be non-zero".to_string(),
            });
        }
        for (name, feed) in [
            ("travel_feed_mm_min", self.travel_feed_mm_min),
            ("draw_feed_mm_min", self.draw_feed_mm_min),
        ] {
            if let Some(feed) = feed.filter(|f| !(f.is_finite() && *f > 0.0)) {
                return Err(ConfigError::InvalidCalibration {
                    axis: "all".to_string(),
                    reason: format!("{} must be positive, got {}", name, feed),
                });
            }
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidCalibration {
                axis: "all".to_string(),
                reason: "queue_capacity must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn axis(&self, axis: Axis) -> &AxisCalibration {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
        }
    }

    /// Canvas size along an axis in mm
    pub fn canvas_extent_mm(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.canvas_width_mm,
            Axis::Y => self.canvas_height_mm,
        }
    }

    /// Tick interval in seconds
    pub fn tick_dt(&self) -> f64 {
        1.0 / self.tick_hz as f64
    }

    /// pen_delay_ms rounded up to whole ticks
    pub fn pen_dwell_ticks(&self) -> u32 {
        (self.pen_delay_ms as u64 * self.tick_hz as u64).div_ceil(1000) as u32
    }

    /// Configured feed for a pen state, mm/min
    pub fn feed_for(&self, pen_down: bool) -> Option<f64> {
        if pen_down {
            self.draw_feed_mm_min
        } else {
            self.travel_feed_mm_min
        }
    }
}
