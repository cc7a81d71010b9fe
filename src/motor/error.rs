// Errors produced by the motion core

use crate::config::Axis;

use super::axis::MotorId;

/// Per-move and per-command errors. All of these are recoverable: the motion
/// subsystem stays usable for the next valid command.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MotionError {
    #[error("Target {value_mm:.3} mm on axis {axis} is outside [{min_mm:.3}, {max_mm:.3}]")]
    OutOfBounds {
        axis: Axis,
        value_mm: f64,
        min_mm: f64,
        max_mm: f64,
    },

    #[error("Feed {feed_mm_min} mm/min must be positive")]
    InvalidFeed { feed_mm_min: f64 },

    #[error("Move queue full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("Axis {axis} is moving")]
    AxisBusy { axis: Axis },

    /// Needs closed-loop feedback; the open-loop core never produces it.
    #[error("Stall suspected on motor {motor}")]
    StallSuspected { motor: MotorId },
}
