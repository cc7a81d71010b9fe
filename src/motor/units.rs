// Unit conversion between the user frame (mm, origin-relative) and motor steps
//
// Control is step-count authoritative: mm values are converted once per move
// and positions are always derived back from steps, so rounding never
// accumulates across moves.

use serde::{Deserialize, Serialize};

use crate::config::{Axis, MachineConfig, Origin};

use super::error::MotionError;

/// Position in the configured origin frame, in mm
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LogicalPosition {
    pub x_mm: f64,
    pub y_mm: f64,
}

impl LogicalPosition {
    pub fn new(x_mm: f64, y_mm: f64) -> Self {
        Self { x_mm, y_mm }
    }

    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x_mm,
            Axis::Y => self.y_mm,
        }
    }
}

/// mm <-> step conversion for both axes, including origin remapping
#[derive(Debug, Clone)]
pub struct UnitConverter {
    origin: Origin,
    extent_mm: [f64; 2],     // [width, height]
    steps_per_mm: [f64; 2], // [x, y]
}

fn index(axis: Axis) -> usize {
    match axis {
        Axis::X => 0,
        Axis::Y => 1,
    }
}

impl UnitConverter {
    pub fn new(config: &MachineConfig) -> Self {
        Self {
            origin: config.origin,
            extent_mm: [config.canvas_width_mm, config.canvas_height_mm],
            steps_per_mm: [config.x.steps_per_mm, config.y.steps_per_mm],
        }
    }

    /// User-frame mm -> machine mm (machine 0 is the homed corner)
    pub fn to_machine_mm(&self, axis: Axis, mm: f64) -> f64 {
        let extent = self.extent_mm[index(axis)];
        match (self.origin, axis) {
            (Origin::TopLeft, _) => mm,
            (Origin::BottomLeft, Axis::X) => mm,
            (Origin::BottomLeft, Axis::Y) => extent - mm,
            (Origin::Center, _) => mm + extent / 2.0,
        }
    }

    /// Machine mm -> user-frame mm
    pub fn from_machine_mm(&self, axis: Axis, machine_mm: f64) -> f64 {
        let extent = self.extent_mm[index(axis)];
        match (self.origin, axis) {
            (Origin::TopLeft, _) => machine_mm,
            (Origin::BottomLeft, Axis::X) => machine_mm,
            (Origin::BottomLeft, Axis::Y) => extent - machine_mm,
            (Origin::Center, _) => machine_mm - extent / 2.0,
        }
    }

    /// Valid user-frame range for an axis, as (min, max)
    pub fn bounds_mm(&self, axis: Axis) -> (f64, f64) {
        let a = self.from_machine_mm(axis, 0.0);
        let b = self.from_machine_mm(axis, self.extent_mm[index(axis)]);
        (a.min(b), a.max(b))
    }

    /// round(machine_mm * steps_per_mm), without bounds checking
    pub fn mm_to_steps(&self, axis: Axis, mm: f64) -> i64 {
        let machine = self.to_machine_mm(axis, mm);
        (machine * self.steps_per_mm[index(axis)]).round() as i64
    }

    /// Exact inverse of [`Self::mm_to_steps`]; for reporting only
    pub fn steps_to_mm(&self, axis: Axis, steps: i64) -> f64 {
        let machine = steps as f64 / self.steps_per_mm[index(axis)];
        self.from_machine_mm(axis, machine)
    }

    /// Bounds-checked conversion of one coordinate
    pub fn checked_steps(&self, axis: Axis, mm: f64) -> Result<i64, MotionError> {
        let machine = self.to_machine_mm(axis, mm);
        let extent = self.extent_mm[index(axis)];
        if !(0.0..=extent).contains(&machine) {
            let (min_mm, max_mm) = self.bounds_mm(axis);
            return Err(MotionError::OutOfBounds {
                axis,
                value_mm: mm,
                min_mm,
                max_mm,
            });
        }
        Ok(self.mm_to_steps(axis, mm))
    }

    /// Convert a target position into [x, y] step targets. Both coordinates
    /// are checked before anything is returned.
    pub fn target_steps(&self, target: LogicalPosition) -> Result<[i64; 2], MotionError> {
        let x = self.checked_steps(Axis::X, target.x_mm)?;
        let y = self.checked_steps(Axis::Y, target.y_mm)?;
        Ok([x, y])
    }

    /// Logical position from [x, y] step counts
    pub fn position(&self, steps: [i64; 2]) -> LogicalPosition {
        LogicalPosition {
            x_mm: self.steps_to_mm(Axis::X, steps[0]),
            y_mm: self.steps_to_mm(Axis::Y, steps[1]),
        }
    }
}
