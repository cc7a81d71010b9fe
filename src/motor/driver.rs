// Step output seam
//
// The motion core calls a StepSink for every pulse it emits. Sinks buffer
// inside the tick and do their I/O in `end_tick`, so the tick itself never
// blocks on hardware.

use std::convert::Infallible;

use tracing::{debug, info};

use super::axis::{Direction, MotorId};

/// Where step pulses, enable state and pen state go
pub trait StepSink {
    type Error: std::error::Error + Send + Sync + 'static;

    /// One pulse on a motor, with the direction already inverted as needed
    fn emit_step(&mut self, motor: MotorId, direction: Direction);

    /// Energize or release all motor drivers
    fn set_enabled(&mut self, enabled: bool);

    /// Pen actuator (down = drawing)
    fn set_pen(&mut self, down: bool);

    /// Flush everything buffered during the tick
    fn end_tick(&mut self) -> Result<(), Self::Error>;
}

/// In-memory sink for running without hardware. Counts pulses per motor.
#[derive(Debug, Clone, Default)]
pub struct SimulatedSink {
    net: [i64; 3],
    total: [u64; 3],
    enabled: bool,
    pen_down: bool,
    pen_changes: u32,
    ticks: u64,
}

impl SimulatedSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pulses emitted on a motor, regardless of direction
    pub fn pulse_count(&self, motor: MotorId) -> u64 {
        self.total[motor.index()]
    }

    /// Forward minus reverse pulses, as seen on the driver's DIR line
    pub fn net_pulses(&self, motor: MotorId) -> i64 {
        self.net[motor.index()]
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_pen_down(&self) -> bool {
        self.pen_down
    }

    pub fn pen_changes(&self) -> u32 {
        self.pen_changes
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

impl StepSink for SimulatedSink {
    type Error = Infallible;

    fn emit_step(&mut self, motor: MotorId, direction: Direction) {
        self.net[motor.index()] += direction.sign();
        self.total[motor.index()] += 1;
    }

    fn set_enabled(&mut self, enabled: bool) {
        if enabled != self.enabled {
            info!("Simulated drivers {}", if enabled { "energized" } else { "released" });
        }
        self.enabled = enabled;
    }

    fn set_pen(&mut self, down: bool) {
        if down != self.pen_down {
            self.pen_changes += 1;
            debug!("Simulated pen {}", if down { "down" } else { "up" });
        }
        self.pen_down = down;
    }

    fn end_tick(&mut self) -> Result<(), Infallible> {
        self.ticks += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_sink_counts_pulses() {
        let mut sink = SimulatedSink::new();
        sink.emit_step(MotorId::X1, Direction::Forward);
        sink.emit_step(MotorId::X1, Direction::Forward);
        sink.emit_step(MotorId::X2, Direction::Reverse);
        sink.end_tick().unwrap();

        assert_eq!(sink.net_pulses(MotorId::X1), 2);
        assert_eq!(sink.net_pulses(MotorId::X2), -1);
        assert_eq!(sink.pulse_count(MotorId::X2), 1);
        assert_eq!(sink.pulse_count(MotorId::Y), 0);
        assert_eq!(sink.ticks(), 1);
    }

    #[test]
    fn test_simulated_sink_tracks_pen_changes() {
        let mut sink = SimulatedSink::new();
        sink.set_pen(true);
        sink.set_pen(true);
        sink.set_pen(false);
        assert_eq!(sink.pen_changes(), 2);
        assert!(!sink.is_pen_down());
    }
}
