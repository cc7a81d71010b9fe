// Axis drives: one shared trapezoidal profile stepping N motors in lockstep
//
// The gantry X axis is the two-motor instance (X1 + X2). Both motors take
// every step in the same statement, so they cannot rack under normal
// operation. Each motor's inversion flag is applied only to the emitted
// pulse direction, never to the tracked step count.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{Axis, AxisCalibration};

use super::driver::StepSink;
use super::profile::{Limits, Phase, TrapezoidProfile};

/// Physical motors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MotorId {
    X1,
    X2,
    Y,
}

impl MotorId {
    pub const ALL: [MotorId; 3] = [MotorId::X1, MotorId::X2, MotorId::Y];

    /// Slot used by step-bridge frames and sink counters
    pub fn index(self) -> usize {
        match self {
            MotorId::X1 => 0,
            MotorId::X2 => 1,
            MotorId::Y => 2,
        }
    }
}

impl std::fmt::Display for MotorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    /// Direction of a signed step delta; None for zero
    pub fn of(delta: i64) -> Option<Self> {
        match delta.signum() {
            1 => Some(Direction::Forward),
            -1 => Some(Direction::Reverse),
            _ => None,
        }
    }

    pub fn sign(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Reverse => -1,
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }
}

/// State of one physical motor. `current_step` is the only position truth.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotorState {
    pub id: MotorId,
    pub current_step: i64,
    pub target_step: i64,
    pub current_speed_steps_s: f64,
    pub direction: Direction,
    pub last_direction: Direction,
    pub invert: bool,
}

impl MotorState {
    pub fn new(id: MotorId, invert: bool) -> Self {
        Self {
            id,
            current_step: 0,
            target_step: 0,
            current_speed_steps_s: 0.0,
            direction: Direction::Forward,
            last_direction: Direction::Forward,
            invert,
        }
    }

    /// Direction actually put on the driver's DIR line
    pub fn pulse_direction(&self, direction: Direction) -> Direction {
        if self.invert {
            direction.flipped()
        } else {
            direction
        }
    }
}

/// A target prepared for an axis but not yet installed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisSegment {
    /// Target in logical steps (what the caller asked for)
    pub logical_target: i64,
    /// Target in motor steps, including any backlash take-up
    pub motor_target: i64,
    pub direction: Option<Direction>,
    /// Slack steps to absorb before logical motion resumes
    pub slack: i64,
}

impl AxisSegment {
    /// Motor steps this segment will travel from `from`
    pub fn distance_from(&self, from: i64) -> u64 {
        (self.motor_target - from).unsigned_abs()
    }
}

/// N motors on one logical axis, driven from one profile
#[derive(Debug, Clone)]
pub struct AxisDrive<const N: usize> {
    axis: Axis,
    profile: TrapezoidProfile,
    motors: [MotorState; N],
    backlash_steps: i64,
    /// Backlash motion already contained in `current_step`
    slack_offset: i64,
    /// Backlash still to be taken up in the current direction
    slack_pending: i64,
}

/// The X axis: X1 and X2 phase-locked
pub type GantryAxis = AxisDrive<2>;

/// The Y axis
pub type SingleAxis = AxisDrive<1>;

impl GantryAxis {
    pub fn gantry(calibration: &AxisCalibration, invert_x2: bool) -> Self {
        Self::new(
            Axis::X,
            calibration,
            [
                MotorState::new(MotorId::X1, calibration.invert),
                MotorState::new(MotorId::X2, invert_x2),
            ],
        )
    }
}

impl SingleAxis {
    pub fn single(axis: Axis, id: MotorId, calibration: &AxisCalibration) -> Self {
        Self::new(axis, calibration, [MotorState::new(id, calibration.invert)])
    }
}

impl<const N: usize> AxisDrive<N> {
    pub fn new(axis: Axis, calibration: &AxisCalibration, motors: [MotorState; N]) -> Self {
        Self {
            axis,
            profile: TrapezoidProfile::new(Self::configured_limits(calibration)),
            motors,
            backlash_steps: calibration.backlash_steps as i64,
            slack_offset: 0,
            slack_pending: 0,
        }
    }

    pub fn configured_limits(calibration: &AxisCalibration) -> Limits {
        Limits::new(calibration.max_speed_steps_s, calibration.accel_steps_s2)
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    pub fn motors(&self) -> &[MotorState; N] {
        &self.motors
    }

    pub fn profile(&self) -> &TrapezoidProfile {
        &self.profile
    }

    pub fn phase(&self) -> Phase {
        self.profile.phase()
    }

    pub fn is_at_rest(&self) -> bool {
        self.profile.is_at_rest()
    }

    /// Moving and close enough to the target that it is already slowing for it
    pub fn on_braking_curve(&self) -> bool {
        let profile = &self.profile;
        profile.phase().is_moving()
            && profile.distance_to_go().abs() as f64 <= profile.braking_distance() + 2.0
    }

    /// Motor position (identical for every motor on the axis)
    pub fn motor_steps(&self) -> i64 {
        self.profile.position()
    }

    /// Position with backlash take-up removed
    pub fn logical_steps(&self) -> i64 {
        self.profile.position() - self.slack_offset
    }

    fn direction(&self) -> Direction {
        self.motors[0].direction
    }

    /// Work out the motor target for a logical target. Backlash is added only
    /// when the new direction differs from the current one.
    pub fn prepare(&self, logical_target: i64) -> AxisSegment {
        let delta = logical_target - self.logical_steps();
        let direction = Direction::of(delta);
        let slack = match direction {
            Some(dir) if dir != self.direction() => {
                // Whatever slack was already taken up must be given back
                self.backlash_steps - self.slack_pending
            }
            Some(_) => self.slack_pending,
            None => 0,
        };
        let offset = match direction {
            Some(dir) if dir != self.direction() => self.slack_offset + dir.sign() * slack,
            Some(dir) => self.slack_offset + dir.sign() * self.slack_pending,
            None => self.slack_offset,
        };
        AxisSegment {
            logical_target,
            motor_target: logical_target + offset,
            direction,
            slack,
        }
    }

    /// Install a prepared segment with its (coordinated) limits
    pub fn install(&mut self, segment: AxisSegment, limits: Limits) {
        if let Some(direction) = segment.direction {
            let previous = self.direction();
            if direction != previous && segment.slack > 0 {
                debug!(
                    "Axis {}: reversal, taking up {} backlash steps",
                    self.axis, segment.slack
                );
            }
            for motor in self.motors.iter_mut() {
                motor.last_direction = previous;
                motor.direction = direction;
            }
            self.slack_pending = segment.slack;
        }
        self.profile.set_limits(limits);
        self.profile.set_target(segment.motor_target);
        for motor in self.motors.iter_mut() {
            motor.target_step = segment.motor_target;
        }
    }

    /// Controlled deceleration to the nearest reachable stop
    pub fn stop(&mut self) {
        self.profile.stop();
        let target = self.profile.target();
        for motor in self.motors.iter_mut() {
            motor.target_step = target;
        }
    }

    /// Homing entry point: the current location becomes step 0
    pub fn reset_origin(&mut self) {
        self.profile.reset_position(0);
        self.slack_offset = 0;
        self.slack_pending = 0;
        for motor in self.motors.iter_mut() {
            motor.current_step = 0;
            motor.target_step = 0;
            motor.current_speed_steps_s = 0.0;
        }
    }

    /// Evaluate the shared profile once and apply the result to every motor
    pub fn tick<S: StepSink>(&mut self, dt: f64, sink: &mut S) -> i64 {
        let taken = self.profile.tick(dt);
        if let Some(direction) = Direction::of(taken) {
            for _ in 0..taken.abs() {
                for motor in self.motors.iter_mut() {
                    motor.current_step += direction.sign();
                    sink.emit_step(motor.id, motor.pulse_direction(direction));
                }
                if self.slack_pending > 0 && direction == self.direction() {
                    self.slack_pending -= 1;
                    self.slack_offset += direction.sign();
                }
            }
        }
        let speed = self.profile.speed();
        for motor in self.motors.iter_mut() {
            motor.current_speed_steps_s = speed;
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::driver::SimulatedSink;

    const DT: f64 = 0.001;

    fn calibration(backlash_steps: u32) -> AxisCalibration {
        AxisCalibration {
            backlash_steps,
            ..AxisCalibration::default()
        }
    }

    fn drive_to<const N: usize>(drive: &mut AxisDrive<N>, target: i64, sink: &mut SimulatedSink) {
        let segment = drive.prepare(target);
        let limits = drive.profile().limits();
        drive.install(segment, limits);
        for _ in 0..100_000 {
            drive.tick(DT, sink);
            if drive.is_at_rest() {
                return;
            }
        }
        panic!("axis did not settle");
    }

    #[test]
    fn test_gantry_motors_step_together() {
        let mut sink = SimulatedSink::new();
        let mut x = GantryAxis::gantry(&calibration(0), false);
        let segment = x.prepare(750);
        x.install(segment, x.profile().limits());
        for _ in 0..100_000 {
            x.tick(DT, &mut sink);
            let [x1, x2] = x.motors();
            assert_eq!(x1.current_step, x2.current_step);
            if x.is_at_rest() {
                break;
            }
        }
        assert_eq!(x.motors()[0].current_step, 750);
        assert_eq!(sink.pulse_count(MotorId::X1), 750);
        assert_eq!(sink.pulse_count(MotorId::X2), 750);
    }

    #[test]
    fn test_inversion_only_affects_pulse_direction() {
        let mut sink = SimulatedSink::new();
        let mut x = GantryAxis::gantry(&calibration(0), true);
        drive_to(&mut x, 120, &mut sink);
        assert_eq!(x.motors()[0].current_step, 120);
        assert_eq!(x.motors()[1].current_step, 120);
        assert_eq!(sink.net_pulses(MotorId::X1), 120);
        assert_eq!(sink.net_pulses(MotorId::X2), -120);
    }

    #[test]
    fn test_no_backlash_without_reversal() {
        let mut sink = SimulatedSink::new();
        let mut y = SingleAxis::single(Axis::Y, MotorId::Y, &calibration(20));
        drive_to(&mut y, 100, &mut sink);
        drive_to(&mut y, 150, &mut sink);
        assert_eq!(y.motor_steps(), 150);
        assert_eq!(y.logical_steps(), 150);
    }

    #[test]
    fn test_backlash_added_once_per_reversal() {
        let mut sink = SimulatedSink::new();
        let mut y = SingleAxis::single(Axis::Y, MotorId::Y, &calibration(20));
        drive_to(&mut y, 100, &mut sink);

        let segment = y.prepare(80);
        assert_eq!(segment.direction, Some(Direction::Reverse));
        assert_eq!(segment.slack, 20);
        assert_eq!(segment.motor_target, 60);

        drive_to(&mut y, 80, &mut sink);
        assert_eq!(y.motor_steps(), 60);
        assert_eq!(y.logical_steps(), 80);
        assert_eq!(y.motors()[0].last_direction, Direction::Forward);
        assert_eq!(y.motors()[0].direction, Direction::Reverse);

        // Same direction again: no further compensation
        drive_to(&mut y, 70, &mut sink);
        assert_eq!(y.motor_steps(), 50);
        assert_eq!(y.logical_steps(), 70);

        // Reverse back: slack taken up the other way
        drive_to(&mut y, 100, &mut sink);
        assert_eq!(y.motor_steps(), 100);
        assert_eq!(y.logical_steps(), 100);
    }

    #[test]
    fn test_take_up_is_not_logical_motion() {
        let mut sink = SimulatedSink::new();
        let mut y = SingleAxis::single(Axis::Y, MotorId::Y, &calibration(20));
        drive_to(&mut y, 100, &mut sink);

        let segment = y.prepare(80);
        y.install(segment, y.profile().limits());
        for _ in 0..100_000 {
            y.tick(DT, &mut sink);
            if y.motor_steps() >= 80 {
                assert_eq!(y.logical_steps(), 100);
            }
            if y.is_at_rest() {
                break;
            }
        }
        assert_eq!(y.logical_steps(), 80);
    }

    #[test]
    fn test_braking_curve_reached_near_target() {
        let mut sink = SimulatedSink::new();
        let mut y = SingleAxis::single(Axis::Y, MotorId::Y, &calibration(0));
        assert!(!y.on_braking_curve());
        let segment = y.prepare(400);
        y.install(segment, y.profile().limits());
        let mut first = None;
        for tick in 0..100_000 {
            y.tick(DT, &mut sink);
            if first.is_none() && y.on_braking_curve() {
                first = Some((tick, y.motor_steps()));
            }
            if y.is_at_rest() {
                break;
            }
        }
        // Triangular move: braking starts around the midpoint
        let (_, at) = first.unwrap();
        assert!((180..=220).contains(&at), "braking from step {}", at);
        assert!(!y.on_braking_curve());
    }

    #[test]
    fn test_reset_origin_zeroes_all_motors() {
        let mut sink = SimulatedSink::new();
        let mut x = GantryAxis::gantry(&calibration(5), false);
        drive_to(&mut x, 300, &mut sink);
        drive_to(&mut x, 200, &mut sink);
        x.reset_origin();
        assert_eq!(x.motor_steps(), 0);
        assert_eq!(x.logical_steps(), 0);
        assert!(x.motors().iter().all(|m| m.current_step == 0));
        assert!(x.is_at_rest());
    }
}
