// Position/state tracker and coordinated mover
//
// Owns every MotorState. All mutation happens in `tick`, which the runtime
// calls at a fixed rate; commands only enqueue work that is installed at the
// next tick boundary.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{Axis, MachineConfig};

use super::axis::{Direction, GantryAxis, MotorId, MotorState, SingleAxis};
use super::driver::StepSink;
use super::error::MotionError;
use super::planner::{coordinate, feed_limits, move_duration};
use super::profile::Phase;
use super::units::{LogicalPosition, UnitConverter};

/// One straight-line segment with a pen state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Move {
    pub target: LogicalPosition,
    pub pen_down: bool,
    /// Path speed in mm/min. None uses the configured draw/travel feed.
    pub feed_mm_min: Option<f64>,
}

impl Move {
    pub fn new(x_mm: f64, y_mm: f64, pen_down: bool) -> Self {
        Self {
            target: LogicalPosition::new(x_mm, y_mm),
            pen_down,
            feed_mm_min: None,
        }
    }

    pub fn with_feed(mut self, feed_mm_min: f64) -> Self {
        self.feed_mm_min = Some(feed_mm_min);
        self
    }
}

/// Work waiting for a tick boundary
#[derive(Debug, Clone, Copy)]
enum Queued {
    Move { mv: Move, steps: [i64; 2] },
    Pen(bool),
}

/// The move the axes are currently executing
#[derive(Debug, Clone, Copy)]
struct ActiveMove {
    mv: Move,
    /// Logical target steps [x, y]
    steps: [i64; 2],
    directions: [Option<Direction>; 2],
}

/// Overall machine state for status output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Ready,
    Moving,
    Stopping,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotorStatus {
    pub id: MotorId,
    pub step: i64,
    pub speed: f64,
    pub phase: Phase,
}

/// Consistent view of the tracker, taken between ticks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub position: LogicalPosition,
    pub pen_down: bool,
    pub enabled: bool,
    pub state: MachineState,
    pub queue_depth: usize,
    pub completed_moves: u64,
    pub motors: Vec<MotorStatus>,
}

pub struct MotionController {
    config: MachineConfig,
    converter: UnitConverter,
    x: GantryAxis,
    y: SingleAxis,
    queue: VecDeque<Queued>,
    active: Option<ActiveMove>,
    aborting: bool,
    pen_down: bool,
    pen_dirty: bool,
    /// Ticks to hold still after a pen change
    pen_dwell: u32,
    dwell_ticks: u32,
    enabled: bool,
    enabled_dirty: bool,
    idle_requested: bool,
    dt: f64,
    completed_moves: u64,
}

impl MotionController {
    /// The config must already be validated
    pub fn new(config: MachineConfig) -> Self {
        let converter = UnitConverter::new(&config);
        let x = GantryAxis::gantry(&config.x, config.invert_x2);
        let y = SingleAxis::single(Axis::Y, MotorId::Y, &config.y);
        let dt = config.tick_dt();
        let pen_dwell = config.pen_dwell_ticks();
        info!(
            "Motion controller: {}x{} mm canvas, origin {:?}, {} Hz tick",
            config.canvas_width_mm, config.canvas_height_mm, config.origin, config.tick_hz
        );
        Self {
            config,
            converter,
            x,
            y,
            queue: VecDeque::new(),
            active: None,
            aborting: false,
            pen_down: false,
            pen_dirty: true,
            pen_dwell,
            dwell_ticks: 0,
            enabled: true,
            enabled_dirty: true,
            idle_requested: false,
            dt,
            completed_moves: 0,
        }
    }

    pub fn converter(&self) -> &UnitConverter {
        &self.converter
    }

    /// Logical position derived from step counts
    pub fn current_position(&self) -> LogicalPosition {
        self.converter
            .position([self.x.logical_steps(), self.y.logical_steps()])
    }

    fn ensure_capacity(&self) -> Result<(), MotionError> {
        if self.queue.len() >= self.config.queue_capacity {
            return Err(MotionError::QueueFull {
                capacity: self.config.queue_capacity,
            });
        }
        Ok(())
    }

    /// Validate and enqueue a move. Rejected moves leave everything untouched.
    pub fn apply_move(&mut self, mv: Move) -> Result<(), MotionError> {
        let steps = self.converter.target_steps(mv.target)?;
        if let Some(feed_mm_min) = mv.feed_mm_min.filter(|f| !(f.is_finite() && *f > 0.0)) {
            return Err(MotionError::InvalidFeed { feed_mm_min });
        }
        self.ensure_capacity()?;
        self.queue.push_back(Queued::Move { mv, steps });
        self.idle_requested = false;
        Ok(())
    }

    /// Pen change, applied in order with queued moves. Queued pen changes
    /// share the move window.
    pub fn set_pen_state(&mut self, down: bool) -> Result<(), MotionError> {
        if self.is_idle() {
            self.change_pen(down);
            return Ok(());
        }
        self.ensure_capacity()?;
        self.queue.push_back(Queued::Pen(down));
        Ok(())
    }

    pub fn pen_down(&self) -> bool {
        self.pen_down
    }

    /// Returns true if the pen actually moves; starts the settle dwell
    fn change_pen(&mut self, down: bool) -> bool {
        if self.pen_down == down {
            return false;
        }
        self.pen_down = down;
        self.pen_dirty = true;
        self.dwell_ticks = self.pen_dwell;
        true
    }

    /// Request (or cancel) idle. Motors are only released once everything is
    /// at rest and `disable_when_idle` is set.
    pub fn set_idle(&mut self, idle: bool) {
        self.idle_requested = idle;
        if !idle && !self.enabled {
            self.enabled = true;
            self.enabled_dirty = true;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Decelerate every axis to a stop and drop pending work
    pub fn abort(&mut self) {
        let dropped = self.queue.len();
        self.queue.clear();
        self.dwell_ticks = 0;
        if self.x.is_at_rest() && self.y.is_at_rest() {
            self.active = None;
            return;
        }
        warn!("Abort: stopping all axes, {} pending commands dropped", dropped);
        self.x.stop();
        self.y.stop();
        self.aborting = true;
    }

    /// Homing entry point: the axis's current location becomes machine 0
    pub fn reset_origin(&mut self, axis: Axis) -> Result<(), MotionError> {
        let at_rest = match axis {
            Axis::X => self.x.is_at_rest(),
            Axis::Y => self.y.is_at_rest(),
        };
        if !at_rest || self.active.is_some() {
            return Err(MotionError::AxisBusy { axis });
        }
        match axis {
            Axis::X => self.x.reset_origin(),
            Axis::Y => self.y.reset_origin(),
        }
        info!("Axis {} origin reset", axis);
        Ok(())
    }

    /// No move in flight, nothing pending, pen settled
    pub fn is_idle(&self) -> bool {
        self.active.is_none()
            && self.queue.is_empty()
            && self.dwell_ticks == 0
            && self.x.is_at_rest()
            && self.y.is_at_rest()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn motors(&self) -> [&MotorState; 3] {
        let [x1, x2] = self.x.motors();
        let [y] = self.y.motors();
        [x1, x2, y]
    }

    pub fn motor_phases(&self) -> [(MotorId, Phase); 3] {
        [
            (MotorId::X1, self.x.phase()),
            (MotorId::X2, self.x.phase()),
            (MotorId::Y, self.y.phase()),
        ]
    }

    pub fn axis_phase(&self, axis: Axis) -> Phase {
        match axis {
            Axis::X => self.x.phase(),
            Axis::Y => self.y.phase(),
        }
    }

    pub fn state(&self) -> MachineState {
        if !self.enabled {
            MachineState::Disabled
        } else if self.aborting {
            MachineState::Stopping
        } else if self.active.is_some() || !self.queue.is_empty() || self.dwell_ticks > 0 {
            MachineState::Moving
        } else {
            MachineState::Ready
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            position: self.current_position(),
            pen_down: self.pen_down,
            enabled: self.enabled,
            state: self.state(),
            queue_depth: self.queue.len(),
            completed_moves: self.completed_moves,
            motors: self
                .motors()
                .iter()
                .zip(self.motor_phases())
                .map(|(motor, (_, phase))| MotorStatus {
                    id: motor.id,
                    step: motor.current_step,
                    speed: motor.current_speed_steps_s,
                    phase,
                })
                .collect(),
        }
    }

    /// Pull the next queued command into the active slot
    fn install_next(&mut self) {
        while let Some(next) = self.queue.pop_front() {
            match next {
                Queued::Pen(down) => {
                    if self.change_pen(down) && self.dwell_ticks > 0 {
                        return;
                    }
                }
                Queued::Move { mv, steps } => {
                    if self.change_pen(mv.pen_down) && self.dwell_ticks > 0 {
                        // Let the pen settle before moving
                        self.queue.push_front(next);
                        return;
                    }
                    self.start_move(mv, steps);
                    return;
                }
            }
        }
    }

    /// Hand the next queued move to the axes while the active one is still on
    /// its braking curve. Only moves that keep every axis's direction and the
    /// pen state qualify, so the pen runs through the vertex without stopping.
    fn try_blend(&mut self) {
        let Some(active) = self.active else {
            return;
        };
        if self.aborting || active.directions == [None, None] {
            return;
        }
        let Some(&Queued::Move { mv, steps }) = self.queue.front() else {
            return;
        };
        if mv.pen_down != self.pen_down {
            return;
        }
        let next = [
            Direction::of(steps[0] - active.steps[0]),
            Direction::of(steps[1] - active.steps[1]),
        ];
        if next != active.directions {
            return;
        }
        let ready = |moving: bool, braking: bool, at_rest: bool| {
            if moving { braking } else { at_rest }
        };
        if !ready(
            active.directions[0].is_some(),
            self.x.on_braking_curve(),
            self.x.is_at_rest(),
        ) || !ready(
            active.directions[1].is_some(),
            self.y.on_braking_curve(),
            self.y.is_at_rest(),
        ) {
            return;
        }

        self.queue.pop_front();
        self.completed_moves += 1;
        debug!(
            "Blending ({:.3}, {:.3}) into ({:.3}, {:.3})",
            active.mv.target.x_mm, active.mv.target.y_mm, mv.target.x_mm, mv.target.y_mm
        );
        self.start_move(mv, steps);
    }

    fn start_move(&mut self, mv: Move, steps: [i64; 2]) {
        let from = self.current_position();
        // Backlash first, then scale on the compensated distances
        let seg_x = self.x.prepare(steps[0]);
        let seg_y = self.y.prepare(steps[1]);
        let distances = [
            seg_x.distance_from(self.x.motor_steps()),
            seg_y.distance_from(self.y.motor_steps()),
        ];
        let mut configured = [
            GantryAxis::configured_limits(&self.config.x),
            SingleAxis::configured_limits(&self.config.y),
        ];
        if let Some(feed) = mv.feed_mm_min.or(self.config.feed_for(mv.pen_down)) {
            let path_mm = Axis::ALL
                .iter()
                .map(|&axis| (mv.target.get(axis) - from.get(axis)).powi(2))
                .sum::<f64>()
                .sqrt();
            configured = feed_limits(distances, configured, path_mm, feed / 60.0);
        }
        let [limits_x, limits_y] = coordinate(distances, configured);
        debug!(
            "Move to ({:.3}, {:.3}) pen {}: {:?} steps, est {:.3}s",
            mv.target.x_mm,
            mv.target.y_mm,
            if mv.pen_down { "down" } else { "up" },
            distances,
            move_duration(distances[0], limits_x).max(move_duration(distances[1], limits_y))
        );
        self.x.install(seg_x, limits_x);
        self.y.install(seg_y, limits_y);
        if !self.enabled {
            self.enabled = true;
            self.enabled_dirty = true;
        }
        self.active = Some(ActiveMove {
            mv,
            steps,
            directions: [seg_x.direction, seg_y.direction],
        });
    }

    /// One scheduler tick: install work, step every axis, settle state
    pub fn tick<S: StepSink>(&mut self, sink: &mut S) {
        if self.dwell_ticks > 0 {
            self.dwell_ticks -= 1;
        } else if self.active.is_none() && !self.aborting {
            self.install_next();
        } else {
            self.try_blend();
        }

        if self.enabled_dirty {
            sink.set_enabled(self.enabled);
            self.enabled_dirty = false;
        }
        if self.pen_dirty {
            sink.set_pen(self.pen_down);
            self.pen_dirty = false;
        }

        self.x.tick(self.dt, sink);
        self.y.tick(self.dt, sink);

        if self.x.is_at_rest() && self.y.is_at_rest() {
            if self.aborting {
                info!("Abort complete at {:?}", self.current_position());
                self.aborting = false;
                self.active = None;
            } else if let Some(active) = self.active.take() {
                self.completed_moves += 1;
                debug!(
                    "Move complete: ({:.3}, {:.3})",
                    active.mv.target.x_mm, active.mv.target.y_mm
                );
            }
        }

        if self.idle_requested
            && self.config.disable_when_idle
            && self.enabled
            && self.is_idle()
        {
            info!("All axes at rest, releasing motors");
            self.enabled = false;
            sink.set_enabled(false);
        }
    }
}
