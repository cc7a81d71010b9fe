// Per-axis trapezoidal motion generator
//
// Evaluated once per scheduler tick. Speed ramps toward max_speed at the
// acceleration bound and follows the braking curve down to the target, so a
// new target can be installed mid-motion without a velocity jump.

use serde::{Deserialize, Serialize};

/// Motion phase reported per motor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Accelerating,
    Cruising,
    Decelerating,
}

impl Phase {
    pub fn is_moving(self) -> bool {
        self != Phase::Idle
    }
}

/// Speed and acceleration bounds in steps/s and steps/s²
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub max_speed: f64,
    pub accel: f64,
}

impl Limits {
    pub fn new(max_speed: f64, accel: f64) -> Self {
        Self { max_speed, accel }
    }
}

#[derive(Debug, Clone)]
pub struct TrapezoidProfile {
    limits: Limits,
    position: i64,
    target: i64,
    /// Signed, steps/s
    velocity: f64,
    /// Progress toward the next step along the direction of travel, [0, 1)
    fraction: f64,
    phase: Phase,
}

impl TrapezoidProfile {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            position: 0,
            target: 0,
            velocity: 0.0,
            fraction: 0.0,
            phase: Phase::Idle,
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Takes effect on the next tick
    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = limits;
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn target(&self) -> i64 {
        self.target
    }

    /// Unsigned speed in steps/s
    pub fn speed(&self) -> f64 {
        self.velocity.abs()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn distance_to_go(&self) -> i64 {
        self.target - self.position
    }

    pub fn is_at_rest(&self) -> bool {
        self.position == self.target && self.velocity == 0.0
    }

    /// Distance needed to stop from the current speed
    pub fn braking_distance(&self) -> f64 {
        let v = self.velocity;
        v * v / (2.0 * self.limits.accel)
    }

    /// Retarget. The current velocity is kept, so consecutive segments blend.
    pub fn set_target(&mut self, target: i64) {
        self.target = target;
    }

    /// Force the position without motion (homing). Clears all motion state.
    pub fn reset_position(&mut self, position: i64) {
        self.position = position;
        self.target = position;
        self.velocity = 0.0;
        self.fraction = 0.0;
        self.phase = Phase::Idle;
    }

    /// Retarget to the nearest point reachable at the acceleration bound
    pub fn stop(&mut self) {
        if self.velocity == 0.0 {
            self.target = self.position;
            return;
        }
        let run_out = self.braking_distance().ceil() as i64;
        self.target = self.position + run_out * self.heading();
    }

    fn heading(&self) -> i64 {
        if self.velocity > 0.0 {
            1
        } else if self.velocity < 0.0 {
            -1
        } else {
            0
        }
    }

    /// Cruise speed that still allows stopping within `remaining` steps when
    /// decelerating in increments of `dv` per tick
    fn approach_speed(&self, remaining: f64, dv: f64) -> f64 {
        let braking = (dv * dv / 4.0 + 2.0 * self.limits.accel * remaining).sqrt() - dv / 2.0;
        self.limits.max_speed.min(braking.max(0.0))
    }

    /// Advance one tick of `dt` seconds. Returns the signed number of steps
    /// taken (usually -1, 0 or 1; more when speed * dt exceeds one step).
    pub fn tick(&mut self, dt: f64) -> i64 {
        let previous = self.speed();
        let dv = self.limits.accel * dt;
        let remaining = self.target - self.position;
        let heading = self.heading();
        let mut taken = 0;

        if remaining == 0 && previous <= 2.0 * dv {
            // Arrived: bleed off the last fraction of a step's worth of speed
            self.fraction = 0.0;
            let speed = (previous - dv).max(0.0);
            self.velocity = heading as f64 * speed;
        } else if heading != 0 && heading != remaining.signum() {
            // Travelling away from the target: brake first, reverse after
            let speed = (previous - dv).max(0.0);
            self.fraction += speed * dt;
            while self.fraction >= 1.0 {
                self.position += heading;
                self.fraction -= 1.0;
                taken += heading;
            }
            if speed == 0.0 {
                self.velocity = 0.0;
                self.fraction = 0.0;
            } else {
                self.velocity = heading as f64 * speed;
            }
        } else {
            let direction = remaining.signum();
            let left = (remaining.abs() as f64 - self.fraction).max(0.0);
            let cap = self.approach_speed(left, dv);
            let speed = if previous < cap {
                (previous + dv).min(cap)
            } else {
                (previous - dv).max(cap)
            };
            self.velocity = direction as f64 * speed;
            self.fraction += speed * dt;
            while self.fraction >= 1.0 && self.position != self.target {
                self.position += direction;
                self.fraction -= 1.0;
                taken += direction;
            }
            if self.position == self.target {
                self.fraction = 0.0;
            }
        }

        let speed = self.speed();
        self.phase = if self.is_at_rest() {
            Phase::Idle
        } else if speed > previous {
            Phase::Accelerating
        } else if speed < previous {
            Phase::Decelerating
        } else {
            Phase::Cruising
        };

        taken
    }
}
