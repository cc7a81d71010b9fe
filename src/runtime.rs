// Fixed-rate tick loop with command watchdog
// Commands are drained at tick boundaries; motor state is only touched by the tick.
// If the path sender goes quiet for IDLE_TIMEOUT the machine is asked to idle,
// which releases the motors once everything is at rest (disable_when_idle).
// A failed step output aborts motion and latches a fault: the tracked position
// no longer matches the hardware, so new work is refused until a home.

use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::{
    Axis, IDLE_TIMEOUT, MachineConfig, STATUS_HZ, TOPIC_CMD_MOTION, TOPIC_HEALTH, TOPIC_STATUS,
};
use crate::messages::{PlotterCommand, RuntimeHealth};
use crate::motor::{MotionController, Move, StatusSnapshot, StepSink};

pub struct Runtime {
    controller: MotionController,
    cmd_received_at: Option<Instant>,
    idle_requested: bool,
    output_fault: bool,
    health: RuntimeHealth,
}

impl Runtime {
    pub fn new(config: MachineConfig) -> Self {
        Self {
            controller: MotionController::new(config),
            cmd_received_at: None,
            idle_requested: false,
            output_fault: false,
            health: RuntimeHealth::CmdStale, // Start stale until first cmd
        }
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    pub fn status(&self) -> StatusSnapshot {
        self.controller.status()
    }

    /// Process incoming command
    pub fn on_command(&mut self, cmd: PlotterCommand, now: Instant) {
        debug!("Received command: {:?}", &cmd);
        self.cmd_received_at = Some(now);
        self.idle_requested = false;

        match cmd {
            PlotterCommand::Move(_) | PlotterCommand::Pen { .. } if self.output_fault => {
                warn!("Output fault latched, home before sending new work");
            }
            PlotterCommand::Move(point) => {
                if let Err(e) = self.controller.apply_move(Move::from(&point)) {
                    warn!("Move rejected: {}", e);
                }
            }
            PlotterCommand::Pen { down } => {
                if let Err(e) = self.controller.set_pen_state(down) {
                    warn!("Pen change rejected: {}", e);
                }
            }
            PlotterCommand::Home { axis } => {
                let axes = match axis {
                    Some(axis) => vec![axis],
                    None => Axis::ALL.to_vec(),
                };
                let mut homed = 0;
                for &axis in &axes {
                    match self.controller.reset_origin(axis) {
                        Ok(()) => homed += 1,
                        Err(e) => warn!("Home rejected: {}", e),
                    }
                }
                // Only a full home re-establishes position after a fault
                if self.output_fault && homed == Axis::ALL.len() {
                    info!("All axes homed, clearing output fault");
                    self.output_fault = false;
                }
            }
            PlotterCommand::Abort => self.controller.abort(),
            PlotterCommand::Idle => {
                self.controller.set_idle(true);
                self.idle_requested = true;
            }
        }
    }

    /// Request idle once the command stream has gone quiet
    fn check_watchdog(&mut self, now: Instant) -> bool {
        // Stale until the first command arrives
        let cmd_age = self
            .cmd_received_at
            .map(|at| now.saturating_duration_since(at));
        let stale = cmd_age.is_none_or(|age| age > IDLE_TIMEOUT);
        if stale && !self.idle_requested {
            if let Some(age) = cmd_age {
                info!("No command for {:?}, requesting idle", age);
            }
            self.controller.set_idle(true);
            self.idle_requested = true;
        }
        stale
    }

    /// One loop iteration after commands were drained
    pub fn tick<S: StepSink>(&mut self, sink: &mut S, now: Instant) {
        let stale = self.check_watchdog(now);

        self.controller.tick(sink);
        if let Err(e) = sink.end_tick() {
            if !self.output_fault {
                warn!("Step output failed, aborting: {}", e);
                self.controller.abort();
            }
            self.output_fault = true;
        }

        self.health = if self.output_fault {
            RuntimeHealth::Fault
        } else if stale {
            RuntimeHealth::CmdStale
        } else {
            RuntimeHealth::Ok
        };
    }
}

pub async fn run<S: StepSink>(
    config: MachineConfig,
    mut sink: S,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD_MOTION).await?;
    let pub_status = session.declare_publisher(TOPIC_STATUS).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let tick_hz = config.tick_hz;
    let status_every = (tick_hz / STATUS_HZ).max(1) as u64;
    let mut tick = interval(Duration::from_secs_f64(config.tick_dt()));
    let mut runtime = Runtime::new(config);
    let mut ticks: u64 = 0;

    info!(
        "Runtime started: {}Hz loop, {}ms idle timeout",
        tick_hz,
        IDLE_TIMEOUT.as_millis()
    );
    info!("Subscribed to: {}", TOPIC_CMD_MOTION);
    info!("Publishing to: {}, {}", TOPIC_STATUS, TOPIC_HEALTH);

    loop {
        tick.tick().await;
        let now = Instant::now();

        // 1. Drain all pending commands (non-blocking), in arrival order
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            match PlotterCommand::parse(&payload) {
                Ok(cmd) => runtime.on_command(cmd, now),
                Err(e) => warn!("Failed to parse command: {}", e),
            }
        }

        // 2. Advance motion and flush the step output
        runtime.tick(&mut sink, now);
        ticks += 1;

        // 3. Publish status and health at STATUS_HZ
        if ticks % status_every == 0 {
            let status_json = serde_json::to_string(&runtime.status())?;
            pub_status.put(status_json).await?;

            let health_json = serde_json::to_string(&runtime.health())?;
            pub_health.put(health_json).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MovePoint;
    use crate::motor::{Direction, MachineState, MotorId, SimulatedSink};

    fn move_cmd(x: f64, y: f64, pen_down: bool) -> PlotterCommand {
        PlotterCommand::Move(MovePoint {
            x,
            y,
            pen_down,
            feed: None,
        })
    }

    /// Sink whose output fails on demand
    struct FlakySink {
        inner: SimulatedSink,
        fail: bool,
    }

    impl StepSink for FlakySink {
        type Error = std::io::Error;

        fn emit_step(&mut self, motor: MotorId, direction: Direction) {
            self.inner.emit_step(motor, direction);
        }

        fn set_enabled(&mut self, enabled: bool) {
            self.inner.set_enabled(enabled);
        }

        fn set_pen(&mut self, down: bool) {
            self.inner.set_pen(down);
        }

        fn end_tick(&mut self) -> Result<(), Self::Error> {
            if self.fail {
                Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_health_starts_stale_then_ok() {
        let start = Instant::now();
        let mut runtime = Runtime::new(MachineConfig::default());
        let mut sink = SimulatedSink::new();
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);
        runtime.tick(&mut sink, start);
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);

        runtime.on_command(move_cmd(1.0, 1.0, false), start);
        runtime.tick(&mut sink, start + Duration::from_millis(1));
        assert_eq!(runtime.health(), RuntimeHealth::Ok);
    }

    #[test]
    fn test_moves_run_through_the_controller() {
        let start = Instant::now();
        let mut runtime = Runtime::new(MachineConfig::default());
        let mut sink = SimulatedSink::new();
        runtime.on_command(move_cmd(5.0, 2.0, true), start);
        for i in 0..5000 {
            runtime.tick(&mut sink, start + Duration::from_micros(i));
        }
        let status = runtime.status();
        assert_eq!(status.state, MachineState::Ready);
        assert_eq!(status.completed_moves, 1);
        assert!(status.pen_down);
        assert_eq!(sink.net_pulses(MotorId::X1), 50);
        assert_eq!(sink.net_pulses(MotorId::Y), 20);
    }

    #[test]
    fn test_out_of_bounds_move_is_dropped() {
        let start = Instant::now();
        let mut runtime = Runtime::new(MachineConfig::default());
        let mut sink = SimulatedSink::new();
        runtime.on_command(move_cmd(10_000.0, 0.0, true), start);
        runtime.tick(&mut sink, start);
        assert_eq!(runtime.status().queue_depth, 0);
        assert_eq!(runtime.status().state, MachineState::Ready);
        assert_eq!(runtime.health(), RuntimeHealth::Ok);
    }

    #[test]
    fn test_watchdog_requests_idle() {
        let config = MachineConfig {
            disable_when_idle: true,
            ..MachineConfig::default()
        };
        let start = Instant::now();
        let mut runtime = Runtime::new(config);
        let mut sink = SimulatedSink::new();
        runtime.on_command(PlotterCommand::Pen { down: false }, start);
        runtime.tick(&mut sink, start);
        assert!(sink.is_enabled());

        let late = start + IDLE_TIMEOUT + Duration::from_millis(1);
        runtime.tick(&mut sink, late);
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);
        assert!(!sink.is_enabled());
        assert_eq!(runtime.status().state, MachineState::Disabled);

        // Fresh command clears the stale state
        runtime.on_command(move_cmd(1.0, 0.0, false), late);
        runtime.tick(&mut sink, late);
        assert_eq!(runtime.health(), RuntimeHealth::Ok);
        assert!(sink.is_enabled());
    }

    #[test]
    fn test_home_resets_every_axis() {
        let start = Instant::now();
        let mut runtime = Runtime::new(MachineConfig::default());
        let mut sink = SimulatedSink::new();
        runtime.on_command(move_cmd(3.0, 4.0, false), start);
        for _ in 0..5000 {
            runtime.tick(&mut sink, start);
        }
        runtime.on_command(PlotterCommand::Home { axis: None }, start);
        let position = runtime.status().position;
        assert_eq!(position.x_mm, 0.0);
        assert_eq!(position.y_mm, 0.0);
    }

    #[test]
    fn test_abort_stops_pending_work() {
        let start = Instant::now();
        let mut runtime = Runtime::new(MachineConfig::default());
        let mut sink = SimulatedSink::new();
        runtime.on_command(move_cmd(500.0, 300.0, true), start);
        runtime.on_command(move_cmd(0.0, 0.0, true), start);
        for _ in 0..500 {
            runtime.tick(&mut sink, start);
        }
        runtime.on_command(PlotterCommand::Abort, start);
        assert_eq!(runtime.status().state, MachineState::Stopping);
        assert_eq!(runtime.status().queue_depth, 0);
    }

    #[test]
    fn test_output_failure_latches_fault_until_home() {
        let start = Instant::now();
        let mut runtime = Runtime::new(MachineConfig::default());
        let mut sink = FlakySink {
            inner: SimulatedSink::new(),
            fail: false,
        };
        runtime.on_command(move_cmd(100.0, 50.0, false), start);
        for _ in 0..500 {
            runtime.tick(&mut sink, start);
        }
        assert_eq!(runtime.health(), RuntimeHealth::Ok);

        sink.fail = true;
        runtime.tick(&mut sink, start);
        assert_eq!(runtime.health(), RuntimeHealth::Fault);
        assert_eq!(runtime.status().state, MachineState::Stopping);

        // Output works again but the fault stays latched
        sink.fail = false;
        for _ in 0..5000 {
            runtime.tick(&mut sink, start);
        }
        assert_eq!(runtime.health(), RuntimeHealth::Fault);
        assert_eq!(runtime.status().state, MachineState::Ready);
        runtime.on_command(move_cmd(1.0, 1.0, false), start);
        runtime.on_command(PlotterCommand::Pen { down: true }, start);
        assert_eq!(runtime.status().queue_depth, 0);
        assert!(!runtime.status().pen_down);

        // A single-axis home is not enough
        runtime.on_command(PlotterCommand::Home { axis: Some(Axis::X) }, start);
        runtime.tick(&mut sink, start);
        assert_eq!(runtime.health(), RuntimeHealth::Fault);

        runtime.on_command(PlotterCommand::Home { axis: None }, start);
        runtime.tick(&mut sink, start);
        assert_eq!(runtime.health(), RuntimeHealth::Ok);
        runtime.on_command(move_cmd(1.0, 1.0, false), start);
        assert_eq!(runtime.status().queue_depth, 1);
    }
}
