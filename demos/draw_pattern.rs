// Calibration pattern sender: a 50 mm square and a 30 mm radius circle around
// the canvas center. Keeps at most queue_capacity moves in flight by watching
// completed_moves on the status topic.
// Optional arg: machine config JSON (origin, canvas, circle_segments).
use std::f64::consts::TAU;
use std::time::Duration;

use tracing::{info, warn};
use zenoh::handlers::FifoChannelHandler;
use zenoh::pubsub::Subscriber;
use zenoh::sample::Sample;

use plotter_zenoh_runtime::config::{Axis, MachineConfig, TOPIC_CMD_MOTION, TOPIC_STATUS};
use plotter_zenoh_runtime::messages::{MovePoint, PlotterCommand};
use plotter_zenoh_runtime::motor::UnitConverter;

const SQUARE_SIDE_MM: f64 = 50.0;
const CIRCLE_RADIUS_MM: f64 = 30.0;
const STATUS_WAIT: Duration = Duration::from_secs(5);
/// Idle status samples with moves outstanding before those moves count as dropped
const IDLE_SAMPLES: u32 = 3;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = match std::env::args().nth(1) {
        Some(path) => MachineConfig::load(path)?,
        None => MachineConfig::default(),
    };

    let points = pattern(&config);
    info!("Pattern: {} points", points.len());

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_MOTION).await?;
    let status = session.declare_subscriber(TOPIC_STATUS).await?;

    let baseline = wait_progress(&status).await?.completed;
    let mut window = Window::new(config.queue_capacity as u64, baseline);

    for point in &points {
        // Sliding window: never more than queue_capacity moves outstanding
        while window.is_full() {
            window.update(wait_progress(&status).await?);
        }
        let cmd = PlotterCommand::Move(*point);
        publisher.put(serde_json::to_string(&cmd)?).await?;
        window.sent += 1;
    }

    // Drain, then lift the pen and let the machine idle
    while window.outstanding() > 0 {
        window.update(wait_progress(&status).await?);
    }
    publisher
        .put(serde_json::to_string(&PlotterCommand::Pen { down: false })?)
        .await?;
    publisher
        .put(serde_json::to_string(&PlotterCommand::Idle)?)
        .await?;
    info!(
        "Pattern done: {} moves sent, {} dropped by the runtime",
        window.sent, window.dropped
    );
    Ok(())
}

/// What one status sample says about the runtime's progress
#[derive(Debug, Clone, Copy, PartialEq)]
struct Progress {
    completed: u64,
    /// Nothing queued or running
    idle: bool,
}

/// Flow control over completed_moves. Moves the runtime rejected never
/// complete, so a runtime that sits idle with moves outstanding has dropped them.
#[derive(Debug)]
struct Window {
    capacity: u64,
    baseline: u64,
    sent: u64,
    done: u64,
    dropped: u64,
    idle_samples: u32,
}

impl Window {
    fn new(capacity: u64, baseline: u64) -> Self {
        Self {
            capacity,
            baseline,
            sent: 0,
            done: 0,
            dropped: 0,
            idle_samples: 0,
        }
    }

    fn outstanding(&self) -> u64 {
        self.sent.saturating_sub(self.done + self.dropped)
    }

    fn is_full(&self) -> bool {
        self.outstanding() >= self.capacity
    }

    fn update(&mut self, progress: Progress) {
        self.done = progress.completed.saturating_sub(self.baseline);
        if !progress.idle || self.outstanding() == 0 {
            self.idle_samples = 0;
            return;
        }
        self.idle_samples += 1;
        if self.idle_samples >= IDLE_SAMPLES {
            let lost = self.outstanding();
            warn!("Runtime idle with {} moves outstanding, counting them as dropped", lost);
            self.dropped += lost;
            self.idle_samples = 0;
        }
    }
}

/// Next status update's completed_moves counter and idle state
async fn wait_progress(
    status: &Subscriber<FifoChannelHandler<Sample>>,
) -> Result<Progress, Box<dyn std::error::Error + Send + Sync>> {
    loop {
        let sample = match tokio::time::timeout(STATUS_WAIT, status.recv_async()).await {
            Ok(sample) => sample?,
            Err(_) => return Err("no status from runtime".into()),
        };
        let payload = sample.payload().to_bytes();
        match serde_json::from_slice::<serde_json::Value>(&payload) {
            Ok(value) => match parse_progress(&value) {
                Some(progress) => return Ok(progress),
                None => warn!("Status without completed_moves"),
            },
            Err(e) => warn!("Failed to parse status: {}", e),
        }
    }
}

fn parse_progress(value: &serde_json::Value) -> Option<Progress> {
    let completed = value["completed_moves"].as_u64()?;
    let at_rest = matches!(value["state"].as_str(), Some("ready") | Some("disabled"));
    let empty = value["queue_depth"].as_u64() == Some(0);
    Some(Progress {
        completed,
        idle: at_rest && empty,
    })
}

/// Square then circle, both centered on the canvas, in the configured origin frame
fn pattern(config: &MachineConfig) -> Vec<MovePoint> {
    let converter = UnitConverter::new(config);
    let (min_x, max_x) = converter.bounds_mm(Axis::X);
    let (min_y, max_y) = converter.bounds_mm(Axis::Y);
    let cx = (min_x + max_x) / 2.0;
    let cy = (min_y + max_y) / 2.0;
    let half = SQUARE_SIDE_MM / 2.0;

    // Feeds come from the runtime's draw/travel config
    let point = |x: f64, y: f64, pen_down: bool| MovePoint {
        x: x.clamp(min_x, max_x),
        y: y.clamp(min_y, max_y),
        pen_down,
        feed: None,
    };

    let mut points = vec![point(cx - half, cy - half, false)];
    for (x, y) in [
        (cx + half, cy - half),
        (cx + half, cy + half),
        (cx - half, cy + half),
        (cx - half, cy - half),
    ] {
        points.push(point(x, y, true));
    }

    let segments = config.circle_segments.max(3);
    points.push(point(cx + CIRCLE_RADIUS_MM, cy, false));
    for i in 1..=segments {
        let angle = TAU * i as f64 / segments as f64;
        points.push(point(
            cx + CIRCLE_RADIUS_MM * angle.cos(),
            cy + CIRCLE_RADIUS_MM * angle.sin(),
            true,
        ));
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy(completed: u64) -> Progress {
        Progress {
            completed,
            idle: false,
        }
    }

    fn idle(completed: u64) -> Progress {
        Progress {
            completed,
            idle: true,
        }
    }

    #[test]
    fn test_window_tracks_completions() {
        let mut window = Window::new(2, 7);
        window.sent = 2;
        assert!(window.is_full());
        window.update(busy(8));
        assert_eq!(window.outstanding(), 1);
        assert!(!window.is_full());
    }

    #[test]
    fn test_stale_counter_does_not_underflow() {
        // Counter jumped past what this sender accounts for
        let mut window = Window::new(4, 0);
        window.sent = 1;
        window.update(busy(3));
        assert_eq!(window.outstanding(), 0);
    }

    #[test]
    fn test_rejected_moves_release_the_window() {
        let mut window = Window::new(2, 0);
        window.sent = 2;
        window.update(idle(1));
        window.update(idle(1));
        assert!(!window.is_full());
        assert_eq!(window.outstanding(), 1);
        // A busy sample resets the count
        window.update(busy(1));
        window.update(idle(1));
        assert_eq!(window.outstanding(), 1);
        window.update(idle(1));
        window.update(idle(1));
        assert_eq!(window.outstanding(), 0);
        assert_eq!(window.dropped, 1);
    }

    #[test]
    fn test_parse_progress_from_status() {
        let status = serde_json::json!({
            "completed_moves": 4,
            "state": "ready",
            "queue_depth": 0,
        });
        assert_eq!(parse_progress(&status), Some(idle(4)));
        let status = serde_json::json!({
            "completed_moves": 4,
            "state": "moving",
            "queue_depth": 0,
        });
        assert_eq!(parse_progress(&status), Some(busy(4)));
        assert_eq!(parse_progress(&serde_json::json!({})), None);
    }
}
