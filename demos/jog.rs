// Keyboard jog pendant: arrows/WASD move, SPACE pen, R/F step size, O set origin,
// X abort, Q quit. Optional arg: machine config JSON (canvas and origin).
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::Duration;
use tracing::{info, warn};

use plotter_zenoh_runtime::config::{Axis, MachineConfig, TOPIC_CMD_MOTION};
use plotter_zenoh_runtime::messages::{MovePoint, PlotterCommand};
use plotter_zenoh_runtime::motor::{LogicalPosition, UnitConverter};

const JOG_STEPS_MM: [f64; 3] = [0.1, 1.0, 10.0];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = match std::env::args().nth(1) {
        Some(path) => MachineConfig::load(path)?,
        None => MachineConfig::default(),
    };

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_MOTION).await?;

    info!("Controls: arrows/WASD=jog, SPACE=pen, R/F=step size, O=origin here, X=abort, Q=quit");
    info!("Step: {} mm", JOG_STEPS_MM[0]);

    enable_raw_mode()?;
    let result = run_jog(&publisher, &config).await;
    disable_raw_mode()?;

    result
}

async fn run_jog(
    publisher: &zenoh::pubsub::Publisher<'_>,
    config: &MachineConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let converter = UnitConverter::new(config);

    // Jogging happens in machine mm (0 = homed corner, +y away from it) so
    // the arrow keys keep their meaning under every origin setting.
    // The pendant assumes the carriage starts at the homed corner.
    let mut machine = [0.0f64; 2];
    let mut pen_down = false;
    let mut step_idx: usize = 0;

    loop {
        if !event::poll(Duration::from_millis(20))? {
            continue;
        }
        let Event::Key(KeyEvent { code, kind, .. }) = event::read()? else {
            continue;
        };
        if kind != KeyEventKind::Press && kind != KeyEventKind::Repeat {
            continue;
        }

        let step = JOG_STEPS_MM[step_idx];
        let (dx, dy) = match code {
            KeyCode::Right | KeyCode::Char('d') => (step, 0.0),
            KeyCode::Left | KeyCode::Char('a') => (-step, 0.0),
            KeyCode::Down | KeyCode::Char('s') => (0.0, step),
            KeyCode::Up | KeyCode::Char('w') => (0.0, -step),

            KeyCode::Char(' ') => {
                pen_down = !pen_down;
                publish(publisher, &PlotterCommand::Pen { down: pen_down }).await?;
                info!("Pen: {}", if pen_down { "down" } else { "up" });
                continue;
            }
            KeyCode::Char('r') => {
                step_idx = (step_idx + 1).min(JOG_STEPS_MM.len() - 1);
                info!("Step: {} mm", JOG_STEPS_MM[step_idx]);
                continue;
            }
            KeyCode::Char('f') => {
                step_idx = step_idx.saturating_sub(1);
                info!("Step: {} mm", JOG_STEPS_MM[step_idx]);
                continue;
            }
            KeyCode::Char('o') => {
                publish(publisher, &PlotterCommand::Home { axis: None }).await?;
                machine = [0.0, 0.0];
                info!("Origin set at current location");
                continue;
            }
            KeyCode::Char('x') => {
                publish(publisher, &PlotterCommand::Abort).await?;
                warn!("Abort sent; position estimate may be off until origin is reset");
                continue;
            }
            KeyCode::Char('q') | KeyCode::Esc => break,
            _ => continue,
        };

        let next = [
            (machine[0] + dx).clamp(0.0, config.canvas_extent_mm(Axis::X)),
            (machine[1] + dy).clamp(0.0, config.canvas_extent_mm(Axis::Y)),
        ];
        if next == machine {
            continue;
        }
        machine = next;
        let position = LogicalPosition::new(
            converter.from_machine_mm(Axis::X, machine[0]),
            converter.from_machine_mm(Axis::Y, machine[1]),
        );
        let cmd = PlotterCommand::Move(MovePoint {
            x: position.x_mm,
            y: position.y_mm,
            pen_down,
            feed: None,
        });
        publish(publisher, &cmd).await?;
        info!("Target: ({:.1}, {:.1})", position.x_mm, position.y_mm);
    }

    Ok(())
}

async fn publish(
    publisher: &zenoh::pubsub::Publisher<'_>,
    cmd: &PlotterCommand,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    publisher.put(serde_json::to_string(cmd)?).await?;
    Ok(())
}
