// Define message types for the runtime

use serde::{Deserialize, Serialize};

use crate::config::Axis;
use crate::motor::Move;

/// A drawing point as streamed by the path sender: {"x", "y", "penDown"},
/// optionally with a path feed in mm/min
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MovePoint {
    pub x: f64,
    pub y: f64,
    #[serde(rename = "penDown", alias = "pen_down", default)]
    pub pen_down: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed: Option<f64>,
}

// A point becomes a Move in the configured origin frame
impl From<&MovePoint> for Move {
    fn from(point: &MovePoint) -> Self {
        let mv = Move::new(point.x, point.y, point.pen_down);
        match point.feed {
            Some(feed) => mv.with_feed(feed),
            None => mv,
        }
    }
}

/// Command from path planners / pendants -> runtime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlotterCommand {
    Move(MovePoint),
    Pen {
        down: bool,
    },
    /// Declare the current location as origin (all axes if none given)
    Home {
        #[serde(default)]
        axis: Option<Axis>,
    },
    /// Decelerate to a stop and drop pending moves
    Abort,
    /// Allow the motors to be released once at rest
    Idle,
}

impl PlotterCommand {
    /// Parse a payload. Untagged point objects are accepted as moves.
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        match serde_json::from_slice::<PlotterCommand>(payload) {
            Ok(cmd) => Ok(cmd),
            Err(tagged_err) => match serde_json::from_slice::<MovePoint>(payload) {
                Ok(point) => Ok(PlotterCommand::Move(point)),
                Err(_) => Err(tagged_err),
            },
        }
    }
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
    /// Step output failed; latched until every axis is homed
    Fault,
}
