// Motion core for the gantry pen plotter
//
// Provides:
// - mm <-> step conversion with origin remapping
// - Trapezoidal per-axis motion generation
// - Gantry (X1 + X2) lockstep drive with backlash compensation
// - Coordinated straight-line moves and the position/state tracker
// - Step outputs: simulated and serial step bridge

pub mod axis;
pub mod controller;
pub mod driver;
mod error;
pub mod planner;
pub mod profile;
pub mod stepbus;
pub mod units;

pub use axis::{Direction, GantryAxis, MotorId, MotorState, SingleAxis};
pub use controller::{MachineState, MotionController, Move, StatusSnapshot};
pub use driver::{SimulatedSink, StepSink};
pub use error::MotionError;
pub use profile::{Limits, Phase, TrapezoidProfile};
pub use stepbus::{StepBus, StepBusError};
pub use units::{LogicalPosition, UnitConverter};
