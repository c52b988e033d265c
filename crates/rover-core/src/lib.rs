//! Rover core - perception and world modelling for a differential-drive
//! robot with a rotating ultrasonic head, bumpers, odometer and marker
//! camera.
//!
//! The crate is pure: no I/O, no async, no clocks of its own. It fuses
//! timestamped sensor messages into three data products:
//!
//! - a radar map (Cartesian occupancy grid with decaying evidence),
//! - a polar map (egocentric sector view for obstacle avoidance),
//! - a labelled-marker map (recognised visual markers in world frame).
//!
//! The host companion feeds decoded messages in and drives [`world::WorldModeller::tick`].

pub mod clock;
pub mod geometry;
pub mod grid;
pub mod marker;
pub mod msg;
pub mod polar;
pub mod radar;
pub mod status;
pub mod world;

pub use clock::ClockSync;
pub use geometry::{Angle, Point, QPoly, Region, Vector};
pub use grid::GridTopology;
pub use marker::{CorrelatedCameraEvent, LabelMarker, MarkerLocator, MarkerMap, MarkerParams};
pub use msg::{MalformedMessage, RobotCommands, SensorMessage};
pub use polar::{CircularSector, PolarMap, PolarModeller};
pub use radar::{BeamModel, MapCell, RadarMap, RadarModeller, RadarParams, SensorSignal};
pub use status::{RobotSpec, RobotStatus};
pub use world::{CellState, InferenceGate, InferenceState, WorldModel, WorldModeller, WorldParams};
