//! Onboard control stack for an autonomous mowing robot: sensor-fusion
//! localization, coverage and point-to-point planning, dynamic-window local
//! control, fiducial-guided docking, and a hard-real-time safety supervisor,
//! bound together by a channel-and-snapshot task fabric.

pub mod boundary;
pub mod config;
pub mod docking;
pub mod dwa;
pub mod errors;
pub mod filters;
pub mod geodesy;
pub mod grid;
pub mod localizer;
pub mod mission;
pub mod persist;
pub mod planner;
pub mod ports;
pub mod power;
pub mod runtime;
pub mod safety;
pub mod sim;
pub mod status;
pub mod types;
pub mod vision;

pub use config::Config;
pub use runtime::{Runtime, RuntimeHandle, RuntimeOptions};
