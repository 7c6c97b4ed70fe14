//! # Vehicle subsystems
//!
//! The MAVLink services offered by an autopilot are organized in logical subsystems. Subsystems are greatly
//! independent and each have one logical role: lifecycle commands, offboard setpoints and telemetry.
//!
//! Modules here implement Rust API for the different subsystems, they are the main way to communicate and
//! interact with the vehicle.

pub mod action;
pub mod offboard;
pub mod telemetry;
