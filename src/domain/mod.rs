//! Domain layer: models, ports, and errors shared by all subsystems.

pub mod errors;
pub mod models;
pub mod ports;
