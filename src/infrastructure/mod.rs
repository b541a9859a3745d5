//! Process-level infrastructure: configuration, logging, filesystem
//! layout.

pub mod config;
pub mod logging;
pub mod paths;
