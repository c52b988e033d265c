//! Rover companion library: the pieces of the host-side binary that are
//! worth testing in isolation - configuration, the sensor link, the dump
//! files and the error taxonomy.

pub mod config;
pub mod dump;
pub mod error;
pub mod link;
