//! store-daemon: Library exports for the daemon binary.

pub mod config;
pub mod persistence;
pub mod remote;
