//! Core library for the waveplate_sweep application.
//!
//! This library contains the configuration loader, the device capability traits and
//! their serial drivers, the output writer, and the measurement loop that ties them
//! together. The `waveplate_sweep` binary is a thin wrapper around
//! [`experiment::run_experiment`].

pub mod config;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod experiment;
pub mod hardware;
