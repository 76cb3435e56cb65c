// src/exec/mod.rs

//! Subprocess execution layer.
//!
//! - [`procman`] owns the process table, cancellation, and the uniform
//!   retry/repeat loops every engine invocation goes through.
//! - [`args`] constructs the container-engine argv for steps, networks,
//!   volumes, logins, pulls, pushes, and digest lookups.

pub mod args;
pub mod procman;

pub use args::EngineArgsBuilder;
pub use procman::ProcManager;
