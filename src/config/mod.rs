// src/config/mod.rs

//! Task document loading.
//!
//! Responsibilities:
//! - Define the YAML-backed document model (`model.rs`).
//! - Run the alias preprocessor over the raw text (`alias.rs`).
//! - Load and materialize a document into a [`crate::task::Task`]
//!   (`loader.rs`).
//! - Validate step identity, kinds, and DAG correctness (`validate.rs`).

pub mod alias;
pub mod loader;
pub mod model;
pub mod validate;

pub use alias::preprocess;
pub use loader::{load_from_path, load_from_str, LoadOptions, DEFAULT_STEP_TIMEOUT_IN_SECONDS};
pub use model::{
    AliasConfig, NetworkConfig, SecretConfig, StepConfig, TaskDocument, VolumeConfig,
};
