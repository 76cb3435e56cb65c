// src/task/mod.rs

//! Materialized runtime model of a task.
//!
//! - [`task`] holds the immutable [`Task`] produced by the loader.
//! - [`step`] holds [`Step`] with its policy fields and mutable run state.
//! - [`network`] and [`volume`] cover the resources created before steps run.
//! - [`image`] holds image references, dependency records, and registry
//!   tag prefixing.

pub mod image;
pub mod network;
pub mod step;
pub mod task;
pub mod volume;

pub use image::{prefix_registry_to_image_name, prefix_tags, ImageDependencies, ImageReference};
pub use network::Network;
pub use step::{Step, StepKind, StepStatus, VolumeMount, IMMEDIATE_EXECUTION_TOKEN};
pub use task::{RegistryCredential, Secret, Task};
pub use volume::{Volume, VolumeSource};
