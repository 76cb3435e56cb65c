// src/engine/mod.rs

//! Task execution engine.
//!
//! - [`builder`] drives the DAG: pre-run setup, fork-per-ready-node
//!   traversal, the completion barrier, the digest pass, and cleanup.
//! - [`scrape`] discovers the image dependencies of build steps.
//! - [`digest`] attaches content digests to discovered dependencies.

pub mod builder;
pub mod digest;
pub mod scrape;

pub use builder::Builder;
pub use digest::{DigestHelper, EngineStoreDigest, RemoteDigest};
pub use scrape::{parse_build_args, parse_docker_build_cmd, DependencyScraper, DockerfileScraper, ScrapeRequest};
