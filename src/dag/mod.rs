// src/dag/mod.rs

//! DAG representation for step dependencies.
//!
//! [`graph`] holds the name-keyed node map with forward and reverse
//! adjacency. Removing a reverse edge is how the executor marks a
//! dependency as satisfied.

pub mod graph;

pub use graph::{Dag, DagError, ROOT_NODE_NAME};
