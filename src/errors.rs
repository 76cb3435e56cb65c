// src/errors.rs

//! Typed error kinds for task loading and task execution.
//!
//! Load errors are fatal and returned by the loader; runtime errors from a
//! step are wrapped with the step ID before they reach the error channel.

use std::io;

use thiserror::Error;

/// Errors surfaced while loading and validating a task document.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("alias directive {0:?} must be exactly one character")]
    InvalidAliasDirective(String),

    #[error("unable to read alias source '{path}'")]
    AliasSourceUnreadable {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("unable to read task file '{path}'")]
    TaskFileUnreadable {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse task document")]
    Parse(#[from] serde_yaml::Error),

    #[error("step '{step}' references unknown dependency '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    #[error("cyclic dependency: {path}")]
    CyclicDependency { path: String },

    #[error("step '{0}' declares more than one of build, push, and cmd")]
    AmbiguousStepKind(String),

    #[error("step '{0}' declares none of build, push, or cmd")]
    EmptyStepKind(String),
}

/// Errors surfaced while executing a task.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("'{argv0}' exited with code {code}")]
    Subprocess {
        argv0: String,
        code: i32,
        tail: String,
    },

    #[error("unable to spawn '{argv0}'")]
    Spawn {
        argv0: String,
        #[source]
        source: io::Error,
    },

    #[error("waiting on '{argv0}' failed")]
    Wait {
        argv0: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("dependency scan failed: {0}")]
    ScrapeFailed(String),

    #[error("digest lookup failed for '{image}': {detail}")]
    DigestFailed { image: String, detail: String },

    #[error("failed to create network '{name}': {detail}")]
    NetworkCreate { name: String, detail: String },

    #[error("login to registry '{registry}' failed")]
    LoginFailed {
        registry: String,
        #[source]
        source: Box<RuntimeError>,
    },

    #[error("failed to set up volume '{name}': {detail}")]
    VolumeSetup { name: String, detail: String },

    #[error(transparent)]
    Dag(#[from] crate::dag::DagError),

    #[error("step '{id}' failed")]
    Step {
        id: String,
        #[source]
        source: Box<RuntimeError>,
    },
}

impl RuntimeError {
    /// Wrap an error with the ID of the step it belongs to.
    pub fn for_step(id: impl Into<String>, source: RuntimeError) -> Self {
        RuntimeError::Step {
            id: id.into(),
            source: Box::new(source),
        }
    }

    /// True when this error (possibly wrapped) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            RuntimeError::Cancelled => true,
            RuntimeError::Step { source, .. } | RuntimeError::LoginFailed { source, .. } => {
                source.is_cancelled()
            }
            _ => false,
        }
    }

    /// The captured subprocess output, when this error carries one.
    ///
    /// Retry predicates match their patterns against this tail.
    pub fn output_tail(&self) -> Option<&str> {
        match self {
            RuntimeError::Subprocess { tail, .. } => Some(tail),
            _ => None,
        }
    }
}
