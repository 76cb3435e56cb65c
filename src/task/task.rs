// src/task/task.rs

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::dag::Dag;
use crate::task::network::Network;
use crate::task::step::Step;
use crate::task::volume::Volume;

/// Login credentials for one registry, already resolved to plaintext.
///
/// Resolution from vault references happens upstream; the task only ever
/// sees resolved values.
#[derive(Debug, Clone)]
pub struct RegistryCredential {
    pub registry: String,
    pub username: String,
    pub password: String,
}

/// A resolved secret injected into steps through `secretEnvs`.
#[derive(Debug, Clone)]
pub struct Secret {
    pub id: String,
    pub value: String,
}

/// A validated, immutable task: steps, resources, credentials, and the
/// dependency DAG over the steps. Only per-step run state mutates after
/// loading.
#[derive(Debug)]
pub struct Task {
    pub steps: Vec<Arc<Step>>,
    pub networks: Vec<Network>,
    pub volumes: Vec<Volume>,
    pub secrets: Vec<Secret>,

    /// Registry hostname to resolved login credentials.
    pub registry_credentials: BTreeMap<String, RegistryCredential>,

    pub step_timeout: u64,
    pub working_directory: String,
    pub envs: Vec<String>,

    /// True when any build step wants the build cache; the builder daemon
    /// container is initialized once before scheduling.
    pub init_buildkit_container: bool,

    pub dag: Dag,
}

impl Task {
    pub fn step(&self, id: &str) -> Option<&Arc<Step>> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn using_registry_creds(&self) -> bool {
        !self.registry_credentials.is_empty()
    }
}
