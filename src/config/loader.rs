// src/config/loader.rs

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::config::alias;
use crate::config::model::{StepConfig, TaskDocument};
use crate::config::validate::{validate_acyclic, validate_dependencies, validate_document_steps};
use crate::dag::{Dag, ROOT_NODE_NAME};
use crate::errors::LoadError;
use crate::task::{
    prefix_registry_to_image_name, prefix_tags, Network, RegistryCredential, Secret, Step,
    StepKind, Task, Volume, VolumeMount, VolumeSource, IMMEDIATE_EXECUTION_TOKEN,
};

/// Timeout applied to steps that declare none, absent any override.
pub const DEFAULT_STEP_TIMEOUT_IN_SECONDS: u64 = 600;

/// Inputs the loader needs beyond the document itself.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Registry prefixed onto build tags and push targets; may be empty.
    pub registry: String,

    /// Resolved registry login credentials.
    pub credentials: Vec<RegistryCredential>,

    /// Default step timeout when the document declares none.
    pub default_timeout: Option<u64>,

    /// Default working directory when the document declares none.
    pub default_working_directory: String,
}

/// Read, preprocess, parse, and materialize a task document from disk.
pub fn load_from_path(path: impl AsRef<Path>, opts: &LoadOptions) -> Result<Task, LoadError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| LoadError::TaskFileUnreadable {
        path: path.display().to_string(),
        source,
    })?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    load_with_base_dir(&contents, base_dir, opts)
}

/// Load a task from in-memory text. Relative alias sources resolve
/// against the current directory.
pub fn load_from_str(contents: &str, opts: &LoadOptions) -> Result<Task, LoadError> {
    load_with_base_dir(contents, Path::new("."), opts)
}

fn load_with_base_dir(
    contents: &str,
    base_dir: &Path,
    opts: &LoadOptions,
) -> Result<Task, LoadError> {
    let preprocessed = alias::preprocess(contents, base_dir)?;
    let doc: TaskDocument = serde_yaml::from_str(&preprocessed)?;
    materialize(doc, opts)
}

/// Turn a parsed document into a validated [`Task`] with its DAG linked.
fn materialize(doc: TaskDocument, opts: &LoadOptions) -> Result<Task, LoadError> {
    let ids: Vec<String> = doc
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| resolve_id(s, i))
        .collect();
    validate_document_steps(&doc.steps, &ids)?;

    let step_timeout = doc
        .step_timeout
        .or(opts.default_timeout)
        .unwrap_or(DEFAULT_STEP_TIMEOUT_IN_SECONDS);
    let working_directory = doc
        .working_directory
        .clone()
        .unwrap_or_else(|| opts.default_working_directory.clone());

    let steps: Vec<Arc<Step>> = doc
        .steps
        .iter()
        .zip(&ids)
        .map(|(cfg, id)| {
            materialize_step(cfg, id, opts, &doc.env, step_timeout, &working_directory)
        })
        .collect::<Result<_, _>>()?;

    validate_dependencies(&steps)?;
    validate_acyclic(&steps)?;

    let dag = link_dag(&steps)?;

    let networks = doc
        .networks
        .iter()
        .map(|n| Network {
            name: n.name.clone(),
            driver: n.driver.clone(),
            ipv6: n.ipv6,
            subnet: n.subnet.clone(),
            skip_creation: n.skip_creation,
        })
        .collect();

    let volumes = doc
        .volumes
        .iter()
        .map(|v| Volume {
            name: v.name.clone(),
            source: VolumeSource::Secret(v.secret.clone()),
        })
        .collect();

    let secrets = doc
        .secrets
        .iter()
        .map(|s| Secret {
            id: s.id.clone(),
            value: s.value.clone().unwrap_or_default(),
        })
        .collect();

    let registry_credentials: BTreeMap<String, RegistryCredential> = opts
        .credentials
        .iter()
        .map(|c| (c.registry.clone(), c.clone()))
        .collect();

    let init_buildkit_container = steps
        .iter()
        .any(|s| s.is_build_step() && s.use_build_cache);

    debug!(
        steps = steps.len(),
        networks = doc.networks.len(),
        volumes = doc.volumes.len(),
        "task materialized"
    );

    Ok(Task {
        steps,
        networks,
        volumes,
        secrets,
        registry_credentials,
        step_timeout,
        working_directory,
        envs: doc.env,
        init_buildkit_container,
        dag,
    })
}

fn resolve_id(cfg: &StepConfig, index: usize) -> String {
    match &cfg.id {
        Some(id) if !id.is_empty() => id.clone(),
        _ => format!("step_{index}"),
    }
}

fn materialize_step(
    cfg: &StepConfig,
    id: &str,
    opts: &LoadOptions,
    task_envs: &[String],
    default_timeout: u64,
    default_working_directory: &str,
) -> Result<Arc<Step>, LoadError> {
    let mut tags = Vec::new();
    let kind = if let Some(build) = &cfg.build {
        let (prefixed, build_tags) = prefix_tags(build, &opts.registry);
        tags = build_tags;
        StepKind::Build(prefixed)
    } else if let Some(push) = &cfg.push {
        StepKind::Push(
            push.iter()
                .map(|img| prefix_registry_to_image_name(&opts.registry, img))
                .collect(),
        )
    } else if let Some(cmd) = &cfg.cmd {
        StepKind::Cmd(cmd.clone())
    } else {
        // validate_document_steps already rejected this.
        return Err(LoadError::EmptyStepKind(id.to_string()));
    };

    let mut step = Step::new(id.to_string(), kind);
    step.tags = tags;
    step.when = cfg.when.clone().unwrap_or_default();

    step.working_directory = cfg
        .working_directory
        .clone()
        .unwrap_or_else(|| default_working_directory.to_string());
    step.entry_point = cfg.entry_point.clone();

    let mut envs = task_envs.to_vec();
    envs.extend(cfg.env.iter().cloned());
    step.envs = envs;
    step.secret_envs = cfg.secret_envs.clone();

    step.expose = cfg.expose.clone();
    step.ports = cfg.ports.clone();
    step.user = cfg.user.clone();
    step.isolation = cfg.isolation.clone();
    step.network = cfg.network.clone();
    step.privileged = cfg.privileged;
    step.keep = cfg.keep;
    step.detach = cfg.detach;
    step.pull = cfg.pull;
    step.use_build_cache = cfg.use_build_cache;
    step.volume_mounts = cfg
        .volume_mounts
        .iter()
        .map(|m| VolumeMount {
            name: m.name.clone(),
            mount_path: m.mount_path.clone(),
        })
        .collect();

    step.timeout = cfg.timeout.unwrap_or(default_timeout);
    step.start_delay = cfg.start_delay;
    step.retries = cfg.retries;
    step.retry_delay = cfg.retry_delay_in_seconds;
    step.retry_on_errors = cfg.retry_on_errors.clone();
    step.repeat = cfg.repeat;
    step.download_retries = cfg.download_retries;
    step.download_retry_delay = cfg.download_retry_delay_in_seconds;
    step.ignore_errors = cfg.ignore_errors;
    step.exited_with = cfg.exited_with.clone();
    step.exited_without = cfg.exited_without.clone();

    Ok(Arc::new(step))
}

/// Build the DAG: one node per step, edges from each `when` dependency,
/// and a root edge for steps with an empty `when` or the immediate token.
fn link_dag(steps: &[Arc<Step>]) -> Result<Dag, LoadError> {
    let dag = Dag::new();

    for step in steps {
        dag.add_node(&step.id)
            .map_err(|_| LoadError::DuplicateStepId(step.id.clone()))?;
    }

    for step in steps {
        let deps: Vec<&String> = step
            .when
            .iter()
            .filter(|d| d.as_str() != IMMEDIATE_EXECUTION_TOKEN)
            .collect();

        if deps.is_empty() {
            dag.add_edge(ROOT_NODE_NAME, &step.id)
                .expect("root and step nodes exist");
            continue;
        }

        for dep in deps {
            dag.add_edge(dep, &step.id)
                .map_err(|_| LoadError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                })?;
        }
    }

    Ok(dag)
}
