// src/engine/builder.rs

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dag::ROOT_NODE_NAME;
use crate::errors::RuntimeError;
use crate::exec::args::{EngineArgsBuilder, DOCKER_CLI_IMAGE};
use crate::exec::procman::ProcManager;
use crate::task::{Step, StepKind, StepStatus, Task};

use super::digest::{DigestHelper, EngineStoreDigest, RemoteDigest};
use super::scrape::{
    parse_build_args, parse_docker_build_cmd, DependencyScraper, DockerfileScraper, ScrapeRequest,
};

const CONFIG_TIMEOUT_IN_SEC: u64 = 120;
const LOGIN_TIMEOUT_IN_SEC: u64 = 120;
const DIGESTS_TIMEOUT_IN_SEC: u64 = 300;

const LOGIN_RETRIES: u32 = 3;
const LOGIN_RETRY_DELAY_IN_SEC: u64 = 5;

const BUILDKITD_RUN_TIMEOUT_IN_SEC: u64 = 300;
const BUILDKITD_INIT_RETRIES: u32 = 3;
const BUILDKITD_INIT_RETRY_DELAY_IN_SEC: u64 = 5;
const BUILDKITD_INIT_REPEAT: u32 = 0;

const WINDOWS_SERVER_CORE_2019_IMAGE: &str = "mcr.microsoft.com/windows/servercore:ltsc2019";

/// Output patterns indicative of a transient login failure.
const LOGIN_RETRY_PATTERNS: &[&str] = &[
    "timeout",
    "temporary failure",
    "connection refused",
    "connection reset",
];

/// Per-node one-shot completion signals for a single run.
///
/// Senders are handed out exactly once: the worker that executes a node
/// removes its sender and pushes the signal, so a second delivery is
/// impossible by construction.
struct CompletionSignals {
    senders: Mutex<HashMap<String, mpsc::Sender<bool>>>,
}

impl CompletionSignals {
    fn complete(&self, id: &str) {
        if let Some(sender) = self.senders.lock().unwrap().remove(id) {
            let _ = sender.try_send(true);
        }
    }
}

/// Executes tasks against the container engine.
pub struct Builder {
    proc_manager: Arc<ProcManager>,
    args: EngineArgsBuilder,
    workspace_dir: String,
    scraper: Box<dyn DependencyScraper>,
    buildkitd_init: OnceCell<()>,
    windows_prerun: OnceCell<()>,
}

impl Builder {
    pub fn new(proc_manager: Arc<ProcManager>, engine: &str, workspace_dir: &str) -> Self {
        Self {
            proc_manager,
            args: EngineArgsBuilder::new(engine),
            workspace_dir: workspace_dir.to_string(),
            scraper: Box::new(DockerfileScraper),
            buildkitd_init: OnceCell::new(),
            windows_prerun: OnceCell::new(),
        }
    }

    /// Execute a task: set up networks, engine configuration, registry
    /// logins, and volumes, then drive the DAG to completion and populate
    /// digests for every discovered image dependency.
    ///
    /// Returns `Ok(())` only when every step succeeded or failed under
    /// `ignore_errors`. The first fatal step error aborts the run.
    pub async fn run_task(
        self: Arc<Self>,
        cancel: &CancellationToken,
        task: &Arc<Task>,
    ) -> Result<(), RuntimeError> {
        for network in &task.networks {
            if network.skip_creation {
                info!(network = %network.name, "skip creating network");
                continue;
            }
            info!(
                network = %network.name,
                driver = network.driver.as_deref().unwrap_or(""),
                "creating network"
            );
            if let Err(err) = network.create(cancel, &self.proc_manager, &self.args).await {
                let detail = match err.output_tail() {
                    Some(tail) if !tail.trim().is_empty() => {
                        format!("{err}: {}", tail.trim())
                    }
                    _ => err.to_string(),
                };
                return Err(RuntimeError::NetworkCreate {
                    name: network.name.clone(),
                    detail,
                });
            }
            info!(network = %network.name, "successfully set up network");
        }

        info!("setting up engine configuration");
        self.with_timeout(
            CONFIG_TIMEOUT_IN_SEC,
            self.proc_manager
                .run(cancel, &self.args.version_args(), None, None),
        )
        .await
        .map(|_| ())?;
        info!("successfully set up engine configuration");

        if task.using_registry_creds() {
            for (registry, cred) in &task.registry_credentials {
                info!(registry = %registry, "logging in to registry");
                self.with_timeout(
                    LOGIN_TIMEOUT_IN_SEC,
                    self.login_with_retries(cancel, registry, &cred.username, &cred.password),
                )
                .await?;
                info!(registry = %registry, "successfully logged in");
            }
        }

        if task.init_buildkit_container {
            info!("task will use build cache, initializing buildkitd container");
            self.buildkitd_init
                .get_or_init(|| async {
                    let argv = self.args.buildkitd_create_args(&self.workspace_dir);
                    debug!(?argv, "buildkitd container args");
                    let run = self.proc_manager.run_repeat_with_retries(
                        cancel,
                        &argv,
                        None,
                        None,
                        BUILDKITD_INIT_RETRIES,
                        &[],
                        BUILDKITD_INIT_RETRY_DELAY_IN_SEC,
                        "buildkitd",
                        BUILDKITD_INIT_REPEAT,
                    );
                    match self.with_timeout(BUILDKITD_RUN_TIMEOUT_IN_SEC, run).await {
                        Ok(()) => {}
                        Err(err) => {
                            warn!(error = %err, "buildx create --use failed");
                        }
                    }
                })
                .await;
        }

        for volume in &task.volumes {
            volume
                .materialize(cancel, &self.proc_manager, &self.args, &self.workspace_dir)
                .await?;
            info!(volume = %volume.name, "volume source successfully created");
        }

        // One single-capacity completion channel per step; the error
        // channel carries the first fatal step failure.
        let (err_tx, mut err_rx) = mpsc::unbounded_channel::<RuntimeError>();
        let mut receivers = Vec::with_capacity(task.steps.len());
        let mut senders = HashMap::with_capacity(task.steps.len());
        for step in &task.steps {
            let (tx, rx) = mpsc::channel::<bool>(1);
            senders.insert(step.id.clone(), tx);
            receivers.push((step.id.clone(), rx));
        }
        let signals = Arc::new(CompletionSignals {
            senders: Mutex::new(senders),
        });

        for child in task.dag.children(ROOT_NODE_NAME) {
            tokio::spawn(Arc::clone(&self).process_vertex(
                cancel.clone(),
                Arc::clone(task),
                ROOT_NODE_NAME.to_string(),
                child,
                err_tx.clone(),
                Arc::clone(&signals),
            ));
        }

        // Block until either the run is cancelled, a step fails, or every
        // step has signalled completion. First error wins; remaining
        // signals are not awaited and cleanup sweeps outstanding work.
        for (id, mut completed_rx) in receivers {
            tokio::select! {
                _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                err = err_rx.recv() => {
                    if let Some(err) = err {
                        return Err(err);
                    }
                }
                _ = completed_rx.recv() => {
                    debug!(step = %id, "completion signal received");
                }
            }
        }

        let mut all_deps = Vec::new();
        for step in &task.steps {
            info!(
                step = %step.id,
                status = %step.status(),
                elapsed_seconds = step.elapsed_seconds(),
                "step marked"
            );

            let deps = step.image_dependencies();
            if deps.is_empty() {
                continue;
            }

            info!(step = %step.id, "populating digests");
            let using_buildkit = step.use_build_cache && cfg!(target_os = "linux");
            if using_buildkit {
                info!("image was built using buildkit, fetching digest from remote");
            }
            self.with_timeout(
                DIGESTS_TIMEOUT_IN_SEC,
                self.populate_digests(cancel, step, using_buildkit, task),
            )
            .await?;
            info!(step = %step.id, "successfully populated digests");
            all_deps.extend(step.image_dependencies());
        }

        if !all_deps.is_empty() {
            match serde_json::to_string_pretty(&all_deps) {
                Ok(json) => {
                    info!("the following dependencies were found:");
                    println!("{json}");
                }
                Err(err) => warn!(error = %err, "failed to serialize image dependencies"),
            }
        }

        Ok(())
    }

    /// Best-effort removal of every non-skipped step's container and every
    /// non-skip network, then stop the process manager. Errors are logged,
    /// never returned.
    pub async fn clean_task(&self, cancel: &CancellationToken, task: &Task) {
        for step in &task.steps {
            if step.status() != StepStatus::Skipped {
                let argv = self.args.rm_container_args(&step.id);
                if let Err(err) = self.proc_manager.run(cancel, &argv, None, None).await {
                    debug!(step = %step.id, error = %err, "container removal failed");
                }
            }
        }

        for network in &task.networks {
            if network.skip_creation {
                info!(network = %network.name, "skip deleting network");
                continue;
            }
            if let Err(err) = network.delete(cancel, &self.proc_manager, &self.args).await {
                warn!(network = %network.name, error = %err, "failed to delete network");
            }
        }

        self.proc_manager.stop();
    }

    /// Worker body for one edge `parent -> child`.
    ///
    /// Removes the satisfied reverse edge; the worker that brings the
    /// child's degree to zero executes it, signals completion, and forks
    /// a worker per child edge.
    fn process_vertex(
        self: Arc<Self>,
        cancel: CancellationToken,
        task: Arc<Task>,
        parent: String,
        child: String,
        err_tx: mpsc::UnboundedSender<RuntimeError>,
        signals: Arc<CompletionSignals>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            if let Err(err) = task.dag.remove_edge(&parent, &child) {
                let _ = err_tx.send(RuntimeError::from(err));
                return;
            }

            match task.dag.degree(&child) {
                Ok(0) => {}
                Ok(_) => return,
                Err(err) => {
                    let _ = err_tx.send(RuntimeError::from(err));
                    return;
                }
            }

            let Some(step) = task.step(&child).cloned() else {
                let _ = err_tx.send(RuntimeError::Dag(crate::dag::DagError::UnknownNode(child)));
                return;
            };

            let result = self.run_step(&cancel, &task, &step).await;
            let succeeded = match result {
                Ok(()) => {
                    step.set_status(StepStatus::Successful);
                    true
                }
                Err(err) if step.ignore_errors => {
                    warn!(
                        step = %step.id,
                        error = %err,
                        "step encountered an error but is set to ignore errors, continuing"
                    );
                    step.set_status(StepStatus::Successful);
                    true
                }
                Err(err) => {
                    step.set_status(StepStatus::Failed);
                    let _ = err_tx.send(RuntimeError::for_step(&step.id, err));
                    false
                }
            };

            // The step must always signal completion, even on failure.
            signals.complete(&child);

            if succeeded {
                for next in task.dag.children(&child) {
                    tokio::spawn(Arc::clone(&self).process_vertex(
                        cancel.clone(),
                        Arc::clone(&task),
                        child.clone(),
                        next,
                        err_tx.clone(),
                        Arc::clone(&signals),
                    ));
                }
            }
        })
    }

    /// Execute one step to completion under its timeout and retry policy.
    async fn run_step(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        step: &Step,
    ) -> Result<(), RuntimeError> {
        info!(
            step = %step.id,
            timeout_seconds = step.timeout,
            working_directory = %step.working_directory,
            network = step.network.as_deref().unwrap_or(""),
            "executing step"
        );

        if step.start_delay > 0 {
            info!(step = %step.id, seconds = step.start_delay, "waiting before execution");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(step.start_delay)) => {}
                _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
            }
        }

        if step.is_cmd_step() && step.pull {
            info!(step = %step.id, "step specified pull, performing an explicit pull");
            self.pull_image_before_run(cancel, step).await?;
        }

        step.mark_started();
        let result = self.run_step_inner(cancel, task, step).await;
        step.mark_ended();
        result
    }

    async fn run_step_inner(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        step: &Step,
    ) -> Result<(), RuntimeError> {
        let argv = match &step.kind {
            StepKind::Build(build) => {
                let (dockerfile, target, context) = parse_docker_build_cmd(build);
                validate_build_context(&context);

                info!(step = %step.id, "scanning for dependencies");
                let request = ScrapeRequest {
                    workspace_dir: &self.workspace_dir,
                    working_directory: &step.working_directory,
                    step_id: &step.id,
                    dockerfile,
                    context,
                    tags: &step.tags,
                    build_args: parse_build_args(build),
                    target,
                    credentials: &task.registry_credentials,
                };
                let deps = self.scraper.scrape(&request)?;
                info!(step = %step.id, "successfully scanned dependencies");
                step.set_image_dependencies(deps);

                let build_cmd = if step.use_build_cache {
                    format!("{DOCKER_CLI_IMAGE} buildx build {build}")
                } else {
                    format!("{DOCKER_CLI_IMAGE} build {build}")
                };
                self.args.run_args_for_step(
                    &self.workspace_dir,
                    &step.working_directory,
                    step,
                    None,
                    &build_cmd,
                    &task.secrets,
                )
            }
            StepKind::Push(images) => {
                return self
                    .with_timeout(step.timeout, self.push_with_retries(cancel, step, images))
                    .await;
            }
            StepKind::Cmd(cmd) => self.args.run_args_for_step(
                &self.workspace_dir,
                &step.working_directory,
                step,
                step.entry_point.as_deref(),
                cmd,
                &task.secrets,
            ),
        };

        debug!(step = %step.id, ?argv, "step args");

        // Windows Server 2019 Hyper-V containers need a throwaway warm-up
        // run once per process before the first real one succeeds.
        if cfg!(windows) && matches!(step.isolation.as_deref(), None | Some("hyperv")) {
            let image = step.cmd_image().unwrap_or_default();
            if image == WINDOWS_SERVER_CORE_2019_IMAGE
                || step.contains_image_dependency(WINDOWS_SERVER_CORE_2019_IMAGE)
            {
                self.windows_prerun
                    .get_or_init(|| self.pre_run_windows_container(cancel, step))
                    .await;
            }
        }

        let run = self.proc_manager.run_repeat_with_retries(
            cancel,
            &argv,
            None,
            None,
            step.retries,
            &step.retry_on_errors,
            step.retry_delay,
            &step.id,
            step.repeat,
        );
        self.with_timeout(step.timeout, run).await
    }

    async fn push_with_retries(
        &self,
        cancel: &CancellationToken,
        step: &Step,
        images: &[String],
    ) -> Result<(), RuntimeError> {
        for image in images {
            info!(step = %step.id, image = %image, "pushing image");
            let argv = self.args.push_args(image);
            self.proc_manager
                .run_with_retries(
                    cancel,
                    &argv,
                    None,
                    None,
                    step.retries,
                    &step.retry_on_errors,
                    step.retry_delay,
                    &step.id,
                )
                .await?;
        }
        Ok(())
    }

    async fn pull_image_before_run(
        &self,
        cancel: &CancellationToken,
        step: &Step,
    ) -> Result<(), RuntimeError> {
        let Some(image) = step.cmd_image() else {
            return Ok(());
        };
        let argv = self.args.pull_args(image);
        debug!(step = %step.id, ?argv, "pull image args");
        self.proc_manager
            .run_with_retries(
                cancel,
                &argv,
                None,
                None,
                step.download_retries,
                &[],
                step.download_retry_delay,
                &step.id,
            )
            .await
    }

    async fn login_with_retries(
        &self,
        cancel: &CancellationToken,
        registry: &str,
        username: &str,
        password: &str,
    ) -> Result<(), RuntimeError> {
        let argv = self.args.login_args(registry, username);
        let patterns: Vec<String> = LOGIN_RETRY_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .collect();
        self.proc_manager
            .run_with_retries(
                cancel,
                &argv,
                Some(password),
                None,
                LOGIN_RETRIES,
                &patterns,
                LOGIN_RETRY_DELAY_IN_SEC,
                registry,
            )
            .await
            .map_err(|source| RuntimeError::LoginFailed {
                registry: registry.to_string(),
                source: Box::new(source),
            })
    }

    /// Run a throwaway Hyper-V container so subsequent runs succeed.
    /// The run is silent; failures only surface at debug level.
    async fn pre_run_windows_container(&self, cancel: &CancellationToken, step: &Step) {
        let argv = vec![
            self.args.engine().to_string(),
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            format!("{}_prerun", step.id),
            "--isolation".to_string(),
            "hyperv".to_string(),
            "--pull".to_string(),
            "always".to_string(),
            WINDOWS_SERVER_CORE_2019_IMAGE.to_string(),
        ];
        debug!(step = %step.id, ?argv, "pre-run args");
        match self.proc_manager.run(cancel, &argv, None, None).await {
            Ok(_) => debug!(step = %step.id, "pre-run completed without issues"),
            Err(err) => debug!(step = %step.id, error = %err, "pre-run completed with error"),
        }
    }

    async fn populate_digests(
        &self,
        cancel: &CancellationToken,
        step: &Step,
        using_buildkit: bool,
        task: &Task,
    ) -> Result<(), RuntimeError> {
        let store = EngineStoreDigest::new(Arc::clone(&self.proc_manager), self.args.clone());
        let remote = RemoteDigest::new(
            Arc::clone(&self.proc_manager),
            self.args.clone(),
            task.registry_credentials.clone(),
        );
        let base_digester: &dyn DigestHelper = if using_buildkit { &remote } else { &store };

        let mut deps = step.image_dependencies();
        for dep in &mut deps {
            // The built image is always checked in the local store: if it
            // was pushed, inspect returns a digest, otherwise it is empty.
            store.populate_digest(cancel, &mut dep.image).await?;
            base_digester.populate_digest(cancel, &mut dep.runtime).await?;
            for buildtime in &mut dep.buildtime {
                base_digester.populate_digest(cancel, buildtime).await?;
            }
        }
        step.set_image_dependencies(deps);
        Ok(())
    }

    async fn with_timeout<T>(
        &self,
        seconds: u64,
        fut: impl Future<Output = Result<T, RuntimeError>>,
    ) -> Result<T, RuntimeError> {
        match tokio::time::timeout(Duration::from_secs(seconds), fut).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout { seconds }),
        }
    }
}

/// Warn when a remote context looks like a git repository but does not
/// end with `.git`.
fn validate_build_context(context: &str) {
    let lower = context.to_lowercase();
    if lower.contains("github") && !lower.contains(".git") {
        warn!(
            context = %context,
            "context might not be valid; git repositories should end with .git"
        );
    }
}
