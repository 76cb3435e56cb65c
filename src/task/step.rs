// src/task/step.rs

use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

use crate::task::image::ImageDependencies;

/// `when` entry meaning "depend on the root only".
pub const IMMEDIATE_EXECUTION_TOKEN: &str = "-";

/// Lifecycle of a step across a task run.
///
/// A step transitions `Skipped -> InProgress -> (Successful | Failed)`
/// exactly once; `Skipped` is also the terminal state of steps never
/// reached because a predecessor failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Skipped,
    InProgress,
    Successful,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Skipped => "skipped",
            StepStatus::InProgress => "in progress",
            StepStatus::Successful => "successful",
            StepStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a step does. Exactly one kind per step, decided at load time by
/// which of `build`, `push`, and `cmd` the document sets.
#[derive(Debug, Clone)]
pub enum StepKind {
    /// Raw arguments handed to the engine's `build` command.
    Build(String),
    /// Image references to push.
    Push(Vec<String>),
    /// Image plus arguments handed to the engine's `run` command.
    Cmd(String),
}

/// A declared volume mounted into a step's container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

/// Mutable per-run state, written only by the worker that owns the step.
#[derive(Debug, Default)]
struct StepState {
    status: Option<StepStatus>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
    image_dependencies: Vec<ImageDependencies>,
}

/// A unit of work in a task.
#[derive(Debug)]
pub struct Step {
    pub id: String,
    pub kind: StepKind,

    /// Prerequisite step IDs, or `["-"]` for "root only". Empty also
    /// attaches the step to the root.
    pub when: Vec<String>,

    pub working_directory: String,
    pub entry_point: Option<String>,
    pub envs: Vec<String>,
    pub secret_envs: Vec<String>,
    pub expose: Vec<String>,
    pub ports: Vec<String>,
    pub user: Option<String>,
    pub isolation: Option<String>,
    pub network: Option<String>,
    pub privileged: bool,
    pub keep: bool,
    pub detach: bool,
    pub pull: bool,
    pub use_build_cache: bool,
    pub volume_mounts: Vec<VolumeMount>,

    /// Tags of a build step, collected during registry prefixing.
    pub tags: Vec<String>,

    pub timeout: u64,
    pub start_delay: u64,
    pub retries: u32,
    pub retry_delay: u64,
    pub retry_on_errors: Vec<String>,
    pub repeat: u32,
    pub download_retries: u32,
    pub download_retry_delay: u64,
    pub ignore_errors: bool,

    /// Expected exit-code allow/deny lists, carried through for external
    /// validation.
    pub exited_with: Vec<i32>,
    pub exited_without: Vec<i32>,

    state: Mutex<StepState>,
}

impl Step {
    pub fn new(id: String, kind: StepKind) -> Self {
        Self {
            id,
            kind,
            when: Vec::new(),
            working_directory: String::new(),
            entry_point: None,
            envs: Vec::new(),
            secret_envs: Vec::new(),
            expose: Vec::new(),
            ports: Vec::new(),
            user: None,
            isolation: None,
            network: None,
            privileged: false,
            keep: false,
            detach: false,
            pull: false,
            use_build_cache: false,
            volume_mounts: Vec::new(),
            tags: Vec::new(),
            timeout: 0,
            start_delay: 0,
            retries: 0,
            retry_delay: 0,
            retry_on_errors: Vec::new(),
            repeat: 0,
            download_retries: 0,
            download_retry_delay: 0,
            ignore_errors: false,
            exited_with: Vec::new(),
            exited_without: Vec::new(),
            state: Mutex::new(StepState::default()),
        }
    }

    pub fn is_build_step(&self) -> bool {
        matches!(self.kind, StepKind::Build(_))
    }

    pub fn is_push_step(&self) -> bool {
        matches!(self.kind, StepKind::Push(_))
    }

    pub fn is_cmd_step(&self) -> bool {
        matches!(self.kind, StepKind::Cmd(_))
    }

    pub fn status(&self) -> StepStatus {
        self.state
            .lock()
            .unwrap()
            .status
            .unwrap_or(StepStatus::Skipped)
    }

    pub fn set_status(&self, status: StepStatus) {
        self.state.lock().unwrap().status = Some(status);
    }

    /// Mark the step in progress and record its start time.
    pub fn mark_started(&self) {
        let mut state = self.state.lock().unwrap();
        state.status = Some(StepStatus::InProgress);
        state.start_time = Some(Instant::now());
    }

    /// Record the step's end time.
    pub fn mark_ended(&self) {
        self.state.lock().unwrap().end_time = Some(Instant::now());
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.state.lock().unwrap().start_time
    }

    pub fn end_time(&self) -> Option<Instant> {
        self.state.lock().unwrap().end_time
    }

    /// Wall-clock seconds between start and end, zero if either is unset.
    pub fn elapsed_seconds(&self) -> f64 {
        let state = self.state.lock().unwrap();
        match (state.start_time, state.end_time) {
            (Some(start), Some(end)) => end.duration_since(start).as_secs_f64(),
            _ => 0.0,
        }
    }

    pub fn set_image_dependencies(&self, deps: Vec<ImageDependencies>) {
        self.state.lock().unwrap().image_dependencies = deps;
    }

    pub fn image_dependencies(&self) -> Vec<ImageDependencies> {
        self.state.lock().unwrap().image_dependencies.clone()
    }

    /// True when any recorded dependency references the given image.
    pub fn contains_image_dependency(&self, image: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.image_dependencies.iter().any(|dep| {
            dep.image.reference == image
                || dep.runtime.reference == image
                || dep.buildtime.iter().any(|b| b.reference == image)
        })
    }

    /// First whitespace field of a cmd step: the image to run.
    pub fn cmd_image(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Cmd(cmd) => cmd.split_whitespace().next(),
            _ => None,
        }
    }
}
