// src/config/model.rs

use std::collections::BTreeMap;

use serde::Deserialize;

/// Top-level task document as read from YAML.
///
/// ```yaml
/// version: v1.1.0
/// stepTimeout: 800
/// env: [REGION=westus]
/// steps:
///   - id: build-app
///     build: -t app:latest -f Dockerfile .
///   - id: push-app
///     push: [app:latest]
///     when: [build-app]
/// ```
///
/// All sections are optional; defaults are applied at load time.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDocument {
    #[serde(default)]
    pub version: Option<String>,

    /// Default timeout in seconds for steps that declare none.
    #[serde(default)]
    pub step_timeout: Option<u64>,

    /// Default working directory for steps that declare none.
    #[serde(default)]
    pub working_directory: Option<String>,

    /// Task-level environment, prepended to every step's environment.
    #[serde(default)]
    pub env: Vec<String>,

    #[serde(default)]
    pub networks: Vec<NetworkConfig>,

    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,

    /// Secrets referenced by step `secretEnvs`. Values arrive already
    /// resolved; vault lookup is not this crate's concern.
    #[serde(default)]
    pub secrets: Vec<SecretConfig>,

    #[serde(default)]
    pub steps: Vec<StepConfig>,

    #[serde(default)]
    pub alias: Option<AliasConfig>,
}

/// One step as declared in the document. Exactly one of `build`, `push`,
/// and `cmd` must be set; the loader enforces this.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepConfig {
    /// Unique step ID; generated as `step_<index>` when omitted.
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub push: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<String>,

    /// Prerequisite step IDs, or `["-"]` for "run immediately".
    #[serde(default)]
    pub when: Option<Vec<String>>,

    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub entry_point: Option<String>,

    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub secret_envs: Vec<String>,

    #[serde(default)]
    pub expose: Vec<String>,
    #[serde(default)]
    pub ports: Vec<String>,

    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub isolation: Option<String>,
    #[serde(default)]
    pub network: Option<String>,

    #[serde(default)]
    pub privileged: bool,
    /// Keep the container after exit instead of `--rm`.
    #[serde(default)]
    pub keep: bool,
    #[serde(default)]
    pub detach: bool,
    /// Perform an explicit image pull before running a cmd step.
    #[serde(default)]
    pub pull: bool,
    #[serde(default)]
    pub use_build_cache: bool,

    #[serde(default)]
    pub volume_mounts: Vec<VolumeMountConfig>,

    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub start_delay: u64,

    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub retry_delay_in_seconds: u64,
    /// Substring patterns; a failed attempt is retried only when its
    /// output contains one of them. Empty means retry on any failure.
    #[serde(default)]
    pub retry_on_errors: Vec<String>,

    /// Additional successful invocations required after the first success.
    #[serde(default)]
    pub repeat: u32,

    #[serde(default)]
    pub download_retries: u32,
    #[serde(default)]
    pub download_retry_delay_in_seconds: u64,

    #[serde(default)]
    pub ignore_errors: bool,

    /// Expected exit-code allow/deny lists, consumed by external
    /// validation.
    #[serde(default)]
    pub exited_with: Vec<i32>,
    #[serde(default)]
    pub exited_without: Vec<i32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMountConfig {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    pub name: String,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub ipv6: bool,
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub skip_creation: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConfig {
    pub name: String,
    /// Filename to Base64-encoded content.
    #[serde(default)]
    pub secret: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretConfig {
    pub id: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// `alias` block: inline values, external sources, and the directive
/// character introducing alias references.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasConfig {
    #[serde(default)]
    pub values: BTreeMap<String, String>,

    /// External alias documents, merged in order; later documents and
    /// inline `values` override earlier ones.
    #[serde(default)]
    pub src: Vec<String>,

    /// Exactly one character; defaults to `$`.
    #[serde(default)]
    pub directive: Option<String>,
}
