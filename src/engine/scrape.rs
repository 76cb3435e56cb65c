// src/engine/scrape.rs

//! Image dependency discovery for build steps.
//!
//! The scraper walks the step's Dockerfile and classifies its base
//! images: the final stage's base is the runtime dependency, earlier
//! stages are buildtime dependencies. `ARG` defaults and `--build-arg`
//! values are resolved in `FROM` lines, stage aliases are followed, and
//! `scratch` is ignored.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::errors::RuntimeError;
use crate::task::{ImageDependencies, ImageReference, RegistryCredential};

/// Inputs for one dependency scan.
#[derive(Debug)]
pub struct ScrapeRequest<'a> {
    pub workspace_dir: &'a str,
    pub working_directory: &'a str,
    pub step_id: &'a str,
    pub dockerfile: String,
    pub context: String,
    pub tags: &'a [String],
    pub build_args: Vec<(String, String)>,
    pub target: Option<String>,
    pub credentials: &'a BTreeMap<String, RegistryCredential>,
}

/// Discovers the image dependencies of a build step.
pub trait DependencyScraper: Send + Sync {
    fn scrape(&self, request: &ScrapeRequest<'_>) -> Result<Vec<ImageDependencies>, RuntimeError>;
}

/// Default scraper: parses the local Dockerfile named by the build
/// command. Remote contexts (git and tarball URLs) are not scanned.
#[derive(Debug, Default)]
pub struct DockerfileScraper;

impl DependencyScraper for DockerfileScraper {
    fn scrape(&self, request: &ScrapeRequest<'_>) -> Result<Vec<ImageDependencies>, RuntimeError> {
        if is_remote_context(&request.context) {
            warn!(
                step = %request.step_id,
                context = %request.context,
                "remote build context; skipping dependency scan"
            );
            return Ok(Vec::new());
        }

        let path = resolve_dockerfile_path(
            request.workspace_dir,
            request.working_directory,
            &request.context,
            &request.dockerfile,
        );
        debug!(step = %request.step_id, path = %path.display(), "scanning Dockerfile");

        let contents = fs::read_to_string(&path).map_err(|err| {
            RuntimeError::ScrapeFailed(format!("reading '{}': {err}", path.display()))
        })?;

        let bases = base_images(&contents, &request.build_args, request.target.as_deref());
        let Some((runtime, buildtime)) = bases.split_last() else {
            return Err(RuntimeError::ScrapeFailed(format!(
                "no FROM instruction found in '{}'",
                path.display()
            )));
        };
        let buildtime_refs: Vec<ImageReference> = buildtime
            .iter()
            .filter(|b| *b != runtime && !b.eq_ignore_ascii_case("scratch"))
            .map(|b| ImageReference::parse(b))
            .collect();
        let runtime_ref = ImageReference::parse(runtime);

        Ok(request
            .tags
            .iter()
            .map(|tag| ImageDependencies {
                image: ImageReference::parse(tag),
                runtime: runtime_ref.clone(),
                buildtime: buildtime_refs.clone(),
            })
            .collect())
    }
}

/// Extract `(dockerfile, target, context)` from a build command.
///
/// Mirrors the engine CLI: `-f/--file` names the Dockerfile (default
/// `Dockerfile`), `--target` selects a stage, and the last positional
/// argument is the context (default `.`).
pub fn parse_docker_build_cmd(build: &str) -> (String, Option<String>, String) {
    let fields: Vec<&str> = build.split_whitespace().collect();

    let mut dockerfile = "Dockerfile".to_string();
    let mut target = None;
    let mut context = ".".to_string();

    let mut i = 0;
    while i < fields.len() {
        let field = fields[i];
        match field {
            "-f" | "--file" => {
                if let Some(value) = fields.get(i + 1) {
                    dockerfile = (*value).to_string();
                    i += 1;
                }
            }
            "--target" => {
                if let Some(value) = fields.get(i + 1) {
                    target = Some((*value).to_string());
                    i += 1;
                }
            }
            _ if takes_value(field) => {
                i += 1;
            }
            _ if field.starts_with('-') => {}
            _ => {
                context = field.to_string();
            }
        }
        i += 1;
    }

    (dockerfile, target, context)
}

/// Extract `--build-arg key=value` pairs from a build command.
pub fn parse_build_args(build: &str) -> Vec<(String, String)> {
    let fields: Vec<&str> = build.split_whitespace().collect();
    let mut args = Vec::new();

    let mut i = 0;
    while i < fields.len() {
        if fields[i] == "--build-arg" {
            if let Some(value) = fields.get(i + 1) {
                if let Some((k, v)) = value.split_once('=') {
                    args.push((k.to_string(), v.to_string()));
                }
                i += 1;
            }
        }
        i += 1;
    }

    args
}

/// Flags whose value occupies the following field.
fn takes_value(flag: &str) -> bool {
    matches!(
        flag,
        "-t" | "--tag"
            | "--build-arg"
            | "--label"
            | "--cache-from"
            | "--cache-to"
            | "--platform"
            | "--secret"
            | "--network"
            | "--ssh"
            | "-m"
            | "--memory"
    )
}

pub fn is_remote_context(context: &str) -> bool {
    let lower = context.to_lowercase();
    lower.starts_with("http://")
        || lower.starts_with("https://")
        || lower.starts_with("git@")
        || lower.ends_with(".git")
}

fn resolve_dockerfile_path(
    workspace_dir: &str,
    working_directory: &str,
    context: &str,
    dockerfile: &str,
) -> PathBuf {
    let mut base = PathBuf::from(workspace_dir);
    // Working directories under the container mount map back onto the
    // host workspace; anything else is taken relative to the workspace.
    let relative = working_directory
        .trim_start_matches("/workspace")
        .trim_start_matches('/');
    if !relative.is_empty() {
        base = base.join(relative);
    }

    let direct = base.join(dockerfile);
    if direct.is_file() {
        return direct;
    }
    base.join(context).join(dockerfile)
}

/// All base images in Dockerfile order, one per stage, with stage-alias
/// references resolved. When a target stage is named, the scan stops
/// after it, since later stages are not built.
fn base_images(contents: &str, build_args: &[(String, String)], target: Option<&str>) -> Vec<String> {
    let mut values: HashMap<String, String> = HashMap::new();
    let mut aliases: HashMap<String, String> = HashMap::new();
    let mut stages: Vec<String> = Vec::new();

    for raw in logical_lines(contents) {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let instruction = match fields.next() {
            Some(word) => word.to_uppercase(),
            None => continue,
        };

        match instruction.as_str() {
            "ARG" => {
                if let Some(decl) = fields.next() {
                    let (name, default) = match decl.split_once('=') {
                        Some((n, d)) => (n.to_string(), d.to_string()),
                        None => (decl.to_string(), String::new()),
                    };
                    let value = build_args
                        .iter()
                        .find(|(k, _)| *k == name)
                        .map(|(_, v)| v.clone())
                        .unwrap_or(default);
                    values.insert(name, value);
                }
            }
            "FROM" => {
                let mut image = None;
                let mut alias = None;
                let mut expect_alias = false;
                for field in fields {
                    if field.starts_with("--") {
                        continue;
                    }
                    if expect_alias {
                        alias = Some(field.to_string());
                        break;
                    }
                    if field.eq_ignore_ascii_case("as") {
                        expect_alias = true;
                        continue;
                    }
                    if image.is_none() {
                        image = Some(substitute_args(field, &values));
                    }
                }

                if let Some(image) = image {
                    // A FROM that names an earlier stage resolves to that
                    // stage's base image.
                    let resolved = aliases.get(&image).cloned().unwrap_or(image);
                    let is_target = alias.as_deref() == target && target.is_some();
                    if let Some(alias) = alias {
                        aliases.insert(alias, resolved.clone());
                    }
                    stages.push(resolved);
                    if is_target {
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    stages.retain(|s| !s.eq_ignore_ascii_case("scratch"));
    stages
}

/// Expand `$NAME` and `${NAME}` using the resolved ARG values.
fn substitute_args(image: &str, values: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(image.len());
    let mut chars = image.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }

        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }

        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                name.push(c);
                chars.next();
            } else {
                break;
            }
        }
        if braced && chars.peek() == Some(&'}') {
            chars.next();
        }

        match values.get(&name) {
            Some(value) => out.push_str(value),
            None => {
                out.push('$');
                out.push_str(&name);
            }
        }
    }

    out
}

/// Join backslash-continued lines.
fn logical_lines(contents: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for line in contents.lines() {
        let trimmed = line.trim_end();
        if let Some(stripped) = trimmed.strip_suffix('\\') {
            current.push_str(stripped);
            current.push(' ');
        } else {
            current.push_str(trimmed);
            lines.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_build_cmd_fields() {
        let (dockerfile, target, context) =
            parse_docker_build_cmd("-f app/Dockerfile -t app:v1 --target dist ./app");
        assert_eq!(dockerfile, "app/Dockerfile");
        assert_eq!(target.as_deref(), Some("dist"));
        assert_eq!(context, "./app");
    }

    #[test]
    fn build_cmd_defaults() {
        let (dockerfile, target, context) = parse_docker_build_cmd("-t app:v1 .");
        assert_eq!(dockerfile, "Dockerfile");
        assert_eq!(target, None);
        assert_eq!(context, ".");
    }

    #[test]
    fn extracts_build_args() {
        let args = parse_build_args("-t a --build-arg REGION=eu --build-arg TIER=prod .");
        assert_eq!(
            args,
            vec![
                ("REGION".to_string(), "eu".to_string()),
                ("TIER".to_string(), "prod".to_string())
            ]
        );
    }

    #[test]
    fn single_stage_dockerfile_has_one_runtime_base() {
        let bases = base_images("FROM ubuntu:22.04\nRUN make\n", &[], None);
        assert_eq!(bases, vec!["ubuntu:22.04"]);
    }

    #[test]
    fn multi_stage_resolves_args_and_aliases() {
        let dockerfile = "\
ARG BASE=rust:1.79
FROM $BASE AS build
RUN cargo build --release
FROM debian:bookworm-slim
COPY --from=build /app /app
";
        let bases = base_images(dockerfile, &[], None);
        assert_eq!(bases, vec!["rust:1.79", "debian:bookworm-slim"]);
    }

    #[test]
    fn build_args_override_arg_defaults() {
        let dockerfile = "ARG BASE=rust:1.79\nFROM ${BASE}\n";
        let bases = base_images(
            dockerfile,
            &[("BASE".to_string(), "rust:1.80".to_string())],
            None,
        );
        assert_eq!(bases, vec!["rust:1.80"]);
    }

    #[test]
    fn stage_alias_reference_resolves_to_base() {
        let dockerfile = "FROM golang:1.22 AS build\nFROM build\n";
        let bases = base_images(dockerfile, &[], None);
        assert_eq!(bases, vec!["golang:1.22", "golang:1.22"]);
    }

    #[test]
    fn scratch_is_dropped() {
        let dockerfile = "FROM golang:1.22 AS build\nFROM scratch\nCOPY --from=build /a /a\n";
        let bases = base_images(dockerfile, &[], None);
        assert_eq!(bases, vec!["golang:1.22"]);
    }

    #[test]
    fn remote_contexts_are_detected() {
        assert!(is_remote_context("https://github.com/org/repo.git"));
        assert!(is_remote_context("git@github.com:org/repo.git"));
        assert!(!is_remote_context("./app"));
    }
}
