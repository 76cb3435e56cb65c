// src/task/image.rs

use serde::Serialize;

/// Registry assumed when an image reference names no host.
pub const DOCKER_HUB_REGISTRY: &str = "registry.hub.docker.com";

/// A parsed image reference plus, after the digest pass, its content digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub digest: String,
    /// The reference as it appeared in the task.
    pub reference: String,
}

impl ImageReference {
    /// Parse `[registry/]repository[:tag][@digest]` into its components.
    ///
    /// A leading segment counts as a registry when it contains a dot or a
    /// colon, or is `localhost`; otherwise the reference is treated as a
    /// Docker Hub image and bare names gain the `library/` repository.
    pub fn parse(image: &str) -> Self {
        let reference = image.to_string();

        let (body, digest) = match image.split_once('@') {
            Some((body, digest)) => (body, digest.to_string()),
            None => (image, String::new()),
        };

        let (registry, remainder) = match body.split_once('/') {
            Some((head, rest)) if head.contains('.') || head.contains(':') || head == "localhost" => {
                (head.to_string(), rest)
            }
            _ => (DOCKER_HUB_REGISTRY.to_string(), body),
        };

        // The tag separator is a colon after the last slash.
        let (repository, tag) = match remainder.rfind(':') {
            Some(idx) if !remainder[idx + 1..].contains('/') => (
                remainder[..idx].to_string(),
                remainder[idx + 1..].to_string(),
            ),
            _ => (remainder.to_string(), "latest".to_string()),
        };

        let repository = if registry == DOCKER_HUB_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        Self {
            registry,
            repository,
            tag,
            digest,
            reference,
        }
    }
}

/// Image dependencies of a single built image: the image itself, its
/// final-stage base, and any earlier-stage bases.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDependencies {
    pub image: ImageReference,
    pub runtime: ImageReference,
    pub buildtime: Vec<ImageReference>,
}

/// Prefix the registry onto an image name unless it is already qualified
/// with `<registry>/` or pinned to the `library/` namespace. Idempotent.
pub fn prefix_registry_to_image_name(registry: &str, img: &str) -> String {
    if registry.is_empty() {
        return img.to_string();
    }
    if !img.starts_with(&format!("{registry}/")) && !img.starts_with("library/") {
        return format!("{registry}/{img}");
    }
    img.to_string()
}

/// Prefix the registry onto every `-t`/`--tag` argument of a build command.
/// Returns the rewritten command and the prefixed tags in order.
pub fn prefix_tags(cmd: &str, registry: &str) -> (String, Vec<String>) {
    let mut fields: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
    let mut tags = Vec::new();
    for i in 1..fields.len() {
        if fields[i - 1] == "-t" || fields[i - 1] == "--tag" {
            fields[i] = prefix_registry_to_image_name(registry, &fields[i]);
            tags.push(fields[i].clone());
        }
    }
    (fields.join(" "), tags)
}
