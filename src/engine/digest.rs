// src/engine/digest.rs

//! Digest population for discovered image dependencies.
//!
//! Built images are always checked against the local engine store; base
//! images come from the local store too, unless the build went through
//! buildkit, in which case only the remote registry knows them.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::RuntimeError;
use crate::exec::args::EngineArgsBuilder;
use crate::exec::procman::ProcManager;
use crate::task::{ImageReference, RegistryCredential};

/// Attaches a content digest to an image reference in place.
#[async_trait]
pub trait DigestHelper: Send + Sync {
    async fn populate_digest(
        &self,
        cancel: &CancellationToken,
        reference: &mut ImageReference,
    ) -> Result<(), RuntimeError>;
}

/// Digest lookup against the local engine store via image inspect.
///
/// An image that is missing locally or was never pushed has no repo
/// digest; that is tolerated and leaves the digest empty.
pub struct EngineStoreDigest {
    proc_manager: Arc<ProcManager>,
    args: EngineArgsBuilder,
}

impl EngineStoreDigest {
    pub fn new(proc_manager: Arc<ProcManager>, args: EngineArgsBuilder) -> Self {
        Self { proc_manager, args }
    }
}

#[async_trait]
impl DigestHelper for EngineStoreDigest {
    async fn populate_digest(
        &self,
        cancel: &CancellationToken,
        reference: &mut ImageReference,
    ) -> Result<(), RuntimeError> {
        if !reference.digest.is_empty() || reference.reference.is_empty() {
            return Ok(());
        }

        let argv = self.args.image_inspect_digests_args(&reference.reference);
        match self.proc_manager.run(cancel, &argv, None, None).await {
            Ok(output) => {
                reference.digest = parse_repo_digest(&output).unwrap_or_default();
                debug!(
                    image = %reference.reference,
                    digest = %reference.digest,
                    "local store digest"
                );
                Ok(())
            }
            Err(err @ RuntimeError::Subprocess { .. }) => {
                warn!(
                    image = %reference.reference,
                    error = %err,
                    "image not present in local store; leaving digest empty"
                );
                Ok(())
            }
            Err(RuntimeError::Cancelled) => Err(RuntimeError::Cancelled),
            Err(err) => Err(RuntimeError::DigestFailed {
                image: reference.reference.clone(),
                detail: err.to_string(),
            }),
        }
    }
}

/// Digest lookup against the remote registry via buildx imagetools,
/// logging in with the task's credentials for the image's registry when
/// available. Lookup errors are fatal.
pub struct RemoteDigest {
    proc_manager: Arc<ProcManager>,
    args: EngineArgsBuilder,
    credentials: BTreeMap<String, RegistryCredential>,
    logged_in: Mutex<HashSet<String>>,
}

impl RemoteDigest {
    pub fn new(
        proc_manager: Arc<ProcManager>,
        args: EngineArgsBuilder,
        credentials: BTreeMap<String, RegistryCredential>,
    ) -> Self {
        Self {
            proc_manager,
            args,
            credentials,
            logged_in: Mutex::new(HashSet::new()),
        }
    }

    async fn ensure_login(
        &self,
        cancel: &CancellationToken,
        registry: &str,
    ) -> Result<(), RuntimeError> {
        let Some(cred) = self.credentials.get(registry) else {
            return Ok(());
        };
        if !self.logged_in.lock().unwrap().insert(registry.to_string()) {
            return Ok(());
        }

        let argv = self.args.login_args(&cred.registry, &cred.username);
        self.proc_manager
            .run(cancel, &argv, Some(&cred.password), None)
            .await
            .map_err(|source| RuntimeError::LoginFailed {
                registry: registry.to_string(),
                source: Box::new(source),
            })?;
        Ok(())
    }
}

#[async_trait]
impl DigestHelper for RemoteDigest {
    async fn populate_digest(
        &self,
        cancel: &CancellationToken,
        reference: &mut ImageReference,
    ) -> Result<(), RuntimeError> {
        if !reference.digest.is_empty() || reference.reference.is_empty() {
            return Ok(());
        }

        self.ensure_login(cancel, &reference.registry).await?;

        let argv = self.args.imagetools_inspect_args(&reference.reference);
        let output = self
            .proc_manager
            .run(cancel, &argv, None, None)
            .await
            .map_err(|err| match err {
                RuntimeError::Cancelled => RuntimeError::Cancelled,
                other => RuntimeError::DigestFailed {
                    image: reference.reference.clone(),
                    detail: other.to_string(),
                },
            })?;

        reference.digest = parse_manifest_digest(&output).unwrap_or_default();
        debug!(
            image = %reference.reference,
            digest = %reference.digest,
            "remote digest"
        );
        Ok(())
    }
}

/// Pull the first digest out of an inspect `RepoDigests` JSON array.
fn parse_repo_digest(output: &str) -> Option<String> {
    for line in output.lines() {
        let line = line.trim();
        if !line.starts_with('[') {
            continue;
        }
        if let Ok(digests) = serde_json::from_str::<Vec<String>>(line) {
            if let Some(first) = digests.first() {
                if let Some((_, digest)) = first.split_once('@') {
                    return Some(digest.to_string());
                }
            }
        }
    }
    None
}

/// Pull the digest line out of imagetools inspect output.
fn parse_manifest_digest(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("sha256:"))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_digest_is_parsed_from_inspect_json() {
        let output = "[\"r.io/app@sha256:abc123\"]\n";
        assert_eq!(parse_repo_digest(output), Some("sha256:abc123".to_string()));
    }

    #[test]
    fn unpushed_image_has_no_repo_digest() {
        assert_eq!(parse_repo_digest("[]\n"), None);
    }

    #[test]
    fn manifest_digest_is_parsed_from_imagetools_output() {
        let output = "sha256:deadbeef\n";
        assert_eq!(
            parse_manifest_digest(output),
            Some("sha256:deadbeef".to_string())
        );
    }
}
