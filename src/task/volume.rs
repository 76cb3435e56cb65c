// src/task/volume.rs

use std::collections::BTreeMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::RuntimeError;
use crate::exec::args::EngineArgsBuilder;
use crate::exec::procman::ProcManager;

/// Where a volume's contents come from.
#[derive(Debug, Clone)]
pub enum VolumeSource {
    /// Filename to Base64-encoded content.
    Secret(BTreeMap<String, String>),
}

/// A named volume created and populated before any step runs.
#[derive(Debug, Clone)]
pub struct Volume {
    pub name: String,
    pub source: VolumeSource,
}

impl Volume {
    /// Decode the secret files into `<workspace>/<name>/` and populate the
    /// volume from them with a helper-container copy.
    pub async fn materialize(
        &self,
        cancel: &CancellationToken,
        proc_manager: &ProcManager,
        args: &EngineArgsBuilder,
        workspace_dir: &str,
    ) -> Result<(), RuntimeError> {
        let VolumeSource::Secret(files) = &self.source;

        let staging = Path::new(workspace_dir).join(&self.name);
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| self.setup_error(format!("creating staging directory: {e}")))?;

        for (filename, encoded) in files {
            let decoded = BASE64.decode(encoded.trim()).map_err(|_| {
                self.setup_error(format!(
                    "value for '{filename}' is not valid Base64; please make sure the value provided is Base64 encoded"
                ))
            })?;
            tokio::fs::write(staging.join(filename), decoded)
                .await
                .map_err(|e| self.setup_error(format!("writing '{filename}': {e}")))?;
        }

        let filenames: Vec<&str> = files.keys().map(String::as_str).collect();
        let argv = args.volume_populate_args(&self.name, workspace_dir, &filenames);
        debug!(volume = %self.name, ?argv, "populating volume");
        proc_manager
            .run(cancel, &argv, None, None)
            .await
            .map_err(|e| self.setup_error(format!("populating volume: {e}")))?;

        Ok(())
    }

    fn setup_error(&self, detail: String) -> RuntimeError {
        RuntimeError::VolumeSetup {
            name: self.name.clone(),
            detail,
        }
    }
}
