// src/task/network.rs

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::RuntimeError;
use crate::exec::args::EngineArgsBuilder;
use crate::exec::procman::ProcManager;

/// A container network created before any step runs and deleted in cleanup.
#[derive(Debug, Clone, Default)]
pub struct Network {
    pub name: String,
    pub driver: Option<String>,
    pub ipv6: bool,
    pub subnet: Option<String>,
    /// Skip creation and deletion; the network is assumed to exist.
    pub skip_creation: bool,
}

impl Network {
    /// Create the network. Returns the engine's combined output.
    pub async fn create(
        &self,
        cancel: &CancellationToken,
        proc_manager: &ProcManager,
        args: &EngineArgsBuilder,
    ) -> Result<String, RuntimeError> {
        let argv = args.network_create_args(self);
        debug!(network = %self.name, ?argv, "creating network");
        proc_manager.run(cancel, &argv, None, None).await
    }

    /// Delete the network. Returns the engine's combined output.
    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        proc_manager: &ProcManager,
        args: &EngineArgsBuilder,
    ) -> Result<String, RuntimeError> {
        let argv = args.network_rm_args(&self.name);
        debug!(network = %self.name, ?argv, "deleting network");
        proc_manager.run(cancel, &argv, None, None).await
    }
}
