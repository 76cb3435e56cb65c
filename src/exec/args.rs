// src/exec/args.rs

//! Container-engine argv construction.
//!
//! Every step runs as an engine `run` invocation: cmd steps treat the
//! first whitespace field of `cmd` as the image, build steps wrap the
//! engine's own CLI image around a `build` command, with the engine
//! socket mounted so the inner client reaches the host daemon.

use crate::task::{Network, Secret, Step};

/// Image wrapping build commands (`docker build ...` runs inside it).
pub const DOCKER_CLI_IMAGE: &str = "docker";

/// Container name of the singleton buildx builder daemon.
pub const BUILDKITD_CONTAINER_NAME: &str = "buildkitd";

/// Host socket forwarded into helper containers.
pub const DOCKER_SOCKET_VOLUME_MAPPING: &str = "/var/run/docker.sock:/var/run/docker.sock";

/// Mount point of the workspace inside step containers.
pub const CONTAINER_WORKSPACE_DIR: &str = "/workspace";

/// Builds engine-CLI argv vectors from normalized step inputs.
#[derive(Debug, Clone)]
pub struct EngineArgsBuilder {
    engine: String,
}

impl EngineArgsBuilder {
    pub fn new(engine: &str) -> Self {
        Self {
            engine: engine.to_string(),
        }
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// `run` argv for a step: container flags from the step's inputs,
    /// the workspace and engine socket mounted, then the whitespace
    /// fields of `cmd` (image first for cmd steps).
    pub fn run_args_for_step(
        &self,
        workspace_dir: &str,
        working_directory: &str,
        step: &Step,
        entry_point: Option<&str>,
        cmd: &str,
        secrets: &[Secret],
    ) -> Vec<String> {
        let mut args = vec![
            self.engine.clone(),
            "run".to_string(),
            "--name".to_string(),
            step.id.clone(),
        ];

        if step.detach {
            args.push("-d".to_string());
        } else if !step.keep {
            args.push("--rm".to_string());
        }

        if step.privileged {
            args.push("--privileged".to_string());
        }
        if let Some(user) = &step.user {
            args.push("-u".to_string());
            args.push(user.clone());
        }
        if let Some(isolation) = &step.isolation {
            args.push("--isolation".to_string());
            args.push(isolation.clone());
        }
        if let Some(network) = &step.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }

        for port in &step.ports {
            args.push("-p".to_string());
            args.push(port.clone());
        }
        for expose in &step.expose {
            args.push("--expose".to_string());
            args.push(expose.clone());
        }

        for env in &step.envs {
            args.push("-e".to_string());
            args.push(env.clone());
        }
        for id in &step.secret_envs {
            if let Some(secret) = secrets.iter().find(|s| &s.id == id) {
                args.push("-e".to_string());
                args.push(format!("{}={}", secret.id, secret.value));
            }
        }

        args.push("--volume".to_string());
        args.push(format!("{workspace_dir}:{CONTAINER_WORKSPACE_DIR}"));
        args.push("--volume".to_string());
        args.push(DOCKER_SOCKET_VOLUME_MAPPING.to_string());
        for mount in &step.volume_mounts {
            args.push("--volume".to_string());
            args.push(format!("{}:{}", mount.name, mount.mount_path));
        }

        args.push("-w".to_string());
        if working_directory.is_empty() {
            args.push(CONTAINER_WORKSPACE_DIR.to_string());
        } else {
            args.push(working_directory.to_string());
        }

        if let Some(entry_point) = entry_point {
            args.push("--entrypoint".to_string());
            args.push(entry_point.to_string());
        }

        args.extend(cmd.split_whitespace().map(str::to_string));
        args
    }

    /// `run` argv for the singleton buildx builder daemon.
    pub fn buildkitd_create_args(&self, workspace_dir: &str) -> Vec<String> {
        vec![
            self.engine.clone(),
            "run".to_string(),
            "--name".to_string(),
            BUILDKITD_CONTAINER_NAME.to_string(),
            "--rm".to_string(),
            "-d".to_string(),
            "--privileged".to_string(),
            "--volume".to_string(),
            format!("{workspace_dir}:{CONTAINER_WORKSPACE_DIR}"),
            "--volume".to_string(),
            DOCKER_SOCKET_VOLUME_MAPPING.to_string(),
            "-w".to_string(),
            CONTAINER_WORKSPACE_DIR.to_string(),
            DOCKER_CLI_IMAGE.to_string(),
            "buildx".to_string(),
            "create".to_string(),
            "--use".to_string(),
        ]
    }

    pub fn network_create_args(&self, network: &Network) -> Vec<String> {
        let mut args = vec![
            self.engine.clone(),
            "network".to_string(),
            "create".to_string(),
        ];
        if let Some(driver) = &network.driver {
            args.push("--driver".to_string());
            args.push(driver.clone());
        }
        if network.ipv6 {
            args.push("--ipv6".to_string());
        }
        if let Some(subnet) = &network.subnet {
            args.push("--subnet".to_string());
            args.push(subnet.clone());
        }
        args.push(network.name.clone());
        args
    }

    pub fn network_rm_args(&self, name: &str) -> Vec<String> {
        vec![
            self.engine.clone(),
            "network".to_string(),
            "rm".to_string(),
            name.to_string(),
        ]
    }

    /// `login` argv; the password travels on stdin.
    pub fn login_args(&self, registry: &str, username: &str) -> Vec<String> {
        vec![
            self.engine.clone(),
            "login".to_string(),
            "-u".to_string(),
            username.to_string(),
            "--password-stdin".to_string(),
            registry.to_string(),
        ]
    }

    /// Wrapped pull: a throwaway CLI container pulls the image through
    /// the host daemon.
    pub fn pull_args(&self, image: &str) -> Vec<String> {
        vec![
            self.engine.clone(),
            "run".to_string(),
            "--rm".to_string(),
            "--volume".to_string(),
            DOCKER_SOCKET_VOLUME_MAPPING.to_string(),
            DOCKER_CLI_IMAGE.to_string(),
            "pull".to_string(),
            image.to_string(),
        ]
    }

    pub fn push_args(&self, image: &str) -> Vec<String> {
        vec![
            self.engine.clone(),
            "push".to_string(),
            image.to_string(),
        ]
    }

    /// Local-store digest lookup via image inspect.
    pub fn image_inspect_digests_args(&self, image: &str) -> Vec<String> {
        vec![
            self.engine.clone(),
            "image".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{json .RepoDigests}}".to_string(),
            image.to_string(),
        ]
    }

    /// Remote digest lookup via buildx imagetools.
    pub fn imagetools_inspect_args(&self, image: &str) -> Vec<String> {
        vec![
            self.engine.clone(),
            "buildx".to_string(),
            "imagetools".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{println .Manifest.Digest}}".to_string(),
            image.to_string(),
        ]
    }

    pub fn rm_container_args(&self, name: &str) -> Vec<String> {
        vec![
            self.engine.clone(),
            "rm".to_string(),
            "-f".to_string(),
            name.to_string(),
        ]
    }

    pub fn version_args(&self) -> Vec<String> {
        vec![self.engine.clone(), "version".to_string()]
    }

    /// Helper-container copy that populates a volume from staged files.
    pub fn volume_populate_args(
        &self,
        volume_name: &str,
        workspace_dir: &str,
        filenames: &[&str],
    ) -> Vec<String> {
        let mut args = vec![
            self.engine.clone(),
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{workspace_dir}:/source"),
            "-v".to_string(),
            format!("{volume_name}:/dest"),
            "-w".to_string(),
            "/source".to_string(),
            DOCKER_CLI_IMAGE.to_string(),
            "cp".to_string(),
        ];
        for filename in filenames {
            args.push(format!("{volume_name}/{filename}"));
        }
        args.push("/dest".to_string());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Step, StepKind, VolumeMount};

    fn cmd_step(id: &str, cmd: &str) -> Step {
        Step::new(id.to_string(), StepKind::Cmd(cmd.to_string()))
    }

    #[test]
    fn cmd_step_image_is_first_field() {
        let builder = EngineArgsBuilder::new("docker");
        let step = cmd_step("hello", "ubuntu echo hi");
        let args = builder.run_args_for_step("/ws", "", &step, None, "ubuntu echo hi", &[]);

        assert_eq!(args[0], "docker");
        assert_eq!(args[1], "run");
        assert!(args.contains(&"--rm".to_string()));
        let image_idx = args.iter().position(|a| a == "ubuntu").unwrap();
        assert_eq!(args[image_idx + 1], "echo");
        assert_eq!(args[image_idx + 2], "hi");
    }

    #[test]
    fn detach_replaces_rm() {
        let builder = EngineArgsBuilder::new("docker");
        let mut step = cmd_step("svc", "redis");
        step.detach = true;
        let args = builder.run_args_for_step("/ws", "", &step, None, "redis", &[]);

        assert!(args.contains(&"-d".to_string()));
        assert!(!args.contains(&"--rm".to_string()));
    }

    #[test]
    fn declared_volumes_are_mounted() {
        let builder = EngineArgsBuilder::new("docker");
        let mut step = cmd_step("svc", "app");
        step.volume_mounts = vec![VolumeMount {
            name: "certs".to_string(),
            mount_path: "/certs".to_string(),
        }];
        let args = builder.run_args_for_step("/ws", "", &step, None, "app", &[]);

        assert!(args.contains(&"certs:/certs".to_string()));
    }

    #[test]
    fn network_create_includes_driver_and_subnet() {
        let builder = EngineArgsBuilder::new("docker");
        let network = Network {
            name: "testnet".to_string(),
            driver: Some("bridge".to_string()),
            ipv6: true,
            subnet: Some("10.0.0.0/24".to_string()),
            skip_creation: false,
        };
        let args = builder.network_create_args(&network);

        assert_eq!(
            args,
            vec![
                "docker", "network", "create", "--driver", "bridge", "--ipv6", "--subnet",
                "10.0.0.0/24", "testnet"
            ]
        );
    }
}
