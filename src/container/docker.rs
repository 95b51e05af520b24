//! `docker exec` transport

use super::{run_host_command, CommandSpec, ContainerExec, ExecOutput, ExecRequest};
use crate::config::ContainerConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Runs commands inside a named container via the Docker CLI
pub struct DockerExec {
    binary: String,
    container: String,
    user: Option<String>,
    timeout: Duration,
}

impl DockerExec {
    pub fn new(config: &ContainerConfig) -> Self {
        Self {
            binary: config.docker_binary.clone(),
            container: config.name.clone(),
            user: config.user.clone(),
            timeout: Duration::from_secs(config.exec_timeout_secs.max(1)),
        }
    }

    fn exec_args(&self, interactive: bool, as_root: bool, workdir: Option<&str>) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if interactive {
            args.push("-it".to_string());
            args.push("-e".to_string());
            args.push("TERM=xterm-256color".to_string());
        }
        if as_root {
            args.push("-u".to_string());
            args.push("root".to_string());
        } else if let Some(ref user) = self.user {
            args.push("-u".to_string());
            args.push(user.clone());
        }
        if let Some(dir) = workdir {
            args.push("-w".to_string());
            args.push(dir.to_string());
        }
        args.push(self.container.clone());
        args
    }
}

#[async_trait]
impl ContainerExec for DockerExec {
    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput> {
        let mut args = self.exec_args(false, request.as_root, request.workdir.as_deref());
        args.extend(request.args);
        run_host_command(&self.binary, &args, None, self.timeout).await
    }

    fn interactive(&self, argv: &[String], workdir: Option<&str>) -> CommandSpec {
        let mut args = self.exec_args(true, false, workdir);
        args.extend(argv.iter().cloned());
        CommandSpec::new(self.binary.clone()).args(args)
    }

    fn describe(&self) -> String {
        format!("docker:{}", self.container)
    }
}
