//! Host transport, used when the server itself runs inside the sandbox

use super::{run_host_command, CommandSpec, ContainerExec, ExecOutput, ExecRequest};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Runs commands directly on this host
pub struct LocalExec {
    timeout: Duration,
}

impl LocalExec {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for LocalExec {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

#[async_trait]
impl ContainerExec for LocalExec {
    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput> {
        let (program, args) = request
            .args
            .split_first()
            .ok_or_else(|| Error::Container("Empty command".to_string()))?;
        run_host_command(program, args, request.workdir.as_deref(), self.timeout).await
    }

    fn interactive(&self, argv: &[String], workdir: Option<&str>) -> CommandSpec {
        let mut spec = match argv.split_first() {
            Some((program, args)) => CommandSpec::new(program.clone()).args(args.iter().cloned()),
            None => CommandSpec::new(
                std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            ),
        };
        if let Some(dir) = workdir {
            spec = spec.cwd(dir);
        }
        spec.env("TERM", "xterm-256color")
    }

    fn describe(&self) -> String {
        "local".to_string()
    }
}
