//! SSH transport

use super::{
    run_host_command, shell_join, shell_quote, CommandSpec, ContainerExec, ExecOutput, ExecRequest,
};
use crate::config::SshConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Runs commands in the sandbox over SSH
pub struct SshExec {
    config: SshConfig,
    timeout: Duration,
}

impl SshExec {
    pub fn new(config: SshConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    fn base_args(&self, tty: bool) -> Vec<String> {
        let mut args = Vec::new();
        if tty {
            args.push("-tt".to_string());
        } else {
            args.push("-T".to_string());
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        args.push("-p".to_string());
        args.push(self.config.port.to_string());
        if let Some(ref identity) = self.config.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().into_owned());
        }
        args.extend(self.config.extra_args.iter().cloned());
        args.push(format!("{}@{}", self.config.user, self.config.host));
        args
    }

    /// Remote command line for argv, with optional `cd` and `sudo`
    fn remote_command(argv: &[String], workdir: Option<&str>, as_root: bool) -> String {
        let mut line = String::new();
        if let Some(dir) = workdir {
            line.push_str("cd ");
            line.push_str(&shell_quote(dir));
            line.push_str(" && ");
        }
        if as_root {
            line.push_str("sudo -n ");
        }
        line.push_str(&shell_join(argv));
        line
    }
}

#[async_trait]
impl ContainerExec for SshExec {
    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput> {
        let mut args = self.base_args(false);
        args.push("--".to_string());
        args.push(Self::remote_command(
            &request.args,
            request.workdir.as_deref(),
            request.as_root,
        ));
        run_host_command("ssh", &args, None, self.timeout).await
    }

    fn interactive(&self, argv: &[String], workdir: Option<&str>) -> CommandSpec {
        let mut args = self.base_args(true);
        if !argv.is_empty() || workdir.is_some() {
            args.push("--".to_string());
            let mut remote = Self::remote_command(argv, workdir, false);
            if argv.is_empty() {
                remote.push_str("exec $SHELL -l");
            }
            args.push(remote);
        }
        CommandSpec::new("ssh")
            .args(args)
            .env("TERM", "xterm-256color")
    }

    fn describe(&self) -> String {
        format!(
            "ssh:{}@{}:{}",
            self.config.user, self.config.host, self.config.port
        )
    }
}
