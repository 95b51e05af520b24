//! Sandbox exec primitive
//!
//! Everything the core runs inside the sandbox goes through [`ContainerExec`]:
//! one-shot commands (multiplexer control, scrollback snapshots, health polls)
//! and interactive invocations handed to a pty (`docker exec -it`, `ssh -tt`).
//!
//! ```text
//! PersistentSessionManager ──exec()──────────► docker exec / ssh / local
//! Agents (pty) ─────────────interactive()────► CommandSpec → portable-pty
//! ```

mod docker;
mod local;
mod ssh;

pub use docker::DockerExec;
pub use local::LocalExec;
pub use ssh::SshExec;

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;

/// A one-shot command to run in the sandbox
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    /// argv, first element is the program
    pub args: Vec<String>,
    /// Working directory inside the sandbox
    pub workdir: Option<String>,
    /// Run with elevated privileges (package installation)
    pub as_root: bool,
}

impl ExecRequest {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            workdir: None,
            as_root: false,
        }
    }

    /// Run `script` through `sh -c`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(["sh".to_string(), "-c".to_string(), script.into()])
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn as_root(mut self) -> Self {
        self.as_root = true;
        self
    }
}

/// Captured result of an [`ExecRequest`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Program invocation for a pty-backed process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// "Run this against the sandbox" capability
#[async_trait]
pub trait ContainerExec: Send + Sync {
    /// Run a command to completion and capture its output
    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput>;

    /// Build the invocation that runs `argv` interactively under a pty
    fn interactive(&self, argv: &[String], workdir: Option<&str>) -> CommandSpec;

    /// Human-readable target for logs
    fn describe(&self) -> String;
}

/// Run a host process to completion with a hard timeout
pub(crate) async fn run_host_command(
    program: &str,
    args: &[String],
    cwd: Option<&str>,
    timeout: Duration,
) -> Result<ExecOutput> {
    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let child = command
        .spawn()
        .map_err(|e| Error::Container(format!("Failed to spawn {}: {}", program, e)))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| Error::Timeout(format!("{} did not finish within {:?}", program, timeout)))?
        .map_err(|e| Error::Container(format!("Failed to wait for {}: {}", program, e)))?;

    Ok(ExecOutput {
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Quote one word for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r#"'\''"#))
}

/// Join argv into a single shell command line
pub fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_plain() {
        assert_eq!(shell_quote("screen"), "screen");
        assert_eq!(shell_quote("/tmp/a.txt"), "/tmp/a.txt");
    }

    #[test]
    fn test_shell_quote_special() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
    }

    #[test]
    fn test_shell_join() {
        let args = vec!["echo".to_string(), "hello world".to_string()];
        assert_eq!(shell_join(&args), "echo 'hello world'");
    }

    #[test]
    fn test_exec_request_builder() {
        let req = ExecRequest::shell("ls").workdir("/tmp").as_root();
        assert_eq!(req.args, vec!["sh", "-c", "ls"]);
        assert_eq!(req.workdir.as_deref(), Some("/tmp"));
        assert!(req.as_root);
    }

    #[tokio::test]
    async fn test_run_host_command_captures_output() {
        let out = run_host_command(
            "sh",
            &["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()],
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_run_host_command_missing_binary() {
        let result = run_host_command(
            "definitely-not-a-real-binary-xyz",
            &[],
            None,
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(Error::Container(_))));
    }

    #[tokio::test]
    async fn test_run_host_command_timeout() {
        let result = run_host_command(
            "sleep",
            &["5".to_string()],
            None,
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
