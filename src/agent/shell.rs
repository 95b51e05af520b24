//! Plain pty agents: a local shell or a shell over SSH

use super::pty::{forward_events, ForwardHooks, PtyProcess};
use super::types::{Agent, AgentEventSender, AgentKind, AgentOptions, AgentStatus, StatusCell};
use crate::container::{CommandSpec, ContainerExec};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// An agent that owns one pty process and nothing else
pub struct ShellAgent {
    id: String,
    kind: AgentKind,
    spec: CommandSpec,
    size: (u16, u16),
    grace: Duration,
    status: StatusCell,
    start_time: DateTime<Utc>,
    generation: Arc<AtomicU64>,
    attached: AtomicBool,
    process: Option<PtyProcess>,
}

impl ShellAgent {
    pub fn new(
        id: String,
        kind: AgentKind,
        spec: CommandSpec,
        options: &AgentOptions,
        grace: Duration,
    ) -> Self {
        let mut spec = spec;
        for (key, value) in &options.env {
            spec = spec.env(key.clone(), value.clone());
        }
        Self {
            id,
            kind,
            spec,
            size: options.size(),
            grace,
            status: StatusCell::new(),
            start_time: Utc::now(),
            generation: Arc::new(AtomicU64::new(0)),
            attached: AtomicBool::new(false),
            process: None,
        }
    }

    /// `shell`: the configured shell on this host
    pub fn local(id: String, shell: &str, options: &AgentOptions, grace: Duration) -> Self {
        let mut spec = CommandSpec::new(shell).env("TERM", "xterm-256color");
        if let Some(ref cwd) = options.cwd {
            spec = spec.cwd(cwd.clone());
        }
        Self::new(id, AgentKind::Shell, spec, options, grace)
    }

    /// `ssh-shell`: an interactive login over the SSH transport
    pub fn ssh(
        id: String,
        ssh: &dyn ContainerExec,
        options: &AgentOptions,
        grace: Duration,
    ) -> Self {
        let argv: Vec<String> = options
            .command
            .as_ref()
            .map(|c| vec!["sh".to_string(), "-lc".to_string(), c.clone()])
            .unwrap_or_default();
        let spec = ssh.interactive(&argv, options.cwd.as_deref());
        Self::new(id, AgentKind::SshShell, spec, options, grace)
    }

    fn running_process(&self) -> Result<&PtyProcess> {
        match self.process {
            Some(ref p) if self.status.get() == AgentStatus::Running && p.is_alive() => Ok(p),
            _ => Err(Error::NotRunning(format!("Agent {} is not running", self.id))),
        }
    }
}

#[async_trait]
impl Agent for ShellAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn status(&self) -> AgentStatus {
        self.status.get()
    }

    fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    fn attached(&self) -> bool {
        self.status.get() == AgentStatus::Running && self.attached.load(Ordering::SeqCst)
    }

    async fn initialize(&mut self, events: AgentEventSender) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (cols, rows) = self.size;
        let process = match PtyProcess::spawn(&self.spec, cols, rows, tx) {
            Ok(p) => p,
            Err(e) => {
                self.status.set(AgentStatus::Error);
                return Err(e);
            }
        };

        if !process.confirm_alive(self.grace).await {
            self.status.set(AgentStatus::Error);
            return Err(Error::Initialization(format!(
                "{} exited during startup",
                self.spec.program
            )));
        }

        self.status.set(AgentStatus::Running);
        self.attached.store(true, Ordering::SeqCst);
        forward_events(
            rx,
            events,
            self.status.clone(),
            self.generation.clone(),
            0,
            ForwardHooks::default(),
        );
        tracing::info!(
            agent_id = %self.id,
            kind = %self.kind,
            pid = ?process.pid(),
            "Agent running"
        );
        self.process = Some(process);
        Ok(())
    }

    async fn send_input(&self, input: &str) -> Result<()> {
        self.running_process()?.write(input)
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        match self.running_process() {
            Ok(p) => p.resize(cols, rows),
            Err(_) => Ok(()),
        }
    }

    /// The process keeps running; its output is buffered by whoever relays it
    async fn detach(&self) -> Result<()> {
        self.attached.store(false, Ordering::SeqCst);
        tracing::debug!(agent_id = %self.id, "Agent detached");
        Ok(())
    }

    async fn reattach(&self) -> Result<()> {
        self.running_process()?;
        self.attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        if let Some(ref process) = self.process {
            process.kill();
        }
        self.status.set(AgentStatus::Stopped);
        tracing::info!(agent_id = %self.id, "Agent terminated");
        Ok(())
    }
}
