//! AI CLI agent
//!
//! Runs the AI CLI inside a persistent session (so it survives page refreshes)
//! and offers a request/response `execute()` on top of the raw terminal stream.
//! Commands are serialized; each one waits for the completion heuristic or the
//! hard exchange timeout, whichever comes first.

use super::completion::CompletionHeuristic;
use super::persistent::PersistentAgent;
use super::pty::OutputTap;
use super::types::{Agent, AgentEventSender, AgentKind, AgentOptions, AgentStatus};
use crate::error::{Error, Result};
use crate::session::PersistentSessionManager;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct AiCliAgent {
    inner: PersistentAgent,
    command: String,
    heuristic: Arc<dyn CompletionHeuristic>,
    exchange_timeout: Duration,
    exchange: tokio::sync::Mutex<()>,
    tap: OutputTap,
}

impl AiCliAgent {
    pub fn new(
        id: String,
        manager: Arc<PersistentSessionManager>,
        mut options: AgentOptions,
        grace: Duration,
        default_command: &str,
        heuristic: Arc<dyn CompletionHeuristic>,
        exchange_timeout: Duration,
    ) -> Self {
        let command = options
            .command
            .take()
            .unwrap_or_else(|| default_command.to_string());
        let tap: OutputTap = Arc::new(Mutex::new(None));
        let inner = PersistentAgent::new(id, AgentKind::AiCli, manager, options, grace)
            .with_tap(tap.clone());
        Self {
            inner,
            command,
            heuristic,
            exchange_timeout,
            exchange: tokio::sync::Mutex::new(()),
            tap,
        }
    }

    fn set_tap(&self, sink: Option<mpsc::UnboundedSender<String>>) {
        *self.tap.lock().unwrap_or_else(|p| p.into_inner()) = sink;
    }

    async fn collect_response(&self, rx: &mut mpsc::UnboundedReceiver<String>) -> Result<String> {
        let mut output = String::new();
        let mut last_output = Instant::now();
        loop {
            tokio::select! {
                chunk = rx.recv() => match chunk {
                    Some(chunk) => {
                        output.push_str(&chunk);
                        last_output = Instant::now();
                    }
                    None => {
                        return Err(Error::NotRunning(format!(
                            "Agent {} stopped while waiting for a response",
                            self.inner.id()
                        )));
                    }
                },
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
            if self.heuristic.is_complete(&output, last_output.elapsed()) {
                return Ok(output);
            }
        }
    }
}

#[async_trait]
impl Agent for AiCliAgent {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> AgentKind {
        AgentKind::AiCli
    }

    fn status(&self) -> AgentStatus {
        self.inner.status()
    }

    fn start_time(&self) -> DateTime<Utc> {
        self.inner.start_time()
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn persistent_session_id(&self) -> Option<String> {
        self.inner.persistent_session_id()
    }

    fn attached(&self) -> bool {
        self.inner.attached()
    }

    async fn initialize(&mut self, events: AgentEventSender) -> Result<()> {
        self.inner.initialize(events).await?;

        if self.inner.reused_session() {
            tracing::info!(agent_id = %self.inner.id(), "Reusing running AI CLI session");
            return Ok(());
        }

        if let Err(e) = self
            .inner
            .send_to_session(&format!("{}\n", self.command))
            .await
        {
            let _ = self.inner.terminate().await;
            return Err(Error::Initialization(format!(
                "Failed to start {}: {}",
                self.command, e
            )));
        }
        tracing::info!(
            agent_id = %self.inner.id(),
            command = %self.command,
            heuristic = self.heuristic.name(),
            "Started AI CLI"
        );
        Ok(())
    }

    async fn send_input(&self, input: &str) -> Result<()> {
        self.inner.send_input(input).await
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.inner.resize(cols, rows).await
    }

    async fn detach(&self) -> Result<()> {
        self.inner.detach().await
    }

    async fn reattach(&self) -> Result<()> {
        self.inner.reattach().await
    }

    async fn terminate(&self) -> Result<()> {
        self.inner.terminate().await
    }

    async fn execute(&self, command: &str) -> Result<String> {
        let _turn = self.exchange.lock().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.set_tap(Some(tx));

        let result = match self.inner.send_input(&format!("{}\r", command)).await {
            Ok(()) => {
                tokio::time::timeout(self.exchange_timeout, self.collect_response(&mut rx)).await
            }
            Err(e) => {
                self.set_tap(None);
                return Err(e);
            }
        };
        self.set_tap(None);

        match result {
            Ok(response) => response,
            Err(_) => {
                tracing::warn!(
                    agent_id = %self.inner.id(),
                    timeout = ?self.exchange_timeout,
                    "AI CLI response did not complete in time"
                );
                Err(Error::Timeout(format!(
                    "No complete response within {:?}",
                    self.exchange_timeout
                )))
            }
        }
    }
}
