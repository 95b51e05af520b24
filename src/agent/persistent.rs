//! Agents backed by a persistent multiplexer session
//!
//! The agent's pty only runs the attach command (`docker exec -it … screen -D -r`,
//! or the same over SSH). Detaching kills that attachment and leaves the shell
//! in the session running; input sent while detached is injected straight into
//! the session.

use super::pty::{forward_events, ForwardHooks, OutputTap, PtyProcess};
use super::types::{
    Agent, AgentEvent, AgentEventSender, AgentKind, AgentOptions, AgentStatus, StatusCell,
};
use crate::container::ContainerExec;
use crate::error::{Error, Result};
use crate::session::{CreateSessionOptions, PersistentSessionManager};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub struct PersistentAgent {
    id: String,
    kind: AgentKind,
    manager: Arc<PersistentSessionManager>,
    /// Attach through this transport instead of the manager's own
    transport: Option<Arc<dyn ContainerExec>>,
    options: AgentOptions,
    grace: Duration,
    status: StatusCell,
    start_time: DateTime<Utc>,
    session_id: Option<String>,
    reused: bool,
    events: Option<AgentEventSender>,
    size: Mutex<(u16, u16)>,
    attachment: Mutex<Option<PtyProcess>>,
    generation: Arc<AtomicU64>,
    tap: Option<OutputTap>,
}

impl PersistentAgent {
    pub fn new(
        id: String,
        kind: AgentKind,
        manager: Arc<PersistentSessionManager>,
        options: AgentOptions,
        grace: Duration,
    ) -> Self {
        let size = options.size();
        Self {
            id,
            kind,
            manager,
            transport: None,
            options,
            grace,
            status: StatusCell::new(),
            start_time: Utc::now(),
            session_id: None,
            reused: false,
            events: None,
            size: Mutex::new(size),
            attachment: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            tap: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn ContainerExec>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub(crate) fn with_tap(mut self, tap: OutputTap) -> Self {
        self.tap = Some(tap);
        self
    }

    /// Whether initialize() picked up an existing session
    pub fn reused_session(&self) -> bool {
        self.reused
    }

    /// Inject input into the session regardless of attachment
    pub async fn send_to_session(&self, input: &str) -> Result<()> {
        let session_id = self
            .session_id
            .as_deref()
            .ok_or_else(|| Error::NotRunning(format!("Agent {} has no session", self.id)))?;
        self.manager.send_to_session(session_id, input).await
    }

    fn current_size(&self) -> (u16, u16) {
        *self.size.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn attachment_alive(&self) -> bool {
        self.attachment
            .lock()
            .map(|a| a.as_ref().map(|p| p.is_alive()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Spawn a pty attached to the session
    async fn attach(&self) -> Result<()> {
        let session_id = self
            .session_id
            .as_deref()
            .ok_or_else(|| Error::NotRunning(format!("Agent {} has no session", self.id)))?;
        let events = self
            .events
            .clone()
            .ok_or_else(|| Error::Internal(format!("Agent {} not initialized", self.id)))?;

        let spec = match self.transport {
            Some(ref transport) => self.manager.attach_via(session_id, transport.as_ref()).await?,
            None => self.manager.attach_to_session(session_id).await?,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let (cols, rows) = self.current_size();
        let process = match PtyProcess::spawn(&spec, cols, rows, tx) {
            Ok(p) => p,
            Err(e) => {
                let _ = self.manager.detach_session(session_id).await;
                return Err(e);
            }
        };
        if !process.confirm_alive(self.grace).await {
            let _ = self.manager.detach_session(session_id).await;
            return Err(Error::Initialization(format!(
                "Attachment to session {} exited immediately",
                session_id
            )));
        }

        let (activity_tx, mut activity_rx) = mpsc::unbounded_channel();
        let manager = self.manager.clone();
        let activity_session = session_id.to_string();
        tokio::spawn(async move {
            while activity_rx.recv().await.is_some() {
                manager.record_activity(&activity_session).await;
            }
        });

        let mine = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        forward_events(
            rx,
            events,
            self.status.clone(),
            self.generation.clone(),
            mine,
            ForwardHooks {
                tap: self.tap.clone(),
                activity: Some(activity_tx),
            },
        );

        let previous = self
            .attachment
            .lock()
            .map_err(|_| Error::Internal("attachment lock poisoned".to_string()))?
            .replace(process);
        if let Some(previous) = previous {
            previous.kill();
        }

        tracing::info!(
            agent_id = %self.id,
            session_id,
            "Attached to persistent session"
        );
        Ok(())
    }

    fn take_attachment(&self) -> Option<PtyProcess> {
        self.attachment
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    async fn resolve_session(&mut self) -> Result<String> {
        if let Some(ref id) = self.options.persistent_session_id {
            if self.manager.get_session(id).await.is_some() {
                self.reused = true;
                return Ok(id.clone());
            }
            tracing::warn!(
                agent_id = %self.id,
                session_id = %id,
                "Requested persistent session not found, creating a new one"
            );
        }

        let (cols, rows) = self.options.size();
        let session = self
            .manager
            .create_session(CreateSessionOptions {
                command: self.options.command.clone(),
                cwd: self.options.cwd.clone(),
                cols: Some(cols),
                rows: Some(rows),
            })
            .await?;
        Ok(session.id)
    }
}

fn initialization(e: Error) -> Error {
    match e {
        Error::Initialization(_) => e,
        other => Error::Initialization(other.to_string()),
    }
}

#[async_trait]
impl Agent for PersistentAgent {
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

    fn is_persistent(&self) -> bool {
        true
    }

    fn persistent_session_id(&self) -> Option<String> {
        self.session_id.clone()
    }

    fn attached(&self) -> bool {
        self.attachment_alive()
    }

    async fn initialize(&mut self, events: AgentEventSender) -> Result<()> {
        self.events = Some(events.clone());

        let session_id = match self.resolve_session().await {
            Ok(id) => id,
            Err(e) => {
                self.status.set(AgentStatus::Error);
                return Err(initialization(e));
            }
        };
        self.session_id = Some(session_id.clone());
        let _ = events.send(AgentEvent::SessionId(session_id.clone()));

        if let Err(e) = self.attach().await {
            self.status.set(AgentStatus::Error);
            if !self.reused {
                let _ = self.manager.kill_session(&session_id).await;
            }
            return Err(initialization(e));
        }

        self.status.set(AgentStatus::Running);
        tracing::info!(
            agent_id = %self.id,
            kind = %self.kind,
            session_id = %session_id,
            reused = self.reused,
            "Persistent agent running"
        );
        Ok(())
    }

    async fn send_input(&self, input: &str) -> Result<()> {
        if let Some(ref session_id) = self.session_id {
            self.manager.record_activity(session_id).await;
        }
        let written = {
            let guard = self
                .attachment
                .lock()
                .map_err(|_| Error::Internal("attachment lock poisoned".to_string()))?;
            match guard.as_ref() {
                Some(p) if p.is_alive() && self.status.get() == AgentStatus::Running => {
                    Some(p.write(input))
                }
                _ => None,
            }
        };
        if let Some(result) = written {
            return result;
        }
        self.send_to_session(input).await
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        *self.size.lock().unwrap_or_else(|p| p.into_inner()) = (cols, rows);
        if let Ok(guard) = self.attachment.lock() {
            if let Some(ref p) = *guard {
                if let Err(e) = p.resize(cols, rows) {
                    tracing::debug!(agent_id = %self.id, "Pty resize failed: {}", e);
                }
            }
        }
        if let Some(ref session_id) = self.session_id {
            self.manager.resize_session(session_id, cols, rows).await?;
        }
        Ok(())
    }

    async fn detach(&self) -> Result<()> {
        // Silence the outgoing attachment before killing it
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(process) = self.take_attachment() {
            process.kill();
        }
        if let Some(ref session_id) = self.session_id {
            if let Err(e) = self.manager.detach_session(session_id).await {
                tracing::warn!(agent_id = %self.id, "Failed to mark session detached: {}", e);
            }
        }
        tracing::info!(agent_id = %self.id, "Persistent agent detached");
        Ok(())
    }

    async fn reattach(&self) -> Result<()> {
        if self.status.get().is_terminal() {
            return Err(Error::NotRunning(format!("Agent {} is not running", self.id)));
        }
        if self.attachment_alive() {
            return Ok(());
        }
        self.attach().await
    }

    async fn terminate(&self) -> Result<()> {
        if let Some(process) = self.take_attachment() {
            process.kill();
        }
        if let Some(ref session_id) = self.session_id {
            match self.manager.kill_session(session_id).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => tracing::warn!(agent_id = %self.id, "Failed to kill session: {}", e),
            }
        }
        self.status.set(AgentStatus::Stopped);
        tracing::info!(agent_id = %self.id, "Persistent agent terminated");
        Ok(())
    }
}
