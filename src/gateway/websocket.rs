//! Browser terminal connection
//!
//! One task per socket. The task owns the socket sink; agent output reaches it
//! through the [`OutputRelay`] channel and is written from the same select loop
//! that handles client messages, keepalive and scheduled relaunches.

use super::protocol::{ClientMessage, ServerMessage};
use super::relay::{OutputRelay, RelayMessage};
use super::server::{reap_persistent_session, AppState};
use crate::agent::{AgentEvent, AgentKind, AgentOptions, TaggedAgentEvent};
use crate::error::{Error, Result};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, Uri},
    response::IntoResponse,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;

type WsSink = SplitSink<WebSocket, Message>;

/// Handshake query parameters
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    /// Logical session to resume; a new one is created when absent
    pub session_id: Option<String>,
    /// Launch the AI CLI right away instead of waiting for input
    pub auto_launch_claude: Option<String>,
}

impl ConnectParams {
    fn auto_launch(&self) -> bool {
        matches!(self.auto_launch_claude.as_deref(), Some("true") | Some("1"))
    }
}

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Established,
    AgentLaunching,
    AgentActive,
    DetachedOnClose,
    Stopped,
}

/// WebSocket upgrade handler
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    uri: Uri,
    headers: HeaderMap,
) -> impl IntoResponse {
    let auth = state.auth.validate(&uri, &headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, params, auth))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    params: ConnectParams,
    auth: Result<()>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    if let Err(e) = auth {
        tracing::warn!("WebSocket rejected: {}", e);
        let reason = match e {
            Error::Auth(reason) => reason,
            other => other.to_string(),
        };
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: reason.into(),
            })))
            .await;
        return;
    }

    let session_id = params
        .session_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    tracing::info!(session_id = %session_id, "WebSocket connected");

    let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
    let mut conn = Connection::new(state.clone(), session_id.clone(), params.auto_launch());

    if !send(&mut ws_tx, &ServerMessage::Connected { session_id: session_id.clone() }).await {
        return;
    }
    conn.establish(&mut ws_tx, relay_tx).await;

    let period = state.settings.ping_interval;
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);
    let heartbeat_timeout = period * 2;
    let mut last_recv = Instant::now();

    loop {
        let restart_at = conn.restart_deadline();
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_recv = Instant::now();
                        if !conn.handle_text(&mut ws_tx, &text).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_recv = Instant::now();
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {
                        last_recv = Instant::now();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(session_id = %session_id, ?frame, "Client closed");
                        break;
                    }
                    None => break,
                    Some(Err(e)) => {
                        tracing::warn!(session_id = %session_id, "WebSocket error: {}", e);
                        break;
                    }
                }
            }
            relayed = relay_rx.recv() => {
                match relayed {
                    Some(message) => {
                        if !conn.handle_relay(&mut ws_tx, message).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping.tick() => {
                if last_recv.elapsed() > heartbeat_timeout {
                    tracing::info!(session_id = %session_id, "Heartbeat timeout, closing");
                    break;
                }
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            _ = sleep_until(restart_at) => {
                if !conn.relaunch(&mut ws_tx).await {
                    break;
                }
            }
        }
    }

    let phase = conn.close().await;
    tracing::info!(session_id = %session_id, ?phase, "WebSocket disconnected");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Serialize and send; false once the socket is gone
async fn send(ws_tx: &mut WsSink, message: &ServerMessage) -> bool {
    ws_tx.send(Message::Text(message.to_text())).await.is_ok()
}

struct ActiveAgent {
    id: String,
    kind: String,
    options: AgentOptions,
}

struct PendingRestart {
    at: Instant,
    kind: String,
    options: AgentOptions,
}

struct Connection {
    state: AppState,
    session_id: String,
    connection_id: Option<u64>,
    phase: ConnectionPhase,
    auto_launch_ai: bool,
    agent: Option<ActiveAgent>,
    work_session_id: Option<String>,
    size: Option<(u16, u16)>,
    restart_attempts: u32,
    restart: Option<PendingRestart>,
    line: CommandLine,
}

impl Connection {
    fn new(state: AppState, session_id: String, auto_launch_ai: bool) -> Self {
        Self {
            state,
            session_id,
            connection_id: None,
            phase: ConnectionPhase::Established,
            auto_launch_ai,
            agent: None,
            work_session_id: None,
            size: None,
            restart_attempts: 0,
            restart: None,
            line: CommandLine::default(),
        }
    }

    fn relay(&self) -> &OutputRelay {
        &self.state.relay
    }

    fn restart_deadline(&self) -> Option<Instant> {
        self.restart.as_ref().map(|r| r.at)
    }

    /// Resume the logical session if possible, otherwise start fresh
    async fn establish(
        &mut self,
        ws_tx: &mut WsSink,
        relay_tx: mpsc::UnboundedSender<RelayMessage>,
    ) {
        if let Some(prelude) = self.try_reconnect(ws_tx).await {
            let (id, replayed) = self.relay().bind_connection(&self.session_id, relay_tx, prelude);
            self.connection_id = Some(id);
            tracing::info!(session_id = %self.session_id, replayed, "Session resumed");
            return;
        }

        let (id, _) = self.relay().bind_connection(&self.session_id, relay_tx, None);
        self.connection_id = Some(id);

        if self.auto_launch_ai {
            let kind = self.state.settings.ai_agent.clone();
            if let Err(e) = self.launch(ws_tx, &kind, AgentOptions::default()).await {
                send(ws_tx, &ServerMessage::error(&e)).await;
            }
        }
    }

    /// Reattach to the session's agent. `Some(prelude)` on success.
    async fn try_reconnect(&mut self, ws_tx: &mut WsSink) -> Option<Option<String>> {
        let data = self.state.store.get_session(&self.session_id)?;
        let Some(agent_id) = data.agent_id.clone() else {
            tracing::debug!(
                session_id = %self.session_id,
                "Known session without agent, starting fresh"
            );
            return None;
        };

        let agent = match self.state.agents.get_agent(&agent_id).await {
            Some(agent) => agent,
            None => {
                tracing::info!(
                    session_id = %self.session_id,
                    agent_id = %agent_id,
                    "Agent gone, starting fresh"
                );
                self.state.store.delete_session(&self.session_id);
                return None;
            }
        };

        let persistent_id = agent
            .persistent_session_id()
            .or_else(|| data.persistent_session_id.clone());
        let prelude = match persistent_id {
            Some(ref pid) if data.buffered_chunks == 0 && agent.is_persistent() => {
                match self
                    .state
                    .persistent
                    .get_session_output(pid, self.state.settings.replay_lines)
                    .await
                {
                    Ok(text) => Some(text),
                    Err(e) => {
                        tracing::warn!(
                            session_id = %self.session_id,
                            "Scrollback replay failed: {}",
                            e
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        if let Err(e) = self.state.agents.reattach_agent(&agent_id).await {
            tracing::warn!(
                session_id = %self.session_id,
                agent_id = %agent_id,
                "Reattach failed: {}",
                e
            );
            self.state.store.delete_session(&self.session_id);
            return None;
        }

        let kind = agent.kind().as_str().to_string();
        self.agent = Some(ActiveAgent {
            id: agent_id.clone(),
            kind,
            options: AgentOptions {
                persistent_session_id: persistent_id.clone(),
                ..AgentOptions::default()
            },
        });
        self.work_session_id = data
            .metadata
            .get("workSessionId")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        self.phase = ConnectionPhase::AgentActive;

        send(
            ws_tx,
            &ServerMessage::Reconnected {
                session_id: self.session_id.clone(),
                agent_id,
                persistent_session_id: persistent_id,
            },
        )
        .await;
        Some(prelude)
    }

    /// Launch an agent for this session and route its output here
    async fn launch(
        &mut self,
        ws_tx: &mut WsSink,
        kind: &str,
        mut options: AgentOptions,
    ) -> Result<String> {
        if let Some(previous) = self.agent.take() {
            if let Err(e) = self.state.agents.stop_agent(&previous.id).await {
                tracing::debug!(agent_id = %previous.id, "Previous agent already gone: {}", e);
            }
        }
        self.settle_stored_session(kind, &mut options).await;
        if options.cols.is_none() && options.rows.is_none() {
            if let Some((cols, rows)) = self.size {
                options.cols = Some(cols);
                options.rows = Some(rows);
            }
        }

        self.phase = ConnectionPhase::AgentLaunching;
        let workdir = options
            .cwd
            .clone()
            .unwrap_or_else(|| self.state.settings.workdir.clone());
        if self.work_session_id.is_none() {
            match self.state.state_manager.create_session(&workdir, kind).await {
                Ok(id) => self.work_session_id = Some(id),
                Err(e) => tracing::warn!(
                    session_id = %self.session_id,
                    "Failed to record work session: {}",
                    e
                ),
            }
        }

        let agent_id = match self.state.agents.launch_agent(kind, options.clone()).await {
            Ok(id) => id,
            Err(e) => {
                self.phase = ConnectionPhase::Established;
                return Err(e);
            }
        };
        let persistent_id = self
            .state
            .agents
            .get_agent(&agent_id)
            .await
            .and_then(|a| a.persistent_session_id());

        let created = if self.state.store.contains(&self.session_id) {
            let id = agent_id.clone();
            let pid = persistent_id.clone();
            self.state.store.update_session(&self.session_id, |data| {
                data.agent_id = Some(id);
                data.persistent_session_id = pid;
                data.metadata.insert("agentType".to_string(), serde_json::json!(kind));
            });
            false
        } else {
            let mut metadata = HashMap::new();
            metadata.insert("agentType".to_string(), serde_json::json!(kind));
            if let Some(ref work) = self.work_session_id {
                metadata.insert("workSessionId".to_string(), serde_json::json!(work));
            }
            self.state
                .store
                .create_session(&self.session_id, Some(agent_id.clone()), metadata);
            if let Some(ref pid) = persistent_id {
                let pid = pid.clone();
                self.state.store.update_session(&self.session_id, |data| {
                    data.persistent_session_id = Some(pid);
                });
            }
            true
        };

        if created {
            send(
                ws_tx,
                &ServerMessage::SessionCreated {
                    session_id: self.session_id.clone(),
                    work_session_id: self.work_session_id.clone(),
                },
            )
            .await;
        }
        send(
            ws_tx,
            &ServerMessage::AgentLaunched {
                agent_id: agent_id.clone(),
                agent_type: kind.to_string(),
                persistent_session_id: persistent_id.clone(),
            },
        )
        .await;

        self.relay().route_agent(&agent_id, &self.session_id);
        self.agent = Some(ActiveAgent {
            id: agent_id.clone(),
            kind: kind.to_string(),
            options: AgentOptions {
                persistent_session_id: persistent_id,
                ..options
            },
        });
        self.phase = ConnectionPhase::AgentActive;
        tracing::info!(
            session_id = %self.session_id,
            agent_id = %agent_id,
            agent_type = kind,
            "Agent bound to session"
        );
        Ok(agent_id)
    }

    /// Resume the session's persistent session when relaunching the same
    /// kind; kill it when it is being replaced
    async fn settle_stored_session(&self, kind: &str, options: &mut AgentOptions) {
        let Some(data) = self.state.store.get_session(&self.session_id) else {
            return;
        };
        let Some(pid) = data.persistent_session_id else {
            return;
        };
        if options.persistent_session_id.as_deref() == Some(pid.as_str()) {
            return;
        }

        let same_kind = data.metadata.get("agentType").and_then(|v| v.as_str()) == Some(kind);
        if same_kind
            && options.persistent_session_id.is_none()
            && self.state.persistent.get_session(&pid).await.is_some()
        {
            tracing::debug!(
                session_id = %self.session_id,
                persistent_session_id = %pid,
                "Relaunching into existing persistent session"
            );
            options.persistent_session_id = Some(pid);
            return;
        }

        reap_persistent_session(
            &self.state.agents,
            &self.state.persistent,
            &self.session_id,
            &pid,
        )
        .await;
    }

    /// Returns false when the socket is gone
    async fn handle_text(&mut self, ws_tx: &mut WsSink, text: &str) -> bool {
        let message = match ClientMessage::parse(text) {
            Ok(m) => m,
            Err(e) => {
                let preview: String = text.chars().take(200).collect();
                tracing::warn!(
                    session_id = %self.session_id,
                    "Invalid client message: {} (raw: {})",
                    e,
                    preview
                );
                return send(ws_tx, &ServerMessage::error(&e)).await;
            }
        };

        let name = message.name();
        match self.handle_message(ws_tx, message).await {
            Ok(Some(reply)) => send(ws_tx, &reply).await,
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    message = name,
                    "Request failed: {}",
                    e
                );
                send(ws_tx, &ServerMessage::error(&e)).await
            }
        }
    }

    async fn handle_message(
        &mut self,
        ws_tx: &mut WsSink,
        message: ClientMessage,
    ) -> Result<Option<ServerMessage>> {
        match message {
            ClientMessage::CreateSession(payload) => {
                let workdir = payload
                    .workspace_path
                    .unwrap_or_else(|| self.state.settings.workdir.clone());
                let kind = payload
                    .agent_type
                    .unwrap_or_else(|| self.state.settings.default_agent.clone());
                let id = self.state.state_manager.create_session(&workdir, &kind).await?;
                self.work_session_id = Some(id.clone());
                Ok(Some(ServerMessage::SessionCreated {
                    session_id: self.session_id.clone(),
                    work_session_id: Some(id),
                }))
            }

            ClientMessage::LaunchAgent(payload) => {
                let kind = payload
                    .agent_type
                    .unwrap_or_else(|| self.state.settings.default_agent.clone());
                self.restart_attempts = 0;
                self.restart = None;
                self.launch(ws_tx, &kind, payload.options).await?;
                Ok(None)
            }

            ClientMessage::SendInput(payload) => {
                if self.agent.is_none() {
                    if self.auto_launch_ai {
                        return Err(Error::NotRunning("No active agent".to_string()));
                    }
                    let kind = self.state.settings.default_agent.clone();
                    self.launch(ws_tx, &kind, AgentOptions::default()).await?;
                }
                let agent_id = match self.agent {
                    Some(ref agent) => agent.id.clone(),
                    None => return Err(Error::NotRunning("No active agent".to_string())),
                };
                self.state.agents.send_to_agent(&agent_id, &payload.input).await?;

                let commands = self.line.feed(&payload.input);
                if let Some(ref work) = self.work_session_id {
                    for command in commands {
                        if let Err(e) = self
                            .state
                            .state_manager
                            .log_command(work, &command, None, None)
                            .await
                        {
                            tracing::debug!(work_session_id = %work, "Command not logged: {}", e);
                        }
                    }
                }
                Ok(None)
            }

            ClientMessage::StopAgent(payload) => {
                let current = self.agent.as_ref().map(|a| a.id.clone());
                let agent_id = payload
                    .agent_id
                    .or_else(|| current.clone())
                    .ok_or_else(|| Error::NotRunning("No active agent".to_string()))?;

                self.state.agents.stop_agent(&agent_id).await?;
                if current.as_deref() == Some(agent_id.as_str()) {
                    self.agent = None;
                    self.restart = None;
                    self.phase = ConnectionPhase::Established;
                    self.state.store.update_session(&self.session_id, |data| {
                        data.agent_id = None;
                    });
                }
                Ok(Some(ServerMessage::AgentStopped { agent_id }))
            }

            ClientMessage::GetState => Ok(Some(ServerMessage::StateUpdate {
                state: self.state.state_manager.current_state().await?,
                agents: self.state.agents.get_active_agents().await,
                persistent_sessions: self.state.persistent.list_sessions().await,
            })),

            ClientMessage::CreateSnapshot(payload) => Ok(Some(ServerMessage::SnapshotCreated {
                snapshot: self.state.state_manager.create_snapshot(payload.description).await?,
            })),

            ClientMessage::Resize(size) => {
                self.size = Some((size.cols, size.rows));
                if let Some(ref mut agent) = self.agent {
                    agent.options.cols = Some(size.cols);
                    agent.options.rows = Some(size.rows);
                    if let Err(e) = self
                        .state
                        .agents
                        .resize_agent(&agent.id, size.cols, size.rows)
                        .await
                    {
                        tracing::warn!(agent_id = %agent.id, "Resize failed: {}", e);
                    }
                }
                Ok(None)
            }
        }
    }

    /// Returns false when the socket is gone
    async fn handle_relay(&mut self, ws_tx: &mut WsSink, message: RelayMessage) -> bool {
        let TaggedAgentEvent { agent_id, event } = match message {
            RelayMessage::Replay(data) => {
                let agent_id = self.agent.as_ref().map(|a| a.id.clone()).unwrap_or_default();
                return send(ws_tx, &ServerMessage::Output { agent_id, data }).await;
            }
            RelayMessage::Event(tagged) => tagged,
        };

        match event {
            AgentEvent::Output(data) => {
                send(ws_tx, &ServerMessage::Output { agent_id, data }).await
            }
            AgentEvent::Error(message) => {
                send(
                    ws_tx,
                    &ServerMessage::Error {
                        code: "agent_error".to_string(),
                        message,
                    },
                )
                .await
            }
            AgentEvent::SessionId(persistent_session_id) => {
                send(
                    ws_tx,
                    &ServerMessage::TerminalSessionId {
                        agent_id,
                        persistent_session_id,
                    },
                )
                .await
            }
            AgentEvent::Exit(code) => {
                let exit = ServerMessage::AgentExit {
                    agent_id: agent_id.clone(),
                    code,
                };
                let alive = send(ws_tx, &exit).await;
                self.on_agent_exit(&agent_id, code);
                alive
            }
        }
    }

    fn on_agent_exit(&mut self, agent_id: &str, code: Option<i32>) {
        if self.agent.as_ref().map(|a| a.id.as_str()) != Some(agent_id) {
            return;
        }
        let Some(agent) = self.agent.take() else {
            return;
        };
        self.phase = ConnectionPhase::Established;

        let remote = agent
            .kind
            .parse::<AgentKind>()
            .map(|k| k.is_remote_shell())
            .unwrap_or(false);
        if !remote {
            return;
        }

        self.restart_attempts += 1;
        match self.state.settings.restart.delay_for(self.restart_attempts) {
            Some(delay) => {
                tracing::info!(
                    session_id = %self.session_id,
                    agent_type = %agent.kind,
                    attempt = self.restart_attempts,
                    ?code,
                    "Scheduling relaunch in {:?}",
                    delay
                );
                self.restart = Some(PendingRestart {
                    at: Instant::now() + delay,
                    kind: agent.kind,
                    options: agent.options,
                });
            }
            None => {
                tracing::warn!(
                    session_id = %self.session_id,
                    agent_type = %agent.kind,
                    "Relaunch attempts exhausted"
                );
            }
        }
    }

    /// Returns false when the socket is gone
    async fn relaunch(&mut self, ws_tx: &mut WsSink) -> bool {
        let Some(pending) = self.restart.take() else {
            return true;
        };
        match self.launch(ws_tx, &pending.kind, pending.options).await {
            Ok(agent_id) => {
                tracing::info!(
                    session_id = %self.session_id,
                    agent_id = %agent_id,
                    "Agent relaunched"
                );
                true
            }
            Err(e) => send(ws_tx, &ServerMessage::error(&e)).await,
        }
    }

    /// Detach (session tracked) or stop the agent
    async fn close(&mut self) -> ConnectionPhase {
        let current = match self.connection_id {
            Some(id) => self.relay().unbind_connection(&self.session_id, id),
            None => true,
        };
        let Some(agent) = self.agent.take() else {
            return self.phase;
        };
        if !current {
            tracing::debug!(
                session_id = %self.session_id,
                "Superseded connection closing, agent left alone"
            );
            return self.phase;
        }

        if self.state.store.contains(&self.session_id) {
            if let Err(e) = self.state.agents.detach_agent(&agent.id).await {
                tracing::warn!(agent_id = %agent.id, "Detach failed: {}", e);
            }
            self.phase = ConnectionPhase::DetachedOnClose;
        } else {
            if let Err(e) = self.state.agents.stop_agent(&agent.id).await {
                tracing::debug!(agent_id = %agent.id, "Stop on close: {}", e);
            }
            self.phase = ConnectionPhase::Stopped;
        }
        self.phase
    }
}

/// Reassembles typed keystrokes into submitted command lines
#[derive(Debug, Default)]
struct CommandLine {
    current: String,
    in_escape: bool,
}

impl CommandLine {
    /// Feed raw terminal input; returns every line completed by it
    fn feed(&mut self, input: &str) -> Vec<String> {
        let mut done = Vec::new();
        for c in input.chars() {
            if self.in_escape {
                if c.is_ascii_alphabetic() || c == '~' {
                    self.in_escape = false;
                }
                continue;
            }
            match c {
                '\r' | '\n' => {
                    let line = self.current.trim().to_string();
                    self.current.clear();
                    if !line.is_empty() {
                        done.push(line);
                    }
                }
                '\u{7f}' | '\u{8}' => {
                    self.current.pop();
                }
                '\u{3}' | '\u{15}' => self.current.clear(),
                '\u{1b}' => self.in_escape = true,
                c if c.is_control() => {}
                c => self.current.push(c),
            }
        }
        done
    }
}
