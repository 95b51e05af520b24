//! Gateway server: shared state, router and background tasks

use super::auth::{AllowAll, TokenAuth, WebSocketAuth};
use super::handler::api_router;
use super::relay::OutputRelay;
use super::websocket::ws_upgrade;
use crate::agent::{AgentManager, BuiltinAgents, RestartPolicy};
use crate::config::{ContainerBackend, SandboxConfig};
use crate::container::{ContainerExec, DockerExec, LocalExec, SshExec};
use crate::error::{Error, Result};
use crate::session::{
    PersistentSessionEvent, PersistentSessionManager, SessionStore, SessionStoreEvent,
};
use crate::state::{FileStateManager, StateManager};
use axum::{
    http::{header, Method},
    routing::get,
    Router,
};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Gateway server state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    /// Not started
    Stopped,
    /// Starting up
    Starting,
    /// Running
    Running,
    /// Shutting down
    ShuttingDown,
}

/// Per-connection behaviour taken from config
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Agent type for plain terminal connections and auto-launch on input
    pub default_agent: String,
    /// Agent type launched by `autoLaunchClaude=true`
    pub ai_agent: String,
    pub workdir: String,
    pub ping_interval: Duration,
    /// Scrollback lines replayed on reconnect when nothing was buffered
    pub replay_lines: usize,
    pub restart: RestartPolicy,
}

impl BridgeSettings {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            default_agent: config.agents.default_interactive.clone(),
            ai_agent: crate::agent::AgentKind::AiCli.as_str().to_string(),
            workdir: config.container.workdir.clone(),
            ping_interval: config.server.ping_interval(),
            replay_lines: config.sessions.replay_scrollback_lines,
            restart: RestartPolicy::from(&config.agents.restart),
        }
    }
}

/// Everything a request handler can reach
#[derive(Clone)]
pub struct AppState {
    pub agents: Arc<AgentManager>,
    pub persistent: Arc<PersistentSessionManager>,
    pub store: SessionStore,
    pub relay: OutputRelay,
    pub state_manager: Arc<dyn StateManager>,
    pub auth: Arc<dyn WebSocketAuth>,
    pub settings: BridgeSettings,
}

/// Build the HTTP + WebSocket application
pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .merge(api_router())
        .layer(TraceLayer::new_for_http())
        .layer(build_cors(cors_origins))
        .with_state(state)
}

fn build_cors(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        cors.allow_origin(parsed)
    }
}

/// Exec transport for the sandbox, plus the SSH transport when enabled
pub fn build_transports(
    config: &SandboxConfig,
) -> (Arc<dyn ContainerExec>, Option<Arc<dyn ContainerExec>>) {
    let timeout = Duration::from_secs(config.container.exec_timeout_secs.max(1));
    let exec: Arc<dyn ContainerExec> = match config.container.backend {
        ContainerBackend::Docker => Arc::new(DockerExec::new(&config.container)),
        ContainerBackend::Local => Arc::new(LocalExec::new(timeout)),
    };
    let ssh = config
        .ssh
        .enabled
        .then(|| Arc::new(SshExec::new(config.ssh.clone(), timeout)) as Arc<dyn ContainerExec>);
    (exec, ssh)
}

/// Claude Sandbox gateway
pub struct Gateway {
    config: SandboxConfig,
    app: AppState,
    state: Arc<RwLock<GatewayState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Wire every subsystem from configuration
    pub async fn from_config(config: SandboxConfig) -> Result<Self> {
        let (exec, ssh) = build_transports(&config);
        tracing::info!(sandbox = %exec.describe(), ssh = ssh.is_some(), "Using sandbox transport");

        let persistent = Arc::new(PersistentSessionManager::new(
            exec,
            config.persistent.clone(),
            config.container.workdir.clone(),
        ));

        let agents = Arc::new(AgentManager::new());
        BuiltinAgents {
            config: config.agents.clone(),
            workdir: config.container.workdir.clone(),
            persistent: persistent.clone(),
            ssh,
        }
        .register(&agents)
        .await;

        let store = SessionStore::new(config.sessions.timeout(), config.sessions.max_buffer_chars);
        let state_manager: Arc<dyn StateManager> =
            Arc::new(FileStateManager::open(config.storage.state_file.clone()).await?);
        let auth: Arc<dyn WebSocketAuth> = match config.server.auth_token {
            Some(ref token) if !token.is_empty() => Arc::new(TokenAuth::new(token.clone())),
            _ => {
                tracing::warn!(
                    "No auth token configured, WebSocket connections are not authenticated"
                );
                Arc::new(AllowAll)
            }
        };

        let app = AppState {
            agents,
            persistent,
            relay: OutputRelay::new(store.clone()),
            store,
            state_manager,
            auth,
            settings: BridgeSettings::from_config(&config),
        };
        Ok(Self::new(config, app))
    }

    /// Gateway over pre-built state
    pub fn new(config: SandboxConfig, app: AppState) -> Self {
        Self {
            config,
            app,
            state: Arc::new(RwLock::new(GatewayState::Stopped)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn app_state(&self) -> &AppState {
        &self.app
    }

    pub async fn state(&self) -> GatewayState {
        *self.state.read().await
    }

    pub fn router(&self) -> Router {
        build_router(self.app.clone(), &self.config.server.cors_origins)
    }

    /// Start background tasks: output relay, timeout reaper, health check
    ///
    /// Fails with [`Error::Initialization`] when the sandbox multiplexer is
    /// missing and cannot be installed.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != GatewayState::Stopped {
            return Err(Error::Internal("Gateway already running".to_string()));
        }
        *state = GatewayState::Starting;
        drop(state);

        tracing::info!("Starting Claude Sandbox gateway");

        if let Err(e) = self.app.persistent.initialize().await {
            tracing::error!("Failed to initialize persistent sessions: {}", e);
            *self.state.write().await = GatewayState::Stopped;
            return Err(e);
        }

        let tasks = vec![
            self.app.relay.start(&self.app.agents),
            spawn_timeout_reaper(&self.app),
            spawn_dead_session_watcher(&self.app),
            self.app.persistent.start_health_check(),
        ];
        self.lock_tasks().extend(tasks);

        *self.state.write().await = GatewayState::Running;
        Ok(())
    }

    /// Serve until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("Claude Sandbox gateway listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    /// Stop every agent and background task
    pub async fn stop(&self) {
        let mut state = self.state.write().await;
        if *state != GatewayState::Running {
            return;
        }
        *state = GatewayState::ShuttingDown;
        drop(state);

        tracing::info!("Stopping Claude Sandbox gateway");
        self.app.agents.stop_all_agents().await;
        self.app.persistent.destroy();
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }

        *self.state.write().await = GatewayState::Stopped;
        tracing::info!("Claude Sandbox gateway stopped");
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Terminate the agent and kill the persistent session of every logical
/// session that times out
fn spawn_timeout_reaper(app: &AppState) -> JoinHandle<()> {
    let mut events = app.store.subscribe();
    let agents = app.agents.clone();
    let persistent = app.persistent.clone();
    let relay = app.relay.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionStoreEvent::SessionTimeout {
                    session_id,
                    agent_id,
                    persistent_session_id,
                }) => {
                    relay.forget_session(&session_id);
                    if let Some(agent_id) = agent_id {
                        tracing::info!(
                            session_id = %session_id,
                            agent_id = %agent_id,
                            "Session timed out, terminating agent"
                        );
                        if let Err(e) = agents.terminate_agent(&agent_id).await {
                            tracing::debug!(agent_id = %agent_id, "Agent already gone: {}", e);
                        }
                    }
                    if let Some(pid) = persistent_session_id {
                        reap_persistent_session(&agents, &persistent, &session_id, &pid).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "Session timeout events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Kill a persistent session no live agent is using
pub(super) async fn reap_persistent_session(
    agents: &AgentManager,
    persistent: &PersistentSessionManager,
    session_id: &str,
    pid: &str,
) {
    let in_use = agents
        .get_active_agents()
        .await
        .iter()
        .any(|info| info.persistent_session_id.as_deref() == Some(pid));
    if in_use {
        return;
    }
    match persistent.kill_session(pid).await {
        Ok(()) => tracing::info!(
            session_id,
            persistent_session_id = pid,
            "Killed orphaned persistent session"
        ),
        Err(Error::NotFound(_)) => {}
        Err(e) => tracing::warn!(persistent_session_id = pid, "Failed to kill session: {}", e),
    }
}

/// Drop agents and store links that point at a persistent session which died
fn spawn_dead_session_watcher(app: &AppState) -> JoinHandle<()> {
    let mut events = app.persistent.subscribe();
    let agents = app.agents.clone();
    let store = app.store.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PersistentSessionEvent::SessionDied { session_id, session_name }) => {
                    for info in agents.get_active_agents().await {
                        if info.persistent_session_id.as_deref() != Some(session_id.as_str()) {
                            continue;
                        }
                        tracing::warn!(
                            agent_id = %info.id,
                            session_name = %session_name,
                            "Persistent session died, terminating agent"
                        );
                        if let Err(e) = agents.terminate_agent(&info.id).await {
                            tracing::debug!(agent_id = %info.id, "Agent already gone: {}", e);
                        }
                    }
                    for logical in store.unlink_persistent(&session_id) {
                        tracing::debug!(session_id = %logical, "Unlinked dead persistent session");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "Persistent session events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{agent_factory, Agent, AgentKind, AgentOptions, PersistentAgent, ShellAgent};
    use crate::testing::{app_state, FakeScreen};
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_gateway_lifecycle() {
        let dir = TempDir::new().unwrap();
        let (app, _fake) = app_state(dir.path()).await;
        let gateway = Gateway::new(SandboxConfig::default(), app);
        assert_eq!(gateway.state().await, GatewayState::Stopped);

        gateway.start().await.unwrap();
        assert_eq!(gateway.state().await, GatewayState::Running);
        assert!(gateway.start().await.is_err());

        gateway.stop().await;
        assert_eq!(gateway.state().await, GatewayState::Stopped);
    }

    #[tokio::test]
    async fn test_router_builds() {
        let dir = TempDir::new().unwrap();
        let (app, _fake) = app_state(dir.path()).await;
        let _router = build_router(app, &["http://localhost:5173".to_string()]);
    }

    #[test]
    fn test_transports_follow_config() {
        let mut config = SandboxConfig::default();
        let (exec, ssh) = build_transports(&config);
        assert!(exec.describe().contains("claude-sandbox"));
        assert!(ssh.is_none());

        config.container.backend = ContainerBackend::Local;
        config.ssh.enabled = true;
        let (exec, ssh) = build_transports(&config);
        assert_eq!(exec.describe(), "local");
        assert!(ssh.is_some());
    }

    #[tokio::test]
    async fn test_timeout_terminates_agent() {
        let dir = TempDir::new().unwrap();
        let (mut app, _fake) = app_state(dir.path()).await;
        app.store = SessionStore::new(Duration::from_millis(200), 1000);
        app.relay = OutputRelay::new(app.store.clone());
        app.agents
            .register_agent_type(
                "sh",
                agent_factory(|id, options| {
                    let grace = Duration::from_millis(50);
                    let agent = ShellAgent::local(id, "/bin/sh", &options, grace);
                    Ok(Box::new(agent) as Box<dyn Agent>)
                }),
            )
            .await;

        let gateway = Gateway::new(SandboxConfig::default(), app.clone());
        gateway.start().await.unwrap();

        let agent_id = app.agents.launch_agent("sh", AgentOptions::default()).await.unwrap();
        app.store
            .create_session("S1", Some(agent_id.clone()), HashMap::new());

        tokio::time::timeout(Duration::from_secs(10), async {
            while app.agents.get_agent(&agent_id).await.is_some() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();
        assert!(!app.store.contains("S1"));
        gateway.stop().await;
    }

    async fn register_persistent_shell(app: &AppState) {
        let persistent = app.persistent.clone();
        app.agents
            .register_agent_type(
                "persistent-shell",
                agent_factory(move |id, options| {
                    Ok(Box::new(PersistentAgent::new(
                        id,
                        AgentKind::PersistentShell,
                        persistent.clone(),
                        options,
                        Duration::from_millis(50),
                    )) as Box<dyn Agent>)
                }),
            )
            .await;
    }

    async fn wait_for<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_when_multiplexer_cannot_be_installed() {
        let dir = TempDir::new().unwrap();
        let (mut app, _fake) = app_state(dir.path()).await;
        let fake = Arc::new(FakeScreen::default());
        fake.state().install_fails = true;
        app.persistent = Arc::new(PersistentSessionManager::new(
            fake.clone(),
            crate::config::PersistentConfig::default(),
            "/workspace".to_string(),
        ));

        let gateway = Gateway::new(SandboxConfig::default(), app);
        let err = gateway.start().await.unwrap_err();
        assert!(matches!(err, Error::Initialization(_)));
        assert_eq!(gateway.state().await, GatewayState::Stopped);
        assert!(gateway.lock_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_kills_detached_persistent_session() {
        let dir = TempDir::new().unwrap();
        let (mut app, fake) = app_state(dir.path()).await;
        app.store = SessionStore::new(Duration::from_millis(200), 1000);
        app.relay = OutputRelay::new(app.store.clone());
        register_persistent_shell(&app).await;

        let gateway = Gateway::new(SandboxConfig::default(), app.clone());
        gateway.start().await.unwrap();

        let agent_id = app
            .agents
            .launch_agent("persistent-shell", AgentOptions::default())
            .await
            .unwrap();
        let pid = app
            .agents
            .get_agent(&agent_id)
            .await
            .unwrap()
            .persistent_session_id()
            .unwrap();
        app.store.create_session("S1", Some(agent_id.clone()), HashMap::new());
        app.store.update_session("S1", |data| {
            data.persistent_session_id = Some(pid.clone());
        });

        // STOP_AGENT: the agent detaches and leaves the registry
        app.agents.stop_agent(&agent_id).await.unwrap();
        app.store.update_session("S1", |data| data.agent_id = None);
        assert_eq!(fake.state().sessions.len(), 1);

        let persistent = app.persistent.clone();
        wait_for(|| {
            let persistent = persistent.clone();
            async move { persistent.list_sessions().await.is_empty() }
        })
        .await;
        assert!(!app.store.contains("S1"));
        assert!(fake.state().sessions.is_empty());
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_dead_persistent_session_drops_agent() {
        let dir = TempDir::new().unwrap();
        let (app, fake) = app_state(dir.path()).await;
        register_persistent_shell(&app).await;

        let gateway = Gateway::new(SandboxConfig::default(), app.clone());
        gateway.start().await.unwrap();

        let agent_id = app
            .agents
            .launch_agent("persistent-shell", AgentOptions::default())
            .await
            .unwrap();
        let pid = app
            .agents
            .get_agent(&agent_id)
            .await
            .unwrap()
            .persistent_session_id()
            .unwrap();
        app.store.create_session("S1", Some(agent_id.clone()), HashMap::new());
        app.store.update_session("S1", |data| {
            data.persistent_session_id = Some(pid.clone());
        });
        app.agents.detach_agent(&agent_id).await.unwrap();

        let name = app.persistent.get_session(&pid).await.unwrap().session_name;
        fake.kill_externally(&name);
        assert_eq!(app.persistent.check_health().await, vec![pid.clone()]);

        let agents = app.agents.clone();
        let id = agent_id.clone();
        wait_for(|| {
            let agents = agents.clone();
            let id = id.clone();
            async move { agents.get_agent(&id).await.is_none() }
        })
        .await;
        let store = app.store.clone();
        wait_for(|| {
            let store = store.clone();
            async move {
                store
                    .get_session("S1")
                    .is_some_and(|data| data.persistent_session_id.is_none())
            }
        })
        .await;
        assert!(app.store.get_session("S1").unwrap().agent_id.is_none());
        gateway.stop().await;
    }
}
