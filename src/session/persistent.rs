//! Persistent multiplexer sessions inside the sandbox
//!
//! Each [`PersistentSession`] is a detached `screen` session that outlives any
//! pty attached to it. Agents attach with the directive returned by
//! [`PersistentSessionManager::attach_to_session`] and drop the attachment on
//! browser disconnect, leaving the shell (and whatever runs in it) alive.
//!
//! A health-check task polls `screen -ls` and removes sessions whose process
//! has gone away, broadcasting [`PersistentSessionEvent::SessionDied`].

use super::screen;
use crate::config::PersistentConfig;
use crate::container::{CommandSpec, ContainerExec, ExecOutput, ExecRequest};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, RwLock};
use tokio::task::{AbortHandle, JoinHandle};

/// Persistent session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistentStatus {
    /// A pty is attached
    Active,
    /// Running with no attachment
    Detached,
    /// Process gone; never stored in the registry
    Dead,
}

/// Geometry and launch parameters of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub cols: u16,
    pub rows: u16,
    pub command: Option<String>,
    pub cwd: String,
}

/// A multiplexer session tracked by the manager
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentSession {
    pub id: String,
    pub session_name: String,
    pub status: PersistentStatus,
    pub metadata: SessionMetadata,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Options for [`PersistentSessionManager::create_session`]
#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    /// Typed into the shell after it starts
    pub command: Option<String>,
    pub cwd: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// Events broadcast by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistentSessionEvent {
    SessionDied {
        session_id: String,
        session_name: String,
    },
}

/// Owns persistent session records and the `screen` sessions behind them
pub struct PersistentSessionManager {
    exec: Arc<dyn ContainerExec>,
    config: PersistentConfig,
    default_cwd: String,
    sessions: RwLock<HashMap<String, PersistentSession>>,
    events: broadcast::Sender<PersistentSessionEvent>,
    initialized: AtomicBool,
    health_task: StdMutex<Option<AbortHandle>>,
}

impl PersistentSessionManager {
    pub fn new(
        exec: Arc<dyn ContainerExec>,
        config: PersistentConfig,
        default_cwd: String,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            exec,
            config,
            default_cwd,
            sessions: RwLock::new(HashMap::new()),
            events,
            initialized: AtomicBool::new(false),
            health_task: StdMutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PersistentSessionEvent> {
        self.events.subscribe()
    }

    /// Ensure `screen` is available in the sandbox, installing it once if not
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        if self.screen_available().await {
            tracing::info!(sandbox = %self.exec.describe(), "Multiplexer available");
            self.initialized.store(true, Ordering::Release);
            return Ok(());
        }

        tracing::warn!(
            sandbox = %self.exec.describe(),
            "screen not found in sandbox, installing"
        );
        let install = self
            .exec
            .exec(ExecRequest::shell(self.config.install_command.clone()).as_root())
            .await
            .map_err(|e| Error::Initialization(format!("Failed to install screen: {}", e)))?;
        if !install.success() {
            return Err(Error::Initialization(format!(
                "Failed to install screen: {}",
                install.stderr.trim()
            )));
        }

        if !self.screen_available().await {
            return Err(Error::Initialization(
                "screen still unavailable after installation".to_string(),
            ));
        }

        tracing::info!("Installed screen in sandbox");
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn screen_available(&self) -> bool {
        match self.exec.exec(ExecRequest::new(screen::version())).await {
            Ok(out) => out.success() || out.stdout.contains("Screen version"),
            Err(e) => {
                tracing::debug!("screen -v failed: {}", e);
                false
            }
        }
    }

    /// Start a new detached session running an interactive shell
    pub async fn create_session(&self, options: CreateSessionOptions) -> Result<PersistentSession> {
        self.initialize().await?;

        let id = uuid::Uuid::new_v4().to_string();
        let session_name = screen::session_name(&self.config.name_prefix, &id);
        let cwd = options.cwd.unwrap_or_else(|| self.default_cwd.clone());
        let metadata = SessionMetadata {
            cols: options.cols.unwrap_or(80),
            rows: options.rows.unwrap_or(24),
            command: options.command.clone(),
            cwd: cwd.clone(),
        };

        let created = self
            .exec
            .exec(
                ExecRequest::new(screen::create(
                    &session_name,
                    &self.config.shell,
                    self.config.scrollback_lines,
                ))
                .workdir(cwd),
            )
            .await
            .map_err(|e| Error::Initialization(format!("Failed to start screen: {}", e)))?;
        if !created.success() {
            return Err(Error::Initialization(format!(
                "Failed to start screen session {}: {}",
                session_name,
                created.stderr.trim()
            )));
        }

        self.wait_until_listed(&session_name).await?;

        let now = Utc::now();
        let session = PersistentSession {
            id: id.clone(),
            session_name: session_name.clone(),
            status: PersistentStatus::Detached,
            metadata,
            created_at: now,
            last_activity: now,
        };
        self.sessions.write().await.insert(id.clone(), session.clone());

        tracing::info!(
            session_id = %id,
            session_name = %session_name,
            "Created persistent session"
        );

        self.apply_geometry(&session_name, session.metadata.cols, session.metadata.rows)
            .await;

        if let Some(command) = options.command {
            self.send_to_session(&id, &format!("{}\n", command)).await?;
        }

        Ok(session)
    }

    async fn wait_until_listed(&self, session_name: &str) -> Result<()> {
        let attempts = self.config.create_retries.max(1);
        for attempt in 1..=attempts {
            if self.list_screens().await?.iter().any(|l| l.name == session_name) {
                return Ok(());
            }
            tracing::debug!(session_name, attempt, "Waiting for screen session to appear");
            tokio::time::sleep(self.config.create_retry_delay()).await;
        }
        Err(Error::Timeout(format!(
            "screen session {} did not appear after {} attempts",
            session_name, attempts
        )))
    }

    async fn list_screens(&self) -> Result<Vec<screen::ScreenListing>> {
        let out = self.exec.exec(ExecRequest::new(screen::list())).await?;
        Ok(screen::parse_list(&format!("{}{}", out.stdout, out.stderr)))
    }

    /// Invocation a pty must run to attach to the session
    pub async fn attach_to_session(&self, session_id: &str) -> Result<CommandSpec> {
        self.attach_via(session_id, self.exec.as_ref()).await
    }

    /// Like [`attach_to_session`](Self::attach_to_session), but the pty reaches
    /// the sandbox through `transport` (e.g. SSH instead of `docker exec`)
    pub async fn attach_via(
        &self,
        session_id: &str,
        transport: &dyn ContainerExec,
    ) -> Result<CommandSpec> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::NotFound(format!("Persistent session {}", session_id)))?;

        session.status = PersistentStatus::Active;
        session.last_activity = Utc::now();

        tracing::info!(
            session_id,
            session_name = %session.session_name,
            "Attaching to persistent session"
        );
        Ok(transport.interactive(
            &screen::attach(&session.session_name),
            Some(&session.metadata.cwd),
        ))
    }

    /// Inject input without an attached pty
    pub async fn send_to_session(&self, session_id: &str, input: &str) -> Result<()> {
        let session_name = self.touch(session_id).await?;
        let out = self
            .exec
            .exec(ExecRequest::new(screen::stuff(&session_name, input)))
            .await?;
        if !out.success() {
            return Err(Error::Container(format!(
                "Failed to send input to {}: {}",
                session_name,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Mark a session detached; the process keeps running
    pub async fn detach_session(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::NotFound(format!("Persistent session {}", session_id)))?;
        session.status = PersistentStatus::Detached;
        session.last_activity = Utc::now();
        tracing::info!(session_id, "Detached persistent session");
        Ok(())
    }

    /// Terminate the session process and forget the record
    pub async fn kill_session(&self, session_id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| Error::NotFound(format!("Persistent session {}", session_id)))?;

        match self
            .exec
            .exec(ExecRequest::new(screen::quit(&session.session_name)))
            .await
        {
            Ok(out) if out.success() => {
                tracing::info!(session_id, "Killed persistent session");
            }
            Ok(out) => {
                tracing::warn!(
                    session_id,
                    "screen quit reported failure (already dead?): {}",
                    out.stderr.trim()
                );
            }
            Err(e) => {
                tracing::warn!(session_id, "Failed to kill persistent session: {}", e);
            }
        }
        Ok(())
    }

    /// Last `lines` lines of scrollback
    pub async fn get_session_output(&self, session_id: &str, lines: usize) -> Result<String> {
        let session_name = self.session_name_of(session_id).await?;
        let path = format!(
            "/tmp/{}-hardcopy-{}.txt",
            session_name,
            uuid::Uuid::new_v4().simple()
        );

        let result = self.read_hardcopy(&session_name, &path).await;

        match self
            .exec
            .exec(ExecRequest::new(["rm", "-f", path.as_str()]))
            .await
        {
            Ok(out) if out.success() => {}
            Ok(out) => {
                tracing::warn!(path = %path, "Failed to remove hardcopy: {}", out.stderr.trim())
            }
            Err(e) => tracing::warn!(path = %path, "Failed to remove hardcopy: {}", e),
        }

        Ok(screen::tail_lines(&result?, lines))
    }

    async fn read_hardcopy(&self, session_name: &str, path: &str) -> Result<String> {
        let dump = self
            .exec
            .exec(ExecRequest::new(screen::hardcopy(session_name, path)))
            .await?;
        ensure_success(&dump, "hardcopy")?;

        let read = self.exec.exec(ExecRequest::new(["cat", path])).await?;
        ensure_success(&read, "read hardcopy")?;
        Ok(read.stdout)
    }

    /// Store new geometry and apply it when a pty is attached
    pub async fn resize_session(&self, session_id: &str, cols: u16, rows: u16) -> Result<()> {
        let (session_name, active) = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| Error::NotFound(format!("Persistent session {}", session_id)))?;
            session.metadata.cols = cols;
            session.metadata.rows = rows;
            (
                session.session_name.clone(),
                session.status == PersistentStatus::Active,
            )
        };

        if active {
            self.apply_geometry(&session_name, cols, rows).await;
        }
        Ok(())
    }

    async fn apply_geometry(&self, session_name: &str, cols: u16, rows: u16) {
        for args in screen::resize(session_name, cols, rows) {
            if let Err(e) = self.exec.exec(ExecRequest::new(args)).await {
                tracing::debug!(session_name, "Failed to resize screen session: {}", e);
            }
        }
    }

    /// Refresh `last_activity`, e.g. when output arrives
    pub async fn record_activity(&self, session_id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.last_activity = Utc::now();
        }
    }

    pub async fn list_sessions(&self) -> Vec<PersistentSession> {
        let mut sessions: Vec<PersistentSession> =
            self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub async fn get_session(&self, session_id: &str) -> Option<PersistentSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Poll the sandbox once and reconcile session status.
    ///
    /// Returns the ids of sessions that were found dead and removed.
    pub async fn check_health(&self) -> Vec<String> {
        // Only sessions registered before the poll can be judged by it
        let tracked: HashSet<String> = self.sessions.read().await.keys().cloned().collect();
        if tracked.is_empty() {
            return Vec::new();
        }

        let listing = match self.list_screens().await {
            Ok(listing) => listing,
            Err(e) => {
                tracing::warn!("Health check poll failed, assuming sessions dead: {}", e);
                Vec::new()
            }
        };

        let mut died = Vec::new();
        {
            let mut sessions = self.sessions.write().await;
            sessions.retain(|id, session| {
                if !tracked.contains(id) {
                    return true;
                }
                match listing.iter().find(|l| l.name == session.session_name) {
                    Some(entry) => {
                        session.status = if entry.attached {
                            PersistentStatus::Active
                        } else {
                            PersistentStatus::Detached
                        };
                        true
                    }
                    None => {
                        died.push((id.clone(), session.session_name.clone()));
                        false
                    }
                }
            });
        }

        for (session_id, session_name) in &died {
            tracing::warn!(
                session_id = %session_id,
                session_name = %session_name,
                "Persistent session died"
            );
            let _ = self.events.send(PersistentSessionEvent::SessionDied {
                session_id: session_id.clone(),
                session_name: session_name.clone(),
            });
        }

        died.into_iter().map(|(id, _)| id).collect()
    }

    /// Start the periodic health check
    pub fn start_health_check(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let period = self.config.health_check_interval();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(strong) = manager.upgrade() else {
                    break;
                };
                strong.check_health().await;
            }
        });

        let mut slot = self
            .health_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.replace(handle.abort_handle()) {
            previous.abort();
        }
        handle
    }

    /// Stop the health check. Sessions themselves are left running.
    pub fn destroy(&self) {
        let task = self
            .health_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
            tracing::info!("Stopped persistent session health check");
        }
    }

    async fn touch(&self, session_id: &str) -> Result<String> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::NotFound(format!("Persistent session {}", session_id)))?;
        session.last_activity = Utc::now();
        Ok(session.session_name.clone())
    }

    async fn session_name_of(&self, session_id: &str) -> Result<String> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.session_name.clone())
            .ok_or_else(|| Error::NotFound(format!("Persistent session {}", session_id)))
    }
}

fn ensure_success(out: &ExecOutput, what: &str) -> Result<()> {
    if out.success() {
        Ok(())
    } else {
        Err(Error::Container(format!("{} failed: {}", what, out.stderr.trim())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeScreen;
    use std::time::Duration;

    fn manager(fake: &Arc<FakeScreen>) -> Arc<PersistentSessionManager> {
        let config = PersistentConfig {
            create_retry_delay_ms: 1,
            health_check_interval_secs: 5,
            ..PersistentConfig::default()
        };
        Arc::new(PersistentSessionManager::new(
            fake.clone(),
            config,
            "/workspace".to_string(),
        ))
    }

    #[tokio::test]
    async fn test_initialize_installs_screen_once() {
        let fake = Arc::new(FakeScreen::default());
        let mgr = manager(&fake);

        mgr.initialize().await.unwrap();
        assert!(fake.state().installed);
        let calls = fake.state().calls.len();

        mgr.initialize().await.unwrap();
        assert_eq!(fake.state().calls.len(), calls);
    }

    #[tokio::test]
    async fn test_initialize_fails_when_install_fails() {
        let fake = Arc::new(FakeScreen::default());
        fake.state().install_fails = true;
        let mgr = manager(&fake);

        let err = mgr.initialize().await.unwrap_err();
        assert!(matches!(err, Error::Initialization(_)));
        let err = mgr.create_session(CreateSessionOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Initialization(_)));
        assert!(mgr.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_session_types_command_into_shell() {
        let fake = Arc::new(FakeScreen::installed());
        let mgr = manager(&fake);

        let session = mgr
            .create_session(CreateSessionOptions {
                command: Some("claude".to_string()),
                cols: Some(120),
                rows: Some(40),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(session.status, PersistentStatus::Detached);
        assert_eq!(session.metadata.cols, 120);
        assert_eq!(session.metadata.cwd, "/workspace");
        assert!(session.session_name.starts_with("cs-"));
        assert!(fake.state().sessions.contains_key(&session.session_name));
        assert_eq!(fake.stuffed_into(&session.session_name), vec!["claude\n"]);
    }

    #[tokio::test]
    async fn test_attach_detach_attach_keeps_one_session() {
        let fake = Arc::new(FakeScreen::installed());
        let mgr = manager(&fake);
        let session = mgr
            .create_session(CreateSessionOptions {
                command: Some("/bin/bash".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        mgr.attach_to_session(&session.id).await.unwrap();
        assert_eq!(
            mgr.get_session(&session.id).await.unwrap().status,
            PersistentStatus::Active
        );
        assert_eq!(mgr.list_sessions().await.len(), 1);

        mgr.detach_session(&session.id).await.unwrap();
        assert_eq!(
            mgr.get_session(&session.id).await.unwrap().status,
            PersistentStatus::Detached
        );
        assert_eq!(mgr.list_sessions().await.len(), 1);

        mgr.attach_to_session(&session.id).await.unwrap();
        let sessions = mgr.list_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, session.id);
        assert_eq!(fake.state().sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let fake = Arc::new(FakeScreen::installed());
        let mgr = manager(&fake);

        assert!(matches!(
            mgr.attach_to_session("nope").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            mgr.send_to_session("nope", "ls\n").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            mgr.kill_session("nope").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_kill_session_tolerates_dead_process() {
        let fake = Arc::new(FakeScreen::installed());
        let mgr = manager(&fake);
        let session = mgr.create_session(CreateSessionOptions::default()).await.unwrap();

        fake.kill_externally(&session.session_name);
        mgr.kill_session(&session.id).await.unwrap();
        assert!(mgr.get_session(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn test_session_output_and_cleanup() {
        let fake = Arc::new(FakeScreen::installed());
        let mgr = manager(&fake);
        let session = mgr.create_session(CreateSessionOptions::default()).await.unwrap();
        fake.state()
            .scrollback
            .insert(session.session_name.clone(), "a\nb\nc\nd\n\n".to_string());

        let output = mgr.get_session_output(&session.id, 2).await.unwrap();
        assert_eq!(output, "c\nd");
        assert!(fake.state().files.is_empty());
    }

    #[tokio::test]
    async fn test_session_output_cleans_up_on_error() {
        let fake = Arc::new(FakeScreen::installed());
        let mgr = manager(&fake);
        let session = mgr.create_session(CreateSessionOptions::default()).await.unwrap();
        fake.state().hardcopy_fails = true;

        let result = mgr.get_session_output(&session.id, 10).await;
        assert!(matches!(result, Err(Error::Container(_))));
        assert!(fake.state().files.is_empty());
    }

    #[tokio::test]
    async fn test_health_check_removes_dead_session() {
        let fake = Arc::new(FakeScreen::installed());
        let mgr = manager(&fake);
        let mut events = mgr.subscribe();
        let alive = mgr.create_session(CreateSessionOptions::default()).await.unwrap();
        let doomed = mgr.create_session(CreateSessionOptions::default()).await.unwrap();

        fake.kill_externally(&doomed.session_name);
        let died = mgr.check_health().await;

        assert_eq!(died, vec![doomed.id.clone()]);
        assert!(mgr.get_session(&doomed.id).await.is_none());
        assert!(mgr.get_session(&alive.id).await.is_some());
        assert_eq!(
            events.try_recv().unwrap(),
            PersistentSessionEvent::SessionDied {
                session_id: doomed.id.clone(),
                session_name: doomed.session_name.clone(),
            }
        );
    }

    #[tokio::test]
    async fn test_health_check_poll_failure_assumes_dead() {
        let fake = Arc::new(FakeScreen::installed());
        let mgr = manager(&fake);
        mgr.create_session(CreateSessionOptions::default()).await.unwrap();

        fake.state().list_fails = true;
        assert_eq!(mgr.check_health().await.len(), 1);
        assert!(mgr.list_sessions().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_health_check_fires_within_interval() {
        let fake = Arc::new(FakeScreen::installed());
        let mgr = manager(&fake);
        let mut events = mgr.subscribe();
        let session = mgr.create_session(CreateSessionOptions::default()).await.unwrap();
        let _task = mgr.start_health_check();

        fake.kill_externally(&session.session_name);
        let event = tokio::time::timeout(Duration::from_secs(6), events.recv())
            .await
            .expect("health check did not run")
            .unwrap();
        assert!(matches!(
            event,
            PersistentSessionEvent::SessionDied { ref session_id, .. } if *session_id == session.id
        ));

        mgr.destroy();
    }

    /// Holds the first armed `screen -ls` reply until released
    struct GatedList {
        inner: Arc<FakeScreen>,
        armed: AtomicBool,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl ContainerExec for GatedList {
        async fn exec(&self, request: ExecRequest) -> Result<ExecOutput> {
            let is_list = request.args == screen::list();
            let out = self.inner.exec(request).await;
            if is_list && self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            out
        }

        fn interactive(&self, argv: &[String], workdir: Option<&str>) -> CommandSpec {
            self.inner.interactive(argv, workdir)
        }

        fn describe(&self) -> String {
            "gated".to_string()
        }
    }

    #[tokio::test]
    async fn test_health_check_ignores_sessions_created_during_poll() {
        let fake = Arc::new(FakeScreen::installed());
        let gated = Arc::new(GatedList {
            inner: fake.clone(),
            armed: AtomicBool::new(false),
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let mgr = Arc::new(PersistentSessionManager::new(
            gated.clone(),
            PersistentConfig {
                create_retry_delay_ms: 1,
                ..PersistentConfig::default()
            },
            "/workspace".to_string(),
        ));
        let mut events = mgr.subscribe();
        let existing = mgr.create_session(CreateSessionOptions::default()).await.unwrap();

        gated.armed.store(true, Ordering::SeqCst);
        let poll = tokio::spawn({
            let mgr = mgr.clone();
            async move { mgr.check_health().await }
        });
        gated.entered.notified().await;

        let fresh = mgr.create_session(CreateSessionOptions::default()).await.unwrap();
        gated.release.notify_one();

        assert!(poll.await.unwrap().is_empty());
        assert!(mgr.get_session(&existing.id).await.is_some());
        assert!(mgr.get_session(&fresh.id).await.is_some());
        assert!(events.try_recv().is_err());

        // the next poll sees it
        assert!(mgr.check_health().await.is_empty());
        assert_eq!(mgr.list_sessions().await.len(), 2);
    }
}
