//! Agent registry
//!
//! Owns every live [`Agent`], keyed by a generated id. Agents are constructed
//! and initialized before they are registered, so the registry never holds a
//! half-started agent. Each agent's events are relayed, tagged with its id, to
//! every subscriber; an `Exit` removes the agent from the registry first.

use super::types::{Agent, AgentEvent, AgentInfo, AgentOptions, TaggedAgentEvent};
use crate::error::{Error, Result};
use futures::future::join_all;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::{mpsc, RwLock};

/// Builds an agent of one type from an id and launch options
pub type AgentFactory =
    Arc<dyn Fn(String, AgentOptions) -> Result<Box<dyn Agent>> + Send + Sync>;

/// Wrap a closure as an [`AgentFactory`]
pub fn agent_factory<F>(f: F) -> AgentFactory
where
    F: Fn(String, AgentOptions) -> Result<Box<dyn Agent>> + Send + Sync + 'static,
{
    Arc::new(f)
}

type Subscribers = Arc<StdMutex<HashMap<u64, mpsc::UnboundedSender<TaggedAgentEvent>>>>;

/// A subscriber's handle on the tagged event stream
pub struct AgentSubscription {
    pub id: u64,
    pub events: mpsc::UnboundedReceiver<TaggedAgentEvent>,
}

pub struct AgentManager {
    factories: RwLock<HashMap<String, AgentFactory>>,
    agents: Arc<RwLock<HashMap<String, Arc<dyn Agent>>>>,
    subscribers: Subscribers,
    next_subscriber: AtomicU64,
}

impl AgentManager {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            agents: Arc::new(RwLock::new(HashMap::new())),
            subscribers: Arc::new(StdMutex::new(HashMap::new())),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Register (or replace) the factory for an agent type
    pub async fn register_agent_type(&self, name: &str, factory: AgentFactory) {
        let replaced = self
            .factories
            .write()
            .await
            .insert(name.to_string(), factory)
            .is_some();
        tracing::debug!(agent_type = name, replaced, "Registered agent type");
    }

    pub async fn agent_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    /// Construct, initialize and register an agent; returns its id
    pub async fn launch_agent(&self, agent_type: &str, options: AgentOptions) -> Result<String> {
        let factory = self
            .factories
            .read()
            .await
            .get(agent_type)
            .cloned()
            .ok_or_else(|| Error::UnknownAgentType(agent_type.to_string()))?;

        let agent_id = generate_agent_id(agent_type);
        tracing::info!(agent_id = %agent_id, agent_type, "Launching agent");

        let mut agent = factory(agent_id.clone(), options)?;
        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = agent.initialize(tx).await {
            tracing::warn!(agent_id = %agent_id, "Agent failed to initialize: {}", e);
            return Err(e);
        }

        let agent: Arc<dyn Agent> = Arc::from(agent);
        self.agents
            .write()
            .await
            .insert(agent_id.clone(), agent.clone());
        self.spawn_relay(agent_id.clone(), Arc::downgrade(&agent), rx);

        Ok(agent_id)
    }

    fn spawn_relay(
        &self,
        agent_id: String,
        agent: Weak<dyn Agent>,
        mut rx: mpsc::UnboundedReceiver<AgentEvent>,
    ) {
        let agents = self.agents.clone();
        let subscribers = self.subscribers.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let exited = matches!(event, AgentEvent::Exit(_));
                if exited {
                    let mut registry = agents.write().await;
                    let same = registry
                        .get(&agent_id)
                        .map(|current| Weak::ptr_eq(&Arc::downgrade(current), &agent))
                        .unwrap_or(false);
                    if same {
                        registry.remove(&agent_id);
                    }
                    tracing::info!(agent_id = %agent_id, ?event, "Agent exited");
                }

                publish(
                    &subscribers,
                    TaggedAgentEvent {
                        agent_id: agent_id.clone(),
                        event,
                    },
                );

                if exited {
                    break;
                }
            }
        });
    }

    /// Subscribe to tagged events from every agent
    pub fn subscribe(&self) -> AgentSubscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, tx);
        AgentSubscription { id, events: rx }
    }

    pub fn unsubscribe(&self, subscription_id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&subscription_id);
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    async fn require(&self, agent_id: &str) -> Result<Arc<dyn Agent>> {
        self.get_agent(agent_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("Agent {}", agent_id)))
    }

    pub async fn send_to_agent(&self, agent_id: &str, input: &str) -> Result<()> {
        self.require(agent_id).await?.send_input(input).await
    }

    /// Stop an agent (detach if persistent) and drop it from the registry
    pub async fn stop_agent(&self, agent_id: &str) -> Result<()> {
        let agent = self.require(agent_id).await?;
        let result = agent.stop().await;
        self.agents.write().await.remove(agent_id);
        tracing::info!(agent_id, "Agent stopped");
        result
    }

    /// Drop the local attachment but keep the agent registered
    pub async fn detach_agent(&self, agent_id: &str) -> Result<()> {
        self.require(agent_id).await?.detach().await
    }

    /// Re-establish an attachment. A failed reattach unregisters the agent.
    pub async fn reattach_agent(&self, agent_id: &str) -> Result<()> {
        let agent = self.require(agent_id).await?;
        if let Err(e) = agent.reattach().await {
            tracing::warn!(agent_id, "Reattach failed, dropping agent: {}", e);
            self.agents.write().await.remove(agent_id);
            let _ = agent.stop().await;
            return Err(e);
        }
        Ok(())
    }

    /// Kill the agent including any persistent session
    pub async fn terminate_agent(&self, agent_id: &str) -> Result<()> {
        let agent = self.require(agent_id).await?;
        let result = agent.terminate().await;
        self.agents.write().await.remove(agent_id);
        result
    }

    pub async fn resize_agent(&self, agent_id: &str, cols: u16, rows: u16) -> Result<()> {
        self.require(agent_id).await?.resize(cols, rows).await
    }

    pub async fn execute_command(&self, agent_id: &str, command: &str) -> Result<String> {
        self.require(agent_id).await?.execute(command).await
    }

    /// Stop every agent concurrently and wait for all of them
    pub async fn stop_all_agents(&self) {
        let agents: Vec<(String, Arc<dyn Agent>)> = self.agents.write().await.drain().collect();
        if agents.is_empty() {
            return;
        }
        tracing::info!(count = agents.len(), "Stopping all agents");

        let results = join_all(agents.iter().map(|(_, agent)| agent.stop())).await;
        for ((agent_id, _), result) in agents.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(agent_id = %agent_id, "Failed to stop agent: {}", e);
            }
        }
    }

    pub async fn get_active_agents(&self) -> Vec<AgentInfo> {
        let mut infos: Vec<AgentInfo> = self
            .agents
            .read()
            .await
            .values()
            .map(|agent| agent.info())
            .collect();
        infos.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        infos
    }
}

impl Default for AgentManager {
    fn default() -> Self {
        Self::new()
    }
}

fn publish(subscribers: &Subscribers, event: TaggedAgentEvent) {
    let mut subs = subscribers.lock().unwrap_or_else(|p| p.into_inner());
    subs.retain(|_, tx| tx.send(event.clone()).is_ok());
}

/// `{type}-{unix millis}-{6 random chars}`
fn generate_agent_id(agent_type: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect();
    format!(
        "{}-{}-{}",
        agent_type,
        chrono::Utc::now().timestamp_millis(),
        suffix
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::shell::ShellAgent;
    use crate::agent::types::{AgentEventSender, AgentKind, AgentStatus, StatusCell};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::time::Duration;

    struct FakeAgent {
        id: String,
        fail_init: bool,
        persistent: bool,
        status: StatusCell,
        events: StdMutex<Option<AgentEventSender>>,
        inputs: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Agent for FakeAgent {
        fn id(&self) -> &str {
            &self.id
        }
        fn kind(&self) -> AgentKind {
            AgentKind::Shell
        }
        fn status(&self) -> AgentStatus {
            self.status.get()
        }
        fn start_time(&self) -> DateTime<Utc> {
            Utc::now()
        }
        fn is_persistent(&self) -> bool {
            self.persistent
        }
        async fn initialize(&mut self, events: AgentEventSender) -> Result<()> {
            if self.fail_init {
                self.status.set(AgentStatus::Error);
                return Err(Error::Initialization("boom".to_string()));
            }
            self.status.set(AgentStatus::Running);
            *self.events.lock().unwrap() = Some(events);
            Ok(())
        }
        async fn send_input(&self, input: &str) -> Result<()> {
            self.inputs.lock().unwrap().push(input.to_string());
            if let Some(ref tx) = *self.events.lock().unwrap() {
                let _ = tx.send(AgentEvent::Output(format!("echo:{}", input)));
                if input == "exit" {
                    let _ = tx.send(AgentEvent::Exit(Some(0)));
                }
            }
            Ok(())
        }
        async fn resize(&self, _cols: u16, _rows: u16) -> Result<()> {
            Ok(())
        }
        async fn detach(&self) -> Result<()> {
            Ok(())
        }
        async fn reattach(&self) -> Result<()> {
            if self.status.get() == AgentStatus::Running {
                Ok(())
            } else {
                Err(Error::NotRunning(self.id.clone()))
            }
        }
        async fn terminate(&self) -> Result<()> {
            self.status.set(AgentStatus::Stopped);
            Ok(())
        }
    }

    fn fake_factory(fail_init: bool, persistent: bool) -> AgentFactory {
        agent_factory(move |id, _options| {
            Ok(Box::new(FakeAgent {
                id,
                fail_init,
                persistent,
                status: StatusCell::new(),
                events: StdMutex::new(None),
                inputs: Arc::new(StdMutex::new(Vec::new())),
            }) as Box<dyn Agent>)
        })
    }

    #[tokio::test]
    async fn test_failed_initialize_never_registers() {
        let manager = AgentManager::new();
        manager.register_agent_type("broken", fake_factory(true, false)).await;

        let err = manager
            .launch_agent("broken", AgentOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Initialization(_)));
        assert!(manager.get_active_agents().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let manager = AgentManager::new();
        let err = manager
            .launch_agent("nope", AgentOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownAgentType(_)));
    }

    #[tokio::test]
    async fn test_unknown_agent_is_not_found() {
        let manager = AgentManager::new();
        assert!(matches!(
            manager.send_to_agent("ghost", "x").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            manager.stop_agent("ghost").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            manager.resize_agent("ghost", 80, 24).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_agent_id_format() {
        let manager = AgentManager::new();
        manager.register_agent_type("shell", fake_factory(false, false)).await;
        let id = manager.launch_agent("shell", AgentOptions::default()).await.unwrap();

        let parts: Vec<&str> = id.rsplitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 6);
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2], "shell");
    }

    #[tokio::test]
    async fn test_register_overwrites() {
        let manager = AgentManager::new();
        manager.register_agent_type("shell", fake_factory(true, false)).await;
        manager.register_agent_type("shell", fake_factory(false, false)).await;
        assert!(manager.launch_agent("shell", AgentOptions::default()).await.is_ok());
        assert_eq!(manager.agent_types().await, vec!["shell"]);
    }

    #[tokio::test]
    async fn test_events_are_tagged_and_exit_unregisters() {
        let manager = AgentManager::new();
        manager.register_agent_type("shell", fake_factory(false, false)).await;
        let mut sub = manager.subscribe();
        let id = manager.launch_agent("shell", AgentOptions::default()).await.unwrap();

        manager.send_to_agent(&id, "ls").await.unwrap();
        manager.send_to_agent(&id, "exit").await.unwrap();

        let first = sub.events.recv().await.unwrap();
        assert_eq!(first.agent_id, id);
        assert_eq!(first.event, AgentEvent::Output("echo:ls".to_string()));
        let _ = sub.events.recv().await.unwrap();
        let exit = sub.events.recv().await.unwrap();
        assert_eq!(exit.event, AgentEvent::Exit(Some(0)));
        assert!(manager.get_agent(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let manager = AgentManager::new();
        manager.register_agent_type("shell", fake_factory(false, false)).await;
        let mut sub = manager.subscribe();
        manager.unsubscribe(sub.id);

        let id = manager.launch_agent("shell", AgentOptions::default()).await.unwrap();
        manager.send_to_agent(&id, "ls").await.unwrap();
        assert!(sub.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_all_agents_waits_for_every_agent() {
        let manager = AgentManager::new();
        manager.register_agent_type("shell", fake_factory(false, false)).await;
        let mut agents = Vec::new();
        for _ in 0..3 {
            let id = manager.launch_agent("shell", AgentOptions::default()).await.unwrap();
            agents.push(manager.get_agent(&id).await.unwrap());
        }

        manager.stop_all_agents().await;
        assert!(manager.get_active_agents().await.is_empty());
        assert!(agents.iter().all(|a| a.status() == AgentStatus::Stopped));
    }

    #[tokio::test]
    async fn test_detach_keeps_agent_registered() {
        let manager = AgentManager::new();
        manager.register_agent_type("persistent", fake_factory(false, true)).await;
        let id = manager.launch_agent("persistent", AgentOptions::default()).await.unwrap();

        manager.detach_agent(&id).await.unwrap();
        assert!(manager.get_agent(&id).await.is_some());
        manager.reattach_agent(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_reattach_unregisters() {
        let manager = AgentManager::new();
        manager.register_agent_type("shell", fake_factory(false, false)).await;
        let id = manager.launch_agent("shell", AgentOptions::default()).await.unwrap();
        manager.get_agent(&id).await.unwrap().terminate().await.unwrap();

        assert!(manager.reattach_agent(&id).await.is_err());
        assert!(manager.get_agent(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_execute_unsupported_for_plain_agents() {
        let manager = AgentManager::new();
        manager.register_agent_type("shell", fake_factory(false, false)).await;
        let id = manager.launch_agent("shell", AgentOptions::default()).await.unwrap();
        assert!(matches!(
            manager.execute_command(&id, "ls").await,
            Err(Error::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_shell_agent_end_to_end() {
        let manager = AgentManager::new();
        manager
            .register_agent_type(
                "shell",
                agent_factory(|id, options| {
                    Ok(Box::new(ShellAgent::local(
                        id,
                        "/bin/sh",
                        &options,
                        Duration::from_millis(100),
                    )) as Box<dyn Agent>)
                }),
            )
            .await;
        let mut sub = manager.subscribe();
        let id = manager.launch_agent("shell", AgentOptions::default()).await.unwrap();
        let agent = manager.get_agent(&id).await.unwrap();

        manager.send_to_agent(&id, "echo $((40+2))\n").await.unwrap();
        let mut seen = String::new();
        tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(tagged) = sub.events.recv().await {
                if let AgentEvent::Output(data) = tagged.event {
                    seen.push_str(&data);
                    if seen.contains("42") {
                        break;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert!(seen.contains("42"));

        manager.stop_agent(&id).await.unwrap();
        assert_eq!(agent.status(), AgentStatus::Stopped);
        assert!(manager.get_active_agents().await.iter().all(|a| a.id != id));
    }
}
