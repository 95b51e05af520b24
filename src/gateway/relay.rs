//! Agent output routing
//!
//! One task consumes the AgentManager event stream and routes every event to
//! the connection currently bound to the agent's logical session, or into the
//! [`SessionStore`] buffer when no connection is bound. Binding a connection
//! drains that buffer under the same lock, so replayed chunks always precede
//! live ones. A bound session is held in the store so it cannot time out
//! while a browser is watching it.

use crate::agent::{AgentEvent, AgentManager, TaggedAgentEvent};
use crate::session::SessionStore;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Events held per agent until it is routed to a session
const MAX_PENDING_EVENTS: usize = 256;

/// Exited, never-routed agents whose final events are still kept
const MAX_EXITED_UNROUTED: usize = 32;

/// What a bound connection receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// Output recorded while no connection was bound, in original order
    Replay(String),
    /// Live agent event
    Event(TaggedAgentEvent),
}

pub type ConnectionSender = mpsc::UnboundedSender<RelayMessage>;

struct Connection {
    id: u64,
    tx: ConnectionSender,
}

#[derive(Default)]
struct Routes {
    /// agent id -> logical session id
    agents: HashMap<String, String>,
    /// logical session id -> live connection
    connections: HashMap<String, Connection>,
    /// events for agents not routed yet
    pending: HashMap<String, VecDeque<AgentEvent>>,
    /// final events of agents that exited before being routed, oldest first
    exited: VecDeque<(String, VecDeque<AgentEvent>)>,
}

impl Routes {
    fn deliver(&mut self, store: &SessionStore, session_id: &str, tagged: TaggedAgentEvent) {
        let tagged = match self.connections.get(session_id) {
            Some(conn) => match conn.tx.send(RelayMessage::Event(tagged)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => {
                    self.connections.remove(session_id);
                    match message {
                        RelayMessage::Event(tagged) => tagged,
                        RelayMessage::Replay(_) => return,
                    }
                }
            },
            None => tagged,
        };

        match tagged.event {
            AgentEvent::Output(ref data) => {
                if !store.add_output(session_id, data) {
                    tracing::warn!(
                        session_id,
                        agent_id = %tagged.agent_id,
                        "Output for unknown logical session discarded"
                    );
                }
            }
            ref other => {
                tracing::debug!(
                    session_id,
                    event = ?other,
                    "No connection bound, event not buffered"
                );
            }
        }
    }
}

/// Routes agent events to connections or the session buffer
#[derive(Clone)]
pub struct OutputRelay {
    routes: Arc<Mutex<Routes>>,
    store: SessionStore,
    next_connection: Arc<AtomicU64>,
}

impl OutputRelay {
    pub fn new(store: SessionStore) -> Self {
        Self {
            routes: Arc::new(Mutex::new(Routes::default())),
            store,
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Consume `manager` events until it is dropped
    pub fn start(&self, manager: &AgentManager) -> JoinHandle<()> {
        let mut subscription = manager.subscribe();
        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(tagged) = subscription.events.recv().await {
                relay.dispatch(tagged);
            }
            tracing::debug!("Output relay stopped");
        })
    }

    /// Route one agent event
    pub fn dispatch(&self, tagged: TaggedAgentEvent) {
        let mut routes = self.lock();
        let Some(session_id) = routes.agents.get(&tagged.agent_id).cloned() else {
            let exited = matches!(tagged.event, AgentEvent::Exit(_));
            let queue = routes.pending.entry(tagged.agent_id.clone()).or_default();
            if queue.len() >= MAX_PENDING_EVENTS {
                queue.pop_front();
            }
            queue.push_back(tagged.event);
            if exited {
                let queue = routes.pending.remove(&tagged.agent_id).unwrap_or_default();
                if routes.exited.len() >= MAX_EXITED_UNROUTED {
                    routes.exited.pop_front();
                }
                routes.exited.push_back((tagged.agent_id, queue));
            }
            return;
        };
        self.route_locked(&mut routes, &session_id, tagged);
    }

    fn route_locked(&self, routes: &mut Routes, session_id: &str, tagged: TaggedAgentEvent) {
        match tagged.event {
            AgentEvent::SessionId(ref persistent_id) => {
                let persistent_id = persistent_id.clone();
                self.store.update_session(session_id, |data| {
                    data.persistent_session_id = Some(persistent_id);
                });
            }
            AgentEvent::Exit(_) => {
                routes.agents.remove(&tagged.agent_id);
                let agent_id = tagged.agent_id.clone();
                self.store.update_session(session_id, |data| {
                    if data.agent_id.as_deref() == Some(agent_id.as_str()) {
                        data.agent_id = None;
                    }
                });
            }
            _ => {}
        }
        routes.deliver(&self.store, session_id, tagged);
    }

    /// Attach an agent to a logical session, flushing events it emitted before
    pub fn route_agent(&self, agent_id: &str, session_id: &str) {
        let mut routes = self.lock();
        routes
            .agents
            .insert(agent_id.to_string(), session_id.to_string());
        let pending = match routes.pending.remove(agent_id) {
            Some(queue) => queue,
            None => match routes.exited.iter().position(|(id, _)| id == agent_id) {
                Some(index) => routes
                    .exited
                    .remove(index)
                    .map(|(_, queue)| queue)
                    .unwrap_or_default(),
                None => VecDeque::new(),
            },
        };
        for event in pending {
            self.route_locked(
                &mut routes,
                session_id,
                TaggedAgentEvent {
                    agent_id: agent_id.to_string(),
                    event,
                },
            );
        }
        tracing::debug!(agent_id, session_id, "Agent routed");
    }

    /// Bind a live connection to a logical session, replacing any previous one.
    ///
    /// `prelude` is sent first, then the buffered output in append order.
    /// Returns the connection id and the number of replayed chunks.
    pub fn bind_connection(
        &self,
        session_id: &str,
        tx: ConnectionSender,
        prelude: Option<String>,
    ) -> (u64, usize) {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let mut routes = self.lock();
        self.store.hold(session_id);

        if let Some(text) = prelude.filter(|t| !t.is_empty()) {
            let _ = tx.send(RelayMessage::Replay(text));
        }
        let buffered = self.store.get_and_clear_buffer(session_id);
        let replayed = buffered.len();
        for chunk in buffered {
            let _ = tx.send(RelayMessage::Replay(chunk));
        }

        if routes
            .connections
            .insert(session_id.to_string(), Connection { id, tx })
            .is_some()
        {
            tracing::info!(session_id, "Connection superseded by a newer one");
        }
        (id, replayed)
    }

    /// Unbind `connection_id`; false if a newer connection owns the session
    pub fn unbind_connection(&self, session_id: &str, connection_id: u64) -> bool {
        let mut routes = self.lock();
        let current = match routes.connections.get(session_id) {
            Some(conn) => conn.id == connection_id,
            None => true,
        };
        if current {
            routes.connections.remove(session_id);
            self.store.release(session_id);
        }
        current
    }

    /// Number of sessions with a live connection
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Drop every route into an evicted session
    pub fn forget_session(&self, session_id: &str) {
        let mut routes = self.lock();
        routes.connections.remove(session_id);
        routes.agents.retain(|_, s| s != session_id);
        self.store.release(session_id);
    }

    fn lock(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|p| p.into_inner())
    }
}
