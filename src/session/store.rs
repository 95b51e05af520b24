//! Logical session store
//!
//! Buffers agent output while no browser is attached and evicts sessions
//! that stay idle past the inactivity timeout. Each session carries its own
//! timer; any read or write rearms it. A session held by a live connection
//! has no timer at all until it is released. On expiry the record is removed
//! and a single [`SessionStoreEvent::SessionTimeout`] is broadcast so the
//! owner of the agent can stop the orphaned process.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Default inactivity timeout (30 minutes)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default buffer cap in characters
pub const DEFAULT_MAX_BUFFER_CHARS: usize = 100_000;

/// Snapshot of a logical session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionData {
    pub session_id: String,
    /// Agent currently associated with this session
    pub agent_id: Option<String>,
    /// Persistent multiplexer session backing the agent, if any
    pub persistent_session_id: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    /// Chunks waiting for the next attached client
    pub buffered_chunks: usize,
    /// Characters waiting for the next attached client
    pub buffered_chars: usize,
}

/// Events emitted by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStoreEvent {
    /// Session expired after the inactivity timeout
    SessionTimeout {
        session_id: String,
        agent_id: Option<String>,
        persistent_session_id: Option<String>,
    },
}

struct Entry {
    data: SessionData,
    buffer: VecDeque<String>,
    buffered_chars: usize,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Entry {
    fn snapshot(&self) -> SessionData {
        let mut data = self.data.clone();
        data.buffered_chunks = self.buffer.len();
        data.buffered_chars = self.buffered_chars;
        data
    }
}

struct Inner {
    sessions: Mutex<HashMap<String, Entry>>,
    /// Sessions with a live connection; locked after `sessions`
    held: Mutex<HashSet<String>>,
    timeout: Duration,
    max_buffer_chars: usize,
    events: broadcast::Sender<SessionStoreEvent>,
}

/// In-memory logical session store with bounded output buffers
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl SessionStore {
    /// Create a store with the given inactivity timeout and buffer cap
    pub fn new(timeout: Duration, max_buffer_chars: usize) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                held: Mutex::new(HashSet::new()),
                timeout,
                max_buffer_chars: max_buffer_chars.max(1),
                events,
            }),
        }
    }

    /// Subscribe to timeout events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionStoreEvent> {
        self.inner.events.subscribe()
    }

    /// Insert a session, overwriting any existing record with the same id
    pub fn create_session(
        &self,
        session_id: &str,
        agent_id: Option<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> SessionData {
        let now = Utc::now();
        let mut sessions = self.lock();
        if let Some(old) = sessions.remove(session_id) {
            if let Some(timer) = old.timer {
                timer.abort();
            }
            tracing::debug!(session_id, "Overwriting existing logical session");
        }

        let mut entry = Entry {
            data: SessionData {
                session_id: session_id.to_string(),
                agent_id,
                persistent_session_id: None,
                metadata,
                created_at: now,
                last_accessed: now,
                buffered_chunks: 0,
                buffered_chars: 0,
            },
            buffer: VecDeque::new(),
            buffered_chars: 0,
            generation: 0,
            timer: None,
        };
        self.arm(session_id, &mut entry);
        let snapshot = entry.snapshot();
        sessions.insert(session_id.to_string(), entry);

        tracing::info!(session_id, "Created logical session");
        snapshot
    }

    /// Get a session, refreshing its inactivity timer
    pub fn get_session(&self, session_id: &str) -> Option<SessionData> {
        let mut sessions = self.lock();
        let entry = sessions.get_mut(session_id)?;
        self.touch(session_id, entry);
        Some(entry.snapshot())
    }

    /// Apply `update` to a session, refreshing its inactivity timer
    pub fn update_session<F>(&self, session_id: &str, update: F) -> Option<SessionData>
    where
        F: FnOnce(&mut SessionData),
    {
        let mut sessions = self.lock();
        let entry = sessions.get_mut(session_id)?;
        update(&mut entry.data);
        self.touch(session_id, entry);
        Some(entry.snapshot())
    }

    /// Whether a session exists, without touching it
    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    /// Append a chunk to the session buffer.
    ///
    /// Oldest chunks are dropped once the total exceeds the cap; the newest
    /// chunk is always kept (truncated to its tail if it alone exceeds the cap).
    /// Returns false if the session does not exist.
    pub fn add_output(&self, session_id: &str, chunk: &str) -> bool {
        let max = self.inner.max_buffer_chars;
        let mut sessions = self.lock();
        let entry = match sessions.get_mut(session_id) {
            Some(e) => e,
            None => return false,
        };

        let mut chunk_chars = chunk.chars().count();
        let chunk = if chunk_chars > max {
            let skip = chunk_chars - max;
            chunk_chars = max;
            chunk.chars().skip(skip).collect::<String>()
        } else {
            chunk.to_string()
        };

        entry.buffer.push_back(chunk);
        entry.buffered_chars += chunk_chars;

        let mut dropped = 0usize;
        while entry.buffered_chars > max && entry.buffer.len() > 1 {
            if let Some(old) = entry.buffer.pop_front() {
                entry.buffered_chars -= old.chars().count();
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::debug!(session_id, dropped, "Output buffer over cap, dropped oldest chunks");
        }

        self.touch(session_id, entry);
        true
    }

    /// Drain the buffered output in append order
    pub fn get_and_clear_buffer(&self, session_id: &str) -> Vec<String> {
        let mut sessions = self.lock();
        match sessions.get_mut(session_id) {
            Some(entry) => {
                entry.buffered_chars = 0;
                let drained: Vec<String> = entry.buffer.drain(..).collect();
                self.touch(session_id, entry);
                drained
            }
            None => Vec::new(),
        }
    }

    /// Remove a session and cancel its timer
    pub fn delete_session(&self, session_id: &str) -> Option<SessionData> {
        let entry = self.lock().remove(session_id)?;
        if let Some(ref timer) = entry.timer {
            timer.abort();
        }
        tracing::debug!(session_id, "Deleted logical session");
        Some(entry.snapshot())
    }

    /// Suspend the inactivity timeout while a connection is bound.
    ///
    /// Holds are per session id and survive `create_session` overwrites.
    pub fn hold(&self, session_id: &str) {
        let mut sessions = self.lock();
        self.lock_held().insert(session_id.to_string());
        if let Some(entry) = sessions.get_mut(session_id) {
            disarm(entry);
            entry.data.last_accessed = Utc::now();
        }
        tracing::debug!(session_id, "Session held by connection");
    }

    /// Drop a hold and restart the inactivity timeout
    pub fn release(&self, session_id: &str) {
        let mut sessions = self.lock();
        if !self.lock_held().remove(session_id) {
            return;
        }
        if let Some(entry) = sessions.get_mut(session_id) {
            self.touch(session_id, entry);
        }
        tracing::debug!(session_id, "Session released by connection");
    }

    /// Forget a persistent session that died, along with the agent bound to it.
    ///
    /// Returns the logical sessions that referenced it.
    pub fn unlink_persistent(&self, persistent_session_id: &str) -> Vec<String> {
        let mut sessions = self.lock();
        let mut unlinked = Vec::new();
        for (session_id, entry) in sessions.iter_mut() {
            if entry.data.persistent_session_id.as_deref() == Some(persistent_session_id) {
                entry.data.persistent_session_id = None;
                entry.data.agent_id = None;
                unlinked.push(session_id.clone());
            }
        }
        unlinked
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self, session_id: &str, entry: &mut Entry) {
        entry.data.last_accessed = Utc::now();
        self.arm(session_id, entry);
    }

    /// (Re)arm the inactivity timer for an entry
    fn arm(&self, session_id: &str, entry: &mut Entry) {
        disarm(entry);
        if self.lock_held().contains(session_id) {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(_) => {
                tracing::warn!(session_id, "No runtime, session timeout disabled");
                return;
            }
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let generation = entry.generation;
        let timeout = self.inner.timeout;
        let session_id = session_id.to_string();
        entry.timer = Some(handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                expire(&inner, &session_id, generation);
            }
        }));
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, DEFAULT_MAX_BUFFER_CHARS)
    }
}

/// Cancel the timer; a timer that already fired sees a newer generation
fn disarm(entry: &mut Entry) {
    if let Some(timer) = entry.timer.take() {
        timer.abort();
    }
    entry.generation += 1;
}

/// Remove an expired session if its timer was not rearmed in the meantime
fn expire(inner: &Inner, session_id: &str, generation: u64) {
    let removed = {
        let mut sessions = inner
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match sessions.get(session_id) {
            Some(entry) if entry.generation == generation => sessions.remove(session_id),
            _ => None,
        }
    };

    if let Some(entry) = removed {
        tracing::info!(
            session_id,
            agent_id = ?entry.data.agent_id,
            "Logical session timed out"
        );
        let _ = inner.events.send(SessionStoreEvent::SessionTimeout {
            session_id: session_id.to_string(),
            agent_id: entry.data.agent_id,
            persistent_session_id: entry.data.persistent_session_id,
        });
    }
}
