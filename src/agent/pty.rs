//! Pseudo-terminal process wrapper
//!
//! Spawns a [`CommandSpec`] under a native pty. A blocking reader task pumps
//! output into a channel and, once the pty closes, waits on the child and sends
//! [`PtyEvent::Exited`] last, so exit always follows the final output chunk.

use super::types::{AgentEvent, AgentEventSender, AgentStatus, StatusCell};
use crate::container::CommandSpec;
use crate::error::{Error, Result};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Raw pty events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Output(String),
    Exited(Option<i32>),
}

/// A running process attached to a pty
pub struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl PtyProcess {
    pub fn spawn(
        spec: &CommandSpec,
        cols: u16,
        rows: u16,
        events: mpsc::UnboundedSender<PtyEvent>,
    ) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::Initialization(format!("Failed to open pty: {}", e)))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(ref cwd) = spec.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair.slave.spawn_command(cmd).map_err(|e| {
            Error::Initialization(format!("Failed to spawn {}: {}", spec.program, e))
        })?;
        // Keep only the master side open so EOF arrives when the child exits
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| Error::Initialization(format!("Failed to clone pty reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| Error::Initialization(format!("Failed to take pty writer: {}", e)))?;
        let killer = child.clone_killer();
        let pid = child.process_id();

        let exited = Arc::new(AtomicBool::new(false));
        let exited_flag = exited.clone();
        let program = spec.program.clone();

        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            let mut decoder = Utf8Decoder::default();
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let text = decoder.decode(&buf[..n]);
                        if !text.is_empty() {
                            let _ = events.send(PtyEvent::Output(text));
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // EIO once the slave side is gone
                    Err(_) => break,
                }
            }
            let tail = decoder.finish();
            if !tail.is_empty() {
                let _ = events.send(PtyEvent::Output(tail));
            }

            let code = match child.wait() {
                Ok(status) => Some(status.exit_code() as i32),
                Err(e) => {
                    tracing::debug!(program = %program, "Failed to reap pty child: {}", e);
                    None
                }
            };
            exited_flag.store(true, Ordering::SeqCst);
            let _ = events.send(PtyEvent::Exited(code));
        });

        tracing::debug!(program = %spec.program, pid = ?pid, "Spawned pty process");

        Ok(Self {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            exited,
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }

    pub fn write(&self, data: &str) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| Error::Internal("pty writer lock poisoned".to_string()))?;
        writer.write_all(data.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| Error::Internal("pty master lock poisoned".to_string()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::Internal(format!("Failed to resize pty: {}", e)))
    }

    pub fn kill(&self) {
        if !self.is_alive() {
            return;
        }
        if let Ok(mut killer) = self.killer.lock() {
            if let Err(e) = killer.kill() {
                tracing::debug!(pid = ?self.pid, "Failed to kill pty process: {}", e);
            }
        }
    }

    /// Wait out the grace period and report whether the process survived it
    pub async fn confirm_alive(&self, grace: Duration) -> bool {
        tokio::time::sleep(grace).await;
        self.is_alive()
    }
}

/// Output sink used by request/response agents to observe raw output
pub type OutputTap = Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>;

/// Minimum gap between two activity pings from one attachment
pub(crate) const ACTIVITY_THROTTLE: Duration = Duration::from_secs(1);

/// Optional observers of a forwarded pty stream
#[derive(Default)]
pub(crate) struct ForwardHooks {
    /// Receives a copy of every output chunk
    pub tap: Option<OutputTap>,
    /// Pinged on output, at most once per [`ACTIVITY_THROTTLE`]
    pub activity: Option<mpsc::UnboundedSender<()>>,
}

/// Forward pty events to an agent's event channel.
///
/// Events are dropped once `generation` moves past `mine`, which is how a
/// detached attachment goes quiet. Exit sets the agent status to stopped.
pub(crate) fn forward_events(
    mut rx: mpsc::UnboundedReceiver<PtyEvent>,
    events: AgentEventSender,
    status: StatusCell,
    generation: Arc<AtomicU64>,
    mine: u64,
    hooks: ForwardHooks,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_ping: Option<tokio::time::Instant> = None;
        while let Some(event) = rx.recv().await {
            if generation.load(Ordering::SeqCst) != mine {
                break;
            }
            match event {
                PtyEvent::Output(data) => {
                    if let Some(ref tap) = hooks.tap {
                        if let Ok(slot) = tap.lock() {
                            if let Some(ref sink) = *slot {
                                let _ = sink.send(data.clone());
                            }
                        }
                    }
                    if let Some(ref activity) = hooks.activity {
                        if last_ping.map_or(true, |at| at.elapsed() >= ACTIVITY_THROTTLE) {
                            let _ = activity.send(());
                            last_ping = Some(tokio::time::Instant::now());
                        }
                    }
                    let _ = events.send(AgentEvent::Output(data));
                }
                PtyEvent::Exited(code) => {
                    status.set(AgentStatus::Stopped);
                    let _ = events.send(AgentEvent::Exit(code));
                    break;
                }
            }
        }
    })
}

/// Incremental UTF-8 decoder that carries split sequences across reads
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.carry.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.carry) {
                Ok(s) => {
                    out.push_str(s);
                    self.carry.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.carry[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.carry.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete sequence at the end, keep it for the next read
                            self.carry.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is left as lossy text
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        out
    }
}
