//! In-memory sandbox that emulates `screen`, for unit tests

use crate::container::{CommandSpec, ContainerExec, ExecOutput, ExecRequest};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct FakeScreenState {
    pub installed: bool,
    pub install_fails: bool,
    pub list_fails: bool,
    pub hardcopy_fails: bool,
    /// session name → attached
    pub sessions: BTreeMap<String, bool>,
    /// session name → scrollback text returned by hardcopy
    pub scrollback: HashMap<String, String>,
    pub files: HashMap<String, String>,
    pub stuffed: Vec<(String, String)>,
    pub calls: Vec<Vec<String>>,
}

#[derive(Debug, Default)]
pub struct FakeScreen {
    state: Mutex<FakeScreenState>,
}

impl FakeScreen {
    pub fn installed() -> Self {
        let fake = Self::default();
        fake.state().installed = true;
        fake
    }

    pub fn state(&self) -> MutexGuard<'_, FakeScreenState> {
        self.state.lock().unwrap()
    }

    /// Simulate the session process dying outside our control
    pub fn kill_externally(&self, name: &str) {
        self.state().sessions.remove(name);
    }

    pub fn stuffed_into(&self, name: &str) -> Vec<String> {
        self.state()
            .stuffed
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, input)| input.clone())
            .collect()
    }
}

fn ok(stdout: impl Into<String>) -> Result<ExecOutput> {
    Ok(ExecOutput {
        status: Some(0),
        stdout: stdout.into(),
        stderr: String::new(),
    })
}

fn fail(stderr: impl Into<String>) -> Result<ExecOutput> {
    Ok(ExecOutput {
        status: Some(1),
        stdout: String::new(),
        stderr: stderr.into(),
    })
}

#[async_trait]
impl ContainerExec for FakeScreen {
    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput> {
        let mut state = self.state();
        state.calls.push(request.args.clone());
        let args: Vec<&str> = request.args.iter().map(String::as_str).collect();

        match args.as_slice() {
            ["screen", "-v"] => {
                if state.installed {
                    ok("Screen version 4.09.00 (GNU) 30-Jan-22\n")
                } else {
                    Ok(ExecOutput {
                        status: Some(127),
                        stdout: String::new(),
                        stderr: "screen: not found\n".to_string(),
                    })
                }
            }
            ["sh", "-c", _] if request.as_root => {
                if state.install_fails {
                    fail("E: Unable to locate package screen")
                } else {
                    state.installed = true;
                    ok("")
                }
            }
            ["screen", "-h", _, "-dmS", name, ..] => {
                if !state.installed {
                    return fail("screen: not found");
                }
                state.sessions.insert(name.to_string(), false);
                ok("")
            }
            ["screen", "-ls"] => {
                if state.list_fails {
                    return Err(Error::Timeout("screen -ls".to_string()));
                }
                if state.sessions.is_empty() {
                    return fail("No Sockets found in /run/screen/S-claude.\n");
                }
                let mut out = String::from("There are screens on:\n");
                for (i, (name, attached)) in state.sessions.iter().enumerate() {
                    out.push_str(&format!(
                        "\t{}.{}\t(10/19/2026 09:00:00 AM)\t({})\n",
                        1000 + i,
                        name,
                        if *attached { "Attached" } else { "Detached" }
                    ));
                }
                // screen -ls exits non-zero even when sessions exist
                Ok(ExecOutput {
                    status: Some(1),
                    stdout: out,
                    stderr: String::new(),
                })
            }
            ["screen", "-S", name, "-p", "0", "-X", "stuff", input] => {
                if !state.sessions.contains_key(*name) {
                    return fail(format!("No screen session found named {}", name));
                }
                state.stuffed.push((name.to_string(), input.to_string()));
                ok("")
            }
            ["screen", "-S", name, "-X", "quit"] => {
                if state.sessions.remove(*name).is_some() {
                    ok("")
                } else {
                    fail("No screen session found.")
                }
            }
            ["screen", "-S", name, "-p", "0", "-X", "hardcopy", "-h", path] => {
                if state.hardcopy_fails || !state.sessions.contains_key(*name) {
                    // screen may leave a partial file behind
                    state.files.insert(path.to_string(), String::new());
                    return fail("hardcopy failed");
                }
                let text = state.scrollback.get(*name).cloned().unwrap_or_default();
                state.files.insert(path.to_string(), text);
                ok("")
            }
            ["screen", "-S", _, "-X", "width" | "height", ..] => ok(""),
            ["cat", path] => match state.files.get(*path) {
                Some(text) => ok(text.clone()),
                None => fail("No such file or directory"),
            },
            ["rm", "-f", path] => {
                state.files.remove(*path);
                ok("")
            }
            other => Err(Error::Container(format!("unexpected command: {:?}", other))),
        }
    }

    fn interactive(&self, _argv: &[String], _workdir: Option<&str>) -> CommandSpec {
        CommandSpec::new("sh").args(["-c", "cat"])
    }

    fn describe(&self) -> String {
        "fake-screen".to_string()
    }
}

/// Gateway state over a [`FakeScreen`] sandbox and a state file in `dir`
pub async fn app_state(
    dir: &std::path::Path,
) -> (crate::gateway::AppState, std::sync::Arc<FakeScreen>) {
    use crate::agent::AgentManager;
    use crate::config::{PersistentConfig, SandboxConfig};
    use crate::gateway::{AllowAll, AppState, BridgeSettings, OutputRelay};
    use crate::session::{PersistentSessionManager, SessionStore};
    use crate::state::FileStateManager;
    use std::sync::Arc;
    use std::time::Duration;

    let fake = Arc::new(FakeScreen::installed());
    let persistent = Arc::new(PersistentSessionManager::new(
        fake.clone(),
        PersistentConfig {
            create_retry_delay_ms: 1,
            ..PersistentConfig::default()
        },
        "/workspace".to_string(),
    ));
    let store = SessionStore::new(Duration::from_secs(60), 10_000);
    let state_manager = FileStateManager::open(dir.join("state.json")).await.unwrap();
    let app = AppState {
        agents: Arc::new(AgentManager::new()),
        persistent,
        relay: OutputRelay::new(store.clone()),
        store,
        state_manager: Arc::new(state_manager),
        auth: Arc::new(AllowAll),
        settings: BridgeSettings::from_config(&SandboxConfig::default()),
    };
    (app, fake)
}
