//! Agents: pty-backed processes and their registry
//!
//! ## Architecture
//!
//! ```text
//! AgentManager ── registry of Arc<dyn Agent>, tagged event fan-out
//!   ├ ShellAgent        shell, ssh-shell          (one pty, nothing persists)
//!   ├ PersistentAgent   persistent-shell/-ssh     (pty runs `screen -D -r`)
//!   └ AiCliAgent        ai-cli                    (persistent + execute())
//! ```

pub mod ai_cli;
pub mod completion;
pub mod manager;
pub mod persistent;
pub mod pty;
pub mod restart;
pub mod shell;
pub mod types;

pub use ai_cli::AiCliAgent;
pub use completion::{CompletionHeuristic, Hybrid, PromptPattern, Stability};
pub use manager::{agent_factory, AgentFactory, AgentManager, AgentSubscription};
pub use persistent::PersistentAgent;
pub use restart::RestartPolicy;
pub use shell::ShellAgent;
pub use types::{
    Agent, AgentEvent, AgentEventSender, AgentInfo, AgentKind, AgentOptions, AgentStatus,
    TaggedAgentEvent,
};

use crate::config::AgentsConfig;
use crate::container::ContainerExec;
use crate::session::PersistentSessionManager;
use std::sync::Arc;
use std::time::Duration;

/// Dependencies of the built-in agent kinds
#[derive(Clone)]
pub struct BuiltinAgents {
    pub config: AgentsConfig,
    /// Default working directory inside the sandbox
    pub workdir: String,
    pub persistent: Arc<PersistentSessionManager>,
    /// SSH transport; `ssh-shell` and `persistent-ssh` are only registered with one
    pub ssh: Option<Arc<dyn ContainerExec>>,
}

impl BuiltinAgents {
    fn heuristic(&self) -> Arc<dyn CompletionHeuristic> {
        Arc::new(Hybrid::new(
            PromptPattern::new(&self.config.prompt_patterns),
            Stability::new(Duration::from_millis(self.config.stability_ms)),
        ))
    }

    /// Register every built-in kind with `manager`
    pub async fn register(self, manager: &AgentManager) {
        let grace = self.config.liveness_grace();

        let shell = self.config.shell.clone();
        manager
            .register_agent_type(
                AgentKind::Shell.as_str(),
                agent_factory(move |id, options| {
                    Ok(Box::new(ShellAgent::local(id, &shell, &options, grace)) as Box<dyn Agent>)
                }),
            )
            .await;

        let workdir = self.workdir.clone();
        let persistent = self.persistent.clone();
        manager
            .register_agent_type(
                AgentKind::PersistentShell.as_str(),
                agent_factory(move |id, options| {
                    let options = with_default_cwd(options, &workdir);
                    Ok(Box::new(PersistentAgent::new(
                        id,
                        AgentKind::PersistentShell,
                        persistent.clone(),
                        options,
                        grace,
                    )) as Box<dyn Agent>)
                }),
            )
            .await;

        let workdir = self.workdir.clone();
        let persistent = self.persistent.clone();
        let heuristic = self.heuristic();
        let ai_command = self.config.ai_cli_command.clone();
        let exchange_timeout = Duration::from_secs(self.config.exchange_timeout_secs.max(1));
        manager
            .register_agent_type(
                AgentKind::AiCli.as_str(),
                agent_factory(move |id, options| {
                    let options = with_default_cwd(options, &workdir);
                    Ok(Box::new(AiCliAgent::new(
                        id,
                        persistent.clone(),
                        options,
                        grace,
                        &ai_command,
                        heuristic.clone(),
                        exchange_timeout,
                    )) as Box<dyn Agent>)
                }),
            )
            .await;

        let Some(ssh) = self.ssh else {
            tracing::debug!("SSH transport disabled, ssh agent kinds not registered");
            return;
        };

        let transport = ssh.clone();
        manager
            .register_agent_type(
                AgentKind::SshShell.as_str(),
                agent_factory(move |id, options| {
                    Ok(
                        Box::new(ShellAgent::ssh(id, transport.as_ref(), &options, grace))
                            as Box<dyn Agent>,
                    )
                }),
            )
            .await;

        let workdir = self.workdir;
        let persistent = self.persistent;
        manager
            .register_agent_type(
                AgentKind::PersistentSsh.as_str(),
                agent_factory(move |id, options| {
                    let options = with_default_cwd(options, &workdir);
                    Ok(Box::new(
                        PersistentAgent::new(
                            id,
                            AgentKind::PersistentSsh,
                            persistent.clone(),
                            options,
                            grace,
                        )
                        .with_transport(ssh.clone()),
                    ) as Box<dyn Agent>)
                }),
            )
            .await;
    }
}

fn with_default_cwd(mut options: AgentOptions, workdir: &str) -> AgentOptions {
    if options.cwd.is_none() {
        options.cwd = Some(workdir.to_string());
    }
    options
}
