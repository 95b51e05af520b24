//! REST diagnostics
//!
//! | Method   | Path                              | Description                     |
//! |----------|-----------------------------------|---------------------------------|
//! | `GET`    | `/health`                         | Liveness check with counters    |
//! | `GET`    | `/api/agents`                     | Active agents                   |
//! | `POST`   | `/api/agents/:id/execute`         | Run one command on an agent     |
//! | `GET`    | `/api/agent-types`                | Registered agent types          |
//! | `GET`    | `/api/persistent-sessions`        | Multiplexer sessions            |
//! | `DELETE` | `/api/persistent-sessions/:id`    | Kill a multiplexer session      |
//! | `GET`    | `/api/sessions/:id/history`       | Command log of a work session   |

use super::server::AppState;
use crate::error::Error;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/:id/execute", post(execute_command))
        .route("/api/agent-types", get(list_agent_types))
        .route("/api/persistent-sessions", get(list_persistent_sessions))
        .route("/api/persistent-sessions/:id", delete(kill_persistent_session))
        .route("/api/sessions/:id/history", get(session_history))
}

fn error_response(err: &Error) -> Response {
    let status = match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::UnknownAgentType(_) | Error::UnknownMessageType(_) => StatusCode::BAD_REQUEST,
        Error::Unsupported(_) => StatusCode::BAD_REQUEST,
        Error::NotRunning(_) => StatusCode::CONFLICT,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::Auth(_) => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({"error": {"code": err.code(), "message": err.to_string()}})),
    )
        .into_response()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    version: String,
    agents: usize,
    logical_sessions: usize,
    persistent_sessions: usize,
    connections: usize,
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        agents: state.agents.get_active_agents().await.len(),
        logical_sessions: state.store.len(),
        persistent_sessions: state.persistent.list_sessions().await.len(),
        connections: state.relay.connection_count(),
    })
}

async fn list_agents(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.agents.get_active_agents().await)
}

#[derive(Deserialize)]
struct ExecuteRequest {
    command: String,
}

#[derive(Serialize)]
struct ExecuteResponse {
    output: String,
}

async fn execute_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> Response {
    match state.agents.execute_command(&id, &request.command).await {
        Ok(output) => Json(ExecuteResponse { output }).into_response(),
        Err(e) => {
            tracing::warn!(agent_id = %id, "Execute failed: {}", e);
            error_response(&e)
        }
    }
}

async fn list_agent_types(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.agents.agent_types().await)
}

async fn list_persistent_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.persistent.list_sessions().await)
}

async fn kill_persistent_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.persistent.kill_session(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn session_history(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.state_manager.session_history(&id).await {
        Ok(history) => Json(history).into_response(),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{
        agent_factory, Agent, AgentEventSender, AgentKind, AgentOptions, AgentStatus,
    };
    use crate::error::Result;
    use crate::session::CreateSessionOptions;
    use crate::testing::app_state;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tempfile::TempDir;

    /// Agent that answers every command with its upper-cased text
    struct Shouting {
        id: String,
        started: DateTime<Utc>,
    }

    #[async_trait]
    impl Agent for Shouting {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> AgentKind {
            AgentKind::AiCli
        }

        fn status(&self) -> AgentStatus {
            AgentStatus::Running
        }

        fn start_time(&self) -> DateTime<Utc> {
            self.started
        }

        async fn initialize(&mut self, _events: AgentEventSender) -> Result<()> {
            Ok(())
        }

        async fn send_input(&self, _input: &str) -> Result<()> {
            Ok(())
        }

        async fn resize(&self, _cols: u16, _rows: u16) -> Result<()> {
            Ok(())
        }

        async fn detach(&self) -> Result<()> {
            Ok(())
        }

        async fn reattach(&self) -> Result<()> {
            Ok(())
        }

        async fn terminate(&self) -> Result<()> {
            Ok(())
        }

        async fn execute(&self, command: &str) -> Result<String> {
            Ok(command.to_uppercase())
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 64)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = TempDir::new().unwrap();
        let (state, _fake) = app_state(dir.path()).await;
        let response = health_check(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["agents"], 0);
        assert_eq!(body["connections"], 0);
    }

    #[tokio::test]
    async fn test_execute_command() {
        let dir = TempDir::new().unwrap();
        let (state, _fake) = app_state(dir.path()).await;
        state
            .agents
            .register_agent_type(
                "shouting",
                agent_factory(|id, _options| {
                    Ok(Box::new(Shouting {
                        id,
                        started: Utc::now(),
                    }) as Box<dyn Agent>)
                }),
            )
            .await;
        let agent_id = state
            .agents
            .launch_agent("shouting", AgentOptions::default())
            .await
            .unwrap();

        let request = || {
            Json(ExecuteRequest {
                command: "status".to_string(),
            })
        };
        let response = execute_command(State(state.clone()), Path(agent_id), request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["output"], "STATUS");

        let response = execute_command(State(state), Path("missing".to_string()), request()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_unsupported_execute_is_a_bad_request() {
        let err = Error::Unsupported("shell agents do not support command execution".into());
        assert_eq!(error_response(&err).status(), StatusCode::BAD_REQUEST);
        let err = Error::Timeout("no response".into());
        assert_eq!(error_response(&err).status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_list_agents_empty() {
        let dir = TempDir::new().unwrap();
        let (state, _fake) = app_state(dir.path()).await;
        let response = list_agents(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_kill_persistent_session() {
        let dir = TempDir::new().unwrap();
        let (state, fake) = app_state(dir.path()).await;
        let session = state
            .persistent
            .create_session(CreateSessionOptions::default())
            .await
            .unwrap();

        let response = list_persistent_sessions(State(state.clone())).await.into_response();
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

        let response =
            kill_persistent_session(State(state.clone()), Path(session.id.clone())).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(fake.state().sessions.is_empty());

        let response = kill_persistent_session(State(state), Path(session.id)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_session_history() {
        let dir = TempDir::new().unwrap();
        let (state, _fake) = app_state(dir.path()).await;
        let id = state
            .state_manager
            .create_session("/workspace", "shell")
            .await
            .unwrap();
        state
            .state_manager
            .log_command(&id, "make test", None, None)
            .await
            .unwrap();

        let response = session_history(State(state.clone()), Path(id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await[0]["command"], "make test");

        let response = session_history(State(state), Path("missing".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "not_found");
    }
}
