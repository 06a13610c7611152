//! Reasoning session and chat endpoints.

use axum::{
    Json, Router,
    extract::State,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::api::{ApiError, ApiJson, ApiPath, AppState, SharedState, require_api_key};
use super::auth::AuthUser;
use super::models::{Project, User};
use crate::errors::ReasoningError;
use crate::reasoning::chat::{self, ChatInput};
use crate::reasoning::engine::session_title;
use crate::reasoning::tools::ToolRegistry;
use crate::reasoning::{ReasoningEngine, StepType, TaskContext};

#[derive(Deserialize)]
pub struct TaskRequest {
    #[serde(default)]
    pub task: String,
    pub current_file: Option<String>,
    pub current_file_content: Option<String>,
}

#[derive(Deserialize)]
pub struct StepRequest {
    #[serde(default)]
    pub step_type: String,
    #[serde(default)]
    pub prompt: String,
}

#[derive(Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    pub current_file: Option<String>,
    pub current_file_content: Option<String>,
    #[serde(default)]
    pub use_reasoning: bool,
}

pub fn reasoning_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects/{id}/reasoning/sessions", get(list_sessions))
        .route("/api/projects/{id}/reasoning/start", post(start_session))
        .route("/api/projects/{id}/reasoning/execute", post(execute_chain))
        .route(
            "/api/projects/{id}/reasoning/sessions/{sid}",
            get(get_session),
        )
        .route(
            "/api/projects/{id}/reasoning/sessions/{sid}/step",
            post(execute_step),
        )
        .route("/api/projects/{id}/chat", post(send_chat))
        .route("/api/projects/{id}/chat/history", get(chat_history))
}

/// An engine acting for `user` on `project` with the user's own API key.
fn build_engine(state: &AppState, user: &User, project: Project) -> Result<ReasoningEngine, ApiError> {
    let model = state.models.for_api_key(require_api_key(user)?);
    let files = state.project_files(&project)?;
    let tools = ToolRegistry::new(
        project,
        files,
        state.containers.clone(),
        state.notifier.clone(),
    );
    Ok(ReasoningEngine::new(
        state.db.clone(),
        model,
        tools,
        state.notifier.clone(),
        state.config.llm.clone(),
        user.id,
    ))
}

fn require_task(task: &str) -> Result<(), ApiError> {
    if task.trim().is_empty() {
        return Err(ApiError::BadRequest("Task description is required".into()));
    }
    Ok(())
}

async fn list_sessions(
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<i64>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state.load_project(id, &user).await?;
    let project_id = project.id;
    let sessions = state.db.call(move |db| db.list_sessions(project_id)).await?;
    Ok(Json(json!({"status": "success", "sessions": sessions})))
}

/// Open an empty session for steps submitted one at a time.
async fn start_session(
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<i64>,
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<TaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_task(&req.task)?;
    let project = state.load_project(id, &user).await?;
    let engine = build_engine(&state, &user, project)?;
    let session = engine
        .create_session(&session_title(&req.task), &req.task)
        .await?;
    Ok(Json(json!({
        "status": "success",
        "message": "Reasoning session created",
        "session_id": session.id,
    })))
}

async fn execute_chain(
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<i64>,
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<TaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_task(&req.task)?;
    let project = state.load_project(id, &user).await?;
    let project_id = project.id;
    let engine = build_engine(&state, &user, project)?;
    let context = TaskContext::new(req.current_file, req.current_file_content);
    let session = engine.execute_chain(&req.task, &context).await?;

    let session_id = session.id;
    let detail = state
        .db
        .call(move |db| db.get_session_detail(session_id, project_id))
        .await?
        .ok_or(ReasoningError::SessionNotFound { id: session_id })?;
    info!(
        session_id,
        steps = detail.steps.len(),
        complete = detail.session.is_complete,
        "Reasoning chain finished"
    );
    Ok(Json(json!({
        "status": "success",
        "session_id": session_id,
        "session": detail.session,
        "steps": detail.steps,
    })))
}

async fn get_session(
    AuthUser(user): AuthUser,
    ApiPath((id, sid)): ApiPath<(i64, i64)>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state.load_project(id, &user).await?;
    let project_id = project.id;
    let detail = state
        .db
        .call(move |db| db.get_session_detail(sid, project_id))
        .await?
        .ok_or(ReasoningError::SessionNotFound { id: sid })?;
    Ok(Json(json!({
        "status": "success",
        "session": detail.session,
        "steps": detail.steps,
    })))
}

async fn execute_step(
    AuthUser(user): AuthUser,
    ApiPath((id, sid)): ApiPath<(i64, i64)>,
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<StepRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.step_type.is_empty() || req.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "Step type and prompt are required".into(),
        ));
    }
    let step_type: StepType = req
        .step_type
        .parse()
        .map_err(|_| ReasoningError::UnknownStepType(req.step_type.clone()))?;

    let project = state.load_project(id, &user).await?;
    let project_id = project.id;
    let session = state
        .db
        .call(move |db| db.get_session(sid, project_id))
        .await?
        .ok_or(ReasoningError::SessionNotFound { id: sid })?;
    if session.is_complete {
        return Err(ReasoningError::SessionComplete.into());
    }

    let engine = build_engine(&state, &user, project)?;
    let step = engine
        .execute_step(&session, step_type, &req.prompt, None)
        .await?;
    Ok(Json(json!({"status": "success", "step": step})))
}

async fn send_chat(
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<i64>,
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.message.trim().is_empty() {
        return Err(ApiError::BadRequest("Message is required".into()));
    }
    let project = state.load_project(id, &user).await?;
    let engine = build_engine(&state, &user, project)?;
    let input = ChatInput {
        message: req.message,
        context: TaskContext::new(req.current_file, req.current_file_content),
        use_reasoning: req.use_reasoning,
    };
    let reply = chat::respond(&engine, &input).await?;
    Ok(Json(json!({
        "status": "success",
        "message": reply.message,
        "reasoning_session_id": reply.reasoning_session_id,
        "tool_results": reply.tool_results,
        "history": reply.history,
    })))
}

async fn chat_history(
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<i64>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state.load_project(id, &user).await?;
    let project_id = project.id;
    let messages = state.db.call(move |db| db.chat_history(project_id)).await?;
    Ok(Json(json!({"status": "success", "messages": messages})))
}
