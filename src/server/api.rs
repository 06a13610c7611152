use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        FromRequest, FromRequestParts, Path, Query, Request, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{info, warn};

use super::auth::AuthUser;
use super::db::DbHandle;
use super::models::{Project, ProjectUpdate, User};
use super::ws::Notifier;
use crate::config::Config;
use crate::container::{ContainerManager, ContainerRuntime};
use crate::errors::{ContainerError, ReasoningError, WorkspaceError};
use crate::reasoning::llm::ChatModelFactory;
use crate::workspace::{self, FileOperations};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub config: Config,
    pub containers: Arc<ContainerManager>,
    pub notifier: Arc<Notifier>,
    pub models: Arc<dyn ChatModelFactory>,
    /// Client for the preview proxy: short timeout, redirects passed through
    pub http: reqwest::Client,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        config: Config,
        db: DbHandle,
        runtime: Arc<dyn ContainerRuntime>,
        models: Arc<dyn ChatModelFactory>,
    ) -> anyhow::Result<Self> {
        let containers = Arc::new(ContainerManager::new(
            runtime,
            db.clone(),
            config.container.clone(),
            config.storage.data_root.clone(),
        ));
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            db,
            config,
            containers,
            notifier: Arc::new(Notifier::new()),
            models,
            http,
        })
    }

    /// File operations bound to the project's data directory, which is
    /// created if missing.
    pub fn project_files(&self, project: &Project) -> Result<FileOperations, ApiError> {
        let files = FileOperations::new(workspace::project_dir(
            &self.config.storage.data_root,
            project.user_id,
            project.id,
        ));
        files.ensure_root()?;
        Ok(files)
    }

    /// Look up a project owned by `user`. Projects of other users are
    /// reported as missing.
    pub async fn load_project(&self, id: i64, user: &User) -> Result<Project, ApiError> {
        let user_id = user.id;
        self.db
            .call(move |db| db.get_project(id, user_id))
            .await?
            .ok_or_else(|| ApiError::NotFound("Project not found".into()))
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub container_image: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateProfileRequest {
    pub openai_api_key: Option<String>,
}

#[derive(Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Deserialize)]
pub struct SaveFileRequest {
    pub file_path: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Deserialize)]
pub struct CreateFileRequest {
    pub file_path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_directory: bool,
}

#[derive(Deserialize)]
pub struct DeleteFileRequest {
    pub file_path: String,
}

#[derive(Deserialize)]
pub struct RenameFileRequest {
    pub old_path: String,
    pub new_path: String,
}

// ── Error handling ────────────────────────────────────────────────────

pub const MISSING_API_KEY_MESSAGE: &str =
    "No OpenAI API key found. Please add your API key in your profile settings.";

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "Authentication required".to_string(),
            ),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"status": "error", "message": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<WorkspaceError> for ApiError {
    fn from(e: WorkspaceError) -> Self {
        match e {
            WorkspaceError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            WorkspaceError::Io { .. } => ApiError::Internal(e.to_string()),
            _ => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl From<ContainerError> for ApiError {
    fn from(e: ContainerError) -> Self {
        match e {
            ContainerError::Unavailable
            | ContainerError::NoContainer
            | ContainerError::NotRunning { .. } => ApiError::BadRequest(e.to_string()),
            ContainerError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<ReasoningError> for ApiError {
    fn from(e: ReasoningError) -> Self {
        match e {
            ReasoningError::UnknownStepType(_) | ReasoningError::SessionComplete => {
                ApiError::BadRequest(e.to_string())
            }
            ReasoningError::SessionNotFound { .. } => ApiError::NotFound(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        match e {
            JsonRejection::MissingJsonContentType(_) => {
                ApiError::BadRequest("Expected a JSON request body".into())
            }
            _ => ApiError::BadRequest("Invalid JSON in request body".into()),
        }
    }
}

impl From<PathRejection> for ApiError {
    fn from(_: PathRejection) -> Self {
        ApiError::NotFound("Not found".into())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(_: QueryRejection) -> Self {
        ApiError::BadRequest("Invalid query string".into())
    }
}

// ── Extractors ────────────────────────────────────────────────────────

/// `Json` whose rejection is the JSON error envelope.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ApiJson(value))
    }
}

/// `Path` whose rejection is the JSON error envelope. A segment that does
/// not parse names no resource, so it is a 404.
pub struct ApiPath<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await?;
        Ok(ApiPath(value))
    }
}

/// `Query` whose rejection is the JSON error envelope.
pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(ApiQuery(value))
    }
}

/// The user's OpenAI key, or the error every LLM-backed endpoint returns
/// without one.
pub fn require_api_key(user: &User) -> Result<&str, ApiError> {
    user.api_key()
        .ok_or_else(|| ApiError::BadRequest(MISSING_API_KEY_MESSAGE.into()))
}

fn validate_title(title: &str) -> Result<String, ApiError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ApiError::BadRequest("Title is required".into()));
    }
    if title.chars().count() > 200 {
        return Err(ApiError::BadRequest(
            "Title must be at most 200 characters".into(),
        ));
    }
    Ok(title.to_string())
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/profile", get(get_profile).put(update_profile))
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/{id}",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route("/api/projects/{id}/container/create", post(container_create))
        .route("/api/projects/{id}/container/start", post(container_start))
        .route("/api/projects/{id}/container/stop", post(container_stop))
        .route("/api/projects/{id}/container/remove", post(container_remove))
        .route("/api/projects/{id}/container/status", get(container_status))
        .route("/api/projects/{id}/files", get(list_files))
        .route("/api/projects/{id}/files/content", get(read_file))
        .route("/api/projects/{id}/file/save", post(save_file))
        .route("/api/projects/{id}/file/create", post(create_file))
        .route("/api/projects/{id}/file/delete", post(delete_file))
        .route("/api/projects/{id}/file/rename", post(rename_file))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn get_profile(AuthUser(user): AuthUser) -> impl IntoResponse {
    Json(json!({
        "status": "success",
        "username": user.username,
        "has_openai_api_key": user.api_key().is_some(),
    }))
}

async fn update_profile(
    AuthUser(user): AuthUser,
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<UpdateProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let key = req
        .openai_api_key
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty());
    let user_id = user.id;
    let user = state
        .db
        .call(move |db| db.set_openai_api_key(user_id, key.as_deref()))
        .await?;
    info!(user = %user.username, "Profile updated");
    Ok(Json(json!({
        "status": "success",
        "message": "Profile updated successfully",
        "has_openai_api_key": user.api_key().is_some(),
    })))
}

async fn list_projects(
    AuthUser(user): AuthUser,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user.id;
    let projects = state.db.call(move |db| db.list_projects(user_id)).await?;
    Ok(Json(json!({"status": "success", "projects": projects})))
}

async fn create_project(
    AuthUser(user): AuthUser,
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let title = validate_title(&req.title)?;
    let image = req
        .container_image
        .filter(|i| !i.trim().is_empty())
        .unwrap_or_else(|| state.config.container.default_image.clone());
    let (user_id, description) = (user.id, req.description);
    let project = state
        .db
        .call(move |db| db.create_project(user_id, &title, &description, &image))
        .await?;
    state.project_files(&project)?;
    info!(project_id = project.id, user = %user.username, "Project created");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "success",
            "message": "Project created successfully",
            "project": project,
        })),
    ))
}

async fn get_project(
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<i64>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state.load_project(id, &user).await?;
    Ok(Json(json!({"status": "success", "project": project})))
}

async fn update_project(
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<i64>,
    State(state): State<SharedState>,
    ApiJson(mut update): ApiJson<ProjectUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(title) = &update.title {
        update.title = Some(validate_title(title)?);
    }
    let user_id = user.id;
    let project = state
        .db
        .call(move |db| db.update_project(id, user_id, &update))
        .await?
        .ok_or_else(|| ApiError::NotFound("Project not found".into()))?;
    Ok(Json(json!({
        "status": "success",
        "message": "Project updated successfully",
        "project": project,
    })))
}

/// Delete a project along with its container and data directory. Failures
/// to clean up the container or files are logged, not returned.
async fn delete_project(
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<i64>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state.load_project(id, &user).await?;
    if project.has_container() {
        if let Err(e) = state.containers.remove(&project).await {
            warn!(project_id = id, error = %e, "Failed to remove container of deleted project");
        }
    }

    let user_id = user.id;
    state
        .db
        .call(move |db| db.delete_project(id, user_id))
        .await?;

    let files = FileOperations::new(workspace::project_dir(
        &state.config.storage.data_root,
        project.user_id,
        project.id,
    ));
    if let Err(e) = files.remove_root() {
        warn!(project_id = id, error = %e, "Failed to remove project data directory");
    }
    info!(project_id = id, "Project deleted");
    Ok(Json(json!({"status": "success", "message": "Project deleted successfully"})))
}

// ── Containers ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum ContainerAction {
    Create,
    Start,
    Stop,
    Remove,
}

impl ContainerAction {
    fn past_tense(self) -> &'static str {
        match self {
            Self::Create => "created",
            Self::Start => "started",
            Self::Stop => "stopped",
            Self::Remove => "removed",
        }
    }
}

async fn container_action(
    state: &AppState,
    user: &User,
    id: i64,
    action: ContainerAction,
) -> Result<Json<serde_json::Value>, ApiError> {
    let project = state.load_project(id, user).await?;
    let project = match action {
        ContainerAction::Create => {
            if project.has_container() {
                return Err(ApiError::BadRequest(
                    "Project already has a container".into(),
                ));
            }
            state.containers.create(&project).await?
        }
        ContainerAction::Start => state.containers.start(&project).await?,
        ContainerAction::Stop => state.containers.stop(&project).await?,
        ContainerAction::Remove => state.containers.remove(&project).await?,
    };
    Ok(Json(json!({
        "status": "success",
        "message": format!("Container {} successfully", action.past_tense()),
        "container_id": project.container_id,
        "container_status": project.container_status,
    })))
}

async fn container_create(
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<i64>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    container_action(&state, &user, id, ContainerAction::Create).await
}

async fn container_start(
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<i64>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    container_action(&state, &user, id, ContainerAction::Start).await
}

async fn container_stop(
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<i64>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    container_action(&state, &user, id, ContainerAction::Stop).await
}

async fn container_remove(
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<i64>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    container_action(&state, &user, id, ContainerAction::Remove).await
}

async fn container_status(
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<i64>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state.load_project(id, &user).await?;
    let status = state.containers.status(&project).await?;
    Ok(Json(json!({"status": "success", "container_status": status})))
}

// ── Files ─────────────────────────────────────────────────────────────

async fn list_files(
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiQuery(query): ApiQuery<PathQuery>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state.load_project(id, &user).await?;
    let files = state.project_files(&project)?.list_files(&query.path)?;
    Ok(Json(json!({"status": "success", "path": query.path, "files": files})))
}

async fn read_file(
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiQuery(query): ApiQuery<PathQuery>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    if query.path.is_empty() {
        return Err(ApiError::BadRequest("No file path provided".into()));
    }
    let project = state.load_project(id, &user).await?;
    let content = state.project_files(&project)?.read_file(&query.path)?;
    Ok(Json(json!({"status": "success", "path": query.path, "content": content})))
}

async fn save_file(
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<i64>,
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<SaveFileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state.load_project(id, &user).await?;
    let message = state
        .project_files(&project)?
        .write_file(&req.file_path, &req.content)?;
    Ok(Json(json!({"status": "success", "message": message})))
}

async fn create_file(
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<i64>,
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<CreateFileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state.load_project(id, &user).await?;
    let files = state.project_files(&project)?;
    let message = if req.is_directory {
        files.create_directory(&req.file_path)?
    } else {
        files.create_file(&req.file_path, &req.content)?
    };
    Ok(Json(json!({"status": "success", "message": message})))
}

async fn delete_file(
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<i64>,
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<DeleteFileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state.load_project(id, &user).await?;
    let message = state.project_files(&project)?.delete_file(&req.file_path)?;
    Ok(Json(json!({"status": "success", "message": message})))
}

async fn rename_file(
    AuthUser(user): AuthUser,
    ApiPath(id): ApiPath<i64>,
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<RenameFileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state.load_project(id, &user).await?;
    let message = state
        .project_files(&project)?
        .rename(&req.old_path, &req.new_path)?;
    Ok(Json(json!({"status": "success", "message": message})))
}

// ── Tests ─────────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::container::testing::FakeRuntime;
    use crate::server::models::ContainerStatus;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(t: &TestApp) -> Router {
        api_router().with_state(t.state.clone())
    }

    #[tokio::test]
    async fn test_health_check() {
        let t = TestApp::new();
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app(&t).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_requires_authentication() {
        let t = TestApp::new();
        let request = Request::builder()
            .uri("/api/projects")
            .body(Body::empty())
            .unwrap();
        let response = app(&t).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(
            body,
            json!({"status": "error", "message": "Authentication required"})
        );

        let response = app(&t)
            .oneshot(request_as("edv_wrong", "GET", "/api/projects", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_query_token_only_accepted_for_websockets() {
        let t = TestApp::new();
        let request = Request::builder()
            .uri(format!("/api/projects?token={}", t.token))
            .body(Body::empty())
            .unwrap();
        let response = app(&t).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_create_and_list_projects() {
        let t = TestApp::new();
        let response = app(&t)
            .oneshot(t.request(
                "POST",
                "/api/projects",
                Some(json!({"title": "  Web App ", "description": "demo"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["project"]["title"], "Web App");
        assert_eq!(body["project"]["container_image"], "python:3.11-slim");
        let id = body["project"]["id"].as_i64().unwrap();

        let data_dir = workspace::project_dir(&t.state.config.storage.data_root, t.user.id, id);
        assert!(data_dir.is_dir());

        let response = app(&t)
            .oneshot(t.request("GET", "/api/projects", None))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["projects"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_project_validates_title() {
        let t = TestApp::new();
        let response = app(&t)
            .oneshot(t.request("POST", "/api/projects", Some(json!({"title": "   "}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["message"], "Title is required");

        let long = "t".repeat(201);
        let response = app(&t)
            .oneshot(t.request("POST", "/api/projects", Some(json!({"title": long}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app(&t)
            .oneshot(t.request("POST", "/api/projects", Some(json!({}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["message"], "Title is required");
    }

    #[tokio::test]
    async fn test_malformed_requests_get_json_errors() {
        let t = TestApp::new();
        let project = t.create_project("Demo");

        let request = Request::builder()
            .method("POST")
            .uri("/api/projects")
            .header("authorization", format!("Bearer {}", t.token))
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app(&t).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({"status": "error", "message": "Invalid JSON in request body"})
        );

        let response = app(&t)
            .oneshot(t.request(
                "POST",
                &format!("/api/projects/{}/file/rename", project.id),
                Some(json!({"old_path": 7})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["message"], "Invalid JSON in request body");

        let request = Request::builder()
            .method("POST")
            .uri("/api/projects")
            .header("authorization", format!("Bearer {}", t.token))
            .body(Body::from(r#"{"title": "x"}"#))
            .unwrap();
        let response = app(&t).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["status"], "error");

        let response = app(&t)
            .oneshot(t.request("GET", "/api/projects/abc", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["status"], "error");
    }

    #[tokio::test]
    async fn test_other_users_project_is_not_found() {
        let t = TestApp::new();
        let project = t.create_project("Mine");
        let other = t.other_user_token();
        let response = app(&t)
            .oneshot(request_as(
                &other,
                "GET",
                &format!("/api/projects/{}", project.id),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["message"], "Project not found");
    }

    #[tokio::test]
    async fn test_update_project() {
        let t = TestApp::new();
        let project = t.create_project("Old");
        let response = app(&t)
            .oneshot(t.request(
                "PATCH",
                &format!("/api/projects/{}", project.id),
                Some(json!({"title": "New", "web_server_port": 8080})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["project"]["title"], "New");
        assert_eq!(body["project"]["web_server_port"], 8080);

        let response = app(&t)
            .oneshot(t.request(
                "PATCH",
                &format!("/api/projects/{}", project.id),
                Some(json!({"web_server_port": null})),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["project"]["title"], "New");
        assert!(body["project"]["web_server_port"].is_null());
    }

    #[tokio::test]
    async fn test_delete_project_removes_container_and_files() {
        let t = TestApp::with(
            FakeRuntime::with_container("c1", ContainerStatus::Running),
            Vec::new(),
        );
        let project = t.create_project("Doomed");
        t.state
            .db
            .lock_sync()
            .unwrap()
            .attach_container(project.id, "c1")
            .unwrap();
        let files = t.state.project_files(&project).unwrap();
        files.create_file("main.py", "print(1)").unwrap();

        let response = app(&t)
            .oneshot(t.request("DELETE", &format!("/api/projects/{}", project.id), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(t.runtime.containers.lock().unwrap().is_empty());
        assert!(!files.root().exists());

        let response = app(&t)
            .oneshot(t.request("GET", &format!("/api/projects/{}", project.id), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_container_lifecycle_endpoints() {
        let t = TestApp::new();
        let project = t.create_project("Box");
        let base = format!("/api/projects/{}/container", project.id);

        let response = app(&t)
            .oneshot(t.request("POST", &format!("{}/create", base), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Container created successfully");
        assert_eq!(body["container_status"], "created");

        let response = app(&t)
            .oneshot(t.request("POST", &format!("{}/start", base), None))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["container_status"], "running");

        let response = app(&t)
            .oneshot(t.request("GET", &format!("{}/status", base), None))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["container_status"], "running");

        let response = app(&t)
            .oneshot(t.request("POST", &format!("{}/remove", base), None))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["message"], "Container removed successfully");
        assert!(body["container_status"].is_null());
    }

    #[tokio::test]
    async fn test_container_errors_map_to_status_codes() {
        let t = TestApp::with(
            FakeRuntime {
                unavailable: true,
                ..Default::default()
            },
            Vec::new(),
        );
        let project = t.create_project("Box");

        let response = app(&t)
            .oneshot(t.request(
                "POST",
                &format!("/api/projects/{}/container/start", project.id),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["message"], "Project has no container");

        let response = app(&t)
            .oneshot(t.request(
                "POST",
                &format!("/api/projects/{}/container/create", project.id),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["message"], "Docker is not available");

        t.state
            .db
            .lock_sync()
            .unwrap()
            .attach_container(project.id, "ghost")
            .unwrap();
        let response = app(&t)
            .oneshot(t.request(
                "POST",
                &format!("/api/projects/{}/container/stop", project.id),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_file_endpoints() {
        let t = TestApp::new();
        let project = t.create_project("Files");
        let base = format!("/api/projects/{}", project.id);

        let response = app(&t)
            .oneshot(t.request(
                "POST",
                &format!("{}/file/create", base),
                Some(json!({"file_path": "src/main.py", "content": "print(1)"})),
            ))
            .await
            .unwrap();
        assert_eq!(
            body_json(response).await["message"],
            "File src/main.py created successfully."
        );

        let response = app(&t)
            .oneshot(t.request(
                "POST",
                &format!("{}/file/save", base),
                Some(json!({"file_path": "src/main.py", "content": "print(2)"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app(&t)
            .oneshot(t.request(
                "GET",
                &format!("{}/files/content?path=src/main.py", base),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["content"], "print(2)");

        let response = app(&t)
            .oneshot(t.request(
                "POST",
                &format!("{}/file/rename", base),
                Some(json!({"old_path": "src/main.py", "new_path": "app.py"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app(&t)
            .oneshot(t.request("GET", &format!("{}/files", base), None))
            .await
            .unwrap();
        let body = body_json(response).await;
        let names: Vec<&str> = body["files"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["src", "app.py"]);

        let response = app(&t)
            .oneshot(t.request(
                "POST",
                &format!("{}/file/delete", base),
                Some(json!({"file_path": "../outside.txt"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await["message"],
            crate::errors::INVALID_PATH_MESSAGE
        );
    }

    #[tokio::test]
    async fn test_read_missing_file_is_not_found() {
        let t = TestApp::new();
        let project = t.create_project("Files");
        let response = app(&t)
            .oneshot(t.request(
                "GET",
                &format!("/api/projects/{}/files/content?path=nope.py", project.id),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(response).await["message"],
            "File nope.py does not exist."
        );
    }

    #[tokio::test]
    async fn test_profile_api_key() {
        let t = TestApp::new();
        let response = app(&t)
            .oneshot(t.request("GET", "/api/profile", None))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["username"], "ada");
        assert_eq!(body["has_openai_api_key"], false);

        let response = app(&t)
            .oneshot(t.request(
                "PUT",
                "/api/profile",
                Some(json!({"openai_api_key": "sk-abc"})),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["has_openai_api_key"], true);

        let response = app(&t)
            .oneshot(t.request("PUT", "/api/profile", Some(json!({"openai_api_key": ""}))))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["has_openai_api_key"], false);
    }

    #[test]
    fn test_require_api_key() {
        let mut user = User {
            id: 1,
            username: "ada".into(),
            openai_api_key: None,
            created_at: String::new(),
        };
        match require_api_key(&user) {
            Err(ApiError::BadRequest(msg)) => assert_eq!(msg, MISSING_API_KEY_MESSAGE),
            other => panic!("unexpected {:?}", other),
        }
        user.openai_api_key = Some("sk-1".into());
        assert_eq!(require_api_key(&user).unwrap(), "sk-1");
    }
}
