use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::api::{self, AppState, SharedState};
use super::db::{DbHandle, ProjectDb};
use super::{preview, reasoning_api, ws};
use crate::config::Config;
use crate::container::docker::DockerRuntime;
use crate::reasoning::llm::OpenAiFactory;

/// Configuration for the HTTP server.
pub struct ServerConfig {
    pub config: Config,
    pub dev_mode: bool,
}

/// Build the full application router: JSON API, WebSocket notifications,
/// preview proxy, static files and the crawler files.
pub fn build_router(state: SharedState) -> Router {
    let mut router = api::api_router();
    if let Some(dir) = &state.config.server.static_dir {
        router = router.nest_service("/static", ServeDir::new(dir));
    }
    router
        .merge(reasoning_api::reasoning_router())
        .route("/ws/tools/{project_id}", get(ws::ws_handler))
        .route("/preview/{project_id}", any(preview::preview_root))
        .route("/preview/{project_id}/{*path}", any(preview::preview_path))
        .route("/robots.txt", get(robots_txt))
        .route("/sitemap.xml", get(sitemap_xml))
        .fallback(not_found)
        .layer(middleware::from_fn(no_cache))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"status": "error", "message": "Not found"})),
    )
}

async fn robots_txt(State(state): State<SharedState>) -> impl IntoResponse {
    let base = state.config.server.base_url.trim_end_matches('/');
    (
        [(header::CONTENT_TYPE, "text/plain")],
        format!("User-agent: *\nAllow: /\n\nSitemap: {}/sitemap.xml\n", base),
    )
}

async fn sitemap_xml(State(state): State<SharedState>) -> impl IntoResponse {
    let base = state.config.server.base_url.trim_end_matches('/');
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\">\n  \
         <url>\n    <loc>{}/</loc>\n    <changefreq>weekly</changefreq>\n    \
         <priority>1.0</priority>\n  </url>\n</urlset>\n",
        base
    );
    ([(header::CONTENT_TYPE, "application/xml")], body)
}

fn is_uncacheable(path: &str) -> bool {
    path == "/" || path.starts_with("/api/auth/") || path.contains("login") || path.contains("signup")
}

/// Mark responses for the landing page and authentication paths as
/// uncacheable.
async fn no_cache(request: Request, next: Next) -> Response {
    let uncacheable = is_uncacheable(request.uri().path());
    let mut response = next.run(request).await;
    if uncacheable {
        let headers = response.headers_mut();
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store, no-cache, must-revalidate, max-age=0"),
        );
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    }
    response
}

/// Open the database at the configured path, creating its directory.
pub fn open_database(config: &Config) -> Result<DbHandle> {
    let db_path = &config.storage.db_path;
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = ProjectDb::new(db_path).context("Failed to initialize database")?;
    Ok(DbHandle::new(db))
}

/// Start the server and run until Ctrl+C.
pub async fn start_server(server: ServerConfig) -> Result<()> {
    let config = server.config;
    let db = open_database(&config)?;
    std::fs::create_dir_all(&config.storage.data_root)
        .context("Failed to create project data directory")?;

    let models = Arc::new(OpenAiFactory::new(&config.llm)?);
    let runtime = Arc::new(DockerRuntime::connect());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState::new(config, db, runtime, models)?);

    if !state.containers.is_available().await {
        warn!("Docker is not reachable; container features will report errors");
    }

    let mut app = build_router(state);
    if server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, dev_mode = server.dev_mode, "Edocebiv listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Shutting down");
}
