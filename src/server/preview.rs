//! Reverse proxy to a web server running inside a project's container.
//!
//! Errors here are plain text, since they end up rendered in the preview
//! frame rather than read by the API client.

use axum::{
    body::{Body, to_bytes},
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use super::api::{ApiError, SharedState};
use super::auth::AuthUser;
use super::models::ContainerStatus;

/// Largest request body forwarded to the container.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Response headers that describe the upstream encoding of the body, which
/// no longer holds once the body is re-sent.
const SKIPPED_RESPONSE_HEADERS: [header::HeaderName; 3] = [
    header::CONTENT_ENCODING,
    header::TRANSFER_ENCODING,
    header::CONTENT_LENGTH,
];

pub async fn preview_root(
    user: AuthUser,
    Path(project_id): Path<i64>,
    State(state): State<SharedState>,
    request: Request,
) -> Result<Response, ApiError> {
    proxy(user, project_id, String::new(), state, request).await
}

pub async fn preview_path(
    user: AuthUser,
    Path((project_id, path)): Path<(i64, String)>,
    State(state): State<SharedState>,
    request: Request,
) -> Result<Response, ApiError> {
    proxy(user, project_id, path, state, request).await
}

fn plain(status: StatusCode, message: impl Into<String>) -> Response {
    (status, message.into()).into_response()
}

/// The query string to forward: the original one without the auth token.
fn forwarded_query(query: Option<&str>) -> Option<String> {
    let kept: Vec<&str> = query?
        .split('&')
        .filter(|pair| !pair.is_empty() && !pair.starts_with("token="))
        .collect();
    (!kept.is_empty()).then(|| kept.join("&"))
}

fn target_url(port: u16, path: &str, query: Option<&str>) -> String {
    let mut url = format!("http://localhost:{}/{}", port, path.trim_start_matches('/'));
    if let Some(query) = forwarded_query(query) {
        url.push('?');
        url.push_str(&query);
    }
    url
}

async fn proxy(
    AuthUser(user): AuthUser,
    project_id: i64,
    path: String,
    state: SharedState,
    request: Request,
) -> Result<Response, ApiError> {
    let project = state.load_project(project_id, &user).await?;
    let Some(port) = project.web_server_port else {
        return Ok(plain(
            StatusCode::NOT_FOUND,
            "No web server port configured for this project.",
        ));
    };
    match state.containers.status(&project).await? {
        Some(ContainerStatus::Running) => {}
        other => {
            let status = other.map_or_else(|| "None".to_string(), |s| s.to_string());
            return Ok(plain(
                StatusCode::NOT_FOUND,
                format!("Container is not running. Current status: {}", status),
            ));
        }
    }

    let (parts, body) = request.into_parts();
    let url = target_url(port, &path, parts.uri.query());
    debug!(project_id, method = %parts.method, url = %url, "Proxying preview request");

    // The container runs generated code; it never sees the caller's credentials.
    let mut headers = parts.headers;
    for name in [header::HOST, header::AUTHORIZATION, header::COOKIE] {
        headers.remove(name);
    }
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return Ok(plain(
                StatusCode::BAD_REQUEST,
                format!("Error proxying request: {}", e),
            ));
        }
    };

    let upstream = state
        .http
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await;
    let upstream = match upstream {
        Ok(resp) => resp,
        Err(e) if e.is_timeout() => {
            warn!(project_id, url = %url, "Preview request timed out");
            return Ok(plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Request to the container timed out.",
            ));
        }
        Err(e) if e.is_connect() => {
            warn!(project_id, url = %url, error = %e, "Preview connection failed");
            return Ok(plain(
                StatusCode::NOT_FOUND,
                "Could not connect to the web server in the container.",
            ));
        }
        Err(e) => {
            warn!(project_id, url = %url, error = %e, "Preview request failed");
            return Ok(plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error proxying request: {}", e),
            ));
        }
    };

    let status = upstream.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if !SKIPPED_RESPONSE_HEADERS.contains(name) {
            response_headers.append(name.clone(), value.clone());
        }
    }
    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            return Ok(plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error proxying request: {}", e),
            ));
        }
    };

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::testing::FakeRuntime;
    use crate::server::api::testing::TestApp;
    use crate::server::models::{Project, ProjectUpdate};
    use axum::Router;
    use axum::http::HeaderValue;
    use axum::routing::any;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app(t: &TestApp) -> Router {
        Router::new()
            .route("/preview/{project_id}", any(preview_root))
            .route("/preview/{project_id}/{*path}", any(preview_path))
            .with_state(t.state.clone())
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn running_project(t: &TestApp, port: Option<u16>) -> Project {
        let project = t.create_project("Site");
        let db = t.state.db.lock_sync().unwrap();
        db.attach_container(project.id, "c1").unwrap();
        db.set_container_state(project.id, ContainerStatus::Running)
            .unwrap();
        db.update_project(
            project.id,
            t.user.id,
            &ProjectUpdate {
                web_server_port: Some(port),
                ..Default::default()
            },
        )
        .unwrap()
        .unwrap()
    }

    /// Answers any path with the method, full URI and credential headers it
    /// received.
    async fn spawn_upstream() -> u16 {
        let router = Router::new().route(
            "/{*path}",
            any(|request: Request| async move {
                let header_text = |name: header::HeaderName| {
                    request
                        .headers()
                        .get(name)
                        .map(|h| h.to_str().unwrap().to_string())
                        .unwrap_or_default()
                };
                let text = format!(
                    "{} {} host={} auth={} cookie={}",
                    request.method(),
                    request.uri(),
                    header_text(header::HOST),
                    header_text(header::AUTHORIZATION),
                    header_text(header::COOKIE),
                );
                ([("x-upstream", "yes")], text)
            }),
        );
        let listener = tokio::net::TcpListener::bind("localhost:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    #[test]
    fn test_target_url_strips_token_and_keeps_query() {
        assert_eq!(target_url(3000, "", None), "http://localhost:3000/");
        assert_eq!(
            target_url(3000, "static/app.js", Some("v=2&token=edv_x")),
            "http://localhost:3000/static/app.js?v=2"
        );
        assert_eq!(
            target_url(8080, "/a", Some("token=edv_x")),
            "http://localhost:8080/a"
        );
    }

    #[tokio::test]
    async fn test_no_port_configured() {
        let t = TestApp::with(
            FakeRuntime::with_container("c1", ContainerStatus::Running),
            Vec::new(),
        );
        let project = running_project(&t, None);
        let response = app(&t)
            .oneshot(t.request("GET", &format!("/preview/{}", project.id), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_text(response).await,
            "No web server port configured for this project."
        );
    }

    #[tokio::test]
    async fn test_container_not_running() {
        let t = TestApp::with(
            FakeRuntime::with_container("c1", ContainerStatus::Exited),
            Vec::new(),
        );
        let project = running_project(&t, Some(3000));
        let response = app(&t)
            .oneshot(t.request("GET", &format!("/preview/{}/index.html", project.id), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_text(response).await,
            "Container is not running. Current status: exited"
        );
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let t = TestApp::with(
            FakeRuntime::with_container("c1", ContainerStatus::Running),
            Vec::new(),
        );
        let port = {
            let listener = std::net::TcpListener::bind("localhost:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let project = running_project(&t, Some(port));
        let response = app(&t)
            .oneshot(t.request("GET", &format!("/preview/{}", project.id), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_text(response).await,
            "Could not connect to the web server in the container."
        );
    }

    #[tokio::test]
    async fn test_forwards_request() {
        let t = TestApp::with(
            FakeRuntime::with_container("c1", ContainerStatus::Running),
            Vec::new(),
        );
        let port = spawn_upstream().await;
        let project = running_project(&t, Some(port));

        let response = app(&t)
            .oneshot(t.request(
                "POST",
                &format!("/preview/{}/echo?q=1", project.id),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-upstream"], "yes");
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
        let text = body_text(response).await;
        assert!(text.starts_with("POST /echo?q=1"), "{text}");
        assert!(text.contains(&format!("host=localhost:{}", port)), "{text}");
    }

    #[tokio::test]
    async fn test_credentials_stay_out_of_the_container() {
        let t = TestApp::with(
            FakeRuntime::with_container("c1", ContainerStatus::Running),
            Vec::new(),
        );
        let port = spawn_upstream().await;
        let project = running_project(&t, Some(port));

        let mut request = t.request("GET", &format!("/preview/{}/page", project.id), None);
        request
            .headers_mut()
            .insert(header::COOKIE, HeaderValue::from_static("sessionid=abc"));
        let response = app(&t).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.ends_with("auth= cookie="), "{text}");
        assert!(!text.contains(&t.token), "{text}");

        let request = axum::http::Request::builder()
            .uri(format!("/preview/{}/page?token={}", project.id, t.token))
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app(&t).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.starts_with("GET /page host="), "{text}");
        assert!(text.ends_with("auth= cookie="), "{text}");
    }
}
