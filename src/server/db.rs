use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;
use crate::reasoning::step::StepType;

/// Async-safe handle to the project database.
///
/// Wraps `ProjectDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<ProjectDb>>,
}

impl DbHandle {
    pub fn new(db: ProjectDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ProjectDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For CLI commands, startup
    /// and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, ProjectDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct ProjectDb {
    conn: Connection,
}

const PROJECT_COLUMNS: &str = "id, user_id, title, description, created_at, updated_at, \
     container_id, container_status, container_image, container_created_at, web_server_port";

const STEP_COLUMNS: &str = "id, session_id, step_number, step_type, prompt, response, model_used, \
     tool_calls, tool_results, is_complete, error, created_at, updated_at";

const SESSION_COLUMNS: &str =
    "id, project_id, user_id, title, description, is_complete, created_at, updated_at";

impl ProjectDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL UNIQUE,
                    token_hash TEXT NOT NULL UNIQUE,
                    openai_api_key TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    container_id TEXT,
                    container_status TEXT,
                    container_image TEXT NOT NULL DEFAULT 'python:3.11-slim',
                    container_created_at TEXT,
                    web_server_port INTEGER
                );

                CREATE TABLE IF NOT EXISTS reasoning_sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    is_complete INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS reasoning_steps (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id INTEGER NOT NULL REFERENCES reasoning_sessions(id) ON DELETE CASCADE,
                    step_number INTEGER NOT NULL,
                    step_type TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    response TEXT NOT NULL DEFAULT '',
                    model_used TEXT NOT NULL DEFAULT '',
                    tool_calls TEXT NOT NULL DEFAULT '[]',
                    tool_results TEXT NOT NULL DEFAULT '[]',
                    is_complete INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(session_id, step_number)
                );

                CREATE TABLE IF NOT EXISTS chat_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    timestamp TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_projects_user ON projects(user_id);
                CREATE INDEX IF NOT EXISTS idx_sessions_project ON reasoning_sessions(project_id);
                CREATE INDEX IF NOT EXISTS idx_steps_session ON reasoning_steps(session_id);
                CREATE INDEX IF NOT EXISTS idx_chat_project ON chat_messages(project_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub fn create_user(&self, username: &str, token_hash: &str) -> Result<User> {
        self.conn
            .execute(
                "INSERT INTO users (username, token_hash) VALUES (?1, ?2)",
                params![username, token_hash],
            )
            .with_context(|| format!("Failed to create user '{}'", username))?;
        let id = self.conn.last_insert_rowid();
        self.get_user(id)?.context("User not found after insert")
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.query_user("WHERE id = ?1", params![id])
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.query_user("WHERE username = ?1", params![username])
    }

    pub fn find_user_by_token(&self, token_hash: &str) -> Result<Option<User>> {
        self.query_user("WHERE token_hash = ?1", params![token_hash])
    }

    fn query_user(&self, clause: &str, args: impl rusqlite::Params) -> Result<Option<User>> {
        let sql = format!(
            "SELECT id, username, openai_api_key, created_at FROM users {}",
            clause
        );
        self.conn
            .query_row(&sql, args, |row| {
                Ok(User {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    openai_api_key: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .optional()
            .context("Failed to query user")
    }

    pub fn set_token_hash(&self, user_id: i64, token_hash: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE users SET token_hash = ?1 WHERE id = ?2",
                params![token_hash, user_id],
            )
            .context("Failed to update token")?;
        Ok(())
    }

    /// Set or clear (with `None`) the user's OpenAI API key.
    pub fn set_openai_api_key(&self, user_id: i64, key: Option<&str>) -> Result<User> {
        self.conn
            .execute(
                "UPDATE users SET openai_api_key = ?1 WHERE id = ?2",
                params![key, user_id],
            )
            .context("Failed to update API key")?;
        self.get_user(user_id)?
            .context("User not found after key update")
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(
        &self,
        user_id: i64,
        title: &str,
        description: &str,
        container_image: &str,
    ) -> Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (user_id, title, description, container_image)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, title, description, container_image],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id, user_id)?
            .context("Project not found after insert")
    }

    pub fn list_projects(&self, user_id: i64) -> Result<Vec<Project>> {
        let sql = format!(
            "SELECT {} FROM projects WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
            PROJECT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map(params![user_id], ProjectRow::from_row)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?.into_project()?);
        }
        Ok(projects)
    }

    /// Fetch a project owned by `user_id`. Another user's project is `None`.
    pub fn get_project(&self, id: i64, user_id: i64) -> Result<Option<Project>> {
        let sql = format!(
            "SELECT {} FROM projects WHERE id = ?1 AND user_id = ?2",
            PROJECT_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![id, user_id], ProjectRow::from_row)
            .optional()
            .context("Failed to query project")?;
        row.map(ProjectRow::into_project).transpose()
    }

    fn get_project_unscoped(&self, id: i64) -> Result<Project> {
        let sql = format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS);
        self.conn
            .query_row(&sql, params![id], ProjectRow::from_row)
            .context("Project not found")?
            .into_project()
    }

    pub fn update_project(
        &self,
        id: i64,
        user_id: i64,
        update: &ProjectUpdate,
    ) -> Result<Option<Project>> {
        let Some(current) = self.get_project(id, user_id)? else {
            return Ok(None);
        };
        let title = update.title.as_deref().unwrap_or(&current.title);
        let description = update
            .description
            .as_deref()
            .unwrap_or(&current.description);
        let image = update
            .container_image
            .as_deref()
            .unwrap_or(&current.container_image);
        let port = update.web_server_port.unwrap_or(current.web_server_port);
        self.conn
            .execute(
                "UPDATE projects SET title = ?1, description = ?2, container_image = ?3,
                 web_server_port = ?4, updated_at = datetime('now') WHERE id = ?5",
                params![title, description, image, port, id],
            )
            .context("Failed to update project")?;
        self.get_project(id, user_id)
    }

    pub fn delete_project(&self, id: i64, user_id: i64) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM projects WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .context("Failed to delete project")?;
        Ok(affected > 0)
    }

    /// Record a freshly created container on the project.
    pub fn attach_container(&self, id: i64, container_id: &str) -> Result<Project> {
        self.conn
            .execute(
                "UPDATE projects SET container_id = ?1, container_status = ?2,
                 container_created_at = datetime('now'), updated_at = datetime('now')
                 WHERE id = ?3",
                params![container_id, ContainerStatus::Created.as_str(), id],
            )
            .context("Failed to attach container")?;
        self.get_project_unscoped(id)
    }

    pub fn set_container_state(&self, id: i64, status: ContainerStatus) -> Result<Project> {
        self.conn
            .execute(
                "UPDATE projects SET container_status = ?1, updated_at = datetime('now')
                 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update container status")?;
        self.get_project_unscoped(id)
    }

    /// Forget the project's container entirely.
    pub fn clear_container(&self, id: i64) -> Result<Project> {
        self.conn
            .execute(
                "UPDATE projects SET container_id = NULL, container_status = NULL,
                 container_created_at = NULL, updated_at = datetime('now') WHERE id = ?1",
                params![id],
            )
            .context("Failed to clear container")?;
        self.get_project_unscoped(id)
    }

    // ── Reasoning sessions ────────────────────────────────────────────

    pub fn create_session(
        &self,
        project_id: i64,
        user_id: i64,
        title: &str,
        description: &str,
    ) -> Result<ReasoningSession> {
        self.conn
            .execute(
                "INSERT INTO reasoning_sessions (project_id, user_id, title, description)
                 VALUES (?1, ?2, ?3, ?4)",
                params![project_id, user_id, title, description],
            )
            .context("Failed to insert reasoning session")?;
        let id = self.conn.last_insert_rowid();
        self.get_session(id, project_id)?
            .context("Session not found after insert")
    }

    pub fn get_session(&self, id: i64, project_id: i64) -> Result<Option<ReasoningSession>> {
        let sql = format!(
            "SELECT {} FROM reasoning_sessions WHERE id = ?1 AND project_id = ?2",
            SESSION_COLUMNS
        );
        self.conn
            .query_row(&sql, params![id, project_id], session_from_row)
            .optional()
            .context("Failed to query reasoning session")
    }

    pub fn list_sessions(&self, project_id: i64) -> Result<Vec<SessionSummary>> {
        let sql = format!(
            "SELECT {}, (SELECT COUNT(*) FROM reasoning_steps st WHERE st.session_id = s.id)
             FROM reasoning_sessions s WHERE project_id = ?1
             ORDER BY created_at DESC, id DESC",
            SESSION_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_sessions")?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok(SessionSummary {
                    session: session_from_row(row)?,
                    step_count: row.get(8)?,
                })
            })
            .context("Failed to query reasoning sessions")?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row.context("Failed to read session row")?);
        }
        Ok(sessions)
    }

    pub fn get_session_detail(&self, id: i64, project_id: i64) -> Result<Option<SessionDetail>> {
        let Some(session) = self.get_session(id, project_id)? else {
            return Ok(None);
        };
        let steps = self.list_steps(id)?;
        Ok(Some(SessionDetail { session, steps }))
    }

    pub fn mark_session_complete(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE reasoning_sessions SET is_complete = 1, updated_at = datetime('now')
                 WHERE id = ?1",
                params![id],
            )
            .context("Failed to complete reasoning session")?;
        Ok(())
    }

    pub fn delete_session(&self, id: i64) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM reasoning_sessions WHERE id = ?1", params![id])
            .context("Failed to delete reasoning session")?;
        Ok(affected > 0)
    }

    // ── Reasoning steps ───────────────────────────────────────────────

    /// Insert a pending step. Without an explicit `step_number` the step is
    /// numbered one past the highest in the session, inside the same statement.
    pub fn create_step(
        &self,
        session_id: i64,
        step_number: Option<i64>,
        step_type: StepType,
        prompt: &str,
        model_used: &str,
    ) -> Result<ReasoningStep> {
        self.conn
            .execute(
                "INSERT INTO reasoning_steps (session_id, step_number, step_type, prompt, model_used)
                 VALUES (?1, COALESCE(?2, (SELECT COALESCE(MAX(step_number), 0) + 1
                                           FROM reasoning_steps WHERE session_id = ?1)),
                         ?3, ?4, ?5)",
                params![session_id, step_number, step_type.as_str(), prompt, model_used],
            )
            .with_context(|| format!("Failed to insert step for session {}", session_id))?;
        let id = self.conn.last_insert_rowid();
        self.get_step(id)?.context("Step not found after insert")
    }

    pub fn get_step(&self, id: i64) -> Result<Option<ReasoningStep>> {
        let sql = format!("SELECT {} FROM reasoning_steps WHERE id = ?1", STEP_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], StepRow::from_row)
            .optional()
            .context("Failed to query reasoning step")?;
        row.map(StepRow::into_step).transpose()
    }

    pub fn complete_step(
        &self,
        id: i64,
        response: &str,
        tool_calls: &[ToolCallRecord],
    ) -> Result<ReasoningStep> {
        let results: Vec<&serde_json::Value> = tool_calls.iter().map(|c| &c.result).collect();
        let calls_json =
            serde_json::to_string(tool_calls).context("Failed to serialize tool calls")?;
        let results_json =
            serde_json::to_string(&results).context("Failed to serialize tool results")?;
        self.conn
            .execute(
                "UPDATE reasoning_steps SET response = ?1, tool_calls = ?2, tool_results = ?3,
                 is_complete = 1, error = NULL, updated_at = datetime('now') WHERE id = ?4",
                params![response, calls_json, results_json, id],
            )
            .context("Failed to complete reasoning step")?;
        self.get_step(id)?.context("Step not found after update")
    }

    pub fn fail_step(&self, id: i64, error: &str) -> Result<ReasoningStep> {
        self.conn
            .execute(
                "UPDATE reasoning_steps SET error = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![error, id],
            )
            .context("Failed to record step error")?;
        self.get_step(id)?.context("Step not found after update")
    }

    pub fn list_steps(&self, session_id: i64) -> Result<Vec<ReasoningStep>> {
        let sql = format!(
            "SELECT {} FROM reasoning_steps WHERE session_id = ?1 ORDER BY step_number",
            STEP_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_steps")?;
        let rows = stmt
            .query_map(params![session_id], StepRow::from_row)
            .context("Failed to query reasoning steps")?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row.context("Failed to read step row")?.into_step()?);
        }
        Ok(steps)
    }

    // ── Chat ──────────────────────────────────────────────────────────

    pub fn add_chat_message(
        &self,
        project_id: i64,
        user_id: i64,
        role: ChatRole,
        content: &str,
    ) -> Result<ChatMessage> {
        self.conn
            .execute(
                "INSERT INTO chat_messages (project_id, user_id, role, content)
                 VALUES (?1, ?2, ?3, ?4)",
                params![project_id, user_id, role.as_str(), content],
            )
            .context("Failed to insert chat message")?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, project_id, user_id, role, content, timestamp
                 FROM chat_messages WHERE id = ?1",
                params![id],
                ChatRow::from_row,
            )
            .context("Chat message not found after insert")?
            .into_message()
    }

    /// The `limit` most recent messages before `exclude` (if given), returned
    /// oldest first.
    pub fn recent_chat_messages(
        &self,
        project_id: i64,
        limit: usize,
        exclude: Option<i64>,
    ) -> Result<Vec<ChatMessage>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, user_id, role, content, timestamp FROM chat_messages
                 WHERE project_id = ?1 AND id != ?2
                 ORDER BY timestamp DESC, id DESC LIMIT ?3",
            )
            .context("Failed to prepare recent_chat_messages")?;
        let rows = stmt
            .query_map(
                params![project_id, exclude.unwrap_or(-1), limit as i64],
                ChatRow::from_row,
            )
            .context("Failed to query chat messages")?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.context("Failed to read chat row")?.into_message()?);
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn chat_history(&self, project_id: i64) -> Result<Vec<ChatMessage>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, user_id, role, content, timestamp FROM chat_messages
                 WHERE project_id = ?1 ORDER BY timestamp, id",
            )
            .context("Failed to prepare chat_history")?;
        let rows = stmt
            .query_map(params![project_id], ChatRow::from_row)
            .context("Failed to query chat history")?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.context("Failed to read chat row")?.into_message()?);
        }
        Ok(messages)
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<ReasoningSession> {
    Ok(ReasoningSession {
        id: row.get(0)?,
        project_id: row.get(1)?,
        user_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        is_complete: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/// Intermediate row struct for projects before parsing the container status.
struct ProjectRow {
    id: i64,
    user_id: i64,
    title: String,
    description: String,
    created_at: String,
    updated_at: String,
    container_id: Option<String>,
    container_status: Option<String>,
    container_image: String,
    container_created_at: Option<String>,
    web_server_port: Option<u16>,
}

impl ProjectRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            container_id: row.get(6)?,
            container_status: row.get(7)?,
            container_image: row.get(8)?,
            container_created_at: row.get(9)?,
            web_server_port: row.get(10)?,
        })
    }

    fn into_project(self) -> Result<Project> {
        let container_status = self
            .container_status
            .as_deref()
            .map(ContainerStatus::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse container status")?;
        Ok(Project {
            id: self.id,
            user_id: self.user_id,
            title: self.title,
            description: self.description,
            created_at: self.created_at,
            updated_at: self.updated_at,
            container_id: self.container_id,
            container_status,
            container_image: self.container_image,
            container_created_at: self.container_created_at,
            web_server_port: self.web_server_port,
        })
    }
}

/// Intermediate row struct for reasoning steps (JSON columns, step type).
struct StepRow {
    id: i64,
    session_id: i64,
    step_number: i64,
    step_type: String,
    prompt: String,
    response: String,
    model_used: String,
    tool_calls: String,
    tool_results: String,
    is_complete: bool,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl StepRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            step_number: row.get(2)?,
            step_type: row.get(3)?,
            prompt: row.get(4)?,
            response: row.get(5)?,
            model_used: row.get(6)?,
            tool_calls: row.get(7)?,
            tool_results: row.get(8)?,
            is_complete: row.get(9)?,
            error: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_step(self) -> Result<ReasoningStep> {
        let step_type = StepType::from_str(&self.step_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse step type")?;
        let tool_calls: Vec<ToolCallRecord> =
            serde_json::from_str(&self.tool_calls).context("Failed to parse tool calls JSON")?;
        let tool_results: Vec<serde_json::Value> = serde_json::from_str(&self.tool_results)
            .context("Failed to parse tool results JSON")?;
        Ok(ReasoningStep {
            id: self.id,
            session_id: self.session_id,
            step_number: self.step_number,
            step_type,
            prompt: self.prompt,
            response: self.response,
            model_used: self.model_used,
            tool_calls,
            tool_results,
            is_complete: self.is_complete,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct ChatRow {
    id: i64,
    project_id: i64,
    user_id: i64,
    role: String,
    content: String,
    timestamp: String,
}

impl ChatRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            user_id: row.get(2)?,
            role: row.get(3)?,
            content: row.get(4)?,
            timestamp: row.get(5)?,
        })
    }

    fn into_message(self) -> Result<ChatMessage> {
        let role = ChatRole::from_str(&self.role)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse chat role")?;
        Ok(ChatMessage {
            id: self.id,
            project_id: self.project_id,
            user_id: self.user_id,
            role,
            content: self.content,
            timestamp: self.timestamp,
        })
    }
}
