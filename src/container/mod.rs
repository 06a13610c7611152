//! Per-project Docker containers.
//!
//! `ContainerRuntime` is the seam to the container engine (`DockerRuntime`
//! in production, an in-memory fake in tests). `ContainerManager` drives the
//! lifecycle for a project and keeps the project's container fields in the
//! database in step with what the engine reports.

pub mod docker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::ContainerSettings;
use crate::errors::ContainerError;
use crate::server::db::DbHandle;
use crate::server::models::{ContainerStatus, Project};
use crate::workspace;

pub use docker::DockerRuntime;

type Result<T> = std::result::Result<T, ContainerError>;

/// Everything needed to create a project container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    /// `host:container:mode` bind mounts
    pub binds: Vec<String>,
    pub working_dir: String,
    /// `KEY=value` pairs
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// Container engine operations. Missing containers are reported as
/// `ContainerError::NotFound`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the engine is reachable.
    async fn ping(&self) -> bool;
    /// Make sure `image` is present locally, pulling it if necessary.
    async fn ensure_image(&self, image: &str) -> Result<()>;
    /// Force-remove a container by name. Succeeds if none exists.
    async fn remove_by_name(&self, name: &str) -> Result<()>;
    /// Create a container and return its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start(&self, id: &str) -> Result<()>;
    async fn stop(&self, id: &str) -> Result<()>;
    async fn remove(&self, id: &str) -> Result<()>;
    async fn state(&self, id: &str) -> Result<ContainerStatus>;
    /// Run `cmd` inside the container and collect its output.
    async fn exec(&self, id: &str, cmd: Vec<String>, working_dir: &str) -> Result<ExecOutput>;
}

/// Container name for a project: `project_{id}_{title}` with the title
/// lowercased and reduced to characters Docker accepts.
pub fn container_name(project: &Project) -> String {
    let title: String = project
        .title
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '.' | '-' => c,
            _ => '_',
        })
        .collect();
    format!("project_{}_{}", project.id, title)
}

pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    db: DbHandle,
    settings: ContainerSettings,
    data_root: PathBuf,
}

impl ContainerManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        db: DbHandle,
        settings: ContainerSettings,
        data_root: PathBuf,
    ) -> Self {
        Self {
            runtime,
            db,
            settings,
            data_root,
        }
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    pub async fn is_available(&self) -> bool {
        self.runtime.ping().await
    }

    fn container_id(project: &Project) -> Result<&str> {
        project
            .container_id
            .as_deref()
            .ok_or(ContainerError::NoContainer)
    }

    /// Create the project's container and record it as `created`.
    pub async fn create(&self, project: &Project) -> Result<Project> {
        if !self.runtime.ping().await {
            return Err(ContainerError::Unavailable);
        }

        let data_dir = workspace::project_dir(&self.data_root, project.user_id, project.id);
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", data_dir.display(), e))?;
        let host_dir = std::path::absolute(&data_dir)
            .map_err(|e| anyhow::anyhow!("Failed to resolve {}: {}", data_dir.display(), e))?;

        self.runtime.ensure_image(&project.container_image).await?;

        let name = container_name(project);
        self.runtime.remove_by_name(&name).await?;

        let spec = ContainerSpec {
            name: name.clone(),
            image: project.container_image.clone(),
            command: vec!["tail".into(), "-f".into(), "/dev/null".into()],
            binds: vec![format!(
                "{}:{}:rw",
                host_dir.display(),
                self.settings.mount_path
            )],
            working_dir: self.settings.working_dir.clone(),
            env: vec![
                format!("PROJECT_ID={}", project.id),
                format!("PROJECT_TITLE={}", project.title),
            ],
        };
        let id = self.runtime.create(&spec).await?;
        info!(project_id = project.id, container = %id, name = %name, "Container created");

        let project_id = project.id;
        let updated = self
            .db
            .call(move |db| db.attach_container(project_id, &id))
            .await?;
        Ok(updated)
    }

    pub async fn start(&self, project: &Project) -> Result<Project> {
        let id = Self::container_id(project)?;
        match self.runtime.start(id).await {
            Ok(()) => {
                info!(project_id = project.id, container = %id, "Container started");
                self.persist_status(project.id, ContainerStatus::Running)
                    .await
            }
            Err(ContainerError::NotFound { id }) => {
                self.forget(project.id).await?;
                Err(ContainerError::NotFound { id })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn stop(&self, project: &Project) -> Result<Project> {
        let id = Self::container_id(project)?;
        match self.runtime.stop(id).await {
            Ok(()) => {
                info!(project_id = project.id, container = %id, "Container stopped");
                self.persist_status(project.id, ContainerStatus::Stopped)
                    .await
            }
            Err(ContainerError::NotFound { id }) => {
                self.forget(project.id).await?;
                Err(ContainerError::NotFound { id })
            }
            Err(e) => Err(e),
        }
    }

    /// Stop (if running) and remove the container. A container that no
    /// longer exists counts as removed.
    pub async fn remove(&self, project: &Project) -> Result<Project> {
        let id = Self::container_id(project)?;
        let outcome = async {
            if self.runtime.state(id).await? == ContainerStatus::Running {
                self.runtime.stop(id).await?;
            }
            self.runtime.remove(id).await
        }
        .await;

        match outcome {
            Ok(()) => info!(project_id = project.id, container = %id, "Container removed"),
            Err(ContainerError::NotFound { .. }) => {
                warn!(project_id = project.id, container = %id, "Container already gone");
            }
            Err(e) => return Err(e),
        }
        self.forget(project.id).await
    }

    /// Live status from the engine. `None` when the project has no container
    /// or its container has disappeared (the stale id is then cleared).
    pub async fn status(&self, project: &Project) -> Result<Option<ContainerStatus>> {
        let Some(id) = project.container_id.as_deref() else {
            return Ok(None);
        };
        match self.runtime.state(id).await {
            Ok(status) => {
                if project.container_status != Some(status) {
                    self.persist_status(project.id, status).await?;
                }
                Ok(Some(status))
            }
            Err(ContainerError::NotFound { .. }) => {
                warn!(project_id = project.id, container = %id, "Container not found, clearing");
                self.forget(project.id).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Run a shell command in the project's running container.
    pub async fn exec(
        &self,
        project: &Project,
        command: &str,
        timeout_secs: u64,
    ) -> Result<ExecOutput> {
        let id = Self::container_id(project)?.to_string();
        match self.status(project).await? {
            Some(ContainerStatus::Running) => {}
            other => {
                return Err(ContainerError::NotRunning {
                    status: other.map_or_else(|| "None".to_string(), |s| s.to_string()),
                });
            }
        }

        info!(project_id = project.id, command, "Executing in container");
        let cmd = vec!["bash".to_string(), "-c".to_string(), command.to_string()];
        let exec = self.runtime.exec(&id, cmd, &self.settings.working_dir);
        match tokio::time::timeout(Duration::from_secs(timeout_secs), exec).await {
            Ok(result) => result,
            Err(_) => Err(ContainerError::Timeout {
                seconds: timeout_secs,
            }),
        }
    }

    async fn persist_status(&self, project_id: i64, status: ContainerStatus) -> Result<Project> {
        Ok(self
            .db
            .call(move |db| db.set_container_state(project_id, status))
            .await?)
    }

    async fn forget(&self, project_id: i64) -> Result<Project> {
        Ok(self
            .db
            .call(move |db| db.clear_container(project_id))
            .await?)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeRuntime;
    use super::*;
    use crate::server::db::ProjectDb;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: DbHandle,
        runtime: Arc<FakeRuntime>,
        manager: ContainerManager,
        project: Project,
    }

    fn fixture(runtime: FakeRuntime) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = DbHandle::new(ProjectDb::new_in_memory().unwrap());
        let project = {
            let guard = db.lock_sync().unwrap();
            let user = guard.create_user("ada", "h").unwrap();
            guard
                .create_project(user.id, "My Cool App!", "", "python:3.11-slim")
                .unwrap()
        };
        let runtime = Arc::new(runtime);
        let manager = ContainerManager::new(
            runtime.clone(),
            db.clone(),
            ContainerSettings::default(),
            dir.path().to_path_buf(),
        );
        Fixture {
            _dir: dir,
            db,
            runtime,
            manager,
            project,
        }
    }

    #[test]
    fn test_container_name_sanitizes_title() {
        let f = fixture(FakeRuntime::default());
        assert_eq!(container_name(&f.project), "project_1_my_cool_app_");
    }

    #[tokio::test]
    async fn test_create_requires_docker() {
        let f = fixture(FakeRuntime {
            unavailable: true,
            ..Default::default()
        });
        let err = f.manager.create(&f.project).await.unwrap_err();
        assert!(matches!(err, ContainerError::Unavailable));
    }

    #[tokio::test]
    async fn test_create_records_container() {
        let f = fixture(FakeRuntime::default());
        let project = f.manager.create(&f.project).await.unwrap();

        assert_eq!(project.container_status, Some(ContainerStatus::Created));
        assert!(project.container_id.is_some());
        assert!(project.container_created_at.is_some());

        let created = f.runtime.created.lock().unwrap();
        let spec = &created[0];
        assert_eq!(spec.command, vec!["tail", "-f", "/dev/null"]);
        assert_eq!(spec.working_dir, "/app");
        assert!(spec.binds[0].ends_with("user_1/project_1:/app/data:rw"));
        assert!(spec.env.contains(&"PROJECT_ID=1".to_string()));
        assert_eq!(
            f.runtime.removed_names.lock().unwrap().as_slice(),
            ["project_1_my_cool_app_"]
        );
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let f = fixture(FakeRuntime::default());
        let project = f.manager.create(&f.project).await.unwrap();

        let project = f.manager.start(&project).await.unwrap();
        assert_eq!(project.container_status, Some(ContainerStatus::Running));

        let project = f.manager.stop(&project).await.unwrap();
        assert_eq!(project.container_status, Some(ContainerStatus::Stopped));
    }

    #[tokio::test]
    async fn test_operations_without_container() {
        let f = fixture(FakeRuntime::default());
        assert!(matches!(
            f.manager.start(&f.project).await.unwrap_err(),
            ContainerError::NoContainer
        ));
        assert!(matches!(
            f.manager.remove(&f.project).await.unwrap_err(),
            ContainerError::NoContainer
        ));
        assert_eq!(f.manager.status(&f.project).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_start_vanished_container_clears_fields() {
        let f = fixture(FakeRuntime::default());
        let pid = f.project.id;
        let project = f
            .db
            .call(move |db| db.attach_container(pid, "ghost"))
            .await
            .unwrap();

        let err = f.manager.start(&project).await.unwrap_err();
        assert!(matches!(err, ContainerError::NotFound { .. }));
        let reloaded = f
            .db
            .call(move |db| db.get_project(pid, 1))
            .await
            .unwrap()
            .unwrap();
        assert!(reloaded.container_id.is_none());
    }

    #[tokio::test]
    async fn test_remove_missing_container_succeeds() {
        let f = fixture(FakeRuntime::default());
        let pid = f.project.id;
        let project = f
            .db
            .call(move |db| db.attach_container(pid, "ghost"))
            .await
            .unwrap();
        let project = f.manager.remove(&project).await.unwrap();
        assert!(project.container_id.is_none());
    }

    #[tokio::test]
    async fn test_remove_stops_running_container() {
        let f = fixture(FakeRuntime::default());
        let project = f.manager.create(&f.project).await.unwrap();
        let project = f.manager.start(&project).await.unwrap();
        let project = f.manager.remove(&project).await.unwrap();
        assert!(project.container_id.is_none());
        assert!(f.runtime.containers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_persists_live_state() {
        let f = fixture(FakeRuntime::with_container("abc", ContainerStatus::Exited));
        let pid = f.project.id;
        let project = f
            .db
            .call(move |db| db.attach_container(pid, "abc"))
            .await
            .unwrap();
        assert_eq!(project.container_status, Some(ContainerStatus::Created));

        let status = f.manager.status(&project).await.unwrap();
        assert_eq!(status, Some(ContainerStatus::Exited));
        let reloaded = f
            .db
            .call(move |db| db.get_project(pid, 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.container_status, Some(ContainerStatus::Exited));
    }

    #[tokio::test]
    async fn test_exec_requires_running() {
        let f = fixture(FakeRuntime::with_container("abc", ContainerStatus::Exited));
        let pid = f.project.id;
        let project = f
            .db
            .call(move |db| db.attach_container(pid, "abc"))
            .await
            .unwrap();
        let err = f.manager.exec(&project, "ls", 5).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Container is not running. Current status: exited."
        );
    }

    #[tokio::test]
    async fn test_exec_runs_through_bash() {
        let runtime = FakeRuntime::with_container("abc", ContainerStatus::Running);
        *runtime.exec_output.lock().unwrap() = ExecOutput {
            stdout: "hi\n".into(),
            stderr: String::new(),
            exit_code: 0,
        };
        let f = fixture(runtime);
        let pid = f.project.id;
        let project = f
            .db
            .call(move |db| db.attach_container(pid, "abc"))
            .await
            .unwrap();

        let out = f.manager.exec(&project, "echo hi", 5).await.unwrap();
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(
            f.runtime.exec_log.lock().unwrap()[0],
            vec!["bash", "-c", "echo hi"]
        );
    }

    #[tokio::test]
    async fn test_exec_timeout() {
        let f = fixture(FakeRuntime {
            exec_delay: Some(Duration::from_secs(5)),
            ..FakeRuntime::with_container("abc", ContainerStatus::Running)
        });
        let pid = f.project.id;
        let project = f
            .db
            .call(move |db| db.attach_container(pid, "abc"))
            .await
            .unwrap();
        let err = f.manager.exec(&project, "sleep 10", 1).await.unwrap_err();
        assert!(matches!(err, ContainerError::Timeout { seconds: 1 }));
    }
}
