use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::reasoning::step::StepType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub openai_api_key: Option<String>,
    pub created_at: String,
}

impl User {
    /// The user's OpenAI key, if one is set and non-blank.
    pub fn api_key(&self) -> Option<&str> {
        self.openai_api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

/// Docker container state as tracked on a project.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Stopped,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "restarting" => Ok(Self::Restarting),
            "removing" => Ok(Self::Removing),
            "exited" => Ok(Self::Exited),
            "dead" => Ok(Self::Dead),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("Invalid container status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub description: String,
    pub created_at: String,
    pub updated_at: String,
    pub container_id: Option<String>,
    pub container_status: Option<ContainerStatus>,
    pub container_image: String,
    pub container_created_at: Option<String>,
    pub web_server_port: Option<u16>,
}

impl Project {
    pub fn has_container(&self) -> bool {
        self.container_id.is_some()
    }

    pub fn is_container_running(&self) -> bool {
        self.container_status == Some(ContainerStatus::Running)
    }
}

/// Fields a project update may change. `None` leaves a field as it is;
/// `web_server_port: Some(None)` (an explicit `null`) clears the port.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub container_image: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub web_server_port: Option<Option<u16>>,
}

/// Wrap any value that is present, `null` included, so it can be told
/// apart from an absent field.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningSession {
    pub id: i64,
    pub project_id: i64,
    pub user_id: i64,
    pub title: String,
    pub description: String,
    pub is_complete: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: ReasoningSession,
    pub step_count: i64,
}

/// A tool invocation made during a step, with what it returned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: serde_json::Value,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub id: i64,
    pub session_id: i64,
    pub step_number: i64,
    pub step_type: StepType,
    pub prompt: String,
    pub response: String,
    pub model_used: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub tool_results: Vec<serde_json::Value>,
    pub is_complete: bool,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetail {
    pub session: ReasoningSession,
    pub steps: Vec<ReasoningStep>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl FromStr for ChatRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid chat role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub project_id: i64,
    pub user_id: i64,
    pub role: ChatRole,
    pub content: String,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_status_round_trip() {
        for status in [
            ContainerStatus::Created,
            ContainerStatus::Running,
            ContainerStatus::Exited,
            ContainerStatus::Stopped,
        ] {
            assert_eq!(ContainerStatus::from_str(status.as_str()), Ok(status));
        }
        assert!(ContainerStatus::from_str("zombie").is_err());
    }

    #[test]
    fn test_container_status_serializes_snake_case() {
        let json = serde_json::to_string(&ContainerStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }

    #[test]
    fn test_user_api_key_ignores_blank() {
        let mut user = User {
            id: 1,
            username: "ada".into(),
            openai_api_key: Some("   ".into()),
            created_at: String::new(),
        };
        assert_eq!(user.api_key(), None);
        user.openai_api_key = Some("sk-test".into());
        assert_eq!(user.api_key(), Some("sk-test"));
    }

    #[test]
    fn test_user_key_never_serialized() {
        let user = User {
            id: 1,
            username: "ada".into(),
            openai_api_key: Some("sk-secret".into()),
            created_at: String::new(),
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("sk-secret"));
    }

    #[test]
    fn test_session_summary_flattens() {
        let summary = SessionSummary {
            session: ReasoningSession {
                id: 4,
                project_id: 1,
                user_id: 1,
                title: "Build a CLI".into(),
                description: String::new(),
                is_complete: false,
                created_at: String::new(),
                updated_at: String::new(),
            },
            step_count: 3,
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["id"], 4);
        assert_eq!(value["step_count"], 3);
    }
}
