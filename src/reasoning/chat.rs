//! Project chat.
//!
//! A message either gets a regular reply, in which the model acts through
//! fenced tool blocks, or, for multi-step requests, runs the reasoning chain
//! and answers with a summary of its steps.

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use super::engine::ReasoningEngine;
use super::llm::{self, ChatRequest};
use super::{TaskContext, protocol, tools, truncate_chars};
use crate::errors::ReasoningError;
use crate::server::models::{ChatMessage, ChatRole, ReasoningStep};

type Result<T> = std::result::Result<T, ReasoningError>;

/// Messages of earlier conversation sent along with a new one.
const HISTORY_LIMIT: usize = 9;

const STEP_SUMMARY_LIMIT: usize = 500;

const MULTI_STEP_PHRASES: &[&str] = &[
    "create and run",
    "write and execute",
    "implement and test",
    "build a",
    "develop a",
    "make a",
    "create a complete",
    "step by step",
    "sequence",
    "workflow",
    "pipeline",
    "multiple steps",
    "series of",
    "chain of",
    "first do",
    "then do",
    "after that",
    "finally",
    "multi-step",
    "multi step",
];

const IMPERATIVE_VERBS: &[&str] = &[
    "create", "make", "build", "write", "implement", "add", "update", "delete", "remove", "change",
    "modify", "run", "execute", "test", "check", "verify", "generate", "install", "configure",
    "set",
];

/// Whether a message asks for enough work to warrant the reasoning chain:
/// it uses a multi-step phrase, or at least two of its sentences open with
/// an imperative verb.
pub fn is_complex_task(message: &str) -> bool {
    let lower = message.to_lowercase();
    if MULTI_STEP_PHRASES.iter().any(|p| lower.contains(p)) {
        return true;
    }
    let imperatives = lower
        .split('.')
        .filter_map(|sentence| sentence.split_whitespace().next())
        .filter(|word| IMPERATIVE_VERBS.contains(word))
        .count();
    imperatives >= 2
}

#[derive(Debug, Clone)]
pub struct ChatInput {
    pub message: String,
    pub context: TaskContext,
    pub use_reasoning: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResultEntry {
    pub tool: String,
    pub arguments: Value,
    pub result: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_session_id: Option<i64>,
    pub tool_results: Vec<ToolResultEntry>,
    /// Conversation up to and including the new user message
    pub history: Vec<ChatMessage>,
}

/// Store the user's message, produce a reply and store that too.
pub async fn respond(engine: &ReasoningEngine, input: &ChatInput) -> Result<ChatReply> {
    let (project_id, user_id) = (engine.project_id(), engine.user_id());
    let content = input.message.clone();
    let user_message = engine
        .db()
        .call(move |db| db.add_chat_message(project_id, user_id, ChatRole::User, &content))
        .await
        .map_err(ReasoningError::Database)?;
    let exclude = user_message.id;
    let mut history = engine
        .db()
        .call(move |db| db.recent_chat_messages(project_id, HISTORY_LIMIT, Some(exclude)))
        .await
        .map_err(ReasoningError::Database)?;

    if input.use_reasoning || is_complex_task(&input.message) {
        if let Some(reply) = reasoning_reply(engine, input).await? {
            history.push(user_message);
            return Ok(ChatReply { history, ..reply });
        }
    }

    let (message, tool_results) = regular_reply(engine, input, &history).await?;
    history.push(user_message);
    Ok(ChatReply {
        message,
        reasoning_session_id: None,
        tool_results,
        history,
    })
}

async fn store_message(engine: &ReasoningEngine, role: ChatRole, content: &str) -> Result<()> {
    let (project_id, user_id) = (engine.project_id(), engine.user_id());
    let content = content.to_string();
    engine
        .db()
        .call(move |db| db.add_chat_message(project_id, user_id, role, &content))
        .await
        .map_err(ReasoningError::Database)?;
    Ok(())
}

/// Run the chain and summarise it. `None` means the caller should fall back
/// to a regular reply.
async fn reasoning_reply(engine: &ReasoningEngine, input: &ChatInput) -> Result<Option<ChatReply>> {
    let session = match engine.execute_chain(&input.message, &input.context).await {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "Reasoning chain failed, falling back to regular chat");
            store_message(
                engine,
                ChatRole::System,
                &format!(
                    "The reasoning system encountered an error: {}. Falling back to regular chat.",
                    e
                ),
            )
            .await?;
            return Ok(None);
        }
    };

    let session_id = session.id;
    let steps = engine
        .db()
        .call(move |db| db.list_steps(session_id))
        .await
        .map_err(ReasoningError::Database)?;
    if steps.is_empty() {
        warn!(session_id, "Reasoning chain produced no steps, falling back to regular chat");
        engine
            .db()
            .call(move |db| db.delete_session(session_id))
            .await
            .map_err(ReasoningError::Database)?;
        return Ok(None);
    }

    let message = summarize_steps(engine.project_id(), session_id, &steps);
    store_message(engine, ChatRole::Assistant, &message).await?;

    let tool_results = steps
        .iter()
        .flat_map(|s| &s.tool_calls)
        .map(|call| ToolResultEntry {
            tool: call.name.clone(),
            arguments: call.arguments.clone(),
            result: call.result.clone(),
        })
        .collect();
    Ok(Some(ChatReply {
        message,
        reasoning_session_id: Some(session_id),
        tool_results,
        history: Vec::new(),
    }))
}

fn summarize_steps(project_id: i64, session_id: i64, steps: &[ReasoningStep]) -> String {
    let mut out = String::from("I've analyzed your request and broken it down into steps:\n\n");
    for step in steps {
        out.push_str(&format!(
            "**Step {}: {}**\n",
            step.step_number,
            step.step_type.label()
        ));
        let body = match (&step.error, step.response.is_empty()) {
            (Some(error), true) => format!("Error: {}", error),
            _ => match truncate_chars(&step.response, STEP_SUMMARY_LIMIT) {
                (head, true) => format!("{}...\n[Response truncated for readability]", head),
                (head, false) => head.to_string(),
            },
        };
        out.push_str(&body);
        out.push_str("\n\n");
    }
    out.push_str(&format!(
        "\nYou can view the full reasoning session here: \
         [Reasoning Session #{sid}](/api/projects/{pid}/reasoning/sessions/{sid})\n",
        sid = session_id,
        pid = project_id
    ));
    out
}

fn system_message(context: &TaskContext) -> String {
    let mut system = tools::protocol_prompt();
    if let Some(file) = &context.current_file {
        system.push_str(&format!("\n\nThe user is currently editing {}.", file));
        if let Some(content) = &context.current_file_content {
            system.push_str(&format!(
                "\n\nCurrent content of {}:\n```\n{}\n```",
                file, content
            ));
        }
    }
    system
}

fn to_llm_message(message: &ChatMessage) -> llm::ChatMessage {
    match message.role {
        ChatRole::User => llm::ChatMessage::user(message.content.as_str()),
        ChatRole::Assistant => llm::ChatMessage::assistant(message.content.as_str()),
        ChatRole::System => llm::ChatMessage::system(message.content.as_str()),
    }
}

/// Ask the model directly, then execute and inline any tool blocks in its
/// answer.
async fn regular_reply(
    engine: &ReasoningEngine,
    input: &ChatInput,
    history: &[ChatMessage],
) -> Result<(String, Vec<ToolResultEntry>)> {
    let mut messages = vec![llm::ChatMessage::system(system_message(&input.context))];
    messages.extend(history.iter().map(to_llm_message));
    messages.push(llm::ChatMessage::user(input.message.as_str()));

    let settings = engine.settings();
    let request = ChatRequest {
        model: settings.execution_model.clone(),
        messages,
        tools: None,
        tool_choice: None,
        temperature: settings.temperature,
        max_tokens: settings.max_tokens,
    };
    let reply = engine.model().complete(&request).await?;
    let text = reply.text();

    let invocations = protocol::parse_tool_blocks(text);
    let mut rendered = Vec::with_capacity(invocations.len());
    let mut tool_results = Vec::with_capacity(invocations.len());
    for invocation in &invocations {
        let result = engine
            .tools()
            .execute(&invocation.name, &invocation.arguments)
            .await;
        rendered.push(protocol::render_result(&invocation.name, &result));
        tool_results.push(ToolResultEntry {
            tool: invocation.name.clone(),
            arguments: invocation.arguments.clone(),
            result,
        });
    }
    if !invocations.is_empty() {
        info!(
            project_id = engine.project_id(),
            count = invocations.len(),
            "Executed tool blocks from chat reply"
        );
    }

    let message = protocol::replace_blocks(text, &invocations, &rendered);
    store_message(engine, ChatRole::Assistant, &message).await?;
    Ok((message, tool_results))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::config::{ContainerSettings, LlmSettings};
    use crate::container::ContainerManager;
    use crate::container::testing::FakeRuntime;
    use crate::errors::LlmError;
    use crate::reasoning::llm::testing::ScriptedModel;
    use crate::reasoning::tools::ToolRegistry;
    use crate::server::db::{DbHandle, ProjectDb};
    use crate::server::ws::Notifier;
    use crate::workspace::FileOperations;

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: ReasoningEngine,
        model: Arc<ScriptedModel>,
        files: FileOperations,
    }

    fn fixture(replies: Vec<std::result::Result<llm::ChatMessage, LlmError>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = DbHandle::new(ProjectDb::new_in_memory().unwrap());
        let (user, project) = {
            let guard = db.lock_sync().unwrap();
            let user = guard.create_user("ada", "h").unwrap();
            let project = guard
                .create_project(user.id, "Demo", "", "python:3.11-slim")
                .unwrap();
            (user, project)
        };
        let containers = Arc::new(ContainerManager::new(
            Arc::new(FakeRuntime::default()),
            db.clone(),
            ContainerSettings::default(),
            dir.path().to_path_buf(),
        ));
        let files = FileOperations::new(dir.path().join("data"));
        files.ensure_root().unwrap();
        let notifier = Arc::new(Notifier::new());
        let model = Arc::new(ScriptedModel::new(replies));
        let tools = ToolRegistry::new(project, files.clone(), containers, notifier.clone());
        Fixture {
            engine: ReasoningEngine::new(
                db,
                model.clone(),
                tools,
                notifier,
                LlmSettings::default(),
                user.id,
            ),
            _dir: dir,
            model,
            files,
        }
    }

    fn input(message: &str) -> ChatInput {
        ChatInput {
            message: message.to_string(),
            context: TaskContext::default(),
            use_reasoning: false,
        }
    }

    #[test]
    fn test_is_complex_task_phrases() {
        assert!(is_complex_task("Create and run a hello world script"));
        assert!(is_complex_task("Explain it step by step"));
        assert!(is_complex_task("Fix the bug, after that add docs"));
        assert!(!is_complex_task("What does this function do?"));
    }

    #[test]
    fn test_is_complex_task_counts_imperative_sentences() {
        assert!(is_complex_task("Write a parser. Test it against the samples."));
        assert!(!is_complex_task("Write a parser."));
        assert!(!is_complex_task("Please write a parser. It should be fast."));
    }

    #[test]
    fn test_system_message_includes_open_file() {
        let ctx = TaskContext {
            current_file: Some("main.py".into()),
            current_file_content: Some("print(1)".into()),
        };
        let system = system_message(&ctx);
        assert!(system.contains("```tool"));
        assert!(system.contains("The user is currently editing main.py."));
        assert!(system.contains("Current content of main.py:\n```\nprint(1)\n```"));
    }

    #[tokio::test]
    async fn test_regular_reply_executes_tool_blocks() {
        let reply = "Sure.\n```tool\n{\"name\": \"write_file\", \"arguments\": {\"file_path\": \"hi.py\", \"content\": \"print('hi')\"}}\n```\nDone.";
        let f = fixture(vec![Ok(llm::ChatMessage::assistant(reply))]);

        let out = respond(&f.engine, &input("Please add hi.py")).await.unwrap();

        assert_eq!(f.files.read_file("hi.py").unwrap(), "print('hi')");
        assert!(out.reasoning_session_id.is_none());
        assert!(out.message.starts_with("Sure.\n# Tool Result: SUCCESS\n# Tool: write_file"));
        assert!(out.message.ends_with("\nDone."));
        assert_eq!(out.tool_results.len(), 1);
        assert_eq!(out.tool_results[0].tool, "write_file");
        assert_eq!(out.history.len(), 1);
        assert_eq!(out.history[0].role, ChatRole::User);

        let project_id = f.engine.project_id();
        let stored = f
            .engine
            .db()
            .call(move |db| db.chat_history(project_id))
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].role, ChatRole::Assistant);
        assert_eq!(stored[1].content, out.message);
    }

    #[tokio::test]
    async fn test_history_is_sent_to_the_model() {
        let f = fixture(vec![
            Ok(llm::ChatMessage::assistant("first answer")),
            Ok(llm::ChatMessage::assistant("second answer")),
        ]);
        respond(&f.engine, &input("hello")).await.unwrap();
        let out = respond(&f.engine, &input("and again")).await.unwrap();

        assert_eq!(out.history.len(), 3);
        let requests = f.model.requests.lock().unwrap();
        let roles: Vec<&str> = requests[1].messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert!(requests[1].tools.is_none());
    }

    #[tokio::test]
    async fn test_reasoning_reply_summarizes_steps() {
        let f = fixture(vec![
            Ok(llm::ChatMessage::assistant("1. Think")),
            Ok(llm::ChatMessage::assistant("x".repeat(600))),
        ]);
        let out = respond(
            &f.engine,
            &ChatInput {
                use_reasoning: true,
                ..input("Explain the layout")
            },
        )
        .await
        .unwrap();

        let session_id = out.reasoning_session_id.unwrap();
        assert!(out.message.starts_with("I've analyzed your request"));
        assert!(out.message.contains("**Step 1: Planning**\n1. Think"));
        assert!(out.message.contains("**Step 2: Conclusion**"));
        assert!(out.message.contains("[Response truncated for readability]"));
        assert!(out.message.contains(&format!("[Reasoning Session #{}]", session_id)));
        assert_eq!(f.model.request_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_planning_step_is_kept_and_summarized() {
        let f = fixture(vec![Err(LlmError::Api("model overloaded".into()))]);
        let out = respond(
            &f.engine,
            &ChatInput {
                use_reasoning: true,
                ..input("Do something")
            },
        )
        .await
        .unwrap();

        let session_id = out.reasoning_session_id.unwrap();
        assert!(
            out.message
                .contains("**Step 1: Planning**\nError: OpenAI API error: model overloaded")
        );
        assert_eq!(f.model.request_count(), 1);

        let steps = f
            .engine
            .db()
            .call(move |db| db.list_steps(session_id))
            .await
            .unwrap();
        assert_eq!(steps.len(), 1);
        assert!(!steps[0].is_complete);
        assert_eq!(
            steps[0].error.as_deref(),
            Some("OpenAI API error: model overloaded")
        );
    }

    #[tokio::test]
    async fn test_chain_without_steps_falls_back_to_regular_chat() {
        let f = fixture(vec![Ok(llm::ChatMessage::assistant("plain answer"))]);
        f.engine
            .db()
            .lock_sync()
            .unwrap()
            .conn()
            .execute_batch(
                "CREATE TRIGGER no_steps BEFORE INSERT ON reasoning_steps
                 BEGIN SELECT RAISE(ABORT, 'steps disabled'); END;",
            )
            .unwrap();
        let out = respond(
            &f.engine,
            &ChatInput {
                use_reasoning: true,
                ..input("Do something")
            },
        )
        .await
        .unwrap();

        assert_eq!(out.message, "plain answer");
        assert!(out.reasoning_session_id.is_none());
        let project_id = f.engine.project_id();
        let sessions = f
            .engine
            .db()
            .call(move |db| db.list_sessions(project_id))
            .await
            .unwrap();
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_model_error_on_regular_path_is_returned() {
        let f = fixture(vec![Err(LlmError::Api("bad key".into()))]);
        let err = respond(&f.engine, &input("hi")).await.unwrap_err();
        assert_eq!(err.to_string(), "OpenAI API error: bad key");
    }

    #[test]
    fn test_tool_result_entry_serialization() {
        let entry = ToolResultEntry {
            tool: "read_file".into(),
            arguments: json!({"file_path": "a"}),
            result: json!({"status": "success"}),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["tool"], "read_file");
    }
}
