//! Step execution and the multi-step reasoning chain.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, warn};

use super::llm::{ChatMessage, ChatModel, ChatRequest};
use super::protocol;
use super::step::StepType;
use super::tools::{self, ToolRegistry};
use super::{TaskContext, truncate_chars};
use crate::config::LlmSettings;
use crate::errors::{LlmError, ReasoningError};
use crate::server::db::DbHandle;
use crate::server::models::{ReasoningSession, ReasoningStep, ToolCallRecord};
use crate::server::ws::{Notification, Notifier, StepNotification, StepStatus};

type Result<T> = std::result::Result<T, ReasoningError>;

const SESSION_TITLE_LIMIT: usize = 100;

/// Phrases in a plan that mean the planner already finished the job.
const COMPLETION_INDICATORS: &[&str] = &[
    "task has been completed",
    "task is now complete",
    "all files have been deleted",
    "file has been deleted",
    "files have been deleted",
    "successfully deleted",
    "deletion complete",
    "task completed",
];

const ANALYSIS_KEYWORDS: &[&str] = &["analyze", "examine", "understand", "review"];
const CODE_GENERATION_KEYWORDS: &[&str] = &["create", "implement", "write", "add", "generate"];
const TESTING_KEYWORDS: &[&str] = &["run", "execute", "test"];
const REFINEMENT_KEYWORDS: &[&str] = &["improve", "optimize", "refactor"];

/// Session title for a task: the first 100 characters, with `...` appended
/// when the task is longer.
pub fn session_title(task: &str) -> String {
    match truncate_chars(task, SESSION_TITLE_LIMIT) {
        (head, true) => format!("{}...", head),
        (head, false) => head.to_string(),
    }
}

/// Whether the planning response says the task is already done.
pub fn plan_reports_completion(plan: &str) -> bool {
    let plan = plan.to_lowercase();
    COMPLETION_INDICATORS.iter().any(|i| plan.contains(i))
}

fn mentions_any(task: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| task.contains(k))
}

/// Optional steps of a chain, chosen from the task wording and the plan.
/// Planning and conclusion always run; code execution follows code
/// generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChainSteps {
    pub analysis: bool,
    pub code_generation: bool,
    pub testing: bool,
    pub refinement: bool,
}

impl ChainSteps {
    pub fn select(task: &str, context: &TaskContext, plan: &str) -> Self {
        let task = task.to_lowercase();
        let done = plan_reports_completion(plan);
        Self {
            analysis: context.current_file.is_some()
                && context.current_file_content.is_some()
                && mentions_any(&task, ANALYSIS_KEYWORDS),
            code_generation: !done && mentions_any(&task, CODE_GENERATION_KEYWORDS),
            testing: !done && mentions_any(&task, TESTING_KEYWORDS),
            refinement: !done && mentions_any(&task, REFINEMENT_KEYWORDS),
        }
    }
}

/// Response text plus the tool calls made while producing it.
struct StepOutput {
    response: String,
    tool_calls: Vec<ToolCallRecord>,
}

/// Runs reasoning steps for one project on behalf of one user.
pub struct ReasoningEngine {
    db: DbHandle,
    model: Arc<dyn ChatModel>,
    tools: ToolRegistry,
    notifier: Arc<Notifier>,
    settings: LlmSettings,
    user_id: i64,
}

impl ReasoningEngine {
    pub fn new(
        db: DbHandle,
        model: Arc<dyn ChatModel>,
        tools: ToolRegistry,
        notifier: Arc<Notifier>,
        settings: LlmSettings,
        user_id: i64,
    ) -> Self {
        Self {
            db,
            model,
            tools,
            notifier,
            settings,
            user_id,
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn model(&self) -> &Arc<dyn ChatModel> {
        &self.model
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn settings(&self) -> &LlmSettings {
        &self.settings
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn project_id(&self) -> i64 {
        self.tools.project().id
    }

    pub async fn create_session(&self, title: &str, description: &str) -> Result<ReasoningSession> {
        let (project_id, user_id) = (self.project_id(), self.user_id);
        let (title, description) = (title.to_string(), description.to_string());
        let session = self
            .db
            .call(move |db| db.create_session(project_id, user_id, &title, &description))
            .await
            .map_err(ReasoningError::Database)?;
        info!(session_id = session.id, project_id, "Reasoning session created");
        Ok(session)
    }

    async fn reload_session(&self, session_id: i64) -> Result<ReasoningSession> {
        let project_id = self.project_id();
        self.db
            .call(move |db| db.get_session(session_id, project_id))
            .await
            .map_err(ReasoningError::Database)?
            .ok_or(ReasoningError::SessionNotFound { id: session_id })
    }

    /// Execute one step of `session`. The step row exists before the model
    /// is called, so a failed request leaves a record carrying the error.
    pub async fn execute_step(
        &self,
        session: &ReasoningSession,
        step_type: StepType,
        prompt: &str,
        step_number: Option<i64>,
    ) -> Result<ReasoningStep> {
        let session_id = session.id;
        let model = step_type.model(&self.settings).to_string();

        let step = {
            let (prompt, model) = (prompt.to_string(), model.clone());
            self.db
                .call(move |db| db.create_step(session_id, step_number, step_type, &prompt, &model))
                .await
                .map_err(ReasoningError::Database)?
        };
        let step_number = step.step_number;
        info!(session_id, step_number, step_type = %step_type, model = %model, "Executing reasoning step");
        self.notify_step(session_id, &step, StepStatus::Started);

        match self.run_step(step_type, prompt, &model).await {
            Ok(output) => {
                let step_id = step.id;
                let step = self
                    .db
                    .call(move |db| db.complete_step(step_id, &output.response, &output.tool_calls))
                    .await
                    .map_err(ReasoningError::Database)?;
                info!(
                    session_id,
                    step_number,
                    tool_calls = step.tool_calls.len(),
                    "Reasoning step completed"
                );
                self.notify_step(session_id, &step, StepStatus::Completed);
                Ok(step)
            }
            Err(e) => {
                let (step_id, message) = (step.id, e.to_string());
                warn!(session_id, step_number, error = %message, "Reasoning step failed");
                let step = self
                    .db
                    .call(move |db| db.fail_step(step_id, &message))
                    .await
                    .map_err(ReasoningError::Database)?;
                self.notify_step(session_id, &step, StepStatus::Failed);
                Err(e.into())
            }
        }
    }

    fn request(&self, model: &str, messages: &[ChatMessage], with_tools: bool) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            tools: with_tools.then(tools::openai_schemas),
            tool_choice: with_tools.then(|| "auto".to_string()),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        }
    }

    async fn run_step(
        &self,
        step_type: StepType,
        prompt: &str,
        model: &str,
    ) -> std::result::Result<StepOutput, LlmError> {
        let with_tools = step_type.uses_tools();
        let mut messages = vec![
            ChatMessage::system(step_type.system_prompt()),
            ChatMessage::user(prompt),
        ];
        let reply = self
            .model
            .complete(&self.request(model, &messages, with_tools))
            .await?;

        let mut output = StepOutput {
            response: reply.text().to_string(),
            tool_calls: Vec::new(),
        };
        if reply.requested_tools().is_empty() {
            return Ok(output);
        }
        self.run_tool_calls(&reply, None, &mut messages, &mut output)
            .await;

        let max_rounds = self.settings.max_follow_up_rounds;
        let mut exhausted = true;
        for round in 1..=max_rounds {
            let reply = match self
                .model
                .complete(&self.request(model, &messages, with_tools))
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(round, error = %e, "Follow-up request failed");
                    output
                        .response
                        .push_str(&format!("\n\nError in follow-up request: {}", e));
                    exhausted = false;
                    break;
                }
            };

            if !reply.text().is_empty() {
                output.response.push_str(&format!(
                    "\n\n# Follow-up Analysis (Round {}):\n{}",
                    round,
                    reply.text()
                ));
            }
            if reply.requested_tools().is_empty() {
                exhausted = false;
                break;
            }
            self.run_tool_calls(&reply, Some(round), &mut messages, &mut output)
                .await;
        }

        if exhausted {
            warn!(max_rounds, "Reached maximum number of follow-up rounds");
            output.response.push_str(&format!(
                "\n\nNote: Reached maximum number of follow-up rounds ({}). \
                 Some actions may not have been completed.",
                max_rounds
            ));
        }
        Ok(output)
    }

    /// Execute the tool calls requested by `reply`, appending their rendered
    /// results to the response and the call/result pair to the conversation.
    async fn run_tool_calls(
        &self,
        reply: &ChatMessage,
        round: Option<u32>,
        messages: &mut Vec<ChatMessage>,
        output: &mut StepOutput,
    ) {
        let calls = reply.requested_tools().to_vec();
        messages.push(ChatMessage::assistant_tool_calls(
            reply.content.clone(),
            calls.clone(),
        ));

        let heading = match round {
            Some(n) => format!("Tool Result (Round {})", n),
            None => "Tool Result".to_string(),
        };
        for call in calls {
            let arguments: Value =
                serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
            let result = self.tools.execute(&call.function.name, &arguments).await;

            output.response.push_str("\n\n");
            output.response.push_str(&protocol::render_result_titled(
                &heading,
                &call.function.name,
                &result,
            ));
            messages.push(ChatMessage::tool(
                call.id.clone(),
                tool_message_content(&result, self.settings.tool_result_limit),
            ));
            output.tool_calls.push(ToolCallRecord {
                name: call.function.name,
                arguments,
                result,
            });
        }
    }

    fn notify_step(&self, session_id: i64, step: &ReasoningStep, status: StepStatus) {
        let (response, error) = match status {
            StepStatus::Started => (None, None),
            StepStatus::Completed => (Some(step.response.clone()), None),
            StepStatus::Failed => (None, step.error.clone()),
        };
        self.notifier.publish(
            self.project_id(),
            &Notification::ReasoningStep {
                session_id,
                step: StepNotification {
                    id: step.id,
                    step_number: step.step_number,
                    step_type: step.step_type,
                    status,
                    model_used: step.model_used.clone(),
                    response,
                    error,
                },
            },
        );
    }

    /// Run a full chain for `task` in a new session. A failing step ends the
    /// chain early and the session is returned incomplete.
    pub async fn execute_chain(&self, task: &str, context: &TaskContext) -> Result<ReasoningSession> {
        let session = self.create_session(&session_title(task), task).await?;
        match self.run_chain(&session, task, context).await {
            Ok(()) => {
                let session_id = session.id;
                self.db
                    .call(move |db| db.mark_session_complete(session_id))
                    .await
                    .map_err(ReasoningError::Database)?;
                info!(session_id, "Reasoning chain completed");
            }
            Err(e) => {
                warn!(session_id = session.id, error = %e, "Reasoning chain stopped early");
            }
        }
        self.reload_session(session.id).await
    }

    async fn run_chain(
        &self,
        session: &ReasoningSession,
        task: &str,
        context: &TaskContext,
    ) -> Result<()> {
        let mut prompt = format!(
            "Task: {}\n\nCreate a detailed plan to accomplish this task.",
            task
        );
        if let Some(file) = &context.current_file {
            prompt.push_str(&format!("\n\nThe user is currently working on: {}", file));
        }
        let plan = self
            .execute_step(session, StepType::Planning, &prompt, None)
            .await?
            .response;

        let steps = ChainSteps::select(task, context, &plan);
        info!(session_id = session.id, ?steps, "Selected reasoning steps");

        let mut analysis = None;
        if let (true, Some(file), Some(content)) = (
            steps.analysis,
            &context.current_file,
            &context.current_file_content,
        ) {
            let prompt = format!(
                "Task: {}\n\nPlan: {}\n\nCurrent file: {}\n\nFile content:\n```\n{}\n```\n\n\
                 Analyze this code in relation to the task.",
                task, plan, file, content
            );
            analysis = Some(
                self.execute_step(session, StepType::Analysis, &prompt, None)
                    .await?
                    .response,
            );
        }

        let mut implementation = None;
        let mut execution = None;
        if steps.code_generation {
            let prompt = format!(
                "Task: {}\n\nPlan: {}\n\nAnalysis: {}\n\n\
                 Write the code this task needs. Create and modify files with the tools \
                 instead of describing the code.",
                task,
                plan,
                analysis.as_deref().unwrap_or("No analysis needed for this task.")
            );
            let code = self
                .execute_step(session, StepType::CodeGeneration, &prompt, None)
                .await?
                .response;

            let prompt = format!(
                "Task: {}\n\nPlan: {}\n\nCode implementation: {}\n\n\
                 Run the files created in the previous step with run_file and check their \
                 output. If something fails, fix it with write_file and run it again.",
                task, plan, code
            );
            execution = Some(
                self.execute_step(session, StepType::CodeExecution, &prompt, None)
                    .await?
                    .response,
            );
            implementation = Some(code);
        }
        let implementation_text = implementation
            .as_deref()
            .unwrap_or("No code generation needed for this task.");

        if steps.testing {
            let prompt = format!(
                "Task: {}\n\nPlan: {}\n\nCode implementation: {}\n\n\
                 Test the implementation and verify it works correctly. Use run_file where needed.",
                task, plan, implementation_text
            );
            self.execute_step(session, StepType::Testing, &prompt, None)
                .await?;
        }

        if steps.refinement {
            let prompt = format!(
                "Task: {}\n\nPlan: {}\n\nCode implementation: {}\n\n\
                 Refine and optimize the implementation. Make any improvements it needs.",
                task, plan, implementation_text
            );
            self.execute_step(session, StepType::Refinement, &prompt, None)
                .await?;
        }

        let mut prompt = format!("Task: {}\n\nPlan: {}\n\n", task, plan);
        if let Some(code) = &implementation {
            prompt.push_str(&format!("Implementation: {}\n\n", code));
        }
        if let Some(results) = &execution {
            prompt.push_str(&format!("Execution results: {}\n\n", results));
        }
        prompt.push_str(
            "Summarize what was accomplished and list any next steps or recommendations.",
        );
        self.execute_step(session, StepType::Conclusion, &prompt, None)
            .await?;
        Ok(())
    }
}

/// Tool result as sent back to the model, cut to `limit` characters.
fn tool_message_content(result: &Value, limit: usize) -> String {
    let encoded = result.to_string();
    match truncate_chars(&encoded, limit) {
        (head, true) => format!("{}... (truncated)", head),
        (head, false) => head.to_string(),
    }
}
