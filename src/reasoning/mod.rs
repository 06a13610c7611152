//! LLM-driven reasoning over a project's files and container.
//!
//! - `step`: the seven step types with their prompts and model choice
//! - `llm`: the `ChatModel` seam and the OpenAI-compatible client
//! - `tools`: tool definitions and the per-project executor
//! - `protocol`: fenced ```` ```tool ```` blocks used by regular chat
//! - `engine`: step execution with tool rounds, and the reasoning chain
//! - `chat`: chat replies, routed through the chain for complex tasks

pub mod chat;
pub mod engine;
pub mod llm;
pub mod protocol;
pub mod step;
pub mod tools;

use serde::Deserialize;

pub use engine::ReasoningEngine;
pub use step::StepType;

/// What the user has open in the editor when they ask for something.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TaskContext {
    #[serde(default)]
    pub current_file: Option<String>,
    #[serde(default)]
    pub current_file_content: Option<String>,
}

impl TaskContext {
    /// Treats empty strings as absent.
    pub fn new(current_file: Option<String>, current_file_content: Option<String>) -> Self {
        Self {
            current_file: current_file.filter(|s| !s.is_empty()),
            current_file_content: current_file_content.filter(|s| !s.is_empty()),
        }
    }
}

/// Split `s` after `max_chars` characters. The flag tells whether anything
/// was cut.
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> (&str, bool) {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => (&s[..idx], true),
        None => (s, false),
    }
}
