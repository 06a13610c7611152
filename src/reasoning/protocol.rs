//! Plain-text tool protocol used by regular chat.
//!
//! The model asks for a tool by writing a fenced block:
//!
//! ````text
//! ```tool
//! {"name": "write_file", "arguments": {"file_path": "hello.py", "content": "print(1)"}}
//! ```
//! ````
//!
//! Each valid block is executed and replaced in the reply by a short text
//! rendering of its result. Blocks that are not valid JSON are left as is.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

static TOOL_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```tool\s+([\s\S]*?)```").expect("valid tool block regex"));

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Value,
    /// Byte range of the whole fenced block in the source text
    pub span: Range<usize>,
}

#[derive(Deserialize)]
struct RawInvocation {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Find every well-formed tool block in `text`, in order of appearance.
pub fn parse_tool_blocks(text: &str) -> Vec<ToolInvocation> {
    TOOL_BLOCK
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let body = caps.get(1)?.as_str();
            let raw: RawInvocation = serde_json::from_str(body.trim()).ok()?;
            let arguments = match raw.arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            };
            Some(ToolInvocation {
                name: raw.name,
                arguments,
                span: whole.range(),
            })
        })
        .collect()
}

/// Text shown in place of an executed tool block.
pub fn render_result(tool_name: &str, result: &Value) -> String {
    render_result_titled("Tool Result", tool_name, result)
}

/// Like [`render_result`] with a custom heading, e.g. `Tool Result (Round 2)`.
pub fn render_result_titled(heading: &str, tool_name: &str, result: &Value) -> String {
    let status = result
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let message = result
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("No message provided");

    let mut out = format!(
        "# {}: {}\n# Tool: {}\n\n{}\n",
        heading,
        status.to_uppercase(),
        tool_name,
        message
    );
    if let Some(path) = result.get("file_path").and_then(Value::as_str) {
        out.push_str(&format!("\nFile: {}", path));
    }
    if let Some(stdout) = result.get("stdout").and_then(Value::as_str) {
        out.push_str(&format!("\n\nOutput:\n{}", stdout));
    }
    if let Some(stderr) = result
        .get("stderr")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
    {
        out.push_str(&format!("\n\nErrors:\n{}", stderr));
    }
    out
}

/// Replace each invocation's block with the paired rendering. `replacements`
/// must be in the same order as `invocations`.
pub fn replace_blocks(text: &str, invocations: &[ToolInvocation], replacements: &[String]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (invocation, replacement) in invocations.iter().zip(replacements) {
        out.push_str(&text[cursor..invocation.span.start]);
        out.push_str(replacement);
        cursor = invocation.span.end;
    }
    out.push_str(&text[cursor..]);
    out
}
