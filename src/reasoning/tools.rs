//! Tools the model can call against a project.
//!
//! The same definitions feed both the OpenAI function-calling schema and the
//! plain-text protocol prompt used by regular chat. Every tool returns a JSON
//! object with at least `status` (`success` or `error`) and `message`.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::container::ContainerManager;
use crate::errors::ContainerError;
use crate::server::models::Project;
use crate::server::ws::Notifier;
use crate::workspace::FileOperations;

pub struct ToolParam {
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
}

pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [ToolParam],
}

const fn param(name: &'static str, description: &'static str, required: bool) -> ToolParam {
    ToolParam {
        name,
        description,
        required,
    }
}

pub const TOOLS: &[ToolDef] = &[
    ToolDef {
        name: "read_file",
        description: "Read the content of a file in the project.",
        params: &[param("file_path", "Path to the file relative to the project root", true)],
    },
    ToolDef {
        name: "write_file",
        description: "Write content to a file in the project, creating it if needed.",
        params: &[
            param("file_path", "Path to the file relative to the project root", true),
            param("content", "Content to write to the file", true),
        ],
    },
    ToolDef {
        name: "list_files",
        description: "List files and directories in a directory.",
        params: &[param(
            "directory_path",
            "Path to the directory relative to the project root",
            false,
        )],
    },
    ToolDef {
        name: "run_file",
        description: "Run a file in the project's container.",
        params: &[param(
            "file_path",
            "Path to the file to run relative to the project root",
            true,
        )],
    },
    ToolDef {
        name: "delete_file",
        description: "Delete a file or directory in the project.",
        params: &[param(
            "file_path",
            "Path to the file or directory relative to the project root",
            true,
        )],
    },
    ToolDef {
        name: "generate_diff",
        description: "Generate a unified diff between original and new content.",
        params: &[
            param("original_content", "Original content", true),
            param("new_content", "New content", true),
            param("file_path", "Optional file path for context", false),
        ],
    },
    ToolDef {
        name: "apply_patch",
        description: "Apply a unified diff patch to a file.",
        params: &[
            param("file_path", "Path to the file to patch", true),
            param("patch_content", "The patch content to apply", true),
        ],
    },
    ToolDef {
        name: "pip_install",
        description: "Install Python packages using pip in the project's container.",
        params: &[param(
            "packages",
            "Space-separated list of packages to install (e.g. 'numpy pandas')",
            true,
        )],
    },
];

/// Function schemas in the OpenAI `tools` format.
pub fn openai_schemas() -> Vec<Value> {
    TOOLS
        .iter()
        .map(|tool| {
            let mut properties = serde_json::Map::new();
            for p in tool.params {
                properties.insert(
                    p.name.to_string(),
                    json!({"type": "string", "description": p.description}),
                );
            }
            let required: Vec<&str> = tool
                .params
                .iter()
                .filter(|p| p.required)
                .map(|p| p.name)
                .collect();
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": {
                        "type": "object",
                        "properties": properties,
                        "required": required,
                    }
                }
            })
        })
        .collect()
}

/// System prompt describing the fenced-block tool protocol.
pub fn protocol_prompt() -> String {
    let mut out = String::from(
        "You are a coding assistant working inside the user's project. \
         You can act on the project by writing tool blocks.\n\n\
         To call a tool, write a fenced block tagged `tool` containing JSON:\n\n\
         ```tool\n{\"name\": \"write_file\", \"arguments\": {\"file_path\": \"hello.py\", \"content\": \"print('Hello')\"}}\n```\n\n\
         Each block is executed and replaced by its result. Available tools:\n",
    );
    for tool in TOOLS {
        let args: Vec<String> = tool
            .params
            .iter()
            .map(|p| {
                if p.required {
                    p.name.to_string()
                } else {
                    format!("{}?", p.name)
                }
            })
            .collect();
        out.push_str(&format!(
            "- {}({}): {}\n",
            tool.name,
            args.join(", "),
            tool.description
        ));
    }
    out.push_str("\nPaths are relative to the project root. Use tools instead of describing changes.");
    out
}

/// Interpreter for a runnable file, chosen by extension.
pub fn interpreter_for(path: &str) -> Option<&'static str> {
    let ext = std::path::Path::new(path).extension()?.to_str()?;
    match ext.to_ascii_lowercase().as_str() {
        "py" => Some("python"),
        "js" => Some("node"),
        "sh" => Some("bash"),
        "rb" => Some("ruby"),
        _ => None,
    }
}

/// Single-quote `s` for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn error(message: impl Into<String>) -> Value {
    json!({"status": "error", "message": message.into()})
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Executes tools for one project and announces each execution on the
/// project's notification channel.
pub struct ToolRegistry {
    project: Project,
    files: FileOperations,
    containers: Arc<ContainerManager>,
    notifier: Arc<Notifier>,
}

impl ToolRegistry {
    pub fn new(
        project: Project,
        files: FileOperations,
        containers: Arc<ContainerManager>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            project,
            files,
            containers,
            notifier,
        }
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn files(&self) -> &FileOperations {
        &self.files
    }

    pub async fn execute(&self, name: &str, args: &Value) -> Value {
        info!(project_id = self.project.id, tool = name, "Executing tool");
        let result = match name {
            "read_file" => self.read_file(args),
            "write_file" => self.write_file(args),
            "list_files" => self.list_files(args),
            "run_file" => self.run_file(args).await,
            "delete_file" => self.delete_file(args),
            "generate_diff" => self.generate_diff(args),
            "apply_patch" => self.apply_patch(args),
            "pip_install" => self.pip_install(args).await,
            _ => {
                warn!(tool = name, "Unknown tool");
                error(format!("Unknown tool: {}", name))
            }
        };
        self.notifier
            .tool_executed(self.project.id, name, &result);
        result
    }

    fn read_file(&self, args: &Value) -> Value {
        let Some(path) = str_arg(args, "file_path") else {
            return error("No file path provided");
        };
        match self.files.read_file(path) {
            Ok(content) => json!({
                "status": "success",
                "message": format!("File {} read successfully.", path),
                "file_path": path,
                "content": content,
            }),
            Err(e) => error(e.to_string()),
        }
    }

    fn write_file(&self, args: &Value) -> Value {
        let Some(path) = str_arg(args, "file_path") else {
            return error("No file path provided");
        };
        let content = args.get("content").and_then(Value::as_str).unwrap_or("");
        match self.files.write_file(path, content) {
            Ok(message) => json!({"status": "success", "message": message, "file_path": path}),
            Err(e) => error(e.to_string()),
        }
    }

    fn list_files(&self, args: &Value) -> Value {
        let dir = args
            .get("directory_path")
            .and_then(Value::as_str)
            .unwrap_or("");
        match self.files.list_files(dir) {
            Ok(items) => json!({
                "status": "success",
                "message": format!("Found {} items.", items.len()),
                "directory_path": dir,
                "items": items,
            }),
            Err(e) => error(e.to_string()),
        }
    }

    fn delete_file(&self, args: &Value) -> Value {
        let Some(path) = str_arg(args, "file_path") else {
            return error("No file path provided");
        };
        match self.files.delete_file(path) {
            Ok(message) => json!({"status": "success", "message": message, "file_path": path}),
            Err(e) => error(e.to_string()),
        }
    }

    fn generate_diff(&self, args: &Value) -> Value {
        let (Some(original), Some(new)) = (
            str_arg(args, "original_content"),
            str_arg(args, "new_content"),
        ) else {
            return error("Both original_content and new_content must be provided");
        };
        let file_path = str_arg(args, "file_path");
        let diff = self.files.generate_diff(original, new, file_path);
        let message = if diff.is_empty() {
            "No differences found."
        } else {
            "Diff generated successfully."
        };
        let mut result = json!({"status": "success", "message": message, "diff": diff});
        if let Some(path) = file_path {
            result["file_path"] = json!(path);
        }
        result
    }

    fn apply_patch(&self, args: &Value) -> Value {
        let Some(path) = str_arg(args, "file_path") else {
            return error("No file path provided");
        };
        let Some(patch) = str_arg(args, "patch_content") else {
            return error("No patch content provided");
        };
        match self.files.apply_patch(path, patch) {
            Ok(message) => json!({"status": "success", "message": message, "file_path": path}),
            Err(e) => error(e.to_string()),
        }
    }

    async fn run_file(&self, args: &Value) -> Value {
        let Some(path) = str_arg(args, "file_path") else {
            return error("No file path provided");
        };
        match self.files.exists(path) {
            Ok(true) => {}
            Ok(false) => return error(format!("File {} does not exist.", path)),
            Err(e) => return error(e.to_string()),
        }
        let Some(interpreter) = interpreter_for(path) else {
            return error(format!(
                "Unsupported file type: {}. Supported: .py, .js, .sh, .rb",
                path
            ));
        };

        let settings = self.containers.settings();
        let command = format!(
            "cd {} && {} {}",
            settings.mount_path,
            interpreter,
            shell_quote(path)
        );
        match self
            .containers
            .exec(&self.project, &command, settings.run_timeout_secs)
            .await
        {
            Ok(out) => {
                let (status, message) = if out.exit_code == 0 {
                    ("success", format!("File {} executed successfully.", path))
                } else {
                    (
                        "error",
                        format!("File {} exited with code {}.", path, out.exit_code),
                    )
                };
                json!({
                    "status": status,
                    "message": message,
                    "file_path": path,
                    "command": command,
                    "stdout": out.stdout,
                    "stderr": out.stderr,
                    "return_code": out.exit_code,
                })
            }
            Err(e) => {
                let mut result = error(e.to_string());
                result["file_path"] = json!(path);
                result["command"] = json!(command);
                result
            }
        }
    }

    async fn pip_install(&self, args: &Value) -> Value {
        let packages = args
            .get("packages")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");
        if packages.is_empty() {
            return error("No packages provided");
        }

        let quoted: Vec<String> = packages.split_whitespace().map(shell_quote).collect();
        let command = format!("pip install {}", quoted.join(" "));
        let timeout = self.containers.settings().pip_timeout_secs;
        match self.containers.exec(&self.project, &command, timeout).await {
            Ok(out) => {
                let (status, message) = if out.exit_code == 0 {
                    ("success", format!("Packages installed successfully: {}", packages))
                } else {
                    ("error", format!("Error installing packages: {}", packages))
                };
                json!({
                    "status": status,
                    "message": message,
                    "packages": packages,
                    "command": command,
                    "stdout": out.stdout.trim(),
                    "stderr": out.stderr.trim(),
                    "return_code": out.exit_code,
                })
            }
            Err(ContainerError::Timeout { seconds }) => json!({
                "status": "error",
                "message": format!("Installation timed out after {} seconds.", seconds),
                "packages": packages,
                "command": command,
            }),
            Err(e) => {
                let mut result = error(e.to_string());
                result["packages"] = json!(packages);
                result
            }
        }
    }
}
