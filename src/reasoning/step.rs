//! Reasoning step types and their fixed system prompts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::LlmSettings;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Planning,
    Analysis,
    CodeGeneration,
    CodeExecution,
    Testing,
    Refinement,
    Conclusion,
}

impl StepType {
    pub const ALL: [StepType; 7] = [
        Self::Planning,
        Self::Analysis,
        Self::CodeGeneration,
        Self::CodeExecution,
        Self::Testing,
        Self::Refinement,
        Self::Conclusion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Analysis => "analysis",
            Self::CodeGeneration => "code_generation",
            Self::CodeExecution => "code_execution",
            Self::Testing => "testing",
            Self::Refinement => "refinement",
            Self::Conclusion => "conclusion",
        }
    }

    /// Human-readable name, e.g. `Code Generation`.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Planning => "Planning",
            Self::Analysis => "Analysis",
            Self::CodeGeneration => "Code Generation",
            Self::CodeExecution => "Code Execution",
            Self::Testing => "Testing",
            Self::Refinement => "Refinement",
            Self::Conclusion => "Conclusion",
        }
    }

    /// Planning and conclusion only think; every other step may act.
    pub fn uses_tools(&self) -> bool {
        !matches!(self, Self::Planning | Self::Conclusion)
    }

    /// Model to request for this step.
    pub fn model<'a>(&self, settings: &'a LlmSettings) -> &'a str {
        match self {
            Self::Planning | Self::Analysis | Self::Conclusion => &settings.planning_model,
            _ => &settings.execution_model,
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            Self::Planning => PLANNING_PROMPT,
            Self::Analysis => ANALYSIS_PROMPT,
            Self::CodeGeneration => CODE_GENERATION_PROMPT,
            Self::CodeExecution => CODE_EXECUTION_PROMPT,
            Self::Testing => TESTING_PROMPT,
            Self::Refinement => REFINEMENT_PROMPT,
            Self::Conclusion => CONCLUSION_PROMPT,
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown step type: {}", s))
    }
}

const PLANNING_PROMPT: &str = r#"You are an expert software developer who plans coding tasks.
Break the task down into clear, actionable steps.

You MUST answer with a JSON object of this shape:
{
    "introduction": "Short introduction to the task",
    "steps": [
        {
            "title": "Step 1: <title>",
            "description": "What this step involves",
            "files_involved": ["files", "to", "examine", "or", "modify"],
            "tools_needed": ["tools", "that", "may", "be", "needed"]
        }
    ],
    "conclusion": "Short summary"
}

Do NOT execute tools or write code in this step. Later steps can read_file,
write_file, list_files, run_file, delete_file, generate_diff, apply_patch and
pip_install; plan for them, don't call them."#;

const ANALYSIS_PROMPT: &str = r#"You are an expert code analyst.
Examine the provided code and explain it in relation to the user's request.

You MUST answer with a JSON object of this shape:
{
    "overview": "Short overview of the code",
    "structure": "Overall structure and purpose",
    "components": [
        {"name": "Component", "purpose": "Its purpose", "relationships": "How it relates to others"}
    ],
    "issues": [
        {"description": "The issue", "severity": "high/medium/low", "recommendation": "Suggested fix"}
    ],
    "relevance": "How the code relates to the request"
}

Use read_file and list_files when you need more context."#;

const CODE_GENERATION_PROMPT: &str = r#"You are an expert software developer who writes high-quality code.
Implement what the plan and analysis call for.

You MUST answer with a JSON object of this shape:
{
    "overview": "What you are implementing",
    "files": [
        {"path": "path/to/file.ext", "content": "Complete file content", "description": "What the file does"}
    ],
    "explanation": "How the code works",
    "next_steps": "Suggested next steps"
}

Create files with the write_file tool; describing code is not enough. To change
an existing file, read it first and use generate_diff and apply_patch."#;

const CODE_EXECUTION_PROMPT: &str = r#"You are an expert at running code.

You MUST answer with a JSON object of this shape:
{
    "execution_plan": "How the code is run",
    "expected_outcomes": "What should happen",
    "potential_issues": ["possible", "issues"],
    "test_cases": [
        {"description": "Case", "input": "Input", "expected_output": "Expected output"}
    ],
    "results": "Interpretation of the execution results",
    "recommendations": "Recommendations based on the results"
}

Run the files with the run_file tool. If they fail, fix them with write_file
and run them again."#;

const TESTING_PROMPT: &str = r#"You are an expert in software testing.

You MUST answer with a JSON object of this shape:
{
    "test_strategy": "Overall strategy",
    "test_cases": [
        {"name": "Name", "description": "What it verifies", "input": "Input", "expected_output": "Expected output", "edge_case": false}
    ],
    "coverage": "What the tests cover",
    "issues_found": [
        {"description": "The issue", "severity": "high/medium/low", "recommendation": "Suggested fix"}
    ],
    "recommendations": "Overall recommendations"
}

Be methodical. Use run_file to verify behaviour."#;

const REFINEMENT_PROMPT: &str = r#"You are an expert in refining and optimizing code.
Improve the implementation produced by the previous steps.

You MUST answer with a JSON object of this shape:
{
    "overview": "Refinement approach",
    "improvements": [
        {"file": "path/to/file.ext", "description": "The improvement", "before": "Code before", "after": "Code after", "rationale": "Why it is better"}
    ],
    "overall_impact": "Effect on the codebase",
    "future_recommendations": "Further improvements"
}

Apply the improvements with the file tools."#;

const CONCLUSION_PROMPT: &str = r#"You are an expert at summarizing development work.

You MUST answer with a JSON object of this shape:
{
    "summary": "What was accomplished",
    "key_changes": [
        {"description": "A key change", "impact": "Its impact"}
    ],
    "files_modified": ["files", "that", "changed"],
    "remaining_issues": ["open", "issues"],
    "future_work": ["suggested", "work"],
    "conclusion": "Final thoughts"
}

Do NOT execute tools in this step. Only summarize the previous steps."#;
