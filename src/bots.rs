//! Stage bots: the four LLM-facing generators of the pipeline.
//!
//! Each bot pairs a system prompt with its opening prompt and shares one
//! reply classifier. Planning and spec are conversational (the remote
//! app may ask back); task and issue are one-shot completion generators.
//! The runner owns the chat calls; bots are pure prompt and parse logic.

use serde::Deserialize;
use tracing::warn;

use crate::errors::PipelineError;
use crate::models::{Classification, Stage};

/// Tags a bot may lead its reply with, per the stage system prompts.
const DONE_TAGS: [&str; 2] = ["complete", "done"];
const QUESTION_TAGS: [&str; 2] = ["question", "needs-input"];

/// Classify a raw stage reply by its leading tag.
///
/// Tags match case-insensitively with an optional `:`, and must end at
/// a word boundary so `completed ...` is not read as `complete`.
/// Untagged replies come back as `Unexpected` with the text untouched;
/// the caller decides the policy.
pub fn classify_reply(raw: &str) -> Classification {
    let trimmed = raw.trim();
    for tag in DONE_TAGS {
        if let Some(rest) = strip_tag(trimmed, tag) {
            return Classification::Done(rest.to_string());
        }
    }
    for tag in QUESTION_TAGS {
        if let Some(rest) = strip_tag(trimmed, tag) {
            return Classification::NeedsInput(rest.to_string());
        }
    }
    Classification::Unexpected(raw.to_string())
}

fn strip_tag<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    if text.len() < tag.len() || !text.is_char_boundary(tag.len()) {
        return None;
    }
    let (head, rest) = text.split_at(tag.len());
    if !head.eq_ignore_ascii_case(tag) {
        return None;
    }
    match rest.chars().next() {
        None => Some(""),
        Some(c) if c == ':' || c.is_whitespace() => {
            let rest = rest.trim_start();
            let rest = rest.strip_prefix(':').unwrap_or(rest);
            Some(rest.trim())
        }
        Some(_) => None,
    }
}

/// Validated inputs for one stage invocation.
///
/// Construction checks the upstream outputs the stage depends on, so a
/// bot never sees a missing or empty upstream document.
#[derive(Debug, Clone, PartialEq)]
pub enum StageContext {
    Planning { query: String },
    Spec { plan: String },
    Task { plan: String, tech_spec: String },
    Issue { plan: String, tech_spec: String, tasks: String },
}

impl StageContext {
    pub fn planning(query: &str) -> Result<Self, PipelineError> {
        Ok(StageContext::Planning {
            query: require(Stage::Planning, "query", query)?,
        })
    }

    pub fn spec(plan: &str) -> Result<Self, PipelineError> {
        Ok(StageContext::Spec {
            plan: require(Stage::Spec, "plan", plan)?,
        })
    }

    pub fn task(plan: &str, tech_spec: &str) -> Result<Self, PipelineError> {
        Ok(StageContext::Task {
            plan: require(Stage::Task, "plan", plan)?,
            tech_spec: require(Stage::Task, "tech_spec", tech_spec)?,
        })
    }

    pub fn issue(plan: &str, tech_spec: &str, tasks: &str) -> Result<Self, PipelineError> {
        Ok(StageContext::Issue {
            plan: require(Stage::Issue, "plan", plan)?,
            tech_spec: require(Stage::Issue, "tech_spec", tech_spec)?,
            tasks: require(Stage::Issue, "tasks", tasks)?,
        })
    }

    pub fn stage(&self) -> Stage {
        match self {
            StageContext::Planning { .. } => Stage::Planning,
            StageContext::Spec { .. } => Stage::Spec,
            StageContext::Task { .. } => Stage::Task,
            StageContext::Issue { .. } => Stage::Issue,
        }
    }
}

fn require(stage: Stage, field: &'static str, value: &str) -> Result<String, PipelineError> {
    if value.trim().is_empty() {
        return Err(PipelineError::UpstreamMissing { stage, field });
    }
    Ok(value.to_string())
}

fn context_mismatch(expected: Stage, got: &StageContext) -> PipelineError {
    PipelineError::Other(anyhow::anyhow!(
        "Context for {} passed to the {} bot",
        got.stage(),
        expected
    ))
}

/// Capability shared by the four stage generators.
pub trait StageBot: Send + Sync {
    fn stage(&self) -> Stage;

    /// System prompt the stage's remote app is configured with.
    fn system_prompt(&self) -> &'static str;

    /// First-turn prompt rendered from the validated context. Also the
    /// human turn logged for completion-backed stages.
    fn opening_prompt(&self, context: &StageContext) -> Result<String, PipelineError>;

    fn classify(&self, raw: &str) -> Classification {
        classify_reply(raw)
    }
}

const PLANNING_SYSTEM_PROMPT: &str = r#"You are a product planner. Turn the user's rough idea into a product plan document.

Discuss the idea with the user. When something essential is unclear, ask exactly one clarifying question per turn.

Reply protocol:
- To ask a clarifying question, start your reply with "question:" followed by the question.
- When the plan is finished, start your reply with "complete:" followed by the full plan document.

The plan should cover: target users, the problem being solved, core features, and rough scope. Do not include implementation detail."#;

const SPEC_SYSTEM_PROMPT: &str = r#"You are a software architect. Turn a product plan into a technical specification.

Discuss open points with the user when needed. Ask exactly one clarifying question per turn.

Reply protocol:
- To ask a clarifying question, start your reply with "question:" followed by the question.
- When the specification is finished, start your reply with "complete:" followed by the full specification document.

The specification should cover: architecture, data model, external interfaces, and the main technical decisions."#;

const TASK_SYSTEM_PROMPT: &str = r#"You are a delivery planner. Break a technical specification down into implementation tasks.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "issues": ["Short task title", "Another task title"]
}

Rules:
- Each title describes one independently implementable unit of work.
- Order titles so earlier tasks unblock later ones.
- Keep titles under 80 characters."#;

const ISSUE_SYSTEM_PROMPT: &str = r#"You are a technical writer. Write the body of one tracker issue for the given task title.

Use the plan, the technical specification, and the full task list as context. Respond with the issue body in markdown: a short goal statement, acceptance criteria as a checklist, and pointers to the relevant parts of the specification. Do not repeat the title."#;

/// Conversational product-plan stage.
pub struct PlannerBot;

impl StageBot for PlannerBot {
    fn stage(&self) -> Stage {
        Stage::Planning
    }

    fn system_prompt(&self) -> &'static str {
        PLANNING_SYSTEM_PROMPT
    }

    fn opening_prompt(&self, context: &StageContext) -> Result<String, PipelineError> {
        let StageContext::Planning { query } = context else {
            return Err(context_mismatch(Stage::Planning, context));
        };
        Ok(query.clone())
    }
}

/// Conversational technical-specification stage.
pub struct SpecBot;

impl StageBot for SpecBot {
    fn stage(&self) -> Stage {
        Stage::Spec
    }

    fn system_prompt(&self) -> &'static str {
        SPEC_SYSTEM_PROMPT
    }

    fn opening_prompt(&self, context: &StageContext) -> Result<String, PipelineError> {
        let StageContext::Spec { plan } = context else {
            return Err(context_mismatch(Stage::Spec, context));
        };
        Ok(format!(
            "Create the technical specification for the following product plan.\n\n{}",
            plan
        ))
    }
}

/// One-shot task-breakdown stage.
pub struct TaskBot;

impl TaskBot {
    /// Structured inputs for the completion call.
    pub fn completion_inputs(&self, context: &StageContext) -> Result<serde_json::Value, PipelineError> {
        let StageContext::Task { plan, tech_spec } = context else {
            return Err(context_mismatch(Stage::Task, context));
        };
        Ok(serde_json::json!({
            "plan": plan,
            "tech_spec": tech_spec,
        }))
    }
}

impl StageBot for TaskBot {
    fn stage(&self) -> Stage {
        Stage::Task
    }

    fn system_prompt(&self) -> &'static str {
        TASK_SYSTEM_PROMPT
    }

    fn opening_prompt(&self, context: &StageContext) -> Result<String, PipelineError> {
        let StageContext::Task { plan, tech_spec } = context else {
            return Err(context_mismatch(Stage::Task, context));
        };
        Ok(format!(
            "Break the work down into implementation tasks.\n\n## Plan\n{}\n\n## Technical specification\n{}",
            plan, tech_spec
        ))
    }
}

/// One-shot issue-body stage, driven once per task title.
pub struct IssueBot;

impl IssueBot {
    /// Structured inputs for the completion call generating one body.
    pub fn completion_inputs(
        &self,
        context: &StageContext,
        title: &str,
    ) -> Result<serde_json::Value, PipelineError> {
        let StageContext::Issue { plan, tech_spec, tasks } = context else {
            return Err(context_mismatch(Stage::Issue, context));
        };
        Ok(serde_json::json!({
            "plan": plan,
            "tech_spec": tech_spec,
            "tasks": tasks,
            "title": title,
        }))
    }
}

impl StageBot for IssueBot {
    fn stage(&self) -> Stage {
        Stage::Issue
    }

    fn system_prompt(&self) -> &'static str {
        ISSUE_SYSTEM_PROMPT
    }

    fn opening_prompt(&self, context: &StageContext) -> Result<String, PipelineError> {
        let StageContext::Issue { tasks, .. } = context else {
            return Err(context_mismatch(Stage::Issue, context));
        };
        Ok(format!(
            "Write one issue body per task title.\n\n## Tasks\n{}",
            tasks
        ))
    }
}

/// Parsed output of the task stage: the ordered issue titles.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskBreakdown {
    pub issues: Vec<String>,
}

#[derive(Deserialize)]
struct RawBreakdown {
    issues: Vec<serde_json::Value>,
}

impl TaskBreakdown {
    /// Accepts bare JSON or JSON embedded in surrounding prose.
    /// Non-string entries are skipped with a warning.
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        let cleaned = if let Some(start) = raw.find('{')
            && let Some(end) = raw.rfind('}')
            && end > start
        {
            &raw[start..=end]
        } else {
            raw
        };
        let parsed: RawBreakdown = serde_json::from_str(cleaned)
            .map_err(|e| PipelineError::InvalidTaskList(e.to_string()))?;

        let mut issues = Vec::new();
        for entry in parsed.issues {
            match entry {
                serde_json::Value::String(title) => issues.push(title),
                other => warn!("Skipping non-string task entry: {}", other),
            }
        }
        Ok(TaskBreakdown { issues })
    }
}
