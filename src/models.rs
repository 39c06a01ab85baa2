//! Core domain types for the planning pipeline.
//!
//! Everything the state machine threads between stages lives here:
//! the `Stage` enum and its successor table, per-stage conversation
//! `Turn`s, accepted `StageOutput`s, the `PipelineState` record itself,
//! and the persisted project/document/issue records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One step of the pipeline, plus the two terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planning,
    Spec,
    Task,
    Issue,
    Publish,
    Done,
    Error,
}

impl Stage {
    /// The active stages in execution order (terminals excluded).
    pub const SEQUENCE: [Stage; 5] = [
        Stage::Planning,
        Stage::Spec,
        Stage::Task,
        Stage::Issue,
        Stage::Publish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Planning => "planning",
            Stage::Spec => "spec",
            Stage::Task => "task",
            Stage::Issue => "issue",
            Stage::Publish => "publish",
            Stage::Done => "done",
            Stage::Error => "error",
        }
    }

    /// The stage that follows on a done classification. Terminals have none.
    pub fn successor(&self) -> Option<Stage> {
        match self {
            Stage::Planning => Some(Stage::Spec),
            Stage::Spec => Some(Stage::Task),
            Stage::Task => Some(Stage::Issue),
            Stage::Issue => Some(Stage::Publish),
            Stage::Publish => Some(Stage::Done),
            Stage::Done | Stage::Error => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Error)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Stage::Planning),
            "spec" => Ok(Stage::Spec),
            "task" => Ok(Stage::Task),
            "issue" => Ok(Stage::Issue),
            "publish" => Ok(Stage::Publish),
            "done" => Ok(Stage::Done),
            "error" => Ok(Stage::Error),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Human,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Human => "human",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Role::Human),
            "assistant" => Ok(Role::Assistant),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// One immutable entry in a stage's conversation log.
///
/// Assistant turns carry the conversation id returned by the chat
/// endpoint; the latest one is the continuity token for the next call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub conversation_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl Turn {
    pub fn human(text: impl Into<String>) -> Self {
        Turn {
            role: Role::Human,
            text: text.into(),
            conversation_id: None,
            at: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        let id = conversation_id.into();
        Turn {
            role: Role::Assistant,
            text: text.into(),
            conversation_id: if id.is_empty() { None } else { Some(id) },
            at: Utc::now(),
        }
    }
}

/// Three-way outcome of classifying a stage reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The stage produced its output; the pipeline may advance.
    Done(String),
    /// The stage needs a human answer before it can finish.
    NeedsInput(String),
    /// No recognized tag; the raw reply is carried as-is.
    Unexpected(String),
}

/// An issue produced by the issue stage, prior to publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedIssue {
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

impl GeneratedIssue {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        GeneratedIssue {
            title: title.into(),
            body: body.into(),
            labels: Vec::new(),
        }
    }
}

/// A ticket successfully created on the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedIssue {
    pub title: String,
    pub id: i64,
    pub number: i64,
    pub url: String,
    pub node_id: String,
}

/// Outcome of a publish run: everything created, every failure, enumerated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishReport {
    pub created: Vec<PublishedIssue>,
    pub errors: Vec<String>,
}

/// The accepted result of a completed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutput {
    Text(String),
    Issues(Vec<GeneratedIssue>),
    Report(PublishReport),
}

impl StageOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StageOutput::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_issues(&self) -> Option<&[GeneratedIssue]> {
        match self {
            StageOutput::Issues(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_report(&self) -> Option<&PublishReport> {
        match self {
            StageOutput::Report(r) => Some(r),
            _ => None,
        }
    }
}

/// The full mutable record of one pipeline run.
///
/// Passed into and returned from every transition call; never ambient.
/// `stage_history` is append-only; `stage_output` holds a stage's result
/// exactly while its latest classification is done.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub run_id: Uuid,
    pub initial_query: String,
    pub stage_history: BTreeMap<Stage, Vec<Turn>>,
    pub stage_output: BTreeMap<Stage, StageOutput>,
    pub current_stage: Stage,
    pub pending_question: Option<String>,
    pub board_id: Option<String>,
    pub error: Option<String>,
}

impl PipelineState {
    pub fn new(initial_query: impl Into<String>) -> Self {
        PipelineState {
            run_id: Uuid::new_v4(),
            initial_query: initial_query.into(),
            stage_history: BTreeMap::new(),
            stage_output: BTreeMap::new(),
            current_stage: Stage::Planning,
            pending_question: None,
            board_id: None,
            error: None,
        }
    }

    pub fn history(&self, stage: Stage) -> &[Turn] {
        self.stage_history
            .get(&stage)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn push_turn(&mut self, stage: Stage, turn: Turn) {
        self.stage_history.entry(stage).or_default().push(turn);
    }

    /// Continuity token for the next chat call in this stage: the
    /// conversation id of the most recent assistant turn, or "" when the
    /// stage has not spoken yet.
    pub fn latest_conversation_id(&self, stage: Stage) -> &str {
        self.history(stage)
            .iter()
            .rev()
            .find(|t| t.role == Role::Assistant)
            .and_then(|t| t.conversation_id.as_deref())
            .unwrap_or("")
    }

    pub fn set_output(&mut self, stage: Stage, output: StageOutput) {
        self.stage_output.insert(stage, output);
    }

    pub fn output_text(&self, stage: Stage) -> Option<&str> {
        self.stage_output.get(&stage).and_then(StageOutput::as_text)
    }

    pub fn is_paused(&self) -> bool {
        self.pending_question.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.current_stage.is_terminal()
    }
}

/// Persisted ticket workflow position for a generated issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Todo,
    InProgress,
    Done,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Todo => "todo",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::Done => "done",
        }
    }
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IssueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(IssueStatus::Todo),
            "in_progress" => Ok(IssueStatus::InProgress),
            "done" => Ok(IssueStatus::Done),
            _ => Err(format!("Invalid issue status: {}", s)),
        }
    }
}

/// Stored record for one pipeline run's project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub project_id: Uuid,
    pub title: String,
    pub board_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectRecord {
    pub fn key(project_id: Uuid) -> String {
        format!("project/{}", project_id)
    }
}

/// Stored record for one stage's accepted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub project_id: Uuid,
    pub stage: Stage,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    pub fn key(project_id: Uuid, stage: Stage) -> String {
        format!("document/{}/{}", project_id, stage)
    }

    pub fn prefix(project_id: Uuid) -> String {
        format!("document/{}/", project_id)
    }
}

/// Stored record for one generated issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub issue_id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub description: String,
    pub status: IssueStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IssueRecord {
    pub fn key(project_id: Uuid, issue_id: Uuid) -> String {
        format!("issue/{}/{}", project_id, issue_id)
    }

    pub fn prefix(project_id: Uuid) -> String {
        format!("issue/{}/", project_id)
    }
}
