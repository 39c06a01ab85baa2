//! The pipeline state machine and its driver.
//!
//! `decide` is the pure transition function; `PipelineRunner` owns one
//! run end to end: it invokes the current stage's bot and applies the
//! classification, looping until the pipeline pauses for input or
//! reaches a terminal stage. Failures inside a
//! stage never propagate out of the driver; they land in `state.error`
//! and route the run to the error terminal.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bots::{IssueBot, PlannerBot, SpecBot, StageBot, StageContext, TaskBot, TaskBreakdown};
use crate::chat::ChatApi;
use crate::config::ChatConfig;
use crate::errors::{PipelineError, PublishError};
use crate::models::{
    Classification, DocumentRecord, GeneratedIssue, IssueRecord, IssueStatus, PipelineState,
    ProjectRecord, Role, Stage, StageOutput, Turn,
};
use crate::publisher::{self, PublishRequest, Tracker};
use crate::store::RecordStore;

/// Next stage for the given state. Pure; callers apply the result.
///
/// In order: a recorded error wins; a pending question holds the
/// pipeline at the issuing stage; otherwise the fixed successor. A
/// state without a successor routes to the error terminal so nothing
/// can stall silently.
pub fn decide(state: &PipelineState) -> Stage {
    if state.error.is_some() {
        return Stage::Error;
    }
    if state.pending_question.is_some() {
        return state.current_stage;
    }
    match state.current_stage.successor() {
        Some(next) => next,
        None => Stage::Error,
    }
}

/// The edge table behind `decide`: forward edges, the two pause
/// self-edges, and error edges from every active stage.
pub fn is_valid_transition(from: Stage, to: Stage) -> bool {
    matches!(
        (from, to),
        (Stage::Planning, Stage::Spec)
            | (Stage::Spec, Stage::Task)
            | (Stage::Task, Stage::Issue)
            | (Stage::Issue, Stage::Publish)
            | (Stage::Publish, Stage::Done)
            | (Stage::Planning, Stage::Planning)
            | (Stage::Spec, Stage::Spec)
            | (Stage::Planning, Stage::Error)
            | (Stage::Spec, Stage::Error)
            | (Stage::Task, Stage::Error)
            | (Stage::Issue, Stage::Error)
            | (Stage::Publish, Stage::Error)
    )
}

/// Where a drive left the run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    /// Paused at `stage` with a clarifying question for the user.
    AwaitingInput { stage: Stage, question: String },
    /// Reached `done` or `error`.
    Finished(Stage),
}

/// Drives one pipeline run at a time over shared collaborators.
pub struct PipelineRunner {
    chat: Arc<dyn ChatApi>,
    tracker: Option<Arc<dyn Tracker>>,
    store: Arc<dyn RecordStore>,
    chat_config: ChatConfig,
    board_number: Option<u32>,
    on_stage: Option<Box<dyn Fn(Stage) + Send + Sync>>,
}

impl PipelineRunner {
    pub fn new(
        chat: Arc<dyn ChatApi>,
        tracker: Option<Arc<dyn Tracker>>,
        store: Arc<dyn RecordStore>,
        chat_config: ChatConfig,
        board_number: Option<u32>,
    ) -> Self {
        PipelineRunner {
            chat,
            tracker,
            store,
            chat_config,
            board_number,
            on_stage: None,
        }
    }

    /// Hook called right before each stage invocation; the CLI uses it
    /// to retitle its spinner.
    pub fn on_stage_start(mut self, hook: impl Fn(Stage) + Send + Sync + 'static) -> Self {
        self.on_stage = Some(Box::new(hook));
        self
    }

    /// Start a fresh run from the user's idea and drive it until it
    /// pauses or terminates.
    pub async fn start(&self, query: &str) -> (PipelineState, RunStatus) {
        let mut state = PipelineState::new(query);
        info!("Starting run {}", state.run_id);
        self.persist_project(&state).await;
        let status = self.drive(&mut state).await;
        (state, status)
    }

    /// Feed the user's answer into a paused run and drive it onward.
    ///
    /// Only the pausing stage accepts input: `stage` must name it, and
    /// the run must actually be paused. A rejected call leaves the
    /// state untouched.
    pub async fn resume(
        &self,
        state: &mut PipelineState,
        stage: Stage,
        message: &str,
    ) -> Result<RunStatus, PipelineError> {
        if !state.is_paused() {
            return Err(PipelineError::NotPaused);
        }
        if stage != state.current_stage {
            return Err(PipelineError::StageMismatch {
                expected: state.current_stage,
                got: stage,
            });
        }
        state.pending_question = None;
        state.push_turn(stage, Turn::human(message));
        Ok(self.drive(state).await)
    }

    async fn drive(&self, state: &mut PipelineState) -> RunStatus {
        loop {
            let stage = state.current_stage;
            if let Some(hook) = &self.on_stage {
                hook(stage);
            }
            if let Err(e) = self.run_stage(state, stage).await {
                warn!("Run {} failed at {}: {}", state.run_id, stage, e);
                state.error = Some(e.to_string());
            }

            let next = decide(state);
            state.current_stage = next;
            if next.is_terminal() {
                return RunStatus::Finished(next);
            }
            if state.is_paused() {
                return RunStatus::AwaitingInput {
                    stage: next,
                    question: state.pending_question.clone().unwrap_or_default(),
                };
            }
        }
    }

    async fn run_stage(&self, state: &mut PipelineState, stage: Stage) -> Result<(), PipelineError> {
        match stage {
            Stage::Planning => self.run_conversational(state, &PlannerBot).await,
            Stage::Spec => self.run_conversational(state, &SpecBot).await,
            Stage::Task => self.run_task(state).await,
            Stage::Issue => self.run_issue(state).await,
            Stage::Publish => self.run_publish(state).await,
            Stage::Done | Stage::Error => Ok(()),
        }
    }

    /// One conversational exchange: make sure the stage's log ends with
    /// a human turn, send it with the stage's continuity token, append
    /// the assistant turn, and apply the classification.
    async fn run_conversational(
        &self,
        state: &mut PipelineState,
        bot: &dyn StageBot,
    ) -> Result<(), PipelineError> {
        let stage = bot.stage();
        let query = match trailing_human_text(state.history(stage)) {
            Some(text) => text.to_string(),
            None => {
                let context = context_for(state, stage)?;
                let prompt = bot.opening_prompt(&context)?;
                state.push_turn(stage, Turn::human(prompt.clone()));
                prompt
            }
        };

        let conversation_id = state.latest_conversation_id(stage).to_string();
        let api_key = self.chat_config.api_key_for(stage);
        let reply = self.chat.send(api_key, &query, &conversation_id).await?;
        state.push_turn(
            stage,
            Turn::assistant(reply.text.clone(), reply.conversation_id),
        );

        match bot.classify(&reply.text) {
            Classification::Done(output) => {
                info!("Stage {} complete", stage);
                state.pending_question = None;
                state.set_output(stage, StageOutput::Text(output.clone()));
                self.persist_document(state, stage, &output).await;
            }
            Classification::NeedsInput(question) => {
                info!("Stage {} is asking for input", stage);
                state.pending_question = Some(question);
            }
            Classification::Unexpected(raw) => {
                warn!("Stage {} replied without a tag, keeping the reply as output", stage);
                state.pending_question = None;
                state.set_output(stage, StageOutput::Text(raw.clone()));
                self.persist_document(state, stage, &raw).await;
            }
        }
        Ok(())
    }

    /// One-shot task breakdown. The raw completion text is the output;
    /// the issue stage parses it.
    async fn run_task(&self, state: &mut PipelineState) -> Result<(), PipelineError> {
        let bot = TaskBot;
        let context = context_for(state, Stage::Task)?;
        let prompt = bot.opening_prompt(&context)?;
        state.push_turn(Stage::Task, Turn::human(prompt));

        let inputs = bot.completion_inputs(&context)?;
        let api_key = self.chat_config.api_key_for(Stage::Task);
        let text = self.chat.send_completion(api_key, inputs).await?;
        state.push_turn(Stage::Task, Turn::assistant(text.clone(), ""));

        info!("Stage {} complete", Stage::Task);
        state.set_output(Stage::Task, StageOutput::Text(text.clone()));
        self.persist_document(state, Stage::Task, &text).await;
        Ok(())
    }

    /// Parse the breakdown and generate one issue body per title, in
    /// order. Any single generation failure fails the stage.
    async fn run_issue(&self, state: &mut PipelineState) -> Result<(), PipelineError> {
        let bot = IssueBot;
        let context = context_for(state, Stage::Issue)?;
        let tasks_raw = state.output_text(Stage::Task).unwrap_or_default().to_string();
        let breakdown = TaskBreakdown::parse(&tasks_raw)?;
        debug!("Breakdown lists {} tasks", breakdown.issues.len());

        let api_key = self.chat_config.api_key_for(Stage::Issue);
        let mut issues = Vec::with_capacity(breakdown.issues.len());
        for title in &breakdown.issues {
            state.push_turn(
                Stage::Issue,
                Turn::human(format!("Write the issue body for: {}", title)),
            );
            let inputs = bot.completion_inputs(&context, title)?;
            let body = self.chat.send_completion(api_key, inputs).await?;
            state.push_turn(Stage::Issue, Turn::assistant(body.clone(), ""));
            issues.push(GeneratedIssue::new(title.clone(), body));
        }

        info!("Stage {} complete: {} issues generated", Stage::Issue, issues.len());
        self.persist_issues(state, &issues).await;
        state.set_output(Stage::Issue, StageOutput::Issues(issues));
        Ok(())
    }

    async fn run_publish(&self, state: &mut PipelineState) -> Result<(), PipelineError> {
        let issues: Vec<GeneratedIssue> = match state
            .stage_output
            .get(&Stage::Issue)
            .and_then(StageOutput::as_issues)
        {
            Some(list) => list.to_vec(),
            None => {
                return Err(PipelineError::UpstreamMissing {
                    stage: Stage::Publish,
                    field: "issues",
                });
            }
        };
        let Some(tracker) = self.tracker.as_deref() else {
            return Err(PipelineError::Publish(PublishError::MissingConfig(
                "GITHUB_TOKEN",
            )));
        };

        let outcome = publisher::publish(
            tracker,
            PublishRequest {
                issues: &issues,
                board_number: self.board_number,
                board_id: state.board_id.clone(),
            },
        )
        .await;

        if state.board_id.is_none() && outcome.board_id.is_some() {
            state.board_id = outcome.board_id;
            self.persist_board_id(state).await;
        }
        info!(
            "Stage {} complete: {} created, {} errors",
            Stage::Publish,
            outcome.report.created.len(),
            outcome.report.errors.len()
        );
        state.set_output(Stage::Publish, StageOutput::Report(outcome.report));
        Ok(())
    }

    // Record persistence is best effort: a storage failure degrades the
    // run's paper trail, not the run.

    async fn persist_project(&self, state: &PipelineState) {
        let now = Utc::now();
        let record = ProjectRecord {
            project_id: state.run_id,
            title: state.initial_query.clone(),
            board_id: state.board_id.clone(),
            created_at: now,
            updated_at: now,
        };
        self.put_record(&ProjectRecord::key(state.run_id), &record).await;
    }

    async fn persist_board_id(&self, state: &PipelineState) {
        let key = ProjectRecord::key(state.run_id);
        let existing = match self.store.get(&key).await {
            Ok(value) => value.and_then(|v| serde_json::from_value::<ProjectRecord>(v).ok()),
            Err(e) => {
                warn!("Failed to read {}: {}", key, e);
                None
            }
        };
        let now = Utc::now();
        let record = match existing {
            Some(mut record) => {
                record.board_id = state.board_id.clone();
                record.updated_at = now;
                record
            }
            None => ProjectRecord {
                project_id: state.run_id,
                title: state.initial_query.clone(),
                board_id: state.board_id.clone(),
                created_at: now,
                updated_at: now,
            },
        };
        self.put_record(&key, &record).await;
    }

    async fn persist_document(&self, state: &PipelineState, stage: Stage, content: &str) {
        let now = Utc::now();
        let record = DocumentRecord {
            project_id: state.run_id,
            stage,
            content: content.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.put_record(&DocumentRecord::key(state.run_id, stage), &record).await;
    }

    async fn persist_issues(&self, state: &PipelineState, issues: &[GeneratedIssue]) {
        let now = Utc::now();
        for issue in issues {
            let record = IssueRecord {
                issue_id: Uuid::new_v4(),
                project_id: state.run_id,
                title: issue.title.clone(),
                description: issue.body.clone(),
                status: IssueStatus::Todo,
                created_at: now,
                updated_at: now,
            };
            self.put_record(&IssueRecord::key(state.run_id, record.issue_id), &record)
                .await;
        }
    }

    async fn put_record<T: Serialize>(&self, key: &str, record: &T) {
        match serde_json::to_value(record) {
            Ok(value) => {
                if let Err(e) = self.store.put(key, value).await {
                    warn!("Failed to persist {}: {}", key, e);
                }
            }
            Err(e) => warn!("Failed to encode {}: {}", key, e),
        }
    }
}

fn trailing_human_text(history: &[Turn]) -> Option<&str> {
    match history.last() {
        Some(turn) if turn.role == Role::Human => Some(turn.text.as_str()),
        _ => None,
    }
}

/// Build the validated context a stage needs from the state's upstream
/// outputs.
fn context_for(state: &PipelineState, stage: Stage) -> Result<StageContext, PipelineError> {
    match stage {
        Stage::Planning => StageContext::planning(&state.initial_query),
        Stage::Spec => StageContext::spec(state.output_text(Stage::Planning).unwrap_or_default()),
        Stage::Task => StageContext::task(
            state.output_text(Stage::Planning).unwrap_or_default(),
            state.output_text(Stage::Spec).unwrap_or_default(),
        ),
        Stage::Issue => StageContext::issue(
            state.output_text(Stage::Planning).unwrap_or_default(),
            state.output_text(Stage::Spec).unwrap_or_default(),
            state.output_text(Stage::Task).unwrap_or_default(),
        ),
        Stage::Publish | Stage::Done | Stage::Error => Err(PipelineError::Other(
            anyhow::anyhow!("No bot context for stage {}", stage),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatReply;
    use crate::errors::ChatError;
    use crate::models::PublishedIssue;
    use crate::store::MemoryStore;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ── scripted fakes ───────────────────────────────────────────────

    #[derive(Default)]
    struct ScriptedChat {
        replies: Mutex<VecDeque<Result<ChatReply, ChatError>>>,
        completions: Mutex<VecDeque<Result<String, ChatError>>>,
        sends: Mutex<Vec<(String, String, String)>>,
        completion_sends: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl ScriptedChat {
        fn reply(self, text: &str, conversation_id: &str) -> Self {
            self.replies.lock().unwrap().push_back(Ok(ChatReply {
                text: text.to_string(),
                conversation_id: conversation_id.to_string(),
            }));
            self
        }

        fn reply_error(self, status: u16) -> Self {
            self.replies.lock().unwrap().push_back(Err(ChatError::Api {
                status,
                detail: "upstream failure".to_string(),
            }));
            self
        }

        fn completion(self, text: &str) -> Self {
            self.completions
                .lock()
                .unwrap()
                .push_back(Ok(text.to_string()));
            self
        }

        fn completion_error(self, status: u16) -> Self {
            self.completions
                .lock()
                .unwrap()
                .push_back(Err(ChatError::Api {
                    status,
                    detail: "completion failure".to_string(),
                }));
            self
        }
    }

    #[async_trait::async_trait]
    impl ChatApi for ScriptedChat {
        async fn send(
            &self,
            api_key: &str,
            query: &str,
            conversation_id: &str,
        ) -> Result<ChatReply, ChatError> {
            if api_key.is_empty() {
                return Err(ChatError::MissingCredential);
            }
            self.sends.lock().unwrap().push((
                api_key.to_string(),
                query.to_string(),
                conversation_id.to_string(),
            ));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted chat ran out of replies")
        }

        async fn send_completion(
            &self,
            api_key: &str,
            inputs: serde_json::Value,
        ) -> Result<String, ChatError> {
            self.completion_sends
                .lock()
                .unwrap()
                .push((api_key.to_string(), inputs));
            self.completions
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted chat ran out of completions")
        }
    }

    #[derive(Default)]
    struct StubTracker {
        next_number: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Tracker for StubTracker {
        async fn create_issue(
            &self,
            issue: &GeneratedIssue,
        ) -> Result<PublishedIssue, crate::errors::PublishError> {
            let number = self.next_number.fetch_add(1, Ordering::SeqCst) as i64 + 1;
            Ok(PublishedIssue {
                title: issue.title.clone(),
                id: number,
                number,
                url: format!("https://github.test/o/r/issues/{}", number),
                node_id: format!("I_{}", number),
            })
        }

        async fn resolve_board_id(&self, _number: u32) -> Option<String> {
            Some("PVT_stub".to_string())
        }

        async fn attach_to_board(&self, _board_id: &str, node_id: &str) -> Option<String> {
            Some(format!("PVTI_{}", node_id))
        }
    }

    fn test_config() -> ChatConfig {
        ChatConfig {
            base_url: "http://chat.invalid/v1".to_string(),
            user: "tester".to_string(),
            planning_api_key: "planning-key".to_string(),
            spec_api_key: "spec-key".to_string(),
            task_api_key: "task-key".to_string(),
            issue_api_key: "issue-key".to_string(),
        }
    }

    fn runner_with(chat: ScriptedChat) -> (PipelineRunner, Arc<ScriptedChat>, Arc<MemoryStore>) {
        let chat = Arc::new(chat);
        let store = Arc::new(MemoryStore::new());
        let runner = PipelineRunner::new(
            chat.clone(),
            Some(Arc::new(StubTracker::default())),
            store.clone(),
            test_config(),
            None,
        );
        (runner, chat, store)
    }

    // ── decide ───────────────────────────────────────────────────────

    #[test]
    fn test_decide_error_wins() {
        let mut state = PipelineState::new("idea");
        state.current_stage = Stage::Spec;
        state.error = Some("boom".to_string());
        state.pending_question = None;
        assert_eq!(decide(&state), Stage::Error);
    }

    #[test]
    fn test_decide_pause_holds_the_current_stage() {
        let mut state = PipelineState::new("idea");
        state.pending_question = Some("which platform?".to_string());
        assert_eq!(decide(&state), Stage::Planning);

        state.current_stage = Stage::Spec;
        assert_eq!(decide(&state), Stage::Spec);
    }

    #[test]
    fn test_decide_follows_the_successor_table() {
        let mut state = PipelineState::new("idea");
        for (from, to) in [
            (Stage::Planning, Stage::Spec),
            (Stage::Spec, Stage::Task),
            (Stage::Task, Stage::Issue),
            (Stage::Issue, Stage::Publish),
            (Stage::Publish, Stage::Done),
        ] {
            state.current_stage = from;
            assert_eq!(decide(&state), to);
        }
    }

    #[test]
    fn test_decide_without_a_successor_routes_to_error() {
        let mut state = PipelineState::new("idea");
        state.current_stage = Stage::Done;
        assert_eq!(decide(&state), Stage::Error);
        state.current_stage = Stage::Error;
        assert_eq!(decide(&state), Stage::Error);
    }

    #[test]
    fn test_decide_is_idempotent_on_unchanged_state() {
        let mut state = PipelineState::new("idea");
        state.current_stage = Stage::Task;
        assert_eq!(decide(&state), decide(&state));

        state.pending_question = Some("q".to_string());
        assert_eq!(decide(&state), decide(&state));
    }

    // ── transition table ─────────────────────────────────────────────

    #[test]
    fn test_valid_transitions() {
        assert!(is_valid_transition(Stage::Planning, Stage::Spec));
        assert!(is_valid_transition(Stage::Spec, Stage::Task));
        assert!(is_valid_transition(Stage::Task, Stage::Issue));
        assert!(is_valid_transition(Stage::Issue, Stage::Publish));
        assert!(is_valid_transition(Stage::Publish, Stage::Done));
        assert!(is_valid_transition(Stage::Planning, Stage::Planning));
        assert!(is_valid_transition(Stage::Spec, Stage::Spec));
        assert!(is_valid_transition(Stage::Task, Stage::Error));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!is_valid_transition(Stage::Planning, Stage::Task));
        assert!(!is_valid_transition(Stage::Spec, Stage::Planning));
        assert!(!is_valid_transition(Stage::Task, Stage::Task));
        assert!(!is_valid_transition(Stage::Done, Stage::Planning));
        assert!(!is_valid_transition(Stage::Error, Stage::Spec));
        assert!(!is_valid_transition(Stage::Done, Stage::Error));
    }

    #[test]
    fn test_decide_only_moves_along_table_edges() {
        // Every active, unpaused, unerrored state moves along an edge.
        let mut state = PipelineState::new("idea");
        for from in Stage::SEQUENCE {
            state.current_stage = from;
            assert!(is_valid_transition(from, decide(&state)));
        }
        // A paused conversational stage stays on its self-edge.
        state.current_stage = Stage::Planning;
        state.pending_question = Some("q".to_string());
        assert!(is_valid_transition(Stage::Planning, decide(&state)));
    }

    // ── runner: planning advances on a complete reply ────────────────

    #[tokio::test]
    async fn test_complete_reply_advances_to_spec_with_output() {
        let chat = ScriptedChat::default()
            .reply("complete: A short plan.", "conv-plan")
            .reply("question: REST or GraphQL?", "conv-spec");
        let (runner, chat, _store) = runner_with(chat);

        let (state, status) = runner.start("build a todo app").await;

        assert_eq!(state.output_text(Stage::Planning), Some("A short plan."));
        assert_eq!(state.current_stage, Stage::Spec);
        assert_eq!(
            status,
            RunStatus::AwaitingInput {
                stage: Stage::Spec,
                question: "REST or GraphQL?".to_string()
            }
        );

        let sends = chat.sends.lock().unwrap();
        // Planning opens with the idea on a fresh conversation.
        assert_eq!(sends[0].1, "build a todo app");
        assert_eq!(sends[0].2, "");
        // Spec opens on its own fresh conversation with the plan inlined.
        assert!(sends[1].1.contains("A short plan."));
        assert_eq!(sends[1].2, "");

        // The planning log holds the human turn then the assistant turn.
        let history = state.history(Stage::Planning);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::Human);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].conversation_id.as_deref(), Some("conv-plan"));
    }

    // ── runner: pause and resume ─────────────────────────────────────

    #[tokio::test]
    async fn test_question_reply_pauses_at_planning() {
        let chat = ScriptedChat::default().reply("question: what platform?", "conv-1");
        let (runner, _chat, _store) = runner_with(chat);

        let (state, status) = runner.start("build a todo app").await;

        assert_eq!(
            status,
            RunStatus::AwaitingInput {
                stage: Stage::Planning,
                question: "what platform?".to_string()
            }
        );
        assert_eq!(state.current_stage, Stage::Planning);
        assert!(state.is_paused());
        assert_eq!(state.output_text(Stage::Planning), None);
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_resume_reinvokes_the_paused_stage_not_its_successor() {
        let chat = ScriptedChat::default()
            .reply("question: what platform?", "conv-1")
            .reply("complete: Plan for the web.", "conv-1")
            .reply("question: pausing spec", "conv-2");
        let (runner, chat, _store) = runner_with(chat);

        let (mut state, _) = runner.start("build a todo app").await;
        let status = runner
            .resume(&mut state, Stage::Planning, "web, please")
            .await
            .unwrap();

        // The answer went back into planning on the same conversation.
        let sends = chat.sends.lock().unwrap();
        assert_eq!(sends[1].1, "web, please");
        assert_eq!(sends[1].2, "conv-1");
        assert_eq!(state.output_text(Stage::Planning), Some("Plan for the web."));
        assert_eq!(
            status,
            RunStatus::AwaitingInput {
                stage: Stage::Spec,
                question: "pausing spec".to_string()
            }
        );

        // Planning history: idea, question, answer, completion.
        assert_eq!(state.history(Stage::Planning).len(), 4);
    }

    #[tokio::test]
    async fn test_resume_rejects_a_run_that_is_not_paused() {
        let chat = ScriptedChat::default();
        let (runner, _chat, _store) = runner_with(chat);

        let mut state = PipelineState::new("idea");
        let err = runner
            .resume(&mut state, Stage::Planning, "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotPaused));
        assert!(state.history(Stage::Planning).is_empty());
    }

    #[tokio::test]
    async fn test_resume_rejects_the_wrong_stage_and_stays_paused() {
        let chat = ScriptedChat::default().reply("question: what platform?", "conv-1");
        let (runner, _chat, _store) = runner_with(chat);

        let (mut state, _) = runner.start("idea").await;
        let before = state.history(Stage::Planning).len();
        let err = runner
            .resume(&mut state, Stage::Spec, "web")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::StageMismatch {
                expected: Stage::Planning,
                got: Stage::Spec
            }
        ));
        assert!(state.is_paused());
        assert_eq!(state.history(Stage::Planning).len(), before);
    }

    // ── runner: transport failure routes to error ────────────────────

    #[tokio::test]
    async fn test_http_failure_in_spec_terminates_the_run() {
        let chat = ScriptedChat::default()
            .reply("complete: A plan.", "conv-1")
            .reply_error(500);
        let (runner, chat, _store) = runner_with(chat);

        let (state, status) = runner.start("idea").await;

        assert_eq!(status, RunStatus::Finished(Stage::Error));
        assert_eq!(state.current_stage, Stage::Error);
        let error = state.error.as_deref().unwrap();
        assert!(error.contains("500"));
        // Nothing past spec ran.
        assert!(chat.completion_sends.lock().unwrap().is_empty());
        assert_eq!(state.output_text(Stage::Spec), None);
    }

    #[tokio::test]
    async fn test_missing_credential_surfaces_as_run_error() {
        let mut config = test_config();
        config.planning_api_key = String::new();
        let runner = PipelineRunner::new(
            Arc::new(ScriptedChat::default()),
            None,
            Arc::new(MemoryStore::new()),
            config,
            None,
        );

        let (state, status) = runner.start("idea").await;
        assert_eq!(status, RunStatus::Finished(Stage::Error));
        assert!(state.error.as_deref().unwrap().contains("key is missing"));
    }

    // ── runner: full happy path ──────────────────────────────────────

    fn happy_chat() -> ScriptedChat {
        ScriptedChat::default()
            .reply("complete: The plan.", "conv-plan")
            .reply("complete: The tech spec.", "conv-spec")
            .completion(r#"{"issues": ["Set up CI", "Add auth"]}"#)
            .completion("Body for CI setup")
            .completion("Body for auth")
    }

    #[tokio::test]
    async fn test_full_run_reaches_done_with_a_report() {
        let (runner, chat, store) = runner_with(happy_chat());

        let (state, status) = runner.start("build a todo app").await;

        assert_eq!(status, RunStatus::Finished(Stage::Done));
        assert_eq!(state.current_stage, Stage::Done);
        assert!(state.error.is_none());
        assert!(!state.is_paused());

        // Every stage left its output behind.
        assert_eq!(state.output_text(Stage::Planning), Some("The plan."));
        assert_eq!(state.output_text(Stage::Spec), Some("The tech spec."));
        assert!(state.output_text(Stage::Task).unwrap().contains("Set up CI"));

        let issues = state
            .stage_output
            .get(&Stage::Issue)
            .and_then(StageOutput::as_issues)
            .unwrap();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].title, "Set up CI");
        assert_eq!(issues[0].body, "Body for CI setup");
        assert_eq!(issues[1].title, "Add auth");
        assert_eq!(issues[1].body, "Body for auth");
        assert!(issues.iter().all(|i| !i.body.is_empty()));

        let report = state
            .stage_output
            .get(&Stage::Publish)
            .and_then(StageOutput::as_report)
            .unwrap();
        assert_eq!(report.created.len(), 2);
        assert!(report.errors.is_empty());

        // Each stage spoke with its own credential.
        let sends = chat.sends.lock().unwrap();
        assert_eq!(sends[0].0, "planning-key");
        assert_eq!(sends[1].0, "spec-key");
        let completions = chat.completion_sends.lock().unwrap();
        assert_eq!(completions[0].0, "task-key");
        assert_eq!(completions[1].0, "issue-key");
        // Issue completions carry the per-title inputs.
        assert_eq!(completions[1].1["title"], "Set up CI");
        assert_eq!(completions[2].1["title"], "Add auth");
        assert_eq!(completions[1].1["plan"], "The plan.");

        // The run left its records behind.
        let project = store.get(&ProjectRecord::key(state.run_id)).await.unwrap();
        assert!(project.is_some());
        let documents = store
            .scan(&DocumentRecord::prefix(state.run_id))
            .await
            .unwrap();
        assert_eq!(documents.len(), 3);
        let issue_records = store.scan(&IssueRecord::prefix(state.run_id)).await.unwrap();
        assert_eq!(issue_records.len(), 2);
    }

    #[tokio::test]
    async fn test_untagged_reply_is_kept_as_the_output() {
        let chat = ScriptedChat::default()
            .reply("Here is a plan with no tag.", "conv-1")
            .reply("question: pausing", "conv-2");
        let (runner, _chat, _store) = runner_with(chat);

        let (state, _) = runner.start("idea").await;
        assert_eq!(
            state.output_text(Stage::Planning),
            Some("Here is a plan with no tag.")
        );
        assert_eq!(state.current_stage, Stage::Spec);
    }

    #[tokio::test]
    async fn test_malformed_breakdown_fails_the_issue_stage() {
        let chat = ScriptedChat::default()
            .reply("complete: The plan.", "c1")
            .reply("complete: The tech spec.", "c2")
            .completion("this is not a task list");
        let (runner, _chat, _store) = runner_with(chat);

        let (state, status) = runner.start("idea").await;
        assert_eq!(status, RunStatus::Finished(Stage::Error));
        assert!(state.error.as_deref().unwrap().contains("not a valid issue list"));
    }

    #[tokio::test]
    async fn test_issue_body_failure_fails_the_stage() {
        let chat = ScriptedChat::default()
            .reply("complete: The plan.", "c1")
            .reply("complete: The tech spec.", "c2")
            .completion(r#"{"issues": ["One", "Two"]}"#)
            .completion("Body one")
            .completion_error(502);
        let (runner, _chat, _store) = runner_with(chat);

        let (state, status) = runner.start("idea").await;
        assert_eq!(status, RunStatus::Finished(Stage::Error));
        assert!(state.error.as_deref().unwrap().contains("502"));
        assert!(state.stage_output.get(&Stage::Issue).is_none());
    }

    #[tokio::test]
    async fn test_empty_breakdown_still_reaches_done() {
        let chat = ScriptedChat::default()
            .reply("complete: The plan.", "c1")
            .reply("complete: The tech spec.", "c2")
            .completion(r#"{"issues": []}"#);
        let (runner, _chat, _store) = runner_with(chat);

        let (state, status) = runner.start("idea").await;
        assert_eq!(status, RunStatus::Finished(Stage::Done));
        let report = state
            .stage_output
            .get(&Stage::Publish)
            .and_then(StageOutput::as_report)
            .unwrap();
        assert!(report.created.is_empty());
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_publish_without_a_tracker_fails_the_run() {
        let chat = Arc::new(happy_chat());
        let runner = PipelineRunner::new(
            chat,
            None,
            Arc::new(MemoryStore::new()),
            test_config(),
            None,
        );

        let (state, status) = runner.start("idea").await;
        assert_eq!(status, RunStatus::Finished(Stage::Error));
        assert!(state.error.as_deref().unwrap().contains("GITHUB_TOKEN"));
    }

    #[tokio::test]
    async fn test_resolved_board_id_is_cached_on_the_state() {
        let chat = happy_chat();
        let chat = Arc::new(chat);
        let store = Arc::new(MemoryStore::new());
        let runner = PipelineRunner::new(
            chat,
            Some(Arc::new(StubTracker::default())),
            store.clone(),
            test_config(),
            Some(7),
        );

        let (state, status) = runner.start("idea").await;
        assert_eq!(status, RunStatus::Finished(Stage::Done));
        assert_eq!(state.board_id.as_deref(), Some("PVT_stub"));

        let project: ProjectRecord = serde_json::from_value(
            store
                .get(&ProjectRecord::key(state.run_id))
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(project.board_id.as_deref(), Some("PVT_stub"));
    }

    #[tokio::test]
    async fn test_stage_hook_sees_every_invocation() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let chat = Arc::new(happy_chat());
        let runner = PipelineRunner::new(
            chat,
            Some(Arc::new(StubTracker::default())),
            Arc::new(MemoryStore::new()),
            test_config(),
            None,
        )
        .on_stage_start(move |stage| seen_clone.lock().unwrap().push(stage));

        let (_state, status) = runner.start("idea").await;
        assert_eq!(status, RunStatus::Finished(Stage::Done));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Stage::Planning, Stage::Spec, Stage::Task, Stage::Issue, Stage::Publish]
        );
    }
}
