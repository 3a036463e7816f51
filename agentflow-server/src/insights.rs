//! Periodic insight analysis
//!
//! On a fixed cron cadence (default every 5 hours) the scheduler walks the
//! users with stored activity, skips anyone with fewer than the threshold
//! of new events, and runs the external analyzer over the rest with
//! SQL-over-store and schema tools. Results persist as [`Insight`] rows and
//! broadcast on the global topic.
//!
//! When the analyzer returns follow-up questions and a question channel is
//! configured, the insight starts `preliminary`; answers arrive back on the
//! bus (`thread:ready`) and drive in-place refinement, up to three rounds,
//! ending `refined`. Without a channel the insight is `final-no-answers`.
//! A failed run becomes an `insight:error` broadcast; the loop continues.

use crate::state::AppState;
use crate::tools;
use agentflow_core::analyzer::{AnalyzerReport, ChatTurn, ChatUsage};
use agentflow_core::bus::{BusMessage, GLOBAL_TOPIC};
use agentflow_core::{
    now_ms, AnalysisState, Error, Insight, InsightPhase, InsightQuestion, Result,
    MAX_INSIGHT_ROUNDS,
};
use chrono::Utc;
use cron::Schedule;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Bus topic answers arrive on: `{"questionId": ..., "answer": ...}`.
pub const ANSWER_TOPIC: &str = "thread:ready";

const SYSTEM_PROMPT: &str = "You are an analyst reviewing a developer's AI-agent coding \
sessions inside an observability service. Use the query_events and get_schema tools to \
inspect their sessions and events, then respond with a single JSON object with fields: \
summary (markdown string), userIntent (string), frustrationPoints (string array), \
improvements (string array), followUpActions (array of {description, priority: \
low|medium|high, category: tooling|workflow|knowledge|other}), questions (string array, \
only questions whose answers would materially improve the analysis), stats (object). \
Respond with the JSON object only.";

/// Periodic user-scoped batch analyzer.
pub struct InsightScheduler {
    state: AppState,
    running: AtomicBool,
}

impl InsightScheduler {
    pub fn new(state: AppState) -> Arc<Self> {
        Arc::new(Self {
            state,
            running: AtomicBool::new(false),
        })
    }

    /// Start the cadence loop and the answer listener.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let listener = self.clone();
        tokio::spawn(async move { listener.listen_for_answers().await });

        let scheduler = self.clone();
        tokio::spawn(async move {
            let cadence = scheduler.state.config.insights.cadence.clone();
            let schedule = match Schedule::from_str(&cadence) {
                Ok(schedule) => schedule,
                Err(error) => {
                    tracing::error!(%error, cadence, "invalid insight cadence, scheduler disabled");
                    return;
                }
            };
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    return;
                };
                let wait = (next - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_secs(1));
                tokio::time::sleep(wait).await;
                scheduler.run_once().await;
            }
        })
    }

    /// One analysis sweep. `protect` discipline: if the previous sweep is
    /// still executing this one is skipped entirely.
    pub async fn run_once(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("insight run still executing, skipping this cadence");
            return;
        }

        let users = match self.state.db.distinct_user_ids() {
            Ok(users) => users,
            Err(error) => {
                tracing::error!(%error, "failed to enumerate users");
                self.running.store(false, Ordering::SeqCst);
                return;
            }
        };

        for user_id in users {
            if let Err(error) = self.analyze_user_if_due(&user_id).await {
                tracing::error!(%error, user_id, "insight analysis failed");
                self.state
                    .bus
                    .publish(
                        GLOBAL_TOPIC,
                        BusMessage::new(
                            "insight:error",
                            json!({"userId": user_id, "error": error.to_string()}),
                        ),
                    )
                    .await;
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    async fn analyze_user_if_due(&self, user_id: &str) -> Result<()> {
        let analysis_state = self.state.db.analysis_state(user_id)?;
        let since = analysis_state.last_event_timestamp.unwrap_or(0);
        let new_events = self.state.db.count_user_events_since(user_id, since)?;
        if new_events < self.state.config.insights.min_new_events {
            tracing::debug!(user_id, new_events, "below analysis threshold, skipping");
            return Ok(());
        }

        let insight = self.analyze_user(user_id, since).await?;
        self.state
            .bus
            .publish(
                GLOBAL_TOPIC,
                BusMessage::new("insight:new", serde_json::to_value(&insight)?),
            )
            .await;
        Ok(())
    }

    /// Run the analyzer over a user's window and persist the result.
    pub async fn analyze_user(&self, user_id: &str, since: i64) -> Result<Insight> {
        let window_end = now_ms();
        let sessions_analyzed = self.state.db.count_user_sessions_since(user_id, since)?;
        let events_analyzed = self.state.db.count_user_events_since(user_id, since)?;

        let prompt = format!(
            "Analyze the coding sessions of user '{}'. Only consider events with \
             timestamp > {} (epoch ms). There are {} sessions and {} events in that \
             window. Sessions carry user_id; join through sessions to scope your queries.",
            user_id, since, sessions_analyzed, events_analyzed
        );
        let outcome = self.run_analyzer(&prompt).await?;

        let has_questions = !outcome.report.questions.is_empty();
        let phase = match (has_questions, self.state.questions.is_some()) {
            (true, true) => Some(InsightPhase::Preliminary),
            (true, false) => Some(InsightPhase::FinalNoAnswers),
            (false, _) => None,
        };

        let now = now_ms();
        let insight = Insight {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            repo: None,
            content: render_content(&outcome.report),
            categories: categories_of(&outcome.report),
            follow_up_actions: outcome.report.follow_up_actions.clone(),
            sessions_analyzed,
            events_analyzed,
            usage: outcome.usage_json(),
            model: outcome.model.clone(),
            phase,
            round: 1,
            answers_received: 0,
            window_start: since,
            window_end,
            created_at: now,
            updated_at: now,
        };
        self.state.db.insert_insight(&insight)?;

        if phase == Some(InsightPhase::Preliminary) {
            self.post_questions(&insight.id, &outcome.report.questions)
                .await?;
        }

        self.state.db.set_analysis_state(
            user_id,
            &AnalysisState {
                last_analyzed_at: Some(window_end),
                last_event_timestamp: self
                    .state
                    .db
                    .latest_user_event_timestamp(user_id)?
                    .or(Some(since)),
            },
        )?;

        Ok(insight)
    }

    async fn post_questions(&self, insight_id: &str, questions: &[String]) -> Result<()> {
        let Some(channel) = &self.state.questions else {
            return Ok(());
        };
        for text in questions {
            let question = InsightQuestion {
                id: Uuid::new_v4().to_string(),
                insight_id: insight_id.to_string(),
                text: text.clone(),
                answer: None,
                answered_at: None,
                created_at: now_ms(),
            };
            self.state.db.insert_question(&question)?;
            if let Err(error) = channel.post_question(&question).await {
                // The answer will just never come; the insight stays preliminary
                tracing::warn!(%error, question_id = %question.id, "failed to post question");
            }
        }
        Ok(())
    }

    async fn listen_for_answers(self: Arc<Self>) {
        let mut sub = self.state.bus.subscribe(ANSWER_TOPIC).await;
        while let Some(msg) = sub.recv().await {
            let Some(question_id) = msg.data.get("questionId").and_then(Value::as_str) else {
                continue;
            };
            let answer = msg.data.get("answer").and_then(Value::as_str).unwrap_or("");
            if let Err(error) = self.handle_answer(question_id, answer).await {
                tracing::error!(%error, question_id, "failed to process answer");
                self.state
                    .bus
                    .publish(
                        GLOBAL_TOPIC,
                        BusMessage::new(
                            "insight:error",
                            json!({"questionId": question_id, "error": error.to_string()}),
                        ),
                    )
                    .await;
            }
        }
    }

    /// Record one answer; when the insight's questions are all answered,
    /// refine it in place.
    pub async fn handle_answer(&self, question_id: &str, answer: &str) -> Result<()> {
        let Some(question) = self.state.db.answer_question(question_id, answer)? else {
            tracing::debug!(question_id, "answer for unknown question, ignoring");
            return Ok(());
        };

        let questions = self.state.db.questions_for_insight(&question.insight_id)?;
        if questions.iter().all(|q| q.answer.is_some()) {
            self.refine(&question.insight_id).await?;
        }
        Ok(())
    }

    async fn refine(&self, insight_id: &str) -> Result<()> {
        let Some(mut insight) = self.state.db.get_insight(insight_id)? else {
            return Ok(());
        };
        let questions = self.state.db.questions_for_insight(insight_id)?;
        let answered: Vec<&InsightQuestion> =
            questions.iter().filter(|q| q.answer.is_some()).collect();

        let mut prompt = format!(
            "You previously produced this analysis:\n\n{}\n\nThe user answered your \
             follow-up questions:\n",
            insight.content
        );
        for question in &answered {
            prompt.push_str(&format!(
                "- Q: {}\n  A: {}\n",
                question.text,
                question.answer.as_deref().unwrap_or("")
            ));
        }
        prompt.push_str(
            "\nRefine the analysis with this context. Same JSON object format; ask further \
             questions only if something still blocks the analysis.",
        );

        let outcome = self.run_analyzer(&prompt).await?;

        let next_round = insight.round + 1;
        let wants_more = !outcome.report.questions.is_empty()
            && self.state.questions.is_some()
            && next_round < MAX_INSIGHT_ROUNDS;

        insight.content = render_content(&outcome.report);
        insight.categories = categories_of(&outcome.report);
        insight.follow_up_actions = outcome.report.follow_up_actions.clone();
        insight.usage = outcome.usage_json();
        if outcome.model.is_some() {
            insight.model = outcome.model.clone();
        }
        insight.round = next_round;
        insight.answers_received = answered.len() as i64;
        insight.phase = Some(if wants_more {
            InsightPhase::Preliminary
        } else {
            InsightPhase::Refined
        });
        insight.updated_at = now_ms();
        self.state.db.update_insight(&insight)?;

        if wants_more {
            self.post_questions(insight_id, &outcome.report.questions)
                .await?;
        }

        self.state
            .bus
            .publish(
                GLOBAL_TOPIC,
                BusMessage::new("insight:updated", serde_json::to_value(&insight)?),
            )
            .await;
        Ok(())
    }

    /// Drive the tool loop to a final report.
    async fn run_analyzer(&self, prompt: &str) -> Result<AnalyzerOutcome> {
        let chat = self
            .state
            .chat
            .clone()
            .ok_or_else(|| Error::Analyzer("no chat client configured".to_string()))?;
        let specs = tools::analyzer_tool_specs();
        let mut messages = vec![json!({"role": "user", "content": prompt})];
        let mut usage = ChatUsage::default();
        let mut model = None;

        for _ in 0..self.state.config.analyzer.max_tool_iterations {
            let response = chat.complete(SYSTEM_PROMPT, &messages, &specs).await?;
            if let Some(u) = &response.usage {
                usage.input_tokens += u.input_tokens;
                usage.output_tokens += u.output_tokens;
            }
            if response.model.is_some() {
                model = response.model.clone();
            }
            match response.turn {
                ChatTurn::ToolCalls(calls) => {
                    messages.push(json!({"role": "assistant", "content": response.content}));
                    let mut results = Vec::new();
                    for call in calls {
                        let output = tools::dispatch(&self.state, &call.name, &call.input).await;
                        results.push(json!({
                            "type": "tool_result",
                            "tool_use_id": call.id,
                            "content": output.to_string(),
                        }));
                    }
                    messages.push(json!({"role": "user", "content": results}));
                }
                ChatTurn::EndTurn(text) => {
                    let report = agentflow_core::analyzer::parse_report(&text)?;
                    return Ok(AnalyzerOutcome {
                        report,
                        usage,
                        model,
                    });
                }
            }
        }
        Err(Error::Analyzer("tool loop limit reached".to_string()))
    }
}

struct AnalyzerOutcome {
    report: AnalyzerReport,
    usage: ChatUsage,
    model: Option<String>,
}

impl AnalyzerOutcome {
    fn usage_json(&self) -> Option<Value> {
        if self.usage.input_tokens == 0 && self.usage.output_tokens == 0 {
            return None;
        }
        Some(json!({
            "inputTokens": self.usage.input_tokens,
            "outputTokens": self.usage.output_tokens,
        }))
    }
}

/// Render the analyzer report as the insight's markdown body.
fn render_content(report: &AnalyzerReport) -> String {
    let mut content = report.summary.clone();
    if let Some(intent) = &report.user_intent {
        content.push_str(&format!("\n\n## Intent\n{}", intent));
    }
    if !report.frustration_points.is_empty() {
        content.push_str("\n\n## Frustration points\n");
        for point in &report.frustration_points {
            content.push_str(&format!("- {}\n", point));
        }
    }
    if !report.improvements.is_empty() {
        content.push_str("\n\n## Improvements\n");
        for improvement in &report.improvements {
            content.push_str(&format!("- {}\n", improvement));
        }
    }
    content
}

fn categories_of(report: &AnalyzerReport) -> Vec<String> {
    let mut categories: Vec<String> = report
        .follow_up_actions
        .iter()
        .map(|a| {
            serde_json::to_value(a.category)
                .ok()
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .unwrap_or_else(|| "other".to_string())
        })
        .collect();
    categories.sort();
    categories.dedup();
    categories
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::analyzer::{parse_response, ChatClient, ChatResponse, QuestionChannel, ToolSpec};
    use agentflow_core::auth::AuthService;
    use agentflow_core::bus::EventBus;
    use agentflow_core::normalize::normalize;
    use agentflow_core::{Config, Database, EventSource};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct FakeChatClient {
        responses: StdMutex<VecDeque<Value>>,
    }

    impl FakeChatClient {
        fn new(responses: Vec<Value>) -> Arc<Self> {
            Arc::new(Self {
                responses: StdMutex::new(responses.into()),
            })
        }
    }

    #[async_trait]
    impl ChatClient for FakeChatClient {
        async fn complete(
            &self,
            _system: &str,
            _messages: &[Value],
            _tools: &[ToolSpec],
        ) -> Result<ChatResponse> {
            let body = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::Analyzer("script exhausted".to_string()))?;
            Ok(parse_response(body))
        }
    }

    struct RecordingChannel {
        posted: StdMutex<Vec<InsightQuestion>>,
    }

    #[async_trait]
    impl QuestionChannel for RecordingChannel {
        async fn post_question(&self, question: &InsightQuestion) -> Result<()> {
            self.posted.lock().unwrap().push(question.clone());
            Ok(())
        }
    }

    fn end_turn(report: Value) -> Value {
        json!({
            "stop_reason": "end_turn",
            "model": "test-model",
            "usage": {"input_tokens": 100, "output_tokens": 50},
            "content": [{"type": "text", "text": report.to_string()}]
        })
    }

    fn seed_activity(state: &AppState, user_id: &str, events: usize) {
        for i in 0..events {
            let event = normalize(
                &EventSource::ClaudeCode,
                "s1",
                &json!({"hook_event_name": "UserPromptSubmit", "message": format!("prompt {i}")}),
            );
            state.db.append(&event).unwrap();
        }
        state.db.set_session_user("s1", user_id).unwrap();
    }

    fn test_state(chat: Arc<dyn ChatClient>) -> AppState {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.migrate().unwrap();
        let config = Arc::new(Config {
            auth_secret: Some("test-secret".into()),
            ..Config::default()
        });
        let auth = Arc::new(AuthService::new(db.clone(), &config).unwrap());
        AppState::new(db, EventBus::new(), auth, config).with_chat(chat)
    }

    #[tokio::test]
    async fn test_analysis_without_questions_has_no_phase() {
        let chat = FakeChatClient::new(vec![end_turn(json!({
            "summary": "steady progress",
            "improvements": ["fewer retries"],
            "followUpActions": [
                {"description": "pin the toolchain", "priority": "medium", "category": "tooling"}
            ]
        }))]);
        let state = test_state(chat);
        seed_activity(&state, "u1", 6);

        let scheduler = InsightScheduler::new(state.clone());
        let insight = scheduler.analyze_user("u1", 0).await.unwrap();

        assert!(insight.phase.is_none());
        assert!(insight.content.starts_with("steady progress"));
        assert_eq!(insight.categories, vec!["tooling"]);
        assert_eq!(insight.events_analyzed, 6);
        assert_eq!(insight.usage.as_ref().unwrap()["inputTokens"], 100);

        // The cursor advanced past the analyzed events
        let analysis_state = state.db.analysis_state("u1").unwrap();
        assert!(analysis_state.last_event_timestamp.is_some());
    }

    #[tokio::test]
    async fn test_questions_without_channel_finalize() {
        let chat = FakeChatClient::new(vec![end_turn(json!({
            "summary": "unclear",
            "questions": ["which repo?"]
        }))]);
        let state = test_state(chat);
        seed_activity(&state, "u1", 6);

        let scheduler = InsightScheduler::new(state.clone());
        let insight = scheduler.analyze_user("u1", 0).await.unwrap();
        assert_eq!(insight.phase, Some(InsightPhase::FinalNoAnswers));
        // No channel, so nothing was recorded to answer
        assert!(state.db.questions_for_insight(&insight.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_preliminary_then_refined() {
        let chat = FakeChatClient::new(vec![
            end_turn(json!({"summary": "first pass", "questions": ["which repo?", "was CI green?"]})),
            end_turn(json!({"summary": "refined pass"})),
        ]);
        let channel = Arc::new(RecordingChannel {
            posted: StdMutex::new(vec![]),
        });
        let state = test_state(chat).with_questions(channel.clone());
        seed_activity(&state, "u1", 6);

        let scheduler = InsightScheduler::new(state.clone());
        let insight = scheduler.analyze_user("u1", 0).await.unwrap();
        assert_eq!(insight.phase, Some(InsightPhase::Preliminary));

        let posted = channel.posted.lock().unwrap().clone();
        assert_eq!(posted.len(), 2);
        drop(posted);

        // First answer alone does not refine
        let questions = state.db.questions_for_insight(&insight.id).unwrap();
        scheduler
            .handle_answer(&questions[0].id, "the billing repo")
            .await
            .unwrap();
        let mid = state.db.get_insight(&insight.id).unwrap().unwrap();
        assert_eq!(mid.phase, Some(InsightPhase::Preliminary));
        assert_eq!(mid.round, 1);

        // Second answer completes the round
        scheduler
            .handle_answer(&questions[1].id, "yes, green")
            .await
            .unwrap();
        let refined = state.db.get_insight(&insight.id).unwrap().unwrap();
        assert_eq!(refined.phase, Some(InsightPhase::Refined));
        assert_eq!(refined.round, 2);
        assert_eq!(refined.answers_received, 2);
        assert!(refined.content.starts_with("refined pass"));
    }

    #[tokio::test]
    async fn test_round_cap_forces_refined() {
        // Every refinement keeps asking; round 3 must still settle
        let chat = FakeChatClient::new(vec![
            end_turn(json!({"summary": "r1", "questions": ["q1?"]})),
            end_turn(json!({"summary": "r2", "questions": ["q2?"]})),
            end_turn(json!({"summary": "r3", "questions": ["q3?"]})),
        ]);
        let channel = Arc::new(RecordingChannel {
            posted: StdMutex::new(vec![]),
        });
        let state = test_state(chat).with_questions(channel);
        seed_activity(&state, "u1", 6);

        let scheduler = InsightScheduler::new(state.clone());
        let insight = scheduler.analyze_user("u1", 0).await.unwrap();

        // Round 1 -> 2: still preliminary (new question posted)
        let questions = state.db.questions_for_insight(&insight.id).unwrap();
        scheduler.handle_answer(&questions[0].id, "a1").await.unwrap();
        let after = state.db.get_insight(&insight.id).unwrap().unwrap();
        assert_eq!(after.phase, Some(InsightPhase::Preliminary));
        assert_eq!(after.round, 2);

        // Round 2 -> 3: cap reached, refined despite open questions
        let questions = state.db.questions_for_insight(&insight.id).unwrap();
        let open: Vec<_> = questions.iter().filter(|q| q.answer.is_none()).collect();
        scheduler.handle_answer(&open[0].id, "a2").await.unwrap();
        let last = state.db.get_insight(&insight.id).unwrap().unwrap();
        assert_eq!(last.phase, Some(InsightPhase::Refined));
        assert_eq!(last.round, 3);
    }

    #[tokio::test]
    async fn test_run_once_skips_below_threshold() {
        let chat = FakeChatClient::new(vec![]);
        let state = test_state(chat);
        seed_activity(&state, "u1", 2);

        let mut global = state.bus.subscribe(GLOBAL_TOPIC).await;
        let scheduler = InsightScheduler::new(state.clone());
        scheduler.run_once().await;

        // Nothing analyzed: no insight rows, no broadcasts
        assert!(state.db.list_insights("u1").unwrap().is_empty());
        assert!(tokio::time::timeout(Duration::from_millis(50), global.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_failed_run_broadcasts_insight_error() {
        // Script exhausted -> analyzer failure
        let chat = FakeChatClient::new(vec![]);
        let state = test_state(chat);
        seed_activity(&state, "u1", 6);

        let mut global = state.bus.subscribe(GLOBAL_TOPIC).await;
        let scheduler = InsightScheduler::new(state.clone());
        scheduler.run_once().await;

        let msg = global.recv().await.unwrap();
        assert_eq!(msg.name, "insight:error");
        assert_eq!(msg.data["userId"], "u1");
    }
}
