//! Cron runner: user-defined scheduled jobs
//!
//! Each enabled job is due when its stored `next_run_at` passes; the runner
//! ticks twice a minute and spawns due jobs. A run executes as a synthetic
//! session with `source=cron` flowing through the same store-then-bus path
//! as ingest, so the realtime gateway shows it like any other session.
//!
//! Overlap is guarded per job by an in-process `running` set; a manual
//! trigger bypasses the schedule but never the guard. The guard only holds
//! within this process - multi-process deployments would need an external
//! lease and are out of scope.

use crate::pipeline::record_event;
use crate::state::AppState;
use crate::tools;
use agentflow_core::analyzer::ChatTurn;
use agentflow_core::bus::{BusMessage, GLOBAL_TOPIC};
use agentflow_core::normalize::truncate_tool_output;
use agentflow_core::{
    now_ms, CronJob, CronRunStatus, Error, Event, EventCategory, EventSource, Result, Role,
};
use chrono::Utc;
use cron::Schedule;
use serde_json::json;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

const TICK_INTERVAL: Duration = Duration::from_secs(30);

const SYSTEM_PROMPT: &str = "You are a scheduled analysis job inside an AI-agent \
observability service. Use the provided tools to inspect the stored sessions and \
events, then answer the job's prompt concisely. Prefer a short markdown report.";

/// Executes user cron jobs as synthetic sessions.
pub struct CronRunner {
    state: AppState,
    running: Mutex<HashSet<String>>,
}

impl CronRunner {
    pub fn new(state: AppState) -> Arc<Self> {
        Arc::new(Self {
            state,
            running: Mutex::new(HashSet::new()),
        })
    }

    /// Start the schedule loop. `trigger_rx` carries manual trigger
    /// requests from the API.
    pub fn spawn(self: &Arc<Self>, mut trigger_rx: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move {
            runner.refresh_next_runs().await;
            let mut tick = tokio::time::interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => runner.run_due_jobs().await,
                    Some(job_id) = trigger_rx.recv() => runner.spawn_execute(job_id),
                }
            }
        })
    }

    /// Fill in `next_run_at` for enabled jobs that lost it (fresh rows,
    /// restarts).
    async fn refresh_next_runs(&self) {
        let jobs = match self.state.db.list_enabled_cron_jobs() {
            Ok(jobs) => jobs,
            Err(error) => {
                tracing::error!(%error, "failed to load cron jobs");
                return;
            }
        };
        for job in jobs {
            if job.next_run_at.is_some() {
                continue;
            }
            let next = next_run_ms(&job.cron_expression);
            if let Err(error) = self.state.db.set_cron_next_run(&job.id, next) {
                tracing::warn!(%error, job = %job.name, "failed to store next run");
            }
        }
    }

    async fn run_due_jobs(self: &Arc<Self>) {
        let jobs = match self.state.db.list_enabled_cron_jobs() {
            Ok(jobs) => jobs,
            Err(error) => {
                tracing::error!(%error, "failed to load cron jobs");
                return;
            }
        };
        let now = now_ms();
        for job in jobs {
            if job.next_run_at.is_some_and(|next| next <= now) {
                self.spawn_execute(job.id.clone());
            }
        }
    }

    fn spawn_execute(self: &Arc<Self>, job_id: String) {
        let runner = self.clone();
        tokio::spawn(async move {
            if let Err(error) = runner.execute(&job_id).await {
                tracing::error!(%error, job_id, "cron execution error");
            }
        });
    }

    /// Run one job now. Returns the run status, or None when the overlap
    /// guard skipped the run.
    pub async fn execute(&self, job_id: &str) -> Result<Option<CronRunStatus>> {
        let job = self
            .state
            .db
            .get_cron_job(job_id)?
            .ok_or_else(|| Error::Cron(format!("unknown job: {}", job_id)))?;

        {
            let mut running = self.running.lock().await;
            if !running.insert(job.id.clone()) {
                tracing::warn!(job = %job.name, "cron run still in flight, skipping");
                return Ok(None);
            }
        }

        let status = self.execute_locked(&job).await;
        self.running.lock().await.remove(&job.id);
        status.map(Some)
    }

    async fn execute_locked(&self, job: &CronJob) -> Result<CronRunStatus> {
        let started_at = now_ms();
        let session_id = format!("cron-{}-{}", job.id, started_at);
        tracing::info!(job = %job.name, session_id, "cron run starting");

        let status = match self.run_job(job, &session_id).await {
            Ok(()) => CronRunStatus::Success,
            Err(error) => {
                tracing::error!(%error, job = %job.name, "cron run failed");
                let mut event = cron_event(&session_id, EventCategory::Error, "error");
                event.error = Some(error.to_string());
                if let Err(error) = record_event(&self.state, &event).await {
                    tracing::error!(%error, "failed to record cron error event");
                }
                CronRunStatus::Failed
            }
        };

        let end = cron_event(&session_id, EventCategory::Session, "session.end");
        if let Err(error) = record_event(&self.state, &end).await {
            tracing::error!(%error, "failed to record cron session end");
        }

        self.state.db.record_cron_run(
            &job.id,
            started_at,
            &session_id,
            status,
            next_run_ms(&job.cron_expression),
        )?;
        self.state
            .bus
            .publish(
                GLOBAL_TOPIC,
                BusMessage::new(
                    "cron:run",
                    json!({
                        "jobId": job.id,
                        "sessionId": session_id,
                        "status": status.as_str(),
                    }),
                ),
            )
            .await;
        Ok(status)
    }

    async fn run_job(&self, job: &CronJob, session_id: &str) -> Result<()> {
        let mut start = cron_event(session_id, EventCategory::Session, "session.start");
        start.meta = Some(json!({
            "title": job.name,
            "cronJob": {"id": job.id, "name": job.name, "schedule": job.cron_expression},
        }));
        record_event(&self.state, &start).await?;

        let mut prompt = cron_event(session_id, EventCategory::Message, "message.user");
        prompt.role = Some(Role::User);
        prompt.text = Some(job.prompt.clone());
        record_event(&self.state, &prompt).await?;

        let chat = self
            .state
            .chat
            .clone()
            .ok_or_else(|| Error::Cron("no chat client configured".to_string()))?;
        let specs = tools::cron_tool_specs(job);
        let mut messages = vec![json!({"role": "user", "content": job.prompt})];

        for _ in 0..self.state.config.analyzer.max_tool_iterations {
            let response = chat.complete(SYSTEM_PROMPT, &messages, &specs).await?;
            match response.turn {
                ChatTurn::ToolCalls(calls) => {
                    messages.push(json!({"role": "assistant", "content": response.content}));
                    let mut results = Vec::new();
                    for call in calls {
                        let mut tool_start =
                            cron_event(session_id, EventCategory::Tool, "tool.start");
                        tool_start.tool_name = Some(call.name.clone());
                        tool_start.tool_input = Some(call.input.clone());
                        record_event(&self.state, &tool_start).await?;

                        let output = tools::dispatch(&self.state, &call.name, &call.input).await;

                        let mut tool_end = cron_event(session_id, EventCategory::Tool, "tool.end");
                        tool_end.tool_name = Some(call.name.clone());
                        tool_end.tool_output = Some(truncate_tool_output(&output));
                        record_event(&self.state, &tool_end).await?;

                        results.push(json!({
                            "type": "tool_result",
                            "tool_use_id": call.id,
                            "content": output.to_string(),
                        }));
                    }
                    messages.push(json!({"role": "user", "content": results}));
                }
                ChatTurn::EndTurn(text) => {
                    let mut reply =
                        cron_event(session_id, EventCategory::Message, "message.assistant");
                    reply.role = Some(Role::Assistant);
                    reply.text = Some(text);
                    record_event(&self.state, &reply).await?;
                    return Ok(());
                }
            }
        }
        Err(Error::Cron("tool loop limit reached".to_string()))
    }
}

fn cron_event(session_id: &str, category: EventCategory, event_type: &str) -> Event {
    Event {
        id: Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        timestamp: now_ms(),
        source: EventSource::Cron,
        category,
        event_type: event_type.to_string(),
        role: None,
        text: None,
        tool_name: None,
        tool_input: None,
        tool_output: None,
        error: None,
        meta: None,
    }
}

/// Next fire time of a cron expression, in epoch milliseconds.
pub fn next_run_ms(expression: &str) -> Option<i64> {
    Schedule::from_str(expression)
        .ok()?
        .upcoming(Utc)
        .next()
        .map(|dt| dt.timestamp_millis())
}
