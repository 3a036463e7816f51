//! Shared server state

use agentflow_core::analyzer::{ChatClient, QuestionChannel};
use agentflow_core::auth::AuthService;
use agentflow_core::bus::EventBus;
use agentflow_core::sources::SourceRegistry;
use agentflow_core::{Config, Database};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Process-wide singletons handed to every handler and scheduler.
///
/// Constructed once at bootstrap (and per-test); everything inside is
/// cheaply cloneable or behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub bus: EventBus,
    pub auth: Arc<AuthService>,
    pub config: Arc<Config>,
    /// Tool-calling chat client; None disables analyzer-backed features
    pub chat: Option<Arc<dyn ChatClient>>,
    /// Question channel for insight follow-ups; None selects final-no-answers
    pub questions: Option<Arc<dyn QuestionChannel>>,
    /// Registered external-data listeners (empty unless plugins are wired in)
    pub sources: Arc<SourceRegistry>,
    /// Manual-trigger handle into the cron runner, when it is running
    pub cron_trigger: Option<mpsc::UnboundedSender<String>>,
}

impl AppState {
    pub fn new(
        db: Arc<Database>,
        bus: EventBus,
        auth: Arc<AuthService>,
        config: Arc<Config>,
    ) -> Self {
        let sources = Arc::new(SourceRegistry::new(bus.clone()));
        Self {
            db,
            bus,
            auth,
            config,
            chat: None,
            questions: None,
            sources,
            cron_trigger: None,
        }
    }

    pub fn with_chat(mut self, chat: Arc<dyn ChatClient>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn with_questions(mut self, questions: Arc<dyn QuestionChannel>) -> Self {
        self.questions = Some(questions);
        self
    }

    /// Swap in a registry that has plugins registered on it.
    pub fn with_sources(mut self, sources: Arc<SourceRegistry>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_cron_trigger(mut self, trigger: mpsc::UnboundedSender<String>) -> Self {
        self.cron_trigger = Some(trigger);
        self
    }
}
