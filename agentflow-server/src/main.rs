//! agent-flow server binary
//!
//! `agent-flow serve` runs the service; `create-user` / `create-key` cover
//! server-side identity bootstrap (public sign-up is disabled by policy).

use agentflow_core::analyzer::HttpChatClient;
use agentflow_core::auth::AuthService;
use agentflow_core::bus::EventBus;
use agentflow_core::{logging, Config, Database};
use agentflow_server::cron::CronRunner;
use agentflow_server::http::build_router;
use agentflow_server::insights::InsightScheduler;
use agentflow_server::state::AppState;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "agent-flow", version, about = "Real-time observability for AI-agent coding sessions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server (the default)
    Serve {
        /// Override the listen port (PORT)
        #[arg(long)]
        port: Option<u16>,
        /// Override the database path (AGENT_FLOW_DB)
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Create a user (server-side bootstrap)
    CreateUser {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Issue an API key for an existing user
    CreateKey {
        #[arg(long)]
        email: String,
        /// Display name for the key
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env().context("failed to load configuration")?;

    match cli.command.unwrap_or(Command::Serve {
        port: None,
        db: None,
    }) {
        Command::Serve { port, db } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(db) = db {
                config.database_path = db;
            }
            serve(config).await
        }
        Command::CreateUser {
            email,
            password,
            name,
        } => {
            let (_, auth) = open_store(&config)?;
            if !config.email_allowed(&email) {
                anyhow::bail!("email domain is not in ALLOWED_EMAIL_DOMAINS");
            }
            let user = auth.create_user(&email, name.as_deref(), &password)?;
            println!("created user {} ({})", user.email, user.id);
            Ok(())
        }
        Command::CreateKey { email, name } => {
            let (db, auth) = open_store(&config)?;
            let (user, _) = db
                .get_user_by_email(&email.trim().to_ascii_lowercase())?
                .with_context(|| format!("no user with email {}", email))?;
            let (_, raw) = auth.create_api_key(&user.id, name.as_deref())?;
            println!("{}", raw);
            Ok(())
        }
    }
}

fn open_store(config: &Config) -> anyhow::Result<(Arc<Database>, Arc<AuthService>)> {
    config.validate()?;
    let db = Arc::new(Database::open(&config.database_path)?);
    db.migrate()?;
    let auth = Arc::new(AuthService::new(db.clone(), config)?);
    Ok((db, auth))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let _logging_guard = logging::init(&config.logging)?;

    let (db, auth) = open_store(&config)?;
    if db.count_users()? == 0 {
        tracing::warn!(
            "no users exist; every request will be rejected until one is created \
             (agent-flow create-user --email ... --password ...)"
        );
    }

    let bus = EventBus::new();
    let config = Arc::new(config);
    let mut state = AppState::new(db, bus, auth, config.clone());

    if config.analyzer_ready() {
        let chat = HttpChatClient::new(&config.analyzer)?;
        state = state.with_chat(Arc::new(chat));
        tracing::info!(model = %config.analyzer.model, "analyzer enabled");
    } else {
        tracing::info!("no analyzer API key; insight and cron analysis disabled");
    }

    let (trigger_tx, trigger_rx) = tokio::sync::mpsc::unbounded_channel();
    let state = state.with_cron_trigger(trigger_tx);

    let cron_runner = CronRunner::new(state.clone());
    cron_runner.spawn(trigger_rx);

    let insight_scheduler = InsightScheduler::new(state.clone());
    insight_scheduler.spawn();

    // External-data listener plugins come in through `with_sources`; the
    // default registry is empty but still goes through the lifecycle
    let sources = state.sources.clone();
    sources.start_all().await;
    tracing::info!(listeners = sources.len(), "source listeners started");

    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(%addr, db = %config.database_path.display(), "agent-flow listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    sources.stop_all().await;
    Ok(())
}
