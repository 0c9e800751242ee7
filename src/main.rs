use anyhow::{bail, Context, Result};
use chatguard::ai::{ConversationHistory, HttpChatClient};
use chatguard::bot::{MessageRouter, RouterOptions};
use chatguard::bridge::BridgeConnector;
use chatguard::config::{Settings, StoreBackend, SHUTDOWN_GRACE_SECS};
use chatguard::health::HealthReport;
use chatguard::identity::SenderId;
use chatguard::moderation::{ModerationConfig, ModerationDispatcher, ModerationStore};
use chatguard::session::{SessionConfig, SessionContinuityManager, SessionId, SessionRegistry, SessionStatus, SyncClock};
use chatguard::storage::{DocumentStore, MemoryDocumentStore, R2DocumentStore};
use chatguard::supervisor::{ConnectionState, ConnectionSupervisor, SupervisorOptions};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use regex::Regex;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "chatguard")]
#[command(about = "Group moderation with durable session continuity", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and moderate until interrupted (default).
    Run,
    /// Inspect and maintain stored sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Print a health report as JSON; exits non-zero when unhealthy.
    Health,
}

#[derive(Subcommand)]
enum SessionAction {
    /// List sessions, most recently active first.
    List,
    /// Delete sessions idle for longer than `days`.
    Cleanup {
        #[arg(short, long)]
        days: Option<i64>,
    },
    /// Delete a session and its stored credentials.
    Delete { id: String },
    /// Write a session's stored credentials into a directory.
    Restore {
        id: String,
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Copy a credential directory into a session's storage.
    Backup {
        id: String,
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
}

/// Regex patterns for redacting sensitive data
struct RedactionPatterns {
    r2_1: Regex,
    r2_2: Regex,
    r2_3: Regex,
    r2_4: Regex,
    ai_key: Regex,
    bearer: Regex,
}

impl RedactionPatterns {
    /// Initialize all regex patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            r2_1: Regex::new(r"R2_ACCESS_KEY_ID=[^\s&]+")?,
            r2_2: Regex::new(r"R2_SECRET_ACCESS_KEY=[^\s&]+")?,
            r2_3: Regex::new(r"'aws_access_key_id': '[^']*'")?,
            r2_4: Regex::new(r"'aws_secret_access_key': '[^']*'")?,
            ai_key: Regex::new(r"AI_API_KEY=[^\s&]+")?,
            bearer: Regex::new(r"(?i)(bearer\s+)[A-Za-z0-9._~+/=-]+")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        output = self
            .r2_1
            .replace_all(&output, "R2_ACCESS_KEY_ID=[MASKED]")
            .to_string();
        output = self
            .r2_2
            .replace_all(&output, "R2_SECRET_ACCESS_KEY=[MASKED]")
            .to_string();
        output = self
            .r2_3
            .replace_all(&output, "'aws_access_key_id': '[MASKED]'")
            .to_string();
        output = self
            .r2_4
            .replace_all(&output, "'aws_secret_access_key': '[MASKED]'")
            .to_string();
        output = self
            .ai_key
            .replace_all(&output, "AI_API_KEY=[MASKED]")
            .to_string();
        output = self.bearer.replace_all(&output, "${1}[MASKED]").to_string();
        output
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> RedactingWriter<W> {
    const fn new(inner: W, patterns: Arc<RedactionPatterns>) -> Self {
        Self { inner, patterns }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // Report the original length even when redaction changed it
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<F> RedactingMakeWriter<F> {
    const fn new(make_inner: F, patterns: Arc<RedactionPatterns>) -> Self {
        Self {
            make_inner,
            patterns,
        }
    }
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new((self.make_inner)(), self.patterns.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile regex patterns: {e}");
        e
    })?);
    init_logging(patterns);

    let cli = Cli::parse();
    let settings = Settings::new().context("Failed to load configuration")?;
    let store = init_storage(&settings).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(settings, store).await,
        Commands::Sessions { action } => sessions(action, &settings, store).await,
        Commands::Health => health(store).await,
    }
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter::new(io::stderr, patterns);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

async fn init_storage(settings: &Settings) -> Result<Arc<dyn DocumentStore>> {
    match settings.store_backend() {
        StoreBackend::Memory => {
            warn!("Using in-memory store: sessions will not survive a restart");
            Ok(Arc::new(MemoryDocumentStore::new()))
        }
        StoreBackend::R2 => {
            let store = R2DocumentStore::new(settings)
                .await
                .context("Failed to initialize R2 storage")?;
            info!("R2 Storage initialized.");
            if let Err(e) = store.check_connection().await {
                error!("R2 Storage connection check returned error: {e}");
            }
            Ok(Arc::new(store))
        }
    }
}

async fn run(settings: Settings, store: Arc<dyn DocumentStore>) -> Result<()> {
    info!("Starting chatguard...");

    let Some(connector) = settings
        .bridge_command
        .as_deref()
        .and_then(BridgeConnector::from_command_line)
    else {
        bail!("BRIDGE_COMMAND is not set; nothing to connect with");
    };

    let moderation_config = ModerationConfig::from_env();
    let moderation_store = Arc::new(ModerationStore::new(&moderation_config));
    let dispatcher = Arc::new(ModerationDispatcher::new(moderation_config, moderation_store));

    let responder = Arc::new(HttpChatClient::new(
        settings.ai_endpoint_url.clone(),
        settings.ai_api_key.clone(),
    ));
    if settings.ai_endpoint_url.is_none() {
        info!("AI endpoint not configured, chat replies use stock phrases");
    }

    let phone = settings.owner_phone_digits();
    let owner = phone
        .as_deref()
        .and_then(|p| SenderId::from_address(p).ok());
    let router = Arc::new(MessageRouter::new(
        dispatcher,
        responder,
        ConversationHistory::new(Arc::clone(&store)),
        RouterOptions {
            owner,
            reply_all_groups: settings.ai_reply_all_groups,
            ai_enabled: settings.ai_endpoint_url.is_some(),
        },
    ));

    let supervisor = ConnectionSupervisor::new(
        Arc::new(connector),
        SessionRegistry::new(store),
        router.clone(),
        SupervisorOptions {
            session: SessionConfig::from_env(),
            auth_root: settings.auth_root(),
            phone,
            restart_after_logout: settings.restart_after_logout,
        },
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
            return;
        }
        info!("🛑 Shutdown requested");
        on_signal.cancel();
    });

    supervisor.run(cancel).await?;
    if tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), router.wait_idle()).await.is_err() {
        warn!("Background replies still running at shutdown");
    }
    info!("Stopped.");
    Ok(())
}

async fn sessions(action: SessionAction, settings: &Settings, store: Arc<dyn DocumentStore>) -> Result<()> {
    let config = SessionConfig::from_env();
    let registry = SessionRegistry::new(store);
    let clock = SyncClock::new(Utc::now());

    match action {
        SessionAction::List => {
            for record in registry.list().await? {
                println!(
                    "{}\t{}\t{}\tlast_active={}\tlast_sync={}",
                    record.session_id,
                    record.status,
                    record.phone_number.as_deref().unwrap_or("-"),
                    record.last_active.to_rfc3339(),
                    record
                        .last_sync
                        .map_or_else(|| "-".to_string(), |t| t.to_rfc3339()),
                );
            }
        }
        SessionAction::Cleanup { days } => {
            let days = days.unwrap_or(config.cleanup_max_age_days);
            let removed = registry.cleanup_old(days, Utc::now()).await?;
            println!("Removed {removed} session(s) idle for more than {days} day(s)");
        }
        SessionAction::Delete { id } => {
            let manager =
                SessionContinuityManager::attach(registry, clock, &config, SessionId::new(id))
                    .await?;
            manager.delete().await?;
            println!("Deleted session {}", manager.id());
        }
        SessionAction::Restore { id, dir } => {
            let id = SessionId::new(id);
            let dir = dir.unwrap_or_else(|| id.credential_dir(&settings.auth_root()));
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let manager = SessionContinuityManager::attach(registry, clock, &config, id).await?;
            if manager.load_from_durable_store(&dir).await? {
                println!("Restored session {} into {}", manager.id(), dir.display());
            } else {
                bail!("Session {} has no stored credentials", manager.id());
            }
        }
        SessionAction::Backup { id, dir } => {
            let id = SessionId::new(id);
            let dir = dir.unwrap_or_else(|| id.credential_dir(&settings.auth_root()));
            let manager = SessionContinuityManager::attach(registry, clock, &config, id).await?;
            let summary = manager.sync_to_durable_store(&dir).await?;
            println!(
                "Backed up {} file(s) from {} ({} skipped)",
                summary.synced,
                dir.display(),
                summary.skipped
            );
        }
    }
    Ok(())
}

async fn health(store: Arc<dyn DocumentStore>) -> Result<()> {
    let registry = SessionRegistry::new(Arc::clone(&store));
    let latest = registry.list().await?.into_iter().next();

    let clock = SyncClock::new(Utc::now());
    let mut state = ConnectionState::Disconnected;
    if let Some(record) = &latest {
        if let Some(at) = record.last_sync {
            clock.mark(at);
        }
        if record.status == SessionStatus::Active {
            state = ConnectionState::Active;
        }
    }

    let report = HealthReport::collect(
        state,
        store.as_ref(),
        &clock,
        latest.as_ref().map(|r| &r.session_id),
    )
    .await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_healthy() {
        std::process::exit(1);
    }
    Ok(())
}
