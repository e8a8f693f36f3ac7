//! Daemon wiring: build every subsystem, run until a shutdown signal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::{
    AgentCallOptions, AgentGateway, AgentSource, SandboxCell, SandboxCli, SandboxTool,
    SessionStore, SessionTarget,
};
use crate::channels::formatting::strip_think_tags;
use crate::channels::{DiscordApi, DiscordHandler};
use crate::config::{self, BotConfig, SessionMode, Settings};
use crate::connection::ConnectionSupervisor;
use crate::events::{
    EventInput, EventStore, EventType, FileDescriptor, Lane, OutboundPayload, OutboundSource,
};
use crate::handlers::HandlerContext;
use crate::scheduler;
use crate::worker::EventWorker;

/// Reconcile sweeps run on this cadence (and once at startup).
const RECONCILE_INTERVAL: Duration = Duration::from_secs(15);

/// Settled DM rows and terminal events are kept this long.
const RETENTION_DAYS: i64 = 7;

const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Run the full pipeline until SIGINT/SIGTERM.
pub async fn run_daemon(
    config: BotConfig,
    settings: Settings,
    settings_path: PathBuf,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(config::data_dir()).await?;

    let db_path = config::event_bus_path();
    let store = Arc::new(EventStore::open(&db_path.to_string_lossy()).await?);
    let cancel = CancellationToken::new();

    // Connection supervisor + gateway event handler.
    let supervisor = ConnectionSupervisor::new(
        &config.discord_token,
        Duration::from_secs(settings.discord_connection_heartbeat_interval_seconds),
        Duration::from_secs(settings.discord_connection_reconnect_grace_seconds),
        cancel.clone(),
    );
    let handler = DiscordHandler::new(
        Arc::clone(&supervisor),
        Arc::clone(&store),
        config.allowed_user_ids.clone(),
    );
    supervisor.spawn(handler);

    // Agent gateway with its process-wide FIFO.
    let sessions = SessionStore::new(config::data_dir());
    let agent = build_agent_gateway(sessions.clone())?;

    let ctx = Arc::new(HandlerContext {
        store: Arc::clone(&store),
        api: DiscordApi::new(Arc::clone(&supervisor)),
        agent,
        sessions,
        config: Arc::new(config),
        settings: Arc::new(settings),
        settings_path,
    });

    scheduler::spawn_schedules(Arc::clone(&store), &ctx.settings.schedules, cancel.clone());
    spawn_reconcile_timer(Arc::clone(&store), cancel.clone());
    spawn_retention_sweep(Arc::clone(&store), cancel.clone());

    let worker = EventWorker::new(
        Arc::clone(&store),
        Arc::clone(&supervisor),
        Arc::clone(&ctx),
        cancel.clone(),
    );
    let worker_handle = tokio::spawn(worker.run());

    info!("cc-discord-bot v{} running", env!("CARGO_PKG_VERSION"));
    wait_for_shutdown().await;
    info!("Shutdown signal received");

    cancel.cancel();
    if tokio::time::timeout(Duration::from_secs(10), worker_handle)
        .await
        .is_err()
    {
        warn!("Worker did not stop in time");
    }
    Ok(())
}

fn build_agent_gateway(sessions: SessionStore) -> anyhow::Result<Arc<AgentGateway>> {
    let cell = Arc::new(SandboxCell::new(config::sandbox_id_path()));
    let cli: Arc<dyn SandboxCli> = Arc::new(SandboxTool);
    let workspace = std::env::current_dir()?;
    Ok(AgentGateway::spawn(cli, cell, sessions, workspace))
}

/// Periodic reconcile trigger. The first sweep runs immediately so repairs
/// from the previous run don't wait out the interval.
fn spawn_reconcile_timer(store: Arc<EventStore>, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            let input = EventInput::new(
                EventType::DmReconcileRun,
                Lane::System,
                0,
                serde_json::json!({}),
            );
            if let Err(e) = store.publish(input).await {
                error!("Failed to publish reconcile event: {}", e);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RECONCILE_INTERVAL) => {}
            }
        }
    });
}

fn spawn_retention_sweep(store: Arc<EventStore>, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RETENTION_INTERVAL) => {}
            }
            if let Err(e) = store.prune_settled(RETENTION_DAYS).await {
                error!("Retention sweep failed: {}", e);
            }
        }
    });
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// `send` subcommand: enqueue a one-off outbound DM and exit. The running
/// daemon picks it up from the shared bus.
pub async fn run_send(
    user_id: u64,
    files: Vec<PathBuf>,
    message: Vec<String>,
) -> anyhow::Result<()> {
    let text = message.join(" ");
    if text.trim().is_empty() && files.is_empty() {
        anyhow::bail!("nothing to send: provide a message, --file, or both");
    }

    let mut descriptors = Vec::new();
    for file in files {
        if !file.exists() {
            anyhow::bail!("file not found: {}", file.display());
        }
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        let path = file.canonicalize()?;
        descriptors.push(FileDescriptor {
            path: path.display().to_string(),
            name,
        });
    }

    tokio::fs::create_dir_all(config::data_dir()).await?;
    let db_path = config::event_bus_path();
    let store = EventStore::open(&db_path.to_string_lossy()).await?;

    let payload = OutboundPayload {
        request_id: uuid::Uuid::new_v4().to_string(),
        source: OutboundSource::ManualSend,
        text,
        user_id: Some(user_id.to_string()),
        channel_id: None,
        files: descriptors,
        context: Some("manual send".to_string()),
    };
    let event_id = store
        .publish(EventInput::new(
            EventType::OutboundDmRequest,
            Lane::Interactive,
            0,
            serde_json::to_value(&payload)?,
        ))
        .await?;

    println!("Enqueued outbound event {}", event_id);
    Ok(())
}

/// `schedule` subcommand: run one named schedule immediately and print the
/// agent's output. Skip markers and notification flags are ignored here;
/// this is the operator's dry-run path.
pub async fn run_schedule_once(name: &str) -> anyhow::Result<()> {
    let settings_path = config::settings_path();
    let settings = Settings::load(&settings_path)?;
    let Some(schedule) = settings.schedule(name) else {
        anyhow::bail!("no schedule named '{}' in {}", name, settings_path.display());
    };

    let prompt_text = match &schedule.prompt_file {
        Some(file) => tokio::fs::read_to_string(file).await?,
        None => schedule.prompt.clone(),
    };

    let session = match schedule.session_mode {
        SessionMode::Main => SessionTarget::Main,
        SessionMode::Isolated => SessionTarget::Isolated(schedule.name.clone()),
    };

    tokio::fs::create_dir_all(config::data_dir()).await?;
    let sessions = SessionStore::new(config::data_dir());
    let agent = build_agent_gateway(sessions)?;

    let reply = agent
        .send_to_agent(
            &prompt_text,
            &settings,
            AgentCallOptions::new(AgentSource::Scheduler, session),
        )
        .await?;
    println!("{}", strip_think_tags(&reply.response));
    Ok(())
}
