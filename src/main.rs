use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};

use mailsync::config::{ContentSettings, ImapSettings, ServerSettings, SyncSettings};
use mailsync::models::EmailStatus;

#[derive(Parser)]
#[command(name = "mailsync", version, about = "Mailbox synchronization and status reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the REST API
    Serve(ServeArgs),
    /// Run one sync in the foreground and wait for it
    Sync(SyncArgs),
    /// Show the best-effort sync status
    Status(ServiceArgs),
    /// Drop the sync lock, state and counters
    ClearStatus(ServiceArgs),
    /// Inspect or clear the local queue of pending status edits
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
        #[command(flatten)]
        store: LocalStoreArgs,
    },
    /// List emails from a running server with pending edits applied
    Emails(ClientArgs),
    /// Change the status of one email through a running server
    SetStatus(SetStatusArgs),
    /// Start a sync on a running server and follow its progress
    Watch(WatchArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[command(flatten)]
    server: ServerSettings,
    #[command(flatten)]
    sync: SyncSettings,
    #[command(flatten)]
    imap: ImapSettings,
    #[command(flatten)]
    content: ContentSettings,
}

#[derive(Args)]
struct ServiceArgs {
    #[arg(long, env = "REDIS_URL", hide_env_values = true)]
    redis_url: Option<String>,
    #[command(flatten)]
    sync: SyncSettings,
    #[command(flatten)]
    imap: ImapSettings,
    #[command(flatten)]
    content: ContentSettings,
}

#[derive(Args)]
struct SyncArgs {
    /// Also refresh content of records the store already has
    #[arg(long, default_value_t = false)]
    force: bool,
    /// Walk the whole mailbox instead of the most recent messages
    #[arg(long, default_value_t = false)]
    all: bool,
    #[command(flatten)]
    service: ServiceArgs,
}

#[derive(Debug, Args)]
struct LocalStoreArgs {
    /// Client database path (default ~/.mailsync/client.db)
    #[arg(long, env = "MAILSYNC_CLIENT_DB")]
    db: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum QueueCommands {
    /// List pending edits
    Show,
    /// Discard all pending edits
    Clear,
}

#[derive(Debug, Args)]
struct ClientArgs {
    #[arg(long, env = "MAILSYNC_API_URL", default_value = "http://127.0.0.1:3000")]
    api_url: String,
    #[command(flatten)]
    store: LocalStoreArgs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PartyArg {
    Client,
    Admin,
}

#[derive(Debug, Args)]
struct SetStatusArgs {
    email_id: String,
    /// needsAttention, informative or responded
    status: EmailStatus,
    /// Who answered last
    #[arg(long, value_enum)]
    by: Option<PartyArg>,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Debug, Args)]
struct WatchArgs {
    #[arg(long, default_value_t = false)]
    force: bool,
    #[arg(long, default_value_t = false)]
    all: bool,
    #[arg(long, env = "MAILSYNC_API_URL", default_value = "http://127.0.0.1:3000")]
    api_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.command {
        Commands::Serve(_) | Commands::Sync(_) => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    commands::dispatch(cli).await
}

mod commands {
    use std::sync::Arc;

    use anyhow::{anyhow, bail, Context, Result};

    use mailsync::api::{self, AppState};
    use mailsync::app::Backends;
    use mailsync::client::poller::DEFAULT_POLL_INTERVAL;
    use mailsync::client::{
        CommitOutcome, EmailApiClient, EmailSession, PersistedQueue, PollEnd, SqliteStorage,
        StatusFeed, StatusPoller,
    };
    use mailsync::models::{now_ms, ResponseParty};
    use mailsync::output::{self, OutputFormat};
    use mailsync::sync::{StatusSource, SyncOrchestrator, SyncStatusService, SyncStatusView};

    use super::{
        Cli, ClientArgs, Commands, LocalStoreArgs, PartyArg, QueueCommands, ServeArgs,
        ServiceArgs, SetStatusArgs, SyncArgs, WatchArgs,
    };

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let format = OutputFormat::from_json_flag(cli.json);
        match cli.command {
            Commands::Serve(args) => handle_serve(args).await,
            Commands::Sync(args) => handle_sync(args, format).await,
            Commands::Status(args) => handle_status(args, format).await,
            Commands::ClearStatus(args) => handle_clear_status(args).await,
            Commands::Queue { command, store } => handle_queue(command, store, format),
            Commands::Emails(args) => handle_emails(args, format).await,
            Commands::SetStatus(args) => handle_set_status(args).await,
            Commands::Watch(args) => handle_watch(args, format).await,
        }
    }

    async fn orchestrator(args: ServiceArgs) -> Result<SyncOrchestrator> {
        let backends =
            Backends::from_settings(args.redis_url.as_deref(), &args.imap, &args.content).await?;
        Ok(backends.orchestrator(args.sync))
    }

    async fn handle_serve(args: ServeArgs) -> Result<()> {
        let backends = Backends::from_settings(
            args.server.redis_url.as_deref(),
            &args.imap,
            &args.content,
        )
        .await?;
        let orchestrator = backends.orchestrator(args.sync);
        if args.server.cron_secret.is_none() {
            tracing::warn!("CRON_SECRET not set: /sync-emails rejects every request");
        }
        let state = AppState::new(
            orchestrator,
            args.server.cron_secret.clone(),
            args.server.cron_budget(),
        );

        let listener = tokio::net::TcpListener::bind(&args.server.bind)
            .await
            .with_context(|| format!("bind REST API to {}", args.server.bind))?;
        tracing::info!("listening on {}", args.server.bind);
        axum::serve(listener, api::router(state))
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .context("serve REST API")
    }

    async fn handle_sync(args: SyncArgs, format: OutputFormat) -> Result<()> {
        let orchestrator = orchestrator(args.service).await?;
        let start = orchestrator
            .start_sync(args.force, args.all)
            .await
            .context("acquire sync lock")?;
        let Some(task) = start.task else {
            bail!(
                "sync not started: {}",
                start.reason.as_deref().unwrap_or("lock unavailable")
            );
        };

        let state = task.await.context("wait for sync run")?;
        let view = SyncStatusView::new(state, StatusSource::Memory, now_ms());
        println!("{}", output::format_status(format, &view)?);
        if view.state.error_count > 0 {
            bail!("sync finished with {} errors", view.state.error_count);
        }
        Ok(())
    }

    async fn handle_status(args: ServiceArgs, format: OutputFormat) -> Result<()> {
        let orchestrator = orchestrator(args).await?;
        let view = SyncStatusService::new(orchestrator).get_status().await;
        println!("{}", output::format_status(format, &view)?);
        Ok(())
    }

    async fn handle_clear_status(args: ServiceArgs) -> Result<()> {
        let orchestrator = orchestrator(args).await?;
        orchestrator
            .clear_status()
            .await
            .context("clear sync status")?;
        println!("Sync status cleared.");
        Ok(())
    }

    fn open_storage(store: &LocalStoreArgs) -> Result<SqliteStorage> {
        let path = match &store.db {
            Some(path) => path.clone(),
            None => SqliteStorage::default_path().context("resolve default client database path")?,
        };
        SqliteStorage::open(&path)
            .with_context(|| format!("open client database at {}", path.display()))
    }

    fn handle_queue(command: QueueCommands, store: LocalStoreArgs, format: OutputFormat) -> Result<()> {
        let mut queue = PersistedQueue::load(open_storage(&store)?).context("load pending edits")?;
        match command {
            QueueCommands::Show => {
                println!("{}", output::format_queue(format, queue.items())?);
            }
            QueueCommands::Clear => {
                let count = queue.len();
                queue.clear().context("clear pending edits")?;
                println!("Discarded {count} pending edits.");
            }
        }
        Ok(())
    }

    fn session(args: &ClientArgs) -> Result<EmailSession<SqliteStorage>> {
        let client = EmailApiClient::new(&args.api_url)?;
        EmailSession::open(Arc::new(client), open_storage(&args.store)?)
            .context("open client session")
    }

    async fn handle_emails(args: ClientArgs, format: OutputFormat) -> Result<()> {
        let mut session = session(&args)?;
        let report = session
            .refresh()
            .await
            .with_context(|| format!("fetch emails from {}", args.api_url))?
            .ok_or_else(|| anyhow!("email list fetch was throttled"))?;
        if !report.dropped.is_empty() {
            eprintln!(
                "dropped {} pending edits for emails the server no longer has",
                report.dropped.len()
            );
        }
        println!("{}", output::format_emails(format, session.emails())?);
        Ok(())
    }

    async fn handle_set_status(args: SetStatusArgs) -> Result<()> {
        let mut session = session(&args.client)?;
        // Load the current list first so a rollback knows what to restore.
        session
            .refresh()
            .await
            .with_context(|| format!("fetch emails from {}", args.client.api_url))?;

        let party = args.by.map(|party| match party {
            PartyArg::Client => ResponseParty::Client,
            PartyArg::Admin => ResponseParty::Admin,
        });
        let outcome = session
            .set_status(&args.email_id, args.status, party)
            .await
            .context("record status edit")?;

        match outcome {
            CommitOutcome::Confirmed | CommitOutcome::Ignored => {
                println!("{} is now {}", args.email_id, args.status);
                Ok(())
            }
            CommitOutcome::Superseded => {
                println!("{} has a newer pending edit", args.email_id);
                Ok(())
            }
            CommitOutcome::RolledBack { restored } => {
                for notice in session.take_notices() {
                    eprintln!("{}", notice.message);
                }
                let restored = restored.map_or_else(|| "unknown".to_string(), |status| status.to_string());
                bail!("status of {} not saved, kept {restored}", args.email_id)
            }
        }
    }

    async fn handle_watch(args: WatchArgs, format: OutputFormat) -> Result<()> {
        let client = Arc::new(EmailApiClient::new(&args.api_url)?);
        let response = client
            .start_sync(args.force, args.all)
            .await
            .with_context(|| format!("start sync on {}", args.api_url))?;
        if !response.accepted {
            eprintln!(
                "sync not started ({}), following the current run",
                response.reason.as_deref().unwrap_or("rejected")
            );
        }

        let feed: Arc<dyn StatusFeed> = client;
        let poller = StatusPoller::spawn(feed, DEFAULT_POLL_INTERVAL);
        let mut updates = poller.subscribe();
        loop {
            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let latest = updates.borrow_and_update().clone();
                    if let Some(view) = latest {
                        eprintln!("{}/{} {}", view.state.progress, view.state.total, view.state.status);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    poller.stop();
                    break;
                }
            }
        }

        match poller.join().await {
            PollEnd::Settled(view) => {
                println!("{}", output::format_status(format, &view)?);
                Ok(())
            }
            PollEnd::Stopped => {
                println!("Stopped following the sync.");
                Ok(())
            }
        }
    }
}
