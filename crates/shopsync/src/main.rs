//! shopsync - storefront sync core from the command line

mod cli;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shopsync_core::{
    identity_channel, Backend, CacheConfig, ChannelConfig, Credential, FetchConfig, FetchRequest,
    Fetcher, FileStorage, FlagStore, NotificationCenter, ResponseCache, RestBackend, StorageArea,
    SyncClient, SyncConfig, WsConnector,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "shopsync",
    version,
    about = "Storefront client-side sync core",
    long_about = "Drives the shopsync core against a live storefront backend: cached REST\n\
                  fetches, the push channel, and persisted notification flags.\n\
                  \n\
                  Examples:\n\
                    shopsync fetch /api/catalog/categories       # Fetch through the TTL cache\n\
                    shopsync fetch /api/products -p page=2       # With query parameters\n\
                    shopsync batch /api/orders /api/profile      # Concurrent batch\n\
                    shopsync notifications                       # List notifications\n\
                    shopsync notifications read n-42             # Mark one read\n\
                    shopsync watch --room orders                 # Stream push events\n\
                  \n\
                  Environment Variables:\n\
                    SHOPSYNC_API_URL                  # REST base URL\n\
                    SHOPSYNC_WS_URL                   # Push endpoints, comma separated, tried in order\n\
                    SHOPSYNC_TOKEN                    # Bearer token (omit for anonymous)\n\
                    SHOPSYNC_USER                     # Identity the token belongs to\n\
                    SHOPSYNC_DATA_DIR                 # Where notification flags are stored\n\
                    RUST_LOG                          # Log filter (default: info)"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// REST base URL
    #[arg(long, env = "SHOPSYNC_API_URL", default_value = "http://localhost:8080")]
    api_url: String,

    /// Push channel endpoints, tried in order on each attempt
    #[arg(
        long,
        env = "SHOPSYNC_WS_URL",
        value_delimiter = ',',
        default_value = "ws://localhost:8080/ws"
    )]
    ws_url: Vec<String>,

    /// Bearer token
    #[arg(long, env = "SHOPSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Identity the token belongs to
    #[arg(long, env = "SHOPSYNC_USER", default_value = "customer")]
    user: String,

    /// Directory for persisted notification flags (default: <data dir>/shopsync)
    #[arg(long, env = "SHOPSYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Disable ANSI colors (log-friendly)
    #[arg(long, env = "SHOPSYNC_NO_COLOR")]
    no_color: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch one endpoint through the TTL cache
    Fetch {
        /// Request path, relative to the API URL
        target: String,
        /// Query parameter (name=value), repeatable
        #[arg(short = 'p', long = "param", value_parser = cli::parse_param)]
        params: Vec<(String, String)>,
        /// Fetch this many times and report cache statistics
        #[arg(long, default_value = "1")]
        repeat: usize,
    },
    /// Fetch several endpoints concurrently
    Batch {
        #[arg(required = true)]
        targets: Vec<String>,
    },
    /// List and update notifications
    Notifications {
        #[command(subcommand)]
        action: Option<NotificationAction>,
    },
    /// Stream push channel events until interrupted
    Watch {
        /// Room to join, repeatable
        #[arg(long = "room")]
        rooms: Vec<String>,
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Forget every read and dismissed flag
    ClearFlags,
}

#[derive(Subcommand)]
enum NotificationAction {
    /// Show the visible list (default)
    List,
    /// Mark one notification read
    Read { id: String },
    /// Mark every visible notification read
    ReadAll,
    /// Hide a notification
    Dismiss { id: String },
}

impl Cli {
    fn credential(&self) -> Option<Credential> {
        self.token
            .as_ref()
            .map(|token| Credential::new(token.clone(), self.user.clone()))
    }

    fn data_dir(&self) -> Result<PathBuf> {
        self.data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|d| d.join("shopsync")))
            .context("Could not determine data directory")
    }

    fn backend(&self) -> Result<Arc<RestBackend>> {
        let backend = RestBackend::new(&self.api_url, Duration::from_secs(10))
            .context("Failed to create REST client")?;
        backend.set_credential(self.credential());
        Ok(Arc::new(backend))
    }

    fn fetcher(&self) -> Result<Fetcher<RestBackend>> {
        let cache = Arc::new(ResponseCache::new(CacheConfig::default()));
        Ok(Fetcher::new(self.backend()?, cache, FetchConfig::default()))
    }

    fn flags(&self) -> Result<FlagStore> {
        let dir = self.data_dir()?;
        let storage = FileStorage::open(&dir)
            .with_context(|| format!("Failed to open flag storage at {}", dir.display()))?;
        Ok(FlagStore::new(Arc::new(storage)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_ansi(!cli.no_color)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Command::Fetch {
            target,
            params,
            repeat,
        } => run_fetch(&cli, target, params, *repeat).await,
        Command::Batch { targets } => run_batch(&cli, targets).await,
        Command::Notifications { action } => {
            run_notifications(&cli, action.as_ref().unwrap_or(&NotificationAction::List)).await
        }
        Command::Watch { rooms, seconds } => run_watch(&cli, rooms, *seconds).await,
        Command::ClearFlags => run_clear_flags(&cli),
    }
}

async fn run_fetch(cli: &Cli, target: &str, params: &[(String, String)], repeat: usize) -> Result<()> {
    let fetcher = cli.fetcher()?;
    let request = params
        .iter()
        .fold(FetchRequest::get(target), |request, (name, value)| {
            request.param(name, value)
        });

    let mut payload = None;
    for _ in 0..repeat.max(1) {
        payload = Some(
            fetcher
                .fetch_value(&request)
                .await
                .with_context(|| format!("Failed to fetch {}", request.cache_key()))?,
        );
    }

    if let Some(payload) = payload {
        println!("{}", serde_json::to_string_pretty(payload.as_ref())?);
    }
    if repeat > 1 {
        eprintln!("{}", cli::format_cache_stats(&fetcher.cache().stats()));
    }
    Ok(())
}

async fn run_batch(cli: &Cli, targets: &[String]) -> Result<()> {
    let fetcher = cli.fetcher()?;
    let requests = targets.iter().map(FetchRequest::get).collect();
    let results = fetcher.parallel_fetch(requests).await;

    println!("{}", cli::format_batch(targets, &results, cli.json, cli.no_color));
    Ok(())
}

async fn run_notifications(cli: &Cli, action: &NotificationAction) -> Result<()> {
    let fetcher = cli.fetcher()?;
    let center = NotificationCenter::new(cli.flags()?);

    let mut snapshot = center
        .refresh(&fetcher)
        .await
        .context("Failed to fetch notifications")?;

    match action {
        NotificationAction::List => {}
        NotificationAction::Read { id } => snapshot = center.mark_as_read(id),
        NotificationAction::ReadAll => snapshot = center.mark_all_as_read(),
        NotificationAction::Dismiss { id } => snapshot = center.dismiss(id),
    }

    println!(
        "{}",
        cli::format_notifications(&snapshot, cli.json, cli.no_color)
    );
    Ok(())
}

async fn run_watch(cli: &Cli, rooms: &[String], seconds: Option<u64>) -> Result<()> {
    let endpoint = cli
        .ws_url
        .first()
        .context("At least one push endpoint is required")?;
    let mut channel = ChannelConfig::new(endpoint.clone());
    channel.transport_order = cli.ws_url.clone();

    let mut config = SyncConfig::new(channel);
    config.rooms = rooms.to_vec();

    let dir = cli.data_dir()?;
    let storage: Arc<dyn StorageArea> = Arc::new(
        FileStorage::open_watched(&dir)
            .with_context(|| format!("Failed to open flag storage at {}", dir.display()))?,
    );
    // The sender must outlive the client or the identity follower stops
    let (_auth, identity) = identity_channel(cli.credential());

    let client = SyncClient::start(config, cli.backend()?, WsConnector::new(), storage, identity)
        .context("Failed to start sync client")?;
    let mut events = client.events();

    if cli.credential().is_some() {
        if let Err(e) = client.refresh_notifications().await {
            warn!(error = %e, "Initial notification fetch failed");
        }
    }

    let deadline = async {
        match seconds {
            Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => println!("{}", cli::describe_event(&event)),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = &mut deadline => break,
        }
    }

    let unread = client.notifications().unread_count();
    client.shutdown().await;
    eprintln!("{} unread notifications", unread);
    Ok(())
}

fn run_clear_flags(cli: &Cli) -> Result<()> {
    cli.flags()?
        .clear()
        .context("Failed to clear notification flags")?;
    println!("Notification flags cleared.");
    Ok(())
}
