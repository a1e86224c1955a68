use chat_archiver::config::{ProviderConfig, StoreConfig};
use chat_archiver::provider::HttpProvider;
use chat_archiver::store::{PgConnector, run_migrations};
use chat_archiver::{Daemon, DaemonConfig, Error, init_logger};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::signal::unix::{SignalKind, signal};

#[derive(Parser, Debug)]
#[command(
    name = "chat-archiver",
    about = "Continuously archive group chats into Postgres"
)]
struct Args {
    /// Do not apply pending schema migrations on startup.
    #[arg(long)]
    skip_migrations: bool,

    /// Worker cap (overrides ARCHIVER_MAX_WORKERS).
    #[arg(long)]
    max_workers: Option<usize>,

    /// Connection pool capacity (overrides ARCHIVER_MAX_CONNECTIONS).
    #[arg(long)]
    max_connections: Option<usize>,

    /// Task slot capacity (overrides ARCHIVER_MAX_QUEUED_TASKS).
    #[arg(long)]
    max_queued_tasks: Option<usize>,

    /// Also archive private and secret chats.
    #[arg(long)]
    include_private_chats: bool,
}

#[tokio::main]
async fn main() {
    init_logger();

    if let Err(e) = run(Args::parse()).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Error> {
    log::info!("starting chat archiver");

    let store = StoreConfig::from_env()?;
    let provider = ProviderConfig::from_env();
    let mut config = DaemonConfig::from_env();

    if let Some(n) = args.max_workers {
        config.scheduler.max_workers = n;
    }
    if let Some(n) = args.max_connections {
        config.scheduler.max_connections = n;
    }
    if let Some(n) = args.max_queued_tasks {
        config.scheduler.max_queued_tasks = n;
    }
    if args.include_private_chats {
        config.crawl.include_private_chats = true;
    }

    if args.skip_migrations {
        log::warn!("skipping database migrations");
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(store.connect_options.clone())
            .await
            .map_err(chat_archiver::store::StoreError::from)?;
        run_migrations(&pool).await?;
        pool.close().await;
    }

    let provider = HttpProvider::new(provider)?;
    let daemon = Daemon::start(config, provider, PgConnector::new(store.connect_options))?;

    wait_for_signal().await;

    daemon.shutdown().await;
    Ok(())
}

async fn wait_for_signal() {
    let (mut terminate, mut hangup) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(terminate), Ok(hangup)) => (terminate, hangup),
        _ => {
            log::warn!("unix signal handlers unavailable, waiting for ctrl-c only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("failed to listen for ctrl-c: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("received SIGINT"),
        _ = terminate.recv() => log::info!("received SIGTERM"),
        _ = hangup.recv() => log::info!("received SIGHUP"),
    }
}
