use anyhow::{Context, Result};
use auto_uploader::api::{self, AppState};
use auto_uploader::config::{self, expand_home};
use auto_uploader::db;
use auto_uploader::monitor::FolderMonitor;
use auto_uploader::queue::UploadQueue;
use auto_uploader::quota::QuotaTracker;
use auto_uploader::settings::SettingsStore;
use auto_uploader::updater::Updater;
use auto_uploader::worker::{self, Uploader, WorkerOptions};
use auto_uploader::youtube::{ProjectRegistry, VideoPlatform, YouTubeClient};
use clap::Parser;
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Watch a folder and upload new videos to YouTube")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_config {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("loading {}", args.config.display()))?;
    cfg.ensure_dirs()?;
    let data_dir = cfg.app.data_path();

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let settings = SettingsStore::open(&data_dir).await?;
    let projects = Arc::new(ProjectRegistry::new(
        cfg.youtube.credentials_path(),
        cfg.youtube.tokens_path(),
        settings.clone(),
    ));
    let api_base = Url::parse(&cfg.youtube.api_base).context("invalid youtube.api_base")?;
    let platform: Arc<dyn VideoPlatform> =
        Arc::new(YouTubeClient::new(api_base, projects.clone())?);
    let quota = QuotaTracker::restore(pool.clone()).await?;
    let updater = Arc::new(Updater::new(
        Url::parse(&cfg.updates.api_base).context("invalid updates.api_base")?,
        cfg.updates.repo.clone(),
        expand_home(&cfg.updates.install_dir),
        &data_dir,
    )?);

    let queue = UploadQueue::new();
    let (intake_tx, intake_rx) = mpsc::unbounded_channel();
    let monitor = Arc::new(FolderMonitor::new(intake_tx, cfg.app.settle_delay()));
    tokio::spawn(worker::run_intake(intake_rx, queue.clone(), pool.clone()));

    let uploader = Uploader::new(
        queue.clone(),
        settings.clone(),
        platform.clone(),
        quota.clone(),
        pool.clone(),
        WorkerOptions {
            poll_interval: cfg.app.poll_interval(),
            cleanup_after: cfg.app.cleanup_after(),
            ..WorkerOptions::default()
        },
    );
    tokio::spawn(uploader.run());

    let current = settings.snapshot().await;
    if let Some(folder) = current.watch_path() {
        if platform.is_authenticated().await {
            if let Err(err) = monitor.start(&folder, current.check_existing_files).await {
                warn!(?err, folder = %folder.display(), "could not start monitoring");
            }
        } else {
            info!("not authenticated yet; monitoring stays off");
        }
    }

    let addr = cfg.app.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    let state = AppState {
        settings,
        queue,
        monitor: monitor.clone(),
        platform,
        projects,
        quota,
        updater,
        pool,
        redirect_uri: api::default_redirect_uri(&cfg.app.bind),
    };

    info!(%addr, "starting auto-uploader");
    api::serve(listener, state, shutdown_signal()).await?;
    monitor.stop().await;
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(?err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
