use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use auto_uploader::client::{
    format_file_size, limit_countdown, queue_stats, ControlClient, ProjectSelection, QueueEvent,
    QueueSnapshot, QueueWatcher,
};
use auto_uploader::model::{Privacy, TaskStatus};
use auto_uploader::settings::SettingsPatch;
use chrono::Utc;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "Control a running auto-uploader")]
struct Args {
    /// Base URL of the uploader service
    #[arg(long, env = "UPLOADER_URL", default_value = "http://127.0.0.1:5000")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show service status
    Status,
    /// Print the upload queue
    Queue,
    /// Poll the queue every second and print changes
    Watch,
    /// Start watching the configured folder
    Start,
    /// Stop watching
    Stop,
    /// Queue video files already in the watch folder
    Scan,
    /// Cancel a pending or uploading task
    Cancel { task_id: String },
    /// Remove completed tasks from the queue
    ClearCompleted,
    /// Show or change settings
    Settings {
        #[arg(long)]
        watch_folder: Option<String>,
        #[arg(long)]
        check_existing_files: Option<bool>,
        #[arg(long)]
        title_template: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        tags: Option<String>,
        /// public, unlisted or private
        #[arg(long)]
        privacy: Option<String>,
        #[arg(long)]
        delete_after_upload: Option<bool>,
        #[arg(long)]
        max_retries: Option<u32>,
        #[arg(long)]
        upload_limit_duration: Option<u32>,
        #[arg(long)]
        delete_retry_count: Option<u32>,
        #[arg(long)]
        delete_retry_delay: Option<u64>,
    },
    /// Set the theme preference (light or dark)
    Theme { theme: String },
    /// List directories under a path
    Browse { path: Option<String> },
    /// List channels, or select one
    Channels {
        #[arg(long)]
        select: Option<String>,
    },
    /// List API projects, select one, or add a client secret file
    Projects {
        #[arg(long)]
        select: Option<String>,
        #[arg(long)]
        add: Option<PathBuf>,
    },
    /// Recently uploaded files
    History,
    /// Check for, apply or configure updates
    Update {
        #[arg(long)]
        apply: bool,
        #[arg(long)]
        auto: Option<bool>,
        #[arg(long)]
        restart: bool,
    },
}

fn parse_privacy(value: &str) -> Result<Privacy> {
    serde_json::from_value(serde_json::Value::String(value.to_lowercase()))
        .map_err(|_| anyhow::anyhow!("invalid privacy: {}", value))
}

fn print_queue(snap: &QueueSnapshot) {
    let stats = queue_stats(&snap.queue);
    println!(
        "completed: {}  pending: {}  uploading: {}  failed: {}",
        stats.completed, stats.pending, stats.uploading, stats.failed
    );
    for task in &snap.queue {
        let mut line = format!(
            "{}  {:<10} {:>3}%  {}  ({})",
            task.id,
            task.status.as_str(),
            task.progress,
            task.filename,
            format_file_size(task.file_size)
        );
        if let Some(url) = &task.video_url {
            line.push_str(&format!("  {}", url));
        }
        if let Some(err) = &task.error {
            line.push_str(&format!("  error: {}", err));
        }
        if task.status == TaskStatus::Completed && task.delete_success {
            line.push_str("  [file deleted]");
        }
        println!("{}", line);
    }
}

fn print_limit(reached: bool, reset_at: Option<chrono::DateTime<Utc>>) {
    if !reached {
        return;
    }
    match reset_at {
        Some(at) => println!("Upload limit reached. {}", limit_countdown(at, Utc::now())),
        None => println!("Upload limit reached."),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let client = ControlClient::new(&args.url)?;

    match args.command {
        Command::Status => {
            let s = client.status().await?;
            println!("authenticated: {}", s.is_authenticated);
            println!("monitoring:    {}", s.is_monitoring);
            println!("watch folder:  {}", s.watch_folder);
            println!("theme:         {}", s.theme.as_str());
            print_limit(s.upload_limit_reached, s.upload_limit_reset_time);
        }
        Command::Queue => {
            let snap = client.queue().await?;
            print_queue(&snap);
            print_limit(snap.upload_limit_reached, snap.upload_limit_reset_time);
        }
        Command::Watch => {
            let mut watcher = QueueWatcher::new();
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let snap = match client.queue().await {
                    Ok(snap) => snap,
                    Err(err) => {
                        eprintln!("{}", err);
                        continue;
                    }
                };
                for event in watcher.apply(snap.clone()) {
                    match event {
                        QueueEvent::QueueChanged => print_queue(&snap),
                        QueueEvent::MonitoringChanged(on) => {
                            println!("monitoring {}", if on { "active" } else { "inactive" })
                        }
                        QueueEvent::LimitChanged { reached, reset_at } => {
                            print_limit(reached, reset_at)
                        }
                    }
                }
            }
        }
        Command::Start => {
            client.start_monitoring().await?;
            println!("Monitoring started");
        }
        Command::Stop => {
            client.stop_monitoring().await?;
            println!("Monitoring stopped");
        }
        Command::Scan => {
            let added = client.scan_folder().await?;
            println!("Found {} video file(s)", added);
        }
        Command::Cancel { task_id } => {
            client.cancel_task(&task_id).await?;
            println!("Cancellation requested");
        }
        Command::ClearCompleted => {
            let removed = client.clear_completed().await?;
            println!("Removed {} task(s)", removed);
        }
        Command::Settings {
            watch_folder,
            check_existing_files,
            title_template,
            description,
            tags,
            privacy,
            delete_after_upload,
            max_retries,
            upload_limit_duration,
            delete_retry_count,
            delete_retry_delay,
        } => {
            let patch = SettingsPatch {
                watch_folder,
                check_existing_files,
                title_template,
                description,
                tags,
                privacy: privacy.as_deref().map(parse_privacy).transpose()?,
                delete_after_upload,
                max_retries,
                upload_limit_duration,
                delete_retry_count,
                delete_retry_delay,
            };
            let settings = if patch == SettingsPatch::default() {
                client.settings().await?
            } else {
                client.update_settings(&patch).await?
            };
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Command::Theme { theme } => {
            let theme = client.set_theme(&theme).await?;
            println!("Theme set to {}", theme.as_str());
        }
        Command::Browse { path } => {
            let listing = client.browse(path.as_deref()).await?;
            println!("{}", listing.current_path);
            if let Some(parent) = listing.parent {
                println!("  ..  ({})", parent);
            }
            for dir in listing.directories {
                println!("  {}/", dir);
            }
        }
        Command::Channels { select } => match select {
            Some(id) => {
                client.select_channel(&id).await?;
                println!("Channel {} selected", id);
            }
            None => {
                let list = client.channels().await?;
                for ch in list.channels {
                    let marker = if list.selected_channel.as_deref() == Some(ch.id.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!("{} {}  {}", marker, ch.id, ch.title);
                }
            }
        },
        Command::Projects { select, add } => {
            if let Some(file) = add {
                let id = client.add_project(&file).await?;
                println!("Added project {}", id);
                println!("Authorize it at {}", client.auth_url(&id));
            } else if let Some(id) = select {
                match client.select_project(&id).await? {
                    ProjectSelection::Selected => println!("Project {} selected", id),
                    ProjectSelection::NeedsAuth { auth_url } => {
                        println!("Project {} is not authenticated.", id);
                        println!("Authorize it at {}", auth_url);
                    }
                }
            } else {
                for p in client.projects().await? {
                    println!(
                        "{} {}  {}  {}",
                        if p.is_active { "*" } else { " " },
                        p.id,
                        p.name,
                        if p.is_authenticated { "authenticated" } else { "needs auth" }
                    );
                }
            }
        }
        Command::History => {
            for rec in client.history().await? {
                println!("{}  {}  {}", rec.uploaded_at.to_rfc3339(), rec.video_id, rec.file_path);
            }
        }
        Command::Update {
            apply,
            auto,
            restart,
        } => {
            if let Some(enabled) = auto {
                let enabled = client.set_auto_update(enabled).await?;
                println!("Auto-update {}", if enabled { "enabled" } else { "disabled" });
            }
            if apply {
                let version = client.apply_update().await?;
                println!("Updated to {}", version);
            } else if auto.is_none() && !restart {
                let status = client.check_updates().await?;
                println!("current: {}", status.current_version);
                match (status.update_available, status.latest_version) {
                    (true, Some(latest)) => {
                        println!("latest:  {} (update available)", latest);
                        if let Some(notes) = status.release_notes {
                            println!("\n{}", notes);
                        }
                    }
                    _ => println!("up to date"),
                }
            }
            if restart {
                client.restart().await?;
                println!("Restart requested");
            }
        }
    }
    Ok(())
}
