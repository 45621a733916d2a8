use clap::{Parser, Subcommand};
use opsboard_notify::{
    api::{NotificationApi, RestClient},
    badges::{BadgeBoard, BadgeSnapshot},
    model::{Category, Notification, NotificationFilter, NotificationId, ReadFilter},
    session::LiveSession,
    settings::{read_settings, save_settings, Settings, TransportKind},
    store::{NotificationStore, StoreEvent},
    stream::ConnectionState,
    Error, Result,
};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "opsboard-notify")]
#[command(about = "Live notification feed for the ops dashboard")]
#[command(version)]
struct Cli {
    /// Settings file (JSON)
    #[arg(long, env = "OPSBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// REST root, overrides the settings file
    #[arg(long, env = "OPSBOARD_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "OPSBOARD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, value_parser = parse_transport)]
    transport: Option<TransportKind>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow the live stream, printing new notifications and counters
    Tail {
        /// Only show notifications of this category
        #[arg(long)]
        category: Option<Category>,
    },
    /// List stored notifications
    List {
        #[arg(long)]
        category: Option<Category>,
        #[arg(long)]
        unread: bool,
        /// Number of pages to load
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },
    /// Print the unread counter and per-category badges
    Unread,
    /// Mark notifications as read
    Read {
        #[arg(required = true)]
        ids: Vec<NotificationId>,
    },
    /// Mark a notification as completed
    Complete {
        id: NotificationId,
        /// Clear the completed flag instead
        #[arg(long)]
        undo: bool,
    },
    /// Write the effective settings (including overrides) to the settings file
    Init,
}

fn parse_transport(value: &str) -> std::result::Result<TransportKind, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "sse" => Ok(TransportKind::Sse),
        "websocket" | "ws" => Ok(TransportKind::Websocket),
        other => Err(format!("unknown transport: {other} (expected sse or websocket)")),
    }
}

fn default_settings_path() -> PathBuf {
    let config_root = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    config_root.join("opsboard-notify").join("settings.json")
}

fn effective_settings(cli: &Cli, path: &Path) -> Result<Settings> {
    let mut settings = read_settings(path)?;
    if let Some(base_url) = &cli.base_url {
        settings.base_url = base_url.clone();
    }
    if let Some(token) = &cli.token {
        settings.token = Some(token.clone());
    }
    if let Some(transport) = cli.transport {
        settings.transport = transport;
    }
    Ok(settings)
}

fn require_base_url(settings: &Settings) -> Result<()> {
    if settings.base_url.trim().is_empty() {
        return Err(Error::Config(
            "base_url is not set; pass --base-url or run `opsboard-notify init`".to_string(),
        ));
    }
    Ok(())
}

fn print_notification(notification: &Notification) {
    let marker = if notification.read { ' ' } else { '*' };
    let done = if notification.is_completed { " [done]" } else { "" };
    println!(
        "{marker} #{:<6} {:<15} {}  {}{done}",
        notification.id,
        notification.category.as_str(),
        notification.created_at.format("%Y-%m-%d %H:%M"),
        notification.title
    );
    if !notification.message.is_empty() {
        println!("          {}", notification.message);
    }
}

fn print_badges(badges: &BadgeSnapshot) {
    let counts = badges
        .counts
        .iter()
        .map(|(category, count)| format!("{}={count}", category.as_str()))
        .collect::<Vec<_>>()
        .join(" ");
    let live = if badges.live { "" } else { " (live updates unavailable)" };
    println!("badges: {counts}{live}");
}

async fn tail(settings: &Settings, category: Option<Category>) -> Result<()> {
    let session = LiveSession::from_settings(settings)?;
    let store = Arc::clone(session.store());
    let mut events = store.events();
    let mut state_rx = session.subscribe_state();
    let mut badges_rx = session.badges().subscribe();

    let filter = NotificationFilter {
        category,
        read: ReadFilter::All,
    };
    if let Err(error) = store.set_filter(filter).await {
        log::warn!("initial fetch failed: {error}");
    }
    for notification in store.snapshot().notifications.iter().rev() {
        print_notification(notification);
    }

    session.connect_sse()?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                match session.diagnostics() {
                    Ok(diagnostics) => println!("stream: {}", diagnostics.summary()),
                    Err(_) => println!("stream: state={state}"),
                }
                if state == ConnectionState::GivenUp {
                    eprintln!("live updates unavailable, giving up");
                    break;
                }
            }
            changed = badges_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let badges = badges_rx.borrow_and_update().clone();
                print_badges(&badges);
                println!("unread: {}", store.unread_count());
            }
            event = events.recv() => match event {
                Ok(StoreEvent::Added { id, .. }) => {
                    let snapshot = store.snapshot();
                    if let Some(notification) = snapshot.notifications.iter().find(|n| n.id == id) {
                        print_notification(notification);
                    }
                }
                Ok(StoreEvent::UnreadCountSet(count)) => println!("unread: {count}"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => log::warn!("display skipped {skipped} store events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.shutdown().await
}

async fn run(cli: Cli) -> Result<()> {
    let path = cli.config.clone().unwrap_or_else(default_settings_path);
    let settings = effective_settings(&cli, &path)?;

    if let Command::Init = cli.command {
        save_settings(&path, &settings)?;
        println!("wrote {}", path.display());
        return Ok(());
    }

    require_base_url(&settings)?;
    log::debug!("using settings from {path:?}, transport {:?}", settings.transport);

    match cli.command {
        Command::Tail { category } => tail(&settings, category).await,
        Command::List {
            category,
            unread,
            pages,
        } => {
            let api: Arc<dyn NotificationApi> = Arc::new(RestClient::from_settings(&settings)?);
            let store = NotificationStore::new(api, settings.store_config());
            let filter = NotificationFilter {
                category,
                read: if unread {
                    ReadFilter::UnreadOnly
                } else {
                    ReadFilter::All
                },
            };
            store.set_filter(filter).await?;
            for _ in 1..pages.max(1) {
                if store.load_more().await?.is_none() {
                    break;
                }
            }
            let snapshot = store.snapshot();
            for notification in &snapshot.notifications {
                print_notification(notification);
            }
            let more = if snapshot.has_more { ", more available" } else { "" };
            let shown = snapshot.notifications.len() as u64;
            let total = snapshot.total.unwrap_or(shown);
            println!("{shown} of {total} shown{more}");
            Ok(())
        }
        Command::Unread => {
            let api = RestClient::from_settings(&settings)?;
            println!("unread: {}", api.unread_count().await?);
            let badges = BadgeBoard::new(&settings.badge_categories);
            badges.refresh(&api).await?;
            print_badges(&badges.snapshot());
            Ok(())
        }
        Command::Read { ids } => {
            let api: Arc<dyn NotificationApi> = Arc::new(RestClient::from_settings(&settings)?);
            let store = NotificationStore::new(api, settings.store_config());
            if let [id] = ids.as_slice() {
                store.mark_read(*id).await?;
                println!("marked #{id} read");
            } else {
                let confirmed = store.bulk_mark_read(&ids).await?;
                println!("marked {confirmed} of {} read", ids.len());
            }
            Ok(())
        }
        Command::Complete { id, undo } => {
            let api: Arc<dyn NotificationApi> = Arc::new(RestClient::from_settings(&settings)?);
            let store = NotificationStore::new(api, settings.store_config());
            store.set_completed(id, !undo).await?;
            let verb = if undo { "reopened" } else { "completed" };
            println!("{verb} #{id}");
            Ok(())
        }
        Command::Init => Ok(()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}
