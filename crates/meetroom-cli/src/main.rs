//! `meetroom` command line.
//!
//! ```bash
//! meetroom token room-42 --user alice
//! meetroom link user_1 --personal
//! meetroom meeting --at 2026-03-01T12:00:00Z --description "Weekly sync"
//! meetroom demo room-42 --data-dir /tmp/meetroom
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use meetroom_core::clock::SystemClock;
use meetroom_core::identity::StaticIdentity;
use meetroom_core::layout::MemorySurfaces;
use meetroom_core::loopback::{LoopbackTransport, SimulatedMedia};
use meetroom_core::token::{JwtSigner, TokenVerifier};
use meetroom_core::{
    AppConfig, LayoutPresenter, MediaKind, MeetError, MeetEvent, MeetEventListener, Meeting,
    MeetingLink, RoomId, RoomIdentity, RoomSession, SessionOptions, SettingsStore, TokenIssuer,
};

const DEFAULT_USER: &str = "demo-user";

/// Meeting room tokens, links and a loopback demo session
#[derive(Parser, Debug)]
#[command(name = "meetroom")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Issue a join token and print it as JSON
    Token {
        room: String,
        /// Signed-in user the token is issued to
        #[arg(long, default_value = DEFAULT_USER)]
        user: String,
    },
    /// Print the shareable meeting link
    Link {
        room: String,
        /// Treat the room as a user's personal room
        #[arg(long)]
        personal: bool,
    },
    /// Create an instant or scheduled meeting and print it with its link
    Meeting {
        /// Start time (RFC 3339); omit for an instant meeting
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        #[arg(long, requires = "at")]
        description: Option<String>,
    },
    /// Run a session over the loopback transport with simulated peers
    Demo {
        room: String,
        #[arg(long, default_value = DEFAULT_USER)]
        user: String,
        /// Directory holding settings.json
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

fn issuer(config: &AppConfig, user: &str) -> TokenIssuer {
    TokenIssuer::new(
        config.clone(),
        Arc::new(StaticIdentity::signed_in(user)),
        Arc::new(JwtSigner),
        Arc::new(SystemClock),
    )
}

async fn print_token(config: &AppConfig, room: &str, user: &str) -> Result<(), MeetError> {
    let room_id = RoomId::parse(room)?;
    let credential = issuer(config, user).issue_token(&room_id).await?;
    let json = serde_json::to_string_pretty(&credential.to_response())
        .map_err(|e| MeetError::Http(format!("cannot encode token response: {e}")))?;
    println!("{json}");
    Ok(())
}

fn print_link(config: &AppConfig, room: &str, personal: bool) -> Result<(), MeetError> {
    let base_url = config.base_url.as_str();
    let link = if personal {
        MeetingLink::personal_room(base_url, room)?
    } else {
        MeetingLink::new(base_url, RoomId::parse(room)?, false)?
    };
    println!("{link}");
    Ok(())
}

fn print_meeting(
    config: &AppConfig,
    at: Option<DateTime<Utc>>,
    description: Option<String>,
) -> Result<(), MeetError> {
    let meeting = match at {
        Some(starts_at) => Meeting::scheduled(description.unwrap_or_default(), starts_at),
        None => Meeting::instant(),
    };
    let link = meeting.link(config.base_url.as_str())?;
    let json = serde_json::to_string_pretty(&meeting)
        .map_err(|e| MeetError::Http(format!("cannot encode meeting: {e}")))?;
    println!("{json}");
    println!("{link}");
    Ok(())
}

struct PrintListener;

impl MeetEventListener for PrintListener {
    fn on_event(&self, event: MeetEvent) {
        println!("event: {event:?}");
    }
}

async fn run_demo(
    config: &AppConfig,
    room: &str,
    user: &str,
    data_dir: Option<PathBuf>,
) -> Result<(), MeetError> {
    let room_id = RoomId::parse(room)?;
    let (app_id, secret) = config.signing_keys()?;

    let settings = data_dir
        .or_else(|| dirs::config_dir().map(|d| d.join("meetroom")))
        .map(|dir| SettingsStore::new(dir).get())
        .unwrap_or_default();

    let clock = Arc::new(SystemClock);
    let transport = Arc::new(LoopbackTransport::new(
        TokenVerifier::new(app_id, secret),
        clock.clone(),
    ));
    let session = RoomSession::new(
        transport.clone(),
        Arc::new(SimulatedMedia::new()),
        SessionOptions {
            clock,
            ..SessionOptions::from_config(config, &settings)
        },
    );
    session.add_listener(Arc::new(PrintListener));

    session.acquire().await?;
    let outcome = session
        .connect(
            &issuer(config, user),
            RoomIdentity {
                room_id,
                local_user_id: user.to_string(),
            },
        )
        .await?;
    println!(
        "joined {} publishing {:?} ({} publish failures)",
        outcome.room.room_id,
        outcome.published,
        outcome.publish_failures.len()
    );

    for peer in ["alice", "bob"] {
        transport.remote_joined(peer);
        transport.remote_published(peer, MediaKind::Audio);
        transport.remote_published(peer, MediaKind::Video);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let surfaces = MemorySurfaces::new();
    let mut presenter = LayoutPresenter::new(settings.layout);
    let participants = session.participants().await;
    presenter.sync(&participants, &surfaces);
    for tile in presenter.arrange(&participants) {
        println!("tile: {tile:?}");
    }

    transport.remote_left("bob");
    tokio::time::sleep(Duration::from_millis(100)).await;
    presenter.sync(&session.participants().await, &surfaces);
    println!("surfaces after bob left: {:?}", surfaces.surfaces());

    presenter.detach_all(&surfaces);
    session.leave().await;
    println!("final state: {}", session.state().await);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("meetroom_core=info,meetroom=info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Token { room, user } => print_token(&config, &room, &user).await,
        Command::Link { room, personal } => print_link(&config, &room, personal),
        Command::Meeting { at, description } => print_meeting(&config, at, description),
        Command::Demo { room, user, data_dir } => run_demo(&config, &room, &user, data_dir).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
