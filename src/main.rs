use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use relay_server::routing::TrustedVerifier;
use relay_server::ServerConfig;
use relay_store::{ConversationRepo, Database};
use relay_telemetry::{init_telemetry, TelemetryConfig};

/// Conversation routing and presence server for live support chat.
#[derive(Parser, Debug)]
#[command(name = "relayd", version, about)]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9090)]
    port: u16,

    /// Path to the SQLite mirror database. Omit to run purely in memory.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Seconds a disconnected visitor may silently reconnect.
    #[arg(long, default_value_t = 30)]
    grace_secs: u64,

    /// Maximum text message length in characters.
    #[arg(long, default_value_t = 4000)]
    max_message_chars: usize,

    /// Accept cap per operator (0 disables the cap).
    #[arg(long, default_value_t = 0)]
    max_operator_chats: usize,

    /// Emit JSON log lines instead of human-readable ones.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let _telemetry = init_telemetry(TelemetryConfig {
        json_output: args.json_logs,
        ..TelemetryConfig::default()
    });

    tracing::info!("starting relay server");

    // Optional durable mirror: load open conversations, then stream every
    // mutation to the writer task.
    let (mirror_tx, seed) = match &args.db {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).expect("failed to create database directory");
            }
            let db = Database::open(path).expect("failed to open database");
            tracing::info!(path = %path.display(), "mirror database opened");

            let repo = ConversationRepo::new(db);
            let seed = repo.load_open().expect("failed to load open conversations");

            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            let _writer = relay_store::spawn_mirror(repo, rx);
            (Some(tx), seed)
        }
        None => (None, Vec::new()),
    };

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        routing: relay_server::RoutingConfig {
            visitor_grace: Duration::from_secs(args.grace_secs),
            max_message_chars: args.max_message_chars,
            max_operator_conversations: args.max_operator_chats,
            ..Default::default()
        },
        ..Default::default()
    };
    let port = config.port;

    let _handle = relay_server::start(config, Box::new(TrustedVerifier), mirror_tx, seed)
        .await
        .expect("failed to start server");

    tracing::info!(port, "relay server ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
}
