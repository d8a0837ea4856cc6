use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "deskwatch")]
#[command(about = "Deskwatch CLI — unanswered-conversation monitor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: DESKWATCH_CONFIG_PATH or ~/.deskwatch/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the server (vendor webhook + REST snapshot + viewer WebSocket).
    Serve {
        /// Config file path (default: DESKWATCH_CONFIG_PATH or ~/.deskwatch/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// WebSocket and HTTP port (default from config or 7171)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Follow a running server: print the pending snapshot, then live updates.
    Watch {
        /// Config file path (default: DESKWATCH_CONFIG_PATH or ~/.deskwatch/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("deskwatch {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Serve { config, port }) => {
            if let Err(e) = run_serve(config, port).await {
                log::error!("serve failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Watch { config }) => {
            if let Err(e) = run_watch(config).await {
                eprintln!("watch error: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_serve(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, _path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.server.port = p;
    }
    log::info!("starting server on {}:{}", config.server.bind, config.server.port);
    lib::server::run_server(config).await
}

/// One line per conversation: wait, customer, team, message.
fn print_conversation(view: &serde_json::Value) {
    let id = view.get("id").and_then(|v| v.as_str()).unwrap_or("?");
    let name = view.get("customerName").and_then(|v| v.as_str()).unwrap_or("anonymous");
    let wait = view.get("waitMinutes").and_then(|v| v.as_i64()).unwrap_or(0);
    let message = view.get("lastMessage").and_then(|v| v.as_str()).unwrap_or("");
    match view.get("team").and_then(|v| v.as_str()) {
        Some(team) => println!("  {:>4}m  {} [{}] ({}): {}", wait, name, team, id, message),
        None => println!("  {:>4}m  {} ({}): {}", wait, name, id, message),
    }
}

fn stamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

async fn run_watch(config_path: Option<std::path::PathBuf>) -> Result<(), String> {
    let (config, _) = lib::config::load_config(config_path).map_err(|e| e.to_string())?;
    let bind = config.server.bind.trim();
    let port = config.server.port;
    let token = lib::config::resolve_viewer_token(&config);
    let ws_url = format!("ws://{}:{}/ws", bind, port);

    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .map_err(|e| e.to_string())?;

    let mut connect_params = serde_json::json!({
        "client": { "id": "deskwatch-cli" },
        "auth": {}
    });
    if let Some(ref t) = token {
        connect_params["auth"] = serde_json::json!({ "token": t });
    }
    let connect_req = serde_json::json!({
        "type": "req",
        "id": "1",
        "method": "connect",
        "params": connect_params
    });
    ws.send(Message::Text(connect_req.to_string()))
        .await
        .map_err(|e| e.to_string())?;

    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|e| e.to_string())?;
        let Message::Text(text) = msg else { continue };
        let frame: serde_json::Value = serde_json::from_str(&text).map_err(|e| e.to_string())?;

        match frame.get("type").and_then(|v| v.as_str()) {
            Some("res") if frame.get("id").and_then(|v| v.as_str()) == Some("1") => {
                if !frame.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
                    let err = frame
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("connect failed");
                    return Err(err.to_string());
                }
                let snapshot = frame
                    .get("payload")
                    .and_then(|p| p.get("snapshot"))
                    .and_then(|s| s.as_array())
                    .cloned()
                    .unwrap_or_default();
                println!("{} connected to {} ({} pending)", stamp(), ws_url, snapshot.len());
                for view in &snapshot {
                    print_conversation(view);
                }
            }
            Some("event") => {
                let payload = frame.get("payload").cloned().unwrap_or_default();
                match frame.get("event").and_then(|v| v.as_str()) {
                    Some("conversation.pending") => {
                        println!("{} pending", stamp());
                        print_conversation(&payload);
                    }
                    Some("conversation.answered") => {
                        let id = payload.get("conversationId").and_then(|v| v.as_str()).unwrap_or("?");
                        let reason = payload.get("reason").and_then(|v| v.as_str()).unwrap_or("");
                        println!("{} answered ({}): {}", stamp(), reason, id);
                    }
                    Some("conversation.expired") => {
                        let id = payload.get("conversationId").and_then(|v| v.as_str()).unwrap_or("?");
                        println!("{} expired: {}", stamp(), id);
                    }
                    Some("shutdown") => {
                        println!("{} server is shutting down", stamp());
                        break;
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    Ok(())
}
