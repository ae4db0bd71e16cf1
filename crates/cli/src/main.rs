use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use std::io::Write as _;
use std::path::PathBuf;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "harbor")]
#[command(about = "Harbor personal-assistant gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default files (config, state dir, bundled skills).
    Init {
        /// Config file path (default: HARBOR_CONFIG_PATH or ~/.harbor/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the gateway (HTTP + WebSocket control plane).
    Gateway {
        /// Config file path (default: HARBOR_CONFIG_PATH or ~/.harbor/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// WebSocket and HTTP port (default from config or 18789)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Chat with the assistant via the gateway (interactive).
    Chat {
        /// Config file path (default: HARBOR_CONFIG_PATH or ~/.harbor/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Existing session id to continue.
        #[arg(long, value_name = "ID")]
        session: Option<String>,
    },

    /// Append a message to a session without running the agent.
    Send {
        /// Config file path (default: HARBOR_CONFIG_PATH or ~/.harbor/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Session id to append to.
        #[arg(long, value_name = "ID")]
        session: String,

        /// Message text.
        message: String,
    },

    /// Inspect sessions.
    Sessions {
        #[command(subcommand)]
        command: SessionsCommands,
    },

    /// Manage channel pairing requests.
    Pairing {
        #[command(subcommand)]
        command: PairingCommands,
    },
}

#[derive(Subcommand)]
enum SessionsCommands {
    /// List sessions, most recently updated first.
    List {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum PairingCommands {
    /// List pairing requests and their status.
    List {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
    /// Approve a channel user.
    Approve {
        /// Channel name (e.g. telegram).
        channel: String,
        /// Platform user id.
        user_id: String,
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("harbor {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init { config }) => run_init(config),
        Some(Commands::Gateway { config, port }) => run_gateway(config, port).await,
        Some(Commands::Chat { config, session }) => run_chat(config, session).await,
        Some(Commands::Send {
            config,
            session,
            message,
        }) => run_send(config, session, message).await,
        Some(Commands::Sessions {
            command: SessionsCommands::List { config },
        }) => run_sessions_list(config).await,
        Some(Commands::Pairing { command }) => match command {
            PairingCommands::List { config } => run_pairing_list(config).await,
            PairingCommands::Approve {
                channel,
                user_id,
                config,
            } => run_pairing_approve(config, channel, user_id).await,
        },
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };

    if let Err(e) = result {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!(
        "starting gateway on {}:{}",
        config.gateway.bind,
        config.gateway.port
    );
    lib::gateway::run_gateway(config, path).await
}

/// Minimal WebSocket client for the gateway protocol.
struct GatewayClient {
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    next_id: u64,
}

impl GatewayClient {
    /// Open a connection and run the connect handshake.
    async fn connect(config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (config, _) = lib::config::load_config(config_path)?;
        let token = lib::config::resolve_gateway_token(&config);
        let ws_url = format!(
            "ws://{}:{}/ws",
            config.gateway.bind.trim(),
            config.gateway.port
        );
        let (ws, _) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .map_err(|e| anyhow::anyhow!("connecting to {}: {}", ws_url, e))?;
        let mut client = Self { ws, next_id: 0 };

        let params = match token {
            Some(t) => serde_json::json!({ "auth": { "token": t }, "clientId": "harbor-cli" }),
            None => serde_json::json!({ "clientId": "harbor-cli" }),
        };
        client.call("connect", params).await?;
        Ok(client)
    }

    /// Send one request and wait for its response, skipping events.
    async fn call(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let req = serde_json::json!({
            "type": "req",
            "id": id,
            "method": method,
            "params": params,
        });
        self.ws.send(Message::Text(req.to_string())).await?;

        while let Some(msg) = self.ws.next().await {
            let Message::Text(text) = msg? else { continue };
            let frame: serde_json::Value = serde_json::from_str(&text)?;
            if frame.get("type").and_then(|v| v.as_str()) != Some("res") {
                continue;
            }
            if frame.get("id").and_then(|v| v.as_str()) != Some(id.as_str()) {
                continue;
            }
            if !frame.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
                let err = frame
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("request failed");
                anyhow::bail!("{} failed: {}", method, err);
            }
            return Ok(frame.get("payload").cloned().unwrap_or(serde_json::Value::Null));
        }
        anyhow::bail!("connection closed before {} response", method)
    }

    /// Run one agent turn, printing deltas as they arrive. Returns when the
    /// run's done or error event comes in.
    async fn agent_turn(&mut self, message: &str, session_id: &str) -> anyhow::Result<()> {
        let payload = self
            .call(
                "agent",
                serde_json::json!({ "message": message, "sessionId": session_id }),
            )
            .await?;
        let run_id = payload
            .get("runId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing runId in agent response"))?
            .to_string();

        let mut stdout = std::io::stdout();
        while let Some(msg) = self.ws.next().await {
            let Message::Text(text) = msg? else { continue };
            let frame: serde_json::Value = serde_json::from_str(&text)?;
            if frame.get("type").and_then(|v| v.as_str()) != Some("event")
                || frame.get("event").and_then(|v| v.as_str()) != Some("agent")
            {
                continue;
            }
            let Some(ev) = frame.get("payload") else { continue };
            if ev.get("runId").and_then(|v| v.as_str()) != Some(run_id.as_str()) {
                continue;
            }
            match ev.get("type").and_then(|v| v.as_str()) {
                Some("delta") => {
                    if let Some(delta) = ev.get("delta").and_then(|v| v.as_str()) {
                        write!(stdout, "{delta}")?;
                        stdout.flush()?;
                    }
                }
                Some("tool_call") => {
                    let name = ev.get("toolName").and_then(|v| v.as_str()).unwrap_or("?");
                    eprintln!("\n[tool: {name}]");
                }
                Some("done") => {
                    writeln!(stdout)?;
                    if let Some(usage) = ev.get("usage") {
                        log::debug!("usage: {}", usage);
                    }
                    return Ok(());
                }
                Some("error") => {
                    writeln!(stdout)?;
                    let err = ev.get("error").and_then(|v| v.as_str()).unwrap_or("run failed");
                    anyhow::bail!("{}", err);
                }
                _ => {}
            }
        }
        anyhow::bail!("connection closed before the run finished")
    }
}

async fn run_chat(config_path: Option<PathBuf>, session: Option<String>) -> anyhow::Result<()> {
    let session_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut client = GatewayClient::connect(config_path).await?;
    println!("session {session_id} (/exit to quit)");

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        if let Err(e) = client.agent_turn(input, &session_id).await {
            eprintln!("chat error: {e:#}");
        }
    }
    Ok(())
}

async fn run_send(
    config_path: Option<PathBuf>,
    session: String,
    message: String,
) -> anyhow::Result<()> {
    let mut client = GatewayClient::connect(config_path).await?;
    let payload = client
        .call(
            "send",
            serde_json::json!({ "sessionId": session, "message": message }),
        )
        .await?;
    let id = payload
        .get("message")
        .and_then(|m| m.get("id"))
        .and_then(|v| v.as_str())
        .unwrap_or("?");
    println!("sent ({id})");
    Ok(())
}

async fn run_sessions_list(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let mut client = GatewayClient::connect(config_path).await?;
    let payload = client.call("sessions.list", serde_json::json!({})).await?;
    let sessions = payload
        .get("sessions")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if sessions.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    for s in sessions {
        let id = s.get("id").and_then(|v| v.as_str()).unwrap_or("?");
        let name = s.get("name").and_then(|v| v.as_str()).unwrap_or("-");
        let count = s.get("messageCount").and_then(|v| v.as_u64()).unwrap_or(0);
        println!("{id}  {name}  ({count} messages)");
    }
    Ok(())
}

async fn run_pairing_list(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let mut client = GatewayClient::connect(config_path).await?;
    let payload = client.call("pairing.list", serde_json::json!({})).await?;
    let entries = payload
        .get("pairing")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if entries.is_empty() {
        println!("no pairing requests");
        return Ok(());
    }
    for p in entries {
        let channel = p.get("channel").and_then(|v| v.as_str()).unwrap_or("?");
        let user = p.get("userId").and_then(|v| v.as_str()).unwrap_or("?");
        let status = if p.get("approved").and_then(|v| v.as_bool()).unwrap_or(false) {
            "approved".to_string()
        } else {
            let code = p
                .get("pairingCode")
                .and_then(|v| v.as_str())
                .unwrap_or("------");
            format!("pending (code {code})")
        };
        println!("{channel}:{user}  {status}");
    }
    Ok(())
}

async fn run_pairing_approve(
    config_path: Option<PathBuf>,
    channel: String,
    user_id: String,
) -> anyhow::Result<()> {
    let mut client = GatewayClient::connect(config_path).await?;
    client
        .call(
            "pairing.approve",
            serde_json::json!({ "channel": channel, "userId": user_id }),
        )
        .await?;
    println!("approved {channel}:{user_id}");
    Ok(())
}
