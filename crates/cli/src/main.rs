use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

// Exit codes: 0 success, 2 invalid args, 3 gateway unreachable,
// 4 authorization failed, 5 remote error.
const EXIT_INVALID_ARGS: i32 = 2;
const EXIT_UNREACHABLE: i32 = 3;
const EXIT_UNAUTHORIZED: i32 = 4;
const EXIT_REMOTE: i32 = 5;

#[derive(Parser)]
#[command(name = "clawdis")]
#[command(about = "Clawdis personal-assistant gateway", long_about = None)]
struct Cli {
    /// Config file path (default: OPENCLAW_STATE_DIR/config.json or ~/.clawdis/config.json)
    #[arg(long, short, global = true, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway daemon, or talk to a running one.
    Gateway {
        /// Bind address override (default from config or 127.0.0.1)
        #[arg(long)]
        bind: Option<String>,

        /// Control-plane port override (default from config or 18789)
        #[arg(long, short)]
        port: Option<u16>,

        /// Without a subcommand the daemon itself is started.
        #[command(subcommand)]
        command: Option<GatewayCommands>,
    },

    /// Paired-node management.
    Nodes {
        #[command(subcommand)]
        command: NodeCommands,
    },

    /// Trigger a heartbeat-style forced prompt on the main session.
    Heartbeat {
        /// Prompt text (default "HEARTBEAT")
        #[arg(long, short)]
        message: Option<String>,
    },

    /// Cron job management.
    Cron {
        #[command(subcommand)]
        command: CronCommands,
    },
}

#[derive(Subcommand)]
enum GatewayCommands {
    /// Send a message through a connected channel.
    Send {
        #[arg(long)]
        to: String,
        #[arg(long, short)]
        message: String,
        #[arg(long)]
        channel: Option<String>,
    },

    /// Run one agent turn via the gateway.
    Agent {
        #[arg(long, short)]
        message: String,
        #[arg(long, value_name = "KEY")]
        session_key: Option<String>,
        #[arg(long)]
        thinking: Option<String>,
    },

    /// Gateway health (providers and link state).
    Health,

    /// Gateway status (sessions, runs in flight, heartbeats).
    Status,
}

#[derive(Subcommand)]
enum NodeCommands {
    /// List paired nodes and their connection state.
    List,
    /// List pairing requests waiting for approval.
    Pending,
    /// Approve a pending pairing.
    Approve { node_id: String },
    /// Reject a pending pairing.
    Reject { node_id: String },
    /// Invoke a command on a connected node.
    Invoke {
        node_id: String,
        command: String,
        /// JSON-encoded parameters.
        #[arg(long)]
        params: Option<String>,
    },
}

#[derive(Subcommand)]
enum CronCommands {
    List,
    Add {
        /// Schedule, e.g. "every:30m"
        #[arg(long)]
        schedule: String,
        #[arg(long, short)]
        message: String,
        #[arg(long, value_name = "KEY")]
        session_key: Option<String>,
    },
    Remove { id: String },
    RunNow { id: String },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    match cli.command {
        Commands::Gateway {
            command: Some(command),
            ..
        } => {
            let (method, params) = match command {
                GatewayCommands::Send {
                    to,
                    message,
                    channel,
                } => {
                    let mut params = serde_json::json!({ "to": to, "message": message });
                    if let Some(c) = channel {
                        params["channel"] = serde_json::Value::String(c);
                    }
                    ("send", params)
                }
                GatewayCommands::Agent {
                    message,
                    session_key,
                    thinking,
                } => {
                    let mut params = serde_json::json!({ "message": message });
                    if let Some(k) = session_key {
                        params["sessionKey"] = serde_json::Value::String(k);
                    }
                    if let Some(t) = thinking {
                        params["thinking"] = serde_json::Value::String(t);
                    }
                    ("agent", params)
                }
                GatewayCommands::Health => ("health", serde_json::json!({})),
                GatewayCommands::Status => ("status", serde_json::json!({})),
            };
            call_and_print(cli.config, method, params).await
        }

        Commands::Gateway {
            bind,
            port,
            command: None,
        } => {
            let (mut config, path) = match lib::config::load_config(cli.config) {
                Ok(v) => v,
                Err(e) => {
                    log::error!("loading config failed: {}", e);
                    return EXIT_INVALID_ARGS;
                }
            };
            if let Some(b) = bind {
                config.gateway.bind = b;
            }
            if let Some(p) = port {
                config.gateway.port = p;
            }
            log::info!(
                "starting gateway on {}:{}",
                config.gateway.bind,
                config.gateway.port
            );
            match lib::gateway::run_gateway(config, path).await {
                Ok(()) => 0,
                Err(e) => {
                    log::error!("gateway failed: {}", e);
                    1
                }
            }
        }

        Commands::Nodes { command } => {
            let (method, params) = match command {
                NodeCommands::List => ("nodes.list", serde_json::json!({})),
                NodeCommands::Pending => ("nodes.pending", serde_json::json!({})),
                NodeCommands::Approve { node_id } => {
                    ("nodes.approve", serde_json::json!({ "nodeId": node_id }))
                }
                NodeCommands::Reject { node_id } => {
                    ("nodes.reject", serde_json::json!({ "nodeId": node_id }))
                }
                NodeCommands::Invoke {
                    node_id,
                    command,
                    params,
                } => (
                    "nodes.invoke",
                    serde_json::json!({
                        "nodeId": node_id,
                        "command": command,
                        "paramsJson": params,
                    }),
                ),
            };
            call_and_print(cli.config, method, params).await
        }

        Commands::Heartbeat { message } => {
            let params = serde_json::json!({
                "message": message.unwrap_or_else(|| "HEARTBEAT".to_string()),
            });
            call_and_print(cli.config, "agent", params).await
        }

        Commands::Cron { command } => {
            let (method, params) = match command {
                CronCommands::List => ("cron.list", serde_json::json!({})),
                CronCommands::Add {
                    schedule,
                    message,
                    session_key,
                } => (
                    "cron.add",
                    serde_json::json!({
                        "schedule": schedule,
                        "message": message,
                        "sessionKey": session_key,
                    }),
                ),
                CronCommands::Remove { id } => ("cron.remove", serde_json::json!({ "id": id })),
                CronCommands::RunNow { id } => ("cron.runNow", serde_json::json!({ "id": id })),
            };
            call_and_print(cli.config, method, params).await
        }
    }
}

/// Issue one RPC against the gateway and print the result as JSON.
async fn call_and_print(
    config_path: Option<std::path::PathBuf>,
    method: &str,
    params: serde_json::Value,
) -> i32 {
    match call_gateway(config_path, method, params).await {
        Ok(result) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&result).unwrap_or_default()
            );
            0
        }
        Err(CallError::Unreachable(e)) => {
            eprintln!("gateway unreachable: {}", e);
            EXIT_UNREACHABLE
        }
        Err(CallError::Unauthorized(e)) => {
            eprintln!("authorization failed: {}", e);
            EXIT_UNAUTHORIZED
        }
        Err(CallError::Remote(e)) => {
            eprintln!("error: {}", e);
            EXIT_REMOTE
        }
    }
}

enum CallError {
    Unreachable(String),
    Unauthorized(String),
    Remote(String),
}

/// Connect, authenticate when a token is configured, send one request, and
/// return its result.
async fn call_gateway(
    config_path: Option<std::path::PathBuf>,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value, CallError> {
    let (config, _) =
        lib::config::load_config(config_path).map_err(|e| CallError::Remote(e.to_string()))?;
    let token = lib::config::resolve_gateway_token(&config);
    let ws_url = format!(
        "ws://{}:{}/ws",
        config.gateway.bind.trim(),
        config.gateway.port
    );

    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .map_err(|e| CallError::Unreachable(e.to_string()))?;

    if let Some(token) = token {
        let hello = serde_json::json!({
            "id": "hello",
            "method": "hello",
            "params": { "token": token }
        });
        ws.send(Message::Text(hello.to_string()))
            .await
            .map_err(|e| CallError::Unreachable(e.to_string()))?;
        wait_response(&mut ws, "hello")
            .await
            .map_err(CallError::Unauthorized)?;
    }

    let req = serde_json::json!({ "id": "1", "method": method, "params": params });
    ws.send(Message::Text(req.to_string()))
        .await
        .map_err(|e| CallError::Unreachable(e.to_string()))?;
    wait_response(&mut ws, "1").await.map_err(|e| {
        if e.contains("UNAUTHORIZED") {
            CallError::Unauthorized(e)
        } else {
            CallError::Remote(e)
        }
    })
}

/// Read frames until the response with the given id arrives; server events in
/// between are skipped.
async fn wait_response<S>(ws: &mut S, id: &str) -> Result<serde_json::Value, String>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|e| e.to_string())?;
        let Message::Text(text) = msg else { continue };
        let res: serde_json::Value = serde_json::from_str(&text).map_err(|e| e.to_string())?;
        if res.get("id").and_then(|v| v.as_str()) != Some(id) {
            continue; // event frame or other response
        }
        if res.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
            return Ok(res.get("result").cloned().unwrap_or(serde_json::json!({})));
        }
        let code = res
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .unwrap_or("ERROR");
        let message = res
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .unwrap_or("request failed");
        return Err(format!("{}: {}", code, message));
    }
    Err("connection closed before response".to_string())
}
