use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use multi_transport_mcp::{
    config::Config,
    domain::demo_registry,
    errors::McpError,
    listener, logging,
    mcp::{server::ServerContext, session::Session},
    transport::{ClientTransport, TransportKind},
};
use serde_json::json;
use tracing::info;

const DEFAULT_SSE_URL: &str = "http://127.0.0.1:8000/sse";
const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000/mcp";
/// Bounds runtime teardown: a stdin read parked on a blocking thread never finishes on its own.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(
    version,
    about = "MCP demo server and client over pipe, push-stream and WebSocket transports"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the demo server. Without --transport, MCP_TRANSPORTS decides.
    Serve {
        #[arg(long = "transport", value_name = "KIND")]
        transports: Vec<TransportKind>,
    },
    /// Connect to a server and run the demo interaction.
    Client {
        /// pipe, push-stream or bidirectional-stream
        kind: TransportKind,
        /// Server URL for the network transports.
        #[arg(long)]
        url: Option<String>,
        /// Server command for the pipe transport. Defaults to this binary.
        #[arg(long)]
        command: Option<String>,
        /// Argument passed to the pipe server command; repeatable.
        #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
        args: Vec<String>,
        /// Number of clients to run concurrently, each with its own session.
        #[arg(long, default_value_t = 1)]
        clients: usize,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let outcome = runtime.block_on(run(cli));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    outcome
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Serve { transports } => {
            let mut config = Config::from_env()?;
            if !transports.is_empty() {
                config = config.with_transports(transports)?;
            }

            let context = ServerContext::new(demo_registry()?, config.server_name.clone());
            listener::serve(&config, context).await?;
        }
        Command::Client {
            kind,
            url,
            command,
            args,
            clients,
        } => {
            let transport = client_transport(kind, url, command, args)?;
            if clients <= 1 {
                run_demo(&transport).await?;
            } else {
                run_concurrent_clients(&transport, clients).await;
            }
        }
    }

    Ok(())
}

fn client_transport(
    kind: TransportKind,
    url: Option<String>,
    command: Option<String>,
    args: Vec<String>,
) -> Result<ClientTransport, std::io::Error> {
    Ok(match kind {
        TransportKind::Pipe => match command {
            Some(command) => ClientTransport::Pipe { command, args },
            None => ClientTransport::Pipe {
                command: std::env::current_exe()?.to_string_lossy().into_owned(),
                args: vec![
                    "serve".to_string(),
                    "--transport".to_string(),
                    "pipe".to_string(),
                ],
            },
        },
        TransportKind::PushStream => ClientTransport::PushStream {
            url: url.unwrap_or_else(|| DEFAULT_SSE_URL.to_string()),
        },
        TransportKind::BidirectionalStream => ClientTransport::BidirectionalStream {
            url: url.unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
        },
    })
}

async fn run_demo(transport: &ClientTransport) -> Result<(), McpError> {
    let session = Session::connect(transport).await?;
    let outcome = demo_interaction(&session, transport.kind()).await;
    session.close().await;
    outcome
}

async fn demo_interaction(session: &Session, kind: TransportKind) -> Result<(), McpError> {
    println!("Connected to MCP server via {kind}\n");

    println!("Available tools:");
    for tool in session.list_tools().await? {
        println!("  - {}: {}", tool.name, tool.description);
    }

    let result = session.call_tool("add", json!({ "a": 10, "b": 5 })).await?;
    println!("\nadd(10, 5) = {}", result.text());
    let result = session.call_tool("multiply", json!({ "a": 10, "b": 5 })).await?;
    println!("multiply(10, 5) = {}", result.text());
    let result = session.call_tool("greet", json!({ "name": "FastMCP" })).await?;
    println!("greet('FastMCP') = {}", result.text());

    println!("\nAvailable resources:");
    for resource in session.list_resources().await? {
        println!("  - {}: {}", resource.uri, resource.name);
    }

    for uri in ["config://app", "config://version"] {
        let contents = session.read_resource(uri).await?;
        let text = contents
            .first()
            .and_then(|content| content.as_text())
            .unwrap_or_default();
        println!("{uri} = {text}");
    }

    Ok(())
}

async fn run_concurrent_clients(transport: &ClientTransport, clients: usize) {
    let runs = (1..=clients).map(|client_id| async move {
        let outcome = async {
            let session = Session::connect(transport).await?;
            let result = session
                .call_tool("greet", json!({ "name": format!("Client-{client_id}") }))
                .await;
            session.close().await;
            result
        }
        .await;

        match outcome {
            Ok(result) => println!("[Client {client_id}] {}", result.text()),
            Err(err) => println!("[Client {client_id}] error: {err}"),
        }
    });

    join_all(runs).await;
    info!(clients, "all clients completed");
}
