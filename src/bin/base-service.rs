//! base-service CLI: run RPC workers and talk to them from a shell.

use std::path::PathBuf;

use base_service::RpcClient;
use base_service::codec::{self, Payload};
use base_service::config::{Config, WorkerSettings};
use base_service::engine::Service;
use base_service::handler::{EventKind, handler_fn};
use base_service::telemetry::{TelemetryConfig, init_telemetry};
use base_service::transport::AmqpBroker;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "base-service", about = "Turn AMQP queues into RPC endpoints")]
struct Cli {
    /// TOML file with worker settings
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run dispatch loops for the built-in handlers
    Serve {
        /// Additional event names answered by the echo handler
        #[arg(long = "echo")]
        echo: Vec<String>,
        /// Event names whose messages are only logged
        #[arg(long = "log")]
        log: Vec<String>,
    },
    /// Call an RPC endpoint and print the reply
    Call {
        /// Queue (event name) to call
        queue: String,
        /// Request body: JSON, or plain text
        payload: String,
        /// Override the configured RPC timeout
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Publish a message without waiting for a reply
    Send {
        /// Queue (event name) to publish to
        queue: String,
        /// Message body: JSON, or plain text
        payload: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let mut settings = match &cli.settings {
        Some(path) => WorkerSettings::load(path)?,
        None => WorkerSettings::default(),
    };
    settings.traceback |= config.traceback;

    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "base-service"))?;
    let broker = AmqpBroker::new(config.amqp_url)?;

    match cli.command {
        Command::Serve { echo, log } => cmd_serve(broker, settings, echo, log).await,
        Command::Call {
            queue,
            payload,
            timeout_secs,
        } => cmd_call(broker, settings, queue, payload, timeout_secs).await,
        Command::Send { queue, payload } => cmd_send(broker, settings, queue, payload).await,
    }
}

async fn cmd_serve(
    broker: AmqpBroker,
    settings: WorkerSettings,
    echo: Vec<String>,
    log: Vec<String>,
) -> anyhow::Result<()> {
    let mut service = Service::new(broker, settings);
    service.add_event_handler("echo", handler_fn(echo_handler));
    for event in echo {
        service.add_event_handler(event, handler_fn(echo_handler));
    }
    for event in log {
        service.register(EventKind::Basic, event, handler_fn(log_handler));
    }

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        token.cancel();
    });

    let exits = service.start(shutdown).await?;
    let failed = exits.iter().filter(|exit| exit.result.is_err()).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} event loops failed", exits.len());
    }
    Ok(())
}

async fn cmd_call(
    broker: AmqpBroker,
    settings: WorkerSettings,
    queue: String,
    payload: String,
    timeout_secs: Option<u64>,
) -> anyhow::Result<()> {
    let client = RpcClient::connect(&broker, &settings).await?;
    let request = codec::decode(payload.as_bytes());
    let reply = match timeout_secs {
        Some(secs) => {
            client
                .call_with_timeout(&queue, request, std::time::Duration::from_secs(secs))
                .await
        }
        None => client.call(&queue, request).await,
    };
    client.close().await;

    match reply? {
        Payload::Json(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Payload::Text(text) => println!("{text}"),
    }
    Ok(())
}

async fn cmd_send(
    broker: AmqpBroker,
    settings: WorkerSettings,
    queue: String,
    payload: String,
) -> anyhow::Result<()> {
    let client = RpcClient::connect(&broker, &settings).await?;
    client.send(&queue, codec::decode(payload.as_bytes())).await;
    client.close().await;
    println!("Sent to {queue}");
    Ok(())
}

async fn echo_handler(payload: Payload) -> anyhow::Result<Payload> {
    Ok(payload)
}

async fn log_handler(payload: Payload) -> anyhow::Result<Payload> {
    info!(%payload, "event received");
    Ok(Payload::Json(serde_json::Value::Null))
}
