//! amqp-helper – provisions the configured topology and runs the hello
//! service against the in-process broker.
//
//  $ amqp-helper --config amqp-helper.toml provision
//  $ amqp-helper hello --name "John Doe" --location Maryland
//  $ amqp-helper serve
use std::sync::Arc;

use amqp_helper::error::RemoteError;
use amqp_helper::transport::memory::{MemoryBroker, MemoryConnector};
use amqp_helper::{logging, rpc_params, shutdown, AmqpHelper, Config, ServiceHandlers};

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "amqp-helper", version, about = "Broker topology & RPC helper")]
struct Cli {
    /// Path to config TOML (env AMQP_HELPER_CONFIG is used when absent)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Provision the exchanges and queues listed in the config.
    Provision,
    /// Call the hello service once and print the replies.
    Hello {
        #[arg(long, default_value = "John Doe")]
        name: String,
        #[arg(long, default_value = "Maryland")]
        location: String,
    },
    /// Keep the hello service registered until SIGINT/SIGTERM.
    Serve,
}

fn hello_service() -> ServiceHandlers {
    ServiceHandlers::new()
        .sync_method("sayHello", |params| {
            let name = text_param(&params, 0)?;
            let location = text_param(&params, 1)?;
            Ok(json!(format!(
                "Hello {name}, I am HelloService from {location}"
            )))
        })
        .arity("sayHello", 2)
        .sync_method("getQuote", |_| {
            Ok(json!("The quick brown fox jumped over the lazy dog!"))
        })
}

fn text_param(params: &[Value], idx: usize) -> Result<&str, RemoteError> {
    params
        .get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| RemoteError::application(format!("parameter {idx} must be a string")))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging()?;
    let cli = Cli::parse();

    let config: Config = Config::load(cli.config.as_deref())?;
    let connector = MemoryConnector::new(MemoryBroker::new());

    match cli.cmd {
        Command::Provision => {
            let helper = AmqpHelper::initialize(config, &connector).await?;
            info!(
                exchanges = ?helper.store().declared_exchanges(),
                queues = ?helper.store().declared_queues(),
                "topology ready"
            );
            helper.disconnect().await?;
        }
        Command::Hello { name, location } => {
            let helper = AmqpHelper::initialize(config, &connector).await?;
            helper.rpc().build_service("hello", hello_service()).await?;

            let client = helper.rpc().build_client("hello", ["sayHello", "getQuote"]);
            let greeting = client.call("sayHello", rpc_params![name, location]).await?;
            let quote = client.call("getQuote", rpc_params![]).await?;
            println!("{}", greeting.as_str().unwrap_or_default());
            println!("{}", quote.as_str().unwrap_or_default());

            helper.disconnect().await?;
        }
        Command::Serve => {
            let helper = Arc::new(AmqpHelper::initialize(config, &connector).await?);
            helper.rpc().build_service("hello", hello_service()).await?;
            info!("hello service registered; waiting for a termination signal");
            shutdown::disconnect_on_signal(Arc::clone(&helper)).await?;
        }
    }
    Ok(())
}
