use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use eventstore_connection::{
    ConfigError, Configuration, Connection, ConnectionError, ConnectionEvent, DEFAULT_MAX_RECONNECTS,
    DEFAULT_RECONNECTION_DELAY_MS,
};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("failed to listen for ctrl-c: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "escli", about = "Event store TCP connection tool")]
struct Cli {
    #[command(flatten)]
    target: TargetArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct TargetArgs {
    #[arg(long, env = "EVENTSTORE_ADDRESS", default_value = "127.0.0.1")]
    address: String,

    #[arg(long, env = "EVENTSTORE_PORT", default_value_t = 1113)]
    port: u16,

    #[arg(long, env = "EVENTSTORE_LOGIN")]
    login: Option<String>,

    #[arg(long, env = "EVENTSTORE_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    #[arg(long, env = "EVENTSTORE_RECONNECTION_DELAY_MS", default_value_t = DEFAULT_RECONNECTION_DELAY_MS)]
    reconnection_delay_ms: u64,

    #[arg(long, env = "EVENTSTORE_MAX_RECONNECTS", default_value_t = DEFAULT_MAX_RECONNECTS)]
    max_reconnects: u32,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Round-trip pings and print their latency.
    Ping {
        #[arg(long, default_value_t = 1)]
        count: u32,
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Hold the connection open and print lifecycle events until ctrl-c.
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let connection = Connection::new(configuration(cli.target)?)?;

    match cli.command {
        Command::Ping { count, interval_ms } => run_ping(&connection, count, Duration::from_millis(interval_ms)).await,
        Command::Watch => run_watch(&connection).await,
    }
}

fn configuration(target: TargetArgs) -> Result<Configuration, ConfigError> {
    let mut config = Configuration::from_env()?;
    config.address = target.address;
    config.port = target.port;
    config.reconnection_delay = Duration::from_millis(target.reconnection_delay_ms);
    config.max_reconnects = target.max_reconnects;
    if let Some(login) = target.login {
        config = config.with_credentials(login, target.password);
    }
    Ok(config)
}

async fn run_ping(connection: &Connection, count: u32, interval: Duration) -> Result<(), CliError> {
    connection.connect().await?;

    for seq in 1..=count {
        let rtt = connection.ping().await?;
        println!("pong from {}: seq={seq} time={:.2}ms", connection.endpoint(), rtt.as_secs_f64() * 1000.0);
        if seq < count {
            tokio::time::sleep(interval).await;
        }
    }

    connection.close().await?;
    Ok(())
}

async fn run_watch(connection: &Connection) -> Result<(), CliError> {
    let mut events = connection.events();
    connection.connect().await?;
    println!("connected to {} (connection {})", connection.endpoint(), connection.id());

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            event = events.recv() => match event {
                Ok(ConnectionEvent::Failed { error }) => {
                    println!("failed: {error}");
                    break;
                }
                Ok(event) => println!("{}", describe(&event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    connection.close().await?;
    Ok(())
}

fn describe(event: &ConnectionEvent) -> String {
    match event {
        ConnectionEvent::Connected { endpoint } => format!("connected to {endpoint}"),
        ConnectionEvent::Reconnecting => "reconnecting".to_owned(),
        ConnectionEvent::Disconnected { reason } => format!("disconnected: {reason:?}"),
        ConnectionEvent::Closed => "closed".to_owned(),
        ConnectionEvent::Failed { error } => format!("failed: {error}"),
    }
}
