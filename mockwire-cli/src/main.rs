use clap::Parser;
use mockwire::{MockServer, ServerConfig};
use std::net::SocketAddr;
use std::process::exit;
use std::time::Duration;
use tracing::*;
use tracing_subscriber::{filter::LevelFilter, EnvFilter, FmtSubscriber};

/// Runs a mock JSON-RPC server on loopback and prints the
/// `host:port/token` line a client under test needs to reach it.
/// Log events are written to stderr; stdout carries only the credentials.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on; port 0 picks an ephemeral port
    #[arg(long, default_value = "127.0.0.1:0")]
    bind: SocketAddr,

    /// Shared secret clients must present; generated when omitted
    #[arg(long)]
    token: Option<String>,

    /// Unauthenticated connection grace period, in milliseconds
    #[arg(long, default_value_t = 250)]
    grace_ms: u64,

    /// Turn debugging information on
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let default_log_directive = match cli.debug {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Initialize tracing with JSON formatting and full detail
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_log_directive.into())
                .from_env_lossy(),
        )
        .json()
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ServerConfig {
        bind_addr: cli.bind,
        token: cli.token,
        auth_grace: Duration::from_millis(cli.grace_ms),
    };
    let (server, mut observations) = MockServer::bind(config).await?;

    // The one line a client under test needs.
    println!("{}", server.credentials());

    let watcher = tokio::spawn(async move {
        while let Some(observation) = observations.recv().await {
            info!(?observation, "observation");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("interrupt received; shutting down");
    server.shutdown();
    server.closed().await;
    watcher.await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify that there aren't any invalid attributes in the CLI specification that can only be
    /// detected at runtime
    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }
}
