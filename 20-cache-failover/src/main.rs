use anyhow::Result;
use clap::Parser;

use cache_failover::{
    Client,
    cli::{self, Cli},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr; stdout carries only command output.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli.options.to_config()?;
    let client = Client::new(cli.servers, config)?;
    let events = tokio::spawn(cli::log_events(client.subscribe()));

    let outcome = cli::run(&client, cli.command).await;
    client.end().await;
    events.abort();

    println!("{}", outcome?);
    Ok(())
}
