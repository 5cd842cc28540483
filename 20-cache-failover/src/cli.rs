use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use crate::client::Client;
use crate::config::{ClientConfig, Redundancy};
use crate::events::HealthEvent;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Cache server as host:port. Repeat the flag for a cluster.
    #[arg(
        long = "server",
        short = 's',
        global = true,
        default_value = "127.0.0.1:11211"
    )]
    pub servers: Vec<String>,

    #[command(flatten)]
    pub options: OptionArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the value stored under a key.
    Get(KeyArgs),
    /// Store a value under a key.
    Set(SetArgs),
    /// Delete a key.
    Delete(KeyArgs),
}

#[derive(Args, Debug, Clone)]
pub struct KeyArgs {
    pub key: String,
}

#[derive(Args, Debug, Clone)]
pub struct SetArgs {
    pub key: String,
    pub value: String,

    /// Expiry in seconds, 0 for none.
    #[arg(long, default_value_t = 0)]
    pub ttl: u32,
}

/// Client options. Flags override values from `--options`.
#[derive(Args, Debug, Clone, Default)]
pub struct OptionArgs {
    /// Options as a JSON object, e.g. '{"retries": 0, "remove": true}'.
    #[arg(long, global = true)]
    pub options: Option<String>,

    /// Connect and response timeout in milliseconds.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Consecutive failures tolerated before a server can be removed.
    #[arg(long, global = true)]
    pub retries: Option<u32>,

    /// Lock budget per server.
    #[arg(long, global = true)]
    pub failures: Option<u32>,

    /// Lock duration in milliseconds.
    #[arg(long, global = true)]
    pub retry: Option<u64>,

    /// Base reconnect cooldown in milliseconds.
    #[arg(long, global = true)]
    pub reconnect: Option<u64>,

    /// Remove servers that exhaust their retries.
    #[arg(long, global = true)]
    pub remove: bool,

    /// Fallback replicas per key.
    #[arg(long, global = true)]
    pub redundancy: Option<usize>,
}

impl OptionArgs {
    pub fn to_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.options {
            Some(raw) => ClientConfig::from_json(raw).context("failed to parse --options")?,
            None => ClientConfig::default(),
        };

        if let Some(ms) = self.timeout {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = self.retries {
            config.retries = retries;
        }
        if let Some(failures) = self.failures {
            config.failures = failures;
        }
        if let Some(ms) = self.retry {
            config.retry = Duration::from_millis(ms);
        }
        if let Some(ms) = self.reconnect {
            config.reconnect = Duration::from_millis(ms);
        }
        if self.remove {
            config.remove = true;
        }
        if let Some(replicas) = self.redundancy {
            config.redundancy = match replicas {
                0 => Redundancy::Disabled,
                n => Redundancy::Replicas(n),
            };
        }

        config.validate()?;
        Ok(config)
    }
}

/// Runs one subcommand and returns the line to print.
pub async fn run(client: &Client, command: Command) -> Result<String> {
    let line = match command {
        Command::Get(args) => match client
            .get(&args.key)
            .await
            .with_context(|| format!("get {}", args.key))?
        {
            Some(value) => String::from_utf8_lossy(&value).into_owned(),
            None => "NOT_FOUND".to_string(),
        },
        Command::Set(args) => {
            let stored = client
                .set(&args.key, args.value, args.ttl)
                .await
                .with_context(|| format!("set {}", args.key))?;
            let reply = if stored { "STORED" } else { "NOT_STORED" };
            reply.to_string()
        }
        Command::Delete(args) => {
            let deleted = client
                .delete(&args.key)
                .await
                .with_context(|| format!("delete {}", args.key))?;
            let reply = if deleted { "DELETED" } else { "NOT_FOUND" };
            reply.to_string()
        }
    };
    Ok(line)
}

/// Logs health events until the bus closes.
pub async fn log_events(mut events: broadcast::Receiver<HealthEvent>) {
    loop {
        match events.recv().await {
            Ok(HealthEvent::Issue { server, details }) => warn!(
                %server,
                failures = details.failures,
                error = %details.error,
                "server issue"
            ),
            Ok(HealthEvent::Remove { server }) => warn!(%server, "server removed"),
            Ok(HealthEvent::Reconnecting { server, delay }) => {
                info!(%server, ?delay, "server reconnecting")
            }
            Ok(HealthEvent::Reconnected { server }) => info!(%server, "server reconnected"),
            Ok(HealthEvent::Failure { server, error }) => {
                warn!(%server, %error, "request failed with no server left")
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed health events"),
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn servers_repeat_and_default() {
        let cli = Cli::parse_from(["cache-failover", "get", "k"]);
        assert_eq!(cli.servers, vec!["127.0.0.1:11211".to_string()]);

        let cli = Cli::parse_from(["cache-failover", "-s", "a:1", "--server", "b:2", "get", "k"]);
        assert_eq!(cli.servers, vec!["a:1".to_string(), "b:2".to_string()]);
    }

    #[test]
    fn flags_override_json_options() {
        let cli = Cli::parse_from([
            "cache-failover",
            "--options",
            r#"{"retries": 1, "failures": 2}"#,
            "--retries",
            "4",
            "--remove",
            "set",
            "k",
            "v",
            "--ttl",
            "30",
        ]);
        let config = cli.options.to_config().expect("valid options");
        assert_eq!(config.retries, 4);
        assert_eq!(config.failures, 2);
        assert!(config.remove);

        match cli.command {
            Command::Set(args) => assert_eq!(args.ttl, 30),
            other => panic!("expected set, got {other:?}"),
        }
    }

    #[test]
    fn bad_json_options_are_reported() {
        let args = OptionArgs {
            options: Some("{not json".into()),
            ..OptionArgs::default()
        };
        assert!(args.to_config().is_err());
    }
}
