//! tarnd — the Tarn daemon.
//!
//! Keeps a set of GPU inference-server replicas sized to load and
//! serves discovery, health, and status over HTTP.
//!
//! # Usage
//!
//! ```text
//! tarnd standalone --config /etc/tarn/tarn.toml
//! tarnd check-config --config tarn.toml --min-replicas 2
//! tarnd render-command --tensor-parallelism 2
//! ```

mod options;
mod standalone;

use clap::{Parser, Subcommand};
use tarn_scheduler::LaunchPlan;
use tracing_subscriber::EnvFilter;

use crate::options::ConfigArgs;

#[derive(Parser)]
#[command(name = "tarnd", about = "Tarn inference replica-set controller")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller and API against the configured local nodes.
    Standalone {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Validate the layered configuration and print it as TOML.
    CheckConfig {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Print the launch command and container environment for a replica.
    RenderCommand {
        #[command(flatten)]
        config: ConfigArgs,

        /// Replica id used for the container hostname.
        #[arg(long, default_value = "container_000001")]
        replica_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Standalone { config } => standalone::run_standalone(config.load()?).await,
        Command::CheckConfig { config } => {
            let config = config.load()?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::RenderCommand { config, replica_id } => {
            let plan = LaunchPlan::from_config(&config.load()?)?;
            let context = plan.context_for(&replica_id);
            for (key, value) in &context.env {
                println!("{key}={value}");
            }
            println!();
            println!("{}", context.command);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tarnd=debug,tarn=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subcommands_accept_overrides() {
        let cli = Cli::try_parse_from([
            "tarnd",
            "render-command",
            "--tensor-parallelism",
            "2",
            "--env",
            "A=1",
            "--replica-id",
            "container_000042",
            "--log-json",
        ])
        .unwrap();
        assert!(cli.log_json);
        let Command::RenderCommand { config, replica_id } = cli.command else {
            panic!("expected render-command");
        };
        assert_eq!(config.tensor_parallelism, Some(2));
        assert_eq!(config.env, vec![("A".to_string(), "1".to_string())]);
        assert_eq!(replica_id, "container_000042");
    }

    #[test]
    fn malformed_env_flag_is_rejected() {
        assert!(Cli::try_parse_from(["tarnd", "check-config", "--env", "oops"]).is_err());
    }
}
