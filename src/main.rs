//! `quillgate` -- operator CLI for the coordination and metering core.
//!
//! - `quillgate status <user>` -- credit status
//! - `quillgate charge <user> <task>` -- charge a task
//! - `quillgate resolve <user>` -- which AI credentials a user runs on
//! - `quillgate user <email> [tier]` -- create a user or overwrite its tier
//! - `quillgate tier <actor> <user> <tier>` -- change a user's tier
//! - `quillgate config show|set-enabled` -- inspect or toggle configuration
//! - `quillgate encrypt|decrypt` -- secret envelopes
//! - `quillgate counter <key> <window>` -- bump a fixed-window counter
//! - `quillgate backend` -- coordination backend info

use anyhow::Result;
use clap::{Parser, Subcommand};
use quillgate::billing::MonetizationUpdate;
use quillgate::{Config, MeteringError, MeteringService};
use serde::Serialize;
use std::path::PathBuf;

/// Coordination and metering CLI.
#[derive(Parser)]
#[command(name = "quillgate", about = "Coordination and metering CLI", version)]
struct Cli {
    /// Config file path (default: ~/.quillgate/config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose (debug-level) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a user's credit status, applying any pending refill.
    Status { user: String },

    /// Charge a user for one task.
    Charge { user: String, task: String },

    /// Show which AI runtime a user resolves to (key masked).
    Resolve { user: String },

    /// Create a user (or overwrite its tier) and open its credit account.
    User {
        email: String,
        #[arg(default_value = "byok")]
        tier: String,
    },

    /// Change a user's tier as `actor`.
    Tier {
        actor: String,
        user: String,
        tier: String,
    },

    /// Inspect or change configuration.
    Config {
        #[command(subcommand)]
        action: ConfigCmd,
    },

    /// Encrypt a secret into an envelope.
    Encrypt { plaintext: String },

    /// Decrypt an envelope (prints an empty line when it cannot be decrypted).
    Decrypt { value: String },

    /// Increment a fixed-window counter and print the count.
    Counter {
        key: String,
        /// Window length in seconds.
        window: u64,
    },

    /// Show coordination backend info.
    Backend,
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Print the resolved configuration (secrets masked) and monetization settings.
    Show,

    /// Turn monetization on or off.
    SetEnabled {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(cli.config.as_deref())?;
    let service = MeteringService::from_config(&config)?;

    let result = run(cli.command, &config, &service).await;
    if let Err(e) = &result {
        if let Some(err) = e.downcast_ref::<MeteringError>() {
            tracing::error!(status = err.http_status(), retryable = err.is_retryable(), "{err}");
        }
    }
    result
}

async fn run(command: Commands, config: &Config, service: &MeteringService) -> Result<()> {
    match command {
        Commands::Status { user } => print_json(&service.credit_status(&user)?),
        Commands::Charge { user, task } => print_json(&service.charge_for_task(&user, &task).await?),
        Commands::Resolve { user } => {
            let mut decision = service.resolve_runtime(&user)?;
            decision.api_key = quillgate::security::mask_plain(&decision.api_key);
            print_json(&decision)
        }
        Commands::User { email, tier } => {
            service.provision_user(&email, &tier)?;
            print_json(&service.credit_status(&email.trim().to_lowercase())?)
        }
        Commands::Tier { actor, user, tier } => {
            service.set_user_tier(&actor, &user, &tier)?;
            print_json(&service.credit_status(&user)?)
        }
        Commands::Config { action } => match action {
            ConfigCmd::Show => {
                println!("{}", toml::to_string_pretty(&config.redacted())?);
                print_json(&service.monetization_config()?)
            }
            ConfigCmd::SetEnabled { enabled } => {
                let update = MonetizationUpdate {
                    enabled: Some(enabled),
                    ..MonetizationUpdate::default()
                };
                print_json(&service.save_monetization_config(&update, true)?)
            }
        },
        Commands::Encrypt { plaintext } => {
            println!("{}", service.encrypt_secret(&plaintext)?);
            Ok(())
        }
        Commands::Decrypt { value } => {
            println!("{}", service.decrypt_secret(&value));
            Ok(())
        }
        Commands::Counter { key, window } => {
            println!("{}", service.increment_counter(&key, window).await?);
            Ok(())
        }
        Commands::Backend => print_json(&service.backend_info()),
    }
}
