use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ds_sync::{
    app::{SyncApp, SyncOptions},
    config::ConfigToml,
    report,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to the config file. Defaults to ~/.ds-sync/config.toml
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// [tracing_subscriber::EnvFilter]
    #[clap(short, long)]
    tracing_env_filter: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring the DS records at Porkbun in line with the published DNSKEYs.
    Sync {
        /// Domains to synchronise, e.g. example.com
        domains: Vec<String>,
        /// Synchronise every domain of the Porkbun account.
        #[arg(long, conflicts_with = "domains")]
        all: bool,
        /// Only print what would change.
        #[arg(long)]
        dry_run: bool,
        /// Remove all DS records of domains that publish no key-signing key.
        #[arg(long)]
        allow_empty: bool,
        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List the domains of the Porkbun account.
    Domains,
    /// Print a sample config file.
    ConfigSample,
}

fn load_config(path: Option<&PathBuf>) -> Result<ConfigToml> {
    if let Some(path) = path {
        return ConfigToml::from_file(path)
            .with_context(|| format!("Failed to read config file {}", path.display()));
    }
    match ConfigToml::default_path() {
        Some(path) if path.exists() => ConfigToml::from_file(&path)
            .with_context(|| format!("Failed to read config file {}", path.display())),
        _ => Ok(ConfigToml::default()),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Cli::parse();

    if let Command::ConfigSample = args.command {
        println!("{}", ConfigToml::sample_string());
        return Ok(ExitCode::SUCCESS);
    }

    let config = load_config(args.config.as_ref())?;
    ds_sync::tracing::init_tracing_logs(&config.logging, args.tracing_env_filter.as_deref())?;

    match args.command {
        Command::Sync {
            domains,
            all,
            dry_run,
            allow_empty,
            json,
        } => {
            let options = SyncOptions {
                dry_run,
                allow_empty,
            };
            let app = SyncApp::from_config(&config, &options)?;
            let domains = if all {
                app.domains()
                    .await
                    .context("Failed to list the domains of the account")?
            } else {
                domains
            };
            if domains.is_empty() {
                anyhow::bail!("No domains given. Pass domain names or --all.");
            }

            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Ctrl+C detected. Finishing started domains, skipping the rest.");
                    ctrl_c.cancel();
                }
            });

            let result = app.sync(domains, cancel).await;
            if json {
                println!("{}", report::render_json(&result)?);
            } else {
                print!("{}", report::render_text(&result));
            }

            Ok(if result.is_fully_converged() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Domains => {
            let client = ds_sync::PorkbunClient::from_config(&config.registrar)?;
            for domain in client.list_domains().await? {
                println!("{domain}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::ConfigSample => Ok(ExitCode::SUCCESS),
    }
}
