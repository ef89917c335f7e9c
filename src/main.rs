use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use show_digest::config::AppConfig;
use show_digest::db::Catalog;
use show_digest::dispatcher::{DigestOutcome, SubscribeError};
use show_digest::{build_dispatcher, catalog, start_scheduler};

#[derive(Parser, Debug)]
#[command(name = "show-digest")]
#[command(about = "Weekly event digests matched to venue and genre preferences")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the weekly scheduler until interrupted
    Serve,
    /// Run the weekly dispatch once, now
    Dispatch {
        /// Drop the cached feed before fetching
        #[arg(long)]
        refresh: bool,
    },
    /// Register a subscriber and send the welcome emails
    Subscribe {
        #[arg(long)]
        email: String,
        #[arg(long = "venue")]
        venues: Vec<String>,
        #[arg(long = "genre")]
        genres: Vec<String>,
    },
    /// Remove a subscriber
    Unsubscribe {
        #[arg(long)]
        email: String,
    },
    /// Send the digest to one existing subscriber
    TestDigest {
        #[arg(long)]
        email: String,
    },
    /// List cataloged venue names
    Venues,
    /// List cataloged tags
    Tags,
    /// Check the store, feed and mailer
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("show_digest=info")),
        )
        .init();

    let args = Args::parse();
    let config = AppConfig::load();
    let dispatcher = Arc::new(build_dispatcher(&config)?);

    match args.command {
        Command::Serve => {
            tracing::info!("show-digest scheduler starting");
            let handle = start_scheduler(dispatcher, &config);
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            handle.shutdown().await;
        }
        Command::Dispatch { refresh } => {
            if refresh {
                dispatcher.feed().invalidate()?;
            }
            let report = dispatcher.run_weekly_dispatch().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Subscribe {
            email,
            venues,
            genres,
        } => match dispatcher.subscribe(&email, venues, genres).await {
            Ok(outcome) => println!("{}", serde_json::to_string_pretty(&outcome)?),
            Err(SubscribeError::AlreadySubscribed(email)) => {
                println!("{email} is already subscribed");
            }
            Err(err) => return Err(err.into()),
        },
        Command::Unsubscribe { email } => {
            if dispatcher.unsubscribe(&email)? {
                println!("unsubscribed {}", email.trim());
            } else {
                println!("no subscriber with address {}", email.trim());
            }
        }
        Command::TestDigest { email } => match dispatcher.send_test_digest(&email).await? {
            DigestOutcome::Sent { events, status } => {
                println!("digest sent with {events} events (status {status})");
            }
            DigestOutcome::NoPreferences => println!("no preferences set for {email}"),
            DigestOutcome::NoMatches => println!("no events match the preferences of {email}"),
            DigestOutcome::Failed(err) => return Err(err.into()),
        },
        Command::Venues => {
            for name in catalog::list(dispatcher.store(), Catalog::Venues)? {
                println!("{name}");
            }
        }
        Command::Tags => {
            for name in catalog::list(dispatcher.store(), Catalog::Tags)? {
                println!("{name}");
            }
        }
        Command::Health => {
            let report = dispatcher.health().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_healthy() {
                anyhow::bail!("unhealthy");
            }
        }
    }

    Ok(())
}
