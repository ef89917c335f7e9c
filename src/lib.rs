pub mod catalog;
pub mod config;
pub mod db;
pub mod digest;
pub mod dispatcher;
pub mod feed;
pub mod feed_cache;
pub mod mailer;
pub mod matcher;
pub mod models;
pub mod normalize;
pub mod scheduler;
mod utils;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::Context;

use config::AppConfig;
use db::Store;
use dispatcher::{DeliveryPolicy, DigestDispatcher};
use feed::BroadcastFeed;
use feed_cache::FeedCache;
use mailer::{Mailer, SendGridMailer};
use scheduler::{SchedulerHandle, WeeklySchedule};

/// Wires the store, feed cache and mailer described by `config`.
pub fn build_dispatcher(config: &AppConfig) -> anyhow::Result<DigestDispatcher> {
    let db_path = config.database_path();
    let store = Arc::new(
        Store::open(&db_path).with_context(|| format!("opening store at {}", db_path.display()))?,
    );
    let feed = BroadcastFeed::from_config(config).context("building feed client")?;
    let cache = FeedCache::new(
        Arc::new(feed),
        store.clone(),
        config.cache_duration(),
        config.fetch_delay(),
    );
    let mailer = SendGridMailer::from_config(config).context("building mail client")?;
    if !mailer.is_configured() {
        tracing::warn!("SENDGRID_API_KEY or FROM_EMAIL missing; emails will fail");
    }

    Ok(DigestDispatcher::new(
        cache,
        store,
        Arc::new(mailer),
        DeliveryPolicy::from_config(config),
        config.timezone(),
    ))
}

/// Starts the Monday 09:00 job in the configured timezone.
pub fn start_scheduler(dispatcher: Arc<DigestDispatcher>, config: &AppConfig) -> SchedulerHandle {
    let schedule = WeeklySchedule::monday_morning(config.timezone());
    scheduler::spawn_weekly(dispatcher, schedule)
}
