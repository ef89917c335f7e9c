use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;

use crate::catalog;
use crate::config::AppConfig;
use crate::db::{Store, StoreError};
use crate::digest::{self, CONFIRMATION_SUBJECT, DIGEST_SUBJECT};
use crate::feed::UpstreamError;
use crate::feed_cache::FeedCache;
use crate::mailer::{self, DeliveryError, Mailer};
use crate::matcher;
use crate::models::{Event, Subscriber};
use crate::normalize;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("feed unavailable: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("no subscriber with address {0}")]
    NotSubscribed(String),
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("{0} is already subscribed")]
    AlreadySubscribed(String),
    #[error("invalid email address: {0:?}")]
    InvalidEmail(String),
    #[error("store error: {0}")]
    Store(StoreError),
}

/// Retry-or-skip rule applied to every outgoing message. Only transient
/// failures are retried; anything else skips the recipient at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            retry_delay: Duration::from_secs(30),
        }
    }
}

impl DeliveryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.delivery_max_attempts.max(1),
            retry_delay: Duration::from_secs(config.delivery_retry_delay_secs),
        }
    }
}

#[derive(Debug)]
pub enum DigestOutcome {
    Sent { events: usize, status: u16 },
    NoPreferences,
    NoMatches,
    Failed(DeliveryError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub subscribers: usize,
    pub sent: usize,
    pub skipped_no_preferences: usize,
    pub skipped_no_matches: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubscribeOutcome {
    pub confirmation_sent: bool,
    pub digest_sent: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub store_ok: bool,
    pub digest_events: Option<usize>,
    pub feed_error: Option<String>,
    pub mailer_configured: bool,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.store_ok && self.digest_events.is_some() && self.mailer_configured
    }
}

type UnsubscribeLink = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Fetch, match and send pipeline shared by the weekly run and the
/// on-subscribe run. Holds no record of what was already sent: running it
/// twice in a week sends the digest twice.
pub struct DigestDispatcher {
    feed: FeedCache,
    store: Arc<Store>,
    mailer: Arc<dyn Mailer>,
    policy: DeliveryPolicy,
    timezone: Tz,
    unsubscribe_link: Option<UnsubscribeLink>,
}

impl DigestDispatcher {
    pub fn new(
        feed: FeedCache,
        store: Arc<Store>,
        mailer: Arc<dyn Mailer>,
        policy: DeliveryPolicy,
        timezone: Tz,
    ) -> Self {
        Self {
            feed,
            store,
            mailer,
            policy,
            timezone,
            unsubscribe_link: None,
        }
    }

    /// Builds the unsubscribe URL embedded in each digest (token signing lives
    /// with the web layer).
    pub fn with_unsubscribe_link<F>(mut self, link: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.unsubscribe_link = Some(Box::new(link));
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn feed(&self) -> &FeedCache {
        &self.feed
    }

    /// Normalized events newer than the recency window. Catalogs are
    /// refreshed from the full batch on the way through.
    pub async fn fetch_digest_events(&self, now: DateTime<Utc>) -> Result<Vec<Event>, UpstreamError> {
        let payload = self.feed.get_events().await?;
        let events = normalize::normalize_all(payload);

        if let Err(err) = catalog::sync(&self.store, &events) {
            tracing::error!("{err}");
        }

        Ok(matcher::filter_recent(events, now))
    }

    pub fn match_preferences(&self, events: &[Event], subscriber: &Subscriber) -> Vec<Event> {
        matcher::match_preferences(events, &subscriber.venues, &subscriber.genres)
    }

    pub async fn run_weekly_dispatch(&self) -> Result<DispatchReport, DispatchError> {
        tracing::info!("weekly digest run started");
        let events = self.fetch_digest_events(Utc::now()).await?;
        let subscribers = self.store.find_subscribers()?;

        let mut report = DispatchReport {
            subscribers: subscribers.len(),
            ..DispatchReport::default()
        };

        for subscriber in &subscribers {
            match self.digest_for(subscriber, &events).await {
                DigestOutcome::Sent { .. } => report.sent += 1,
                DigestOutcome::NoPreferences => report.skipped_no_preferences += 1,
                DigestOutcome::NoMatches => report.skipped_no_matches += 1,
                DigestOutcome::Failed(_) => report.failed += 1,
            }
        }

        tracing::info!(
            subscribers = report.subscribers,
            sent = report.sent,
            skipped = report.skipped_no_preferences + report.skipped_no_matches,
            failed = report.failed,
            "weekly digest run finished"
        );
        Ok(report)
    }

    pub async fn subscribe(
        &self,
        email: &str,
        venues: Vec<String>,
        genres: Vec<String>,
    ) -> Result<SubscribeOutcome, SubscribeError> {
        if mailer::validate_address(email).is_err() {
            return Err(SubscribeError::InvalidEmail(email.to_string()));
        }

        let subscriber = Subscriber::new(email, venues, genres);
        match self.store.insert_subscriber(&subscriber) {
            Ok(()) => {}
            Err(StoreError::DuplicateKey(email)) => {
                tracing::info!(email = %email, "subscribe request for existing subscriber");
                return Err(SubscribeError::AlreadySubscribed(email));
            }
            Err(err) => return Err(SubscribeError::Store(err)),
        }

        tracing::info!(email = %subscriber.email, "new subscriber");
        Ok(self.on_subscriber_created(&subscriber).await)
    }

    /// Confirmation email followed by an immediate digest for the new
    /// subscriber. Each half is reported independently.
    pub async fn on_subscriber_created(&self, subscriber: &Subscriber) -> SubscribeOutcome {
        let confirmation = digest::render_confirmation(&subscriber.email);
        let confirmation_sent = match self
            .deliver(&subscriber.email, CONFIRMATION_SUBJECT, &confirmation)
            .await
        {
            Ok(_) => true,
            Err(err) => {
                tracing::error!(email = %subscriber.email, "confirmation email failed: {err}");
                false
            }
        };

        let digest_sent = match self.fetch_digest_events(Utc::now()).await {
            Ok(events) => matches!(
                self.digest_for(subscriber, &events).await,
                DigestOutcome::Sent { .. }
            ),
            Err(err) => {
                tracing::error!(email = %subscriber.email, "no digest for new subscriber: {err}");
                false
            }
        };

        SubscribeOutcome {
            confirmation_sent,
            digest_sent,
        }
    }

    pub fn unsubscribe(&self, email: &str) -> Result<bool, StoreError> {
        let removed = self.store.delete_subscriber(email)?;
        if removed {
            tracing::info!(email = %email.trim(), "subscriber removed");
        }
        Ok(removed)
    }

    /// Runs the digest for one existing subscriber right away.
    pub async fn send_test_digest(&self, email: &str) -> Result<DigestOutcome, DispatchError> {
        let subscriber = self
            .store
            .find_subscriber(email)?
            .ok_or_else(|| DispatchError::NotSubscribed(email.trim().to_string()))?;
        let events = self.fetch_digest_events(Utc::now()).await?;
        Ok(self.digest_for(&subscriber, &events).await)
    }

    pub async fn health(&self) -> HealthReport {
        let store_ok = match self.store.ping() {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("store health check failed: {err}");
                false
            }
        };
        let (digest_events, feed_error) = match self.fetch_digest_events(Utc::now()).await {
            Ok(events) => (Some(events.len()), None),
            Err(err) => (None, Some(err.to_string())),
        };
        HealthReport {
            store_ok,
            digest_events,
            feed_error,
            mailer_configured: self.mailer.is_configured(),
        }
    }

    async fn digest_for(&self, subscriber: &Subscriber, events: &[Event]) -> DigestOutcome {
        if !subscriber.has_preferences() {
            tracing::info!(email = %subscriber.email, "skipping subscriber: no preferences set");
            return DigestOutcome::NoPreferences;
        }

        let matched = self.match_preferences(events, subscriber);
        if matched.is_empty() {
            tracing::info!(email = %subscriber.email, "no matching events for subscriber");
            return DigestOutcome::NoMatches;
        }

        let unsubscribe_url = self
            .unsubscribe_link
            .as_ref()
            .and_then(|link| link(&subscriber.email));
        let html = digest::render_digest(
            &subscriber.email,
            &matched,
            self.timezone,
            unsubscribe_url.as_deref(),
        );

        match self.deliver(&subscriber.email, DIGEST_SUBJECT, &html).await {
            Ok(status) => {
                tracing::info!(
                    email = %subscriber.email,
                    events = matched.len(),
                    status,
                    "weekly digest sent"
                );
                DigestOutcome::Sent {
                    events: matched.len(),
                    status,
                }
            }
            Err(err) => {
                tracing::error!(email = %subscriber.email, "weekly digest failed: {err}");
                DigestOutcome::Failed(err)
            }
        }
    }

    async fn deliver(&self, to: &str, subject: &str, html: &str) -> Result<u16, DeliveryError> {
        let mut attempt = 1;
        loop {
            match self.mailer.send(to, subject, html).await {
                Ok(status) => return Ok(status),
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                    tracing::warn!(
                        to,
                        attempt,
                        "send failed, retrying in {:?}: {err}",
                        self.policy.retry_delay
                    );
                    sleep(self.policy.retry_delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use serde_json::Value;

    use super::*;
    use crate::db::Catalog;
    use crate::testing::{raw_event, FakeFeed, LogCapture, RecordingMailer};

    struct Harness {
        feed: Arc<FakeFeed>,
        store: Arc<Store>,
        mailer: Arc<RecordingMailer>,
        dispatcher: DigestDispatcher,
    }

    fn harness(events: Vec<Value>, mailer: RecordingMailer, policy: DeliveryPolicy) -> Harness {
        harness_with_feed(FakeFeed::with_events(events), mailer, policy)
    }

    fn harness_with_feed(feed: FakeFeed, mailer: RecordingMailer, policy: DeliveryPolicy) -> Harness {
        let feed = Arc::new(feed);
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let mailer = Arc::new(mailer);
        let cache = FeedCache::new(
            feed.clone(),
            store.clone(),
            ChronoDuration::minutes(60),
            Duration::ZERO,
        );
        let dispatcher =
            DigestDispatcher::new(cache, store.clone(), mailer.clone(), policy, chrono_tz::UTC);
        Harness {
            feed,
            store,
            mailer,
            dispatcher,
        }
    }

    fn dome_and_other_hall() -> Vec<Value> {
        let now = Utc::now();
        vec![
            raw_event("dome", "Dome Night", "The Dome", now + ChronoDuration::days(2), &["Jazz"]),
            raw_event("hall", "Hall Night", "Other Hall", now + ChronoDuration::days(1), &["Rock"]),
        ]
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn no_retry() -> DeliveryPolicy {
        DeliveryPolicy {
            max_attempts: 1,
            retry_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn subscribe_sends_confirmation_and_matching_digest() {
        let h = harness(dome_and_other_hall(), RecordingMailer::new(), no_retry());

        let outcome = h
            .dispatcher
            .subscribe("a@x.com", strings(&["The Dome"]), Vec::new())
            .await
            .expect("subscribe");

        assert_eq!(
            outcome,
            SubscribeOutcome {
                confirmation_sent: true,
                digest_sent: true
            }
        );
        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].subject, CONFIRMATION_SUBJECT);
        assert_eq!(sent[1].subject, DIGEST_SUBJECT);
        assert!(sent[1].html.contains("Dome Night"));
        assert!(!sent[1].html.contains("Hall Night"));
    }

    #[tokio::test]
    async fn duplicate_subscribe_creates_nothing_and_sends_nothing() {
        let h = harness(dome_and_other_hall(), RecordingMailer::new(), no_retry());
        h.store
            .insert_subscriber(&Subscriber::new("a@x.com", strings(&["The Dome"]), Vec::new()))
            .expect("seed");

        let err = h
            .dispatcher
            .subscribe("a@x.com", Vec::new(), strings(&["Rock"]))
            .await
            .expect_err("duplicate");

        assert!(matches!(err, SubscribeError::AlreadySubscribed(email) if email == "a@x.com"));
        assert_eq!(h.store.find_subscribers().expect("list").len(), 1);
        assert_eq!(h.mailer.attempts(), 0);
    }

    #[tokio::test]
    async fn invalid_email_is_refused_before_insert() {
        let h = harness(Vec::new(), RecordingMailer::new(), no_retry());
        let err = h
            .dispatcher
            .subscribe("not-an-address", Vec::new(), Vec::new())
            .await
            .expect_err("invalid");
        assert!(matches!(err, SubscribeError::InvalidEmail(_)));
        assert!(h.store.find_subscribers().expect("list").is_empty());
    }

    #[tokio::test]
    async fn confirmation_failure_does_not_block_digest() {
        let h = harness(dome_and_other_hall(), RecordingMailer::flaky(1), no_retry());

        let outcome = h
            .dispatcher
            .subscribe("a@x.com", strings(&["The Dome"]), Vec::new())
            .await
            .expect("subscribe");

        assert!(!outcome.confirmation_sent);
        assert!(outcome.digest_sent);
        assert!(h.store.find_subscriber("a@x.com").expect("find").is_some());
    }

    #[tokio::test]
    async fn feed_outage_still_keeps_subscription() {
        let h = harness_with_feed(FakeFeed::failing(502), RecordingMailer::new(), no_retry());

        let outcome = h
            .dispatcher
            .subscribe("a@x.com", strings(&["The Dome"]), Vec::new())
            .await
            .expect("subscribe");

        assert!(outcome.confirmation_sent);
        assert!(!outcome.digest_sent);
        assert_eq!(h.store.find_subscribers().expect("list").len(), 1);
    }

    #[tokio::test]
    async fn weekly_run_skips_subscribers_without_preferences() {
        let logs = LogCapture::default();
        let _guard = logs.install();
        let h = harness(dome_and_other_hall(), RecordingMailer::new(), no_retry());
        h.store
            .insert_subscriber(&Subscriber::new("empty@x.com", Vec::new(), Vec::new()))
            .expect("seed");

        let report = h.dispatcher.run_weekly_dispatch().await.expect("run");

        assert_eq!(report.skipped_no_preferences, 1);
        assert_eq!(report.sent, 0);
        assert_eq!(h.mailer.attempts(), 0);
        assert_eq!(logs.count("skipping subscriber: no preferences set"), 1);
    }

    #[tokio::test]
    async fn weekly_run_survives_an_unreadable_subscriber_row() {
        let h = harness(dome_and_other_hall(), RecordingMailer::new(), no_retry());
        h.store
            .insert_subscriber(&Subscriber::new("good@x.com", strings(&["The Dome"]), Vec::new()))
            .expect("seed");
        h.store
            .execute_raw(
                "INSERT INTO subscribers (email, subscribed_at_utc, venues, genres)
                 VALUES ('bad@x.com', '2026-01-01T00:00:00Z', 'not json', '[]')",
            )
            .expect("raw insert");

        let report = h.dispatcher.run_weekly_dispatch().await.expect("run");

        assert_eq!(report.sent, 1);
        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "good@x.com");
    }

    #[tokio::test]
    async fn weekly_run_isolates_failures_per_subscriber() {
        let h = harness(
            dome_and_other_hall(),
            RecordingMailer::rejecting(&["bounce@x.com"]),
            no_retry(),
        );
        for email in ["bounce@x.com", "jazz@x.com", "pop@x.com"] {
            let genres = if email == "pop@x.com" { "Pop" } else { "Jazz" };
            h.store
                .insert_subscriber(&Subscriber::new(email, Vec::new(), strings(&[genres])))
                .expect("seed");
        }

        let report = h.dispatcher.run_weekly_dispatch().await.expect("run");

        assert_eq!(
            report,
            DispatchReport {
                subscribers: 3,
                sent: 1,
                skipped_no_preferences: 0,
                skipped_no_matches: 1,
                failed: 1,
            }
        );
        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "jazz@x.com");
    }

    #[tokio::test]
    async fn repeated_runs_reuse_cache_and_resend() {
        let h = harness(dome_and_other_hall(), RecordingMailer::new(), no_retry());
        h.store
            .insert_subscriber(&Subscriber::new("a@x.com", strings(&["The Dome"]), Vec::new()))
            .expect("seed");

        h.dispatcher.run_weekly_dispatch().await.expect("first");
        h.dispatcher.run_weekly_dispatch().await.expect("second");

        assert_eq!(h.feed.calls(), 1);
        assert_eq!(h.mailer.sent().len(), 2);
    }

    #[tokio::test]
    async fn weekly_run_fails_cleanly_when_feed_is_down() {
        let h = harness_with_feed(FakeFeed::failing(500), RecordingMailer::new(), no_retry());
        h.store
            .insert_subscriber(&Subscriber::new("a@x.com", strings(&["The Dome"]), Vec::new()))
            .expect("seed");

        let err = h.dispatcher.run_weekly_dispatch().await.expect_err("feed down");
        assert!(matches!(err, DispatchError::Upstream(_)));
        assert_eq!(h.mailer.attempts(), 0);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_within_policy() {
        let policy = DeliveryPolicy {
            max_attempts: 3,
            retry_delay: Duration::ZERO,
        };
        let h = harness(dome_and_other_hall(), RecordingMailer::flaky(2), policy);
        h.store
            .insert_subscriber(&Subscriber::new("a@x.com", strings(&["The Dome"]), Vec::new()))
            .expect("seed");

        let report = h.dispatcher.run_weekly_dispatch().await.expect("run");

        assert_eq!(report.sent, 1);
        assert_eq!(h.mailer.attempts(), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let policy = DeliveryPolicy {
            max_attempts: 3,
            retry_delay: Duration::ZERO,
        };
        let h = harness(
            dome_and_other_hall(),
            RecordingMailer::rejecting(&["a@x.com"]),
            policy,
        );
        h.store
            .insert_subscriber(&Subscriber::new("a@x.com", strings(&["The Dome"]), Vec::new()))
            .expect("seed");

        let report = h.dispatcher.run_weekly_dispatch().await.expect("run");

        assert_eq!(report.failed, 1);
        assert_eq!(h.mailer.attempts(), 1);
    }

    #[tokio::test]
    async fn fetch_filters_old_events_and_fills_catalogs() {
        let now = Utc::now();
        let events = vec![
            raw_event("old", "Old", "Old Barn", now - ChronoDuration::days(8), &["Folk"]),
            raw_event("new", "New", "The Dome", now + ChronoDuration::days(1), &["Jazz"]),
        ];
        let h = harness(events, RecordingMailer::new(), no_retry());

        let recent = h.dispatcher.fetch_digest_events(now).await.expect("fetch");

        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "new");
        assert_eq!(
            h.store.list_catalog(Catalog::Venues).expect("venues"),
            strings(&["Old Barn", "The Dome"])
        );
        assert_eq!(
            h.store.list_catalog(Catalog::Tags).expect("tags"),
            strings(&["Folk", "Jazz"])
        );
    }

    #[tokio::test]
    async fn catalog_failure_does_not_block_fetch_or_delivery() {
        let h = harness(dome_and_other_hall(), RecordingMailer::new(), no_retry());
        h.store.execute_raw("DROP TABLE venues").expect("drop venues");
        h.store
            .insert_subscriber(&Subscriber::new("a@x.com", strings(&["The Dome"]), Vec::new()))
            .expect("seed");

        let recent = h
            .dispatcher
            .fetch_digest_events(Utc::now())
            .await
            .expect("fetch");
        assert_eq!(recent.len(), 2);
        assert!(h.store.list_catalog(Catalog::Venues).is_err());

        let report = h.dispatcher.run_weekly_dispatch().await.expect("run");
        assert_eq!(report.sent, 1);
        assert!(h.mailer.sent()[0].html.contains("Dome Night"));
    }

    #[tokio::test]
    async fn test_digest_reports_outcome_for_existing_subscriber() {
        let h = harness(dome_and_other_hall(), RecordingMailer::new(), no_retry());
        h.store
            .insert_subscriber(&Subscriber::new("a@x.com", Vec::new(), strings(&["Pop"])))
            .expect("seed");

        let outcome = h.dispatcher.send_test_digest("a@x.com").await.expect("outcome");
        assert!(matches!(outcome, DigestOutcome::NoMatches));

        let missing = h.dispatcher.send_test_digest("ghost@x.com").await;
        assert!(matches!(missing, Err(DispatchError::NotSubscribed(_))));
    }

    #[tokio::test]
    async fn digest_embeds_unsubscribe_link() {
        let Harness {
            store,
            mailer,
            dispatcher,
            ..
        } = harness(dome_and_other_hall(), RecordingMailer::new(), no_retry());
        let dispatcher = dispatcher
            .with_unsubscribe_link(|email| Some(format!("https://digest.example.com/u/{email}")));
        store
            .insert_subscriber(&Subscriber::new("a@x.com", strings(&["The Dome"]), Vec::new()))
            .expect("seed");

        dispatcher.run_weekly_dispatch().await.expect("run");

        assert!(mailer.sent()[0].html.contains("https://digest.example.com/u/a@x.com"));
    }

    #[tokio::test]
    async fn health_reports_each_dependency() {
        let h = harness(dome_and_other_hall(), RecordingMailer::new(), no_retry());
        let report = h.dispatcher.health().await;
        assert!(report.store_ok);
        assert_eq!(report.digest_events, Some(2));
        assert!(report.is_healthy());

        let down = harness_with_feed(FakeFeed::failing(500), RecordingMailer::new(), no_retry());
        let report = down.dispatcher.health().await;
        assert!(report.feed_error.is_some());
        assert!(!report.is_healthy());
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_record() {
        let h = harness(Vec::new(), RecordingMailer::new(), no_retry());
        h.store
            .insert_subscriber(&Subscriber::new("a@x.com", Vec::new(), Vec::new()))
            .expect("seed");
        assert!(h.dispatcher.unsubscribe("a@x.com").expect("remove"));
        assert!(!h.dispatcher.unsubscribe("a@x.com").expect("again"));
    }
}
