//! Fakes for the feed and mail collaborators, plus a log capture.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::feed::{FeedSource, UpstreamError};
use crate::mailer::{validate_address, DeliveryError, Mailer};

pub enum FakeResponse {
    Events(Vec<Value>),
    Status(u16),
}

pub struct FakeFeed {
    response: Mutex<FakeResponse>,
    calls: AtomicUsize,
    latency: Duration,
}

impl FakeFeed {
    pub fn with_events(events: Vec<Value>) -> Self {
        Self {
            response: Mutex::new(FakeResponse::Events(events)),
            calls: AtomicUsize::new(0),
            latency: Duration::ZERO,
        }
    }

    pub fn failing(status: u16) -> Self {
        Self {
            response: Mutex::new(FakeResponse::Status(status)),
            calls: AtomicUsize::new(0),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn respond_with(&self, response: FakeResponse) {
        *self.response.lock().expect("fake feed poisoned") = response;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedSource for FakeFeed {
    fn identity(&self) -> &str {
        "fake-feed"
    }

    async fn fetch(&self) -> Result<Vec<Value>, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match &*self.response.lock().expect("fake feed poisoned") {
            FakeResponse::Events(events) => Ok(events.clone()),
            FakeResponse::Status(status) => Err(UpstreamError::Status {
                status: *status,
                body: "unavailable".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Records every accepted message; addresses in `rejecting` fail with a 400,
/// and the first `transient_failures` sends fail with a 503.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
    attempts: AtomicUsize,
    rejecting: HashSet<String>,
    transient_failures: AtomicUsize,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(addresses: &[&str]) -> Self {
        Self {
            rejecting: addresses.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn flaky(transient_failures: usize) -> Self {
        Self {
            transient_failures: AtomicUsize::new(transient_failures),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().expect("mailer poisoned").clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<u16, DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        validate_address(to)?;
        if self.rejecting.contains(to) {
            return Err(DeliveryError::Rejected {
                status: 400,
                body: "rejected".to_string(),
            });
        }
        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(DeliveryError::Rejected {
                status: 503,
                body: "try later".to_string(),
            });
        }
        self.sent.lock().expect("mailer poisoned").push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            html: html.to_string(),
        });
        Ok(202)
    }
}

pub fn raw_event(id: &str, name: &str, venue: &str, start: DateTime<Utc>, tags: &[&str]) -> Value {
    json!({
        "id": id,
        "name": name,
        "start_time": start.to_rfc3339(),
        "tags": tags,
        "custom_fields": { "coverCharge": "200 NOK" },
        "place": { "name": venue, "address": "Storgata 1", "city": "Oslo" },
    })
}

/// Plain-text copy of everything logged on the current thread while the
/// guard from [`LogCapture::install`] is alive.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    /// Number of logged lines containing `needle`.
    pub fn count(&self, needle: &str) -> usize {
        let bytes = self.0.lock().expect("log buffer poisoned").clone();
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter(|line| line.contains(needle))
            .count()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("log buffer poisoned").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
