use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};

use crate::models::Event;

pub const RECENCY_WINDOW_DAYS: i64 = 7;

/// Venue clause AND genre clause; an empty preference set does not restrict.
pub fn matches(
    event: &Event,
    preferred_venues: &BTreeSet<String>,
    preferred_genres: &BTreeSet<String>,
) -> bool {
    let venue_match = preferred_venues.is_empty()
        || event
            .venue
            .name
            .as_ref()
            .is_some_and(|name| preferred_venues.contains(name));
    let genre_match = preferred_genres.is_empty()
        || event.tags.iter().any(|tag| preferred_genres.contains(tag));
    venue_match && genre_match
}

pub fn match_preferences(
    events: &[Event],
    preferred_venues: &BTreeSet<String>,
    preferred_genres: &BTreeSet<String>,
) -> Vec<Event> {
    events
        .iter()
        .filter(|event| matches(event, preferred_venues, preferred_genres))
        .cloned()
        .collect()
}

/// Keeps events starting strictly after `now - 7 days`. Events without a
/// parseable start time are dropped.
pub fn filter_recent(events: Vec<Event>, now: DateTime<Utc>) -> Vec<Event> {
    let cutoff = now - Duration::days(RECENCY_WINDOW_DAYS);
    let total = events.len();
    let recent: Vec<Event> = events
        .into_iter()
        .filter(|event| event.start_time.is_some_and(|start| start > cutoff))
        .collect();
    if recent.len() < total {
        tracing::debug!(
            dropped = total - recent.len(),
            "filtered out events older than the recency window"
        );
    }
    recent
}
