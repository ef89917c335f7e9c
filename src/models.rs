use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const PRICE_NOT_LISTED: &str = "Price not listed";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Subscriber {
    pub email: String,
    pub subscribed_at: DateTime<Utc>,
    pub venues: BTreeSet<String>,
    pub genres: BTreeSet<String>,
}

impl Subscriber {
    pub fn new<V, G>(email: &str, venues: V, genres: G) -> Self
    where
        V: IntoIterator<Item = String>,
        G: IntoIterator<Item = String>,
    {
        Self {
            email: email.trim().to_string(),
            subscribed_at: Utc::now(),
            venues: clean_set(venues),
            genres: clean_set(genres),
        }
    }

    pub fn has_preferences(&self) -> bool {
        !self.venues.is_empty() || !self.genres.is_empty()
    }
}

fn clean_set<I>(values: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = String>,
{
    values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Venue {
    pub name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Event {
    pub id: String,
    pub name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub start_text: Option<String>,
    pub end_time: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub age_limit: Option<String>,
    pub sold_out: bool,
    pub ticket_url: Option<String>,
    pub cover_charge: String,
    pub venue: Venue,
}

impl Event {
    pub fn title(&self) -> String {
        self.name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "Untitled Event".to_string())
    }

    pub fn venue_label(&self) -> String {
        self.venue
            .name
            .clone()
            .unwrap_or_else(|| "Unknown Venue".to_string())
    }
}
