use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::{Event, Venue, PRICE_NOT_LISTED};

/// Upstream event record. Every field is optional and a field of the wrong
/// JSON type reads as absent, so deserializing a JSON object never fails.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawEvent {
    #[serde(deserialize_with = "lenient")]
    pub id: Option<Value>,
    #[serde(deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub start_time: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub tags: Option<Vec<Value>>,
    #[serde(deserialize_with = "lenient")]
    pub custom_fields: Option<RawCustomFields>,
    #[serde(deserialize_with = "lenient")]
    pub place: Option<RawPlace>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawCustomFields {
    #[serde(deserialize_with = "lenient")]
    pub end_time: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub age: Option<Value>,
    #[serde(rename = "soldOut", deserialize_with = "lenient")]
    pub sold_out: Option<bool>,
    #[serde(rename = "ticketUrl", deserialize_with = "lenient")]
    pub ticket_url: Option<String>,
    #[serde(rename = "coverCharge", deserialize_with = "lenient")]
    pub cover_charge: Option<Value>,
    #[serde(deserialize_with = "lenient")]
    pub cover: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawPlace {
    #[serde(deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub address: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub city: Option<String>,
}

impl RawEvent {
    pub fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or_default()
    }
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

pub fn normalize(raw: RawEvent) -> Event {
    let custom = raw.custom_fields.unwrap_or_default();
    let place = raw.place.unwrap_or_default();

    let name = raw.name.and_then(non_blank);
    let start_text = raw.start_time.and_then(non_blank);
    let start_time = start_text.as_deref().and_then(parse_timestamp);
    let venue = Venue {
        name: place.name.and_then(non_blank),
        address: place.address.and_then(non_blank),
        city: place.city.and_then(non_blank),
    };

    let cover_charge = [custom.cover_charge.as_ref(), custom.cover.as_ref()]
        .into_iter()
        .flatten()
        .find_map(scalar_text)
        .unwrap_or_else(|| PRICE_NOT_LISTED.to_string());

    let id = raw
        .id
        .as_ref()
        .and_then(scalar_text)
        .unwrap_or_else(|| derived_id(name.as_deref(), start_text.as_deref(), venue.name.as_deref()));

    Event {
        id,
        name,
        start_time,
        start_text,
        end_time: custom.end_time.as_deref().and_then(parse_timestamp),
        tags: clean_tags(raw.tags.unwrap_or_default()),
        age_limit: custom.age.as_ref().and_then(scalar_text),
        sold_out: custom.sold_out.unwrap_or(false),
        ticket_url: custom.ticket_url.and_then(non_blank),
        cover_charge,
        venue,
    }
}

pub fn normalize_all(payload: Vec<Value>) -> Vec<Event> {
    payload
        .into_iter()
        .map(|value| normalize(RawEvent::from_value(value)))
        .collect()
}

/// Parses RFC 3339, offset-bearing or naive ISO 8601 and bare dates.
/// Naive values are taken as UTC.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let text = input.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f %z"] {
        if let Ok(dt) = DateTime::parse_from_str(text, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    let naive_text = text.strip_suffix('Z').unwrap_or(text);
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(naive_text, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => non_blank(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn clean_tags(values: Vec<Value>) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for value in values {
        let tag = match value {
            Value::String(text) => non_blank(text),
            _ => None,
        };
        if let Some(tag) = tag {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
    }
    tags
}

fn derived_id(name: Option<&str>, start: Option<&str>, venue: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(start.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(venue.unwrap_or("").as_bytes());
    format!("{:x}", hasher.finalize())
}
