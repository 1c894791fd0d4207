//! Core domain model shared by the fetch, extraction, pipeline and notification crates.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "xtrobe-core";

/// Wire format of launch timestamps accepted by the notification scheduler (local time, no offset).
pub const LAUNCH_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const NO_TITLE: &str = "No Title";
pub const NO_LINK: &str = "#";
pub const NO_DESCRIPTION: &str = "No Description";

/// One fetchable unit of a source, built by the pipeline before any request is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRef {
    pub source_id: String,
    pub index: u32,
    pub url: String,
}

impl PageRef {
    pub fn new(source_id: impl Into<String>, index: u32, url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            index,
            url: url.into(),
        }
    }
}

/// Raw HTML body returned by a successful page fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPage {
    pub page: PageRef,
    pub final_url: String,
    pub status: u16,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

/// One candidate rendition of an article image. Empty strings mean the markup had no value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageVariant {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub srcset: String,
    #[serde(default)]
    pub sizes: String,
    #[serde(default)]
    pub alt: String,
}

impl ImageVariant {
    pub fn is_empty(&self) -> bool {
        self.url.is_empty() && self.srcset.is_empty() && self.sizes.is_empty() && self.alt.is_empty()
    }
}

/// Structured output of a record extractor.
///
/// `title` and `link` are always populated; extractors fall back to [`NO_TITLE`] and
/// [`NO_LINK`] instead of dropping the record. Source-specific values (`eventDate`,
/// `launchTime`, ...) live in `extra` and serialize flattened next to the common fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub source_id: String,
    pub title: String,
    pub link: String,
    pub description: String,
    #[serde(default)]
    pub images: Vec<ImageVariant>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl Record {
    /// A record with every common field set to its sentinel.
    pub fn placeholder(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            title: NO_TITLE.to_string(),
            link: NO_LINK.to_string(),
            description: NO_DESCRIPTION.to_string(),
            images: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }
}

/// A one-shot reminder owned by the scheduler until it fires or is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationTask {
    pub id: Uuid,
    pub recipient: String,
    pub title: String,
    /// The timestamp exactly as the caller sent it; echoed back in the rendered body.
    pub fire_at_text: String,
    pub fire_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl NotificationTask {
    pub fn subject(&self) -> String {
        format!("Upcoming Launch: {}", self.title)
    }

    pub fn body(&self) -> String {
        format!(
            "Reminder: {} is launching at {}!",
            self.title, self.fire_at_text
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_uses_sentinels() {
        let record = Record::placeholder("space-news");
        assert_eq!(record.title, NO_TITLE);
        assert_eq!(record.link, NO_LINK);
        assert_eq!(record.description, NO_DESCRIPTION);
        assert!(record.images.is_empty());
    }

    #[test]
    fn extras_serialize_flattened_in_camel_case() {
        let record = Record::placeholder("astronomy").with_extra("eventDate", "Jan 3");
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["sourceId"], "astronomy");
        assert_eq!(value["eventDate"], "Jan 3");
        assert_eq!(value["title"], "No Title");
        assert!(value.get("extra").is_none());
    }

    #[test]
    fn notification_renders_fixed_template() {
        let task = NotificationTask {
            id: Uuid::new_v4(),
            recipient: "a@x.com".into(),
            title: "Launch X".into(),
            fire_at_text: "2030-01-01 10:00:00".into(),
            fire_at: Utc::now(),
            registered_at: Utc::now(),
        };
        assert_eq!(task.subject(), "Upcoming Launch: Launch X");
        assert_eq!(
            task.body(),
            "Reminder: Launch X is launching at 2030-01-01 10:00:00!"
        );
    }
}
