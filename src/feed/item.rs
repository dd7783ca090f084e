// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use url::Url;

/// A single entry of a feed, emitted once its `<item>` element closed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub title: String,
    pub link: Url,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enclosure: Option<Enclosure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pub_date: Option<DateTime<FixedOffset>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    /// The guid, when the feed declares it to be a permalink
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permalink: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Dublin Core creator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

/// Media file attached to an item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enclosure {
    pub url: Url,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Channel-level metadata collected while the parser waits for items
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Channel {
    pub title: Option<String>,
    pub link: Option<Url>,
    pub description: Option<String>,
    pub language: Option<String>,
    pub copyright: Option<String>,
    pub managing_editor: Option<String>,
    pub web_master: Option<String>,
    pub pub_date: Option<DateTime<FixedOffset>>,
    pub last_build_date: Option<DateTime<FixedOffset>>,
    pub categories: Vec<String>,
    /// Minutes the channel may be cached before refreshing
    pub ttl: Option<u32>,
    pub image_url: Option<Url>,
    pub image_description: Option<String>,
}

impl Channel {
    /// Record the text of a closed element, given the path of open tags below `<channel>`
    pub(crate) fn apply(&mut self, path: &[String], text: &str) {
        match path {
            [tag] => match tag.as_str() {
                "title" => self.title = non_empty(text),
                "link" => self.link = Url::parse(text).ok(),
                "description" => self.description = non_empty(text),
                "language" => self.language = non_empty(text),
                "copyright" => self.copyright = non_empty(text),
                "managingEditor" => self.managing_editor = non_empty(text),
                "webMaster" => self.web_master = non_empty(text),
                "pubDate" => self.pub_date = parse_date(text),
                "lastBuildDate" => self.last_build_date = parse_date(text),
                "category" => self.categories.extend(non_empty(text)),
                "ttl" => self.ttl = text.parse().ok(),
                _ => {}
            },
            [parent, tag] if parent == "image" => match tag.as_str() {
                "url" => self.image_url = Url::parse(text).ok(),
                "description" => self.image_description = non_empty(text),
                _ => {}
            },
            _ => {}
        }
    }
}

pub(crate) fn non_empty(text: &str) -> Option<String> {
    Some(text.to_string()).filter(|s| !s.is_empty())
}

/// Parse an RSS date, accepting common deviations from RFC 2822
pub fn parse_date(date_str: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(date_str) {
        return Some(dt);
    }

    let formats = [
        "%a, %d %b %Y %H:%M:%S %z",
        "%d %b %Y %H:%M:%S %z",
        "%Y-%m-%dT%H:%M:%S%:z",
        "%Y-%m-%d %H:%M:%S %z",
    ];

    formats
        .iter()
        .find_map(|format| DateTime::parse_from_str(date_str, format).ok())
        .or_else(|| DateTime::parse_from_rfc3339(date_str).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(tags: &[&str]) -> Vec<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn parse_date_accepts_rfc2822() {
        let dt = parse_date("Mon, 01 Jan 2024 12:00:00 +0000").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-01-01T12:00:00+00:00");
    }

    #[test]
    fn parse_date_accepts_iso_format() {
        assert!(parse_date("2024-01-01T12:00:00+02:00").is_some());
        assert!(parse_date("2024-01-01 12:00:00 +0200").is_some());
    }

    #[test]
    fn parse_date_rejects_garbage() {
        assert!(parse_date("yesterday").is_none());
    }

    #[test]
    fn channel_records_top_level_fields() {
        let mut channel = Channel::default();
        channel.apply(&path(&["title"]), "Il Ribelle");
        channel.apply(&path(&["link"]), "https://example.com/");
        channel.apply(&path(&["category"]), "news");
        channel.apply(&path(&["category"]), "politics");
        channel.apply(&path(&["ttl"]), "60");

        assert_eq!(channel.title.as_deref(), Some("Il Ribelle"));
        assert_eq!(channel.link.unwrap().as_str(), "https://example.com/");
        assert_eq!(channel.categories, vec!["news", "politics"]);
        assert_eq!(channel.ttl, Some(60));
    }

    #[test]
    fn channel_records_image_fields_only_under_image() {
        let mut channel = Channel::default();
        channel.apply(&path(&["image", "url"]), "https://example.com/logo.png");
        channel.apply(&path(&["other", "url"]), "https://example.com/ignored.png");
        channel.apply(&path(&["image", "description"]), "Logo");

        assert_eq!(
            channel.image_url.unwrap().as_str(),
            "https://example.com/logo.png"
        );
        assert_eq!(channel.image_description.as_deref(), Some("Logo"));
    }

    #[test]
    fn channel_ignores_unknown_tags() {
        let mut channel = Channel::default();
        channel.apply(&path(&["generator"]), "WordPress");
        assert_eq!(channel, Channel::default());
    }
}
