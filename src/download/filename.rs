// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use url::Url;

use crate::feed::{Enclosure, FeedItem};

const MAX_STEM_LENGTH: usize = 100;

/// Local path an item's enclosure is saved to inside `dir`.
///
/// The name is `YYYY-MM-DD-title.ext` when the item carries a date, or
/// just `title.ext`. Items without a usable title fall back to the file
/// name of the enclosure URL. Returns `None` for items without enclosure.
pub fn destination_for(item: &FeedItem, dir: &Path) -> Option<PathBuf> {
    let enclosure = item.enclosure.as_ref()?;

    let mut stem = slug(&item.title);
    if stem.is_empty() {
        stem = url_file_stem(&enclosure.url).map(slug).unwrap_or_default();
    }
    if stem.is_empty() {
        stem = "enclosure".to_string();
    }

    let name = match item.pub_date {
        Some(date) => format!("{}-{}.{}", date.format("%Y-%m-%d"), stem, extension(enclosure)),
        None => format!("{}.{}", stem, extension(enclosure)),
    };
    Some(dir.join(name))
}

/// File extension for an enclosure, from its URL, then its MIME type
pub fn extension(enclosure: &Enclosure) -> String {
    let from_url = last_segment(&enclosure.url)
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| is_media_extension(ext));
    if let Some(ext) = from_url {
        return ext;
    }

    enclosure
        .mime_type
        .as_deref()
        .and_then(mime_to_extension)
        .unwrap_or("mp3")
        .to_string()
}

fn last_segment(url: &Url) -> Option<&str> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
}

fn url_file_stem(url: &Url) -> Option<&str> {
    last_segment(url).map(|name| name.rsplit_once('.').map_or(name, |(stem, _)| stem))
}

/// Keep ASCII alphanumerics, turn every run of anything else into one dash
fn slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }

    let mut out = out.trim_end_matches('-').to_string();
    if out.len() > MAX_STEM_LENGTH {
        // The slug is ASCII, so any byte index is a char boundary
        out.truncate(MAX_STEM_LENGTH);
        if let Some(pos) = out.rfind('-').filter(|&pos| pos > MAX_STEM_LENGTH / 2) {
            out.truncate(pos);
        }
        out = out.trim_end_matches('-').to_string();
    }
    out
}

fn is_media_extension(ext: &str) -> bool {
    matches!(
        ext,
        "mp3" | "m4a" | "mp4" | "m4v" | "aac" | "ogg" | "oga" | "opus" | "wav" | "flac" | "webm"
            | "pdf"
    )
}

fn mime_to_extension(mime: &str) -> Option<&'static str> {
    match mime.to_ascii_lowercase().as_str() {
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("m4a"),
        "video/mp4" => Some("mp4"),
        "audio/aac" => Some("aac"),
        "audio/ogg" => Some("ogg"),
        "audio/opus" => Some("opus"),
        "audio/wav" | "audio/x-wav" => Some("wav"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        "video/webm" | "audio/webm" => Some("webm"),
        "application/pdf" => Some("pdf"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::parse_date;

    fn item(title: &str, date: Option<&str>, enclosure: Option<(&str, Option<&str>)>) -> FeedItem {
        FeedItem {
            title: title.to_string(),
            link: Url::parse("http://x/1").unwrap(),
            description: None,
            enclosure: enclosure.map(|(url, mime)| Enclosure {
                url: Url::parse(url).unwrap(),
                length: None,
                mime_type: mime.map(str::to_string),
            }),
            pub_date: date.and_then(parse_date),
            guid: None,
            permalink: None,
            author: None,
            creator: None,
            categories: vec![],
        }
    }

    #[test]
    fn dated_item_gets_date_prefix() {
        let item = item(
            "Episode 1: The Beginning",
            Some("Mon, 15 Jan 2024 10:00:00 +0000"),
            Some(("http://x/media/ep1.mp3", None)),
        );
        let path = destination_for(&item, Path::new("/downloads")).unwrap();
        assert_eq!(path, PathBuf::from("/downloads/2024-01-15-Episode-1-The-Beginning.mp3"));
    }

    #[test]
    fn undated_item_has_no_prefix() {
        let item = item("A", None, Some(("http://x/1.ogg", None)));
        let path = destination_for(&item, Path::new("d")).unwrap();
        assert_eq!(path, PathBuf::from("d/A.ogg"));
    }

    #[test]
    fn item_without_enclosure_has_no_destination() {
        assert!(destination_for(&item("A", None, None), Path::new("d")).is_none());
    }

    #[test]
    fn empty_title_falls_back_to_url_file_name() {
        let item = item("  ***  ", None, Some(("http://x/media/show-42.m4a?x=1", None)));
        let path = destination_for(&item, Path::new("d")).unwrap();
        assert_eq!(path, PathBuf::from("d/show-42.m4a"));

        let item = self::item("", None, Some(("http://x/", Some("audio/mpeg"))));
        let path = destination_for(&item, Path::new("d")).unwrap();
        assert_eq!(path, PathBuf::from("d/enclosure.mp3"));
    }

    #[test]
    fn extension_falls_back_to_mime_type_then_mp3() {
        let item = item("A", None, Some(("http://x/stream?id=7", Some("audio/x-m4a"))));
        assert_eq!(extension(item.enclosure.as_ref().unwrap()), "m4a");

        let item = self::item("A", None, Some(("http://x/file.php", None)));
        assert_eq!(extension(item.enclosure.as_ref().unwrap()), "mp3");
    }

    #[test]
    fn slug_strips_path_characters_and_truncates() {
        assert_eq!(slug("../../etc/passwd"), "etc-passwd");
        assert_eq!(slug("Über café"), "ber-caf");

        let long = "word ".repeat(40);
        let slugged = slug(&long);
        assert!(slugged.len() <= MAX_STEM_LENGTH);
        assert!(!slugged.ends_with('-'));
    }
}
