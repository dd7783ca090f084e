// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Strict RSS state machine turning document tokens into feed items.

use futures::Stream;
use url::Url;

use crate::error::{FeedError, ParseErrorKind};

use super::item::{Channel, Enclosure, FeedItem, non_empty, parse_date};
use super::token::{LexError, Token, TokenSource};

const DUBLIN_CORE_NAMESPACE: &str = "http://purl.org/dc/elements/1.1/";

/// Where the parser is in the document
#[derive(Debug, Clone, PartialEq)]
pub enum ParseState {
    AwaitingDocumentStart,
    AwaitingTag,
    ReadingItem,
    AwaitingClosingDocumentTag,
    AwaitingEndOfDocument,
    Completed,
    Failed(FeedError),
}

impl ParseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ParseState::Completed | ParseState::Failed(_))
    }
}

/// Which tag `AwaitingTag` is currently waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Rss,
    Channel,
    ChannelContent,
}

#[derive(Debug, Default)]
struct ItemBuilder {
    title: Option<String>,
    link: Option<String>,
    description: Option<String>,
    enclosure_url: Option<String>,
    enclosure_length: Option<u64>,
    enclosure_type: Option<String>,
    has_enclosure: bool,
    guid: Option<String>,
    guid_is_permalink: bool,
    pub_date: Option<String>,
    author: Option<String>,
    creator: Option<String>,
    categories: Vec<String>,
}

impl ItemBuilder {
    fn open_child(&mut self, name: &str, attributes: &[(String, String)]) {
        let attribute = |key: &str| {
            attributes
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.trim())
        };

        match name {
            "enclosure" => {
                self.has_enclosure = true;
                self.enclosure_url = attribute("url").map(str::to_string);
                self.enclosure_length = attribute("length").and_then(|l| l.parse().ok());
                self.enclosure_type = attribute("type").and_then(non_empty);
            }
            "guid" => {
                self.guid_is_permalink =
                    attribute("isPermaLink").is_some_and(|v| v.eq_ignore_ascii_case("true"));
            }
            _ => {}
        }
    }

    fn close_child(&mut self, name: &str, text: &str, creator_tag: Option<&str>) {
        match name {
            "title" => self.title = non_empty(text),
            "link" => self.link = non_empty(text),
            "description" => self.description = non_empty(text),
            "author" => self.author = non_empty(text),
            "category" => self.categories.extend(non_empty(text)),
            "guid" => self.guid = non_empty(text),
            "pubDate" => self.pub_date = non_empty(text),
            _ if creator_tag == Some(name) => self.creator = non_empty(text),
            _ => {}
        }
    }

    fn build(self) -> Result<FeedItem, String> {
        let link = self.link.ok_or_else(|| "item has no link".to_string())?;
        let link = Url::parse(&link).map_err(|e| format!("invalid item link '{link}': {e}"))?;

        let enclosure = if self.has_enclosure {
            let url = self
                .enclosure_url
                .ok_or_else(|| "enclosure has no url".to_string())?;
            let url =
                Url::parse(&url).map_err(|e| format!("invalid enclosure url '{url}': {e}"))?;
            Some(Enclosure {
                url,
                length: self.enclosure_length,
                mime_type: self.enclosure_type,
            })
        } else {
            None
        };

        let permalink = self
            .guid
            .as_deref()
            .filter(|_| self.guid_is_permalink)
            .and_then(|guid| Url::parse(guid).ok());

        Ok(FeedItem {
            title: self.title.unwrap_or_default(),
            link,
            description: self.description,
            enclosure,
            pub_date: self.pub_date.as_deref().and_then(parse_date),
            guid: self.guid,
            permalink,
            author: self.author,
            creator: self.creator,
            categories: self.categories,
        })
    }
}

/// Pull parser producing feed items lazily from a [`TokenSource`].
///
/// Items come out in document order as soon as their closing tag is seen.
/// Once the parser reaches [`ParseState::Completed`] or
/// [`ParseState::Failed`] it never produces another item; a fresh parser
/// over a fresh source is needed to try again.
pub struct FeedParser<S> {
    source: S,
    state: ParseState,
    expect: Expect,
    channel: Channel,
    creator_tag: Option<String>,
    /// Tags opened below `<channel>` (metadata) or from `<item>` downwards
    open_tags: Vec<String>,
    text: String,
    item: ItemBuilder,
}

impl<S: TokenSource> FeedParser<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            state: ParseState::AwaitingDocumentStart,
            expect: Expect::Rss,
            channel: Channel::default(),
            creator_tag: None,
            open_tags: Vec::new(),
            text: String::new(),
            item: ItemBuilder::default(),
        }
    }

    pub fn state(&self) -> &ParseState {
        &self.state
    }

    /// Channel metadata seen so far
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn into_channel(self) -> Channel {
        self.channel
    }

    /// Pull tokens until the next item is complete.
    ///
    /// Returns `Ok(None)` once the document ended correctly. After a
    /// failure every further call returns the same error.
    pub async fn next_item(&mut self) -> Result<Option<FeedItem>, FeedError> {
        loop {
            match &self.state {
                ParseState::Completed => return Ok(None),
                ParseState::Failed(error) => return Err(error.clone()),
                _ => {}
            }

            let token = match self.source.next_token().await {
                Ok(token) => token,
                Err(LexError::Transport(error)) => {
                    return Err(self.fail(FeedError::Network(error)));
                }
                Err(LexError::Malformed(detail)) => {
                    let error = self.unexpected(detail);
                    return Err(self.fail(error));
                }
            };

            if let Some(item) = self.step(token)? {
                return Ok(Some(item));
            }
        }
    }

    /// Consume the parser as a stream of items ending after the first error
    pub fn into_stream(self) -> impl Stream<Item = Result<FeedItem, FeedError>> {
        futures::stream::try_unfold(self, |mut parser| async move {
            let item = parser.next_item().await?;
            Ok(item.map(|item| (item, parser)))
        })
    }

    fn step(&mut self, token: Token) -> Result<Option<FeedItem>, FeedError> {
        let result = match self.state {
            ParseState::AwaitingDocumentStart => self.await_document_start(token),
            ParseState::AwaitingTag => self.await_tag(token),
            ParseState::ReadingItem => self.read_item(token),
            ParseState::AwaitingClosingDocumentTag => self.await_closing_tag(token),
            ParseState::AwaitingEndOfDocument => self.await_end_of_document(token),
            ParseState::Completed | ParseState::Failed(_) => Err(FeedError::Internal {
                detail: format!("token {} after parsing ended", token.describe()),
            }),
        };

        result.map_err(|error| self.fail(error))
    }

    fn await_document_start(&mut self, token: Token) -> Result<Option<FeedItem>, FeedError> {
        match token {
            Token::StartDocument => self.transition(ParseState::AwaitingTag),
            t if t.is_ignorable() => {}
            t => return Err(self.unexpected(format!("found {}", t.describe()))),
        }
        Ok(None)
    }

    fn await_tag(&mut self, token: Token) -> Result<Option<FeedItem>, FeedError> {
        if self.open_tags.is_empty() && token.is_ignorable() {
            return Ok(None);
        }

        match (self.expect, token) {
            (Expect::Rss, Token::Open { name, attributes }) if name == "rss" => {
                self.creator_tag = attributes
                    .iter()
                    .find(|(key, value)| key.starts_with("xmlns:") && value == DUBLIN_CORE_NAMESPACE)
                    .map(|(key, _)| format!("{}:creator", &key["xmlns:".len()..]));
                self.expect = Expect::Channel;
            }
            (Expect::Channel, Token::Open { name, .. }) if name == "channel" => {
                self.expect = Expect::ChannelContent;
            }
            (Expect::ChannelContent, Token::Open { name, .. })
                if self.open_tags.is_empty() && name == "item" =>
            {
                self.item = ItemBuilder::default();
                self.open_tags.push(name);
                self.text.clear();
                self.transition(ParseState::ReadingItem);
            }
            (Expect::ChannelContent, Token::Open { name, .. }) => {
                self.open_tags.push(name);
                self.text.clear();
            }
            (Expect::ChannelContent, Token::Text(text)) if !self.open_tags.is_empty() => {
                self.text.push_str(&text);
            }
            (Expect::ChannelContent, Token::Comment) => {}
            (Expect::ChannelContent, Token::Close { name }) if self.open_tags.is_empty() => {
                if name != "channel" {
                    return Err(self.unexpected(format!("found </{name}> inside <channel>")));
                }
                self.transition(ParseState::AwaitingClosingDocumentTag);
            }
            (Expect::ChannelContent, Token::Close { name }) => {
                self.channel.apply(&self.open_tags, self.text.trim());
                self.text.clear();
                let open = self.open_tags.pop();
                if open.as_deref() != Some(name.as_str()) {
                    return Err(self.unexpected(format!("found </{name}> inside <channel>")));
                }
            }
            (expect, token) => {
                let wanted = match expect {
                    Expect::Rss => "<rss>",
                    Expect::Channel => "<channel>",
                    Expect::ChannelContent => "<item> or </channel>",
                };
                return Err(self.unexpected(format!(
                    "expected {wanted}, found {}",
                    token.describe()
                )));
            }
        }
        Ok(None)
    }

    fn read_item(&mut self, token: Token) -> Result<Option<FeedItem>, FeedError> {
        match token {
            Token::Open { name, attributes } => {
                if self.open_tags.len() == 1 {
                    self.item.open_child(&name, &attributes);
                }
                self.open_tags.push(name);
                self.text.clear();
                Ok(None)
            }
            Token::Text(text) => {
                if self.open_tags.is_empty() {
                    return Err(FeedError::Internal {
                        detail: "text while reading an item with no open tag".to_string(),
                    });
                }
                self.text.push_str(&text);
                Ok(None)
            }
            Token::Comment => Ok(None),
            Token::Close { name } => {
                let Some(open) = self.open_tags.pop() else {
                    return Err(FeedError::Internal {
                        detail: format!("</{name}> while reading an item with no open tag"),
                    });
                };
                if open != name {
                    return Err(self.unexpected(format!("expected </{open}>, found </{name}>")));
                }

                if self.open_tags.len() == 1 {
                    let text = std::mem::take(&mut self.text);
                    self.item
                        .close_child(&name, text.trim(), self.creator_tag.as_deref());
                } else {
                    self.text.clear();
                }

                if !self.open_tags.is_empty() {
                    return Ok(None);
                }

                let item = std::mem::take(&mut self.item)
                    .build()
                    .map_err(|detail| self.unexpected(detail))?;
                self.transition(ParseState::AwaitingTag);
                Ok(Some(item))
            }
            t => Err(self.unexpected(format!("found {} inside <item>", t.describe()))),
        }
    }

    fn await_closing_tag(&mut self, token: Token) -> Result<Option<FeedItem>, FeedError> {
        match token {
            Token::Close { name } if name == "rss" => {
                self.transition(ParseState::AwaitingEndOfDocument)
            }
            t if t.is_ignorable() => {}
            t => {
                return Err(self.unexpected(format!("expected </rss>, found {}", t.describe())));
            }
        }
        Ok(None)
    }

    fn await_end_of_document(&mut self, token: Token) -> Result<Option<FeedItem>, FeedError> {
        match token {
            Token::EndOfInput => self.transition(ParseState::Completed),
            t if t.is_ignorable() => {}
            t => {
                return Err(self.unexpected(format!("found {} after </rss>", t.describe())));
            }
        }
        Ok(None)
    }

    /// A failure attributed to the wait-state the parser is currently in
    fn unexpected(&self, detail: impl Into<String>) -> FeedError {
        let kind = match self.state {
            ParseState::AwaitingDocumentStart => ParseErrorKind::WaitingForDocumentStart,
            ParseState::AwaitingTag => ParseErrorKind::WaitingForTag,
            ParseState::ReadingItem => ParseErrorKind::ReadingItemInformation,
            ParseState::AwaitingClosingDocumentTag => ParseErrorKind::WaitingForClosingTag,
            ParseState::AwaitingEndOfDocument => ParseErrorKind::WaitingForEndOfDocument,
            ParseState::Completed | ParseState::Failed(_) => {
                return FeedError::Internal {
                    detail: detail.into(),
                };
            }
        };
        FeedError::parse(kind, detail)
    }

    fn transition(&mut self, next: ParseState) {
        tracing::trace!(from = ?self.state, to = ?next, "feed parser transition");
        self.state = next;
    }

    fn fail(&mut self, error: FeedError) -> FeedError {
        if let FeedError::Internal { detail } = &error {
            tracing::error!(state = ?self.state, %detail, "feed parser reached an unreachable state");
        } else {
            tracing::debug!(state = ?self.state, %error, "feed parsing failed");
        }
        self.state = ParseState::Failed(error.clone());
        error
    }
}
