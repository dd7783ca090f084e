// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One fetch-and-parse run of a feed document.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::FeedError;
use crate::feed::{BodyReader, Channel, FeedItem, FeedParser, XmlTokenSource};
use crate::http::{ByteStream, HttpClient};
use crate::progress::{NoopReporter, ProgressEvent, SharedProgressReporter};
use crate::transport::TransportError;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a feed session for cancellation and progress events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "feed#{}", self.0)
    }
}

/// A fully parsed feed document
#[derive(Debug, Clone, PartialEq)]
pub struct FeedDocument {
    pub channel: Channel,
    /// Items in document order
    pub items: Vec<FeedItem>,
}

/// Parser reading directly from a network body
pub type BodyParser = FeedParser<XmlTokenSource<BodyReader>>;

/// Fetches and parses a single feed, with cooperative cancellation.
///
/// A transient disconnection (see [`TransportError::is_retryable`]) makes
/// [`FeedSession::start`] fetch the document once more from the beginning.
/// Every other failure is terminal.
pub struct FeedSession<C> {
    id: SessionId,
    client: C,
    cancel: CancellationToken,
    retry_disconnects: bool,
    reporter: SharedProgressReporter,
}

impl<C: HttpClient> FeedSession<C> {
    pub fn new(client: C) -> Self {
        Self {
            id: SessionId::next(),
            client,
            cancel: CancellationToken::new(),
            retry_disconnects: true,
            reporter: NoopReporter::shared(),
        }
    }

    pub fn with_reporter(mut self, reporter: SharedProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Enable or disable the single automatic re-fetch after a transient disconnection
    pub fn with_retry(mut self, retry_disconnects: bool) -> Self {
        self.retry_disconnects = retry_disconnects;
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Stop the session at its next read
    pub fn cancel(&self) {
        tracing::debug!(session = %self.id, "feed session cancelled");
        self.cancel.cancel();
    }

    /// Token that cancels this session when triggered
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Open the document and return a parser pulling from the live body.
    ///
    /// Items can be consumed while the document is still downloading. No
    /// retry happens on this path.
    pub async fn open(&self, url: &str) -> Result<BodyParser, FeedError> {
        let url = Url::parse(url)?;
        if self.cancel.is_cancelled() {
            return Err(TransportError::OperationCanceled.into());
        }

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            response = self.client.get_stream(url.as_str()) => Some(response),
        };
        let response = response
            .ok_or(TransportError::OperationCanceled)??
            .ensure_success()?;

        let body = cancellable(response.body, self.cancel.clone());
        Ok(FeedParser::new(XmlTokenSource::from_stream(body)))
    }

    /// Fetch and parse the whole document
    pub async fn start(&self, url: &str) -> Result<FeedDocument, FeedError> {
        let result = match self.run_once(url).await {
            Err(FeedError::Network(error)) if self.retry_disconnects && error.is_retryable() => {
                tracing::warn!(session = %self.id, url, %error, "feed connection dropped, fetching again");
                self.reporter.report(ProgressEvent::FetchRetrying {
                    session: self.id,
                    url: url.to_string(),
                    error,
                });
                self.run_once(url).await
            }
            other => other,
        };

        match &result {
            Ok(document) => {
                tracing::info!(session = %self.id, url, items = document.items.len(), "feed parsed");
                self.reporter.report(ProgressEvent::FeedCompleted {
                    session: self.id,
                    item_count: document.items.len(),
                });
            }
            Err(error) => {
                tracing::warn!(session = %self.id, url, %error, "feed failed");
                self.reporter.report(ProgressEvent::FeedFailed {
                    session: self.id,
                    error: error.clone(),
                });
            }
        }

        result
    }

    async fn run_once(&self, url: &str) -> Result<FeedDocument, FeedError> {
        tracing::debug!(session = %self.id, url, "fetching feed");
        self.reporter.report(ProgressEvent::FetchingFeed {
            session: self.id,
            url: url.to_string(),
        });

        let mut parser = self.open(url).await?;
        let mut items = Vec::new();
        while let Some(item) = parser.next_item().await? {
            self.reporter.report(ProgressEvent::ItemParsed {
                session: self.id,
                item: item.clone(),
            });
            items.push(item);
        }

        Ok(FeedDocument {
            channel: parser.into_channel(),
            items,
        })
    }
}

/// End the body with `OperationCanceled` once `cancel` fires
fn cancellable(body: ByteStream, cancel: CancellationToken) -> ByteStream {
    Box::pin(futures::stream::unfold(
        Some((body, cancel)),
        |state| async move {
            let (mut body, cancel) = state?;
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                chunk = body.next() => Some(chunk),
            };

            match next {
                None => Some((Err(TransportError::OperationCanceled), None)),
                Some(chunk) => chunk.map(|chunk| (chunk, Some((body, cancel)))),
            }
        },
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use crate::progress::RecordingReporter;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    pub(crate) const FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Test</title>
    <item><title>A</title><link>http://x/1</link><enclosure url="http://x/1.mp3" length="3" type="audio/mpeg"/></item>
    <item><title>B</title><link>http://x/2</link></item>
  </channel>
</rss>
"#;

    /// One scripted exchange of [`ScriptedClient`]
    pub(crate) enum Exchange {
        Fails(TransportError),
        Status(u16),
        /// Body chunks, optionally hanging forever after the last one
        Body {
            chunks: Vec<Result<Bytes, TransportError>>,
            hang: bool,
        },
        /// A complete body shorter than its declared length
        Truncated { body: &'static [u8], declared: u64 },
    }

    impl Exchange {
        pub(crate) fn body(text: &str) -> Self {
            Exchange::Body {
                chunks: vec![Ok(Bytes::from(text.to_string()))],
                hang: false,
            }
        }

        pub(crate) fn cut_at(text: &str, at: usize, error: TransportError) -> Self {
            Exchange::Body {
                chunks: vec![Ok(Bytes::from(text[..at].to_string())), Err(error)],
                hang: false,
            }
        }
    }

    /// HTTP client replaying scripted exchanges in order
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedClient {
        exchanges: Arc<Mutex<VecDeque<Exchange>>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedClient {
        pub(crate) fn new(exchanges: Vec<Exchange>) -> Self {
            Self {
                exchanges: Arc::new(Mutex::new(exchanges.into())),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedClient {
        async fn get_stream(&self, _url: &str) -> Result<HttpResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let exchange = self.exchanges.lock().unwrap().pop_front();

            match exchange {
                None => Err(TransportError::ConnectionRefused),
                Some(Exchange::Fails(error)) => Err(error),
                Some(Exchange::Status(status)) => Ok(HttpResponse {
                    status,
                    content_length: None,
                    body: Box::pin(futures::stream::empty()),
                }),
                Some(Exchange::Truncated { body, declared }) => Ok(HttpResponse {
                    status: 200,
                    content_length: Some(declared),
                    body: Box::pin(futures::stream::iter(vec![Ok(Bytes::from_static(body))])),
                }),
                Some(Exchange::Body { chunks, hang }) => {
                    let content_length = chunks
                        .iter()
                        .map(|c| c.as_ref().map_or(0, |b| b.len() as u64))
                        .sum::<u64>();
                    let content_length = chunks.iter().all(Result::is_ok).then_some(content_length);
                    let stream = futures::stream::iter(chunks);
                    let body: ByteStream = if hang {
                        Box::pin(stream.chain(futures::stream::pending()))
                    } else {
                        Box::pin(stream)
                    };
                    Ok(HttpResponse {
                        status: 200,
                        content_length,
                        body,
                    })
                }
            }
        }
    }

    fn titles(document: &FeedDocument) -> Vec<&str> {
        document.items.iter().map(|i| i.title.as_str()).collect()
    }

    #[tokio::test]
    async fn start_returns_items_in_order() {
        let session = FeedSession::new(ScriptedClient::new(vec![Exchange::body(FEED)]));
        let document = session.start("http://x/feed.xml").await.unwrap();

        assert_eq!(titles(&document), vec!["A", "B"]);
        assert_eq!(document.channel.title.as_deref(), Some("Test"));
        assert_eq!(
            document.items[0].enclosure.as_ref().unwrap().url.as_str(),
            "http://x/1.mp3"
        );
    }

    #[tokio::test]
    async fn retryable_disconnect_refetches_same_items() {
        let uninterrupted = FeedSession::new(ScriptedClient::new(vec![Exchange::body(FEED)]))
            .start("http://x/feed.xml")
            .await
            .unwrap();

        let client = ScriptedClient::new(vec![
            Exchange::cut_at(FEED, 150, TransportError::Disconnected { retryable: true }),
            Exchange::body(FEED),
        ]);
        let reporter = Arc::new(RecordingReporter::default());
        let session = FeedSession::new(client.clone()).with_reporter(reporter.clone());
        let retried = session.start("http://x/feed.xml").await.unwrap();

        assert_eq!(retried, uninterrupted);
        assert_eq!(client.calls(), 2);
        assert!(reporter.events().iter().any(|e| matches!(
            e,
            ProgressEvent::FetchRetrying {
                error: TransportError::Disconnected { retryable: true },
                ..
            }
        )));
    }

    #[tokio::test]
    async fn retry_happens_at_most_once() {
        let disconnect = TransportError::Disconnected { retryable: true };
        let client = ScriptedClient::new(vec![
            Exchange::cut_at(FEED, 10, disconnect),
            Exchange::cut_at(FEED, 10, disconnect),
            Exchange::body(FEED),
        ]);
        let session = FeedSession::new(client.clone());

        let error = session.start("http://x/feed.xml").await.unwrap_err();
        assert_eq!(error, FeedError::Network(disconnect));
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let cases = [
            Exchange::cut_at(FEED, 10, TransportError::Timeout),
            Exchange::cut_at(FEED, 10, TransportError::Disconnected { retryable: false }),
            Exchange::Fails(TransportError::RemoteHostNotFound),
            Exchange::Status(404),
            Exchange::body("<rss><channel>"),
        ];

        for exchange in cases {
            let client = ScriptedClient::new(vec![exchange, Exchange::body(FEED)]);
            let session = FeedSession::new(client.clone());
            assert!(session.start("http://x/feed.xml").await.is_err());
            assert_eq!(client.calls(), 1);
        }
    }

    #[tokio::test]
    async fn error_status_maps_to_transport_category() {
        let session = FeedSession::new(ScriptedClient::new(vec![Exchange::Status(404)]));
        let error = session.start("http://x/feed.xml").await.unwrap_err();
        assert_eq!(error, FeedError::Network(TransportError::ContentNotFound));
    }

    #[tokio::test]
    async fn disabled_retry_surfaces_disconnect() {
        let disconnect = TransportError::Disconnected { retryable: true };
        let client = ScriptedClient::new(vec![
            Exchange::cut_at(FEED, 10, disconnect),
            Exchange::body(FEED),
        ]);
        let session = FeedSession::new(client.clone()).with_retry(false);

        assert_eq!(
            session.start("http://x/feed.xml").await.unwrap_err(),
            FeedError::Network(disconnect)
        );
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_before_fetching() {
        let client = ScriptedClient::new(vec![Exchange::body(FEED)]);
        let session = FeedSession::new(client.clone());

        let error = session.start("not a url").await.unwrap_err();
        assert!(matches!(error, FeedError::InvalidUrl(_)));
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn cancel_before_start_fails_with_operation_canceled() {
        let session = FeedSession::new(ScriptedClient::new(vec![Exchange::body(FEED)]));
        session.cancel();

        let error = session.start("http://x/feed.xml").await.unwrap_err();
        assert_eq!(error, FeedError::Network(TransportError::OperationCanceled));
    }

    #[tokio::test]
    async fn cancel_during_transfer_is_observed_at_next_read() {
        let client = ScriptedClient::new(vec![Exchange::Body {
            chunks: vec![Ok(Bytes::from_static(b"<rss><channel><item>"))],
            hang: true,
        }]);
        let session = Arc::new(FeedSession::new(client));
        let cancel = session.cancel_token();

        let running = tokio::spawn({
            let session = session.clone();
            async move { session.start("http://x/feed.xml").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let error = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(error, FeedError::Network(TransportError::OperationCanceled));
    }

    #[tokio::test]
    async fn open_yields_items_lazily() {
        let session = FeedSession::new(ScriptedClient::new(vec![Exchange::Body {
            chunks: vec![Ok(Bytes::from_static(
                b"<rss><channel><item><link>http://x/1</link></item>",
            ))],
            hang: true,
        }]));

        let mut parser = session.open("http://x/feed.xml").await.unwrap();
        let first = parser.next_item().await.unwrap().unwrap();
        assert_eq!(first.link.as_str(), "http://x/1");
    }
}
