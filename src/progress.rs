// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use crate::download::{DownloadStatus, TaskId};
use crate::error::FeedError;
use crate::feed::FeedItem;
use crate::session::SessionId;
use crate::transport::TransportError;

/// Events surfaced to the presentation layer.
///
/// Events carry discriminants and raw values only; turning them into
/// display text is up to the reporter.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A feed document is being requested
    FetchingFeed { session: SessionId, url: String },

    /// The connection dropped transiently and the document is fetched again
    FetchRetrying {
        session: SessionId,
        url: String,
        error: TransportError,
    },

    /// An item was parsed, in document order
    ItemParsed { session: SessionId, item: FeedItem },

    /// The whole document was parsed
    FeedCompleted {
        session: SessionId,
        item_count: usize,
    },

    FeedFailed {
        session: SessionId,
        error: FeedError,
    },

    /// A download moved to a new status
    DownloadStatusChanged { id: TaskId, status: DownloadStatus },

    DownloadProgress {
        id: TaskId,
        bytes_transferred: u64,
        expected_total: Option<u64>,
    },

    /// The item cache was emptied
    CacheCleared { removed: usize },
}

/// Trait for reporting progress events.
///
/// Implementations can use this to display progress bars, log messages,
/// or collect statistics.
pub trait ProgressReporter: Send + Sync {
    /// Report a progress event
    fn report(&self, event: ProgressEvent);
}

/// A shared reference to a progress reporter
pub type SharedProgressReporter = Arc<dyn ProgressReporter>;

/// A no-op progress reporter that silently ignores all events.
/// Useful for tests or quiet mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: ProgressEvent) {}
}

impl NoopReporter {
    /// Create a new NoopReporter wrapped in an Arc
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}

/// Reporter that records every event, for assertions in tests
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingReporter {
    events: std::sync::Mutex<Vec<ProgressEvent>>,
}

#[cfg(test)]
impl RecordingReporter {
    pub(crate) fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl ProgressReporter for RecordingReporter {
    fn report(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_reporter_handles_events() {
        let reporter = NoopReporter::shared();

        reporter.report(ProgressEvent::FetchingFeed {
            session: SessionId(1),
            url: "https://example.com/feed.xml".to_string(),
        });
        reporter.report(ProgressEvent::DownloadProgress {
            id: TaskId(1),
            bytes_transferred: 512,
            expected_total: Some(1024),
        });
        reporter.report(ProgressEvent::CacheCleared { removed: 3 });
    }

    #[test]
    fn recording_reporter_keeps_order() {
        let reporter = RecordingReporter::default();
        reporter.report(ProgressEvent::FeedCompleted {
            session: SessionId(1),
            item_count: 2,
        });
        reporter.report(ProgressEvent::CacheCleared { removed: 0 });

        let events = reporter.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            ProgressEvent::FeedCompleted { item_count: 2, .. }
        ));
    }
}
