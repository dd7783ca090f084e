// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod cache;
pub mod download;
pub mod error;
pub mod feed;
pub mod http;
pub mod ingest;
pub mod progress;
pub mod session;
pub mod transport;

// Re-export main types for convenience
pub use cache::{FeedCache, JsonDirCache, NoopCache};
pub use download::{
    DownloadManager, DownloadOptions, DownloadSnapshot, DownloadStatus, TaskId, destination_for,
};
pub use error::{CacheError, DownloadError, FeedError, ParseErrorKind};
pub use feed::{Channel, Enclosure, FeedItem, FeedParser, ParseState};
pub use http::{HttpClient, HttpResponse, ReqwestClient, TransportConfig};
pub use ingest::{FetchHandle, IngestOptions, Ingestor};
pub use progress::{NoopReporter, ProgressEvent, ProgressReporter, SharedProgressReporter};
pub use session::{FeedDocument, FeedSession, SessionId};
pub use transport::{RawOutcome, TransportError, classify};
