// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::download::TaskId;
use crate::transport::TransportError;

/// The wait-state a parser was in when the document stopped making sense
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseErrorKind {
    WaitingForDocumentStart,
    WaitingForTag,
    ReadingItemInformation,
    WaitingForClosingTag,
    WaitingForEndOfDocument,
}

impl ParseErrorKind {
    /// Stable key identifying the failure, for message catalogs
    pub fn code(&self) -> &'static str {
        match self {
            ParseErrorKind::WaitingForDocumentStart => "waiting_for_document_start",
            ParseErrorKind::WaitingForTag => "waiting_for_tag",
            ParseErrorKind::ReadingItemInformation => "reading_item_information",
            ParseErrorKind::WaitingForClosingTag => "waiting_for_closing_tag",
            ParseErrorKind::WaitingForEndOfDocument => "waiting_for_end_of_document",
        }
    }
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            ParseErrorKind::WaitingForDocumentStart => "Error waiting for document start",
            ParseErrorKind::WaitingForTag => "Error waiting for tag",
            ParseErrorKind::ReadingItemInformation => "Error reading item information",
            ParseErrorKind::WaitingForClosingTag => "Error waiting for closing rss tag",
            ParseErrorKind::WaitingForEndOfDocument => "Error waiting for end of rss document",
        };
        f.write_str(message)
    }
}

/// Errors that terminate a feed fetch-and-parse run
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    #[error("Error parsing rss document: {kind} ({detail})")]
    Parse {
        kind: ParseErrorKind,
        detail: String,
    },

    #[error("Network error: {0}")]
    Network(#[from] TransportError),

    /// A transition the parser considers unreachable was taken
    #[error("Internal error, we should never get here: {detail}")]
    Internal { detail: String },

    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl FeedError {
    pub(crate) fn parse(kind: ParseErrorKind, detail: impl Into<String>) -> Self {
        FeedError::Parse {
            kind,
            detail: detail.into(),
        }
    }

    /// The parse wait-state this failure belongs to, if it is a parse failure
    pub fn parse_kind(&self) -> Option<ParseErrorKind> {
        match self {
            FeedError::Parse { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// The transport category, if the failure came from the network
    pub fn transport(&self) -> Option<TransportError> {
        match self {
            FeedError::Network(e) => Some(*e),
            _ => None,
        }
    }

    /// Stable key identifying the failure, for message catalogs
    pub fn code(&self) -> &'static str {
        match self {
            FeedError::Parse { kind, .. } => kind.code(),
            FeedError::Network(e) => e.code(),
            FeedError::Internal { .. } => "internal_error",
            FeedError::InvalidUrl(_) => "invalid_url",
        }
    }
}

/// Errors that can occur while controlling or running enclosure downloads
#[derive(Error, Debug, Clone)]
pub enum DownloadError {
    #[error("Network error while getting {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("Could not create file {path} when getting {url}: {source}")]
    CouldNotCreateFile {
        url: String,
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Failed to write to file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Download of {url} ended after {received} of {expected} bytes")]
    Incomplete {
        url: String,
        expected: u64,
        received: u64,
    },

    #[error("INTERNAL ERROR: changed url or file when getting {url}")]
    UrlOrFileChanged { url: String, path: PathBuf },

    #[error("Cannot {operation} download {id} while it is {current_state}")]
    InvalidState {
        id: TaskId,
        operation: &'static str,
        current_state: String,
    },

    #[error("Download {0} not found")]
    TaskNotFound(TaskId),

    #[error("Cannot download {url} to {path}: download {owner} already writes there")]
    DestinationInUse {
        url: String,
        path: PathBuf,
        owner: TaskId,
    },
}

impl DownloadError {
    /// Errors caused by how the manager was driven rather than by I/O
    pub fn is_caller_misuse(&self) -> bool {
        matches!(
            self,
            DownloadError::UrlOrFileChanged { .. }
                | DownloadError::DestinationInUse { .. }
                | DownloadError::InvalidState { .. }
                | DownloadError::TaskNotFound(_)
        )
    }

    /// Stable key identifying the failure, for message catalogs
    pub fn code(&self) -> &'static str {
        match self {
            DownloadError::Network { source, .. } => source.code(),
            DownloadError::CouldNotCreateFile { .. } => "could_not_create_file",
            DownloadError::WriteFailed { .. } => "write_failed",
            DownloadError::Incomplete { .. } => "incomplete",
            DownloadError::UrlOrFileChanged { .. } => "url_or_file_changed",
            DownloadError::InvalidState { .. } => "invalid_state",
            DownloadError::TaskNotFound(_) => "task_not_found",
            DownloadError::DestinationInUse { .. } => "destination_in_use",
        }
    }
}

/// Errors that can occur in the on-disk item cache
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to create cache directory {path}: {source}")]
    CreateDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read cache directory {path}: {source}")]
    ReadDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read cache entry {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write cache entry {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove cache entry {path}: {source}")]
    RemoveFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse cache entry {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize cache entry: {0}")]
    JsonSerializeFailed(#[from] serde_json::Error),
}
