// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{FeedCache, NoopCache};
use crate::download::{DownloadManager, DownloadOptions, DownloadSnapshot, DownloadStatus, TaskId, destination_for};
use crate::error::{CacheError, DownloadError, FeedError};
use crate::feed::FeedItem;
use crate::http::HttpClient;
use crate::progress::{NoopReporter, ProgressEvent, SharedProgressReporter};
use crate::session::{FeedDocument, FeedSession, SessionId};

/// Options for an [`Ingestor`]
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Fetch a feed once more after a transient disconnection
    pub retry_disconnects: bool,
    pub download: DownloadOptions,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            retry_disconnects: true,
            download: DownloadOptions::default(),
        }
    }
}

/// A feed fetch running in the background
pub struct FetchHandle {
    id: SessionId,
    handle: JoinHandle<Result<FeedDocument, FeedError>>,
}

impl FetchHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Wait for the parsed document or the error that ended the fetch
    pub async fn join(self) -> Result<FeedDocument, FeedError> {
        self.handle.await.map_err(|e| FeedError::Internal {
            detail: format!("feed session task failed: {e}"),
        })?
    }
}

type SessionMap = Arc<std::sync::Mutex<HashMap<SessionId, CancellationToken>>>;

/// Entry point tying feed sessions, downloads, the item cache and the
/// progress reporter together
pub struct Ingestor<C> {
    client: C,
    options: IngestOptions,
    reporter: SharedProgressReporter,
    cache: Arc<dyn FeedCache>,
    sessions: SessionMap,
    downloads: DownloadManager<C>,
}

impl<C: HttpClient + Clone + 'static> Ingestor<C> {
    pub fn new(client: C, options: IngestOptions) -> Self {
        let downloads = DownloadManager::with_options(client.clone(), options.download.clone());
        Self {
            client,
            options,
            reporter: NoopReporter::shared(),
            cache: Arc::new(NoopCache),
            sessions: Arc::new(std::sync::Mutex::new(HashMap::new())),
            downloads,
        }
    }

    pub fn with_reporter(mut self, reporter: SharedProgressReporter) -> Self {
        self.downloads = self.downloads.with_reporter(reporter.clone());
        self.reporter = reporter;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn FeedCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Start fetching and parsing `url` in the background.
    ///
    /// Items of a successfully parsed document are stored in the cache.
    pub fn fetch_feed(&self, url: &str) -> FetchHandle {
        let session = FeedSession::new(self.client.clone())
            .with_reporter(self.reporter.clone())
            .with_retry(self.options.retry_disconnects);
        let id = session.id();
        lock(&self.sessions).insert(id, session.cancel_token());

        let sessions = self.sessions.clone();
        let cache = self.cache.clone();
        let url = url.to_string();

        let handle = tokio::spawn(async move {
            let result = session.start(&url).await;
            lock(&sessions).remove(&id);

            if let Ok(document) = &result {
                for item in &document.items {
                    if let Err(e) = cache.store(item) {
                        tracing::warn!(session = %id, link = %item.link, error = %e, "failed to cache item");
                    }
                }
            }
            result
        });

        FetchHandle { id, handle }
    }

    /// Cancel a running fetch. Returns `false` if it already finished.
    pub fn cancel_fetch(&self, id: SessionId) -> bool {
        match lock(&self.sessions).get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn start_download(
        &self,
        url: &str,
        destination: impl Into<PathBuf>,
    ) -> Result<TaskId, DownloadError> {
        self.downloads.start(url, destination).await
    }

    /// Download an item's enclosure into `dir`; `None` if it has none
    pub async fn download_enclosure(
        &self,
        item: &FeedItem,
        dir: &Path,
    ) -> Result<Option<TaskId>, DownloadError> {
        let (Some(enclosure), Some(destination)) = (&item.enclosure, destination_for(item, dir))
        else {
            return Ok(None);
        };
        self.downloads
            .start(enclosure.url.as_str(), destination)
            .await
            .map(Some)
    }

    pub async fn pause_download(&self, id: TaskId) -> Result<(), DownloadError> {
        self.downloads.pause(id).await
    }

    pub async fn resume_download(&self, id: TaskId) -> Result<(), DownloadError> {
        self.downloads.resume(id).await
    }

    pub async fn cancel_download(&self, id: TaskId) -> Result<(), DownloadError> {
        self.downloads.cancel(id).await
    }

    pub async fn download_status(&self, id: TaskId) -> Result<DownloadSnapshot, DownloadError> {
        self.downloads.status(id).await
    }

    pub async fn acknowledge_download(
        &self,
        id: TaskId,
    ) -> Result<DownloadSnapshot, DownloadError> {
        self.downloads.acknowledge(id).await
    }

    pub async fn wait_download(&self, id: TaskId) -> Result<DownloadStatus, DownloadError> {
        self.downloads.wait(id).await
    }

    pub fn downloads(&self) -> &DownloadManager<C> {
        &self.downloads
    }

    pub fn clear_cache(&self) -> Result<usize, CacheError> {
        let removed = self.cache.clear()?;
        tracing::info!(removed, "item cache cleared");
        self.reporter.report(ProgressEvent::CacheCleared { removed });
        Ok(removed)
    }

    /// Cancel every running fetch and every unfinished download
    pub async fn cancel_all(&self) {
        for token in lock(&self.sessions).values() {
            token.cancel();
        }
        self.downloads.cancel_all().await;
    }
}

fn lock(
    sessions: &SessionMap,
) -> std::sync::MutexGuard<'_, HashMap<SessionId, CancellationToken>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}
