// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use super::manager::{Control, SharedEntry, remove_partial};
use super::{DownloadStatus, TaskId};
use crate::error::DownloadError;
use crate::http::{HttpClient, HttpResponse};
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::transport::TransportError;

enum Outcome {
    Completed,
    Cancelled,
    Failed(DownloadError),
}

/// Drives one transfer from request to final status
pub(super) struct Worker<C> {
    pub(super) id: TaskId,
    pub(super) client: C,
    pub(super) url: String,
    pub(super) destination: PathBuf,
    /// The only file this worker writes or deletes
    pub(super) partial_path: PathBuf,
    pub(super) entry: SharedEntry,
    pub(super) control: watch::Receiver<Control>,
    pub(super) reporter: SharedProgressReporter,
}

impl<C: HttpClient> Worker<C> {
    pub(super) async fn run(mut self, mut file: File) {
        let outcome = match self.transfer(&mut file).await {
            Ok(outcome) => outcome,
            Err(error) => Outcome::Failed(error),
        };
        drop(file);
        self.finish(outcome).await;
    }

    async fn transfer(&mut self, file: &mut File) -> Result<Outcome, DownloadError> {
        let response = {
            let request = self.client.get_stream(&self.url);
            tokio::pin!(request);

            loop {
                tokio::select! {
                    biased;
                    changed = self.control.changed() => {
                        if changed.is_err() || *self.control.borrow() == Control::Cancel {
                            return Ok(Outcome::Cancelled);
                        }
                    }
                    response = &mut request => break response,
                }
            }
        };
        let response = response
            .and_then(HttpResponse::ensure_success)
            .map_err(|source| network_error(&self.url, source))?;

        let expected = response.content_length;
        self.entry.lock().await.expected_total = expected;

        let mut body = response.body;
        let mut received: u64 = 0;

        loop {
            if !self.checkpoint(file, received).await? {
                return Ok(Outcome::Cancelled);
            }

            let next = tokio::select! {
                biased;
                changed = self.control.changed() => {
                    if changed.is_err() {
                        return Ok(Outcome::Cancelled);
                    }
                    continue;
                }
                chunk = body.next() => chunk,
            };

            let chunk = match next {
                None => break,
                Some(chunk) => chunk.map_err(|source| network_error(&self.url, source))?,
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| write_failed(&self.partial_path, e))?;
            received += chunk.len() as u64;

            self.entry.lock().await.bytes_transferred = received;
            self.reporter.report(ProgressEvent::DownloadProgress {
                id: self.id,
                bytes_transferred: received,
                expected_total: expected,
            });
        }

        file.flush()
            .await
            .map_err(|e| write_failed(&self.partial_path, e))?;

        if let Some(expected) = expected
            && received < expected
        {
            return Err(DownloadError::Incomplete {
                url: self.url.clone(),
                expected,
                received,
            });
        }

        Ok(Outcome::Completed)
    }

    /// Park while paused. Returns `false` once cancelled.
    async fn checkpoint(&mut self, file: &mut File, received: u64) -> Result<bool, DownloadError> {
        let mut parked = false;
        loop {
            let control = *self.control.borrow_and_update();
            match control {
                Control::Run => return Ok(true),
                Control::Cancel => return Ok(false),
                Control::Pause => {
                    if !parked {
                        file.flush()
                            .await
                            .map_err(|e| write_failed(&self.partial_path, e))?;
                        self.entry.lock().await.parked_bytes = Some(received);
                        tracing::debug!(task_id = %self.id, bytes = received, "download parked");
                        parked = true;
                    }
                    if self.control.changed().await.is_err() {
                        return Ok(false);
                    }
                }
            }
        }
    }

    async fn finish(self, outcome: Outcome) {
        let mut entry = self.entry.lock().await;
        if matches!(entry.status, DownloadStatus::Cancelled) {
            // The cancelling caller owns cleanup
            return;
        }

        let status = match outcome {
            Outcome::Completed => match tokio::fs::rename(&self.partial_path, &self.destination).await {
                Ok(()) => {
                    tracing::info!(
                        task_id = %self.id,
                        url = %self.url,
                        destination = %self.destination.display(),
                        bytes = entry.bytes_transferred,
                        "download completed"
                    );
                    DownloadStatus::Completed
                }
                Err(e) => DownloadStatus::Failed(write_failed(&self.destination, e)),
            },
            Outcome::Cancelled => {
                remove_partial(&self.partial_path).await;
                DownloadStatus::Cancelled
            }
            Outcome::Failed(error) => {
                if let DownloadError::Network { source, .. } = &error
                    && source.is_unreachable()
                {
                    remove_partial(&self.partial_path).await;
                }
                tracing::warn!(task_id = %self.id, url = %self.url, %error, "download failed");
                DownloadStatus::Failed(error)
            }
        };

        entry.set_status(status, &self.reporter);
    }
}

fn network_error(url: &str, source: TransportError) -> DownloadError {
    DownloadError::Network {
        url: url.to_string(),
        source,
    }
}

fn write_failed(path: &Path, e: std::io::Error) -> DownloadError {
    DownloadError::WriteFailed {
        path: path.to_path_buf(),
        source: Arc::new(e),
    }
}
