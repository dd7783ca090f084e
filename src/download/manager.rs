// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use tokio::fs::File;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use super::worker::Worker;
use super::{DownloadSnapshot, DownloadStatus, TaskId};
use crate::error::DownloadError;
use crate::http::HttpClient;
use crate::progress::{NoopReporter, ProgressEvent, SharedProgressReporter};

/// Options for [`DownloadManager`]
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Appended to the destination path while the transfer is in progress
    pub partial_suffix: String,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            partial_suffix: ".partial".to_string(),
        }
    }
}

/// What the manager asks of a running worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Control {
    Run,
    Pause,
    Cancel,
}

/// Target recorded when a task was paused
#[derive(Debug, Clone)]
struct PauseRecord {
    url: String,
    destination: PathBuf,
}

pub(super) struct TaskEntry {
    id: TaskId,
    url: String,
    destination: PathBuf,
    /// Destination owned since start; relocating does not change it
    claimed: PathBuf,
    /// Where the worker writes; never changes after start
    partial_path: PathBuf,
    paused: Option<PauseRecord>,
    /// Bytes on disk when the worker last parked
    pub(super) parked_bytes: Option<u64>,
    pub(super) status: DownloadStatus,
    pub(super) bytes_transferred: u64,
    pub(super) expected_total: Option<u64>,
    control: watch::Sender<Control>,
    status_tx: watch::Sender<DownloadStatus>,
    worker: Option<JoinHandle<()>>,
}

pub(super) type SharedEntry = Arc<Mutex<TaskEntry>>;

impl TaskEntry {
    pub(super) fn set_status(&mut self, status: DownloadStatus, reporter: &SharedProgressReporter) {
        tracing::debug!(task_id = %self.id, from = %self.status, to = %status, "download status changed");
        self.status = status.clone();
        self.status_tx.send_replace(status.clone());
        reporter.report(ProgressEvent::DownloadStatusChanged {
            id: self.id,
            status,
        });
    }

    fn snapshot(&self) -> DownloadSnapshot {
        DownloadSnapshot {
            id: self.id,
            url: self.url.clone(),
            destination: self.destination.clone(),
            status: self.status.clone(),
            bytes_transferred: self.bytes_transferred,
            expected_total: self.expected_total,
        }
    }

    fn invalid_state(&self, operation: &'static str) -> DownloadError {
        DownloadError::InvalidState {
            id: self.id,
            operation,
            current_state: self.status.name().to_string(),
        }
    }
}

/// Runs enclosure downloads as independent tokio tasks.
///
/// Each task writes to `<destination><partial_suffix>` and renames it onto
/// the destination once every expected byte arrived. Operations on one
/// task are serialized by that task's lock and never wait on other tasks.
///
/// A destination belongs to the task started on it until that task is
/// acknowledged.
pub struct DownloadManager<C> {
    client: C,
    options: DownloadOptions,
    reporter: SharedProgressReporter,
    next_id: AtomicU64,
    tasks: std::sync::Mutex<HashMap<TaskId, SharedEntry>>,
    destinations: std::sync::Mutex<HashMap<PathBuf, TaskId>>,
}

impl<C: HttpClient + Clone + 'static> DownloadManager<C> {
    pub fn new(client: C) -> Self {
        Self::with_options(client, DownloadOptions::default())
    }

    pub fn with_options(client: C, options: DownloadOptions) -> Self {
        Self {
            client,
            options,
            reporter: NoopReporter::shared(),
            next_id: AtomicU64::new(1),
            tasks: std::sync::Mutex::new(HashMap::new()),
            destinations: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_reporter(mut self, reporter: SharedProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Start downloading `url` to `destination`.
    ///
    /// Fails with [`DownloadError::DestinationInUse`] while another task
    /// that was not acknowledged yet owns `destination`. The partial file is
    /// created before anything else; when that fails no task is registered
    /// and [`DownloadError::CouldNotCreateFile`] is returned.
    pub async fn start(
        &self,
        url: &str,
        destination: impl Into<PathBuf>,
    ) -> Result<TaskId, DownloadError> {
        let destination = destination.into();
        let partial_path = partial_path_for(&destination, &self.options.partial_suffix);
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));

        {
            let mut destinations = self.lock_destinations();
            if let Some(&owner) = destinations.get(&destination) {
                tracing::warn!(task_id = %owner, url, destination = %destination.display(), "destination already in use");
                return Err(DownloadError::DestinationInUse {
                    url: url.to_string(),
                    path: destination,
                    owner,
                });
            }
            destinations.insert(destination.clone(), id);
        }

        let file = match File::create(&partial_path).await {
            Ok(file) => file,
            Err(e) => {
                self.release_destination(&destination, id);
                return Err(DownloadError::CouldNotCreateFile {
                    url: url.to_string(),
                    path: partial_path,
                    source: Arc::new(e),
                });
            }
        };

        let (control_tx, control_rx) = watch::channel(Control::Run);
        let (status_tx, _) = watch::channel(DownloadStatus::Pending);

        let entry = Arc::new(Mutex::new(TaskEntry {
            id,
            url: url.to_string(),
            destination: destination.clone(),
            claimed: destination.clone(),
            partial_path: partial_path.clone(),
            paused: None,
            parked_bytes: None,
            status: DownloadStatus::Pending,
            bytes_transferred: 0,
            expected_total: None,
            control: control_tx,
            status_tx,
            worker: None,
        }));

        // Hold the entry while spawning so the worker cannot finish before
        // its handle is stored
        let mut guard = entry.lock().await;
        self.lock_tasks().insert(id, entry.clone());
        self.reporter.report(ProgressEvent::DownloadStatusChanged {
            id,
            status: DownloadStatus::Pending,
        });

        tracing::info!(task_id = %id, url, destination = %destination.display(), "download started");
        guard.set_status(DownloadStatus::Downloading, &self.reporter);

        let worker = Worker {
            id,
            client: self.client.clone(),
            url: url.to_string(),
            destination,
            partial_path,
            entry: entry.clone(),
            control: control_rx,
            reporter: self.reporter.clone(),
        };
        guard.worker = Some(tokio::spawn(worker.run(file)));

        Ok(id)
    }

    /// Stop pulling data at the next read, keeping the partial file
    pub async fn pause(&self, id: TaskId) -> Result<(), DownloadError> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock().await;
        if !matches!(entry.status, DownloadStatus::Downloading) {
            return Err(entry.invalid_state("pause"));
        }

        entry.paused = Some(PauseRecord {
            url: entry.url.clone(),
            destination: entry.destination.clone(),
        });
        entry.parked_bytes = None;
        entry.control.send_replace(Control::Pause);
        entry.set_status(DownloadStatus::Paused, &self.reporter);
        Ok(())
    }

    /// Continue a paused task.
    ///
    /// Fails with [`DownloadError::UrlOrFileChanged`] when the task was
    /// relocated since it was paused or its partial file no longer matches
    /// what was written. The task then stays paused.
    pub async fn resume(&self, id: TaskId) -> Result<(), DownloadError> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock().await;
        if !matches!(entry.status, DownloadStatus::Paused) {
            return Err(entry.invalid_state("resume"));
        }

        let changed = || DownloadError::UrlOrFileChanged {
            url: entry.url.clone(),
            path: entry.destination.clone(),
        };

        let unchanged_target = entry
            .paused
            .as_ref()
            .is_some_and(|record| record.url == entry.url && record.destination == entry.destination);
        if !unchanged_target {
            tracing::warn!(task_id = %id, "resume refused, download target changed while paused");
            return Err(changed());
        }

        match tokio::fs::metadata(&entry.partial_path).await {
            Ok(meta) if entry.parked_bytes.is_none_or(|bytes| bytes == meta.len()) => {}
            Ok(_) | Err(_) => {
                tracing::warn!(
                    task_id = %id,
                    partial = %entry.partial_path.display(),
                    "resume refused, partial file changed while paused"
                );
                return Err(changed());
            }
        }

        entry.paused = None;
        entry.control.send_replace(Control::Run);
        entry.set_status(DownloadStatus::Downloading, &self.reporter);
        Ok(())
    }

    /// Point a paused task at a different url or destination
    pub async fn relocate(
        &self,
        id: TaskId,
        url: &str,
        destination: impl Into<PathBuf>,
    ) -> Result<(), DownloadError> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock().await;
        if !matches!(entry.status, DownloadStatus::Paused) {
            return Err(entry.invalid_state("relocate"));
        }

        entry.url = url.to_string();
        entry.destination = destination.into();
        Ok(())
    }

    /// Stop the transfer and delete its partial file
    pub async fn cancel(&self, id: TaskId) -> Result<(), DownloadError> {
        let entry = self.entry(id)?;
        let (worker, partial_path) = {
            let mut entry = entry.lock().await;
            if !matches!(
                entry.status,
                DownloadStatus::Downloading | DownloadStatus::Paused
            ) {
                return Err(entry.invalid_state("cancel"));
            }

            entry.set_status(DownloadStatus::Cancelled, &self.reporter);
            entry.control.send_replace(Control::Cancel);
            (entry.worker.take(), entry.partial_path.clone())
        };

        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            tracing::warn!(task_id = %id, error = %e, "download worker ended abnormally");
        }
        remove_partial(&partial_path).await;
        tracing::info!(task_id = %id, "download cancelled");
        Ok(())
    }

    /// Forget a task that reached a terminal state, returning its last snapshot.
    ///
    /// The partial file a failed task left behind is removed and its
    /// destination becomes available to new tasks.
    pub async fn acknowledge(&self, id: TaskId) -> Result<DownloadSnapshot, DownloadError> {
        let entry = self.entry(id)?;
        let entry = entry.lock().await;
        if !entry.status.is_terminal() {
            return Err(entry.invalid_state("acknowledge"));
        }
        if self.lock_tasks().remove(&id).is_none() {
            return Err(DownloadError::TaskNotFound(id));
        }

        if matches!(entry.status, DownloadStatus::Failed(_)) {
            remove_partial(&entry.partial_path).await;
        }
        self.release_destination(&entry.claimed, id);
        Ok(entry.snapshot())
    }

    pub async fn status(&self, id: TaskId) -> Result<DownloadSnapshot, DownloadError> {
        let entry = self.entry(id)?;
        let snapshot = entry.lock().await.snapshot();
        Ok(snapshot)
    }

    /// Snapshots of every known task, ordered by id
    pub async fn tasks(&self) -> Vec<DownloadSnapshot> {
        let mut entries: Vec<_> = self
            .lock_tasks()
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);

        let mut snapshots = Vec::with_capacity(entries.len());
        for (_, entry) in entries {
            snapshots.push(entry.lock().await.snapshot());
        }
        snapshots
    }

    /// Wait until the task reaches a terminal state
    pub async fn wait(&self, id: TaskId) -> Result<DownloadStatus, DownloadError> {
        let entry = self.entry(id)?;
        let mut status_rx = entry.lock().await.status_tx.subscribe();

        let status = status_rx
            .wait_for(DownloadStatus::is_terminal)
            .await
            .map_err(|_| DownloadError::TaskNotFound(id))?;
        Ok(status.clone())
    }

    /// Cancel every task that is still running or paused
    pub async fn cancel_all(&self) {
        for snapshot in self.tasks().await {
            if matches!(
                snapshot.status,
                DownloadStatus::Downloading | DownloadStatus::Paused
            ) && let Err(e) = self.cancel(snapshot.id).await
            {
                tracing::debug!(task_id = %snapshot.id, error = %e, "skipped cancelling download");
            }
        }
    }

    fn entry(&self, id: TaskId) -> Result<SharedEntry, DownloadError> {
        self.lock_tasks()
            .get(&id)
            .cloned()
            .ok_or(DownloadError::TaskNotFound(id))
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, SharedEntry>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_destinations(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, TaskId>> {
        self.destinations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_destination(&self, destination: &Path, id: TaskId) {
        let mut destinations = self.lock_destinations();
        if destinations.get(destination) == Some(&id) {
            destinations.remove(destination);
        }
    }
}

fn partial_path_for(destination: &Path, suffix: &str) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Best-effort removal of a partial file
pub(super) async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "removed partial file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove partial file"),
    }
}
