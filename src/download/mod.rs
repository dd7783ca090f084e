// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Enclosure downloads with pause, resume and cancel control.

mod filename;
mod manager;
mod worker;

use std::fmt;
use std::path::PathBuf;

use crate::error::DownloadError;

pub use filename::{destination_for, extension};
pub use manager::{DownloadManager, DownloadOptions};

/// Opaque handle of a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a download task.
///
/// `Pending -> Downloading <-> Paused`, ending in one of the terminal
/// states `Completed`, `Cancelled` or `Failed`.
#[derive(Debug, Clone)]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Cancelled,
    Failed(DownloadError),
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Cancelled | DownloadStatus::Failed(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Cancelled => "cancelled",
            DownloadStatus::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Point-in-time view of a task
#[derive(Debug, Clone)]
pub struct DownloadSnapshot {
    pub id: TaskId,
    pub url: String,
    pub destination: PathBuf,
    pub status: DownloadStatus,
    pub bytes_transferred: u64,
    pub expected_total: Option<u64>,
}
