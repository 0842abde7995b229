//! Pollable progress state.
//!
//! Workers update lock-free counters; pollers take a [`DownloadProgress`] or
//! [`FlashProgress`] snapshot at whatever rate they like. Byte counters only
//! move forward within one operation.

use crate::error::ErrorReport;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Snapshot of a download or decompression.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// Total bytes, 0 when unknown.
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub verifying_checksum: bool,
    pub decompressing: bool,
    /// `None` when progress is indeterminate.
    pub percent: Option<f64>,
    pub error: Option<ErrorReport>,
}

/// Snapshot of a flash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlashProgress {
    pub total_bytes: u64,
    pub written_bytes: u64,
    pub verified_bytes: u64,
    pub verifying: bool,
    /// Progress of the current phase: writing, then verifying.
    pub percent: Option<f64>,
    pub error: Option<ErrorReport>,
}

fn percent(done: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some((done.min(total) as f64 / total as f64) * 100.0)
}

#[derive(Debug, Default)]
pub struct DownloadState {
    total: AtomicU64,
    downloaded: AtomicU64,
    verifying: AtomicBool,
    decompressing: AtomicBool,
    error: Mutex<Option<ErrorReport>>,
}

impl DownloadState {
    pub fn reset(&self) {
        self.total.store(0, Ordering::SeqCst);
        self.downloaded.store(0, Ordering::SeqCst);
        self.verifying.store(false, Ordering::SeqCst);
        self.decompressing.store(false, Ordering::SeqCst);
        if let Ok(mut error) = self.error.lock() {
            *error = None;
        }
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    /// Raises the downloaded counter to `bytes`; lower values are ignored.
    pub fn advance_to(&self, bytes: u64) {
        self.downloaded.fetch_max(bytes, Ordering::SeqCst);
    }

    pub fn set_verifying(&self, verifying: bool) {
        self.verifying.store(verifying, Ordering::SeqCst);
    }

    pub fn set_decompressing(&self, decompressing: bool) {
        self.decompressing.store(decompressing, Ordering::SeqCst);
    }

    pub fn set_error(&self, report: ErrorReport) {
        if let Ok(mut error) = self.error.lock() {
            *error = Some(report);
        }
    }

    pub fn snapshot(&self) -> DownloadProgress {
        let total_bytes = self.total.load(Ordering::SeqCst);
        let downloaded_bytes = self.downloaded.load(Ordering::SeqCst);
        let decompressing = self.decompressing.load(Ordering::SeqCst);
        DownloadProgress {
            total_bytes,
            downloaded_bytes,
            verifying_checksum: self.verifying.load(Ordering::SeqCst),
            decompressing,
            percent: if decompressing {
                None
            } else {
                percent(downloaded_bytes, total_bytes)
            },
            error: self.error.lock().ok().and_then(|e| e.clone()),
        }
    }
}

#[derive(Debug, Default)]
pub struct FlashState {
    total: AtomicU64,
    written: AtomicU64,
    verified: AtomicU64,
    verifying: AtomicBool,
    error: Mutex<Option<ErrorReport>>,
}

impl FlashState {
    pub fn reset(&self) {
        self.total.store(0, Ordering::SeqCst);
        self.written.store(0, Ordering::SeqCst);
        self.verified.store(0, Ordering::SeqCst);
        self.verifying.store(false, Ordering::SeqCst);
        if let Ok(mut error) = self.error.lock() {
            *error = None;
        }
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    pub fn advance_written(&self, bytes: u64) {
        self.written.fetch_max(bytes, Ordering::SeqCst);
    }

    pub fn advance_verified(&self, bytes: u64) {
        self.verified.fetch_max(bytes, Ordering::SeqCst);
    }

    pub fn set_verifying(&self, verifying: bool) {
        self.verifying.store(verifying, Ordering::SeqCst);
    }

    pub fn set_error(&self, report: ErrorReport) {
        if let Ok(mut error) = self.error.lock() {
            *error = Some(report);
        }
    }

    pub fn snapshot(&self) -> FlashProgress {
        let total_bytes = self.total.load(Ordering::SeqCst);
        let written_bytes = self.written.load(Ordering::SeqCst);
        let verified_bytes = self.verified.load(Ordering::SeqCst);
        let verifying = self.verifying.load(Ordering::SeqCst);
        FlashProgress {
            total_bytes,
            written_bytes,
            verified_bytes,
            verifying,
            percent: if verifying {
                percent(verified_bytes, total_bytes)
            } else {
                percent(written_bytes, total_bytes)
            },
            error: self.error.lock().ok().and_then(|e| e.clone()),
        }
    }
}
