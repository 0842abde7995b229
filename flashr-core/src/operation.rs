//! The single operation slot.
//!
//! At most one download, decompression or flash runs at a time. Starting one
//! returns an [`OperationGuard`] that owns the slot until
//! [`OperationGuard::finish`] is called or the guard is dropped.

use crate::error::{Error, ErrorKind, ErrorReport, Result};
use crate::progress::{DownloadProgress, DownloadState, FlashProgress, FlashState};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Idle,
    Authorizing,
    Downloading,
    VerifyingChecksum,
    Decompressing,
    Flashing,
    Verifying,
    Complete,
    Error,
    Cancelled,
}

impl Stage {
    pub fn is_active(self) -> bool {
        !matches!(
            self,
            Stage::Idle | Stage::Complete | Stage::Error | Stage::Cancelled
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Error | Stage::Cancelled)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Authorizing => "authorizing",
            Stage::Downloading => "downloading",
            Stage::VerifyingChecksum => "verifying checksum",
            Stage::Decompressing => "decompressing",
            Stage::Flashing => "flashing",
            Stage::Verifying => "verifying",
            Stage::Complete => "complete",
            Stage::Error => "error",
            Stage::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Download,
    Decompress,
    Flash,
}

impl OperationKind {
    fn initial_stage(self) -> Stage {
        match self {
            OperationKind::Download => Stage::Downloading,
            OperationKind::Decompress => Stage::Decompressing,
            OperationKind::Flash => Stage::Flashing,
        }
    }
}

/// A cooperative cancellation flag, checked by workers once per chunk.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Error::Cancelled)` once the flag is raised.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

struct Active {
    id: u64,
    kind: OperationKind,
    target: Option<PathBuf>,
    cancel: CancelFlag,
    disconnected: bool,
}

struct Slot {
    active: Option<Active>,
    stage: Stage,
    last_error: Option<ErrorReport>,
}

pub struct Coordinator {
    slot: Mutex<Slot>,
    next_id: AtomicU64,
    download: Arc<DownloadState>,
    flash: Arc<FlashState>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                active: None,
                stage: Stage::Idle,
                last_error: None,
            }),
            next_id: AtomicU64::new(1),
            download: Arc::new(DownloadState::default()),
            flash: Arc::new(FlashState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // Slot updates never panic midway, so a poisoned lock still holds
        // consistent data.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claims the slot for a new operation.
    ///
    /// `target` is the device being written, watched by the device monitor.
    pub fn begin(
        self: &Arc<Self>,
        kind: OperationKind,
        target: Option<PathBuf>,
    ) -> Result<OperationGuard> {
        let cancel = CancelFlag::new();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut slot = self.lock();
            if let Some(active) = &slot.active {
                debug!("Rejecting {:?}: {:?} is running", kind, active.kind);
                return Err(Error::OperationAlreadyActive);
            }
            slot.active = Some(Active {
                id,
                kind,
                target: target.clone(),
                cancel: cancel.clone(),
                disconnected: false,
            });
            slot.stage = kind.initial_stage();
            slot.last_error = None;
        }

        match kind {
            OperationKind::Download | OperationKind::Decompress => self.download.reset(),
            OperationKind::Flash => self.flash.reset(),
        }
        info!("Started {:?} operation", kind);

        Ok(OperationGuard {
            coordinator: Arc::clone(self),
            id,
            kind,
            cancel,
            target,
            released: false,
        })
    }

    pub fn stage(&self) -> Stage {
        self.lock().stage
    }

    pub fn active_kind(&self) -> Option<OperationKind> {
        self.lock().active.as_ref().map(|a| a.kind)
    }

    pub fn active_target(&self) -> Option<PathBuf> {
        self.lock().active.as_ref().and_then(|a| a.target.clone())
    }

    /// Raises the cancel flag of the running operation. Returns `false` when
    /// nothing is running.
    pub fn cancel(&self) -> bool {
        match &self.lock().active {
            Some(active) => {
                info!("Cancelling {:?} operation", active.kind);
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Called by the device monitor when `path` disappears. Cancels the
    /// running operation if it targets `path`.
    pub fn device_disconnected(&self, path: &Path) -> bool {
        let mut slot = self.lock();
        match slot.active.as_mut() {
            Some(active) if active.target.as_deref() == Some(path) => {
                warn!("Target {} disappeared, cancelling", path.display());
                active.disconnected = true;
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn download_progress(&self) -> DownloadProgress {
        self.download.snapshot()
    }

    pub fn flash_progress(&self) -> FlashProgress {
        self.flash.snapshot()
    }

    pub fn download_state(&self) -> Arc<DownloadState> {
        Arc::clone(&self.download)
    }

    pub fn flash_state(&self) -> Arc<FlashState> {
        Arc::clone(&self.flash)
    }

    /// The error of the last operation, if it failed.
    pub fn last_error(&self) -> Option<ErrorReport> {
        self.lock().last_error.clone()
    }

    fn is_disconnected(&self, id: u64) -> bool {
        self.lock()
            .active
            .as_ref()
            .is_some_and(|a| a.id == id && a.disconnected)
    }

    fn release(&self, id: u64, stage: Stage, error: Option<ErrorReport>) {
        let mut slot = self.lock();
        if slot.active.as_ref().is_some_and(|a| a.id == id) {
            slot.active = None;
            slot.stage = stage;
            slot.last_error = error;
        }
    }

    fn set_stage(&self, id: u64, stage: Stage) {
        let mut slot = self.lock();
        if slot.active.as_ref().is_some_and(|a| a.id == id) {
            debug!("Stage: {}", stage);
            slot.stage = stage;
        }
    }
}

/// Ownership of the operation slot.
pub struct OperationGuard {
    coordinator: Arc<Coordinator>,
    id: u64,
    kind: OperationKind,
    cancel: CancelFlag,
    target: Option<PathBuf>,
    released: bool,
}

impl OperationGuard {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn set_stage(&self, stage: Stage) {
        self.coordinator.set_stage(self.id, stage);
    }

    /// Whether the device monitor has seen this operation's target vanish.
    pub fn target_disconnected(&self) -> bool {
        self.coordinator.is_disconnected(self.id)
    }

    /// Ends the operation with `result` and releases the slot.
    ///
    /// If the device monitor saw the target disappear, any failure is
    /// reported as [`Error::DeviceDisconnected`] instead of the error the
    /// interrupted stage produced.
    pub fn finish<T>(mut self, result: Result<T>) -> Result<T> {
        let disconnected = self.coordinator.is_disconnected(self.id);
        let result = match result {
            Err(e) if disconnected && !matches!(e, Error::DeviceDisconnected(_)) => {
                debug!("Replacing {} with a disconnect", e);
                let path = self.target.clone().unwrap_or_default();
                Err(Error::DeviceDisconnected(path))
            }
            other => other,
        };

        let (stage, report) = match &result {
            Ok(_) => (Stage::Complete, None),
            Err(Error::Cancelled) => (Stage::Cancelled, Some(Error::Cancelled.report())),
            Err(e) => (Stage::Error, Some(e.report())),
        };

        if let Some(report) = &report {
            match self.kind {
                OperationKind::Download | OperationKind::Decompress => {
                    self.coordinator.download.set_error(report.clone())
                }
                OperationKind::Flash => self.coordinator.flash.set_error(report.clone()),
            }
        }
        self.coordinator.release(self.id, stage, report);
        self.released = true;
        info!("{:?} operation finished: {}", self.kind, stage);
        result
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let report = ErrorReport {
            kind: ErrorKind::Io,
            message: "operation ended unexpectedly".to_string(),
        };
        warn!("{:?} operation dropped without finishing", self.kind);
        self.coordinator.release(self.id, Stage::Error, Some(report));
    }
}
