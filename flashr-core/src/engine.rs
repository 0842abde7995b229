//! The command surface front-ends talk to.
//!
//! [`Engine`] wires the enumerator, authorizer, cache, downloader,
//! decompressor and flasher around one [`Coordinator`]. Long-running commands
//! claim the operation slot, run on a worker thread and return an
//! [`OperationHandle`]; everything a front-end needs while they run is
//! available by polling.
//!
//! ```rust,no_run
//! use flashr_core::{Config, Engine};
//!
//! fn main() -> flashr_core::Result<()> {
//!     let engine = Engine::new(Config::load(None)?)?;
//!     let device = engine
//!         .list_block_devices()?
//!         .into_iter()
//!         .find(|d| d.is_flashable())
//!         .expect("no removable device");
//!
//!     let image = engine.download_image("https://example.org/board.img.xz", None)?.join()?;
//!     let image = engine.decompress(&image)?.join()?;
//!
//!     if engine.authorize_write(&device.path)? {
//!         let handle = engine.flash_image(&image, &device.path, true)?;
//!         while !handle.is_finished() {
//!             println!("{:?}", engine.get_flash_progress().percent);
//!             std::thread::sleep(std::time::Duration::from_millis(200));
//!         }
//!         handle.join()?;
//!     }
//!     Ok(())
//! }
//! ```

use crate::auth::{self, Authorizer};
use crate::cache::{CacheEntry, CacheManager};
use crate::config::Config;
use crate::decompress::{self, Decompressor};
use crate::device::BlockDevice;
use crate::download::Downloader;
use crate::error::{Error, ErrorReport, Result};
use crate::monitor::{self, DeviceMonitor, DeviceSnapshot};
use crate::operation::{Coordinator, OperationGuard, OperationKind, Stage};
use crate::platform::{DeviceEnumerator, SystemEnumerator};
use crate::progress::{DownloadProgress, FlashProgress};
use crate::write::{FlashSummary, Flasher};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A running operation. Dropping the handle detaches the worker; the
/// operation still runs to completion and can be followed by polling.
pub struct OperationHandle<T> {
    handle: JoinHandle<Result<T>>,
}

impl<T> OperationHandle<T> {
    /// Waits for the worker and returns its result.
    pub fn join(self) -> Result<T> {
        self.handle.join().unwrap_or_else(|_| {
            Err(Error::Io(std::io::Error::other("worker thread panicked")))
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

fn spawn_worker<T, F>(name: &str, work: F) -> Result<OperationHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(work)?;
    Ok(OperationHandle { handle })
}

/// Cancels whatever operation is running. Cheap to clone into signal
/// handlers.
#[derive(Clone)]
pub struct Canceller(Arc<Coordinator>);

impl Canceller {
    pub fn cancel(&self) -> bool {
        self.0.cancel()
    }
}

/// Consecutive flash failures per cached artifact, and which compressed
/// entry each decompressed artifact came from.
#[derive(Default)]
struct FailureLedger {
    failures: HashMap<PathBuf, u32>,
    origins: HashMap<PathBuf, PathBuf>,
}

struct Shared {
    config: Config,
    coordinator: Arc<Coordinator>,
    cache: Arc<CacheManager>,
    enumerator: Arc<dyn DeviceEnumerator>,
    authorizer: Arc<dyn Authorizer>,
    downloader: Downloader,
    decompressor: Decompressor,
    authorized: Mutex<HashSet<PathBuf>>,
    ledger: Mutex<FailureLedger>,
}

impl Shared {
    fn authorized(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.authorized.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ledger(&self) -> MutexGuard<'_, FailureLedger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn revoke(&self, device: &Path) {
        if let Err(e) = self.authorizer.revoke(device) {
            warn!("Could not give back write access to {}: {}", device.display(), e);
        }
    }

    fn find_device(&self, path: &Path) -> Result<BlockDevice> {
        self.enumerator
            .list_devices()?
            .into_iter()
            .find(|d| d.path == path)
            .ok_or_else(|| Error::DeviceNotFound(path.to_path_buf()))
    }

    fn device_present(&self, path: &Path) -> bool {
        match self.enumerator.list_devices() {
            Ok(devices) => devices.iter().any(|d| d.path == path),
            // Cannot tell; keep the original error.
            Err(_) => true,
        }
    }

    /// Post-flash cleanup when caching is disabled: the flashed image and the
    /// compressed entry it was decoded from are removed. Files outside the
    /// cache are left alone.
    fn release_after_use(&self, image: &Path) {
        if self.cache.is_enabled() {
            return;
        }
        let origin = self.ledger().origins.remove(image);
        for path in std::iter::once(image.to_path_buf()).chain(origin) {
            if !self.cache.contains_path(&path) {
                continue;
            }
            if let Err(e) = self.cache.delete(&path) {
                warn!("Failed to delete {}: {}", path.display(), e);
            }
        }
    }

    /// Updates the failure count of `image` after a flash and force-deletes
    /// it, with its compressed origin, once the threshold is reached.
    fn record_flash_outcome(&self, image: &Path, result: &Result<FlashSummary>) {
        let threshold = self.config.cache.max_flash_failures;
        let mut ledger = self.ledger();
        match result {
            Ok(_) => {
                ledger.failures.remove(image);
            }
            Err(Error::WriteFailed { .. } | Error::VerificationMismatch) => {
                let count = ledger.failures.entry(image.to_path_buf()).or_insert(0);
                *count += 1;
                warn!(
                    "Flash of {} failed ({}/{} consecutive)",
                    image.display(),
                    count,
                    threshold
                );
                if *count < threshold {
                    return;
                }

                ledger.failures.remove(image);
                let origin = ledger.origins.remove(image);
                drop(ledger);

                if !self.cache.contains_path(image) {
                    warn!(
                        "{} keeps failing but is not a cached image, leaving it in place",
                        image.display()
                    );
                    return;
                }
                warn!(
                    "Deleting {} after {} failed flashes, it may be corrupt",
                    image.display(),
                    threshold
                );
                for path in std::iter::once(image.to_path_buf()).chain(origin) {
                    if let Err(e) = self.cache.force_delete(&path) {
                        warn!("Failed to delete {}: {}", path.display(), e);
                    }
                }
            }
            Err(_) => {}
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let outstanding: Vec<PathBuf> = self.authorized().drain().collect();
        for device in outstanding {
            self.revoke(&device);
        }
    }
}

fn run_flash(
    shared: &Shared,
    guard: &OperationGuard,
    target: &BlockDevice,
    image: &Path,
    verify: bool,
) -> Result<FlashSummary> {
    let cancel = guard.cancel_flag();
    if !shared.authorized().contains(&target.path) {
        guard.set_stage(Stage::Authorizing);
        if !shared.authorizer.authorize(&target.path)? {
            return Err(Error::Cancelled);
        }
    }
    cancel.check()?;

    let _mounts = shared.authorizer.release_mounts(&target.path);
    let granted = shared.authorizer.open_device(&target.path)?;
    guard.set_stage(Stage::Flashing);
    let flasher = Flasher::new(
        shared.coordinator.flash_state(),
        shared.config.flash.block_size,
    );
    let capacity = (target.size > 0).then_some(target.size);
    flasher.flash(image, &target.path, granted, capacity, verify, &cancel, || {
        guard.set_stage(Stage::Verifying)
    })
}

pub struct EngineBuilder {
    config: Config,
    enumerator: Option<Arc<dyn DeviceEnumerator>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    monitor: bool,
}

impl EngineBuilder {
    /// Replaces host device enumeration, e.g. with a fixed table in tests.
    pub fn enumerator(mut self, enumerator: Arc<dyn DeviceEnumerator>) -> Self {
        self.enumerator = Some(enumerator);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Skips the hot-plug monitor thread.
    pub fn without_monitor(mut self) -> Self {
        self.monitor = false;
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;

        let coordinator = Arc::new(Coordinator::new());
        let cache = Arc::new(CacheManager::from_config(&self.config.cache));
        if let Err(e) = cache.housekeeping() {
            warn!("Cache housekeeping failed: {}", e);
        }

        let enumerator = self
            .enumerator
            .unwrap_or_else(|| Arc::new(SystemEnumerator));
        let authorizer = self.authorizer.unwrap_or_else(auth::platform_authorizer);
        debug!("Using {} authorization", authorizer.mechanism());

        let downloader = Downloader::new(
            &self.config.download,
            Arc::clone(&cache),
            coordinator.download_state(),
        )?;
        let decompressor = Decompressor::new(Arc::clone(&cache), coordinator.download_state());

        let monitor = self.monitor.then(|| {
            DeviceMonitor::spawn(
                Arc::clone(&enumerator),
                Arc::clone(&coordinator),
                Duration::from_millis(self.config.monitor.poll_interval_ms),
            )
        });

        Ok(Engine {
            shared: Arc::new(Shared {
                config: self.config,
                coordinator,
                cache,
                enumerator,
                authorizer,
                downloader,
                decompressor,
                authorized: Mutex::new(HashSet::new()),
                ledger: Mutex::new(FailureLedger::default()),
            }),
            monitor,
        })
    }
}

pub struct Engine {
    shared: Arc<Shared>,
    monitor: Option<DeviceMonitor>,
}

impl Engine {
    /// An engine for the running host, with the device monitor started.
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            enumerator: None,
            authorizer: None,
            monitor: true,
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn list_block_devices(&self) -> Result<Vec<BlockDevice>> {
        self.shared.enumerator.list_devices()
    }

    /// The monitor's latest device list. Without a monitor the host is
    /// enumerated on the spot.
    pub fn device_events(&self) -> Result<DeviceSnapshot> {
        match &self.monitor {
            Some(monitor) => Ok(monitor.snapshot()),
            None => {
                let snapshot = Mutex::new(DeviceSnapshot::default());
                monitor::poll_once(
                    self.shared.enumerator.as_ref(),
                    &self.shared.coordinator,
                    &snapshot,
                );
                Ok(snapshot.into_inner().unwrap_or_default())
            }
        }
    }

    /// Asks the host for permission to write `device`.
    ///
    /// A grant covers one later flash of that same path. System devices are
    /// refused before anyone is asked.
    pub fn authorize_write(&self, device: &Path) -> Result<bool> {
        let found = self.shared.find_device(device)?;
        if found.is_system {
            return Err(Error::SystemDevice(device.to_path_buf()));
        }
        if self.shared.authorized().contains(device) {
            return Ok(true);
        }

        info!(
            "Requesting write access to {} via {}",
            device.display(),
            self.shared.authorizer.mechanism()
        );
        let granted = self.shared.authorizer.authorize(device)?;
        if granted {
            self.shared.authorized().insert(device.to_path_buf());
        } else {
            info!("Authorization for {} was dismissed", device.display());
        }
        Ok(granted)
    }

    pub fn download_image(
        &self,
        url: &str,
        checksum_url: Option<&str>,
    ) -> Result<OperationHandle<PathBuf>> {
        let guard = self
            .shared
            .coordinator
            .begin(OperationKind::Download, None)?;
        let shared = Arc::clone(&self.shared);
        let url = url.to_string();
        let checksum_url = checksum_url.map(str::to_string);

        spawn_worker("download", move || {
            let cancel = guard.cancel_flag();
            let result = shared.downloader.download(
                &url,
                checksum_url.as_deref(),
                &cancel,
                || guard.set_stage(Stage::VerifyingChecksum),
            );
            guard.finish(result)
        })
    }

    /// Keeps a download whose checksum did not match.
    pub fn continue_unverified(&self, url: &str) -> Result<PathBuf> {
        let guard = self
            .shared
            .coordinator
            .begin(OperationKind::Download, None)?;
        guard.finish(self.shared.downloader.continue_unverified(url))
    }

    pub fn discard_unverified(&self, url: &str) -> Result<()> {
        let guard = self
            .shared
            .coordinator
            .begin(OperationKind::Download, None)?;
        guard.finish(self.shared.downloader.discard_unverified(url))
    }

    pub fn needs_decompression(&self, path: &Path) -> Result<bool> {
        decompress::needs_decompression(path)
    }

    pub fn decompress(&self, path: &Path) -> Result<OperationHandle<PathBuf>> {
        let guard = self
            .shared
            .coordinator
            .begin(OperationKind::Decompress, None)?;
        let shared = Arc::clone(&self.shared);
        let input = path.to_path_buf();

        spawn_worker("decompress", move || {
            let cancel = guard.cancel_flag();
            let result = shared.decompressor.decompress(&input, &cancel);
            if let Ok(output) = &result {
                if output != &input && shared.cache.contains_path(&input) {
                    shared
                        .ledger()
                        .origins
                        .insert(output.clone(), input.clone());
                }
            }
            guard.finish(result)
        })
    }

    /// Writes `image` to `device`, optionally verifying it.
    ///
    /// Unknown and system devices, compressed images and a busy slot are
    /// rejected here, before any worker starts.
    pub fn flash_image(
        &self,
        image: &Path,
        device: &Path,
        verify: bool,
    ) -> Result<OperationHandle<FlashSummary>> {
        let target = self.shared.find_device(device)?;
        if target.is_system {
            warn!("Refusing to flash system device {}", device.display());
            return Err(Error::SystemDevice(device.to_path_buf()));
        }
        let format = decompress::detect_format(image)?;
        if format != decompress::Format::Raw {
            return Err(Error::DecompressionFailed(format!(
                "{} is {}-compressed, decompress it before flashing",
                image.display(),
                format
            )));
        }

        let guard = self
            .shared
            .coordinator
            .begin(OperationKind::Flash, Some(device.to_path_buf()))?;
        let shared = Arc::clone(&self.shared);
        let image = image.to_path_buf();

        spawn_worker("flash", move || {
            let mut result = run_flash(&shared, &guard, &target, &image, verify);

            if matches!(result, Err(Error::WriteFailed { .. } | Error::Io(_)))
                && (guard.target_disconnected() || !shared.device_present(&target.path))
            {
                result = Err(Error::DeviceDisconnected(target.path.clone()));
            }

            shared.authorized().remove(&target.path);
            shared.revoke(&target.path);
            shared.record_flash_outcome(&image, &result);
            if result.is_ok() {
                shared.release_after_use(&image);
            }
            guard.finish(result)
        })
    }

    pub fn get_download_progress(&self) -> DownloadProgress {
        self.shared.coordinator.download_progress()
    }

    pub fn get_flash_progress(&self) -> FlashProgress {
        self.shared.coordinator.flash_progress()
    }

    pub fn current_stage(&self) -> Stage {
        self.shared.coordinator.stage()
    }

    pub fn last_error(&self) -> Option<ErrorReport> {
        self.shared.coordinator.last_error()
    }

    pub fn cancel_operation(&self) -> bool {
        self.shared.coordinator.cancel()
    }

    pub fn canceller(&self) -> Canceller {
        Canceller(Arc::clone(&self.shared.coordinator))
    }

    /// Deletion after use: a no-op while caching is enabled.
    pub fn delete_cached_image(&self, path: &Path) -> Result<bool> {
        self.shared.cache.delete(path)
    }

    pub fn force_delete_cached_image(&self, path: &Path) -> Result<bool> {
        let deleted = self.shared.cache.force_delete(path)?;
        let mut ledger = self.shared.ledger();
        ledger.failures.remove(path);
        ledger.origins.remove(path);
        Ok(deleted)
    }

    pub fn get_cache_size(&self) -> Result<u64> {
        self.shared.cache.current_size()
    }

    /// Empties the cache. Refused while an operation runs, since its
    /// in-progress files live there.
    pub fn clear_cache(&self) -> Result<usize> {
        if let Some(kind) = self.shared.coordinator.active_kind() {
            debug!("Not clearing the cache during {:?}", kind);
            return Err(Error::OperationAlreadyActive);
        }
        let removed = self.shared.cache.clear_all()?;
        let mut ledger = self.shared.ledger();
        ledger.failures.clear();
        ledger.origins.clear();
        Ok(removed)
    }

    pub fn cache_entries(&self) -> Result<Vec<CacheEntry>> {
        self.shared.cache.entries()
    }

    pub fn cache_dir(&self) -> &Path {
        self.shared.cache.dir()
    }

    /// Consecutive failed flashes of `image` since its last success.
    pub fn flash_failure_count(&self, image: &Path) -> u32 {
        self.shared
            .ledger()
            .failures
            .get(image)
            .copied()
            .unwrap_or(0)
    }
}
