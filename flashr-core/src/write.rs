//! Writing an image to a device and verifying it.
//!
//! The writer streams the image in fixed blocks through an aligned buffer,
//! hashing the source bytes on the way. Verification reopens the target,
//! drops its cached pages, reads back exactly the image length and compares
//! digests, so it never depends on re-reading the image. Raw targets are read
//! back in whole sectors; only the image's bytes are hashed.

use crate::error::{Error, Result};
use crate::operation::CancelFlag;
use crate::os_options::{self, TargetKind};
use crate::progress::{FlashProgress, FlashState};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

/// Direct I/O needs buffers and lengths aligned to the logical sector size;
/// 4 KiB covers every device we target.
const ALIGNMENT: usize = 4096;
const SYNC_INTERVAL: u64 = 32 * 1024 * 1024;
const LOG_INTERVAL: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashSummary {
    pub bytes_written: u64,
    /// SHA-256 of the image as written.
    pub sha256: String,
    pub verified: bool,
}

/// A block-sized buffer whose usable slice starts on an aligned address.
struct AlignedBuffer {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBuffer {
    fn new(len: usize) -> Self {
        let storage = vec![0u8; len + ALIGNMENT];
        let offset = storage.as_ptr().align_offset(ALIGNMENT);
        Self {
            storage,
            offset,
            len,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }
}

/// `len` rounded up to a whole number of sectors.
fn round_to_sectors(len: usize, sector: usize) -> usize {
    len.div_ceil(sector) * sector
}

pub struct Flasher {
    state: Arc<FlashState>,
    block_size: usize,
}

impl Flasher {
    /// `block_size` is rounded up to a multiple of the direct I/O alignment.
    pub fn new(state: Arc<FlashState>, block_size: usize) -> Self {
        let block_size = block_size.max(ALIGNMENT).div_ceil(ALIGNMENT) * ALIGNMENT;
        Self { state, block_size }
    }

    pub fn progress(&self) -> FlashProgress {
        self.state.snapshot()
    }

    /// Writes `image` to `device`, then optionally verifies it.
    ///
    /// `granted` is a descriptor for `device` opened by an authorizer; when
    /// absent the device is opened here. `capacity` is the size reported by
    /// enumeration; the OS-reported size wins when it is available.
    /// `on_verify_start` runs once, right before the read-back begins.
    #[allow(clippy::too_many_arguments)]
    pub fn flash(
        &self,
        image: &Path,
        device: &Path,
        granted: Option<File>,
        capacity: Option<u64>,
        verify: bool,
        cancel: &CancelFlag,
        on_verify_start: impl FnOnce(),
    ) -> Result<FlashSummary> {
        let image_file = File::open(image)?;
        let image_len = image_file.metadata()?.len();
        if image_len == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{} is empty", image.display()),
            )));
        }

        let kind = os_options::target_kind(device).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::DeviceNotFound(device.to_path_buf()),
            _ => Error::Io(e),
        })?;
        let was_granted = granted.is_some();
        let mut target = match granted {
            Some(file) => {
                debug!("Writing through a granted descriptor for {}", device.display());
                os_options::adopt_granted(file, kind)
            }
            None => os_options::open_for_write(device, kind)?,
        };
        // Without the authorizer the device cannot be reopened, so the
        // read-back goes through a duplicate of the granted descriptor.
        let reopened = if verify && was_granted {
            Some(target.try_clone()?)
        } else {
            None
        };

        let capacity = match os_options::device_capacity(&target, kind) {
            Ok(Some(size)) => Some(size),
            Ok(None) => capacity,
            Err(e) => {
                warn!("Could not query capacity of {}: {}", device.display(), e);
                capacity
            }
        };
        if let Some(capacity) = capacity {
            if image_len > capacity {
                return Err(Error::ImageTooLarge {
                    image: image_len,
                    capacity,
                });
            }
        }

        self.state.set_total(image_len);
        info!(
            "Writing {} ({} bytes) to {}",
            image.display(),
            image_len,
            device.display()
        );

        let sha256 = self.write_blocks(image_file, image_len, &mut target, kind, cancel)?;
        if kind.supports_sync() {
            target
                .sync_all()
                .map_err(|source| Error::WriteFailed {
                    offset: image_len,
                    source,
                })?;
        }
        drop(target);
        info!("Wrote {} bytes, sha256 {}", image_len, sha256);

        if verify {
            self.state.set_verifying(true);
            on_verify_start();
            let read_back = self.read_back(device, reopened, kind, image_len, cancel)?;
            if read_back != sha256 {
                warn!(
                    "Verification of {} failed: expected {}, read {}",
                    device.display(),
                    sha256,
                    read_back
                );
                return Err(Error::VerificationMismatch);
            }
            info!("Verified {} bytes on {}", image_len, device.display());
        }

        Ok(FlashSummary {
            bytes_written: image_len,
            sha256,
            verified: verify,
        })
    }

    fn write_blocks(
        &self,
        image: File,
        image_len: u64,
        target: &mut File,
        kind: TargetKind,
        cancel: &CancelFlag,
    ) -> Result<String> {
        let mut reader = BufReader::with_capacity(self.block_size, image);
        let mut buffer = AlignedBuffer::new(self.block_size);
        let buffer = buffer.as_mut_slice();
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut last_sync: u64 = 0;
        let mut last_log: u64 = 0;

        while written < image_len {
            cancel.check()?;

            let to_read = (image_len - written).min(self.block_size as u64) as usize;
            reader.read_exact(&mut buffer[..to_read])?;
            hasher.update(&buffer[..to_read]);

            let to_write = if kind.needs_whole_sectors() && to_read % ALIGNMENT != 0 {
                let padded = to_read.div_ceil(ALIGNMENT) * ALIGNMENT;
                buffer[to_read..padded].fill(0);
                padded
            } else {
                to_read
            };

            target
                .write_all(&buffer[..to_write])
                .map_err(|source| Error::WriteFailed {
                    offset: written,
                    source,
                })?;
            written += to_read as u64;

            if kind.supports_sync() && written - last_sync >= SYNC_INTERVAL {
                target
                    .sync_data()
                    .map_err(|source| Error::WriteFailed {
                        offset: written,
                        source,
                    })?;
                last_sync = written;
            }
            self.state.advance_written(written);

            if written - last_log >= LOG_INTERVAL {
                debug!("Written {} of {} bytes", written, image_len);
                last_log = written;
            }
        }

        target.flush().map_err(|source| Error::WriteFailed {
            offset: written,
            source,
        })?;
        Ok(hex::encode(hasher.finalize()))
    }

    fn read_back(
        &self,
        device: &Path,
        reopened: Option<File>,
        kind: TargetKind,
        image_len: u64,
        cancel: &CancelFlag,
    ) -> Result<String> {
        let mut source = match reopened {
            Some(mut file) => {
                file.seek(SeekFrom::Start(0))?;
                file
            }
            None => os_options::open_for_read(device, kind)?,
        };
        os_options::drop_cached_pages(&source, image_len);

        let sector = if kind.needs_whole_sectors() {
            os_options::sector_size(&source, kind).unwrap_or(ALIGNMENT)
        } else {
            1
        };
        let mut buffer = AlignedBuffer::new(round_to_sectors(self.block_size, sector));
        let buffer = buffer.as_mut_slice();
        let mut hasher = Sha256::new();
        let mut verified: u64 = 0;

        while verified < image_len {
            cancel.check()?;

            let want = (image_len - verified).min(self.block_size as u64) as usize;
            let request = round_to_sectors(want, sector);
            let n = source.read(&mut buffer[..request])?;
            if n == 0 {
                warn!(
                    "{} ended after {} of {} bytes",
                    device.display(),
                    verified,
                    image_len
                );
                return Err(Error::VerificationMismatch);
            }
            let n = n.min(want);
            hasher.update(&buffer[..n]);
            verified += n as u64;
            self.state.advance_verified(verified);
        }

        Ok(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with(dir: &Path, name: &str, len: usize) -> std::path::PathBuf {
        let path = dir.join(name);
        let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn writes_and_verifies_into_larger_target() {
        let dir = tempfile::tempdir().unwrap();
        let image = image_with(dir.path(), "test.img", 300_000);
        let target = dir.path().join("disk");
        let file = File::create(&target).unwrap();
        file.set_len(1 << 20).unwrap();
        drop(file);

        let state = Arc::new(FlashState::default());
        let flasher = Flasher::new(Arc::clone(&state), 64 * 1024);
        let mut verify_started = false;
        let summary = flasher
            .flash(
                &image,
                &target,
                None,
                Some(1 << 20),
                true,
                &CancelFlag::new(),
                || verify_started = true,
            )
            .unwrap();

        assert!(verify_started);
        assert_eq!(summary.bytes_written, 300_000);
        let snap = flasher.progress();
        assert_eq!(snap.written_bytes, 300_000);
        assert_eq!(snap.verified_bytes, 300_000);
        assert_eq!(snap.percent, Some(100.0));

        let on_disk = std::fs::read(&target).unwrap();
        assert_eq!(on_disk.len(), 1 << 20);
        assert_eq!(&on_disk[..300_000], &std::fs::read(&image).unwrap()[..]);
    }

    #[test]
    fn refuses_image_larger_than_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let image = image_with(dir.path(), "big.img", 8192);
        let target = dir.path().join("disk");
        File::create(&target).unwrap();

        let flasher = Flasher::new(Arc::new(FlashState::default()), 64 * 1024);
        let err = flasher
            .flash(&image, &target, None, Some(4096), false, &CancelFlag::new(), || {})
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ImageTooLarge {
                image: 8192,
                capacity: 4096
            }
        ));
        assert_eq!(std::fs::metadata(&target).unwrap().len(), 0);
    }

    #[test]
    fn empty_image_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let image = image_with(dir.path(), "empty.img", 0);
        let target = dir.path().join("disk");
        File::create(&target).unwrap();

        let flasher = Flasher::new(Arc::new(FlashState::default()), 64 * 1024);
        let err = flasher
            .flash(&image, &target, None, None, false, &CancelFlag::new(), || {})
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn cancelled_before_first_block() {
        let dir = tempfile::tempdir().unwrap();
        let image = image_with(dir.path(), "test.img", 4096);
        let target = dir.path().join("disk");
        File::create(&target).unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();
        let state = Arc::new(FlashState::default());
        let flasher = Flasher::new(Arc::clone(&state), 64 * 1024);
        let err = flasher
            .flash(&image, &target, None, None, true, &cancel, || {})
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(state.snapshot().written_bytes, 0);
    }

    #[cfg(unix)]
    #[test]
    fn short_read_back_is_a_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let image = image_with(dir.path(), "test.img", 10_000);

        let flasher = Flasher::new(Arc::new(FlashState::default()), 64 * 1024);
        let err = flasher
            .flash(
                &image,
                Path::new("/dev/null"),
                None,
                None,
                true,
                &CancelFlag::new(),
                || {},
            )
            .unwrap_err();
        assert!(matches!(err, Error::VerificationMismatch));
    }

    #[test]
    fn block_size_is_aligned() {
        let flasher = Flasher::new(Arc::new(FlashState::default()), 5000);
        assert_eq!(flasher.block_size, 8192);
    }

    #[test]
    fn writes_and_verifies_through_granted_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let image = image_with(dir.path(), "test.img", 70_000);
        let target = dir.path().join("disk");
        File::create(&target).unwrap().set_len(1 << 17).unwrap();
        let granted = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&target)
            .unwrap();

        let flasher = Flasher::new(Arc::new(FlashState::default()), 16 * 1024);
        let summary = flasher
            .flash(
                &image,
                &target,
                Some(granted),
                None,
                true,
                &CancelFlag::new(),
                || {},
            )
            .unwrap();

        assert!(summary.verified);
        assert_eq!(flasher.progress().verified_bytes, 70_000);
        let on_disk = std::fs::read(&target).unwrap();
        assert_eq!(&on_disk[..70_000], &std::fs::read(&image).unwrap()[..]);
    }

    #[test]
    fn read_lengths_round_up_to_whole_sectors() {
        assert_eq!(round_to_sectors(1, 512), 512);
        assert_eq!(round_to_sectors(512, 512), 512);
        assert_eq!(round_to_sectors(70_000, 4096), 73_728);
        assert_eq!(round_to_sectors(70_000, 1), 70_000);
    }
}
