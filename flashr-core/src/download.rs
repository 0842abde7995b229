//! Downloads remote images into the cache.
//!
//! The body is streamed into an in-progress file in the cache directory and
//! renamed into place once complete (and verified, when a checksum URL is
//! given). Transport faults are retried a bounded number of times; a body
//! that breaks off midway is resumed with a `Range` request, and the download
//! fails if the server cannot resume, so the byte counter never goes back.

use crate::cache::{self, CacheManager, DOWNLOADING_SUFFIX, UNVERIFIED_SUFFIX};
use crate::config::DownloadConfig;
use crate::error::{Error, Result};
use crate::operation::CancelFlag;
use crate::progress::{DownloadProgress, DownloadState};
use log::{debug, info, warn};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RANGE;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const CHUNK_SIZE: usize = 1024 * 1024;
const HASH_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Outcome of one request attempt.
enum FetchError {
    /// Worth retrying: connection faults, timeouts, 5xx responses.
    Transient(String),
    Fatal(Error),
}

impl From<Error> for FetchError {
    fn from(e: Error) -> Self {
        FetchError::Fatal(e)
    }
}

pub struct Downloader {
    client: Client,
    cache: Arc<CacheManager>,
    state: Arc<DownloadState>,
    retries: u32,
    backoff: Duration,
}

impl Downloader {
    pub fn new(
        config: &DownloadConfig,
        cache: Arc<CacheManager>,
        state: Arc<DownloadState>,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.read_timeout_secs))
            .build()
            .map_err(|e| Error::DownloadFailed(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            cache,
            state,
            retries: config.retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    pub fn progress(&self) -> DownloadProgress {
        self.state.snapshot()
    }

    /// Downloads `url` into the cache and returns the local path.
    ///
    /// A cached copy is returned without downloading again. With a
    /// `checksum_url` the checksum is fetched first and a cached copy is
    /// re-hashed against it; one that no longer matches is replaced by a
    /// fresh download. A fresh download is hashed after `on_verify_start`
    /// is called, and a mismatch keeps the file aside as `<key>.unverified`
    /// for [`Downloader::continue_unverified`] or
    /// [`Downloader::discard_unverified`].
    pub fn download(
        &self,
        url: &str,
        checksum_url: Option<&str>,
        cancel: &CancelFlag,
        on_verify_start: impl FnOnce(),
    ) -> Result<PathBuf> {
        let key = cache_key(url)?;
        let expected = match checksum_url {
            Some(checksum_url) => Some(self.fetch_checksum(checksum_url, &file_name(url)?)?),
            None => None,
        };

        if let Some(path) = self.cache.lookup(&key) {
            if self.cached_copy_matches(&path, expected.as_deref(), cancel)? {
                let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                self.state.set_total(size);
                self.state.advance_to(size);
                info!("Using cached image: {}", path.display());
                return Ok(path);
            }
            warn!(
                "Cached {} does not match its checksum, downloading again",
                path.display()
            );
            self.cache.force_delete(&path)?;
        }

        let target = self.cache.reserve(&key)?;
        let mut temp = tempfile::Builder::new()
            .prefix(&format!("{}.", key))
            .suffix(DOWNLOADING_SUFFIX)
            .tempfile_in(self.cache.dir())
            .map_err(|e| Error::DownloadFailed(format!("failed to create temporary file: {}", e)))?;

        info!("Downloading {} -> {}", url, target.display());
        let written = self.fetch_with_retries(url, temp.as_file_mut(), cancel)?;
        temp.as_file()
            .sync_all()
            .map_err(|e| Error::DownloadFailed(format!("failed to flush download: {}", e)))?;
        info!("Download complete: {} bytes", written);

        if let Some(expected) = expected {
            on_verify_start();
            self.state.set_verifying(true);
            let verified = verify(temp.path(), expected, cancel);
            self.state.set_verifying(false);

            if let Err(e) = verified {
                if let Error::ChecksumMismatch { .. } = e {
                    let aside = unverified_path(&target);
                    temp.persist(&aside).map_err(|p| Error::Io(p.error))?;
                    warn!("Checksum mismatch, kept download as {}", aside.display());
                }
                return Err(e);
            }
        } else {
            debug!("No checksum URL, skipping source verification");
        }

        temp.persist(&target).map_err(|e| Error::Io(e.error))?;
        self.cache.record_completed(&key, written)?;
        Ok(target)
    }

    fn cached_copy_matches(
        &self,
        path: &Path,
        expected: Option<&str>,
        cancel: &CancelFlag,
    ) -> Result<bool> {
        let Some(expected) = expected else {
            return Ok(true);
        };
        info!("Checking cached {} against its checksum", path.display());
        self.state.set_verifying(true);
        let actual = sha256_file(path, cancel);
        self.state.set_verifying(false);
        Ok(actual? == expected)
    }

    /// Accepts a download whose checksum did not match.
    pub fn continue_unverified(&self, url: &str) -> Result<PathBuf> {
        let key = cache_key(url)?;
        let target = self.cache.reserve(&key)?;
        let aside = unverified_path(&target);
        if !aside.is_file() {
            return Err(Error::Cache(format!("no unverified download for {}", key)));
        }

        fs::rename(&aside, &target)?;
        let size = fs::metadata(&target)?.len();
        warn!("Using {} without checksum verification", target.display());
        self.cache.record_completed(&key, size)?;
        Ok(target)
    }

    /// Deletes a download whose checksum did not match.
    pub fn discard_unverified(&self, url: &str) -> Result<()> {
        let key = cache_key(url)?;
        let aside = unverified_path(&self.cache.dir().join(&key));
        match fs::remove_file(&aside) {
            Ok(()) => {
                info!("Discarded {}", aside.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn fetch_with_retries(&self, url: &str, file: &mut File, cancel: &CancelFlag) -> Result<u64> {
        let mut written: u64 = 0;
        let mut total: Option<u64> = None;
        let mut attempt: u32 = 0;

        loop {
            cancel.check()?;
            match self.fetch(url, file, &mut written, &mut total, cancel) {
                Ok(()) => return Ok(written),
                Err(FetchError::Fatal(e)) => return Err(e),
                Err(FetchError::Transient(message)) => {
                    attempt += 1;
                    if attempt > self.retries {
                        return Err(Error::DownloadFailed(format!(
                            "{} (gave up after {} retries)",
                            message, self.retries
                        )));
                    }
                    warn!(
                        "Download interrupted: {}; retry {}/{}",
                        message, attempt, self.retries
                    );
                    sleep_with_cancel(self.backoff * attempt, cancel)?;
                }
            }
        }
    }

    /// One request. Appends to `file` and advances `written`.
    fn fetch(
        &self,
        url: &str,
        file: &mut File,
        written: &mut u64,
        total: &mut Option<u64>,
        cancel: &CancelFlag,
    ) -> std::result::Result<(), FetchError> {
        let resuming = *written > 0;
        let mut request = self.client.get(url);
        if resuming {
            debug!("Resuming at byte {}", written);
            request = request.header(RANGE, format!("bytes={}-", written));
        }

        let mut response = request
            .send()
            .map_err(|e| FetchError::Transient(format!("request failed: {}", e)))?;
        let status = response.status();

        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            return Err(FetchError::Transient(format!("server returned {}", status)));
        }
        if !status.is_success() {
            return Err(FetchError::Fatal(Error::DownloadFailed(format!(
                "server returned {}",
                status
            ))));
        }
        if resuming && status != StatusCode::PARTIAL_CONTENT {
            return Err(FetchError::Fatal(Error::DownloadFailed(format!(
                "connection lost after {} bytes and the server does not support resuming",
                written
            ))));
        }

        if !resuming {
            *total = response.content_length();
            self.state.set_total(total.unwrap_or(0));
            match total {
                Some(t) => info!("Download size: {} bytes", t),
                None => info!("Download size unknown"),
            }
        }

        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            cancel.check()?;
            let n = response
                .read(&mut buffer)
                .map_err(|e| FetchError::Transient(format!("read failed: {}", e)))?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n]).map_err(|e| {
                FetchError::Fatal(Error::DownloadFailed(format!(
                    "failed to write download: {}",
                    e
                )))
            })?;
            *written += n as u64;
            self.state.advance_to(*written);
        }

        match *total {
            Some(t) if *written < t => Err(FetchError::Transient(format!(
                "connection closed after {} of {} bytes",
                written, t
            ))),
            _ => Ok(()),
        }
    }

    fn fetch_checksum(&self, url: &str, key: &str) -> Result<String> {
        debug!("Fetching checksum from {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::DownloadFailed(format!("failed to fetch checksum: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::DownloadFailed(format!(
                "checksum fetch returned {}",
                response.status()
            )));
        }
        let content = response
            .text()
            .map_err(|e| Error::DownloadFailed(format!("failed to read checksum: {}", e)))?;
        parse_checksum(&content, key)
    }
}

/// The cache key for `url`: a digest of the URL without its query or
/// fragment, then the file name it points at.
pub fn cache_key(url: &str) -> Result<String> {
    let source = url.split(['?', '#']).next().unwrap_or(url);
    Ok(cache::source_key(source.as_bytes(), &file_name(url)?))
}

/// The last path segment of `url`, used to find its line in a checksum file.
pub fn file_name(url: &str) -> Result<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .filter(|_| path.contains('/'))
        .ok_or_else(|| Error::DownloadFailed(format!("no file name in URL {}", url)))?;
    Ok(name.to_string())
}

fn verify(path: &Path, expected: String, cancel: &CancelFlag) -> Result<()> {
    info!("Verifying SHA-256 of {}", path.display());
    let actual = sha256_file(path, cancel)?;
    if actual != expected {
        return Err(Error::ChecksumMismatch { expected, actual });
    }
    info!("Checksum verified");
    Ok(())
}

fn unverified_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(UNVERIFIED_SUFFIX);
    PathBuf::from(name)
}

/// Extracts the SHA-256 for `filename` from a checksum file.
///
/// Accepted line formats are `<hash>`, `<hash>  <name>`, `<hash> *<name>`
/// and the BSD `SHA256 (<name>) = <hash>`. With several lines, the one
/// naming `filename` wins.
pub fn parse_checksum(content: &str, filename: &str) -> Result<String> {
    let mut candidates: Vec<(String, Option<String>)> = Vec::new();

    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("SHA256 (") {
            if let Some((name, hash)) = rest.split_once(") = ") {
                candidates.push((hash.trim().to_string(), Some(name.to_string())));
            }
            continue;
        }
        let mut parts = line.splitn(2, char::is_whitespace);
        let hash = parts.next().unwrap_or_default().to_string();
        let name = parts
            .next()
            .map(|n| n.trim().trim_start_matches('*').to_string())
            .filter(|n| !n.is_empty());
        candidates.push((hash, name));
    }

    let matches_name = |name: &str| name == filename || name.rsplit('/').next() == Some(filename);
    let hash = match candidates
        .iter()
        .find(|(_, name)| name.as_deref().is_some_and(matches_name))
    {
        Some((hash, _)) => hash.clone(),
        None if candidates.len() == 1 => candidates[0].0.clone(),
        None => {
            return Err(Error::DownloadFailed(format!(
                "checksum file has no entry for {}",
                filename
            )));
        }
    };

    let hash = hash.to_ascii_lowercase();
    if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::DownloadFailed(format!(
            "invalid SHA-256 in checksum file: {}",
            hash
        )));
    }
    Ok(hash)
}

/// Hex SHA-256 of a file, checking `cancel` between chunks.
pub fn sha256_file(path: &Path, cancel: &CancelFlag) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        cancel.check()?;
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn sleep_with_cancel(duration: Duration, cancel: &CancelFlag) -> Result<()> {
    let deadline = Instant::now() + duration;
    loop {
        cancel.check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}
