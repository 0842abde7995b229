#![allow(dead_code)]

use flashr_core::auth::Authorizer;
use flashr_core::os_options::MountRelease;
use flashr_core::device::format_size;
use flashr_core::platform::DeviceEnumerator;
use flashr_core::{BlockDevice, BusType, Config};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// How the mock server answers one path.
#[derive(Clone, Default)]
pub struct Route {
    body: Vec<u8>,
    chunk: Option<(usize, Duration)>,
    omit_length: bool,
    fail_first: usize,
    truncate_first: Option<usize>,
    ranges: bool,
}

impl Route {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Sends the body `size` bytes at a time, sleeping `delay` between them.
    pub fn chunked(mut self, size: usize, delay: Duration) -> Self {
        self.chunk = Some((size, delay));
        self
    }

    pub fn without_length(mut self) -> Self {
        self.omit_length = true;
        self
    }

    /// Answers the first `n` requests with 503.
    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// Drops the connection after `n` body bytes on the first successful
    /// response.
    pub fn truncated_first(mut self, n: usize) -> Self {
        self.truncate_first = Some(n);
        self
    }

    /// Honors `Range: bytes=N-` with 206.
    pub fn with_ranges(mut self) -> Self {
        self.ranges = true;
        self
    }
}

#[derive(Default)]
struct Log {
    hits: HashMap<String, usize>,
    ranges: HashMap<String, Vec<String>>,
    truncated: HashMap<String, bool>,
}

pub struct MockServer {
    address: SocketAddr,
    log: Arc<Mutex<Log>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MockServer {
    pub fn start(routes: Vec<(&str, Route)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let address = listener.local_addr().unwrap();
        let routes: Arc<HashMap<String, Route>> = Arc::new(
            routes
                .into_iter()
                .map(|(p, r)| (p.to_string(), r))
                .collect(),
        );
        let log = Arc::new(Mutex::new(Log::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = {
            let log = log.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            let routes = routes.clone();
                            let log = log.clone();
                            thread::spawn(move || serve(stream, &routes, &log));
                        }
                        Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(5));
                        }
                        Err(_) => break,
                    }
                }
            })
        };

        MockServer {
            address,
            log,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.address, path)
    }

    pub fn hits(&self, path: &str) -> usize {
        *self.log.lock().unwrap().hits.get(path).unwrap_or(&0)
    }

    /// `Range` headers received for `path`, in order.
    pub fn ranges(&self, path: &str) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .ranges
            .get(path)
            .cloned()
            .unwrap_or_default()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Option<String> {
    let mut request = Vec::new();
    let mut buffer = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buffer).ok()?;
        if n == 0 {
            return None;
        }
        request.extend_from_slice(&buffer[..n]);
    }
    Some(String::from_utf8_lossy(&request).into_owned())
}

fn serve(mut stream: TcpStream, routes: &HashMap<String, Route>, log: &Mutex<Log>) {
    stream.set_nonblocking(false).ok();
    let Some(request) = read_request(&mut stream) else {
        return;
    };
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let range_start = request.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.eq_ignore_ascii_case("range") {
            return None;
        }
        let value = value.trim().to_string();
        let start = value
            .strip_prefix("bytes=")?
            .trim_end_matches('-')
            .parse::<usize>()
            .ok()?;
        Some((value, start))
    });

    let Some(route) = routes.get(&path) else {
        let _ = stream.write_all(
            b"HTTP/1.1 404 Not Found\r\ncontent-length: 9\r\nconnection: close\r\n\r\nNot Found",
        );
        return;
    };

    let (hit, truncate) = {
        let mut log = log.lock().unwrap();
        let hit = {
            let count = log.hits.entry(path.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if let Some((value, _)) = &range_start {
            log.ranges.entry(path.clone()).or_default().push(value.clone());
        }
        let truncate = if hit > route.fail_first && !log.truncated.contains_key(&path) {
            route.truncate_first.inspect(|_| {
                log.truncated.insert(path.clone(), true);
            })
        } else {
            None
        };
        (hit, truncate)
    };

    if hit <= route.fail_first {
        let _ = stream.write_all(
            b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        );
        return;
    }

    let (status, body) = match range_start {
        Some((_, start)) if route.ranges && start <= route.body.len() => {
            ("206 Partial Content", &route.body[start..])
        }
        _ => ("200 OK", &route.body[..]),
    };

    let mut head = format!("HTTP/1.1 {}\r\nconnection: close\r\n", status);
    if status.starts_with("206") {
        head.push_str(&format!(
            "content-range: bytes {}-{}/{}\r\n",
            route.body.len() - body.len(),
            route.body.len().saturating_sub(1),
            route.body.len()
        ));
    }
    if !route.omit_length {
        head.push_str(&format!("content-length: {}\r\n", body.len()));
    }
    head.push_str("\r\n");
    if stream.write_all(head.as_bytes()).is_err() {
        return;
    }

    let body = match truncate {
        Some(n) => &body[..n.min(body.len())],
        None => body,
    };
    match route.chunk {
        Some((size, delay)) => {
            for piece in body.chunks(size) {
                if stream.write_all(piece).is_err() {
                    return;
                }
                let _ = stream.flush();
                thread::sleep(delay);
            }
        }
        None => {
            let _ = stream.write_all(body);
        }
    }
    let _ = stream.flush();
}

/// Deterministic, poorly compressible test data.
pub fn pattern(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x2545_f491;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

pub fn test_config(cache_dir: &Path) -> Config {
    let mut config = Config::default();
    config.cache.dir = cache_dir.to_path_buf();
    config.flash.block_size = 64 * 1024;
    config.monitor.poll_interval_ms = 100;
    config.download.retry_backoff_ms = 10;
    config
}

pub fn removable(path: &Path, size: u64) -> BlockDevice {
    BlockDevice {
        path: path.to_path_buf(),
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        model: "Test Card Reader".to_string(),
        size,
        size_formatted: format_size(size),
        is_removable: true,
        is_system: false,
        bus_type: BusType::Usb,
    }
}

/// A device table the test edits while the engine runs.
#[derive(Default)]
pub struct FakeEnumerator {
    devices: Mutex<Vec<BlockDevice>>,
}

impl FakeEnumerator {
    pub fn with(devices: Vec<BlockDevice>) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(devices),
        })
    }

    pub fn unplug(&self, path: &Path) {
        self.devices.lock().unwrap().retain(|d| d.path != path);
    }
}

impl DeviceEnumerator for FakeEnumerator {
    fn list_devices(&self) -> flashr_core::Result<Vec<BlockDevice>> {
        Ok(self.devices.lock().unwrap().clone())
    }
}

/// Answers every request the same way and remembers who asked.
pub struct FakeAuthorizer {
    grant: bool,
    calls: AtomicUsize,
    asked: Mutex<Vec<PathBuf>>,
    /// Handed out by `open_device` instead of letting the flasher open.
    descriptor: Mutex<Option<std::fs::File>>,
    events: Mutex<Vec<String>>,
}

impl FakeAuthorizer {
    fn with_grant(grant: bool) -> Self {
        Self {
            grant,
            calls: AtomicUsize::new(0),
            asked: Mutex::new(Vec::new()),
            descriptor: Mutex::new(None),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn granting() -> Arc<Self> {
        Arc::new(Self::with_grant(true))
    }

    pub fn dismissing() -> Arc<Self> {
        Arc::new(Self::with_grant(false))
    }

    /// Grants by opening `target` itself, the way a privileged helper would.
    pub fn handing_out(target: &Path) -> Arc<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(target)
            .unwrap();
        let fake = Self::with_grant(true);
        *fake.descriptor.lock().unwrap() = Some(file);
        Arc::new(fake)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn asked(&self) -> Vec<PathBuf> {
        self.asked.lock().unwrap().clone()
    }

    /// `authorize`, `release`, `open` and `revoke` in call order.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: &str) {
        self.events.lock().unwrap().push(event.to_string());
    }
}

impl Authorizer for FakeAuthorizer {
    fn authorize(&self, device: &Path) -> flashr_core::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.asked.lock().unwrap().push(device.to_path_buf());
        self.record("authorize");
        Ok(self.grant)
    }

    fn release_mounts(&self, _device: &Path) -> MountRelease {
        self.record("release");
        MountRelease::default()
    }

    fn open_device(&self, _device: &Path) -> flashr_core::Result<Option<std::fs::File>> {
        self.record("open");
        Ok(self.descriptor.lock().unwrap().take())
    }

    fn revoke(&self, _device: &Path) -> flashr_core::Result<()> {
        self.record("revoke");
        Ok(())
    }

    fn mechanism(&self) -> &'static str {
        "fake"
    }
}
