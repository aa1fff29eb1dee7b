use crate::config::{ConfigError, Options, parse_options};
use crate::fuzzer::{Fuzzer, FuzzerDecorator, FuzzerError, SharedFuzzer};
use serde::Deserialize;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

const CLOSE_PAGE: &str = "<script>window.close();</script>";
const MAX_REQUEST: usize = 16 * 1024;
const PORT_ATTEMPTS: u16 = 100;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct HttpServeOptions {
    /// First port to try; `0` picks an ephemeral port.
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Prefix each served test with a meta refresh to the next one.
    #[serde(default)]
    pub refresh: bool,
    /// Directory served for every path other than `/`.
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
}

#[derive(Default)]
struct ServeState {
    index: u64,
    test: Option<Vec<u8>>,
}

struct Server {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Transports generated tests over HTTP, for SUTs such as browsers that load
/// their input from a URL.
///
/// Entering the scope starts a server on a helper thread; `generate` returns
/// the server's URL, and every `GET /` asks the wrapped fuzzer for a fresh
/// test and responds with it. Once the fuzzer is exhausted the response
/// closes the page and `generate` reports exhaustion.
pub struct HttpServeDecorator {
    options: HttpServeOptions,
    state: Arc<Mutex<ServeState>>,
    port: Option<u16>,
    server: Option<Server>,
}

impl HttpServeDecorator {
    pub fn new(options: HttpServeOptions) -> Self {
        Self {
            options,
            state: Arc::default(),
            port: None,
            server: None,
        }
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        Ok(Self::new(parse_options("HttpServeDecorator", options)?))
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    fn state(&self) -> MutexGuard<'_, ServeState> {
        lock(&self.state)
    }

    fn bind(&self) -> io::Result<TcpListener> {
        if self.options.port == 0 {
            return TcpListener::bind((self.options.host.as_str(), 0));
        }
        let mut last_error = None;
        for offset in 0..PORT_ATTEMPTS {
            let port = self.options.port.saturating_add(offset);
            match TcpListener::bind((self.options.host.as_str(), port)) {
                Ok(listener) => return Ok(listener),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| io::Error::other("no free port")))
    }

    fn stop(&mut self) {
        if let Some(server) = self.server.take() {
            server.stop.store(true, Ordering::SeqCst);
            if server.handle.join().is_err() {
                warn!("HTTP server thread panicked");
            }
            debug!("HTTP server stopped");
        }
    }
}

fn lock(state: &Mutex<ServeState>) -> MutexGuard<'_, ServeState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Handler {
    fuzzer: SharedFuzzer,
    state: Arc<Mutex<ServeState>>,
    refresh: bool,
    static_dir: Option<PathBuf>,
}

impl Handler {
    fn serve(&mut self, listener: TcpListener, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = self.handle(stream) {
                        debug!(error = %e, "HTTP request failed");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    warn!(error = %e, "HTTP accept failed");
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
        }
    }

    fn handle(&mut self, mut stream: TcpStream) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let target = read_request_target(&mut stream)?;
        let path = target.split('?').next().unwrap_or("/");
        if path == "/" {
            let body = self.next_page();
            return respond(&mut stream, "200 OK", "text/html", &body);
        }
        match self.static_file(path) {
            Some(content) => respond(&mut stream, "200 OK", content_type(path), &content),
            None => respond(&mut stream, "404 Not Found", "text/plain", b"not found"),
        }
    }

    fn next_page(&mut self) -> Vec<u8> {
        let index = lock(&self.state).index;
        let generated = match self.fuzzer.generate(index) {
            Ok(test) => test,
            Err(e) => {
                warn!(error = %e, "fuzzer failed while serving a test");
                None
            }
        };
        let mut state = lock(&self.state);
        state.test = generated.clone();
        let Some(test) = generated else {
            return CLOSE_PAGE.as_bytes().to_vec();
        };
        state.index += 1;
        if !self.refresh {
            return test;
        }
        let mut page =
            format!("<meta http-equiv=\"refresh\" content=\"1;url=?index={}\">", state.index).into_bytes();
        page.extend_from_slice(&test);
        page
    }

    fn static_file(&self, path: &str) -> Option<Vec<u8>> {
        let root = self.static_dir.as_ref()?;
        let relative = Path::new(path.trim_start_matches('/'));
        if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
            return None;
        }
        std::fs::read(root.join(relative)).ok()
    }
}

fn read_request_target(stream: &mut TcpStream) -> io::Result<String> {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") && request.len() < MAX_REQUEST {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&request);
    let mut parts = text.lines().next().unwrap_or_default().split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some(target)) => Ok(target.to_string()),
        _ => Err(io::Error::new(io::ErrorKind::InvalidData, "unsupported request")),
    }
}

fn respond(stream: &mut TcpStream, status: &str, content_type: &str, body: &[u8]) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

fn content_type(path: &str) -> &'static str {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("html" | "htm") => "text/html",
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

impl FuzzerDecorator for HttpServeDecorator {
    fn enter(&mut self, inner: &mut SharedFuzzer) -> Result<(), FuzzerError> {
        inner.enter()?;
        *self.state() = ServeState::default();

        let listener = self.bind()?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        let stop = Arc::new(AtomicBool::new(false));
        let mut handler = Handler {
            fuzzer: inner.clone(),
            state: self.state.clone(),
            refresh: self.options.refresh,
            static_dir: self.options.static_dir.clone(),
        };
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("http-serve".to_string())
            .spawn(move || handler.serve(listener, thread_stop))?;

        debug!(port, "HTTP server started");
        self.port = Some(port);
        self.server = Some(Server { stop, handle });
        Ok(())
    }

    fn exit(&mut self, inner: &mut SharedFuzzer) -> Result<(), FuzzerError> {
        self.stop();
        inner.exit()
    }

    fn generate(&mut self, _inner: &mut SharedFuzzer, index: u64) -> Result<Option<Vec<u8>>, FuzzerError> {
        let Some(port) = self.port else {
            return Err(FuzzerError::Other("HTTP server is not running".to_string()));
        };
        let state = self.state();
        if index != 0 && state.test.is_none() {
            return Ok(None);
        }
        Ok(Some(
            format!("http://localhost:{port}/?index={}", state.index).into_bytes(),
        ))
    }

    fn index(&self, _inner: &SharedFuzzer) -> Option<u64> {
        Some(self.state().index)
    }

    fn test(&self, _inner: &SharedFuzzer) -> Option<Vec<u8>> {
        self.state().test.clone()
    }

    fn provides_test(&self, _inner: &SharedFuzzer) -> bool {
        true
    }
}

impl Drop for HttpServeDecorator {
    fn drop(&mut self) {
        self.stop();
    }
}
