//! In-process HTTP file server and polling helpers shared by the integration tests

#![allow(dead_code)]

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use axum::Router;
use futures::StreamExt;
use parking_lot::Mutex;
use qget_core::Manager;
use qget_core::types::DownloadSnapshot;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct ServerOptions {
    pub size: usize,
    pub ranges: bool,
    /// Body chunk size and pause between chunks
    pub chunk: usize,
    pub delay: Option<Duration>,
    /// Answer this many GET requests with 500 before serving
    pub fail_first: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            size: 256 * 1024,
            ranges: true,
            chunk: 16 * 1024,
            delay: None,
            fail_first: 0,
        }
    }
}

struct ServerState {
    data: Vec<u8>,
    options: ServerOptions,
    failures: AtomicUsize,
    ranges_seen: Mutex<Vec<Option<String>>>,
}

pub struct TestServer {
    addr: std::net::SocketAddr,
    state: Arc<ServerState>,
}

impl TestServer {
    pub async fn spawn(options: ServerOptions) -> Self {
        let data: Vec<u8> = (0..options.size).map(|i| (i % 251) as u8).collect();
        let state = Arc::new(ServerState {
            data,
            options,
            failures: AtomicUsize::new(0),
            ranges_seen: Mutex::new(Vec::new()),
        });

        let app = Router::new().fallback(serve).with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self, name: &str) -> String {
        format!("http://{}/files/{}", self.addr, name)
    }

    pub fn data(&self) -> &[u8] {
        &self.state.data
    }

    /// `Range` headers of every GET received so far
    pub fn ranges_seen(&self) -> Vec<Option<String>> {
        self.state.ranges_seen.lock().clone()
    }
}

async fn serve(
    State(state): State<Arc<ServerState>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let total = state.data.len();

    if method == Method::HEAD {
        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, total);
        if state.options.ranges {
            response = response.header(header::ACCEPT_RANGES, "bytes");
        }
        return response.body(Body::empty()).unwrap();
    }

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.ranges_seen.lock().push(range.clone());

    if state.failures.fetch_add(1, Ordering::SeqCst) < state.options.fail_first {
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from("injected failure"))
            .unwrap();
    }

    let requested = range
        .filter(|_| state.options.ranges)
        .and_then(|r| parse_range(&r, total));
    let (status, start, end) = match requested {
        Some((start, end)) => (StatusCode::PARTIAL_CONTENT, start, end),
        None => (StatusCode::OK, 0, total.saturating_sub(1)),
    };

    let body = if total == 0 {
        Vec::new()
    } else {
        state.data[start..=end].to_vec()
    };
    let length = body.len();
    let chunks: Vec<Bytes> = body
        .chunks(state.options.chunk.max(1))
        .map(Bytes::copy_from_slice)
        .collect();
    let delay = state.options.delay;
    let stream = futures::stream::iter(chunks).then(move |chunk| async move {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok::<_, std::io::Error>(chunk)
    });

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, length);
    if status == StatusCode::PARTIAL_CONTENT {
        response = response.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end, total),
        );
    }
    response.body(Body::from_stream(stream)).unwrap()
}

fn parse_range(value: &str, total: usize) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start: usize = start.trim().parse().ok()?;
    let end: usize = match end.trim() {
        "" => total.checked_sub(1)?,
        end => end.parse::<usize>().ok()?.min(total.checked_sub(1)?),
    };
    (start <= end).then_some((start, end))
}

/// Poll a download until `done` holds, panicking after `timeout`
pub async fn wait_for(
    manager: &Manager,
    id: u64,
    timeout: Duration,
    done: impl Fn(&DownloadSnapshot) -> bool,
) -> DownloadSnapshot {
    let deadline = Instant::now() + timeout;
    loop {
        let snapshot = manager.get_download(id).await.unwrap();
        if done(&snapshot) {
            return snapshot;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting on download {}: {:#?}", id, snapshot);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Names of the `.part` files left in `dir`
pub fn part_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.ends_with(".part"))
                .collect()
        })
        .unwrap_or_default()
}
