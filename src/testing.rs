//! Counting stub collaborators and a canned HTTP server for tests.

use crate::clock::ManualClock;
use crate::scrape::TitleResolver;
use crate::search::{ComparableSearch, SearchOutcome};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone)]
pub enum StubReply {
    Outcome(SearchOutcome),
    Unreachable(String),
}

#[derive(Debug)]
pub struct StubSearch {
    calls: AtomicUsize,
    queries: Mutex<Vec<String>>,
    reply: Mutex<StubReply>,
    delay: Duration,
}

impl StubSearch {
    pub fn with_samples(samples: Vec<f64>) -> Arc<Self> {
        Self::replying(StubReply::Outcome(SearchOutcome::Samples(samples)), Duration::ZERO)
    }

    pub fn replying(reply: StubReply, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
            reply: Mutex::new(reply),
            delay,
        })
    }

    pub fn set_reply(&self, reply: StubReply) {
        *self.reply.lock() = reply;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl ComparableSearch for StubSearch {
    async fn search(&self, query: &str) -> Result<SearchOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().push(query.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let reply = self.reply.lock().clone();
        match reply {
            StubReply::Outcome(outcome) => Ok(outcome),
            StubReply::Unreachable(reason) => Err(anyhow!(reason)),
        }
    }
}

#[derive(Debug)]
pub struct StubResolver {
    calls: AtomicUsize,
    title: Mutex<Option<String>>,
    delay: Duration,
}

impl StubResolver {
    pub fn titled(title: Option<&str>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            title: Mutex::new(title.map(str::to_string)),
            delay,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TitleResolver for StubResolver {
    async fn resolve(&self, _item_url: &str) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.title.lock().clone())
    }
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0)
            .single()
            .unwrap_or_else(Utc::now),
    ))
}

/// Raw HTTP/1.1 response with a closing connection.
pub fn http_response(status: u16, headers: &[(&str, &str)], body: &str) -> String {
    let mut raw = format!(
        "HTTP/1.1 {status} Canned\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    for (name, value) in headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    raw.push_str("\r\n");
    raw.push_str(body);
    raw
}

/// Local server answering each connection with the next canned response.
/// The last response repeats once the list runs out.
#[derive(Debug)]
pub struct CannedHttp {
    pub base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl CannedHttp {
    pub async fn start(responses: Vec<String>) -> Self {
        assert!(!responses.is_empty());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        tokio::spawn(async move {
            let mut served = 0;
            while let Ok((mut socket, _)) = listener.accept().await {
                let request = read_request(&mut socket).await;
                seen.lock().push(request.to_lowercase());
                let reply = &responses[served.min(responses.len() - 1)];
                served += 1;
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        Self { base_url, requests }
    }

    pub fn hits(&self) -> usize {
        self.requests.lock().len()
    }

    /// Lower-cased request heads and bodies, in arrival order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let Ok(n) = socket.read(&mut chunk).await else { break };
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&raw);
        if let Some(head_end) = text.find("\r\n\r\n") {
            let body_len = text[..head_end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if raw.len() >= head_end + 4 + body_len {
                break;
            }
        }
    }
    String::from_utf8_lossy(&raw).into_owned()
}
