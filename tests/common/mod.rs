//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use zcp::api::{ApiClient, RetryPolicy};
use zcp::auth::{AuthProvider, Credential, TokenGuard, DEFAULT_RENEWAL_THRESHOLD};
use zcp::protocol::{check_header, payload_length, Envelope, DATA_HEADER_SIZE, HEADER_SIZE};
use zcp::sender::SenderClient;
use zcp::Result;

pub const INITIAL_TOKEN: &str = "initial-token";

/// Hands out `token-N`, valid for an hour, N counting calls.
pub struct CountingProvider {
    calls: AtomicU32,
}

impl CountingProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthProvider for CountingProvider {
    async fn get_token(&self) -> Result<Credential> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Credential::new(
            format!("token-{}", n),
            SystemTime::now() + Duration::from_secs(3600),
        ))
    }
}

/// A guard holding [`INITIAL_TOKEN`] with an hour to live.
pub fn guard(provider: Arc<CountingProvider>) -> Arc<TokenGuard> {
    Arc::new(TokenGuard::with_credential(
        provider,
        Credential::new(INITIAL_TOKEN, SystemTime::now() + Duration::from_secs(3600)),
        DEFAULT_RENEWAL_THRESHOLD,
    ))
}

/// Client with one auth retry and quick transient retries.
pub fn api(guard: Arc<TokenGuard>) -> ApiClient {
    let retry = RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    };
    ApiClient::new(reqwest::Client::new(), guard, 1, retry)
}

pub fn sender(addr: &str) -> SenderClient {
    SenderClient::new(
        addr,
        "zcp-proxy",
        Duration::from_millis(500),
        Duration::from_millis(500),
        Duration::from_millis(500),
        2,
    )
}

/// Minimal Zabbix trapper: records each decoded request, answers with
/// `reply` and counts connections the client has closed.
pub struct FakeZabbix {
    pub addr: String,
    pub requests: Arc<Mutex<Vec<Value>>>,
    pub closed: Arc<AtomicUsize>,
}

impl FakeZabbix {
    pub async fn start(reply: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicUsize::new(0));

        let (req, cls) = (requests.clone(), closed.clone());
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let (req, cls, reply) = (req.clone(), cls.clone(), reply.clone());
                tokio::spawn(async move {
                    let mut header = [0u8; HEADER_SIZE];
                    stream.read_exact(&mut header).await.unwrap();
                    check_header(&header).unwrap();
                    let mut data_header = [0u8; DATA_HEADER_SIZE];
                    stream.read_exact(&mut data_header).await.unwrap();
                    let mut payload = vec![0u8; payload_length(&data_header).unwrap()];
                    stream.read_exact(&mut payload).await.unwrap();
                    req.lock()
                        .await
                        .push(serde_json::from_slice(&payload).unwrap());

                    stream.write_all(&reply).await.unwrap();

                    let mut rest = [0u8; 16];
                    if matches!(stream.read(&mut rest).await, Ok(0) | Err(_)) {
                        cls.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        Self {
            addr,
            requests,
            closed,
        }
    }

    /// Replies like a Zabbix server that accepted everything.
    pub async fn accepting() -> Self {
        let body = serde_json::json!({
            "response": "success",
            "info": "processed: 1; failed: 0; total: 1; seconds spent: 0.000055"
        });
        Self::start(Envelope::from_json(&body).unwrap().serialize()).await
    }

    pub async fn requests(&self) -> Vec<Value> {
        self.requests.lock().await.clone()
    }

    /// Wait until `n` connections were closed by the client.
    pub async fn wait_closed(&self, n: usize) {
        for _ in 0..200 {
            if self.closed.load(Ordering::SeqCst) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} closed connections, saw {}",
            n,
            self.closed.load(Ordering::SeqCst)
        );
    }
}

/// An address nothing listens on.
pub async fn dead_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}
