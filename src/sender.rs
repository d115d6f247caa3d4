//! Zabbix trapper client.
//!
//! Each send opens its own TCP connection, writes one framed
//! `history data` request and reads one framed response. Nothing is kept
//! between sends, so a failed exchange can never poison the next one.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use zcp_protocol::{
    check_header, payload_length, Envelope, HistoryData, ProtocolError, SenderResponse,
    DATA_HEADER_SIZE, HEADER_SIZE,
};

use crate::fetcher::Sample;
use crate::{Error, Result};

/// Frame `samples` as a `history data` request sent on behalf of `proxy_name`.
pub fn build_envelope(samples: &[Sample], proxy_name: &str) -> Result<Vec<u8>> {
    let data = samples.iter().map(Sample::to_history_item).collect();
    let envelope = Envelope::from_json(&HistoryData::new(proxy_name, data))?;
    Ok(envelope.serialize())
}

/// Pushes samples to a Zabbix server or proxy.
#[derive(Debug, Clone)]
pub struct SenderClient {
    addr: String,
    proxy_name: String,
    connect_timeout: Duration,
    write_timeout: Duration,
    read_timeout: Duration,
    max_send_attempts: u32,
}

impl SenderClient {
    pub fn new(
        addr: impl Into<String>,
        proxy_name: impl Into<String>,
        connect_timeout: Duration,
        write_timeout: Duration,
        read_timeout: Duration,
        max_send_attempts: u32,
    ) -> Self {
        Self {
            addr: addr.into(),
            proxy_name: proxy_name.into(),
            connect_timeout,
            write_timeout,
            read_timeout,
            max_send_attempts: max_send_attempts.max(1),
        }
    }

    /// Build and send `samples`, retrying failed connects.
    ///
    /// Only the connect is retried: once the first byte of a batch is on the
    /// wire the server may already have stored it, so write and read failures
    /// are returned as they are. Running out of connect attempts yields
    /// [`Error::BackendUnreachable`].
    pub async fn send_samples(&self, samples: &[Sample]) -> Result<SenderResponse> {
        let bytes = build_envelope(samples, &self.proxy_name)?;
        let stream = self.connect_with_retry().await?;
        let resp = self.exchange(stream, &bytes).await?;

        match resp.processed() {
            Some(p) if p.failed > 0 => warn!(
                addr = %self.addr,
                processed = p.processed,
                failed = p.failed,
                total = p.total,
                "zabbix rejected some items"
            ),
            Some(p) => debug!(
                addr = %self.addr,
                processed = p.processed,
                seconds_spent = p.seconds_spent,
                "zabbix accepted batch"
            ),
            None => debug!(addr = %self.addr, info = ?resp.info, "zabbix accepted batch"),
        }
        if !resp.is_success() {
            warn!(addr = %self.addr, response = %resp.response, "zabbix did not report success");
        }
        Ok(resp)
    }

    /// One framed request/response exchange on a fresh connection, no retries.
    pub async fn send(&self, bytes: &[u8]) -> Result<SenderResponse> {
        let stream = self.connect().await?;
        self.exchange(stream, bytes).await
    }

    async fn connect_with_retry(&self) -> Result<TcpStream> {
        let mut delay = Duration::from_millis(100);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.connect().await {
                Ok(stream) => return Ok(stream),
                Err(e) if is_connection_failure(&e) => {
                    if attempt >= self.max_send_attempts {
                        return Err(Error::BackendUnreachable {
                            addr: self.addr.clone(),
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    debug!(
                        "sender: attempt {} to {} failed: {} (retry in {:?})",
                        attempt, self.addr, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(5));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| Error::Timeout(format!("connect to {}", self.addr)))?
            .map_err(Error::Io)
    }

    async fn exchange(&self, mut stream: TcpStream, bytes: &[u8]) -> Result<SenderResponse> {
        tokio::time::timeout(self.write_timeout, async {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| Error::Timeout(format!("write to {}", self.addr)))??;

        let envelope = tokio::time::timeout(self.read_timeout, read_envelope(&mut stream))
            .await
            .map_err(|_| Error::Timeout(format!("response from {}", self.addr)))??;

        let resp: SenderResponse = envelope.json()?;
        info!(addr = %self.addr, response = %resp.response, "zabbix response");
        Ok(resp)
    }
}

/// Read one framed message. A peer that closes mid-frame has sent a short
/// message, which is a protocol error rather than an I/O one.
async fn read_envelope(stream: &mut TcpStream) -> Result<Envelope> {
    let mut header = [0u8; HEADER_SIZE];
    read_frame_part(stream, &mut header, "header").await?;
    check_header(&header)?;

    let mut data_header = [0u8; DATA_HEADER_SIZE];
    read_frame_part(stream, &mut data_header, "length block").await?;
    let len = payload_length(&data_header)?;

    let mut payload = vec![0u8; len];
    read_frame_part(stream, &mut payload, "payload").await?;
    Ok(Envelope::new(payload)?)
}

async fn read_frame_part(stream: &mut TcpStream, buf: &mut [u8], part: &str) -> Result<()> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Protocol(
            ProtocolError::InvalidMessage(format!("short response: truncated {}", part)),
        )),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Refused, reset or timed-out connects are retried; everything else is a
/// problem with the target itself.
fn is_connection_failure(err: &Error) -> bool {
    use std::io::ErrorKind;
    match err {
        Error::Timeout(_) => true,
        Error::Io(e) => matches!(
            e.kind(),
            ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::TimedOut
                | ErrorKind::AddrNotAvailable
                | ErrorKind::HostUnreachable
                | ErrorKind::NetworkUnreachable
        ),
        _ => false,
    }
}
