//! Provider socket listener: the single writer onto `confirmation_queue`.
//!
//! Connects UDS-first with TCP fallback, reads length-prefixed msgpack
//! frames, normalizes each into an execution report and publishes it
//! durably. Reconnects with exponential backoff capped at 30 s.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::{error, info, warn};

use crate::error::EngineError;
use crate::provider::{decode_frame, normalize_report};
use crate::queue::{self, QueueBus, CONFIRMATION_QUEUE};

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub uds_path: String,
    pub tcp_host: String,
    pub tcp_port: u16,
    pub connect_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            uds_path: "/run/fx_exec/exec.sock".to_string(),
            tcp_host: "127.0.0.1".to_string(),
            tcp_port: 9001,
            connect_timeout: Duration::from_secs(3),
        }
    }
}

pub struct ProviderListener {
    cfg: ListenerConfig,
    bus: Arc<dyn QueueBus>,
}

enum Transport {
    #[cfg(unix)]
    Uds(UnixStream),
    Tcp(TcpStream),
}

impl Transport {
    fn reader(&mut self) -> &mut (dyn AsyncRead + Unpin + Send) {
        match self {
            #[cfg(unix)]
            Transport::Uds(s) => s,
            Transport::Tcp(s) => s,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            #[cfg(unix)]
            Transport::Uds(_) => "UDS",
            Transport::Tcp(_) => "TCP",
        }
    }
}

impl ProviderListener {
    pub fn new(cfg: ListenerConfig, bus: Arc<dyn QueueBus>) -> Self {
        Self { cfg, bus }
    }

    async fn connect(&self) -> Result<Transport, EngineError> {
        #[cfg(unix)]
        {
            match tokio::time::timeout(
                self.cfg.connect_timeout,
                UnixStream::connect(&self.cfg.uds_path),
            )
            .await
            {
                Ok(Ok(s)) => {
                    info!(path = %self.cfg.uds_path, "connected to provider via UDS");
                    return Ok(Transport::Uds(s));
                }
                Ok(Err(e)) => warn!(path = %self.cfg.uds_path, error = %e, "UDS connect failed"),
                Err(_) => warn!(path = %self.cfg.uds_path, "UDS connect timed out"),
            }
        }
        let addr = format!("{}:{}", self.cfg.tcp_host, self.cfg.tcp_port);
        match tokio::time::timeout(self.cfg.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(s)) => {
                info!(%addr, "connected to provider via TCP");
                Ok(Transport::Tcp(s))
            }
            Ok(Err(e)) => {
                error!(%addr, error = %e, "TCP connect failed");
                Err(EngineError::ProviderUnreachable)
            }
            Err(_) => {
                error!(%addr, "TCP connect timed out");
                Err(EngineError::ProviderUnreachable)
            }
        }
    }

    /// Reconnect loop; never returns under normal operation.
    pub async fn run(&self) {
        let mut backoff = Duration::from_secs(1);
        loop {
            let mut transport = match self.connect().await {
                Ok(t) => t,
                Err(_) => {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                    continue;
                }
            };
            backoff = Duration::from_secs(1);

            let name = transport.name();
            if let Err(e) = self.read_frames(transport.reader()).await {
                warn!(transport = name, error = %e, "provider stream ended, reconnecting");
            }
        }
    }

    async fn read_frames(
        &self,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<(), EngineError> {
        loop {
            let mut hdr = [0u8; 4];
            stream
                .read_exact(&mut hdr)
                .await
                .map_err(|e| EngineError::Malformed(format!("frame header: {e}")))?;
            let len = u32::from_be_bytes(hdr) as usize;
            let mut payload = vec![0u8; len];
            stream
                .read_exact(&mut payload)
                .await
                .map_err(|e| EngineError::Malformed(format!("frame body: {e}")))?;
            self.handle_frame(&payload).await;
        }
    }

    async fn handle_frame(&self, payload: &[u8]) {
        let msg = match decode_frame(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "dropping undecodable provider frame");
                return;
            }
        };
        let report = match normalize_report(&msg, Utc::now().timestamp_millis()) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "dropping malformed execution report");
                return;
            }
        };
        let body = match serde_json::to_value(&report) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "report serialization failed");
                return;
            }
        };
        if let Err(e) = queue::publish(self.bus.as_ref(), CONFIRMATION_QUEUE, body).await {
            error!(order_id = %report.order_id, error = %e, "confirmation publish failed");
        } else {
            info!(
                order_id = %report.order_id,
                exec_id = %report.exec_id,
                ord_status = %report.ord_status,
                "execution report queued"
            );
        }
    }
}
