//! CONNECT tunnels.
//!
//! A tunnel is created in two steps: the target is dialed while the client is
//! still speaking HTTP, then the client connection is taken over and bytes are
//! relayed in both directions by two independent tasks until either side goes
//! away.

use hyper::upgrade::OnUpgrade;
use http::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::response::{empty, error_response, ProxyBody};
use crate::error::{ProxyError, Result};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound on passing EOF on to the other side of a tunnel.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Connections that can hand their raw transport over to the proxy.
///
/// The serving layer attaches an upgrade handle to requests it is able to
/// give up; anything else yields `None`.
pub trait Hijack {
    fn hijack(&mut self) -> Option<OnUpgrade>;
}

impl<B> Hijack for Request<B> {
    fn hijack(&mut self) -> Option<OnUpgrade> {
        self.extensions_mut().remove::<OnUpgrade>()
    }
}

#[derive(Debug, Clone)]
pub struct TunnelEngine {
    connect_timeout: Duration,
}

impl Default for TunnelEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl TunnelEngine {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Dial `target`, answer the client and start relaying once the client
    /// connection has been handed over.
    pub async fn establish(
        &self,
        target: &str,
        client: &mut impl Hijack,
        remote: SocketAddr,
    ) -> Response<ProxyBody> {
        let Some(on_upgrade) = client.hijack() else {
            warn!("Cannot tunnel {} for {}: connection not upgradable", target, remote);
            let err = ProxyError::UpgradeUnsupported;
            return error_response(err.status(), &err.to_string());
        };

        let target_stream = match self.dial(target).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Tunnel to {} for {} failed: {}", target, remote, e);
                return error_response(e.status(), &e.to_string());
            }
        };

        let target = target.to_string();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let stats = relay(TokioIo::new(upgraded), target_stream).join().await;
                    info!(
                        "Tunnel {} for {} closed ({} bytes up, {} bytes down)",
                        target, remote, stats.client_to_target, stats.target_to_client
                    );
                }
                // target_stream is dropped here, nothing is left open
                Err(e) => warn!("Upgrade failed for tunnel {} ({}): {}", target, remote, e),
            }
        });

        let mut response = Response::new(empty());
        *response.status_mut() = StatusCode::OK;
        response
    }

    /// Open a TCP connection to `target`, bounded by the dial timeout.
    pub async fn dial(&self, target: &str) -> Result<TcpStream> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ProxyError::Dial {
                target: target.to_string(),
                source,
            }),
            Err(_) => Err(ProxyError::DialTimeout(
                target.to_string(),
                self.connect_timeout,
            )),
        }
    }
}

/// Byte counts of a finished tunnel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_target: u64,
    pub target_to_client: u64,
}

/// The two relay tasks of one tunnel.
pub struct Tunnel {
    client_to_target: JoinHandle<u64>,
    target_to_client: JoinHandle<u64>,
}

impl Tunnel {
    /// Wait until both directions have stopped.
    pub async fn join(self) -> RelayStats {
        let (up, down) = tokio::join!(self.client_to_target, self.target_to_client);
        RelayStats {
            client_to_target: up.unwrap_or_default(),
            target_to_client: down.unwrap_or_default(),
        }
    }
}

/// Start relaying between `client` and `target`.
///
/// Each direction runs in its own task. The first task to stop cancels the
/// shared token, which stops the other one, and then shuts down its write
/// side. Once both have exited every half is dropped and both connections are
/// closed.
pub fn relay<C, T>(client: C, target: T) -> Tunnel
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (target_read, target_write) = tokio::io::split(target);
    let closed = CancellationToken::new();

    Tunnel {
        client_to_target: tokio::spawn(pipe(client_read, target_write, closed.clone())),
        target_to_client: tokio::spawn(pipe(target_read, client_write, closed)),
    }
}

async fn pipe<R, W>(mut reader: R, mut writer: W, closed: CancellationToken) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;

    let finished = tokio::select! {
        result = copy_counted(&mut reader, &mut writer, &mut copied) => {
            if let Err(e) = result {
                debug!("Relay stopped: {}", e);
            }
            true
        }
        () = closed.cancelled() => false,
    };
    closed.cancel();

    // Only the direction that saw EOF passes it on. A peer that stopped
    // reading can hold a shutdown (e.g. a TLS close_notify) forever.
    if finished {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await;
    }

    copied
}

async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}
