//! The TLS/HTTP server consuming the demultiplexed accept queue.
//!
//! Each queued connection is handshaked with a configuration picked per
//! ClientHello. Test hostnames are answered with the fixed plain-HTTP
//! response after the request head has been consumed (and recorded); the
//! reporter hostname is served by the axum API router. After a successful
//! handshake the negotiated TLS version is written into the connection's
//! capture, marking it successful.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Extension, Router};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use rustls::server::Acceptor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::listener::{ClassifiedConn, ConnQueue};
use crate::reporter::PeerIp;
use crate::tls::TlsConfigurator;

/// Body served on every test hostname.
const TEST_RESPONSE_BODY: &[u8] = b"Hello world!\n";

/// Upper bound on the request head read on test hosts before answering.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

pub struct TlsServer {
    configurator: Arc<TlsConfigurator>,
    reporter: Router,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl TlsServer {
    pub fn new(configurator: Arc<TlsConfigurator>, reporter: Router, config: &Config) -> Self {
        Self {
            configurator,
            reporter,
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
        }
    }

    /// Serves connections from the queue until the listener closes it.
    pub async fn serve(self, mut queue: ConnQueue) {
        let server = Arc::new(self);
        while let Some(conn) = queue.accept().await {
            let server = server.clone();
            tokio::spawn(async move {
                server.handle_connection(conn).await;
            });
        }
        info!("listener queue closed, TLS server stopping");
    }

    async fn handle_connection(&self, conn: ClassifiedConn) {
        let peer_ip = conn.peer_ip();
        let capture = conn.capture();

        // The read timeout bounds the whole handshake. A failed or timed-out
        // handshake drops the connection; its capture (if any) is emitted
        // with has_failed still set.
        let acceptor = LazyConfigAcceptor::new(Acceptor::default(), conn);
        let start = match timeout(self.read_timeout, acceptor).await {
            Ok(Ok(start)) => start,
            Ok(Err(e)) => {
                debug!("failed to read ClientHello: {e}");
                return;
            }
            Err(_) => {
                debug!("timed out reading ClientHello");
                return;
            }
        };

        let sni = start
            .client_hello()
            .server_name()
            .map(str::to_lowercase)
            .unwrap_or_default();
        let config = match self.configurator.config_for_client(&sni, capture.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                warn!("no usable certificate for {sni:?}: {e}");
                return;
            }
        };

        let tls = match timeout(self.read_timeout, start.into_stream(config)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                debug!("handshake with {sni:?} failed: {e}");
                return;
            }
            Err(_) => {
                debug!("handshake with {sni:?} timed out");
                return;
            }
        };

        if let Some(capture) = &capture {
            if let Some(version) = tls.get_ref().1.protocol_version() {
                capture.set_actual_tls_version(u16::from(version));
            }
        }

        if self.configurator.is_test_host(&sni) {
            self.serve_test_host(tls).await;
        } else {
            self.serve_reporter(tls, peer_ip).await;
        }
    }

    /// The canned test-host exchange: consume (and thereby record) the
    /// request head, answer with the fixed response, close.
    async fn serve_test_host<S>(&self, mut tls: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match timeout(self.read_timeout, read_request_head(&mut tls)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("test host request failed: {e}");
                let _ = tls.shutdown().await;
                return;
            }
            Err(_) => {
                debug!("timed out reading test host request");
                let _ = tls.shutdown().await;
                return;
            }
        }

        let header = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
            TEST_RESPONSE_BODY.len()
        );
        let write = async {
            tls.write_all(header.as_bytes()).await?;
            tls.write_all(TEST_RESPONSE_BODY).await?;
            tls.flush().await
        };
        match timeout(self.write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("failed to write test response: {e}"),
            Err(_) => debug!("timed out writing test response"),
        }
        let _ = tls.shutdown().await;
    }

    /// Hands the connection to hyper, serving the reporter router.
    async fn serve_reporter<S>(&self, tls: S, peer_ip: Option<IpAddr>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let peer_ip = peer_ip.unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        let router = self.reporter.clone().layer(Extension(PeerIp(peer_ip)));
        let service = TowerToHyperService::new(router);

        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.read_timeout);
        builder.http2().timer(TokioTimer::new());

        if let Err(e) = builder.serve_connection(TokioIo::new(tls), service).await {
            debug!("reporter connection ended: {e}");
        }
    }
}

/// Reads until the end of the HTTP request head (or EOF, or a cap). The
/// caller answers regardless; the point is that the request bytes have gone
/// through the recording wrapper before the response is written.
async fn read_request_head<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        head.extend_from_slice(&buf[..n]);
        if head.windows(4).any(|window| window == b"\r\n\r\n") || head.len() >= MAX_REQUEST_HEAD {
            return Ok(());
        }
    }
}
