//! Demultiplexing TCP listener.
//!
//! Accepts raw connections, peeks at the first bytes without consuming them,
//! classifies the stream and routes it: claimed connections are queued for
//! the TLS server (wrapped in a recorder when a subtest is attached), policy
//! requests get their constant reply, everything else is proxied to the
//! origin or refused with a TLS alert.
//!
//! Classification runs off the accept task so a slow peek never blocks new
//! connections; the bounded queue applies backpressure against
//! handshake-bound spikes.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use pin_project_lite::pin_project;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::capture::{CaptureNotifier, CaptureState, CaptureStream};
use crate::peek::PeekableStream;
use crate::policy::FlashPolicyServer;
use crate::proxy::proxy_connection;
use crate::sni::parse_client_hello;

/// Maximum number of classified connections that can be queued for the TLS
/// server. Classification tasks block (applying backpressure) when full.
const MAX_QUEUE_SIZE: usize = 1024;

/// Cap on concurrently classifying connections, so an accept flood degrades
/// to backpressure instead of unbounded task growth.
const MAX_IN_FLIGHT_CLASSIFICATIONS: usize = 4 * MAX_QUEUE_SIZE;

/// How many bytes of the stream are peeked for classification. A ClientHello
/// spanning beyond this is treated as not-TLS.
const PEEK_SIZE: usize = 4096;

/// Let dead connections eventually go away.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// A TLS record containing a fatal alert for unrecognized_name.
const TLS_ALERT_UNRECOGNIZED_NAME: [u8; 7] = [21, 3, 1, 0, 2, 2, 112];

/// A TLS record containing a fatal alert for handshake_failure.
const TLS_ALERT_HANDSHAKE_FAILURE: [u8; 7] = [21, 3, 1, 0, 2, 2, 40];

/// Decision of the claimer for one hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimDecision {
    /// Whether this process serves the hostname itself.
    pub claimed: bool,
    /// Non-zero attaches a capture recording bound to that subtest.
    pub subtest_id: i64,
}

impl ClaimDecision {
    pub fn unclaimed() -> Self {
        Self {
            claimed: false,
            subtest_id: 0,
        }
    }

    pub fn claimed(subtest_id: i64) -> Self {
        Self {
            claimed: true,
            subtest_id,
        }
    }
}

/// Given a hostname, decides whether the listener should claim the request
/// and whether to record it.
#[async_trait]
pub trait RequestClaimer: Send + Sync {
    async fn claim(&self, host: &str) -> ClaimDecision;
}

pin_project! {
    /// A connection that passed classification, ready for the TLS server.
    #[project = ClassifiedConnProj]
    pub enum ClassifiedConn {
        /// Claimed without recording.
        Plain {
            #[pin]
            stream: PeekableStream<TcpStream>,
        },
        /// Claimed with a capture recording attached.
        Captured {
            #[pin]
            stream: CaptureStream<PeekableStream<TcpStream>>,
        },
    }
}

impl ClassifiedConn {
    /// The capture attached to this connection, if any.
    pub fn capture(&self) -> Option<Arc<CaptureState>> {
        match self {
            ClassifiedConn::Plain { .. } => None,
            ClassifiedConn::Captured { stream } => Some(stream.state().clone()),
        }
    }

    /// Peer address of the underlying socket.
    pub fn peer_ip(&self) -> Option<std::net::IpAddr> {
        let socket = match self {
            ClassifiedConn::Plain { stream } => stream.get_ref(),
            ClassifiedConn::Captured { stream } => stream.get_ref().get_ref(),
        };
        socket.peer_addr().ok().map(|addr| addr.ip())
    }
}

impl AsyncRead for ClassifiedConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClassifiedConnProj::Plain { stream } => stream.poll_read(cx, buf),
            ClassifiedConnProj::Captured { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClassifiedConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClassifiedConnProj::Plain { stream } => stream.poll_write(cx, buf),
            ClassifiedConnProj::Captured { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClassifiedConnProj::Plain { stream } => stream.poll_flush(cx),
            ClassifiedConnProj::Captured { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClassifiedConnProj::Plain { stream } => stream.poll_shutdown(cx),
            ClassifiedConnProj::Captured { stream } => stream.poll_shutdown(cx),
        }
    }
}

/// Consumer side of the classified-connection queue, driven by the TLS
/// server's accept loop. Yields `None` once the listener has stopped and
/// every outstanding classification has completed.
pub struct ConnQueue {
    rx: mpsc::Receiver<ClassifiedConn>,
}

impl ConnQueue {
    pub async fn accept(&mut self) -> Option<ClassifiedConn> {
        self.rx.recv().await
    }
}

struct ClassifyContext {
    initial_read_timeout: Duration,
    origin_address: Option<String>,
    claimer: Arc<dyn RequestClaimer>,
    capture_ready: CaptureNotifier,
    policy: Arc<FlashPolicyServer>,
}

/// The demultiplexing listener. [`DemuxListener::serve`] runs the accept
/// loop; the paired [`ConnQueue`] feeds the TLS server.
pub struct DemuxListener {
    listener: TcpListener,
    context: Arc<ClassifyContext>,
    queue_tx: mpsc::Sender<ClassifiedConn>,
    permits: Arc<Semaphore>,
}

impl DemuxListener {
    pub fn new(
        listener: TcpListener,
        initial_read_timeout: Duration,
        origin_address: Option<String>,
        claimer: Arc<dyn RequestClaimer>,
        capture_ready: CaptureNotifier,
        policy: Arc<FlashPolicyServer>,
    ) -> (Self, ConnQueue) {
        let (queue_tx, rx) = mpsc::channel(MAX_QUEUE_SIZE);
        let listener = Self {
            listener,
            context: Arc::new(ClassifyContext {
                initial_read_timeout,
                origin_address,
                claimer,
                capture_ready,
                policy,
            }),
            queue_tx,
            permits: Arc::new(Semaphore::new(MAX_IN_FLIGHT_CLASSIFICATIONS)),
        };
        (listener, ConnQueue { rx })
    }

    /// Accept loop. Temporary accept errors back off with the usual 5ms
    /// doubling; anything else ends the loop with the error. When the loop
    /// ends, the queue closes as soon as the outstanding classification
    /// tasks (each holding a sender clone) have finished.
    pub async fn serve(self) -> io::Result<()> {
        let mut delay = None;
        loop {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            };
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    delay = None;
                    let context = self.context.clone();
                    let queue_tx = self.queue_tx.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        classify_connection(context, queue_tx, stream, peer).await;
                    });
                }
                Err(e) if is_temporary_accept_error(&e) => {
                    let wait = next_accept_delay(&mut delay);
                    warn!("listener: accept error: {e}; retrying in {wait:?}");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Classifies one freshly accepted connection and routes it.
async fn classify_connection(
    context: Arc<ClassifyContext>,
    queue_tx: mpsc::Sender<ClassifiedConn>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let accepted_at = chrono::Utc::now();
    let local = match stream.local_addr() {
        Ok(local) => local,
        Err(e) => {
            debug!("{peer} - failed to resolve local address: {e}");
            return;
        }
    };
    if let Err(e) = set_keepalive(&stream) {
        debug!("{peer} / {local} - failed to enable keepalive: {e}");
    }

    let mut stream = PeekableStream::new(stream);

    // Only the initial peek has a deadline; afterwards timeouts are the
    // upper server's responsibility.
    let (sni, is_tls, is_policy_request) =
        match timeout(context.initial_read_timeout, stream.peek(PEEK_SIZE)).await {
            Err(_) => {
                info!("{peer} / {local} - timed out reading a record");
                return;
            }
            Ok(Err(e)) => {
                info!("{peer} / {local} - failed to read a record: {e}");
                return;
            }
            Ok(Ok(buffer)) if buffer.is_empty() => {
                info!("{peer} / {local} - failed to read a record: EOF");
                return;
            }
            Ok(Ok(buffer)) => {
                let (sni, is_tls) = parse_client_hello(buffer);
                let is_policy_request = context.policy.is_request(buffer);
                (sni, is_tls, is_policy_request)
            }
        };
    debug!("{peer} / {local} - SNI: {sni:?} (is_tls: {is_tls})");

    let decision = context.claimer.claim(&sni).await;
    if decision.claimed {
        let conn = if decision.subtest_id != 0 {
            let capture = CaptureState::new(decision.subtest_id, peer.ip(), local.ip(), accepted_at);
            let stream =
                CaptureStream::new(stream, capture, sni.clone(), context.capture_ready.clone());
            ClassifiedConn::Captured { stream }
        } else {
            ClassifiedConn::Plain { stream }
        };
        // A closed queue means the server is shutting down; dropping the
        // connection here is all that is left to do.
        let _ = queue_tx.send(conn).await;
    } else if !is_tls && is_policy_request {
        info!("{peer} / {local} - handling flash socket policy request");
        let _ = context.policy.write_response(&mut stream).await;
        let _ = stream.shutdown().await;
    } else if let Some(origin) = context.origin_address.as_deref() {
        if let Err(e) = proxy_connection(stream, origin).await {
            warn!("{peer} / {local} - error proxying connection: {e}");
        }
    } else {
        info!("{peer} / {local} - no upstream configured");
        // Soften the refusal for TLS clients with a proper fatal alert.
        if !sni.is_empty() {
            let _ = stream.write_all(&TLS_ALERT_UNRECOGNIZED_NAME).await;
        } else if is_tls {
            let _ = stream.write_all(&TLS_ALERT_HANDSHAKE_FAILURE).await;
        }
        let _ = stream.shutdown().await;
    }
}

fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_PERIOD))
}

/// Whether an accept error is worth retrying (based on what net servers
/// conventionally treat as temporary, e.g. out of file descriptors).
pub(crate) fn is_temporary_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || matches!(e.raw_os_error(), Some(code) if code == 23 || code == 24) // ENFILE, EMFILE
}

/// 5ms doubling backoff, capped at one second.
pub(crate) fn next_accept_delay(delay: &mut Option<Duration>) -> Duration {
    let next = match *delay {
        None => Duration::from_millis(5),
        Some(previous) => (previous * 2).min(Duration::from_secs(1)),
    };
    *delay = Some(next);
    next
}
