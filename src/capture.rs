//! Connection wrapper which records all of its traffic until told otherwise.
//!
//! A [`CaptureStream`] sits between the TCP socket and the TLS session, so
//! the recorded frames are the exact bytes observed on the wire, before any
//! cryptographic transformation. The per-session key log accumulates next to
//! the frames so a recorded handshake can later be decrypted.

use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::{io, mem};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::models::{Capture, Frame, ServerCapture};

/// Invoked exactly once per recorded connection, when its capture is frozen.
pub type CaptureNotifier = Arc<dyn Fn(&str, ServerCapture) + Send + Sync>;

/// Mutable recording attached to exactly one connection. Shared between the
/// stream wrapper (frames) and the TLS key-log sink (key log lines).
pub struct CaptureState {
    subtest_id: i64,
    begin_time: DateTime<Utc>,
    client_ip: IpAddr,
    server_ip: IpAddr,
    frames: Mutex<Vec<Frame>>,
    key_log: Mutex<String>,
    actual_tls_version: AtomicU16,
    has_failed: AtomicBool,
}

impl CaptureState {
    /// A new capture. `begin_time` is the accept timestamp of the
    /// connection. The capture is considered failed until a TLS handshake
    /// completes and reports its version.
    pub fn new(
        subtest_id: i64,
        client_ip: IpAddr,
        server_ip: IpAddr,
        begin_time: DateTime<Utc>,
    ) -> Arc<Self> {
        Arc::new(Self {
            subtest_id,
            begin_time,
            client_ip,
            server_ip,
            frames: Mutex::new(Vec::new()),
            key_log: Mutex::new(String::new()),
            actual_tls_version: AtomicU16::new(0),
            has_failed: AtomicBool::new(true),
        })
    }

    pub fn subtest_id(&self) -> i64 {
        self.subtest_id
    }

    fn push_frame(&self, data: &[u8], is_read: bool) {
        if data.is_empty() {
            return;
        }
        self.frames.lock().push(Frame {
            time: Utc::now(),
            is_read,
            data: data.to_vec(),
        });
    }

    /// Appends one NSS-format key log line for this session.
    pub fn append_key_log(&self, line: &str) {
        let mut log = self.key_log.lock();
        log.push_str(line);
        log.push('\n');
    }

    /// Records the negotiated TLS version, marking the capture successful.
    pub fn set_actual_tls_version(&self, version: u16) {
        self.actual_tls_version.store(version, Ordering::Relaxed);
        self.has_failed.store(false, Ordering::Relaxed);
    }

    fn freeze(&self, end_time: DateTime<Utc>) -> ServerCapture {
        ServerCapture {
            capture: Capture {
                id: 0,
                subtest_id: self.subtest_id,
                created_at: end_time,
                begin_time: self.begin_time,
                end_time,
                actual_tls_version: self.actual_tls_version.load(Ordering::Relaxed),
                frames: mem::take(&mut *self.frames.lock()),
                key_log: mem::take(&mut *self.key_log.lock()),
                has_failed: self.has_failed.load(Ordering::Relaxed),
            },
            client_ip: self.client_ip,
            server_ip: self.server_ip,
        }
    }
}

pin_project! {
    /// Stream wrapper appending a timestamped [`Frame`] for every successful
    /// read and write. On shutdown (or drop, whichever comes first) the
    /// capture is frozen, stamped with its end time and handed to the
    /// notifier, exactly once.
    pub struct CaptureStream<S> {
        #[pin]
        inner: S,
        state: Arc<CaptureState>,
        name: String,
        notifier: CaptureNotifier,
        recording: AtomicBool,
    }

    impl<S> PinnedDrop for CaptureStream<S> {
        fn drop(this: Pin<&mut Self>) {
            this.finish();
        }
    }
}

impl<S> CaptureStream<S> {
    /// Wraps an existing stream, logging traffic into `state`. `name` is the
    /// tag (the SNI) passed along with the finished capture.
    pub fn new(inner: S, state: Arc<CaptureState>, name: String, notifier: CaptureNotifier) -> Self {
        Self {
            inner,
            state,
            name,
            notifier,
            recording: AtomicBool::new(true),
        }
    }

    pub fn state(&self) -> &Arc<CaptureState> {
        &self.state
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Detaches the recorder so subsequent I/O is no longer captured.
    /// Idempotent; returns true only on the first call.
    pub fn stop_capture(&self) -> bool {
        self.recording.swap(false, Ordering::SeqCst)
    }

    fn finish(&self) {
        if self.stop_capture() {
            let capture = self.state.freeze(Utc::now());
            (self.notifier)(&self.name, capture);
        }
    }
}

impl<S: AsyncRead> AsyncRead for CaptureStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        if this.recording.load(Ordering::SeqCst) {
            this.state.push_frame(&buf.filled()[before..], true);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite> AsyncWrite for CaptureStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let n = ready!(this.inner.poll_write(cx, buf))?;
        if this.recording.load(Ordering::SeqCst) {
            this.state.push_frame(&buf[..n], false);
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = ready!(self.as_mut().project().inner.poll_shutdown(cx));
        self.finish();
        Poll::Ready(result)
    }
}
