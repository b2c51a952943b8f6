//! Per-host connection pool: slots, acquire/release/close and the idle
//! reaper.

use std::io;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::error::Error;

use super::host::HostClient;

/// One live transport connection plus its timestamps.
///
/// A slot is owned by the pool while idle and by exactly one executor while
/// in use; it is never shared.
pub(crate) struct PooledConn {
    pub(crate) stream: Stream,
    pub(crate) created: Instant,
    pub(crate) last_use: Instant,
}

impl PooledConn {
    pub(crate) fn new(stream: Stream) -> PooledConn {
        let now = Instant::now();
        PooledConn {
            stream,
            created: now,
            last_use: now,
        }
    }
}

/// The transport under a pooled connection.
pub(crate) enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// State behind the pool lock.
///
/// `idle` is ordered by release time, oldest first, so the reaper scan is a
/// prefix walk and reuse pops the freshest slot off the tail. `count` tracks
/// every connection in existence, idle or in use; `idle.len() <= count`
/// always holds.
pub(crate) struct PoolInner {
    pub(crate) idle: Vec<PooledConn>,
    pub(crate) count: usize,
    pub(crate) reaper_running: bool,
}

impl PoolInner {
    pub(crate) fn new() -> PoolInner {
        PoolInner {
            idle: Vec::new(),
            count: 0,
            reaper_running: false,
        }
    }
}

/// Free-list of read/write buffers, bound to one exchange at a time.
///
/// Buffers come back cleared; capacity is retained so steady-state exchanges
/// allocate nothing.
pub(crate) struct BufferPool {
    capacity: usize,
    bufs: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub(crate) fn new(capacity: usize) -> BufferPool {
        BufferPool {
            capacity,
            bufs: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn acquire(&self) -> BytesMut {
        if let Some(buf) = self.bufs.lock().unwrap().pop() {
            return buf;
        }
        BytesMut::with_capacity(self.capacity)
    }

    pub(crate) fn release(&self, mut buf: BytesMut) {
        buf.clear();
        self.bufs.lock().unwrap().push(buf);
    }
}

impl HostClient {
    /// Pops the freshest idle slot, or dials a new connection under the
    /// concurrency cap.
    ///
    /// Returns the no-free-connections error, without blocking, when every
    /// slot is busy. The 0→1 transition of the connection count arms the
    /// idle reaper; a failed dial puts both the count and the trigger back.
    pub(crate) async fn acquire_conn(&self) -> crate::Result<PooledConn> {
        let start_reaper;
        {
            let mut pool = self.inner.pool.lock().unwrap();
            if let Some(cc) = pool.idle.pop() {
                return Ok(cc);
            }
            if pool.count >= self.max_conns() {
                return Err(Error::new_no_free_conns());
            }
            pool.count += 1;
            start_reaper = pool.count == 1 && !pool.reaper_running;
            if start_reaper {
                pool.reaper_running = true;
            }
        }

        match self.dial_host_hard().await {
            Ok(stream) => {
                if start_reaper {
                    tokio::spawn(self.clone().idle_reaper());
                }
                Ok(PooledConn::new(stream))
            }
            Err(err) => {
                let mut pool = self.inner.pool.lock().unwrap();
                pool.count -= 1;
                if start_reaper {
                    pool.reaper_running = false;
                }
                Err(err)
            }
        }
    }

    /// Returns a slot to the pool tail after a keep-alive-safe exchange.
    pub(crate) fn release_conn(&self, mut cc: PooledConn) {
        cc.last_use = Instant::now();
        self.inner.pool.lock().unwrap().idle.push(cc);
    }

    /// Retires a slot: the count drops exactly once and dropping the stream
    /// closes the socket.
    pub(crate) fn close_conn(&self, cc: PooledConn) {
        self.inner.pool.lock().unwrap().count -= 1;
        drop(cc);
    }

    /// Evicts idle connections that outlived the configured idle duration.
    ///
    /// Runs once any connection exists and exits when a sweep evicted every
    /// connection in existence, which is only accurate because in-use
    /// connections are never in the idle list.
    pub(crate) async fn idle_reaper(self) {
        let max_idle = self.max_idle_conn_duration();
        let mut scratch: Vec<PooledConn> = Vec::new();
        loop {
            let now = Instant::now();
            let must_stop;
            {
                let mut pool = self.inner.pool.lock().unwrap();
                let expired = pool
                    .idle
                    .iter()
                    .take_while(|cc| now.duration_since(cc.last_use) > max_idle)
                    .count();
                must_stop = pool.count == expired;
                scratch.extend(pool.idle.drain(..expired));
                if must_stop {
                    pool.reaper_running = false;
                }
            }

            if !scratch.is_empty() {
                tracing::debug!(evicted = scratch.len(), "closing idle connections");
            }
            for cc in scratch.drain(..) {
                self.close_conn(cc);
            }

            if must_stop {
                return;
            }
            tokio::time::sleep(max_idle).await;
        }
    }
}
