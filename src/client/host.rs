//! Per-host request executor.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use http::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::{Error, UrlError};
use crate::proto::h1::{decode, encode};
use crate::request::Request;
use crate::response::Response;

use super::dial::Rotator;
use super::pool::{BufferPool, PoolInner};

/// Maximum number of concurrent connections per host used when
/// `max_conns` isn't set.
pub const DEFAULT_MAX_CONNS_PER_HOST: usize = 512;

/// Duration after which an idle keep-alive connection is closed when
/// `max_idle_conn_duration` isn't set.
pub const DEFAULT_MAX_IDLE_CONN_DURATION: Duration = Duration::from_secs(10);

pub(crate) const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
pub(crate) const DEFAULT_WRITE_BUFFER_SIZE: usize = 4096;

const DEFAULT_USER_AGENT: &str = concat!("fleethttp/", env!("CARGO_PKG_VERSION"));

/// Callback establishing a TCP connection to `addr`.
///
/// There is no need to perform the TLS handshake for https hosts; the client
/// wraps the returned stream itself when `is_tls` is set. The address is
/// passed through exactly as configured, including any missing port.
pub type DialFn = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>> + Send + Sync,
>;

/// Configuration for a [`HostClient`].
///
/// Zero durations and zero sizes mean "use the default" (or "unlimited"
/// where the field documents it).
pub struct HostConfig {
    /// Comma-separated list of upstream addresses, dialed round-robin.
    ///
    /// Each address may omit the port when the default dialer is used, in
    /// which case the scheme default (80 or 443) is filled in.
    pub addr: String,

    /// Client name, used in the User-Agent request header. The library
    /// default is used when empty.
    pub name: String,

    /// Callback for establishing new connections. The default dialer is
    /// used when `None`.
    pub dial: Option<DialFn>,

    /// Attempt to connect to both IPv4 and IPv6 addresses when set. The
    /// default dialer only connects to IPv4 addresses.
    pub dial_dual_stack: bool,

    /// Whether to wrap connections in TLS.
    pub is_tls: bool,

    /// Optional TLS configuration. When `None`, certificate verification is
    /// skipped.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,

    /// Maximum number of connections to all addresses in `addr`.
    /// [`DEFAULT_MAX_CONNS_PER_HOST`] when zero.
    pub max_conns: usize,

    /// Keep-alive connections are closed after this duration. Unlimited
    /// when zero.
    pub max_conn_duration: Duration,

    /// Idle keep-alive connections are closed after this duration.
    /// [`DEFAULT_MAX_IDLE_CONN_DURATION`] when zero.
    pub max_idle_conn_duration: Duration,

    /// Per-exchange buffer size for response reading. This also bounds the
    /// response header section. The default size is used when zero.
    pub read_buffer_size: usize,

    /// Per-exchange buffer size for request writing. The default size is
    /// used when zero.
    pub write_buffer_size: usize,

    /// Maximum duration for a full response read, including the body.
    /// Unlimited when zero.
    pub read_timeout: Duration,

    /// Maximum duration for a full request write, including the body.
    /// Unlimited when zero.
    pub write_timeout: Duration,

    /// Maximum response body size. Unlimited when zero; when set, larger
    /// bodies fail with the body-too-large error.
    pub max_response_body_size: usize,
}

impl Default for HostConfig {
    fn default() -> HostConfig {
        HostConfig {
            addr: String::new(),
            name: String::new(),
            dial: None,
            dial_dual_stack: false,
            is_tls: false,
            tls_config: None,
            max_conns: 0,
            max_conn_duration: Duration::ZERO,
            max_idle_conn_duration: Duration::ZERO,
            read_buffer_size: 0,
            write_buffer_size: 0,
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            max_response_body_size: 0,
        }
    }
}

impl fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostConfig")
            .field("addr", &self.addr)
            .field("name", &self.name)
            .field("dial", &self.dial.as_ref().map(|_| ".."))
            .field("dial_dual_stack", &self.dial_dual_stack)
            .field("is_tls", &self.is_tls)
            .field("max_conns", &self.max_conns)
            .field("max_conn_duration", &self.max_conn_duration)
            .field("max_idle_conn_duration", &self.max_idle_conn_duration)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("max_response_body_size", &self.max_response_body_size)
            .finish()
    }
}

/// A client bound to a single host (or a comma-separated list of equivalent
/// upstream addresses, balanced round-robin).
///
/// The host client owns the connection pool for its authority: it reuses
/// idle keep-alive connections freshest-first, dials new ones under the
/// `max_conns` cap, and runs a background reaper that retires connections
/// idle for longer than `max_idle_conn_duration`.
///
/// Cloning is cheap and clones share the same pool. All methods are safe to
/// call concurrently.
#[derive(Clone)]
pub struct HostClient {
    pub(crate) inner: Arc<HostInner>,
}

pub(crate) struct HostInner {
    pub(crate) config: HostConfig,
    pub(crate) user_agent: String,
    pub(crate) pool: Mutex<PoolInner>,
    pub(crate) addrs: Mutex<Rotator>,
    pub(crate) read_bufs: BufferPool,
    pub(crate) write_bufs: BufferPool,
    /// Seconds since process start of the most recent send attempt; read by
    /// the router's reaper without taking any lock.
    pub(crate) last_use_time: AtomicU32,
}

fn process_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

fn uptime_secs() -> u32 {
    process_epoch().elapsed().as_secs() as u32
}

/// The outcome of a single exchange attempt. `retry` distinguishes
/// transport failures a fresh connection could fix from answers (or
/// failures) that a retransmit cannot improve.
pub(crate) struct AttemptError {
    pub(crate) retry: bool,
    pub(crate) err: Error,
}

impl AttemptError {
    fn retryable(err: Error) -> AttemptError {
        AttemptError { retry: true, err }
    }

    fn terminal(err: Error) -> AttemptError {
        AttemptError { retry: false, err }
    }
}

impl HostClient {
    /// Creates a host client from its configuration.
    pub fn new(config: HostConfig) -> HostClient {
        let user_agent = if config.name.is_empty() {
            DEFAULT_USER_AGENT.to_owned()
        } else {
            config.name.clone()
        };
        let read_cap = if config.read_buffer_size == 0 {
            DEFAULT_READ_BUFFER_SIZE
        } else {
            config.read_buffer_size
        };
        let write_cap = if config.write_buffer_size == 0 {
            DEFAULT_WRITE_BUFFER_SIZE
        } else {
            config.write_buffer_size
        };
        HostClient {
            inner: Arc::new(HostInner {
                config,
                user_agent,
                pool: Mutex::new(PoolInner::new()),
                addrs: Mutex::new(Rotator::new()),
                read_bufs: BufferPool::new(read_cap),
                write_bufs: BufferPool::new(write_cap),
                last_use_time: AtomicU32::new(0),
            }),
        }
    }

    /// Time of the most recent send attempt on this client.
    pub fn last_use_time(&self) -> Instant {
        let secs = self.inner.last_use_time.load(Ordering::Relaxed);
        process_epoch() + Duration::from_secs(u64::from(secs))
    }

    /// Number of connections currently in existence, idle or in use.
    pub fn conn_count(&self) -> usize {
        self.inner.pool.lock().unwrap().count
    }

    /// Number of idle connections currently waiting in the pool.
    pub fn idle_conn_count(&self) -> usize {
        self.inner.pool.lock().unwrap().idle.len()
    }

    pub(crate) fn max_conns(&self) -> usize {
        if self.inner.config.max_conns == 0 {
            DEFAULT_MAX_CONNS_PER_HOST
        } else {
            self.inner.config.max_conns
        }
    }

    pub(crate) fn max_idle_conn_duration(&self) -> Duration {
        if self.inner.config.max_idle_conn_duration.is_zero() {
            DEFAULT_MAX_IDLE_CONN_DURATION
        } else {
            self.inner.config.max_idle_conn_duration
        }
    }

    /// Performs the request and fills in the response.
    ///
    /// The connection is dialed to the configured address; the request only
    /// needs a target for the request line and a Host (from a full URL or an
    /// explicit Host header). Returns the no-free-connections error when
    /// every connection under the cap is busy.
    ///
    /// A transport-level failure is retried once for idempotent methods
    /// (GET, HEAD, PUT). A server that closes the connection before the
    /// first response byte on every allowed attempt yields the
    /// connection-closed error.
    pub async fn send(&self, req: &mut Request, resp: &mut Response) -> crate::Result<()> {
        let res = match self.do_once(req, resp).await {
            Ok(()) => Ok(()),
            Err(attempt) if attempt.retry && req.is_idempotent() => {
                tracing::debug!("retrying idempotent request on a fresh connection");
                self.do_once(req, resp).await.map_err(|attempt| attempt.err)
            }
            Err(attempt) => Err(attempt.err),
        };
        res.map_err(|err| {
            if err.is_premature_end() {
                Error::new_connection_closed()
            } else {
                err
            }
        })
    }

    /// Performs the request, waiting for the response for at most `timeout`.
    ///
    /// See [`HostClient::send_deadline`].
    pub async fn send_timeout(
        &self,
        req: &mut Request,
        resp: &mut Response,
        timeout: Duration,
    ) -> crate::Result<()> {
        self.send_deadline(req, resp, Instant::now() + timeout).await
    }

    /// Performs the request, waiting for the response until `deadline`.
    ///
    /// The timeout error is returned when the deadline expires first; the
    /// exchange keeps draining in the background, bounded by the configured
    /// read and write timeouts, so slow upstreams stay capped at
    /// `max_conns` concurrent exchanges. On timeout the request body is
    /// sacrificed to the still-running exchange and is no longer available
    /// to the caller.
    pub async fn send_deadline(
        &self,
        req: &mut Request,
        resp: &mut Response,
        deadline: Instant,
    ) -> crate::Result<()> {
        super::do_deadline(self, req, resp, deadline).await
    }

    /// Fetches `url`, appending the response body to `dst`.
    ///
    /// Redirects are followed. Returns the status code and the body buffer;
    /// on failure the buffer rides back inside the [`UrlError`].
    pub async fn get(&self, dst: Vec<u8>, url: &str) -> Result<(StatusCode, Vec<u8>), UrlError> {
        super::get_url(self, dst, url).await
    }

    /// Like [`HostClient::get`], giving up after `timeout`.
    pub async fn get_timeout(
        &self,
        dst: Vec<u8>,
        url: &str,
        timeout: Duration,
    ) -> Result<(StatusCode, Vec<u8>), UrlError> {
        super::get_url_deadline(self, dst, url, Instant::now() + timeout).await
    }

    /// Like [`HostClient::get`], giving up at `deadline`.
    pub async fn get_deadline(
        &self,
        dst: Vec<u8>,
        url: &str,
        deadline: Instant,
    ) -> Result<(StatusCode, Vec<u8>), UrlError> {
        super::get_url_deadline(self, dst, url, deadline).await
    }

    /// Sends a POST request to `url` with the given form arguments encoded
    /// as `application/x-www-form-urlencoded`.
    ///
    /// On failure the body buffer rides back inside the [`UrlError`].
    pub async fn post(
        &self,
        dst: Vec<u8>,
        url: &str,
        args: &[(&str, &str)],
    ) -> Result<(StatusCode, Vec<u8>), UrlError> {
        super::post_url(self, dst, url, args).await
    }

    /// Runs one write-then-read exchange on one pooled connection.
    async fn do_once(&self, req: &mut Request, resp: &mut Response) -> Result<(), AttemptError> {
        self.inner
            .last_use_time
            .store(uptime_secs(), Ordering::Relaxed);

        let mut cc = self
            .acquire_conn()
            .await
            .map_err(AttemptError::terminal)?;

        let config = &self.inner.config;

        // A connection past its maximum age gets one last exchange, marked
        // Connection: close on the wire.
        let reset_connection = !config.max_conn_duration.is_zero()
            && cc.created.elapsed() > config.max_conn_duration
            && !req.connection_close();

        let mut wbuf = self.inner.write_bufs.acquire();
        let encoded = encode::encode_request(
            &mut wbuf,
            req,
            self.inner.user_agent.as_bytes(),
            reset_connection,
        );
        let write_res = match encoded {
            Ok(()) => {
                io_deadline(config.write_timeout, async {
                    cc.stream.write_all(&wbuf).await?;
                    cc.stream.flush().await
                })
                .await
                .map_err(Error::new_io)
            }
            Err(err) => Err(err),
        };
        self.inner.write_bufs.release(wbuf);
        if let Err(err) = write_res {
            self.close_conn(cc);
            return Err(AttemptError::retryable(err));
        }

        resp.reset();
        resp.set_skip_body(req.is_head());

        let mut rbuf = self.inner.read_bufs.acquire();
        let header_limit = self.inner.read_bufs.capacity();
        let read_res = io_deadline(config.read_timeout, async {
            decode::read_response(
                &mut cc.stream,
                &mut rbuf,
                resp,
                config.max_response_body_size,
                header_limit,
            )
            .await
            .map_err(IoOr::App)
        })
        .await
        .map_err(|err| match err {
            IoOr::Io(io_err) => Error::new_io(io_err),
            IoOr::App(app) => app,
        });
        self.inner.read_bufs.release(rbuf);
        if let Err(err) = read_res {
            self.close_conn(cc);
            return Err(if err.is_premature_end() {
                AttemptError::retryable(err)
            } else {
                AttemptError::terminal(err)
            });
        }

        if reset_connection || req.connection_close() || resp.connection_close() {
            self.close_conn(cc);
        } else {
            self.release_conn(cc);
        }
        Ok(())
    }
}

impl fmt::Debug for HostClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostClient")
            .field("addr", &self.inner.config.addr)
            .finish()
    }
}

/// Either the error type of the wrapped future, or the io error produced by
/// an expired per-exchange deadline.
enum IoOr<E> {
    Io(io::Error),
    App(E),
}

/// Bounds `fut` by `dur` when it is nonzero; expiry surfaces as a timed-out
/// io error, distinct from the caller-deadline timeout error.
async fn io_deadline<T, E, F>(dur: Duration, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<io::Error>,
{
    if dur.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(dur, fut).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded").into()),
    }
}

impl<E> From<io::Error> for IoOr<E> {
    fn from(err: io::Error) -> IoOr<E> {
        IoOr::Io(err)
    }
}
