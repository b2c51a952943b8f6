//! HTTP client: the host router, the deadline harness and the redirect
//! follower.
//!
//! Two entry points exist. [`Client`] routes each request to a per-host
//! executor keyed by the target authority, creating executors lazily and
//! expiring unused ones in the background. [`HostClient`] is one such
//! executor, bound to a fixed authority, and owns the connection pool for
//! it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use http::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use http::{Method, StatusCode, Uri};
use rand::Rng;

use crate::error::{Error, UrlError};
use crate::request::Request;
use crate::response::Response;

mod dial;
mod host;
mod pool;

pub use self::dial::DEFAULT_DIAL_TIMEOUT;
pub use self::host::{
    DialFn, HostClient, HostConfig, DEFAULT_MAX_CONNS_PER_HOST, DEFAULT_MAX_IDLE_CONN_DURATION,
};

/// Maximum number of redirect hops followed by the URL helpers.
pub const MAX_REDIRECTS: usize = 16;

/// How often the router sweeps its authority maps.
const ROUTER_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Idle time after which a per-host executor is dropped from the router.
const HOST_CLIENT_EXPIRY: Duration = Duration::from_secs(60);

/// Configuration for a [`Client`].
///
/// Every field is copied into the per-host executors the client creates;
/// see [`HostConfig`] for the field semantics.
pub struct ClientConfig {
    /// Client name, used in the User-Agent request header.
    pub name: String,
    /// Callback for establishing new connections.
    pub dial: Option<DialFn>,
    /// Attempt to connect to both IPv4 and IPv6 addresses when set.
    pub dial_dual_stack: bool,
    /// Optional TLS configuration for https hosts.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    /// Maximum number of connections per host.
    pub max_conns_per_host: usize,
    /// Keep-alive connections are closed after this duration.
    pub max_conn_duration: Duration,
    /// Idle keep-alive connections are closed after this duration.
    pub max_idle_conn_duration: Duration,
    /// Per-exchange buffer size for response reading.
    pub read_buffer_size: usize,
    /// Per-exchange buffer size for request writing.
    pub write_buffer_size: usize,
    /// Maximum duration for a full response read.
    pub read_timeout: Duration,
    /// Maximum duration for a full request write.
    pub write_timeout: Duration,
    /// Maximum response body size.
    pub max_response_body_size: usize,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            name: String::new(),
            dial: None,
            dial_dual_stack: false,
            tls_config: None,
            max_conns_per_host: 0,
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

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("name", &self.name)
            .field("dial", &self.dial.as_ref().map(|_| ".."))
            .field("dial_dual_stack", &self.dial_dual_stack)
            .field("max_conns_per_host", &self.max_conns_per_host)
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

/// An HTTP client for requests to any host.
///
/// The client keeps one [`HostClient`] per target authority, created on
/// first use and dropped again after a minute without requests. Cloning is
/// cheap and clones share the same executors. All methods are safe to call
/// concurrently.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    maps: Mutex<HostMaps>,
}

#[derive(Default)]
struct HostMaps {
    plain: HostMap,
    tls: HostMap,
}

#[derive(Default)]
struct HostMap {
    m: HashMap<String, HostClient>,
    reaper_running: bool,
}

impl Client {
    /// Creates a client from its configuration.
    pub fn new(config: ClientConfig) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                config,
                maps: Mutex::new(HostMaps::default()),
            }),
        }
    }

    /// Performs the request and fills in the response.
    ///
    /// The request must carry a full URL, with scheme and host; only `http`
    /// and `https` are accepted. Returns the no-free-connections error when
    /// every connection to the target host is busy.
    pub async fn send(&self, req: &mut Request, resp: &mut Response) -> crate::Result<()> {
        let uri = req.uri().ok_or_else(Error::new_invalid_uri)?;
        let scheme = uri.scheme_str().unwrap_or("");
        let is_tls = match scheme {
            "http" => false,
            "https" => true,
            other => return Err(Error::new_unsupported_scheme(other)),
        };
        let host = uri
            .authority()
            .ok_or_else(Error::new_invalid_uri)?
            .as_str()
            .to_owned();
        let key = dial::add_missing_port(host, is_tls);

        let (hc, start_reaper) = {
            let mut maps = self.inner.maps.lock().unwrap();
            let map = if is_tls { &mut maps.tls } else { &mut maps.plain };
            match map.m.get(&key) {
                Some(hc) => (hc.clone(), false),
                None => {
                    let hc = HostClient::new(self.host_config(key.clone(), is_tls));
                    map.m.insert(key, hc.clone());
                    let start = map.m.len() == 1 && !map.reaper_running;
                    if start {
                        map.reaper_running = true;
                    }
                    (hc, start)
                }
            }
        };
        if start_reaper {
            tokio::spawn(router_reaper(self.inner.clone(), is_tls));
        }

        hc.send(req, resp).await
    }

    /// Performs the request, waiting for the response for at most `timeout`.
    ///
    /// See [`Client::send_deadline`].
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
    /// read and write timeouts. On timeout the request body is sacrificed
    /// to the still-running exchange.
    pub async fn send_deadline(
        &self,
        req: &mut Request,
        resp: &mut Response,
        deadline: Instant,
    ) -> crate::Result<()> {
        do_deadline(self, req, resp, deadline).await
    }

    /// Fetches `url`, appending the response body to `dst`.
    ///
    /// Redirects are followed. Returns the status code and the body buffer;
    /// on failure the buffer rides back inside the [`UrlError`].
    pub async fn get(&self, dst: Vec<u8>, url: &str) -> Result<(StatusCode, Vec<u8>), UrlError> {
        get_url(self, dst, url).await
    }

    /// Like [`Client::get`], giving up after `timeout`.
    pub async fn get_timeout(
        &self,
        dst: Vec<u8>,
        url: &str,
        timeout: Duration,
    ) -> Result<(StatusCode, Vec<u8>), UrlError> {
        get_url_deadline(self, dst, url, Instant::now() + timeout).await
    }

    /// Like [`Client::get`], giving up at `deadline`.
    pub async fn get_deadline(
        &self,
        dst: Vec<u8>,
        url: &str,
        deadline: Instant,
    ) -> Result<(StatusCode, Vec<u8>), UrlError> {
        get_url_deadline(self, dst, url, deadline).await
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
        post_url(self, dst, url, args).await
    }

    /// Number of per-host executors currently held by the router.
    pub fn host_client_count(&self) -> usize {
        let maps = self.inner.maps.lock().unwrap();
        maps.plain.m.len() + maps.tls.m.len()
    }

    fn host_config(&self, addr: String, is_tls: bool) -> HostConfig {
        let config = &self.inner.config;
        HostConfig {
            addr,
            name: config.name.clone(),
            dial: config.dial.clone(),
            dial_dual_stack: config.dial_dual_stack,
            is_tls,
            tls_config: config.tls_config.clone(),
            max_conns: config.max_conns_per_host,
            max_conn_duration: config.max_conn_duration,
            max_idle_conn_duration: config.max_idle_conn_duration,
            read_buffer_size: config.read_buffer_size,
            write_buffer_size: config.write_buffer_size,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            max_response_body_size: config.max_response_body_size,
        }
    }
}

impl Default for Client {
    fn default() -> Client {
        Client::new(ClientConfig::default())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").finish()
    }
}

/// Sweeps one authority map, dropping executors that have not been used for
/// [`HOST_CLIENT_EXPIRY`]. Exits when the map empties; the next insertion
/// re-arms it.
async fn router_reaper(inner: Arc<ClientInner>, is_tls: bool) {
    loop {
        let must_stop;
        {
            let mut maps = inner.maps.lock().unwrap();
            let map = if is_tls { &mut maps.tls } else { &mut maps.plain };
            let before = map.m.len();
            map.m
                .retain(|_, hc| hc.last_use_time().elapsed() <= HOST_CLIENT_EXPIRY);
            if map.m.len() < before {
                tracing::debug!(dropped = before - map.m.len(), "expired idle host clients");
            }
            must_stop = map.m.is_empty();
            if must_stop {
                map.reaper_running = false;
            }
        }
        if must_stop {
            return;
        }
        tokio::time::sleep(ROUTER_SWEEP_INTERVAL).await;
    }
}

/// The request-sending half shared by [`Client`] and [`HostClient`], so the
/// deadline harness and the URL helpers can wrap either.
pub(crate) trait Doer: Clone + Send + Sync + 'static {
    fn send_request<'a>(
        &'a self,
        req: &'a mut Request,
        resp: &'a mut Response,
    ) -> impl Future<Output = crate::Result<()>> + Send + 'a;
}

impl Doer for Client {
    fn send_request<'a>(
        &'a self,
        req: &'a mut Request,
        resp: &'a mut Response,
    ) -> impl Future<Output = crate::Result<()>> + Send + 'a {
        self.send(req, resp)
    }
}

impl Doer for HostClient {
    fn send_request<'a>(
        &'a self,
        req: &'a mut Request,
        resp: &'a mut Response,
    ) -> impl Future<Output = crate::Result<()>> + Send + 'a {
        self.send(req, resp)
    }
}

/// Runs the exchange with deadline semantics, absorbing pool saturation by
/// polling with exponential backoff until the deadline passes.
pub(crate) async fn do_deadline<C: Doer>(
    c: &C,
    req: &mut Request,
    resp: &mut Response,
    deadline: Instant,
) -> crate::Result<()> {
    let mut sleep_time = Duration::ZERO;
    loop {
        match do_deadline_once(c, req, resp, deadline).await {
            Err(err) if err.is_no_free_conns() => {
                sleep_time = update_sleep_time(sleep_time, deadline);
                tokio::time::sleep(sleep_time).await;
            }
            other => return other,
        }
    }
}

async fn do_deadline_once<C: Doer>(
    c: &C,
    req: &mut Request,
    resp: &mut Response,
    deadline: Instant,
) -> crate::Result<()> {
    if deadline <= Instant::now() {
        return Err(Error::new_timeout());
    }

    // Make shallow copies and move the body over, since on timeout the
    // originals must stay with the caller while the copies ride along with
    // the still-running exchange.
    let mut req_copy = req.copy_head();
    req.swap_body(&mut req_copy);
    let mut resp_copy = Response::new();

    // The exchange keeps running after a timeout here, until the executor's
    // own read/write deadlines cut it off. That keeps the load on a slow
    // host capped at max_conns concurrent exchanges; abandoning the
    // connection instead would let timed-out callers pile up unbounded
    // shadow work.
    let c2 = c.clone();
    let task = tokio::spawn(async move {
        let res = c2.send_request(&mut req_copy, &mut resp_copy).await;
        (req_copy, resp_copy, res)
    });

    tokio::select! {
        joined = task => {
            let (mut req_copy, mut resp_copy, res) = joined.expect("request task panicked");
            req.swap_body(&mut req_copy);
            resp_copy.copy_head_to(resp);
            resp.swap_body(&mut resp_copy);
            res
        }
        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
            Err(Error::new_timeout())
        }
    }
}

/// Doubles the previous backoff sleep, starting from a random 10–50 ms, and
/// clamps the final sleep to land just past the deadline.
fn update_sleep_time(prev: Duration, deadline: Instant) -> Duration {
    let mut sleep_time = if prev.is_zero() {
        Duration::from_millis(10 + rand::rng().random_range(0..40))
    } else {
        prev * 2
    };
    let remaining = deadline.saturating_duration_since(Instant::now());
    if sleep_time >= remaining {
        // Sleep through the remainder so the next attempt times out instead
        // of burning CPU on further polls.
        sleep_time = remaining + Duration::from_millis(10);
    }
    sleep_time
}

pub(crate) async fn get_url<C: Doer>(
    c: &C,
    dst: Vec<u8>,
    url: &str,
) -> Result<(StatusCode, Vec<u8>), UrlError> {
    let mut req = Request::new();
    follow_redirects(c, &mut req, dst, url).await
}

pub(crate) async fn get_url_deadline<C: Doer>(
    c: &C,
    dst: Vec<u8>,
    url: &str,
    deadline: Instant,
) -> Result<(StatusCode, Vec<u8>), UrlError> {
    let mut sleep_time = Duration::ZERO;
    let mut dst = dst;
    loop {
        match get_url_deadline_once(c, dst, url, deadline).await {
            Err(err) if err.error().is_no_free_conns() => {
                // The buffer rides back inside the error, untouched, for the
                // next attempt.
                dst = err.into_body();
                sleep_time = update_sleep_time(sleep_time, deadline);
                tokio::time::sleep(sleep_time).await;
            }
            other => return other,
        }
    }
}

/// Like [`do_deadline_once`], for the redirect-following GET. The spawned
/// task gets its own copy of the body buffer while the original stays here,
/// so a timeout (or any failure) still hands the caller's bytes back.
async fn get_url_deadline_once<C: Doer>(
    c: &C,
    dst: Vec<u8>,
    url: &str,
    deadline: Instant,
) -> Result<(StatusCode, Vec<u8>), UrlError> {
    if deadline <= Instant::now() {
        return Err(UrlError::new(Error::new_timeout(), dst));
    }

    let c2 = c.clone();
    let url = url.to_owned();
    let task_dst = dst.clone();
    let task = tokio::spawn(async move {
        let mut req = Request::new();
        follow_redirects(&c2, &mut req, task_dst, &url).await
    });

    tokio::select! {
        joined = task => joined.expect("request task panicked"),
        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
            Err(UrlError::new(Error::new_timeout(), dst))
        }
    }
}

pub(crate) async fn post_url<C: Doer>(
    c: &C,
    dst: Vec<u8>,
    url: &str,
    args: &[(&str, &str)],
) -> Result<(StatusCode, Vec<u8>), UrlError> {
    let mut req = Request::new();
    req.set_method(Method::POST);
    req.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/x-www-form-urlencoded"),
    );
    write_form_args(req.body_mut(), args);
    follow_redirects(c, &mut req, dst, url).await
}

/// Drives `req` through a bounded chain of 301/302/303 hops.
///
/// 307 and 308 are deliberately not treated as redirects. Each hop clears
/// the parsed target and the Host header so both are recomputed from the
/// Location URL.
///
/// The body buffer is handed back unconditionally: appended to on success,
/// carried inside the [`UrlError`] on failure.
async fn follow_redirects<C: Doer>(
    c: &C,
    req: &mut Request,
    dst: Vec<u8>,
    url: &str,
) -> Result<(StatusCode, Vec<u8>), UrlError> {
    let mut resp = Response::new();
    let mut url = url.to_owned();
    let mut redirects = 0usize;

    loop {
        req.clear_uri_and_host();
        if let Err(err) = req.set_request_uri(&url) {
            return Err(UrlError::new(err, dst));
        }

        if let Err(err) = c.send_request(req, &mut resp).await {
            return Err(UrlError::new(err, dst));
        }

        let status = resp.status();
        if status != StatusCode::MOVED_PERMANENTLY
            && status != StatusCode::FOUND
            && status != StatusCode::SEE_OTHER
        {
            break;
        }

        redirects += 1;
        if redirects > MAX_REDIRECTS {
            return Err(UrlError::new(
                Error::new_too_many_redirects(),
                append_body(dst, &resp),
            ));
        }
        let location = match resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            Some(location) => location,
            None => {
                return Err(UrlError::new(
                    Error::new_missing_location(),
                    append_body(dst, &resp),
                ));
            }
        };
        url = match redirect_url(&url, location) {
            Ok(next) => next,
            Err(err) => return Err(UrlError::new(err, dst)),
        };
        tracing::trace!(url = %url, hop = redirects, "following redirect");
    }

    Ok((resp.status(), append_body(dst, &resp)))
}

fn append_body(mut dst: Vec<u8>, resp: &Response) -> Vec<u8> {
    dst.extend_from_slice(resp.body());
    dst
}

/// Resolves a Location header against the current URL. Handles absolute
/// URLs, scheme-relative (`//host/..`), absolute-path and relative-path
/// forms.
fn redirect_url(base: &str, location: &str) -> crate::Result<String> {
    let location = location.split('#').next().unwrap_or(location);
    if let Ok(uri) = location.parse::<Uri>() {
        if uri.scheme_str().is_some() && uri.authority().is_some() {
            return Ok(location.to_owned());
        }
    }

    let base = base.split('#').next().unwrap_or(base);
    let base_uri = base
        .parse::<Uri>()
        .map_err(|e| Error::new_invalid_uri().with(e))?;
    let scheme = base_uri.scheme_str().ok_or_else(Error::new_invalid_uri)?;
    let authority = base_uri.authority().ok_or_else(Error::new_invalid_uri)?;

    if let Some(rest) = location.strip_prefix("//") {
        return Ok(format!("{scheme}://{rest}"));
    }
    if location.starts_with('/') {
        return Ok(format!("{scheme}://{authority}{location}"));
    }

    let base_path = base_uri.path();
    let dir_end = base_path.rfind('/').map(|i| i + 1).unwrap_or(0);
    let dir = &base_path[..dir_end];
    let dir = if dir.is_empty() { "/" } else { dir };
    Ok(format!("{scheme}://{authority}{dir}{location}"))
}

fn write_form_args(buf: &mut BytesMut, args: &[(&str, &str)]) {
    for (i, (name, value)) in args.iter().enumerate() {
        if i > 0 {
            buf.extend_from_slice(b"&");
        }
        write_form_component(buf, name);
        buf.extend_from_slice(b"=");
        write_form_component(buf, value);
    }
}

fn write_form_component(buf: &mut BytesMut, s: &str) {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    for &b in s.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                buf.extend_from_slice(&[b]);
            }
            b' ' => buf.extend_from_slice(b"+"),
            _ => buf.extend_from_slice(&[b'%', HEX[(b >> 4) as usize], HEX[(b & 0xf) as usize]]),
        }
    }
}
