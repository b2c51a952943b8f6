#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # fleethttp
//!
//! A fast connection-pooled HTTP/1.1 client.
//!
//! fleethttp keeps one connection pool per target host, reuses keep-alive
//! connections freshest-first under a strict per-host concurrency cap, and
//! retires idle or aged connections in the background. Deadline-driven calls
//! return to the caller on time without aborting the in-flight exchange, so
//! slow upstreams can never be hit by more than `max_conns` concurrent
//! requests. Transport failures on idempotent requests are retried once on a
//! fresh connection, and the URL helpers follow bounded redirect chains.
//!
//! ## Example
//!
//! ```no_run
//! # async fn run() -> Result<(), fleethttp::Error> {
//! let (status, body) = fleethttp::get(Vec::new(), "http://httpbin.org/ip").await?;
//! assert_eq!(status, 200);
//! println!("{}", String::from_utf8_lossy(&body));
//! # Ok(())
//! # }
//! ```
//!
//! Requests and responses are plain owned values, reusable across calls:
//!
//! ```no_run
//! use fleethttp::{Client, Request, Response};
//! # async fn run() -> Result<(), fleethttp::Error> {
//! let client = Client::default();
//! let mut req = Request::new();
//! req.set_request_uri("http://example.com/api")?;
//! let mut resp = Response::new();
//! client.send_timeout(&mut req, &mut resp, std::time::Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Bodies are contiguous buffers; streaming bodies, HTTP/2 and cookie
//! handling are out of scope.

#[doc(no_inline)]
pub use http::{header, HeaderMap, Method, StatusCode, Uri, Version};

pub use crate::client::{
    Client, ClientConfig, DialFn, HostClient, HostConfig, DEFAULT_DIAL_TIMEOUT,
    DEFAULT_MAX_CONNS_PER_HOST, DEFAULT_MAX_IDLE_CONN_DURATION, MAX_REDIRECTS,
};
pub use crate::error::{Error, Result, UrlError};
pub use crate::request::Request;
pub use crate::response::Response;

/// HTTP client: host router, per-host executors and their configuration.
pub mod client;
mod error;
mod headers;
mod proto;
mod request;
mod response;

use std::sync::OnceLock;
use std::time::{Duration, Instant};

fn default_client() -> &'static Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();
    CLIENT.get_or_init(Client::default)
}

/// Performs the given request with the process-wide default [`Client`] and
/// fills in the response.
///
/// The request must contain a full URL, including scheme and host.
pub async fn send(req: &mut Request, resp: &mut Response) -> Result<()> {
    default_client().send(req, resp).await
}

/// Like [`send`], waiting for the response for at most `timeout`.
pub async fn send_timeout(
    req: &mut Request,
    resp: &mut Response,
    timeout: Duration,
) -> Result<()> {
    default_client().send_timeout(req, resp, timeout).await
}

/// Like [`send`], waiting for the response until `deadline`.
pub async fn send_deadline(
    req: &mut Request,
    resp: &mut Response,
    deadline: Instant,
) -> Result<()> {
    default_client().send_deadline(req, resp, deadline).await
}

/// Fetches `url` with the process-wide default [`Client`], appending the
/// response body to `dst`. Redirects are followed.
///
/// On failure the body buffer rides back inside the [`UrlError`].
pub async fn get(dst: Vec<u8>, url: &str) -> std::result::Result<(StatusCode, Vec<u8>), UrlError> {
    default_client().get(dst, url).await
}

/// Like [`get`], giving up after `timeout`.
pub async fn get_timeout(
    dst: Vec<u8>,
    url: &str,
    timeout: Duration,
) -> std::result::Result<(StatusCode, Vec<u8>), UrlError> {
    default_client().get_timeout(dst, url, timeout).await
}

/// Like [`get`], giving up at `deadline`.
pub async fn get_deadline(
    dst: Vec<u8>,
    url: &str,
    deadline: Instant,
) -> std::result::Result<(StatusCode, Vec<u8>), UrlError> {
    default_client().get_deadline(dst, url, deadline).await
}

/// Sends a POST request to `url` with the process-wide default [`Client`],
/// encoding `args` as `application/x-www-form-urlencoded`.
///
/// On failure the body buffer rides back inside the [`UrlError`].
pub async fn post(
    dst: Vec<u8>,
    url: &str,
    args: &[(&str, &str)],
) -> std::result::Result<(StatusCode, Vec<u8>), UrlError> {
    default_client().post(dst, url, args).await
}
