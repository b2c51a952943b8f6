//! HTTP request message.

use bytes::BytesMut;
use http::header::{HOST, USER_AGENT};
use http::{HeaderMap, Method, Uri};

use crate::error::Error;
use crate::headers;

/// An HTTP request, owned by the caller and filled in before sending.
///
/// The request carries its body as a contiguous buffer; streaming bodies are
/// not supported. The target is set with [`Request::set_request_uri`] and must
/// contain a full URL (scheme and host) when the request is sent through a
/// [`Client`](crate::Client); a [`HostClient`](crate::HostClient) only needs
/// the path, since it owns the authority.
#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: Option<Uri>,
    headers: HeaderMap,
    body: BytesMut,
}

impl Request {
    /// Creates an empty GET request.
    pub fn new() -> Request {
        Request {
            method: Method::GET,
            uri: None,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
        }
    }

    /// Sets the request target from a URL string.
    ///
    /// Any fragment is dropped before parsing.
    pub fn set_request_uri(&mut self, url: &str) -> crate::Result<()> {
        let url = url.split('#').next().unwrap_or(url);
        let uri = url
            .parse::<Uri>()
            .map_err(|e| Error::new_invalid_uri().with(e))?;
        self.uri = Some(uri);
        Ok(())
    }

    /// Returns the parsed request target, if one has been set.
    pub fn uri(&self) -> Option<&Uri> {
        self.uri.as_ref()
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Sets the request method.
    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// Returns a reference to the request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns a mutable reference to the request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Returns the request body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Returns a mutable reference to the request body buffer.
    pub fn body_mut(&mut self) -> &mut BytesMut {
        &mut self.body
    }

    /// Replaces the request body.
    pub fn set_body(&mut self, body: impl AsRef<[u8]>) {
        self.body.clear();
        self.body.extend_from_slice(body.as_ref());
    }

    /// Returns true if the request carries a `Connection: close` header.
    pub fn connection_close(&self) -> bool {
        headers::connection_close(&self.headers)
    }

    /// Asks the server to close the connection after this exchange.
    pub fn set_connection_close(&mut self) {
        self.headers.insert(
            http::header::CONNECTION,
            http::HeaderValue::from_static("close"),
        );
    }

    pub(crate) fn is_get(&self) -> bool {
        self.method == Method::GET
    }

    pub(crate) fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }

    pub(crate) fn is_put(&self) -> bool {
        self.method == Method::PUT
    }

    /// GET, HEAD and PUT are the methods considered safe to retransmit after
    /// a transport-level failure.
    pub(crate) fn is_idempotent(&self) -> bool {
        self.is_get() || self.is_head() || self.is_put()
    }

    pub(crate) fn has_user_agent(&self) -> bool {
        self.headers.contains_key(USER_AGENT)
    }

    /// Drops the parsed target and any Host header, so both are recomputed
    /// from the next URL. Used between redirect hops.
    pub(crate) fn clear_uri_and_host(&mut self) {
        self.uri = None;
        self.headers.remove(HOST);
    }

    /// Copies everything but the body into a fresh request.
    pub(crate) fn copy_head(&self) -> Request {
        Request {
            method: self.method.clone(),
            uri: self.uri.clone(),
            headers: self.headers.clone(),
            body: BytesMut::new(),
        }
    }

    /// Swaps body buffers with `other` without copying the contents.
    pub(crate) fn swap_body(&mut self, other: &mut Request) {
        std::mem::swap(&mut self.body, &mut other.body);
    }
}

impl Default for Request {
    fn default() -> Request {
        Request::new()
    }
}
