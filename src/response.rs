//! HTTP response message.

use bytes::BytesMut;
use http::{HeaderMap, StatusCode, Version};

use crate::headers;

/// An HTTP response, filled in by the client.
///
/// The same value can be reused across requests; every exchange resets it
/// before reading. The body is bounded by the configured maximum response
/// body size and is skipped entirely for HEAD requests.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: BytesMut,
    skip_body: bool,
    /// Set when the body was delimited by EOF, which makes the connection
    /// unusable for another exchange.
    eof_framed: bool,
}

impl Response {
    /// Creates an empty response.
    pub fn new() -> Response {
        Response {
            status: StatusCode::OK,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
            skip_body: false,
            eof_framed: false,
        }
    }

    /// Returns the response status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Returns the HTTP version the server answered with.
    pub fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Returns a reference to the response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub(crate) fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Returns the response body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub(crate) fn body_mut(&mut self) -> &mut BytesMut {
        &mut self.body
    }

    /// Returns true if reading the body is skipped for this exchange.
    ///
    /// Set automatically when the request method is HEAD.
    pub fn skip_body(&self) -> bool {
        self.skip_body
    }

    pub(crate) fn set_skip_body(&mut self, skip: bool) {
        self.skip_body = skip;
    }

    pub(crate) fn set_eof_framed(&mut self) {
        self.eof_framed = true;
    }

    /// Returns true if the connection must be closed after this response.
    ///
    /// That is the case when the server sent `Connection: close`, when the
    /// body was delimited by EOF, or when the server answered with HTTP/1.0
    /// without opting in to keep-alive.
    pub fn connection_close(&self) -> bool {
        if self.eof_framed || headers::connection_close(&self.headers) {
            return true;
        }
        self.version == Version::HTTP_10 && !headers::connection_keep_alive(&self.headers)
    }

    /// Clears the response for reuse.
    pub fn reset(&mut self) {
        self.status = StatusCode::OK;
        self.version = Version::HTTP_11;
        self.headers.clear();
        self.body.clear();
        self.skip_body = false;
        self.eof_framed = false;
    }

    /// Copies everything but the body into `dst`.
    pub(crate) fn copy_head_to(&self, dst: &mut Response) {
        dst.status = self.status;
        dst.version = self.version;
        dst.headers = self.headers.clone();
        dst.skip_body = self.skip_body;
        dst.eof_framed = self.eof_framed;
    }

    /// Swaps body buffers with `other` without copying the contents.
    pub(crate) fn swap_body(&mut self, other: &mut Response) {
        std::mem::swap(&mut self.body, &mut other.body);
    }
}

impl Default for Response {
    fn default() -> Response {
        Response::new()
    }
}
