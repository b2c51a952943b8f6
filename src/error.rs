//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have `fleethttp::Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while performing HTTP requests.
///
/// # Formatting
///
/// The `Display` implementation of this type will only print the details of
/// this level of error, even though it may have been caused by another error
/// and contain that error in its source. To print all the relevant
/// information, including the source chain, use something like
/// `std::error::Report`, or equivalent 3rd-party types.
///
/// # Source
///
/// A `fleethttp::Error` may be caused by another error. To aid debugging,
/// those are exposed in `Error::source()` as erased types. While it is
/// possible to check the exact type of the sources, they **can not be
/// depended on**. They may come from private internal dependencies, and are
/// subject to change at any moment.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// All connections to the host are busy.
    NoFreeConns,
    /// A deadline-driven call did not complete in time.
    Timeout,
    /// The server closed the connection before returning the first response
    /// byte, on every attempt the retry policy allowed.
    ConnectionClosed,
    /// The response body exceeded the configured limit.
    BodyTooLarge,
    /// A redirect response carried no usable Location header.
    MissingLocation,
    /// The redirect chain exceeded the hop limit.
    TooManyRedirects,
    /// The request URL used a scheme other than http or https.
    UnsupportedScheme(String),
    /// The request target was absent or could not be parsed.
    InvalidUri,
    /// An error occurred while connecting to the upstream.
    Dial,
    /// An error occurred while reading or writing the transport.
    Io,
    /// The transport closed before the status line arrived.
    PrematureEnd,
    /// An error occurred while parsing the response.
    Parse(Parse),
}

#[derive(Debug)]
pub(crate) enum Parse {
    StatusLine,
    Header,
    TooLarge,
    Chunk,
    /// The message ended before its framing said it should.
    Incomplete,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_no_free_conns() -> Error {
        Error::new(Kind::NoFreeConns)
    }

    pub(crate) fn new_timeout() -> Error {
        Error::new(Kind::Timeout)
    }

    pub(crate) fn new_connection_closed() -> Error {
        Error::new(Kind::ConnectionClosed)
    }

    pub(crate) fn new_body_too_large() -> Error {
        Error::new(Kind::BodyTooLarge)
    }

    pub(crate) fn new_missing_location() -> Error {
        Error::new(Kind::MissingLocation)
    }

    pub(crate) fn new_too_many_redirects() -> Error {
        Error::new(Kind::TooManyRedirects)
    }

    pub(crate) fn new_unsupported_scheme(scheme: &str) -> Error {
        Error::new(Kind::UnsupportedScheme(scheme.to_owned()))
    }

    pub(crate) fn new_invalid_uri() -> Error {
        Error::new(Kind::InvalidUri)
    }

    pub(crate) fn new_dial<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Dial).with(cause)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_premature_end() -> Error {
        Error::new(Kind::PrematureEnd)
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    /// Returns true if no connection to the host was free under the
    /// concurrency cap.
    pub fn is_no_free_conns(&self) -> bool {
        matches!(self.inner.kind, Kind::NoFreeConns)
    }

    /// Returns true if the caller-supplied deadline expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout)
    }

    /// Returns true if the server closed the connection before returning the
    /// first response byte.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectionClosed)
    }

    /// Returns true if the response body exceeded the configured
    /// maximum response body size.
    pub fn is_body_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::BodyTooLarge)
    }

    /// Returns true if a redirect response was missing a Location header.
    pub fn is_missing_location(&self) -> bool {
        matches!(self.inner.kind, Kind::MissingLocation)
    }

    /// Returns true if a redirect chain went past the hop limit.
    pub fn is_too_many_redirects(&self) -> bool {
        matches!(self.inner.kind, Kind::TooManyRedirects)
    }

    /// Returns true if the request target was absent or malformed.
    pub fn is_invalid_uri(&self) -> bool {
        matches!(self.inner.kind, Kind::InvalidUri)
    }

    /// Returns true if connecting to the upstream failed.
    pub fn is_dial(&self) -> bool {
        matches!(self.inner.kind, Kind::Dial)
    }

    /// Returns true if reading or writing the transport failed.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if the response could not be parsed.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    pub(crate) fn is_premature_end(&self) -> bool {
        matches!(self.inner.kind, Kind::PrematureEnd)
    }

    fn description(&self) -> &str {
        match &self.inner.kind {
            Kind::NoFreeConns => "no free connections available to host",
            Kind::Timeout => "timeout",
            Kind::ConnectionClosed => {
                "the server closed connection before returning the first response byte. \
                 Make sure the server returns 'Connection: close' response header \
                 before closing the connection"
            }
            Kind::BodyTooLarge => "response body is too large",
            Kind::MissingLocation => "missing Location header for http redirect",
            Kind::TooManyRedirects => "too many redirects detected when doing the request",
            Kind::UnsupportedScheme(_) => "unsupported protocol. http and https are supported",
            Kind::InvalidUri => "request URI is missing or invalid",
            Kind::Dial => "error when dialing host",
            Kind::Io => "transport error",
            Kind::PrematureEnd => "connection closed before the status line arrived",
            Kind::Parse(Parse::StatusLine) => "invalid response status line",
            Kind::Parse(Parse::Header) => "invalid response header",
            Kind::Parse(Parse::TooLarge) => "response headers exceed the read buffer size",
            Kind::Parse(Parse::Chunk) => "invalid chunked response body",
            Kind::Parse(Parse::Incomplete) => "connection closed in the middle of the response",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("fleethttp::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Kind::UnsupportedScheme(scheme) = &self.inner.kind {
            return write!(
                f,
                "unsupported protocol {:?}. http and https are supported",
                scheme
            );
        }
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

/// Error returned by the URL helper methods ([`Client::get`],
/// [`Client::post`] and friends).
///
/// The helpers take ownership of the caller's body buffer, so failures hand
/// the buffer back alongside the underlying [`Error`] rather than dropping
/// it: [`UrlError::into_body`] recovers the bytes, including anything
/// appended before the request failed.
///
/// [`Client::get`]: crate::Client::get
/// [`Client::post`]: crate::Client::post
pub struct UrlError {
    error: Error,
    body: Vec<u8>,
}

impl UrlError {
    pub(crate) fn new(error: Error, body: Vec<u8>) -> UrlError {
        UrlError { error, body }
    }

    /// The underlying request error.
    pub fn error(&self) -> &Error {
        &self.error
    }

    /// Discards the buffer and returns the underlying request error.
    pub fn into_error(self) -> Error {
        self.error
    }

    /// Hands back the caller's body buffer.
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Splits into the underlying error and the body buffer.
    pub fn into_parts(self) -> (Error, Vec<u8>) {
        (self.error, self.body)
    }
}

impl fmt::Debug for UrlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlError")
            .field("error", &self.error)
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl fmt::Display for UrlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl StdError for UrlError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.error)
    }
}

impl From<UrlError> for Error {
    fn from(err: UrlError) -> Error {
        err.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_size_of() {
        assert_eq!(std::mem::size_of::<Error>(), std::mem::size_of::<usize>());
    }

    #[test]
    fn probes_match_kinds() {
        assert!(Error::new_no_free_conns().is_no_free_conns());
        assert!(Error::new_timeout().is_timeout());
        assert!(Error::new_connection_closed().is_connection_closed());
        assert!(Error::new_too_many_redirects().is_too_many_redirects());
        assert!(!Error::new_timeout().is_no_free_conns());
    }

    #[test]
    fn source_is_preserved() {
        let err = Error::new_io(std::io::Error::other("boom"));
        assert!(err.is_io());
        assert_eq!(err.source().unwrap().to_string(), "boom");
    }

    #[test]
    fn url_error_hands_the_buffer_back() {
        let err = UrlError::new(Error::new_timeout(), b"partial".to_vec());
        assert!(err.error().is_timeout());
        let (inner, body) = err.into_parts();
        assert!(inner.is_timeout());
        assert_eq!(body, b"partial");
    }
}
