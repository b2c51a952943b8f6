//! Request head and body serialization.

use bytes::BytesMut;
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING, USER_AGENT};
use http::Method;

use crate::error::Error;
use crate::request::Request;

/// Serializes `req` into `buf` as an HTTP/1.1 message.
///
/// The caller-visible request is never mutated: the memoized `user_agent` is
/// substituted on the wire when the request has none, and `Connection: close`
/// is appended when `force_close` is set and the request did not already ask
/// for it.
///
/// The target host is taken from the request URI's authority, falling back to
/// a caller-set Host header.
pub(crate) fn encode_request(
    buf: &mut BytesMut,
    req: &Request,
    user_agent: &[u8],
    force_close: bool,
) -> crate::Result<()> {
    let path = req
        .uri()
        .and_then(|uri| uri.path_and_query())
        .map(|pq| pq.as_str())
        .filter(|p| !p.is_empty())
        .unwrap_or("/");

    buf.extend_from_slice(req.method().as_str().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");

    if !req.headers().contains_key(HOST) {
        let authority = req
            .uri()
            .and_then(|uri| uri.authority())
            .ok_or_else(Error::new_invalid_uri)?;
        buf.extend_from_slice(b"Host: ");
        buf.extend_from_slice(authority.as_str().as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if !req.has_user_agent() {
        buf.extend_from_slice(b"User-Agent: ");
        buf.extend_from_slice(user_agent);
        buf.extend_from_slice(b"\r\n");
    }

    if force_close && !req.connection_close() {
        buf.extend_from_slice(b"Connection: close\r\n");
    }

    for (name, value) in req.headers() {
        // Framing is always Content-Length; these two are rewritten below.
        if *name == CONTENT_LENGTH || *name == TRANSFER_ENCODING {
            continue;
        }
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if !req.body().is_empty() || method_has_payload(req.method()) {
        let mut digits = itoa::Buffer::new();
        buf.extend_from_slice(b"Content-Length: ");
        buf.extend_from_slice(digits.format(req.body().len()).as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(req.body());
    Ok(())
}

fn method_has_payload(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn encode(req: &Request, user_agent: &str, force_close: bool) -> String {
        let mut buf = BytesMut::new();
        encode_request(&mut buf, req, user_agent.as_bytes(), force_close).unwrap();
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn minimal_get() {
        let mut req = Request::new();
        req.set_request_uri("http://example.com/hello?x=1").unwrap();
        let wire = encode(&req, "test-agent/1.0", false);
        assert!(wire.starts_with("GET /hello?x=1 HTTP/1.1\r\n"));
        assert!(wire.contains("Host: example.com\r\n"));
        assert!(wire.contains("User-Agent: test-agent/1.0\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
        assert!(!wire.contains("Content-Length"));
    }

    #[test]
    fn host_keeps_explicit_port() {
        let mut req = Request::new();
        req.set_request_uri("http://example.com:8080/").unwrap();
        let wire = encode(&req, "ua", false);
        assert!(wire.contains("Host: example.com:8080\r\n"));
    }

    #[test]
    fn caller_user_agent_wins() {
        let mut req = Request::new();
        req.set_request_uri("http://example.com/").unwrap();
        req.headers_mut()
            .insert(USER_AGENT, HeaderValue::from_static("mine"));
        let wire = encode(&req, "default", false);
        assert!(wire.contains("user-agent: mine\r\n"));
        assert!(!wire.contains("User-Agent: default"));
    }

    #[test]
    fn force_close_appends_header_once() {
        let mut req = Request::new();
        req.set_request_uri("http://example.com/").unwrap();
        let wire = encode(&req, "ua", true);
        assert_eq!(wire.matches("onnection: close\r\n").count(), 1);

        req.set_connection_close();
        let wire = encode(&req, "ua", true);
        assert_eq!(wire.matches("onnection: close\r\n").count(), 1);
    }

    #[test]
    fn body_sets_content_length() {
        let mut req = Request::new();
        req.set_request_uri("http://example.com/upload").unwrap();
        req.set_method(Method::POST);
        req.set_body(b"a=1&b=2");
        let wire = encode(&req, "ua", false);
        assert!(wire.contains("Content-Length: 7\r\n"));
        assert!(wire.ends_with("\r\n\r\na=1&b=2"));
    }

    #[test]
    fn empty_post_still_has_length() {
        let mut req = Request::new();
        req.set_request_uri("http://example.com/").unwrap();
        req.set_method(Method::POST);
        let wire = encode(&req, "ua", false);
        assert!(wire.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn missing_host_is_an_error() {
        let mut req = Request::new();
        req.set_request_uri("/relative/only").unwrap();
        let mut buf = BytesMut::new();
        let err = encode_request(&mut buf, &req, b"ua", false).unwrap_err();
        assert!(err.is_invalid_uri());
    }
}
