//! Response head parsing and body framing.

use bytes::{Buf, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Parse};
use crate::headers;
use crate::response::Response;

use super::MAX_HEADERS;

/// A chunk-size line (hex size plus extensions) longer than this is treated
/// as a protocol error rather than buffered indefinitely.
const MAX_CHUNK_LINE: usize = 16 * 1024;

/// Reads one response from `io` into `resp`.
///
/// `buf` is the pooled read buffer; the header section must fit into
/// `header_limit` bytes. `max_body_size` bounds the decoded body when
/// nonzero. Body framing, in priority order: none (HEAD or a status that
/// forbids a body), chunked, Content-Length, read-to-EOF.
pub(crate) async fn read_response<R>(
    io: &mut R,
    buf: &mut BytesMut,
    resp: &mut Response,
    max_body_size: usize,
    header_limit: usize,
) -> crate::Result<()>
where
    R: AsyncRead + Unpin,
{
    buf.clear();

    loop {
        if !buf.is_empty() {
            if let Some(head_len) = parse_head(buf, resp)? {
                if head_len > header_limit {
                    return Err(Error::new_parse(Parse::TooLarge));
                }
                buf.advance(head_len);
                break;
            }
            if buf.len() >= header_limit {
                return Err(Error::new_parse(Parse::TooLarge));
            }
        }
        let read = io.read_buf(buf).await.map_err(Error::new_io)?;
        if read == 0 {
            return Err(if buf.is_empty() {
                Error::new_premature_end()
            } else {
                Error::new_parse(Parse::Incomplete)
            });
        }
    }

    let status = resp.status();
    if resp.skip_body()
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(());
    }

    if headers::transfer_encoding_is_chunked(resp.headers()) {
        return read_chunked(io, buf, resp, max_body_size).await;
    }

    if resp.headers().contains_key(http::header::CONTENT_LENGTH) {
        let len = headers::content_length(resp.headers())
            .ok_or_else(|| Error::new_parse(Parse::Header))? as usize;
        return read_exact_body(io, buf, resp, len, max_body_size).await;
    }

    read_until_eof(io, buf, resp, max_body_size).await
}

/// Attempts to parse a complete head out of `buf`. Returns the head length
/// when complete, `None` when more bytes are needed.
fn parse_head(buf: &BytesMut, resp: &mut Response) -> crate::Result<Option<usize>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    let head_len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e @ (httparse::Error::Status | httparse::Error::Version)) => {
            return Err(Error::new_parse(Parse::StatusLine).with(e))
        }
        Err(e) => return Err(Error::new_parse(Parse::Header).with(e)),
    };

    let code = parsed.code.ok_or_else(|| Error::new_parse(Parse::StatusLine))?;
    let status =
        StatusCode::from_u16(code).map_err(|e| Error::new_parse(Parse::StatusLine).with(e))?;
    resp.set_status(status);
    resp.set_version(match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    });

    for header in parsed.headers {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| Error::new_parse(Parse::Header).with(e))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| Error::new_parse(Parse::Header).with(e))?;
        resp.headers_mut().append(name, value);
    }

    Ok(Some(head_len))
}

async fn read_exact_body<R>(
    io: &mut R,
    buf: &mut BytesMut,
    resp: &mut Response,
    len: usize,
    max_body_size: usize,
) -> crate::Result<()>
where
    R: AsyncRead + Unpin,
{
    if max_body_size > 0 && len > max_body_size {
        return Err(Error::new_body_too_large());
    }

    let take = buf.len().min(len);
    resp.body_mut().reserve(len);
    resp.body_mut().extend_from_slice(&buf[..take]);
    buf.advance(take);

    while resp.body().len() < len {
        let read = io
            .read_buf(resp.body_mut())
            .await
            .map_err(Error::new_io)?;
        if read == 0 {
            return Err(Error::new_parse(Parse::Incomplete));
        }
    }
    resp.body_mut().truncate(len);
    Ok(())
}

async fn read_until_eof<R>(
    io: &mut R,
    buf: &mut BytesMut,
    resp: &mut Response,
    max_body_size: usize,
) -> crate::Result<()>
where
    R: AsyncRead + Unpin,
{
    resp.body_mut().extend_from_slice(buf);
    buf.clear();

    loop {
        if max_body_size > 0 && resp.body().len() > max_body_size {
            return Err(Error::new_body_too_large());
        }
        let read = io
            .read_buf(resp.body_mut())
            .await
            .map_err(Error::new_io)?;
        if read == 0 {
            break;
        }
    }
    if max_body_size > 0 && resp.body().len() > max_body_size {
        return Err(Error::new_body_too_large());
    }

    // No framing delimited this body, so the connection cannot be reused.
    resp.set_eof_framed();
    Ok(())
}

async fn read_chunked<R>(
    io: &mut R,
    raw: &mut BytesMut,
    resp: &mut Response,
    max_body_size: usize,
) -> crate::Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let (size, line_len) = read_chunk_size(io, raw).await?;
        raw.advance(line_len);

        if size == 0 {
            return read_trailers(io, raw).await;
        }

        if max_body_size > 0 && resp.body().len() + size > max_body_size {
            return Err(Error::new_body_too_large());
        }

        while raw.len() < size + 2 {
            let read = io.read_buf(raw).await.map_err(Error::new_io)?;
            if read == 0 {
                return Err(Error::new_parse(Parse::Incomplete));
            }
        }
        resp.body_mut().extend_from_slice(&raw[..size]);
        raw.advance(size);
        if &raw[..2] != b"\r\n" {
            return Err(Error::new_parse(Parse::Chunk));
        }
        raw.advance(2);
    }
}

/// Reads until a full chunk-size line is buffered and returns
/// `(size, line length including CRLF)`.
async fn read_chunk_size<R>(io: &mut R, raw: &mut BytesMut) -> crate::Result<(usize, usize)>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = find_crlf(raw) {
            let size = parse_chunk_size(&raw[..pos])?;
            return Ok((size, pos + 2));
        }
        if raw.len() > MAX_CHUNK_LINE {
            return Err(Error::new_parse(Parse::Chunk));
        }
        let read = io.read_buf(raw).await.map_err(Error::new_io)?;
        if read == 0 {
            return Err(Error::new_parse(Parse::Incomplete));
        }
    }
}

/// Consumes (and ignores) trailers after the terminating zero chunk, up to
/// and including the final empty line.
async fn read_trailers<R>(io: &mut R, raw: &mut BytesMut) -> crate::Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = find_crlf(raw) {
            let is_end = pos == 0;
            raw.advance(pos + 2);
            if is_end {
                return Ok(());
            }
            continue;
        }
        if raw.len() > MAX_CHUNK_LINE {
            return Err(Error::new_parse(Parse::Chunk));
        }
        let read = io.read_buf(raw).await.map_err(Error::new_io)?;
        if read == 0 {
            return Err(Error::new_parse(Parse::Incomplete));
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> crate::Result<usize> {
    let line = std::str::from_utf8(line).map_err(|_| Error::new_parse(Parse::Chunk))?;
    // Chunk extensions (";key=value") are tolerated and dropped.
    let digits = line.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(digits, 16).map_err(|e| Error::new_parse(Parse::Chunk).with(e))
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode(input: &[u8], skip_body: bool, max_body: usize) -> crate::Result<Response> {
        let mut io = input;
        let mut buf = BytesMut::new();
        let mut resp = Response::new();
        resp.set_skip_body(skip_body);
        read_response(&mut io, &mut buf, &mut resp, max_body, 4096).await?;
        Ok(resp)
    }

    #[tokio::test]
    async fn content_length_body() {
        let resp = decode(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello", false, 0)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body(), b"hello");
        assert!(!resp.connection_close());
    }

    #[tokio::test]
    async fn chunked_body() {
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                     5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let resp = decode(wire, false, 0).await.unwrap();
        assert_eq!(resp.body(), b"hello world");
    }

    #[tokio::test]
    async fn chunk_extensions_are_dropped() {
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                     5;ext=1\r\nhello\r\n0\r\n\r\n";
        let resp = decode(wire, false, 0).await.unwrap();
        assert_eq!(resp.body(), b"hello");
    }

    #[tokio::test]
    async fn eof_framed_body_forces_close() {
        let resp = decode(b"HTTP/1.1 200 OK\r\n\r\nuntil eof", false, 0)
            .await
            .unwrap();
        assert_eq!(resp.body(), b"until eof");
        assert!(resp.connection_close());
    }

    #[tokio::test]
    async fn skip_body_reads_head_only() {
        let resp = decode(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n", true, 0)
            .await
            .unwrap();
        assert!(resp.body().is_empty());
    }

    #[tokio::test]
    async fn no_content_has_no_body() {
        let resp = decode(b"HTTP/1.1 204 No Content\r\n\r\n", false, 0)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(resp.body().is_empty());
    }

    #[tokio::test]
    async fn body_over_limit() {
        let err = decode(b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nhello world", false, 10)
            .await
            .unwrap_err();
        assert!(err.is_body_too_large());
    }

    #[tokio::test]
    async fn eof_body_over_limit() {
        let err = decode(b"HTTP/1.1 200 OK\r\n\r\nhello world", false, 10)
            .await
            .unwrap_err();
        assert!(err.is_body_too_large());
    }

    #[tokio::test]
    async fn empty_input_is_premature_end() {
        let err = decode(b"", false, 0).await.unwrap_err();
        assert!(err.is_premature_end());
    }

    #[tokio::test]
    async fn truncated_head_is_incomplete() {
        let err = decode(b"HTTP/1.1 200 OK\r\nContent-", false, 0)
            .await
            .unwrap_err();
        assert!(err.is_parse());
    }

    #[tokio::test]
    async fn truncated_body_is_incomplete() {
        let err = decode(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhi", false, 0)
            .await
            .unwrap_err();
        assert!(err.is_parse());
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let mut wire = b"HTTP/1.1 200 OK\r\n".to_vec();
        wire.extend_from_slice(format!("X-Filler: {}\r\n", "a".repeat(8192)).as_bytes());
        wire.extend_from_slice(b"\r\n");
        let err = decode(&wire, false, 0).await.unwrap_err();
        assert!(err.is_parse());
    }

    #[tokio::test]
    async fn http10_version_is_recorded() {
        let resp = decode(b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\nok", false, 0)
            .await
            .unwrap();
        assert_eq!(resp.version(), Version::HTTP_10);
        assert!(resp.connection_close());
    }

    #[tokio::test]
    async fn conflicting_content_lengths_are_rejected() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nContent-Length: 3\r\n\r\nok";
        let err = decode(wire, false, 0).await.unwrap_err();
        assert!(err.is_parse());
    }
}
