use std::io;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::HeaderMap;
use mock_core::{HttpVersion, MockRequest, MockResponse};
use tokio::io::{AsyncRead, AsyncReadExt};

const IO_CHUNK_SIZE: usize = 8 * 1024;
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    None,
    ContentLength(usize),
    Chunked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestHead {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) version: HttpVersion,
    pub(crate) headers: HeaderMap,
}

impl RequestHead {
    pub(crate) fn into_request(self, body: Bytes) -> MockRequest {
        MockRequest {
            method: self.method,
            target: self.target,
            version: self.version,
            headers: self.headers,
            body,
        }
    }
}

/// Buffers client bytes so a head can be split off without losing what follows it.
pub(crate) struct HeadReader<R> {
    stream: R,
    read_buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> HeadReader<R> {
    pub(crate) fn new(stream: R) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }

    /// Returns `None` when the peer closes cleanly between messages.
    pub(crate) async fn read_head(&mut self, max_head_bytes: usize) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(end) = find_head_end(&self.read_buf) {
                if end > max_head_bytes {
                    return Err(head_too_large());
                }
                let head = self.read_buf.drain(..end).collect::<Vec<_>>();
                return Ok(Some(head));
            }
            if self.read_buf.len() > max_head_bytes {
                return Err(head_too_large());
            }

            let mut chunk = [0_u8; IO_CHUNK_SIZE];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before request head completed",
                ));
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
    }

    pub(crate) async fn read_body(&mut self, length: usize) -> io::Result<Bytes> {
        while self.read_buf.len() < length {
            let mut chunk = [0_u8; IO_CHUNK_SIZE];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before request body completed",
                ));
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
        let body = self.read_buf.drain(..length).collect::<Vec<_>>();
        Ok(Bytes::from(body))
    }

    /// Hands back the stream together with any bytes read past the last head.
    pub(crate) fn into_parts(self) -> (R, Vec<u8>) {
        (self.stream, self.read_buf)
    }
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
        .map(|start| start + HEAD_TERMINATOR.len())
}

/// The only `InvalidData` error [`HeadReader::read_head`] produces.
fn head_too_large() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        "request head exceeded configured limit",
    )
}

pub(crate) fn parse_request_head(raw: &[u8]) -> io::Result<RequestHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| invalid_data("request head is not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| invalid_data("request line is missing"))?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| invalid_data("request method is missing"))?;
    let target = parts
        .next()
        .ok_or_else(|| invalid_data("request target is missing"))?;
    let version_text = parts
        .next()
        .ok_or_else(|| invalid_data("HTTP version is missing"))?;
    if parts.next().is_some() {
        return Err(invalid_data("request line had too many fields"));
    }
    let version = HttpVersion::parse(version_text)
        .ok_or_else(|| invalid_data("only HTTP/1.0 and HTTP/1.1 are supported"))?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid_data("malformed header line"))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| invalid_data("invalid header name"))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| invalid_data("invalid header value"))?;
        headers.append(name, value);
    }

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
    })
}

pub(crate) fn body_framing(headers: &HeaderMap) -> io::Result<BodyFraming> {
    let chunked = headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return Ok(BodyFraming::Chunked);
    }

    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|text| text.trim().parse::<usize>().ok())
            .ok_or_else(|| invalid_data("invalid Content-Length"))?;
        match length {
            Some(previous) if previous != parsed => {
                return Err(invalid_data("conflicting Content-Length headers"));
            }
            _ => length = Some(parsed),
        }
    }
    Ok(match length {
        Some(0) | None => BodyFraming::None,
        Some(length) => BodyFraming::ContentLength(length),
    })
}

/// Serializes a response as HTTP/1.1, adding `Content-Length` when the body allows one.
pub(crate) fn encode_response(response: &MockResponse) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + response.body.len());
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            response.status,
            response.reason_phrase()
        )
        .as_bytes(),
    );
    for (name, value) in &response.headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    let bodyless = (100..200).contains(&response.status)
        || response.status == 204
        || response.status == 304;
    if !bodyless && !response.headers.contains_key(CONTENT_LENGTH) {
        out.extend_from_slice(format!("content-length: {}\r\n", response.body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    if !bodyless {
        out.extend_from_slice(&response.body);
    }
    out
}

fn invalid_data(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use http::header::{HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
    use mock_core::{HttpVersion, MockResponse};

    use super::{body_framing, encode_response, parse_request_head};
    use super::{BodyFraming, HeadReader};

    #[test]
    fn parses_request_line_and_repeated_headers() {
        let head = parse_request_head(
            b"POST /items?id=1 HTTP/1.0\r\nHost: example.com\r\nConnection: keep-alive\r\nX-Tag: a\r\nX-Tag: b\r\n\r\n",
        )
        .expect("parse");
        assert_eq!(head.method, "POST");
        assert_eq!(head.target, "/items?id=1");
        assert_eq!(head.version, HttpVersion::Http10);
        assert_eq!(head.headers.get_all("x-tag").iter().count(), 2);
        let request = head.into_request(bytes::Bytes::new());
        assert!(request.is_keep_alive());
    }

    #[test]
    fn rejects_unsupported_version_and_malformed_headers() {
        assert!(parse_request_head(b"GET / HTTP/2\r\n\r\n").is_err());
        assert!(parse_request_head(b"GET / HTTP/1.1\r\nbroken\r\n\r\n").is_err());
        assert!(parse_request_head(b"GET /\r\n\r\n").is_err());
        assert!(parse_request_head(b"\r\n\r\n").is_err());
    }

    #[test]
    fn framing_prefers_chunked_and_rejects_conflicting_lengths() {
        let head = parse_request_head(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\nContent-Length: 4\r\n\r\n",
        )
        .expect("parse");
        assert_eq!(body_framing(&head.headers).expect("framing"), BodyFraming::Chunked);

        let head = parse_request_head(b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\n").expect("parse");
        assert_eq!(
            body_framing(&head.headers).expect("framing"),
            BodyFraming::ContentLength(4)
        );

        let head = parse_request_head(
            b"POST / HTTP/1.1\r\nContent-Length: 4\r\nContent-Length: 5\r\n\r\n",
        )
        .expect("parse");
        assert!(body_framing(&head.headers).is_err());

        let head = parse_request_head(b"GET / HTTP/1.1\r\n\r\n").expect("parse");
        assert_eq!(body_framing(&head.headers).expect("framing"), BodyFraming::None);
    }

    #[test]
    fn encodes_status_headers_and_length() {
        let response = MockResponse::not_found()
            .with_header(CONTENT_TYPE, HeaderValue::from_static("text/plain"))
            .with_body("missing");
        let encoded = String::from_utf8(encode_response(&response)).expect("utf8");
        assert!(encoded.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(encoded.contains("content-type: text/plain\r\n"));
        assert!(encoded.contains("content-length: 7\r\n"));
        assert!(encoded.ends_with("\r\n\r\nmissing"));
    }

    #[test]
    fn keeps_explicit_length_and_omits_body_for_no_content() {
        let response = MockResponse::ok()
            .with_header(CONTENT_LENGTH, HeaderValue::from_static("0"))
            .with_header(CONNECTION, HeaderValue::from_static("close"));
        let encoded = String::from_utf8(encode_response(&response)).expect("utf8");
        assert_eq!(encoded.matches("content-length").count(), 1);

        let encoded = encode_response(&MockResponse::new(204).with_body("ignored"));
        assert_eq!(encoded, b"HTTP/1.1 204 No Content\r\n\r\n".to_vec());
    }

    #[tokio::test]
    async fn reader_splits_pipelined_messages_and_keeps_leftover() {
        let input: &[u8] =
            b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET /b HTTP/1.1\r\n\r\n\x16\x03";
        let mut reader = HeadReader::new(input);

        let first = reader.read_head(1024).await.expect("read").expect("head");
        assert!(first.starts_with(b"POST /a"));
        assert_eq!(&reader.read_body(3).await.expect("body")[..], b"abc");

        let second = reader.read_head(1024).await.expect("read").expect("head");
        assert!(second.starts_with(b"GET /b"));
        let (_, leftover) = reader.into_parts();
        assert_eq!(leftover, b"\x16\x03".to_vec());
    }

    #[tokio::test]
    async fn reader_reports_clean_eof_truncation_and_oversize() {
        let mut reader = HeadReader::new(&b""[..]);
        assert!(reader.read_head(64).await.expect("read").is_none());

        let mut reader = HeadReader::new(&b"GET / HTTP/1.1\r\n"[..]);
        let error = reader.read_head(64).await.expect_err("truncated");
        assert_eq!(error.kind(), std::io::ErrorKind::UnexpectedEof);

        let oversized = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(128));
        let mut reader = HeadReader::new(oversized.as_bytes());
        let error = reader.read_head(64).await.expect_err("oversized");
        assert_eq!(error.kind(), std::io::ErrorKind::InvalidData);
    }
}
