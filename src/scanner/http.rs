//! HTTP/1.1 exchange over any byte stream.
//!
//! One GET per call; the response head is parsed with httparse and the
//! body is consumed according to its framing so the next request can
//! reuse the connection. Every read is bounded by the caller's timeout.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// How much of the body gets logged per response.
pub const SNIPPET_LEN: usize = 20;

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 4096;

/// A parsed response: status code and the fully drained body.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// The exact request shape the scanner sends.
pub fn format_request(path: &str, user_agent: &str, host: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\nUser-Agent: {user_agent}\r\nHost: {host}\r\nAccept: */*\r\n\r\n"
    )
}

/// First bytes of the body, printable-escaped, for the result line.
pub fn body_snippet(body: &[u8]) -> String {
    let cut = &body[..body.len().min(SNIPPET_LEN)];
    String::from_utf8_lossy(cut)
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

/// Write `request` and read one full response.
pub async fn exchange<S>(
    stream: &mut S,
    request: &[u8],
    read_timeout: Duration,
) -> io::Result<HttpResponse>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request).await?;
    read_response(stream, read_timeout).await
}

/// How the body length is determined.
#[derive(Debug, PartialEq, Eq)]
enum Framing {
    Length(usize),
    Chunked,
    /// No framing header: body runs to connection close.
    Eof,
}

impl Framing {
    fn from_headers(headers: &[httparse::Header<'_>]) -> io::Result<Self> {
        for header in headers {
            if header.name.eq_ignore_ascii_case("transfer-encoding") {
                let value = String::from_utf8_lossy(header.value);
                if value.to_ascii_lowercase().contains("chunked") {
                    return Ok(Self::Chunked);
                }
            }
        }
        for header in headers {
            if header.name.eq_ignore_ascii_case("content-length") {
                let value = String::from_utf8_lossy(header.value);
                let len = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| invalid_data(format!("bad content-length: {value}")))?;
                return Ok(Self::Length(len));
            }
        }
        Ok(Self::Eof)
    }
}

/// Read and parse one response, draining the body per its framing.
pub async fn read_response<S>(stream: &mut S, read_timeout: Duration) -> io::Result<HttpResponse>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let (status, head_len, framing) = loop {
        if buf.len() > MAX_HEAD_BYTES {
            return Err(invalid_data("response head too large".to_string()));
        }
        let n = fill(stream, &mut buf, read_timeout).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response head",
            ));
        }
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let status = response
                    .code
                    .ok_or_else(|| invalid_data("missing status code".to_string()))?;
                let framing = Framing::from_headers(response.headers)?;
                break (status, head_len, framing);
            }
            Ok(httparse::Status::Partial) => continue,
            Err(e) => return Err(invalid_data(format!("bad response head: {e}"))),
        }
    };

    let mut pending = buf.split_off(head_len);
    let body = match framing {
        Framing::Length(len) => {
            while pending.len() < len {
                if fill(stream, &mut pending, read_timeout).await? == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-body",
                    ));
                }
            }
            pending.truncate(len);
            pending
        }
        Framing::Chunked => read_chunked(stream, pending, read_timeout).await?,
        Framing::Eof => {
            loop {
                if fill(stream, &mut pending, read_timeout).await? == 0 {
                    break;
                }
            }
            pending
        }
    };

    Ok(HttpResponse { status, body })
}

/// Decode a chunked body; `pending` holds bytes already read past the
/// head.
async fn read_chunked<S>(
    stream: &mut S,
    mut pending: Vec<u8>,
    read_timeout: Duration,
) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let line = read_line(stream, &mut pending, read_timeout).await?;
        let size_field = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| invalid_data(format!("bad chunk size: {line}")))?;
        if size == 0 {
            // Trailers, if any, end with an empty line.
            loop {
                let trailer = read_line(stream, &mut pending, read_timeout).await?;
                if trailer.is_empty() {
                    break;
                }
            }
            return Ok(body);
        }
        while pending.len() < size + 2 {
            if fill(stream, &mut pending, read_timeout).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-chunk",
                ));
            }
        }
        body.extend_from_slice(&pending[..size]);
        pending.drain(..size + 2);
    }
}

/// Pull one CRLF-terminated line out of `pending`, refilling as needed.
async fn read_line<S>(
    stream: &mut S,
    pending: &mut Vec<u8>,
    read_timeout: Duration,
) -> io::Result<String>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = pending.windows(2).position(|w| w == b"\r\n") {
            let line = String::from_utf8_lossy(&pending[..pos]).into_owned();
            pending.drain(..pos + 2);
            return Ok(line);
        }
        if fill(stream, pending, read_timeout).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-line",
            ));
        }
    }
}

/// One timed read appended onto `buf`; returns the byte count.
async fn fill<S>(stream: &mut S, buf: &mut Vec<u8>, read_timeout: Duration) -> io::Result<usize>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    let n = match tokio::time::timeout(read_timeout, stream.read(&mut chunk)).await {
        Ok(result) => result?,
        Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
    };
    buf.extend_from_slice(&chunk[..n]);
    Ok(n)
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[test]
    fn test_format_request_exact_bytes() {
        let request = format_request("/", "trawl mass scanner", "www.example.com");
        assert_eq!(
            request,
            "GET / HTTP/1.1\r\nUser-Agent: trawl mass scanner\r\nHost: www.example.com\r\nAccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn test_format_request_path_placement() {
        let request = format_request("/.git/HEAD", "ua", "h");
        assert!(request.starts_with("GET /.git/HEAD HTTP/1.1\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_body_snippet_truncates_to_twenty() {
        let body = vec![b'a'; 100];
        assert_eq!(body_snippet(&body).len(), 20);
    }

    #[test]
    fn test_body_snippet_short_body() {
        assert_eq!(body_snippet(b"ok"), "ok");
        assert_eq!(body_snippet(b""), "");
    }

    #[test]
    fn test_body_snippet_masks_control_chars() {
        assert_eq!(body_snippet(b"a\r\nb"), "a  b");
    }

    #[tokio::test]
    async fn test_response_with_content_length() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });
        let response = read_response(&mut client, TIMEOUT).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello");
    }

    #[tokio::test]
    async fn test_response_head_split_across_reads() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server.write_all(b"HTTP/1.1 404 Not ").await.unwrap();
            tokio::task::yield_now().await;
            server
                .write_all(b"Found\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });
        let response = read_response(&mut client, TIMEOUT).await.unwrap();
        assert_eq!(response.status, 404);
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn test_response_chunked_body() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server
                .write_all(
                    b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                      5\r\nhello\r\n7\r\n, world\r\n0\r\n\r\n",
                )
                .await
                .unwrap();
        });
        let response = read_response(&mut client, TIMEOUT).await.unwrap();
        assert_eq!(response.body, b"hello, world");
    }

    #[tokio::test]
    async fn test_response_eof_framed_body() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server
                .write_all(b"HTTP/1.1 200 OK\r\n\r\nuntil close")
                .await
                .unwrap();
            // Dropping the server half closes the stream.
        });
        let response = read_response(&mut client, TIMEOUT).await.unwrap();
        assert_eq!(response.body, b"until close");
    }

    #[tokio::test]
    async fn test_two_responses_on_one_connection() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\none\
                      HTTP/1.1 404 Not Found\r\nContent-Length: 3\r\n\r\ntwo",
                )
                .await
                .unwrap();
        });
        let first = read_response(&mut client, TIMEOUT).await.unwrap();
        assert_eq!((first.status, first.body.as_slice()), (200, &b"one"[..]));
        let second = read_response(&mut client, TIMEOUT).await.unwrap();
        assert_eq!((second.status, second.body.as_slice()), (404, &b"two"[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out() {
        let (mut client, _server) = tokio::io::duplex(4096);
        let err = read_response(&mut client, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_closed_before_head_is_eof_error() {
        let (mut client, server) = tokio::io::duplex(4096);
        drop(server);
        let err = read_response(&mut client, TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_garbage_head_is_invalid_data() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server.write_all(b"\0\0\0\0garbage\r\n\r\n").await.unwrap();
        });
        let err = read_response(&mut client, TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_exchange_writes_request_first() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let request = format_request("/", "ua", "example.com");
        let server_task = tokio::spawn(async move {
            let mut seen = vec![0u8; request.len()];
            server.read_exact(&mut seen).await.unwrap();
            server
                .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8(seen).unwrap()
        });
        let request = format_request("/", "ua", "example.com");
        let response = exchange(&mut client, request.as_bytes(), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(response.status, 204);
        let seen = server_task.await.unwrap();
        assert!(seen.starts_with("GET / HTTP/1.1\r\n"));
        assert!(seen.contains("Host: example.com\r\n"));
    }
}
