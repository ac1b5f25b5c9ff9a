//! Request-header sniffing from the initial client read.
//!
//! The tunnel never parses HTTP properly. It takes a single bounded read of
//! whatever the client sends first and scans it for a handful of literal
//! header names:
//! - max_request_bytes: 16384 bytes default
//! - handshake_timeout: 10s default
//!
//! Matching is case-sensitive on the header name, first occurrence only,
//! with no folding of repeated or multi-line headers.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::debug;

/// Default maximum bytes taken from the client's first read.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 16 * 1024;

/// Default deadline for the client's first read.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying an explicit `host:port` target.
pub const X_REAL_HOST: &[u8] = b"X-Real-Host";
/// Standard host header, used as a target fallback.
pub const HOST: &[u8] = b"Host";
/// WebSocket upgrade marker.
pub const UPGRADE: &[u8] = b"Upgrade";
/// Connection header (read for logging only).
pub const CONNECTION: &[u8] = b"Connection";
/// Presence triggers one extra discard read.
pub const X_SPLIT: &[u8] = b"X-Split";
/// Shared-secret header.
pub const X_PASS: &[u8] = b"X-Pass";

const DELIMITER: &[u8] = b": ";
const CRLF: &[u8] = b"\r\n";

/// Extract a header value from a raw request buffer.
///
/// Returns the bytes between the first `name: ` occurrence and the following
/// CRLF. Returns an empty slice when the header is absent or the value has no
/// terminating CRLF.
pub fn scan_header<'a>(buf: &'a [u8], name: &[u8]) -> &'a [u8] {
    let found = (0..buf.len()).find(|&i| {
        buf[i..].starts_with(name) && buf[i + name.len()..].starts_with(DELIMITER)
    });

    let Some(pos) = found else {
        return &[];
    };

    let value = &buf[pos + name.len() + DELIMITER.len()..];
    match find(value, CRLF) {
        Some(end) => &value[..end],
        None => &[],
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn contains_ignore_ascii_case(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}

/// The client's initial read, with accessors for the recognised headers.
#[derive(Debug, Clone, Default)]
pub struct RequestHead {
    bytes: Vec<u8>,
}

impl RequestHead {
    /// Wrap an already-read buffer.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Raw bytes of the initial read.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Value of an arbitrary header, empty if absent.
    pub fn header(&self, name: &[u8]) -> &[u8] {
        scan_header(&self.bytes, name)
    }

    pub fn real_host(&self) -> &[u8] {
        self.header(X_REAL_HOST)
    }

    pub fn host(&self) -> &[u8] {
        self.header(HOST)
    }

    pub fn upgrade(&self) -> &[u8] {
        self.header(UPGRADE)
    }

    pub fn connection(&self) -> &[u8] {
        self.header(CONNECTION)
    }

    pub fn pass(&self) -> &[u8] {
        self.header(X_PASS)
    }

    /// Whether the client asked for the extra discard read.
    pub fn split_requested(&self) -> bool {
        !self.header(X_SPLIT).is_empty()
    }

    /// Whether `Upgrade` carries the `websocket` token (any case).
    pub fn is_websocket_upgrade(&self) -> bool {
        contains_ignore_ascii_case(self.upgrade(), b"websocket")
    }
}

/// Take one bounded read from the client within the handshake deadline.
///
/// EOF before any byte arrives is reported as `UnexpectedEof`; an expired
/// deadline as `TimedOut`.
pub async fn read_request<R: AsyncRead + Unpin>(
    stream: &mut R,
    max_bytes: usize,
    deadline: Duration,
) -> io::Result<RequestHead> {
    let mut buffer = vec![0u8; max_bytes.max(1)];

    let n = match timeout(deadline, stream.read(&mut buffer)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "handshake read timeout",
            ))
        }
    };

    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "client closed before sending a request",
        ));
    }

    buffer.truncate(n);
    debug!(bytes = n, "Request head read");
    Ok(RequestHead::new(buffer))
}

/// Read and drop one chunk from the client, within the handshake deadline.
///
/// Some clients send their handshake in two fragments and announce it with
/// `X-Split`. Returns the number of bytes discarded.
pub async fn discard_fragment<R: AsyncRead + Unpin>(
    stream: &mut R,
    max_bytes: usize,
    deadline: Duration,
) -> io::Result<usize> {
    let mut buffer = vec![0u8; max_bytes.max(1)];
    match timeout(deadline, stream.read(&mut buffer)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "split fragment read timeout",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    const WEBSOCKET_REQUEST: &[u8] = b"GET /ssh HTTP/1.1\r\n\
Host: target.example:9000\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
\r\n";

    #[test]
    fn test_scan_real_host() {
        let buf = b"GET / HTTP/1.1\r\nX-Real-Host: example.com:2222\r\n\r\n";
        assert_eq!(scan_header(buf, X_REAL_HOST), b"example.com:2222");
    }

    #[rstest]
    #[case::host(HOST, b"target.example:9000".as_slice())]
    #[case::upgrade(UPGRADE, b"websocket".as_slice())]
    #[case::connection(CONNECTION, b"Upgrade".as_slice())]
    #[case::absent(X_PASS, b"".as_slice())]
    fn test_scan_websocket_request(#[case] name: &[u8], #[case] expected: &[u8]) {
        assert_eq!(scan_header(WEBSOCKET_REQUEST, name), expected);
    }

    #[rstest]
    #[case::no_crlf(b"X-Real-Host: example.com:22".as_slice())]
    #[case::no_space(b"X-Real-Host:example.com:22\r\n".as_slice())]
    #[case::empty(b"".as_slice())]
    #[case::name_only(b"X-Real-Host".as_slice())]
    #[case::name_at_end(b"X-Real-Host: ".as_slice())]
    fn test_scan_malformed_is_empty(#[case] buf: &[u8]) {
        assert!(scan_header(buf, X_REAL_HOST).is_empty());
    }

    #[test]
    fn test_scan_first_occurrence_only() {
        let buf = b"X-Pass: first\r\nX-Pass: second\r\n\r\n";
        assert_eq!(scan_header(buf, X_PASS), b"first");
    }

    #[test]
    fn test_scan_is_case_sensitive() {
        let buf = b"x-real-host: example.com:22\r\n\r\n";
        assert!(scan_header(buf, X_REAL_HOST).is_empty());
    }

    #[test]
    fn test_request_head_accessors() {
        let head = RequestHead::new(
            b"GET / HTTP/1.1\r\nUpgrade: WebSocket\r\nX-Split: 1\r\nX-Pass: s3cret\r\n\r\n".to_vec(),
        );
        assert!(head.is_websocket_upgrade());
        assert!(head.split_requested());
        assert_eq!(head.pass(), b"s3cret");
        assert!(head.real_host().is_empty());
    }

    #[test]
    fn test_upgrade_without_websocket_token() {
        let head = RequestHead::new(b"Upgrade: h2c\r\n\r\n".to_vec());
        assert!(!head.is_websocket_upgrade());
    }

    #[tokio::test]
    async fn test_read_request_single_read() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, b"Host: a:1\r\n\r\n")
            .await
            .unwrap();

        let head = read_request(&mut server, 1024, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(head.host(), b"a:1");
    }

    #[tokio::test]
    async fn test_read_request_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let err = read_request(&mut server, 1024, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_request_timeout() {
        let (_client, mut server) = tokio::io::duplex(64);

        let err = read_request(&mut server, 1024, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    proptest! {
        #[test]
        fn prop_scan_never_panics(buf in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = scan_header(&buf, X_REAL_HOST);
            let _ = scan_header(&buf, b"");
        }

        #[test]
        fn prop_scan_without_delimiter_is_empty(buf in "[A-Za-z0-9\r\n ]{0,256}") {
            // No ':' anywhere, so no header can match.
            prop_assert!(scan_header(buf.as_bytes(), HOST).is_empty());
        }

        #[test]
        fn prop_scan_extracts_value(
            prefix in "[A-Za-z \r\n]{0,64}",
            value in "[a-z0-9.:-]{0,64}",
        ) {
            let buf = format!("{prefix}\r\nX-Real-Host: {value}\r\n\r\n");
            // The prefix cannot contain the header name followed by ": ".
            prop_assume!(!prefix.contains("X-Real-Host"));
            prop_assert_eq!(scan_header(buf.as_bytes(), X_REAL_HOST), value.as_bytes());
        }
    }
}
