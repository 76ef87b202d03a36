use std::net::IpAddr;

use bytes::{BufMut, Bytes, BytesMut};
use http::{Method, StatusCode, Version};
use thiserror::Error;

/// Upper bound on a request or response head, request line included
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

const MAX_HEADERS: usize = 64;

/// Errors related to HTTP/1 head parsing
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HeadError {
    /// Error when a head is structurally invalid beyond what httparse reports
    #[error("malformed head: {0}")]
    Malformed(&'static str),

    /// Error when a head does not terminate within the buffer limit
    #[error("head exceeds {MAX_HEAD_BYTES} bytes")]
    TooLarge,

    #[error(transparent)]
    Parse(#[from] httparse::Error),
}

/// Result type for head operations
pub type HeadResult<T> = Result<T, HeadError>;

/// One header line, order and spelling preserved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// How a message body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head
    None,
    /// Exactly this many bytes follow
    Length(u64),
    /// Chunked transfer coding
    Chunked,
    /// Body runs until the peer closes
    UntilClose,
}

fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

fn remove_header(headers: &mut Vec<Header>, name: &str) {
    headers.retain(|h| !h.name.eq_ignore_ascii_case(name));
}

fn version_text(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        _ => "HTTP/1.1",
    }
}

fn parse_version(raw: Option<u8>) -> HeadResult<Version> {
    match raw {
        Some(0) => Ok(Version::HTTP_10),
        Some(1) => Ok(Version::HTTP_11),
        _ => Err(HeadError::Malformed("unsupported HTTP version")),
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Vec<Header> {
    parsed
        .iter()
        .map(|h| Header {
            name: h.name.to_string(),
            value: String::from_utf8_lossy(h.value).into_owned(),
        })
        .collect()
}

/// Body framing derived from a header block.
///
/// Transfer-Encoding wins over Content-Length; conflicting or
/// unparseable Content-Length values are malformed rather than guessed
/// at, since a wrong body length desynchronizes the connection.
fn framing_from_headers(headers: &[Header]) -> HeadResult<Option<BodyFraming>> {
    if let Some(te) = find_header(headers, "transfer-encoding") {
        if te
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
        {
            return Ok(Some(BodyFraming::Chunked));
        }
    }

    let mut length: Option<u64> = None;
    for header in headers {
        if !header.name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let value: u64 = header
            .value
            .trim()
            .parse()
            .map_err(|_| HeadError::Malformed("invalid content-length"))?;
        match length {
            Some(existing) if existing != value => {
                return Err(HeadError::Malformed("conflicting content-length"));
            }
            _ => length = Some(value),
        }
    }

    Ok(length.map(BodyFraming::Length))
}

/// Whether a head at this version lets the connection persist afterwards
pub fn keep_alive(version: Version, headers: &[Header]) -> bool {
    match find_header(headers, "connection") {
        Some(value) => {
            let tokens: Vec<String> = value
                .split(',')
                .map(|t| t.trim().to_ascii_lowercase())
                .collect();
            if tokens.iter().any(|t| t == "close") {
                false
            } else if version == Version::HTTP_10 {
                tokens.iter().any(|t| t == "keep-alive")
            } else {
                true
            }
        }
        None => version >= Version::HTTP_11,
    }
}

/// Parsed request head
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: Vec<Header>,
}

impl RequestHead {
    /// Parse a request head from the front of `buf`
    ///
    /// Returns `None` while the head is incomplete. On success the head
    /// bytes are consumed from `buf`, leaving any body bytes in place.
    pub fn parse(buf: &mut BytesMut) -> HeadResult<Option<RequestHead>> {
        let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut storage);
        let (head, consumed) = match req.parse(&buf[..])? {
            httparse::Status::Partial => {
                if buf.len() >= MAX_HEAD_BYTES {
                    return Err(HeadError::TooLarge);
                }
                return Ok(None);
            }
            httparse::Status::Complete(len) => {
                let method = req
                    .method
                    .ok_or(HeadError::Malformed("missing method"))?
                    .parse::<Method>()
                    .map_err(|_| HeadError::Malformed("invalid method"))?;
                let target = req
                    .path
                    .ok_or(HeadError::Malformed("missing request target"))?
                    .to_string();
                let version = parse_version(req.version)?;
                let headers = collect_headers(req.headers);
                (
                    RequestHead {
                        method,
                        target,
                        version,
                        headers,
                    },
                    len,
                )
            }
        };
        let _ = buf.split_to(consumed);
        Ok(Some(head))
    }

    /// First value of a header, name compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Host header value, if any
    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// Replace every occurrence of a header with a single value
    pub fn set_header(&mut self, name: &str, value: &str) {
        remove_header(&mut self.headers, name);
        self.headers.push(Header::new(name, value));
    }

    /// Remove every occurrence of a header
    pub fn remove_headers(&mut self, name: &str) {
        remove_header(&mut self.headers, name);
    }

    /// Body framing declared by this request; no declaration means no body
    pub fn body_framing(&self) -> HeadResult<BodyFraming> {
        Ok(framing_from_headers(&self.headers)?.unwrap_or(BodyFraming::None))
    }

    /// Stamp forwarded-metadata headers for the next hop.
    ///
    /// A trusted peer's inbound values are kept, with the peer appended
    /// to the X-Forwarded-For chain. An untrusted peer's values are
    /// overwritten from the socket, never copied from inbound headers.
    pub fn stamp_forwarded(&mut self, peer: IpAddr, local_port: u16, trusted: bool) {
        let peer_text = peer.to_string();
        let host = self.host().map(str::to_string);

        if trusted {
            if self.header("x-real-ip").is_none() {
                self.set_header("X-Real-IP", &peer_text);
            }
            if self.header("x-client-ip").is_none() {
                self.set_header("X-Client-IP", &peer_text);
            }
            let chain = match self.header("x-forwarded-for") {
                Some(existing) => format!("{existing}, {peer_text}"),
                None => peer_text.clone(),
            };
            self.set_header("X-Forwarded-For", &chain);
            if self.header("x-forwarded-proto").is_none() {
                self.set_header("X-Forwarded-Proto", "http");
            }
            if self.header("x-forwarded-port").is_none() {
                self.set_header("X-Forwarded-Port", &local_port.to_string());
            }
            if self.header("x-forwarded-host").is_none() {
                if let Some(host) = host {
                    self.set_header("X-Forwarded-Host", &host);
                }
            }
        } else {
            self.set_header("X-Real-IP", &peer_text);
            self.set_header("X-Client-IP", &peer_text);
            self.set_header("X-Forwarded-For", &peer_text);
            self.set_header("X-Forwarded-Proto", "http");
            self.set_header("X-Forwarded-Port", &local_port.to_string());
            if let Some(host) = host {
                self.set_header("X-Forwarded-Host", &host);
            }
        }
    }

    /// Render the head back to wire form
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(256);
        out.put_slice(self.method.as_str().as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.target.as_bytes());
        out.put_u8(b' ');
        out.put_slice(version_text(self.version).as_bytes());
        out.put_slice(b"\r\n");
        for header in &self.headers {
            out.put_slice(header.name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(header.value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        out.freeze()
    }
}

/// Parsed or synthesized response head
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub version: Version,
    pub headers: Vec<Header>,
}

impl ResponseHead {
    /// Parse a response head from the front of `buf`
    ///
    /// Returns `None` while the head is incomplete. On success the head
    /// bytes are consumed from `buf`.
    pub fn parse(buf: &mut BytesMut) -> HeadResult<Option<ResponseHead>> {
        let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut storage);
        let (head, consumed) = match res.parse(&buf[..])? {
            httparse::Status::Partial => {
                if buf.len() >= MAX_HEAD_BYTES {
                    return Err(HeadError::TooLarge);
                }
                return Ok(None);
            }
            httparse::Status::Complete(len) => {
                let code = res.code.ok_or(HeadError::Malformed("missing status code"))?;
                let status = StatusCode::from_u16(code)
                    .map_err(|_| HeadError::Malformed("invalid status code"))?;
                let reason = res.reason.filter(|r| !r.is_empty()).map(str::to_string);
                let version = parse_version(res.version)?;
                let headers = collect_headers(res.headers);
                (
                    ResponseHead {
                        status,
                        reason,
                        version,
                        headers,
                    },
                    len,
                )
            }
        };
        let _ = buf.split_to(consumed);
        Ok(Some(head))
    }

    /// Build an empty response head for a synthesized answer
    pub fn synthetic(status: StatusCode) -> ResponseHead {
        ResponseHead {
            status,
            reason: None,
            version: Version::HTTP_11,
            headers: Vec::new(),
        }
    }

    /// First value of a header, name compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Replace every occurrence of a header with a single value
    pub fn set_header(&mut self, name: &str, value: &str) {
        remove_header(&mut self.headers, name);
        self.headers.push(Header::new(name, value));
    }

    /// Remove every occurrence of a header
    pub fn remove_headers(&mut self, name: &str) {
        remove_header(&mut self.headers, name);
    }

    /// Body framing of this response, given the request that elicited it
    pub fn body_framing(&self, request_method: &Method) -> HeadResult<BodyFraming> {
        if *request_method == Method::HEAD
            || self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
        {
            return Ok(BodyFraming::None);
        }
        Ok(framing_from_headers(&self.headers)?.unwrap_or(BodyFraming::UntilClose))
    }

    /// Drop headers that promise a byte count or byte ranges.
    ///
    /// Called when the relay re-frames a body and the original length
    /// stops being true on the wire.
    pub fn strip_length_hints(&mut self) {
        self.remove_headers("content-length");
        self.remove_headers("transfer-encoding");
        self.remove_headers("content-range");
        self.remove_headers("accept-ranges");
    }

    /// Append a Via hop to any existing chain
    pub fn stamp_via(&mut self, received_by: &str, server_token: Option<&str>) {
        let hop = match server_token {
            Some(token) => format!("1.1 {received_by} ({token})"),
            None => format!("1.1 {received_by}"),
        };
        let chain = match self.header("via") {
            Some(existing) => format!("{existing}, {hop}"),
            None => hop,
        };
        self.set_header("Via", &chain);
    }

    /// Append a Strict-Transport-Security header when enabled
    pub fn stamp_sts(&mut self, max_age_seconds: u64) {
        if max_age_seconds > 0 {
            self.set_header(
                "Strict-Transport-Security",
                &format!("max-age={max_age_seconds}"),
            );
        }
    }

    /// Render the head back to wire form
    pub fn encode(&self) -> Bytes {
        let reason = self
            .reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or("");
        let mut out = BytesMut::with_capacity(256);
        out.put_slice(version_text(self.version).as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.status.as_str().as_bytes());
        out.put_u8(b' ');
        out.put_slice(reason.as_bytes());
        out.put_slice(b"\r\n");
        for header in &self.headers {
            out.put_slice(header.name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(header.value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw: &str) -> RequestHead {
        let mut buf = BytesMut::from(raw.as_bytes());
        RequestHead::parse(&mut buf)
            .expect("valid head")
            .expect("complete head")
    }

    fn response(raw: &str) -> ResponseHead {
        let mut buf = BytesMut::from(raw.as_bytes());
        ResponseHead::parse(&mut buf)
            .expect("valid head")
            .expect("complete head")
    }

    #[test]
    fn test_request_parse_consumes_head_and_leaves_body() {
        let mut buf = BytesMut::from(
            &b"POST /submit HTTP/1.1\r\nHost: a.test\r\nContent-Length: 5\r\n\r\nhello"[..],
        );
        let head = RequestHead::parse(&mut buf).unwrap().expect("complete");
        assert_eq!(head.method, Method::POST);
        assert_eq!(head.target, "/submit");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.host(), Some("a.test"));
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn test_request_parse_partial_returns_none() {
        let raw = b"GET / HTTP/1.1\r\nHost: a.";
        let mut buf = BytesMut::from(&raw[..]);
        assert!(RequestHead::parse(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), raw.len());
    }

    #[test]
    fn test_request_parse_unterminated_head_hits_size_limit() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
        raw.resize(MAX_HEAD_BYTES + 16, b'a');
        let mut buf = BytesMut::from(&raw[..]);
        assert!(matches!(
            RequestHead::parse(&mut buf),
            Err(HeadError::TooLarge)
        ));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let head = request("GET / HTTP/1.1\r\nX-Thing: yes\r\n\r\n");
        assert_eq!(head.header("x-thing"), Some("yes"));
        assert_eq!(head.header("X-THING"), Some("yes"));
        assert_eq!(head.header("x-other"), None);
    }

    #[test]
    fn test_http10_version_is_parsed() {
        let head = request("GET / HTTP/1.0\r\n\r\n");
        assert_eq!(head.version, Version::HTTP_10);
    }

    #[test]
    fn test_connect_is_detected() {
        let head = request("CONNECT b.test:443 HTTP/1.1\r\nHost: b.test:443\r\n\r\n");
        assert!(head.is_connect());
        assert_eq!(head.target, "b.test:443");
    }

    #[test]
    fn test_request_without_length_headers_has_no_body() {
        let head = request("GET / HTTP/1.1\r\nHost: a.test\r\n\r\n");
        assert_eq!(head.body_framing().unwrap(), BodyFraming::None);
    }

    #[test]
    fn test_response_framing_precedence() {
        let res = response("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(
            res.body_framing(&Method::GET).unwrap(),
            BodyFraming::Chunked
        );

        let res = response("HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(
            res.body_framing(&Method::GET).unwrap(),
            BodyFraming::Length(10)
        );

        let res = response("HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(
            res.body_framing(&Method::GET).unwrap(),
            BodyFraming::UntilClose
        );
    }

    #[test]
    fn test_bodyless_statuses_and_head_requests() {
        let res = response("HTTP/1.1 204 No Content\r\n\r\n");
        assert_eq!(res.body_framing(&Method::GET).unwrap(), BodyFraming::None);

        let res = response("HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(res.body_framing(&Method::HEAD).unwrap(), BodyFraming::None);
    }

    #[test]
    fn test_conflicting_content_length_is_malformed() {
        let res = response("HTTP/1.1 200 OK\r\nContent-Length: 10\r\nContent-Length: 11\r\n\r\n");
        assert!(matches!(
            res.body_framing(&Method::GET),
            Err(HeadError::Malformed(_))
        ));
    }

    #[test]
    fn test_invalid_content_length_is_malformed() {
        let res = response("HTTP/1.1 200 OK\r\nContent-Length: ten\r\n\r\n");
        assert!(matches!(
            res.body_framing(&Method::GET),
            Err(HeadError::Malformed(_))
        ));
    }

    #[test]
    fn test_keep_alive_defaults_by_version() {
        let head = request("GET / HTTP/1.1\r\nHost: a.test\r\n\r\n");
        assert!(keep_alive(head.version, &head.headers));

        let head = request("GET / HTTP/1.0\r\n\r\n");
        assert!(!keep_alive(head.version, &head.headers));

        let head = request("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert!(keep_alive(head.version, &head.headers));

        let head = request("GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(!keep_alive(head.version, &head.headers));
    }

    #[test]
    fn test_stamp_forwarded_untrusted_overwrites_spoofed_chain() {
        let mut head = request(
            "GET / HTTP/1.1\r\nHost: a.test\r\nX-Forwarded-For: 9.9.9.9\r\nX-Real-IP: 9.9.9.9\r\n\r\n",
        );
        head.stamp_forwarded("10.1.2.3".parse().unwrap(), 8080, false);
        assert_eq!(head.header("x-forwarded-for"), Some("10.1.2.3"));
        assert_eq!(head.header("x-real-ip"), Some("10.1.2.3"));
        assert_eq!(head.header("x-client-ip"), Some("10.1.2.3"));
        assert_eq!(head.header("x-forwarded-proto"), Some("http"));
        assert_eq!(head.header("x-forwarded-port"), Some("8080"));
        assert_eq!(head.header("x-forwarded-host"), Some("a.test"));
    }

    #[test]
    fn test_stamp_forwarded_trusted_appends_to_chain() {
        let mut head = request(
            "GET / HTTP/1.1\r\nHost: a.test\r\nX-Forwarded-For: 9.9.9.9\r\nX-Forwarded-Proto: https\r\n\r\n",
        );
        head.stamp_forwarded("10.1.2.3".parse().unwrap(), 8080, true);
        assert_eq!(head.header("x-forwarded-for"), Some("9.9.9.9, 10.1.2.3"));
        assert_eq!(head.header("x-forwarded-proto"), Some("https"));
        assert_eq!(head.header("x-real-ip"), Some("10.1.2.3"));
    }

    #[test]
    fn test_via_appends_to_existing_chain() {
        let mut res = response("HTTP/1.1 200 OK\r\nVia: 1.0 fred\r\nServer: nginx\r\n\r\n");
        let token = res.header("server").map(str::to_string);
        res.stamp_via("127.0.0.1:8080", token.as_deref());
        assert_eq!(
            res.header("via"),
            Some("1.0 fred, 1.1 127.0.0.1:8080 (nginx)")
        );
    }

    #[test]
    fn test_sts_stamped_only_when_enabled() {
        let mut res = ResponseHead::synthetic(StatusCode::OK);
        res.stamp_sts(0);
        assert!(res.header("strict-transport-security").is_none());
        res.stamp_sts(31_536_000);
        assert_eq!(
            res.header("strict-transport-security"),
            Some("max-age=31536000")
        );
    }

    #[test]
    fn test_strip_length_hints_removes_all_four() {
        let mut res = response(
            "HTTP/1.1 206 Partial Content\r\nContent-Length: 4\r\nContent-Range: bytes 0-3/8\r\nAccept-Ranges: bytes\r\nTransfer-Encoding: identity\r\n\r\n",
        );
        res.strip_length_hints();
        assert!(res.header("content-length").is_none());
        assert!(res.header("content-range").is_none());
        assert!(res.header("accept-ranges").is_none());
        assert!(res.header("transfer-encoding").is_none());
    }

    #[test]
    fn test_request_encode_reparses_identically() {
        let head = request("GET /x?q=1 HTTP/1.1\r\nHost: a.test\r\nAccept: */*\r\n\r\n");
        let encoded = head.encode();
        let mut buf = BytesMut::from(&encoded[..]);
        let reparsed = RequestHead::parse(&mut buf).unwrap().expect("complete");
        assert_eq!(reparsed.method, head.method);
        assert_eq!(reparsed.target, head.target);
        assert_eq!(reparsed.headers, head.headers);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_synthetic_response_renders_canonical_reason() {
        let res = ResponseHead::synthetic(StatusCode::NOT_FOUND);
        let text = String::from_utf8(res.encode().to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_response_parse_keeps_custom_reason() {
        let res = response("HTTP/1.1 403 Denied By Policy\r\n\r\n");
        assert_eq!(res.reason.as_deref(), Some("Denied By Policy"));
        let text = String::from_utf8(res.encode().to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 403 Denied By Policy\r\n"));
    }
}
