use thiserror::Error;

use crate::http::framing::{self, Chunked};
use crate::http::request::{HeaderMap, HttpRequest, Method};
use crate::http::response::StatusCode;

pub const HTTP_VERSION: &str = "HTTP/1.1";
pub const DEFAULT_PORT: u16 = 80;

const URI_PUNCTUATION: &str = "-._~:/?#[]@!$&'()*+,;=%";
const TOKEN_PUNCTUATION: &str = "!#$%&'*+-.^_`|~";

/// A request the server refuses on protocol grounds. Every variant maps to
/// the status code reported to the client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("request line is empty")]
    EmptyStartLine,

    #[error("request line is malformed: {0:?}")]
    MalformedStartLine(String),

    #[error("method not implemented: {0:?}")]
    UnsupportedMethod(String),

    #[error("invalid request target: {0:?}")]
    InvalidUri(String),

    #[error("HTTP version not supported: {0:?}")]
    UnsupportedVersion(String),

    #[error("request head is not valid UTF-8")]
    MalformedHead,

    #[error("header line without colon: {0:?}")]
    MalformedHeader(String),

    #[error("invalid header name: {0:?}")]
    InvalidHeaderName(String),

    #[error("invalid characters in value of header {0:?}")]
    InvalidHeaderValue(String),

    #[error("empty value for header {0:?}")]
    EmptyHeaderValue(String),

    #[error("Host header is missing")]
    MissingHost,

    #[error("Host header appears more than once")]
    DuplicateHost,

    #[error("invalid Host header: {0:?}")]
    InvalidHost(String),

    #[error("{0} request must not carry a body")]
    BodyNotAllowed(Method),

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("Content-Length {declared} does not match body length {actual}")]
    ContentLengthMismatch { declared: usize, actual: usize },

    #[error("both Content-Length and Transfer-Encoding present")]
    ConflictingFraming,

    #[error("transfer coding not implemented: {0:?}")]
    UnsupportedTransferEncoding(String),

    #[error("malformed chunked body")]
    MalformedChunk,

    #[error("request head too large")]
    HeadTooLarge,

    #[error("request too large")]
    PayloadTooLarge,
}

impl ParseError {
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::UnsupportedMethod(_)
            | ParseError::UnsupportedVersion(_)
            | ParseError::UnsupportedTransferEncoding(_) => StatusCode::NOT_IMPLEMENTED,
            ParseError::HeadTooLarge => StatusCode::HEADER_FIELDS_TOO_LARGE,
            ParseError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Turns raw request bytes into a validated [`HttpRequest`].
///
/// Validation runs in three phases, start line, headers, body, and stops at
/// the first violation. The parser keeps no state between calls.
pub struct HttpParser;

impl HttpParser {
    pub fn parse(data: &[u8]) -> Result<HttpRequest, ParseError> {
        let (head, body) = match framing::find_head_end(data) {
            Some(end) => (&data[..end.head_len], &data[end.body_start.min(data.len())..]),
            None => (data, &data[data.len()..]),
        };
        let head = std::str::from_utf8(head).map_err(|_| ParseError::MalformedHead)?;
        let mut lines = head.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));

        let start_line = lines.next().unwrap_or("");
        let (method, uri, version) = Self::parse_start_line(start_line)?;

        let headers = Self::parse_headers(lines)?;
        let host = Self::check_headers(&headers)?;
        let body = Self::parse_body(method, &headers, body)?;

        let (host, port) = Self::split_host(&host)?;
        Ok(HttpRequest::new(
            method,
            uri.to_string(),
            version.to_string(),
            headers,
            body,
            host,
            port,
        ))
    }

    fn parse_start_line(line: &str) -> Result<(Method, &str, &str), ParseError> {
        if line.trim().is_empty() {
            return Err(ParseError::EmptyStartLine);
        }
        let parts: Vec<&str> = line.split_whitespace().collect();

        // The method is judged before the shape of the rest of the line.
        let method = Method::from_token(parts[0])
            .ok_or_else(|| ParseError::UnsupportedMethod(parts[0].to_string()))?;
        if parts.len() != 3 {
            return Err(ParseError::MalformedStartLine(line.to_string()));
        }

        let uri = parts[1];
        Self::check_uri(uri)?;

        let version = parts[2];
        if version != HTTP_VERSION {
            return Err(ParseError::UnsupportedVersion(version.to_string()));
        }
        Ok((method, uri, version))
    }

    fn check_uri(uri: &str) -> Result<(), ParseError> {
        if uri == "*" {
            return Ok(());
        }
        if !uri.starts_with('/') {
            return Err(ParseError::InvalidUri(uri.to_string()));
        }

        let bytes = uri.as_bytes();
        for (i, &b) in bytes.iter().enumerate() {
            if !b.is_ascii_alphanumeric() && !URI_PUNCTUATION.as_bytes().contains(&b) {
                return Err(ParseError::InvalidUri(uri.to_string()));
            }
            if b == b'%' {
                let escaped = bytes.get(i + 1..i + 3);
                if !escaped.is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit)) {
                    return Err(ParseError::InvalidUri(uri.to_string()));
                }
            }
        }
        Ok(())
    }

    fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<HeaderMap, ParseError> {
        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ParseError::MalformedHeader(line.to_string()))?;
            let value = value.trim_matches(|c| c == ' ' || c == '\t');

            if !is_token(name) {
                return Err(ParseError::InvalidHeaderName(name.to_string()));
            }
            if !is_field_value(value) {
                return Err(ParseError::InvalidHeaderValue(name.to_string()));
            }
            headers.append(name, value);
        }
        Ok(headers)
    }

    /// Checks cross-header rules and returns the single `Host` value.
    fn check_headers(headers: &HeaderMap) -> Result<String, ParseError> {
        for (name, values) in headers.iter() {
            if name.eq_ignore_ascii_case("Host") {
                continue;
            }
            if values.iter().any(String::is_empty) {
                return Err(ParseError::EmptyHeaderValue(name.to_string()));
            }
        }

        match headers.get_all("Host") {
            [] => Err(ParseError::MissingHost),
            [host] => Ok(host.clone()),
            _ => Err(ParseError::DuplicateHost),
        }
    }

    fn parse_body(method: Method, headers: &HeaderMap, raw: &[u8]) -> Result<Vec<u8>, ParseError> {
        if matches!(method, Method::Get | Method::Delete) && !raw.is_empty() {
            return Err(ParseError::BodyNotAllowed(method));
        }

        let codings = headers.get_all("Transfer-Encoding");
        if !codings.is_empty() {
            if headers.contains("Content-Length") {
                return Err(ParseError::ConflictingFraming);
            }
            let unsupported = codings
                .iter()
                .flat_map(|value| value.split(','))
                .map(str::trim)
                .find(|coding| !coding.eq_ignore_ascii_case("chunked"));
            if let Some(coding) = unsupported {
                return Err(ParseError::UnsupportedTransferEncoding(coding.to_string()));
            }
            return match framing::decode_chunked(raw)? {
                Chunked::Complete { body, consumed } if consumed == raw.len() => Ok(body),
                _ => Err(ParseError::MalformedChunk),
            };
        }

        let lengths = headers.get_all("Content-Length");
        if let Some(first) = lengths.first() {
            if lengths.iter().any(|value| value != first) {
                return Err(ParseError::InvalidContentLength(lengths.join(", ")));
            }
            let declared = framing::parse_content_length(first)?;
            if declared != raw.len() {
                return Err(ParseError::ContentLengthMismatch {
                    declared,
                    actual: raw.len(),
                });
            }
        }
        Ok(raw.to_vec())
    }

    /// Splits `host[:port]`, defaulting the port to 80.
    fn split_host(value: &str) -> Result<(String, u16), ParseError> {
        let value = value.trim();
        let (host, port) = match value.rsplit_once(':') {
            Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ParseError::InvalidHost(value.to_string()))?;
                (host, port)
            }
            _ => (value, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(ParseError::InvalidHost(value.to_string()));
        }
        Ok((host.to_string(), port))
    }
}

fn is_token(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || TOKEN_PUNCTUATION.as_bytes().contains(&b))
}

fn is_field_value(value: &str) -> bool {
    value
        .chars()
        .all(|c| c == '\t' || (c >= ' ' && c != '\u{7f}'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_get() {
        let req = HttpParser::parse(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.uri(), "/index.html");
        assert_eq!(req.host(), "example.com");
        assert_eq!(req.port(), 80);
        assert_eq!(req.target(), "example.com/index.html");
    }

    #[test]
    fn extra_start_line_tokens_are_bad_request() {
        let err = HttpParser::parse(b"GET / HTTP/1.1 extra\r\nHost: a\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::MalformedStartLine(_)));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = HttpParser::parse(b"BREW / HTTP/1.1 extra\r\nHost: a\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[test]
    fn value_is_trimmed_and_port_extracted() {
        let req = HttpParser::parse(b"GET / HTTP/1.1\r\nHost:   localhost:8080\r\n\r\n").unwrap();
        assert_eq!(req.host(), "localhost");
        assert_eq!(req.port(), 8080);
    }

    #[test]
    fn port_out_of_range_is_bad_request() {
        let err = HttpParser::parse(b"GET / HTTP/1.1\r\nHost: a:70000\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn empty_host_value_passes_header_check_but_not_normalization() {
        let err = HttpParser::parse(b"GET / HTTP/1.1\r\nHost:\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::InvalidHost(_)));
    }

    #[test]
    fn percent_needs_two_hex_digits() {
        assert!(HttpParser::check_uri("/a%20b").is_ok());
        assert!(HttpParser::check_uri("/a%2").is_err());
        assert!(HttpParser::check_uri("/a%zz").is_err());
        assert!(HttpParser::check_uri("*").is_ok());
        assert!(HttpParser::check_uri("index.html").is_err());
        assert!(HttpParser::check_uri("/a b").is_err());
        assert!(HttpParser::check_uri("/<script>").is_err());
    }

    #[test]
    fn chunked_body_is_decoded() {
        let req = HttpParser::parse(
            b"POST /up HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.body(), b"abc");
    }

    #[test]
    fn gzip_coding_is_not_implemented() {
        let err = HttpParser::parse(
            b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: gzip, chunked\r\n\r\n0\r\n\r\n",
        )
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[test]
    fn control_characters_in_values_are_rejected() {
        let err = HttpParser::parse(b"GET / HTTP/1.1\r\nHost: a\r\nX-Bad: a\x01b\r\n\r\n").unwrap_err();
        assert!(matches!(err, ParseError::InvalidHeaderValue(_)));
    }
}
