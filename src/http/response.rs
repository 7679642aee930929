use chrono::Utc;
use std::fmt;

pub const SERVER_NAME: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const MOVED_PERMANENTLY: StatusCode = StatusCode(301);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const METHOD_NOT_ALLOWED: StatusCode = StatusCode(405);
    pub const PAYLOAD_TOO_LARGE: StatusCode = StatusCode(413);
    pub const HEADER_FIELDS_TOO_LARGE: StatusCode = StatusCode(431);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);
    pub const BAD_GATEWAY: StatusCode = StatusCode(502);
    pub const GATEWAY_TIMEOUT: StatusCode = StatusCode(504);

    /// Any three-digit code is representable; unknown ones fall back to the
    /// 500 reason phrase when serialized.
    pub fn from_u16(code: u16) -> Option<StatusCode> {
        (100..=599).contains(&code).then_some(StatusCode(code))
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn is_redirection(&self) -> bool {
        (300..400).contains(&self.0)
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            411 => "Length Required",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            415 => "Unsupported Media Type",
            431 => "Request Header Fields Too Large",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            _ => "Internal Server Error",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason_phrase())
    }
}

/// Response under construction. Headers serialize in insertion order.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpResponse {
    /// Starts a response carrying the `Server` and `Date` headers every
    /// response gets.
    pub fn new(status: StatusCode) -> Self {
        HttpResponse {
            status,
            headers: vec![
                ("Server".to_string(), SERVER_NAME.to_string()),
                ("Date".to_string(), http_date()),
            ],
            body: Vec::new(),
        }
    }

    /// Sets `name`, replacing an earlier value in place.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
        self
    }

    /// Sets the body and its `Content-Length`.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        let length = self.body.len().to_string();
        self.header("Content-Length", length)
    }

    pub fn keep_alive(self, keep_alive: bool) -> Self {
        self.header("Connection", if keep_alive { "keep-alive" } else { "close" })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    pub fn closes_connection(&self) -> bool {
        self.get_header("Connection")
            .is_some_and(|value| value.eq_ignore_ascii_case("close"))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status.as_u16(),
            self.status.reason_phrase()
        );
        for (key, value) in &self.headers {
            response.push_str(&format!("{}: {}\r\n", key, value));
        }
        response.push_str("\r\n");

        let mut bytes = response.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

pub fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Built-in pages used when no custom error page is configured.
pub struct ErrorPages;

impl ErrorPages {
    pub fn default_page(status: StatusCode) -> String {
        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>{code} {reason}</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, "Helvetica Neue", Arial, sans-serif;
            margin: 0;
            padding: 0;
            height: 100vh;
            display: flex;
            justify-content: center;
            align-items: center;
        }}
        h1 {{
            color: #e74c3c;
            font-size: 72px;
            margin: 0;
        }}
        p {{
            color: #666;
            font-size: 18px;
        }}
    </style>
</head>
<body>
    <div>
        <h1>{code}</h1>
        <p>{reason}</p>
    </div>
</body>
</html>
"#,
            code = status.as_u16(),
            reason = status.reason_phrase()
        )
    }

    /// Complete response built from the default page.
    pub fn response(status: StatusCode, keep_alive: bool) -> HttpResponse {
        HttpResponse::new(status)
            .header("Content-Type", "text/html; charset=UTF-8")
            .body(Self::default_page(status))
            .keep_alive(keep_alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_status_line_and_headers_in_order() {
        let response = HttpResponse::new(StatusCode::OK)
            .header("Content-Type", "text/plain")
            .body("hi")
            .keep_alive(true);
        let text = String::from_utf8(response.to_bytes()).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\nServer: "));
        let type_at = text.find("Content-Type: text/plain").unwrap();
        let length_at = text.find("Content-Length: 2").unwrap();
        let connection_at = text.find("Connection: keep-alive").unwrap();
        assert!(type_at < length_at && length_at < connection_at);
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn header_replaces_existing_value() {
        let response = HttpResponse::new(StatusCode::OK)
            .keep_alive(true)
            .keep_alive(false);
        assert_eq!(response.get_header("connection"), Some("close"));
        assert!(response.closes_connection());
        assert_eq!(response.headers().filter(|(k, _)| *k == "Connection").count(), 1);
    }

    #[test]
    fn unknown_codes_use_internal_error_reason() {
        assert_eq!(StatusCode::from_u16(299).unwrap().reason_phrase(), "Internal Server Error");
        assert_eq!(StatusCode::from_u16(42), None);
        assert_eq!(StatusCode::PAYLOAD_TOO_LARGE.to_string(), "413 Payload Too Large");
    }

    #[test]
    fn default_error_page_has_length() {
        let response = ErrorPages::response(StatusCode::NOT_FOUND, false);
        let page = ErrorPages::default_page(StatusCode::NOT_FOUND);
        assert_eq!(response.body_bytes(), page.as_bytes());
        assert_eq!(response.get_header("Content-Length"), Some(page.len().to_string().as_str()));
        assert!(page.contains("404 Not Found"));
    }
}
