use webserv::http::{HttpParser, Method, ParseError, StatusCode};

fn status_of(raw: &str) -> StatusCode {
    HttpParser::parse(raw.as_bytes()).unwrap_err().status()
}

#[test]
fn unknown_method_is_not_implemented_before_header_checks() {
    // No Host and a broken header line: the method still decides.
    let status = status_of("BREW /pot HTTP/1.1\r\nbroken header line\r\n\r\n");
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);

    let err = HttpParser::parse(b"TRACE / HTTP/1.1\r\n\r\n").unwrap_err();
    assert!(matches!(err, ParseError::UnsupportedMethod(ref m) if m == "TRACE"));
}

#[test]
fn other_versions_are_not_implemented() {
    assert_eq!(status_of("GET / HTTP/1.0\r\nHost: a\r\n\r\n"), StatusCode::NOT_IMPLEMENTED);
    assert_eq!(status_of("GET / HTTP/2\r\nHost: a\r\n\r\n"), StatusCode::NOT_IMPLEMENTED);
}

#[test]
fn host_must_appear_exactly_once() {
    assert_eq!(status_of("GET / HTTP/1.1\r\nAccept: */*\r\n\r\n"), StatusCode::BAD_REQUEST);
    assert_eq!(
        status_of("GET / HTTP/1.1\r\nHost: a\r\nhost: b\r\n\r\n"),
        StatusCode::BAD_REQUEST
    );
    assert!(HttpParser::parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").is_ok());
}

#[test]
fn get_and_delete_reject_bodies() {
    for method in ["GET", "DELETE"] {
        let raw = format!("{} /f HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\n\r\nabc", method);
        assert_eq!(status_of(&raw), StatusCode::BAD_REQUEST, "{}", method);
    }
    let raw = "POST /f HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\n\r\nabc";
    assert_eq!(HttpParser::parse(raw.as_bytes()).unwrap().body(), b"abc");
}

#[test]
fn content_length_must_match_body() {
    let short = "POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nabc";
    assert!(matches!(
        HttpParser::parse(short.as_bytes()),
        Err(ParseError::ContentLengthMismatch { declared: 5, actual: 3 })
    ));

    let exact = "POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nabcde";
    let request = HttpParser::parse(exact.as_bytes()).unwrap();
    assert_eq!(request.content_length(), Some(5));
    assert_eq!(request.method(), Method::Post);
}

#[test]
fn uri_rules() {
    assert_eq!(status_of("GET index.html HTTP/1.1\r\nHost: a\r\n\r\n"), StatusCode::BAD_REQUEST);
    assert_eq!(status_of("GET /a%2 HTTP/1.1\r\nHost: a\r\n\r\n"), StatusCode::BAD_REQUEST);
    assert_eq!(status_of("GET /a\"b HTTP/1.1\r\nHost: a\r\n\r\n"), StatusCode::BAD_REQUEST);
    assert!(HttpParser::parse(b"GET /a%20b?x=1&y=[2] HTTP/1.1\r\nHost: a\r\n\r\n").is_ok());
}

#[test]
fn normalizes_host_port_and_target() {
    let request = HttpParser::parse(b"GET /docs/?page=2 HTTP/1.1\r\nHost: Example.com:8080\r\n\r\n").unwrap();
    assert_eq!(request.host(), "Example.com");
    assert_eq!(request.port(), 8080);
    assert_eq!(request.target(), "Example.com/docs/?page=2");
    assert_eq!(request.path(), "/docs/");
    assert_eq!(request.query(), Some("page=2"));

    let request = HttpParser::parse(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
    assert_eq!(request.port(), 80);
}

#[test]
fn chunked_body_is_decoded() {
    let raw = b"POST /up HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n";
    assert_eq!(HttpParser::parse(raw).unwrap().body(), b"abcde");

    let gzip = b"POST /up HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: gzip\r\n\r\n";
    assert_eq!(HttpParser::parse(gzip).unwrap_err().status(), StatusCode::NOT_IMPLEMENTED);

    let both = b"POST /up HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\nContent-Length: 3\r\n\r\n0\r\n\r\n";
    assert_eq!(HttpParser::parse(both).unwrap_err().status(), StatusCode::BAD_REQUEST);
}

#[test]
fn header_values_must_be_present_except_host() {
    assert_eq!(status_of("GET / HTTP/1.1\r\nHost: a\r\nAccept:\r\n\r\n"), StatusCode::BAD_REQUEST);
    assert_eq!(status_of("GET / HTTP/1.1\r\nHost: a\r\nBad Name: x\r\n\r\n"), StatusCode::BAD_REQUEST);
    assert_eq!(status_of("GET / HTTP/1.1\r\nHost: a\r\nNoColon\r\n\r\n"), StatusCode::BAD_REQUEST);
}
