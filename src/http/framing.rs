//! Request completeness detection over a connection's growing buffer.
//!
//! The reactor appends every read to the connection buffer and asks the
//! connection's [`RequestFramer`] whether a whole request has arrived before
//! handing the bytes to the parser. Completeness follows HTTP/1.1 message framing:
//! the blank line ending the head, then either `Transfer-Encoding: chunked`
//! framing or `Content-Length`. A request with neither ends at the head and
//! whatever else was read travels with it, so the parser sees it as body.

use crate::http::parser::ParseError;

/// Largest head (start line plus headers) accepted.
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Where the head stops and the body begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadEnd {
    /// Bytes of the start line and header lines, terminators included.
    pub head_len: usize,
    /// Offset of the first body byte, past the blank line.
    pub body_start: usize,
}

/// Finds the blank line closing the head. Accepts bare `\n` line endings.
pub fn find_head_end(buf: &[u8]) -> Option<HeadEnd> {
    find_head_end_from(buf, 0)
}

fn find_head_end_from(buf: &[u8], mut from: usize) -> Option<HeadEnd> {
    from = from.min(buf.len());
    while let Some(offset) = buf[from..].iter().position(|&b| b == b'\n') {
        let newline = from + offset;
        let rest = &buf[newline + 1..];
        if rest.starts_with(b"\r\n") {
            return Some(HeadEnd {
                head_len: newline + 1,
                body_start: newline + 3,
            });
        }
        if rest.starts_with(b"\n") {
            return Some(HeadEnd {
                head_len: newline + 1,
                body_start: newline + 2,
            });
        }
        from = newline + 1;
    }
    None
}

#[derive(Debug, PartialEq, Eq)]
pub enum Chunked {
    Incomplete,
    Complete { body: Vec<u8>, consumed: usize },
}

/// Decodes a chunked body, chunk extensions and trailers discarded.
pub fn decode_chunked(buf: &[u8]) -> Result<Chunked, ParseError> {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let Some((line, next)) = take_line(buf, pos) else {
            return Ok(Chunked::Incomplete);
        };
        let size = parse_chunk_size(line)?;
        pos = next;

        if size == 0 {
            // Trailer section runs until an empty line.
            loop {
                let Some((line, next)) = take_line(buf, pos) else {
                    return Ok(Chunked::Incomplete);
                };
                pos = next;
                if line.is_empty() {
                    return Ok(Chunked::Complete {
                        body,
                        consumed: pos,
                    });
                }
            }
        }

        let end = pos.checked_add(size).ok_or(ParseError::MalformedChunk)?;
        if end > buf.len() {
            return Ok(Chunked::Incomplete);
        }
        body.extend_from_slice(&buf[pos..end]);
        pos = end;

        match &buf[pos..] {
            [] | [b'\r'] => return Ok(Chunked::Incomplete),
            [b'\r', b'\n', ..] => pos += 2,
            [b'\n', ..] => pos += 1,
            _ => return Err(ParseError::MalformedChunk),
        }
    }
}

/// Longest chunk-size or trailer line accepted.
const MAX_CHUNK_LINE: usize = MAX_HEAD_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    /// No body framing headers: the request ends at the head.
    None,
    Length(usize),
    Chunked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
    Done,
}

/// Resumable chunk-framing scan. Bytes before `pos` are never looked at
/// again, and no decoded body is built.
#[derive(Debug, Clone, Copy)]
struct ChunkScanner {
    pos: usize,
    state: ChunkState,
}

impl Default for ChunkScanner {
    fn default() -> Self {
        ChunkScanner {
            pos: 0,
            state: ChunkState::Size,
        }
    }
}

impl ChunkScanner {
    /// Advances over `body`, which only ever grows between calls.
    fn advance(&mut self, body: &[u8]) -> Result<bool, ParseError> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some((line, next)) = take_line(body, self.pos) else {
                        return self.wait_for_line(body);
                    };
                    let size = parse_chunk_size(line)?;
                    self.pos = next;
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    let taken = remaining.min(body.len() - self.pos);
                    self.pos += taken;
                    if taken < remaining {
                        self.state = ChunkState::Data(remaining - taken);
                        return Ok(false);
                    }
                    self.state = ChunkState::DataEnd;
                }
                ChunkState::DataEnd => match &body[self.pos..] {
                    [] | [b'\r'] => return Ok(false),
                    [b'\r', b'\n', ..] => {
                        self.pos += 2;
                        self.state = ChunkState::Size;
                    }
                    [b'\n', ..] => {
                        self.pos += 1;
                        self.state = ChunkState::Size;
                    }
                    _ => return Err(ParseError::MalformedChunk),
                },
                ChunkState::Trailer => {
                    let Some((line, next)) = take_line(body, self.pos) else {
                        return self.wait_for_line(body);
                    };
                    self.pos = next;
                    if line.is_empty() {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(true),
            }
        }
    }

    fn wait_for_line(&self, body: &[u8]) -> Result<bool, ParseError> {
        if body.len() - self.pos > MAX_CHUNK_LINE {
            return Err(ParseError::MalformedChunk);
        }
        Ok(false)
    }
}

/// Per-connection completeness detector.
///
/// The head is located and its framing headers read once; after that each
/// call only looks at bytes that arrived since the previous one. Call
/// [`RequestFramer::reset`] when the buffer is handed off.
#[derive(Debug, Clone)]
pub struct RequestFramer {
    max_request_bytes: usize,
    /// Buffer length already searched for the end of the head.
    head_scanned: usize,
    head: Option<(HeadEnd, BodyFraming)>,
    chunks: ChunkScanner,
}

impl RequestFramer {
    pub fn new(max_request_bytes: usize) -> Self {
        RequestFramer {
            max_request_bytes,
            head_scanned: 0,
            head: None,
            chunks: ChunkScanner::default(),
        }
    }

    pub fn reset(&mut self) {
        *self = RequestFramer::new(self.max_request_bytes);
    }

    /// Whether `buf` holds a complete request. `buf` must be the same
    /// buffer as on earlier calls, with new bytes appended.
    ///
    /// Errors are protocol errors that can be reported before the parser
    /// runs: oversized heads or bodies, an unreadable `Content-Length`,
    /// broken chunk framing.
    pub fn is_complete(&mut self, buf: &[u8]) -> Result<bool, ParseError> {
        if buf.len() > self.max_request_bytes {
            return Err(ParseError::PayloadTooLarge);
        }
        let (head, framing) = match self.head {
            Some(found) => found,
            None => {
                // A terminator straddling the previous end starts at most
                // two bytes before it.
                let from = self.head_scanned.saturating_sub(2);
                self.head_scanned = buf.len();
                let Some(head) = find_head_end_from(buf, from) else {
                    if buf.len() > MAX_HEAD_BYTES {
                        return Err(ParseError::HeadTooLarge);
                    }
                    return Ok(false);
                };
                if head.head_len > MAX_HEAD_BYTES {
                    return Err(ParseError::HeadTooLarge);
                }
                let framing = body_framing(&buf[..head.head_len])?;
                if let BodyFraming::Length(length) = framing {
                    if head.body_start.saturating_add(length) > self.max_request_bytes {
                        return Err(ParseError::PayloadTooLarge);
                    }
                }
                self.head = Some((head, framing));
                (head, framing)
            }
        };

        let body = &buf[head.body_start.min(buf.len())..];
        match framing {
            BodyFraming::None => Ok(true),
            BodyFraming::Length(length) => Ok(body.len() >= length),
            BodyFraming::Chunked => self.chunks.advance(body),
        }
    }
}

/// One-shot check of a whole buffer.
pub fn request_complete(buf: &[u8], max_request_bytes: usize) -> Result<bool, ParseError> {
    RequestFramer::new(max_request_bytes).is_complete(buf)
}

fn body_framing(head: &[u8]) -> Result<BodyFraming, ParseError> {
    let head_text = String::from_utf8_lossy(head);
    let mut content_length = None;
    let mut chunked = false;
    for line in head_text.lines().skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("Content-Length") {
            content_length = Some(parse_content_length(value)?);
        } else if name.eq_ignore_ascii_case("Transfer-Encoding") {
            chunked = value
                .rsplit(',')
                .next()
                .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        }
    }
    Ok(match (chunked, content_length) {
        (true, _) => BodyFraming::Chunked,
        (false, Some(length)) => BodyFraming::Length(length),
        (false, None) => BodyFraming::None,
    })
}

/// Digits only: no sign, no whitespace inside the number.
pub fn parse_content_length(value: &str) -> Result<usize, ParseError> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidContentLength(value.to_string()));
    }
    value
        .parse()
        .map_err(|_| ParseError::InvalidContentLength(value.to_string()))
}

fn take_line(buf: &[u8], from: usize) -> Option<(&[u8], usize)> {
    let offset = buf.get(from..)?.iter().position(|&b| b == b'\n')?;
    let end = from + offset;
    let line = &buf[from..end];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some((line, end + 1))
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    let size = line.split(|&b| b == b';').next().unwrap_or(line);
    let size = std::str::from_utf8(size)
        .map_err(|_| ParseError::MalformedChunk)?
        .trim();
    if size.is_empty() {
        return Err(ParseError::MalformedChunk);
    }
    usize::from_str_radix(size, 16).map_err(|_| ParseError::MalformedChunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1 << 20;

    #[test]
    fn head_end_with_crlf_and_lf() {
        let end = find_head_end(b"GET / HTTP/1.1\r\nHost: a\r\n\r\nbody").unwrap();
        assert_eq!(end.head_len, 25);
        assert_eq!(end.body_start, 27);

        let end = find_head_end(b"GET / HTTP/1.1\nHost: a\n\nx").unwrap();
        assert_eq!(end.body_start, 24);

        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\nHost: a\r\n"), None);
    }

    #[test]
    fn incomplete_until_blank_line() {
        assert!(!request_complete(b"GET / HTTP/1.1\r\nHost", MAX).unwrap());
        assert!(request_complete(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n", MAX).unwrap());
    }

    #[test]
    fn waits_for_content_length_bytes() {
        let partial = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\nhello";
        assert!(!request_complete(partial, MAX).unwrap());

        let full = b"POST / HTTP/1.1\r\nHost: a\r\ncontent-length: 5\r\n\r\nhello";
        assert!(request_complete(full, MAX).unwrap());
    }

    #[test]
    fn rejects_bad_content_length() {
        let req = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: -3\r\n\r\n";
        assert!(matches!(
            request_complete(req, MAX),
            Err(ParseError::InvalidContentLength(_))
        ));
    }

    #[test]
    fn declared_length_over_limit_is_rejected_early() {
        let req = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 4096\r\n\r\n";
        assert!(matches!(request_complete(req, 1024), Err(ParseError::PayloadTooLarge)));
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut req = b"GET / HTTP/1.1\r\nX-Long: ".to_vec();
        req.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES + 1));
        assert!(matches!(request_complete(&req, MAX), Err(ParseError::HeadTooLarge)));
    }

    #[test]
    fn chunked_body_completes_at_last_chunk() {
        let head = b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();

        let mut partial = head.clone();
        partial.extend_from_slice(b"5\r\nhello\r\n");
        assert!(!request_complete(&partial, MAX).unwrap());

        let mut full = partial;
        full.extend_from_slice(b"0\r\n\r\n");
        assert!(request_complete(&full, MAX).unwrap());
    }

    #[test]
    fn decodes_chunks_with_extensions_and_trailers() {
        let decoded = decode_chunked(b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nExpires: never\r\n\r\n").unwrap();
        match decoded {
            Chunked::Complete { body, consumed } => {
                assert_eq!(body, b"Wikipedia");
                assert_eq!(consumed, 46);
            }
            Chunked::Incomplete => panic!("expected complete body"),
        }
    }

    #[test]
    fn malformed_chunk_size() {
        assert!(matches!(decode_chunked(b"zz\r\nabc\r\n"), Err(ParseError::MalformedChunk)));
        assert!(matches!(decode_chunked(b"3\r\nabcX\r\n"), Err(ParseError::MalformedChunk)));
    }

    fn chunked_request(payload_len: usize) -> Vec<u8> {
        let mut req = b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        let chunk = vec![b'x'; 1000];
        let mut left = payload_len;
        while left > 0 {
            let n = left.min(chunk.len());
            req.extend_from_slice(format!("{:x}\r\n", n).as_bytes());
            req.extend_from_slice(&chunk[..n]);
            req.extend_from_slice(b"\r\n");
            left -= n;
        }
        req.extend_from_slice(b"0\r\nTrailer: t\r\n\r\n");
        req
    }

    #[test]
    fn framer_completes_exactly_at_last_byte_for_any_split() {
        let req = chunked_request(2500);
        let mut framer = RequestFramer::new(MAX);
        for end in 1..req.len() {
            assert!(!framer.is_complete(&req[..end]).unwrap(), "complete early at {}", end);
        }
        assert!(framer.is_complete(&req).unwrap());

        let mut req = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\n\r\nbody".to_vec();
        framer.reset();
        for end in 1..req.len() {
            assert!(!framer.is_complete(&req[..end]).unwrap());
        }
        assert!(framer.is_complete(&req).unwrap());

        // Bare LF terminator split between two reads.
        req = b"GET / HTTP/1.1\nHost: a\n\n".to_vec();
        framer.reset();
        assert!(!framer.is_complete(&req[..req.len() - 1]).unwrap());
        assert!(framer.is_complete(&req).unwrap());
    }

    #[test]
    fn large_chunked_body_in_small_reads_is_linear() {
        let req = chunked_request(8 * 1024 * 1024);
        let mut framer = RequestFramer::new(16 * 1024 * 1024);
        let started = std::time::Instant::now();
        let mut end = 0;
        let mut complete = false;
        while end < req.len() {
            end = (end + 4096).min(req.len());
            complete = framer.is_complete(&req[..end]).unwrap();
            assert!(!complete || end == req.len());
        }
        assert!(complete);
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[test]
    fn overlong_chunk_size_line_is_rejected() {
        let mut req = b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        req.extend(std::iter::repeat(b'0').take(MAX_CHUNK_LINE + 1));
        let mut framer = RequestFramer::new(MAX);
        assert!(matches!(framer.is_complete(&req), Err(ParseError::MalformedChunk)));
    }
}
