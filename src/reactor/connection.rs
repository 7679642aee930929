use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use crate::http::framing::RequestFramer;
use crate::http::{HttpResponse, ParseError};
use crate::router::PendingCgi;

const READ_CHUNK: usize = 4096;

#[derive(Debug)]
pub enum State {
    /// Accumulating request bytes.
    Reading,
    /// Waiting on a CGI child; the client socket is not polled.
    AwaitingCgi(PendingCgi),
    /// Sending a serialized response.
    Writing,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Data,
    WouldBlock,
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Done,
    Pending,
}

/// Per-client state owned by the reactor.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    pub state: State,
    buffer: Vec<u8>,
    framer: RequestFramer,
    write_buf: Vec<u8>,
    written: usize,
    close_after_write: bool,
    last_activity: Instant,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, max_request_bytes: usize) -> Connection {
        Connection {
            stream,
            peer,
            state: State::Reading,
            buffer: Vec::with_capacity(READ_CHUNK),
            framer: RequestFramer::new(max_request_bytes),
            write_buf: Vec::new(),
            written: 0,
            close_after_write: false,
            last_activity: Instant::now(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn close_after_write(&self) -> bool {
        self.close_after_write
    }

    /// One read into the request buffer.
    pub fn read_some(&mut self) -> io::Result<ReadOutcome> {
        let mut chunk = [0u8; READ_CHUNK];
        match self.stream.read(&mut chunk) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => {
                self.buffer.extend_from_slice(&chunk[..n]);
                self.last_activity = Instant::now();
                Ok(ReadOutcome::Data)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                Ok(ReadOutcome::WouldBlock)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether the buffer holds a whole request. Only bytes read since the
    /// last call are scanned.
    pub fn request_complete(&mut self) -> Result<bool, ParseError> {
        self.framer.is_complete(&self.buffer)
    }

    /// Hands over the buffered request and starts framing the next one.
    pub fn take_request(&mut self) -> Vec<u8> {
        self.framer.reset();
        std::mem::take(&mut self.buffer)
    }

    /// Queues `response` and switches to [`State::Writing`].
    pub fn respond(&mut self, response: &HttpResponse) {
        self.write_buf = response.to_bytes();
        self.written = 0;
        self.close_after_write = response.closes_connection();
        self.state = State::Writing;
        self.last_activity = Instant::now();
    }

    /// One write of the pending response. A zero-byte write is reported as
    /// an error so the caller closes the connection.
    pub fn write_some(&mut self) -> io::Result<WriteOutcome> {
        if self.written < self.write_buf.len() {
            match self.stream.write(&self.write_buf[self.written..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped reading")),
                Ok(n) => {
                    self.written += n;
                    self.last_activity = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {
                    return Ok(WriteOutcome::Pending);
                }
                Err(e) => return Err(e),
            }
        }
        if self.written < self.write_buf.len() {
            return Ok(WriteOutcome::Pending);
        }
        self.write_buf.clear();
        self.written = 0;
        self.state = State::Reading;
        Ok(WriteOutcome::Done)
    }
}
