//! CGI child processes whose output is collected without blocking the
//! reactor.
//!
//! The interpreter runs with a fixed minimal environment, its working
//! directory set to the script's directory and its stdout connected to a
//! non-blocking pipe. The reactor registers [`CgiProcess::pipe_fd`] for
//! read readiness, calls [`CgiProcess::read_output`] when it fires and
//! [`CgiProcess::try_finish`] until the child has been reaped. Dropping a
//! process that has not been reaped kills and reaps it.

use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::http::Method;

#[derive(Debug, Error)]
pub enum CgiError {
    #[error("failed to spawn {}: {source}", interpreter.display())]
    Spawn {
        interpreter: PathBuf,
        source: io::Error,
    },

    #[error("CGI pipe error: {0}")]
    Io(#[from] io::Error),

    #[error("CGI script exited with {0}")]
    Failed(ExitStatus),

    #[error("CGI script ran longer than {0:?}")]
    TimedOut(Duration),

    #[error("CGI output exceeded {0} bytes")]
    OutputTooLarge(usize),
}

/// What the child needs to know about the request.
#[derive(Debug, Clone, Copy)]
pub struct CgiRequest<'a> {
    pub interpreter: &'a Path,
    /// Absolute path of the script.
    pub script: &'a Path,
    pub method: Method,
    pub uri: &'a str,
    /// Output beyond this many bytes kills the child.
    pub max_output: usize,
}

#[derive(Debug)]
pub struct CgiProcess {
    child: Child,
    stdout: Option<ChildStdout>,
    output: Vec<u8>,
    max_output: usize,
    started: Instant,
    reaped: bool,
}

impl CgiProcess {
    pub fn spawn(request: &CgiRequest<'_>) -> Result<CgiProcess, CgiError> {
        let workdir = request.script.parent().unwrap_or_else(|| Path::new("/"));

        let mut child = Command::new(request.interpreter)
            .arg(request.script)
            .env_clear()
            .env("GATEWAY_INTERFACE", "CGI/1.1")
            .env("SERVER_PROTOCOL", "HTTP/1.1")
            .env("REQUEST_METHOD", request.method.as_str())
            .env("SCRIPT_FILENAME", request.script)
            .env("PATH_INFO", request.uri)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| CgiError::Spawn {
                interpreter: request.interpreter.to_path_buf(),
                source,
            })?;

        let stdout = child.stdout.take();
        let mut process = CgiProcess {
            child,
            stdout,
            output: Vec::new(),
            max_output: request.max_output,
            started: Instant::now(),
            reaped: false,
        };
        if let Some(fd) = process.pipe_fd() {
            if let Err(e) = set_nonblocking(fd) {
                process.kill();
                return Err(e.into());
            }
        }
        debug!(pid = process.child.id(), script = %request.script.display(), "CGI child started");
        Ok(process)
    }

    /// Read end of the stdout pipe, until EOF has been seen.
    pub fn pipe_fd(&self) -> Option<RawFd> {
        self.stdout.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Drains whatever the pipe holds. Returns `true` once EOF is reached,
    /// at which point the pipe is closed. A child writing more than its
    /// output limit is killed and reaped.
    pub fn read_output(&mut self) -> Result<bool, CgiError> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(true);
        };
        let mut buffer = [0u8; 4096];
        loop {
            match stdout.read(&mut buffer) {
                Ok(0) => {
                    self.stdout = None;
                    return Ok(true);
                }
                Ok(n) => {
                    if self.output.len() + n > self.max_output {
                        warn!(pid = self.child.id(), "CGI output over {} bytes, killing", self.max_output);
                        self.output = Vec::new();
                        self.kill();
                        return Err(CgiError::OutputTooLarge(self.max_output));
                    }
                    self.output.extend_from_slice(&buffer[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.stdout = None;
                    return Err(e.into());
                }
            }
        }
    }

    /// Reaps the child without blocking once its output is drained.
    /// `None` while the pipe is open or the child is still running.
    pub fn try_finish(&mut self) -> Option<Result<Vec<u8>, CgiError>> {
        if self.stdout.is_some() || self.reaped {
            return None;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.reaped = true;
                if status.success() {
                    Some(Ok(std::mem::take(&mut self.output)))
                } else {
                    Some(Err(CgiError::Failed(status)))
                }
            }
            Ok(None) => None,
            Err(e) => {
                self.kill();
                Some(Err(e.into()))
            }
        }
    }

    /// Kills the child if it is still running and reaps it.
    pub fn kill(&mut self) {
        self.stdout = None;
        if self.reaped {
            return;
        }
        if let Err(e) = self.child.kill() {
            debug!(pid = self.child.id(), "kill failed: {}", e);
        }
        if let Err(e) = self.child.wait() {
            warn!(pid = self.child.id(), "failed to reap CGI child: {}", e);
        }
        self.reaped = true;
    }
}

impl Drop for CgiProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
