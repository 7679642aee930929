//! Single-threaded readiness loop over every listening socket, client
//! socket and CGI output pipe.

mod connection;
mod poller;

use std::collections::HashMap;
use std::io;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::ServerError;
use crate::http::{ErrorPages, HttpParser, HttpResponse};
use crate::router::cgi::CgiError;
use crate::router::{Dispatch, PendingCgi, Router};
use crate::vhost::ListenEndpoint;
use connection::{Connection, ReadOutcome, State, WriteOutcome};
use poller::{Poller, ERROR, HANGUP, READABLE, WRITABLE};

/// Poll bound while a CGI child has closed its output but is not reaped.
const REAP_POLL_MS: i32 = 10;

/// A listening socket bound to one endpoint. `listener` is `None` only
/// while a restart is pending.
struct ListenerSlot {
    endpoint: ListenEndpoint,
    listener: Option<TcpListener>,
}

pub struct Reactor {
    poller: Poller,
    listeners: Vec<ListenerSlot>,
    connections: HashMap<RawFd, Connection>,
    /// CGI pipe fd to the client fd waiting on it.
    cgi_pipes: HashMap<RawFd, RawFd>,
    router: Router,
    engine: EngineConfig,
}

impl Reactor {
    /// Binds every distinct endpoint of the router's virtual hosts. Any
    /// bind failure is fatal.
    pub fn new(engine: EngineConfig, router: Router) -> Result<Reactor, ServerError> {
        let poller = Poller::new().map_err(ServerError::Poll)?;
        let mut listeners = Vec::new();
        for endpoint in router.hosts().endpoints() {
            let listener = bind(endpoint).map_err(|source| ServerError::Bind { endpoint, source })?;
            poller.add(listener.as_raw_fd(), READABLE)?;
            info!("Listening on http://{}/", endpoint);
            listeners.push(ListenerSlot {
                endpoint,
                listener: Some(listener),
            });
        }

        Ok(Reactor {
            poller,
            listeners,
            connections: HashMap::new(),
            cgi_pipes: HashMap::new(),
            router,
            engine,
        })
    }

    /// Serves until `shutdown` is set. Open connections are dropped on
    /// return, which closes them and kills any CGI children.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), ServerError> {
        let mut events = poller::empty_events(self.engine.max_events);

        while !shutdown.load(Ordering::SeqCst) {
            self.restore_listeners();

            let timeout = if self.awaiting_reap() {
                REAP_POLL_MS.min(self.engine.poll_timeout_ms)
            } else {
                self.engine.poll_timeout_ms
            };
            let n = self.poller.wait(&mut events, timeout).map_err(ServerError::Poll)?;

            let mut ready: Vec<(RawFd, u32)> = events[..n]
                .iter()
                .map(|event| (event.u64 as RawFd, event.events))
                .collect();
            ready.sort_unstable_by_key(|&(fd, _)| fd);

            for (fd, flags) in ready {
                self.handle_event(fd, flags);
            }
            self.sweep();
        }

        info!("Shutting down, closing {} connection(s)", self.connections.len());
        Ok(())
    }

    fn handle_event(&mut self, fd: RawFd, flags: u32) {
        if let Some(slot) = self.listener_slot(fd) {
            if flags & (ERROR | HANGUP) != 0 {
                self.restart_listener(slot);
            } else if flags & READABLE != 0 {
                self.accept_connections(slot);
            }
            return;
        }

        if self.cgi_pipes.contains_key(&fd) {
            // Hangup on a pipe means the child closed it: read to EOF.
            self.on_cgi_readable(fd);
            return;
        }

        if !self.connections.contains_key(&fd) {
            debug!(fd, "event for unknown descriptor");
            if let Err(e) = self.poller.delete(fd) {
                debug!(fd, "Failed to unwatch unknown descriptor: {}", e);
            }
            return;
        }
        if flags & (ERROR | HANGUP) != 0 {
            debug!(fd, "client error or hangup");
            self.close_connection(fd);
        } else if flags & READABLE != 0 {
            self.on_readable(fd);
        } else if flags & WRITABLE != 0 {
            self.on_writable(fd);
        }
    }

    fn listener_slot(&self, fd: RawFd) -> Option<usize> {
        self.listeners.iter().position(|slot| {
            slot.listener
                .as_ref()
                .is_some_and(|listener| listener.as_raw_fd() == fd)
        })
    }

    fn accept_connections(&mut self, slot: usize) {
        let Some(listener) = self.listeners[slot].listener.as_ref() else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("Failed to set {} non-blocking: {}", peer, e);
                        continue;
                    }
                    let connection = Connection::new(stream, peer, self.engine.max_request_bytes);
                    let fd = connection.fd();
                    if let Err(e) = self.poller.add(fd, READABLE) {
                        error!("Failed to watch connection from {}: {}", peer, e);
                        continue;
                    }
                    debug!(fd, "New connection from: {}", peer);
                    self.connections.insert(fd, connection);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    break;
                }
            }
        }
    }

    /// Closes and rebinds the listener in `slot`. A failed rebind leaves
    /// the slot empty for [`Reactor::restore_listeners`].
    fn restart_listener(&mut self, slot: usize) {
        let endpoint = self.listeners[slot].endpoint;
        if let Some(listener) = self.listeners[slot].listener.take() {
            if let Err(e) = self.poller.delete(listener.as_raw_fd()) {
                debug!("Failed to unwatch listener on {}: {}", endpoint, e);
            }
        }
        warn!("Restarting listener on {}", endpoint);
        self.listeners[slot].listener = self.rebind(endpoint);
    }

    fn restore_listeners(&mut self) {
        for slot in 0..self.listeners.len() {
            if self.listeners[slot].listener.is_none() {
                let endpoint = self.listeners[slot].endpoint;
                self.listeners[slot].listener = self.rebind(endpoint);
            }
        }
    }

    fn rebind(&self, endpoint: ListenEndpoint) -> Option<TcpListener> {
        let listener = match bind(endpoint) {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to rebind {}: {}", endpoint, e);
                return None;
            }
        };
        match self.poller.add(listener.as_raw_fd(), READABLE) {
            Ok(()) => Some(listener),
            Err(e) => {
                error!("Failed to watch listener on {}: {}", endpoint, e);
                None
            }
        }
    }

    fn on_readable(&mut self, fd: RawFd) {
        let Some(connection) = self.connections.get_mut(&fd) else {
            return;
        };
        if !matches!(connection.state, State::Reading) {
            return;
        }
        match connection.read_some() {
            Ok(ReadOutcome::Data) => self.process_buffer(fd),
            Ok(ReadOutcome::WouldBlock) => {}
            Ok(ReadOutcome::Closed) => {
                debug!(fd, "Connection closed by client");
                self.close_connection(fd);
            }
            Err(e) => {
                warn!(fd, "Error reading from client: {}", e);
                self.close_connection(fd);
            }
        }
    }

    /// Hands a complete buffered request to the parser and the router.
    fn process_buffer(&mut self, fd: RawFd) {
        let Some(connection) = self.connections.get_mut(&fd) else {
            return;
        };
        match connection.request_complete() {
            Ok(false) => return,
            Ok(true) => {}
            Err(e) => {
                info!("{} -> rejected before parsing: {}", connection.peer(), e);
                connection.take_request();
                self.queue_response(fd, ErrorPages::response(e.status(), false));
                return;
            }
        }

        let data = connection.take_request();
        let dispatch = match HttpParser::parse(&data) {
            Ok(request) => {
                info!("{} {} {}", request.method(), request.target(), request.version());
                self.router.dispatch(&request)
            }
            Err(e) => {
                info!("Bad request: {}", e);
                Dispatch::Respond(ErrorPages::response(e.status(), false))
            }
        };

        match dispatch {
            Dispatch::Respond(response) => self.queue_response(fd, response),
            Dispatch::Cgi(pending) => self.await_cgi(fd, pending),
        }
    }

    fn queue_response(&mut self, fd: RawFd, response: HttpResponse) {
        let Some(connection) = self.connections.get_mut(&fd) else {
            return;
        };
        info!("{} <- {}", connection.peer(), response.status());
        connection.respond(&response);
        if let Err(e) = self.poller.modify(fd, WRITABLE) {
            error!(fd, "Failed to switch connection to write: {}", e);
            self.close_connection(fd);
        }
    }

    fn on_writable(&mut self, fd: RawFd) {
        let Some(connection) = self.connections.get_mut(&fd) else {
            return;
        };
        if !matches!(connection.state, State::Writing) {
            return;
        }
        match connection.write_some() {
            Ok(WriteOutcome::Pending) => {}
            Ok(WriteOutcome::Done) => {
                if connection.close_after_write() {
                    self.close_connection(fd);
                } else if let Err(e) = self.poller.modify(fd, READABLE) {
                    error!(fd, "Failed to switch connection to read: {}", e);
                    self.close_connection(fd);
                }
            }
            Err(e) => {
                warn!(fd, "Error writing to client: {}", e);
                self.close_connection(fd);
            }
        }
    }

    /// Parks the connection until the CGI child is done. The client socket
    /// stays registered with an empty interest set so a hangup still
    /// reaches us.
    fn await_cgi(&mut self, fd: RawFd, pending: PendingCgi) {
        if let Some(pipe) = pending.process.pipe_fd() {
            if let Err(e) = self.poller.add(pipe, READABLE) {
                error!(fd, "Failed to watch CGI output: {}", e);
                let response = self.router.finish_cgi(pending, Err(CgiError::Io(e)));
                self.queue_response(fd, response);
                return;
            }
            self.cgi_pipes.insert(pipe, fd);
        }
        if let Err(e) = self.poller.modify(fd, 0) {
            error!(fd, "Failed to park connection: {}", e);
        }
        if let Some(connection) = self.connections.get_mut(&fd) {
            connection.state = State::AwaitingCgi(pending);
        }
    }

    fn on_cgi_readable(&mut self, pipe: RawFd) {
        let Some(&fd) = self.cgi_pipes.get(&pipe) else {
            return;
        };
        let outcome = match self.connections.get_mut(&fd).map(|c| &mut c.state) {
            Some(State::AwaitingCgi(pending)) => Some(pending.process.read_output()),
            _ => None,
        };
        let Some(outcome) = outcome else {
            self.forget_pipe(pipe);
            return;
        };
        match outcome {
            Ok(false) => {}
            Ok(true) => {
                // EOF closed the pipe, which also dropped its registration.
                self.cgi_pipes.remove(&pipe);
                self.poll_cgi(fd);
            }
            Err(e) => {
                self.cgi_pipes.remove(&pipe);
                self.finish_cgi(fd, Err(e));
            }
        }
    }

    /// Responds if the CGI child of `fd` has been reaped or ran too long.
    fn poll_cgi(&mut self, fd: RawFd) {
        let limit = Duration::from_secs(self.engine.cgi_timeout_secs);
        let Some(State::AwaitingCgi(pending)) = self.connections.get_mut(&fd).map(|c| &mut c.state) else {
            return;
        };
        let result = match pending.process.try_finish() {
            Some(result) => result,
            None if pending.process.elapsed() > limit => {
                warn!(pid = pending.process.pid(), "CGI script timed out after {:?}", limit);
                Err(CgiError::TimedOut(limit))
            }
            None => return,
        };
        self.finish_cgi(fd, result);
    }

    fn finish_cgi(&mut self, fd: RawFd, result: Result<Vec<u8>, CgiError>) {
        let Some(connection) = self.connections.get_mut(&fd) else {
            return;
        };
        let State::AwaitingCgi(pending) = std::mem::replace(&mut connection.state, State::Reading) else {
            return;
        };
        if let Some(pipe) = pending.process.pipe_fd() {
            self.forget_pipe(pipe);
        }
        let response = self.router.finish_cgi(pending, result);
        self.queue_response(fd, response);
    }

    fn forget_pipe(&mut self, pipe: RawFd) {
        self.cgi_pipes.remove(&pipe);
        if let Err(e) = self.poller.delete(pipe) {
            debug!(pipe, "Failed to unwatch CGI pipe: {}", e);
        }
    }

    fn awaiting_reap(&self) -> bool {
        self.connections.values().any(|connection| {
            matches!(&connection.state, State::AwaitingCgi(pending) if pending.process.pipe_fd().is_none())
        })
    }

    /// Per-iteration housekeeping: finished or overdue CGI children, and
    /// idle clients.
    fn sweep(&mut self) {
        let idle_limit = Duration::from_secs(self.engine.client_timeout_secs);
        let mut awaiting = Vec::new();
        let mut idle = Vec::new();
        for (&fd, connection) in &self.connections {
            match connection.state {
                State::AwaitingCgi(_) => awaiting.push(fd),
                _ if connection.idle_for() > idle_limit => idle.push(fd),
                _ => {}
            }
        }

        for fd in awaiting {
            self.poll_cgi(fd);
        }
        for fd in idle {
            info!(fd, "Closing idle connection");
            self.close_connection(fd);
        }
    }

    /// Unregisters and closes a client, killing its CGI child if any.
    fn close_connection(&mut self, fd: RawFd) {
        let Some(connection) = self.connections.remove(&fd) else {
            return;
        };
        if let State::AwaitingCgi(pending) = &connection.state {
            if let Some(pipe) = pending.process.pipe_fd() {
                self.forget_pipe(pipe);
            }
        }
        if let Err(e) = self.poller.delete(fd) {
            debug!(fd, "Failed to unwatch connection: {}", e);
        }
        debug!(fd, "Closed connection from {}", connection.peer());
    }
}

fn bind(endpoint: ListenEndpoint) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(endpoint.socket_addr())?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}
