//! Request routing and response generation.
//!
//! [`Router::dispatch`] picks the virtual host for the request's
//! `(host, port)`, the longest matching location inside it, applies the
//! location's directives and produces the response: a static file, a
//! directory listing, a redirect, a deletion, or a CGI child whose output
//! becomes the response once the reactor has collected it.

pub mod autoindex;
pub mod cgi;

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::http::{ErrorPages, HttpRequest, HttpResponse, Method, StatusCode};
use crate::vhost::{Location, ServerInstance, VirtualHostTable};
use cgi::{CgiError, CgiProcess, CgiRequest};

const DELETED_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head><title>200 OK</title></head>\n<body><h1>File deleted.</h1></body>\n</html>\n";
const POST_RECEIVED_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head><title>200 OK</title></head>\n<body><h1>Request received.</h1></body>\n</html>\n";
const HTML: &str = "text/html; charset=UTF-8";
const DEFAULT_CGI_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

/// Result of routing one request.
#[derive(Debug)]
pub enum Dispatch {
    Respond(HttpResponse),
    /// The response depends on a CGI child still running.
    Cgi(PendingCgi),
}

/// A CGI child together with what is needed to answer once it is done.
#[derive(Debug)]
pub struct PendingCgi {
    pub process: CgiProcess,
    keep_alive: bool,
    server: usize,
    root: PathBuf,
}

/// Location-level resolution shared by every implemented method.
struct Resolved<'a> {
    location: &'a Location,
    root: &'a Path,
    /// Percent-decoded request path.
    path: String,
    filepath: PathBuf,
}

pub struct Router {
    hosts: VirtualHostTable,
    cgi_output_limit: usize,
}

impl Router {
    pub fn new(hosts: VirtualHostTable) -> Self {
        Router {
            hosts,
            cgi_output_limit: DEFAULT_CGI_OUTPUT_BYTES,
        }
    }

    /// Caps the output collected from one CGI child.
    pub fn with_cgi_output_limit(mut self, bytes: usize) -> Self {
        self.cgi_output_limit = bytes;
        self
    }

    pub fn hosts(&self) -> &VirtualHostTable {
        &self.hosts
    }

    pub fn dispatch(&self, request: &HttpRequest) -> Dispatch {
        let Some(server) = self.hosts.find(request.host(), request.port()) else {
            debug!(host = request.host(), port = request.port(), "no virtual host");
            return Dispatch::Respond(ErrorPages::response(StatusCode::NOT_FOUND, false));
        };

        match request.method() {
            Method::Get => {
                debug!("Handling GET");
                self.handle_get(request, server)
            }
            Method::Post => {
                debug!("Handling POST");
                Dispatch::Respond(self.handle_post(request, server))
            }
            Method::Delete => {
                debug!("Handling DELETE");
                Dispatch::Respond(self.handle_delete(request, server))
            }
            other => {
                debug!(method = %other, "method not implemented");
                Dispatch::Respond(ErrorPages::response(StatusCode::NOT_IMPLEMENTED, false))
            }
        }
    }

    /// Builds the response for a CGI child that has finished.
    pub fn finish_cgi(&self, pending: PendingCgi, result: Result<Vec<u8>, CgiError>) -> HttpResponse {
        match result {
            Ok(output) => HttpResponse::new(StatusCode::OK)
                .header("Content-Type", HTML)
                .body(output)
                .keep_alive(pending.keep_alive),
            Err(e) => {
                error!(pid = pending.process.pid(), "CGI script execution failed: {}", e);
                let status = match e {
                    CgiError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
                    CgiError::OutputTooLarge(_) => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                match self.hosts.servers().get(pending.server) {
                    Some(server) => self.error_response(server, &pending.root, status, pending.keep_alive),
                    None => ErrorPages::response(status, pending.keep_alive),
                }
            }
        }
    }

    fn handle_get(&self, request: &HttpRequest, server: &ServerInstance) -> Dispatch {
        let keep_alive = request.keep_alive();
        let resolved = match self.resolve(request, server) {
            Ok(resolved) => resolved,
            Err(response) => return Dispatch::Respond(response),
        };

        if let Some(interpreter) = resolved.location.cgi_interpreter(&resolved.path) {
            return self.start_cgi(request, server, &resolved, interpreter);
        }

        let mut filepath = resolved.filepath.clone();
        if filepath.is_dir() {
            if resolved.location.autoindex() {
                debug!(dir = %filepath.display(), "Handling auto index");
                return Dispatch::Respond(match autoindex::render(&filepath, &resolved.path) {
                    Ok(page) => HttpResponse::new(StatusCode::OK)
                        .header("Content-Type", HTML)
                        .body(page)
                        .keep_alive(keep_alive),
                    Err(e) => {
                        error!(dir = %filepath.display(), "Failed to open directory: {}", e);
                        self.error_response(server, resolved.root, StatusCode::NOT_FOUND, keep_alive)
                    }
                });
            }
            filepath = find_index_file(&filepath, server.index_for(resolved.location));
        }

        Dispatch::Respond(self.file_response(server, resolved.root, &filepath, keep_alive))
    }

    /// Acknowledges the upload without storing it.
    fn handle_post(&self, request: &HttpRequest, server: &ServerInstance) -> HttpResponse {
        match self.resolve(request, server) {
            Ok(_) => HttpResponse::new(StatusCode::OK)
                .header("Content-Type", HTML)
                .body(POST_RECEIVED_PAGE)
                .keep_alive(request.keep_alive()),
            Err(response) => response,
        }
    }

    fn handle_delete(&self, request: &HttpRequest, server: &ServerInstance) -> HttpResponse {
        let keep_alive = request.keep_alive();
        let resolved = match self.resolve(request, server) {
            Ok(resolved) => resolved,
            Err(response) => return response,
        };

        match fs::remove_file(&resolved.filepath) {
            Ok(()) => {
                info!("DELETE {} -> 200 OK", request.uri());
                HttpResponse::new(StatusCode::OK)
                    .header("Content-Type", HTML)
                    .body(DELETED_PAGE)
                    .keep_alive(keep_alive)
            }
            Err(e) => {
                info!("DELETE {} -> 404 Not Found ({})", request.uri(), e);
                self.error_response(server, resolved.root, StatusCode::NOT_FOUND, keep_alive)
            }
        }
    }

    /// Location lookup and directive checks, in order: redirect, allowed
    /// methods, body size. A redirect wins over every later check.
    fn resolve<'a>(
        &self,
        request: &HttpRequest,
        server: &'a ServerInstance,
    ) -> Result<Resolved<'a>, HttpResponse> {
        let keep_alive = request.keep_alive();
        let Some(location) = server.match_location(request.path()) else {
            debug!(path = request.path(), "no matching location");
            return Err(self.error_response(server, server.root(), StatusCode::NOT_FOUND, keep_alive));
        };

        if let Some(redirect) = location.redirect() {
            debug!("Handling return directive: [{}] To: {}", redirect.status, redirect.location);
            return Err(HttpResponse::new(redirect.status)
                .header("Location", redirect.location.as_str())
                .header("Content-Type", HTML)
                .body(Vec::new())
                .keep_alive(keep_alive));
        }

        let root = server.root_for(location);
        if !location.allows(request.method()) {
            return Err(self.error_response(server, root, StatusCode::METHOD_NOT_ALLOWED, keep_alive));
        }
        if request.body().len() > server.body_limit_for(location) {
            return Err(self.error_response(server, root, StatusCode::PAYLOAD_TOO_LARGE, keep_alive));
        }

        let path = match urlencoding::decode(request.path()) {
            Ok(path) if !path.contains('\0') => path.into_owned(),
            _ => return Err(ErrorPages::response(StatusCode::BAD_REQUEST, false)),
        };
        if path.split('/').any(|segment| segment == "..") {
            warn!(path = %path, "path traversal rejected");
            return Err(self.error_response(server, root, StatusCode::FORBIDDEN, keep_alive));
        }

        let filepath = root.join(path.trim_start_matches('/'));
        Ok(Resolved {
            location,
            root,
            path,
            filepath,
        })
    }

    fn start_cgi(
        &self,
        request: &HttpRequest,
        server: &ServerInstance,
        resolved: &Resolved<'_>,
        interpreter: &Path,
    ) -> Dispatch {
        let keep_alive = request.keep_alive();
        let script = match fs::canonicalize(&resolved.filepath) {
            Ok(script) if script.is_file() => script,
            _ => {
                debug!(script = %resolved.filepath.display(), "CGI script not found");
                return Dispatch::Respond(self.error_response(server, resolved.root, StatusCode::NOT_FOUND, keep_alive));
            }
        };

        let spawned = CgiProcess::spawn(&CgiRequest {
            interpreter,
            script: &script,
            method: request.method(),
            uri: request.uri(),
            max_output: self.cgi_output_limit,
        });
        match spawned {
            Ok(process) => Dispatch::Cgi(PendingCgi {
                process,
                keep_alive,
                server: server.id(),
                root: resolved.root.to_path_buf(),
            }),
            Err(e) => {
                error!("{}", e);
                Dispatch::Respond(self.error_response(
                    server,
                    resolved.root,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    keep_alive,
                ))
            }
        }
    }

    fn file_response(&self, server: &ServerInstance, root: &Path, filepath: &Path, keep_alive: bool) -> HttpResponse {
        match fs::read(filepath) {
            Ok(content) => {
                debug!(file = %filepath.display(), "Handling GET: file opened");
                HttpResponse::new(StatusCode::OK)
                    .header("Content-Type", mime_type(filepath))
                    .body(content)
                    .keep_alive(keep_alive)
            }
            Err(e) => {
                debug!(file = %filepath.display(), "Handling GET: file not found: {}", e);
                self.error_response(server, root, StatusCode::NOT_FOUND, keep_alive)
            }
        }
    }

    /// The server's configured page for `status`, read from `root`, or the
    /// built-in one.
    fn error_response(&self, server: &ServerInstance, root: &Path, status: StatusCode, keep_alive: bool) -> HttpResponse {
        if let Some(uri) = server.error_page(status) {
            let page = root.join(uri.trim_start_matches('/'));
            match fs::read(&page) {
                Ok(body) => {
                    return HttpResponse::new(status)
                        .header("Content-Type", mime_type(&page))
                        .body(body)
                        .keep_alive(keep_alive);
                }
                Err(e) => warn!(page = %page.display(), "configured error page unreadable: {}", e),
            }
        }
        debug!("Handling default error response: [{}]", status);
        ErrorPages::response(status, keep_alive)
    }
}

/// First configured index that is a regular file, else the directory
/// itself.
fn find_index_file(dir: &Path, index: &[String]) -> PathBuf {
    index
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
        .unwrap_or_else(|| dir.to_path_buf())
}

pub fn mime_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first()
        .map_or_else(|| "application/octet-stream".to_string(), |mime| mime.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_search_falls_back_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("home.html"), "home").unwrap();
        fs::create_dir(dir.path().join("index.html")).unwrap();

        let index = vec!["index.html".to_string(), "home.html".to_string()];
        assert_eq!(find_index_file(dir.path(), &index), dir.path().join("home.html"));
        assert_eq!(find_index_file(dir.path(), &index[..1]), dir.path().to_path_buf());
    }

    #[test]
    fn mime_types_by_extension() {
        assert_eq!(mime_type(Path::new("a/index.html")), "text/html");
        assert_eq!(mime_type(Path::new("style.css")), "text/css");
        assert_eq!(mime_type(Path::new("blob.unknownext")), "application/octet-stream");
        assert_eq!(mime_type(Path::new("noext")), "application/octet-stream");
    }
}
