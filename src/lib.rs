//! A configurable HTTP/1.1 origin server: static files, directory
//! listings, redirects, file deletion and CGI, served from one
//! single-threaded epoll loop across any number of virtual hosts.

pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod reactor;
pub mod router;
pub mod signals;
pub mod vhost;

pub use config::Config;
pub use error::ServerError;
pub use reactor::Reactor;
pub use router::Router;
pub use vhost::VirtualHostTable;
