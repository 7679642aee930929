//! HTTP/1.1 wire handling: request model, framing, validation and
//! response serialization.

pub mod framing;
pub mod parser;
pub mod request;
pub mod response;

pub use parser::{HttpParser, ParseError};
pub use request::{HeaderMap, HttpRequest, Method};
pub use response::{ErrorPages, HttpResponse, StatusCode};
