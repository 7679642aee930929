use std::fmt;

/// Methods the parser accepts on the start line. Anything else is answered
/// with 501 before headers are looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
}

impl Method {
    pub const ACCEPTED: [Method; 7] = [
        Method::Get,
        Method::Head,
        Method::Post,
        Method::Put,
        Method::Delete,
        Method::Options,
        Method::Patch,
    ];

    /// Case-sensitive, as method tokens are.
    pub fn from_token(token: &str) -> Option<Method> {
        Method::ACCEPTED
            .iter()
            .copied()
            .find(|method| method.as_str() == token)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header multimap: names keep the case of their first occurrence, lookups
/// ignore case, values keep arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        HeaderMap {
            entries: Vec::new(),
        }
    }

    pub fn append(&mut self, name: &str, value: &str) {
        match self
            .entries
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some((_, values)) => values.push(value.to_string()),
            None => self
                .entries
                .push((name.to_string(), vec![value.to_string()])),
        }
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        !self.get_all(name).is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(key, values)| (key.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A validated HTTP/1.1 request. Only the parser builds one, so every
/// instance carries a non-empty host taken from the `Host` header.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    uri: String,
    target: String,
    version: String,
    headers: HeaderMap,
    body: Vec<u8>,
    host: String,
    port: u16,
    content_length: Option<usize>,
}

impl HttpRequest {
    pub(crate) fn new(
        method: Method,
        uri: String,
        version: String,
        headers: HeaderMap,
        body: Vec<u8>,
        host: String,
        port: u16,
    ) -> Self {
        let content_length = headers
            .get("Content-Length")
            .and_then(|value| value.trim().parse().ok());
        let target = format!("{}{}", host, uri);

        HttpRequest {
            method,
            uri,
            target,
            version,
            headers,
            body,
            host,
            port,
            content_length,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Request target exactly as sent, query string included.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Host concatenated with the URI.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    /// URI without query string or fragment.
    pub fn path(&self) -> &str {
        let end = self
            .uri
            .find(|c| c == '?' || c == '#')
            .unwrap_or(self.uri.len());
        &self.uri[..end]
    }

    pub fn query(&self) -> Option<&str> {
        let (_, rest) = self.uri.split_once('?')?;
        Some(rest.split('#').next().unwrap_or(""))
    }

    /// HTTP/1.1 keeps the connection open unless the client says otherwise.
    pub fn keep_alive(&self) -> bool {
        !self
            .headers
            .get_all("Connection")
            .iter()
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("close"))
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.method, self.target, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(headers: &[(&str, &str)], uri: &str) -> HttpRequest {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(name, value);
        }
        HttpRequest::new(
            Method::Get,
            uri.to_string(),
            "HTTP/1.1".to_string(),
            map,
            Vec::new(),
            "example.com".to_string(),
            80,
        )
    }

    #[test]
    fn header_lookup_ignores_case_and_keeps_order() {
        let mut map = HeaderMap::new();
        map.append("Accept", "text/html");
        map.append("accept", "*/*");

        assert_eq!(map.get("ACCEPT"), Some("text/html"));
        assert_eq!(map.get_all("Accept"), &["text/html", "*/*"]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.iter().next().unwrap().0, "Accept");
    }

    #[test]
    fn target_joins_host_and_uri() {
        let req = request_with(&[("Host", "example.com")], "/a/b?x=1");
        assert_eq!(req.target(), "example.com/a/b?x=1");
        assert_eq!(req.path(), "/a/b");
        assert_eq!(req.query(), Some("x=1"));
    }

    #[test]
    fn keep_alive_defaults_on() {
        assert!(request_with(&[], "/").keep_alive());
        assert!(!request_with(&[("Connection", "Close")], "/").keep_alive());
        assert!(request_with(&[("Connection", "keep-alive")], "/").keep_alive());
    }

    #[test]
    fn method_tokens_are_case_sensitive() {
        assert_eq!(Method::from_token("DELETE"), Some(Method::Delete));
        assert_eq!(Method::from_token("get"), None);
        assert_eq!(Method::from_token("BREW"), None);
    }
}
