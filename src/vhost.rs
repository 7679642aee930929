//! Virtual host table: the typed, read-only routing model built once from
//! the configuration at startup.

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};

use crate::config::{self, Config, ConfigError, LocationConfig, ServerConfig};
use crate::http::{Method, StatusCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenEndpoint {
    pub address: Ipv4Addr,
    pub port: u16,
}

impl ListenEndpoint {
    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.address, self.port)
    }
}

impl From<SocketAddrV4> for ListenEndpoint {
    fn from(addr: SocketAddrV4) -> Self {
        ListenEndpoint {
            address: *addr.ip(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub status: StatusCode,
    pub location: String,
}

#[derive(Debug, Clone)]
pub struct Location {
    prefix: String,
    root: Option<PathBuf>,
    index: Option<Vec<String>>,
    allowed_methods: Option<Vec<Method>>,
    redirect: Option<Redirect>,
    client_body_size: Option<usize>,
    autoindex: bool,
    cgi: Vec<(String, PathBuf)>,
}

impl Location {
    fn from_config(location: &LocationConfig) -> Result<Location, ConfigError> {
        let redirect = match &location.redirect {
            Some(value) => {
                let (code, uri) = config::parse_return(value)?;
                let status = StatusCode::from_u16(code)
                    .ok_or_else(|| ConfigError::Invalid(format!("invalid return code {}", code)))?;
                Some(Redirect {
                    status,
                    location: uri,
                })
            }
            None => None,
        };
        let allowed_methods = match &location.limit_except {
            Some(methods) => Some(
                methods
                    .iter()
                    .map(|method| config::parse_method(method))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };
        let mut cgi: Vec<(String, PathBuf)> = location
            .cgi
            .iter()
            .map(|(extension, interpreter)| (extension.clone(), PathBuf::from(interpreter)))
            .collect();
        // Longer extensions first so ".tar.py" wins over ".py".
        cgi.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Ok(Location {
            prefix: location.path.clone(),
            root: location.root.as_ref().map(PathBuf::from),
            index: location.index.clone(),
            allowed_methods,
            redirect,
            client_body_size: location.client_body_size,
            autoindex: location.autoindex,
            cgi,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn redirect(&self) -> Option<&Redirect> {
        self.redirect.as_ref()
    }

    pub fn autoindex(&self) -> bool {
        self.autoindex
    }

    /// Unrestricted locations allow every method.
    pub fn allows(&self, method: Method) -> bool {
        self.allowed_methods
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&method))
    }

    /// Interpreter mapped to the extension `path` ends with, if any.
    pub fn cgi_interpreter(&self, path: &str) -> Option<&Path> {
        self.cgi
            .iter()
            .find(|(extension, _)| path.ends_with(extension.as_str()))
            .map(|(_, interpreter)| interpreter.as_path())
    }
}

/// One virtual host bound to one listen endpoint.
#[derive(Debug, Clone)]
pub struct ServerInstance {
    id: usize,
    names: Vec<String>,
    endpoint: ListenEndpoint,
    root: PathBuf,
    index: Vec<String>,
    client_max_body_size: usize,
    error_pages: HashMap<u16, String>,
    locations: Vec<Location>,
}

impl ServerInstance {
    fn from_config(
        id: usize,
        server: &ServerConfig,
        endpoint: ListenEndpoint,
    ) -> Result<ServerInstance, ConfigError> {
        let error_pages = server
            .error_page
            .iter()
            .map(|(code, uri)| Ok((config::parse_error_code(code)?, uri.clone())))
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;
        let locations = server
            .locations
            .iter()
            .map(Location::from_config)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ServerInstance {
            id,
            names: server.server_name.clone(),
            endpoint,
            root: PathBuf::from(&server.root),
            index: server.index.clone(),
            client_max_body_size: server.client_max_body_size,
            error_pages,
            locations,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn endpoint(&self) -> ListenEndpoint {
        self.endpoint
    }

    pub fn answers(&self, host: &str, port: u16) -> bool {
        self.endpoint.port == port && self.names.iter().any(|name| name.eq_ignore_ascii_case(host))
    }

    /// Longest configured prefix of `path`.
    pub fn match_location(&self, path: &str) -> Option<&Location> {
        self.locations
            .iter()
            .filter(|location| path.starts_with(location.prefix.as_str()))
            .max_by_key(|location| location.prefix.len())
    }

    pub fn root_for<'a>(&'a self, location: &'a Location) -> &'a Path {
        location.root.as_deref().unwrap_or(self.root.as_path())
    }

    pub fn index_for<'a>(&'a self, location: &'a Location) -> &'a [String] {
        location.index.as_deref().unwrap_or(&self.index[..])
    }

    pub fn body_limit_for(&self, location: &Location) -> usize {
        location.client_body_size.unwrap_or(self.client_max_body_size)
    }

    pub fn error_page(&self, status: StatusCode) -> Option<&str> {
        self.error_pages.get(&status.as_u16()).map(String::as_str)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[derive(Debug, Clone, Default)]
pub struct VirtualHostTable {
    servers: Vec<ServerInstance>,
}

impl VirtualHostTable {
    /// One instance per (server block, listen address) pair, in
    /// configuration order.
    pub fn from_config(cfg: &Config) -> Result<VirtualHostTable, ConfigError> {
        let mut servers = Vec::new();
        for server in &cfg.servers {
            for listen in &server.listen {
                let endpoint = ListenEndpoint::from(config::parse_listen(listen)?);
                servers.push(ServerInstance::from_config(servers.len(), server, endpoint)?);
            }
        }
        Ok(VirtualHostTable { servers })
    }

    /// First instance answering to `host` on `port`.
    pub fn find(&self, host: &str, port: u16) -> Option<&ServerInstance> {
        self.servers.iter().find(|server| server.answers(host, port))
    }

    pub fn servers(&self) -> &[ServerInstance] {
        &self.servers
    }

    /// Distinct endpoints to bind, in first-seen order.
    pub fn endpoints(&self) -> Vec<ListenEndpoint> {
        let mut endpoints: Vec<ListenEndpoint> = Vec::new();
        for server in &self.servers {
            if !endpoints.contains(&server.endpoint) {
                endpoints.push(server.endpoint);
            }
        }
        endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> VirtualHostTable {
        let config = Config::from_toml(
            r#"
[[server]]
listen = ["127.0.0.1:8080", "8081"]
server_name = ["example.com", "www.example.com"]
root = "/srv/www"
client_max_body_size = 100

[[server.location]]
path = "/"

[[server.location]]
path = "/a"
root = "/srv/a"
client_body_size = 10

[[server.location]]
path = "/a/b"
limit_except = ["GET"]
index = ["home.html"]
cgi = { ".py" = "/usr/bin/python3", ".cgi" = "/bin/sh" }

[[server]]
listen = ["127.0.0.1:8080"]
server_name = ["other.org"]
root = "/srv/other"
"#,
        )
        .unwrap();
        VirtualHostTable::from_config(&config).unwrap()
    }

    #[test]
    fn one_instance_per_listen() {
        let table = table();
        assert_eq!(table.servers().len(), 3);
        assert_eq!(
            table.endpoints(),
            vec![
                ListenEndpoint::from("127.0.0.1:8080".parse::<SocketAddrV4>().unwrap()),
                ListenEndpoint::from("0.0.0.0:8081".parse::<SocketAddrV4>().unwrap()),
            ]
        );
    }

    #[test]
    fn finds_by_host_and_port() {
        let table = table();
        assert_eq!(table.find("EXAMPLE.com", 8081).unwrap().id(), 1);
        assert_eq!(table.find("other.org", 8080).unwrap().id(), 2);
        assert!(table.find("other.org", 8081).is_none());
        assert!(table.find("example.com", 80).is_none());
    }

    #[test]
    fn longest_prefix_wins() {
        let table = table();
        let server = table.find("example.com", 8080).unwrap();
        assert_eq!(server.match_location("/a/b/c").unwrap().prefix(), "/a/b");
        assert_eq!(server.match_location("/a/x").unwrap().prefix(), "/a");
        assert_eq!(server.match_location("/z").unwrap().prefix(), "/");

        let other = table.find("other.org", 8080).unwrap();
        assert!(other.match_location("/").is_none());
    }

    #[test]
    fn location_overrides_fall_back_to_server() {
        let table = table();
        let server = table.find("example.com", 8080).unwrap();
        let a = server.match_location("/a").unwrap();
        let ab = server.match_location("/a/b").unwrap();

        assert_eq!(server.root_for(a), Path::new("/srv/a"));
        assert_eq!(server.root_for(ab), Path::new("/srv/www"));
        assert_eq!(server.body_limit_for(a), 10);
        assert_eq!(server.body_limit_for(ab), 100);
        assert_eq!(server.index_for(a), &["index.html".to_string()]);
        assert_eq!(server.index_for(ab), &["home.html".to_string()]);
        assert!(a.allows(Method::Delete));
        assert!(!ab.allows(Method::Post));
        assert_eq!(ab.cgi_interpreter("/a/b/run.py"), Some(Path::new("/usr/bin/python3")));
        assert_eq!(ab.cgi_interpreter("/a/b/page.html"), None);
    }
}
