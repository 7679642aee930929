use serde_derive::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::http::Method;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub log: LoggingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(rename = "server", default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub poll_timeout_ms: i32,
    pub max_events: usize,
    pub client_timeout_secs: u64,
    pub cgi_timeout_secs: u64,
    pub max_request_bytes: usize,
    pub max_cgi_output_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            poll_timeout_ms: 1000,
            max_events: 1024,
            client_timeout_secs: 60,
            cgi_timeout_secs: 10,
            max_request_bytes: 16 * 1024 * 1024,
            max_cgi_output_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: Vec<String>,
    #[serde(default = "default_server_names")]
    pub server_name: Vec<String>,
    pub root: String,
    #[serde(default = "default_index")]
    pub index: Vec<String>,
    #[serde(default = "default_body_size")]
    pub client_max_body_size: usize,
    #[serde(default)]
    pub error_page: HashMap<String, String>,
    #[serde(rename = "location", default)]
    pub locations: Vec<LocationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocationConfig {
    pub path: String,
    pub root: Option<String>,
    pub index: Option<Vec<String>>,
    pub limit_except: Option<Vec<String>>,
    #[serde(rename = "return")]
    pub redirect: Option<String>,
    pub client_body_size: Option<usize>,
    #[serde(default)]
    pub autoindex: bool,
    #[serde(default)]
    pub cgi: HashMap<String, String>,
}

fn default_server_names() -> Vec<String> {
    vec!["localhost".to_string()]
}

fn default_index() -> Vec<String> {
    vec!["index.html".to_string()]
}

fn default_body_size() -> usize {
    1024 * 1024
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Config::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_events == 0 {
            return Err(ConfigError::Invalid("max_events cannot be 0".into()));
        }
        if self.engine.poll_timeout_ms <= 0 {
            return Err(ConfigError::Invalid("poll_timeout_ms must be positive".into()));
        }
        if self.engine.max_request_bytes == 0 {
            return Err(ConfigError::Invalid("max_request_bytes cannot be 0".into()));
        }
        if self.engine.max_cgi_output_bytes == 0 {
            return Err(ConfigError::Invalid("max_cgi_output_bytes cannot be 0".into()));
        }
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid("at least one [[server]] is required".into()));
        }

        for (i, server) in self.servers.iter().enumerate() {
            if server.listen.is_empty() {
                return Err(ConfigError::Invalid(format!("server {} has no listen address", i)));
            }
            for listen in &server.listen {
                parse_listen(listen)?;
            }
            for (code, uri) in &server.error_page {
                parse_error_code(code)?;
                if !uri.starts_with('/') {
                    return Err(ConfigError::Invalid(format!(
                        "error_page {} must be an absolute URI, got {:?}",
                        code, uri
                    )));
                }
            }
            for location in &server.locations {
                location.validate()?;
            }
        }
        Ok(())
    }
}

impl LocationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "location path must start with '/': {:?}",
                self.path
            )));
        }
        if let Some(redirect) = &self.redirect {
            parse_return(redirect)?;
        }
        for method in self.limit_except.iter().flatten() {
            parse_method(method)?;
        }
        for (extension, interpreter) in &self.cgi {
            if !extension.starts_with('.') || extension.len() < 2 {
                return Err(ConfigError::Invalid(format!(
                    "cgi extension must look like \".py\", got {:?}",
                    extension
                )));
            }
            if interpreter.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "cgi interpreter for {} is empty",
                    extension
                )));
            }
        }
        Ok(())
    }
}

/// `"a.b.c.d:port"`, or a bare `"port"` meaning every IPv4 interface.
pub fn parse_listen(value: &str) -> Result<SocketAddrV4, ConfigError> {
    let addr = match value.parse::<u16>() {
        Ok(port) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port),
        Err(_) => value
            .parse::<SocketAddrV4>()
            .map_err(|_| ConfigError::Invalid(format!("invalid listen address {:?}", value)))?,
    };
    if addr.port() == 0 {
        return Err(ConfigError::Invalid("Port cannot be 0".into()));
    }
    Ok(addr)
}

/// `"301 /new"` or just `"/new"` (301 implied).
pub fn parse_return(value: &str) -> Result<(u16, String), ConfigError> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    let (code, uri) = match parts.as_slice() {
        [uri] => (301, *uri),
        [code, uri] => {
            let code = code
                .parse::<u16>()
                .map_err(|_| ConfigError::Invalid(format!("invalid return code in {:?}", value)))?;
            (code, *uri)
        }
        _ => return Err(ConfigError::Invalid(format!("invalid return directive {:?}", value))),
    };
    if !(300..400).contains(&code) {
        return Err(ConfigError::Invalid(format!("return code must be 3xx, got {}", code)));
    }
    Ok((code, uri.to_string()))
}

pub fn parse_error_code(value: &str) -> Result<u16, ConfigError> {
    value
        .parse::<u16>()
        .ok()
        .filter(|code| (300..600).contains(code))
        .ok_or_else(|| ConfigError::Invalid(format!("invalid error_page status {:?}", value)))
}

pub fn parse_method(value: &str) -> Result<Method, ConfigError> {
    Method::from_token(value)
        .ok_or_else(|| ConfigError::Invalid(format!("unknown method in limit_except: {:?}", value)))
}
