use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8088;

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, suitable for binding (host names are resolved on bind).
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Which server a [`Client`](crate::Client) talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            path: "/".to_string(),
            user: None,
            password: None,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Basic-auth credentials, only when both user and password are set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.user.as_deref(), self.password.as_deref()) {
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                Some((user, password))
            }
            _ => None,
        }
    }

    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        let base = Url::parse(&format!("http://{}:{}/", self.host, self.port))?;
        Ok(base.join(&self.path)?)
    }

    /// Address of the raw socket server, same host and port.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: ClientConfig = serde_json::from_str(r#"{"port": 9000}"#).unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, 9000);
        assert_eq!(config.path, "/");
        assert!(config.credentials().is_none());

        let server: ServerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(server, ServerConfig::default());
        assert_eq!(server.bind_addr(), "127.0.0.1:8088");
    }

    #[test]
    fn endpoint_joins_path() {
        let config = ClientConfig::new("localhost", 8088).with_path("/rpc");
        assert_eq!(config.endpoint().unwrap().as_str(), "http://localhost:8088/rpc");
    }

    #[test]
    fn credentials_need_user_and_password() {
        let mut config = ClientConfig::default();
        config.user = Some("alice".to_string());
        assert!(config.credentials().is_none());

        let config = config.with_credentials("alice", "secret");
        assert_eq!(config.credentials(), Some(("alice", "secret")));
    }

    #[test]
    fn bad_host_is_a_config_error() {
        let config = ClientConfig::new("bad host", 1);
        assert!(matches!(config.endpoint(), Err(ConfigError::Url(_))));
    }
}
