//! Strategy configuration.

use crate::error::{NetworkError, NetworkResult};
use serde::{Deserialize, Serialize};
use std::env;

/// Wire protocol revision announced in every connection URL.
pub const PROTOCOL_VERSION: u32 = 7;

/// Options shared by all transport strategies of one client.
///
/// Immutable once handed to a strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyOptions {
    /// Application key.
    pub key: String,
    /// Use `https` endpoints.
    pub use_tls: bool,
    /// Host name of the realtime service.
    pub host: String,
    pub http_port: u16,
    pub https_port: u16,
    /// Prefix for HTTP streaming/polling endpoints.
    pub http_path: String,
    /// Client name reported to the server.
    pub client_name: String,
    /// Client version reported to the server.
    pub client_version: String,
    /// Strategy names that must never be attempted.
    pub disabled_transports: Vec<String>,
}

impl Default for StrategyOptions {
    fn default() -> Self {
        Self {
            key: String::new(),
            use_tls: true,
            host: "localhost".to_string(),
            http_port: 80,
            https_port: 443,
            http_path: "/pusher".to_string(),
            client_name: "crossworld".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            disabled_transports: Vec::new(),
        }
    }
}

impl StrategyOptions {
    /// Default options for an application key.
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    /// Builds options from `CROSSWORLD_REALTIME_*` environment variables.
    ///
    /// `CROSSWORLD_REALTIME_KEY` is required; everything else falls back to
    /// [`StrategyOptions::default`].
    pub fn from_env() -> NetworkResult<Self> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Builds options from any variable source, e.g. a parsed `.env` map.
    pub fn from_vars<F>(var: F) -> NetworkResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let key = var("CROSSWORLD_REALTIME_KEY")
            .ok_or_else(|| NetworkError::Config("CROSSWORLD_REALTIME_KEY is not set".into()))?;
        if key.is_empty() {
            return Err(NetworkError::Config(
                "CROSSWORLD_REALTIME_KEY is empty".into(),
            ));
        }

        let host = var("CROSSWORLD_REALTIME_HOST").unwrap_or(defaults.host);
        let use_tls = var("CROSSWORLD_REALTIME_TLS")
            .map(|v| !matches!(v.as_str(), "0" | "false" | "no"))
            .unwrap_or(defaults.use_tls);
        let http_port = port_var(&var, "CROSSWORLD_REALTIME_HTTP_PORT", defaults.http_port)?;
        let https_port = port_var(&var, "CROSSWORLD_REALTIME_HTTPS_PORT", defaults.https_port)?;
        let http_path = var("CROSSWORLD_REALTIME_HTTP_PATH").unwrap_or(defaults.http_path);
        let disabled_transports = var("CROSSWORLD_REALTIME_DISABLED_TRANSPORTS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            key,
            use_tls,
            host,
            http_port,
            https_port,
            http_path,
            disabled_transports,
            ..defaults
        })
    }

    /// Whether a strategy name was switched off.
    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled_transports.iter().any(|t| t == name)
    }

    /// `/app/{key}?protocol=..&client=..&version=..`
    pub fn generic_path(&self) -> String {
        format!(
            "/app/{}?protocol={}&client={}&version={}",
            self.key, PROTOCOL_VERSION, self.client_name, self.client_version
        )
    }

    /// HTTP streaming/polling endpoint URL.
    pub fn http_url(&self) -> String {
        let (scheme, port) = if self.use_tls {
            ("https", self.https_port)
        } else {
            ("http", self.http_port)
        };
        format!(
            "{scheme}://{}:{port}{}{}",
            self.host,
            self.http_path,
            self.generic_path()
        )
    }
}

fn port_var<F>(var: &F, name: &str, default: u16) -> NetworkResult<u16>
where
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => value
            .parse()
            .map_err(|_| NetworkError::Config(format!("{name} is not a valid port: {value}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_http_url() {
        let options = StrategyOptions {
            client_version: "1.0.0".into(),
            ..StrategyOptions::with_key("app-key")
        };
        assert_eq!(
            options.http_url(),
            "https://localhost:443/pusher/app/app-key?protocol=7&client=crossworld&version=1.0.0"
        );
    }

    #[test]
    fn test_http_url_without_tls() {
        let options = StrategyOptions {
            use_tls: false,
            host: "rt.example.com".into(),
            http_port: 8080,
            client_version: "1.0.0".into(),
            ..StrategyOptions::with_key("k")
        };
        assert_eq!(
            options.http_url(),
            "http://rt.example.com:8080/pusher/app/k?protocol=7&client=crossworld&version=1.0.0"
        );
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_from_vars_requires_key() {
        assert!(matches!(
            StrategyOptions::from_vars(vars(&[])),
            Err(NetworkError::Config(_))
        ));
        assert!(matches!(
            StrategyOptions::from_vars(vars(&[("CROSSWORLD_REALTIME_KEY", "")])),
            Err(NetworkError::Config(_))
        ));
    }

    #[test]
    fn test_from_vars_defaults() {
        let options =
            StrategyOptions::from_vars(vars(&[("CROSSWORLD_REALTIME_KEY", "abc")])).unwrap();
        assert_eq!(options, StrategyOptions::with_key("abc"));
    }

    #[test]
    fn test_from_vars_overrides() {
        let options = StrategyOptions::from_vars(vars(&[
            ("CROSSWORLD_REALTIME_KEY", "abc"),
            ("CROSSWORLD_REALTIME_HOST", "rt.example.com"),
            ("CROSSWORLD_REALTIME_TLS", "false"),
            ("CROSSWORLD_REALTIME_HTTP_PORT", "8080"),
            ("CROSSWORLD_REALTIME_HTTP_PATH", "/realtime"),
            ("CROSSWORLD_REALTIME_DISABLED_TRANSPORTS", " xhr_polling, ,sockjs "),
        ]))
        .unwrap();
        assert_eq!(options.host, "rt.example.com");
        assert!(!options.use_tls);
        assert_eq!(options.http_port, 8080);
        assert_eq!(options.https_port, 443);
        assert_eq!(options.http_path, "/realtime");
        assert_eq!(options.disabled_transports, vec!["xhr_polling", "sockjs"]);
    }

    #[test]
    fn test_from_vars_bad_port() {
        let result = StrategyOptions::from_vars(vars(&[
            ("CROSSWORLD_REALTIME_KEY", "abc"),
            ("CROSSWORLD_REALTIME_HTTPS_PORT", "70000"),
        ]));
        assert_eq!(
            result,
            Err(NetworkError::Config(
                "CROSSWORLD_REALTIME_HTTPS_PORT is not a valid port: 70000".into()
            ))
        );
    }

    #[test]
    fn test_from_env_without_key() {
        if env::var("CROSSWORLD_REALTIME_KEY").is_err() {
            assert!(StrategyOptions::from_env().is_err());
        }
    }

    #[test]
    fn test_disabled_transports() {
        let options = StrategyOptions {
            disabled_transports: vec!["xhr_polling".into()],
            ..Default::default()
        };
        assert!(options.is_disabled("xhr_polling"));
        assert!(!options.is_disabled("xhr_streaming"));
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: StrategyOptions =
            serde_json::from_str(r#"{"key":"abc","use_tls":false}"#).unwrap();
        assert_eq!(options.key, "abc");
        assert!(!options.use_tls);
        assert_eq!(options.http_path, "/pusher");
    }
}
