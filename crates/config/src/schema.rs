use std::{convert::Infallible, fmt, str::FromStr, time::Duration};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

use crate::{ConfigError, Result};

/// Root of `switchyard.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchyardConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

impl SwitchyardConfig {
    /// Apply `SWITCHYARD_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, keyed by environment variable name.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(bind) = lookup("SWITCHYARD_BIND") {
            self.server.bind = bind;
        }
        if let Some(port) = lookup("SWITCHYARD_PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::InvalidOverride {
                name: "SWITCHYARD_PORT",
                value: port,
            })?;
        }
        if let Some(url) = lookup("SWITCHYARD_URL") {
            self.client.url = url;
        }
        if let Some(token) = lookup("SWITCHYARD_TOKEN") {
            self.client.token = Some(Secret::new(token));
        }
        Ok(())
    }
}

// ── Server ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Route of the WebSocket endpoint.
    pub path: String,
    /// Blocking-handler pool size; 0 runs them inline.
    pub max_workers: usize,
    /// Frames queued per connection before senders wait.
    pub outbound_buffer: usize,
    /// Default timeout for server → client calls; 0 waits forever.
    pub call_timeout_secs: u64,
    /// How long one pub/sub delivery may wait on a full subscriber buffer.
    pub delivery_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8765,
            path: "/rpc".into(),
            max_workers: 4,
            outbound_buffer: 512,
            call_timeout_secs: 30,
            delivery_timeout_ms: 2_000,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        timeout(self.call_timeout_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms.max(1))
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub url: String,
    pub call_timeout_secs: u64,
    /// Bearer token sent when the connection is upgraded.
    #[serde(
        serialize_with = "serialize_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub token: Option<Secret<String>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765/rpc".into(),
            call_timeout_secs: 30,
            token: None,
        }
    }
}

impl ClientConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        timeout(self.call_timeout_secs)
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("call_timeout_secs", &self.call_timeout_secs)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match secret {
        Some(secret) => serializer.serialize_some(secret.expose_secret()),
        None => serializer.serialize_none(),
    }
}

fn timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

// ── Auth ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub users: Vec<UserConfig>,
}

/// One bearer-token identity. Only the token's SHA-256 digest is stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub name: String,
    /// Hex-encoded SHA-256 of the token.
    pub token_sha256: String,
    pub permissions: Vec<String>,
}

// ── Logging ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = Infallible;

    /// Case-insensitive. Anything unrecognised is text.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Text,
        })
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Json => f.write_str("json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, rstest::rstest, std::collections::HashMap};

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let cfg = SwitchyardConfig::default();
        assert_eq!(cfg.server.addr(), "127.0.0.1:8765");
        assert_eq!(cfg.server.path, "/rpc");
        assert_eq!(cfg.server.max_workers, 4);
        assert_eq!(cfg.server.call_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.server.delivery_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.client.url, "ws://127.0.0.1:8765/rpc");
        assert!(cfg.client.token.is_none());
        assert!(cfg.auth.users.is_empty());
        assert_eq!(cfg.logging.format, LogFormat::Text);
    }

    #[test]
    fn zero_timeout_means_none() {
        let server = ServerConfig {
            call_timeout_secs: 0,
            ..ServerConfig::default()
        };
        assert_eq!(server.call_timeout(), None);
    }

    #[test]
    fn overrides_apply() {
        let mut cfg = SwitchyardConfig::default();
        cfg.apply_overrides(env(&[
            ("SWITCHYARD_BIND", "0.0.0.0"),
            ("SWITCHYARD_PORT", "9000"),
            ("SWITCHYARD_URL", "ws://example.com/rpc"),
            ("SWITCHYARD_TOKEN", "t0ken"),
        ]))
        .unwrap();
        assert_eq!(cfg.server.addr(), "0.0.0.0:9000");
        assert_eq!(cfg.client.url, "ws://example.com/rpc");
        let token = cfg.client.token.as_ref().unwrap();
        assert_eq!(token.expose_secret(), "t0ken");
    }

    #[test]
    fn bad_port_override_is_rejected() {
        let mut cfg = SwitchyardConfig::default();
        let err = cfg
            .apply_overrides(env(&[("SWITCHYARD_PORT", "http")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidOverride { name: "SWITCHYARD_PORT", .. }
        ));
        assert_eq!(cfg.server.port, 8765);
    }

    #[test]
    fn client_debug_redacts_token() {
        let client = ClientConfig {
            token: Some(Secret::new("hunter2".into())),
            ..ClientConfig::default()
        };
        let printed = format!("{client:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("REDACTED"));
    }

    #[test]
    fn token_round_trips_through_toml() {
        let client = ClientConfig {
            token: Some(Secret::new("hunter2".into())),
            ..ClientConfig::default()
        };
        let text = toml::to_string(&client).unwrap();
        let back: ClientConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.token.unwrap().expose_secret(), "hunter2");

        let anonymous = toml::to_string(&ClientConfig::default()).unwrap();
        assert!(!anonymous.contains("token"));
    }

    #[rstest]
    #[case("json", LogFormat::Json)]
    #[case("JSON", LogFormat::Json)]
    #[case("text", LogFormat::Text)]
    #[case("pretty", LogFormat::Text)]
    fn log_formats(#[case] raw: &str, #[case] expected: LogFormat) {
        assert_eq!(raw.parse::<LogFormat>().unwrap(), expected);
    }
}
