use crate::routes::{hosts_overlap, normalize_host, RouteError, RoutingTable};
use crate::wake::DEFAULT_WAKE_BROADCAST;
use chrono::{DateTime, Utc};
use serde::de::value::{MapAccessDeserializer, SeqAccessDeserializer};
use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("error parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("bind_host can't be blank")]
    BlankBindHost,
    #[error("services can't be empty")]
    NoServices,
    #[error("invalid config:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Gateway configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listen address, `host:port` or `:port`
    #[serde(default, alias = "bindHost")]
    pub bind_host: String,

    /// Host serving the info API (disabled when unset)
    #[serde(default, alias = "infoHost")]
    pub info_host: Option<String>,

    /// Seconds to wait for in-flight requests on shutdown (default: 5)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Seconds to wait for a backend response (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Seconds to wait for a backend connection (default: 10)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Where magic packets are sent (default: 255.255.255.255:9)
    #[serde(default = "default_wake_broadcast", alias = "wakeBroadcast")]
    pub wake_broadcast: String,

    /// Proxied services, as a list or keyed by id
    #[serde(default)]
    pub services: Services,
}

/// Services may be written as `[[services]]` or as `[services.<id>]`
#[derive(Debug, Clone)]
pub enum Services {
    List(Vec<ServiceConfig>),
    Keyed(BTreeMap<String, ServiceConfig>),
}

// Dispatch on the TOML shape so field errors inside a service surface as-is.
impl<'de> Deserialize<'de> for Services {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ServicesVisitor;

        impl<'de> Visitor<'de> for ServicesVisitor {
            type Value = Services;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an array of services or a table of services keyed by id")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, seq: A) -> Result<Services, A::Error> {
                Vec::deserialize(SeqAccessDeserializer::new(seq)).map(Services::List)
            }

            fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<Services, A::Error> {
                BTreeMap::deserialize(MapAccessDeserializer::new(map)).map(Services::Keyed)
            }
        }

        deserializer.deserialize_any(ServicesVisitor)
    }
}

impl Default for Services {
    fn default() -> Self {
        Services::List(Vec::new())
    }
}

impl Services {
    /// Flatten into a list. In the keyed form the key is the id.
    pub fn to_vec(&self) -> Vec<ServiceConfig> {
        match self {
            Services::List(list) => list.clone(),
            Services::Keyed(map) => map
                .iter()
                .map(|(id, service)| ServiceConfig {
                    id: Some(id.clone()),
                    ..service.clone()
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Services::List(list) => list.len(),
            Services::Keyed(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Configuration for a single proxied service
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Stable identifier (generated when unset)
    #[serde(default)]
    pub id: Option<String>,

    /// Hostname this service answers to, optionally with a scheme prefix
    #[serde(default, alias = "matchHost", alias = "on")]
    pub match_host: String,

    /// Absolute URL requests are forwarded to
    #[serde(default, alias = "to")]
    pub target: String,

    /// Wake-on-LAN settings for backends that sleep
    #[serde(default, alias = "wol")]
    pub wake: Option<WakeConfig>,
}

impl ServiceConfig {
    pub fn new(match_host: &str, target: &str) -> Self {
        Self {
            id: None,
            match_host: match_host.to_string(),
            target: target.to_string(),
            wake: None,
        }
    }

    /// Set the id (builder pattern)
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// Attach wake settings (builder pattern)
    pub fn with_wake(mut self, hardware_address: &str, cooldown_minutes: Option<i64>) -> Self {
        self.wake = Some(WakeConfig {
            hardware_address: hardware_address.to_string(),
            cooldown_minutes,
        });
        self
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WakeConfig {
    /// MAC address of the sleeping machine
    #[serde(default, alias = "hardwareAddress", alias = "mac")]
    pub hardware_address: String,

    /// Minimum minutes between wake signals (default: 60)
    #[serde(default, alias = "cooldownMinutes", alias = "wolInt")]
    pub cooldown_minutes: Option<i64>,
}

// Default value functions
fn default_shutdown_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_wake_broadcast() -> String {
    DEFAULT_WAKE_BROADCAST.to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse a TOML document. Call [`validate`](Self::validate) before use.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Validate all configuration and build the routing table.
    ///
    /// Every problem found is reported in one [`ConfigError::Invalid`].
    pub fn validate(&self, now: DateTime<Utc>) -> Result<RoutingTable, ConfigError> {
        if self.bind_host.trim().is_empty() {
            return Err(ConfigError::BlankBindHost);
        }

        if self.services.is_empty() {
            return Err(ConfigError::NoServices);
        }

        let mut errors = Vec::new();

        if self.wake_broadcast.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "wake_broadcast '{}' is not a socket address",
                self.wake_broadcast
            ));
        }

        if self.shutdown_timeout_secs == 0 {
            errors.push("shutdown_timeout_secs must be greater than 0".to_string());
        }

        if self.request_timeout_secs == 0 {
            errors.push("request_timeout_secs must be greater than 0".to_string());
        }

        let services = self.services.to_vec();
        if let Some(info_host) = self.info_host() {
            for (i, service) in services.iter().enumerate() {
                let match_host = normalize_host(&service.match_host);
                if !match_host.is_empty() && hosts_overlap(&info_host, &match_host) {
                    errors.push(format!(
                        "info_host '{}' would shadow match_host '{}' of service {} ('{}')",
                        info_host,
                        match_host,
                        i,
                        service.id.as_deref().unwrap_or("unnamed")
                    ));
                }
            }
        }

        match RoutingTable::build(&services, now) {
            Ok(table) if errors.is_empty() => Ok(table),
            Ok(_) => Err(ConfigError::Invalid(errors)),
            Err(RouteError::Invalid(route_errors)) => {
                errors.extend(route_errors);
                Err(ConfigError::Invalid(errors))
            }
        }
    }

    /// Listen address with a bare `:port` expanded to all interfaces
    pub fn bind_addr(&self) -> String {
        let bind = self.bind_host.trim();
        if bind.starts_with(':') {
            format!("0.0.0.0{}", bind)
        } else {
            bind.to_string()
        }
    }

    /// Normalized info host, if one is configured
    pub fn info_host(&self) -> Option<String> {
        self.info_host
            .as_deref()
            .map(normalize_host)
            .filter(|h| !h.is_empty())
    }

    pub fn wake_broadcast_addr(&self) -> Option<SocketAddr> {
        self.wake_broadcast.parse().ok()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn check(toml: &str) -> Result<RoutingTable, ConfigError> {
        Config::parse(toml)?.validate(Utc::now())
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
bind_host = "0.0.0.0:8080"
info_host = "info.example.com"
shutdown_timeout_secs = 10

[[services]]
id = "nas"
match_host = "nas.example.com"
target = "http://192.168.1.10:5000"

[services.wake]
hardware_address = "AA:BB:CC:DD:EE:FF"
cooldown_minutes = 15

[[services]]
match_host = "https://git.example.com"
target = "http://192.168.1.11:3000"
"#;

        let config = Config::parse(toml).unwrap();
        let routes = config.validate(Utc::now()).unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(config.bind_host, "0.0.0.0:8080");
        assert_eq!(config.info_host(), Some("info.example.com".to_string()));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(config.services.len(), 2);

        let services = config.services.to_vec();
        assert_eq!(services[0].id.as_deref(), Some("nas"));
        let wake = services[0].wake.as_ref().unwrap();
        assert_eq!(wake.hardware_address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(wake.cooldown_minutes, Some(15));
        assert!(services[1].wake.is_none());
    }

    #[test]
    fn test_keyed_services_use_key_as_id() {
        let toml = r#"
bind_host = ":8080"

[services.nas]
match_host = "nas.example.com"
target = "http://192.168.1.10:5000"
wake = { hardware_address = "aa:bb:cc:dd:ee:ff" }

[services.git]
match_host = "git.example.com"
target = "http://192.168.1.11:3000"
"#;

        let config = Config::parse(toml).unwrap();
        let routes = config.validate(Utc::now()).unwrap();
        assert!(routes.get("nas").unwrap().wake().is_some());
        let services = config.services.to_vec();
        let ids: Vec<_> = services.iter().filter_map(|s| s.id.as_deref()).collect();
        assert_eq!(ids, vec!["git", "nas"]);
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_camel_case_aliases() {
        let toml = r#"
bindHost = "127.0.0.1:8080"
infoHost = "info.local"

[[services]]
matchHost = "a.example.com"
target = "http://10.0.0.5:3000"
wake = { hardwareAddress = "AA:BB:CC:DD:EE:FF", cooldownMinutes = 1 }
"#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.bind_host, "127.0.0.1:8080");
        let services = config.services.to_vec();
        assert_eq!(services[0].match_host, "a.example.com");
        assert_eq!(services[0].wake.as_ref().unwrap().cooldown_minutes, Some(1));
    }

    #[test]
    fn test_defaults() {
        let toml = r#"
bind_host = "0.0.0.0:80"

[[services]]
match_host = "a.example.com"
target = "http://10.0.0.5:3000"
"#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.pool_max_idle_per_host, 10);
        assert_eq!(config.pool_idle_timeout(), Duration::from_secs(90));
        assert_eq!(
            config.wake_broadcast_addr(),
            Some("255.255.255.255:9".parse().unwrap())
        );
        assert!(config.info_host().is_none());
    }

    #[test]
    fn test_blank_bind_host_rejected() {
        let toml = r#"
[[services]]
match_host = "a.example.com"
target = "http://10.0.0.5:3000"
"#;
        assert!(matches!(check(toml), Err(ConfigError::BlankBindHost)));
    }

    #[test]
    fn test_empty_services_rejected() {
        assert!(matches!(
            check(r#"bind_host = ":80""#),
            Err(ConfigError::NoServices)
        ));
        assert!(matches!(
            check("bind_host = \":80\"\nservices = []"),
            Err(ConfigError::NoServices)
        ));
    }

    #[test]
    fn test_duplicate_match_hosts_all_reported() {
        let toml = r#"
bind_host = ":80"

[[services]]
match_host = "a.example.com"
target = "http://10.0.0.1"

[[services]]
match_host = "a.example.com"
target = "http://10.0.0.2"

[[services]]
match_host = "b.example.com"
target = "http://10.0.0.3"

[[services]]
match_host = "b.example.com"
target = "http://10.0.0.4"
"#;

        let err = check(toml).unwrap_err().to_string();
        assert!(err.contains("'a.example.com' in services 0 and 1"), "{}", err);
        assert!(err.contains("'b.example.com' in services 2 and 3"), "{}", err);
    }

    #[test]
    fn test_missing_fields_reported_together() {
        let toml = r#"
bind_host = ":80"

[[services]]
target = "http://10.0.0.1"

[[services]]
match_host = "b.example.com"

[[services]]
match_host = "c.example.com"
target = "http://10.0.0.3"
wake = { cooldown_minutes = -1 }
"#;

        let err = check(toml).unwrap_err().to_string();
        assert!(err.contains("service 0: match_host can't be blank"), "{}", err);
        assert!(err.contains("service 1: target can't be blank"), "{}", err);
        assert!(err.contains("service 2: invalid wake info"), "{}", err);
    }

    #[test]
    fn test_info_host_collision_rejected() {
        let toml = r#"
bind_host = ":80"
info_host = "a.example.com"

[[services]]
match_host = "a.example.com"
target = "http://10.0.0.1"
"#;

        let err = check(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("info_host 'a.example.com'"));
    }

    #[test]
    fn test_info_host_collision_ignores_port() {
        let toml = r#"
bind_host = ":80"
info_host = "a.example.com"

[[services]]
id = "a"
match_host = "a.example.com:8080"
target = "http://10.0.0.1"

[[services]]
id = "b"
match_host = "b.example.com"
target = "http://10.0.0.2"
"#;

        let err = check(toml).unwrap_err().to_string();
        assert!(err.contains("match_host 'a.example.com:8080' of service 0 ('a')"), "{}", err);
        assert!(!err.contains("service 1"), "{}", err);

        let toml = r#"
bind_host = ":80"
info_host = "a.example.com:8080"

[[services]]
match_host = "a.example.com"
target = "http://10.0.0.1"
"#;
        let err = check(toml).unwrap_err().to_string();
        assert!(err.contains("info_host 'a.example.com:8080'"), "{}", err);
    }

    #[test]
    fn test_info_host_on_other_port_of_ported_route_is_allowed() {
        let toml = r#"
bind_host = ":80"
info_host = "a.example.com:9000"

[[services]]
match_host = "a.example.com:8080"
target = "http://10.0.0.1"
"#;
        assert!(check(toml).is_ok());
    }

    #[test]
    fn test_config_and_route_problems_reported_together() {
        let toml = r#"
bind_host = ":80"
info_host = "info.example.com"
request_timeout_secs = 0

[[services]]
match_host = "info.example.com"
target = "http://10.0.0.1"

[[services]]
match_host = "a.example.com"
target = "http://10.0.0.2"

[[services]]
match_host = "a.example.com"
target = "http://10.0.0.3"
"#;

        let err = check(toml).unwrap_err();
        let ConfigError::Invalid(lines) = &err else {
            panic!("expected Invalid, got {:?}", err);
        };
        assert_eq!(lines.len(), 3, "{:?}", lines);
        let text = err.to_string();
        assert!(text.contains("request_timeout_secs"), "{}", text);
        assert!(text.contains("info_host 'info.example.com'"), "{}", text);
        assert!(text.contains("'a.example.com' in services 1 and 2"), "{}", text);
    }

    #[test]
    fn test_service_field_type_error_is_specific() {
        let toml = r#"
bind_host = ":80"

[[services]]
match_host = "a.example.com"
target = 5
"#;
        let err = Config::parse(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        let text = err.to_string();
        assert!(text.contains("invalid type"), "{}", text);
        assert!(!text.contains("did not match any variant"), "{}", text);

        let toml = r#"
bind_host = ":80"

[services.a]
match_host = "a.example.com"
target = "http://10.0.0.1"
wake = { hardware_address = 7 }
"#;
        let text = Config::parse(toml).unwrap_err().to_string();
        assert!(text.contains("invalid type"), "{}", text);
    }

    #[test]
    fn test_services_must_be_array_or_table() {
        let err = Config::parse("bind_host = \":80\"\nservices = \"nope\"")
            .unwrap_err()
            .to_string();
        assert!(err.contains("an array of services or a table"), "{}", err);
    }

    #[test]
    fn test_bad_wake_broadcast_rejected() {
        let toml = r#"
bind_host = ":80"
wake_broadcast = "not an address"

[[services]]
match_host = "a.example.com"
target = "http://10.0.0.1"
"#;

        let err = check(toml).unwrap_err().to_string();
        assert!(err.contains("wake_broadcast"));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        assert!(matches!(
            Config::parse("bind_host = "),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
bind_host = "0.0.0.0:8080"

[[services]]
match_host = "a.example.com"
target = "http://10.0.0.5:3000"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert!(config.validate(Utc::now()).unwrap().lookup("a.example.com").is_some());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_service_config_builders() {
        let s = ServiceConfig::new("a.example.com", "http://10.0.0.5:3000")
            .with_id("a")
            .with_wake("AA:BB:CC:DD:EE:FF", Some(1));
        assert_eq!(s.id.as_deref(), Some("a"));
        assert_eq!(s.wake.unwrap().cooldown_minutes, Some(1));
    }
}
