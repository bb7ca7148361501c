use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Free-form configuration handed to a module's `init`
pub type ModuleConfig = Map<String, Value>;

/// One entry of a listener's module chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    #[serde(default)]
    pub config: ModuleConfig,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ModuleConfig::new(),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Unique listener name, used in logs and metrics
    pub name: String,
    /// Transport: "udp", "rpc" or "push"
    #[serde(rename = "type")]
    pub listener_type: String,
    /// Transport-specific settings (e.g. `Port`)
    #[serde(default)]
    pub extra: Map<String, Value>,
    /// Ordered module chain, first entry outermost
    #[serde(default)]
    pub modules: Vec<ModuleDescriptor>,
}

impl ListenerConfig {
    pub fn new(name: impl Into<String>, listener_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listener_type: listener_type.into(),
            extra: Map::new(),
            modules: Vec::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn with_module(mut self, module: ModuleDescriptor) -> Self {
        self.modules.push(module);
        self
    }

    /// Unsigned integer from `extra`; numbers encoded as strings are accepted
    pub fn extra_u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.extra.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| self.invalid(key)),
            Some(Value::String(s)) => s.parse().map(Some).map_err(|_| self.invalid(key)),
            Some(_) => Err(self.invalid(key)),
        }
    }

    pub fn extra_str(&self, key: &str) -> Result<Option<&str>, ConfigError> {
        match self.extra.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(self.invalid(key)),
        }
    }

    /// `Address` + `Port` from `extra`; `Port` is required, `Address`
    /// defaults to all interfaces
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let port = self
            .extra_u64("Port")?
            .ok_or_else(|| ConfigError::Invalid(format!("listener {}: missing Port", self.name)))?;
        let port = u16::try_from(port).map_err(|_| self.invalid("Port"))?;
        let address: IpAddr = self
            .extra_str("Address")?
            .unwrap_or("0.0.0.0")
            .parse()
            .map_err(|_| self.invalid("Address"))?;
        Ok(SocketAddr::new(address, port))
    }

    fn invalid(&self, key: &str) -> ConfigError {
        ConfigError::Invalid(format!("listener {}: invalid value for {}", self.name, key))
    }
}

/// Authorized NAS client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    /// IP address or CIDR network
    pub address: String,
    /// Per-client shared secret; the server secret is used when absent
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Client {
    pub fn parse_network(&self) -> Result<IpNetwork, ConfigError> {
        if let Ok(network) = self.address.parse::<IpNetwork>() {
            return Ok(network);
        }
        if let Ok(ip) = self.address.parse::<IpAddr>() {
            return Ok(IpNetwork::from(ip));
        }
        Err(ConfigError::Invalid(format!(
            "Invalid client address: {}",
            self.address
        )))
    }

}

/// Enabled clients with their networks parsed once
#[derive(Debug, Clone, Default)]
pub struct ClientTable {
    entries: Vec<(IpNetwork, Client)>,
}

impl ClientTable {
    pub fn new(clients: &[Client]) -> Result<Self, ConfigError> {
        let entries = clients
            .iter()
            .filter(|client| client.enabled)
            .map(|client| Ok((client.parse_network()?, client.clone())))
            .collect::<Result<_, ConfigError>>()?;
        Ok(Self { entries })
    }

    /// First client whose network contains `source_ip`
    pub fn find(&self, source_ip: IpAddr) -> Option<&Client> {
        self.entries
            .iter()
            .find(|(network, _)| network.contains(source_ip))
            .map(|(_, client)| client)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Backing store for per-session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStorageConfig {
    #[serde(default = "default_storage_type")]
    pub storage_type: String,
    /// Entries not written for this long are dropped; unset keeps them forever
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

fn default_storage_type() -> String {
    "memory".to_string()
}

impl Default for SessionStorageConfig {
    fn default() -> Self {
        Self {
            storage_type: default_storage_type(),
            ttl_secs: None,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Shared secret for NAS traffic and synthesized CoA requests
    #[serde(default = "default_secret")]
    pub secret: String,

    /// Window during which a repeated (address, identifier) pair is a retransmission
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,

    /// Filters run in order before every module chain
    #[serde(default)]
    pub filters: Vec<String>,

    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,

    #[serde(default)]
    pub session_storage: SessionStorageConfig,

    /// Clients accepted by the `client_allowlist` filter
    #[serde(default)]
    pub clients: Vec<Client>,

    /// Log level: "trace", "debug", "info", "warn", "error" (default: "info")
    #[serde(default)]
    pub log_level: Option<String>,

    /// Address of the Prometheus scrape endpoint, disabled when unset
    #[serde(default)]
    pub metrics_address: Option<String>,
}

fn default_secret() -> String {
    "testing123".to_string()
}

fn default_dedup_window_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Config {
            secret: default_secret(),
            dedup_window_ms: default_dedup_window_ms(),
            filters: vec![],
            listeners: vec![],
            session_storage: SessionStorageConfig::default(),
            clients: vec![],
            log_level: None,
            metrics_address: None,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn metrics_socket_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.metrics_address
            .as_deref()
            .map(|addr| {
                addr.parse()
                    .map_err(|_| ConfigError::Invalid(format!("Invalid metrics address: {}", addr)))
            })
            .transpose()
    }

    /// The shared secret was left at its built-in default
    pub fn uses_default_secret(&self) -> bool {
        self.secret == default_secret()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::Invalid("Secret cannot be empty".to_string()));
        }

        if self.dedup_window_ms == 0 {
            return Err(ConfigError::Invalid(
                "dedup_window_ms must be greater than 0".to_string(),
            ));
        }

        if self.session_storage.storage_type != "memory" {
            return Err(ConfigError::Invalid(format!(
                "Unsupported session storage type: {}",
                self.session_storage.storage_type
            )));
        }

        let mut names = HashSet::new();
        for listener in &self.listeners {
            if !names.insert(listener.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate listener name: {}",
                    listener.name
                )));
            }
        }

        for client in &self.clients {
            client.parse_network()?;
        }

        self.metrics_socket_addr()?;

        Ok(())
    }

    /// Configuration written out when the server starts without a config file
    pub fn example() -> Self {
        let chain = |names: &[&str]| -> Vec<ModuleDescriptor> {
            names.iter().map(|n| ModuleDescriptor::new(*n)).collect()
        };

        Config {
            secret: "testing123".to_string(),
            dedup_window_ms: 1000,
            filters: vec!["client_allowlist".to_string()],
            listeners: vec![
                ListenerConfig {
                    name: "auth".to_string(),
                    listener_type: "udp".to_string(),
                    extra: json!({ "Port": 1812 }).as_object().cloned().unwrap_or_default(),
                    modules: chain(&["sessiontracker", "testloopback"]),
                },
                ListenerConfig {
                    name: "acct".to_string(),
                    listener_type: "udp".to_string(),
                    extra: json!({ "Port": 1813 }).as_object().cloned().unwrap_or_default(),
                    modules: chain(&["sessiontracker", "testloopback"]),
                },
                ListenerConfig {
                    name: "coa".to_string(),
                    listener_type: "rpc".to_string(),
                    extra: json!({ "Port": 9108, "Address": "127.0.0.1" })
                        .as_object()
                        .cloned()
                        .unwrap_or_default(),
                    modules: chain(&["testloopback"]),
                },
            ],
            session_storage: SessionStorageConfig {
                storage_type: "memory".to_string(),
                ttl_secs: Some(86400),
            },
            clients: vec![Client {
                address: "192.168.1.0/24".to_string(),
                secret: None,
                name: Some("Access points".to_string()),
                enabled: true,
            }],
            log_level: Some("info".to_string()),
            metrics_address: Some("127.0.0.1:9100".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.dedup_window(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.secret = "".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.dedup_window_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.session_storage.storage_type = "cassandra".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_listener_names_rejected() {
        let mut config = Config::default();
        config.listeners = vec![
            ListenerConfig::new("l0", "udp").with_extra("Port", 1812),
            ListenerConfig::new("l0", "udp").with_extra("Port", 1813),
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_example_is_valid() {
        assert!(Config::example().validate().is_ok());
    }

    #[test]
    fn test_parse_listener_json() {
        let config: Config = serde_json::from_str(
            r#"{
                "secret": "123456",
                "dedup_window_ms": 100,
                "filters": ["filter.1"],
                "listeners": [{
                    "name": "listener.0",
                    "type": "udp",
                    "extra": { "Port": 2000 },
                    "modules": [{ "name": "module.auth.1" }, { "name": "module.auth.2", "config": { "k": 1 } }]
                }]
            }"#,
        )
        .unwrap();

        let listener = &config.listeners[0];
        assert_eq!(listener.listener_type, "udp");
        assert_eq!(listener.modules.len(), 2);
        assert_eq!(listener.modules[1].config["k"], 1);
        assert_eq!(listener.bind_addr().unwrap(), "0.0.0.0:2000".parse().unwrap());
        assert_eq!(config.session_storage.storage_type, "memory");
    }

    #[test]
    fn test_listener_extra_values() {
        let listener = ListenerConfig::new("push", "push")
            .with_extra("ResponseTimeoutMs", "250")
            .with_extra("EventsUrl", "http://127.0.0.1/events")
            .with_extra("Port", true);

        assert_eq!(listener.extra_u64("ResponseTimeoutMs").unwrap(), Some(250));
        assert_eq!(listener.extra_u64("Missing").unwrap(), None);
        assert_eq!(
            listener.extra_str("EventsUrl").unwrap(),
            Some("http://127.0.0.1/events")
        );
        assert!(listener.extra_u64("Port").is_err());
        assert!(listener.bind_addr().is_err());
    }

    #[test]
    fn test_bind_addr_requires_port() {
        let listener = ListenerConfig::new("udp", "udp").with_extra("Address", "127.0.0.1");
        assert!(listener.bind_addr().is_err());

        let listener = listener.with_extra("Port", 70000);
        assert!(listener.bind_addr().is_err());
    }

    #[test]
    fn test_client_parse_network() {
        let client = Client {
            address: "192.168.1.0/24".to_string(),
            secret: None,
            name: None,
            enabled: true,
        };
        let network = client.parse_network().unwrap();
        assert!(network.contains("192.168.1.254".parse().unwrap()));
        assert!(!network.contains("192.168.2.1".parse().unwrap()));

        let single = Client {
            address: "10.0.0.1".to_string(),
            ..client.clone()
        };
        let network = single.parse_network().unwrap();
        assert!(network.contains("10.0.0.1".parse().unwrap()));
        assert!(!network.contains("10.0.0.2".parse().unwrap()));

        let invalid = Client {
            address: "invalid".to_string(),
            ..client
        };
        assert!(invalid.parse_network().is_err());
    }

    #[test]
    fn test_client_table_lookup() {
        let clients = vec![
            Client {
                address: "192.168.1.0/24".to_string(),
                secret: Some("client_secret".to_string()),
                name: Some("aps".to_string()),
                enabled: true,
            },
            Client {
                address: "10.0.0.0/8".to_string(),
                secret: Some("disabled_secret".to_string()),
                name: None,
                enabled: false,
            },
            Client {
                address: "192.168.0.0/16".to_string(),
                secret: None,
                name: Some("campus".to_string()),
                enabled: true,
            },
        ];

        let table = ClientTable::new(&clients).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table
                .find("192.168.1.50".parse().unwrap())
                .and_then(|c| c.name.as_deref()),
            Some("aps")
        );
        assert_eq!(
            table
                .find("192.168.7.1".parse().unwrap())
                .and_then(|c| c.name.as_deref()),
            Some("campus")
        );
        assert!(table.find("10.0.0.1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_client_table_rejects_invalid_address() {
        let clients = vec![Client {
            address: "not-an-address".to_string(),
            secret: None,
            name: None,
            enabled: true,
        }];
        assert!(ClientTable::new(&clients).is_err());
        assert!(ClientTable::new(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_uses_default_secret() {
        assert!(Config::default().uses_default_secret());
        assert!(Config::example().uses_default_secret());

        let config = Config {
            secret: "s3cr3t".to_string(),
            ..Default::default()
        };
        assert!(!config.uses_default_secret());

        let parsed: Config = serde_json::from_str(r#"{"listeners": []}"#).unwrap();
        assert!(parsed.uses_default_secret());
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("radius.json");

        Config::example().to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.listeners.len(), 3);
        assert_eq!(loaded.filters, vec!["client_allowlist".to_string()]);
    }
}
