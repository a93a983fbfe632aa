//! Supervisor configuration, read from TOML
//!
//! ```toml
//! broker = "mqtt.example.com:8883"
//! client_id = "ingest-1"
//! topics = ["sensors/#", "status/+"]
//! retention_secs = 86400
//!
//! [tls]
//! ca_file = "/etc/mqtt/ca.pem"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::{
    ConnectOptions, QoS, TlsOptions, DEFAULT_PORT, DEFAULT_SECURE_PORT, MAX_PACKET_SIZE,
};
use crate::error::{Error, Result};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "MQTT_SESSION_CONFIG";

const APP_DIR: &str = "mqtt-session";
const CONFIG_FILE: &str = "config.toml";
const DATABASE_FILE: &str = "messages.sqlite";

pub const MIN_RETENTION: Duration = Duration::from_secs(60);
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
pub const MIN_KEEPALIVE: Duration = Duration::from_secs(5);

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct TlsConfig {
    pub ca_file: PathBuf,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Skip verification of the broker certificate
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// `host` or `host:port`
    pub broker: String,
    pub client_id: Option<String>,
    pub connect_timeout_secs: u64,
    pub keepalive_secs: u64,
    pub reconnect_interval_secs: u64,
    /// Largest accepted packet in bytes, in both directions
    pub max_packet_size: usize,
    pub user: Option<String>,
    pub password: Option<String>,
    pub tls: Option<TlsConfig>,
    /// Filters kept subscribed while connected
    pub topics: Vec<String>,
    pub qos: QoS,
    pub database: PathBuf,
    pub retention_secs: u64,
    pub event_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            broker: String::new(),
            client_id: None,
            connect_timeout_secs: 30,
            keepalive_secs: 60,
            reconnect_interval_secs: 30,
            max_packet_size: MAX_PACKET_SIZE,
            user: None,
            password: None,
            tls: None,
            topics: Vec::new(),
            qos: QoS::default(),
            database: default_database(),
            retention_secs: DEFAULT_RETENTION.as_secs(),
            event_capacity: 10_000,
        }
    }
}

fn default_database() -> PathBuf {
    let mut path = dirs::data_local_dir().unwrap_or_else(|| {
        warn!("Could not determine data directory, using current directory");
        PathBuf::from(".")
    });
    path.push(APP_DIR);
    path.push(DATABASE_FILE);
    path
}

/// `$MQTT_SESSION_CONFIG`, else `<config dir>/mqtt-session/config.toml`
pub fn default_config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    let mut path = dirs::config_dir().unwrap_or_else(|| {
        warn!("Could not determine config directory, using current directory");
        PathBuf::from(".")
    });
    path.push(APP_DIR);
    path.push(CONFIG_FILE);
    path
}

impl SupervisorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Reading configuration from {}", path.display());
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml(&content)?;
        info!("Loaded configuration for broker {}", config.broker);
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.validate()?;
        config.apply_retention_floor();
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.endpoint()?;
        if self.connect_timeout_secs == 0 {
            return Err(Error::BadParameter("connect_timeout_secs must be positive".into()));
        }
        if self.reconnect_interval_secs == 0 {
            return Err(Error::BadParameter(
                "reconnect_interval_secs must be positive".into(),
            ));
        }
        if self.keepalive() < MIN_KEEPALIVE {
            return Err(Error::BadParameter(format!(
                "keepalive_secs must be at least {}",
                MIN_KEEPALIVE.as_secs()
            )));
        }
        if self.max_packet_size == 0 || self.max_packet_size > MAX_PACKET_SIZE {
            return Err(Error::BadParameter(format!(
                "max_packet_size must be between 1 and {}",
                MAX_PACKET_SIZE
            )));
        }
        if self.user.is_some() && self.password.is_none() {
            return Err(Error::BadParameter("user given without password".into()));
        }
        if let Some(tls) = &self.tls {
            if tls.cert_file.is_some() != tls.key_file.is_some() {
                return Err(Error::BadParameter(
                    "tls.cert_file and tls.key_file must be given together".into(),
                ));
            }
        }
        if let Some(filter) = self.topics.iter().find(|t| t.trim().is_empty()) {
            return Err(Error::BadParameter(format!("empty topic filter {:?}", filter)));
        }
        if self.event_capacity == 0 {
            return Err(Error::BadParameter("event_capacity must be positive".into()));
        }
        Ok(())
    }

    /// Host and port, with the default port chosen by TLS
    pub fn endpoint(&self) -> Result<(String, u16)> {
        let broker = self.broker.trim();
        if broker.is_empty() {
            return Err(Error::BadParameter("broker is required".into()));
        }
        let default_port = if self.tls.is_some() {
            DEFAULT_SECURE_PORT
        } else {
            DEFAULT_PORT
        };
        match broker.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|e| Error::BadParameter(format!("broker port {:?}: {}", port, e)))?;
                Ok((host.to_string(), port))
            }
            Some(_) => Err(Error::BadParameter(format!("broker host missing in {:?}", broker))),
            None => Ok((broker.to_string(), default_port)),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    /// Retention window; anything under a minute means the default
    pub fn retention(&self) -> Duration {
        let retention = Duration::from_secs(self.retention_secs);
        if retention < MIN_RETENTION {
            return DEFAULT_RETENTION;
        }
        retention
    }

    /// Rewrites a retention window below the minimum to the default
    pub fn apply_retention_floor(&mut self) {
        let retention = Duration::from_secs(self.retention_secs);
        if retention < MIN_RETENTION {
            warn!(
                "Retention of {:?} is below the minimum, using {:?}",
                retention, DEFAULT_RETENTION
            );
            self.retention_secs = DEFAULT_RETENTION.as_secs();
        }
    }

    /// Connection identity for a new session
    pub fn connect_options(&self) -> Result<ConnectOptions> {
        let (host, port) = self.endpoint()?;
        let client_id = self
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("{}-{}", APP_DIR, std::process::id()));

        let mut options = ConnectOptions::new(client_id, host, port);
        options.keepalive = self.keepalive();
        options.max_packet_size = self.max_packet_size;
        if let (Some(user), Some(password)) = (&self.user, &self.password) {
            options.credentials = Some((user.clone(), password.clone()));
        }
        options.tls = self.tls.as_ref().map(|tls| TlsOptions {
            ca_file: tls.ca_file.clone(),
            cert_file: tls.cert_file.clone(),
            key_file: tls.key_file.clone(),
            insecure: tls.insecure,
        });
        Ok(options)
    }
}
