//! Connection configuration for a comms instance.
//!
//! [`NetworkBrokerData`] is usually loaded from a TOML file:
//!
//! ```
//! # use cosim_comms_core::config::{NetworkBrokerData, InterfaceNetworks, ServerMode};
//! let config = NetworkBrokerData::from_toml_str(r#"
//!     broker_address = "10.0.0.4:24160"
//!     local_interface = "10.0.0.9"
//!     max_retries = 2
//!     interface_network = "ipv4"
//!     server_mode = "default_deactivated"
//! "#).unwrap();
//! assert_eq!(config.max_retries, 2);
//! assert_eq!(config.interface_network, InterfaceNetworks::Ipv4);
//! assert_eq!(config.server_mode, ServerMode::DefaultDeactivated);
//! assert_eq!(config.port_number, None);
//! ```

use crate::{
    address::{extract_interface_and_port, strip_protocol},
    comms::{DEFAULT_MAX_MESSAGE_COUNT, DEFAULT_MAX_MESSAGE_SIZE},
};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use thiserror::Error as ThisError;

/// Which interfaces a comms instance may bind and connect on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceNetworks {
    #[default]
    Local,
    Ipv4,
    Ipv6,
    All,
}

/// Whether a node opens the extra listener needed to serve sub-brokers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    /// Keep whatever the comms instance already uses
    #[default]
    Unspecified,
    DefaultActive,
    DefaultDeactivated,
    Active,
    Deactivated,
}

impl ServerMode {
    /// Resolves the mode against the current setting.
    pub fn apply(self, current: bool) -> bool {
        match self {
            Self::Unspecified => current,
            Self::DefaultActive | Self::Active => true,
            Self::DefaultDeactivated | Self::Deactivated => false,
        }
    }
}

/// Everything a networked comms instance needs to know before connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkBrokerData {
    pub broker_name: String,
    pub broker_address: String,
    pub local_interface: String,
    pub broker_init_string: String,
    /// Stands in for the broker address when a broker connection is
    /// required, otherwise for the local interface
    pub connection_address: String,
    /// The local port. `None` lets the broker or the transport pick one.
    pub port_number: Option<u16>,
    pub broker_port: Option<u16>,
    /// Same as `connection_address`, for the broker port or the local port
    pub connection_port: Option<u16>,
    /// First port handed to sub-brokers
    pub port_start: Option<u16>,
    pub max_message_size: usize,
    pub max_message_count: usize,
    pub max_retries: u32,
    pub connection_timeout_ms: u64,
    pub interface_network: InterfaceNetworks,
    pub server_mode: ServerMode,
    pub reuse_address: bool,
    pub use_os_port: bool,
    /// Start a local broker if the named one does not exist
    pub autobroker: bool,
    pub append_name_to_address: bool,
    pub no_ack_connection: bool,
}

impl Default for NetworkBrokerData {
    fn default() -> Self {
        Self {
            broker_name: String::new(),
            broker_address: String::new(),
            local_interface: String::new(),
            broker_init_string: String::new(),
            connection_address: String::new(),
            port_number: None,
            broker_port: None,
            connection_port: None,
            port_start: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_message_count: DEFAULT_MAX_MESSAGE_COUNT,
            max_retries: 5,
            connection_timeout_ms: 4000,
            interface_network: InterfaceNetworks::Local,
            server_mode: ServerMode::Unspecified,
            reuse_address: false,
            use_os_port: false,
            autobroker: false,
            append_name_to_address: false,
            no_ack_connection: false,
        }
    }
}

impl NetworkBrokerData {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Moves a port embedded in the broker address into `broker_port` and
    /// drops a leading `protocol://` matching this transport.
    pub fn check_broker_address(&mut self, protocol: &str) {
        let prefix = format!("{protocol}://");
        if let Some(stripped) = self.broker_address.strip_prefix(&prefix) {
            self.broker_address = stripped.to_string();
        }
        let (host, port) = extract_interface_and_port(&self.broker_address);
        if let Some(port) = port {
            self.broker_address = host;
            if self.broker_port.is_none() {
                self.broker_port = Some(port);
            }
        }
        if strip_protocol(&self.broker_address).is_empty() {
            self.broker_address.clear();
        }
    }

    /// Uses `connection_address` for whichever address is missing.
    pub fn fill_connection_address(&mut self, require_broker: bool) {
        if self.connection_address.is_empty() {
            return;
        }
        let target = if require_broker {
            &mut self.broker_address
        } else {
            &mut self.local_interface
        };
        if target.is_empty() {
            *target = self.connection_address.clone();
        }
    }

    /// Uses `connection_port` for whichever port is missing. Run after
    /// [`NetworkBrokerData::check_broker_address`] so a port in the broker
    /// address wins.
    pub fn fill_connection_port(&mut self, require_broker: bool) {
        let target = if require_broker {
            &mut self.broker_port
        } else {
            &mut self.port_number
        };
        if target.is_none() {
            *target = self.connection_port;
        }
    }
}

#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}
