//! Creating comms instances and keeping track of the brokers that own them.

use crate::{
    broker::CommsBroker,
    comms::{Comms, CommsInterface},
    config::NetworkBrokerData,
    transports::{FabricTransport, InprocTransport, QueueRegistry, TcpTransport, UdpTransport},
    trip_wire::TripWire,
};
use dashmap::{mapref::entry::Entry, DashMap};
use std::{fmt, str::FromStr, sync::Arc};
use thiserror::Error as ThisError;

/// The available transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommsKind {
    Tcp,
    Udp,
    Fabric,
    Inproc,
}

impl CommsKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Fabric => "fabric",
            Self::Inproc => "inproc",
        }
    }
}

impl FromStr for CommsKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "stream" => Ok(Self::Tcp),
            "udp" | "datagram" => Ok(Self::Udp),
            "fabric" | "push_pull" => Ok(Self::Fabric),
            "inproc" | "local" | "test" => Ok(Self::Inproc),
            _ => Err(RegistryError::UnknownKind(s.to_string())),
        }
    }
}

impl fmt::Display for CommsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum RegistryError {
    #[error("A broker named {0} is already registered")]
    NameTaken(String),
    #[error("Unknown comms type: {0}")]
    UnknownKind(String),
}

/// Everything the comms instances of one process share: the trip wire, the
/// local queues, and the brokers by name. Clones share all three.
#[derive(Debug, Clone, Default)]
pub struct CommsRegistry {
    trip_wire: TripWire,
    queues: QueueRegistry,
    brokers: Arc<DashMap<String, Arc<CommsBroker>>>,
}

impl CommsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip_wire(&self) -> &TripWire {
        &self.trip_wire
    }

    pub fn queues(&self) -> &QueueRegistry {
        &self.queues
    }

    /// Builds a configured, unconnected comms instance.
    pub fn create(&self, kind: CommsKind, info: &NetworkBrokerData) -> Arc<dyn Comms> {
        let trip_wire = self.trip_wire.clone();
        let comms: Arc<dyn Comms> = match kind {
            CommsKind::Tcp => Arc::new(CommsInterface::with_trip_wire(TcpTransport::new(), trip_wire)),
            CommsKind::Udp => Arc::new(CommsInterface::with_trip_wire(UdpTransport::new(), trip_wire)),
            CommsKind::Fabric => {
                Arc::new(CommsInterface::with_trip_wire(FabricTransport::new(), trip_wire))
            }
            CommsKind::Inproc => Arc::new(CommsInterface::with_trip_wire(
                InprocTransport::new(self.queues.clone()),
                trip_wire,
            )),
        };
        comms.load_network_info(info);
        comms
    }

    pub fn register(&self, name: &str, broker: Arc<CommsBroker>) -> Result<(), RegistryError> {
        match self.brokers.entry(name.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::NameTaken(name.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(broker);
                Ok(())
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<Arc<CommsBroker>> {
        self.brokers.get(name).map(|broker| broker.value().clone())
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<CommsBroker>> {
        self.brokers.remove(name).map(|(_, broker)| broker)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.brokers.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Tears down and forgets every registered broker.
    pub async fn teardown_all(&self) {
        for name in self.names() {
            if let Some(broker) = self.unregister(&name) {
                broker.teardown().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse() {
        assert_eq!("TCP".parse::<CommsKind>(), Ok(CommsKind::Tcp));
        assert_eq!("push_pull".parse::<CommsKind>(), Ok(CommsKind::Fabric));
        assert_eq!("local".parse::<CommsKind>(), Ok(CommsKind::Inproc));
        assert_eq!(
            "smoke".parse::<CommsKind>(),
            Err(RegistryError::UnknownKind("smoke".into()))
        );
        assert_eq!(CommsKind::Udp.to_string(), "udp");
    }

    #[tokio::test]
    async fn names_are_unique() {
        let registry = CommsRegistry::new();
        let info = NetworkBrokerData {
            broker_name: "root".into(),
            ..Default::default()
        };
        let first = Arc::new(CommsBroker::new("a", registry.create(CommsKind::Inproc, &info)));
        let second = Arc::new(CommsBroker::new("a", registry.create(CommsKind::Inproc, &info)));
        registry.register("a", first).unwrap();
        assert_eq!(
            registry.register("a", second.clone()),
            Err(RegistryError::NameTaken("a".into()))
        );
        assert!(registry.find("a").is_some());
        assert_eq!(registry.names(), vec!["a".to_string()]);

        registry.teardown_all().await;
        second.teardown().await;
        assert!(registry.names().is_empty());
    }
}
