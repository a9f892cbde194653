//! A named comms instance together with the application driving it.

use cosim_comms_core::{
    ActionMessage, CommsBroker, CommsKind, CommsRegistry, NetworkBrokerData, RegistryError,
    RouteId, TripWire,
};
use rand::Rng;
use std::sync::Arc;
use thiserror::Error as ThisError;
use tokio::sync::mpsc;

/// Something that runs on a node and reacts to the messages it receives.
pub trait Application: Send + Sync + 'static {
    /// Called once, after the node has connected.
    fn start(&self, node: &NodeHandle) -> Result<(), NodeError>;

    /// Called for every message delivered to the node, in arrival order.
    fn receive(&self, message: ActionMessage, node: &NodeHandle);
}

#[derive(Debug, ThisError)]
pub enum NodeError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("{name} failed to connect over {kind}")]
    ConnectFailed { name: String, kind: CommsKind },
    #[error("Application failed to start: {0}")]
    Start(String),
}

/// What an application sees of its node.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    broker: Arc<CommsBroker>,
    trip_wire: TripWire,
    id: i32,
    address: String,
}

impl NodeHandle {
    /// A random positive id, usable as a route id by peers.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// How other nodes reach this one.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn name(&self) -> &str {
        self.broker.name()
    }

    /// Sends `message` on `route`, stamped with this node's id.
    pub fn send(&self, route: RouteId, mut message: ActionMessage) {
        message.source_id = self.id;
        self.broker.transmit(route, message);
    }

    pub fn add_route(&self, route: RouteId, route_info: &str) {
        self.broker.add_route(route, route_info);
    }

    /// Stops the node and every other node sharing its registry.
    pub fn shut_down(&self) {
        self.trip_wire.trip();
    }
}

pub struct Node {
    kind: CommsKind,
    broker: Arc<CommsBroker>,
    registry: CommsRegistry,
}

impl Node {
    /// Creates the comms instance for `name` and registers it.
    pub async fn new(
        registry: &CommsRegistry,
        kind: CommsKind,
        name: &str,
        info: &NetworkBrokerData,
    ) -> Result<Self, NodeError> {
        let comms = registry.create(kind, info);
        comms.set_name(name);
        let broker = Arc::new(CommsBroker::new(name, comms));
        if let Err(e) = registry.register(name, broker.clone()) {
            broker.teardown().await;
            return Err(e.into());
        }
        Ok(Self {
            kind,
            broker,
            registry: registry.clone(),
        })
    }

    pub fn name(&self) -> &str {
        self.broker.name()
    }

    /// Connects, starts `application`, and feeds it messages until the trip
    /// wire is tripped. The comms instance is torn down before returning.
    pub async fn run(self, application: Arc<dyn Application>) -> Result<(), NodeError> {
        let (inbox, mut messages) = mpsc::unbounded_channel();
        self.broker.set_callback(Arc::new(move |message| {
            // The receiver only goes away once the node is shutting down
            let _ = inbox.send(message);
        }));

        let result = self.serve(application, &mut messages).await;
        self.registry.unregister(self.name());
        self.broker.teardown().await;
        result
    }

    async fn serve(
        &self,
        application: Arc<dyn Application>,
        messages: &mut mpsc::UnboundedReceiver<ActionMessage>,
    ) -> Result<(), NodeError> {
        if !self.broker.connect().await {
            return Err(NodeError::ConnectFailed {
                name: self.name().to_string(),
                kind: self.kind,
            });
        }
        let address = self
            .broker
            .comms()
            .map(|comms| comms.address())
            .unwrap_or_default();
        let handle = NodeHandle {
            broker: self.broker.clone(),
            trip_wire: self.registry.trip_wire().clone(),
            id: rand::thread_rng().gen_range(1..i32::MAX),
            address,
        };
        tracing::info!(
            name = %handle.name(),
            address = %handle.address(),
            "Node connected over {}",
            self.kind
        );

        application.start(&handle)?;
        let trip_wire = self.registry.trip_wire();
        loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Some(message) => application.receive(message, &handle),
                    None => break,
                },
                _ = trip_wire.wait_for_trip() => break,
            }
        }
        Ok(())
    }
}
