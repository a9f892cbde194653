//! The transport and routing core of a distributed co-simulation platform.
//!
//! Brokers, cores, and federates exchange [`ActionMessage`]s over pluggable
//! transports. This crate owns the wire format of those messages, the
//! lifecycle of a connection (bind, handshake, disconnect, reconnect), and the
//! table that maps logical routes to transport endpoints.
//!
//! # Organization
//! - [`ActionMessage`](message::ActionMessage) and [`Action`] define what
//!   travels between nodes, with [`message::framing`] for the byte layout
//! - [`Transport`] is what a transport implements; [`CommsInterface`] drives
//!   any transport through its lifecycle and is used through the object safe
//!   [`Comms`] trait
//! - [`NetworkComms`] negotiates ports for the IP transports
//! - [`transports`] holds the stream, datagram, fabric, and local queue
//!   transports
//! - [`CommsBroker`] and [`CommsRegistry`] own comms instances on behalf of
//!   brokers
//!
//! # Routing
//!
//! Every outbound message names a [`RouteId`]. [`RouteId::PARENT`] goes to the
//! broker this node connected to and [`RouteId::CONTROL`] to the node's own
//! transport; every other id is looked up in the transmit task's
//! [`RouteTable`], falling back to the broker when unknown. Routes are added
//! with [`Comms::add_route`], whose route information is the
//! [`Comms::address`] of the peer.

mod logging;

pub mod address;

pub mod broker;
pub use broker::{CommsBroker, DisconnectStage};

pub mod comms;
pub use comms::{Comms, CommsContext, CommsInterface, CommsProperties, MessageCallback, Transport};

pub mod config;
pub use config::{ConfigError, NetworkBrokerData};

pub mod message;
pub use message::{Action, ActionMessage, ProtocolCommand};

pub mod network;
pub use network::NetworkComms;

pub mod ports;
pub use ports::PortAllocator;

pub mod queue;
pub use queue::TxQueue;

pub mod registry;
pub use registry::{CommsKind, CommsRegistry, RegistryError};

pub mod route;
pub use route::{RouteId, RouteTable};

pub mod status;
pub use status::ConnectionStatus;

pub mod transports;

pub mod trip_wire;
pub use trip_wire::TripWire;
