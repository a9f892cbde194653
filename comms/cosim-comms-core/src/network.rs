//! Address and port negotiation shared by the IP based transports.
//!
//! A node started without a broker becomes a root and takes its transport's
//! well-known port. A node given a broker asks that broker for a port with
//! `REQUEST_PORTS` and adopts the one in the `PORT_DEFINITIONS` reply. Brokers
//! hand those ports out from their [`PortAllocator`].
//!
//! The handshake itself is written once, in [`NetworkComms::handshake`], over
//! a [`HandshakeChannel`] each transport implements for its own sockets.

use crate::{
    address::{
        generate_matching_interface_address, is_loopback, make_port_address, strip_protocol,
        LOCALHOST,
    },
    comms::{CommsContext, CommsProperties},
    config::{InterfaceNetworks, NetworkBrokerData},
    message::{ActionMessage, ProtocolCommand},
    ports::PortAllocator,
    status::ConnectionStatus,
};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{sync::watch, time::Instant};

/// How long a node waits after a broker asks it to delay its connection.
pub const CONNECTION_DELAY: Duration = Duration::from_secs(2);
/// How often the handshake checks for a disconnect request while waiting.
const HANDSHAKE_POLL: Duration = Duration::from_millis(50);

/// Where the receive side is in learning its port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Pending,
    Assigned(u16),
    /// Bind to any port the OS picks
    Ephemeral,
    Failed,
}

/// Settings from configuration that only IP transports care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkSettings {
    pub max_retries: u32,
    pub use_os_port: bool,
    pub append_name_to_address: bool,
    pub no_ack_connection: bool,
    pub reuse_address: bool,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            use_os_port: false,
            append_name_to_address: false,
            no_ack_connection: false,
            reuse_address: false,
        }
    }
}

/// What a transport should do with a reply received during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// The connection is established; this node's port is known
    Established,
    /// Not a handshake reply; keep waiting
    Continue,
    /// The broker wants this node to try again later
    Delay(Duration),
    /// The broker moved; talk to this address instead
    Redirect { host: Option<String>, port: u16 },
    /// The broker refused the connection
    Refused(ConnectionStatus),
}

/// Sends and receives handshake messages on a transport's sockets.
#[async_trait::async_trait]
pub trait HandshakeChannel: Send {
    async fn send(&mut self, message: &ActionMessage) -> io::Result<()>;

    /// Waits for the next message from the broker, skipping anything that
    /// does not decode. Must be safe to cancel.
    async fn recv(&mut self) -> io::Result<ActionMessage>;

    /// Points the channel at a different broker.
    async fn redirect(&mut self, host: &str, port: u16) -> io::Result<()>;
}

/// Port bookkeeping for one IP based comms instance.
#[derive(Debug)]
pub struct NetworkComms {
    protocol: &'static str,
    default_port: u16,
    port_number: AtomicI32,
    broker_port: AtomicI32,
    auto_port_number: AtomicBool,
    has_broker: AtomicBool,
    settings: Mutex<NetworkSettings>,
    ports: Mutex<PortAllocator>,
    port_state: watch::Sender<PortState>,
}

impl NetworkComms {
    pub fn new(protocol: &'static str, default_port: u16) -> Self {
        let (port_state, _) = watch::channel(PortState::Pending);
        Self {
            protocol,
            default_port,
            port_number: AtomicI32::new(-1),
            broker_port: AtomicI32::new(-1),
            auto_port_number: AtomicBool::new(true),
            has_broker: AtomicBool::new(false),
            settings: Mutex::new(NetworkSettings::default()),
            ports: Mutex::new(PortAllocator::new()),
            port_state,
        }
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    pub fn default_port(&self) -> u16 {
        self.default_port
    }

    /// This node's port, once known.
    pub fn port(&self) -> Option<u16> {
        u16::try_from(self.port_number.load(Ordering::Acquire)).ok()
    }

    /// Records this node's port and wakes anything waiting for it.
    pub fn set_port(&self, port: u16) {
        self.port_number.store(port.into(), Ordering::Release);
        self.port_state.send_replace(PortState::Assigned(port));
    }

    /// The broker's well-known port, falling back to the transport default.
    pub fn broker_port(&self) -> u16 {
        u16::try_from(self.broker_port.load(Ordering::Acquire)).unwrap_or(self.default_port)
    }

    pub fn set_broker_port(&self, port: u16) {
        self.broker_port.store(port.into(), Ordering::Release);
    }

    pub fn auto_port(&self) -> bool {
        self.auto_port_number.load(Ordering::Acquire)
    }

    pub fn has_broker(&self) -> bool {
        self.has_broker.load(Ordering::Acquire)
    }

    pub fn set_has_broker(&self, has_broker: bool) {
        self.has_broker.store(has_broker, Ordering::Release);
    }

    pub fn settings(&self) -> NetworkSettings {
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ports(&self) -> MutexGuard<'_, PortAllocator> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish_port_state(&self, state: PortState) {
        if let PortState::Assigned(port) = state {
            self.port_number.store(port.into(), Ordering::Release);
        }
        self.port_state.send_replace(state);
    }

    pub fn port_state(&self) -> PortState {
        *self.port_state.borrow()
    }

    /// Waits until the port is no longer pending.
    pub async fn wait_for_port(&self) -> PortState {
        let mut receiver = self.port_state.subscribe();
        let state = match receiver
            .wait_for(|state| *state != PortState::Pending)
            .await
        {
            Ok(state) => *state,
            Err(_) => PortState::Failed,
        };
        state
    }

    /// Applies the network parts of a configuration. Expects the generic
    /// parts to be in `properties` already.
    pub fn load_network_info(&self, info: &NetworkBrokerData, properties: &mut CommsProperties) {
        let mut info = info.clone();
        info.fill_connection_address(properties.require_broker_connection);
        info.check_broker_address(self.protocol);
        info.fill_connection_port(properties.require_broker_connection);
        properties.broker_target = info.broker_address.clone();
        properties.local_target = strip_protocol(&info.local_interface).to_string();

        if properties.local_target.is_empty() {
            let broker = strip_protocol(&properties.broker_target);
            properties.local_target = if broker.is_empty() {
                match properties.interface_network {
                    InterfaceNetworks::Local => LOCALHOST.to_string(),
                    _ => "*".to_string(),
                }
            } else if is_loopback(broker) {
                LOCALHOST.to_string()
            } else {
                generate_matching_interface_address(broker, properties.interface_network)
            };
        }

        if let Some(port) = info.port_number {
            self.port_number.store(port.into(), Ordering::Release);
            self.auto_port_number.store(false, Ordering::Release);
        }
        if let Some(port) = info.broker_port {
            self.set_broker_port(port);
        }
        if let Some(start) = info.port_start {
            self.ports().set_starting_port(start);
        }
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = NetworkSettings {
            max_retries: info.max_retries,
            use_os_port: info.use_os_port,
            append_name_to_address: info.append_name_to_address,
            no_ack_connection: info.no_ack_connection,
            reuse_address: info.reuse_address,
        };
    }

    /// Handles the flags only IP transports know about.
    pub fn set_flag(&self, flag: &str, value: bool) -> bool {
        let mut settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner);
        match flag {
            "os_port" => settings.use_os_port = value,
            "noack_connect" => settings.no_ack_connection = value,
            "reuse_address" => settings.reuse_address = value,
            "append_name" => settings.append_name_to_address = value,
            _ => return false,
        }
        true
    }

    /// Hands out `count` consecutive ports on `host` for a sub-broker.
    ///
    /// The first call seeds the allocator from this node's own port so that
    /// nested brokers get blocks away from their parent.
    pub fn find_open_port(&self, count: u16, host: &str) -> Option<u16> {
        let mut ports = self.ports();
        if ports.starting_port().is_none() {
            let default = i32::from(self.default_port);
            let own = self
                .port()
                .map_or(default, i32::from);
            let count = i32::from(count.max(1));
            let offset = own - default;
            let start = if (0..10 * count).contains(&offset) {
                default + 10 * count * (offset + 1)
            } else {
                own + 5 * count
            };
            ports.set_starting_port(u16::try_from(start).ok()?);
        }
        ports.find_open_port(count, host)
    }

    /// Adopts the port a broker handed out in `PORT_DEFINITIONS`. Returns
    /// whether the message carried a usable port.
    pub fn load_port_definitions(&self, message: &ActionMessage) -> bool {
        if message.protocol_command() != Some(ProtocolCommand::PortDefinitions) {
            return false;
        }
        let Ok(port) = u16::try_from(message.extra_data) else {
            tracing::warn!("Ignoring invalid port definition {}", message.extra_data);
            return false;
        };
        if port == 0 {
            return false;
        }
        self.set_port(port);

        let mut ports = self.ports();
        if ports.starting_port().is_none() {
            let default = i32::from(self.default_port);
            let port = i32::from(port);
            let start = if port < default + 100 {
                default + 100 + (port - default - 2) * 6
            } else {
                default + 110 + (port - default - 100) * 6
            };
            if let Ok(start) = u16::try_from(start) {
                ports.set_starting_port(start);
            }
        }
        true
    }

    /// The reply a receive loop sends back for a protocol request, if any.
    pub fn generate_reply(&self, message: &ActionMessage) -> Option<ActionMessage> {
        match message.protocol_command()? {
            ProtocolCommand::QueryPorts => {
                let mut reply = ActionMessage::protocol(ProtocolCommand::PortDefinitions);
                reply.extra_data = self.port_number.load(Ordering::Acquire);
                Some(reply)
            }
            ProtocolCommand::RequestPorts => {
                let count = match message.counter {
                    0 => 2,
                    count => count,
                };
                let requested = message.payload_str();
                let host = match strip_protocol(&requested) {
                    "" => LOCALHOST,
                    host => host,
                };
                match self.find_open_port(count, host) {
                    Some(port) => {
                        let mut reply = ActionMessage::protocol(ProtocolCommand::PortDefinitions);
                        reply.source_id = self.port_number.load(Ordering::Acquire);
                        reply.extra_data = port.into();
                        reply.counter = message.counter;
                        Some(reply)
                    }
                    None => {
                        tracing::error!("No free ports left for {}", host);
                        Some(ActionMessage::protocol(ProtocolCommand::DisconnectError))
                    }
                }
            }
            ProtocolCommand::ConnectionRequest => {
                Some(ActionMessage::protocol(ProtocolCommand::ConnectionAck))
            }
            ProtocolCommand::Ping => Some(ActionMessage::protocol(ProtocolCommand::Pong)),
            ProtocolCommand::SetUsedPorts => {
                let host = message.payload_str();
                let host = match strip_protocol(&host) {
                    "" => LOCALHOST,
                    host => host,
                };
                let used = message
                    .strings()
                    .iter()
                    .filter_map(|port| port.parse::<u16>().ok());
                self.ports().add_used_ports(host, used);
                None
            }
            _ => None,
        }
    }

    /// A `REQUEST_PORTS` message asking for `count` ports.
    pub fn generate_port_request(&self, count: u16, properties: &CommsProperties) -> ActionMessage {
        let mut request = ActionMessage::priority_protocol(ProtocolCommand::RequestPorts);
        request.payload = strip_protocol(&properties.local_target).to_string().into();
        request.counter = count;
        request.set_string_data([
            properties.broker_name.as_str(),
            properties.broker_init_string.as_str(),
        ]);
        request
    }

    /// The first message of the handshake: ask for ports when this node has
    /// none, otherwise ask the broker to acknowledge the known port.
    pub fn connection_request(&self, properties: &CommsProperties) -> ActionMessage {
        if self.port().is_none() {
            let count = if properties.server_mode { 2 } else { 1 };
            return self.generate_port_request(count, properties);
        }
        let mut request = ActionMessage::priority_protocol(ProtocolCommand::ConnectionRequest);
        request.extra_data = self.port_number.load(Ordering::Acquire);
        request.set_string_data([
            properties.broker_name.as_str(),
            properties.broker_init_string.as_str(),
        ]);
        request
    }

    /// Classifies a reply received during the handshake, adopting any port
    /// definitions it carries.
    pub fn handshake_step(&self, reply: &ActionMessage) -> HandshakeStep {
        let Some(command) = reply.protocol_command() else {
            return HandshakeStep::Continue;
        };
        match command {
            ProtocolCommand::PortDefinitions if self.load_port_definitions(reply) => {
                HandshakeStep::Established
            }
            ProtocolCommand::ConnectionAck if self.port().is_some() => HandshakeStep::Established,
            ProtocolCommand::NewBrokerInformation => {
                let (host, port) = crate::address::extract_interface_and_port(reply.string(0));
                let host = (!host.is_empty() && host != "?").then_some(host);
                HandshakeStep::Redirect {
                    host,
                    port: port.unwrap_or_else(|| self.broker_port()),
                }
            }
            ProtocolCommand::DelayConnection => HandshakeStep::Delay(CONNECTION_DELAY),
            ProtocolCommand::Disconnect => HandshakeStep::Refused(ConnectionStatus::Terminated),
            ProtocolCommand::DisconnectError => HandshakeStep::Refused(ConnectionStatus::Error),
            _ => HandshakeStep::Continue,
        }
    }

    /// Runs the broker handshake over `channel`.
    ///
    /// Each attempt waits up to the connection timeout for a reply; after
    /// `max_retries` silent attempts the handshake fails with
    /// [`ConnectionStatus::Error`]. A disconnect request or the trip wire ends
    /// it with [`ConnectionStatus::Terminated`].
    pub async fn handshake<C>(
        &self,
        ctx: &CommsContext,
        properties: &CommsProperties,
        channel: &mut C,
    ) -> Result<(), ConnectionStatus>
    where
        C: HandshakeChannel + ?Sized,
    {
        let settings = self.settings();
        if self.port().is_some() && settings.no_ack_connection {
            return Ok(());
        }

        let mut retries = 0;
        loop {
            if ctx.should_stop() {
                return Err(ConnectionStatus::Terminated);
            }
            let request = self.connection_request(properties);
            if let Err(e) = channel.send(&request).await {
                tracing::error!("{}: failed to send connection request to broker: {}", properties.name, e);
                return Err(ConnectionStatus::Error);
            }

            let deadline = Instant::now() + properties.connection_timeout;
            let reply = loop {
                if ctx.should_stop() {
                    return Err(ConnectionStatus::Terminated);
                }
                if Instant::now() >= deadline {
                    break None;
                }
                match tokio::time::timeout(HANDSHAKE_POLL, channel.recv()).await {
                    Ok(Ok(reply)) => match self.handshake_step(&reply) {
                        HandshakeStep::Continue => continue,
                        step => break Some(step),
                    },
                    Ok(Err(e)) => {
                        tracing::warn!("{}: error receiving from broker: {}", properties.name, e);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    Err(_) => {}
                }
            };

            match reply {
                Some(HandshakeStep::Established) => return Ok(()),
                Some(HandshakeStep::Refused(status)) => {
                    tracing::error!("{}: broker refused the connection", properties.name);
                    return Err(status);
                }
                Some(HandshakeStep::Delay(delay)) => tokio::time::sleep(delay).await,
                Some(HandshakeStep::Redirect { host, port }) => {
                    tracing::info!("{}: got new broker information", properties.name);
                    self.set_broker_port(port);
                    let host = host.unwrap_or_else(|| properties.broker_target.clone());
                    if let Err(e) = channel.redirect(&host, port).await {
                        tracing::error!("{}: unable to reach new broker {}: {}", properties.name, host, e);
                        return Err(ConnectionStatus::Error);
                    }
                }
                Some(HandshakeStep::Continue) => {}
                None => {
                    retries += 1;
                    if retries > settings.max_retries {
                        tracing::error!(
                            "{}: the max number of retries has been exceeded",
                            properties.name
                        );
                        return Err(ConnectionStatus::Error);
                    }
                }
            }
        }
    }

    /// The host a transport should bind its listener to.
    pub fn bind_host(&self, properties: &CommsProperties) -> String {
        match strip_protocol(&properties.local_target) {
            "" | "*" | "0.0.0.0" => match properties.interface_network {
                InterfaceNetworks::Ipv6 => "::".to_string(),
                _ => "0.0.0.0".to_string(),
            },
            LOCALHOST => match properties.interface_network {
                InterfaceNetworks::Ipv6 => "::1".to_string(),
                _ => "127.0.0.1".to_string(),
            },
            host => host.to_string(),
        }
    }

    /// The host other processes on this machine use to reach the listener.
    pub fn connect_host(&self, properties: &CommsProperties) -> String {
        match self.bind_host(properties).parse::<std::net::IpAddr>() {
            Ok(ip) if ip.is_unspecified() && ip.is_ipv6() => "::1".to_string(),
            Ok(ip) if !ip.is_unspecified() => ip.to_string(),
            // Names that are not addresses bind the wildcard
            _ => "127.0.0.1".to_string(),
        }
    }

    /// How other nodes reach this one.
    pub fn address(&self, properties: &CommsProperties) -> String {
        let port = match self.port() {
            Some(port) => port,
            None if !properties.server_mode => return properties.name.clone(),
            None => self.default_port,
        };
        let host = match strip_protocol(&properties.local_target) {
            "" | "*" | "0.0.0.0" => "127.0.0.1",
            host => host,
        };
        let mut address = make_port_address(host, port);
        if self.settings().append_name_to_address {
            address.push('/');
            address.push_str(&properties.name);
        }
        address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trip_wire::TripWire;
    use std::collections::VecDeque;

    const DEFAULT: u16 = 23901;

    #[test]
    fn root_hands_out_blocks_after_its_own_port() {
        let net = NetworkComms::new("udp", DEFAULT);
        net.set_port(DEFAULT);
        assert_eq!(net.find_open_port(1, "localhost"), Some(DEFAULT + 10));
        assert_eq!(net.find_open_port(1, "localhost"), Some(DEFAULT + 11));

        let net = NetworkComms::new("udp", DEFAULT);
        net.set_port(DEFAULT);
        assert_eq!(net.find_open_port(2, "localhost"), Some(DEFAULT + 20));

        let net = NetworkComms::new("udp", DEFAULT);
        net.set_port(30000);
        assert_eq!(net.find_open_port(2, "localhost"), Some(30010));
    }

    #[test]
    fn port_definitions_seed_sub_broker_ports() {
        let net = NetworkComms::new("udp", DEFAULT);
        let mut definitions = ActionMessage::protocol(ProtocolCommand::PortDefinitions);
        definitions.extra_data = i32::from(DEFAULT + 10);
        assert!(net.load_port_definitions(&definitions));
        assert_eq!(net.port(), Some(DEFAULT + 10));
        assert_eq!(net.port_state(), PortState::Assigned(DEFAULT + 10));
        assert_eq!(net.ports().starting_port(), Some(DEFAULT + 100 + 8 * 6));

        let net = NetworkComms::new("udp", DEFAULT);
        definitions.extra_data = i32::from(DEFAULT + 150);
        assert!(net.load_port_definitions(&definitions));
        assert_eq!(net.ports().starting_port(), Some(DEFAULT + 110 + 50 * 6));

        definitions.extra_data = -4;
        assert!(!net.load_port_definitions(&definitions));
    }

    #[test]
    fn replies() {
        let net = NetworkComms::new("tcp", 24160);
        net.set_port(24160);

        let query = ActionMessage::protocol(ProtocolCommand::QueryPorts);
        let reply = net.generate_reply(&query).unwrap();
        assert_eq!(reply.protocol_command(), Some(ProtocolCommand::PortDefinitions));
        assert_eq!(reply.extra_data, 24160);

        let mut request = ActionMessage::protocol(ProtocolCommand::RequestPorts);
        request.counter = 1;
        request.payload = "127.0.0.1".into();
        let reply = net.generate_reply(&request).unwrap();
        assert_eq!(reply.source_id, 24160);
        assert_eq!(reply.extra_data, 24170);
        assert_eq!(reply.counter, 1);

        let ping = ActionMessage::protocol(ProtocolCommand::Ping);
        assert_eq!(
            net.generate_reply(&ping).and_then(|m| m.protocol_command()),
            Some(ProtocolCommand::Pong)
        );
        let ack = net
            .generate_reply(&ActionMessage::protocol(ProtocolCommand::ConnectionRequest))
            .unwrap();
        assert_eq!(ack.protocol_command(), Some(ProtocolCommand::ConnectionAck));
        assert!(net
            .generate_reply(&ActionMessage::protocol(ProtocolCommand::NewRoute))
            .is_none());
    }

    #[test]
    fn used_ports_are_skipped() {
        let net = NetworkComms::new("tcp", 24160);
        net.set_port(24160);
        let mut used = ActionMessage::protocol(ProtocolCommand::SetUsedPorts);
        used.payload = "localhost".into();
        used.set_string_data(["24170", "24171"]);
        assert!(net.generate_reply(&used).is_none());
        assert_eq!(net.find_open_port(1, "127.0.0.1"), Some(24172));
    }

    #[test]
    fn request_counts_follow_server_mode() {
        let net = NetworkComms::new("udp", DEFAULT);
        let mut properties = CommsProperties {
            local_target: "udp://10.0.0.3".to_string(),
            broker_name: "root".to_string(),
            ..Default::default()
        };
        let request = net.connection_request(&properties);
        assert_eq!(request.protocol_command(), Some(ProtocolCommand::RequestPorts));
        assert_eq!(request.counter, 2);
        assert_eq!(request.payload_str(), "10.0.0.3");
        assert_eq!(request.string(0), "root");

        properties.server_mode = false;
        assert_eq!(net.connection_request(&properties).counter, 1);

        net.set_port(24000);
        let request = net.connection_request(&properties);
        assert_eq!(
            request.protocol_command(),
            Some(ProtocolCommand::ConnectionRequest)
        );
    }

    #[test]
    fn local_target_from_broker() {
        let net = NetworkComms::new("tcp", 24160);
        let mut properties = CommsProperties::default();
        let info = NetworkBrokerData {
            broker_address: "tcp://127.0.0.1:24200".to_string(),
            port_number: Some(24300),
            ..Default::default()
        };
        properties.apply_network_info(&info);
        net.load_network_info(&info, &mut properties);
        assert_eq!(properties.local_target, "localhost");
        assert_eq!(properties.broker_target, "127.0.0.1");
        assert_eq!(net.broker_port(), 24200);
        assert_eq!(net.port(), Some(24300));
        assert!(!net.auto_port());

        let net = NetworkComms::new("tcp", 24160);
        let info = NetworkBrokerData {
            interface_network: InterfaceNetworks::Ipv4,
            ..Default::default()
        };
        let mut properties = CommsProperties::default();
        properties.apply_network_info(&info);
        net.load_network_info(&info, &mut properties);
        assert_eq!(properties.local_target, "*");
        assert_eq!(net.broker_port(), 24160);
        assert_eq!(net.bind_host(&properties), "0.0.0.0");
        assert_eq!(net.connect_host(&properties), "127.0.0.1");
    }

    #[test]
    fn connection_port_fills_in() {
        let info = NetworkBrokerData {
            connection_address: "127.0.0.1".to_string(),
            connection_port: Some(24250),
            ..Default::default()
        };

        let net = NetworkComms::new("tcp", 24160);
        let mut properties = CommsProperties::default();
        properties.apply_network_info(&info);
        net.load_network_info(&info, &mut properties);
        assert_eq!(properties.local_target, "127.0.0.1");
        assert!(properties.broker_target.is_empty());
        assert_eq!(net.port(), Some(24250));
        assert!(!net.auto_port());

        let net = NetworkComms::new("tcp", 24160);
        let mut properties = CommsProperties {
            require_broker_connection: true,
            ..Default::default()
        };
        properties.apply_network_info(&info);
        net.load_network_info(&info, &mut properties);
        assert_eq!(properties.broker_target, "127.0.0.1");
        assert_eq!(net.broker_port(), 24250);
        assert_eq!(net.port(), None);
        assert!(net.auto_port());
    }

    #[test]
    fn addresses() {
        let net = NetworkComms::new("tcp", 24160);
        let mut properties = CommsProperties {
            name: "core1".to_string(),
            local_target: "*".to_string(),
            server_mode: false,
            ..Default::default()
        };
        assert_eq!(net.address(&properties), "core1");
        net.set_port(24180);
        assert_eq!(net.address(&properties), "127.0.0.1:24180");
        net.set_flag("append_name", true);
        properties.local_target = "10.0.0.7".to_string();
        assert_eq!(net.address(&properties), "10.0.0.7:24180/core1");
    }

    /// Plays back canned replies.
    struct Scripted {
        replies: VecDeque<ActionMessage>,
        sent: Vec<ActionMessage>,
        redirects: Vec<(String, u16)>,
    }

    #[async_trait::async_trait]
    impl HandshakeChannel for Scripted {
        async fn send(&mut self, message: &ActionMessage) -> io::Result<()> {
            self.sent.push(message.clone());
            Ok(())
        }

        async fn recv(&mut self) -> io::Result<ActionMessage> {
            match self.replies.pop_front() {
                Some(reply) => Ok(reply),
                None => std::future::pending().await,
            }
        }

        async fn redirect(&mut self, host: &str, port: u16) -> io::Result<()> {
            self.redirects.push((host.to_string(), port));
            Ok(())
        }
    }

    fn scripted(replies: impl IntoIterator<Item = ActionMessage>) -> Scripted {
        Scripted {
            replies: replies.into_iter().collect(),
            sent: Vec::new(),
            redirects: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_adopts_port() {
        let net = NetworkComms::new("udp", DEFAULT);
        let ctx = CommsContext::new(TripWire::new());
        let properties = CommsProperties::default();
        let mut definitions = ActionMessage::protocol(ProtocolCommand::PortDefinitions);
        definitions.extra_data = i32::from(DEFAULT + 20);
        let mut channel = scripted([ActionMessage::protocol(ProtocolCommand::Pong), definitions]);

        assert_eq!(net.handshake(&ctx, &properties, &mut channel).await, Ok(()));
        assert_eq!(net.port(), Some(DEFAULT + 20));
        assert_eq!(channel.sent.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_refused() {
        let net = NetworkComms::new("udp", DEFAULT);
        let ctx = CommsContext::new(TripWire::new());
        let properties = CommsProperties::default();
        let mut channel = scripted([ActionMessage::protocol(ProtocolCommand::Disconnect)]);
        assert_eq!(
            net.handshake(&ctx, &properties, &mut channel).await,
            Err(ConnectionStatus::Terminated)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_gives_up_after_retries() {
        let net = NetworkComms::new("udp", DEFAULT);
        let mut info = NetworkBrokerData::default();
        info.max_retries = 2;
        let mut properties = CommsProperties::default();
        net.load_network_info(&info, &mut properties);
        properties.connection_timeout = Duration::from_millis(500);
        let ctx = CommsContext::new(TripWire::new());
        let mut channel = scripted([]);

        let started = Instant::now();
        assert_eq!(
            net.handshake(&ctx, &properties, &mut channel).await,
            Err(ConnectionStatus::Error)
        );
        assert_eq!(channel.sent.len(), 3);
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_follows_redirect() {
        let net = NetworkComms::new("udp", DEFAULT);
        net.set_port(24000);
        let ctx = CommsContext::new(TripWire::new());
        let properties = CommsProperties::default();
        let mut moved = ActionMessage::protocol(ProtocolCommand::NewBrokerInformation);
        moved.set_string_data(["10.0.0.9:25000"]);
        let mut channel = scripted([moved, ActionMessage::protocol(ProtocolCommand::ConnectionAck)]);

        assert_eq!(net.handshake(&ctx, &properties, &mut channel).await, Ok(()));
        assert_eq!(channel.redirects, vec![("10.0.0.9".to_string(), 25000)]);
        assert_eq!(net.broker_port(), 25000);
        assert_eq!(channel.sent.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn trip_wire_stops_handshake() {
        let net = NetworkComms::new("udp", DEFAULT);
        let wire = TripWire::new();
        let ctx = CommsContext::new(wire.clone());
        let properties = CommsProperties::default();
        let mut channel = scripted([]);
        wire.trip();
        assert_eq!(
            net.handshake(&ctx, &properties, &mut channel).await,
            Err(ConnectionStatus::Terminated)
        );
    }
}
