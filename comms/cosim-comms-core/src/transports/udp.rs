//! Datagram transport: one encoded message per UDP packet.

use super::{
    announce_root_port, bind_receiver, encode, process_control, process_inbound, resolve,
    resolve_route, Control, Inbound,
};
use crate::{
    comms::{CommsContext, CommsInterface, CommsProperties, Transport, CONNECT_POLL},
    config::NetworkBrokerData,
    logging::{message_event, Direction},
    message::{ActionMessage, ProtocolCommand},
    network::{HandshakeChannel, NetworkComms, PortState},
    route::{RouteId, RouteTable},
    status::ConnectionStatus,
};
use std::{io, net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;

pub const DEFAULT_UDP_PORT: u16 = 23901;
/// Sent to a receive socket to make its loop exit.
pub const CLOSE_DATAGRAM: &[u8] = b"close";
const MAX_DATAGRAM: usize = 65536;

pub type UdpComms = CommsInterface<UdpTransport>;

#[derive(Debug)]
pub struct UdpTransport {
    net: NetworkComms,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self {
            net: NetworkComms::new("udp", DEFAULT_UDP_PORT),
        }
    }

    pub fn network(&self) -> &NetworkComms {
        &self.net
    }

    /// Where the receive socket can be reached from this machine.
    async fn receiver_address(&self, ctx: &CommsContext) -> Option<SocketAddr> {
        let port = self.net.port()?;
        resolve(&self.net.connect_host(&ctx.properties()), port).await.ok()
    }

    async fn handshake(
        &self,
        ctx: &CommsContext,
        properties: &CommsProperties,
        socket: &UdpSocket,
    ) -> Result<Option<SocketAddr>, ConnectionStatus> {
        if properties.broker_target.is_empty() {
            if properties.require_broker_connection {
                tracing::error!("{}: a broker connection is required but none was given", properties.name);
                return Err(ConnectionStatus::Error);
            }
            announce_root_port(&self.net);
            return Ok(None);
        }
        self.net.set_has_broker(true);
        let broker = resolve(&properties.broker_target, self.net.broker_port())
            .await
            .map_err(|e| {
                tracing::error!(
                    "{}: unable to resolve broker {}: {}",
                    properties.name,
                    properties.broker_target,
                    e
                );
                ConnectionStatus::Error
            })?;
        let mut channel = UdpHandshake {
            socket,
            broker,
            buffer: vec![0; MAX_DATAGRAM],
        };
        self.net.handshake(ctx, properties, &mut channel).await?;
        announce_root_port(&self.net);
        Ok(Some(channel.broker))
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct UdpHandshake<'a> {
    socket: &'a UdpSocket,
    broker: SocketAddr,
    buffer: Vec<u8>,
}

#[async_trait::async_trait]
impl HandshakeChannel for UdpHandshake<'_> {
    async fn send(&mut self, message: &ActionMessage) -> io::Result<()> {
        self.socket.send_to(&encode(message)?, self.broker).await?;
        Ok(())
    }

    async fn recv(&mut self) -> io::Result<ActionMessage> {
        loop {
            let (len, _) = self.socket.recv_from(&mut self.buffer).await?;
            match ActionMessage::from_bytes(&self.buffer[..len]) {
                Ok(message) => return Ok(message),
                Err(e) => tracing::warn!("Discarding bad datagram from broker: {}", e),
            }
        }
    }

    async fn redirect(&mut self, host: &str, port: u16) -> io::Result<()> {
        self.broker = resolve(host, port).await?;
        Ok(())
    }
}

/// The socket operations a datagram receive loop needs.
#[async_trait::async_trait]
trait Datagrams: Send + Sync {
    async fn recv_from(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    async fn send_to(&self, datagram: &[u8], target: SocketAddr) -> io::Result<usize>;
}

#[async_trait::async_trait]
impl Datagrams for UdpSocket {
    async fn recv_from(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buffer).await
    }

    async fn send_to(&self, datagram: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, datagram, target).await
    }
}

/// Reads datagrams until told to close. Returns `false` if the socket failed,
/// in which case the receive status is already `Error`.
async fn serve_datagrams<S: Datagrams>(
    ctx: &CommsContext,
    net: &NetworkComms,
    name: &str,
    socket: &S,
) -> bool {
    let mut buffer = vec![0; MAX_DATAGRAM];
    loop {
        let (len, peer) = tokio::select! {
            received = socket.recv_from(&mut buffer) => match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::error!("{}: receive error: {}", name, e);
                    ctx.set_rx_status(ConnectionStatus::Error);
                    return false;
                }
            },
            _ = ctx.trip_wire().wait_for_trip() => return true,
        };
        let datagram = &buffer[..len];
        if datagram == CLOSE_DATAGRAM {
            return true;
        }
        let message = match ActionMessage::from_bytes(datagram) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("{}: discarding bad datagram from {}: {}", name, peer, e);
                continue;
            }
        };
        match process_inbound(ctx, Some(net), &peer, message) {
            Inbound::Close => return true,
            Inbound::Reply(reply) => {
                message_event(name, Direction::Sent, &peer, &reply);
                let sent = match encode(&reply) {
                    Ok(datagram) => socket.send_to(&datagram, peer).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    tracing::warn!("{}: unable to reply to {}: {}", name, peer, e);
                }
            }
            Inbound::Continue => {}
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    fn default_port(&self) -> Option<u16> {
        Some(DEFAULT_UDP_PORT)
    }

    async fn receive_loop(self: Arc<Self>, ctx: Arc<CommsContext>) {
        let properties = ctx.properties();
        let Some(socket) = bind_receiver(&ctx, &self.net, &properties, |address| async move {
            let socket = UdpSocket::bind(address).await?;
            let port = socket.local_addr()?.port();
            Ok((socket, port))
        })
        .await
        else {
            return;
        };
        ctx.set_rx_status(ConnectionStatus::Connected);
        if serve_datagrams(&ctx, &self.net, &properties.name, &socket).await {
            ctx.set_rx_status(ConnectionStatus::Terminated);
        }
    }

    async fn transmit_loop(self: Arc<Self>, ctx: Arc<CommsContext>) {
        let properties = ctx.properties();
        let socket = match UdpSocket::bind(super::resolve_bind(&self.net.bind_host(&properties), 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::error!("{}: unable to open transmit socket: {}", properties.name, e);
                self.net.publish_port_state(PortState::Failed);
                ctx.set_tx_status(ConnectionStatus::Error);
                return;
            }
        };
        let broker = match self.handshake(&ctx, &properties, &socket).await {
            Ok(broker) => broker,
            Err(status) => {
                self.net.publish_port_state(PortState::Failed);
                ctx.set_tx_status(status);
                return;
            }
        };

        // Control traffic goes to our own receiver, so wait until it is bound
        while ctx.rx_status() == ConnectionStatus::Startup && !ctx.should_stop() {
            tokio::time::sleep(CONNECT_POLL).await;
        }
        let receiver = match ctx.rx_status() {
            ConnectionStatus::Connected | ConnectionStatus::Reconnecting => {
                self.receiver_address(&ctx).await
            }
            _ => None,
        };
        let Some(receiver) = receiver else {
            ctx.set_tx_status(if ctx.should_stop() {
                ConnectionStatus::Terminated
            } else {
                ConnectionStatus::Error
            });
            return;
        };
        ctx.set_tx_status(ConnectionStatus::Connected);

        let mut routes: RouteTable<SocketAddr> = RouteTable::new();
        loop {
            let (route, message) = tokio::select! {
                next = ctx.queue().pop() => next,
                _ = ctx.trip_wire().wait_for_trip() => break,
            };
            let destination = if route == RouteId::CONTROL {
                match process_control(&ctx, message) {
                    Control::AddRoute(id, info) => {
                        match resolve_route(&info).await {
                            Ok(address) => {
                                routes.insert(id, address);
                            }
                            Err(e) => tracing::warn!("{}: bad route {}: {}", properties.name, info, e),
                        }
                        continue;
                    }
                    Control::RemoveRoute(id) => {
                        routes.remove(id);
                        continue;
                    }
                    Control::Stop => break,
                    Control::Handled => continue,
                    Control::ToReceiver(message) => Some((receiver, message)),
                }
            } else {
                match routes.resolve(route, broker.as_ref()) {
                    Some(address) => Some((*address, message)),
                    None => {
                        tracing::warn!("{}: no route for {} (route {})", properties.name, message, route);
                        None
                    }
                }
            };
            if let Some((address, message)) = destination {
                let datagram = match encode(&message) {
                    Ok(datagram) => datagram,
                    Err(e) => {
                        tracing::warn!("{}: unable to encode {}: {}", properties.name, message, e);
                        continue;
                    }
                };
                message_event(&properties.name, Direction::Sent, &address, &message);
                if let Err(e) = socket.send_to(&datagram, address).await {
                    tracing::warn!("{}: failed to send to {}: {}", properties.name, address, e);
                }
            }
        }

        if ctx.rx_status().is_open() {
            let _ = socket.send_to(CLOSE_DATAGRAM, receiver).await;
        }
        ctx.set_tx_status(ConnectionStatus::Terminated);
    }

    fn close_receiver(&self, ctx: &CommsContext) {
        if ctx.tx_status() == ConnectionStatus::Connected {
            ctx.transmit(
                RouteId::CONTROL,
                ActionMessage::protocol(ProtocolCommand::CloseReceiver),
            );
            return;
        }
        // The transmit loop is gone, so knock on the receive socket directly
        let Some(port) = self.net.port() else {
            return;
        };
        let host = self.net.connect_host(&ctx.properties());
        let target = super::resolve_bind(&host, port);
        let sent = std::net::UdpSocket::bind(super::resolve_bind(&host, 0))
            .and_then(|socket| socket.send_to(CLOSE_DATAGRAM, target));
        if let Err(e) = sent {
            tracing::warn!("{}: unable to close receiver: {}", ctx.name(), e);
        }
    }

    fn load_network_info(&self, info: &NetworkBrokerData, properties: &mut CommsProperties) {
        self.net.load_network_info(info, properties);
    }

    fn set_flag(&self, flag: &str, value: bool) -> bool {
        self.net.set_flag(flag, value)
    }

    fn address(&self, properties: &CommsProperties) -> String {
        self.net.address(properties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trip_wire::TripWire;
    use std::time::Duration;

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn close_datagram_ends_receive_loop() {
        let transport = Arc::new(UdpTransport::new());
        let ctx = Arc::new(CommsContext::new(TripWire::new()));
        transport.net.publish_port_state(PortState::Ephemeral);

        let task = tokio::spawn(transport.clone().receive_loop(ctx.clone()));
        while ctx.rx_status() == ConnectionStatus::Startup {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ctx.rx_status(), ConnectionStatus::Connected);
        let port = transport.net.port().unwrap();
        assert_ne!(port, 0);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"garbage", ("127.0.0.1", port)).await.unwrap();
        sender.send_to(CLOSE_DATAGRAM, ("127.0.0.1", port)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx.rx_status(), ConnectionStatus::Terminated);
        assert!(logs_contain("discarding bad datagram"));
    }

    /// Fails every receive.
    struct Broken {
        receives: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Datagrams for Broken {
        async fn recv_from(&self, _buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.receives
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "gone"))
        }

        async fn send_to(&self, datagram: &[u8], _target: SocketAddr) -> io::Result<usize> {
            Ok(datagram.len())
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn socket_error_stops_receive_loop() {
        let ctx = CommsContext::new(TripWire::new());
        ctx.set_rx_status(ConnectionStatus::Connected);
        let net = NetworkComms::new("udp", DEFAULT_UDP_PORT);
        let socket = Broken {
            receives: Default::default(),
        };

        let served = tokio::time::timeout(
            Duration::from_secs(5),
            serve_datagrams(&ctx, &net, "broken", &socket),
        )
        .await
        .unwrap();
        assert!(!served);
        assert_eq!(socket.receives.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(ctx.rx_status(), ConnectionStatus::Error);
        assert!(logs_contain("receive error"));
    }
}
