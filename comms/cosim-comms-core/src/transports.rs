//! The concrete transports and the pieces they share.
//!
//! | transport | primitive | default port |
//! |---|---|---|
//! | [`UdpTransport`] | datagram socket | 23901 |
//! | [`TcpTransport`] | length-delimited stream | 24160 |
//! | [`FabricTransport`] | push/pull streams plus a request/reply listener | 23404 |
//! | [`InprocTransport`] | named in-process queues | none |

pub mod fabric;
pub mod inproc;
pub mod tcp;
pub mod udp;

pub use fabric::{FabricComms, FabricTransport};
pub use inproc::{InprocComms, InprocTransport, QueueRegistry};
pub use tcp::{TcpComms, TcpTransport};
pub use udp::{UdpComms, UdpTransport};

use crate::{
    comms::{CommsContext, CommsProperties},
    logging::{message_event, Direction},
    message::{ActionMessage, ProtocolCommand},
    network::{HandshakeChannel, NetworkComms, PortState},
    route::{RouteId, RouteTable},
    status::ConnectionStatus,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::{
    fmt::Display,
    future::Future,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    sync::{mpsc, Mutex},
    time::Instant,
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Pause between attempts to bind a listener or find a peer.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(200);
/// How many consecutive ports an auto-assigned receiver tries.
pub const AUTO_PORT_ATTEMPTS: u16 = 10;

/// A stream carrying one encoded [`ActionMessage`] per frame.
pub type FrameStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Inbound frames are accepted up to this many times the configured message
/// size.
pub const FRAME_HEADROOM: usize = 4;

/// Length-delimited framing with a big-endian `u32` length. Outbound size is
/// checked against `max_message_size` before encoding, see [`send_routed`].
pub fn codec(max_message_size: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_type::<u32>()
        .max_frame_length(max_message_size.saturating_mul(FRAME_HEADROOM))
        .new_codec()
}

/// Turns a configured host into something a socket can use. Wildcards and
/// `localhost` become the loopback address.
pub async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    let host = crate::address::strip_protocol(host)
        .trim_start_matches('[')
        .trim_end_matches(']');
    match host {
        "" | "*" | "0.0.0.0" | crate::address::LOCALHOST => {
            return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
        }
        "::" => return Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port)),
        _ => {}
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}")))
}

/// Parses `host:port` route information.
pub async fn resolve_route(info: &str) -> io::Result<SocketAddr> {
    let (host, port) = crate::address::extract_interface_and_port(info);
    let port = port.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("no port in {info}"))
    })?;
    resolve(&host, port).await
}

/// Encodes `message` as one frame, reporting an unencodable message as
/// [`io::ErrorKind::InvalidData`].
pub fn encode(message: &ActionMessage) -> io::Result<Bytes> {
    message
        .to_bytes()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_message(stream: &mut FrameStream, message: &ActionMessage) -> io::Result<()> {
    stream.send(encode(message)?).await
}

pub async fn connect_stream(address: SocketAddr, max_message_size: usize) -> io::Result<FrameStream> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    Ok(Framed::new(stream, codec(max_message_size)))
}

/// Opens the stream for a new route, giving up after the connection timeout.
pub async fn open_route(info: &str, properties: &CommsProperties) -> io::Result<(SocketAddr, FrameStream)> {
    let open = async {
        let address = resolve_route(info).await?;
        let stream = connect_stream(address, properties.max_message_size).await?;
        Ok::<_, io::Error>((address, stream))
    };
    tokio::time::timeout(properties.connection_timeout, open)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("timed out connecting to {info}")))?
}

/// Binds a listener and reports the port it got.
pub async fn bind_listener(address: SocketAddr, reuse_address: bool) -> io::Result<(TcpListener, u16)> {
    let socket = match address {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if reuse_address {
        socket.set_reuseaddr(true)?;
    }
    socket.bind(address)?;
    let listener = socket.listen(1024)?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

/// Waits for the transmit side to settle the port, then binds with `bind`.
///
/// An ephemeral port is bound once and published. An assigned port that is
/// busy is retried: auto-assigned ports move up by one, at most ten times;
/// explicit ports are retried every 200 ms until the connection timeout.
/// Returns `None` after setting the receive status if binding failed.
pub async fn bind_receiver<S, F, Fut>(
    ctx: &CommsContext,
    net: &NetworkComms,
    properties: &CommsProperties,
    mut bind: F,
) -> Option<S>
where
    F: FnMut(SocketAddr) -> Fut,
    Fut: Future<Output = io::Result<(S, u16)>>,
{
    let state = tokio::select! {
        state = net.wait_for_port() => state,
        _ = ctx.trip_wire().wait_for_trip() => PortState::Failed,
    };
    let host = net.bind_host(properties);
    let address = |port| resolve_bind(&host, port);

    let mut port = match state {
        PortState::Assigned(port) => port,
        PortState::Ephemeral => {
            return match bind(address(0)).await {
                Ok((socket, port)) => {
                    net.set_port(port);
                    Some(socket)
                }
                Err(e) => {
                    tracing::error!("{}: unable to bind to an OS assigned port: {}", properties.name, e);
                    ctx.set_rx_status(ConnectionStatus::Error);
                    None
                }
            };
        }
        PortState::Pending | PortState::Failed => {
            ctx.set_rx_status(if ctx.should_stop() {
                ConnectionStatus::Terminated
            } else {
                ConnectionStatus::Error
            });
            return None;
        }
    };

    let deadline = Instant::now() + properties.connection_timeout;
    let mut attempts = 1;
    loop {
        match bind(address(port)).await {
            Ok((socket, _)) => {
                if net.port() != Some(port) {
                    net.set_port(port);
                }
                return Some(socket);
            }
            Err(e) if net.auto_port() && net.has_broker() => {
                if attempts >= AUTO_PORT_ATTEMPTS {
                    tracing::error!("{}: unable to bind near port {}: {}", properties.name, port, e);
                    ctx.set_rx_status(ConnectionStatus::Error);
                    return None;
                }
                attempts += 1;
                port = port.saturating_add(1);
            }
            Err(e) => {
                if ctx.should_stop() {
                    ctx.set_rx_status(ConnectionStatus::Terminated);
                    return None;
                }
                if Instant::now() >= deadline {
                    tracing::error!("{}: unable to bind to port {}: {}", properties.name, port, e);
                    ctx.set_rx_status(ConnectionStatus::Error);
                    return None;
                }
                tracing::warn!("{}: port {} busy, retrying", properties.name, port);
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

fn resolve_bind(host: &str, port: u16) -> SocketAddr {
    match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port),
        Err(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
    }
}

/// Settles this node's port when there is no broker to ask.
pub fn announce_root_port(net: &NetworkComms) {
    match net.port() {
        Some(port) => net.publish_port_state(PortState::Assigned(port)),
        None if net.settings().use_os_port => net.publish_port_state(PortState::Ephemeral),
        None => net.set_port(net.default_port()),
    }
}

/// What a receive loop does after one inbound message.
#[derive(Debug)]
pub enum Inbound {
    Continue,
    Close,
    Reply(ActionMessage),
}

/// Applies the receive loop rules shared by every transport. `net` is
/// absent for transports without ports.
pub fn process_inbound(
    ctx: &CommsContext,
    net: Option<&NetworkComms>,
    peer: &dyn Display,
    message: ActionMessage,
) -> Inbound {
    message_event(&ctx.name(), Direction::Received, peer, &message);
    match message.protocol_command() {
        Some(ProtocolCommand::CloseReceiver) => Inbound::Close,
        Some(ProtocolCommand::ReconnectReceiver) => {
            ctx.set_rx_status(ConnectionStatus::Connected);
            Inbound::Continue
        }
        Some(_) => match net.and_then(|net| net.generate_reply(&message)) {
            Some(reply) => Inbound::Reply(reply),
            None => Inbound::Continue,
        },
        None if message.is_protocol() => {
            tracing::warn!("{}: unknown protocol command {}", ctx.name(), message.message_id);
            Inbound::Continue
        }
        None => {
            ctx.deliver(message);
            Inbound::Continue
        }
    }
}

/// What a transmit loop does with a message sent to the control route.
#[derive(Debug)]
pub enum Control {
    AddRoute(RouteId, String),
    RemoveRoute(RouteId),
    /// Pass to this node's own receive loop
    ToReceiver(ActionMessage),
    Stop,
    Handled,
}

pub fn process_control(ctx: &CommsContext, message: ActionMessage) -> Control {
    match message.protocol_command() {
        Some(ProtocolCommand::NewRoute) => {
            Control::AddRoute(RouteId(message.extra_data), message.payload_str().into_owned())
        }
        Some(ProtocolCommand::RemoveRoute) => Control::RemoveRoute(RouteId(message.extra_data)),
        Some(ProtocolCommand::Disconnect) => Control::Stop,
        Some(ProtocolCommand::ReconnectTransmitter) => {
            ctx.set_tx_status(ConnectionStatus::Connected);
            Control::Handled
        }
        _ => Control::ToReceiver(message),
    }
}

/// In-process channel from the transmit side to the receive side of a
/// stream transport. The receiver survives loop restarts.
#[derive(Debug)]
pub struct ControlChannel {
    sender: mpsc::UnboundedSender<ActionMessage>,
    receiver: Mutex<mpsc::UnboundedReceiver<ActionMessage>>,
}

impl ControlChannel {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    pub fn signal(&self, message: ActionMessage) {
        // The receiver lives as long as self
        let _ = self.sender.send(message);
    }

    /// Claims the receiving end for the lifetime of one receive loop.
    pub async fn claim(&self) -> tokio::sync::MutexGuard<'_, mpsc::UnboundedReceiver<ActionMessage>> {
        self.receiver.lock().await
    }
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads frames from one stream connection until it closes, answering
/// protocol requests on the same connection when `replies` is set.
pub async fn serve_connection(
    ctx: Arc<CommsContext>,
    net: &NetworkComms,
    mut stream: FrameStream,
    peer: SocketAddr,
    replies: bool,
) {
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("{}: connection to {} failed: {}", ctx.name(), peer, e);
                break;
            }
        };
        let message = match ActionMessage::from_bytes(&frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("{}: discarding bad frame from {}: {}", ctx.name(), peer, e);
                continue;
            }
        };
        match process_inbound(&ctx, Some(net), &peer, message) {
            Inbound::Reply(reply) if replies => {
                message_event(&ctx.name(), Direction::Sent, &peer, &reply);
                if let Err(e) = write_message(&mut stream, &reply).await {
                    tracing::warn!("{}: unable to reply to {}: {}", ctx.name(), peer, e);
                    break;
                }
            }
            // Closing is only honored from this node's own control channel
            Inbound::Reply(_) | Inbound::Continue | Inbound::Close => {}
        }
    }
}

/// Sends one message on a stream and logs it.
pub async fn send_frame(
    ctx: &CommsContext,
    stream: &mut FrameStream,
    peer: &(dyn Display + Sync),
    message: &ActionMessage,
) -> io::Result<()> {
    message_event(&ctx.name(), Direction::Sent, peer, message);
    write_message(stream, message).await
}

/// The handshake over a stream connection to the broker. `port_offset` is
/// added to every broker port, for transports whose handshake listener sits
/// beside their data listener.
pub struct StreamHandshake {
    stream: FrameStream,
    max_message_size: usize,
    port_offset: u16,
}

impl StreamHandshake {
    pub async fn connect(
        host: &str,
        port: u16,
        port_offset: u16,
        max_message_size: usize,
    ) -> io::Result<Self> {
        let address = resolve(host, port.saturating_add(port_offset)).await?;
        let stream = connect_stream(address, max_message_size).await?;
        Ok(Self {
            stream,
            max_message_size,
            port_offset,
        })
    }

    pub fn into_stream(self) -> FrameStream {
        self.stream
    }
}

#[async_trait::async_trait]
impl HandshakeChannel for StreamHandshake {
    async fn send(&mut self, message: &ActionMessage) -> io::Result<()> {
        write_message(&mut self.stream, message).await
    }

    async fn recv(&mut self) -> io::Result<ActionMessage> {
        loop {
            let frame = self.stream.next().await.ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "broker closed the connection")
            })??;
            match ActionMessage::from_bytes(&frame) {
                Ok(message) => return Ok(message),
                Err(e) => tracing::warn!("Discarding bad frame from broker: {}", e),
            }
        }
    }

    async fn redirect(&mut self, host: &str, port: u16) -> io::Result<()> {
        let address = resolve(host, port.saturating_add(self.port_offset)).await?;
        self.stream = connect_stream(address, self.max_message_size).await?;
        Ok(())
    }
}

/// Opens the handshake connection, retrying until the broker answers or the
/// retry budget runs out.
pub async fn connect_broker(
    ctx: &CommsContext,
    properties: &CommsProperties,
    net: &NetworkComms,
    port_offset: u16,
) -> Result<StreamHandshake, ConnectionStatus> {
    let max_retries = net.settings().max_retries;
    let mut retries = 0;
    loop {
        if ctx.should_stop() {
            return Err(ConnectionStatus::Terminated);
        }
        let attempt = StreamHandshake::connect(
            &properties.broker_target,
            net.broker_port(),
            port_offset,
            properties.max_message_size,
        );
        match tokio::time::timeout(properties.connection_timeout, attempt).await {
            Ok(Ok(handshake)) => return Ok(handshake),
            Ok(Err(e)) => tracing::warn!(
                "{}: unable to reach broker {}: {}",
                properties.name,
                properties.broker_target,
                e
            ),
            Err(_) => tracing::warn!("{}: timed out reaching broker", properties.name),
        }
        retries += 1;
        if retries > max_retries {
            tracing::error!("{}: the max number of retries has been exceeded", properties.name);
            return Err(ConnectionStatus::Error);
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}

/// Sends a routed message over the stream transports' route table.
///
/// A message larger than `max_message_size` is dropped on its own. A route
/// whose connection fails is removed.
pub async fn send_routed(
    ctx: &CommsContext,
    routes: &mut RouteTable<(SocketAddr, FrameStream)>,
    broker: &mut Option<(SocketAddr, FrameStream)>,
    route: RouteId,
    message: ActionMessage,
    max_message_size: usize,
) {
    let size = message.encoded_len();
    if size > max_message_size {
        tracing::warn!(
            "{}: dropping {} on route {}: {} bytes is over the {} byte limit",
            ctx.name(),
            message,
            route,
            size,
            max_message_size
        );
        return;
    }
    let Some((peer, stream)) = routes.resolve_mut(route, broker.as_mut()) else {
        tracing::warn!("{}: no route for {} (route {})", ctx.name(), message, route);
        return;
    };
    let peer = *peer;
    match send_frame(ctx, stream, &peer, &message).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            tracing::warn!("{}: unable to encode {}: {}", ctx.name(), message, e);
        }
        Err(e) => {
            tracing::warn!("{}: failed to send to {}: {}", ctx.name(), peer, e);
            routes.remove(route);
        }
    }
}
