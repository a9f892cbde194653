//! Push/pull messaging fabric.
//!
//! Every node listens for pushed messages on its port. A node in server mode
//! also answers requests on `port + 1`: that is where sub-brokers negotiate
//! their ports. Pushed connections carry data one way only; nothing is ever
//! written back on them.

use super::{
    announce_root_port, bind_listener, bind_receiver, connect_broker, connect_stream, open_route,
    process_control, process_inbound, resolve, send_routed, serve_connection, Control,
    ControlChannel, FrameStream, Inbound,
};
use crate::{
    comms::{CommsContext, CommsInterface, CommsProperties, Transport},
    config::NetworkBrokerData,
    message::{ActionMessage, ProtocolCommand},
    network::{NetworkComms, PortState},
    route::{RouteId, RouteTable},
    status::ConnectionStatus,
};
use std::{io, net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::codec::Framed;

pub const DEFAULT_FABRIC_PORT: u16 = 23404;
/// The request/reply listener sits this far above the pull port.
pub const REPLY_PORT_OFFSET: u16 = 1;

pub type FabricComms = CommsInterface<FabricTransport>;

#[derive(Debug)]
pub struct FabricTransport {
    net: NetworkComms,
    control: ControlChannel,
}

impl FabricTransport {
    pub fn new() -> Self {
        Self {
            net: NetworkComms::new("fabric", DEFAULT_FABRIC_PORT),
            control: ControlChannel::new(),
        }
    }

    pub fn network(&self) -> &NetworkComms {
        &self.net
    }

    /// Negotiates a port over request/reply, then opens the push connection
    /// to the broker's pull port.
    async fn connect_to_broker(
        &self,
        ctx: &CommsContext,
        properties: &CommsProperties,
    ) -> Result<Option<(SocketAddr, FrameStream)>, ConnectionStatus> {
        if properties.broker_target.is_empty() {
            if properties.require_broker_connection {
                tracing::error!("{}: a broker connection is required but none was given", properties.name);
                return Err(ConnectionStatus::Error);
            }
            announce_root_port(&self.net);
            return Ok(None);
        }
        self.net.set_has_broker(true);
        {
            let mut request = connect_broker(ctx, properties, &self.net, REPLY_PORT_OFFSET).await?;
            self.net.handshake(ctx, properties, &mut request).await?;
        }
        announce_root_port(&self.net);

        let push = async {
            let address = resolve(&properties.broker_target, self.net.broker_port()).await?;
            let stream = connect_stream(address, properties.max_message_size).await?;
            Ok::<_, io::Error>((address, stream))
        };
        match push.await {
            Ok(push) => Ok(Some(push)),
            Err(e) => {
                tracing::error!("{}: unable to push to broker: {}", properties.name, e);
                Err(ConnectionStatus::Error)
            }
        }
    }
}

impl Default for FabricTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts on `listener` if there is one, otherwise never resolves.
async fn accept(listener: &Option<TcpListener>) -> io::Result<(tokio::net::TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

#[async_trait::async_trait]
impl Transport for FabricTransport {
    fn default_port(&self) -> Option<u16> {
        Some(DEFAULT_FABRIC_PORT)
    }

    async fn receive_loop(self: Arc<Self>, ctx: Arc<CommsContext>) {
        let properties = ctx.properties();
        let reuse = self.net.settings().reuse_address;
        let server_mode = properties.server_mode;
        // Both listeners bind together so an auto port moves them as a pair
        let Some((pull, reply)) = bind_receiver(&ctx, &self.net, &properties, |address| async move {
            let (pull, port) = bind_listener(address, reuse).await?;
            let reply = if server_mode {
                let mut address = address;
                address.set_port(port.checked_add(REPLY_PORT_OFFSET).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no room for the reply port")
                })?);
                Some(bind_listener(address, reuse).await?.0)
            } else {
                None
            };
            Ok(((pull, reply), port))
        })
        .await
        else {
            return;
        };
        let mut control = self.control.claim().await;
        ctx.set_rx_status(ConnectionStatus::Connected);

        let mut readers = JoinSet::new();
        loop {
            let (stream, peer, replies) = tokio::select! {
                accepted = pull.accept() => match accepted {
                    Ok((stream, peer)) => (stream, peer, false),
                    Err(e) => {
                        tracing::warn!("{}: accept failed: {}", properties.name, e);
                        continue;
                    }
                },
                accepted = accept(&reply) => match accepted {
                    Ok((stream, peer)) => (stream, peer, true),
                    Err(e) => {
                        tracing::warn!("{}: accept failed: {}", properties.name, e);
                        continue;
                    }
                },
                signal = control.recv() => {
                    let Some(signal) = signal else { break };
                    match process_inbound(&ctx, Some(&self.net), &"control", signal) {
                        Inbound::Close => break,
                        Inbound::Reply(_) | Inbound::Continue => {}
                    }
                    continue;
                }
                Some(_) = readers.join_next(), if !readers.is_empty() => continue,
                _ = ctx.trip_wire().wait_for_trip() => break,
            };
            let stream = Framed::new(stream, super::codec(properties.max_message_size));
            let transport = self.clone();
            let ctx = ctx.clone();
            readers.spawn(async move {
                serve_connection(ctx, &transport.net, stream, peer, replies).await;
            });
        }
        readers.shutdown().await;
        ctx.set_rx_status(ConnectionStatus::Terminated);
    }

    async fn transmit_loop(self: Arc<Self>, ctx: Arc<CommsContext>) {
        let properties = ctx.properties();
        let mut broker = match self.connect_to_broker(&ctx, &properties).await {
            Ok(broker) => broker,
            Err(status) => {
                self.net.publish_port_state(PortState::Failed);
                ctx.set_tx_status(status);
                return;
            }
        };
        ctx.set_tx_status(ConnectionStatus::Connected);

        let mut routes: RouteTable<(SocketAddr, FrameStream)> = RouteTable::new();
        loop {
            let (route, message) = tokio::select! {
                next = ctx.queue().pop() => next,
                _ = ctx.trip_wire().wait_for_trip() => break,
            };
            if route != RouteId::CONTROL {
                send_routed(&ctx, &mut routes, &mut broker, route, message, properties.max_message_size)
                    .await;
                continue;
            }
            match process_control(&ctx, message) {
                Control::AddRoute(id, info) => match open_route(&info, &properties).await {
                    Ok(endpoint) => {
                        routes.insert(id, endpoint);
                    }
                    Err(e) => tracing::warn!("{}: unable to push on route {} to {}: {}", properties.name, id, info, e),
                },
                Control::RemoveRoute(id) => {
                    routes.remove(id);
                }
                Control::Stop => break,
                Control::Handled => {}
                Control::ToReceiver(message) => self.control.signal(message),
            }
        }
        ctx.set_tx_status(ConnectionStatus::Terminated);
    }

    fn close_receiver(&self, _ctx: &CommsContext) {
        self.control
            .signal(ActionMessage::protocol(ProtocolCommand::CloseReceiver));
    }

    fn reconnect_receiver(&self, _ctx: &CommsContext) {
        self.control
            .signal(ActionMessage::priority_protocol(ProtocolCommand::ReconnectReceiver));
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
