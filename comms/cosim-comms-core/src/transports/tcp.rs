//! Stream transport over length-delimited TCP connections.
//!
//! The receive loop owns a listener and spawns one reader per accepted
//! connection. The transmit loop owns every outbound connection: the broker
//! connection opened for the handshake, and one connection per route.

use super::{
    announce_root_port, bind_listener, bind_receiver, connect_broker, open_route, process_control,
    process_inbound, send_routed, serve_connection, Control, ControlChannel, FrameStream, Inbound,
};
use crate::{
    comms::{CommsContext, CommsInterface, CommsProperties, Transport},
    config::NetworkBrokerData,
    message::{ActionMessage, ProtocolCommand},
    network::{NetworkComms, PortState},
    route::{RouteId, RouteTable},
    status::ConnectionStatus,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::task::JoinSet;

pub const DEFAULT_TCP_PORT: u16 = 24160;

pub type TcpComms = CommsInterface<TcpTransport>;

#[derive(Debug)]
pub struct TcpTransport {
    net: NetworkComms,
    control: ControlChannel,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            net: NetworkComms::new("tcp", DEFAULT_TCP_PORT),
            control: ControlChannel::new(),
        }
    }

    pub fn network(&self) -> &NetworkComms {
        &self.net
    }

    /// Runs the handshake and keeps its connection as the broker route.
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
        let mut channel = connect_broker(ctx, properties, &self.net, 0).await?;
        self.net.handshake(ctx, properties, &mut channel).await?;
        announce_root_port(&self.net);
        let stream = channel.into_stream();
        let peer = stream
            .get_ref()
            .peer_addr()
            .map_err(|_| ConnectionStatus::Error)?;
        Ok(Some((peer, stream)))
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    fn default_port(&self) -> Option<u16> {
        Some(DEFAULT_TCP_PORT)
    }

    async fn receive_loop(self: Arc<Self>, ctx: Arc<CommsContext>) {
        let properties = ctx.properties();
        let reuse = self.net.settings().reuse_address;
        let Some(listener) = bind_receiver(&ctx, &self.net, &properties, |address| {
            bind_listener(address, reuse)
        })
        .await
        else {
            return;
        };
        let mut control = self.control.claim().await;
        ctx.set_rx_status(ConnectionStatus::Connected);

        let mut readers = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::warn!("{}: {}", properties.name, e);
                        }
                        let stream = tokio_util::codec::Framed::new(
                            stream,
                            super::codec(properties.max_message_size),
                        );
                        let transport = self.clone();
                        let ctx = ctx.clone();
                        readers.spawn(async move {
                            serve_connection(ctx, &transport.net, stream, peer, true).await;
                        });
                    }
                    Err(e) => tracing::warn!("{}: accept failed: {}", properties.name, e),
                },
                signal = control.recv() => {
                    let Some(signal) = signal else { break };
                    match process_inbound(&ctx, Some(&self.net), &"control", signal) {
                        Inbound::Close => break,
                        Inbound::Reply(_) | Inbound::Continue => {}
                    }
                }
                Some(_) = readers.join_next(), if !readers.is_empty() => {}
                _ = ctx.trip_wire().wait_for_trip() => break,
            }
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
                    Err(e) => {
                        tracing::warn!("{}: unable to open route {} to {}: {}", properties.name, id, info, e)
                    }
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
