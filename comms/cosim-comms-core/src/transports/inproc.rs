//! Local transport between comms instances in one process.
//!
//! Each receive loop registers a named queue in a shared [`QueueRegistry`];
//! the transmit side looks queues up by name. Messages are passed as values
//! and never encoded.

use super::{process_control, process_inbound, Control, Inbound, RETRY_INTERVAL};
use crate::{
    comms::{CommsContext, CommsInterface, Transport},
    message::{ActionMessage, ProtocolCommand},
    route::{RouteId, RouteTable},
    status::ConnectionStatus,
};
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;
use tokio::{sync::mpsc, time::Instant};

pub type InprocComms = CommsInterface<InprocTransport>;

/// The queues of every local comms instance, by name. Clones share the same
/// set of queues.
#[derive(Debug, Clone, Default)]
pub struct QueueRegistry(Arc<DashMap<String, mpsc::UnboundedSender<ActionMessage>>>);

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the queue `name`, or returns `None` if the name is taken by a
    /// live queue.
    pub fn register(&self, name: &str) -> Option<mpsc::UnboundedReceiver<ActionMessage>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        match self.0.entry(name.to_string()) {
            Entry::Occupied(mut entry) if entry.get().is_closed() => {
                entry.insert(sender);
            }
            Entry::Occupied(_) => return None,
            Entry::Vacant(entry) => {
                entry.insert(sender);
            }
        }
        Some(receiver)
    }

    pub fn sender(&self, name: &str) -> Option<mpsc::UnboundedSender<ActionMessage>> {
        self.0
            .get(name)
            .map(|sender| sender.value().clone())
            .filter(|sender| !sender.is_closed())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sender(name).is_some()
    }

    pub fn unregister(&self, name: &str) {
        self.0.remove(name);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.0.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

#[derive(Debug)]
pub struct InprocTransport {
    queues: QueueRegistry,
}

impl InprocTransport {
    pub fn new(queues: QueueRegistry) -> Self {
        Self { queues }
    }

    pub fn queues(&self) -> &QueueRegistry {
        &self.queues
    }

    /// Writes straight into this node's own queue, bypassing the transmit
    /// loop.
    fn signal_receiver(&self, ctx: &CommsContext, signal: ActionMessage) {
        if let Some(queue) = self.queues.sender(&ctx.name()) {
            let _ = queue.send(signal);
        }
    }

    /// Polls for the broker's queue until the connection timeout.
    async fn find_broker(&self, ctx: &CommsContext, name: &str) -> Option<mpsc::UnboundedSender<ActionMessage>> {
        let deadline = Instant::now() + ctx.properties().connection_timeout;
        loop {
            if let Some(sender) = self.queues.sender(name) {
                return Some(sender);
            }
            if ctx.should_stop() || Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }
}

#[async_trait::async_trait]
impl Transport for InprocTransport {
    fn default_port(&self) -> Option<u16> {
        None
    }

    async fn receive_loop(self: Arc<Self>, ctx: Arc<CommsContext>) {
        let name = ctx.name();
        let Some(mut queue) = self.queues.register(&name) else {
            tracing::error!("{}: a local queue with this name already exists", name);
            ctx.set_rx_status(ConnectionStatus::Error);
            return;
        };
        ctx.set_rx_status(ConnectionStatus::Connected);

        loop {
            let message = tokio::select! {
                message = queue.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                _ = ctx.trip_wire().wait_for_trip() => break,
            };
            match process_inbound(&ctx, None, &name, message) {
                Inbound::Close => break,
                Inbound::Reply(_) | Inbound::Continue => {}
            }
        }
        self.queues.unregister(&name);
        ctx.set_rx_status(ConnectionStatus::Terminated);
    }

    async fn transmit_loop(self: Arc<Self>, ctx: Arc<CommsContext>) {
        let properties = ctx.properties();
        let broker = if properties.broker_target.is_empty() {
            if properties.require_broker_connection {
                tracing::error!("{}: a broker connection is required but none was given", properties.name);
                ctx.set_tx_status(ConnectionStatus::Error);
                return;
            }
            None
        } else {
            match self.find_broker(&ctx, &properties.broker_target).await {
                Some(broker) => Some(broker),
                None => {
                    if !ctx.should_stop() {
                        tracing::error!(
                            "{}: unable to find local broker {}",
                            properties.name,
                            properties.broker_target
                        );
                    }
                    ctx.set_tx_status(if ctx.should_stop() {
                        ConnectionStatus::Terminated
                    } else {
                        ConnectionStatus::Error
                    });
                    return;
                }
            }
        };
        ctx.set_tx_status(ConnectionStatus::Connected);

        let mut routes: RouteTable<mpsc::UnboundedSender<ActionMessage>> = RouteTable::new();
        loop {
            let (route, message) = tokio::select! {
                next = ctx.queue().pop() => next,
                _ = ctx.trip_wire().wait_for_trip() => break,
            };
            let (target, message) = if route == RouteId::CONTROL {
                match process_control(&ctx, message) {
                    Control::AddRoute(id, name) => {
                        match self.queues.sender(&name) {
                            Some(sender) => {
                                routes.insert(id, sender);
                            }
                            None => tracing::warn!("{}: no local queue named {}", properties.name, name),
                        }
                        continue;
                    }
                    Control::RemoveRoute(id) => {
                        routes.remove(id);
                        continue;
                    }
                    Control::Stop => break,
                    Control::Handled => continue,
                    Control::ToReceiver(message) => (self.queues.sender(&properties.name), message),
                }
            } else {
                (routes.resolve(route, broker.as_ref()).cloned(), message)
            };
            match target {
                Some(target) => {
                    if target.send(message).is_err() {
                        tracing::warn!("{}: local queue for route {} is closed", properties.name, route);
                    }
                }
                None => tracing::warn!("{}: no route for {} (route {})", properties.name, message, route),
            }
        }
        ctx.set_tx_status(ConnectionStatus::Terminated);
    }

    fn close_receiver(&self, ctx: &CommsContext) {
        self.signal_receiver(ctx, ActionMessage::protocol(ProtocolCommand::CloseReceiver));
    }

    fn reconnect_receiver(&self, ctx: &CommsContext) {
        self.signal_receiver(
            ctx,
            ActionMessage::priority_protocol(ProtocolCommand::ReconnectReceiver),
        );
    }

    fn address(&self, properties: &crate::comms::CommsProperties) -> String {
        properties.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_exclusive_while_live() {
        let queues = QueueRegistry::new();
        let first = queues.register("core").unwrap();
        assert!(queues.register("core").is_none());
        drop(first);
        // A dropped receiver frees the name
        let _second = queues.register("core").unwrap();
        assert_eq!(queues.names(), vec!["core".to_string()]);
        queues.unregister("core");
        assert!(!queues.contains("core"));
    }

    #[tokio::test]
    async fn clones_share_queues() {
        let queues = QueueRegistry::new();
        let mut receiver = queues.clone().register("broker").unwrap();
        let sender = queues.sender("broker").unwrap();
        sender.send(ActionMessage::default()).unwrap();
        assert!(receiver.recv().await.is_some());
    }
}
