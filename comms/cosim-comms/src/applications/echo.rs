use crate::node::{Application, NodeError, NodeHandle};
use cosim_comms_core::{Action, ActionMessage, RouteId};
use dashmap::DashMap;

/// Answers every ping with a pong carrying the same counter.
///
/// A ping names its sender's id and address; the first ping from a sender
/// adds a route to it, keyed by the sender's id.
#[derive(Debug, Default)]
pub struct Echo {
    /// Address of every sender seen so far, by id
    peers: DashMap<i32, String>,
}

impl Echo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

impl Application for Echo {
    fn start(&self, node: &NodeHandle) -> Result<(), NodeError> {
        tracing::info!("Echoing pings at {}", node.address());
        Ok(())
    }

    fn receive(&self, message: ActionMessage, node: &NodeHandle) {
        if message.action() != Action::PING {
            tracing::debug!("Echo ignoring {}", message);
            return;
        }
        let source = message.source_id;
        if source <= 0 {
            tracing::warn!("Ping from invalid source id {}", source);
            return;
        }
        let address = message.string(0);
        let known = self
            .peers
            .get(&source)
            .map_or(false, |peer| peer.value() == address);
        if !known && !address.is_empty() {
            self.peers.insert(source, address.to_string());
            node.add_route(RouteId(source), address);
        }
        tracing::info!("Ping {}", message.counter);

        let mut pong = ActionMessage::new(Action::PING_REPLY);
        pong.counter = message.counter;
        pong.dest_id = source;
        node.send(RouteId(source), pong);
    }
}
