use crate::node::{Application, NodeError, NodeHandle};
use cosim_comms_core::{Action, ActionMessage, RouteId};
use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};
use tokio::time::Instant;

/// Sends pings to the node's broker one at a time and records how long each
/// pong took. The counter carries the number of pings still to go; once it
/// reaches zero the node is shut down.
#[derive(Debug)]
pub struct Ping {
    count: u16,
    sent_at: Mutex<Option<Instant>>,
    round_trips: Mutex<Vec<Duration>>,
}

impl Ping {
    pub fn new(count: u16) -> Self {
        Self {
            count,
            sent_at: Mutex::new(None),
            round_trips: Mutex::new(Vec::new()),
        }
    }

    /// Round trip times of the pongs received so far, in order.
    pub fn round_trips(&self) -> Vec<Duration> {
        self.round_trips
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn send_ping(&self, node: &NodeHandle, remaining: u16) {
        let mut ping = ActionMessage::new(Action::PING);
        ping.counter = remaining;
        ping.set_string_data([node.address()]);
        *self.sent_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        node.send(RouteId::PARENT, ping);
    }
}

impl Application for Ping {
    fn start(&self, node: &NodeHandle) -> Result<(), NodeError> {
        if self.count == 0 {
            return Err(NodeError::Start("ping count must be at least one".into()));
        }
        self.send_ping(node, self.count);
        Ok(())
    }

    fn receive(&self, message: ActionMessage, node: &NodeHandle) {
        if message.action() != Action::PING_REPLY || message.dest_id != node.id() {
            tracing::debug!("Ping ignoring {}", message);
            return;
        }
        let sent_at = self
            .sent_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(sent_at) = sent_at else {
            tracing::warn!("Unexpected pong {}", message.counter);
            return;
        };
        let round_trip = sent_at.elapsed();
        self.round_trips
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(round_trip);
        tracing::info!("Pong {} after {:?}", message.counter, round_trip);

        let remaining = message.counter.saturating_sub(1);
        if remaining == 0 {
            tracing::info!("Every ping was answered, shutting down");
            node.shut_down();
        } else {
            self.send_ping(node, remaining);
        }
    }
}
