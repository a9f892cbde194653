//! Logging holds wrapper functions for structured events emitted by the
//! transports. Subscribers can select them with the `MESSAGE` target.

use crate::message::ActionMessage;
use std::fmt::Display;
use tracing::{event, Level};

/// Which way a logged message was travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// Message event handler.
/// Used to log any messages a transport sends or receives. Captures the
/// following data: comms name, direction, peer, action, message id, size
pub fn message_event(
    comms: &str,
    direction: Direction,
    peer: &dyn Display,
    message: &ActionMessage,
) {
    event!(
        target: "MESSAGE",
        Level::TRACE,
        comms = comms,
        direction = ?direction,
        peer = %peer,
        action = %message.action(),
        message_id = message.message_id,
        size = message.encoded_len(),
    );
}
