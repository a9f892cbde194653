//! Command codes carried in the `action` field of every message.

use std::fmt;

/// Base value for commands that carry an extended info block.
pub const INFO_BASIS: i32 = 0x1000_0000;

/// Any action beyond this magnitude carries an extended info block.
pub const INFO_THRESHOLD: i32 = INFO_BASIS - 1;

/// A signed 32-bit command code.
///
/// Negative codes are priority commands and skip ahead of normal traffic in
/// the outbound queue. Codes whose magnitude exceeds [`INFO_THRESHOLD`] carry
/// an [`ExtendedInfo`](super::ExtendedInfo) block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Action(i32);

impl Action {
    pub const IGNORE: Action = Action(0);
    pub const TICK: Action = Action(1);
    pub const DISCONNECT: Action = Action(3);
    pub const PING: Action = Action(6);
    pub const PING_REPLY: Action = Action(7);
    pub const PRIORITY_ACK: Action = Action(-254);
    pub const SEND_MESSAGE: Action = Action(INFO_BASIS + 20);
    pub const QUERY: Action = Action(-(INFO_BASIS + 37));

    /// Transport-internal signaling.
    pub const PROTOCOL: Action = Action(60000);
    /// Transport-internal signaling that jumps the outbound queue.
    pub const PROTOCOL_PRIORITY: Action = Action(-60000);
    /// Transport-internal signaling with an extended info block.
    pub const PROTOCOL_BIG: Action = Action(INFO_BASIS + 60000);

    pub const fn new(code: i32) -> Self {
        Self(code)
    }

    pub const fn code(self) -> i32 {
        self.0
    }

    pub const fn is_priority(self) -> bool {
        self.0 < 0
    }

    pub const fn has_extended_info(self) -> bool {
        self.0 > INFO_THRESHOLD || self.0 < -INFO_THRESHOLD
    }

    pub const fn is_protocol(self) -> bool {
        matches!(self.0, 60000 | -60000) || self.0 == Self::PROTOCOL_BIG.0
    }
}

impl From<i32> for Action {
    fn from(code: i32) -> Self {
        Self(code)
    }
}

impl From<Action> for i32 {
    fn from(action: Action) -> Self {
        action.0
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IGNORE => write!(f, "ignore"),
            Self::TICK => write!(f, "tick"),
            Self::DISCONNECT => write!(f, "disconnect"),
            Self::PING => write!(f, "ping"),
            Self::PING_REPLY => write!(f, "ping_reply"),
            Self::PRIORITY_ACK => write!(f, "priority_ack"),
            Self::SEND_MESSAGE => write!(f, "send_message"),
            Self::QUERY => write!(f, "query"),
            Self::PROTOCOL => write!(f, "protocol"),
            Self::PROTOCOL_PRIORITY => write!(f, "protocol_priority"),
            Self::PROTOCOL_BIG => write!(f, "protocol_big"),
            Self(code) => write!(f, "action({code})"),
        }
    }
}

/// Sub-commands of the protocol actions, carried in the message id.
///
/// These never reach the message callback; transports consume them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ProtocolCommand {
    Ping = 10,
    Pong = 11,
    ConnectionRequest = 14,
    ConnectionAck = 15,
    NewBrokerInformation = 16,
    DelayConnection = 17,
    NewRoute = 233,
    RemoveRoute = 244,
    PortDefinitions = 1451,
    QueryPorts = 1453,
    RequestPorts = 1455,
    SetUsedPorts = 1457,
    ReconnectTransmitter = 1997,
    ReconnectReceiver = 1999,
    Disconnect = 2523,
    DisconnectError = 2623,
    CloseReceiver = 23425215,
}

impl ProtocolCommand {
    pub const fn id(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for ProtocolCommand {
    type Error = UnknownProtocolCommand;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            10 => Self::Ping,
            11 => Self::Pong,
            14 => Self::ConnectionRequest,
            15 => Self::ConnectionAck,
            16 => Self::NewBrokerInformation,
            17 => Self::DelayConnection,
            233 => Self::NewRoute,
            244 => Self::RemoveRoute,
            1451 => Self::PortDefinitions,
            1453 => Self::QueryPorts,
            1455 => Self::RequestPorts,
            1457 => Self::SetUsedPorts,
            1997 => Self::ReconnectTransmitter,
            1999 => Self::ReconnectReceiver,
            2523 => Self::Disconnect,
            2623 => Self::DisconnectError,
            23425215 => Self::CloseReceiver,
            other => Err(UnknownProtocolCommand(other))?,
        })
    }
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("Unknown protocol command id {0}")]
pub struct UnknownProtocolCommand(pub i32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_boundary() {
        assert!(!Action::new(INFO_THRESHOLD).has_extended_info());
        assert!(Action::new(INFO_BASIS).has_extended_info());
        assert!(!Action::new(-INFO_THRESHOLD).has_extended_info());
        assert!(Action::new(-INFO_BASIS).has_extended_info());
        assert!(Action::SEND_MESSAGE.has_extended_info());
        assert!(!Action::PROTOCOL_PRIORITY.has_extended_info());
    }

    #[test]
    fn protocol_predicate() {
        assert!(Action::PROTOCOL.is_protocol());
        assert!(Action::PROTOCOL_PRIORITY.is_protocol());
        assert!(Action::PROTOCOL_BIG.is_protocol());
        assert!(!Action::PING.is_protocol());
        assert!(!Action::new(60001).is_protocol());
        assert!(Action::PROTOCOL_PRIORITY.is_priority());
        assert!(!Action::PROTOCOL_BIG.is_priority());
    }

    #[test]
    fn protocol_ids_are_stable() {
        assert_eq!(ProtocolCommand::Ping.id(), 10);
        assert_eq!(ProtocolCommand::CloseReceiver.id(), 23425215);
        assert_eq!(ProtocolCommand::SetUsedPorts.id(), 1457);
        assert_eq!(
            ProtocolCommand::try_from(2623),
            Ok(ProtocolCommand::DisconnectError)
        );
        assert_eq!(
            ProtocolCommand::try_from(12),
            Err(UnknownProtocolCommand(12))
        );
    }
}
