//! The envelope exchanged between simulation nodes.
//!
//! This module primarily implements [`ActionMessage`] and its command
//! taxonomy. The binary layout lives in [`framing`].

use bytes::Bytes;
use std::fmt;

pub mod action;
pub use action::{Action, ProtocolCommand, INFO_BASIS, INFO_THRESHOLD};

pub mod framing;
pub use framing::{FramingError, MIN_FRAME_SIZE};

/// Fields attached only to actions beyond [`INFO_THRESHOLD`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedInfo {
    /// The node that first sent the message, before any forwarding
    pub orig_source: i32,
    /// The node the message is ultimately meant for
    pub orig_dest: i32,
    pub sequence: i32,
    pub data: Bytes,
}

/// A command plus its addressing and optional data.
///
/// The extended info block is present exactly when the action calls for one;
/// [`ActionMessage::set_action`] keeps the two in agreement.
///
/// # Examples
///
/// ```
/// # use cosim_comms_core::message::{Action, ActionMessage, ProtocolCommand};
/// let mut message = ActionMessage::protocol(ProtocolCommand::NewRoute);
/// message.extra_data = 5;
/// message.payload = "localhost:9000".into();
/// assert!(message.is_protocol());
/// assert_eq!(message.protocol_command(), Some(ProtocolCommand::NewRoute));
/// assert!(message.info().is_none());
///
/// message.set_action(Action::PROTOCOL_BIG);
/// assert!(message.info().is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionMessage {
    action: Action,
    pub message_id: i32,
    pub source_id: i32,
    pub source_handle: i32,
    pub dest_id: i32,
    pub dest_handle: i32,
    pub counter: u16,
    pub flags: u16,
    /// A general purpose integer. Route ids and port numbers travel here.
    pub extra_data: i32,
    /// Simulation time in nanoseconds. Opaque to the transport layer.
    pub action_time: i64,
    pub payload: Bytes,
    strings: Vec<String>,
    info: Option<Box<ExtendedInfo>>,
}

impl ActionMessage {
    /// Creates an empty message for the given action.
    pub fn new(action: impl Into<Action>) -> Self {
        let action = action.into();
        Self {
            action,
            message_id: 0,
            source_id: 0,
            source_handle: 0,
            dest_id: 0,
            dest_handle: 0,
            counter: 0,
            flags: 0,
            extra_data: 0,
            action_time: 0,
            payload: Bytes::new(),
            strings: Vec::new(),
            info: action.has_extended_info().then(Default::default),
        }
    }

    /// Creates a normal priority protocol message.
    pub fn protocol(command: ProtocolCommand) -> Self {
        let mut message = Self::new(Action::PROTOCOL);
        message.message_id = command.id();
        message
    }

    /// Creates a protocol message that skips ahead of normal traffic.
    pub fn priority_protocol(command: ProtocolCommand) -> Self {
        let mut message = Self::new(Action::PROTOCOL_PRIORITY);
        message.message_id = command.id();
        message
    }

    pub fn action(&self) -> Action {
        self.action
    }

    /// Changes the action, adding or dropping the extended info block to
    /// match.
    pub fn set_action(&mut self, action: impl Into<Action>) {
        let action = action.into();
        match (action.has_extended_info(), self.info.is_some()) {
            (true, false) => self.info = Some(Default::default()),
            (false, true) => self.info = None,
            _ => {}
        }
        self.action = action;
    }

    pub fn is_priority(&self) -> bool {
        self.action.is_priority()
    }

    pub fn is_protocol(&self) -> bool {
        self.action.is_protocol()
    }

    /// The protocol sub-command, if this is a protocol message with a known
    /// message id.
    pub fn protocol_command(&self) -> Option<ProtocolCommand> {
        if !self.is_protocol() {
            return None;
        }
        ProtocolCommand::try_from(self.message_id).ok()
    }

    pub fn info(&self) -> Option<&ExtendedInfo> {
        self.info.as_deref()
    }

    pub fn info_mut(&mut self) -> Option<&mut ExtendedInfo> {
        self.info.as_deref_mut()
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    /// Gets the string at `index`, or an empty string if there is none.
    pub fn string(&self, index: usize) -> &str {
        self.strings.get(index).map(String::as_str).unwrap_or("")
    }

    pub fn set_string_data<I, S>(&mut self, strings: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.strings = strings.into_iter().map(Into::into).collect();
    }

    /// The payload as text. Invalid UTF-8 is replaced.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// The number of bytes this message occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        let strings: usize = self.strings.iter().map(|s| 4 + s.len()).sum();
        let info = self.info.as_ref().map_or(0, |info| 16 + info.data.len());
        MIN_FRAME_SIZE + self.payload.len() + strings + info
    }
}

impl Default for ActionMessage {
    fn default() -> Self {
        Self::new(Action::IGNORE)
    }
}

impl fmt::Display for ActionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol_command() {
            Some(command) => write!(f, "{}:{:?}", self.action, command),
            None => write!(
                f,
                "{} from {} to {}",
                self.action, self.source_id, self.dest_id
            ),
        }
    }
}
