//! Binary layout of an [`ActionMessage`].
//!
//! All integers are big endian. A frame is a fixed header followed by the
//! payload, the string list, and, for actions that carry one, the extended
//! info block:
//!
//! ```text
//! action | message_id | source_id | source_handle | dest_id | dest_handle
//! counter | flags | extra_data | action_time | info marker
//! payload length | payload | string count | (length | utf8)*
//! [orig_source | orig_dest | sequence | data length | data]
//! ```

use super::{Action, ActionMessage};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error as ThisError;

/// The size of a frame with no payload, no strings, and no extended info.
pub const MIN_FRAME_SIZE: usize = 6 * 4 + 2 + 2 + 4 + 8 + 1 + 4 + 2;

impl ActionMessage {
    /// Serializes the message into a single frame. Fails if a length does
    /// not fit its field.
    pub fn to_bytes(&self) -> Result<Bytes, FramingError> {
        let string_count = u16::try_from(self.strings().len()).map_err(|_| FramingError::TooLong {
            field: "string count",
            len: self.strings().len(),
        })?;
        let mut out = BytesMut::with_capacity(self.encoded_len());
        out.put_i32(self.action().code());
        out.put_i32(self.message_id);
        out.put_i32(self.source_id);
        out.put_i32(self.source_handle);
        out.put_i32(self.dest_id);
        out.put_i32(self.dest_handle);
        out.put_u16(self.counter);
        out.put_u16(self.flags);
        out.put_i32(self.extra_data);
        out.put_i64(self.action_time);
        out.put_u8(self.info().is_some() as u8);
        out.put_u32(length("payload", self.payload.len())?);
        out.put_slice(&self.payload);
        out.put_u16(string_count);
        for string in self.strings() {
            out.put_u32(length("string", string.len())?);
            out.put_slice(string.as_bytes());
        }
        if let Some(info) = self.info() {
            out.put_i32(info.orig_source);
            out.put_i32(info.orig_dest);
            out.put_i32(info.sequence);
            out.put_u32(length("info data", info.data.len())?);
            out.put_slice(&info.data);
        }
        Ok(out.freeze())
    }

    /// Parses a message from exactly one frame.
    pub fn from_bytes(frame: &[u8]) -> Result<Self, FramingError> {
        if frame.len() < MIN_FRAME_SIZE {
            Err(FramingError::TooShort {
                needed: MIN_FRAME_SIZE,
                available: frame.len(),
            })?
        }
        let mut reader = FrameReader { frame, position: 0 };

        let action = Action::new(reader.i32()?);
        let mut message = ActionMessage::new(action);
        message.message_id = reader.i32()?;
        message.source_id = reader.i32()?;
        message.source_handle = reader.i32()?;
        message.dest_id = reader.i32()?;
        message.dest_handle = reader.i32()?;
        message.counter = reader.u16()?;
        message.flags = reader.u16()?;
        message.extra_data = reader.i32()?;
        message.action_time = reader.i64()?;

        let marker = match reader.u8()? {
            0 => false,
            1 => true,
            other => Err(FramingError::InvalidMarker(other))?,
        };
        if marker != action.has_extended_info() {
            Err(FramingError::InfoMismatch { action, marker })?
        }

        let payload_len = reader.u32()? as usize;
        message.payload = Bytes::copy_from_slice(reader.take(payload_len)?);

        let string_count = reader.u16()?;
        let mut strings = Vec::with_capacity(string_count as usize);
        for _ in 0..string_count {
            let len = reader.u32()? as usize;
            let text = std::str::from_utf8(reader.take(len)?)
                .map_err(|_| FramingError::InvalidUtf8)?;
            strings.push(text.to_string());
        }
        message.set_string_data(strings);

        if let Some(info) = message.info_mut() {
            info.orig_source = reader.i32()?;
            info.orig_dest = reader.i32()?;
            info.sequence = reader.i32()?;
            let data_len = reader.u32()? as usize;
            info.data = Bytes::copy_from_slice(reader.take(data_len)?);
        }

        match reader.remaining() {
            0 => Ok(message),
            extra => Err(FramingError::TrailingBytes(extra)),
        }
    }
}

impl TryFrom<&[u8]> for ActionMessage {
    type Error = FramingError;

    fn try_from(frame: &[u8]) -> Result<Self, Self::Error> {
        Self::from_bytes(frame)
    }
}

impl TryFrom<&ActionMessage> for Bytes {
    type Error = FramingError;

    fn try_from(message: &ActionMessage) -> Result<Self, Self::Error> {
        message.to_bytes()
    }
}

fn length(field: &'static str, len: usize) -> Result<u32, FramingError> {
    u32::try_from(len).map_err(|_| FramingError::TooLong { field, len })
}

struct FrameReader<'a> {
    frame: &'a [u8],
    position: usize,
}

impl<'a> FrameReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], FramingError> {
        let end = self.position.checked_add(len).filter(|end| *end <= self.frame.len());
        let end = end.ok_or(FramingError::TooShort {
            needed: self.position.saturating_add(len),
            available: self.frame.len(),
        })?;
        let bytes = &self.frame[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], FramingError> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, FramingError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, FramingError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, FramingError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, FramingError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, FramingError> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    fn remaining(&self) -> usize {
        self.frame.len() - self.position
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    #[error("Frame too short: needed {needed} bytes but only {available} were available")]
    TooShort { needed: usize, available: usize },
    #[error("Action {action} disagrees with the encoded info marker {marker}")]
    InfoMismatch { action: Action, marker: bool },
    #[error("Invalid info marker byte {0:#04x}")]
    InvalidMarker(u8),
    #[error("A string field was not valid UTF-8")]
    InvalidUtf8,
    #[error("{0} unexpected bytes after the end of the frame")]
    TrailingBytes(usize),
    #[error("The {field} length {len} does not fit in a frame")]
    TooLong { field: &'static str, len: usize },
}
