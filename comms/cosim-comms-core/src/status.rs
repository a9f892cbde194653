//! Connection status tracked separately for the receive and transmit sides.

use std::{
    fmt,
    sync::atomic::{AtomicI8, Ordering},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i8)]
pub enum ConnectionStatus {
    Startup = -1,
    Connected = 0,
    Reconnecting = 1,
    Terminated = 2,
    Error = 4,
}

impl ConnectionStatus {
    /// A graceful close may only begin from these states.
    pub fn is_open(self) -> bool {
        self <= Self::Connected
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }

    fn from_i8(value: i8) -> Self {
        match value {
            -1 => Self::Startup,
            0 => Self::Connected,
            1 => Self::Reconnecting,
            2 => Self::Terminated,
            _ => Self::Error,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Startup => "startup",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Terminated => "terminated",
            Self::Error => "error",
        };
        f.write_str(text)
    }
}

/// An atomically updated [`ConnectionStatus`].
#[derive(Debug)]
pub struct StatusCell(AtomicI8);

impl StatusCell {
    pub fn new() -> Self {
        Self(AtomicI8::new(ConnectionStatus::Startup as i8))
    }

    pub fn get(&self) -> ConnectionStatus {
        ConnectionStatus::from_i8(self.0.load(Ordering::Acquire))
    }

    /// Applies a transition if it is legal from the current state and
    /// returns whether it was applied.
    ///
    /// - `Connected` only follows `Startup` or `Reconnecting`
    /// - `Reconnecting` only follows `Connected`
    /// - `Terminated` and `Error` follow anything that is not already one of
    ///   them
    /// - `Startup` is never re-entered
    pub fn set(&self, status: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let allowed = match (ConnectionStatus::from_i8(current), status) {
                    (Startup | Reconnecting, Connected) => true,
                    (Connected, Reconnecting) => true,
                    (current, Terminated | Error) => !current.is_finished(),
                    _ => false,
                };
                allowed.then_some(status as i8)
            })
            .is_ok()
    }

    /// Sets the status unconditionally.
    pub fn force(&self, status: ConnectionStatus) {
        self.0.store(status as i8, Ordering::Release);
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionStatus::*;

    #[test]
    fn lifecycle() {
        let status = StatusCell::new();
        assert_eq!(status.get(), Startup);
        assert!(status.set(Connected));
        assert!(!status.set(Connected));
        assert!(status.set(Reconnecting));
        assert!(status.set(Connected));
        assert!(status.set(Terminated));
        assert!(!status.set(Error));
        assert!(!status.set(Connected));
        assert_eq!(status.get(), Terminated);
        status.force(Reconnecting);
        assert!(status.set(Connected));
    }

    #[test]
    fn open_states() {
        assert!(Startup.is_open());
        assert!(Connected.is_open());
        assert!(!Reconnecting.is_open());
        assert!(!Terminated.is_open());
        assert!(!Error.is_open());
    }

    #[test]
    fn startup_can_fail_directly() {
        let status = StatusCell::new();
        assert!(status.set(Error));
        assert_eq!(status.get(), Error);
    }
}
