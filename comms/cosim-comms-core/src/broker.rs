//! A broker's hold on its comms instance.
//!
//! Several tasks may try to shut a broker down at once (a disconnect
//! command, an error on another thread, the process exiting). The
//! [`DisconnectStage`] counter makes sure the comms instance is disconnected
//! exactly once and released only after that disconnect has finished.

use crate::{
    comms::{Comms, MessageCallback, DISCONNECT_POLL},
    message::ActionMessage,
    route::RouteId,
};
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc, Mutex, PoisonError,
};

/// How far a [`CommsBroker`] has got in shutting its comms down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DisconnectStage {
    Idle = 0,
    InProgress = 1,
    Disconnected = 2,
    TornDown = 3,
}

impl DisconnectStage {
    fn from_u8(stage: u8) -> Self {
        match stage {
            0 => Self::Idle,
            1 => Self::InProgress,
            2 => Self::Disconnected,
            _ => Self::TornDown,
        }
    }
}

pub struct CommsBroker {
    name: String,
    comms: Mutex<Option<Arc<dyn Comms>>>,
    stage: AtomicU8,
}

impl CommsBroker {
    pub fn new(name: impl Into<String>, comms: Arc<dyn Comms>) -> Self {
        Self {
            name: name.into(),
            comms: Mutex::new(Some(comms)),
            stage: AtomicU8::new(DisconnectStage::Idle as u8),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self) -> DisconnectStage {
        DisconnectStage::from_u8(self.stage.load(Ordering::Acquire))
    }

    /// The comms instance, until [`CommsBroker::teardown`] releases it.
    pub fn comms(&self) -> Option<Arc<dyn Comms>> {
        self.comms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn connect(&self) -> bool {
        match self.comms() {
            Some(comms) => comms.connect().await,
            None => false,
        }
    }

    pub fn set_callback(&self, callback: MessageCallback) -> bool {
        self.comms()
            .map_or(false, |comms| comms.set_callback(callback))
    }

    pub fn transmit(&self, route: RouteId, message: ActionMessage) {
        match self.comms() {
            Some(comms) => comms.transmit(route, message),
            None => tracing::warn!("{}: dropping {} after teardown", self.name, message),
        }
    }

    pub fn add_route(&self, route: RouteId, route_info: &str) {
        if let Some(comms) = self.comms() {
            comms.add_route(route, route_info);
        }
    }

    pub fn remove_route(&self, route: RouteId) {
        if let Some(comms) = self.comms() {
            comms.remove_route(route);
        }
    }

    fn advance(&self, from: DisconnectStage, to: DisconnectStage) -> Result<(), DisconnectStage> {
        self.stage
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(DisconnectStage::from_u8)
    }

    /// Disconnects the comms instance. Only the first caller does the work;
    /// the others wait until it is done.
    pub async fn comms_disconnect(&self) {
        if self
            .advance(DisconnectStage::Idle, DisconnectStage::InProgress)
            .is_ok()
        {
            if let Some(comms) = self.comms() {
                comms.disconnect().await;
            }
            self.stage
                .store(DisconnectStage::Disconnected as u8, Ordering::Release);
            return;
        }
        while self.stage() < DisconnectStage::Disconnected {
            tokio::time::sleep(DISCONNECT_POLL).await;
        }
    }

    /// Disconnects if nobody has yet, then releases the comms instance.
    /// Safe to call any number of times from any number of tasks.
    pub async fn teardown(&self) {
        loop {
            match self.advance(DisconnectStage::Disconnected, DisconnectStage::TornDown) {
                Ok(()) => break,
                Err(DisconnectStage::TornDown) => return,
                Err(DisconnectStage::Idle) => self.comms_disconnect().await,
                Err(_) => tokio::time::sleep(DISCONNECT_POLL).await,
            }
        }
        let released = self
            .comms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(released);
        tracing::debug!("{}: comms torn down", self.name);
    }
}

impl std::fmt::Debug for CommsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommsBroker")
            .field("name", &self.name)
            .field("stage", &self.stage())
            .finish()
    }
}

impl Drop for CommsBroker {
    fn drop(&mut self) {
        if self.stage() != DisconnectStage::TornDown {
            tracing::warn!("{}: broker dropped before its comms were torn down", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::NetworkBrokerData, status::ConnectionStatus};
    use std::{sync::atomic::AtomicUsize, time::Duration};

    /// Counts disconnects, each of which takes a while.
    #[derive(Default)]
    struct Slow {
        disconnects: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Comms for Slow {
        async fn connect(&self) -> bool {
            true
        }
        async fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        async fn reconnect(&self) -> bool {
            true
        }
        fn transmit(&self, _route: RouteId, _message: ActionMessage) {}
        fn add_route(&self, _route: RouteId, _route_info: &str) {}
        fn remove_route(&self, _route: RouteId) {}
        fn set_callback(&self, _callback: MessageCallback) -> bool {
            true
        }
        fn set_name(&self, _name: &str) -> bool {
            true
        }
        fn load_network_info(&self, _info: &NetworkBrokerData) -> bool {
            true
        }
        fn set_flag(&self, _flag: &str, _value: bool) -> bool {
            false
        }
        fn rx_status(&self) -> ConnectionStatus {
            ConnectionStatus::Connected
        }
        fn tx_status(&self) -> ConnectionStatus {
            ConnectionStatus::Connected
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn name(&self) -> String {
            "slow".into()
        }
        fn address(&self) -> String {
            "slow".into()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_teardown_disconnects_once() {
        let comms = Arc::new(Slow::default());
        let broker = Arc::new(CommsBroker::new("b1", comms.clone()));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let broker = broker.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    broker.comms_disconnect().await;
                    assert!(broker.stage() >= DisconnectStage::Disconnected);
                } else {
                    broker.teardown().await;
                    assert_eq!(broker.stage(), DisconnectStage::TornDown);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        broker.teardown().await;

        assert_eq!(comms.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(broker.stage(), DisconnectStage::TornDown);
        assert!(broker.comms().is_none());
        assert!(!broker.connect().await);
    }

    #[tokio::test]
    async fn teardown_from_idle() {
        let comms = Arc::new(Slow::default());
        let broker = CommsBroker::new("b2", comms.clone());
        assert_eq!(broker.stage(), DisconnectStage::Idle);
        assert!(broker.connect().await);
        broker.teardown().await;
        assert_eq!(comms.disconnects.load(Ordering::SeqCst), 1);
    }
}
