//! The connection lifecycle shared by every transport.
//!
//! A transport only supplies its two loops and a way to close its receiver
//! (the [`Transport`] trait). [`CommsInterface`] wraps any transport and owns
//! everything else: status bookkeeping, the outbound queue, the message
//! callback, and the polling that drives connect, disconnect, and reconnect.
//!
//! # Lifecycle
//!
//! 1. Configure the instance (`set_callback`, `load_network_info`, ...). Every
//!    setter goes through the property lock and is refused once the instance
//!    is operating.
//! 2. [`CommsInterface::connect`] spawns one receive task and one transmit
//!    task and waits for both to report [`ConnectionStatus::Connected`].
//! 3. [`CommsInterface::transmit`] queues messages for the transmit task.
//! 4. [`CommsInterface::disconnect`] asks both tasks to close and waits for
//!    them, giving up on a side after twenty seconds.

use crate::{
    config::{InterfaceNetworks, NetworkBrokerData},
    message::{ActionMessage, ProtocolCommand},
    queue::TxQueue,
    route::RouteId,
    status::{ConnectionStatus, StatusCell},
    trip_wire::TripWire,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
    time::Duration,
};
use tokio::task::JoinHandle;

/// Receives every inbound message that is not a protocol command.
pub type MessageCallback = Arc<dyn Fn(ActionMessage) + Send + Sync>;

/// How often `connect` checks on the two loops.
pub const CONNECT_POLL: Duration = Duration::from_millis(100);
/// How often `disconnect` and `reconnect` check on the two loops.
pub const DISCONNECT_POLL: Duration = Duration::from_millis(50);
/// Polls per side before `disconnect` or `reconnect` gives up (twenty seconds).
pub const DISCONNECT_POLL_LIMIT: u32 = 400;
/// The close request is sent again after this many polls.
pub const CLOSE_REISSUE_INTERVAL: u32 = 32;
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(4000);
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 256;
/// Data messages the outbound queue holds before it starts dropping them.
pub const DEFAULT_MAX_MESSAGE_COUNT: usize = 256;

/// Configuration of a comms instance. Frozen once the instance connects.
#[derive(Debug, Clone)]
pub struct CommsProperties {
    pub name: String,
    pub local_target: String,
    pub broker_target: String,
    pub broker_name: String,
    pub broker_init_string: String,
    pub max_message_size: usize,
    pub max_message_count: usize,
    pub connection_timeout: Duration,
    pub interface_network: InterfaceNetworks,
    /// Whether this node serves sub-brokers
    pub server_mode: bool,
    /// Fail the connection instead of running as a root when no broker is
    /// reachable
    pub require_broker_connection: bool,
}

impl Default for CommsProperties {
    fn default() -> Self {
        Self {
            name: String::new(),
            local_target: String::new(),
            broker_target: String::new(),
            broker_name: String::new(),
            broker_init_string: String::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_message_count: DEFAULT_MAX_MESSAGE_COUNT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            interface_network: InterfaceNetworks::Local,
            server_mode: true,
            require_broker_connection: false,
        }
    }
}

impl CommsProperties {
    /// Copies the transport independent parts of a network configuration.
    pub fn apply_network_info(&mut self, info: &NetworkBrokerData) {
        let mut info = info.clone();
        info.fill_connection_address(self.require_broker_connection);
        self.broker_name = info.broker_name.clone();
        self.broker_init_string = info.broker_init_string.clone();
        self.broker_target = info.broker_address.clone();
        self.local_target = info.local_interface.clone();
        self.max_message_size = info.max_message_size;
        self.max_message_count = info.max_message_count;
        self.connection_timeout = info.connection_timeout();
        self.interface_network = info.interface_network;
        self.server_mode = info.server_mode.apply(self.server_mode);
    }
}

/// State shared between a [`CommsInterface`] and its two loops.
pub struct CommsContext {
    properties: Mutex<CommsProperties>,
    operating: AtomicBool,
    rx_status: StatusCell,
    tx_status: StatusCell,
    queue: TxQueue,
    callback: RwLock<Option<MessageCallback>>,
    request_disconnect: AtomicBool,
    trip_wire: TripWire,
}

impl CommsContext {
    pub fn new(trip_wire: TripWire) -> Self {
        Self {
            properties: Mutex::new(CommsProperties::default()),
            operating: AtomicBool::new(false),
            rx_status: StatusCell::new(),
            tx_status: StatusCell::new(),
            queue: TxQueue::new(),
            callback: RwLock::new(None),
            request_disconnect: AtomicBool::new(false),
            trip_wire,
        }
    }

    /// A snapshot of the configuration.
    pub fn properties(&self) -> CommsProperties {
        self.properties
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn name(&self) -> String {
        self.properties
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .name
            .clone()
    }

    /// Grants write access to the configuration, or `None` once the instance
    /// is operating.
    pub fn property_lock(&self) -> Option<MutexGuard<'_, CommsProperties>> {
        if self.is_operating() {
            return None;
        }
        let guard = self
            .properties
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Connect may have started while we waited for the lock
        if self.is_operating() {
            return None;
        }
        Some(guard)
    }

    pub fn is_operating(&self) -> bool {
        self.operating.load(Ordering::Acquire)
    }

    pub fn rx_status(&self) -> ConnectionStatus {
        self.rx_status.get()
    }

    pub fn tx_status(&self) -> ConnectionStatus {
        self.tx_status.get()
    }

    /// Reports a receive side transition. Illegal transitions are ignored.
    pub fn set_rx_status(&self, status: ConnectionStatus) -> bool {
        self.rx_status.set(status)
    }

    /// Reports a transmit side transition. Illegal transitions are ignored.
    pub fn set_tx_status(&self, status: ConnectionStatus) -> bool {
        self.tx_status.set(status)
    }

    pub(crate) fn force_status(&self, side: Side, status: ConnectionStatus) {
        match side {
            Side::Receive => self.rx_status.force(status),
            Side::Transmit => self.tx_status.force(status),
        }
    }

    fn status(&self, side: Side) -> ConnectionStatus {
        match side {
            Side::Receive => self.rx_status(),
            Side::Transmit => self.tx_status(),
        }
    }

    pub fn queue(&self) -> &TxQueue {
        &self.queue
    }

    pub fn transmit(&self, route: RouteId, message: ActionMessage) {
        if let Err(message) = self.queue.push(route, message) {
            tracing::warn!(
                "{}: outbound queue is full ({} waiting), dropping {}",
                self.name(),
                self.queue.len(),
                message
            );
        }
    }

    /// Hands an inbound message to the registered callback.
    pub fn deliver(&self, message: ActionMessage) {
        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match callback {
            Some(callback) => callback(message),
            None => tracing::warn!("Dropping {} with no callback registered", message),
        }
    }

    pub(crate) fn install_callback(&self, callback: MessageCallback) {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn has_callback(&self) -> bool {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn disconnect_requested(&self) -> bool {
        self.request_disconnect.load(Ordering::Acquire)
    }

    pub fn trip_wire(&self) -> &TripWire {
        &self.trip_wire
    }

    /// Whether a loop should stop what it is doing and exit.
    pub fn should_stop(&self) -> bool {
        self.disconnect_requested() || self.trip_wire.is_tripped()
    }
}

/// One direction of a comms instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Receive,
    Transmit,
}

/// A concrete way of moving bytes between nodes.
///
/// Implementors provide the receive and transmit loops. The loops report
/// their progress through [`CommsContext::set_rx_status`] and
/// [`CommsContext::set_tx_status`]: `Connected` once they are ready, then
/// `Terminated` or `Error` when they exit. The transmit loop is the only place
/// a transport's route table lives.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The well-known port used when nothing else is configured, if the
    /// transport uses ports at all.
    fn default_port(&self) -> Option<u16>;

    async fn receive_loop(self: Arc<Self>, ctx: Arc<CommsContext>);

    async fn transmit_loop(self: Arc<Self>, ctx: Arc<CommsContext>);

    /// Asks the receive loop to exit.
    fn close_receiver(&self, ctx: &CommsContext) {
        ctx.transmit(
            RouteId::CONTROL,
            ActionMessage::protocol(ProtocolCommand::CloseReceiver),
        );
    }

    /// Asks the transmit loop to exit once it has sent what is queued.
    fn close_transmitter(&self, ctx: &CommsContext) {
        ctx.transmit(
            RouteId::CONTROL,
            ActionMessage::protocol(ProtocolCommand::Disconnect),
        );
    }

    fn reconnect_receiver(&self, ctx: &CommsContext) {
        ctx.transmit(
            RouteId::CONTROL,
            ActionMessage::priority_protocol(ProtocolCommand::ReconnectReceiver),
        );
    }

    fn reconnect_transmitter(&self, ctx: &CommsContext) {
        ctx.transmit(
            RouteId::CONTROL,
            ActionMessage::priority_protocol(ProtocolCommand::ReconnectTransmitter),
        );
    }

    /// Applies the transport specific parts of a configuration. Called with
    /// the property lock held, after the generic parts were applied.
    fn load_network_info(&self, _info: &NetworkBrokerData, _properties: &mut CommsProperties) {}

    /// Sets a transport specific flag. Returns `false` if the flag is unknown.
    fn set_flag(&self, _flag: &str, _value: bool) -> bool {
        false
    }

    /// How other nodes reach this one.
    fn address(&self, properties: &CommsProperties) -> String {
        properties.name.clone()
    }
}

/// The object safe face of a comms instance, used by brokers and the
/// registry.
#[async_trait::async_trait]
pub trait Comms: Send + Sync {
    async fn connect(&self) -> bool;
    async fn disconnect(&self);
    async fn reconnect(&self) -> bool;
    fn transmit(&self, route: RouteId, message: ActionMessage);
    fn add_route(&self, route: RouteId, route_info: &str);
    fn remove_route(&self, route: RouteId);
    fn set_callback(&self, callback: MessageCallback) -> bool;
    fn set_name(&self, name: &str) -> bool;
    fn load_network_info(&self, info: &NetworkBrokerData) -> bool;
    fn set_flag(&self, flag: &str, value: bool) -> bool;
    fn rx_status(&self) -> ConnectionStatus;
    fn tx_status(&self) -> ConnectionStatus;
    fn is_connected(&self) -> bool;
    fn name(&self) -> String;
    fn address(&self) -> String;
}

enum LoopStart {
    Started,
    AlreadyRunning,
    Refused,
}

#[derive(Default)]
struct LoopTasks {
    rx: Option<JoinHandle<()>>,
    tx: Option<JoinHandle<()>>,
}

/// Drives the lifecycle of one transport.
pub struct CommsInterface<T: Transport> {
    transport: Arc<T>,
    ctx: Arc<CommsContext>,
    tasks: Mutex<LoopTasks>,
    spawned: AtomicUsize,
}

impl<T: Transport> CommsInterface<T> {
    pub fn new(transport: T) -> Self {
        Self::with_trip_wire(transport, TripWire::new())
    }

    pub fn with_trip_wire(transport: T, trip_wire: TripWire) -> Self {
        Self {
            transport: Arc::new(transport),
            ctx: Arc::new(CommsContext::new(trip_wire)),
            tasks: Mutex::new(LoopTasks::default()),
            spawned: AtomicUsize::new(0),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn context(&self) -> &Arc<CommsContext> {
        &self.ctx
    }

    /// How many loop tasks have been started over the life of the instance.
    pub fn loops_spawned(&self) -> usize {
        self.spawned.load(Ordering::Acquire)
    }

    pub fn set_callback(&self, callback: MessageCallback) -> bool {
        let Some(_properties) = self.ctx.property_lock() else {
            return false;
        };
        self.ctx.install_callback(callback);
        true
    }

    pub fn set_name(&self, name: impl Into<String>) -> bool {
        self.update(|properties| properties.name = name.into())
    }

    pub fn set_broker_target(&self, target: impl Into<String>) -> bool {
        self.update(|properties| properties.broker_target = target.into())
    }

    pub fn set_local_target(&self, target: impl Into<String>) -> bool {
        self.update(|properties| properties.local_target = target.into())
    }

    pub fn set_message_size(&self, max_size: usize, max_count: usize) -> bool {
        self.update(|properties| {
            if max_size > 0 {
                properties.max_message_size = max_size;
            }
            if max_count > 0 {
                properties.max_message_count = max_count;
            }
        })
    }

    pub fn set_timeout(&self, timeout: Duration) -> bool {
        self.update(|properties| properties.connection_timeout = timeout)
    }

    pub fn set_server_mode(&self, server_mode: bool) -> bool {
        self.update(|properties| properties.server_mode = server_mode)
    }

    pub fn set_require_broker_connection(&self, required: bool) -> bool {
        self.update(|properties| properties.require_broker_connection = required)
    }

    /// Sets a named flag, falling back to the transport for flags the
    /// generic layer does not know.
    pub fn set_flag(&self, flag: &str, value: bool) -> bool {
        match flag {
            "server_mode" | "server" => self.set_server_mode(value),
            _ => {
                let Some(_properties) = self.ctx.property_lock() else {
                    return false;
                };
                let known = self.transport.set_flag(flag, value);
                if !known {
                    tracing::warn!("Unrecognized flag: {}", flag);
                }
                known
            }
        }
    }

    pub fn load_network_info(&self, info: &NetworkBrokerData) -> bool {
        let Some(mut properties) = self.ctx.property_lock() else {
            return false;
        };
        properties.apply_network_info(info);
        self.transport.load_network_info(info, &mut properties);
        true
    }

    fn update(&self, change: impl FnOnce(&mut CommsProperties)) -> bool {
        match self.ctx.property_lock() {
            Some(mut properties) => {
                change(&mut properties);
                true
            }
            None => false,
        }
    }

    pub fn rx_status(&self) -> ConnectionStatus {
        self.ctx.rx_status()
    }

    pub fn tx_status(&self) -> ConnectionStatus {
        self.ctx.tx_status()
    }

    pub fn is_connected(&self) -> bool {
        self.rx_status() == ConnectionStatus::Connected
            && self.tx_status() == ConnectionStatus::Connected
    }

    pub fn name(&self) -> String {
        self.ctx.name()
    }

    pub fn address(&self) -> String {
        self.transport.address(&self.ctx.properties())
    }

    pub fn transmit(&self, route: RouteId, message: ActionMessage) {
        self.ctx.transmit(route, message);
    }

    /// Tells the transmit task where `route` leads.
    pub fn add_route(&self, route: RouteId, route_info: &str) {
        let mut message = ActionMessage::priority_protocol(ProtocolCommand::NewRoute);
        message.payload = route_info.to_string().into();
        message.extra_data = route.id();
        self.ctx.transmit(RouteId::CONTROL, message);
    }

    pub fn remove_route(&self, route: RouteId) {
        let mut message = ActionMessage::protocol(ProtocolCommand::RemoveRoute);
        message.extra_data = route.id();
        self.ctx.transmit(RouteId::CONTROL, message);
    }

    /// Starts the receive and transmit tasks and waits until both are
    /// connected or one of them has failed. Calling it again on a connected
    /// instance returns `true` without starting anything.
    pub async fn connect(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        match self.start_loops() {
            LoopStart::Started => self.wait_for_startup().await,
            LoopStart::AlreadyRunning => {
                self.wait_for_startup().await;
                return self.is_connected();
            }
            LoopStart::Refused => return false,
        }

        let name = self.name();
        let rx = self.rx_status();
        let tx = self.tx_status();
        if rx != ConnectionStatus::Connected {
            if !self.ctx.disconnect_requested() {
                tracing::error!("{}: receiver connection failure ({})", name, rx);
            }
            if tx == ConnectionStatus::Connected {
                self.transport.close_transmitter(&self.ctx);
            }
            self.join_loops().await;
            return false;
        }
        if tx != ConnectionStatus::Connected {
            if !self.ctx.disconnect_requested() {
                tracing::error!("{}: transmitter connection failure ({})", name, tx);
            }
            self.transport.close_receiver(&self.ctx);
            self.join_loops().await;
            return false;
        }
        true
    }

    /// Spawns the loops unless they were already started.
    fn start_loops(&self) -> LoopStart {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.rx.is_some() || tasks.tx.is_some() {
            return LoopStart::AlreadyRunning;
        }
        if self.ctx.rx_status() != ConnectionStatus::Startup
            || self.ctx.tx_status() != ConnectionStatus::Startup
        {
            return LoopStart::Refused;
        }
        if !self.ctx.has_callback() {
            tracing::error!("No message callback set before connecting");
            self.ctx.rx_status.force(ConnectionStatus::Error);
            self.ctx.tx_status.force(ConnectionStatus::Error);
            return LoopStart::Refused;
        }
        {
            let Some(mut properties) = self.ctx.property_lock() else {
                return LoopStart::Refused;
            };
            if properties.name.is_empty() {
                properties.name = properties.local_target.clone();
            }
            if properties.local_target.is_empty() {
                properties.local_target = properties.name.clone();
            }
            self.ctx.queue.set_capacity(properties.max_message_count);
            self.ctx.operating.store(true, Ordering::Release);
        }

        tasks.rx = Some(self.spawn_loop(Side::Receive));
        tasks.tx = Some(self.spawn_loop(Side::Transmit));
        LoopStart::Started
    }

    fn spawn_loop(&self, side: Side) -> JoinHandle<()> {
        self.spawned.fetch_add(1, Ordering::AcqRel);
        let transport = self.transport.clone();
        let ctx = self.ctx.clone();
        match side {
            Side::Receive => tokio::spawn(transport.receive_loop(ctx)),
            Side::Transmit => tokio::spawn(transport.transmit_loop(ctx)),
        }
    }

    async fn wait_for_startup(&self) {
        while self.rx_status() == ConnectionStatus::Startup
            || self.tx_status() == ConnectionStatus::Startup
        {
            if self.ctx.trip_wire.is_tripped() {
                self.ctx.force_status(Side::Receive, ConnectionStatus::Terminated);
                self.ctx.force_status(Side::Transmit, ConnectionStatus::Terminated);
                return;
            }
            tokio::time::sleep(CONNECT_POLL).await;
        }
    }

    /// Closes the receiver, then the transmitter, waiting at most twenty
    /// seconds for each.
    pub async fn disconnect(&self) {
        if !self.ctx.is_operating() {
            if let Some(_properties) = self.ctx.property_lock() {
                self.ctx.force_status(Side::Receive, ConnectionStatus::Terminated);
                self.ctx.force_status(Side::Transmit, ConnectionStatus::Terminated);
                return;
            }
        }
        self.ctx.request_disconnect.store(true, Ordering::Release);
        if self.rx_status().is_open() {
            self.transport.close_receiver(&self.ctx);
        }
        if self.tx_status().is_open() {
            self.transport.close_transmitter(&self.ctx);
        }
        if self.ctx.trip_wire.is_tripped() {
            self.ctx.force_status(Side::Receive, ConnectionStatus::Terminated);
            self.ctx.force_status(Side::Transmit, ConnectionStatus::Terminated);
        } else if self.wait_for_close(Side::Receive).await {
            self.wait_for_close(Side::Transmit).await;
        }
        self.join_loops().await;
    }

    /// Polls until `side` has closed. Returns `false` if the trip wire cut
    /// the wait short.
    async fn wait_for_close(&self, side: Side) -> bool {
        let mut polls = 0;
        while self.ctx.status(side).is_open() {
            if self.ctx.trip_wire.is_tripped() {
                self.ctx.force_status(Side::Receive, ConnectionStatus::Terminated);
                self.ctx.force_status(Side::Transmit, ConnectionStatus::Terminated);
                return false;
            }
            tokio::time::sleep(DISCONNECT_POLL).await;
            polls += 1;
            if polls % CLOSE_REISSUE_INTERVAL == 0 {
                match side {
                    Side::Receive => self.transport.close_receiver(&self.ctx),
                    Side::Transmit => self.transport.close_transmitter(&self.ctx),
                }
            }
            if polls >= DISCONNECT_POLL_LIMIT {
                tracing::error!(
                    "{}: unable to terminate {:?} connection, giving up",
                    self.name(),
                    side
                );
                self.ctx.force_status(side, ConnectionStatus::Terminated);
                self.abort_loop(side);
                break;
            }
        }
        true
    }

    fn abort_loop(&self, side: Side) {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let task = match side {
            Side::Receive => tasks.rx.as_ref(),
            Side::Transmit => tasks.tx.as_ref(),
        };
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Waits for both loop tasks to finish, aborting any that linger.
    async fn join_loops(&self) {
        let (rx, tx) = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            (tasks.rx.take(), tasks.tx.take())
        };
        for mut task in [rx, tx].into_iter().flatten() {
            if tokio::time::timeout(Duration::from_secs(1), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
    }

    /// Tries to bring both sides back to `Connected`. Loops that have exited
    /// are started again.
    pub async fn reconnect(&self) -> bool {
        if !self.ctx.is_operating() || self.ctx.disconnect_requested() {
            tracing::warn!("{}: cannot reconnect an instance that is not running", self.name());
            return false;
        }
        self.ctx.force_status(Side::Receive, ConnectionStatus::Reconnecting);
        self.ctx.force_status(Side::Transmit, ConnectionStatus::Reconnecting);
        self.restart_finished_loops();
        self.transport.reconnect_receiver(&self.ctx);
        self.transport.reconnect_transmitter(&self.ctx);

        for side in [Side::Receive, Side::Transmit] {
            let mut polls = 0;
            while self.ctx.status(side) == ConnectionStatus::Reconnecting {
                if self.ctx.trip_wire.is_tripped() {
                    self.ctx.force_status(Side::Receive, ConnectionStatus::Terminated);
                    self.ctx.force_status(Side::Transmit, ConnectionStatus::Terminated);
                    return false;
                }
                tokio::time::sleep(DISCONNECT_POLL).await;
                polls += 1;
                if polls >= DISCONNECT_POLL_LIMIT {
                    tracing::error!("{}: unable to reconnect {:?} side", self.name(), side);
                    return false;
                }
            }
        }
        self.is_connected()
    }

    fn restart_finished_loops(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.rx.as_ref().map_or(true, JoinHandle::is_finished) {
            tasks.rx = Some(self.spawn_loop(Side::Receive));
        }
        if tasks.tx.as_ref().map_or(true, JoinHandle::is_finished) {
            tasks.tx = Some(self.spawn_loop(Side::Transmit));
        }
    }
}

impl<T: Transport> Drop for CommsInterface<T> {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        let running = [tasks.rx.take(), tasks.tx.take()];
        for task in running.into_iter().flatten() {
            if !task.is_finished() {
                tracing::warn!("Comms dropped while its loops were still running");
            }
            task.abort();
        }
    }
}

#[async_trait::async_trait]
impl<T: Transport> Comms for CommsInterface<T> {
    async fn connect(&self) -> bool {
        CommsInterface::connect(self).await
    }

    async fn disconnect(&self) {
        CommsInterface::disconnect(self).await
    }

    async fn reconnect(&self) -> bool {
        CommsInterface::reconnect(self).await
    }

    fn transmit(&self, route: RouteId, message: ActionMessage) {
        CommsInterface::transmit(self, route, message)
    }

    fn add_route(&self, route: RouteId, route_info: &str) {
        CommsInterface::add_route(self, route, route_info)
    }

    fn remove_route(&self, route: RouteId) {
        CommsInterface::remove_route(self, route)
    }

    fn set_callback(&self, callback: MessageCallback) -> bool {
        CommsInterface::set_callback(self, callback)
    }

    fn set_name(&self, name: &str) -> bool {
        CommsInterface::set_name(self, name)
    }

    fn load_network_info(&self, info: &NetworkBrokerData) -> bool {
        CommsInterface::load_network_info(self, info)
    }

    fn set_flag(&self, flag: &str, value: bool) -> bool {
        CommsInterface::set_flag(self, flag, value)
    }

    fn rx_status(&self) -> ConnectionStatus {
        CommsInterface::rx_status(self)
    }

    fn tx_status(&self) -> ConnectionStatus {
        CommsInterface::tx_status(self)
    }

    fn is_connected(&self) -> bool {
        CommsInterface::is_connected(self)
    }

    fn name(&self) -> String {
        CommsInterface::name(self)
    }

    fn address(&self) -> String {
        CommsInterface::address(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    #[async_trait::async_trait]
    impl Transport for Idle {
        fn default_port(&self) -> Option<u16> {
            None
        }

        async fn receive_loop(self: Arc<Self>, ctx: Arc<CommsContext>) {
            ctx.set_rx_status(ConnectionStatus::Connected);
        }

        async fn transmit_loop(self: Arc<Self>, ctx: Arc<CommsContext>) {
            ctx.set_tx_status(ConnectionStatus::Connected);
        }
    }

    #[test]
    fn properties_lock_until_operating() {
        let comms = CommsInterface::new(Idle);
        assert!(comms.set_name("alpha"));
        assert!(comms.set_message_size(1024, 0));
        let properties = comms.context().properties();
        assert_eq!(properties.name, "alpha");
        assert_eq!(properties.max_message_size, 1024);
        assert_eq!(properties.max_message_count, DEFAULT_MAX_MESSAGE_COUNT);

        comms.context().operating.store(true, Ordering::Release);
        assert!(!comms.set_name("beta"));
        assert!(!comms.set_callback(Arc::new(|_| {})));
        assert!(!comms.context().has_callback());
        assert_eq!(comms.name(), "alpha");
    }

    #[tokio::test]
    async fn queue_capacity_follows_message_count() {
        let comms = CommsInterface::new(Idle);
        comms.set_message_size(0, 3);
        comms.set_callback(Arc::new(|_| {}));
        assert_eq!(comms.context().queue().capacity(), 0);
        assert!(comms.connect().await);
        assert_eq!(comms.context().queue().capacity(), 3);
    }

    /// Blocks in `set_flag` until released.
    struct Gated {
        entered: std::sync::mpsc::SyncSender<()>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    #[async_trait::async_trait]
    impl Transport for Gated {
        fn default_port(&self) -> Option<u16> {
            None
        }

        async fn receive_loop(self: Arc<Self>, ctx: Arc<CommsContext>) {
            ctx.set_rx_status(ConnectionStatus::Connected);
        }

        async fn transmit_loop(self: Arc<Self>, ctx: Arc<CommsContext>) {
            ctx.set_tx_status(ConnectionStatus::Connected);
        }

        fn set_flag(&self, _flag: &str, _value: bool) -> bool {
            self.entered.send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            true
        }
    }

    #[test]
    fn transport_flags_hold_the_property_lock() {
        let (entered, wait_entered) = std::sync::mpsc::sync_channel(1);
        let (release, wait_release) = std::sync::mpsc::channel();
        let comms = Arc::new(CommsInterface::new(Gated {
            entered,
            release: Mutex::new(wait_release),
        }));
        let setter = {
            let comms = comms.clone();
            std::thread::spawn(move || comms.set_flag("gate", true))
        };

        wait_entered.recv().unwrap();
        // A connect starting now would have to wait for the flag
        assert!(comms.context().properties.try_lock().is_err());
        release.send(()).unwrap();
        assert!(setter.join().unwrap());
        assert!(comms.context().properties.try_lock().is_ok());
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let comms = CommsInterface::new(Idle);
        assert!(comms.set_flag("server_mode", false));
        assert!(!comms.context().properties().server_mode);
        assert!(!comms.set_flag("warp_drive", true));
    }

    #[tokio::test]
    async fn connect_requires_callback() {
        let comms = CommsInterface::new(Idle);
        assert!(!comms.connect().await);
        assert_eq!(comms.loops_spawned(), 0);
        assert_eq!(comms.rx_status(), ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn disconnect_before_connect() {
        let comms = CommsInterface::new(Idle);
        comms.disconnect().await;
        assert_eq!(comms.rx_status(), ConnectionStatus::Terminated);
        assert_eq!(comms.tx_status(), ConnectionStatus::Terminated);
        assert_eq!(comms.loops_spawned(), 0);
    }

    #[tokio::test]
    async fn names_follow_local_target() {
        let comms = CommsInterface::new(Idle);
        comms.set_local_target("node_a");
        comms.set_callback(Arc::new(|_| {}));
        assert!(comms.connect().await);
        assert_eq!(comms.name(), "node_a");
    }
}
