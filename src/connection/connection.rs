use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::anyhow;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, instrument, trace, warn};

use crate::connection::address_list::AddressList;
use crate::connection::config::ClientConfig;
use crate::connection::events::*;
use crate::connection::reconnect::{ReconnectCoordinator, RecoverState};
use crate::connection::registry::IdRegistry;
use crate::connection::state::{with_gate_bypass, ConnectionState};
use crate::error::{MqError, MqResult};
use crate::protocol::destination::Destination;
use crate::protocol::inbound::{spawn_inbound, BreakEvent, MessageSink};
use crate::protocol::keepalive::spawn_keepalive;
use crate::protocol::packet::Packet;
use crate::protocol::protocol_handler::ProtocolHandler;
use crate::protocol::transport::{BrokerAddress, Transport, TransportConnector};
use crate::session::ack_mode::AckMode;
use crate::session::session::Session;
use crate::util::sync::lock;

/// a broker may redirect a new connection this often before opening fails
const MAX_REDIRECTS: usize = 3;
/// close waits at most this many gate re-check intervals for a running recovery
const CLOSE_RECOVERY_WAIT_SLICES: u32 = 10;


/// Application handle of a connection to a broker (cluster).
///
/// A connection starts out stopped: sessions can be created and consumers registered, but no
///  messages are handed to the application before [Connection::start].
pub struct Connection {
    core: Arc<ConnectionCore>,
}

impl Connection {
    /// Connects to the first reachable broker of the configured address list and performs the
    ///  handshake
    pub async fn open(config: ClientConfig, connector: Arc<dyn TransportConnector>, registry: &IdRegistry) -> MqResult<Connection> {
        config.validate()
            .map_err(|e| MqError::illegal_state(format!("invalid configuration: {:#}", e)))?;
        let core = ConnectionCore::open(Arc::new(config), connector, registry).await?;
        Ok(Connection { core })
    }

    /// Local id, unique within the [IdRegistry] the connection was created with
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// The id the broker assigned in the handshake
    pub fn broker_connection_id(&self) -> Option<i64> {
        self.core.handler.connection_id()
    }

    pub fn current_address(&self) -> Option<BrokerAddress> {
        lock(&self.core.current_address).clone()
    }

    pub fn addresses(&self) -> Vec<BrokerAddress> {
        lock(&self.core.addresses).addresses().to_vec()
    }

    pub fn is_closed(&self) -> bool {
        self.core.state.is_closed()
    }

    pub fn is_broken(&self) -> bool {
        self.core.state.is_broken()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.core.state.is_reconnecting()
    }

    pub fn is_started(&self) -> bool {
        !self.core.state.is_stopped()
    }

    pub fn recover_state(&self) -> RecoverState {
        self.core.reconnect.state()
    }

    pub fn subscribe_recover_state(&self) -> watch::Receiver<RecoverState> {
        self.core.reconnect.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.core.events.subscribe()
    }

    pub fn set_exception_listener(&self, listener: SharedExceptionListener) {
        *lock(&self.core.exception_listener) = Some(listener);
    }

    pub fn session_count(&self) -> usize {
        lock(&self.core.sessions).len()
    }

    pub async fn set_client_id(&self, client_id: &str) -> MqResult<()> {
        self.core.set_client_id(client_id).await
    }

    pub async fn start(&self) -> MqResult<()> {
        self.core.start().await
    }

    /// Pauses delivery. On return, no message listener is running any more. Must not be called
    ///  from a message listener.
    pub async fn stop(&self) -> MqResult<()> {
        self.core.stop().await
    }

    pub async fn close(&self) -> MqResult<()> {
        self.core.close().await
    }

    pub async fn create_session(&self, ack_mode: AckMode) -> MqResult<Arc<Session>> {
        self.core.create_session(ack_mode, false).await
    }

    /// A transacted session whose transactions are controlled by an external transaction manager
    pub async fn create_xa_session(&self) -> MqResult<Arc<Session>> {
        self.core.create_session(AckMode::Transacted, true).await
    }

    pub async fn create_temporary_destination(&self, topic: bool) -> MqResult<Destination> {
        self.core.create_temporary_destination(topic).await
    }

    pub async fn delete_temporary_destination(&self, destination: &Destination) -> MqResult<()> {
        self.core.delete_temporary_destination(destination).await
    }
}


/// The shared state behind a [Connection], also referenced (weakly) by its sessions and by the
///  inbound dispatch
pub struct ConnectionCore {
    id: u64,
    config: Arc<ClientConfig>,
    connector: Arc<dyn TransportConnector>,
    state: Arc<ConnectionState>,
    handler: Arc<ProtocolHandler>,

    addresses: Mutex<AddressList>,
    current_address: Mutex<Option<BrokerAddress>>,

    sessions: Mutex<FxHashMap<u64, Arc<Session>>>,
    next_session_id: AtomicU64,
    temporary_destinations: Mutex<Vec<Destination>>,
    next_temporary_id: AtomicU64,
    client_id: Mutex<Option<String>>,
    /// messages received since connection level flow was last resumed
    delivered_since_flow_resume: AtomicI32,

    events: ConnectionEventNotifier,
    exception_listener: Mutex<Option<SharedExceptionListener>>,
    reconnect: ReconnectCoordinator,

    breaks: mpsc::UnboundedSender<BreakEvent>,
    /// inbound loops of the current transport
    transport_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// keepalive and break supervisor, for the lifetime of the connection
    tasks: Mutex<Vec<JoinHandle<()>>>,
    close_lock: tokio::sync::Mutex<()>,
}

impl ConnectionCore {
    async fn open(config: Arc<ClientConfig>, connector: Arc<dyn TransportConnector>, registry: &IdRegistry) -> MqResult<Arc<ConnectionCore>> {
        let state = Arc::new(ConnectionState::new(config.reconnect_gate_recheck_interval)
            .with_gate_max_wait(config.reconnect_gate_max_wait));
        let handler = Arc::new(ProtocolHandler::new(config.clone(), state.clone(), registry.ack_ids()));
        let (breaks, break_receiver) = mpsc::unbounded_channel();

        let core = Arc::new(ConnectionCore {
            id: registry.next_connection_id(),
            addresses: Mutex::new(AddressList::new(config.addresses.clone(), config.address_list_behavior)),
            reconnect: ReconnectCoordinator::new(config.reconnect_max_retries),
            config,
            connector,
            state,
            handler,
            current_address: Mutex::new(None),
            sessions: Default::default(),
            next_session_id: AtomicU64::new(0),
            temporary_destinations: Default::default(),
            next_temporary_id: AtomicU64::new(0),
            client_id: Mutex::new(None),
            delivered_since_flow_resume: AtomicI32::new(0),
            events: ConnectionEventNotifier::new(),
            exception_listener: Mutex::new(None),
            breaks,
            transport_tasks: Default::default(),
            tasks: Default::default(),
            close_lock: Default::default(),
        });

        let supervisor = tokio::spawn(run_break_supervisor(Arc::downgrade(&core), break_receiver));
        lock(&core.tasks).push(supervisor);

        if let Err(e) = core.connect_initial().await {
            core.state.set_closed();
            core.shut_down_tasks();
            return Err(e);
        }

        if let Some(interval) = core.config.ping_interval {
            let keepalive = spawn_keepalive(core.handler.clone(), core.state.clone(), interval, core.breaks.clone());
            lock(&core.tasks).push(keepalive);
        }

        if let Some(client_id) = core.config.client_id.clone() {
            if let Err(e) = core.set_client_id(&client_id).await {
                if let Err(close_error) = core.close().await {
                    debug!("closing connection after failed client id: {}", close_error);
                }
                return Err(e);
            }
        }

        info!(connection_id = core.id, broker_connection_id = ?core.handler.connection_id(), "connection opened");
        Ok(core)
    }

    async fn connect_initial(self: &Arc<Self>) -> MqResult<()> {
        for _ in 0..=MAX_REDIRECTS {
            let (transport, address) = self.connect_any(1).await?;
            self.install_transport(transport);
            match self.handshake(false).await {
                Ok(()) => {
                    *lock(&self.current_address) = Some(address);
                    return Ok(());
                }
                Err(MqError::Redirect(target)) => {
                    debug!(from = %address, to = %target, "redirected");
                    self.exit_connection().await;
                }
                Err(e) => {
                    self.exit_connection().await;
                    return Err(e);
                }
            }
        }
        Err(MqError::BrokerUnavailable(format!("redirected more than {} times", MAX_REDIRECTS)))
    }

    /// Tries the candidate addresses in turn, each up to `attempts_per_address` times
    async fn connect_any(&self, attempts_per_address: u32) -> MqResult<(Arc<dyn Transport>, BrokerAddress)> {
        let candidates = lock(&self.addresses).candidates();
        let mut last_error = None;

        for address in candidates {
            for attempt in 0..attempts_per_address {
                if attempt > 0 {
                    time::sleep(self.config.reconnect_interval).await;
                }
                if self.state.is_close_called() {
                    return Err(MqError::ConnectionBroken("connection was closed".to_string()));
                }
                match self.connector.connect(&address).await {
                    Ok(transport) => {
                        debug!(%address, attempt, "transport connected");
                        return Ok((transport, address));
                    }
                    Err(e) => {
                        debug!(%address, attempt, "connecting failed: {:#}", e);
                        last_error = Some(e);
                    }
                }
            }
        }
        Err(MqError::Network(last_error.unwrap_or_else(|| anyhow!("no broker address to connect to"))))
    }

    /// Makes `transport` the current one and starts receiving from it
    fn install_transport(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        let generation = self.state.next_transport_generation();
        self.handler.set_transport(transport.clone());

        let sink: Arc<dyn MessageSink> = Arc::new(CoreSink { core: Arc::downgrade(self) });
        let inbound = spawn_inbound(transport, self.handler.clone(), sink, generation, self.breaks.clone());

        let mut tasks = lock(&self.transport_tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(inbound);
        trace!(generation, "transport installed");
    }

    /// HELLO, recording the broker a redirect points to
    async fn handshake(&self, resume: bool) -> MqResult<()> {
        match self.handler.hello(resume).await {
            Err(MqError::Redirect(target)) => {
                match target.parse::<BrokerAddress>() {
                    Ok(address) => {
                        let addresses = {
                            let mut list = lock(&self.addresses);
                            list.prepend(address).then(|| list.addresses().to_vec())
                        };
                        if let Some(addresses) = addresses {
                            self.events.send_event(ConnectionEvent::AddressListChanged(AddressListChangedData { addresses }));
                        }
                    }
                    Err(e) => warn!("ignoring redirect to unparseable address {}: {:#}", target, e),
                }
                Err(MqError::Redirect(target))
            }
            other => other,
        }
    }

    /// Drops the current transport without talking to the broker. Inbound loops are stopped
    ///  first, so closing the transport does not report a break.
    async fn exit_connection(&self) {
        for task in std::mem::take(&mut *lock(&self.transport_tasks)) {
            task.abort();
        }
        if let Some(transport) = self.handler.take_transport() {
            transport.close().await;
        }
    }

    fn shut_down_tasks(&self) {
        for task in std::mem::take(&mut *lock(&self.tasks)) {
            task.abort();
        }
        for task in std::mem::take(&mut *lock(&self.transport_tasks)) {
            task.abort();
        }
    }

    fn sessions(&self) -> Vec<Arc<Session>> {
        lock(&self.sessions).values().cloned().collect()
    }

    pub(crate) fn remove_session(&self, id: u64) {
        if lock(&self.sessions).remove(&id).is_some() {
            trace!(session_id = id, "session removed from connection");
        }
    }

    fn check_open(&self) -> MqResult<()> {
        if self.state.is_closed() || self.state.is_close_called() {
            return Err(MqError::illegal_state(format!("connection {} is closed", self.id)));
        }
        Ok(())
    }


    async fn set_client_id(&self, client_id: &str) -> MqResult<()> {
        self.check_open()?;
        if lock(&self.client_id).is_some() {
            return Err(MqError::illegal_state("client id is set already"));
        }
        if client_id.is_empty() {
            return Err(MqError::illegal_state("client id must not be empty"));
        }
        self.handler.set_client_id(client_id, false).await?;
        *lock(&self.client_id) = Some(client_id.to_string());
        Ok(())
    }

    async fn start(&self) -> MqResult<()> {
        self.check_open()?;
        if !self.state.is_stopped() {
            return Ok(());
        }
        self.handler.start(None).await?;
        self.state.set_stopped(false);
        for session in self.sessions() {
            session.wake();
        }
        debug!(connection_id = self.id, "connection started");
        Ok(())
    }

    async fn stop(&self) -> MqResult<()> {
        if self.state.is_closed() || self.state.is_stopped() {
            return Ok(());
        }
        self.state.set_stopped(true);
        if !self.state.is_broken() {
            self.handler.stop(None).await?;
        }
        for session in self.sessions() {
            session.wait_for_drain().await;
        }
        debug!(connection_id = self.id, "connection stopped");
        Ok(())
    }

    #[instrument(name = "close_connection", skip_all, fields(connection_id = self.id))]
    async fn close(&self) -> MqResult<()> {
        let _serialized = self.close_lock.lock().await;
        if self.state.is_closed() {
            return Ok(());
        }
        self.state.set_close_called();

        if !self.reconnect.wait_until_inactive(self.config.reconnect_gate_recheck_interval, CLOSE_RECOVERY_WAIT_SLICES).await {
            warn!("recovery still running, closing anyway");
        }
        self.reconnect.abort();

        let usable = !self.state.is_unusable();
        if usable {
            if let Err(e) = self.stop().await {
                debug!("stopping connection on close failed: {}", e);
            }
        }

        for session in self.sessions() {
            if let Err(e) = session.close().await {
                warn!(session_id = session.id(), "closing session failed: {}", e);
            }
        }

        if usable && !self.state.is_unusable() {
            let temporary = std::mem::take(&mut *lock(&self.temporary_destinations));
            for destination in temporary {
                if let Err(e) = self.handler.delete_destination(&destination).await {
                    debug!(%destination, "deleting temporary destination failed: {}", e);
                }
            }
            if let Err(e) = self.handler.goodbye(true).await {
                debug!("goodbye failed: {}", e);
            }
        }

        self.state.set_closed();
        self.handler.abort_pending();
        self.exit_connection().await;
        self.shut_down_tasks();
        self.events.send_event(ConnectionEvent::Closed);
        info!("connection closed");
        Ok(())
    }

    async fn create_session(self: &Arc<Self>, ack_mode: AckMode, xa: bool) -> MqResult<Arc<Session>> {
        self.check_open()?;
        let id = self.next_session_id.fetch_add(1, Ordering::AcqRel) + 1;
        let session = Session::create(
            id,
            ack_mode,
            xa,
            self.config.clone(),
            self.handler.clone(),
            self.state.clone(),
            Arc::downgrade(self),
        ).await?;
        lock(&self.sessions).insert(id, session.clone());
        Ok(session)
    }

    async fn create_temporary_destination(&self, topic: bool) -> MqResult<Destination> {
        self.check_open()?;
        let connection_id = self.handler.connection_id().unwrap_or(self.id as i64);
        let sequence = self.next_temporary_id.fetch_add(1, Ordering::AcqRel) + 1;
        let destination = Destination::temporary(topic, connection_id, sequence);

        self.handler.create_destination(&destination).await?;
        lock(&self.temporary_destinations).push(destination.clone());
        Ok(destination)
    }

    async fn delete_temporary_destination(&self, destination: &Destination) -> MqResult<()> {
        self.check_open()?;
        let known = {
            let mut temporary = lock(&self.temporary_destinations);
            let before = temporary.len();
            temporary.retain(|d| d != destination);
            before != temporary.len()
        };
        if !known {
            return Err(MqError::illegal_state(format!("{} is not a temporary destination of this connection", destination)));
        }
        self.handler.delete_destination(destination).await
    }


    // ----------------------------------------- inbound ------------------------------------------

    async fn route_message(&self, session_id: Option<i64>, consumer_id: u64, packet: Packet) {
        let session = {
            let sessions = lock(&self.sessions);
            match session_id {
                Some(session_id) => sessions.values().find(|s| s.broker_session_id() == session_id).cloned(),
                None => sessions.values().find(|s| s.owns_broker_consumer(consumer_id)).cloned(),
            }
        };
        match session {
            Some(session) => session.on_message(packet),
            None => debug!(?session_id, consumer_id, "dropping message for unknown session"),
        }

        if self.config.connection_flow_limit_enabled {
            let count = self.config.connection_flow_count;
            let delivered = self.delivered_since_flow_resume.fetch_add(1, Ordering::AcqRel) + 1;
            if delivered >= count {
                self.delivered_since_flow_resume.store(0, Ordering::Release);
                if let Err(e) = self.handler.resume_flow(None, count).await {
                    debug!("resuming connection flow failed: {}", e);
                }
            }
        }
    }

    #[instrument(name = "connection_break", skip_all, fields(connection_id = self.id, generation = event.generation))]
    async fn handle_break(self: &Arc<Self>, event: BreakEvent) {
        if event.generation != self.state.transport_generation() {
            trace!("ignoring break of a replaced transport");
            return;
        }
        if self.state.is_closed() || self.state.is_close_called() {
            self.handler.abort_pending();
            return;
        }
        if self.state.is_broken() || self.state.is_reconnecting() {
            return;
        }
        warn!(cause = %event.cause, "connection to broker lost");

        let may_reconnect = self.config.reconnect_enabled
            && self.handler.is_ha_broker()
            && !self.reconnect.is_aborted();

        // requests woken below must find the gate closed
        if may_reconnect && self.state.check_and_set_reconnecting() {
            let aborted = self.handler.abort_pending();
            debug!(aborted, "aborted requests waiting for replies");
            self.events.send_event(ConnectionEvent::Reconnecting(ReconnectingData { cause: event.cause.clone() }));
            self.exit_connection().await;

            match with_gate_bypass(self.run_reconnect()).await {
                Ok(address) => {
                    self.state.set_reconnecting(false);
                    for session in self.sessions() {
                        session.wake();
                    }
                    info!(%address, "reconnected");
                    self.events.send_event(ConnectionEvent::Reconnected(ReconnectedData { address }));
                }
                Err(e) => {
                    self.events.send_event(ConnectionEvent::ReconnectFailed(ReconnectFailedData { reason: e.to_string() }));
                    self.fail(e).await;
                }
            }
        }
        else {
            self.fail(MqError::ConnectionBroken(event.cause)).await;
        }
    }

    /// The connection is beyond repair: wake everybody, drop the transport and tell the
    ///  application
    async fn fail(&self, error: MqError) {
        self.state.set_broken();
        self.state.set_reconnecting(false);
        self.handler.abort_pending();
        self.exit_connection().await;

        warn!("connection is broken: {}", error);
        self.events.send_event(ConnectionEvent::Exception(ExceptionData { message: error.to_string() }));
        let listener = lock(&self.exception_listener).clone();
        if let Some(listener) = listener {
            listener.on_exception(&error);
        }
    }

    async fn run_reconnect(self: &Arc<Self>) -> MqResult<BrokerAddress> {
        if !self.reconnect.begin() {
            return Err(MqError::ConnectionBroken("reconnect is not possible any more".to_string()));
        }

        let mut delay = self.config.reconnect_delay;
        if self.handler.is_ha_broker() {
            delay = delay.max(self.config.ha_reconnect_delay);
        }
        time::sleep(delay).await;

        loop {
            if self.state.is_close_called() {
                self.reconnect.abort();
                return Err(MqError::ConnectionBroken("connection was closed during reconnect".to_string()));
            }

            self.reconnect.set_state(RecoverState::InProcess);
            match self.recover().await {
                Ok(address) => {
                    self.reconnect.succeeded();
                    return Ok(address);
                }
                Err(e) => {
                    warn!("recovering the connection failed: {}", e);
                    self.exit_connection().await;
                    if !self.reconnect.failed() {
                        return Err(e);
                    }
                    self.reconnect.begin();
                    time::sleep(self.config.reconnect_interval).await;
                }
            }
        }
    }

    /// One attempt at re-establishing the connection and everything the broker forgot with it
    async fn recover(self: &Arc<Self>) -> MqResult<BrokerAddress> {
        let sessions = self.sessions();
        for session in &sessions {
            session.reset();
        }

        let (transport, address) = self.connect_any(self.config.reconnect_attempts).await?;
        self.install_transport(transport);
        self.reconnect.set_state(RecoverState::TransportConnected);

        self.handshake(true).await?;
        self.handler.reset_client_id().await?;

        for session in &sessions {
            session.recreate().await?;
            for consumer in session.consumer_ids() {
                if let Some(broker_consumer_id) = session.broker_consumer_id(consumer) {
                    self.events.send_event(ConnectionEvent::ConsumerEvent(ConsumerEventData {
                        session_id: session.id(),
                        consumer_id: consumer.0,
                        broker_consumer_id,
                    }));
                }
            }
        }

        if !self.state.is_stopped() {
            self.handler.start(None).await?;
        }
        *lock(&self.current_address) = Some(address.clone());
        Ok(address)
    }
}


struct CoreSink {
    core: Weak<ConnectionCore>,
}

#[async_trait]
impl MessageSink for CoreSink {
    async fn deliver_message(&self, session_id: Option<i64>, consumer_id: u64, packet: Packet) {
        if let Some(core) = self.core.upgrade() {
            core.route_message(session_id, consumer_id, packet).await;
        }
    }
}

/// Handles breaks reported by inbound loops and keepalive, one at a time
async fn run_break_supervisor(core: Weak<ConnectionCore>, mut breaks: mpsc::UnboundedReceiver<BreakEvent>) {
    while let Some(event) = breaks.recv().await {
        let Some(core) = core.upgrade() else {
            return;
        };
        core.handle_break(event).await;
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::error::ErrorKind;
    use crate::protocol::packet::{props, PacketType};
    use crate::session::consumer::ConsumerSpec;
    use crate::test_util::mock_broker::MockBroker;
    use super::*;

    fn address(port: u16) -> BrokerAddress {
        BrokerAddress::new("broker", port)
    }

    fn config(reconnect: bool) -> ClientConfig {
        let mut config = ClientConfig::new(vec![address(1), address(2)]);
        config.ping_interval = None;
        config.reconnect_enabled = reconnect;
        config.reconnect_attempts = 2;
        config.reconnect_max_retries = 1;
        config
    }

    async fn open(broker: &MockBroker, config: ClientConfig) -> Connection {
        Connection::open(config, Arc::new(broker.clone()), &IdRegistry::new()).await.unwrap()
    }

    async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>, matches: impl Fn(&ConnectionEvent) -> bool) -> ConnectionEvent {
        time::timeout(Duration::from_secs(600), async {
            loop {
                let event = events.recv().await.unwrap();
                if matches(&event) {
                    return event;
                }
            }
        }).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_with_client_id() {
        let broker = MockBroker::new();
        let mut config = config(false);
        config.client_id = Some("app-1".to_string());
        let connection = open(&broker, config).await;

        broker.assert_sent_types(&[PacketType::Hello, PacketType::SetClientId]);
        assert_eq!(connection.broker_connection_id(), Some(4711));
        assert_eq!(connection.current_address(), Some(address(1)));
        assert!(!connection.is_started());
    }

    #[tokio::test]
    async fn test_open_falls_through_unreachable_address() {
        let broker = MockBroker::new();
        broker.set_unreachable(&address(1), true);
        let connection = open(&broker, config(false)).await;

        assert_eq!(broker.connect_attempts(), vec![address(1), address(2)]);
        assert_eq!(connection.current_address(), Some(address(2)));
    }

    #[tokio::test]
    async fn test_open_fails_if_no_broker_is_reachable() {
        let broker = MockBroker::new();
        broker.set_unreachable(&address(1), true);
        broker.set_unreachable(&address(2), true);

        let result = Connection::open(config(false), Arc::new(broker.clone()), &IdRegistry::new()).await;
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Network));
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let broker = MockBroker::new();
        let mut config = config(false);
        config.addresses.clear();

        let result = Connection::open(config, Arc::new(broker.clone()), &IdRegistry::new()).await;
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::IllegalState));
        assert!(broker.connect_attempts().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let broker = MockBroker::new();
        let connection = open(&broker, config(false)).await;
        broker.take_sent();

        connection.start().await.unwrap();
        connection.start().await.unwrap();
        assert!(connection.is_started());
        connection.stop().await.unwrap();
        connection.stop().await.unwrap();
        assert!(!connection.is_started());

        broker.assert_sent_types(&[PacketType::Start, PacketType::Stop]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = MockBroker::new();
        let connection = open(&broker, config(false)).await;
        let session = connection.create_session(AckMode::Auto).await.unwrap();
        let mut events = connection.subscribe_events();
        connection.start().await.unwrap();
        broker.take_sent();

        connection.close().await.unwrap();
        assert!(connection.is_closed());
        assert!(session.is_closed());
        assert_eq!(connection.session_count(), 0);
        broker.assert_sent_types(&[PacketType::Stop, PacketType::DestroySession, PacketType::Goodbye]);
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Closed);

        connection.close().await.unwrap();
        broker.assert_no_remaining_packets();
        assert_eq!(connection.create_session(AckMode::Auto).await.err().map(|e| e.kind()), Some(ErrorKind::IllegalState));
    }

    #[tokio::test]
    async fn test_goodbye_blocks_if_client_id_was_set() {
        let broker = MockBroker::new();
        let connection = open(&broker, config(false)).await;
        connection.set_client_id("app-2").await.unwrap();
        assert_eq!(connection.set_client_id("again").await.err().map(|e| e.kind()), Some(ErrorKind::IllegalState));

        connection.close().await.unwrap();
        let goodbye = broker.sent_of_type(PacketType::Goodbye);
        assert_eq!(goodbye[0].get_bool(props::BLOCK), Some(true));
    }

    #[tokio::test]
    async fn test_temporary_destinations_deleted_on_close() {
        let broker = MockBroker::new();
        let connection = open(&broker, config(false)).await;
        let queue = connection.create_temporary_destination(false).await.unwrap();
        let topic = connection.create_temporary_destination(true).await.unwrap();
        assert!(queue.kind.is_temporary());
        assert!(topic.kind.is_topic());
        assert_ne!(queue.name, topic.name);

        connection.delete_temporary_destination(&queue).await.unwrap();
        assert!(connection.delete_temporary_destination(&queue).await.is_err());
        broker.take_sent();

        connection.close().await.unwrap();
        let deleted = broker.sent_of_type(PacketType::DestroyDestination);
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].get_str(props::DESTINATION), Some(topic.name.as_str()));
    }

    #[tokio::test]
    async fn test_messages_are_routed_to_sessions() {
        let broker = MockBroker::new();
        let connection = open(&broker, config(false)).await;
        let session = connection.create_session(AckMode::Client).await.unwrap();
        let other = connection.create_session(AckMode::Client).await.unwrap();
        let consumer = session.create_consumer(ConsumerSpec::new(Destination::queue("q"))).await.unwrap();
        let broker_consumer_id = session.broker_consumer_id(consumer).unwrap();
        connection.start().await.unwrap();

        broker.deliver(broker_consumer_id, 1);
        let received = session.receive(consumer, Some(Duration::from_secs(5))).await.unwrap().unwrap();
        assert_eq!(received.message_id(), Some(crate::protocol::packet::MessageId(1)));
        assert_eq!(other.staged_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_flow_is_resumed() {
        let broker = MockBroker::new();
        let mut config = config(false);
        config.connection_flow_limit_enabled = true;
        config.connection_flow_count = 2;
        let connection = open(&broker, config).await;
        let session = connection.create_session(AckMode::Client).await.unwrap();
        let consumer = session.create_consumer(ConsumerSpec::new(Destination::queue("q"))).await.unwrap();
        let broker_consumer_id = session.broker_consumer_id(consumer).unwrap();
        connection.start().await.unwrap();

        for message_id in 1..=3 {
            broker.deliver(broker_consumer_id, message_id);
        }
        for _ in 1..=3 {
            session.receive(consumer, Some(Duration::from_secs(5))).await.unwrap().unwrap();
        }

        let resumes = broker.sent_of_type(PacketType::ResumeFlow).into_iter()
            .filter(|p| p.get_long(props::CONSUMER_ID).is_none())
            .count();
        assert_eq!(resumes, 1);
    }

    #[tokio::test]
    async fn test_break_without_reconnect_notifies_exception_listener() {
        let broker = MockBroker::new();
        let connection = open(&broker, config(false)).await;
        let mut listener = MockExceptionListener::new();
        listener.expect_on_exception()
            .withf(|e| e.kind() == ErrorKind::ConnectionBroken)
            .times(1)
            .return_const(());
        connection.set_exception_listener(Arc::new(listener));
        let mut events = connection.subscribe_events();

        broker.break_connections();
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Exception(_))).await;
        assert!(connection.is_broken());
        assert!(!connection.is_reconnecting());

        // closing a broken connection does not talk to the broker
        broker.take_sent();
        connection.close().await.unwrap();
        broker.assert_no_remaining_packets();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reconnect_to_non_ha_broker() {
        let broker = MockBroker::new();
        broker.set_ha(false);
        let connection = open(&broker, config(true)).await;
        let mut events = connection.subscribe_events();

        broker.break_connections();
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Exception(_))).await;
        assert!(connection.is_broken());
        assert_eq!(broker.connect_attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_restores_sessions_and_consumers() {
        let broker = MockBroker::new();
        let mut config = config(true);
        config.client_id = Some("app-3".to_string());
        let connection = open(&broker, config).await;
        let session = connection.create_session(AckMode::Client).await.unwrap();
        let consumer = session.create_consumer(ConsumerSpec::new(Destination::queue("q"))).await.unwrap();
        let old_broker_consumer_id = session.broker_consumer_id(consumer).unwrap();
        let old_broker_session_id = session.broker_session_id();
        connection.start().await.unwrap();

        broker.deliver(old_broker_consumer_id, 1);
        session.receive(consumer, Some(Duration::from_secs(5))).await.unwrap().unwrap();
        assert_eq!(session.unacked_count(), 1);

        let mut events = connection.subscribe_events();
        broker.take_sent();
        broker.break_connections();
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Reconnected(_))).await;

        assert!(!connection.is_reconnecting());
        assert!(!connection.is_broken());
        assert_eq!(connection.recover_state(), RecoverState::Inactive);
        assert_eq!(session.consumer_ids(), vec![consumer]);
        assert_ne!(session.broker_consumer_id(consumer), Some(old_broker_consumer_id));
        assert_ne!(session.broker_session_id(), old_broker_session_id);
        assert_eq!(session.unacked_count(), 0);

        broker.assert_sent_types(&[
            PacketType::Hello,
            PacketType::SetClientId,
            PacketType::CreateSession,
            PacketType::AddConsumer,
            PacketType::Start,
        ]);

        // the re-registered consumer receives again
        let new_broker_consumer_id = session.broker_consumer_id(consumer).unwrap();
        broker.deliver(new_broker_consumer_id, 2);
        let received = session.receive(consumer, Some(Duration::from_secs(5))).await.unwrap().unwrap();
        assert_eq!(received.message_id(), Some(crate::protocol::packet::MessageId(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resumes_connection_id() {
        let broker = MockBroker::new();
        let connection = open(&broker, config(true)).await;
        let mut events = connection.subscribe_events();
        broker.take_sent();

        broker.break_connections();
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Reconnected(_))).await;

        let hello = broker.assert_packet_sent(PacketType::Hello);
        assert_eq!(hello.get_long(props::CONNECTION_ID), Some(4711));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up() {
        let broker = MockBroker::new();
        let connection = open(&broker, config(true)).await;
        let mut events = connection.subscribe_events();
        let mut listener = MockExceptionListener::new();
        listener.expect_on_exception()
            .times(1)
            .return_const(());
        connection.set_exception_listener(Arc::new(listener));

        broker.set_unreachable(&address(1), true);
        broker.set_unreachable(&address(2), true);
        broker.break_connections();

        next_event(&mut events, |e| matches!(e, ConnectionEvent::ReconnectFailed(_))).await;
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Exception(_))).await;
        assert!(connection.is_broken());
        assert!(!connection.is_reconnecting());
        assert_eq!(connection.recover_state(), RecoverState::Aborted);
        // initial connect, then two recoveries of two addresses with two attempts each
        assert_eq!(broker.connect_attempts().len(), 1 + 2 * 2 * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_after_failover_is_rolled_back() {
        let broker = MockBroker::new();
        broker.set_ha(true);
        let mut config = config(true);
        config.two_phase_commit_for_ha = false;
        let connection = open(&broker, config).await;
        let session = connection.create_session(AckMode::Transacted).await.unwrap();
        let consumer = session.create_consumer(ConsumerSpec::new(Destination::queue("q"))).await.unwrap();
        connection.start().await.unwrap();

        broker.deliver(session.broker_consumer_id(consumer).unwrap(), 1);
        session.receive(consumer, Some(Duration::from_secs(5))).await.unwrap().unwrap();

        let mut events = connection.subscribe_events();
        broker.break_connections();
        next_event(&mut events, |e| matches!(e, ConnectionEvent::Reconnected(_))).await;
        let restarted = session.transaction_id().await;
        broker.take_sent();

        let err = session.commit().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransactionRolledBack);
        // the transaction started on the new connection is kept
        broker.assert_no_remaining_packets();
        assert_eq!(session.transaction_id().await, restarted);

        // the next commit goes through
        session.commit().await.unwrap();
        broker.assert_sent_types(&[PacketType::CommitTransaction, PacketType::StartTransaction]);
    }
}
