use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::trace;

use crate::protocol::body::encode_int_map;
use crate::protocol::packet::{props, MessageId, Packet, PacketType};
use crate::protocol::transport::{BrokerAddress, Transport, TransportConnector};
use crate::util::sync::lock;


type ReplyFn = Box<dyn FnOnce(&Packet) -> Packet + Send>;

enum Script {
    Status(i32),
    Reply(ReplyFn),
    Silence,
}

struct BrokerState {
    sent: Mutex<Vec<Packet>>,
    scripts: Mutex<FxHashMap<PacketType, VecDeque<Script>>>,
    transports: Mutex<Vec<Arc<MockBrokerTransport>>>,
    unreachable: Mutex<FxHashSet<BrokerAddress>>,
    connect_attempts: Mutex<Vec<BrokerAddress>>,
    next_id: AtomicI64,
    connection_id: i64,
    ha: AtomicBool,
    authentication_required: AtomicBool,
}

/// An in-memory broker. Every request that asks for a reply gets one - a successful default
///  reply with fresh ids, unless a one-shot script for the request's type says otherwise.
///
/// The broker is also the [TransportConnector]: every successful `connect` opens a new
///  transport to it, and simulated breaks close all open transports.
#[derive(Clone)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl Default for MockBroker {
    fn default() -> Self {
        MockBroker::new()
    }
}

impl MockBroker {
    pub fn new() -> MockBroker {
        MockBroker {
            state: Arc::new(BrokerState {
                sent: Default::default(),
                scripts: Default::default(),
                transports: Default::default(),
                unreachable: Default::default(),
                connect_attempts: Default::default(),
                next_id: AtomicI64::new(100),
                connection_id: 4711,
                ha: AtomicBool::new(true),
                authentication_required: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_ha(&self, ha: bool) {
        self.state.ha.store(ha, Ordering::SeqCst);
    }

    pub fn require_authentication(&self) {
        self.state.authentication_required.store(true, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, address: &BrokerAddress, unreachable: bool) {
        let mut set = lock(&self.state.unreachable);
        if unreachable {
            set.insert(address.clone());
        }
        else {
            set.remove(address);
        }
    }

    pub fn connect_attempts(&self) -> Vec<BrokerAddress> {
        lock(&self.state.connect_attempts).clone()
    }

    /// The next request of this type is answered with the given status
    pub fn script_status(&self, packet_type: PacketType, status: i32) {
        self.push_script(packet_type, Script::Status(status));
    }

    /// The next request of this type is answered with whatever `reply` builds
    pub fn script(&self, packet_type: PacketType, reply: impl FnOnce(&Packet) -> Packet + Send + 'static) {
        self.push_script(packet_type, Script::Reply(Box::new(reply)));
    }

    /// The next request of this type is never answered
    pub fn script_silence(&self, packet_type: PacketType) {
        self.push_script(packet_type, Script::Silence);
    }

    fn push_script(&self, packet_type: PacketType, script: Script) {
        lock(&self.state.scripts)
            .entry(packet_type)
            .or_default()
            .push_back(script);
    }

    /// Pushes a message to consumer `consumer_id` over the most recently opened transport
    pub fn deliver(&self, consumer_id: u64, message_id: u64) {
        self.deliver_packet(Packet::message(consumer_id, MessageId(message_id)));
    }

    pub fn deliver_packet(&self, packet: Packet) {
        if let Some(transport) = lock(&self.state.transports).last() {
            transport.push_inbound(Some(packet));
        }
    }

    /// Simulates a network failure: all open transports see EOF, and sending fails
    pub fn break_connections(&self) {
        for transport in lock(&self.state.transports).drain(..) {
            transport.shut_down();
        }
    }

    pub fn num_open_transports(&self) -> usize {
        lock(&self.state.transports).len()
    }

    pub fn sent(&self) -> Vec<Packet> {
        lock(&self.state.sent).clone()
    }

    pub fn sent_of_type(&self, packet_type: PacketType) -> Vec<Packet> {
        lock(&self.state.sent).iter()
            .filter(|p| p.packet_type == packet_type)
            .cloned()
            .collect()
    }

    pub fn take_sent(&self) -> Vec<Packet> {
        std::mem::take(&mut *lock(&self.state.sent))
    }

    /// Removes the oldest recorded packet, asserting its type
    pub fn assert_packet_sent(&self, packet_type: PacketType) -> Packet {
        let mut sent = lock(&self.state.sent);
        if sent.is_empty() {
            panic!("no packet was sent, expected {}", packet_type);
        }
        let actual = sent.remove(0);
        assert_eq!(actual.packet_type, packet_type, "unexpected packet {:?}", actual);
        actual
    }

    /// Asserts the types of the recorded packets in order, removing them
    pub fn assert_sent_types(&self, expected: &[PacketType]) {
        let actual = self.take_sent().iter()
            .map(|p| p.packet_type)
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    pub fn assert_no_remaining_packets(&self) {
        let sent = lock(&self.state.sent);
        assert!(sent.is_empty(), "unexpected packets: {:?}", sent.iter().map(|p| p.packet_type).collect::<Vec<_>>());
    }


    fn on_packet(&self, packet: &Packet) -> Vec<Packet> {
        lock(&self.state.sent).push(packet.clone());
        if !packet.send_acknowledge {
            return Vec::new();
        }

        let Some(reply_type) = reply_type(packet.packet_type) else {
            return Vec::new();
        };
        let script = lock(&self.state.scripts)
            .get_mut(&packet.packet_type)
            .and_then(|scripts| scripts.pop_front());

        match script {
            Some(Script::Silence) => Vec::new(),
            Some(Script::Reply(f)) => vec![f(packet)],
            Some(Script::Status(status)) => vec![Packet::reply_to(packet, reply_type, status)],
            None => self.default_replies(packet, reply_type),
        }
    }

    fn next_id(&self) -> i64 {
        self.state.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn default_replies(&self, request: &Packet, reply_type: PacketType) -> Vec<Packet> {
        let mut reply = Packet::reply_to(request, reply_type, 200);
        match request.packet_type {
            PacketType::Hello => {
                reply.set_property(props::CONNECTION_ID, self.state.connection_id);
                reply.set_property(props::BROKER_SESSION_ID, 1i64);
                reply.set_property(props::HA, self.state.ha.load(Ordering::SeqCst));
                if self.state.authentication_required.load(Ordering::SeqCst) {
                    reply.set_property(props::AUTH_TYPE, "basic");
                    let challenge = Packet::reply_to(request, PacketType::AuthenticateRequest, 200)
                        .with_property(props::AUTH_TYPE, "basic");
                    return vec![reply, challenge];
                }
            }
            PacketType::CreateSession => reply.set_property(props::SESSION_ID, self.next_id()),
            PacketType::AddConsumer => reply.set_property(props::CONSUMER_ID, self.next_id()),
            PacketType::AddProducer => reply.set_property(props::PRODUCER_ID, self.next_id()),
            PacketType::StartTransaction => reply.set_property(props::TRANSACTION_ID, self.next_id()),
            PacketType::RecoverTransaction => reply.set_property(props::QUANTITY, 0),
            PacketType::VerifyTransaction => reply.body = encode_int_map(&[("State", 7)]),
            _ => {}
        }
        vec![reply]
    }
}

/// Requests and their replies have adjacent type numbers
fn reply_type(request: PacketType) -> Option<PacketType> {
    PacketType::try_from(u16::from(request) + 1).ok()
        .filter(|t| t.is_reply())
}

#[async_trait]
impl TransportConnector for MockBroker {
    async fn connect(&self, address: &BrokerAddress) -> anyhow::Result<Arc<dyn Transport>> {
        lock(&self.state.connect_attempts).push(address.clone());
        if lock(&self.state.unreachable).contains(address) {
            bail!("connection refused: {}", address);
        }

        let (inbound_sender, inbound) = mpsc::unbounded_channel();
        let transport = Arc::new(MockBrokerTransport {
            broker: self.clone(),
            inbound_sender,
            inbound: tokio::sync::Mutex::new(inbound),
            closed: AtomicBool::new(false),
        });
        lock(&self.state.transports).push(transport.clone());
        trace!(%address, "mock broker accepted connection");
        Ok(transport)
    }
}


/// One connection to a [MockBroker]. `None` in the inbound queue signals EOF.
pub struct MockBrokerTransport {
    broker: MockBroker,
    inbound_sender: mpsc::UnboundedSender<Option<Packet>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Option<Packet>>>,
    closed: AtomicBool,
}

impl MockBrokerTransport {
    fn push_inbound(&self, packet: Option<Packet>) {
        let _ = self.inbound_sender.send(packet);
    }

    fn shut_down(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.push_inbound(None);
    }
}

#[async_trait]
impl Transport for MockBrokerTransport {
    async fn send_packet(&self, packet: Packet) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("transport is closed");
        }
        for reply in self.broker.on_packet(&packet) {
            self.push_inbound(Some(reply));
        }
        Ok(())
    }

    async fn receive_packet(&self) -> anyhow::Result<Option<Packet>> {
        let mut inbound = self.inbound.lock().await;
        Ok(inbound.recv().await.flatten())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.push_inbound(None);
        }
    }
}
