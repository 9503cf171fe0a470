use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::connection::config::ClientConfig;
use crate::connection::state::ConnectionState;
use crate::error::{MqError, MqResult, RemoteFailure};
use crate::protocol::body::{decode_int_map, decode_xid_list, encode_ack_block, encode_xid, AckEntry, Xid};
use crate::protocol::correlation::{AckIdGenerator, CorrelationTable, ReplyReceiver};
use crate::protocol::destination::Destination;
use crate::protocol::packet::{props, MessageId, Packet, PacketType};
use crate::protocol::status::{status_error, Status};
use crate::protocol::transport::Transport;
use crate::session::ack_mode::AckMode;
use crate::session::consumer::ConsumerSpec;
use crate::util::buf::put_string;
use crate::util::sync::lock;

const CLIENT_VERSION: &str = "5.1";
const USER_AGENT: &str = "mqclient-rs";

/// `JMQAutoRollback` value asking the broker to roll back a transaction that is not prepared
///  when the connection goes away
const AUTO_ROLLBACK_NOT_PREPARED: i32 = 2;


/// Result of a VERIFY_TRANSACTION round trip
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VerifiedState {
    Prepared,
    Committed,
    RolledBack,
    /// any other broker state; the transaction can not be completed
    Unknown(i32),
}

impl VerifiedState {
    fn from_wire(state: i32) -> VerifiedState {
        match state {
            6 => VerifiedState::Prepared,
            7 => VerifiedState::Committed,
            8 => VerifiedState::RolledBack,
            other => VerifiedState::Unknown(other),
        }
    }
}

/// Client side transaction state as far as a failed commit needs to know it
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum TransactionState {
    Started,
    Ended,
    Prepared,
    Committed,
    RolledBack,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProducerInfo {
    pub producer_id: u64,
    /// flow limits granted by the broker, if any
    pub max_bytes: Option<i64>,
    pub max_messages: Option<i32>,
}

/// Everything the broker needs to know to register a consumer
#[derive(Clone, Debug)]
pub struct ConsumerRegistration<'a> {
    pub spec: &'a ConsumerSpec,
    pub session_id: i64,
    pub ack_mode: AckMode,
    pub prefetch: i32,
    /// set when the consumer is re-registered after a failure, to let the broker move its state
    pub old_consumer_id: Option<u64>,
}


/// A request in flight. The correlation entry is removed when this goes out of scope, which
///  covers timeouts and callers that give up waiting.
struct Exchange<'a> {
    table: &'a CorrelationTable,
    correlation_id: u64,
    verb: PacketType,
    replies: ReplyReceiver,
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        self.table.remove(self.correlation_id);
    }
}

/// The request/reply engine: turns protocol operations into packets, correlates the replies
///  and maps reply statuses to typed errors.
///
/// Network failures are never retried here. The only retry is the single idempotent re-send
///  of requests the broker answered with `RETRY`.
pub struct ProtocolHandler {
    config: Arc<ClientConfig>,
    state: Arc<ConnectionState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    correlation: CorrelationTable,
    ack_ids: Arc<AckIdGenerator>,

    written_since_ping: AtomicBool,
    unanswered_ping_since: Mutex<Option<Instant>>,

    broker_session_id: Mutex<Option<i64>>,
    connection_id: Mutex<Option<i64>>,
    ha_broker: AtomicBool,
    client_id: Mutex<Option<(String, bool)>>,
}

impl ProtocolHandler {
    pub fn new(config: Arc<ClientConfig>, state: Arc<ConnectionState>, ack_ids: Arc<AckIdGenerator>) -> ProtocolHandler {
        ProtocolHandler {
            config,
            state,
            transport: Mutex::new(None),
            correlation: CorrelationTable::new(),
            ack_ids,
            written_since_ping: AtomicBool::new(false),
            unanswered_ping_since: Mutex::new(None),
            broker_session_id: Mutex::new(None),
            connection_id: Mutex::new(None),
            ha_broker: AtomicBool::new(false),
            client_id: Mutex::new(None),
        }
    }

    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        *lock(&self.unanswered_ping_since) = None;
        *lock(&self.transport) = Some(transport);
    }

    pub fn take_transport(&self) -> Option<Arc<dyn Transport>> {
        lock(&self.transport).take()
    }

    fn current_transport(&self) -> MqResult<Arc<dyn Transport>> {
        lock(&self.transport).clone()
            .ok_or_else(|| MqError::ConnectionBroken("no transport".to_string()))
    }

    pub fn connection_id(&self) -> Option<i64> {
        *lock(&self.connection_id)
    }

    pub fn broker_session_id(&self) -> Option<i64> {
        *lock(&self.broker_session_id)
    }

    pub fn is_ha_broker(&self) -> bool {
        self.ha_broker.load(Ordering::Acquire)
    }

    /// Two phase commit is used for local transactions on an HA connection if configured
    pub fn use_two_phase_commit(&self) -> bool {
        self.is_ha_broker() && self.config.two_phase_commit_for_ha
    }

    pub fn pending_requests(&self) -> usize {
        self.correlation.len()
    }


    /// Sends a packet without waiting for anything. Passes the reconnect gate first.
    pub async fn write_packet(&self, packet: Packet) -> MqResult<()> {
        self.state.check_reconnecting().await?;
        self.write_past_gate(packet).await
    }

    async fn write_past_gate(&self, packet: Packet) -> MqResult<()> {
        if self.state.is_closed() {
            return Err(MqError::ConnectionBroken("connection is closed".to_string()));
        }

        let transport = self.current_transport()?;
        trace!(packet_type = %packet.packet_type, ack_id = packet.correlation_id, "sending packet");
        transport.send_packet(packet).await
            .map_err(MqError::Network)?;
        self.written_since_ping.store(true, Ordering::Release);
        Ok(())
    }

    fn register(&self, verb: PacketType) -> Exchange<'_> {
        let (correlation_id, replies) = self.correlation.register(&self.ack_ids, verb);
        Exchange {
            table: &self.correlation,
            correlation_id,
            verb,
            replies,
        }
    }

    /// Waits for the next reply of an exchange. A break of the connection wakes the waiter
    ///  early; it does not wait for the timeout to expire.
    async fn next_reply(&self, exchange: &mut Exchange<'_>, expected: PacketType) -> MqResult<Packet> {
        let reply = match exchange.replies.try_recv() {
            Ok(reply) => reply,
            Err(TryRecvError::Disconnected) => return Err(self.aborted(exchange.verb)),
            Err(TryRecvError::Empty) => {
                if self.state.is_broken() {
                    return Err(self.aborted(exchange.verb));
                }
                let received = match self.config.ack_timeout {
                    None => exchange.replies.recv().await,
                    Some(timeout) => match time::timeout(timeout, exchange.replies.recv()).await {
                        Ok(received) => received,
                        Err(_) => {
                            debug!(ack_id = exchange.correlation_id, verb = ?exchange.verb, "timeout waiting for reply");
                            return Err(MqError::Timeout { verb: exchange.verb, timeout });
                        }
                    },
                };
                received.ok_or_else(|| self.aborted(exchange.verb))?
            }
        };

        if reply.packet_type != expected {
            return Err(MqError::Protocol(format!("expected {} in reply to {}, got {}", expected, exchange.verb, reply.packet_type)));
        }
        Ok(reply)
    }

    fn aborted(&self, verb: PacketType) -> MqError {
        MqError::ConnectionBroken(format!("connection lost while waiting for reply to {:?}", verb))
    }

    /// Sends a request and waits for its reply.
    pub async fn write_packet_with_reply(&self, packet: Packet, expected: PacketType) -> MqResult<Packet> {
        let mut exchange = self.register(packet.packet_type);
        self.send_request(&exchange, packet).await?;
        self.next_reply(&mut exchange, expected).await
    }

    /// Writes the request of a registered exchange. A break while waiting at the reconnect gate
    ///  aborts the exchange; such a request is never written, not even to the new transport.
    async fn send_request(&self, exchange: &Exchange<'_>, mut packet: Packet) -> MqResult<()> {
        packet.correlation_id = exchange.correlation_id;
        packet.send_acknowledge = true;

        self.state.check_reconnecting().await?;
        if !self.correlation.contains(exchange.correlation_id) {
            debug!(ack_id = exchange.correlation_id, verb = ?exchange.verb, "request aborted before it was sent");
            return Err(self.aborted(exchange.verb));
        }
        self.write_past_gate(packet).await
    }

    /// Like [ProtocolHandler::write_packet_with_reply], re-sending the request once if the broker
    ///  answers with `RETRY`
    async fn write_packet_with_retry(&self, packet: Packet, expected: PacketType) -> MqResult<Packet> {
        let reply = self.write_packet_with_reply(packet.clone(), expected).await?;
        if Status::of(&reply) != Some(Status::Retry) {
            return Ok(reply);
        }

        debug!(verb = ?packet.packet_type, "broker asked for retry, re-sending request once");
        let mut retry = packet;
        retry.idempotent = true;
        self.write_packet_with_reply(retry, expected).await
    }

    /// Routes an inbound reply to the waiting request. Unknown ids are dropped.
    pub fn deliver_reply(&self, packet: Packet) -> bool {
        self.correlation.deliver(packet.correlation_id, packet)
    }

    /// Wakes every caller waiting for a reply; they see `ConnectionBroken`
    pub fn abort_pending(&self) -> usize {
        self.correlation.abort_all()
    }

    /// Any inbound traffic proves the broker is alive
    pub fn on_packet_received(&self) {
        *lock(&self.unanswered_ping_since) = None;
    }


    // ---------------------------------------- verbs ---------------------------------------------

    /// Handshake. With `resume`, the connection id from the previous handshake is sent so that
    ///  the broker can associate the new transport with the existing connection.
    pub async fn hello(&self, resume: bool) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::Hello)
            .with_property(props::PROTOCOL_LEVEL, self.config.protocol_level)
            .with_property(props::VERSION, CLIENT_VERSION)
            .with_property(props::USER_AGENT, USER_AGENT)
            .with_property(props::RECONNECTABLE, self.config.reconnect_enabled)
            .with_property(props::HA_CLIENT, true);
        if resume {
            if let Some(connection_id) = self.connection_id() {
                packet.set_property(props::CONNECTION_ID, connection_id);
            }
        }

        let mut exchange = self.register(PacketType::Hello);
        self.send_request(&exchange, packet).await?;

        let reply = self.next_reply(&mut exchange, PacketType::HelloReply).await?;
        check_ok(PacketType::Hello, &reply)?;

        if let Some(id) = reply.get_long(props::BROKER_SESSION_ID) {
            *lock(&self.broker_session_id) = Some(id);
        }
        if let Some(id) = reply.get_long(props::CONNECTION_ID) {
            *lock(&self.connection_id) = Some(id);
        }
        let ha = reply.get_bool(props::HA).unwrap_or(false);
        self.ha_broker.store(ha, Ordering::Release);
        debug!(connection_id = ?self.connection_id(), ha, resume, "hello acknowledged");

        if reply.get_str(props::AUTH_TYPE).is_some() {
            // the broker follows up with its challenge on the same correlation id
            let challenge = self.next_reply(&mut exchange, PacketType::AuthenticateRequest).await?;
            drop(exchange);
            let auth_type = challenge.get_str(props::AUTH_TYPE)
                .or_else(|| reply.get_str(props::AUTH_TYPE))
                .unwrap_or("basic")
                .to_string();
            self.authenticate(&auth_type).await?;
        }
        Ok(())
    }

    pub async fn authenticate(&self, auth_type: &str) -> MqResult<()> {
        let mut body = BytesMut::new();
        put_string(&mut body, &self.config.username);
        put_string(&mut body, &self.config.password);

        let packet = Packet::new(PacketType::Authenticate)
            .with_property(props::AUTH_TYPE, auth_type)
            .with_body(body.freeze());
        let reply = self.write_packet_with_reply(packet, PacketType::AuthenticateReply).await?;
        check_ok(PacketType::Authenticate, &reply)
    }

    pub async fn set_client_id(&self, client_id: &str, share: bool) -> MqResult<()> {
        let packet = Packet::new(PacketType::SetClientId)
            .with_property(props::CLIENT_ID, client_id)
            .with_property(props::SHARE, share);
        let reply = self.write_packet_with_reply(packet, PacketType::SetClientIdReply).await?;
        check_ok(PacketType::SetClientId, &reply)?;
        *lock(&self.client_id) = Some((client_id.to_string(), share));
        Ok(())
    }

    /// Re-sends the client id after a reconnect, if one was set
    pub async fn reset_client_id(&self) -> MqResult<()> {
        let client_id = lock(&self.client_id).clone();
        if let Some((client_id, share)) = client_id {
            self.set_client_id(&client_id, share).await?;
        }
        Ok(())
    }

    fn sent_client_id(&self) -> bool {
        lock(&self.client_id).is_some()
    }

    /// Creating a destination that exists already is not an error
    pub async fn create_destination(&self, destination: &Destination) -> MqResult<()> {
        let packet = destination_packet(PacketType::CreateDestination, destination);
        let reply = self.write_packet_with_retry(packet, PacketType::CreateDestinationReply).await?;
        if Status::of(&reply) == Some(Status::Conflict) {
            debug!(%destination, "destination exists already");
            return Ok(());
        }
        check_ok(PacketType::CreateDestination, &reply)
    }

    pub async fn delete_destination(&self, destination: &Destination) -> MqResult<()> {
        let packet = destination_packet(PacketType::DestroyDestination, destination);
        let reply = self.write_packet_with_reply(packet, PacketType::DestroyDestinationReply).await?;
        check_ok(PacketType::DestroyDestination, &reply)
    }

    pub async fn add_producer(&self, session_id: i64, destination: &Destination) -> MqResult<ProducerInfo> {
        let packet = destination_packet(PacketType::AddProducer, destination)
            .with_property(props::SESSION_ID, session_id);
        let reply = self.write_packet_with_retry(packet, PacketType::AddProducerReply).await?;
        check_ok(PacketType::AddProducer, &reply)?;

        let producer_id = reply.get_long(props::PRODUCER_ID)
            .ok_or_else(|| MqError::Protocol("ADD_PRODUCER reply without producer id".to_string()))?;
        Ok(ProducerInfo {
            producer_id: producer_id as u64,
            max_bytes: reply.get_long(props::BYTES),
            max_messages: reply.get_int(props::SIZE),
        })
    }

    pub async fn delete_producer(&self, producer_id: u64) -> MqResult<()> {
        let packet = Packet::new(PacketType::DeleteProducer)
            .with_property(props::PRODUCER_ID, producer_id);
        let reply = self.write_packet_with_reply(packet, PacketType::DeleteProducerReply).await?;
        check_ok(PacketType::DeleteProducer, &reply)
    }

    /// Registers a consumer and returns the broker assigned consumer id
    pub async fn add_consumer(&self, registration: &ConsumerRegistration<'_>) -> MqResult<u64> {
        let spec = registration.spec;
        let mut packet = destination_packet(PacketType::AddConsumer, &spec.destination)
            .with_property(props::SESSION_ID, registration.session_id)
            .with_property(props::ACK_MODE, registration.ack_mode.wire_value())
            .with_property(props::SIZE, spec.prefetch.unwrap_or(registration.prefetch))
            .with_property(props::NO_LOCAL, spec.no_local)
            .with_property(props::SHARE, spec.share)
            .with_property(props::RECONNECT, registration.old_consumer_id.is_some());
        if let Some(selector) = &spec.selector {
            packet.set_property(props::SELECTOR, selector.as_str());
        }
        if let Some(durable_name) = &spec.durable_name {
            packet.set_property(props::DURABLE_NAME, durable_name.as_str());
        }
        if let Some(name) = &spec.shared_subscription_name {
            packet.set_property(props::SHARED_SUBSCRIPTION_NAME, name.as_str());
        }
        if let Some(old_id) = registration.old_consumer_id {
            packet.set_property(props::OLD_CONSUMER_ID, old_id);
        }

        let reply = self.write_packet_with_retry(packet, PacketType::AddConsumerReply).await?;
        if Status::of(&reply) == Some(Status::BadRequest) && spec.selector.is_none() {
            // without a selector, there is nothing invalid the broker could refer to
            return Err(MqError::Server {
                verb: PacketType::AddConsumer,
                status: reply.status(),
                reason: reply.reason().to_string(),
            });
        }
        check_ok(PacketType::AddConsumer, &reply)?;

        reply.get_long(props::CONSUMER_ID)
            .map(|id| id as u64)
            .ok_or_else(|| MqError::Protocol("ADD_CONSUMER reply without consumer id".to_string()))
    }

    /// Deregisters a consumer. A consumer the broker does not know (any more) is not an error.
    pub async fn delete_consumer(&self, consumer_id: u64, last_delivered: Option<MessageId>) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::DeleteConsumer)
            .with_property(props::CONSUMER_ID, consumer_id)
            .with_property(props::BLOCK, true);
        if let Some(message_id) = last_delivered {
            packet.set_property(props::LAST_DELIVERED_MESSAGE_ID, true);
            packet.body = encode_ack_block(&[AckEntry::new(consumer_id, message_id)]);
        }

        let reply = self.write_packet_with_reply(packet, PacketType::DeleteConsumerReply).await?;
        if Status::of(&reply) == Some(Status::NotFound) {
            debug!(consumer_id, "consumer not found on broker");
            return Ok(());
        }
        check_ok(PacketType::DeleteConsumer, &reply)
    }

    pub async fn create_session(&self, ack_mode: AckMode) -> MqResult<i64> {
        let packet = Packet::new(PacketType::CreateSession)
            .with_property(props::ACK_MODE, ack_mode.wire_value());
        let reply = self.write_packet_with_reply(packet, PacketType::CreateSessionReply).await?;
        check_ok(PacketType::CreateSession, &reply)?;
        reply.get_long(props::SESSION_ID)
            .ok_or_else(|| MqError::Protocol("CREATE_SESSION reply without session id".to_string()))
    }

    pub async fn destroy_session(&self, session_id: i64) -> MqResult<()> {
        let packet = Packet::new(PacketType::DestroySession)
            .with_property(props::SESSION_ID, session_id);
        let reply = self.write_packet_with_reply(packet, PacketType::DestroySessionReply).await?;
        check_ok(PacketType::DestroySession, &reply)
    }

    /// Starts delivery for the connection, or for a single session. There is no reply.
    pub async fn start(&self, session_id: Option<i64>) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::Start);
        if let Some(session_id) = session_id {
            packet.set_property(props::SESSION_ID, session_id);
        }
        self.write_packet(packet).await
    }

    /// Stops delivery for the connection or a single session. When this returns, the broker
    ///  sends no more messages until delivery is started again.
    pub async fn stop(&self, session_id: Option<i64>) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::Stop);
        if let Some(session_id) = session_id {
            packet.set_property(props::SESSION_ID, session_id);
        }
        let reply = self.write_packet_with_reply(packet, PacketType::StopReply).await?;
        check_ok(PacketType::Stop, &reply)
    }

    /// Resumes flow for a consumer, or for the whole connection if `consumer_id` is `None`
    pub async fn resume_flow(&self, consumer_id: Option<u64>, size: i32) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::ResumeFlow)
            .with_property(props::SIZE, size);
        if let Some(consumer_id) = consumer_id {
            packet.set_property(props::CONSUMER_ID, consumer_id);
        }
        self.write_packet(packet).await
    }

    /// Acknowledges messages. The broker's reply is only waited for if the caller requires it
    ///  and acks are configured to be confirmed; the reply may report a remote broker failure.
    pub async fn acknowledge(&self, entries: &[AckEntry], transaction_id: Option<i64>, require_reply: bool) -> MqResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut packet = Packet::new(PacketType::Acknowledge)
            .with_body(encode_ack_block(entries));
        if let Some(tid) = transaction_id {
            packet.set_property(props::TRANSACTION_ID, tid);
        }

        if require_reply && self.config.ack_on_acknowledge {
            let reply = self.write_packet_with_reply(packet, PacketType::AcknowledgeReply).await?;
            check_ok(PacketType::Acknowledge, &reply)
        }
        else {
            self.write_packet(packet).await
        }
    }

    /// Asks the broker to redeliver messages. Fire-and-forget.
    pub async fn redeliver(&self, entries: &[AckEntry], set_redelivered: bool, transaction_id: Option<i64>) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::Redeliver)
            .with_property(props::SET_REDELIVERED, set_redelivered)
            .with_body(encode_ack_block(entries));
        if let Some(tid) = transaction_id {
            packet.set_property(props::TRANSACTION_ID, tid);
        }
        self.write_packet(packet).await
    }

    /// Starts a transaction and returns the broker assigned transaction id. For an XA branch,
    ///  the xid travels in the body and the broker assigns the local id.
    pub async fn start_transaction(&self, session_id: i64, xid: Option<&Xid>, xa_flags: i32) -> MqResult<i64> {
        let mut packet = Packet::new(PacketType::StartTransaction)
            .with_property(props::SESSION_ID, session_id);
        match xid {
            Some(xid) => {
                packet.set_property(props::XA_FLAGS, xa_flags);
                packet.body = encode_xid(xid);
            }
            None => {
                if self.use_two_phase_commit() {
                    packet.set_property(props::AUTO_ROLLBACK, AUTO_ROLLBACK_NOT_PREPARED);
                }
            }
        }

        let reply = self.write_packet_with_reply(packet, PacketType::StartTransactionReply).await?;
        check_ok(PacketType::StartTransaction, &reply)?;
        reply.get_long(props::TRANSACTION_ID)
            .ok_or_else(|| MqError::Protocol("START_TRANSACTION reply without transaction id".to_string()))
    }

    /// `NOT_MODIFIED` means the transaction had been ended already, which is fine
    pub async fn end_transaction(&self, transaction_id: i64, xid: Option<&Xid>, xa_flags: i32) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::EndTransaction)
            .with_property(props::TRANSACTION_ID, transaction_id);
        if let Some(xid) = xid {
            packet.set_property(props::XA_FLAGS, xa_flags);
            packet.body = encode_xid(xid);
        }

        let reply = self.write_packet_with_reply(packet, PacketType::EndTransactionReply).await?;
        if Status::of(&reply) == Some(Status::NotModified) {
            return Ok(());
        }
        check_ok(PacketType::EndTransaction, &reply)
    }

    pub async fn prepare(&self, transaction_id: i64, xid: Option<&Xid>) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::PrepareTransaction)
            .with_property(props::TRANSACTION_ID, transaction_id);
        if let Some(xid) = xid {
            packet.body = encode_xid(xid);
        }
        let reply = self.write_packet_with_reply(packet, PacketType::PrepareTransactionReply).await?;
        check_ok(PacketType::PrepareTransaction, &reply)
    }

    /// Commits a transaction. If `start_next` is set, the broker may start the next
    ///  transaction right away and return its id, saving a round trip.
    pub async fn commit(&self, transaction_id: i64, xid: Option<&Xid>, one_phase: bool, start_next: bool) -> MqResult<Option<i64>> {
        let mut packet = Packet::new(PacketType::CommitTransaction)
            .with_property(props::TRANSACTION_ID, transaction_id);
        if let Some(xid) = xid {
            packet.set_property(props::XA_ONE_PHASE, one_phase);
            packet.body = encode_xid(xid);
        }
        if start_next {
            packet.set_property(props::START_NEXT_TRANSACTION, true);
        }

        let reply = self.write_packet_with_reply(packet, PacketType::CommitTransactionReply).await?;
        check_ok(PacketType::CommitTransaction, &reply)?;
        Ok(reply.get_long(props::NEXT_TRANSACTION_ID))
    }

    /// Rolls back a local transaction without waiting for the broker
    pub async fn rollback(&self, transaction_id: i64, update_consumed: bool) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::RollbackTransaction)
            .with_property(props::TRANSACTION_ID, transaction_id);
        if update_consumed {
            packet.set_property(props::UPDATE_CONSUMED, true);
        }
        self.write_packet(packet).await
    }

    pub async fn rollback_xa(&self, transaction_id: i64, xid: &Xid) -> MqResult<()> {
        let packet = Packet::new(PacketType::RollbackTransaction)
            .with_property(props::TRANSACTION_ID, transaction_id)
            .with_property(props::REDELIVER, true)
            .with_body(encode_xid(xid));
        let reply = self.write_packet_with_reply(packet, PacketType::RollbackTransactionReply).await?;
        check_ok(PacketType::RollbackTransaction, &reply)
    }

    /// Lists the prepared transaction branches the broker knows about
    pub async fn recover_transactions(&self, xa_flags: i32) -> MqResult<Vec<Xid>> {
        let packet = Packet::new(PacketType::RecoverTransaction)
            .with_property(props::XA_FLAGS, xa_flags);
        let reply = self.write_packet_with_reply(packet, PacketType::RecoverTransactionReply).await?;
        check_ok(PacketType::RecoverTransaction, &reply)?;

        let quantity = reply.get_int(props::QUANTITY)
            .map(|n| n.max(0) as usize);
        decode_xid_list(&reply.body, quantity)
            .map_err(|e| MqError::Protocol(format!("RECOVER_TRANSACTION reply: {:#}", e)))
    }

    /// Asks the broker for the outcome of a transaction whose commit was interrupted.
    ///  `client_state` is how far the client got; the broker not knowing the transaction
    ///  is interpreted based on it.
    pub async fn verify_transaction(&self, transaction_id: i64, client_state: TransactionState, xid: Option<&Xid>) -> MqResult<VerifiedState> {
        let mut packet = Packet::new(PacketType::VerifyTransaction)
            .with_property(props::TRANSACTION_ID, transaction_id);
        if let Some(xid) = xid {
            packet.body = encode_xid(xid);
        }
        let reply = self.write_packet_with_reply(packet, PacketType::VerifyTransactionReply).await?;

        match Status::of(&reply) {
            Some(Status::Ok) => {
                let body = decode_int_map(&reply.body)
                    .map_err(|e| MqError::Protocol(format!("VERIFY_TRANSACTION reply: {:#}", e)))?;
                let state = body.get("State").copied().unwrap_or(-1);
                Ok(VerifiedState::from_wire(state))
            }
            Some(Status::NotFound) => Ok(match client_state {
                TransactionState::Ended => VerifiedState::RolledBack,
                TransactionState::Prepared => VerifiedState::Committed,
                _ => VerifiedState::Unknown(-1),
            }),
            _ => Err(status_error(PacketType::VerifyTransaction, &reply)),
        }
    }

    /// Sends a PING. It is fire-and-forget; with ping ack abort configured, the broker is
    ///  asked to answer, and the time of the first unanswered ping is remembered.
    pub async fn ping(&self) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::Ping);
        if self.config.ping_ack_abort_window.is_some() {
            packet.ping_ack_abort = true;
            lock(&self.unanswered_ping_since).get_or_insert_with(Instant::now);
        }
        self.write_packet(packet).await?;
        // a ping is not traffic that makes the next ping unnecessary
        self.written_since_ping.store(false, Ordering::Release);
        Ok(())
    }

    /// Returns and clears the 'written since the last ping' flag
    pub fn take_written_since_ping(&self) -> bool {
        self.written_since_ping.swap(false, Ordering::AcqRel)
    }

    /// `true` if the broker did not send anything within the ping ack abort window after a
    ///  ping requested an answer
    pub fn ping_timed_out(&self) -> bool {
        let Some(window) = self.config.ping_ack_abort_window else {
            return false;
        };
        match *lock(&self.unanswered_ping_since) {
            Some(since) => since.elapsed() >= window,
            None => false,
        }
    }

    pub async fn ping_reply(&self, ping: &Packet) -> MqResult<()> {
        let reply = Packet::reply_to(ping, PacketType::PingReply, Status::Ok.into());
        self.write_packet(reply).await
    }

    /// Says goodbye to the broker. The broker is asked to keep state around a little longer
    ///  (`JMQBlock`) if a client id was registered.
    pub async fn goodbye(&self, wait_for_reply: bool) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::Goodbye)
            .with_property(props::BLOCK, self.sent_client_id());
        if let Some(connection_id) = self.connection_id() {
            packet.set_property(props::CONNECTION_ID, connection_id);
        }

        if wait_for_reply {
            let reply = self.write_packet_with_reply(packet, PacketType::GoodbyeReply).await?;
            if let Err(e) = check_ok(PacketType::Goodbye, &reply) {
                warn!("broker did not acknowledge goodbye: {}", e);
            }
            Ok(())
        }
        else {
            self.write_packet(packet).await
        }
    }
}


fn destination_packet(packet_type: PacketType, destination: &Destination) -> Packet {
    Packet::new(packet_type)
        .with_property(props::DESTINATION, destination.name.as_str())
        .with_property(props::DEST_TYPE, destination.kind.wire_value())
}

/// Checks a reply's status, recognizing the failure of a remote broker in a cluster
///  before falling back to the generic status mapping
pub fn check_ok(verb: PacketType, reply: &Packet) -> MqResult<()> {
    if Status::of(reply) == Some(Status::Ok) {
        return Ok(());
    }
    if let Some(e) = remote_failure(verb, reply) {
        return Err(e);
    }
    Err(status_error(verb, reply))
}

fn remote_failure(verb: PacketType, reply: &Packet) -> Option<MqError> {
    let status = Status::of(reply);
    if matches!(status, Some(Status::Gone) | Some(Status::Timeout)) && reply.get_bool(props::REMOTE) == Some(true) {
        let consumer_ids = reply.get_str(props::REMOTE_CONSUMER_IDS)
            .map(RemoteFailure::parse_consumer_ids)
            .unwrap_or_default();
        return Some(MqError::RemoteBrokerFailure(RemoteFailure {
            verb,
            status: reply.status(),
            consumer_ids,
        }));
    }
    if reply.get_bool(props::PREPARE_STATE_FAILED) == Some(true) {
        return Some(MqError::PrepareFailed(format!("[{:?}] status {}: {}", verb, reply.status(), reply.reason())));
    }
    None
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;
    use tokio::time;

    use crate::error::ErrorKind;
    use crate::protocol::transport::{BrokerAddress, MockTransport, TransportConnector};
    use crate::test_util::mock_broker::MockBroker;
    use super::*;

    fn config() -> ClientConfig {
        let mut config = ClientConfig::new(vec![BrokerAddress::new("localhost", 7676)]);
        config.ping_interval = None;
        config
    }

    async fn handler_on(broker: &MockBroker, config: ClientConfig) -> Arc<ProtocolHandler> {
        let state = Arc::new(ConnectionState::new(config.reconnect_gate_recheck_interval));
        let handler = Arc::new(ProtocolHandler::new(Arc::new(config), state, Arc::new(AckIdGenerator::new())));
        let transport = broker.connect(&BrokerAddress::new("localhost", 7676)).await.unwrap();
        handler.set_transport(transport.clone());

        // replies only - the full inbound dispatch is tested with the connection
        let h2 = handler.clone();
        tokio::spawn(async move {
            while let Ok(Some(packet)) = transport.receive_packet().await {
                h2.deliver_reply(packet);
            }
        });
        handler
    }

    #[tokio::test]
    async fn test_create_session_correlates_reply() {
        let broker = MockBroker::new();
        let handler = handler_on(&broker, config()).await;

        let a = handler.create_session(AckMode::Auto).await.unwrap();
        let b = handler.create_session(AckMode::Client).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(handler.pending_requests(), 0);

        let sent = broker.sent_of_type(PacketType::CreateSession);
        assert_eq!(sent.len(), 2);
        assert_ne!(sent[0].correlation_id, sent[1].correlation_id);
        assert_eq!(sent[1].get_int(props::ACK_MODE), Some(2));
    }

    #[tokio::test]
    async fn test_fire_and_forget_verbs_do_not_wait() {
        let mut transport = MockTransport::new();
        transport.expect_send_packet()
            .times(3)
            .returning(|_| Ok(()));

        let config = config();
        let state = Arc::new(ConnectionState::new(config.reconnect_gate_recheck_interval));
        let handler = ProtocolHandler::new(Arc::new(config), state, Arc::new(AckIdGenerator::new()));
        handler.set_transport(Arc::new(transport));

        // nobody ever answers - these would hang if they waited for a reply
        handler.start(None).await.unwrap();
        handler.resume_flow(Some(5), 100).await.unwrap();
        handler.redeliver(&[AckEntry::new(5, MessageId(1))], true, None).await.unwrap();
        assert_eq!(handler.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_pending_request() {
        let broker = MockBroker::new();
        broker.script_silence(PacketType::CreateSession);

        let mut config = config();
        config.ack_timeout = Some(Duration::from_secs(5));
        let handler = handler_on(&broker, config).await;

        let started = time::Instant::now();
        let result = handler.create_session(AckMode::Auto).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(handler.pending_requests(), 0);

        // the late reply is dropped without harm
        let request = broker.sent_of_type(PacketType::CreateSession).remove(0);
        assert!(!handler.deliver_reply(Packet::reply_to(&request, PacketType::CreateSessionReply, 200)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_wakes_waiting_request() {
        let broker = MockBroker::new();
        broker.script_silence(PacketType::Stop);
        let handler = handler_on(&broker, config()).await;

        let h2 = handler.clone();
        let waiter = tokio::spawn(async move { h2.stop(None).await });
        time::sleep(Duration::from_secs(1000)).await;
        assert!(!waiter.is_finished());

        assert_eq!(handler.abort_pending(), 1);
        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap_err().kind(), ErrorKind::ConnectionBroken);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_aborted_at_reconnect_gate_is_never_sent() {
        let broker = MockBroker::new();
        let handler = handler_on(&broker, config()).await;
        handler.state.set_reconnecting(true);

        let h2 = handler.clone();
        let request = tokio::spawn(async move { h2.create_session(AckMode::Auto).await });
        time::sleep(Duration::from_secs(1)).await;
        assert!(!request.is_finished());
        assert_eq!(handler.pending_requests(), 1);

        // the transport breaks while the request waits at the gate, then failover completes
        assert_eq!(handler.abort_pending(), 1);
        handler.state.set_reconnecting(false);

        let result = request.await.unwrap();
        assert_eq!(result.unwrap_err().kind(), ErrorKind::ConnectionBroken);
        assert!(broker.sent_of_type(PacketType::CreateSession).is_empty());
        assert_eq!(handler.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_retry_is_resent_once_idempotently() {
        let broker = MockBroker::new();
        broker.script_status(PacketType::AddProducer, Status::Retry.into());
        let handler = handler_on(&broker, config()).await;

        let info = handler.add_producer(1, &Destination::queue("q")).await.unwrap();
        assert!(info.producer_id > 0);

        let sent = broker.sent_of_type(PacketType::AddProducer);
        assert_eq!(sent.len(), 2);
        assert!(!sent[0].idempotent);
        assert!(sent[1].idempotent);
    }

    #[tokio::test]
    async fn test_second_retry_surfaces_error() {
        let broker = MockBroker::new();
        broker.script_status(PacketType::CreateDestination, Status::Retry.into());
        broker.script_status(PacketType::CreateDestination, Status::Retry.into());
        let handler = handler_on(&broker, config()).await;

        let result = handler.create_destination(&Destination::queue("q")).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Server);
        assert_eq!(broker.sent_of_type(PacketType::CreateDestination).len(), 2);
    }

    #[tokio::test]
    async fn test_create_existing_destination_is_ok() {
        let broker = MockBroker::new();
        broker.script_status(PacketType::CreateDestination, Status::Conflict.into());
        let handler = handler_on(&broker, config()).await;
        handler.create_destination(&Destination::topic("t")).await.unwrap();
    }

    #[rstest]
    #[case::not_found(PacketType::AddConsumer, 404, ErrorKind::InvalidDestination)]
    #[case::forbidden(PacketType::AddConsumer, 403, ErrorKind::SecurityDenied)]
    #[case::consumer_limit(PacketType::AddConsumer, 409, ErrorKind::ResourceExhausted)]
    #[case::bad_selector(PacketType::AddConsumer, 400, ErrorKind::InvalidSelector)]
    #[case::unknown_status(PacketType::AddConsumer, 599, ErrorKind::Server)]
    #[tokio::test]
    async fn test_add_consumer_status(#[case] verb: PacketType, #[case] status: i32, #[case] expected: ErrorKind) {
        let broker = MockBroker::new();
        broker.script_status(verb, status);
        let handler = handler_on(&broker, config()).await;

        let spec = ConsumerSpec::new(Destination::queue("q")).with_selector("a = 1");
        let registration = ConsumerRegistration { spec: &spec, session_id: 1, ack_mode: AckMode::Auto, prefetch: 100, old_consumer_id: None };
        let result = handler.add_consumer(&registration).await;
        assert_eq!(result.unwrap_err().kind(), expected);
    }

    #[tokio::test]
    async fn test_bad_request_without_selector_is_server_error() {
        let broker = MockBroker::new();
        broker.script_status(PacketType::AddConsumer, 400);
        let handler = handler_on(&broker, config()).await;

        let spec = ConsumerSpec::new(Destination::queue("q"));
        let registration = ConsumerRegistration { spec: &spec, session_id: 1, ack_mode: AckMode::Auto, prefetch: 100, old_consumer_id: None };
        let result = handler.add_consumer(&registration).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Server);
    }

    #[tokio::test]
    async fn test_delete_unknown_consumer_is_ok() {
        let broker = MockBroker::new();
        broker.script_status(PacketType::DeleteConsumer, 404);
        let handler = handler_on(&broker, config()).await;
        handler.delete_consumer(99, Some(MessageId(3))).await.unwrap();

        let sent = broker.sent_of_type(PacketType::DeleteConsumer);
        assert_eq!(sent[0].get_bool(props::BLOCK), Some(true));
        assert!(!sent[0].body.is_empty());
    }

    #[tokio::test]
    async fn test_remote_failure_on_acknowledge() {
        let broker = MockBroker::new();
        broker.script(PacketType::Acknowledge, |request| {
            Packet::reply_to(request, PacketType::AcknowledgeReply, 410)
                .with_property(props::REMOTE, true)
                .with_property(props::REMOTE_CONSUMER_IDS, "7 9")
        });
        let handler = handler_on(&broker, config()).await;

        let err = handler.acknowledge(&[AckEntry::new(7, MessageId(1))], None, true).await.unwrap_err();
        let failure = err.remote_failure().unwrap();
        assert_eq!(failure.consumer_ids, vec![7, 9]);
        assert_eq!(failure.verb, PacketType::Acknowledge);
    }

    #[tokio::test]
    async fn test_gone_without_remote_flag_is_server_error() {
        let broker = MockBroker::new();
        broker.script_status(PacketType::CommitTransaction, 410);
        let handler = handler_on(&broker, config()).await;
        let err = handler.commit(5, None, false, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Server);
    }

    #[rstest]
    #[case::required(true, true, true)]
    #[case::not_required(false, true, false)]
    #[case::not_configured(true, false, false)]
    #[tokio::test]
    async fn test_acknowledge_reply_policy(#[case] require: bool, #[case] ack_on_acknowledge: bool, #[case] expect_reply_requested: bool) {
        let broker = MockBroker::new();
        let mut config = config();
        config.ack_on_acknowledge = ack_on_acknowledge;
        let handler = handler_on(&broker, config).await;

        handler.acknowledge(&[AckEntry::new(1, MessageId(1))], Some(17), require).await.unwrap();
        let sent = broker.sent_of_type(PacketType::Acknowledge);
        assert_eq!(sent[0].send_acknowledge, expect_reply_requested);
        assert_eq!(sent[0].get_long(props::TRANSACTION_ID), Some(17));
    }

    #[tokio::test]
    async fn test_hello_records_broker_identity() {
        let broker = MockBroker::new();
        let handler = handler_on(&broker, config()).await;
        handler.hello(false).await.unwrap();

        assert!(handler.connection_id().is_some());
        assert!(handler.broker_session_id().is_some());
        assert!(handler.is_ha_broker());

        handler.hello(true).await.unwrap();
        let hellos = broker.sent_of_type(PacketType::Hello);
        assert_eq!(hellos[0].get_long(props::CONNECTION_ID), None);
        assert_eq!(hellos[1].get_long(props::CONNECTION_ID), handler.connection_id());
    }

    #[tokio::test]
    async fn test_hello_with_authentication() {
        let broker = MockBroker::new();
        broker.require_authentication();
        let handler = handler_on(&broker, config()).await;
        handler.hello(false).await.unwrap();
        assert_eq!(broker.sent_of_type(PacketType::Authenticate).len(), 1);
        assert_eq!(handler.pending_requests(), 0);
    }

    #[rstest]
    #[case::unavailable(503, ErrorKind::BrokerUnavailable)]
    #[case::takeover(408, ErrorKind::TakeoverInProgress)]
    #[case::redirect(301, ErrorKind::Redirect)]
    #[tokio::test]
    async fn test_hello_failure(#[case] status: i32, #[case] expected: ErrorKind) {
        let broker = MockBroker::new();
        broker.script_status(PacketType::Hello, status);
        let handler = handler_on(&broker, config()).await;
        assert_eq!(handler.hello(false).await.unwrap_err().kind(), expected);
    }

    #[rstest]
    #[case::found_prepared(200, Some(6), TransactionState::Ended, VerifiedState::Prepared)]
    #[case::found_committed(200, Some(7), TransactionState::Prepared, VerifiedState::Committed)]
    #[case::not_found_ended(404, None, TransactionState::Ended, VerifiedState::RolledBack)]
    #[case::not_found_prepared(404, None, TransactionState::Prepared, VerifiedState::Committed)]
    #[tokio::test]
    async fn test_verify_transaction(#[case] status: i32, #[case] state: Option<i32>, #[case] client_state: TransactionState, #[case] expected: VerifiedState) {
        let broker = MockBroker::new();
        broker.script(PacketType::VerifyTransaction, move |request| {
            let reply = Packet::reply_to(request, PacketType::VerifyTransactionReply, status);
            match state {
                Some(state) => reply.with_body(crate::protocol::body::encode_int_map(&[("State", state)])),
                None => reply,
            }
        });
        let handler = handler_on(&broker, config()).await;
        assert_eq!(handler.verify_transaction(3, client_state, None).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_commit_returns_next_transaction_id() {
        let broker = MockBroker::new();
        broker.script(PacketType::CommitTransaction, |request| {
            Packet::reply_to(request, PacketType::CommitTransactionReply, 200)
                .with_property(props::NEXT_TRANSACTION_ID, 1234i64)
        });
        let handler = handler_on(&broker, config()).await;
        assert_eq!(handler.commit(5, None, false, true).await.unwrap(), Some(1234));
        assert_eq!(broker.sent_of_type(PacketType::CommitTransaction)[0].get_bool(props::START_NEXT_TRANSACTION), Some(true));
    }

    #[tokio::test]
    async fn test_goodbye_block_flag() {
        let broker = MockBroker::new();
        let handler = handler_on(&broker, config()).await;
        handler.goodbye(false).await.unwrap();
        handler.set_client_id("me", false).await.unwrap();
        handler.goodbye(true).await.unwrap();

        let sent = broker.sent_of_type(PacketType::Goodbye);
        assert_eq!(sent[0].get_bool(props::BLOCK), Some(false));
        assert_eq!(sent[1].get_bool(props::BLOCK), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_ack_abort() {
        let mut transport = MockTransport::new();
        transport.expect_send_packet()
            .returning(|_| Ok(()));

        let mut config = config();
        config.ping_interval = Some(Duration::from_secs(1));
        config.ping_ack_abort_window = Some(Duration::from_secs(3));
        let state = Arc::new(ConnectionState::new(config.reconnect_gate_recheck_interval));
        let handler = ProtocolHandler::new(Arc::new(config), state, Arc::new(AckIdGenerator::new()));
        handler.set_transport(Arc::new(transport));

        handler.ping().await.unwrap();
        assert!(!handler.ping_timed_out());
        time::advance(Duration::from_secs(2)).await;
        handler.on_packet_received();
        handler.ping().await.unwrap();
        time::advance(Duration::from_secs(2)).await;
        assert!(!handler.ping_timed_out());
        handler.ping().await.unwrap();
        time::advance(Duration::from_secs(1)).await;
        assert!(handler.ping_timed_out());
    }

    #[tokio::test]
    async fn test_write_without_transport_fails() {
        let config = config();
        let state = Arc::new(ConnectionState::new(config.reconnect_gate_recheck_interval));
        let handler = ProtocolHandler::new(Arc::new(config), state, Arc::new(AckIdGenerator::new()));
        let err = handler.start(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionBroken);
    }
}
