use std::collections::VecDeque;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, instrument, trace, warn};

use crate::connection::config::ClientConfig;
use crate::connection::connection::ConnectionCore;
use crate::connection::state::ConnectionState;
use crate::error::{ErrorKind, MqError, MqResult, RemoteFailure};
use crate::protocol::body::{AckEntry, Xid};
use crate::protocol::destination::Destination;
use crate::protocol::packet::{MessageId, Packet};
use crate::protocol::protocol_handler::{ConsumerRegistration, ProducerInfo, ProtocolHandler};
use crate::session::ack_mode::{auto_ack_requires_reply, AckMode, DupsOkPolicy};
use crate::session::consumer::{ConsumerId, ConsumerSpec, ConsumerState};
use crate::session::critical_section::{CriticalSection, DeliveryContext, SyncOperation};
use crate::session::ledger::UnackedLedger;
use crate::session::transaction::Transaction;
use crate::util::sync::lock;


/// A message handed to the application
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub consumer: ConsumerId,
    pub packet: Packet,
}

impl ReceivedMessage {
    pub fn message_id(&self) -> Option<MessageId> {
        self.packet.message_id
    }

    pub fn redelivered(&self) -> bool {
        self.packet.redelivered
    }

    /// The (broker consumer id, message id) pair acknowledging this message. For a delivered
    ///  message, the packet's correlation id is the broker side consumer id.
    pub fn ack_entry(&self) -> Option<AckEntry> {
        self.packet.message_id
            .map(|message_id| AckEntry::new(self.packet.correlation_id, message_id))
    }
}

/// Asynchronous delivery to the application. The context identifies the session's own delivery
///  and must be passed to session operations called from within the listener.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn on_message(&self, ctx: &DeliveryContext, message: ReceivedMessage);
}


#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ProducerId(pub u64);

#[derive(Clone, Debug)]
struct ProducerState {
    destination: Destination,
    info: ProducerInfo,
}

#[derive(Default)]
struct SessionInner {
    consumers: FxHashMap<ConsumerId, ConsumerState>,
    by_broker_id: FxHashMap<u64, ConsumerId>,
    listeners: FxHashMap<ConsumerId, Arc<dyn MessageListener>>,
    /// messages received from the broker and not yet handed to the application, keyed by the
    ///  broker consumer id in their correlation id
    staged: VecDeque<Packet>,
    ledger: UnackedLedger,
    producers: FxHashMap<ProducerId, ProducerState>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionInner {
    fn take_staged_for(&mut self, consumer: ConsumerId) -> Option<Packet> {
        let broker_id = self.consumers.get(&consumer)?.broker_id;
        let idx = self.staged.iter().position(|p| p.correlation_id == broker_id)?;
        self.staged.remove(idx)
    }

    fn remove_staged_for(&mut self, broker_ids: &[u64]) -> usize {
        let before = self.staged.len();
        self.staged.retain(|p| !broker_ids.contains(&p.correlation_id));
        before - self.staged.len()
    }

    fn set_broker_id(&mut self, consumer: ConsumerId, broker_id: u64) {
        if let Some(state) = self.consumers.get_mut(&consumer) {
            self.by_broker_id.remove(&state.broker_id);
            state.broker_id = broker_id;
            state.last_delivered = None;
            state.delivered_since_resume = 0;
            self.by_broker_id.insert(broker_id, consumer);
        }
    }
}

/// Decrements the in-flight delivery count when dropped, waking a close that waits for
///  deliveries to drain
struct InFlight<'a> {
    session: &'a Session,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.session.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.session.delivery_idle.notify_waiters();
        }
    }
}


/// One serial unit of consuming and producing work.
///
/// Delivered messages go through the session's acknowledgement policy; commit, rollback, recover
///  and close are mutually exclusive (see [CriticalSection]). Locks are taken in the order
///  critical section, transaction, `inner`, and `inner` is never held across an `.await`.
pub struct Session {
    id: u64,
    broker_id: AtomicI64,
    ack_mode: AckMode,
    xa: bool,

    config: Arc<ClientConfig>,
    handler: Arc<ProtocolHandler>,
    connection_state: Arc<ConnectionState>,
    connection: Weak<ConnectionCore>,
    dups_ok: DupsOkPolicy,

    critical: CriticalSection,
    transaction: tokio::sync::Mutex<Option<Transaction>>,
    inner: Mutex<SessionInner>,

    message_arrived: Notify,
    delivery_idle: Notify,
    in_flight: AtomicUsize,

    next_consumer_id: AtomicU64,
    next_producer_id: AtomicU64,

    closing: AtomicBool,
    closed: AtomicBool,
    /// delivery is paused by rollback / recover / remote failure recovery
    stopped: AtomicBool,
    /// set when the connection failed over; the transaction in progress is lost
    failover_occurred: AtomicBool,
    /// remote broker failure reported to an operation that could not recover from it itself
    remote_failure: Mutex<Option<RemoteFailure>>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn create(
        id: u64,
        ack_mode: AckMode,
        xa: bool,
        config: Arc<ClientConfig>,
        handler: Arc<ProtocolHandler>,
        connection_state: Arc<ConnectionState>,
        connection: Weak<ConnectionCore>,
    ) -> MqResult<Arc<Session>> {
        let broker_id = handler.create_session(ack_mode).await?;

        let transaction = if ack_mode == AckMode::Transacted {
            let mut tx = Transaction::new(handler.clone(), connection_state.clone(), config.auto_start_transaction);
            if !xa {
                if let Err(e) = tx.start_local(broker_id).await {
                    if let Err(destroy_error) = handler.destroy_session(broker_id).await {
                        debug!("destroying session after failed transaction start: {}", destroy_error);
                    }
                    return Err(e);
                }
            }
            Some(tx)
        }
        else {
            None
        };

        let session = Arc::new(Session {
            id,
            broker_id: AtomicI64::new(broker_id),
            ack_mode,
            xa,
            dups_ok: DupsOkPolicy::from_config(&config),
            critical: CriticalSection::new(id, config.consumer_close_wait),
            config,
            handler,
            connection_state,
            connection,
            transaction: tokio::sync::Mutex::new(transaction),
            inner: Default::default(),
            message_arrived: Notify::new(),
            delivery_idle: Notify::new(),
            in_flight: AtomicUsize::new(0),
            next_consumer_id: AtomicU64::new(0),
            next_producer_id: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            failover_occurred: AtomicBool::new(false),
            remote_failure: Mutex::new(None),
        });

        if let (AckMode::DupsOk, Some(timeout)) = (ack_mode, session.config.dups_ok_timeout) {
            let task = tokio::spawn(run_dups_ok_flusher(Arc::downgrade(&session), timeout));
            lock(&session.inner).tasks.push(task);
        }

        debug!(session_id = id, broker_session_id = broker_id, ?ack_mode, xa, "session created");
        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn broker_session_id(&self) -> i64 {
        self.broker_id.load(Ordering::Acquire)
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn unacked_count(&self) -> usize {
        lock(&self.inner).ledger.len()
    }

    pub fn staged_count(&self) -> usize {
        lock(&self.inner).staged.len()
    }

    pub fn consumer_ids(&self) -> Vec<ConsumerId> {
        let mut result = lock(&self.inner).consumers.keys().copied().collect::<Vec<_>>();
        result.sort();
        result
    }

    /// The broker side id currently registered for a consumer
    pub fn broker_consumer_id(&self, consumer: ConsumerId) -> Option<u64> {
        lock(&self.inner).consumers.get(&consumer)
            .map(|c| c.broker_id)
    }

    pub fn producer_info(&self, producer: ProducerId) -> Option<ProducerInfo> {
        lock(&self.inner).producers.get(&producer)
            .map(|p| p.info.clone())
    }

    pub async fn transaction_id(&self) -> Option<i64> {
        self.transaction.lock().await.as_ref()
            .map(|tx| tx.transaction_id())
    }

    fn is_own_delivery(&self, ctx: Option<&DeliveryContext>) -> bool {
        ctx.map(|c| c.session_id() == self.id)
            .unwrap_or(false)
    }

    /// A closing session still accepts calls from its own delivery, which the close is waiting for
    fn check_open(&self, ctx: Option<&DeliveryContext>) -> MqResult<()> {
        if self.is_closed() || (self.closing.load(Ordering::Acquire) && !self.is_own_delivery(ctx)) {
            return Err(MqError::illegal_state(format!("session {} is closed", self.id)));
        }
        Ok(())
    }

    fn check_transacted(&self, op: &str) -> MqResult<()> {
        if self.ack_mode != AckMode::Transacted {
            return Err(MqError::illegal_state(format!("{} requires a transacted session", op)));
        }
        Ok(())
    }

    fn is_delivery_paused(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.connection_state.is_stopped()
    }

    fn begin_delivery(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight { session: self }
    }

    /// Waits until no message is being handed to the application
    pub(crate) async fn wait_for_drain(&self) {
        loop {
            let mut idle = pin!(self.delivery_idle.notified());
            idle.as_mut().enable();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            trace!(session_id = self.id, "waiting for deliveries to drain");
            idle.await;
        }
    }

    /// Wakes receivers and the listener delivery, e.g. after the connection was started
    pub(crate) fn wake(&self) {
        self.message_arrived.notify_waiters();
    }


    // --------------------------------------- producers ------------------------------------------

    pub async fn create_producer(&self, destination: Destination) -> MqResult<ProducerId> {
        self.check_open(None)?;
        let info = self.handler.add_producer(self.broker_session_id(), &destination).await?;
        let id = ProducerId(self.next_producer_id.fetch_add(1, Ordering::AcqRel) + 1);
        debug!(session_id = self.id, producer_id = info.producer_id, %destination, "producer created");
        lock(&self.inner).producers.insert(id, ProducerState { destination, info });
        Ok(id)
    }

    pub async fn close_producer(&self, producer: ProducerId) -> MqResult<()> {
        let Some(state) = lock(&self.inner).producers.remove(&producer) else {
            return Ok(());
        };
        if self.connection_state.is_unusable() {
            return Ok(());
        }
        self.handler.delete_producer(state.info.producer_id).await
    }

    pub(crate) async fn recreate_producers(&self) -> MqResult<()> {
        let producers = lock(&self.inner).producers.iter()
            .map(|(id, p)| (*id, p.destination.clone()))
            .collect::<Vec<_>>();

        for (id, destination) in producers {
            let info = self.handler.add_producer(self.broker_session_id(), &destination).await?;
            if let Some(state) = lock(&self.inner).producers.get_mut(&id) {
                state.info = info;
            }
        }
        Ok(())
    }


    // --------------------------------------- consumers ------------------------------------------

    fn registration<'a>(&self, spec: &'a ConsumerSpec, old_consumer_id: Option<u64>) -> ConsumerRegistration<'a> {
        ConsumerRegistration {
            spec,
            session_id: self.broker_session_id(),
            ack_mode: self.ack_mode,
            prefetch: self.config.prefetch_max_messages,
            old_consumer_id,
        }
    }

    pub async fn create_consumer(&self, spec: ConsumerSpec) -> MqResult<ConsumerId> {
        self.check_open(None)?;
        let broker_id = self.handler.add_consumer(&self.registration(&spec, None)).await?;

        let id = ConsumerId(self.next_consumer_id.fetch_add(1, Ordering::AcqRel) + 1);
        debug!(session_id = self.id, consumer_id = ?id, broker_id, destination = %spec.destination, "consumer created");
        {
            let mut inner = lock(&self.inner);
            inner.consumers.insert(id, ConsumerState::new(id, spec, broker_id));
            inner.by_broker_id.insert(broker_id, id);
        }
        // messages may have arrived before the reply was processed
        self.message_arrived.notify_waiters();
        Ok(id)
    }

    pub async fn close_consumer(&self, consumer: ConsumerId) -> MqResult<()> {
        self.do_close_consumer(None, consumer).await
    }

    pub async fn close_consumer_in(&self, ctx: &DeliveryContext, consumer: ConsumerId) -> MqResult<()> {
        self.do_close_consumer(Some(ctx), consumer).await
    }

    /// Messages of the consumer that were delivered but not acknowledged are dropped from the
    ///  ledger; the broker redelivers them.
    async fn do_close_consumer(&self, ctx: Option<&DeliveryContext>, consumer: ConsumerId) -> MqResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let _guard = match ctx {
            Some(ctx) => self.critical.enter(SyncOperation::ConsumerClosing, Some(ctx)).await?,
            None => self.critical.enter_when_free(SyncOperation::ConsumerClosing).await,
        };

        let state = {
            let mut inner = lock(&self.inner);
            let Some(state) = inner.consumers.remove(&consumer) else {
                return Ok(());
            };
            inner.by_broker_id.remove(&state.broker_id);
            inner.listeners.remove(&consumer);
            let staged = inner.remove_staged_for(&[state.broker_id]);
            let unacked = inner.ledger.remove_consumer(state.broker_id);
            debug!(session_id = self.id, ?consumer, staged, unacked, "closing consumer");
            state
        };

        if self.connection_state.is_unusable() {
            return Ok(());
        }
        self.handler.delete_consumer(state.broker_id, state.last_delivered).await
    }

    /// Re-registers consumers with the broker under their existing local ids
    pub(crate) async fn recreate_consumers(&self, consumers: &[ConsumerId], delete_first: bool) -> MqResult<()> {
        for &consumer in consumers {
            let Some(state) = lock(&self.inner).consumers.get(&consumer).cloned() else {
                continue;
            };
            if delete_first {
                if let Err(e) = self.handler.delete_consumer(state.broker_id, None).await {
                    debug!(?consumer, "deleting consumer before re-registration: {}", e);
                }
            }

            let broker_id = self.handler.add_consumer(&self.registration(&state.spec, Some(state.broker_id))).await?;
            debug!(session_id = self.id, ?consumer, old_broker_id = state.broker_id, broker_id, "consumer re-registered");
            lock(&self.inner).set_broker_id(consumer, broker_id);
        }
        self.message_arrived.notify_waiters();
        Ok(())
    }

    /// Re-registers the consumers affected by the failure of a remote broker. Returns `false` if
    ///  none of this session's consumers is affected.
    pub(crate) async fn recover_from_remote_failure(&self, failure: &RemoteFailure) -> MqResult<bool> {
        let affected = {
            let inner = lock(&self.inner);
            inner.consumers.values()
                .filter(|c| failure.consumer_ids.contains(&c.broker_id))
                .map(|c| (c.id, c.broker_id))
                .collect::<Vec<_>>()
        };
        if affected.is_empty() {
            debug!(session_id = self.id, reported = ?failure.consumer_ids, "remote broker failure does not affect this session");
            return Ok(false);
        }
        info!(session_id = self.id, affected = ?affected, "re-registering consumers after remote broker failure");

        let was_stopped = self.stopped.swap(true, Ordering::AcqRel);
        if !was_stopped && !self.connection_state.is_stopped() {
            self.handler.stop(Some(self.broker_session_id())).await?;
        }

        // Staged messages and the whole ledger are dropped. The affected consumers get theirs
        //  again after re-registration, the other consumers' messages are handed back to the
        //  broker. A transaction was rolled back by the broker already.
        let broker_ids = affected.iter().map(|(_, b)| *b).collect::<Vec<_>>();
        let (staged, unacked) = self.take_for_redelivery();
        let unaffected = |e: &AckEntry| !broker_ids.contains(&e.consumer_id);
        let staged = staged.into_iter().filter(unaffected).collect::<Vec<_>>();
        let unacked = match self.ack_mode {
            AckMode::Transacted => Vec::new(),
            _ => unacked.into_iter().filter(unaffected).collect::<Vec<_>>(),
        };

        let ids = affected.iter().map(|(id, _)| *id).collect::<Vec<_>>();
        let result = async {
            self.recreate_consumers(&ids, true).await?;
            if !staged.is_empty() {
                self.handler.redeliver(&staged, false, None).await?;
            }
            if !unacked.is_empty() {
                self.handler.redeliver(&unacked, true, None).await?;
            }
            Ok::<_, MqError>(())
        }.await;
        if !was_stopped {
            self.resume_delivery().await?;
        }
        result.map(|_| true)
    }

    fn note_remote_failure<T>(&self, result: &MqResult<T>) {
        if let Err(MqError::RemoteBrokerFailure(failure)) = result {
            *lock(&self.remote_failure) = Some(failure.clone());
        }
    }


    // ----------------------------------------- receive ------------------------------------------

    /// Stages a message pushed by the broker
    pub(crate) fn on_message(&self, packet: Packet) {
        if self.is_closed() {
            trace!(session_id = self.id, "dropping message for closed session");
            return;
        }
        lock(&self.inner).staged.push_back(packet);
        self.message_arrived.notify_waiters();
    }

    /// Messages without a session id are routed by the consumer they are addressed to
    pub(crate) fn owns_broker_consumer(&self, broker_id: u64) -> bool {
        lock(&self.inner).by_broker_id.contains_key(&broker_id)
    }

    /// Waits for the next message for `consumer`, up to `timeout` (forever if `None`). Returns
    ///  `None` if no message arrived in time.
    pub async fn receive(&self, consumer: ConsumerId, timeout: Option<Duration>) -> MqResult<Option<ReceivedMessage>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let mut arrived = pin!(self.message_arrived.notified());
            arrived.as_mut().enable();

            self.check_open(None)?;
            let taken = {
                let mut inner = lock(&self.inner);
                if !inner.consumers.contains_key(&consumer) {
                    return Err(MqError::illegal_state(format!("{:?} is closed", consumer)));
                }
                if inner.listeners.contains_key(&consumer) {
                    return Err(MqError::illegal_state(format!("{:?} has a message listener", consumer)));
                }
                if self.is_delivery_paused() {
                    None
                }
                else {
                    inner.take_staged_for(consumer)
                        .map(|packet| (packet, self.begin_delivery()))
                }
            };

            if let Some((packet, _in_flight)) = taken {
                let message = self.record_delivery(consumer, packet).await?;
                self.complete_delivery(&message).await?;
                return Ok(Some(message));
            }

            match deadline {
                None => arrived.await,
                Some(deadline) => {
                    if time::timeout_at(deadline, arrived).await.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    pub async fn receive_no_wait(&self, consumer: ConsumerId) -> MqResult<Option<ReceivedMessage>> {
        self.receive(consumer, Some(Duration::ZERO)).await
    }

    pub fn set_message_listener(self: &Arc<Self>, consumer: ConsumerId, listener: Arc<dyn MessageListener>) -> MqResult<()> {
        self.check_open(None)?;
        {
            let mut inner = lock(&self.inner);
            if !inner.consumers.contains_key(&consumer) {
                return Err(MqError::illegal_state(format!("{:?} is closed", consumer)));
            }
            inner.listeners.insert(consumer, listener);
            if inner.listeners.len() == 1 {
                let task = tokio::spawn(run_delivery(self.clone()));
                inner.tasks.push(task);
            }
        }
        self.message_arrived.notify_waiters();
        Ok(())
    }

    /// Hands the next staged message that has a listener to that listener. Returns `false` if
    ///  there was nothing to deliver.
    async fn deliver_next_to_listener(&self) -> bool {
        let (consumer, packet, listener, _in_flight) = {
            let mut inner = lock(&self.inner);
            if self.closing.load(Ordering::Acquire) || self.is_delivery_paused() {
                return false;
            }
            let next = inner.staged.iter()
                .position(|p| inner.by_broker_id.get(&p.correlation_id)
                    .map(|c| inner.listeners.contains_key(c))
                    .unwrap_or(false));
            let Some(idx) = next else {
                return false;
            };
            let Some(packet) = inner.staged.remove(idx) else {
                return false;
            };
            let Some(&consumer) = inner.by_broker_id.get(&packet.correlation_id) else {
                return false;
            };
            let Some(listener) = inner.listeners.get(&consumer).cloned() else {
                return false;
            };
            (consumer, packet, listener, self.begin_delivery())
        };

        let message = match self.record_delivery(consumer, packet).await {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = self.id, ?consumer, "delivery failed: {}", e);
                return true;
            }
        };
        let ctx = DeliveryContext::new(self.id);
        listener.on_message(&ctx, message.clone()).await;

        if let Err(e) = self.complete_delivery(&message).await {
            warn!(session_id = self.id, ?consumer, "acknowledging after delivery failed: {}", e);
        }
        true
    }

    /// Bookkeeping before a message is handed to the application: flow control, and the ledger
    ///  for the modes that keep one
    async fn record_delivery(&self, consumer: ConsumerId, packet: Packet) -> MqResult<ReceivedMessage> {
        let message = ReceivedMessage { consumer, packet };
        let resume = {
            let mut inner = lock(&self.inner);
            let threshold = self.config.prefetch_resume_threshold();
            let Some(state) = inner.consumers.get_mut(&consumer) else {
                return Err(MqError::illegal_state(format!("{:?} was closed during delivery", consumer)));
            };
            let resume = state.on_delivered(message.message_id(), threshold)
                .then(|| (state.broker_id, state.spec.prefetch.unwrap_or(self.config.prefetch_max_messages)));

            if self.ack_mode.uses_ledger() {
                if let Some(entry) = message.ack_entry() {
                    inner.ledger.push(entry);
                }
                if self.ack_mode == AckMode::Client {
                    if let Some(limit) = self.config.client_ack_limit {
                        if inner.ledger.len() > limit {
                            warn!(session_id = self.id, unacked = inner.ledger.len(), limit, "client acknowledge session accumulates unacknowledged messages");
                        }
                    }
                }
            }
            resume
        };

        if let Some((broker_id, size)) = resume {
            if let Err(e) = self.handler.resume_flow(Some(broker_id), size).await {
                debug!(broker_id, "resuming consumer flow failed: {}", e);
            }
        }
        Ok(message)
    }

    /// Acknowledgement after the application got the message
    async fn complete_delivery(&self, message: &ReceivedMessage) -> MqResult<()> {
        match self.ack_mode {
            AckMode::Auto => {
                let Some(entry) = message.ack_entry() else {
                    return Ok(());
                };
                let durable = lock(&self.inner).consumers.get(&message.consumer)
                    .map(|c| c.spec.is_durable())
                    .unwrap_or(false);
                let require_reply = auto_ack_requires_reply(&message.packet, durable, &self.config);
                self.send_acks(&[entry], None, require_reply).await
            }
            AckMode::DupsOk => self.flush_dups_ok(false).await,
            AckMode::Client | AckMode::Transacted | AckMode::NoAck => Ok(()),
        }
    }

    /// Sends pending dups-ok acknowledgements if the policy says so (or unconditionally if
    ///  `force` is set). They are never waited for.
    async fn flush_dups_ok(&self, force: bool) -> MqResult<()> {
        let entries = {
            let mut inner = lock(&self.inner);
            let due = self.dups_ok.should_flush(inner.ledger.len(), inner.ledger.first_added_at(), inner.staged.is_empty());
            if !(due || (force && !inner.ledger.is_empty())) {
                return Ok(());
            }
            inner.ledger.take_all()
        };
        trace!(session_id = self.id, num_entries = entries.len(), "flushing dups-ok acknowledgements");
        self.send_acks(&entries, None, false).await
    }

    async fn send_acks(&self, entries: &[AckEntry], transaction_id: Option<i64>, require_reply: bool) -> MqResult<()> {
        match self.handler.acknowledge(entries, transaction_id, require_reply).await {
            Err(MqError::RemoteBrokerFailure(failure)) => {
                self.recover_from_remote_failure(&failure).await?;
                Err(MqError::RemoteBrokerFailure(failure))
            }
            other => other,
        }
    }


    // ------------------------------------- acknowledge ------------------------------------------

    /// Acknowledges every message delivered by this session so far. Only client acknowledge
    ///  sessions acknowledge explicitly; for other modes, this does nothing.
    pub async fn acknowledge(&self) -> MqResult<()> {
        self.check_open(None)?;
        if self.ack_mode != AckMode::Client {
            return Ok(());
        }
        let entries = lock(&self.inner).ledger.take_all();
        self.send_acks(&entries, None, true).await
    }

    /// Acknowledges exactly this message
    pub async fn acknowledge_this(&self, message: &ReceivedMessage) -> MqResult<()> {
        self.check_open(None)?;
        if self.ack_mode != AckMode::Client {
            return Ok(());
        }
        let Some(entry) = message.ack_entry() else {
            return Ok(());
        };
        let Some(entry) = lock(&self.inner).ledger.take_matching(&entry) else {
            trace!(?entry, "message is not waiting for acknowledgement");
            return Ok(());
        };
        self.send_acks(&[entry], None, true).await
    }

    /// Acknowledges this message and every message delivered before it
    pub async fn acknowledge_up_through(&self, message: &ReceivedMessage) -> MqResult<()> {
        self.check_open(None)?;
        if self.ack_mode != AckMode::Client {
            return Ok(());
        }
        let Some(entry) = message.ack_entry() else {
            return Ok(());
        };
        let entries = lock(&self.inner).ledger.take_through(&entry);
        self.send_acks(&entries, None, true).await
    }


    // ----------------------------- commit / rollback / recover ----------------------------------

    pub async fn commit(&self) -> MqResult<()> {
        self.do_commit(None).await
    }

    pub async fn commit_in(&self, ctx: &DeliveryContext) -> MqResult<()> {
        self.do_commit(Some(ctx)).await
    }

    #[instrument(name = "commit", skip_all, fields(session_id = self.id))]
    async fn do_commit(&self, ctx: Option<&DeliveryContext>) -> MqResult<()> {
        self.check_open(ctx)?;
        self.check_transacted("commit")?;
        let _guard = self.critical.enter(SyncOperation::Commit, ctx).await?;
        let mut tx_guard = self.transaction.lock().await;
        let tx = tx_guard.as_mut()
            .ok_or_else(|| MqError::illegal_state("session has no transaction"))?;
        if self.xa {
            return Err(MqError::illegal_state("commit is controlled by the transaction manager in a distributed transaction"));
        }

        let generation = self.connection_state.transport_generation();
        if self.failover_occurred.swap(false, Ordering::AcqRel) {
            lock(&self.inner).ledger.clear();
            tx.rollback(self.broker_session_id(), true).await?;
            return Err(MqError::TransactionRolledBack("the connection failed over during the transaction".to_string()));
        }

        let entries = lock(&self.inner).ledger.take_all();
        let require_reply = !self.config.no_block_until_txn_completes;
        let result = match self.handler.acknowledge(&entries, Some(tx.transaction_id()), require_reply).await {
            Ok(()) => tx.commit(self.broker_session_id()).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.failover_occurred.store(false, Ordering::Release);
                debug!(num_acks = entries.len(), transaction_id = tx.transaction_id(), "committed");
                Ok(())
            }
            Err(MqError::RemoteBrokerFailure(failure)) => {
                if !self.recover_from_remote_failure(&failure).await? {
                    return Err(MqError::RemoteBrokerFailure(failure));
                }
                // the broker rolled back already
                tx.rollback(self.broker_session_id(), true).await?;
                Err(MqError::TransactionRolledBack(format!("remote broker failure on {:?}, consumers were re-registered", failure.verb)))
            }
            Err(e) if e.is_network_failure() => {
                if self.connection_state.check_reconnecting().await.is_err()
                    || self.connection_state.is_broken() || self.connection_state.is_close_called()
                    || self.connection_state.transport_generation() == generation
                {
                    return Err(e);
                }
                self.failover_occurred.store(false, Ordering::Release);
                lock(&self.inner).ledger.clear();
                tx.rollback(self.broker_session_id(), true).await?;
                Err(MqError::TransactionRolledBack(format!("connection failed over during commit: {}", e)))
            }
            Err(e) if e.kind() == ErrorKind::TransactionRolledBack => {
                tx.rollback(self.broker_session_id(), true).await?;
                Err(e)
            }
            Err(e) if matches!(e.kind(), ErrorKind::PrepareFailed | ErrorKind::InvalidTransactionId) => {
                if let Err(rollback_error) = tx.rollback(self.broker_session_id(), false).await {
                    warn!("rollback after failed commit: {}", rollback_error);
                }
                Err(MqError::TransactionRolledBack(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn rollback(&self) -> MqResult<()> {
        self.do_rollback(None).await
    }

    pub async fn rollback_in(&self, ctx: &DeliveryContext) -> MqResult<()> {
        self.do_rollback(Some(ctx)).await
    }

    #[instrument(name = "rollback", skip_all, fields(session_id = self.id))]
    async fn do_rollback(&self, ctx: Option<&DeliveryContext>) -> MqResult<()> {
        self.check_open(ctx)?;
        self.check_transacted("rollback")?;
        let _guard = self.critical.enter(SyncOperation::Rollback, ctx).await?;
        let mut tx_guard = self.transaction.lock().await;
        let tx = tx_guard.as_mut()
            .ok_or_else(|| MqError::illegal_state("session has no transaction"))?;
        if self.xa {
            return Err(MqError::illegal_state("rollback is controlled by the transaction manager in a distributed transaction"));
        }

        let failover_occurred = self.failover_occurred.swap(false, Ordering::AcqRel);
        let remote_failure = lock(&self.remote_failure).take();
        if let Some(failure) = remote_failure {
            // the broker rolled back when it reported the failure
            self.recover_from_remote_failure(&failure).await?;
            lock(&self.inner).ledger.clear();
            return tx.rollback(self.broker_session_id(), true).await;
        }

        self.stop_delivery(ctx).await?;
        let result = async {
            let (staged, unacked) = self.take_for_redelivery();
            self.handler.redeliver(&staged, false, None).await?;
            tx.rollback(self.broker_session_id(), failover_occurred).await?;
            self.handler.redeliver(&unacked, true, None).await
        }.await;
        let resumed = self.resume_delivery().await;
        result.and(resumed)
    }

    /// Redelivers all unacknowledged messages. Not available for transacted and no-ack sessions.
    pub async fn recover(&self) -> MqResult<()> {
        self.do_recover(None).await
    }

    pub async fn recover_in(&self, ctx: &DeliveryContext) -> MqResult<()> {
        self.do_recover(Some(ctx)).await
    }

    #[instrument(name = "recover", skip_all, fields(session_id = self.id))]
    async fn do_recover(&self, ctx: Option<&DeliveryContext>) -> MqResult<()> {
        self.check_open(ctx)?;
        if matches!(self.ack_mode, AckMode::Transacted | AckMode::NoAck) {
            return Err(MqError::illegal_state(format!("recover is not allowed in {:?} mode", self.ack_mode)));
        }
        let _guard = self.critical.enter(SyncOperation::Recover, ctx).await?;

        self.stop_delivery(ctx).await?;
        let result = async {
            let (staged, unacked) = self.take_for_redelivery();
            self.handler.redeliver(&staged, false, None).await?;
            self.handler.redeliver(&unacked, true, None).await
        }.await;
        let resumed = self.resume_delivery().await;
        result.and(resumed)
    }

    /// Staged messages and the ledger, as entries for the two REDELIVER requests
    fn take_for_redelivery(&self) -> (Vec<AckEntry>, Vec<AckEntry>) {
        let mut inner = lock(&self.inner);
        let staged = inner.staged.drain(..)
            .filter_map(|p| p.message_id.map(|m| AckEntry::new(p.correlation_id, m)))
            .collect::<Vec<_>>();
        let unacked = inner.ledger.take_all();
        debug!(session_id = self.id, staged = staged.len(), unacked = unacked.len(), "requesting redelivery");
        (staged, unacked)
    }

    /// Pauses delivery for this session. Unless called from within the session's own delivery,
    ///  this waits for deliveries in progress to finish.
    async fn stop_delivery(&self, ctx: Option<&DeliveryContext>) -> MqResult<()> {
        self.stopped.store(true, Ordering::Release);
        if !self.connection_state.is_stopped() {
            self.handler.stop(Some(self.broker_session_id())).await?;
        }
        if !self.is_own_delivery(ctx) {
            self.wait_for_drain().await;
        }
        Ok(())
    }

    async fn resume_delivery(&self) -> MqResult<()> {
        self.stopped.store(false, Ordering::Release);
        self.message_arrived.notify_waiters();
        if self.connection_state.is_stopped() {
            return Ok(());
        }
        self.handler.start(Some(self.broker_session_id())).await
    }


    // ------------------------------------------- XA ---------------------------------------------

    fn check_xa(&self) -> MqResult<()> {
        if !self.xa {
            return Err(MqError::illegal_state("not a distributed transaction session"));
        }
        Ok(())
    }


    async fn flush_ledger_in_transaction(&self, transaction_id: i64) -> MqResult<()> {
        let entries = lock(&self.inner).ledger.take_all();
        self.handler.acknowledge(&entries, Some(transaction_id), true).await
    }

    pub async fn xa_start(&self, xid: &Xid, flags: i32) -> MqResult<()> {
        self.check_open(None)?;
        self.check_xa()?;
        let mut tx_guard = self.transaction.lock().await;
        let tx = tx_guard.as_mut()
            .ok_or_else(|| MqError::illegal_state("session has no transaction"))?;
        let result = tx.start_xa(self.broker_session_id(), xid, flags).await;
        self.note_remote_failure(&result);
        result
    }

    /// Ends the work on a branch. Messages consumed in the branch are acknowledged as part of it
    ///  first.
    pub async fn xa_end(&self, xid: &Xid, flags: i32) -> MqResult<()> {
        self.check_xa()?;
        let mut tx_guard = self.transaction.lock().await;
        let tx = tx_guard.as_mut()
            .ok_or_else(|| MqError::illegal_state("session has no transaction"))?;

        let mut result = Ok(());
        if tx.current_xid() == Some(xid) {
            result = self.flush_ledger_in_transaction(tx.transaction_id()).await;
        }
        if result.is_ok() {
            result = tx.end_xa(xid, flags).await;
        }
        self.note_remote_failure(&result);
        result
    }

    pub async fn xa_prepare(&self, xid: &Xid) -> MqResult<()> {
        self.check_xa()?;
        let mut tx_guard = self.transaction.lock().await;
        let tx = tx_guard.as_mut()
            .ok_or_else(|| MqError::illegal_state("session has no transaction"))?;
        let result = tx.prepare_xa(xid).await;
        self.note_remote_failure(&result);
        result
    }

    pub async fn xa_commit(&self, xid: &Xid, one_phase: bool) -> MqResult<()> {
        self.check_xa()?;
        let mut tx_guard = self.transaction.lock().await;
        let tx = tx_guard.as_mut()
            .ok_or_else(|| MqError::illegal_state("session has no transaction"))?;
        let result = tx.commit_xa(xid, one_phase).await;
        self.note_remote_failure(&result);
        result
    }

    /// Rolls back a branch. If a remote broker failure was reported during the branch, the
    ///  affected consumers are re-registered afterwards.
    pub async fn xa_rollback(&self, xid: &Xid) -> MqResult<()> {
        self.check_xa()?;
        let mut tx_guard = self.transaction.lock().await;
        let tx = tx_guard.as_mut()
            .ok_or_else(|| MqError::illegal_state("session has no transaction"))?;
        let result = tx.rollback_xa(xid).await;

        let remote_failure = lock(&self.remote_failure).take();
        if let Some(failure) = remote_failure {
            self.recover_from_remote_failure(&failure).await?;
        }
        result
    }

    pub async fn xa_recover(&self, flags: i32) -> MqResult<Vec<Xid>> {
        self.check_xa()?;
        let tx_guard = self.transaction.lock().await;
        let tx = tx_guard.as_ref()
            .ok_or_else(|| MqError::illegal_state("session has no transaction"))?;
        tx.recover_xa(flags).await
    }


    // ------------------------------------------ close -------------------------------------------

    /// Closes the session with its consumers and producers. Closing a closed session does nothing.
    pub async fn close(&self) -> MqResult<()> {
        self.do_close().await
    }

    /// A session can not be closed from within its own message listener, since the close waits
    ///  for that listener to return
    pub async fn close_in(&self, ctx: &DeliveryContext) -> MqResult<()> {
        if self.is_own_delivery(Some(ctx)) {
            return Err(MqError::illegal_state("a session can not be closed from its own message listener"));
        }
        self.do_close().await
    }

    #[instrument(name = "close_session", skip_all, fields(session_id = self.id))]
    async fn do_close(&self) -> MqResult<()> {
        {
            let _inner = lock(&self.inner);
            if self.is_closed() || self.closing.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
        }
        self.message_arrived.notify_waiters();

        let _guard = self.critical.enter_when_free(SyncOperation::SessionClosing).await;
        self.wait_for_drain().await;

        let result = self.release_resources().await;

        self.closed.store(true, Ordering::Release);
        let tasks = std::mem::take(&mut lock(&self.inner).tasks);
        for task in tasks {
            task.abort();
        }
        self.message_arrived.notify_waiters();

        if let Some(connection) = self.connection.upgrade() {
            connection.remove_session(self.id);
        }
        debug!("session closed");
        result
    }

    async fn release_resources(&self) -> MqResult<()> {
        let unusable = self.connection_state.is_unusable();
        if self.ack_mode == AckMode::DupsOk && !unusable {
            if let Err(e) = self.flush_dups_ok(true).await {
                warn!("flushing dups-ok acknowledgements on close failed: {}", e);
            }
        }
        let (consumers, producers) = {
            let mut inner = lock(&self.inner);
            inner.staged.clear();
            inner.listeners.clear();
            inner.by_broker_id.clear();
            let consumers = inner.consumers.drain().map(|(_, c)| c).collect::<Vec<_>>();
            let producers = inner.producers.drain().map(|(_, p)| p).collect::<Vec<_>>();
            (consumers, producers)
        };

        if !unusable {
            for consumer in consumers {
                if let Err(e) = self.handler.delete_consumer(consumer.broker_id, consumer.last_delivered).await {
                    warn!(consumer_id = ?consumer.id, "closing consumer failed: {}", e);
                }
            }
            for producer in producers {
                if let Err(e) = self.handler.delete_producer(producer.info.producer_id).await {
                    warn!(producer_id = producer.info.producer_id, "closing producer failed: {}", e);
                }
            }
        }

        if let Some(tx) = self.transaction.lock().await.as_mut() {
            if tx.current_xid().is_some() {
                // the transaction manager completes the branch
                if let Err(e) = self.flush_ledger_in_transaction(tx.transaction_id()).await {
                    warn!("acknowledging messages of the distributed transaction failed: {}", e);
                }
            }
            else if !unusable {
                if let Err(e) = tx.release_broker_resource().await {
                    warn!("releasing the broker side transaction failed: {}", e);
                }
            }
        }
        lock(&self.inner).ledger.clear();

        if unusable {
            debug!("connection is not usable, not destroying broker side session");
            return Ok(());
        }
        self.handler.destroy_session(self.broker_session_id()).await
    }


    // ---------------------------------------- failover ------------------------------------------

    /// Forgets what the broker forgets when the connection breaks: staged messages and the ledger.
    ///  A transaction in progress is lost.
    pub(crate) fn reset(&self) {
        let (staged, unacked) = {
            let mut inner = lock(&self.inner);
            let staged = inner.staged.len();
            let unacked = inner.ledger.len();
            inner.staged.clear();
            inner.ledger.clear();
            for consumer in inner.consumers.values_mut() {
                consumer.delivered_since_resume = 0;
            }
            (staged, unacked)
        };
        *lock(&self.remote_failure) = None;
        if self.ack_mode == AckMode::Transacted {
            self.failover_occurred.store(true, Ordering::Release);
        }
        debug!(session_id = self.id, staged, unacked, "session reset for reconnect");
    }

    /// Re-establishes the broker side of the session on a new transport: the session itself, a
    ///  new local transaction, all open consumers and all producers
    pub(crate) async fn recreate(&self) -> MqResult<()> {
        if self.is_closed() || self.closing.load(Ordering::Acquire) {
            return Ok(());
        }

        let broker_id = self.handler.create_session(self.ack_mode).await?;
        self.broker_id.store(broker_id, Ordering::Release);

        // a commit in progress holds the transaction and takes care of it itself
        if let Ok(mut tx_guard) = self.transaction.try_lock() {
            if let Some(tx) = tx_guard.as_mut() {
                if !self.xa {
                    tx.restart_after_failover(broker_id).await?;
                }
            }
        }

        let consumers = self.consumer_ids();
        self.recreate_consumers(&consumers, false).await?;
        self.recreate_producers().await?;
        info!(session_id = self.id, broker_session_id = broker_id, consumers = consumers.len(), "session recreated");
        Ok(())
    }
}


/// Hands staged messages to message listeners - the session's 'own delivery'
async fn run_delivery(session: Arc<Session>) {
    loop {
        let mut arrived = pin!(session.message_arrived.notified());
        arrived.as_mut().enable();

        if session.is_closed() {
            return;
        }
        if session.deliver_next_to_listener().await {
            continue;
        }
        arrived.await;
    }
}

const MIN_DUPS_OK_FLUSH_PERIOD: Duration = Duration::from_millis(1);

/// Flushes dups-ok acknowledgements that are older than the timeout when no further delivery
///  triggers the flush
async fn run_dups_ok_flusher(session: Weak<Session>, timeout: Duration) {
    let mut interval = time::interval((timeout / 2).max(MIN_DUPS_OK_FLUSH_PERIOD));
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        interval.tick().await;
        let Some(session) = session.upgrade() else {
            return;
        };
        if session.is_closed() {
            return;
        }
        if let Err(e) = session.flush_dups_ok(false).await {
            debug!(session_id = session.id, "flushing dups-ok acknowledgements failed: {}", e);
        }
    }
}
