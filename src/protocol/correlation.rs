use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::protocol::packet::{Packet, PacketType};
use crate::util::sync::lock;


/// Reserved; never handed out as a correlation id
pub const MIN_ACK_ID: u64 = 0;

/// Source of correlation ids. Ids increase monotonically and wrap back to `MIN_ACK_ID + 1`
///  before reaching the wrap point. The wrap point is configurable so that tests can exercise
///  wraparound without issuing 2^64 requests.
#[derive(Debug)]
pub struct AckIdGenerator {
    last: AtomicU64,
    wrap_at: u64,
}

impl Default for AckIdGenerator {
    fn default() -> Self {
        AckIdGenerator::new()
    }
}

impl AckIdGenerator {
    pub fn new() -> AckIdGenerator {
        AckIdGenerator::with_wrap_at(u64::MAX)
    }

    pub fn with_wrap_at(wrap_at: u64) -> AckIdGenerator {
        AckIdGenerator::starting_after(MIN_ACK_ID, wrap_at)
    }

    /// the first id returned is `last + 1` (or `MIN_ACK_ID + 1` if that hits the wrap point)
    pub fn starting_after(last: u64, wrap_at: u64) -> AckIdGenerator {
        assert!(wrap_at > MIN_ACK_ID + 1);
        AckIdGenerator {
            last: AtomicU64::new(last),
            wrap_at,
        }
    }

    pub fn next_id(&self) -> u64 {
        let prev = self.last.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| Some(self.successor(cur)))
            .unwrap_or_else(|cur| cur);
        self.successor(prev)
    }

    fn successor(&self, cur: u64) -> u64 {
        match cur.checked_add(1) {
            Some(n) if n < self.wrap_at => n,
            _ => MIN_ACK_ID + 1,
        }
    }
}


#[derive(Debug)]
struct PendingRequest {
    verb: PacketType,
    reply_sender: mpsc::Sender<Packet>,
}

/// The receiving end of a registered request. Up to two replies can be delivered.
pub type ReplyReceiver = mpsc::Receiver<Packet>;

/// Maps correlation ids of requests in flight to the slot their reply is delivered to.
///
/// The table is only ever locked for short synchronous sections; waiting for a reply happens
///  on the [ReplyReceiver] outside the lock.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: Mutex<FxHashMap<u64, PendingRequest>>,
}

impl CorrelationTable {
    pub fn new() -> CorrelationTable {
        Default::default()
    }

    /// Allocates a correlation id that is not currently outstanding and registers a pending
    ///  request for it. After a wraparound, ids that are still in use are skipped - the number
    ///  of outstanding requests is bounded by the number of concurrent callers, so this
    ///  terminates.
    pub fn register(&self, ids: &AckIdGenerator, verb: PacketType) -> (u64, ReplyReceiver) {
        let (reply_sender, receiver) = mpsc::channel(2);
        let mut pending = lock(&self.pending);
        loop {
            let id = ids.next_id();
            match pending.entry(id) {
                Entry::Occupied(_) => {
                    debug!(ack_id = id, "correlation id still outstanding after wraparound, skipping");
                }
                Entry::Vacant(e) => {
                    trace!(ack_id = id, ?verb, "registering pending request");
                    e.insert(PendingRequest { verb, reply_sender });
                    return (id, receiver);
                }
            }
        }
    }

    /// Routes a reply to the request waiting for it. Replies for ids that are not (or no longer)
    ///  registered are dropped silently - the caller gave up waiting, e.g. after a timeout.
    pub fn deliver(&self, correlation_id: u64, packet: Packet) -> bool {
        let pending = lock(&self.pending);
        match pending.get(&correlation_id) {
            Some(p) => {
                trace!(ack_id = correlation_id, verb = ?p.verb, reply = ?packet.packet_type, "delivering reply");
                if p.reply_sender.try_send(packet).is_err() {
                    debug!(ack_id = correlation_id, "reply slot full or abandoned - dropping reply");
                    return false;
                }
                true
            }
            None => {
                debug!(ack_id = correlation_id, reply = ?packet.packet_type, "no pending request for reply - dropping");
                false
            }
        }
    }

    pub fn remove(&self, correlation_id: u64) {
        lock(&self.pending).remove(&correlation_id);
    }

    /// Drops all pending requests, waking every waiter: their receivers see a closed channel.
    ///  This is how a connection break interrupts callers blocked on a reply.
    pub fn abort_all(&self) -> usize {
        let mut pending = lock(&self.pending);
        let num = pending.len();
        if num > 0 {
            debug!("aborting {} pending requests", num);
        }
        pending.clear();
        num
    }

    pub fn contains(&self, correlation_id: u64) -> bool {
        lock(&self.pending).contains_key(&correlation_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
