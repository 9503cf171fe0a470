use std::time::Duration;

use tokio::time::Instant;

use crate::connection::config::ClientConfig;
use crate::protocol::packet::Packet;


#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AckMode {
    /// acknowledged as part of the session's transaction
    Transacted,
    /// acknowledged as soon as the message was handed to the application
    Auto,
    /// acknowledged explicitly by the application
    Client,
    /// acknowledged lazily in batches, accepting duplicates after a failure
    DupsOk,
    /// never acknowledged; the broker forgets a message once it was sent
    NoAck,
}

impl AckMode {
    pub fn wire_value(&self) -> i32 {
        match self {
            AckMode::Transacted => 0,
            AckMode::Auto => 1,
            AckMode::Client => 2,
            AckMode::DupsOk => 3,
            AckMode::NoAck => 32768,
        }
    }

    /// modes that keep delivered messages in the unacknowledged ledger
    pub fn uses_ledger(&self) -> bool {
        matches!(self, AckMode::Transacted | AckMode::Client | AckMode::DupsOk)
    }
}

/// An auto acknowledgement waits for the broker's reply unless losing the ack cannot cause
///  redelivery anyway: a non-persistent message on a topic, for a non-durable subscriber (or
///  for any subscriber if configured so).
pub fn auto_ack_requires_reply(message: &Packet, consumer_is_durable: bool, config: &ClientConfig) -> bool {
    let np_topic = !message.persistent && message.is_topic;
    if np_topic && (!consumer_is_durable || config.no_block_on_auto_ack_np_topics) {
        return false;
    }
    true
}


#[derive(Clone, Debug)]
pub struct DupsOkPolicy {
    pub limit: usize,
    pub timeout: Option<Duration>,
    pub flush_on_empty_queue: bool,
}

impl DupsOkPolicy {
    pub fn from_config(config: &ClientConfig) -> DupsOkPolicy {
        DupsOkPolicy {
            limit: config.dups_ok_limit,
            timeout: config.dups_ok_timeout,
            flush_on_empty_queue: config.dups_ok_flush_on_empty_queue,
        }
    }

    /// Decides if the pending acknowledgements should be sent now. The limit always triggers a
    ///  flush; the timeout (measured from the oldest pending entry) or an empty session queue
    ///  trigger it early if configured.
    pub fn should_flush(&self, pending: usize, oldest_pending_since: Option<Instant>, session_queue_empty: bool) -> bool {
        if pending == 0 {
            return false;
        }
        if pending >= self.limit {
            return true;
        }
        if let (Some(timeout), Some(since)) = (self.timeout, oldest_pending_since) {
            if since.elapsed() >= timeout {
                return true;
            }
        }
        self.flush_on_empty_queue && session_queue_empty
    }
}
