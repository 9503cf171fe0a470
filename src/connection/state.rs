use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use crate::error::{MqError, MqResult};


tokio::task_local! {
    static GATE_BYPASS: ();
}

/// Runs `f` with permission to pass the reconnect gate. This is granted to the reconnect task
///  itself and to inbound dispatch - both would deadlock if they had to wait for the reconnect
///  to finish.
pub async fn with_gate_bypass<F: Future>(f: F) -> F::Output {
    GATE_BYPASS.scope((), f).await
}

pub fn has_gate_bypass() -> bool {
    GATE_BYPASS.try_with(|_| ()).is_ok()
}


/// Connection level lifecycle flags, shared by the connection, its sessions and the protocol
///  handler.
///
/// `closed` is terminal: once set, it is never cleared. `broken` means the transport is gone
///  and no reconnect is attempted (any more). `reconnecting` means failover is in progress;
///  outgoing requests wait at the reconnect gate until it is cleared.
#[derive(Debug)]
pub struct ConnectionState {
    closed: AtomicBool,
    close_called: AtomicBool,
    broken: AtomicBool,
    stopped: AtomicBool,
    reconnecting: AtomicBool,

    /// incremented for every new transport, so that a break reported by the receive loop of a
    ///  replaced transport can be recognized as stale
    transport_generation: AtomicU64,

    gate: Notify,
    gate_recheck_interval: Duration,
    /// `None` waits at the gate for as long as the reconnect takes
    gate_max_wait: Option<Duration>,
}

impl ConnectionState {
    pub fn new(gate_recheck_interval: Duration) -> ConnectionState {
        ConnectionState {
            closed: AtomicBool::new(false),
            close_called: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            stopped: AtomicBool::new(true),
            reconnecting: AtomicBool::new(false),
            transport_generation: AtomicU64::new(0),
            gate: Notify::new(),
            gate_recheck_interval,
            gate_max_wait: None,
        }
    }

    pub fn with_gate_max_wait(mut self, gate_max_wait: Option<Duration>) -> ConnectionState {
        self.gate_max_wait = gate_max_wait;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.gate.notify_waiters();
    }

    pub fn is_close_called(&self) -> bool {
        self.close_called.load(Ordering::Acquire)
    }
    pub fn set_close_called(&self) {
        self.close_called.store(true, Ordering::Release);
        self.gate.notify_waiters();
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }
    pub fn set_broken(&self) {
        debug!("connection marked broken");
        self.broken.store(true, Ordering::Release);
        self.gate.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
    pub fn set_stopped(&self, stopped: bool) {
        self.stopped.store(stopped, Ordering::Release);
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    pub fn set_reconnecting(&self, reconnecting: bool) {
        trace!(reconnecting, "setting reconnecting flag");
        self.reconnecting.store(reconnecting, Ordering::Release);
        self.gate.notify_waiters();
    }

    /// Sets `reconnecting` unless the connection is broken or being closed. Returns `false` if
    ///  the flag was not set, including the case that a reconnect is already in progress.
    pub fn check_and_set_reconnecting(&self) -> bool {
        if self.is_broken() || self.is_close_called() {
            return false;
        }
        self.reconnecting.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Broken, closing or reconnecting - i.e. the broker should not be expected to answer
    pub fn is_unusable(&self) -> bool {
        self.is_broken() || self.is_closed() || self.is_reconnecting()
    }

    pub fn transport_generation(&self) -> u64 {
        self.transport_generation.load(Ordering::Acquire)
    }
    pub fn next_transport_generation(&self) -> u64 {
        self.transport_generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The reconnect gate: waits while a reconnect is in progress, waking up periodically to
    ///  re-check even without a notification. Returns when reconnecting is over, or when the
    ///  connection is broken or being closed (the caller's subsequent send fails then).
    pub async fn check_reconnecting(&self) -> MqResult<()> {
        if has_gate_bypass() {
            return Ok(());
        }

        let deadline = self.gate_max_wait.map(|max| Instant::now() + max);
        loop {
            let notified = self.gate.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_reconnecting() || self.is_broken() || self.is_close_called() {
                return Ok(());
            }

            let slice = match deadline {
                None => self.gate_recheck_interval,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        debug!("reconnect did not finish in time, giving up at the gate");
                        return Err(MqError::ConnectionBroken("reconnect did not finish in time".to_string()));
                    }
                    left.min(self.gate_recheck_interval)
                }
            };
            trace!("waiting for reconnect to finish");
            let _ = time::timeout(slice, notified).await;
        }
    }
}
