use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use crate::error::{MqError, MqResult};
use crate::util::sync::lock;


/// The operations that must not overlap within a session
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyncOperation {
    Commit,
    Rollback,
    Recover,
    SessionClosing,
    ConsumerClosing,
}

impl SyncOperation {
    fn is_closing(&self) -> bool {
        matches!(self, SyncOperation::SessionClosing | SyncOperation::ConsumerClosing)
    }
}

/// Proof that code runs inside a message listener invoked by a session's delivery. It is handed
///  to the listener, which passes it back into session operations it calls. Only the session's
///  delivery creates it.
#[derive(Debug)]
pub struct DeliveryContext {
    session_id: u64,
}

impl DeliveryContext {
    pub(crate) fn new(session_id: u64) -> DeliveryContext {
        DeliveryContext { session_id }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }
}


/// Mutual exclusion for commit / rollback / recover / close of one session.
///
/// A conflicting operation fails with `IllegalState` rather than waiting, with two exceptions:
///  * The session's own delivery may proceed while a close is in progress - the close waits
///    for that delivery to finish, so blocking it would deadlock.
///  * While a consumer is being closed, other operations wait (up to `consumer_close_wait`)
///    for the close to finish.
#[derive(Debug)]
pub struct CriticalSection {
    session_id: u64,
    holder: Mutex<Option<SyncOperation>>,
    released: Notify,
    consumer_close_wait: Option<Duration>,
}

/// Holds the critical section; it is released when the guard is dropped. A guard obtained by
///  bypassing a close does not own the critical section and releases nothing.
#[must_use]
#[derive(Debug)]
pub struct SyncGuard<'a> {
    section: &'a CriticalSection,
    owned: bool,
}

impl SyncGuard<'_> {
    pub fn is_bypass(&self) -> bool {
        !self.owned
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        if self.owned {
            *lock(&self.section.holder) = None;
            self.section.released.notify_waiters();
        }
    }
}

impl CriticalSection {
    pub fn new(session_id: u64, consumer_close_wait: Option<Duration>) -> CriticalSection {
        CriticalSection {
            session_id,
            holder: Mutex::new(None),
            released: Notify::new(),
            consumer_close_wait,
        }
    }

    pub fn current(&self) -> Option<SyncOperation> {
        *lock(&self.holder)
    }

    fn is_own_delivery(&self, ctx: Option<&DeliveryContext>) -> bool {
        ctx.map(|c| c.session_id == self.session_id)
            .unwrap_or(false)
    }

    pub async fn enter(&self, op: SyncOperation, ctx: Option<&DeliveryContext>) -> MqResult<SyncGuard<'_>> {
        let deadline = self.consumer_close_wait.map(|d| Instant::now() + d);

        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut holder = lock(&self.holder);
                match *holder {
                    None => {
                        trace!(session_id = self.session_id, ?op, "entering critical section");
                        *holder = Some(op);
                        return Ok(SyncGuard { section: self, owned: true });
                    }
                    Some(current) if current.is_closing() && self.is_own_delivery(ctx) => {
                        debug!(session_id = self.session_id, ?op, ?current, "delivery bypasses critical section during close");
                        return Ok(SyncGuard { section: self, owned: false });
                    }
                    Some(SyncOperation::ConsumerClosing) => {
                        trace!(session_id = self.session_id, ?op, "waiting for consumer close");
                    }
                    Some(current) => {
                        return Err(MqError::illegal_state(format!("{:?} conflicts with {:?} in progress", op, current)));
                    }
                }
            }

            match deadline {
                None => released.await,
                Some(deadline) => {
                    if time::timeout_at(deadline, released).await.is_err() {
                        return Err(MqError::illegal_state(format!("{:?}: consumer close did not finish in time", op)));
                    }
                }
            }
        }
    }

    /// Waits until the critical section is free and takes it, without failing on conflict.
    ///  This is how closing waits for a running commit or rollback to finish.
    pub async fn enter_when_free(&self, op: SyncOperation) -> SyncGuard<'_> {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut holder = lock(&self.holder);
                if holder.is_none() {
                    *holder = Some(op);
                    return SyncGuard { section: self, owned: true };
                }
            }
            released.await;
        }
    }
}
