use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};


#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecoverState {
    Inactive,
    Started,
    InProcess,
    TransportConnected,
    Succeeded,
    Failed,
    /// terminal: the coordinator gave up, or the connection was closed
    Aborted,
}

impl RecoverState {
    fn is_idle(&self) -> bool {
        matches!(self, RecoverState::Inactive | RecoverState::Aborted)
    }
}


/// Bookkeeping for failover: the current recovery phase as a watchable value, and the number of
///  consecutive failed recoveries. Running the recovery is up to the connection.
#[derive(Debug)]
pub struct ReconnectCoordinator {
    state: watch::Sender<RecoverState>,
    failed_recoveries: AtomicU32,
    /// -1 for no limit
    max_retries: i32,
}

impl ReconnectCoordinator {
    pub fn new(max_retries: i32) -> ReconnectCoordinator {
        let (state, _) = watch::channel(RecoverState::Inactive);
        ReconnectCoordinator {
            state,
            failed_recoveries: AtomicU32::new(0),
            max_retries,
        }
    }

    pub fn state(&self) -> RecoverState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RecoverState> {
        self.state.subscribe()
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == RecoverState::Aborted
    }

    /// Returns `false` without changing anything once the coordinator is aborted
    pub fn set_state(&self, new_state: RecoverState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == RecoverState::Aborted || *state == new_state {
                return false;
            }
            debug!(from = ?*state, to = ?new_state, "recover state");
            *state = new_state;
            true
        });
        self.state() == new_state
    }

    /// Starts a recovery; `false` if one is running already or the coordinator is aborted
    pub fn begin(&self) -> bool {
        self.state.send_if_modified(|state| {
            if !matches!(*state, RecoverState::Inactive | RecoverState::Failed) {
                return false;
            }
            *state = RecoverState::Started;
            true
        })
    }

    pub fn succeeded(&self) {
        self.failed_recoveries.store(0, Ordering::Release);
        self.set_state(RecoverState::Succeeded);
        self.set_state(RecoverState::Inactive);
    }

    /// Counts a failed recovery. Returns `true` if another recovery may be tried; `false` if the
    ///  limit is exceeded, which aborts the coordinator for good.
    pub fn failed(&self) -> bool {
        let failures = self.failed_recoveries.fetch_add(1, Ordering::AcqRel) + 1;
        if self.max_retries >= 0 && failures > self.max_retries as u32 {
            warn!(failures, "giving up on reconnect");
            self.abort();
            return false;
        }
        self.set_state(RecoverState::Failed);
        true
    }

    pub fn failed_recoveries(&self) -> u32 {
        self.failed_recoveries.load(Ordering::Acquire)
    }

    pub fn abort(&self) {
        if self.set_state(RecoverState::Aborted) {
            info!("reconnect coordinator aborted");
        }
    }

    /// Waits until no recovery is running, re-checking at `slice` intervals at most `max_slices`
    ///  times. Returns `false` if a recovery is still running then.
    pub async fn wait_until_inactive(&self, slice: Duration, max_slices: u32) -> bool {
        let mut receiver = self.subscribe();
        for _ in 0..max_slices {
            if receiver.borrow_and_update().is_idle() {
                return true;
            }
            let _ = time::timeout(slice, receiver.changed()).await;
        }
        let idle = receiver.borrow().is_idle();
        idle
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;
    use super::*;

    #[test]
    fn test_recovery_cycle() {
        let coordinator = ReconnectCoordinator::new(3);
        assert!(coordinator.begin());
        assert!(!coordinator.begin());
        assert!(coordinator.set_state(RecoverState::InProcess));
        assert!(coordinator.set_state(RecoverState::TransportConnected));

        coordinator.succeeded();
        assert_eq!(coordinator.state(), RecoverState::Inactive);
        assert!(coordinator.begin());
    }

    #[rstest]
    #[case::limited(2, 3)]
    #[case::no_retries(0, 1)]
    fn test_max_retries(#[case] max_retries: i32, #[case] failures_until_abort: u32) {
        let coordinator = ReconnectCoordinator::new(max_retries);
        coordinator.begin();
        for _ in 1..failures_until_abort {
            assert!(coordinator.failed());
            assert_eq!(coordinator.state(), RecoverState::Failed);
            assert!(coordinator.begin());
        }
        assert!(!coordinator.failed());
        assert!(coordinator.is_aborted());
    }

    #[test]
    fn test_unlimited_retries() {
        let coordinator = ReconnectCoordinator::new(-1);
        for _ in 0..1000 {
            assert!(coordinator.failed());
        }
    }

    #[test]
    fn test_success_resets_failure_count() {
        let coordinator = ReconnectCoordinator::new(1);
        coordinator.begin();
        assert!(coordinator.failed());
        coordinator.begin();
        coordinator.succeeded();
        assert_eq!(coordinator.failed_recoveries(), 0);
        coordinator.begin();
        assert!(coordinator.failed());
    }

    #[test]
    fn test_aborted_is_sticky() {
        let coordinator = ReconnectCoordinator::new(-1);
        coordinator.abort();
        assert!(!coordinator.begin());
        assert!(!coordinator.set_state(RecoverState::Inactive));
        assert_eq!(coordinator.state(), RecoverState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_inactive() {
        let coordinator = Arc::new(ReconnectCoordinator::new(-1));
        assert!(coordinator.wait_until_inactive(Duration::from_secs(1), 1).await);

        coordinator.begin();
        assert!(!coordinator.wait_until_inactive(Duration::from_secs(1), 3).await);

        let c2 = coordinator.clone();
        let waiter = tokio::spawn(async move {
            c2.wait_until_inactive(Duration::from_secs(1), 100).await
        });
        time::sleep(Duration::from_secs(5)).await;
        coordinator.succeeded();
        assert!(waiter.await.unwrap());
    }
}
