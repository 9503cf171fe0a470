use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::connection::state::ConnectionState;
use crate::error::{ErrorKind, MqError, MqResult};
use crate::protocol::body::Xid;
use crate::protocol::protocol_handler::{ProtocolHandler, TransactionState, VerifiedState};

/// XA flags as passed through to the broker
pub mod xa_flags {
    pub const TMNOFLAGS: i32 = 0;
    pub const TMJOIN: i32 = 0x0020_0000;
    pub const TMRESUME: i32 = 0x0800_0000;
    pub const TMSUCCESS: i32 = 0x0400_0000;
    pub const TMFAIL: i32 = 0x2000_0000;
    pub const TMSUSPEND: i32 = 0x0200_0000;
    pub const TMSTARTRSCAN: i32 = 0x0100_0000;
    pub const TMENDRSCAN: i32 = 0x0080_0000;
}


/// The transaction of a transacted session. A local transaction always exists while the
///  session is open: committing or rolling back one starts the next.
///
/// For a distributed (XA) session, the current branch is identified by an externally supplied
///  xid; the broker's transaction id is only used while that branch is current.
pub struct Transaction {
    handler: Arc<ProtocolHandler>,
    connection_state: Arc<ConnectionState>,
    auto_start: bool,

    transaction_id: i64,
    state: TransactionState,
    /// transaction id the broker pre-started with the previous commit
    next_transaction_id: Option<i64>,
    /// the transaction was started on a new connection after failover and has seen no work yet
    restarted_after_failover: bool,

    xid: Option<Xid>,
}

impl Transaction {
    pub fn new(handler: Arc<ProtocolHandler>, connection_state: Arc<ConnectionState>, auto_start: bool) -> Transaction {
        Transaction {
            handler,
            connection_state,
            auto_start,
            transaction_id: 0,
            state: TransactionState::RolledBack,
            next_transaction_id: None,
            restarted_after_failover: false,
            xid: None,
        }
    }

    pub fn transaction_id(&self) -> i64 {
        self.transaction_id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.state == TransactionState::Started && self.transaction_id != 0
    }

    /// Starts a new local transaction, using an id the broker pre-started with the previous
    ///  commit if there is one
    pub async fn start_local(&mut self, session_id: i64) -> MqResult<()> {
        self.restarted_after_failover = false;
        if let Some(tid) = self.next_transaction_id.take() {
            debug!(transaction_id = tid, "using pre-started transaction");
            self.transaction_id = tid;
            self.state = TransactionState::Started;
            return Ok(());
        }

        loop {
            match self.handler.start_transaction(session_id, None, xa_flags::TMNOFLAGS).await {
                Ok(tid) => {
                    debug!(transaction_id = tid, session_id, "started transaction");
                    self.transaction_id = tid;
                    self.state = TransactionState::Started;
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::TransactionIdInUse => {
                    debug!("transaction id in use, starting transaction again");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Commits the current local transaction and starts the next one. On an HA connection,
    ///  the commit is done in two phases; if it is interrupted by a failover, the broker is asked
    ///  for the outcome after reconnecting.
    pub async fn commit(&mut self, session_id: i64) -> MqResult<()> {
        let tid = self.transaction_id;
        if self.handler.use_two_phase_commit() {
            self.commit_two_phase(tid).await?;
        }
        else {
            self.next_transaction_id = self.handler.commit(tid, None, false, self.auto_start).await?;
        }
        self.state = TransactionState::Committed;

        self.start_next(session_id).await
    }

    async fn commit_two_phase(&mut self, tid: i64) -> MqResult<()> {
        let result = async {
            self.handler.end_transaction(tid, None, xa_flags::TMSUCCESS).await?;
            self.state = TransactionState::Ended;
            self.handler.prepare(tid, None).await?;
            self.state = TransactionState::Prepared;
            self.handler.commit(tid, None, false, false).await?;
            Ok::<_, MqError>(())
        }.await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_network_failure() => self.verify_after_failover(tid, e).await,
            Err(e) => Err(e),
        }
    }

    /// Decides the outcome of a commit that was interrupted by a connection failure
    async fn verify_after_failover(&mut self, tid: i64, cause: MqError) -> MqResult<()> {
        if self.connection_state.check_reconnecting().await.is_err()
            || self.connection_state.is_broken() || self.connection_state.is_close_called()
        {
            return Err(cause);
        }

        if self.state < TransactionState::Ended {
            return Err(rolled_back_by_failover(tid));
        }

        match self.handler.verify_transaction(tid, self.state, None).await? {
            VerifiedState::Committed => {
                info!(transaction_id = tid, "transaction verified as committed after failover");
                Ok(())
            }
            VerifiedState::Prepared => {
                info!(transaction_id = tid, "transaction prepared before failover - committing");
                match self.handler.commit(tid, None, false, false).await {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        warn!(transaction_id = tid, "commit of prepared transaction failed: {}", e);
                        if let Err(e) = self.handler.rollback(tid, false).await {
                            debug!("rollback after failed commit: {}", e);
                        }
                        Err(rolled_back_by_failover(tid))
                    }
                }
            }
            VerifiedState::RolledBack | VerifiedState::Unknown(_) => Err(rolled_back_by_failover(tid)),
        }
    }

    async fn start_next(&mut self, session_id: i64) -> MqResult<()> {
        match self.start_local(session_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_network_failure() && self.handler.is_ha_broker() => {
                // the commit itself succeeded; try once more after failover
                if self.connection_state.check_reconnecting().await.is_err()
                    || self.connection_state.is_broken() || self.connection_state.is_close_called()
                {
                    return Err(e);
                }
                if let Err(e) = self.start_local(session_id).await {
                    warn!("transaction committed, but no new transaction could be started: {}", e);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Rolls back the current local transaction and starts the next one. After a failover, the
    ///  broker has rolled back already and is not asked again.
    pub async fn rollback(&mut self, session_id: i64, failover_occurred: bool) -> MqResult<()> {
        if failover_occurred && self.restarted_after_failover && self.is_started() {
            debug!(transaction_id = self.transaction_id, "transaction was restarted after failover already");
            self.restarted_after_failover = false;
            return Ok(());
        }
        if self.transaction_id != 0 && !failover_occurred {
            self.handler.rollback(self.transaction_id, false).await?;
        }
        self.state = TransactionState::RolledBack;
        self.next_transaction_id = None;
        self.start_local(session_id).await
    }

    /// Releases the broker side transaction when the session is closed. Messages consumed in the
    ///  transaction become available again.
    pub async fn release_broker_resource(&mut self) -> MqResult<()> {
        if self.transaction_id == 0 || !self.is_started() {
            return Ok(());
        }
        let tid = self.transaction_id;
        self.state = TransactionState::RolledBack;
        self.handler.rollback(tid, true).await
    }

    /// Forgets the current transaction without talking to the broker, e.g. after the
    ///  connection was re-established and the broker has forgotten it anyway
    pub fn reset(&mut self) {
        self.transaction_id = 0;
        self.next_transaction_id = None;
        self.restarted_after_failover = false;
        self.state = TransactionState::RolledBack;
    }

    /// Replaces the transaction that was lost with the old connection
    pub async fn restart_after_failover(&mut self, session_id: i64) -> MqResult<()> {
        self.reset();
        self.start_local(session_id).await?;
        self.restarted_after_failover = true;
        Ok(())
    }


    // ------------------------------------------- XA ---------------------------------------------

    pub fn current_xid(&self) -> Option<&Xid> {
        self.xid.as_ref()
    }

    /// The broker transaction id to use for `xid`: only known for the current branch
    fn tid_for(&self, xid: &Xid) -> i64 {
        match &self.xid {
            Some(current) if current == xid => self.transaction_id,
            _ => 0,
        }
    }

    pub async fn start_xa(&mut self, session_id: i64, xid: &Xid, flags: i32) -> MqResult<()> {
        let tid = self.handler.start_transaction(session_id, Some(xid), flags).await?;
        self.transaction_id = tid;
        self.xid = Some(xid.clone());
        self.state = TransactionState::Started;
        Ok(())
    }

    pub async fn end_xa(&mut self, xid: &Xid, flags: i32) -> MqResult<()> {
        self.handler.end_transaction(self.tid_for(xid), Some(xid), flags).await?;
        if self.xid.as_ref() == Some(xid) {
            self.state = TransactionState::Ended;
        }
        Ok(())
    }

    pub async fn prepare_xa(&mut self, xid: &Xid) -> MqResult<()> {
        self.handler.prepare(self.tid_for(xid), Some(xid)).await?;
        if self.xid.as_ref() == Some(xid) {
            self.state = TransactionState::Prepared;
        }
        Ok(())
    }

    pub async fn commit_xa(&mut self, xid: &Xid, one_phase: bool) -> MqResult<()> {
        self.handler.commit(self.tid_for(xid), Some(xid), one_phase, false).await?;
        self.finish_branch(xid, TransactionState::Committed);
        Ok(())
    }

    pub async fn rollback_xa(&mut self, xid: &Xid) -> MqResult<()> {
        self.handler.rollback_xa(self.tid_for(xid), xid).await?;
        self.finish_branch(xid, TransactionState::RolledBack);
        Ok(())
    }

    pub async fn recover_xa(&self, flags: i32) -> MqResult<Vec<Xid>> {
        self.handler.recover_transactions(flags).await
    }

    fn finish_branch(&mut self, xid: &Xid, state: TransactionState) {
        if self.xid.as_ref() == Some(xid) {
            self.xid = None;
            self.transaction_id = 0;
            self.state = state;
        }
    }
}

fn rolled_back_by_failover(tid: i64) -> MqError {
    MqError::TransactionRolledBack(format!("transaction {} was rolled back because of a failover", tid))
}


#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::connection::config::ClientConfig;
    use crate::protocol::correlation::AckIdGenerator;
    use crate::protocol::packet::{props, Packet, PacketType};
    use crate::protocol::transport::{BrokerAddress, TransportConnector};
    use crate::test_util::mock_broker::MockBroker;
    use super::*;

    async fn setup(broker: &MockBroker) -> (Arc<ProtocolHandler>, Arc<ConnectionState>) {
        let mut config = ClientConfig::new(vec![BrokerAddress::new("localhost", 7676)]);
        config.ping_interval = None;
        let state = Arc::new(ConnectionState::new(config.reconnect_gate_recheck_interval));
        let handler = Arc::new(ProtocolHandler::new(Arc::new(config), state.clone(), Arc::new(AckIdGenerator::new())));
        let transport = broker.connect(&BrokerAddress::new("localhost", 7676)).await.unwrap();
        handler.set_transport(transport.clone());
        let h2 = handler.clone();
        tokio::spawn(async move {
            while let Ok(Some(packet)) = transport.receive_packet().await {
                h2.deliver_reply(packet);
            }
        });
        handler.hello(false).await.unwrap();
        (handler, state)
    }

    #[tokio::test]
    async fn test_start_retries_id_in_use() {
        let broker = MockBroker::new();
        broker.set_ha(false);
        let (handler, state) = setup(&broker).await;
        broker.script_status(PacketType::StartTransaction, 409);

        let mut tx = Transaction::new(handler, state, false);
        tx.start_local(5).await.unwrap();
        assert!(tx.is_started());
        assert_eq!(broker.sent_of_type(PacketType::StartTransaction).len(), 2);
    }

    #[rstest]
    #[case::one_phase(false, vec![PacketType::CommitTransaction, PacketType::StartTransaction])]
    #[case::two_phase(true, vec![PacketType::EndTransaction, PacketType::PrepareTransaction, PacketType::CommitTransaction, PacketType::StartTransaction])]
    #[tokio::test]
    async fn test_commit_sequence(#[case] ha: bool, #[case] expected: Vec<PacketType>) {
        let broker = MockBroker::new();
        broker.set_ha(ha);
        let (handler, state) = setup(&broker).await;

        let mut tx = Transaction::new(handler, state, false);
        tx.start_local(5).await.unwrap();
        let first = tx.transaction_id();
        broker.take_sent();

        tx.commit(5).await.unwrap();
        broker.assert_sent_types(&expected);
        assert_ne!(tx.transaction_id(), first);
        assert!(tx.is_started());
    }

    #[tokio::test]
    async fn test_commit_uses_pre_started_transaction() {
        let broker = MockBroker::new();
        broker.set_ha(false);
        let (handler, state) = setup(&broker).await;
        let mut tx = Transaction::new(handler, state, true);
        tx.start_local(5).await.unwrap();

        broker.script(PacketType::CommitTransaction, |request| {
            Packet::reply_to(request, PacketType::CommitTransactionReply, 200)
                .with_property(props::NEXT_TRANSACTION_ID, 999i64)
        });
        broker.take_sent();
        tx.commit(5).await.unwrap();
        assert_eq!(tx.transaction_id(), 999);
        broker.assert_sent_types(&[PacketType::CommitTransaction]);
    }

    #[rstest]
    #[case::prepared_recommits(6, Ok(()), 2)]
    #[case::committed(7, Ok(()), 1)]
    #[case::rolled_back(8, Err(ErrorKind::TransactionRolledBack), 1)]
    #[tokio::test(start_paused = true)]
    async fn test_commit_verified_after_lost_reply(#[case] verified: i32, #[case] expected: Result<(), ErrorKind>, #[case] num_commits: usize) {
        let broker = MockBroker::new();
        let (handler, state) = setup(&broker).await;
        let mut tx = Transaction::new(handler.clone(), state, false);
        tx.start_local(5).await.unwrap();

        // the reply to COMMIT is lost with the connection
        broker.script_silence(PacketType::CommitTransaction);
        broker.script(PacketType::VerifyTransaction, move |request| {
            Packet::reply_to(request, PacketType::VerifyTransactionReply, 200)
                .with_body(crate::protocol::body::encode_int_map(&[("State", verified)]))
        });
        let b2 = broker.clone();
        tokio::spawn(async move {
            while b2.sent_of_type(PacketType::CommitTransaction).is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            handler.abort_pending();
        });

        let result = tx.commit(5).await.map_err(|e| e.kind());
        assert_eq!(result, expected);
        assert_eq!(broker.sent_of_type(PacketType::CommitTransaction).len(), num_commits);
        assert_eq!(broker.sent_of_type(PacketType::VerifyTransaction).len(), 1);
    }

    #[tokio::test]
    async fn test_commit_lost_before_prepare_is_rolled_back() {
        let broker = MockBroker::new();
        let (handler, state) = setup(&broker).await;
        let mut tx = Transaction::new(handler.clone(), state, false);
        tx.start_local(5).await.unwrap();

        broker.script_silence(PacketType::EndTransaction);
        let b2 = broker.clone();
        tokio::spawn(async move {
            while b2.sent_of_type(PacketType::EndTransaction).is_empty() {
                tokio::task::yield_now().await;
            }
            handler.abort_pending();
        });

        let err = tx.commit(5).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransactionRolledBack);
        assert!(broker.sent_of_type(PacketType::VerifyTransaction).is_empty());
    }

    #[tokio::test]
    async fn test_rollback_after_failover_skips_broker() {
        let broker = MockBroker::new();
        broker.set_ha(false);
        let (handler, state) = setup(&broker).await;
        let mut tx = Transaction::new(handler, state, false);
        tx.start_local(5).await.unwrap();
        broker.take_sent();

        tx.rollback(5, true).await.unwrap();
        broker.assert_sent_types(&[PacketType::StartTransaction]);

        tx.rollback(5, false).await.unwrap();
        broker.assert_sent_types(&[PacketType::RollbackTransaction, PacketType::StartTransaction]);
    }

    #[tokio::test]
    async fn test_transaction_restarted_after_failover_is_kept() {
        let broker = MockBroker::new();
        broker.set_ha(false);
        let (handler, state) = setup(&broker).await;
        let mut tx = Transaction::new(handler, state, false);
        tx.start_local(5).await.unwrap();

        tx.restart_after_failover(6).await.unwrap();
        let restarted = tx.transaction_id();
        broker.take_sent();

        tx.rollback(6, true).await.unwrap();
        broker.assert_no_remaining_packets();
        assert_eq!(tx.transaction_id(), restarted);

        tx.rollback(6, true).await.unwrap();
        broker.assert_sent_types(&[PacketType::StartTransaction]);
        assert_ne!(tx.transaction_id(), restarted);
    }

    #[tokio::test]
    async fn test_xa_branch() {
        let broker = MockBroker::new();
        let (handler, state) = setup(&broker).await;
        let mut tx = Transaction::new(handler, state, false);
        let xid = Xid::new(1, b"global", b"branch");
        let other = Xid::new(1, b"global", b"other");

        tx.start_xa(5, &xid, xa_flags::TMNOFLAGS).await.unwrap();
        let tid = tx.transaction_id();
        tx.end_xa(&xid, xa_flags::TMSUCCESS).await.unwrap();
        tx.prepare_xa(&other).await.unwrap();
        tx.prepare_xa(&xid).await.unwrap();
        assert_eq!(tx.state(), TransactionState::Prepared);
        tx.commit_xa(&xid, false).await.unwrap();
        assert_eq!(tx.current_xid(), None);

        let prepares = broker.sent_of_type(PacketType::PrepareTransaction);
        assert_eq!(prepares[0].get_long(props::TRANSACTION_ID), Some(0));
        assert_eq!(prepares[1].get_long(props::TRANSACTION_ID), Some(tid));
        assert!(tx.recover_xa(xa_flags::TMSTARTRSCAN).await.unwrap().is_empty());
    }
}
