use std::time::Duration;

use thiserror::Error;

use crate::protocol::packet::PacketType;

pub type MqResult<T> = Result<T, MqError>;

/// Flat classification of [MqError], convenient for matching without destructuring payloads.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Protocol,
    Server,
    InvalidDestination,
    InvalidSelector,
    SecurityDenied,
    ResourceConflict,
    ResourceExhausted,
    TransactionRolledBack,
    TransactionIdInUse,
    InvalidTransactionId,
    RemoteBrokerFailure,
    PrepareFailed,
    BrokerUnavailable,
    TakeoverInProgress,
    Redirect,
    ConnectionBroken,
    IllegalState,
    Timeout,
    Network,
}

/// Consumers affected by the failure of a cluster peer, as reported by the broker on an
///  ack / commit / prepare reply.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteFailure {
    pub verb: PacketType,
    pub status: i32,
    pub consumer_ids: Vec<u64>,
}

impl RemoteFailure {
    /// The broker reports the affected consumers as a space separated list of ids. Tokens that
    ///  are not numbers are skipped.
    pub fn parse_consumer_ids(raw: &str) -> Vec<u64> {
        raw.split_whitespace()
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    pub fn affects_any(&self, consumer_ids: impl IntoIterator<Item = u64>) -> bool {
        consumer_ids.into_iter()
            .any(|id| self.consumer_ids.contains(&id))
    }
}

#[derive(Debug, Error)]
pub enum MqError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("[{verb:?}] server error: [{status}] {reason}")]
    Server { verb: PacketType, status: i32, reason: String },
    #[error("invalid destination: {0}")]
    InvalidDestination(String),
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
    #[error("security denied: {0}")]
    SecurityDenied(String),
    #[error("resource in use: {0}")]
    ResourceConflict(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("transaction rolled back: {0}")]
    TransactionRolledBack(String),
    #[error("transaction id in use: {0}")]
    TransactionIdInUse(String),
    #[error("invalid transaction id: {0}")]
    InvalidTransactionId(String),
    #[error("remote broker failure on {:?} (status {}), affected consumers {:?}", .0.verb, .0.status, .0.consumer_ids)]
    RemoteBrokerFailure(RemoteFailure),
    #[error("prepare failed: {0}")]
    PrepareFailed(String),
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),
    #[error("broker takeover in progress: {0}")]
    TakeoverInProgress(String),
    #[error("broker moved permanently: {0}")]
    Redirect(String),
    #[error("connection broken: {0}")]
    ConnectionBroken(String),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("no reply to {verb:?} within {timeout:?}")]
    Timeout { verb: PacketType, timeout: Duration },
    #[error("network error: {0:#}")]
    Network(anyhow::Error),
}

impl MqError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MqError::Protocol(_) => ErrorKind::Protocol,
            MqError::Server { .. } => ErrorKind::Server,
            MqError::InvalidDestination(_) => ErrorKind::InvalidDestination,
            MqError::InvalidSelector(_) => ErrorKind::InvalidSelector,
            MqError::SecurityDenied(_) => ErrorKind::SecurityDenied,
            MqError::ResourceConflict(_) => ErrorKind::ResourceConflict,
            MqError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            MqError::TransactionRolledBack(_) => ErrorKind::TransactionRolledBack,
            MqError::TransactionIdInUse(_) => ErrorKind::TransactionIdInUse,
            MqError::InvalidTransactionId(_) => ErrorKind::InvalidTransactionId,
            MqError::RemoteBrokerFailure(_) => ErrorKind::RemoteBrokerFailure,
            MqError::PrepareFailed(_) => ErrorKind::PrepareFailed,
            MqError::BrokerUnavailable(_) => ErrorKind::BrokerUnavailable,
            MqError::TakeoverInProgress(_) => ErrorKind::TakeoverInProgress,
            MqError::Redirect(_) => ErrorKind::Redirect,
            MqError::ConnectionBroken(_) => ErrorKind::ConnectionBroken,
            MqError::IllegalState(_) => ErrorKind::IllegalState,
            MqError::Timeout { .. } => ErrorKind::Timeout,
            MqError::Network(_) => ErrorKind::Network,
        }
    }

    /// Builds the typed error for a non-OK reply status once the status was classified
    pub fn from_kind(kind: ErrorKind, verb: PacketType, status: i32, reason: &str) -> MqError {
        let msg = format!("[{:?}] status {}: {}", verb, status, reason);
        match kind {
            ErrorKind::Protocol => MqError::Protocol(msg),
            ErrorKind::InvalidDestination => MqError::InvalidDestination(msg),
            ErrorKind::InvalidSelector => MqError::InvalidSelector(msg),
            ErrorKind::SecurityDenied => MqError::SecurityDenied(msg),
            ErrorKind::ResourceConflict => MqError::ResourceConflict(msg),
            ErrorKind::ResourceExhausted => MqError::ResourceExhausted(msg),
            ErrorKind::TransactionRolledBack => MqError::TransactionRolledBack(msg),
            ErrorKind::TransactionIdInUse => MqError::TransactionIdInUse(msg),
            ErrorKind::InvalidTransactionId => MqError::InvalidTransactionId(msg),
            ErrorKind::PrepareFailed => MqError::PrepareFailed(msg),
            ErrorKind::BrokerUnavailable => MqError::BrokerUnavailable(msg),
            ErrorKind::TakeoverInProgress => MqError::TakeoverInProgress(msg),
            ErrorKind::Redirect => MqError::Redirect(reason.to_string()),
            ErrorKind::ConnectionBroken => MqError::ConnectionBroken(msg),
            ErrorKind::IllegalState => MqError::IllegalState(msg),
            ErrorKind::RemoteBrokerFailure => MqError::RemoteBrokerFailure(RemoteFailure {
                verb,
                status,
                consumer_ids: Vec::new(),
            }),
            ErrorKind::Server | ErrorKind::Timeout | ErrorKind::Network => MqError::Server {
                verb,
                status,
                reason: reason.to_string(),
            },
        }
    }

    pub fn illegal_state(msg: impl Into<String>) -> MqError {
        MqError::IllegalState(msg.into())
    }

    /// Write failures and lost replies are the errors that a reconnect may be able to cure
    pub fn is_network_failure(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::ConnectionBroken | ErrorKind::Timeout)
    }

    pub fn remote_failure(&self) -> Option<&RemoteFailure> {
        match self {
            MqError::RemoteBrokerFailure(f) => Some(f),
            _ => None,
        }
    }
}
