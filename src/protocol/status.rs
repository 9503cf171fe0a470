use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{ErrorKind, MqError};
use crate::protocol::packet::{Packet, PacketType};


/// Reply status codes, modelled after HTTP status codes
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum Status {
    Ok = 200,
    MovedPermanently = 301,
    NotModified = 304,
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    NotAllowed = 405,
    Timeout = 408,
    Conflict = 409,
    Gone = 410,
    PreconditionFailed = 412,
    ResourceFull = 414,
    EntityTooLarge = 423,
    /// transient unavailability of cluster state - the request may be re-sent once
    Retry = 449,
    Error = 500,
    NotImplemented = 501,
    Unavailable = 503,
    BadVersion = 505,
}

impl Status {
    pub fn of(packet: &Packet) -> Option<Status> {
        Status::try_from(packet.status()).ok()
    }
}

fn default_error_kind(status: Status) -> ErrorKind {
    use Status::*;
    match status {
        NotFound => ErrorKind::InvalidDestination,
        Unauthorized | Forbidden => ErrorKind::SecurityDenied,
        Conflict => ErrorKind::ResourceConflict,
        ResourceFull | EntityTooLarge => ErrorKind::ResourceExhausted,
        Unavailable => ErrorKind::BrokerUnavailable,
        MovedPermanently => ErrorKind::Redirect,
        NotAllowed => ErrorKind::IllegalState,
        _ => ErrorKind::Server,
    }
}

/// Statuses that mean something specific for one verb
const VERB_OVERRIDES: &[(PacketType, Status, ErrorKind)] = &[
    (PacketType::AddConsumer, Status::BadRequest, ErrorKind::InvalidSelector),
    (PacketType::AddConsumer, Status::Conflict, ErrorKind::ResourceExhausted),
    (PacketType::AddConsumer, Status::NotAllowed, ErrorKind::IllegalState),
    (PacketType::AddProducer, Status::Conflict, ErrorKind::ResourceExhausted),
    (PacketType::StartTransaction, Status::Conflict, ErrorKind::TransactionIdInUse),
    (PacketType::CommitTransaction, Status::BadRequest, ErrorKind::InvalidTransactionId),
    (PacketType::CommitTransaction, Status::Timeout, ErrorKind::TransactionRolledBack),
    (PacketType::RollbackTransaction, Status::BadRequest, ErrorKind::InvalidTransactionId),
    (PacketType::PrepareTransaction, Status::Timeout, ErrorKind::TransactionRolledBack),
    (PacketType::Hello, Status::Timeout, ErrorKind::TakeoverInProgress),
    (PacketType::SetClientId, Status::Conflict, ErrorKind::ResourceConflict),
];

/// Classifies a non-OK status for the given request verb. Statuses unknown to this client are
///  generic server errors.
pub fn error_kind(verb: PacketType, status: i32) -> ErrorKind {
    let Ok(status) = Status::try_from(status) else {
        return ErrorKind::Server;
    };

    VERB_OVERRIDES.iter()
        .find(|(v, s, _)| *v == verb && *s == status)
        .map(|(_, _, kind)| *kind)
        .unwrap_or_else(|| default_error_kind(status))
}

/// The typed error for a reply to `verb` with a non-OK status
pub fn status_error(verb: PacketType, reply: &Packet) -> MqError {
    let status = reply.status();
    MqError::from_kind(error_kind(verb, status), verb, status, reply.reason())
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::not_found(PacketType::CreateDestination, 404, ErrorKind::InvalidDestination)]
    #[case::forbidden(PacketType::AddProducer, 403, ErrorKind::SecurityDenied)]
    #[case::conflict_default(PacketType::CreateSession, 409, ErrorKind::ResourceConflict)]
    #[case::conflict_consumer(PacketType::AddConsumer, 409, ErrorKind::ResourceExhausted)]
    #[case::conflict_transaction(PacketType::StartTransaction, 409, ErrorKind::TransactionIdInUse)]
    #[case::bad_request_selector(PacketType::AddConsumer, 400, ErrorKind::InvalidSelector)]
    #[case::bad_request_commit(PacketType::CommitTransaction, 400, ErrorKind::InvalidTransactionId)]
    #[case::bad_request_other(PacketType::CreateSession, 400, ErrorKind::Server)]
    #[case::hello_takeover(PacketType::Hello, 408, ErrorKind::TakeoverInProgress)]
    #[case::hello_unavailable(PacketType::Hello, 503, ErrorKind::BrokerUnavailable)]
    #[case::prepare_timeout(PacketType::PrepareTransaction, 408, ErrorKind::TransactionRolledBack)]
    #[case::resource_full(PacketType::AddConsumer, 414, ErrorKind::ResourceExhausted)]
    #[case::unknown_status(PacketType::AddConsumer, 299, ErrorKind::Server)]
    #[case::generic(PacketType::Stop, 500, ErrorKind::Server)]
    fn test_error_kind(#[case] verb: PacketType, #[case] status: i32, #[case] expected: ErrorKind) {
        assert_eq!(error_kind(verb, status), expected);
    }

    #[test]
    fn test_status_error_carries_reason() {
        let reply = Packet::new(PacketType::CreateSessionReply)
            .with_property(crate::protocol::packet::props::STATUS, 500)
            .with_property(crate::protocol::packet::props::REASON, "disk full");
        match status_error(PacketType::CreateSession, &reply) {
            MqError::Server { verb, status, reason } => {
                assert_eq!(verb, PacketType::CreateSession);
                assert_eq!(status, 500);
                assert_eq!(reason, "disk full");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
