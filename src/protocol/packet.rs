use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};


/// Packet type tags. Requests that expect an answer have a matching `*Reply` type; the numeric
///  values are the ones used on the wire.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum PacketType {
    /// a message delivered to a consumer
    Deliver = 1,

    Hello = 10,
    HelloReply = 11,
    Authenticate = 12,
    AuthenticateReply = 13,
    AddConsumer = 14,
    AddConsumerReply = 15,
    DeleteConsumer = 16,
    DeleteConsumerReply = 17,
    AddProducer = 18,
    AddProducerReply = 19,
    Start = 20,
    Stop = 22,
    StopReply = 23,
    Acknowledge = 24,
    AcknowledgeReply = 25,
    Goodbye = 28,
    GoodbyeReply = 29,
    /// unsolicited error notification from the broker
    Error = 30,
    Redeliver = 32,
    CreateDestination = 34,
    CreateDestinationReply = 35,
    DestroyDestination = 36,
    DestroyDestinationReply = 37,
    AuthenticateRequest = 38,
    StartTransaction = 48,
    StartTransactionReply = 49,
    CommitTransaction = 50,
    CommitTransactionReply = 51,
    RollbackTransaction = 52,
    RollbackTransactionReply = 53,
    SetClientId = 54,
    SetClientIdReply = 55,
    ResumeFlow = 56,
    Ping = 58,
    PingReply = 59,
    PrepareTransaction = 60,
    PrepareTransactionReply = 61,
    EndTransaction = 62,
    EndTransactionReply = 63,
    RecoverTransaction = 64,
    RecoverTransactionReply = 65,
    FlowPaused = 68,
    DeleteProducer = 70,
    DeleteProducerReply = 71,
    CreateSession = 72,
    CreateSessionReply = 73,
    DestroySession = 74,
    DestroySessionReply = 75,
    VerifyTransaction = 80,
    VerifyTransactionReply = 81,
}

impl PacketType {
    /// Replies are routed through the correlation table rather than to a session
    pub fn is_reply(&self) -> bool {
        use PacketType::*;
        matches!(self,
            HelloReply | AuthenticateReply | AuthenticateRequest | AddConsumerReply | DeleteConsumerReply |
            AddProducerReply | StopReply | AcknowledgeReply | GoodbyeReply |
            CreateDestinationReply | DestroyDestinationReply | StartTransactionReply |
            CommitTransactionReply | RollbackTransactionReply | SetClientIdReply |
            PrepareTransactionReply | EndTransactionReply | RecoverTransactionReply |
            DeleteProducerReply | CreateSessionReply | DestroySessionReply | VerifyTransactionReply
        )
    }
}

impl Display for PacketType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, u16::from(*self))
    }
}


#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    String(String),
}
impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}
impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(value)
    }
}
impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Long(value)
    }
}
impl From<u64> for PropertyValue {
    fn from(value: u64) -> Self {
        PropertyValue::Long(value as i64)
    }
}
impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}
impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}


/// Broker assigned id of a message, unique per broker
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MessageId(pub u64);


/// A protocol packet as seen by the client engine. The byte layout on the wire belongs to the
///  transport; the engine only deals with the type tag, the header fields it needs and the
///  property map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    /// For requests and their replies, this is the correlation (ack) id. For delivered
    ///  messages, it is the broker side consumer id.
    pub correlation_id: u64,
    /// requests a reply from the broker
    pub send_acknowledge: bool,
    /// marks a re-sent request that the broker must treat idempotently
    pub idempotent: bool,
    /// ping that the broker should answer, enabling non-responsive broker detection
    pub ping_ack_abort: bool,

    pub message_id: Option<MessageId>,
    pub redelivered: bool,
    pub persistent: bool,
    pub is_topic: bool,
    pub transaction_id: i64,

    pub properties: BTreeMap<String, PropertyValue>,
    pub body: Bytes,
}

impl Packet {
    pub fn new(packet_type: PacketType) -> Packet {
        Packet {
            packet_type,
            correlation_id: 0,
            send_acknowledge: false,
            idempotent: false,
            ping_ack_abort: false,
            message_id: None,
            redelivered: false,
            persistent: true,
            is_topic: false,
            transaction_id: 0,
            properties: Default::default(),
            body: Bytes::new(),
        }
    }

    /// A reply to `request`, as the broker side would build it
    pub fn reply_to(request: &Packet, reply_type: PacketType, status: i32) -> Packet {
        let mut reply = Packet::new(reply_type);
        reply.correlation_id = request.correlation_id;
        reply.set_property(props::STATUS, status);
        reply
    }

    /// A message delivered to a consumer
    pub fn message(consumer_id: u64, message_id: MessageId) -> Packet {
        let mut msg = Packet::new(PacketType::Deliver);
        msg.correlation_id = consumer_id;
        msg.message_id = Some(message_id);
        msg
    }

    pub fn with_property(mut self, name: &str, value: impl Into<PropertyValue>) -> Packet {
        self.set_property(name, value);
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Packet {
        self.body = body;
        self
    }

    pub fn set_property(&mut self, name: &str, value: impl Into<PropertyValue>) {
        self.properties.insert(name.to_string(), value.into());
    }

    pub fn get_property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.properties.get(name)? {
            PropertyValue::Bool(b) => Some(*b),
            PropertyValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i32> {
        match self.properties.get(name)? {
            PropertyValue::Int(n) => Some(*n),
            PropertyValue::Long(n) => i32::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn get_long(&self, name: &str) -> Option<i64> {
        match self.properties.get(name)? {
            PropertyValue::Int(n) => Some(*n as i64),
            PropertyValue::Long(n) => Some(*n),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.properties.get(name)? {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Reply status; a reply without a status property is treated as a server error
    pub fn status(&self) -> i32 {
        self.get_int(props::STATUS)
            .unwrap_or(500)
    }

    pub fn reason(&self) -> &str {
        self.get_str(props::REASON)
            .unwrap_or("")
    }
}


/// Names of the packet properties used by the protocol
pub mod props {
    pub const STATUS: &str = "JMQStatus";
    pub const REASON: &str = "JMQReason";

    pub const PROTOCOL_LEVEL: &str = "JMQProtocolLevel";
    pub const VERSION: &str = "JMQVersion";
    pub const USER_AGENT: &str = "JMQUserAgent";
    pub const CONNECTION_ID: &str = "JMQConnectionID";
    pub const RECONNECTABLE: &str = "JMQReconnectable";
    pub const HA_CLIENT: &str = "JMQHAClient";
    pub const HA: &str = "JMQHA";
    pub const BROKER_SESSION_ID: &str = "JMQBrokerSessionID";
    pub const AUTH_TYPE: &str = "JMQAuthType";
    pub const CLIENT_ID: &str = "JMQClientID";
    pub const SHARE: &str = "JMQShare";
    pub const BLOCK: &str = "JMQBlock";

    pub const DESTINATION: &str = "JMQDestination";
    pub const DEST_TYPE: &str = "JMQDestType";
    pub const SELECTOR: &str = "JMQSelector";
    pub const NO_LOCAL: &str = "JMQNoLocal";
    pub const DURABLE_NAME: &str = "JMQDurableName";
    pub const SHARED_SUBSCRIPTION_NAME: &str = "JMQSharedSubscriptionName";
    pub const RECONNECT: &str = "JMQReconnect";
    pub const OLD_CONSUMER_ID: &str = "JMQOldConsumerID";
    pub const ACK_MODE: &str = "JMQAckMode";
    pub const SIZE: &str = "JMQSize";
    pub const BYTES: &str = "JMQBytes";
    pub const SESSION_ID: &str = "JMQSessionID";
    pub const CONSUMER_ID: &str = "JMQConsumerID";
    pub const PRODUCER_ID: &str = "JMQProducerID";
    pub const LAST_DELIVERED_MESSAGE_ID: &str = "JMQLastDeliveredSysMessageID";

    pub const TRANSACTION_ID: &str = "JMQTransactionID";
    pub const NEXT_TRANSACTION_ID: &str = "JMQNextTransactionID";
    pub const START_NEXT_TRANSACTION: &str = "JMQStartNextTransaction";
    pub const XA_FLAGS: &str = "JMQXAFlags";
    pub const XA_ONE_PHASE: &str = "JMQXAOnePhase";
    pub const AUTO_ROLLBACK: &str = "JMQAutoRollback";
    pub const NO_OP: &str = "JMQNoOp";
    pub const QUANTITY: &str = "JMQQuantity";
    pub const REDELIVER: &str = "JMQRedeliver";
    pub const MAX_ROLLBACKS: &str = "JMQMaxRollbacks";
    pub const DMQ_ON_MAX_ROLLBACKS: &str = "JMQDMQOnMaxRollbacks";
    pub const UPDATE_CONSUMED: &str = "JMQUpdateConsumed";
    pub const PREPARE_STATE_FAILED: &str = "JMQPrepareStateFAILED";

    pub const SET_REDELIVERED: &str = "JMQSetRedelivered";
    pub const ACK_TYPE: &str = "JMQAckType";

    pub const REMOTE: &str = "JMQRemote";
    pub const REMOTE_CONSUMER_IDS: &str = "JMQRemoteConsumerIDs";
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::hello(PacketType::Hello, false)]
    #[case::hello_reply(PacketType::HelloReply, true)]
    #[case::auth_request(PacketType::AuthenticateRequest, true)]
    #[case::deliver(PacketType::Deliver, false)]
    #[case::ping_reply(PacketType::PingReply, false)]
    #[case::commit_reply(PacketType::CommitTransactionReply, true)]
    fn test_is_reply(#[case] packet_type: PacketType, #[case] expected: bool) {
        assert_eq!(packet_type.is_reply(), expected);
    }

    #[test]
    fn test_packet_type_from_wire() {
        assert_eq!(PacketType::try_from(73u16).unwrap(), PacketType::CreateSessionReply);
        assert!(PacketType::try_from(9999u16).is_err());
    }

    #[test]
    fn test_property_accessors() {
        let p = Packet::new(PacketType::Hello)
            .with_property("b", true)
            .with_property("i", 7)
            .with_property("l", 1i64 << 40)
            .with_property("s", "x")
            .with_property("sb", "true");

        assert_eq!(p.get_bool("b"), Some(true));
        assert_eq!(p.get_bool("sb"), Some(true));
        assert_eq!(p.get_int("i"), Some(7));
        assert_eq!(p.get_long("i"), Some(7));
        assert_eq!(p.get_long("l"), Some(1i64 << 40));
        assert_eq!(p.get_int("l"), None);
        assert_eq!(p.get_str("s"), Some("x"));
        assert_eq!(p.get_str("i"), None);
        assert_eq!(p.get_bool("missing"), None);
    }

    #[test]
    fn test_reply_to() {
        let mut request = Packet::new(PacketType::CreateSession);
        request.correlation_id = 99;
        let reply = Packet::reply_to(&request, PacketType::CreateSessionReply, 200);
        assert_eq!(reply.correlation_id, 99);
        assert_eq!(reply.status(), 200);
        assert_eq!(reply.reason(), "");
    }
}
