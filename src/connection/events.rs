use std::sync::Arc;

#[cfg(test)] use mockall::automock;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::MqError;
use crate::protocol::transport::BrokerAddress;


#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    /// the transport broke and failover started
    Reconnecting(ReconnectingData),
    Reconnected(ReconnectedData),
    /// failover gave up; the connection is broken for good
    ReconnectFailed(ReconnectFailedData),
    Closed,
    AddressListChanged(AddressListChangedData),
    /// a consumer was re-registered with the broker
    ConsumerEvent(ConsumerEventData),
    /// an unrecoverable error was reported to the exception listener
    Exception(ExceptionData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReconnectingData {
    pub cause: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReconnectedData {
    pub address: BrokerAddress,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReconnectFailedData {
    pub reason: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressListChangedData {
    pub addresses: Vec<BrokerAddress>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConsumerEventData {
    pub session_id: u64,
    pub consumer_id: u64,
    pub broker_consumer_id: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExceptionData {
    pub message: String,
}


pub struct ConnectionEventNotifier {
    sender: broadcast::Sender<ConnectionEvent>,
}
impl ConnectionEventNotifier {
    pub fn new() -> ConnectionEventNotifier {
        let (sender, _) = broadcast::channel(128);

        ConnectionEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ConnectionEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

impl Default for ConnectionEventNotifier {
    fn default() -> Self {
        ConnectionEventNotifier::new()
    }
}


/// Application callback for errors that make the connection unusable
#[cfg_attr(test, automock)]
pub trait ExceptionListener: Send + Sync + 'static {
    fn on_exception(&self, error: &MqError);
}

pub type SharedExceptionListener = Arc<dyn ExceptionListener>;
