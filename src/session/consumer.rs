use crate::protocol::destination::Destination;
use crate::protocol::packet::MessageId;


/// Local, application visible identity of a consumer. It stays the same when the consumer is
///  re-registered with the broker after a failure, while the broker side id changes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConsumerId(pub u64);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConsumerSpec {
    pub destination: Destination,
    pub selector: Option<String>,
    pub no_local: bool,
    pub durable_name: Option<String>,
    /// shared subscription (JMS 2.0 style) - the subscription name is required then
    pub shared_subscription_name: Option<String>,
    /// shared durable subscription in the pre-JMS 2.0 (client id scoped) sense
    pub share: bool,
    /// overrides the connection's prefetch limit
    pub prefetch: Option<i32>,
}

impl ConsumerSpec {
    pub fn new(destination: Destination) -> ConsumerSpec {
        ConsumerSpec {
            destination,
            selector: None,
            no_local: false,
            durable_name: None,
            shared_subscription_name: None,
            share: false,
            prefetch: None,
        }
    }

    pub fn durable(destination: Destination, name: &str) -> ConsumerSpec {
        ConsumerSpec {
            durable_name: Some(name.to_string()),
            ..ConsumerSpec::new(destination)
        }
    }

    pub fn with_selector(mut self, selector: &str) -> ConsumerSpec {
        self.selector = Some(selector.to_string());
        self
    }

    pub fn is_durable(&self) -> bool {
        self.durable_name.is_some()
    }
}

/// Session side bookkeeping for one consumer
#[derive(Clone, Debug)]
pub struct ConsumerState {
    pub id: ConsumerId,
    pub spec: ConsumerSpec,
    pub broker_id: u64,
    pub last_delivered: Option<MessageId>,
    /// messages delivered since flow was last resumed for this consumer
    pub delivered_since_resume: i32,
}

impl ConsumerState {
    pub fn new(id: ConsumerId, spec: ConsumerSpec, broker_id: u64) -> ConsumerState {
        ConsumerState {
            id,
            spec,
            broker_id,
            last_delivered: None,
            delivered_since_resume: 0,
        }
    }

    /// Counts a delivery and returns `true` if flow should be resumed for the consumer
    pub fn on_delivered(&mut self, message_id: Option<MessageId>, resume_threshold: i32) -> bool {
        if message_id.is_some() {
            self.last_delivered = message_id;
        }
        self.delivered_since_resume += 1;
        if self.delivered_since_resume >= resume_threshold {
            self.delivered_since_resume = 0;
            return true;
        }
        false
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_on_delivered_resumes_at_threshold() {
        let mut c = ConsumerState::new(ConsumerId(1), ConsumerSpec::new(Destination::queue("q")), 17);
        assert!(!c.on_delivered(Some(MessageId(1)), 3));
        assert!(!c.on_delivered(Some(MessageId(2)), 3));
        assert!(c.on_delivered(Some(MessageId(3)), 3));
        assert_eq!(c.delivered_since_resume, 0);
        assert_eq!(c.last_delivered, Some(MessageId(3)));
    }

    #[test]
    fn test_durable_spec() {
        let spec = ConsumerSpec::durable(Destination::topic("t"), "sub").with_selector("a > 1");
        assert!(spec.is_durable());
        assert_eq!(spec.selector.as_deref(), Some("a > 1"));
    }
}
