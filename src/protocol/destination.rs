use std::fmt::{Display, Formatter};


#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DestinationKind {
    Queue,
    Topic,
    TemporaryQueue,
    TemporaryTopic,
}

impl DestinationKind {
    const QUEUE: i32 = 0x1;
    const TOPIC: i32 = 0x2;
    const TEMP: i32 = 0x10;

    /// bit mask as sent in the `JMQDestType` property
    pub fn wire_value(&self) -> i32 {
        match self {
            DestinationKind::Queue => Self::QUEUE,
            DestinationKind::Topic => Self::TOPIC,
            DestinationKind::TemporaryQueue => Self::QUEUE | Self::TEMP,
            DestinationKind::TemporaryTopic => Self::TOPIC | Self::TEMP,
        }
    }

    pub fn is_topic(&self) -> bool {
        matches!(self, DestinationKind::Topic | DestinationKind::TemporaryTopic)
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, DestinationKind::TemporaryQueue | DestinationKind::TemporaryTopic)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Destination {
    pub name: String,
    pub kind: DestinationKind,
}

impl Destination {
    pub fn queue(name: &str) -> Destination {
        Destination { name: name.to_string(), kind: DestinationKind::Queue }
    }

    pub fn topic(name: &str) -> Destination {
        Destination { name: name.to_string(), kind: DestinationKind::Topic }
    }

    /// Temporary destination names are scoped by the owning connection
    pub fn temporary(kind_is_topic: bool, connection_id: i64, sequence: u64) -> Destination {
        let (kind, prefix) = if kind_is_topic {
            (DestinationKind::TemporaryTopic, "temporary_topic")
        }
        else {
            (DestinationKind::TemporaryQueue, "temporary_queue")
        };
        Destination {
            name: format!("{}://{}/{}", prefix, connection_id, sequence),
            kind,
        }
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.name)
    }
}
