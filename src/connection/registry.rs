use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::protocol::correlation::AckIdGenerator;


/// Process wide id sources, shared by all connections created with it. Applications normally
///  create one registry and pass it to every connection; tests create their own.
#[derive(Debug, Default)]
pub struct IdRegistry {
    next_connection_id: AtomicU64,
    ack_ids: Arc<AckIdGenerator>,
}

impl IdRegistry {
    pub fn new() -> IdRegistry {
        IdRegistry::with_ack_ids(AckIdGenerator::new())
    }

    /// e.g. a generator that wraps around early
    pub fn with_ack_ids(ack_ids: AckIdGenerator) -> IdRegistry {
        IdRegistry {
            next_connection_id: AtomicU64::new(0),
            ack_ids: Arc::new(ack_ids),
        }
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn ack_ids(&self) -> Arc<AckIdGenerator> {
        self.ack_ids.clone()
    }
}
