pub mod ack_mode;
pub mod consumer;
pub mod critical_section;
pub mod ledger;
pub mod session;
pub mod transaction;
