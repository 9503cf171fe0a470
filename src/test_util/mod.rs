//! An in-memory broker for driving the client engine without a network. The engine's own tests
//!  are built on it, and it is exported so that applications can script broker behavior in
//!  their tests too, which is why it is not behind `#[cfg(test)]`.

pub mod mock_broker;
