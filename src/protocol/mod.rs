pub mod body;
pub mod correlation;
pub mod destination;
pub mod inbound;
pub mod keepalive;
pub mod packet;
pub mod protocol_handler;
pub mod status;
pub mod transport;
