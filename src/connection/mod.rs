pub mod address_list;
pub mod config;
pub mod connection;
pub mod events;
pub mod reconnect;
pub mod registry;
pub mod state;
