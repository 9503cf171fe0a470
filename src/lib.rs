pub mod error;
pub mod protocol;
pub mod connection;
pub mod session;
pub mod util;
pub mod test_util;
