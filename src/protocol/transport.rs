use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::protocol::packet::Packet;


/// Address of a broker node, `host:port`, optionally with an `mq://` scheme prefix
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    pub fn new(host: &str, port: u16) -> BrokerAddress {
        BrokerAddress {
            host: host.to_string(),
            port,
        }
    }
}

impl Display for BrokerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for BrokerAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("mq://").unwrap_or(s);
        let s = s.trim_end_matches('/');

        let (host, port) = s.rsplit_once(':')
            .ok_or_else(|| anyhow!("broker address without port: {}", s))?;
        if host.is_empty() {
            return Err(anyhow!("broker address without host: {}", s));
        }
        let port = port.parse()
            .map_err(|e| anyhow!("invalid port in broker address {}: {}", s, e))?;
        Ok(BrokerAddress::new(host, port))
    }
}


/// An established packet stream to one broker. Implementations own framing and the byte
///  layout of packets.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_packet(&self, packet: Packet) -> anyhow::Result<()>;

    /// Returns the next inbound packet, or `None` when the broker closed the stream
    async fn receive_packet(&self) -> anyhow::Result<Option<Packet>>;

    async fn close(&self);
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    async fn connect(&self, address: &BrokerAddress) -> anyhow::Result<Arc<dyn Transport>>;
}

impl Debug for dyn Transport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transport")
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::plain("localhost:7676", Some(BrokerAddress::new("localhost", 7676)))]
    #[case::scheme("mq://broker-2:7677/", Some(BrokerAddress::new("broker-2", 7677)))]
    #[case::whitespace(" a:1 ", Some(BrokerAddress::new("a", 1)))]
    #[case::no_port("localhost", None)]
    #[case::bad_port("localhost:x", None)]
    #[case::no_host(":7676", None)]
    fn test_parse_broker_address(#[case] s: &str, #[case] expected: Option<BrokerAddress>) {
        assert_eq!(s.parse::<BrokerAddress>().ok(), expected);
    }

    #[test]
    fn test_display() {
        assert_eq!(BrokerAddress::new("h", 5).to_string(), "h:5");
    }
}
