use std::time::Duration;

use anyhow::bail;

use crate::protocol::transport::BrokerAddress;


#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddressListBehavior {
    /// always try addresses in the configured order
    Priority,
    /// try addresses in a random order, spreading clients across a cluster
    Random,
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub addresses: Vec<BrokerAddress>,
    pub address_list_behavior: AddressListBehavior,

    pub client_id: Option<String>,
    pub username: String,
    pub password: String,
    pub protocol_level: i32,

    pub reconnect_enabled: bool,
    /// connection attempts per address before moving on to the next address
    pub reconnect_attempts: u32,
    pub reconnect_interval: Duration,
    /// delay before the first reconnect attempt after a break
    pub reconnect_delay: Duration,
    /// lower bound for `reconnect_delay` when connected to a highly available broker cluster,
    ///  giving the cluster time for takeover
    pub ha_reconnect_delay: Duration,
    /// number of failed recoveries after which the reconnect coordinator gives up for good,
    ///  -1 for no limit
    pub reconnect_max_retries: i32,
    /// requests waiting for a reconnect to finish re-check the connection state at this interval
    pub reconnect_gate_recheck_interval: Duration,
    /// requests give up waiting for a reconnect after this long and fail with
    ///  `ConnectionBroken`, `None` for no limit
    pub reconnect_gate_max_wait: Option<Duration>,

    /// `None` means waiting for a reply indefinitely
    pub ack_timeout: Option<Duration>,
    pub ping_interval: Option<Duration>,
    /// if set, pings request an answer from the broker, and a broker that does not answer
    ///  within this window is treated as gone
    pub ping_ack_abort_window: Option<Duration>,

    /// wait for the broker to confirm acknowledgements
    pub ack_on_acknowledge: bool,

    /// maximum number of messages the broker pushes to a consumer before waiting for flow
    ///  control to resume
    pub prefetch_max_messages: i32,
    /// percentage of `prefetch_max_messages` after which flow is resumed for a consumer
    pub prefetch_threshold_percent: u32,
    pub connection_flow_limit_enabled: bool,
    /// number of messages after which connection level flow is resumed
    pub connection_flow_count: i32,

    pub dups_ok_limit: usize,
    pub dups_ok_timeout: Option<Duration>,
    pub dups_ok_flush_on_empty_queue: bool,

    /// a warning is logged when a client acknowledge session accumulates more unacknowledged
    ///  messages than this
    pub client_ack_limit: Option<usize>,

    /// how long commit / rollback / recover wait for a concurrent consumer close to finish
    ///  before failing, `None` for no limit
    pub consumer_close_wait: Option<Duration>,

    /// commit local transactions in two phases (end, prepare, commit) when connected to an HA
    ///  broker, so that a commit interrupted by failover can be verified afterwards
    pub two_phase_commit_for_ha: bool,
    /// transacted acknowledgements do not wait for the broker's reply - commit does
    pub no_block_until_txn_completes: bool,
    /// auto acknowledge of non-persistent topic messages does not wait for the broker's reply,
    ///  even for durable subscribers
    pub no_block_on_auto_ack_np_topics: bool,
    /// commit asks the broker to start the next transaction, saving a round trip
    pub auto_start_transaction: bool,
}

impl ClientConfig {
    pub fn new(addresses: Vec<BrokerAddress>) -> ClientConfig {
        ClientConfig {
            addresses,
            address_list_behavior: AddressListBehavior::Priority,
            client_id: None,
            username: "guest".to_string(),
            password: "guest".to_string(),
            protocol_level: 500,
            reconnect_enabled: false,
            reconnect_attempts: 6,
            reconnect_interval: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(0),
            ha_reconnect_delay: Duration::from_secs(3),
            reconnect_max_retries: 100,
            reconnect_gate_recheck_interval: Duration::from_secs(30),
            reconnect_gate_max_wait: None,
            ack_timeout: None,
            ping_interval: Some(Duration::from_secs(30)),
            ping_ack_abort_window: None,
            ack_on_acknowledge: true,
            prefetch_max_messages: 1000,
            prefetch_threshold_percent: 50,
            connection_flow_limit_enabled: false,
            connection_flow_count: 100,
            dups_ok_limit: 10,
            dups_ok_timeout: None,
            dups_ok_flush_on_empty_queue: false,
            client_ack_limit: None,
            consumer_close_wait: None,
            two_phase_commit_for_ha: true,
            no_block_until_txn_completes: false,
            no_block_on_auto_ack_np_topics: false,
            auto_start_transaction: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.addresses.is_empty() {
            bail!("at least one broker address is required");
        }
        if self.reconnect_enabled && self.reconnect_attempts == 0 {
            bail!("reconnect is enabled, but with zero attempts per address");
        }
        if self.reconnect_max_retries < -1 {
            bail!("reconnect_max_retries must be -1 (unlimited) or non-negative");
        }
        if self.dups_ok_limit == 0 {
            bail!("dups_ok_limit must be positive");
        }
        if self.prefetch_max_messages <= 0 {
            bail!("prefetch_max_messages must be positive");
        }
        if self.prefetch_threshold_percent > 100 {
            bail!("prefetch_threshold_percent is a percentage");
        }
        if self.connection_flow_limit_enabled && self.connection_flow_count <= 0 {
            bail!("connection_flow_count must be positive if connection flow limit is enabled");
        }
        if self.ping_interval.is_some_and(|d| d.is_zero()) {
            bail!("ping_interval must not be zero, use None to disable pings");
        }
        if self.dups_ok_timeout.is_some_and(|d| d.is_zero()) {
            bail!("dups_ok_timeout must not be zero, use None to disable it");
        }
        if self.ping_ack_abort_window.is_some() && self.ping_interval.is_none() {
            bail!("ping ack abort requires a ping interval");
        }
        if self.reconnect_gate_recheck_interval.is_zero() {
            bail!("reconnect_gate_recheck_interval must not be zero");
        }
        Ok(())
    }

    /// number of messages a consumer receives before flow is resumed for it
    pub fn prefetch_resume_threshold(&self) -> i32 {
        let threshold = self.prefetch_max_messages as i64 * self.prefetch_threshold_percent as i64 / 100;
        threshold.max(1) as i32
    }
}
