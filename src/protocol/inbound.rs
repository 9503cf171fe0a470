use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

use crate::connection::state::with_gate_bypass;
use crate::protocol::packet::{props, Packet, PacketType};
use crate::protocol::protocol_handler::ProtocolHandler;
use crate::protocol::transport::Transport;


/// Report of a lost transport. The generation identifies the transport, so that a late report
///  from a transport that was replaced in the meantime can be ignored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BreakEvent {
    pub generation: u64,
    pub cause: String,
}

/// Receives messages the broker pushes to consumers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    async fn deliver_message(&self, session_id: Option<i64>, consumer_id: u64, packet: Packet);
}


/// Spawns the receive loop for one transport. The loop runs with permission to pass the
///  reconnect gate, since answering a broker's PING must not wait for a reconnect that may be
///  waiting for this very loop.
pub fn spawn_inbound(
    transport: Arc<dyn Transport>,
    handler: Arc<ProtocolHandler>,
    sink: Arc<dyn MessageSink>,
    generation: u64,
    breaks: mpsc::UnboundedSender<BreakEvent>,
) -> JoinHandle<()> {
    tokio::spawn(with_gate_bypass(run_inbound(transport, handler, sink, generation, breaks)))
}

#[instrument(name = "inbound", skip_all, fields(generation = generation))]
async fn run_inbound(
    transport: Arc<dyn Transport>,
    handler: Arc<ProtocolHandler>,
    sink: Arc<dyn MessageSink>,
    generation: u64,
    breaks: mpsc::UnboundedSender<BreakEvent>,
) {
    let report_break = |cause: String| {
        debug!("transport broken: {}", cause);
        let _ = breaks.send(BreakEvent { generation, cause });
    };

    loop {
        let packet = match transport.receive_packet().await {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                report_break("broker closed the connection".to_string());
                return;
            }
            Err(e) => {
                report_break(format!("receive failed: {:#}", e));
                return;
            }
        };

        handler.on_packet_received();
        trace!(packet_type = %packet.packet_type, ack_id = packet.correlation_id, "received packet");

        match packet.packet_type {
            t if t.is_reply() => {
                handler.deliver_reply(packet);
            }
            PacketType::Deliver => {
                let session_id = packet.get_long(props::SESSION_ID);
                sink.deliver_message(session_id, packet.correlation_id, packet).await;
            }
            PacketType::Ping => {
                if let Err(e) = handler.ping_reply(&packet).await {
                    debug!("failed to answer ping: {}", e);
                }
            }
            PacketType::PingReply | PacketType::FlowPaused => {}
            PacketType::Goodbye => {
                report_break("broker said goodbye".to_string());
                return;
            }
            PacketType::Error => {
                report_break(format!("broker reported error: [{}] {}", packet.status(), packet.reason()));
                return;
            }
            other => {
                warn!("unexpected packet from broker: {} - ignoring", other);
            }
        }
    }
}
