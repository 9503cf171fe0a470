use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, instrument, warn};

use crate::connection::state::ConnectionState;
use crate::protocol::inbound::BreakEvent;
use crate::protocol::protocol_handler::ProtocolHandler;


pub fn spawn_keepalive(
    handler: Arc<ProtocolHandler>,
    state: Arc<ConnectionState>,
    interval: Duration,
    breaks: mpsc::UnboundedSender<BreakEvent>,
) -> JoinHandle<()> {
    tokio::spawn(run_keepalive(handler, state, interval, breaks))
}

/// Pings the broker if nothing else was written during the last interval, and reports the
///  transport as broken if the broker stopped answering pings.
#[instrument(name = "keepalive", skip_all)]
async fn run_keepalive(
    handler: Arc<ProtocolHandler>,
    state: Arc<ConnectionState>,
    interval: Duration,
    breaks: mpsc::UnboundedSender<BreakEvent>,
) {
    let mut ticks = time::interval(interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticks.tick().await;

    loop {
        ticks.tick().await;

        if state.is_closed() || state.is_broken() {
            debug!("connection is gone, stopping keepalive");
            return;
        }
        if state.is_reconnecting() {
            continue;
        }

        if handler.ping_timed_out() {
            warn!("broker did not answer ping within the abort window");
            let _ = breaks.send(BreakEvent {
                generation: state.transport_generation(),
                cause: "broker does not answer pings".to_string(),
            });
            continue;
        }

        if !handler.take_written_since_ping() {
            if let Err(e) = handler.ping().await {
                debug!("ping failed: {}", e);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::connection::config::ClientConfig;
    use crate::protocol::correlation::AckIdGenerator;
    use crate::protocol::packet::{Packet, PacketType};
    use crate::protocol::transport::{BrokerAddress, MockTransport};
    use super::*;

    fn setup(ack_abort: Option<Duration>) -> (Arc<ProtocolHandler>, Arc<ConnectionState>, Arc<AtomicUsize>) {
        let pings = Arc::new(AtomicUsize::new(0));
        let pings2 = pings.clone();
        let mut transport = MockTransport::new();
        transport.expect_send_packet()
            .returning(move |p| {
                if p.packet_type == PacketType::Ping {
                    pings2.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            });

        let mut config = ClientConfig::new(vec![BrokerAddress::new("localhost", 7676)]);
        config.ping_interval = Some(Duration::from_secs(10));
        config.ping_ack_abort_window = ack_abort;
        let state = Arc::new(ConnectionState::new(config.reconnect_gate_recheck_interval));
        let handler = Arc::new(ProtocolHandler::new(Arc::new(config), state.clone(), Arc::new(AckIdGenerator::new())));
        handler.set_transport(Arc::new(transport));
        (handler, state, pings)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_only_when_idle() {
        let (handler, state, pings) = setup(None);
        let (break_tx, _break_rx) = mpsc::unbounded_channel();
        let keepalive = spawn_keepalive(handler.clone(), state.clone(), Duration::from_secs(10), break_tx);

        time::sleep(Duration::from_secs(15)).await;
        assert_eq!(pings.load(Ordering::SeqCst), 1);

        // traffic during the interval suppresses the next ping
        handler.write_packet(Packet::new(PacketType::Start)).await.unwrap();
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(pings.load(Ordering::SeqCst), 1);

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(pings.load(Ordering::SeqCst), 2);

        state.set_closed();
        time::sleep(Duration::from_secs(10)).await;
        assert!(keepalive.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_ping_reports_break() {
        let (handler, state, _) = setup(Some(Duration::from_secs(15)));
        state.next_transport_generation();
        let (break_tx, mut break_rx) = mpsc::unbounded_channel();
        let _keepalive = spawn_keepalive(handler, state, Duration::from_secs(10), break_tx);

        // ping at 10s; at 20s it is only 10s old, at 30s it is overdue
        time::sleep(Duration::from_secs(25)).await;
        assert!(break_rx.try_recv().is_err());

        let event = break_rx.recv().await.unwrap();
        assert_eq!(event.generation, 1);
    }
}
