use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrelay_proto::ProxyMessage;
use metrelay_transport::TransportStream;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::rpc::ControlClient;
use crate::session::SessionState;

/// Idle prober: sends a heartbeat over the control stream whenever the
/// session has been quiet for `max_inactivity`. A refused or failed
/// heartbeat marks the session disconnected, which tears the session
/// down.
pub(crate) async fn run<S: TransportStream>(
    control: Arc<ControlClient<S>>,
    session: Arc<SessionState>,
    stopped: Arc<AtomicBool>,
    check_pause: Duration,
    max_inactivity: Duration,
) {
    debug!("heartbeat prober started");
    let mut ticker = interval(check_pause);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if session.is_disconnected() || stopped.load(Ordering::Acquire) {
            break;
        }
        if session.idle_time() < max_inactivity {
            continue;
        }
        let agent_id = match session.identity().await {
            Some(agent_id) => agent_id,
            None => continue,
        };
        match control.call(ProxyMessage::Heartbeat { agent_id }).await {
            Ok(ProxyMessage::HeartbeatAck { valid: true }) => {
                session.mark_activity();
                trace!("heartbeat acknowledged");
            }
            Ok(ProxyMessage::HeartbeatAck { valid: false }) => {
                info!("proxy no longer recognizes this session");
                session.set_disconnected();
                break;
            }
            Ok(other) => {
                warn!(message = ?other, "unexpected heartbeat reply");
                session.set_disconnected();
                break;
            }
            Err(e) => {
                info!(error = %e, "heartbeat failed");
                session.set_disconnected();
                break;
            }
        }
    }
    debug!("heartbeat prober stopped");
}
