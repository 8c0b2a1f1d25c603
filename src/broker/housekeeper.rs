//! Periodic housekeeping.
//!
//! One tick (default every second) sweeps the session table for
//! disconnected sessions whose will delay or expiry deadline has passed,
//! and drops retained records whose message expiry elapsed. Keep-alive
//! enforcement for live connections happens in each connection's own loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::debug;

use super::BrokerState;
use crate::protocol::{Disconnect, ReasonCode};

pub(super) async fn run(
    state: Arc<BrokerState>,
    interval: Duration,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;

            _ = ticker.tick() => sweep(&state).await,
            result = shutdown_rx.recv() => match result {
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                _ => return,
            },
        }
    }
}

pub(super) async fn sweep(state: &Arc<BrokerState>) {
    let now = Instant::now();

    for session in state.sessions.snapshot() {
        // Decide under the lock, dispatch outside it.
        let (client_id, due_will, expired) = {
            let mut s = session.write();
            if s.connected {
                s.drop_expired_pending();
                // Backstop for the per-connection deadline: a connection
                // whose socket task stalled still gets cut off. This is an
                // abnormal close, so the will stays eligible to fire.
                if s.keep_alive_expired() {
                    let client_id = s.client_id.clone();
                    drop(s);
                    state.close_connection(
                        &client_id,
                        Disconnect::with_reason(ReasonCode::KeepAliveTimeout),
                        true,
                    );
                }
                continue;
            }

            let expired = s.expiry_deadline().is_some_and(|deadline| now >= deadline);
            let will_due = s.will_deadline().is_some_and(|deadline| now >= deadline);

            // The will fires when its delay elapses, or early when the
            // session itself ends.
            let due_will = if will_due || (expired && s.will.is_some()) {
                s.will.take()
            } else {
                None
            };

            (s.client_id.clone(), due_will, expired)
        };

        if let Some(will) = due_will {
            state.dispatch_will(&client_id, will);
        }
        if expired {
            debug!(client_id = %client_id, "session expired");
            state.evict_session(&client_id).await;
        }
    }

    state.retained.sweep_expired();
}
