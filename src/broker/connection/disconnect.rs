//! Client DISCONNECT handling.
//!
//! A v5 DISCONNECT may revise the session expiry interval on the way out;
//! raising it from the zero negotiated at CONNECT is a protocol error.
//! The will is cleared on a clean disconnect: always on v3.1.1, and only
//! for reason "success" on v5 (an error reason, and in particular
//! "disconnect with will message", leaves the will to fire).

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{Connection, ConnectionError};
use crate::protocol::{Disconnect, ProtocolError, ReasonCode};
use crate::session::Session;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn handle_disconnect(
        &mut self,
        session: &Arc<RwLock<Session>>,
        disconnect: Disconnect,
    ) -> Result<(), ConnectionError> {
        debug!(reason = %disconnect.reason_code, "DISCONNECT");
        self.graceful = true;

        if self.encoder_is_v5() {
            if let Some(requested) = disconnect.properties.session_expiry_interval {
                let mut s = session.write();
                if s.session_expiry_interval == 0 && requested != 0 {
                    return Err(ProtocolError::Violation(
                        ReasonCode::ProtocolError,
                        "session expiry raised from zero at disconnect",
                    )
                    .into());
                }
                s.session_expiry_interval =
                    requested.min(self.broker.config.max_session_expiry);
            }

            self.will_suppressed = disconnect.reason_code == ReasonCode::Success;
        } else {
            self.will_suppressed = true;
        }

        Ok(())
    }
}
