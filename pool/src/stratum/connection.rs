/// Handle to one miner connection
///
/// Outbound messages go through an unbounded queue drained by the
/// connection's writer task, so responses and notifications produced by
/// different tasks never interleave on the socket.

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::protocol::{StratumError, StratumNotification, StratumResponse};
use crate::worker::WorkerContext;

pub struct StratumConnection {
    id: String,
    remote: SocketAddr,
    local_port: u16,
    connected_at: Instant,
    outbound: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
    context: Mutex<WorkerContext>,
}

impl StratumConnection {
    pub fn new(
        id: String,
        remote: SocketAddr,
        local_port: u16,
        outbound: mpsc::UnboundedSender<String>,
        context: WorkerContext,
    ) -> Self {
        Self {
            id,
            remote,
            local_port,
            connected_at: Instant::now(),
            outbound,
            closed: CancellationToken::new(),
            context: Mutex::new(context),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Client address, after PROXY header substitution.
    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn context(&self) -> MutexGuard<'_, WorkerContext> {
        self.context.lock()
    }

    fn send<T: Serialize>(&self, message: &T) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        match serde_json::to_string(message) {
            Ok(line) => self.outbound.send(line).is_ok(),
            Err(e) => {
                tracing::error!("[{}] Failed to serialize outbound message: {}", self.id, e);
                false
            }
        }
    }

    pub fn respond(&self, id: Value, result: Value) -> bool {
        self.send(&StratumResponse::success(id, result))
    }

    pub fn respond_error(&self, id: Value, error: StratumError) -> bool {
        self.send(&StratumResponse::error(id, error))
    }

    pub fn notify(&self, notification: &StratumNotification) -> bool {
        self.send(notification)
    }

    /// Close the connection once queued messages are flushed.
    pub fn disconnect(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratum::protocol::methods;
    use serde_json::json;

    fn connection() -> (StratumConnection, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = WorkerContext::new("127.0.0.1".into(), 1.0, None);
        let conn = StratumConnection::new("c1".into(), "127.0.0.1:5000".parse().unwrap(), 3333, tx, ctx);
        (conn, rx)
    }

    #[test]
    fn test_messages_are_queued_in_order() {
        let (conn, mut rx) = connection();
        assert!(conn.respond(json!(1), json!(true)));
        assert!(conn.notify(&StratumNotification::new(methods::SET_DIFFICULTY, json!([8]))));

        let first: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        let second: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(first["id"], 1);
        assert_eq!(second["method"], "mining.set_difficulty");
    }

    #[test]
    fn test_closed_connection_drops_messages() {
        let (conn, mut rx) = connection();
        conn.disconnect();
        assert!(conn.is_closed());
        assert!(!conn.respond_error(json!(2), StratumError::unauthorized()));
        assert!(rx.try_recv().is_err());
    }
}
